//! Async Modbus TCP server engine.
//!
//! [`ModbusTcpServer`] accepts connections, reads length-delimited ADUs, and
//! answers each request from a shared [`RegisterStore`]. Request handling is
//! a pure function from (store, request) to response; the connection loop
//! around it owns framing and I/O.
//!
//! Errors split along the protocol's own line: a request the server can
//! parse but not satisfy gets an exception reply, while a frame it cannot
//! parse ends the connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use crate::error::{ModbusError, ModbusResult};
use crate::frame::{MbapHeader, TcpFrame, MBAP_HEADER_SIZE};
use crate::protocol::{
    data_utils, ExceptionCode, ModbusFunction, ModbusRequest, ModbusResponse,
};
use crate::store::RegisterStore;
use crate::{COIL_OFF, COIL_ON, DEFAULT_TIMEOUT};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ModbusTcpServerConfig {
    pub bind_address: SocketAddr,
    /// Connections beyond this limit wait in the accept queue.
    pub max_connections: usize,
    /// A connection idle longer than this is dropped.
    pub idle_timeout: Duration,
}

impl Default for ModbusTcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: ([0, 0, 0, 0], crate::DEFAULT_TCP_PORT).into(),
            max_connections: 64,
            idle_timeout: DEFAULT_TIMEOUT.saturating_mul(12),
        }
    }
}

/// Request and connection counters, shared across connection tasks.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_accepted: AtomicU64,
    pub requests_handled: AtomicU64,
    pub exceptions_sent: AtomicU64,
    pub frame_errors: AtomicU64,
}

impl ServerStats {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.connections_accepted.load(Ordering::Relaxed),
            self.requests_handled.load(Ordering::Relaxed),
            self.exceptions_sent.load(Ordering::Relaxed),
            self.frame_errors.load(Ordering::Relaxed),
        )
    }
}

/// Modbus TCP server bound to a [`RegisterStore`].
pub struct ModbusTcpServer {
    config: ModbusTcpServerConfig,
    store: Arc<RegisterStore>,
    stats: Arc<ServerStats>,
    shutdown: Option<broadcast::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl ModbusTcpServer {
    pub fn new(config: ModbusTcpServerConfig, store: Arc<RegisterStore>) -> Self {
        Self {
            config,
            store,
            stats: Arc::new(ServerStats::default()),
            shutdown: None,
            local_addr: None,
        }
    }

    /// The store this server answers from.
    pub fn store(&self) -> Arc<RegisterStore> {
        Arc::clone(&self.store)
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// The address the listener actually bound, available after `start`.
    /// Useful when the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and spawn the accept loop. Returns once the
    /// listener is live; connections are served on background tasks until
    /// [`ModbusTcpServer::stop`].
    pub async fn start(&mut self) -> ModbusResult<()> {
        let listener = TcpListener::bind(self.config.bind_address)
            .await
            .map_err(|e| {
                ModbusError::connection(format!(
                    "failed to bind {}: {e}",
                    self.config.bind_address
                ))
            })?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown = Some(shutdown_tx.clone());

        let store = Arc::clone(&self.store);
        let stats = Arc::clone(&self.stats);
        let limiter = Arc::new(Semaphore::new(self.config.max_connections));
        let idle_timeout = self.config.idle_timeout;

        info!(%local_addr, "modbus tcp server listening");

        tokio::spawn(async move {
            let mut shutdown_rx = shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (socket, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                error!("accept failed: {e}");
                                continue;
                            }
                        };
                        let permit = match Arc::clone(&limiter).acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };
                        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        debug!(%peer, "connection accepted");

                        let store = Arc::clone(&store);
                        let stats = Arc::clone(&stats);
                        let mut conn_shutdown = shutdown_tx.subscribe();
                        tokio::spawn(async move {
                            let _permit = permit;
                            tokio::select! {
                                result = serve_connection(socket, peer, store, stats, idle_timeout) => {
                                    if let Err(e) = result {
                                        debug!(%peer, "connection ended: {e}");
                                    }
                                }
                                _ = conn_shutdown.recv() => {
                                    debug!(%peer, "connection closed by shutdown");
                                }
                            }
                        });
                    }
                    _ = shutdown_rx.recv() => {
                        info!(%local_addr, "modbus tcp server stopping");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop accepting and close every open connection.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.local_addr = None;
    }
}

impl Drop for ModbusTcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serve one connection: read ADUs, dispatch, reply, until the peer closes,
/// the idle timeout fires, or a frame fails to parse.
async fn serve_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    store: Arc<RegisterStore>,
    stats: Arc<ServerStats>,
    idle_timeout: Duration,
) -> ModbusResult<()> {
    loop {
        let mut header_buf = [0u8; MBAP_HEADER_SIZE];
        match tokio::time::timeout(idle_timeout, socket.read_exact(&mut header_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(%peer, "peer closed connection");
                return Ok(());
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!(%peer, "idle timeout");
                return Ok(());
            }
        }

        let header = match MbapHeader::from_bytes(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                stats.frame_errors.fetch_add(1, Ordering::Relaxed);
                warn!(%peer, "dropping connection: {e}");
                return Err(e);
            }
        };

        let mut pdu = vec![0u8; header.pdu_length()];
        socket.read_exact(&mut pdu).await?;

        let reply_pdu = match handle_pdu(&store, header.unit_id, &pdu) {
            Ok(pdu) => pdu,
            Err(e) => {
                stats.frame_errors.fetch_add(1, Ordering::Relaxed);
                warn!(%peer, "dropping connection: {e}");
                return Err(e);
            }
        };
        stats.requests_handled.fetch_add(1, Ordering::Relaxed);
        if reply_pdu.first().map(|b| b & 0x80 != 0).unwrap_or(false) {
            stats.exceptions_sent.fetch_add(1, Ordering::Relaxed);
        }

        let reply = TcpFrame::new(header.transaction_id, header.unit_id, reply_pdu);
        socket.write_all(&reply.encode()).await?;
    }
}

/// Turn one request PDU into one response PDU.
///
/// An unsupported function byte gets an IllegalFunction exception rather
/// than a dropped connection; only structurally broken PDUs bubble up as
/// errors.
fn handle_pdu(store: &RegisterStore, unit_id: u8, pdu: &[u8]) -> ModbusResult<Vec<u8>> {
    if pdu.is_empty() {
        return Err(ModbusError::frame("empty request PDU"));
    }
    if ModbusFunction::from_u8(pdu[0]).is_err() {
        warn!(function = pdu[0], "unsupported function code");
        return Ok(vec![pdu[0] | 0x80, ExceptionCode::IllegalFunction.to_u8()]);
    }

    let request = ModbusRequest::decode_pdu(unit_id, pdu)?;
    Ok(dispatch(store, &request).encode_pdu())
}

/// Execute a decoded request against the store.
///
/// Validation runs in protocol order: quantity limits first, address range
/// second, so an oversized request is IllegalDataValue even when it would
/// also fall off the end of the bank.
pub fn dispatch(store: &RegisterStore, request: &ModbusRequest) -> ModbusResponse {
    match execute(store, request) {
        Ok(data) => ModbusResponse::new_success(request.unit_id, request.function, data),
        Err(err) => {
            let code = err
                .exception_code()
                .unwrap_or(ExceptionCode::ServerDeviceFailure);
            debug!(function = %request.function, %err, "request rejected");
            ModbusResponse::new_exception(request.unit_id, request.function, code)
        }
    }
}

fn execute(store: &RegisterStore, request: &ModbusRequest) -> ModbusResult<Vec<u8>> {
    request.validate()?;
    match request.function {
        ModbusFunction::ReadCoils => {
            let bits = store.read_coils(request.address, request.quantity)?;
            Ok(bit_read_body(&bits))
        }
        ModbusFunction::ReadDiscreteInputs => {
            let bits = store.read_discrete_inputs(request.address, request.quantity)?;
            Ok(bit_read_body(&bits))
        }
        ModbusFunction::ReadHoldingRegisters => {
            let registers = store.read_registers(request.address, request.quantity)?;
            Ok(register_read_body(&registers))
        }
        ModbusFunction::ReadInputRegisters => {
            let registers = store.read_input_registers(request.address, request.quantity)?;
            Ok(register_read_body(&registers))
        }
        ModbusFunction::WriteSingleCoil => {
            let wire_value = u16::from_be_bytes(single_write_payload(&request.data)?);
            let value = match wire_value {
                COIL_ON => true,
                COIL_OFF => false,
                other => {
                    return Err(ModbusError::invalid_request(format!(
                        "invalid coil value 0x{other:04X}"
                    )))
                }
            };
            store.write_coil(request.address, value)?;
            Ok(write_echo_body(request.address, wire_value))
        }
        ModbusFunction::WriteSingleRegister => {
            let value = u16::from_be_bytes(single_write_payload(&request.data)?);
            store.write_register(request.address, value)?;
            Ok(write_echo_body(request.address, value))
        }
        ModbusFunction::WriteMultipleCoils => {
            let bits = data_utils::unpack_bits(&request.data, request.quantity as usize);
            store.write_coils(request.address, &bits)?;
            Ok(write_echo_body(request.address, request.quantity))
        }
        ModbusFunction::WriteMultipleRegisters => {
            let registers = data_utils::bytes_to_registers(&request.data)
                .ok_or_else(|| ModbusError::frame("odd register payload length"))?;
            store.write_registers(request.address, &registers)?;
            Ok(write_echo_body(request.address, request.quantity))
        }
    }
}

fn single_write_payload(data: &[u8]) -> ModbusResult<[u8; 2]> {
    data.try_into()
        .map_err(|_| ModbusError::frame("single write payload must be 2 bytes"))
}

fn bit_read_body(bits: &[bool]) -> Vec<u8> {
    let packed = data_utils::pack_bits(bits);
    let mut body = Vec::with_capacity(1 + packed.len());
    body.push(packed.len() as u8);
    body.extend_from_slice(&packed);
    body
}

fn register_read_body(registers: &[u16]) -> Vec<u8> {
    let bytes = data_utils::registers_to_bytes(registers);
    let mut body = Vec::with_capacity(1 + bytes.len());
    body.push(bytes.len() as u8);
    body.extend_from_slice(&bytes);
    body
}

fn write_echo_body(address: u16, value: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(4);
    body.extend_from_slice(&address.to_be_bytes());
    body.extend_from_slice(&value.to_be_bytes());
    body
}
