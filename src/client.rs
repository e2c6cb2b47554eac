//! Async Modbus TCP client engine.
//!
//! [`GenericModbusClient`] drives the request/response cycle over any
//! [`ModbusTransport`]: validate, frame, send, await the reply under the
//! configured timeout, then check the reply against the request before
//! handing data back. [`ModbusTcpClient`] is the engine bound to a TCP
//! transport.
//!
//! One request is in flight per client at a time; responses are still
//! correlated through the transaction manager so a stale or mismatched reply
//! is reported instead of applied.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{ModbusError, ModbusResult};
use crate::frame::{MbapHeader, TcpFrame, MBAP_HEADER_SIZE};
use crate::protocol::{
    data_utils, ModbusFunction, ModbusRequest, ModbusResponse, UnitId, COIL_OFF, COIL_ON,
};
use crate::transaction::TransactionManager;
use crate::transport::{ModbusTransport, TcpTransport, TransportStats};
use crate::{DEFAULT_TIMEOUT, MAX_WRITE_COILS, MAX_WRITE_REGISTERS};

/// High-level Modbus client operations.
///
/// Every method validates its arguments before transmission and verifies the
/// response against the request before returning, so a successful return
/// means the peer confirmed the operation.
#[async_trait]
pub trait ModbusClient: Send {
    /// Read Coils (0x01).
    async fn read_coils(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>>;

    /// Read Discrete Inputs (0x02).
    async fn read_discrete_inputs(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>>;

    /// Read Holding Registers (0x03).
    async fn read_holding_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>>;

    /// Read Input Registers (0x04).
    async fn read_input_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>>;

    /// Write Single Coil (0x05).
    async fn write_single_coil(
        &mut self,
        unit_id: UnitId,
        address: u16,
        value: bool,
    ) -> ModbusResult<()>;

    /// Write Single Register (0x06).
    async fn write_single_register(
        &mut self,
        unit_id: UnitId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()>;

    /// Write Multiple Coils (0x0F).
    async fn write_multiple_coils(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()>;

    /// Write Multiple Registers (0x10).
    async fn write_multiple_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()>;

    /// Close the underlying connection.
    async fn close(&mut self) -> ModbusResult<()>;
}

/// Client protocol engine over an arbitrary transport.
pub struct GenericModbusClient<T: ModbusTransport> {
    transport: T,
    transactions: TransactionManager,
    timeout: Duration,
}

impl<T: ModbusTransport> GenericModbusClient<T> {
    pub fn new(transport: T) -> Self {
        Self::with_timeout(transport, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(transport: T, timeout: Duration) -> Self {
        Self {
            transport,
            transactions: TransactionManager::new(timeout),
            timeout,
        }
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Run one full request/response cycle and return the verified response.
    pub async fn execute_request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        request.validate()?;

        let transaction_id = self.transactions.begin(request.function)?;
        let frame = TcpFrame::new(transaction_id, request.unit_id, request.encode_pdu());

        let result = tokio::time::timeout(self.timeout, self.exchange(&frame, request)).await;
        match result {
            Ok(Ok(response)) => {
                self.transactions.resolve(transaction_id, response.function)?;
                Ok(response)
            }
            Ok(Err(err)) => {
                if matches!(err, ModbusError::Connection(_)) {
                    self.transactions.fail_all();
                } else {
                    self.transactions.expire(transaction_id);
                }
                Err(err)
            }
            Err(_) => {
                warn!(
                    transaction_id,
                    function = %request.function,
                    "request timed out"
                );
                Err(self.transactions.expire(transaction_id))
            }
        }
    }

    /// Send the framed request and read back exactly one ADU.
    async fn exchange(
        &mut self,
        frame: &TcpFrame,
        request: &ModbusRequest,
    ) -> ModbusResult<ModbusResponse> {
        self.transport.write_all(&frame.encode()).await?;

        let mut header_buf = [0u8; MBAP_HEADER_SIZE];
        self.transport.read_exact(&mut header_buf).await?;
        let header = MbapHeader::from_bytes(&header_buf)?;

        let mut pdu = vec![0u8; header.pdu_length()];
        self.transport.read_exact(&mut pdu).await?;

        if header.transaction_id != frame.header.transaction_id {
            return Err(ModbusError::UnexpectedResponse {
                transaction_id: header.transaction_id,
            });
        }
        if header.unit_id != request.unit_id {
            return Err(ModbusError::protocol(format!(
                "response unit id {} does not match request unit id {}",
                header.unit_id, request.unit_id
            )));
        }

        let response = ModbusResponse::decode_pdu(header.unit_id, &pdu)?;
        if response.function != request.function {
            return Err(ModbusError::protocol(format!(
                "response function {} does not match request function {}",
                response.function, request.function
            )));
        }
        Ok(response)
    }

    /// Verify the echoed (address, value-or-quantity) pair of a write reply.
    fn check_write_echo(
        response: &ModbusResponse,
        address: u16,
        expected_value: u16,
    ) -> ModbusResult<()> {
        let (echo_address, echo_value) = response.parse_write_echo()?;
        if echo_address != address || echo_value != expected_value {
            return Err(ModbusError::protocol(format!(
                "write echo ({echo_address}, 0x{echo_value:04X}) does not match \
                 request ({address}, 0x{expected_value:04X})"
            )));
        }
        Ok(())
    }

    async fn read_bits(
        &mut self,
        unit_id: UnitId,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        let request = ModbusRequest::new_read(unit_id, function, address, quantity);
        let response = self.execute_request(&request).await?;
        response.parse_bits(quantity)
    }

    async fn read_words(
        &mut self,
        unit_id: UnitId,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        let request = ModbusRequest::new_read(unit_id, function, address, quantity);
        let response = self.execute_request(&request).await?;
        let registers = response.parse_registers()?;
        if registers.len() != quantity as usize {
            return Err(ModbusError::protocol(format!(
                "requested {} registers, response carries {}",
                quantity,
                registers.len()
            )));
        }
        Ok(registers)
    }
}

#[async_trait]
impl<T: ModbusTransport> ModbusClient for GenericModbusClient<T> {
    async fn read_coils(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.read_bits(unit_id, ModbusFunction::ReadCoils, address, quantity)
            .await
    }

    async fn read_discrete_inputs(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.read_bits(unit_id, ModbusFunction::ReadDiscreteInputs, address, quantity)
            .await
    }

    async fn read_holding_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.read_words(unit_id, ModbusFunction::ReadHoldingRegisters, address, quantity)
            .await
    }

    async fn read_input_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.read_words(unit_id, ModbusFunction::ReadInputRegisters, address, quantity)
            .await
    }

    async fn write_single_coil(
        &mut self,
        unit_id: UnitId,
        address: u16,
        value: bool,
    ) -> ModbusResult<()> {
        let wire_value = if value { COIL_ON } else { COIL_OFF };
        let request = ModbusRequest {
            unit_id,
            function: ModbusFunction::WriteSingleCoil,
            address,
            quantity: 1,
            data: wire_value.to_be_bytes().to_vec(),
        };
        let response = self.execute_request(&request).await?;
        Self::check_write_echo(&response, address, wire_value)
    }

    async fn write_single_register(
        &mut self,
        unit_id: UnitId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()> {
        let request = ModbusRequest {
            unit_id,
            function: ModbusFunction::WriteSingleRegister,
            address,
            quantity: 1,
            data: value.to_be_bytes().to_vec(),
        };
        let response = self.execute_request(&request).await?;
        Self::check_write_echo(&response, address, value)
    }

    async fn write_multiple_coils(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_COILS as usize {
            return Err(ModbusError::invalid_request(format!(
                "coil count {} outside 1..={}",
                values.len(),
                MAX_WRITE_COILS
            )));
        }
        let request = ModbusRequest {
            unit_id,
            function: ModbusFunction::WriteMultipleCoils,
            address,
            quantity: values.len() as u16,
            data: data_utils::pack_bits(values),
        };
        let response = self.execute_request(&request).await?;
        Self::check_write_echo(&response, address, values.len() as u16)
    }

    async fn write_multiple_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(ModbusError::invalid_request(format!(
                "register count {} outside 1..={}",
                values.len(),
                MAX_WRITE_REGISTERS
            )));
        }
        let request = ModbusRequest {
            unit_id,
            function: ModbusFunction::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            data: data_utils::registers_to_bytes(values),
        };
        let response = self.execute_request(&request).await?;
        Self::check_write_echo(&response, address, values.len() as u16)
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.transactions.fail_all();
        self.transport.close().await
    }
}

/// Modbus TCP client: the generic engine bound to a [`TcpTransport`].
pub struct ModbusTcpClient {
    inner: GenericModbusClient<TcpTransport>,
}

impl ModbusTcpClient {
    /// Connect to `addr` (anything resolvable to a socket address) with the
    /// default timeout.
    pub async fn connect(addr: &str) -> ModbusResult<Self> {
        Self::connect_with_timeout(addr, DEFAULT_TIMEOUT).await
    }

    /// Connect with an explicit timeout, used both for the TCP connect and
    /// each request.
    pub async fn connect_with_timeout(addr: &str, timeout: Duration) -> ModbusResult<Self> {
        let peer: SocketAddr = addr
            .parse()
            .map_err(|e| ModbusError::connection(format!("invalid address {addr}: {e}")))?;
        let transport = TcpTransport::connect(peer, timeout).await?;
        debug!(%peer, ?timeout, "modbus tcp client ready");
        Ok(Self {
            inner: GenericModbusClient::with_timeout(transport, timeout),
        })
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.inner.transport_stats()
    }

    pub async fn execute_request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        self.inner.execute_request(request).await
    }
}

#[async_trait]
impl ModbusClient for ModbusTcpClient {
    async fn read_coils(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.inner.read_coils(unit_id, address, quantity).await
    }

    async fn read_discrete_inputs(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.inner
            .read_discrete_inputs(unit_id, address, quantity)
            .await
    }

    async fn read_holding_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.inner
            .read_holding_registers(unit_id, address, quantity)
            .await
    }

    async fn read_input_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.inner
            .read_input_registers(unit_id, address, quantity)
            .await
    }

    async fn write_single_coil(
        &mut self,
        unit_id: UnitId,
        address: u16,
        value: bool,
    ) -> ModbusResult<()> {
        self.inner.write_single_coil(unit_id, address, value).await
    }

    async fn write_single_register(
        &mut self,
        unit_id: UnitId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()> {
        self.inner
            .write_single_register(unit_id, address, value)
            .await
    }

    async fn write_multiple_coils(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        self.inner
            .write_multiple_coils(unit_id, address, values)
            .await
    }

    async fn write_multiple_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        self.inner
            .write_multiple_registers(unit_id, address, values)
            .await
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ExceptionCode;
    use std::collections::VecDeque;
    use tokio_test::assert_ok;

    /// Scripted transport: records writes, replays queued reads.
    #[derive(Default)]
    struct MockTransport {
        sent: Vec<Vec<u8>>,
        rx: VecDeque<u8>,
        connected: bool,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                sent: Vec::new(),
                rx: VecDeque::new(),
                connected: true,
            }
        }

        /// Queue a complete response ADU for the next read.
        fn push_response(&mut self, transaction_id: u16, unit_id: u8, pdu: Vec<u8>) {
            let frame = TcpFrame::new(transaction_id, unit_id, pdu);
            self.rx.extend(frame.encode());
        }
    }

    #[async_trait]
    impl ModbusTransport for MockTransport {
        async fn write_all(&mut self, data: &[u8]) -> ModbusResult<()> {
            self.sent.push(data.to_vec());
            Ok(())
        }

        async fn read_exact(&mut self, buf: &mut [u8]) -> ModbusResult<()> {
            if self.rx.len() < buf.len() {
                return Err(ModbusError::connection("peer closed"));
            }
            for byte in buf.iter_mut() {
                *byte = self.rx.pop_front().ok_or_else(|| {
                    ModbusError::connection("peer closed")
                })?;
            }
            Ok(())
        }

        async fn close(&mut self) -> ModbusResult<()> {
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    #[tokio::test]
    async fn test_read_coils_request_and_parse() {
        let mut transport = MockTransport::new();
        // Response for transaction 1: Read Coils, one byte, coil 0 set.
        transport.push_response(1, 17, vec![0x01, 0x01, 0b0000_0001]);

        let mut client = GenericModbusClient::new(transport);
        let coils = client.read_coils(17, 10, 3).await.unwrap();
        assert_eq!(coils, vec![true, false, false]);
    }

    #[tokio::test]
    async fn test_write_single_coil_echo_checked() {
        let mut transport = MockTransport::new();
        // Correct echo: address 10, value 0xFF00.
        transport.push_response(1, 1, vec![0x05, 0x00, 0x0A, 0xFF, 0x00]);

        let mut client = GenericModbusClient::new(transport);
        assert_ok!(client.write_single_coil(1, 10, true).await);
    }

    #[tokio::test]
    async fn test_write_echo_mismatch_rejected() {
        let mut transport = MockTransport::new();
        // Echo carries the wrong address.
        transport.push_response(1, 1, vec![0x05, 0x00, 0x0B, 0xFF, 0x00]);

        let mut client = GenericModbusClient::new(transport);
        let err = client.write_single_coil(1, 10, true).await.unwrap_err();
        assert!(matches!(err, ModbusError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_write_multiple_registers_echoes_quantity() {
        let mut transport = MockTransport::new();
        transport.push_response(1, 1, vec![0x10, 0x00, 0x64, 0x00, 0x02]);

        let mut client = GenericModbusClient::new(transport);
        client
            .write_multiple_registers(1, 100, &[0x1234, 0x5678])
            .await
            .unwrap();

        // One frame went out: MBAP (7) + PDU (function + addr + qty + count + 4 data).
        let sent = &client.transport.sent[0];
        assert_eq!(sent.len(), 7 + 10);
        assert_eq!(&sent[7..], &[0x10, 0x00, 0x64, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78]);
    }

    #[tokio::test]
    async fn test_exception_response_surfaces() {
        let mut transport = MockTransport::new();
        transport.push_response(1, 1, vec![0x83, 0x02]);

        let mut client = GenericModbusClient::new(transport);
        let err = client.read_holding_registers(1, 9999, 10).await.unwrap_err();
        assert_eq!(
            err,
            ModbusError::Exception(ExceptionCode::IllegalDataAddress)
        );
    }

    #[tokio::test]
    async fn test_transaction_id_mismatch_rejected() {
        let mut transport = MockTransport::new();
        // First allocated id is 1; respond with 7.
        transport.push_response(7, 1, vec![0x03, 0x02, 0x00, 0x2A]);

        let mut client = GenericModbusClient::new(transport);
        let err = client.read_holding_registers(1, 0, 1).await.unwrap_err();
        assert_eq!(err, ModbusError::UnexpectedResponse { transaction_id: 7 });
    }

    #[tokio::test]
    async fn test_quantity_validated_before_transmission() {
        let mut client = GenericModbusClient::new(MockTransport::new());

        assert!(matches!(
            client.read_coils(1, 0, 0).await,
            Err(ModbusError::InvalidRequest(_))
        ));
        assert!(matches!(
            client.read_coils(1, 0, 2001).await,
            Err(ModbusError::InvalidRequest(_))
        ));
        assert!(matches!(
            client.read_holding_registers(1, 0, 126).await,
            Err(ModbusError::InvalidRequest(_))
        ));
        assert!(matches!(
            client.write_multiple_coils(1, 0, &[]).await,
            Err(ModbusError::InvalidRequest(_))
        ));
        // Nothing reached the transport.
        assert!(client.transport.sent.is_empty());
    }

    #[tokio::test]
    async fn test_connection_failure_clears_pending() {
        // Empty rx queue: read_exact reports a closed peer.
        let mut client = GenericModbusClient::with_timeout(
            MockTransport::new(),
            Duration::from_millis(50),
        );
        let err = client.read_coils(1, 0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::Connection(_)));
        assert_eq!(client.transactions.pending_count(), 0);
    }

    /// Transport that accepts writes but never produces a byte in response.
    struct SilentTransport {
        writes: usize,
    }

    #[async_trait]
    impl ModbusTransport for SilentTransport {
        async fn write_all(&mut self, _data: &[u8]) -> ModbusResult<()> {
            self.writes += 1;
            Ok(())
        }

        async fn read_exact(&mut self, _buf: &mut [u8]) -> ModbusResult<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn close(&mut self) -> ModbusResult<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    #[tokio::test]
    async fn test_no_response_times_out_and_frees_transaction() {
        let timeout = Duration::from_millis(20);
        let mut client =
            GenericModbusClient::with_timeout(SilentTransport { writes: 0 }, timeout);

        let err = client.read_coils(1, 0, 1).await.unwrap_err();
        assert_eq!(err, ModbusError::Timeout(timeout));
        assert_eq!(client.transactions.pending_count(), 0);
        // The request went out; only the response never came.
        assert_eq!(client.transport.writes, 1);
    }

    #[tokio::test]
    async fn test_short_register_response_rejected() {
        let mut transport = MockTransport::new();
        // Asked for 2 registers, reply carries 1.
        transport.push_response(1, 1, vec![0x03, 0x02, 0x00, 0x2A]);

        let mut client = GenericModbusClient::new(transport);
        let err = client.read_holding_registers(1, 0, 2).await.unwrap_err();
        assert!(matches!(err, ModbusError::Protocol(_)));
    }
}
