//! # gridline-modbus
//!
//! A Modbus TCP protocol core: frame codec, register store, transaction
//! correlation, and async client/server engines built on Tokio.
//!
//! The crate splits along the protocol's own seams. [`protocol`] owns the
//! vocabulary (function codes, PDUs, packing rules), [`frame`] wraps PDUs in
//! MBAP headers, [`store`] holds the server's data banks, and the
//! [`client`]/[`server`] engines drive the request/response cycle over a
//! [`transport`].
//!
//! ## Quick start
//!
//! ```no_run
//! use gridline_modbus::{ModbusClient, ModbusTcpClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = ModbusTcpClient::connect("127.0.0.1:502").await?;
//!     client.write_single_coil(1, 10, true).await?;
//!     let coils = client.read_coils(1, 10, 1).await?;
//!     assert_eq!(coils, vec![true]);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod server;
pub mod store;
pub mod transaction;
pub mod transport;

pub use client::{ModbusClient, ModbusTcpClient};
pub use error::{ModbusError, ModbusResult};
pub use frame::{MbapHeader, TcpFrame, MBAP_HEADER_SIZE};
pub use protocol::{
    ExceptionCode, ModbusFunction, ModbusRequest, ModbusResponse, UnitId, COIL_OFF, COIL_ON,
};
pub use server::{ModbusTcpServer, ModbusTcpServerConfig, ServerStats};
pub use store::{RegisterStore, StoreCapacity};
pub use transaction::TransactionManager;
pub use transport::{ModbusTransport, TcpTransport, TransportStats};

use std::time::Duration;

/// Largest PDU a Modbus ADU can carry.
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum coils or discrete inputs per read (0x01/0x02).
pub const MAX_READ_COILS: u16 = 2000;

/// Maximum coils per multiple write (0x0F).
pub const MAX_WRITE_COILS: u16 = 1968;

/// Maximum registers per read (0x03/0x04).
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum registers per multiple write (0x10).
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Standard Modbus TCP port.
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Default per-request timeout for clients and idle timeout basis for
/// servers.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
