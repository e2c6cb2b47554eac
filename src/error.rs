//! Error types for the Modbus protocol core.
//!
//! Every fallible operation in this crate returns [`ModbusResult`]. Errors are
//! deterministic and surfaced immediately; nothing is retried or swallowed
//! inside the core.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::ExceptionCode;

/// Result alias used throughout the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus protocol core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// A frame failed to decode: bad header, declared length not matching the
    /// actual payload, or a body that does not fit its function code.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A register-store access fell outside the bank capacity.
    #[error("illegal data address: start {start}, count {count}, capacity {capacity}")]
    IllegalAddress {
        start: u16,
        count: usize,
        capacity: u16,
    },

    /// The response did not match the request semantics (echo mismatch,
    /// wrong element count, wrong function code).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A response arrived for a transaction id with no pending request, or
    /// with a function code that does not match the pending request.
    #[error("unexpected response for transaction {transaction_id}")]
    UnexpectedResponse { transaction_id: u16 },

    /// The peer answered with a Modbus exception.
    #[error("modbus exception: {0}")]
    Exception(ExceptionCode),

    /// No response arrived within the configured deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport failure: connect, read, write, or the peer closed the
    /// connection while a request was in flight.
    #[error("connection error: {0}")]
    Connection(String),

    /// Caller error rejected before transmission: zero or oversized
    /// quantity, payload/quantity mismatch.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal failure, e.g. a poisoned bank lock.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ModbusError {
    pub fn frame(msg: impl Into<String>) -> Self {
        ModbusError::MalformedFrame(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        ModbusError::Protocol(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        ModbusError::Connection(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        ModbusError::InvalidRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ModbusError::Internal(msg.into())
    }

    /// The exception code a server engine reports for this error, if the
    /// error is one a Modbus server answers rather than drops.
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            ModbusError::IllegalAddress { .. } => Some(ExceptionCode::IllegalDataAddress),
            ModbusError::InvalidRequest(_) => Some(ExceptionCode::IllegalDataValue),
            ModbusError::Internal(_) => Some(ExceptionCode::ServerDeviceFailure),
            ModbusError::Exception(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::Connection(err.to_string())
    }
}
