//! Transaction correlation for the client engine.
//!
//! Each outgoing request gets a transaction id; the response carrying that
//! id resolves the pending entry. An id is never reused while its request is
//! outstanding, responses for unknown ids are classified instead of applied,
//! and a closed connection fails every pending entry rather than leaving it
//! dangling.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::ModbusFunction;
use crate::DEFAULT_TIMEOUT;

/// Pairs outgoing requests with incoming responses by transaction id.
///
/// One connection drives one manager; at most one entry exists per id at any
/// instant. Each pending id maps to the function code of its request.
#[derive(Debug)]
pub struct TransactionManager {
    next_id: u16,
    timeout: Duration,
    pending: HashMap<u16, ModbusFunction>,
}

impl TransactionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: 1,
            timeout,
            pending: HashMap::new(),
        }
    }

    pub fn with_default_timeout() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Allocate a transaction id for a request and record it as pending.
    ///
    /// Ids wrap around the u16 space, skipping any id that is still
    /// outstanding. With the whole space pending (not reachable through this
    /// crate's one-in-flight clients) the caller gets an error rather than a
    /// duplicate id.
    pub fn begin(&mut self, function: ModbusFunction) -> ModbusResult<u16> {
        for _ in 0..=u16::MAX {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                self.pending.insert(id, function);
                return Ok(id);
            }
        }
        Err(ModbusError::internal("transaction id space exhausted"))
    }

    /// Resolve a pending request with the response's transaction id and
    /// function code, releasing the id.
    ///
    /// An id with no pending entry, or a function code that does not match
    /// the request, yields [`ModbusError::UnexpectedResponse`] and leaves
    /// pending state untouched.
    pub fn resolve(&mut self, transaction_id: u16, function: ModbusFunction) -> ModbusResult<()> {
        match self.pending.get(&transaction_id) {
            Some(&pending) if pending == function => {
                self.pending.remove(&transaction_id);
                Ok(())
            }
            Some(&pending) => {
                warn!(
                    transaction_id,
                    expected = %pending,
                    got = %function,
                    "response function code mismatch"
                );
                Err(ModbusError::UnexpectedResponse { transaction_id })
            }
            None => {
                warn!(transaction_id, "response for unknown transaction");
                Err(ModbusError::UnexpectedResponse { transaction_id })
            }
        }
    }

    /// Expire a pending request, freeing its id for reuse. Returns the
    /// timeout error the caller surfaces.
    pub fn expire(&mut self, transaction_id: u16) -> ModbusError {
        if self.pending.remove(&transaction_id).is_some() {
            debug!(transaction_id, "transaction expired");
        }
        ModbusError::Timeout(self.timeout)
    }

    /// Fail every pending request; called when the transport closes under
    /// the engine.
    pub fn fail_all(&mut self) -> usize {
        let count = self.pending.len();
        if count > 0 {
            debug!(count, "failing pending transactions on close");
        }
        self.pending.clear();
        count
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::with_default_timeout()
    }
}
