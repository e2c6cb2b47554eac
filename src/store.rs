//! Server-side register storage.
//!
//! [`RegisterStore`] owns four flat banks sized at construction: coils and
//! discrete inputs (one bit each), holding and input registers (16 bits
//! each). Every access is bounds-checked against the bank capacity, and
//! range writes are atomic: the range is validated before the first element
//! is touched.
//!
//! The store is shared across server connections behind an `Arc`; the
//! interior locks keep multi-element operations from interleaving.

use std::sync::RwLock;

use tracing::trace;

use crate::error::{ModbusError, ModbusResult};

/// Capacity configuration for a [`RegisterStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCapacity {
    pub coils: u16,
    pub discrete_inputs: u16,
    pub holding_registers: u16,
    pub input_registers: u16,
}

impl Default for StoreCapacity {
    fn default() -> Self {
        Self {
            coils: 10_000,
            discrete_inputs: 10_000,
            holding_registers: 10_000,
            input_registers: 10_000,
        }
    }
}

/// Fixed-capacity Modbus data banks with bounds-checked, per-call-atomic
/// access.
#[derive(Debug)]
pub struct RegisterStore {
    capacity: StoreCapacity,
    coils: RwLock<Vec<bool>>,
    discrete_inputs: RwLock<Vec<bool>>,
    holding_registers: RwLock<Vec<u16>>,
    input_registers: RwLock<Vec<u16>>,
}

impl RegisterStore {
    /// Create a store with the given bank sizes; all cells start zeroed.
    pub fn with_capacity(capacity: StoreCapacity) -> Self {
        Self {
            capacity,
            coils: RwLock::new(vec![false; capacity.coils as usize]),
            discrete_inputs: RwLock::new(vec![false; capacity.discrete_inputs as usize]),
            holding_registers: RwLock::new(vec![0; capacity.holding_registers as usize]),
            input_registers: RwLock::new(vec![0; capacity.input_registers as usize]),
        }
    }

    /// Create a store with the default bank sizes.
    pub fn new() -> Self {
        Self::with_capacity(StoreCapacity::default())
    }

    pub fn capacity(&self) -> StoreCapacity {
        self.capacity
    }

    /// Validate `start + count <= capacity` without touching any bank.
    /// The count is taken as `usize` so slice lengths are never truncated
    /// on the way in.
    fn check_range(start: u16, count: usize, capacity: u16) -> ModbusResult<()> {
        let end = start as usize + count;
        if end > capacity as usize {
            return Err(ModbusError::IllegalAddress {
                start,
                count,
                capacity,
            });
        }
        Ok(())
    }

    /// Read coils (0x01).
    pub fn read_coils(&self, start: u16, count: u16) -> ModbusResult<Vec<bool>> {
        Self::check_range(start, count as usize, self.capacity.coils)?;
        let coils = self
            .coils
            .read()
            .map_err(|_| ModbusError::internal("coil bank lock poisoned"))?;
        Ok(coils[start as usize..start as usize + count as usize].to_vec())
    }

    /// Write a single coil (0x05).
    pub fn write_coil(&self, addr: u16, value: bool) -> ModbusResult<()> {
        Self::check_range(addr, 1, self.capacity.coils)?;
        let mut coils = self
            .coils
            .write()
            .map_err(|_| ModbusError::internal("coil bank lock poisoned"))?;
        coils[addr as usize] = value;
        trace!(addr, value, "coil written");
        Ok(())
    }

    /// Write a run of coils (0x0F). Atomic: nothing is written unless the
    /// whole range fits.
    pub fn write_coils(&self, start: u16, values: &[bool]) -> ModbusResult<()> {
        Self::check_range(start, values.len(), self.capacity.coils)?;
        let mut coils = self
            .coils
            .write()
            .map_err(|_| ModbusError::internal("coil bank lock poisoned"))?;
        coils[start as usize..start as usize + values.len()].copy_from_slice(values);
        trace!(start, count = values.len(), "coils written");
        Ok(())
    }

    /// Read discrete inputs (0x02).
    pub fn read_discrete_inputs(&self, start: u16, count: u16) -> ModbusResult<Vec<bool>> {
        Self::check_range(start, count as usize, self.capacity.discrete_inputs)?;
        let inputs = self
            .discrete_inputs
            .read()
            .map_err(|_| ModbusError::internal("discrete input bank lock poisoned"))?;
        Ok(inputs[start as usize..start as usize + count as usize].to_vec())
    }

    /// Read holding registers (0x03).
    pub fn read_registers(&self, start: u16, count: u16) -> ModbusResult<Vec<u16>> {
        Self::check_range(start, count as usize, self.capacity.holding_registers)?;
        let registers = self
            .holding_registers
            .read()
            .map_err(|_| ModbusError::internal("holding register bank lock poisoned"))?;
        Ok(registers[start as usize..start as usize + count as usize].to_vec())
    }

    /// Write a single holding register (0x06).
    pub fn write_register(&self, addr: u16, value: u16) -> ModbusResult<()> {
        Self::check_range(addr, 1, self.capacity.holding_registers)?;
        let mut registers = self
            .holding_registers
            .write()
            .map_err(|_| ModbusError::internal("holding register bank lock poisoned"))?;
        registers[addr as usize] = value;
        trace!(addr, value, "register written");
        Ok(())
    }

    /// Write a run of holding registers (0x10). Atomic per call.
    pub fn write_registers(&self, start: u16, values: &[u16]) -> ModbusResult<()> {
        Self::check_range(start, values.len(), self.capacity.holding_registers)?;
        let mut registers = self
            .holding_registers
            .write()
            .map_err(|_| ModbusError::internal("holding register bank lock poisoned"))?;
        registers[start as usize..start as usize + values.len()].copy_from_slice(values);
        trace!(start, count = values.len(), "registers written");
        Ok(())
    }

    /// Read input registers (0x04).
    pub fn read_input_registers(&self, start: u16, count: u16) -> ModbusResult<Vec<u16>> {
        Self::check_range(start, count as usize, self.capacity.input_registers)?;
        let registers = self
            .input_registers
            .read()
            .map_err(|_| ModbusError::internal("input register bank lock poisoned"))?;
        Ok(registers[start as usize..start as usize + count as usize].to_vec())
    }

    /// Seed a discrete input. Inputs are read-only on the wire; this is the
    /// process-local side of the bank, used by device simulation and tests.
    pub fn set_discrete_input(&self, addr: u16, value: bool) -> ModbusResult<()> {
        Self::check_range(addr, 1, self.capacity.discrete_inputs)?;
        let mut inputs = self
            .discrete_inputs
            .write()
            .map_err(|_| ModbusError::internal("discrete input bank lock poisoned"))?;
        inputs[addr as usize] = value;
        Ok(())
    }

    /// Seed an input register; see [`RegisterStore::set_discrete_input`].
    pub fn set_input_register(&self, addr: u16, value: u16) -> ModbusResult<()> {
        Self::check_range(addr, 1, self.capacity.input_registers)?;
        let mut registers = self
            .input_registers
            .write()
            .map_err(|_| ModbusError::internal("input register bank lock poisoned"))?;
        registers[addr as usize] = value;
        Ok(())
    }
}

impl Default for RegisterStore {
    fn default() -> Self {
        Self::new()
    }
}
