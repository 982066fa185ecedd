use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Costs charged while a contract runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GasSchedule {
    /// Flat cost of every interpreted instruction.
    pub instruction: u64,
    /// Flat cost of entering any host function.
    pub host_call: u64,
    /// Cost per byte moved between linear memory and the host.
    pub per_byte_copy: u64,
    /// Cost per declared local zeroed on function entry.
    pub per_local: u64,
    pub storage_load: u64,
    pub storage_store: u64,
    /// Additional cost per byte of a staged storage value.
    pub storage_store_per_byte: u64,
    pub create_contract: u64,
    /// Additional cost per byte of deployed code.
    pub create_contract_per_byte: u64,
    pub async_call: u64,
}

impl Default for GasSchedule {
    fn default() -> Self {
        Self {
            instruction: 1,
            host_call: 10,
            per_byte_copy: 1,
            per_local: 1,
            storage_load: 100,
            storage_store: 500,
            storage_store_per_byte: 5,
            create_contract: 5_000,
            create_contract_per_byte: 2,
            async_call: 1_000,
        }
    }
}

/// Resource counter of a single invocation.
///
/// Only ever decreases. A charge that cannot be paid in full drains the
/// counter to zero and fails with [`Error::OutOfResources`].
#[derive(Debug, Clone)]
pub struct GasMeter {
    limit: u64,
    remaining: u64,
}

impl GasMeter {
    pub fn new(limit: u64) -> Self {
        Self { limit, remaining: limit }
    }

    #[inline(always)]
    pub fn charge(&mut self, cost: u64) -> Result<(), Error> {
        match self.remaining.checked_sub(cost) {
            Some(left) => {
                self.remaining = left;
                Ok(())
            }
            None => {
                self.remaining = 0;
                Err(Error::OutOfResources)
            }
        }
    }

    /// Charges `base` plus `per_unit` for each of `units`, saturating.
    #[inline]
    pub fn charge_scaled(&mut self, base: u64, per_unit: u64, units: usize) -> Result<(), Error> {
        self.charge(base.saturating_add(per_unit.saturating_mul(units as u64)))
    }

    pub fn remaining(&self) -> u64 { self.remaining }
    pub fn limit(&self) -> u64 { self.limit }
    pub fn used(&self) -> u64 { self.limit - self.remaining }
    pub fn is_exhausted(&self) -> bool { self.remaining == 0 }
}
