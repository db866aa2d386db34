//! Currently selected vCPU.
//!
//! Diagnostic dumps target whichever vCPU was selected last. The selection is
//! a single driver-wide value: it is not validated against the number of
//! vCPUs the core runs (an out-of-range id surfaces later as a failed dump),
//! and concurrent writers race with last-writer-wins semantics.

use crate::error::DriverError;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};

/// The vCPU id used by diagnostic dumps.
#[derive(Debug, Default)]
pub struct VcpuContext {
    current: AtomicU64,
}

impl VcpuContext {
    /// Create a context selecting vCPU 0.
    pub const fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
        }
    }

    /// Select `id`, overwriting any previous selection.
    ///
    /// Fails with [`DriverError::InvalidArgument`] if no id is supplied.
    pub fn set_current(&self, id: Option<u64>) -> Result<(), DriverError> {
        let id = id.ok_or(DriverError::InvalidArgument("vcpu id"))?;
        self.current.store(id, Ordering::Release);
        debug!("set_vcpuid: succeeded ({})", id);
        Ok(())
    }

    /// The selected vCPU id.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_zero() {
        assert_eq!(VcpuContext::new().current(), 0);
    }

    #[test]
    fn test_last_writer_wins() {
        let vcpu = VcpuContext::new();
        vcpu.set_current(Some(3)).unwrap();
        vcpu.set_current(Some(1)).unwrap();
        assert_eq!(vcpu.current(), 1);

        // Not validated against any vCPU count
        vcpu.set_current(Some(u64::MAX)).unwrap();
        assert_eq!(vcpu.current(), u64::MAX);
    }

    #[test]
    fn test_missing_id() {
        let vcpu = VcpuContext::new();
        vcpu.set_current(Some(5)).unwrap();
        assert!(matches!(
            vcpu.set_current(None),
            Err(DriverError::InvalidArgument(_))
        ));
        assert_eq!(vcpu.current(), 5);
    }
}
