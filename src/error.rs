//! Driver error taxonomy.
//!
//! Every failure a command can hit maps onto one [`DriverError`] variant, and
//! every variant maps onto one stable completion status code. Lower-level
//! failures from the memory service or the hypervisor core are kept as the
//! error source so the log shows the full chain.

use crate::dispatch::BufferError;
use crate::hypervisor::CoreError;
use crate::platform::MemoryError;
use thiserror::Error;

/// Completion status for a command that succeeded.
pub const STATUS_SUCCESS: i32 = 0;

/// Errors produced by driver commands.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The module registry is full.
    #[error("Too many modules have been added (max {max})")]
    CapacityExceeded { max: usize },

    /// Executable memory for a module could not be allocated.
    #[error("Failed to allocate memory for the module: {0}")]
    AllocationFailure(#[source] MemoryError),

    /// The hypervisor core refused the module.
    #[error("Failed to register module: {0}")]
    RegistrationFailure(#[source] CoreError),

    /// The hypervisor core failed to load the VMM. The registry was cleared.
    #[error("Failed to load VMM: {0}")]
    LoadFailure(#[source] CoreError),

    /// The hypervisor core failed to start the VMM. A stop was issued.
    #[error("Failed to start VMM: {0}")]
    StartFailure(#[source] CoreError),

    /// The hypervisor core failed to stop the VMM.
    #[error("Failed to stop VMM: {0}")]
    StopFailure(#[source] CoreError),

    /// The hypervisor core failed to unload the VMM.
    ///
    /// Non-fatal: module memory is released and the state reset regardless.
    #[error("Failed to unload VMM: {0}")]
    UnloadFailure(#[source] CoreError),

    /// A required argument was not supplied.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The hypervisor core could not produce a diagnostic descriptor.
    #[error("Failed to dump vCPU {vcpuid}: {source}")]
    DumpUnavailable {
        vcpuid: u64,
        #[source]
        source: CoreError,
    },

    /// The control code does not name a command.
    #[error("Unrecognized command code {0:#010x}")]
    InvalidCommand(u32),

    /// A request buffer was missing, mis-sized or could not be retrieved.
    #[error("Invalid request buffer: {0}")]
    BufferValidationFailure(#[from] BufferError),
}

impl DriverError {
    /// Completion status code reported to the host for this error.
    pub fn status_code(&self) -> i32 {
        match self {
            DriverError::CapacityExceeded { .. } => -1,
            DriverError::AllocationFailure(_) => -2,
            DriverError::RegistrationFailure(_) => -3,
            DriverError::LoadFailure(_) => -4,
            DriverError::StartFailure(_) => -5,
            DriverError::StopFailure(_) => -6,
            DriverError::UnloadFailure(_) => -7,
            DriverError::InvalidArgument(_) => -8,
            DriverError::DumpUnavailable { .. } => -9,
            DriverError::InvalidCommand(_) => -10,
            DriverError::BufferValidationFailure(_) => -11,
        }
    }
}
