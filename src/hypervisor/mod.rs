//! Hypervisor core interface.
//!
//! The hypervisor core is the component that actually links modules, builds
//! the VMM and runs it on every CPU. The driver never looks inside it: it
//! hands over module memory, asks for state transitions, and copies out the
//! diagnostic ring of one vCPU on request.
//!
//! # Status Codes
//!
//! The core reports its state as a 64-bit status code:
//!
//! ```text
//!  10  VMM_UNLOADED   no VMM in memory, modules may be added
//!  11  VMM_LOADED     modules linked, VMM not running
//!  12  VMM_RUNNING    VMM running on every CPU
//! 100  VMM_CORRUPT    a transition failed half way
//! ```
//!
//! # Diagnostic Descriptor
//!
//! Each vCPU owns a debug ring. A dump copies the ring's control block and
//! buffer out in one fixed-size descriptor:
//!
//! ```text
//! offset 0   epos  u64 LE   end position (total bytes ever written)
//! offset 8   spos  u64 LE   start position of the oldest retained byte
//! offset 16  buf   [u8; DEBUG_RING_SIZE]  ring storage, index = pos % size
//! ```

pub mod sim;

pub use sim::{CoreOp, SimulatedCore};

use std::sync::Arc;
use thiserror::Error;

/// Status code: no VMM in memory.
pub const VMM_UNLOADED: i64 = 10;

/// Status code: VMM loaded but not running.
pub const VMM_LOADED: i64 = 11;

/// Status code: VMM running.
pub const VMM_RUNNING: i64 = 12;

/// Status code: the core is in an inconsistent state.
pub const VMM_CORRUPT: i64 = 100;

/// Size of a vCPU debug ring buffer.
pub const DEBUG_RING_SIZE: usize = 4096 - 16;

/// Size of an encoded [`DiagnosticDescriptor`].
pub const DESCRIPTOR_SIZE: usize = 16 + DEBUG_RING_SIZE;

/// Errors reported by the hypervisor core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The VMM is in the wrong state for the requested operation.
    #[error("VMM is in an invalid state for this operation")]
    InvalidState,

    /// Load was requested before any module was added.
    #[error("No modules have been added")]
    NoModules,

    /// The core's module table is full.
    #[error("Module table is full (max {max})")]
    TooManyModules { max: usize },

    /// The requested vCPU does not exist.
    #[error("vCPU {0} does not exist")]
    InvalidVcpu(u64),

    /// Any other failure, identified by the core's error code.
    #[error("Hypervisor core error {0:#x}")]
    Failed(i64),
}

/// Lifecycle state of the VMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmmState {
    /// No VMM in memory.
    #[default]
    Unloaded,
    /// Modules linked, VMM not running.
    Loaded,
    /// VMM running.
    Running,
}

impl VmmState {
    /// The status code the core reports for this state.
    pub const fn status_code(self) -> i64 {
        match self {
            VmmState::Unloaded => VMM_UNLOADED,
            VmmState::Loaded => VMM_LOADED,
            VmmState::Running => VMM_RUNNING,
        }
    }

    /// Decode a status code reported by the core.
    ///
    /// Returns `None` for `VMM_CORRUPT` and unknown codes.
    pub const fn from_status_code(code: i64) -> Option<Self> {
        match code {
            VMM_UNLOADED => Some(VmmState::Unloaded),
            VMM_LOADED => Some(VmmState::Loaded),
            VMM_RUNNING => Some(VmmState::Running),
            _ => None,
        }
    }
}

impl std::fmt::Display for VmmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VmmState::Unloaded => "unloaded",
            VmmState::Loaded => "loaded",
            VmmState::Running => "running",
        };
        f.write_str(name)
    }
}

/// Snapshot of one vCPU's debug ring.
#[derive(Clone, PartialEq, Eq)]
pub struct DiagnosticDescriptor {
    /// End position: total bytes ever written to the ring.
    pub epos: u64,
    /// Start position: first byte still retained.
    pub spos: u64,
    /// Ring storage.
    pub buf: [u8; DEBUG_RING_SIZE],
}

impl DiagnosticDescriptor {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self {
            epos: 0,
            spos: 0,
            buf: [0; DEBUG_RING_SIZE],
        }
    }

    /// Append bytes to the ring, overwriting the oldest data when full.
    pub fn append(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.buf[(self.epos % DEBUG_RING_SIZE as u64) as usize] = byte;
            self.epos += 1;
        }
        if self.epos - self.spos > DEBUG_RING_SIZE as u64 {
            self.spos = self.epos - DEBUG_RING_SIZE as u64;
        }
    }

    /// Retained bytes, oldest first.
    pub fn contents(&self) -> Vec<u8> {
        (self.spos..self.epos)
            .map(|pos| self.buf[(pos % DEBUG_RING_SIZE as u64) as usize])
            .collect()
    }

    /// Encode into `out`, returning the number of bytes written.
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than [`DESCRIPTOR_SIZE`].
    pub fn write_to(&self, out: &mut [u8]) -> usize {
        out[0..8].copy_from_slice(&self.epos.to_le_bytes());
        out[8..16].copy_from_slice(&self.spos.to_le_bytes());
        out[16..DESCRIPTOR_SIZE].copy_from_slice(&self.buf);
        DESCRIPTOR_SIZE
    }

    /// Decode a descriptor previously written by [`write_to`](Self::write_to).
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DESCRIPTOR_SIZE {
            return None;
        }
        let mut descriptor = Self::new();
        descriptor.epos = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
        descriptor.spos = u64::from_le_bytes(bytes[8..16].try_into().ok()?);
        descriptor.buf.copy_from_slice(&bytes[16..DESCRIPTOR_SIZE]);
        Some(descriptor)
    }
}

impl Default for DiagnosticDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DiagnosticDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticDescriptor")
            .field("epos", &self.epos)
            .field("spos", &self.spos)
            .finish_non_exhaustive()
    }
}

/// Operations the driver needs from the hypervisor core.
///
/// Calls may arrive from any thread. The driver serializes every call that
/// touches module or lifecycle state, but implementations must still be
/// `Sync` because status and dump requests can come from anywhere.
pub trait HypervisorCore: Send + Sync {
    /// Register a module that has been copied into executable memory.
    ///
    /// The core may keep the module's address until [`unload_vmm`]
    /// succeeds or fails; the driver keeps the memory mapped until then.
    ///
    /// [`unload_vmm`]: HypervisorCore::unload_vmm
    fn add_module(&self, module: &[u8]) -> Result<(), CoreError>;

    /// Link every registered module and build the VMM.
    fn load_vmm(&self) -> Result<(), CoreError>;

    /// Tear the VMM down and forget every registered module.
    fn unload_vmm(&self) -> Result<(), CoreError>;

    /// Start the VMM on every CPU.
    fn start_vmm(&self) -> Result<(), CoreError>;

    /// Stop the VMM on every CPU.
    fn stop_vmm(&self) -> Result<(), CoreError>;

    /// Current status code (see `VMM_*`).
    fn vmm_status(&self) -> i64;

    /// Snapshot the debug ring of `vcpuid`.
    fn dump_vmm(&self, vcpuid: u64) -> Result<DiagnosticDescriptor, CoreError>;
}

impl<T: HypervisorCore + ?Sized> HypervisorCore for Arc<T> {
    fn add_module(&self, module: &[u8]) -> Result<(), CoreError> {
        (**self).add_module(module)
    }

    fn load_vmm(&self) -> Result<(), CoreError> {
        (**self).load_vmm()
    }

    fn unload_vmm(&self) -> Result<(), CoreError> {
        (**self).unload_vmm()
    }

    fn start_vmm(&self) -> Result<(), CoreError> {
        (**self).start_vmm()
    }

    fn stop_vmm(&self) -> Result<(), CoreError> {
        (**self).stop_vmm()
    }

    fn vmm_status(&self) -> i64 {
        (**self).vmm_status()
    }

    fn dump_vmm(&self, vcpuid: u64) -> Result<DiagnosticDescriptor, CoreError> {
        (**self).dump_vmm(vcpuid)
    }
}
