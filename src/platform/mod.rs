//! Platform memory services.
//!
//! Modules are copied into memory that is readable, writable and executable
//! before the hypervisor core links them. This module defines the allocation
//! seam the registry uses and two implementations of it:
//!
//! - [`MmapMemory`]: anonymous private mappings with `PROT_READ | PROT_WRITE |
//!   PROT_EXEC` (unix only)
//! - [`HeapMemory`]: heap-backed, non-executable regions with allocation
//!   accounting and an optional byte budget
//!
//! # Ownership
//!
//! A region is an owned handle. Dropping it returns the memory to the
//! platform, so whoever holds the region decides when the memory is freed:
//!
//! ```text
//! alloc_rwe(len) ──► Region ──► fill(0) ──► copy_from(bytes) ──► registry
//!                                                                  │
//!                                            drop (clear/unload) ◄─┘
//! ```

mod heap;
#[cfg(unix)]
mod mmap;

pub use heap::{HeapMemory, HeapRegion};
#[cfg(unix)]
pub use mmap::{MmapMemory, MmapRegion};

use thiserror::Error;

/// Errors that can occur while allocating module memory.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// A zero-length region was requested.
    #[error("Cannot allocate an empty region")]
    ZeroLength,

    /// The kernel refused the executable mapping.
    #[error("Failed to map {len} bytes of executable memory: {source}")]
    Map {
        len: usize,
        #[source]
        source: std::io::Error,
    },

    /// The allocation would exceed the configured memory budget.
    #[error("Out of memory: {requested} bytes requested, {available} available")]
    Exhausted { requested: usize, available: usize },
}

/// An owned, writable region of executable memory.
///
/// Dropping the region frees it.
pub trait ExecRegion: Send {
    /// View the region's contents.
    fn as_slice(&self) -> &[u8];

    /// Mutable view of the region's contents.
    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Size of the region in bytes.
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the region is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill the whole region with `value`.
    fn fill(&mut self, value: u8) {
        self.as_mut_slice().fill(value);
    }

    /// Copy `bytes` to the start of the region.
    ///
    /// Copies at most `self.len()` bytes; the rest of `bytes` is ignored.
    fn copy_from(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(self.len());
        self.as_mut_slice()[..len].copy_from_slice(&bytes[..len]);
    }
}

/// Allocator for executable+writable module memory.
pub trait MemoryServices: Send + Sync {
    /// Region type handed out by this allocator.
    type Region: ExecRegion;

    /// Allocate `len` bytes of readable, writable, executable memory.
    ///
    /// The contents of the new region are unspecified.
    fn alloc_rwe(&self, len: usize) -> Result<Self::Region, MemoryError>;
}
