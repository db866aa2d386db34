//! Executable memory backed by anonymous mappings.
//!
//! Each region is its own `mmap` call with:
//! - `PROT_READ | PROT_WRITE | PROT_EXEC`: modules are written in place and
//!   then executed by the hypervisor core
//! - `MAP_PRIVATE | MAP_ANONYMOUS`: not backed by a file, not shared
//!
//! The mapping is released with `munmap` when the region is dropped.

use super::{ExecRegion, MemoryError, MemoryServices};
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// Allocator handing out anonymous RWX mappings.
#[derive(Debug, Clone, Copy, Default)]
pub struct MmapMemory;

impl MmapMemory {
    /// Create a new allocator.
    pub fn new() -> Self {
        Self
    }
}

impl MemoryServices for MmapMemory {
    type Region = MmapRegion;

    fn alloc_rwe(&self, len: usize) -> Result<MmapRegion, MemoryError> {
        let length = NonZeroUsize::new(len).ok_or(MemoryError::ZeroLength)?;

        // SAFETY: we request a fresh anonymous mapping at an address of the
        // kernel's choosing, so no existing memory is affected.
        let addr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| MemoryError::Map {
            len,
            source: e.into(),
        })?;

        Ok(MmapRegion { addr, len: length })
    }
}

/// An anonymous RWX mapping, unmapped on drop.
pub struct MmapRegion {
    /// Start of the mapping.
    addr: NonNull<c_void>,
    /// Length of the mapping in bytes.
    len: NonZeroUsize,
}

// SAFETY: the region exclusively owns its mapping; nothing else holds the
// pointer, so moving it to another thread is sound.
unsafe impl Send for MmapRegion {}

impl ExecRegion for MmapRegion {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: `addr` points to `len` mapped, readable bytes for as long
        // as `self` lives.
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr().cast::<u8>(), self.len.get()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr().cast::<u8>(), self.len.get()) }
    }

    fn len(&self) -> usize {
        self.len.get()
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `mmap_anonymous` with this
        // length and is unmapped exactly once.
        if let Err(e) = unsafe { munmap(self.addr, self.len.get()) } {
            log::error!("munmap of {} bytes failed: {}", self.len, e);
        }
    }
}

impl std::fmt::Debug for MmapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapRegion")
            .field("addr", &self.addr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_write_read() {
        let mut region = MmapMemory::new().alloc_rwe(4096).unwrap();
        assert_eq!(region.len(), 4096);

        region.fill(0);
        region.copy_from(&[0xc3, 0x90, 0x90]);
        assert_eq!(&region.as_slice()[..4], &[0xc3, 0x90, 0x90, 0x00]);
    }

    #[test]
    fn test_odd_length() {
        let mut region = MmapMemory::new().alloc_rwe(13).unwrap();
        region.fill(0xaa);
        assert_eq!(region.as_slice(), &[0xaa; 13]);
    }

    #[test]
    fn test_zero_length() {
        assert!(matches!(
            MmapMemory::new().alloc_rwe(0),
            Err(MemoryError::ZeroLength)
        ));
    }
}
