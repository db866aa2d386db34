//! Module registry.
//!
//! The registry owns the executable memory of every module that has been
//! handed to the hypervisor core. It is a bounded, ordered list:
//!
//! ```text
//!            capacity (max_modules)
//! ┌────────┬────────┬────────┬────────┬ ─ ─ ─ ─ ┐
//! │ mod 0  │ mod 1  │ mod 2  │ mod 3  │  free   │
//! └────────┴────────┴────────┴────────┴ ─ ─ ─ ─ ┘
//!   RWX      RWX      RWX      RWX
//! ```
//!
//! A module enters the registry only after the core accepted it, and leaves
//! only through [`ModuleRegistry::clear`], which releases every region at
//! once. The registry does no locking of its own; the lifecycle controller
//! serializes access to it.

use crate::error::DriverError;
use crate::hypervisor::HypervisorCore;
use crate::platform::{ExecRegion, MemoryServices};
use log::{debug, warn};

/// One module held in executable memory.
#[derive(Debug)]
pub struct ModuleRecord<R> {
    /// Exclusively owned region holding the module image.
    buffer: R,
    /// Size of the module image in bytes.
    len: usize,
}

impl<R: ExecRegion> ModuleRecord<R> {
    /// The module image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer.as_slice()[..self.len]
    }

    /// Size of the module image in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the module image is empty. Never true for a registered module.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Bounded, ordered set of modules in executable memory.
pub struct ModuleRegistry<M: MemoryServices> {
    /// Allocator for module regions.
    memory: M,
    /// Registered modules in registration order.
    records: Vec<ModuleRecord<M::Region>>,
    /// Maximum number of records.
    capacity: usize,
}

impl<M: MemoryServices> ModuleRegistry<M> {
    /// Create an empty registry that holds at most `capacity` modules.
    pub fn new(memory: M, capacity: usize) -> Self {
        Self {
            memory,
            records: Vec::new(),
            capacity,
        }
    }

    /// Copy a module into executable memory and register it with the core.
    ///
    /// The steps are:
    /// 1. Reject the module if the registry is full
    /// 2. Allocate an RWX region of the module's size
    /// 3. Zero the region and copy the module in
    /// 4. Register the region with the core
    ///
    /// If any step fails, the region (if allocated) is freed and the
    /// registry is left exactly as it was.
    ///
    /// # Returns
    ///
    /// The number of registered modules after the add.
    pub fn add<C>(&mut self, module: &[u8], core: &C) -> Result<usize, DriverError>
    where
        C: HypervisorCore + ?Sized,
    {
        if self.is_full() {
            warn!("add_module: too many modules have been added");
            return Err(DriverError::CapacityExceeded {
                max: self.capacity,
            });
        }

        let mut buffer = self.memory.alloc_rwe(module.len()).map_err(|e| {
            warn!("add_module: failed to allocate memory for the module: {}", e);
            DriverError::AllocationFailure(e)
        })?;

        buffer.fill(0);
        buffer.copy_from(module);

        // On failure `buffer` is dropped here, which frees it
        core.add_module(buffer.as_slice()).map_err(|e| {
            warn!("add_module: failed to add module: {}", e);
            DriverError::RegistrationFailure(e)
        })?;

        self.records.push(ModuleRecord {
            buffer,
            len: module.len(),
        });

        debug!(
            "add_module: succeeded ({} bytes, {}/{} modules)",
            module.len(),
            self.records.len(),
            self.capacity
        );
        Ok(self.records.len())
    }

    /// Free every module and empty the registry.
    ///
    /// Safe to call on an empty registry.
    pub fn clear(&mut self) {
        let count = self.records.len();
        let bytes = self.total_bytes();

        // Dropping the records releases their regions
        self.records.clear();

        if count > 0 {
            debug!("clear: released {} modules ({} bytes)", count, bytes);
        }
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no module is registered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether another module would exceed the capacity.
    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    /// Maximum number of modules.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total size of all registered module images.
    pub fn total_bytes(&self) -> usize {
        self.records.iter().map(ModuleRecord::len).sum()
    }

    /// Registered modules in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleRecord<M::Region>> {
        self.records.iter()
    }
}

impl<M: MemoryServices> std::fmt::Debug for ModuleRegistry<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("len", &self.records.len())
            .field("capacity", &self.capacity)
            .field("bytes", &self.total_bytes())
            .finish()
    }
}
