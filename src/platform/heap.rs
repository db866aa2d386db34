//! Heap-backed module memory with allocation accounting.
//!
//! Used where executable mappings are not available and wherever the caller
//! needs to observe allocation behaviour: every clone of a [`HeapMemory`]
//! shares the same counters, so the number of live regions can be checked
//! after the allocator has been handed to the driver.

use super::{ExecRegion, MemoryError, MemoryServices};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Accounting {
    /// Regions currently alive.
    live_regions: AtomicUsize,
    /// Bytes currently allocated.
    live_bytes: AtomicUsize,
    /// Regions handed out since creation.
    total_allocs: AtomicUsize,
}

/// Accounting allocator for module memory.
#[derive(Debug, Clone, Default)]
pub struct HeapMemory {
    accounting: Arc<Accounting>,
    /// Upper bound on live bytes, if any.
    budget: Option<usize>,
}

impl HeapMemory {
    /// Create an allocator without a budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator that refuses to hold more than `budget` live bytes.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            accounting: Arc::default(),
            budget: Some(budget),
        }
    }

    /// Number of regions currently alive.
    pub fn live_regions(&self) -> usize {
        self.accounting.live_regions.load(Ordering::SeqCst)
    }

    /// Number of bytes currently allocated.
    pub fn live_bytes(&self) -> usize {
        self.accounting.live_bytes.load(Ordering::SeqCst)
    }

    /// Number of successful allocations since creation.
    pub fn total_allocs(&self) -> usize {
        self.accounting.total_allocs.load(Ordering::SeqCst)
    }
}

impl MemoryServices for HeapMemory {
    type Region = HeapRegion;

    fn alloc_rwe(&self, len: usize) -> Result<HeapRegion, MemoryError> {
        if len == 0 {
            return Err(MemoryError::ZeroLength);
        }

        let reserved = self.accounting.live_bytes.fetch_add(len, Ordering::SeqCst);
        if let Some(budget) = self.budget {
            if reserved + len > budget {
                self.accounting.live_bytes.fetch_sub(len, Ordering::SeqCst);
                return Err(MemoryError::Exhausted {
                    requested: len,
                    available: budget.saturating_sub(reserved),
                });
            }
        }

        self.accounting.live_regions.fetch_add(1, Ordering::SeqCst);
        self.accounting.total_allocs.fetch_add(1, Ordering::SeqCst);

        Ok(HeapRegion {
            data: vec![0xcc; len].into_boxed_slice(),
            accounting: Arc::clone(&self.accounting),
        })
    }
}

/// A heap region that releases its accounting on drop.
#[derive(Debug)]
pub struct HeapRegion {
    data: Box<[u8]>,
    accounting: Arc<Accounting>,
}

impl ExecRegion for HeapRegion {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        self.accounting.live_regions.fetch_sub(1, Ordering::SeqCst);
        self.accounting
            .live_bytes
            .fetch_sub(self.data.len(), Ordering::SeqCst);
    }
}
