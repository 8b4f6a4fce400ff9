pub mod allocator;

use std::cmp::Ordering;

/// One free interval inside a `HeapAllocator` range.
///
/// Chunks compare by address only, which is what coalescing needs.
#[derive(Debug, Clone, Copy)]
pub struct HeapChunk {
    pub address: u64,
    pub size: u64,
}

impl HeapChunk {
    #[must_use]
    pub const fn new(address: u64, size: u64) -> Self {
        Self { address, size }
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.address + self.size
    }
}

impl PartialEq for HeapChunk {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for HeapChunk {}

impl PartialOrd for HeapChunk {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapChunk {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address.cmp(&other.address)
    }
}

/// A successful sub-allocation.
///
/// `size` is what was actually consumed, which can exceed the request when a
/// whole free chunk is handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBlock {
    pub address: u64,
    pub size: u64,
}

/// Trait for virtual address range allocators (e.g. a device-local aperture).
pub trait ApertureAllocator: Send + Sync {
    /// Reserve a virtual address range within this aperture.
    fn allocate_va(&self, size: u64, align: u64) -> Option<HeapBlock>;

    /// Free a previously reserved virtual address range.
    fn free_va(&self, addr: u64, size: u64);

    /// Get the aperture's base and limit (exclusive).
    fn bounds(&self) -> (u64, u64);
}

// Re-export the allocator for easy access
pub use allocator::HeapAllocator;
