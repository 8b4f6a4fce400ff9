use super::{SvmAllocationData, UnifiedMemoryProperties};
use crate::utils::is_aligned;
use parking_lot::Mutex;

/// A retired device allocation waiting to be reused.
#[derive(Debug, Clone)]
pub struct SvmCacheAllocationInfo {
    pub size: u64,
    pub address: u64,
    pub data: SvmAllocationData,
}

#[derive(Debug, Default)]
struct CacheState {
    allocations: Vec<SvmCacheAllocationInfo>,
    total_bytes: u64,
}

/// Size-ordered pool of freed device allocations.
///
/// Lookup hands out the smallest cached block that is at least as large as
/// the request. The cache has its own lock and never calls back into the
/// memory manager; trimming returns the records so the caller releases them.
#[derive(Debug, Default)]
pub struct SvmAllocationCache {
    max_bytes: Option<u64>,
    state: Mutex<CacheState>,
}

impl SvmAllocationCache {
    #[must_use]
    pub fn new(max_bytes: Option<u64>) -> Self {
        Self {
            max_bytes,
            state: Mutex::default(),
        }
    }

    /// Caches `data` under the size of its backing storage. Gives it back when
    /// the byte budget would be exceeded.
    pub fn insert(&self, data: SvmAllocationData) -> Result<(), SvmAllocationData> {
        let size = data
            .gpu_allocations
            .default_allocation()
            .map_or(data.size, |allocation| allocation.size);
        let mut state = self.state.lock();

        if let Some(max_bytes) = self.max_bytes {
            if state.total_bytes.saturating_add(size) > max_bytes {
                return Err(data);
            }
        }

        let index = state.allocations.partition_point(|info| info.size <= size);
        state.allocations.insert(
            index,
            SvmCacheAllocationInfo {
                size,
                address: data.address(),
                data,
            },
        );
        state.total_bytes += size;
        Ok(())
    }

    /// Removes and returns the smallest block of at least `size` bytes whose address
    /// satisfies `alignment` and which was created for the same device, allocation
    /// flags and requested allocation type as `properties`.
    pub fn get(
        &self,
        size: u64,
        alignment: u64,
        properties: &UnifiedMemoryProperties,
    ) -> Option<SvmCacheAllocationInfo> {
        let mut state = self.state.lock();

        let start = state.allocations.partition_point(|info| info.size < size);
        let offset = state.allocations[start..].iter().position(|info| {
            info.data.device == properties.device
                && info.data.allocation_flags == properties.flags
                && info.data.requested_allocation_type == properties.requested_allocation_type
                && is_aligned(info.address, alignment)
        })?;

        let info = state.allocations.remove(start + offset);
        state.total_bytes -= info.size;
        Some(info)
    }

    /// Empties the cache, handing every record back for release.
    pub fn trim(&self) -> Vec<SvmAllocationData> {
        let mut state = self.state.lock();
        state.total_bytes = 0;
        state.allocations.drain(..).map(|info| info.data).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().allocations.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }
}
