//! Bookkeeping-only [`MemoryManager`] used by tests and demos.
//!
//! Addresses are handed out from a monotonically growing counter and never
//! backed by memory. Every free is recorded so callers can assert that a
//! handle was released exactly once.

use super::{
    AddressRange, AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager,
    MemoryPool,
};
use crate::error::{UsmError, UsmResult};
use crate::utils::{PAGE_SIZE, align_up};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

const MOCK_BASE_ADDRESS: u64 = 0x1_0000_0000;

#[derive(Debug, Default)]
struct MockState {
    next_address: u64,
    next_handle: u64,
    live: HashMap<u64, GraphicsAllocation>,
    freed: Vec<u64>,
    requests: Vec<AllocationProperties>,
    failing_types: HashSet<AllocationType>,
    fail_all: bool,
    waits: usize,
    prefetches: Vec<(u64, u32)>,
    reserved: Vec<AddressRange>,
}

#[derive(Debug)]
pub struct MockMemoryManager {
    local_memory_supported: bool,
    kmd_migration_available: bool,
    accept_prefetch: bool,
    state: Mutex<MockState>,
}

impl Default for MockMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMemoryManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            local_memory_supported: false,
            kmd_migration_available: false,
            accept_prefetch: true,
            state: Mutex::new(MockState {
                next_address: MOCK_BASE_ADDRESS,
                next_handle: 1,
                ..MockState::default()
            }),
        }
    }

    #[must_use]
    pub const fn with_local_memory(mut self, supported: bool) -> Self {
        self.local_memory_supported = supported;
        self
    }

    #[must_use]
    pub const fn with_kmd_migration(mut self, available: bool) -> Self {
        self.kmd_migration_available = available;
        self
    }

    #[must_use]
    pub const fn with_prefetch(mut self, accept: bool) -> Self {
        self.accept_prefetch = accept;
        self
    }

    /// Make every request for `allocation_type` fail from now on.
    pub fn fail_allocation_type(&self, allocation_type: AllocationType) {
        self.state.lock().failing_types.insert(allocation_type);
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.state.lock().fail_all = fail;
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_live(&self, handle: u64) -> bool {
        self.state.lock().live.contains_key(&handle)
    }

    /// How many times `handle` was freed.
    pub fn free_count(&self, handle: u64) -> usize {
        self.state.lock().freed.iter().filter(|&&h| h == handle).count()
    }

    pub fn total_frees(&self) -> usize {
        self.state.lock().freed.len()
    }

    /// Every request seen, in order, including failed ones.
    pub fn requests(&self) -> Vec<AllocationProperties> {
        self.state.lock().requests.clone()
    }

    pub fn wait_count(&self) -> usize {
        self.state.lock().waits
    }

    pub fn prefetches(&self) -> Vec<(u64, u32)> {
        self.state.lock().prefetches.clone()
    }

    pub fn reserved_ranges(&self) -> Vec<AddressRange> {
        self.state.lock().reserved.clone()
    }

    fn next_range(state: &mut MockState, size: u64, alignment: u64) -> u64 {
        let alignment = alignment.max(PAGE_SIZE);
        let address = align_up(state.next_address, alignment);
        state.next_address = address + align_up(size.max(1), PAGE_SIZE);
        address
    }
}

impl MemoryManager for MockMemoryManager {
    fn allocate_graphics_memory(
        &self,
        properties: &AllocationProperties,
    ) -> UsmResult<GraphicsAllocation> {
        let mut state = self.state.lock();
        state.requests.push(*properties);

        if state.fail_all || state.failing_types.contains(&properties.allocation_type) {
            return Err(UsmError::OutOfMemory(properties.size));
        }
        if properties.memory_pool == MemoryPool::Local && !self.local_memory_supported {
            return Err(UsmError::Backing("local memory is not supported".into()));
        }

        let gpu_address = match properties.host_ptr {
            Some(host_ptr) => host_ptr,
            None => Self::next_range(&mut state, properties.size, properties.alignment),
        };
        let cpu_visible = properties.memory_pool == MemoryPool::System || properties.kmd_migrated;

        let handle = state.next_handle;
        state.next_handle += 1;

        let allocation = GraphicsAllocation {
            handle,
            root_device_index: properties.root_device_index,
            gpu_address,
            cpu_address: cpu_visible.then_some(gpu_address),
            size: properties.size,
            allocation_type: properties.allocation_type,
            memory_pool: properties.memory_pool,
            compressed: properties.compressed,
            coherent: properties.coherent,
        };
        state.live.insert(handle, allocation.clone());
        Ok(allocation)
    }

    fn free_graphics_memory(&self, allocation: GraphicsAllocation) {
        let mut state = self.state.lock();
        state.live.remove(&allocation.handle);
        state.freed.push(allocation.handle);
    }

    fn reserve_address_range(&self, size: u64, alignment: u64) -> UsmResult<AddressRange> {
        let mut state = self.state.lock();
        if state.fail_all {
            return Err(UsmError::OutOfMemory(size));
        }
        let address = Self::next_range(&mut state, size, alignment);
        let range = AddressRange { address, size };
        state.reserved.push(range);
        Ok(range)
    }

    fn release_address_range(&self, range: AddressRange) {
        self.state.lock().reserved.retain(|r| *r != range);
    }

    fn is_local_memory_supported(&self, _root_device_index: u32) -> bool {
        self.local_memory_supported
    }

    fn is_kmd_migration_available(&self, _root_device_index: u32) -> bool {
        self.kmd_migration_available
    }

    fn wait_for_completion(&self, _allocation: &GraphicsAllocation) {
        self.state.lock().waits += 1;
    }

    fn prefetch(&self, allocation: &GraphicsAllocation, target_root_device_index: u32) -> bool {
        if !self.accept_prefetch {
            return false;
        }
        self.state
            .lock()
            .prefetches
            .push((allocation.handle, target_root_device_index));
        true
    }
}
