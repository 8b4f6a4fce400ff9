pub mod mock;
pub mod software;

use crate::error::UsmResult;

/// What a backing allocation is used for. Drives placement and caching decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    Unknown,
    Buffer,
    WriteCombined,
    BufferHostMemory,
    SvmZeroCopy,
    SvmCpu,
    SvmGpu,
    UnifiedSharedMemory,
}

/// Where the physical backing of an allocation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryPool {
    System,
    Local,
}

/// A backing allocation handed out by a [`MemoryManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsAllocation {
    pub handle: u64,              // Unique per memory manager, never reused
    pub root_device_index: u32,   // Root device owning the allocation
    pub gpu_address: u64,         // GPU Virtual Address
    pub cpu_address: Option<u64>, // CPU Virtual Address (if host-visible)
    pub size: u64,                // Size in bytes
    pub allocation_type: AllocationType,
    pub memory_pool: MemoryPool,
    pub compressed: bool,
    pub coherent: bool,
}

/// Per-root-device allocations that together back one unified allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiGraphicsAllocation {
    allocations: Vec<Option<GraphicsAllocation>>,
}

impl MultiGraphicsAllocation {
    #[must_use]
    pub fn new(max_root_device_index: u32) -> Self {
        Self {
            allocations: vec![None; max_root_device_index as usize + 1],
        }
    }

    /// Stores `allocation` in the slot of its root device, growing as needed.
    pub fn add_allocation(&mut self, allocation: GraphicsAllocation) {
        let index = allocation.root_device_index as usize;
        if index >= self.allocations.len() {
            self.allocations.resize(index + 1, None);
        }
        self.allocations[index] = Some(allocation);
    }

    #[must_use]
    pub fn get(&self, root_device_index: u32) -> Option<&GraphicsAllocation> {
        self.allocations
            .get(root_device_index as usize)
            .and_then(Option::as_ref)
    }

    /// The first allocation present, in root device order.
    #[must_use]
    pub fn default_allocation(&self) -> Option<&GraphicsAllocation> {
        self.iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GraphicsAllocation> {
        self.allocations.iter().flatten()
    }

    /// Empties every slot, yielding the allocations that were present.
    pub fn take_all(&mut self) -> Vec<GraphicsAllocation> {
        self.allocations.iter_mut().filter_map(Option::take).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// A request to a [`MemoryManager`].
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationProperties {
    pub root_device_index: u32,
    pub size: u64,
    pub alignment: u64,
    pub allocation_type: AllocationType,
    pub memory_pool: MemoryPool,
    pub compressed: bool,
    pub coherent: bool,
    pub kmd_migrated: bool,
    /// Place (or mirror) the allocation at this existing CPU address.
    pub host_ptr: Option<u64>,
    pub multi_os_context_capable: bool,
}

impl AllocationProperties {
    #[must_use]
    pub const fn new(
        root_device_index: u32,
        size: u64,
        allocation_type: AllocationType,
        memory_pool: MemoryPool,
    ) -> Self {
        Self {
            root_device_index,
            size,
            alignment: 0,
            allocation_type,
            memory_pool,
            compressed: false,
            coherent: false,
            kmd_migrated: false,
            host_ptr: None,
            multi_os_context_capable: false,
        }
    }

    #[must_use]
    pub const fn alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    #[must_use]
    pub const fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    #[must_use]
    pub const fn coherent(mut self, coherent: bool) -> Self {
        self.coherent = coherent;
        self
    }

    #[must_use]
    pub const fn kmd_migrated(mut self) -> Self {
        self.kmd_migrated = true;
        self
    }

    #[must_use]
    pub const fn host_ptr(mut self, host_ptr: u64) -> Self {
        self.host_ptr = Some(host_ptr);
        self
    }

    #[must_use]
    pub const fn multi_os_context_capable(mut self, capable: bool) -> Self {
        self.multi_os_context_capable = capable;
        self
    }
}

/// A reserved, not necessarily backed, virtual address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub address: u64,
    pub size: u64,
}

/// Backing allocator consumed by the unified memory registry.
pub trait MemoryManager: Send + Sync {
    /// Create a backing allocation described by `properties`.
    fn allocate_graphics_memory(
        &self,
        properties: &AllocationProperties,
    ) -> UsmResult<GraphicsAllocation>;

    /// Destroy a backing allocation.
    fn free_graphics_memory(&self, allocation: GraphicsAllocation);

    /// Reserve a contiguous virtual address range.
    fn reserve_address_range(&self, size: u64, alignment: u64) -> UsmResult<AddressRange>;

    /// Release a range obtained from `reserve_address_range`.
    fn release_address_range(&self, range: AddressRange);

    fn is_local_memory_supported(&self, root_device_index: u32) -> bool;

    fn is_kmd_migration_available(&self, root_device_index: u32) -> bool;

    /// Block until no device work references `allocation`.
    fn wait_for_completion(&self, _allocation: &GraphicsAllocation) {}

    /// Migrate `allocation` towards `target_root_device_index`. Returns whether it was accepted.
    fn prefetch(&self, _allocation: &GraphicsAllocation, _target_root_device_index: u32) -> bool {
        false
    }
}

// Re-export the concrete managers for easy access
pub use mock::MockMemoryManager;
pub use software::SoftwareMemoryManager;
