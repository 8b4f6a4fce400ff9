pub mod cache;
pub mod manager;
pub mod residency;
pub mod tracker;

use crate::memory::{AllocationType, GraphicsAllocation, MultiGraphicsAllocation};

pub type TaskCount = u64;

/// Kind of unified memory an allocation was created as.
///
/// The discriminants are bits so several kinds can be selected with one mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InternalMemoryType {
    NotSpecified = 0,
    Svm = 1,
    Device = 2,
    Host = 4,
    Shared = 8,
}

impl InternalMemoryType {
    /// Mask selecting every kind.
    pub const ALL_MASK: u32 = Self::Svm as u32
        | Self::Device as u32
        | Self::Host as u32
        | Self::Shared as u32;

    #[must_use]
    pub const fn mask(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn is_in(self, mask: u32) -> bool {
        self as u32 & mask != 0
    }
}

/// How the backing storage of a unified allocation is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationStrategy {
    /// One host allocation, shared directly with every device.
    ZeroCopy,
    /// Device-side storage, optionally mirrored by a separate CPU allocation.
    DeviceStorage,
    /// A single allocation the kernel driver migrates on demand.
    KmdMigrated,
}

/// What the backing memory manager can do for one root device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackingCapabilities {
    pub local_memory: bool,
    pub kmd_migration: bool,
}

impl AllocationStrategy {
    /// Strategies to try for `memory_type`, most preferred first.
    #[must_use]
    pub fn candidates(memory_type: InternalMemoryType, caps: BackingCapabilities) -> Vec<Self> {
        match memory_type {
            InternalMemoryType::Host => vec![Self::ZeroCopy],
            InternalMemoryType::Device => vec![Self::DeviceStorage],
            InternalMemoryType::Shared => {
                let mut strategies = Vec::with_capacity(3);
                if caps.kmd_migration {
                    strategies.push(Self::KmdMigrated);
                }
                if caps.local_memory {
                    strategies.push(Self::DeviceStorage);
                }
                strategies.push(Self::ZeroCopy);
                strategies
            }
            InternalMemoryType::Svm | InternalMemoryType::NotSpecified => {
                if caps.local_memory {
                    vec![Self::DeviceStorage, Self::ZeroCopy]
                } else {
                    vec![Self::ZeroCopy]
                }
            }
        }
    }
}

/// How `free_allocation_with_policy` releases backing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreePolicy {
    /// Release immediately without waiting for device work.
    None,
    /// Wait for device work referencing the allocation, then release.
    Blocking,
    /// Park the record in the deferred set; release on `deferred_free_flush`.
    Defer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SvmAllocationProperties {
    pub coherent: bool,
    pub host_ptr_read_only: bool,
    pub read_only: bool,
}

/// Hints that shape the backing allocation of a unified allocation.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryFlags {
    pub compressed_hint: bool,
    pub uncompressed_hint: bool,
    pub write_combined: bool,
    pub read_only: bool,
}

/// A unified memory request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedMemoryProperties {
    pub memory_type: InternalMemoryType,
    pub alignment: u64,
    pub root_device_indices: Vec<u32>,
    /// Root device index of the owning device (required for device allocations).
    pub device: Option<u32>,
    pub flags: MemoryFlags,
    pub requested_allocation_type: AllocationType,
}

impl UnifiedMemoryProperties {
    #[must_use]
    pub fn new(
        memory_type: InternalMemoryType,
        alignment: u64,
        root_device_indices: &[u32],
    ) -> Self {
        let mut root_device_indices = root_device_indices.to_vec();
        root_device_indices.sort_unstable();
        root_device_indices.dedup();

        Self {
            memory_type,
            alignment,
            root_device_indices,
            device: None,
            flags: MemoryFlags::default(),
            requested_allocation_type: AllocationType::Unknown,
        }
    }

    #[must_use]
    pub fn device(mut self, root_device_index: u32) -> Self {
        self.device = Some(root_device_index);
        self
    }

    #[must_use]
    pub fn compressed_hint(mut self) -> Self {
        self.flags.compressed_hint = true;
        self
    }

    #[must_use]
    pub fn uncompressed_hint(mut self) -> Self {
        self.flags.uncompressed_hint = true;
        self
    }

    #[must_use]
    pub fn write_combined(mut self) -> Self {
        self.flags.write_combined = true;
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.flags.read_only = true;
        self
    }

    #[must_use]
    pub fn allocation_type(mut self, allocation_type: AllocationType) -> Self {
        self.requested_allocation_type = allocation_type;
        self
    }

    /// Root device the primary backing allocation goes to.
    #[must_use]
    pub fn root_device_index(&self) -> Option<u32> {
        self.device.or_else(|| self.root_device_indices.first().copied())
    }
}

/// Bookkeeping record of one unified allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvmAllocationData {
    /// Root device index of the owning device, if any.
    pub device: Option<u32>,
    pub gpu_allocations: MultiGraphicsAllocation,
    pub cpu_allocation: Option<GraphicsAllocation>,
    pub size: u64,
    pub page_size_for_alignment: u64,
    pub memory_type: InternalMemoryType,
    pub strategy: AllocationStrategy,
    pub properties: SvmAllocationProperties,
    /// Hints of the request that created the allocation. Cache reuse requires an exact match.
    pub allocation_flags: MemoryFlags,
    pub requested_allocation_type: AllocationType,
    pub is_imported_allocation: bool,
    /// The record describes a sub-range mapped out of another allocation and owns no storage.
    pub mapped_alloc_data: bool,
    alloc_id: u32,
}

impl SvmAllocationData {
    pub const UNINITIALIZED_ALLOC_ID: u32 = u32::MAX;

    #[must_use]
    pub fn new(max_root_device_index: u32) -> Self {
        Self {
            device: None,
            gpu_allocations: MultiGraphicsAllocation::new(max_root_device_index),
            cpu_allocation: None,
            size: 0,
            page_size_for_alignment: 0,
            memory_type: InternalMemoryType::Svm,
            strategy: AllocationStrategy::ZeroCopy,
            properties: SvmAllocationProperties::default(),
            allocation_flags: MemoryFlags::default(),
            requested_allocation_type: AllocationType::Unknown,
            is_imported_allocation: false,
            mapped_alloc_data: false,
            alloc_id: Self::UNINITIALIZED_ALLOC_ID,
        }
    }

    #[must_use]
    pub const fn alloc_id(&self) -> u32 {
        self.alloc_id
    }

    pub fn set_alloc_id(&mut self, id: u32) {
        self.alloc_id = id;
    }

    /// The pointer the allocation is tracked under.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.gpu_allocations
            .default_allocation()
            .map(|allocation| allocation.gpu_address)
            .or_else(|| self.cpu_allocation.as_ref().and_then(|a| a.cpu_address))
            .unwrap_or(0)
    }

    /// True for the base pointer and for any pointer inside `[base, base + size)`.
    #[must_use]
    pub fn contains(&self, ptr: u64) -> bool {
        let base = self.address();
        ptr == base || (base < ptr && ptr - base < self.size)
    }
}

/// An in-flight host mapping of a sub-region of a unified allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SvmMapOperation {
    pub region_svm_ptr: u64,
    pub region_size: u64,
    pub base_svm_ptr: u64,
    pub offset: u64,
    pub read_only_map: bool,
}

// Re-export the registry for easy access
pub use manager::SvmAllocsManager;
