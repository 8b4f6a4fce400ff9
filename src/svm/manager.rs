use super::cache::SvmAllocationCache;
use super::residency::{
    CommandStreamReceiver, IndirectAllocationsResidency, InternalAllocationsTracker,
    ResidencyContainer,
};
use super::tracker::{MapBasedAllocationTracker, MapOperationsTracker, SortedAllocationTracker};
use super::{
    AllocationStrategy, BackingCapabilities, FreePolicy, InternalMemoryType,
    SvmAllocationData, SvmAllocationProperties, SvmMapOperation, TaskCount,
    UnifiedMemoryProperties,
};
use crate::config::SvmManagerConfig;
use crate::error::{UsmError, UsmResult};
use crate::memory::{
    AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager, MemoryPool,
    MultiGraphicsAllocation,
};
use crate::utils::{PAGE_SIZE, PAGE_SIZE_64K, checked_align_up};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Default)]
struct Trackers {
    live: SortedAllocationTracker,
    deferred: MapBasedAllocationTracker,
    map_operations: MapOperationsTracker,
}

/// Everything a strategy needs to build backing storage.
struct BackingRequest<'a> {
    size: u64,
    alignment: u64,
    root_device_index: u32,
    memory_type: InternalMemoryType,
    caps: BackingCapabilities,
    properties: &'a UnifiedMemoryProperties,
    svm_properties: SvmAllocationProperties,
}

/// Registry of unified memory allocations.
///
/// Lock order: the residency mutex may be held while taking the tracker lock,
/// never the reverse. The cache lock is only taken with no other registry lock
/// held. Backing storage is released, and receiver or memory manager callbacks
/// run, outside every registry lock.
pub struct SvmAllocsManager {
    memory_manager: Arc<dyn MemoryManager>,
    config: SvmManagerConfig,
    trackers: RwLock<Trackers>,
    indirect_residency: Mutex<IndirectAllocationsResidency>,
    device_allocation_cache: Option<SvmAllocationCache>,
    allocations_counter: AtomicU32,
}

impl std::fmt::Debug for SvmAllocsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvmAllocsManager")
            .field("config", &self.config)
            .field("trackers", &self.trackers)
            .field("indirect_residency", &self.indirect_residency)
            .field("device_allocation_cache", &self.device_allocation_cache)
            .field("allocations_counter", &self.allocations_counter)
            .finish_non_exhaustive()
    }
}

impl SvmAllocsManager {
    #[must_use]
    pub fn new(memory_manager: Arc<dyn MemoryManager>, config: SvmManagerConfig) -> Self {
        let device_allocation_cache = config
            .device_allocation_cache
            .then(|| SvmAllocationCache::new(config.device_allocation_cache_max_bytes));

        Self {
            memory_manager,
            config,
            trackers: RwLock::new(Trackers::default()),
            indirect_residency: Mutex::new(IndirectAllocationsResidency::default()),
            device_allocation_cache,
            allocations_counter: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SvmManagerConfig {
        &self.config
    }

    #[must_use]
    pub fn memory_manager(&self) -> &Arc<dyn MemoryManager> {
        &self.memory_manager
    }

    // ===========================================================================================
    // Creation
    // ===========================================================================================

    /// Creates a shared virtual memory allocation visible on every root device given.
    ///
    /// # Errors
    /// Fails on zero size, an empty root device list, or when every strategy fails.
    pub fn create_svm_allocation(
        &self,
        size: u64,
        svm_properties: SvmAllocationProperties,
        root_device_indices: &[u32],
    ) -> UsmResult<u64> {
        let properties =
            UnifiedMemoryProperties::new(InternalMemoryType::Svm, 0, root_device_indices);
        self.create_allocation(size, svm_properties, &properties, InternalMemoryType::Svm)
    }

    /// Creates host memory shared zero-copy with every root device in `properties`.
    ///
    /// # Errors
    /// Fails on invalid arguments or when the memory manager cannot back the request.
    pub fn create_host_allocation(
        &self,
        size: u64,
        properties: &UnifiedMemoryProperties,
    ) -> UsmResult<u64> {
        self.create_allocation(
            size,
            Self::svm_properties_of(properties),
            properties,
            InternalMemoryType::Host,
        )
    }

    /// Creates device memory, reusing a cached block when the cache is enabled.
    ///
    /// # Errors
    /// Fails when `properties.device` is unset or the memory manager cannot back the request.
    pub fn create_device_allocation(
        &self,
        size: u64,
        properties: &UnifiedMemoryProperties,
    ) -> UsmResult<u64> {
        self.create_allocation(
            size,
            Self::svm_properties_of(properties),
            properties,
            InternalMemoryType::Device,
        )
    }

    /// Creates memory shared between host and device.
    ///
    /// # Errors
    /// Fails on invalid arguments or when every strategy fails.
    pub fn create_shared_allocation(
        &self,
        size: u64,
        properties: &UnifiedMemoryProperties,
    ) -> UsmResult<u64> {
        self.create_allocation(
            size,
            Self::svm_properties_of(properties),
            properties,
            InternalMemoryType::Shared,
        )
    }

    /// Creates an allocation of the kind named by `properties.memory_type`.
    ///
    /// # Errors
    /// See the type-specific constructors.
    pub fn create_unified_allocation(
        &self,
        size: u64,
        properties: &UnifiedMemoryProperties,
    ) -> UsmResult<u64> {
        match properties.memory_type {
            InternalMemoryType::Host => self.create_host_allocation(size, properties),
            InternalMemoryType::Device => self.create_device_allocation(size, properties),
            InternalMemoryType::Shared => self.create_shared_allocation(size, properties),
            InternalMemoryType::Svm | InternalMemoryType::NotSpecified => self.create_allocation(
                size,
                Self::svm_properties_of(properties),
                properties,
                InternalMemoryType::Svm,
            ),
        }
    }

    /// Allocation type and compression preference for a device allocation.
    #[must_use]
    pub fn allocation_type_and_compression(
        properties: &UnifiedMemoryProperties,
    ) -> (AllocationType, bool) {
        let compressed = properties.flags.compressed_hint && !properties.flags.uncompressed_hint;

        let allocation_type = if properties.requested_allocation_type != AllocationType::Unknown {
            properties.requested_allocation_type
        } else if properties.flags.write_combined {
            AllocationType::WriteCombined
        } else {
            AllocationType::Buffer
        };

        (allocation_type, compressed)
    }

    fn svm_properties_of(properties: &UnifiedMemoryProperties) -> SvmAllocationProperties {
        SvmAllocationProperties {
            read_only: properties.flags.read_only,
            ..SvmAllocationProperties::default()
        }
    }

    const fn page_size_for(memory_type: InternalMemoryType) -> u64 {
        match memory_type {
            InternalMemoryType::Device | InternalMemoryType::Shared => PAGE_SIZE_64K,
            _ => PAGE_SIZE,
        }
    }

    fn create_allocation(
        &self,
        size: u64,
        svm_properties: SvmAllocationProperties,
        properties: &UnifiedMemoryProperties,
        memory_type: InternalMemoryType,
    ) -> UsmResult<u64> {
        if size == 0 {
            return Err(UsmError::InvalidSize(size));
        }
        let root_device_index = properties
            .root_device_index()
            .ok_or_else(|| UsmError::InvalidArgument("no root device given".into()))?;
        if memory_type == InternalMemoryType::Device && properties.device.is_none() {
            return Err(UsmError::InvalidArgument(
                "device allocation without an owning device".into(),
            ));
        }

        let page_size = Self::page_size_for(memory_type);
        let aligned_size = checked_align_up(size, page_size).ok_or(UsmError::InvalidSize(size))?;
        let alignment = checked_align_up(properties.alignment.max(page_size), page_size)
            .ok_or_else(|| {
                UsmError::InvalidArgument(format!(
                    "alignment {:#x} too large",
                    properties.alignment
                ))
            })?;

        if memory_type == InternalMemoryType::Device {
            if let Some(ptr) = self.reuse_cached_allocation(size, alignment, properties) {
                return Ok(ptr);
            }
        }

        let caps = BackingCapabilities {
            local_memory: self
                .memory_manager
                .is_local_memory_supported(root_device_index),
            kmd_migration: self.config.kmd_migrated_shared_allocations.unwrap_or_else(|| {
                self.memory_manager
                    .is_kmd_migration_available(root_device_index)
            }),
        };
        let request = BackingRequest {
            size: aligned_size,
            alignment,
            root_device_index,
            memory_type,
            caps,
            properties,
            svm_properties,
        };

        for strategy in AllocationStrategy::candidates(memory_type, caps) {
            match self.create_backing(strategy, &request) {
                Ok(mut data) => {
                    data.device = properties.device;
                    data.size = size;
                    data.page_size_for_alignment = page_size;
                    data.memory_type = memory_type;
                    data.strategy = strategy;
                    data.properties = svm_properties;
                    data.allocation_flags = properties.flags;
                    data.requested_allocation_type = properties.requested_allocation_type;

                    let (ptr, alloc_id) = self.track(data);
                    tracing::debug!(
                        ptr,
                        size,
                        memory_type = ?memory_type,
                        strategy = ?strategy,
                        alloc_id,
                        "created unified allocation"
                    );
                    return Ok(ptr);
                }
                Err(e) => tracing::warn!(
                    size,
                    memory_type = ?memory_type,
                    strategy = ?strategy,
                    error = %e,
                    "unified allocation strategy failed"
                ),
            }
        }

        Err(UsmError::OutOfMemory(size))
    }

    fn create_backing(
        &self,
        strategy: AllocationStrategy,
        request: &BackingRequest<'_>,
    ) -> UsmResult<SvmAllocationData> {
        match strategy {
            AllocationStrategy::ZeroCopy => self.create_zero_copy(request),
            AllocationStrategy::DeviceStorage => self.create_with_device_storage(request),
            AllocationStrategy::KmdMigrated => self.create_kmd_migrated(request),
        }
    }

    /// One system allocation; further root devices share its host pointer.
    fn create_zero_copy(&self, request: &BackingRequest<'_>) -> UsmResult<SvmAllocationData> {
        let mut root_device_indices = vec![request.root_device_index];
        root_device_indices.extend(
            request
                .properties
                .root_device_indices
                .iter()
                .copied()
                .filter(|&index| index != request.root_device_index),
        );

        let allocation_type = if request.memory_type == InternalMemoryType::Host {
            AllocationType::BufferHostMemory
        } else {
            AllocationType::SvmZeroCopy
        };

        let max_root_device_index = root_device_indices.iter().copied().max().unwrap_or(0);
        let mut gpu_allocations = MultiGraphicsAllocation::new(max_root_device_index);
        let mut host_ptr = None;

        for root_device_index in root_device_indices {
            let mut allocation_properties = self
                .allocation_properties(
                    request,
                    root_device_index,
                    allocation_type,
                    MemoryPool::System,
                )
                .coherent(request.svm_properties.coherent);
            if let Some(host_ptr) = host_ptr {
                allocation_properties = allocation_properties.host_ptr(host_ptr);
            }

            match self.memory_manager.allocate_graphics_memory(&allocation_properties) {
                Ok(allocation) => {
                    if host_ptr.is_none() {
                        host_ptr = Some(allocation.cpu_address.unwrap_or(allocation.gpu_address));
                    }
                    gpu_allocations.add_allocation(allocation);
                }
                Err(e) => {
                    for allocation in gpu_allocations.take_all() {
                        self.memory_manager.free_graphics_memory(allocation);
                    }
                    return Err(e);
                }
            }
        }

        let mut data = SvmAllocationData::new(max_root_device_index);
        data.gpu_allocations = gpu_allocations;
        Ok(data)
    }

    /// Device-side storage. Non-device kinds also get a CPU mirror at the same address.
    fn create_with_device_storage(
        &self,
        request: &BackingRequest<'_>,
    ) -> UsmResult<SvmAllocationData> {
        let root_device_index = request.root_device_index;
        let pool = if request.caps.local_memory {
            MemoryPool::Local
        } else {
            MemoryPool::System
        };
        let mut data = SvmAllocationData::new(root_device_index);

        if request.memory_type == InternalMemoryType::Device {
            let (allocation_type, compressed) =
                Self::allocation_type_and_compression(request.properties);
            let allocation_properties = self
                .allocation_properties(request, root_device_index, allocation_type, pool)
                .compressed(compressed);
            let allocation = self
                .memory_manager
                .allocate_graphics_memory(&allocation_properties)?;
            data.gpu_allocations.add_allocation(allocation);
            return Ok(data);
        }

        let cpu_properties = self
            .allocation_properties(
                request,
                root_device_index,
                AllocationType::SvmCpu,
                MemoryPool::System,
            )
            .coherent(request.svm_properties.coherent);
        let cpu_allocation = self.memory_manager.allocate_graphics_memory(&cpu_properties)?;
        let cpu_address = cpu_allocation
            .cpu_address
            .unwrap_or(cpu_allocation.gpu_address);

        let gpu_properties = self
            .allocation_properties(request, root_device_index, AllocationType::SvmGpu, pool)
            .host_ptr(cpu_address);
        match self.memory_manager.allocate_graphics_memory(&gpu_properties) {
            Ok(gpu_allocation) => {
                data.gpu_allocations.add_allocation(gpu_allocation);
                data.cpu_allocation = Some(cpu_allocation);
                Ok(data)
            }
            Err(e) => {
                self.memory_manager.free_graphics_memory(cpu_allocation);
                Err(e)
            }
        }
    }

    fn create_kmd_migrated(&self, request: &BackingRequest<'_>) -> UsmResult<SvmAllocationData> {
        let allocation_properties = self
            .allocation_properties(
                request,
                request.root_device_index,
                AllocationType::UnifiedSharedMemory,
                MemoryPool::System,
            )
            .kmd_migrated();
        let allocation = self
            .memory_manager
            .allocate_graphics_memory(&allocation_properties)?;

        let mut data = SvmAllocationData::new(request.root_device_index);
        data.gpu_allocations.add_allocation(allocation);
        Ok(data)
    }

    fn allocation_properties(
        &self,
        request: &BackingRequest<'_>,
        root_device_index: u32,
        allocation_type: AllocationType,
        pool: MemoryPool,
    ) -> AllocationProperties {
        AllocationProperties::new(root_device_index, request.size, allocation_type, pool)
            .alignment(request.alignment)
            .multi_os_context_capable(self.config.multi_os_context_support)
    }

    fn reuse_cached_allocation(
        &self,
        size: u64,
        alignment: u64,
        properties: &UnifiedMemoryProperties,
    ) -> Option<u64> {
        let cache = self.device_allocation_cache.as_ref()?;
        let info = cache.get(size, alignment, properties)?;

        let mut data = info.data;
        data.size = size;
        data.properties = Self::svm_properties_of(properties);
        let (ptr, alloc_id) = self.track(data);
        tracing::debug!(
            ptr,
            size,
            cached_size = info.size,
            alloc_id,
            "reused cached device allocation"
        );
        Some(ptr)
    }

    /// Assigns a fresh id and inserts `data` into the live tracker.
    ///
    /// The id is taken under the tracker lock so residency scans never miss a record.
    fn track(&self, mut data: SvmAllocationData) -> (u64, u32) {
        let mut trackers = self.trackers.write();
        let alloc_id = self.allocations_counter.fetch_add(1, Ordering::AcqRel);
        data.set_alloc_id(alloc_id);
        let ptr = data.address();
        if let Some(replaced) = trackers.live.insert(data) {
            tracing::warn!(
                ptr,
                replaced_alloc_id = replaced.alloc_id(),
                "replaced an allocation tracked under the same pointer"
            );
        }
        (ptr, alloc_id)
    }

    // ===========================================================================================
    // Lookup and direct record management
    // ===========================================================================================

    /// Finds the live allocation containing `ptr` (its base or any interior address).
    pub fn get_allocation(&self, ptr: u64) -> Option<SvmAllocationData> {
        self.trackers.read().live.get(ptr).cloned()
    }

    /// Finds the deferred-free allocation containing `ptr`.
    pub fn get_deferred_free_allocation(&self, ptr: u64) -> Option<SvmAllocationData> {
        self.trackers.read().deferred.get(ptr).cloned()
    }

    /// Tracks an externally created record (e.g. an imported allocation).
    ///
    /// Records without an id get a fresh one. Returns the tracked pointer.
    pub fn insert_allocation(&self, data: SvmAllocationData) -> u64 {
        if data.alloc_id() == SvmAllocationData::UNINITIALIZED_ALLOC_ID {
            return self.track(data).0;
        }

        let ptr = data.address();
        if let Some(replaced) = self.trackers.write().live.insert(data) {
            tracing::warn!(
                ptr,
                replaced_alloc_id = replaced.alloc_id(),
                "replaced an allocation tracked under the same pointer"
            );
        }
        ptr
    }

    /// Stops tracking the record based at exactly `ptr` without releasing anything.
    pub fn remove_allocation(&self, ptr: u64) -> Option<SvmAllocationData> {
        self.trackers.write().live.remove(ptr)
    }

    // ===========================================================================================
    // Free
    // ===========================================================================================

    /// Frees the allocation containing `ptr`.
    ///
    /// Blocking frees wait for device work and release at once; non-blocking
    /// frees park the record until [`SvmAllocsManager::deferred_free_flush`].
    /// Returns `false` for unknown pointers.
    pub fn free_allocation(&self, ptr: u64, blocking: bool) -> bool {
        let policy = if blocking {
            FreePolicy::Blocking
        } else {
            FreePolicy::Defer
        };
        self.free_allocation_with_policy(ptr, policy)
    }

    pub fn free_allocation_with_policy(&self, ptr: u64, policy: FreePolicy) -> bool {
        let data = {
            let mut trackers = self.trackers.write();
            let Some(base) = trackers.live.get(ptr).map(SvmAllocationData::address) else {
                return false;
            };
            let Some(data) = trackers.live.remove(base) else {
                return false;
            };

            if policy == FreePolicy::Defer {
                tracing::debug!(
                    ptr = base,
                    alloc_id = data.alloc_id(),
                    "deferred free"
                );
                trackers.deferred.insert(data);
                return true;
            }
            data
        };

        if policy == FreePolicy::Blocking {
            self.wait_for_completion(&data);
        }
        self.release(data);
        true
    }

    /// Releases every deferred allocation. Returns how many were released.
    ///
    /// Callers must only flush once device work using those allocations has completed.
    pub fn deferred_free_flush(&self) -> usize {
        let parked = self.trackers.write().deferred.take_all();
        let count = parked.len();
        for data in parked {
            self.release(data);
        }
        if count > 0 {
            tracing::debug!(count, "flushed deferred frees");
        }
        count
    }

    /// Releases every cached device allocation. Returns how many were released.
    pub fn trim_cache(&self) -> usize {
        let Some(cache) = self.device_allocation_cache.as_ref() else {
            return 0;
        };
        let trimmed = cache.trim();
        let count = trimmed.len();
        for data in trimmed {
            self.release_backing(data);
        }
        if count > 0 {
            tracing::debug!(count, "trimmed device allocation cache");
        }
        count
    }

    fn wait_for_completion(&self, data: &SvmAllocationData) {
        for allocation in data.gpu_allocations.iter().chain(data.cpu_allocation.iter()) {
            self.memory_manager.wait_for_completion(allocation);
        }
    }

    /// Retires a record that no tracker owns any more.
    fn release(&self, data: SvmAllocationData) {
        self.prepare_indirect_allocation_for_destruction(&data);

        if data.mapped_alloc_data {
            tracing::debug!(
                ptr = data.address(),
                "dropped mapped sub-allocation record"
            );
            return;
        }

        let data = match self.try_cache(data) {
            Ok(()) => return,
            Err(data) => data,
        };
        self.release_backing(data);
    }

    fn try_cache(&self, data: SvmAllocationData) -> Result<(), SvmAllocationData> {
        let Some(cache) = self.device_allocation_cache.as_ref() else {
            return Err(data);
        };
        if data.memory_type != InternalMemoryType::Device || data.is_imported_allocation {
            return Err(data);
        }

        let ptr = data.address();
        cache.insert(data)?;
        tracing::debug!(ptr, "cached device allocation");
        Ok(())
    }

    fn release_backing(&self, mut data: SvmAllocationData) {
        tracing::debug!(
            ptr = data.address(),
            alloc_id = data.alloc_id(),
            strategy = ?data.strategy,
            "releasing unified allocation"
        );

        match data.strategy {
            AllocationStrategy::ZeroCopy | AllocationStrategy::KmdMigrated => {
                self.free_gpu_allocations(&mut data);
            }
            AllocationStrategy::DeviceStorage => {
                self.free_gpu_allocations(&mut data);
                if let Some(cpu_allocation) = data.cpu_allocation.take() {
                    self.memory_manager.free_graphics_memory(cpu_allocation);
                }
            }
        }
    }

    fn free_gpu_allocations(&self, data: &mut SvmAllocationData) {
        for allocation in data.gpu_allocations.take_all() {
            self.memory_manager.free_graphics_memory(allocation);
        }
    }

    // ===========================================================================================
    // Map operations
    // ===========================================================================================

    pub fn insert_map_operation(
        &self,
        region_svm_ptr: u64,
        region_size: u64,
        base_svm_ptr: u64,
        offset: u64,
        read_only_map: bool,
    ) {
        self.trackers.write().map_operations.insert(SvmMapOperation {
            region_svm_ptr,
            region_size,
            base_svm_ptr,
            offset,
            read_only_map,
        });
    }

    pub fn remove_map_operation(&self, region_svm_ptr: u64) -> bool {
        self.trackers
            .write()
            .map_operations
            .remove(region_svm_ptr)
            .is_some()
    }

    pub fn get_map_operation(&self, region_svm_ptr: u64) -> Option<SvmMapOperation> {
        self.trackers
            .read()
            .map_operations
            .get(region_svm_ptr)
            .copied()
    }

    // ===========================================================================================
    // Residency
    // ===========================================================================================

    /// Makes allocations created since the receiver's last submission resident on it.
    pub fn make_indirect_allocations_resident(
        &self,
        receiver: &Arc<dyn CommandStreamReceiver>,
        task_count: TaskCount,
    ) {
        let allocations = {
            let mut residency = self.indirect_residency.lock();
            let counter = self.allocations_counter.load(Ordering::Acquire);
            let Some(first_id) = residency.record_submission(receiver, task_count, counter) else {
                return;
            };
            self.live_allocations_on(receiver.root_device_index(), |data| {
                (first_id..counter).contains(&data.alloc_id())
            })
        };

        for allocation in &allocations {
            receiver.make_resident(allocation);
        }
        let made_resident = allocations.len();
        tracing::debug!(
            receiver = receiver.id(),
            task_count,
            made_resident,
            "made indirect allocations resident"
        );
    }

    /// Tells every tracked receiver the last task count that may still use `data`.
    pub fn prepare_indirect_allocation_for_destruction(&self, data: &SvmAllocationData) {
        let receivers: Vec<_> = self
            .indirect_residency
            .lock()
            .receivers()
            .map(|(receiver, task_count)| (Arc::clone(receiver), task_count))
            .collect();

        for (receiver, task_count) in receivers {
            if let Some(allocation) = data.gpu_allocations.get(receiver.root_device_index()) {
                receiver.update_task_count(allocation, task_count);
            }
        }
    }

    pub fn residency_tracker(&self, receiver_id: u32) -> Option<InternalAllocationsTracker> {
        self.indirect_residency.lock().tracker(receiver_id)
    }

    /// Appends the `root_device_index` allocations of every live record whose kind
    /// is in `requested_types_mask`.
    pub fn add_internal_allocations_to_residency_container(
        &self,
        root_device_index: u32,
        residency_container: &mut ResidencyContainer,
        requested_types_mask: u32,
    ) {
        residency_container.extend(self.live_allocations_on(root_device_index, |data| {
            data.memory_type.is_in(requested_types_mask)
        }));
    }

    pub fn make_internal_allocations_resident(
        &self,
        receiver: &dyn CommandStreamReceiver,
        requested_types_mask: u32,
    ) {
        let allocations = self.live_allocations_on(receiver.root_device_index(), |data| {
            data.memory_type.is_in(requested_types_mask)
        });
        for allocation in &allocations {
            receiver.make_resident(allocation);
        }
    }

    /// Asks the memory manager to migrate every KMD-migrated shared allocation
    /// towards `root_device_index`. Returns how many prefetches were accepted.
    pub fn prefetch_svm_allocs(&self, root_device_index: u32) -> usize {
        let allocations: Vec<GraphicsAllocation> = self
            .trackers
            .read()
            .live
            .iter()
            .filter(|data| {
                data.memory_type == InternalMemoryType::Shared
                    && data.strategy == AllocationStrategy::KmdMigrated
            })
            .filter_map(|data| data.gpu_allocations.default_allocation())
            .cloned()
            .collect();

        allocations
            .iter()
            .filter(|allocation| self.memory_manager.prefetch(allocation, root_device_index))
            .count()
    }

    /// Snapshot of the `root_device_index` allocations of the live records matching `filter`.
    ///
    /// Callers hand the snapshot to receivers or the memory manager after the
    /// tracker lock is released, so those callbacks may re-enter the registry.
    fn live_allocations_on<F>(&self, root_device_index: u32, filter: F) -> Vec<GraphicsAllocation>
    where
        F: Fn(&SvmAllocationData) -> bool,
    {
        self.trackers
            .read()
            .live
            .iter()
            .filter(|data| filter(*data))
            .filter_map(|data| data.gpu_allocations.get(root_device_index))
            .cloned()
            .collect()
    }

    // ===========================================================================================
    // Counters
    // ===========================================================================================

    pub fn num_allocs(&self) -> usize {
        self.trackers.read().live.len()
    }

    pub fn num_deferred_free_allocs(&self) -> usize {
        self.trackers.read().deferred.len()
    }

    pub fn num_map_operations(&self) -> usize {
        self.trackers.read().map_operations.len()
    }

    pub fn num_cached_allocations(&self) -> usize {
        self.device_allocation_cache
            .as_ref()
            .map_or(0, SvmAllocationCache::len)
    }

    pub fn has_host_allocations(&self) -> bool {
        self.trackers
            .read()
            .live
            .iter()
            .any(|data| data.memory_type == InternalMemoryType::Host)
    }

    /// Ids handed out so far.
    pub fn allocations_counter(&self) -> u32 {
        self.allocations_counter.load(Ordering::Acquire)
    }
}

impl Drop for SvmAllocsManager {
    fn drop(&mut self) {
        self.deferred_free_flush();

        let live = self.trackers.get_mut().live.take_all();
        if !live.is_empty() {
            tracing::debug!(
                count = live.len(),
                "releasing allocations still tracked at teardown"
            );
        }
        for data in live {
            if !data.mapped_alloc_data {
                self.release_backing(data);
            }
        }

        self.trim_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MockMemoryManager;

    fn manager_with(
        mock: MockMemoryManager,
        config: SvmManagerConfig,
    ) -> (Arc<MockMemoryManager>, SvmAllocsManager) {
        let mock = Arc::new(mock);
        let manager = SvmAllocsManager::new(mock.clone(), config);
        (mock, manager)
    }

    fn device_properties(device: u32) -> UnifiedMemoryProperties {
        UnifiedMemoryProperties::new(InternalMemoryType::Device, 0, &[device]).device(device)
    }

    #[test]
    fn interior_pointers_resolve_to_the_same_record() {
        let (_mock, manager) = manager_with(MockMemoryManager::new(), SvmManagerConfig::new());
        let props = UnifiedMemoryProperties::new(InternalMemoryType::Host, 0, &[0]);
        let ptr = manager.create_host_allocation(10_000, &props).unwrap();

        let base = manager.get_allocation(ptr).unwrap();
        assert_eq!(base.size, 10_000);
        for offset in [1, 4096, 9_999] {
            assert_eq!(manager.get_allocation(ptr + offset).unwrap().alloc_id(), base.alloc_id());
        }
        assert!(manager.get_allocation(ptr + 10_000).is_none());
        assert!(manager.has_host_allocations());
    }

    #[test]
    fn host_allocation_shares_pointer_across_root_devices() {
        let (mock, manager) = manager_with(MockMemoryManager::new(), SvmManagerConfig::new());
        let props = UnifiedMemoryProperties::new(InternalMemoryType::Host, 0, &[0, 1, 2]);

        let ptr = manager.create_host_allocation(4096, &props).unwrap();

        let data = manager.get_allocation(ptr).unwrap();
        assert_eq!(data.strategy, AllocationStrategy::ZeroCopy);
        for root in 0..3 {
            assert_eq!(data.gpu_allocations.get(root).unwrap().gpu_address, ptr);
        }
        let requests = mock.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].host_ptr.is_none());
        assert_eq!(requests[1].host_ptr, Some(ptr));
    }

    #[test]
    fn partial_zero_copy_failure_rolls_back() {
        let (mock, manager) = manager_with(MockMemoryManager::new(), SvmManagerConfig::new());
        mock.fail_allocation_type(AllocationType::BufferHostMemory);
        let props = UnifiedMemoryProperties::new(InternalMemoryType::Host, 0, &[0, 1]);

        assert!(matches!(
            manager.create_host_allocation(4096, &props),
            Err(UsmError::OutOfMemory(4096))
        ));
        assert_eq!(mock.live_count(), 0);
        assert_eq!(manager.num_allocs(), 0);
    }

    #[test]
    fn shared_allocation_prefers_kmd_migration() {
        let mock = MockMemoryManager::new()
            .with_local_memory(true)
            .with_kmd_migration(true);
        let (_mock, manager) = manager_with(mock, SvmManagerConfig::new());
        let props = UnifiedMemoryProperties::new(InternalMemoryType::Shared, 0, &[0]).device(0);

        let ptr = manager.create_shared_allocation(1 << 20, &props).unwrap();

        let data = manager.get_allocation(ptr).unwrap();
        assert_eq!(data.strategy, AllocationStrategy::KmdMigrated);
        assert_eq!(data.page_size_for_alignment, PAGE_SIZE_64K);
        assert_eq!(manager.prefetch_svm_allocs(0), 1);
    }

    #[test]
    fn shared_allocation_falls_back_when_kmd_migration_fails() {
        let mock = MockMemoryManager::new()
            .with_local_memory(true)
            .with_kmd_migration(true);
        let (mock, manager) = manager_with(mock, SvmManagerConfig::new());
        mock.fail_allocation_type(AllocationType::UnifiedSharedMemory);
        let props = UnifiedMemoryProperties::new(InternalMemoryType::Shared, 0, &[0]).device(0);

        let ptr = manager.create_shared_allocation(4096, &props).unwrap();

        let data = manager.get_allocation(ptr).unwrap();
        assert_eq!(data.strategy, AllocationStrategy::DeviceStorage);
        let cpu = data.cpu_allocation.as_ref().unwrap();
        assert_eq!(cpu.cpu_address, Some(ptr));
        assert_eq!(data.gpu_allocations.get(0).unwrap().memory_pool, MemoryPool::Local);
    }

    #[test]
    fn config_can_disable_kmd_migration() {
        let mock = MockMemoryManager::new().with_kmd_migration(true);
        let (_mock, manager) = manager_with(
            mock,
            SvmManagerConfig::new().kmd_migrated_shared_allocations(false),
        );
        let props = UnifiedMemoryProperties::new(InternalMemoryType::Shared, 0, &[0]);

        let ptr = manager.create_shared_allocation(4096, &props).unwrap();

        assert_eq!(
            manager.get_allocation(ptr).unwrap().strategy,
            AllocationStrategy::ZeroCopy
        );
    }

    #[test]
    fn device_allocation_requires_device() {
        let (_mock, manager) = manager_with(MockMemoryManager::new(), SvmManagerConfig::new());
        let props = UnifiedMemoryProperties::new(InternalMemoryType::Device, 0, &[0]);
        assert!(matches!(
            manager.create_device_allocation(4096, &props),
            Err(UsmError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.create_device_allocation(0, &device_properties(0)),
            Err(UsmError::InvalidSize(0))
        ));
    }

    #[test]
    fn device_allocation_type_follows_hints() {
        let props = device_properties(0).write_combined().compressed_hint();
        assert_eq!(
            SvmAllocsManager::allocation_type_and_compression(&props),
            (AllocationType::WriteCombined, true)
        );

        let props = device_properties(0).compressed_hint().uncompressed_hint();
        assert_eq!(
            SvmAllocsManager::allocation_type_and_compression(&props),
            (AllocationType::Buffer, false)
        );
    }

    #[test]
    fn blocking_free_waits_and_releases() {
        let (mock, manager) = manager_with(
            MockMemoryManager::new().with_local_memory(true),
            SvmManagerConfig::new(),
        );
        let ptr = manager.create_device_allocation(4096, &device_properties(0)).unwrap();
        let handle = manager.get_allocation(ptr).unwrap().gpu_allocations.get(0).unwrap().handle;

        assert!(manager.free_allocation(ptr, true));

        assert_eq!(mock.wait_count(), 1);
        assert_eq!(mock.free_count(handle), 1);
        assert!(manager.get_allocation(ptr).is_none());
        assert!(!manager.free_allocation(ptr, true));
    }

    #[test]
    fn none_policy_releases_without_waiting() {
        let (mock, manager) = manager_with(MockMemoryManager::new(), SvmManagerConfig::new());
        let props = UnifiedMemoryProperties::new(InternalMemoryType::Host, 0, &[0]);
        let ptr = manager.create_host_allocation(4096, &props).unwrap();

        assert!(manager.free_allocation_with_policy(ptr, FreePolicy::None));

        assert_eq!(mock.wait_count(), 0);
        assert_eq!(mock.live_count(), 0);
    }

    #[test]
    fn mapped_sub_allocation_record_releases_nothing() {
        let (mock, manager) = manager_with(MockMemoryManager::new(), SvmManagerConfig::new());
        let props = UnifiedMemoryProperties::new(InternalMemoryType::Host, 0, &[0]);
        let ptr = manager.create_host_allocation(4096, &props).unwrap();
        let mut mapped = manager.remove_allocation(ptr).unwrap();
        mapped.mapped_alloc_data = true;
        let mapped_ptr = manager.insert_allocation(mapped);

        assert!(manager.free_allocation(mapped_ptr, true));

        assert_eq!(mock.total_frees(), 0);
        assert_eq!(manager.num_allocs(), 0);
    }

    #[test]
    fn inserted_record_gets_fresh_id() {
        let (_mock, manager) = manager_with(MockMemoryManager::new(), SvmManagerConfig::new());
        let props = UnifiedMemoryProperties::new(InternalMemoryType::Host, 0, &[0]);
        let ptr = manager.create_host_allocation(4096, &props).unwrap();
        let mut imported = manager.remove_allocation(ptr).unwrap();
        imported.is_imported_allocation = true;
        imported.set_alloc_id(SvmAllocationData::UNINITIALIZED_ALLOC_ID);

        manager.insert_allocation(imported);

        let data = manager.get_allocation(ptr).unwrap();
        assert_eq!(data.alloc_id(), 1);
        assert!(data.is_imported_allocation);
    }
}
