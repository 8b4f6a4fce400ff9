#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]

use super::{AddressRange, AllocationProperties, GraphicsAllocation, MemoryManager, MemoryPool};
use crate::error::{UsmError, UsmResult};
use crate::heap::{ApertureAllocator, HeapAllocator};
use crate::utils::{PAGE_SIZE, align_up, checked_align_up};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::ptr;

/// How a handle's storage must be given back.
#[derive(Debug, Clone, Copy)]
enum Backing {
    /// Anonymous host mapping, possibly shared by several handles.
    Host { address: u64 },
    /// Range inside a root device's local aperture.
    Local { root_device_index: u32, address: u64, size: u64 },
    /// Aliases memory owned elsewhere; nothing to release.
    Mirror,
}

#[derive(Debug)]
struct HostMapping {
    size: u64,
    refs: usize,
}

/// Per-root-device "VRAM": a `PROT_NONE` reservation sub-allocated by a `HeapAllocator`.
#[derive(Debug)]
struct LocalAperture {
    reservation: AddressRange,
    heap: HeapAllocator,
}

#[derive(Debug, Default)]
struct SoftwareState {
    next_handle: u64,
    backings: HashMap<u64, Backing>,
    host_mappings: HashMap<u64, HostMapping>,
    reservations: HashMap<u64, u64>,
}

/// A [`MemoryManager`] for hosts without a GPU.
///
/// System-pool allocations are anonymous mappings. Local-pool allocations only
/// get virtual addresses, carved out of a per-device reservation.
#[derive(Debug)]
pub struct SoftwareMemoryManager {
    page_size: u64,
    kmd_migration: bool,
    local_apertures: HashMap<u32, LocalAperture>,
    state: Mutex<SoftwareState>,
}

impl SoftwareMemoryManager {
    /// Creates a manager for `num_root_devices` devices.
    ///
    /// When `local_memory_size` is set every device gets a local aperture of that size.
    ///
    /// # Errors
    /// Returns an error if an aperture reservation cannot be mapped.
    pub fn new(
        num_root_devices: u32,
        local_memory_size: Option<u64>,
        kmd_migration: bool,
    ) -> UsmResult<Self> {
        let page_size = system_page_size();
        let mut local_apertures = HashMap::new();

        if let Some(size) = local_memory_size {
            for root_device_index in 0..num_root_devices {
                let size = page_span(size, page_size)?;
                let address = map_anonymous(size, page_size, libc::PROT_NONE, page_size)?;
                tracing::debug!(
                    root_device_index,
                    address = format_args!("{address:#x}"),
                    size,
                    "reserved local aperture"
                );
                local_apertures.insert(
                    root_device_index,
                    LocalAperture {
                        reservation: AddressRange { address, size },
                        heap: HeapAllocator::with_defaults(address, size),
                    },
                );
            }
        }

        Ok(Self {
            page_size,
            kmd_migration,
            local_apertures,
            state: Mutex::new(SoftwareState {
                next_handle: 1,
                ..SoftwareState::default()
            }),
        })
    }

    #[must_use]
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Number of distinct host mappings currently alive.
    pub fn host_mapping_count(&self) -> usize {
        self.state.lock().host_mappings.len()
    }

    /// Base and limit of the local aperture of `root_device_index`, if it has one.
    pub fn local_aperture_bounds(&self, root_device_index: u32) -> Option<(u64, u64)> {
        self.local_apertures
            .get(&root_device_index)
            .map(|aperture| aperture.heap.bounds())
    }

    fn allocate_local(&self, properties: &AllocationProperties) -> UsmResult<(u64, Backing)> {
        if let Some(host_ptr) = properties.host_ptr {
            return Ok((host_ptr, Backing::Mirror));
        }

        let aperture = self
            .local_apertures
            .get(&properties.root_device_index)
            .ok_or(UsmError::InvalidRootDevice(properties.root_device_index))?;

        let block = aperture
            .heap
            .allocate_va(properties.size, properties.alignment)
            .ok_or(UsmError::OutOfMemory(properties.size))?;

        Ok((
            block.address,
            Backing::Local {
                root_device_index: properties.root_device_index,
                address: block.address,
                size: block.size,
            },
        ))
    }

    fn allocate_host(
        &self,
        state: &mut SoftwareState,
        properties: &AllocationProperties,
    ) -> UsmResult<(u64, Backing)> {
        if let Some(host_ptr) = properties.host_ptr {
            // Sharing one of our own mappings keeps it alive; foreign memory is only aliased.
            return Ok(match state.host_mappings.get_mut(&host_ptr) {
                Some(mapping) => {
                    mapping.refs += 1;
                    (host_ptr, Backing::Host { address: host_ptr })
                }
                None => (host_ptr, Backing::Mirror),
            });
        }

        let size = page_span(properties.size, self.page_size)?;
        let address = map_anonymous(
            size,
            properties.alignment,
            libc::PROT_READ | libc::PROT_WRITE,
            self.page_size,
        )?;
        state
            .host_mappings
            .insert(address, HostMapping { size, refs: 1 });

        Ok((address, Backing::Host { address }))
    }
}

impl MemoryManager for SoftwareMemoryManager {
    fn allocate_graphics_memory(
        &self,
        properties: &AllocationProperties,
    ) -> UsmResult<GraphicsAllocation> {
        if properties.size == 0 {
            return Err(UsmError::InvalidSize(0));
        }

        let local = properties.memory_pool == MemoryPool::Local && !properties.kmd_migrated;
        if local && !self.is_local_memory_supported(properties.root_device_index) {
            return Err(UsmError::Backing(format!(
                "root device {} has no local memory",
                properties.root_device_index
            )));
        }

        let mut state = self.state.lock();
        let (address, backing) = if local {
            self.allocate_local(properties)?
        } else {
            self.allocate_host(&mut state, properties)?
        };

        let handle = state.next_handle;
        state.next_handle += 1;
        state.backings.insert(handle, backing);

        Ok(GraphicsAllocation {
            handle,
            root_device_index: properties.root_device_index,
            gpu_address: address,
            cpu_address: (!local).then_some(address),
            size: properties.size,
            allocation_type: properties.allocation_type,
            memory_pool: if local {
                MemoryPool::Local
            } else {
                MemoryPool::System
            },
            compressed: properties.compressed,
            coherent: properties.coherent,
        })
    }

    fn free_graphics_memory(&self, allocation: GraphicsAllocation) {
        let mut state = self.state.lock();
        let Some(backing) = state.backings.remove(&allocation.handle) else {
            tracing::warn!(
                handle = allocation.handle,
                "tried to free an allocation which was not tracked"
            );
            return;
        };

        match backing {
            Backing::Host { address } => {
                let release = match state.host_mappings.get_mut(&address) {
                    Some(mapping) => {
                        mapping.refs -= 1;
                        mapping.refs == 0
                    }
                    None => false,
                };
                if release {
                    if let Some(mapping) = state.host_mappings.remove(&address) {
                        unmap(address, mapping.size);
                    }
                }
            }
            Backing::Local {
                root_device_index,
                address,
                size,
            } => {
                if let Some(aperture) = self.local_apertures.get(&root_device_index) {
                    aperture.heap.free_va(address, size);
                }
            }
            Backing::Mirror => {}
        }
    }

    fn reserve_address_range(&self, size: u64, alignment: u64) -> UsmResult<AddressRange> {
        let size = page_span(size, self.page_size)?;
        let address = map_anonymous(size, alignment, libc::PROT_NONE, self.page_size)?;
        self.state.lock().reservations.insert(address, size);
        Ok(AddressRange { address, size })
    }

    fn release_address_range(&self, range: AddressRange) {
        match self.state.lock().reservations.remove(&range.address) {
            Some(size) => unmap(range.address, size),
            None => tracing::warn!(
                address = format_args!("{:#x}", range.address),
                "tried to release an address range which was not reserved"
            ),
        }
    }

    fn is_local_memory_supported(&self, root_device_index: u32) -> bool {
        self.local_apertures.contains_key(&root_device_index)
    }

    fn is_kmd_migration_available(&self, _root_device_index: u32) -> bool {
        self.kmd_migration
    }
}

impl Drop for SoftwareMemoryManager {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (address, mapping) in state.host_mappings.drain() {
            unmap(address, mapping.size);
        }
        for (address, size) in state.reservations.drain() {
            unmap(address, size);
        }
        for aperture in self.local_apertures.values() {
            unmap(aperture.reservation.address, aperture.reservation.size);
        }
    }
}

fn system_page_size() -> u64 {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size > 0 {
        page_size as u64
    } else {
        PAGE_SIZE
    }
}

/// `size` (at least one byte) rounded up to whole pages.
fn page_span(size: u64, page_size: u64) -> UsmResult<u64> {
    checked_align_up(size.max(1), page_size).ok_or(UsmError::InvalidSize(size))
}

/// Maps `size` bytes of anonymous memory aligned to at least one page.
///
/// Alignments above the page size over-map and trim the excess.
fn map_anonymous(
    size: u64,
    alignment: u64,
    prot: libc::c_int,
    page_size: u64,
) -> UsmResult<u64> {
    let size = page_span(size, page_size)?;
    let alignment = checked_align_up(alignment.max(page_size), page_size)
        .ok_or_else(|| UsmError::InvalidArgument(format!("alignment {alignment:#x} too large")))?;
    let mapped_size = if alignment > page_size {
        size.checked_add(alignment).ok_or(UsmError::OutOfMemory(size))?
    } else {
        size
    };
    let mapped_len = usize::try_from(mapped_size).map_err(|_| UsmError::OutOfMemory(size))?;

    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    if prot == libc::PROT_NONE {
        flags |= libc::MAP_NORESERVE;
    }

    let ret = unsafe { libc::mmap(ptr::null_mut(), mapped_len, prot, flags, -1, 0) };
    if ret == libc::MAP_FAILED {
        return Err(io::Error::last_os_error().into());
    }

    let raw = ret as u64;
    let address = align_up(raw, alignment);
    let head = address - raw;
    let tail = mapped_size - head - size;
    if head > 0 {
        unmap(raw, head);
    }
    if tail > 0 {
        unmap(address + size, tail);
    }

    Ok(address)
}

fn unmap(address: u64, size: u64) {
    let ret = unsafe { libc::munmap(address as *mut libc::c_void, size as usize) };
    if ret != 0 {
        tracing::warn!(
            address = format_args!("{address:#x}"),
            size,
            error = %io::Error::last_os_error(),
            "munmap failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AllocationType;

    #[test]
    fn system_allocation_is_writable_and_released() {
        let mm = SoftwareMemoryManager::new(1, None, false).unwrap();
        let props = AllocationProperties::new(
            0,
            8192,
            AllocationType::BufferHostMemory,
            MemoryPool::System,
        );

        let allocation = mm.allocate_graphics_memory(&props).unwrap();
        let cpu = allocation.cpu_address.unwrap();
        assert_eq!(cpu, allocation.gpu_address);
        assert_eq!(cpu % mm.page_size(), 0);

        unsafe {
            let bytes = std::slice::from_raw_parts_mut(cpu as *mut u8, 8192);
            bytes.fill(0xA5);
            assert!(bytes.iter().all(|&b| b == 0xA5));
        }

        assert_eq!(mm.host_mapping_count(), 1);
        mm.free_graphics_memory(allocation);
        assert_eq!(mm.host_mapping_count(), 0);
    }

    #[test]
    fn shared_host_pointer_keeps_mapping_alive() {
        let mm = SoftwareMemoryManager::new(2, None, false).unwrap();
        let first = mm
            .allocate_graphics_memory(&AllocationProperties::new(
                0,
                4096,
                AllocationType::BufferHostMemory,
                MemoryPool::System,
            ))
            .unwrap();
        let second = mm
            .allocate_graphics_memory(
                &AllocationProperties::new(
                    1,
                    4096,
                    AllocationType::BufferHostMemory,
                    MemoryPool::System,
                )
                .host_ptr(first.gpu_address),
            )
            .unwrap();
        assert_eq!(second.gpu_address, first.gpu_address);

        mm.free_graphics_memory(first);
        assert_eq!(mm.host_mapping_count(), 1);
        mm.free_graphics_memory(second);
        assert_eq!(mm.host_mapping_count(), 0);
    }

    #[test]
    fn local_allocations_come_from_device_aperture() {
        let mm = SoftwareMemoryManager::new(1, Some(16 << 20), false).unwrap();
        let (base, limit) = mm.local_aperture_bounds(0).unwrap();
        let props = AllocationProperties::new(0, 1 << 20, AllocationType::Buffer, MemoryPool::Local)
            .alignment(64 * 1024);

        let allocation = mm.allocate_graphics_memory(&props).unwrap();

        assert!(allocation.gpu_address >= base && allocation.gpu_address + (1 << 20) <= limit);
        assert_eq!(allocation.gpu_address % (64 * 1024), 0);
        assert!(allocation.cpu_address.is_none());
        mm.free_graphics_memory(allocation);
    }

    #[test]
    fn local_request_without_aperture_fails() {
        let mm = SoftwareMemoryManager::new(1, None, false).unwrap();
        let props = AllocationProperties::new(0, 4096, AllocationType::Buffer, MemoryPool::Local);
        assert!(matches!(
            mm.allocate_graphics_memory(&props),
            Err(UsmError::Backing(_))
        ));
    }

    #[test]
    fn oversized_requests_are_rejected_without_mapping() {
        let mm = SoftwareMemoryManager::new(1, Some(1 << 20), false).unwrap();
        let host = AllocationProperties::new(
            0,
            u64::MAX,
            AllocationType::BufferHostMemory,
            MemoryPool::System,
        );
        assert!(matches!(
            mm.allocate_graphics_memory(&host),
            Err(UsmError::InvalidSize(u64::MAX))
        ));
        assert!(matches!(
            mm.reserve_address_range(u64::MAX - 1, 0),
            Err(UsmError::InvalidSize(_))
        ));

        let local =
            AllocationProperties::new(0, u64::MAX, AllocationType::Buffer, MemoryPool::Local);
        assert!(matches!(
            mm.allocate_graphics_memory(&local),
            Err(UsmError::OutOfMemory(u64::MAX))
        ));
        assert_eq!(mm.host_mapping_count(), 0);
    }

    #[test]
    fn address_ranges_round_trip() {
        let mm = SoftwareMemoryManager::new(1, None, false).unwrap();
        let range = mm.reserve_address_range(3 << 20, 2 << 20).unwrap();
        assert_eq!(range.address % (2 << 20), 0);
        assert!(range.size >= 3 << 20);
        mm.release_address_range(range);
    }
}
