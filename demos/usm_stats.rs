use std::sync::Arc;
use usm_rs::memory::MemoryManager;
use usm_rs::utils::MEGABYTE;
use usm_rs::{
    InternalMemoryType, SoftwareMemoryManager, SvmAllocsManager, SvmManagerConfig,
    UnifiedMemoryProperties,
};

fn print_registry(label: &str, manager: &SvmAllocsManager) {
    println!("\n--- {label} ---");
    println!("Live allocations:     {}", manager.num_allocs());
    println!("Deferred frees:       {}", manager.num_deferred_free_allocs());
    println!("Cached device blocks: {}", manager.num_cached_allocations());
    println!("Map operations:       {}", manager.num_map_operations());
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Unified Memory Registry Walkthrough ===");

    // 1. Two root devices with 64 MiB of emulated local memory each
    let backing = Arc::new(SoftwareMemoryManager::new(2, Some(64 * MEGABYTE), true)?);
    let memory_manager: Arc<dyn MemoryManager> = backing.clone();
    for root in 0..2 {
        if let Some((base, limit)) = backing.local_aperture_bounds(root) {
            println!("[+] Root device {root}: local aperture {base:#x}..{limit:#x}");
        }
    }

    // 2. Registry configured from USM_* variables, with the device allocation cache forced on
    let config = SvmManagerConfig::from_env().device_allocation_cache();
    let manager = SvmAllocsManager::new(memory_manager, config);
    println!("[+] Config: {:?}", manager.config());

    // 3. One allocation of each kind
    let host_props = UnifiedMemoryProperties::new(InternalMemoryType::Host, 0, &[0, 1]);
    let host_ptr = manager.create_host_allocation(3 * 4096 + 17, &host_props)?;

    let device_props = UnifiedMemoryProperties::new(InternalMemoryType::Device, 0, &[0]).device(0);
    let device_ptr = manager.create_device_allocation(MEGABYTE, &device_props)?;

    let shared_props = UnifiedMemoryProperties::new(InternalMemoryType::Shared, 0, &[1]).device(1);
    let shared_ptr = manager.create_shared_allocation(2 * MEGABYTE, &shared_props)?;

    for ptr in [host_ptr, device_ptr, shared_ptr] {
        if let Some(data) = manager.get_allocation(ptr) {
            println!(
                "[+] {ptr:#x}: {:?} via {:?}, {} bytes, alloc id {}",
                data.memory_type,
                data.strategy,
                data.size,
                data.alloc_id()
            );
        }
    }
    print_registry("After creation", &manager);

    // 4. Host memory is directly writable; interior pointers resolve to the owner
    unsafe {
        std::ptr::write_bytes(host_ptr as *mut u8, 0xAB, 4096);
    }
    let interior = host_ptr + 4100;
    if let Some(owner) = manager.get_allocation(interior) {
        println!("\n[+] {interior:#x} belongs to {:#x}", owner.address());
    }
    manager.insert_map_operation(host_ptr + 64, 256, host_ptr, 64, true);

    // 5. Free: deferred, blocking (device goes to the cache), then flush
    manager.free_allocation(host_ptr, false);
    manager.free_allocation(device_ptr, true);
    manager.remove_map_operation(host_ptr + 64);
    print_registry("After free", &manager);

    println!("\n[+] Flushed {} deferred frees", manager.deferred_free_flush());

    // 6. A smaller device request is served from the cache
    let reused = manager.create_device_allocation(512 * 1024, &device_props)?;
    println!("[+] Reused cached block: {}", reused == device_ptr);

    manager.free_allocation(reused, true);
    manager.free_allocation(shared_ptr, true);
    println!("[+] Trimmed {} cached blocks", manager.trim_cache());
    print_registry("Final", &manager);
    println!("Host mappings left:   {}", backing.host_mapping_count());

    Ok(())
}
