//! Unified shared memory bookkeeping for GPU drivers.
//!
//! [`heap::HeapAllocator`] sub-allocates a fixed virtual range with a two-ended
//! bump scheme and best-fit reuse of freed chunks. [`svm::SvmAllocsManager`]
//! creates host, device and shared allocations through a [`memory::MemoryManager`]
//! and answers "which allocation owns this pointer" for interior pointers.

pub mod config;
pub mod error;
pub mod heap;
pub mod memory;
pub mod svm;
pub mod utils;

// Re-export the main entry points for easy access
pub use config::SvmManagerConfig;
pub use error::{UsmError, UsmResult};
pub use heap::HeapAllocator;
pub use memory::{MemoryManager, MockMemoryManager, SoftwareMemoryManager};
pub use svm::{InternalMemoryType, SvmAllocsManager, UnifiedMemoryProperties};
