//! Kernel memory management for Talos.
//!
//! A fixed-arena, header-based free-list heap allocator with first-fit
//! allocation, block splitting, eager coalescing on free, and a block-walk
//! introspection surface for diagnostics. The arena is established once at
//! bring-up and lives for the rest of the boot; there is no teardown.
//!
//! Heaps are explicit [`Heap`] values, so tests and subsystems can run
//! against private arenas. The kernel's own 1 MiB instance lives in
//! [`KERNEL_HEAP`] behind a spinlock and is reached through the `kmalloc`/
//! `kfree` wrappers below.
//!
//! The core runs single-context with no suspension points: every operation
//! completes in one bounded pass over the block chain. The spinlock around
//! the kernel instance serializes any future multi-context callers instead of
//! letting them race on the chain.

#![cfg_attr(not(test), no_std)]

pub mod mm;

pub use mm::heap::{Heap, HeapError, HeapPtr, HeapStats};

use spin::Mutex;

/// Kernel heap capacity in bytes.
pub const KERNEL_HEAP_SIZE: usize = 1024 * 1024;

/// Process-wide kernel heap. Locked for every operation.
pub static KERNEL_HEAP: Mutex<Heap<KERNEL_HEAP_SIZE>> = Mutex::new(Heap::new());

/// Initialize the kernel heap.
///
/// Must run once during kernel bring-up, before the first [`kmalloc`].
pub fn init() {
    KERNEL_HEAP.lock().init();
}

/// Allocate `size` bytes from the kernel heap.
pub fn kmalloc(size: usize) -> Result<HeapPtr, HeapError> {
    KERNEL_HEAP.lock().alloc(size)
}

/// Release a kernel heap allocation.
pub fn kfree(ptr: HeapPtr) {
    KERNEL_HEAP.lock().free(ptr);
}

/// Snapshot of the kernel heap counters.
pub fn kheap_stats() -> HeapStats {
    KERNEL_HEAP.lock().stats()
}
