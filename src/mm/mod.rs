//! Memory Management subsystem
//!
//! Provides the kernel heap, a fixed-arena free-list allocator, plus the
//! textual diagnostics consumed by the shell's `meminfo` command.

pub mod heap;
pub mod meminfo;

// Re-export for convenience
pub use heap::*;
