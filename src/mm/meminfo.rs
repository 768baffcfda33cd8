//! Textual heap diagnostics.
//!
//! Renders the heap counters and the block directory into any
//! [`core::fmt::Write`] sink. The shell's `meminfo` command feeds this
//! straight to the UART writer; tests feed it a `String`. The allocator
//! itself performs no I/O.

use core::fmt::{self, Write};

use super::heap::Heap;

/// Write the memory report: total/used/free counters followed by one line
/// per block in address order.
pub fn write_report<W: Write, const N: usize>(heap: &Heap<N>, out: &mut W) -> fmt::Result {
    let stats = heap.stats();
    writeln!(out, "Heap statistics:")?;
    writeln!(out, "  Total: {} bytes", stats.total)?;
    writeln!(out, "  Used:  {} bytes", stats.used)?;
    writeln!(out, "  Free:  {} bytes", stats.free)?;
    writeln!(out, "Blocks:")?;
    for (index, block) in heap.blocks().enumerate() {
        writeln!(
            out,
            "  Block {}: offset={:#x}, size={}, free={}",
            index, block.offset, block.size, block.is_free as u8
        )?;
    }
    Ok(())
}
