//! Fixed-arena free-list heap allocator.
//!
//! The arena is a single contiguous byte buffer owned by the [`Heap`] value.
//! Every block in it, free or allocated, starts with a small header, and the
//! headers form a singly linked chain in address order covering the whole
//! arena. Allocation is a first-fit scan with block splitting; deallocation
//! marks the block free and runs a full coalescing pass so no two
//! address-adjacent free blocks survive.
//!
//! ## Design
//!
//! - One chain for the whole directory: the list holds every block, not just
//!   the free ones, and the allocation scan filters by the free flag.
//! - Headers live inside the arena but are only touched through bounds-checked
//!   load/store of a header descriptor. Callers hold opaque [`HeapPtr`]
//!   handles and reach payload bytes through [`Heap::payload`] and
//!   [`Heap::payload_mut`]; the header bytes in front of a payload are never
//!   reachable through a handle.
//! - First-fit with no compaction: a request can fail with
//!   [`HeapError::OutOfMemory`] even when the summed free bytes would cover
//!   it, once free space is fragmented across blocks that are each too small.
//! - No double-free or overwrite detection. Freeing an already-free block is
//!   harmless; a handle that [`Heap::alloc`] never returned corrupts the
//!   directory.

use core::fmt;

/// Payload alignment in bytes. Every payload offset handed out is a multiple
/// of this.
pub const ALIGNMENT: usize = 8;

/// Bytes of per-block metadata in front of each payload.
pub const HEADER_SIZE: usize = BlockHeader::SIZE;

/// Minimum leftover payload bytes that justify splitting a free block instead
/// of handing the whole thing out.
pub const SPLIT_SLACK: usize = 16;

/// Sentinel in the encoded next word marking the last block.
const NO_NEXT: u64 = u64::MAX;

/// Free bit in the encoded flags word.
const FLAG_FREE: u64 = 1;

/// Heap allocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// No free block is large enough for the request. Possible even when the
    /// summed free bytes exceed the request, once free space is fragmented.
    OutOfMemory,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::OutOfMemory => write!(f, "Out of memory"),
        }
    }
}

/// Opaque handle to an allocated payload.
///
/// Wraps the payload's arena offset. A handle is only meaningful to the heap
/// that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapPtr(usize);

impl HeapPtr {
    /// The null handle. Returned for zero-size requests and ignored by
    /// [`Heap::free`]. Offset 0 always holds a header, never a payload, so no
    /// real allocation can collide with it.
    pub const NULL: HeapPtr = HeapPtr(0);

    /// Whether this is the null handle.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Point-in-time heap counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Arena capacity in bytes.
    pub total: usize,

    /// Bytes in allocated blocks, headers included.
    pub used: usize,

    /// Bytes in free blocks, headers included. Header bytes of free blocks
    /// count as free capacity: they can host the headers of future blocks.
    pub free: usize,
}

/// One directory entry reported by [`Heap::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Arena offset of the block's header.
    pub offset: usize,

    /// Total block bytes, header included.
    pub size: usize,

    /// Whether the block is free.
    pub is_free: bool,
}

/// Per-block metadata, encoded in the arena at the block's start as three
/// little-endian u64 words: size, next, flags.
#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    /// Total block bytes, header included. Always a multiple of [`ALIGNMENT`].
    size: usize,

    /// Whether the block is available for allocation.
    is_free: bool,

    /// Arena offset of the next block in address order, `None` for the last.
    next: Option<usize>,
}

impl BlockHeader {
    /// Encoded size in arena bytes.
    const SIZE: usize = 24;

    /// Decode the header stored at `at`.
    ///
    /// # Panics
    /// Panics if `at + HEADER_SIZE` exceeds the arena.
    fn load(arena: &[u8], at: usize) -> Self {
        BlockHeader {
            size: load_word(arena, at) as usize,
            next: match load_word(arena, at + 8) {
                NO_NEXT => None,
                offset => Some(offset as usize),
            },
            is_free: load_word(arena, at + 16) & FLAG_FREE != 0,
        }
    }

    /// Encode the header into the arena at `at`.
    ///
    /// # Panics
    /// Panics if `at + HEADER_SIZE` exceeds the arena.
    fn store(&self, arena: &mut [u8], at: usize) {
        let next = match self.next {
            Some(offset) => offset as u64,
            None => NO_NEXT,
        };
        store_word(arena, at, self.size as u64);
        store_word(arena, at + 8, next);
        store_word(arena, at + 16, if self.is_free { FLAG_FREE } else { 0 });
    }
}

fn load_word(arena: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&arena[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn store_word(arena: &mut [u8], at: usize, word: u64) {
    arena[at..at + 8].copy_from_slice(&word.to_le_bytes());
}

/// Fixed-arena heap with capacity `N` bytes.
///
/// Construction is two-phase: [`Heap::new`] is `const` so the kernel instance
/// can live in a `static`, and [`Heap::init`] installs the initial spanning
/// free block during bring-up. Independent heaps are plain values, so tests
/// run against small private arenas.
///
/// The arena is 8-aligned so payload offsets translate into 8-aligned
/// addresses.
#[repr(C, align(8))]
pub struct Heap<const N: usize> {
    arena: [u8; N],
    initialized: bool,
}

impl<const N: usize> Heap<N> {
    /// Create a heap. [`Heap::init`] must run before the first allocation.
    pub const fn new() -> Self {
        const {
            assert!(N % ALIGNMENT == 0, "capacity must be a multiple of ALIGNMENT");
            assert!(N >= HEADER_SIZE + ALIGNMENT, "capacity too small for one block");
        }
        Heap {
            arena: [0; N],
            initialized: false,
        }
    }

    /// Install the single spanning free block, making the heap ready for use.
    ///
    /// Calling this on a live heap reinitializes it: every outstanding
    /// allocation is discarded and the whole arena becomes one free block
    /// again.
    pub fn init(&mut self) {
        BlockHeader {
            size: N,
            is_free: true,
            next: None,
        }
        .store(&mut self.arena, 0);
        self.initialized = true;
    }

    /// Allocate `size` payload bytes.
    ///
    /// Returns [`HeapPtr::NULL`] for a zero-size request. The payload is
    /// aligned to [`ALIGNMENT`] and at least `size` bytes long; it can be
    /// longer when the selected block was too small to split.
    ///
    /// The scan is first-fit from the arena base and there is no compaction,
    /// so the request can fail with [`HeapError::OutOfMemory`] even when
    /// enough free bytes exist in aggregate.
    pub fn alloc(&mut self, size: usize) -> Result<HeapPtr, HeapError> {
        debug_assert!(self.initialized, "Heap::alloc before Heap::init");

        if size == 0 {
            return Ok(HeapPtr::NULL);
        }

        // Total block size: header plus payload, rounded up to the alignment
        // unit. Requests that overflow the addition report OutOfMemory.
        let aligned_size = size
            .checked_add(HEADER_SIZE + ALIGNMENT - 1)
            .map(|bytes| bytes & !(ALIGNMENT - 1))
            .ok_or(HeapError::OutOfMemory)?;

        let offset = self
            .find_free_block(aligned_size)
            .ok_or(HeapError::OutOfMemory)?;
        self.split_block(offset, aligned_size);

        let mut header = BlockHeader::load(&self.arena, offset);
        header.is_free = false;
        header.store(&mut self.arena, offset);

        Ok(HeapPtr(offset + HEADER_SIZE))
    }

    /// Release an allocation.
    ///
    /// The null handle is ignored. After the block is marked free, a full
    /// coalescing pass merges every run of address-adjacent free blocks, so
    /// the directory never keeps two free neighbors.
    ///
    /// There is no double-free detection: freeing a handle twice without an
    /// intervening allocation is harmless, but a handle that [`Heap::alloc`]
    /// never returned corrupts the directory.
    ///
    /// # Panics
    /// Panics if the handle's offset lies outside the arena.
    pub fn free(&mut self, ptr: HeapPtr) {
        debug_assert!(self.initialized, "Heap::free before Heap::init");

        if ptr.is_null() {
            return;
        }

        // The header sits immediately in front of the payload.
        let offset = ptr.0 - HEADER_SIZE;
        let mut header = BlockHeader::load(&self.arena, offset);
        header.is_free = true;
        header.store(&mut self.arena, offset);

        self.merge_free_blocks();
    }

    /// Arena capacity in bytes.
    pub fn total(&self) -> usize {
        N
    }

    /// Bytes in allocated blocks, headers included.
    pub fn used(&self) -> usize {
        N - self.free_bytes()
    }

    /// Bytes in free blocks, headers included.
    pub fn free_bytes(&self) -> usize {
        self.blocks()
            .filter(|block| block.is_free)
            .map(|block| block.size)
            .sum()
    }

    /// Snapshot of the total/used/free counters.
    ///
    /// Derived from the block directory on every call, so the counters cannot
    /// drift from the chain.
    pub fn stats(&self) -> HeapStats {
        let free = self.free_bytes();
        HeapStats {
            total: N,
            used: N - free,
            free,
        }
    }

    /// Iterate the block directory in address order.
    ///
    /// The walk is lazy and read-only: collecting it twice yields the same
    /// entries, and it is safe to run between any two heap operations. An
    /// uninitialized heap reports an empty directory.
    pub fn blocks(&self) -> Blocks<'_, N> {
        Blocks {
            heap: self,
            cursor: if self.initialized { Some(0) } else { None },
        }
    }

    /// Usable bytes of an allocation: the block size minus [`HEADER_SIZE`],
    /// which can exceed the requested size when splitting was skipped.
    ///
    /// The null handle yields an empty slice.
    ///
    /// # Panics
    /// Panics if the handle's offset lies outside the arena.
    pub fn payload(&self, ptr: HeapPtr) -> &[u8] {
        if ptr.is_null() {
            return &[];
        }
        let header = BlockHeader::load(&self.arena, ptr.0 - HEADER_SIZE);
        &self.arena[ptr.0..ptr.0 - HEADER_SIZE + header.size]
    }

    /// Mutable access to an allocation's usable bytes.
    ///
    /// # Panics
    /// Panics if the handle's offset lies outside the arena.
    pub fn payload_mut(&mut self, ptr: HeapPtr) -> &mut [u8] {
        if ptr.is_null() {
            return &mut [];
        }
        let header = BlockHeader::load(&self.arena, ptr.0 - HEADER_SIZE);
        &mut self.arena[ptr.0..ptr.0 - HEADER_SIZE + header.size]
    }

    /// First-fit scan: offset of the first free block with at least `wanted`
    /// bytes.
    fn find_free_block(&self, wanted: usize) -> Option<usize> {
        let mut cursor = Some(0);
        while let Some(offset) = cursor {
            let header = BlockHeader::load(&self.arena, offset);
            if header.is_free && header.size >= wanted {
                return Some(offset);
            }
            cursor = header.next;
        }
        None
    }

    /// Carve the tail of the block at `offset` into a new free block spliced
    /// in right after it, if the leftover is big enough to be worth tracking.
    fn split_block(&mut self, offset: usize, wanted: usize) {
        let mut header = BlockHeader::load(&self.arena, offset);

        // The leftover must hold its own header plus SPLIT_SLACK payload
        // bytes. Below that the whole block is handed out and the extra bytes
        // sit unused inside it (internal fragmentation).
        if header.size < wanted + HEADER_SIZE + SPLIT_SLACK {
            return;
        }

        let tail_offset = offset + wanted;
        BlockHeader {
            size: header.size - wanted,
            is_free: true,
            next: header.next,
        }
        .store(&mut self.arena, tail_offset);

        header.size = wanted;
        header.next = Some(tail_offset);
        header.store(&mut self.arena, offset);
    }

    /// Coalescing pass: walk the chain pairwise and merge both-free
    /// neighbors, re-testing in place so a run of adjacent free blocks
    /// collapses into one.
    fn merge_free_blocks(&mut self) {
        let mut offset = 0;
        loop {
            let mut header = BlockHeader::load(&self.arena, offset);
            let Some(next_offset) = header.next else {
                break;
            };
            let next = BlockHeader::load(&self.arena, next_offset);
            if header.is_free && next.is_free {
                header.size += next.size;
                header.next = next.next;
                header.store(&mut self.arena, offset);
                // Stay on this block: the new neighbor may be free too.
            } else {
                offset = next_offset;
            }
        }
    }
}

impl<const N: usize> Default for Heap<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Address-ordered walk over the block directory. Created by [`Heap::blocks`].
pub struct Blocks<'a, const N: usize> {
    heap: &'a Heap<N>,
    cursor: Option<usize>,
}

impl<const N: usize> Iterator for Blocks<'_, N> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let offset = self.cursor?;
        let header = BlockHeader::load(&self.heap.arena, offset);
        self.cursor = header.next;
        Some(BlockInfo {
            offset,
            size: header.size,
            is_free: header.is_free,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_1k() -> Heap<1024> {
        let mut heap = Heap::new();
        heap.init();
        heap
    }

    fn size_sum(heap: &Heap<1024>) -> usize {
        heap.blocks().map(|block| block.size).sum()
    }

    #[test]
    fn init_installs_single_spanning_block() {
        let heap = heap_1k();
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[0].size, 1024);
        assert!(blocks[0].is_free);
    }

    #[test]
    fn uninitialized_heap_has_empty_directory() {
        let heap = Heap::<1024>::new();
        assert_eq!(heap.blocks().count(), 0);
    }

    #[test]
    fn zero_size_alloc_is_null() {
        let mut heap = heap_1k();
        let ptr = heap.alloc(0).unwrap();
        assert!(ptr.is_null());
        assert_eq!(heap.stats().used, 0);

        // Freeing the null handle is a no-op.
        heap.free(ptr);
        assert_eq!(heap.blocks().count(), 1);
    }

    #[test]
    fn payloads_are_aligned() {
        let mut heap = heap_1k();
        for size in [1, 7, 8, 13, 64, 100] {
            let ptr = heap.alloc(size).unwrap();
            assert_eq!(ptr.0 % ALIGNMENT, 0);
            assert_eq!(heap.payload(ptr).as_ptr() as usize % ALIGNMENT, 0);
        }
    }

    #[test]
    fn oversized_block_splits_off_free_tail() {
        let mut heap = heap_1k();
        let _ptr = heap.alloc(100).unwrap();

        // 100 bytes round up to a 128-byte block; the rest of the arena
        // becomes the free tail.
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].size, 128);
        assert!(!blocks[0].is_free);
        assert_eq!(blocks[1].offset, 128);
        assert_eq!(blocks[1].size, 896);
        assert!(blocks[1].is_free);
    }

    #[test]
    fn small_leftover_skips_split() {
        let mut heap = heap_1k();
        // First allocation leaves a 64-byte free tail.
        let _big = heap.alloc(936).unwrap();

        // A 24-byte request wants 48 bytes; the 64-byte tail fits but the
        // 16-byte leftover cannot host a header, so the whole block is handed
        // out.
        let small = heap.alloc(24).unwrap();
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].size, 64);
        assert!(!blocks[1].is_free);
        assert_eq!(heap.payload(small).len(), 64 - HEADER_SIZE);
    }

    #[test]
    fn round_trip_restores_single_free_block() {
        let mut heap = heap_1k();
        let a = heap.alloc(100).unwrap();
        let b = heap.alloc(64).unwrap();
        let c = heap.alloc(32).unwrap();
        heap.free(b);
        heap.free(a);
        heap.free(c);

        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, 1024);
        assert!(blocks[0].is_free);
        assert_eq!(
            heap.stats(),
            HeapStats {
                total: 1024,
                used: 0,
                free: 1024
            }
        );
    }

    #[test]
    fn reverse_order_frees_coalesce_fully() {
        let mut heap = heap_1k();
        let ptrs: Vec<_> = (0..5).map(|_| heap.alloc(64).unwrap()).collect();

        for ptr in ptrs.into_iter().rev() {
            heap.free(ptr);
            // No two adjacent free blocks survive a free.
            let blocks: Vec<_> = heap.blocks().collect();
            for pair in blocks.windows(2) {
                assert!(!(pair[0].is_free && pair[1].is_free));
            }
        }

        assert_eq!(heap.blocks().count(), 1);
        assert_eq!(heap.free_bytes(), 1024);
    }

    #[test]
    fn fragmentation_fails_despite_sufficient_free_total() {
        let mut heap = heap_1k();

        // Fill the arena with sixteen 64-byte blocks, then free every other
        // one. Half the arena is free but no free block exceeds 64 bytes.
        let ptrs: Vec<_> = (0..16).map(|_| heap.alloc(40).unwrap()).collect();
        for ptr in ptrs.iter().step_by(2) {
            heap.free(*ptr);
        }

        let stats = heap.stats();
        assert_eq!(stats.free, 512);
        assert_eq!(heap.alloc(100), Err(HeapError::OutOfMemory));
    }

    #[test]
    fn first_fit_reuses_freed_block() {
        let mut heap = heap_1k();
        let p1 = heap.alloc(64).unwrap();
        heap.free(p1);
        let p2 = heap.alloc(64).unwrap();
        assert_eq!(p2, p1);
    }

    #[test]
    fn oversized_request_fails_and_free_restores_arena() {
        let mut heap = heap_1k();
        let ptr = heap.alloc(100).unwrap();
        assert_eq!(heap.alloc(2000), Err(HeapError::OutOfMemory));

        heap.free(ptr);
        let stats = heap.stats();
        assert_eq!(stats.free, stats.total);
        assert_eq!(heap.blocks().count(), 1);
    }

    #[test]
    fn block_sizes_always_sum_to_capacity() {
        let mut heap = heap_1k();
        assert_eq!(size_sum(&heap), 1024);

        let a = heap.alloc(10).unwrap();
        assert_eq!(size_sum(&heap), 1024);
        let b = heap.alloc(200).unwrap();
        assert_eq!(size_sum(&heap), 1024);
        heap.free(a);
        assert_eq!(size_sum(&heap), 1024);
        let c = heap.alloc(8).unwrap();
        assert_eq!(size_sum(&heap), 1024);
        heap.free(b);
        heap.free(c);
        assert_eq!(size_sum(&heap), 1024);
    }

    #[test]
    fn walk_is_restartable_and_read_only() {
        let mut heap = heap_1k();
        let _a = heap.alloc(64).unwrap();
        let first: Vec<_> = heap.blocks().collect();
        let second: Vec<_> = heap.blocks().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn payload_bytes_are_writable_and_stable() {
        let mut heap = heap_1k();
        let a = heap.alloc(16).unwrap();
        let b = heap.alloc(16).unwrap();

        heap.payload_mut(a).fill(0xAA);
        heap.payload_mut(b).fill(0x55);

        assert_eq!(heap.payload(a).len(), 16);
        assert!(heap.payload(a).iter().all(|&byte| byte == 0xAA));
        assert!(heap.payload(b).iter().all(|&byte| byte == 0x55));
    }

    #[test]
    fn reinit_discards_outstanding_allocations() {
        let mut heap = heap_1k();
        let _a = heap.alloc(100).unwrap();
        let _b = heap.alloc(100).unwrap();
        heap.init();

        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_free);
        assert_eq!(blocks[0].size, 1024);
    }

    #[test]
    fn out_of_memory_displays_cleanly() {
        assert_eq!(format!("{}", HeapError::OutOfMemory), "Out of memory");
    }
}
