//! Block/fragment allocator backing every shared memory pool.
//!
//! The classic BSD `malloc` scheme: memory is carved into 4 KiB blocks,
//! requests above half a block take a run of whole blocks tracked in a
//! per-block info table, smaller requests take a power-of-two fragment of
//! a dedicated block. Free runs form a circular doubly linked list through
//! the info table with entry 0 as sentinel; free fragments form per-size
//! doubly linked lists threaded through the fragments themselves.
//!
//! Everything lives inside the pool segment and is addressed by byte
//! offset or block index, so any process mapping the segment sees the
//! same heap. The caller must hold the pool skirmish around every call.

use tracing::warn;

use crate::shm::segment::Segment;

/// Base-two log of the block size.
pub const BLOCKLOG: u32 = 12;
/// Allocation granularity for large requests.
pub const BLOCKSIZE: u32 = 1 << BLOCKLOG;
/// Contiguous free blocks allowed to build up at the end of the heap
/// before the break is pulled back.
const FINAL_FREE_BLOCKS: u32 = 8;

const HEAP_MAGIC: u32 = 0x4653_4850; // "FSHP"

/// A node of a fragment free list, stored inside the free fragment itself.
#[repr(C)]
struct FragNode {
    /// Offset of the next free fragment, 0 = end of list.
    next: u32,
    /// Offset of the previous free fragment, 0 = list head.
    prev: u32,
}

const MIN_FRAGMENT: usize = std::mem::size_of::<FragNode>();

/// Per-block bookkeeping entry. One of three roles, distinguished by how
/// the block is currently used:
///
/// * busy run of whole blocks: `tag` = 0, `link` = run length;
/// * busy fragmented block: `tag` = fragment log, `link` = free fragments
///   in the block, `back` = index of its first free fragment;
/// * member of the free list: `tag` = run length, `link` = next free run,
///   `back` = previous free run.
#[repr(C)]
#[derive(Clone, Copy)]
struct BlockInfo {
    tag: u32,
    link: u32,
    back: u32,
}

/// Shared heap state, embedded in the pool header.
#[repr(C)]
pub(crate) struct HeapHeader {
    magic: u32,
    /// Number of entries in the info table.
    heapsize: u32,
    /// Search index: block number to begin searching the free list at.
    heapindex: u32,
    /// First invalid block number beyond the current break, 0 before the
    /// first core request.
    heaplimit: u32,
    /// Bytes of the heap area in use (the break, relative to `heap_base`).
    brk: u32,
    /// Segment offset of block 1. Multiple of `BLOCKSIZE`.
    heap_base: u32,
    /// Segment offset of the info table.
    info_off: u32,
    /// Segment offset one past the last usable heap byte.
    heap_end: u32,
    /// Number of blocks currently fragmented at each size.
    fragblocks: [u32; BLOCKLOG as usize],
    /// Offset of the first free fragment of each size, 0 = none.
    fraghead: [u32; BLOCKLOG as usize],
    chunks_used: u32,
    chunks_free: u32,
    bytes_used: u64,
    bytes_free: u64,
}

/// Allocation statistics, maintained exactly (not sampled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Live allocations.
    pub chunks_used: u32,
    /// Free chunks (runs and fragments) available for reuse.
    pub chunks_free: u32,
    /// Bytes handed out, rounded to the allocation granularity.
    pub bytes_used: u64,
    /// Bytes available for reuse without growing the heap.
    pub bytes_free: u64,
}

/// Process-local view of a shared heap. Cheap to construct; all methods
/// require the caller to hold the owning pool's skirmish.
pub(crate) struct Heap<'a> {
    seg: &'a Segment,
    hdr: *mut HeapHeader,
    info: *mut BlockInfo,
    heap_base: u32,
    heap_end: u32,
    heapsize: u32,
    madv_remove: bool,
}

impl<'a> Heap<'a> {
    /// Computes where the info table and the heap data start, given the
    /// offset where pool metadata ends and the pool's total size.
    ///
    /// Returns `(info_off, heap_base)`. The info table is sized for the
    /// whole pool up front so it never has to grow.
    pub fn layout(meta_end: u32, max_size: u32) -> Option<(u32, u32)> {
        let info_off = (meta_end + 7) & !7;
        let entries = max_size / BLOCKSIZE + 1;
        let table_end = info_off.checked_add(entries.checked_mul(12)?)?;
        let heap_base = (table_end + BLOCKSIZE - 1) & !(BLOCKSIZE - 1);
        if heap_base.checked_add(BLOCKSIZE)? > max_size {
            return None;
        }
        Some((info_off, heap_base))
    }

    /// Initializes a fresh heap inside `seg`. The segment must be zeroed
    /// (fresh from `ftruncate`), `hdr_off` 8-aligned and `heap_base` a
    /// multiple of `BLOCKSIZE`.
    ///
    /// # Safety
    ///
    /// `hdr_off`, `info_off` and `heap_base` must describe disjoint,
    /// in-bounds regions of `seg` as produced by [`Heap::layout`].
    pub unsafe fn init(seg: &Segment, hdr_off: u32, info_off: u32, heap_base: u32, heap_end: u32) {
        // SAFETY: caller guarantees bounds and alignment.
        let hdr = unsafe { &mut *seg.at::<HeapHeader>(hdr_off) };
        hdr.magic = HEAP_MAGIC;
        hdr.heapsize = heap_end / BLOCKSIZE + 1;
        hdr.heapindex = 0;
        hdr.heaplimit = 0;
        hdr.brk = 0;
        hdr.heap_base = heap_base;
        hdr.info_off = info_off;
        hdr.heap_end = heap_end;
        // Info table and fragment heads are already zero: entry 0 doubles
        // as the circular free list sentinel (size 0, next/prev = itself).
    }

    /// Builds a view of an initialized heap.
    ///
    /// # Safety
    ///
    /// `hdr_off` must point at a `HeapHeader` previously set up by
    /// [`Heap::init`] inside this segment.
    pub unsafe fn attach(seg: &'a Segment, hdr_off: u32, madv_remove: bool) -> Option<Self> {
        // SAFETY: caller guarantees hdr_off points at a heap header.
        let hdr = unsafe { seg.at::<HeapHeader>(hdr_off) };
        let (magic, info_off, heap_base, heap_end, heapsize) = unsafe {
            (
                (*hdr).magic,
                (*hdr).info_off,
                (*hdr).heap_base,
                (*hdr).heap_end,
                (*hdr).heapsize,
            )
        };
        if magic != HEAP_MAGIC {
            return None;
        }
        // SAFETY: info_off was validated at init time.
        let info = unsafe { seg.at::<BlockInfo>(info_off) };
        Some(Heap {
            seg,
            hdr,
            info,
            heap_base,
            heap_end,
            heapsize,
            madv_remove,
        })
    }

    /// Current statistics.
    pub fn stats(&self) -> HeapStats {
        // SAFETY: hdr is valid for the lifetime of the view.
        let h = unsafe { &*self.hdr };
        HeapStats {
            chunks_used: h.chunks_used,
            chunks_free: h.chunks_free,
            bytes_used: h.bytes_used,
            bytes_free: h.bytes_free,
        }
    }

    #[inline]
    fn address(&self, block: u32) -> u32 {
        self.heap_base + (block - 1) * BLOCKSIZE
    }

    #[inline]
    fn block_of(&self, off: u32) -> u32 {
        (off - self.heap_base) / BLOCKSIZE + 1
    }

    #[inline]
    fn blockify(size: usize) -> u32 {
        ((size + BLOCKSIZE as usize - 1) / BLOCKSIZE as usize) as u32
    }

    #[inline]
    fn info(&self, block: u32) -> *mut BlockInfo {
        debug_assert!(block < self.heapsize);
        // SAFETY: the table has heapsize entries; block indices never
        // exceed heaplimit which is bounded by heapsize.
        unsafe { self.info.add(block as usize) }
    }

    #[inline]
    fn frag(&self, off: u32) -> *mut FragNode {
        // SAFETY: fragment offsets always point into the heap data area.
        unsafe { self.seg.at::<FragNode>(off) }
    }

    #[inline]
    fn free_size(&self, block: u32) -> u32 {
        unsafe { (*self.info(block)).tag }
    }

    #[inline]
    fn free_next(&self, block: u32) -> u32 {
        unsafe { (*self.info(block)).link }
    }

    #[inline]
    fn free_prev(&self, block: u32) -> u32 {
        unsafe { (*self.info(block)).back }
    }

    /// Moves the break, returning the break position before a grow (sbrk
    /// semantics) or the current break when `incr` is 0. `None` when the
    /// pool size limit would be exceeded.
    fn sbrk(&self, h: &mut HeapHeader, incr: i64) -> Option<u32> {
        if incr != 0 {
            let new = h.brk as i64 + incr;
            if new < 0 || h.heap_base as i64 + new > self.heap_end as i64 {
                warn!(
                    limit = self.heap_end,
                    chunks_used = h.chunks_used,
                    bytes_used = h.bytes_used,
                    bytes_free = h.bytes_free,
                    "maximum shared memory size exceeded"
                );
                return None;
            }
            h.brk = new as u32;
        }
        Some((h.heap_base as i64 + h.brk as i64 - incr) as u32)
    }

    /// Block-aligned core request.
    fn core_align(&self, h: &mut HeapHeader, size: usize) -> Option<u32> {
        let result = self.sbrk(h, size as i64)?;
        let adj = result % BLOCKSIZE;
        if adj != 0 {
            let pad = BLOCKSIZE - adj;
            self.sbrk(h, pad as i64)?;
            return Some(result + pad);
        }
        Some(result)
    }

    /// Gets aligned core and advances the heap limit. The info table is
    /// pre-sized for the whole pool, so it never grows here.
    fn morecore(&self, h: &mut HeapHeader, size: usize) -> Option<u32> {
        let result = self.core_align(h, size)?;
        let limit = self.block_of(result + size as u32);
        if limit > self.heapsize {
            let _ = self.sbrk(h, -(size as i64));
            return None;
        }
        h.heaplimit = limit;
        Some(result)
    }

    /// Allocates `size` bytes, returning the segment offset. `None` means
    /// the pool is out of memory.
    pub fn allocate(&mut self, size: usize) -> Option<u32> {
        // SAFETY: exclusive access under the pool skirmish.
        let h = unsafe { &mut *self.hdr };
        self.alloc_inner(h, size)
    }

    fn alloc_inner(&self, h: &mut HeapHeader, size: usize) -> Option<u32> {
        debug_assert!(size > 0);
        let size = size.max(MIN_FRAGMENT);

        if size <= BLOCKSIZE as usize / 2 {
            // Fragment allocation: log2 of the fragment size.
            let mut log = 1u32;
            let mut s = size - 1;
            loop {
                s /= 2;
                if s == 0 {
                    break;
                }
                log += 1;
            }

            let head = h.fraghead[log as usize];
            if head != 0 {
                // Pop the first free fragment of this size.
                let result = head;
                let next = unsafe { (*self.frag(result)).next };
                h.fraghead[log as usize] = next;
                if next != 0 {
                    unsafe { (*self.frag(next)).prev = 0 };
                }

                let block = self.block_of(result);
                let info = self.info(block);
                unsafe {
                    (*info).link -= 1;
                    if (*info).link != 0 {
                        (*info).back = (next % BLOCKSIZE) >> log;
                    }
                }

                h.chunks_used += 1;
                h.bytes_used += 1 << log;
                h.chunks_free -= 1;
                h.bytes_free -= 1 << log;
                Some(result)
            } else {
                // No free fragment: break a fresh block into fragments and
                // hand out the first.
                let result = self.alloc_inner(h, BLOCKSIZE as usize)?;
                h.fragblocks[log as usize] += 1;

                let frags = BLOCKSIZE >> log;
                for i in 1..frags {
                    let off = result + (i << log);
                    let node = self.frag(off);
                    unsafe {
                        (*node).next = h.fraghead[log as usize];
                        (*node).prev = 0;
                        if (*node).next != 0 {
                            (*self.frag((*node).next)).prev = off;
                        }
                    }
                    h.fraghead[log as usize] = off;
                }

                let block = self.block_of(result);
                let info = self.info(block);
                unsafe {
                    (*info).tag = log;
                    (*info).link = frags - 1;
                    (*info).back = frags - 1;
                }

                h.chunks_free += frags - 1;
                h.bytes_free += (BLOCKSIZE as u64) - (1 << log);
                h.bytes_used -= (BLOCKSIZE as u64) - (1 << log);
                Some(result)
            }
        } else {
            // Whole-block allocation: first fit, searching the circular
            // free list from where the last search left off.
            let blocks = Self::blockify(size);
            let start = h.heapindex;
            let mut block = start;
            loop {
                if self.free_size(block) >= blocks {
                    break;
                }
                let next = self.free_next(block);
                if next != start {
                    block = next;
                    continue;
                }

                // Wrapped around. If the final free run ends at the break,
                // extend it in place instead of requesting the full size.
                let last = self.free_prev(0);
                let lastblocks = self.free_size(last);
                if h.heaplimit != 0
                    && last + lastblocks == h.heaplimit
                    && self.sbrk(h, 0) == Some(self.address(last + lastblocks))
                    && self
                        .morecore(h, ((blocks - lastblocks) * BLOCKSIZE) as usize)
                        .is_some()
                {
                    let last = self.free_prev(0);
                    unsafe { (*self.info(last)).tag += blocks - lastblocks };
                    h.bytes_free += (blocks - lastblocks) as u64 * BLOCKSIZE as u64;
                    block = last;
                    break;
                }

                let result = self.morecore(h, (blocks * BLOCKSIZE) as usize)?;
                let b = self.block_of(result);
                let info = self.info(b);
                unsafe {
                    (*info).tag = 0;
                    (*info).link = blocks;
                }
                h.chunks_used += 1;
                h.bytes_used += blocks as u64 * BLOCKSIZE as u64;
                return Some(result);
            }

            // Take what we need off the front of the run we found.
            let result = self.address(block);
            let run = self.free_size(block);
            let next = self.free_next(block);
            let prev = self.free_prev(block);
            if run > blocks {
                let tail = block + blocks;
                let ti = self.info(tail);
                unsafe {
                    (*ti).tag = run - blocks;
                    (*ti).link = next;
                    (*ti).back = prev;
                    (*self.info(next)).back = tail;
                    (*self.info(prev)).link = tail;
                }
                h.heapindex = tail;
            } else {
                unsafe {
                    (*self.info(next)).back = prev;
                    (*self.info(prev)).link = next;
                }
                h.heapindex = next;
                h.chunks_free -= 1;
            }

            let info = self.info(block);
            unsafe {
                (*info).tag = 0;
                (*info).link = blocks;
            }
            h.chunks_used += 1;
            h.bytes_used += blocks as u64 * BLOCKSIZE as u64;
            h.bytes_free -= blocks as u64 * BLOCKSIZE as u64;
            Some(result)
        }
    }

    /// Resizes the allocation at `off`. Content up to the lesser of the
    /// old and new size is preserved; the allocation may move.
    pub fn reallocate(&mut self, off: u32, size: usize) -> Option<u32> {
        // SAFETY: exclusive access under the pool skirmish.
        let h = unsafe { &mut *self.hdr };
        self.realloc_inner(h, off, size)
    }

    fn realloc_inner(&self, h: &mut HeapHeader, off: u32, size: usize) -> Option<u32> {
        debug_assert!(off != 0 && size > 0);

        let block = self.block_of(off);
        let typ = unsafe { (*self.info(block)).tag };

        if typ == 0 {
            // Maybe shrink a block run down to a fragment.
            if size <= BLOCKSIZE as usize / 2 {
                if let Some(result) = self.alloc_inner(h, size) {
                    unsafe { self.copy(off, result, size) };
                    self.free_inner(h, off);
                    return Some(result);
                }
            }

            let blocks = Self::blockify(size);
            let old = unsafe { (*self.info(block)).link };
            if blocks < old {
                // Return the excess to the free list.
                let tail = self.info(block + blocks);
                unsafe {
                    (*tail).tag = 0;
                    (*tail).link = old - blocks;
                    (*self.info(block)).link = blocks;
                }
                self.free_inner(h, self.address(block + blocks));
                Some(off)
            } else if blocks == old {
                Some(off)
            } else {
                // Free first so adjacent space can be reused in place,
                // shielding the run from the end trim meanwhile.
                let oldlimit = h.heaplimit;
                h.heaplimit = 0;
                self.free_inner(h, off);
                h.heaplimit = oldlimit;
                match self.alloc_inner(h, size) {
                    Some(result) => {
                        if result != off {
                            unsafe {
                                self.copy_overlapping(off, result, (old * BLOCKSIZE) as usize)
                            };
                        }
                        Some(result)
                    }
                    None => {
                        // Un-free the run we just freed; it may have been
                        // coalesced with a preceding free run.
                        if h.heapindex == block {
                            let _ = self.alloc_inner(h, (old * BLOCKSIZE) as usize);
                        } else {
                            let previous =
                                self.alloc_inner(h, ((block - h.heapindex) * BLOCKSIZE) as usize);
                            let _ = self.alloc_inner(h, (old * BLOCKSIZE) as usize);
                            if let Some(previous) = previous {
                                self.free_inner(h, previous);
                            }
                        }
                        None
                    }
                }
            }
        } else {
            // Old allocation is a fragment of size 2^typ.
            if size > (1usize << (typ - 1)) && size <= (1usize << typ) {
                Some(off)
            } else {
                let result = self.alloc_inner(h, size)?;
                unsafe { self.copy(off, result, size.min(1 << typ)) };
                self.free_inner(h, off);
                Some(result)
            }
        }
    }

    /// Frees the allocation at `off`. Freeing offset 0 is a no-op.
    pub fn deallocate(&mut self, off: u32) {
        if off == 0 {
            return;
        }
        // SAFETY: exclusive access under the pool skirmish.
        let h = unsafe { &mut *self.hdr };
        self.free_inner(h, off);
    }

    fn free_inner(&self, h: &mut HeapHeader, off: u32) {
        let block = self.block_of(off);
        let typ = unsafe { (*self.info(block)).tag };

        if typ == 0 {
            let size = unsafe { (*self.info(block)).link };
            h.chunks_used -= 1;
            h.bytes_used -= size as u64 * BLOCKSIZE as u64;
            h.bytes_free += size as u64 * BLOCKSIZE as u64;

            // Find the free run preceding this block in address order.
            let mut i = h.heapindex;
            if i > block {
                while i > block {
                    i = self.free_prev(i);
                }
            } else {
                loop {
                    i = self.free_next(i);
                    if !(i > 0 && i < block) {
                        break;
                    }
                }
                i = self.free_prev(i);
            }

            let mut block = block;
            if block == i + self.free_size(i) {
                // Coalesce with the predecessor.
                unsafe { (*self.info(i)).tag += size };
                block = i;
            } else {
                // Link as a new free run after `i`.
                let bi = self.info(block);
                unsafe {
                    (*bi).tag = size;
                    (*bi).link = self.free_next(i);
                    (*bi).back = i;
                    (*self.info(i)).link = block;
                    (*self.info((*bi).link)).back = block;
                }
                h.chunks_free += 1;
            }

            // Coalesce with the successor if adjacent.
            let next = self.free_next(block);
            if block + self.free_size(block) == next {
                unsafe {
                    (*self.info(block)).tag += self.free_size(next);
                    (*self.info(block)).link = self.free_next(next);
                    (*self.info(self.free_next(block))).back = block;
                }
                h.chunks_free -= 1;
            }

            let blocks = self.free_size(block);

            // Return the pages of the whole free run to the kernel.
            if self.madv_remove {
                self.seg
                    .punch(self.address(block), (blocks * BLOCKSIZE) as usize);
            }

            // Pull the break back when enough free space accumulates at
            // the end of the heap.
            if blocks >= FINAL_FREE_BLOCKS
                && block + blocks == h.heaplimit
                && self.sbrk(h, 0) == Some(self.address(block + blocks))
            {
                let bytes = blocks as u64 * BLOCKSIZE as u64;
                h.heaplimit -= blocks;
                let _ = self.sbrk(h, -(bytes as i64));
                let prev = self.free_prev(block);
                let next = self.free_next(block);
                unsafe {
                    (*self.info(prev)).link = next;
                    (*self.info(next)).back = prev;
                }
                block = prev;
                h.chunks_free -= 1;
                h.bytes_free -= bytes;
            }

            h.heapindex = block;
        } else {
            let log = typ;
            h.chunks_used -= 1;
            h.bytes_used -= 1 << log;
            h.chunks_free += 1;
            h.bytes_free += 1 << log;

            let frags = BLOCKSIZE >> log;
            let nfree = unsafe { (*self.info(block)).link };
            let first = unsafe { (*self.info(block)).back };
            let prev_off = self.address(block) + (first << log);

            if nfree == frags - 1 && h.fragblocks[log as usize] > 1 {
                // Every fragment of this block is free again: unlink them
                // all and free the whole block, keeping one fragmented
                // block of this size cached.
                h.fragblocks[log as usize] -= 1;

                let mut end = prev_off;
                for _ in 1..frags {
                    end = unsafe { (*self.frag(end)).next };
                }
                let before = unsafe { (*self.frag(prev_off)).prev };
                if before == 0 {
                    h.fraghead[log as usize] = end;
                } else {
                    unsafe { (*self.frag(before)).next = end };
                }
                if end != 0 {
                    unsafe { (*self.frag(end)).prev = before };
                }

                let info = self.info(block);
                unsafe {
                    (*info).tag = 0;
                    (*info).link = 1;
                }

                h.chunks_used += 1;
                h.bytes_used += BLOCKSIZE as u64;
                h.chunks_free -= frags;
                h.bytes_free -= BLOCKSIZE as u64;

                self.free_inner(h, self.address(block));
            } else if nfree != 0 {
                // Link after the first free fragment of this block.
                let node = self.frag(off);
                unsafe {
                    (*node).next = (*self.frag(prev_off)).next;
                    (*node).prev = prev_off;
                    (*self.frag(prev_off)).next = off;
                    if (*node).next != 0 {
                        (*self.frag((*node).next)).prev = off;
                    }
                }
                unsafe { (*self.info(block)).link += 1 };
            } else {
                // First free fragment of this block: push at the list head
                // and record it as the block's first.
                let info = self.info(block);
                unsafe {
                    (*info).link = 1;
                    (*info).back = (off % BLOCKSIZE) >> log;
                }
                let node = self.frag(off);
                unsafe {
                    (*node).next = h.fraghead[log as usize];
                    (*node).prev = 0;
                    if (*node).next != 0 {
                        (*self.frag((*node).next)).prev = off;
                    }
                }
                h.fraghead[log as usize] = off;
            }
        }
    }

    /// # Safety
    /// Both ranges must be in bounds and disjoint.
    unsafe fn copy(&self, src: u32, dst: u32, len: usize) {
        // SAFETY: allocator metadata guarantees both ranges are in bounds.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.seg.base().add(src as usize),
                self.seg.base().add(dst as usize),
                len,
            );
        }
    }

    /// # Safety
    /// Both ranges must be in bounds. Ranges may overlap.
    unsafe fn copy_overlapping(&self, src: u32, dst: u32, len: usize) {
        // SAFETY: allocator metadata guarantees both ranges are in bounds.
        unsafe {
            std::ptr::copy(
                self.seg.base().add(src as usize),
                self.seg.base().add(dst as usize),
                len,
            );
        }
    }
}
