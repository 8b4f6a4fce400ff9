use super::{ApertureAllocator, HeapBlock, HeapChunk};
use crate::utils::{MEGABYTE, PAGE_SIZE, align_down, checked_align_up, is_aligned};
use parking_lot::Mutex;

/// Requests above this size are "big" unless the caller picks another threshold.
pub const DEFAULT_SIZE_THRESHOLD: u64 = 4 * MEGABYTE;

#[derive(Debug)]
struct HeapState {
    left_bound: u64,
    right_bound: u64,
    available_size: u64,
    freed_chunks_big: Vec<HeapChunk>,
    freed_chunks_small: Vec<HeapChunk>,
}

/// Two-ended sub-allocator over `[base, base + size)`.
///
/// Big requests bump `left_bound` upward, small ones pull `right_bound`
/// downward. Freed intervals go to one of two free lists (by their own size)
/// and are reused best-fit. Adjacent free intervals are only merged by
/// [`HeapAllocator::defragment`], which allocation runs once before giving up.
///
/// The managed range never contains address 0.
#[derive(Debug)]
pub struct HeapAllocator {
    base: u64,
    size: u64,
    allocation_alignment: u64,
    size_threshold: u64,
    state: Mutex<HeapState>,
}

impl HeapAllocator {
    /// # Panics
    /// Panics if `base` is 0, `allocation_alignment` is 0 or the range overflows.
    #[must_use]
    pub fn new(base: u64, size: u64, allocation_alignment: u64, size_threshold: u64) -> Self {
        assert!(base != 0, "heap range must not start at address 0");
        assert!(allocation_alignment != 0, "allocation alignment must be non-zero");
        let limit = base
            .checked_add(size)
            .expect("heap range overflows the address space");

        Self {
            base,
            size,
            allocation_alignment,
            size_threshold,
            state: Mutex::new(HeapState {
                left_bound: base,
                right_bound: limit,
                available_size: size,
                freed_chunks_big: Vec::new(),
                freed_chunks_small: Vec::new(),
            }),
        }
    }

    /// Page-aligned allocator with the default big/small threshold.
    #[must_use]
    pub fn with_defaults(base: u64, size: u64) -> Self {
        Self::new(base, size, PAGE_SIZE, DEFAULT_SIZE_THRESHOLD)
    }

    pub fn allocate(&self, size: u64) -> Option<HeapBlock> {
        self.allocate_with_custom_alignment(size, 0)
    }

    /// Allocates `size` bytes aligned to `alignment` (0 selects the allocator default).
    ///
    /// The returned block reports the size actually consumed, which is what
    /// must later be handed back to [`HeapAllocator::free`].
    ///
    /// # Panics
    /// Panics if `alignment` is not a multiple of the allocator alignment.
    pub fn allocate_with_custom_alignment(&self, size: u64, alignment: u64) -> Option<HeapBlock> {
        let alignment = if alignment == 0 {
            self.allocation_alignment
        } else {
            alignment
        };
        assert!(
            alignment % self.allocation_alignment == 0,
            "custom alignment {alignment:#x} is not a multiple of allocator alignment {:#x}",
            self.allocation_alignment
        );

        if size == 0 {
            return None;
        }
        let size = checked_align_up(size, self.allocation_alignment)?;

        let mut state = self.state.lock();
        tracing::trace!(
            usage = self.usage_of(state.available_size),
            size,
            alignment,
            "heap allocator usage"
        );

        if state.available_size < size {
            return None;
        }

        let block = match state.try_allocate(size, alignment, self.size_threshold) {
            Some(block) => block,
            None => {
                state.defragment();
                state.try_allocate(size, alignment, self.size_threshold)?
            }
        };

        debug_assert!(is_aligned(block.address, alignment));
        state.available_size -= block.size;
        Some(block)
    }

    /// Returns `[address, address + size)` to the free lists. Address 0 is ignored.
    pub fn free(&self, address: u64, size: u64) {
        if address == 0 {
            return;
        }
        debug_assert!(address >= self.base && address + size <= self.base + self.size);

        let mut state = self.state.lock();
        state.store_chunk(HeapChunk::new(address, size), self.size_threshold);
        state.available_size += size;
    }

    /// Sorts both free lists by address and merges exactly adjacent chunks.
    pub fn defragment(&self) {
        self.state.lock().defragment();
    }

    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn allocation_alignment(&self) -> u64 {
        self.allocation_alignment
    }

    #[must_use]
    pub const fn size_threshold(&self) -> u64 {
        self.size_threshold
    }

    /// Free bytes, including bytes sitting in the free lists.
    pub fn left_size(&self) -> u64 {
        self.state.lock().available_size
    }

    pub fn used_size(&self) -> u64 {
        self.size - self.left_size()
    }

    pub fn usage(&self) -> f64 {
        self.usage_of(self.left_size())
    }

    pub fn left_bound(&self) -> u64 {
        self.state.lock().left_bound
    }

    pub fn right_bound(&self) -> u64 {
        self.state.lock().right_bound
    }

    pub fn freed_chunks_big(&self) -> Vec<HeapChunk> {
        self.state.lock().freed_chunks_big.clone()
    }

    pub fn freed_chunks_small(&self) -> Vec<HeapChunk> {
        self.state.lock().freed_chunks_small.clone()
    }

    #[allow(clippy::cast_precision_loss)]
    fn usage_of(&self, available_size: u64) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        (self.size - available_size) as f64 / self.size as f64
    }
}

impl HeapState {
    fn chunks_mut(&mut self, big: bool) -> &mut Vec<HeapChunk> {
        if big {
            &mut self.freed_chunks_big
        } else {
            &mut self.freed_chunks_small
        }
    }

    fn store_chunk(&mut self, chunk: HeapChunk, size_threshold: u64) {
        self.chunks_mut(chunk.size > size_threshold).push(chunk);
    }

    fn try_allocate(
        &mut self,
        size: u64,
        alignment: u64,
        size_threshold: u64,
    ) -> Option<HeapBlock> {
        let big = size > size_threshold;

        if let Some(block) = take_from_freed_chunks(self.chunks_mut(big), size, alignment) {
            return Some(block);
        }

        if big {
            self.bump_left(size, alignment, size_threshold)
        } else {
            self.bump_right(size, alignment, size_threshold)
        }
    }

    fn bump_left(&mut self, size: u64, alignment: u64, size_threshold: u64) -> Option<HeapBlock> {
        let address = checked_align_up(self.left_bound, alignment)?;
        let misalignment = address - self.left_bound;

        let fits = address
            .checked_add(size)
            .is_some_and(|end| end <= self.right_bound);
        if !fits {
            return None;
        }

        if misalignment > 0 {
            self.store_chunk(HeapChunk::new(self.left_bound, misalignment), size_threshold);
        }
        self.left_bound = address + size;
        Some(HeapBlock { address, size })
    }

    fn bump_right(&mut self, size: u64, alignment: u64, size_threshold: u64) -> Option<HeapBlock> {
        let start = self.right_bound.checked_sub(size)?;
        let address = align_down(start, alignment);
        let misalignment = start - address;

        if address < self.left_bound {
            return None;
        }

        if misalignment > 0 {
            self.right_bound -= misalignment;
            self.store_chunk(HeapChunk::new(self.right_bound, misalignment), size_threshold);
        }
        self.right_bound -= size;
        Some(HeapBlock {
            address: self.right_bound,
            size,
        })
    }

    fn defragment(&mut self) {
        coalesce(&mut self.freed_chunks_small);
        coalesce(&mut self.freed_chunks_big);
    }
}

/// Best-fit search over one free list.
///
/// An aligned exact-size chunk wins immediately. Otherwise the smallest larger
/// aligned chunk is used: whole if it is at most twice the request, split
/// (tail handed out) if larger. A split whose tail is misaligned rejects the
/// chunk for this pass.
fn take_from_freed_chunks(
    chunks: &mut Vec<HeapChunk>,
    size: u64,
    alignment: u64,
) -> Option<HeapBlock> {
    let mut exact = None;
    let mut best_fit: Option<usize> = None;

    for (index, chunk) in chunks.iter().enumerate() {
        if !is_aligned(chunk.address, alignment) {
            continue;
        }
        if chunk.size == size {
            exact = Some(index);
            break;
        }
        if chunk.size > size && best_fit.is_none_or(|best| chunk.size < chunks[best].size) {
            best_fit = Some(index);
        }
    }

    if let Some(index) = exact {
        let chunk = chunks.remove(index);
        return Some(HeapBlock {
            address: chunk.address,
            size: chunk.size,
        });
    }

    let index = best_fit?;
    let chunk = chunks[index];

    if chunk.size <= size.saturating_mul(2) {
        chunks.remove(index);
        return Some(HeapBlock {
            address: chunk.address,
            size: chunk.size,
        });
    }

    let size_delta = chunk.size - size;
    let address = chunk.address + size_delta;
    if !is_aligned(address, alignment) {
        return None;
    }

    chunks[index].size = size_delta;
    Some(HeapBlock { address, size })
}

fn coalesce(chunks: &mut Vec<HeapChunk>) {
    if chunks.len() < 2 {
        return;
    }
    chunks.sort_unstable();
    chunks.dedup_by(|next, prev| {
        if prev.end() == next.address {
            prev.size += next.size;
            true
        } else {
            false
        }
    });
}

impl ApertureAllocator for HeapAllocator {
    fn allocate_va(&self, size: u64, align: u64) -> Option<HeapBlock> {
        let align = if align <= self.allocation_alignment {
            0
        } else {
            checked_align_up(align, self.allocation_alignment)?
        };
        self.allocate_with_custom_alignment(size, align)
    }

    fn free_va(&self, addr: u64, size: u64) {
        self.free(addr, size);
    }

    fn bounds(&self) -> (u64, u64) {
        (self.base, self.base + self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x10_0000;

    #[test]
    fn small_request_comes_from_right_bound() {
        let heap = HeapAllocator::new(BASE, 4096, 16, 256);
        let right_bound = heap.right_bound();

        let block = heap.allocate_with_custom_alignment(64, 16).unwrap();

        assert_eq!(block.address, right_bound - 64);
        assert_eq!(block.size, 64);
        assert_eq!(heap.right_bound(), right_bound - 64);
        assert_eq!(heap.left_size(), 4096 - 64);
        assert_eq!(heap.left_bound(), BASE);
    }

    #[test]
    fn chunk_up_to_twice_the_request_is_consumed_whole() {
        let heap = HeapAllocator::new(BASE, 4096, 16, 256);
        let first = heap.allocate_with_custom_alignment(64, 16).unwrap();
        heap.free(first.address, first.size);
        assert_eq!(heap.freed_chunks_small().len(), 1);

        let second = heap.allocate_with_custom_alignment(32, 16).unwrap();

        assert_eq!(second.address, first.address);
        assert_eq!(second.size, 64);
        assert!(heap.freed_chunks_small().is_empty());
        assert_eq!(heap.left_size(), 4096 - 64);
    }

    #[test]
    fn large_chunk_is_split_and_tail_returned() {
        let heap = HeapAllocator::new(BASE, 4096, 16, 1024);
        let first = heap.allocate(256).unwrap();
        heap.free(first.address, first.size);

        let block = heap.allocate(64).unwrap();

        assert_eq!(block.address, first.address + 192);
        assert_eq!(block.size, 64);
        let chunks = heap.freed_chunks_small();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].address, first.address);
        assert_eq!(chunks[0].size, 192);
        assert_eq!(heap.left_size(), 4096 - 64);
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_chunk() {
        let heap = HeapAllocator::new(BASE, 8192, 16, 4096);
        let a = heap.allocate(512).unwrap();
        let _gap_a = heap.allocate(16).unwrap();
        let b = heap.allocate(96).unwrap();
        let _gap_b = heap.allocate(16).unwrap();
        let c = heap.allocate(128).unwrap();
        heap.free(a.address, a.size);
        heap.free(b.address, b.size);
        heap.free(c.address, c.size);

        let block = heap.allocate(64).unwrap();

        assert_eq!(block.address, b.address);
        assert_eq!(block.size, 96);
    }

    #[test]
    fn equal_best_fit_candidates_pick_the_first_freed() {
        let heap = HeapAllocator::new(BASE, 8192, 16, 4096);
        let a = heap.allocate(96).unwrap();
        let _gap_a = heap.allocate(16).unwrap();
        let b = heap.allocate(96).unwrap();
        let _gap_b = heap.allocate(16).unwrap();
        heap.free(a.address, a.size);
        heap.free(b.address, b.size);

        let block = heap.allocate(64).unwrap();

        assert_eq!(block.address, a.address);
        assert_eq!(block.size, 96);
        let left = heap.freed_chunks_small();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].address, b.address);
    }

    #[test]
    fn sizes_near_the_top_of_the_address_space_fail_cleanly() {
        let heap = HeapAllocator::new(BASE, 4096, 16, 256);

        assert!(heap.allocate(u64::MAX).is_none());
        assert!(heap.allocate(u64::MAX - 8).is_none());
        assert!(heap.allocate_va(64, u64::MAX - 8).is_none());
        assert_eq!(heap.left_size(), 4096);
        assert_eq!(heap.right_bound(), BASE + 4096);
    }

    #[test]
    fn adjacent_big_chunks_merge_on_defragment() {
        let heap = HeapAllocator::new(BASE, 4096, 8, 8);
        let first = heap.allocate(16).unwrap();
        let second = heap.allocate(16).unwrap();
        assert_eq!(second.address, first.address + 16);

        heap.free(first.address, first.size);
        heap.free(second.address, second.size);
        assert_eq!(heap.freed_chunks_big().len(), 2);

        heap.defragment();

        let chunks = heap.freed_chunks_big();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].address, first.address);
        assert_eq!(chunks[0].size, 32);
    }

    #[test]
    fn exhausted_range_is_recovered_by_defragment_retry() {
        let heap = HeapAllocator::new(BASE, 4096, 16, 256);
        let blocks: Vec<_> = (0..4).map(|_| heap.allocate(1024).unwrap()).collect();
        assert_eq!(heap.left_bound(), heap.right_bound());
        assert!(heap.allocate(1024).is_none());

        heap.free(blocks[1].address, blocks[1].size);
        heap.free(blocks[0].address, blocks[0].size);

        let merged = heap.allocate(2048).unwrap();

        assert_eq!(merged.address, BASE);
        assert_eq!(merged.size, 2048);
        assert_eq!(heap.left_size(), 0);
    }

    #[test]
    fn misaligned_split_rejects_chunk_and_falls_back_to_bump() {
        let heap = HeapAllocator::new(BASE, 4096, 16, 1024);
        let block = heap.allocate_with_custom_alignment(176, 64).unwrap();
        assert_eq!(block.address % 64, 0);
        heap.free(block.address, block.size);

        let next = heap.allocate_with_custom_alignment(32, 64).unwrap();

        assert_ne!(next.address, block.address + 144);
        assert_eq!(next.address % 64, 0);
        assert!(
            heap.freed_chunks_small()
                .iter()
                .any(|c| c.address == block.address && c.size == 176)
        );
    }

    #[test]
    fn bump_padding_is_kept_as_free_chunk() {
        let heap = HeapAllocator::new(BASE + 16, 4096, 16, 64);

        let block = heap.allocate_with_custom_alignment(128, 64).unwrap();

        assert_eq!(block.address % 64, 0);
        let padding = heap.freed_chunks_small();
        assert_eq!(padding.len(), 1);
        assert_eq!(padding[0].address, BASE + 16);
        assert_eq!(padding[0].end(), block.address);
        assert_eq!(heap.left_size(), 4096 - 128);
    }

    #[test]
    fn zero_and_oversized_requests_fail() {
        let heap = HeapAllocator::new(BASE, 4096, 16, 256);
        assert!(heap.allocate(0).is_none());
        assert!(heap.allocate(8192).is_none());
        assert_eq!(heap.left_size(), 4096);
    }

    #[test]
    fn sizes_round_up_to_allocator_alignment() {
        let heap = HeapAllocator::new(BASE, 4096, 64, 256);
        let block = heap.allocate(1).unwrap();
        assert_eq!(block.size, 64);
        assert_eq!(heap.used_size(), 64);
    }

    #[test]
    #[should_panic(expected = "not a multiple")]
    fn custom_alignment_must_be_multiple_of_default() {
        let heap = HeapAllocator::new(BASE, 4096, 16, 256);
        let _ = heap.allocate_with_custom_alignment(64, 24);
    }

    #[test]
    fn free_of_null_is_ignored() {
        let heap = HeapAllocator::new(BASE, 4096, 16, 256);
        heap.free(0, 64);
        assert_eq!(heap.left_size(), 4096);
        assert!(heap.freed_chunks_small().is_empty());
    }

    #[test]
    fn aperture_view_rounds_alignment() {
        let heap = HeapAllocator::with_defaults(BASE, 1 << 20);
        assert_eq!(heap.bounds(), (BASE, BASE + (1 << 20)));

        let block = heap.allocate_va(100, 1).unwrap();
        assert_eq!(block.size, PAGE_SIZE);
        assert_eq!(block.address % PAGE_SIZE, 0);

        heap.free_va(block.address, block.size);
        assert_eq!(heap.left_size(), 1 << 20);
    }
}
