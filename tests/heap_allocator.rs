use proptest::prelude::*;
use std::sync::Arc;
use usm_rs::heap::{HeapBlock, HeapChunk};
use usm_rs::utils::PAGE_SIZE;
use usm_rs::HeapAllocator;

const BASE: u64 = 0x4000_0000;
const PAGES: u64 = 256;
const THRESHOLD: u64 = 16 * PAGE_SIZE;

#[derive(Debug, Clone)]
enum Op {
    Allocate { pages: u64, alignment_pages: u64 },
    Free { index: usize },
    Defragment,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u64..40, prop_oneof![Just(0u64), Just(1), Just(2), Just(4), Just(16)])
            .prop_map(|(pages, alignment_pages)| Op::Allocate { pages, alignment_pages }),
        3 => any::<usize>().prop_map(|index| Op::Free { index }),
        1 => Just(Op::Defragment),
    ]
}

fn free_bytes(chunks: &[HeapChunk]) -> u64 {
    chunks.iter().map(|chunk| chunk.size).sum()
}

fn assert_accounting(heap: &HeapAllocator, live: &[HeapBlock]) {
    let used: u64 = live.iter().map(|block| block.size).sum();
    assert_eq!(heap.left_size(), heap.total_size() - used);

    // Everything not handed out is either between the bounds or on a free list.
    let gap = heap.right_bound() - heap.left_bound();
    let listed = free_bytes(&heap.freed_chunks_big()) + free_bytes(&heap.freed_chunks_small());
    assert_eq!(heap.left_size(), gap + listed);
}

proptest! {
    #[test]
    fn blocks_never_overlap_and_bytes_are_accounted(ops in prop::collection::vec(op(), 1..120)) {
        let heap = HeapAllocator::new(BASE, PAGES * PAGE_SIZE, PAGE_SIZE, THRESHOLD);
        let mut live: Vec<HeapBlock> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { pages, alignment_pages } => {
                    let alignment = alignment_pages * PAGE_SIZE;
                    let block = heap.allocate_with_custom_alignment(pages * PAGE_SIZE, alignment);
                    if let Some(block) = block {
                        prop_assert!(block.size >= pages * PAGE_SIZE);
                        prop_assert!(block.address >= BASE);
                        prop_assert!(block.address + block.size <= BASE + PAGES * PAGE_SIZE);
                        prop_assert_eq!(block.address % alignment.max(PAGE_SIZE), 0);
                        for other in &live {
                            prop_assert!(
                                block.address + block.size <= other.address
                                    || other.address + other.size <= block.address,
                                "{:?} overlaps {:?}", block, other
                            );
                        }
                        live.push(block);
                    }
                }
                Op::Free { index } => {
                    if !live.is_empty() {
                        let block = live.swap_remove(index % live.len());
                        heap.free(block.address, block.size);
                    }
                }
                Op::Defragment => heap.defragment(),
            }
            assert_accounting(&heap, &live);
        }

        for block in live.drain(..) {
            heap.free(block.address, block.size);
        }
        prop_assert_eq!(heap.left_size(), heap.total_size());
        prop_assert_eq!(heap.used_size(), 0);
    }

    #[test]
    fn freed_space_is_reusable_after_defragment(sizes in prop::collection::vec(1u64..8, 1..32)) {
        let heap = HeapAllocator::new(BASE, PAGES * PAGE_SIZE, PAGE_SIZE, THRESHOLD);

        let blocks: Vec<HeapBlock> = sizes
            .iter()
            .filter_map(|&pages| heap.allocate(pages * PAGE_SIZE))
            .collect();
        for block in &blocks {
            heap.free(block.address, block.size);
        }
        heap.defragment();

        // All small blocks were carved from the right end and form one run again.
        let small = heap.freed_chunks_small();
        prop_assert!(small.len() <= 1);
        let again: Vec<HeapBlock> = sizes
            .iter()
            .filter_map(|&pages| heap.allocate(pages * PAGE_SIZE))
            .collect();
        prop_assert_eq!(again.len(), blocks.len());
    }
}

#[test]
fn big_and_small_requests_grow_from_opposite_ends() {
    let heap = HeapAllocator::new(BASE, PAGES * PAGE_SIZE, PAGE_SIZE, THRESHOLD);

    let big = heap.allocate(32 * PAGE_SIZE).unwrap();
    let small = heap.allocate(PAGE_SIZE).unwrap();

    assert_eq!(big.address, BASE);
    assert_eq!(small.address, BASE + (PAGES - 1) * PAGE_SIZE);
    assert_eq!(heap.left_bound(), BASE + 32 * PAGE_SIZE);
    assert_eq!(heap.right_bound(), small.address);
}

#[test]
fn exhausted_heap_reports_failure() {
    let heap = HeapAllocator::new(BASE, 4 * PAGE_SIZE, PAGE_SIZE, THRESHOLD);

    let blocks: Vec<_> = (0..4).map(|_| heap.allocate(PAGE_SIZE).unwrap()).collect();
    assert!(heap.allocate(PAGE_SIZE).is_none());
    assert!((heap.usage() - 1.0).abs() < f64::EPSILON);

    heap.free(blocks[2].address, blocks[2].size);
    assert_eq!(heap.allocate(PAGE_SIZE).unwrap().address, blocks[2].address);
}

#[test]
fn concurrent_allocate_and_free_balance_out() {
    let heap = Arc::new(HeapAllocator::new(
        BASE,
        1024 * PAGE_SIZE,
        PAGE_SIZE,
        THRESHOLD,
    ));

    std::thread::scope(|scope| {
        for worker in 0..4u64 {
            let heap = Arc::clone(&heap);
            scope.spawn(move || {
                let mut held = Vec::new();
                for round in 0..200u64 {
                    let pages = 1 + (worker * 7 + round) % 24;
                    if let Some(block) = heap.allocate(pages * PAGE_SIZE) {
                        held.push(block);
                    }
                    if round % 3 == 0 {
                        if let Some(block) = held.pop() {
                            heap.free(block.address, block.size);
                        }
                    }
                }
                for block in held {
                    heap.free(block.address, block.size);
                }
            });
        }
    });

    assert_eq!(heap.left_size(), heap.total_size());
}
