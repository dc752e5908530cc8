//! End to end scenarios for the heap, driven through a [`FixedRegion`] so
//! that growth and exhaustion are fully deterministic. The consistency
//! checker runs after every step; it is the strongest assertion here.

use segfit::{FixedRegion, Heap};

/// Word size of the target, the unit all block math is based on.
const W: usize = std::mem::size_of::<usize>();

fn heap(capacity: usize) -> Heap<FixedRegion> {
    Heap::init(FixedRegion::new(capacity)).unwrap()
}

#[test]
fn allocate_then_free_reuses_the_same_block() {
    let mut heap = heap(4096);

    unsafe {
        let a = heap.allocate(2 * W);
        assert!(!a.is_null());
        heap.free(a);

        // The only non-sentinel, non-directory block is the freed one.
        let stats = heap.check().unwrap();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 4 * W);

        let b = heap.allocate(2 * W);
        assert_eq!(b, a);
        assert_eq!(heap.check().unwrap().free_blocks, 0);
    }
}

#[test]
fn neighboring_frees_coalesce_into_one_block() {
    let mut heap = heap(4096);

    unsafe {
        let a = heap.allocate(2 * W);
        let b = heap.allocate(2 * W);

        heap.free(a);
        heap.check().unwrap();
        heap.free(b);

        let stats = heap.check().unwrap();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 8 * W);
    }
}

#[test]
fn shrinking_reallocate_keeps_the_block_whole() {
    let mut heap = heap(16 * 1024);

    unsafe {
        let p = heap.allocate(4000);
        let before = heap.check().unwrap();

        let q = heap.reallocate(p, 40);

        // No split on shrink: same pointer, no block mutated at all.
        assert_eq!(q, p);
        assert_eq!(heap.check().unwrap(), before);
        assert!(before.allocated_bytes >= 4000 + 2 * W);
    }
}

#[test]
fn reallocate_extends_in_place_at_the_region_end() {
    let mut heap = heap(16 * 1024);

    unsafe {
        let p = heap.allocate(40);
        let q = heap.reallocate(p, 4000);

        // The block bordered the epilogue, so the region grew underneath it.
        assert_eq!(q, p);

        let stats = heap.check().unwrap();
        assert_eq!(stats.free_blocks, 0);
        assert!(stats.allocated_bytes >= 4000 + 2 * W);
    }
}

#[test]
fn reallocate_relocates_when_a_neighbor_is_in_the_way() {
    let mut heap = heap(16 * 1024);

    unsafe {
        let p = heap.allocate(40);
        for i in 0..40 {
            *p.add(i) = i as u8;
        }

        let _x = heap.allocate(40);

        let q = heap.reallocate(p, 4000);
        assert!(!q.is_null());
        assert_ne!(q, p);

        // The first 40 payload bytes moved with the block.
        for i in 0..40 {
            assert_eq!(*q.add(i), i as u8);
        }

        // The old block was freed.
        let stats = heap.check().unwrap();
        assert_eq!(stats.free_blocks, 1);
    }
}

#[test]
fn exhaustion_is_sticky_until_a_matching_free() {
    // Space for the heap fixtures plus exactly one 64 word block.
    let mut heap = heap(4 * W + 10 * W + 64 * W);

    unsafe {
        let p = heap.allocate(62 * W);
        assert!(!p.is_null());

        // Nothing left: the same request fails, then fails again through
        // the negative size cache without a search.
        assert!(heap.allocate(62 * W).is_null());
        assert!(heap.allocate(62 * W).is_null());
        heap.check().unwrap();

        // Freeing a block of the cached size resets the cache and the next
        // request is served from it.
        heap.free(p);
        let q = heap.allocate(62 * W);
        assert_eq!(q, p);
        heap.check().unwrap();
    }
}

#[test]
fn allocate_zero_returns_null_and_changes_nothing() {
    let mut heap = heap(1024);
    let before = heap.check().unwrap();

    unsafe {
        assert!(heap.allocate(0).is_null());
    }

    assert_eq!(heap.check().unwrap(), before);
}

#[test]
fn free_of_null_is_a_no_op() {
    let mut heap = heap(1024);
    let before = heap.check().unwrap();

    unsafe {
        heap.free(std::ptr::null_mut());
    }

    assert_eq!(heap.check().unwrap(), before);
}

#[test]
fn reallocate_of_null_allocates() {
    let mut heap = heap(1024);

    unsafe {
        let p = heap.reallocate(std::ptr::null_mut(), 100);
        assert!(!p.is_null());
        assert_eq!(p as usize % (2 * W), 0);
        heap.check().unwrap();
    }
}

#[test]
fn reallocate_to_zero_frees() {
    let mut heap = heap(1024);

    unsafe {
        let p = heap.allocate(100);
        assert!(heap.reallocate(p, 0).is_null());

        assert_eq!(heap.check().unwrap().free_blocks, 1);
    }
}

#[test]
fn allocate_free_pair_restores_the_heap() {
    let mut heap = heap(16 * 1024);

    unsafe {
        // Build up a heap with one big coalesced free block so that the
        // pair below is served from it instead of growing the region.
        let warmup = heap.allocate(1000);
        heap.free(warmup);
        let before = heap.check().unwrap();

        let p = heap.allocate(100);
        heap.free(p);

        assert_eq!(heap.check().unwrap(), before);
    }
}

#[test]
fn payloads_are_writable_end_to_end() {
    let mut heap = heap(16 * 1024);

    unsafe {
        let sizes = [1, 7, 24, 100, 1000];
        let blocks: Vec<*mut u8> = sizes.iter().map(|&s| heap.allocate(s)).collect();

        for (&ptr, &size) in blocks.iter().zip(&sizes) {
            for i in 0..size {
                *ptr.add(i) = (i % 251) as u8;
            }
        }

        // Writing one block must not have disturbed another, and the heap
        // metadata must have survived every write.
        heap.check().unwrap();
        for (&ptr, &size) in blocks.iter().zip(&sizes) {
            for i in 0..size {
                assert_eq!(*ptr.add(i), (i % 251) as u8);
            }
        }

        for ptr in blocks {
            heap.free(ptr);
        }
        heap.check().unwrap();
    }
}

#[test]
fn draining_the_heap_leaves_a_single_free_block() {
    let mut heap = heap(64 * 1024);

    unsafe {
        let blocks: Vec<*mut u8> = [32, 8, 512, 64, 2048, 16, 128]
            .iter()
            .map(|&s| heap.allocate(s))
            .collect();

        // Free in an order that exercises every coalescing case.
        for index in [0, 2, 1, 6, 4, 3, 5] {
            heap.free(blocks[index]);
            heap.check().unwrap();
        }

        let stats = heap.check().unwrap();
        assert_eq!(stats.free_blocks, 1);
    }
}

#[test]
fn randomized_workload_stays_consistent() {
    let mut heap = heap(1 << 20);
    let mut live: Vec<(*mut u8, usize)> = Vec::new();
    let mut seed: u64 = 0x2545f4914f6cdd1d;

    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    unsafe {
        for round in 0..400 {
            if live.len() > 40 || (!live.is_empty() && next() % 3 == 0) {
                let (ptr, size) = live.swap_remove(next() as usize % live.len());
                // Payload must still hold our stamp when freed.
                for i in 0..size.min(64) {
                    assert_eq!(*ptr.add(i), (size % 255) as u8);
                }
                heap.free(ptr);
            } else {
                let size = 1 + (next() as usize % 2000);
                let ptr = heap.allocate(size);
                assert!(!ptr.is_null(), "exhausted on round {round}");
                for i in 0..size.min(64) {
                    *ptr.add(i) = (size % 255) as u8;
                }
                live.push((ptr, size));
            }

            heap.check().unwrap();
        }

        for (ptr, _) in live {
            heap.free(ptr);
        }

        assert_eq!(heap.check().unwrap().free_blocks, 1);
    }
}
