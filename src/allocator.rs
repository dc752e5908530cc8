use std::{cmp, fmt, ptr, ptr::NonNull};

use log::debug;

use crate::{
    block::{pack, BlockPtr, DWORD, MIN_BLOCK_SIZE, OVERHEAD, WORD},
    freelist::{Directory, CLASS_COUNT},
    region::RegionProvider,
    utils::align_up,
};

/// The region provider refused a growth request. The heap stays fully valid
/// after this: every existing allocation is intact and smaller requests may
/// still succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted;

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("region provider refused to grow the heap")
    }
}

impl std::error::Error for Exhausted {}

/// Size of the block that holds the size class head links, sentinels
/// included. The directory lives inside the managed region itself, framed as
/// an ordinary allocated block so the neighbor walk steps over it like any
/// other occupant.
pub(crate) const DIRECTORY_BLOCK_SIZE: usize = align_up(CLASS_COUNT * WORD + OVERHEAD, DWORD);

/// A boundary tagged heap with segregated free lists, backed by a single
/// contiguous monotonically growing region.
///
/// After [`Heap::init`] the managed region looks like this:
///
/// ```text
///      +-----+----------+-----------+-------+-------+-----+----------+
///      | pad | prologue | directory | block | block | ... | epilogue |
///      +-----+----------+-----------+-------+-------+-----+----------+
///        1 w    2 words    10 words                          1 word
/// ```
///
/// The prologue and epilogue are zero payload, always-allocated sentinels:
/// the first real block's predecessor and the last real block's successor
/// are therefore always marked allocated, so coalescing never walks off
/// either end of the region. The pad word keeps every payload on a double
/// word boundary. Each later growth of the region overwrites the old
/// epilogue with the new block's header and writes a fresh epilogue at the
/// new end.
///
/// Placement is first-fit across the size classes, splitting served blocks
/// whenever the remainder can stand on its own as a minimum sized block.
/// Coalescing is eager and complete: no two physically adjacent blocks are
/// ever both free between public operations.
///
/// The heap is single threaded. If it is shared across threads, the caller
/// is responsible for serialization.
pub struct Heap<P: RegionProvider> {
    provider: P,
    /// Head links of the segregated free lists; the words themselves live in
    /// the directory block inside the region.
    pub(crate) directory: Directory,
    /// Payload address of the prologue sentinel, where every physical walk
    /// starts.
    pub(crate) prologue: BlockPtr,
    /// Negative size cache: the adjusted size of the last request for which
    /// no fit existed, or 0. Requests of exactly this size skip the directory
    /// search and go straight to the region provider. Freeing a block of
    /// this size clears it, since that block could now satisfy the request.
    pub(crate) last_failed: usize,
    /// Total bytes obtained from the region provider since `init`.
    pub(crate) grown: usize,
}

/// Rounds a requested payload size up to a valid block size: payload plus
/// header and footer, double word aligned, never below the minimum block.
/// `None` on arithmetic overflow.
fn adjust_size(size: usize) -> Option<usize> {
    let padded = size.checked_add(OVERHEAD + DWORD - 1)?;
    Some(cmp::max(MIN_BLOCK_SIZE, padded & !(DWORD - 1)))
}

impl<P: RegionProvider> Heap<P> {
    /// Builds an empty heap on top of `provider`: installs the alignment
    /// pad, the prologue and epilogue sentinels, and the directory block
    /// with every size class empty.
    ///
    /// Fails with [`Exhausted`] if the provider cannot supply even that,
    /// in which case the heap is unusable.
    pub fn init(mut provider: P) -> Result<Self, Exhausted> {
        let base = provider.grow(4 * WORD).ok_or(Exhausted)?;

        unsafe {
            let words = base.as_ptr().cast::<usize>();
            words.write(0); // alignment pad
            words.add(1).write(pack(DWORD, true)); // prologue header
            words.add(2).write(pack(DWORD, true)); // prologue footer
            words.add(3).write(pack(0, true)); // epilogue header

            let prologue = BlockPtr::from_payload(NonNull::new_unchecked(words.add(2).cast()));

            // The directory block's header overwrites the epilogue we just
            // wrote, exactly like any other extension of the region.
            let storage = provider.grow(DIRECTORY_BLOCK_SIZE).ok_or(Exhausted)?;
            let directory_block = BlockPtr::from_payload(storage);
            directory_block.write_tags(DIRECTORY_BLOCK_SIZE, true);
            directory_block.next().write_header(0, true);

            let mut directory = Directory::new(storage);
            directory.clear();

            Ok(Self {
                provider,
                directory,
                prologue,
                last_failed: 0,
                grown: 4 * WORD + DIRECTORY_BLOCK_SIZE,
            })
        }
    }

    /// The region provider backing this heap.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Allocates a block with at least `size` bytes of payload and returns
    /// its double word aligned payload address. Returns null when `size` is
    /// zero or the region is exhausted; exhaustion leaves every existing
    /// allocation and the heap's invariants intact.
    ///
    /// # Safety
    ///
    /// The returned memory is uninitialized and only valid until it is
    /// freed. The caller must not write more than `size` bytes.
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        let Some(asize) = adjust_size(size) else {
            return ptr::null_mut();
        };

        unsafe {
            if self.last_failed != asize {
                if let Some(block) = self.directory.find_fit(asize) {
                    self.place(block, asize, true);
                    return block.payload().as_ptr();
                }

                // No class holds a fit for this size. Until a block of
                // exactly this size is freed, identical requests skip the
                // futile search and go straight to the provider.
                self.last_failed = asize;
            }

            match self.extend(asize) {
                Some(block) => {
                    self.place(block, asize, false);
                    block.payload().as_ptr()
                }
                None => ptr::null_mut(),
            }
        }
    }

    /// Frees a previously allocated block. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer obtained from this heap's `allocate`
    /// or `reallocate` that has not been freed since. Anything else is
    /// undefined behavior; it is not detected here, only surfaced later by
    /// the consistency checker.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };

        unsafe {
            let block = BlockPtr::from_payload(payload);
            let size = block.size();
            block.write_tags(size, false);

            // This block may be exactly what the cached failed request was
            // waiting for.
            if self.last_failed == size {
                self.last_failed = 0;
            }

            self.coalesce(block);
        }
    }

    /// Resizes the block at `ptr` to hold at least `size` payload bytes.
    ///
    /// Shrinks are served in place without splitting. A growth is served in
    /// place when the block borders the epilogue, by extending the region
    /// and absorbing the extension; otherwise the payload moves to a fresh
    /// allocation and the old block is freed. On exhaustion this returns
    /// null and leaves the original block untouched.
    ///
    /// `reallocate(null, size)` behaves like `allocate(size)` and
    /// `reallocate(ptr, 0)` behaves like `free(ptr)`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::free`] for `ptr`. A non-null return
    /// invalidates `ptr` unless it is equal to it.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        unsafe {
            if size == 0 {
                self.free(ptr);
                return ptr::null_mut();
            }

            if ptr.is_null() {
                return self.allocate(size);
            }

            let Some(asize) = adjust_size(size) else {
                return ptr::null_mut();
            };

            let block = BlockPtr::from_payload(NonNull::new_unchecked(ptr));
            let old_size = block.size();

            // The block already holds enough. Keep the oversize rather than
            // splitting; a shrunk-then-regrown block stays put this way.
            if asize <= old_size {
                return ptr;
            }

            // Bordering the epilogue means the region can grow underneath
            // the block: absorb the extension and the payload never moves.
            if block.next().is_epilogue() {
                let Some(extension) = self.extend(asize - old_size) else {
                    return ptr::null_mut();
                };
                block.write_tags(old_size + extension.size(), true);
                return ptr;
            }

            let new_ptr = self.allocate(size);
            if new_ptr.is_null() {
                return ptr::null_mut();
            }

            ptr::copy_nonoverlapping(ptr, new_ptr, cmp::min(old_size - OVERHEAD, size));
            self.free(ptr);

            new_ptr
        }
    }

    /// Grows the region by `bytes` (rounded up to a double word) and frames
    /// the extension as a free block: its header overwrites the old epilogue
    /// and a fresh epilogue is written past its footer.
    ///
    /// The extension is *not* coalesced or inserted anywhere here; callers
    /// decide. `allocate` consumes it immediately via `place`, and the
    /// in-place path of `reallocate` absorbs it into the grown block.
    unsafe fn extend(&mut self, bytes: usize) -> Option<BlockPtr> {
        let size = align_up(bytes, DWORD);
        let addr = self.provider.grow(size)?;
        self.grown += size;

        debug!("extended the managed region by {size} bytes");

        unsafe {
            let block = BlockPtr::from_payload(addr);
            block.write_tags(size, false);
            block.next().write_header(0, true);
            Some(block)
        }
    }

    /// Marks the first `asize` bytes of the free block `block` as allocated.
    /// If the remainder is large enough to stand as a block of its own it is
    /// split off, tagged free and inserted into its size class; otherwise
    /// the whole block is served and the slack becomes internal
    /// fragmentation.
    ///
    /// `remove` unlinks `block` from its class first. Callers that got the
    /// block from a fresh extension pass `false`, since such blocks were
    /// never inserted.
    unsafe fn place(&mut self, block: BlockPtr, asize: usize, remove: bool) {
        unsafe {
            if remove {
                self.directory.remove(block);
            }

            let size = block.size();

            if size - asize >= MIN_BLOCK_SIZE {
                block.write_tags(asize, true);
                let remainder = block.next();
                remainder.write_tags(size - asize, false);
                self.directory.insert(remainder);
            } else {
                block.write_tags(size, true);
            }
        }
    }

    /// Merges the newly freed `block` with whichever physical neighbors are
    /// free and inserts the result into its size class. Returns the merged
    /// block, whose address is the lowest participating block's.
    ///
    /// The sentinels guarantee both neighbor probes are safe, and neighbors
    /// are unlinked *before* any tag is rewritten so their link words are
    /// read while still intact.
    unsafe fn coalesce(&mut self, block: BlockPtr) -> BlockPtr {
        unsafe {
            let prev_allocated = block.prev().is_allocated();
            let next_allocated = block.next().is_allocated();
            let mut size = block.size();

            let merged = match (prev_allocated, next_allocated) {
                // Nothing to merge with.
                (true, true) => block,

                (true, false) => {
                    let next = block.next();
                    self.directory.remove(next);
                    size += next.size();
                    block.write_tags(size, false);
                    block
                }

                (false, true) => {
                    let prev = block.prev();
                    self.directory.remove(prev);
                    size += prev.size();
                    prev.write_tags(size, false);
                    prev
                }

                (false, false) => {
                    let prev = block.prev();
                    let next = block.next();
                    self.directory.remove(prev);
                    self.directory.remove(next);
                    size += prev.size() + next.size();
                    prev.write_tags(size, false);
                    prev
                }
            };

            self.directory.insert(merged);
            merged
        }
    }
}
