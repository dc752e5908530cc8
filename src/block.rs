use std::{mem, ptr::NonNull};

/// Size of a machine word in bytes. All block metadata (headers, footers and
/// free list links) is word sized, so the allocator works the same way on
/// 32 bit and 64 bit address spaces.
pub(crate) const WORD: usize = mem::size_of::<usize>();

/// Double word size in bytes. Every payload pointer we hand out is aligned to
/// this boundary and every block size is a multiple of it.
pub(crate) const DWORD: usize = 2 * WORD;

/// Bytes of bookkeeping carried by each block: one header word plus one
/// footer word.
pub(crate) const OVERHEAD: usize = 2 * WORD;

/// Smallest block we ever create: header, footer and two payload words. The
/// two payload words matter because a free block stores its `prev`/`next`
/// free list links there, see [`crate::freelist::FreeNode`].
pub(crate) const MIN_BLOCK_SIZE: usize = 4 * WORD;

/// Packs a block size and its allocated flag into a single tag word. The size
/// is always a multiple of [`DWORD`], so the low bit is free to carry the
/// flag.
#[inline]
pub(crate) fn pack(size: usize, allocated: bool) -> usize {
    size | allocated as usize
}

/// A block of the managed region, identified by its payload address. This is
/// the same pointer the allocator hands to its caller.
///
/// Every byte of the region belongs to exactly one block, laid out as a
/// boundary tagged chunk:
///
/// ```text
///             +---------------------+
///             |   header (1 word)   | -> size | allocated flag
/// payload --> +---------------------+
///             |                     |
///             |       payload       | -> size - 2 words of usable memory
///             |         ...         |
///             +---------------------+
///             |   footer (1 word)   | -> copy of the header
///             +---------------------+
/// ```
///
/// The footer exists so that the block physically *before* this one can be
/// reached with pure address arithmetic: its tag sits one word below our
/// header, see [`BlockPtr::prev`]. No pointers are stored for the physical
/// neighbor walk, only sizes.
///
/// All accessors here are side effect free address arithmetic. They rely on
/// the cross cutting invariant that every block's footer matches its header,
/// which every mutation in the allocator must preserve.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BlockPtr(NonNull<u8>);

impl BlockPtr {
    /// Reinterprets a payload address as a block.
    ///
    /// # Safety
    ///
    /// `payload` must point one word past a valid block header inside the
    /// managed region. For pointers coming back from the caller this holds as
    /// long as they were returned by `allocate` or `reallocate`.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self(payload)
    }

    /// The address handed to the allocator's caller.
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        self.0
    }

    /// Address of the header tag, one word below the payload.
    #[inline]
    unsafe fn header_ptr(self) -> *mut usize {
        unsafe { self.0.as_ptr().sub(WORD).cast() }
    }

    /// Address of the footer tag, at the very end of the block.
    #[inline]
    unsafe fn footer_ptr(self) -> *mut usize {
        unsafe { self.0.as_ptr().add(self.size() - OVERHEAD).cast() }
    }

    /// Raw header word, size and flag still packed together.
    #[inline]
    pub unsafe fn header(self) -> usize {
        unsafe { *self.header_ptr() }
    }

    /// Raw footer word. Equal to [`Self::header`] on every well formed block.
    #[inline]
    pub unsafe fn footer(self) -> usize {
        unsafe { *self.footer_ptr() }
    }

    /// Block size in bytes, header and footer included.
    #[inline]
    pub unsafe fn size(self) -> usize {
        unsafe { *self.header_ptr() & !(DWORD - 1) }
    }

    /// Whether the block is currently in use by the caller.
    #[inline]
    pub unsafe fn is_allocated(self) -> bool {
        unsafe { *self.header_ptr() & 1 == 1 }
    }

    /// Whether this is the epilogue sentinel closing the region.
    #[inline]
    pub unsafe fn is_epilogue(self) -> bool {
        unsafe { self.size() == 0 }
    }

    /// Writes matching header and footer tags for this block.
    ///
    /// # Safety
    ///
    /// The block must own `size` bytes starting at its header. The footer
    /// position is derived from `size`, not from the previous header, so this
    /// is also how a block is resized during splits and merges.
    #[inline]
    pub unsafe fn write_tags(self, size: usize, allocated: bool) {
        unsafe {
            *self.header_ptr() = pack(size, allocated);
            *self.0.as_ptr().add(size - OVERHEAD).cast::<usize>() = pack(size, allocated);
        }
    }

    /// Writes the header tag only. This exists for the epilogue, which is a
    /// lone header word: deriving a footer position from its zero size would
    /// stomp on the previous block's footer.
    ///
    /// # Safety
    ///
    /// Same as [`Self::write_tags`], minus the footer.
    #[inline]
    pub unsafe fn write_header(self, size: usize, allocated: bool) {
        unsafe { *self.header_ptr() = pack(size, allocated) }
    }

    /// The physically adjacent block at the next higher address.
    ///
    /// # Safety
    ///
    /// Must not be called on the epilogue; there is nothing past it.
    #[inline]
    pub unsafe fn next(self) -> BlockPtr {
        unsafe { Self(NonNull::new_unchecked(self.0.as_ptr().add(self.size()))) }
    }

    /// The physically adjacent block at the next lower address, located by
    /// reading that block's footer, which sits right below our header.
    ///
    /// # Safety
    ///
    /// Must not be called on the prologue; the words below it are the
    /// alignment pad, not a footer.
    #[inline]
    pub unsafe fn prev(self) -> BlockPtr {
        unsafe {
            let prev_size = *self.0.as_ptr().sub(OVERHEAD).cast::<usize>() & !(DWORD - 1);
            Self(NonNull::new_unchecked(self.0.as_ptr().sub(prev_size)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Word storage aligned like a region provider would align it.
    #[repr(align(16))]
    struct Arena([usize; 32]);

    fn payload_at(arena: &mut Arena, word: usize) -> NonNull<u8> {
        NonNull::new(unsafe { arena.0.as_mut_ptr().add(word).cast() }).unwrap()
    }

    #[test]
    fn tags_round_trip() {
        let mut arena = Arena([0; 32]);

        unsafe {
            let block = BlockPtr::from_payload(payload_at(&mut arena, 1));
            block.write_tags(6 * WORD, true);

            assert_eq!(block.size(), 6 * WORD);
            assert!(block.is_allocated());
            assert_eq!(block.header(), block.footer());

            block.write_tags(6 * WORD, false);
            assert!(!block.is_allocated());
            assert_eq!(block.size(), 6 * WORD);
        }
    }

    #[test]
    fn neighbor_walk() {
        let mut arena = Arena([0; 32]);

        unsafe {
            let first = BlockPtr::from_payload(payload_at(&mut arena, 1));
            first.write_tags(4 * WORD, true);

            let second = first.next();
            second.write_tags(8 * WORD, false);

            let third = second.next();
            third.write_tags(4 * WORD, true);

            assert_eq!(
                second.payload().as_ptr() as usize,
                first.payload().as_ptr() as usize + 4 * WORD
            );
            assert_eq!(second.prev(), first);
            assert_eq!(third.prev(), second);
            assert_eq!(third.prev().prev(), first);
        }
    }

    #[test]
    fn epilogue_is_header_only() {
        let mut arena = Arena([0; 32]);

        unsafe {
            let block = BlockPtr::from_payload(payload_at(&mut arena, 1));
            block.write_tags(4 * WORD, false);

            let epilogue = block.next();
            epilogue.write_header(0, true);

            assert!(epilogue.is_epilogue());
            assert!(epilogue.is_allocated());
            // The epilogue header must not have disturbed our footer.
            assert_eq!(block.header(), block.footer());
        }
    }
}
