use std::fmt;

use log::trace;

use crate::{
    allocator::Heap,
    block::{BlockPtr, DWORD, MIN_BLOCK_SIZE, WORD},
    freelist::{class_of, CLASS_COUNT},
    region::RegionProvider,
};

/// What the consistency checker found wrong, with the payload address of the
/// offending block where one exists. These conditions cannot be produced by
/// the allocator itself; they are the downstream symptoms of client misuse
/// such as double frees, foreign pointers or out of bounds writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// The prologue sentinel is not an allocated two word block at the
    /// region start.
    BadPrologue,
    /// The epilogue sentinel is not an allocated zero sized header.
    BadEpilogue,
    /// A payload address is not double word aligned.
    MisalignedPayload { at: usize },
    /// A block's header and footer words disagree.
    TagMismatch { at: usize },
    /// A block size is below the minimum or not double word sized.
    BadBlockSize { at: usize, size: usize },
    /// Two physically adjacent blocks are both free, so coalescing was
    /// missed somewhere.
    AdjacentFreeBlocks { at: usize },
    /// A free block is in no size class list.
    MissingFromFreeList { at: usize },
    /// A free block is linked more than once.
    DuplicatedInFreeList { at: usize },
    /// A free block sits in a list that doesn't match its size.
    WrongClass { at: usize },
    /// A size class list links to a block that is marked allocated.
    StrayListNode { at: usize },
    /// The blocks walked don't add up to the bytes obtained from the region
    /// provider.
    RegionSizeMismatch { walked: usize, grown: usize },
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadPrologue => write!(f, "bad prologue"),
            Self::BadEpilogue => write!(f, "bad epilogue"),
            Self::MisalignedPayload { at } => {
                write!(f, "payload at {at:#x} is not double word aligned")
            }
            Self::TagMismatch { at } => {
                write!(f, "header does not match footer for block at {at:#x}")
            }
            Self::BadBlockSize { at, size } => {
                write!(f, "block at {at:#x} has invalid size {size}")
            }
            Self::AdjacentFreeBlocks { at } => {
                write!(f, "block at {at:#x} and its predecessor are both free")
            }
            Self::MissingFromFreeList { at } => {
                write!(f, "free block at {at:#x} is in no size class list")
            }
            Self::DuplicatedInFreeList { at } => {
                write!(f, "free block at {at:#x} is linked more than once")
            }
            Self::WrongClass { at } => {
                write!(f, "free block at {at:#x} is in the wrong size class")
            }
            Self::StrayListNode { at } => {
                write!(f, "allocated block at {at:#x} is linked in a free list")
            }
            Self::RegionSizeMismatch { walked, grown } => {
                write!(f, "blocks cover {walked} bytes but the region grew by {grown}")
            }
        }
    }
}

impl std::error::Error for CheckError {}

/// Aggregate numbers gathered by a successful [`Heap::check`] walk. The
/// sentinels and the directory's own block are counted like any other
/// allocated occupant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Blocks between the prologue and the epilogue.
    pub blocks: usize,
    /// How many of them are free.
    pub free_blocks: usize,
    /// Bytes held by free blocks, tags included.
    pub free_bytes: usize,
    /// Bytes held by allocated blocks, tags included.
    pub allocated_bytes: usize,
}

impl<P: RegionProvider> Heap<P> {
    /// Walks the whole region from prologue to epilogue and verifies every
    /// invariant the allocator promises to maintain between public
    /// operations: sentinel shapes, payload alignment, header/footer
    /// equality, eager coalescing, free list membership in both directions
    /// and the total region accounting.
    ///
    /// The walk is read only and not part of any hot path; tests call it
    /// after every operation and it doubles as a verbose heap dump when
    /// trace logging is enabled.
    pub fn check(&self) -> Result<HeapStats, CheckError> {
        unsafe {
            let prologue = self.prologue;

            if prologue.size() != DWORD
                || !prologue.is_allocated()
                || prologue.header() != prologue.footer()
                || prologue.payload().as_ptr() as usize % DWORD != 0
            {
                return Err(CheckError::BadPrologue);
            }

            let mut stats = HeapStats::default();
            // Pad word, prologue, epilogue; every other byte must be
            // accounted for by the blocks we walk.
            let mut walked = 4 * WORD;
            let mut prev_free = false;
            let mut block = prologue.next();

            while !block.is_epilogue() {
                let at = block.payload().as_ptr() as usize;
                let size = block.size();

                trace!(
                    "block at {at:#x}: size {size}, {}",
                    if block.is_allocated() { "allocated" } else { "free" }
                );

                if at % DWORD != 0 {
                    return Err(CheckError::MisalignedPayload { at });
                }
                if block.header() != block.footer() {
                    return Err(CheckError::TagMismatch { at });
                }
                if size % DWORD != 0 || size < MIN_BLOCK_SIZE {
                    return Err(CheckError::BadBlockSize { at, size });
                }

                if block.is_allocated() {
                    stats.allocated_bytes += size;
                    prev_free = false;
                } else {
                    if prev_free {
                        return Err(CheckError::AdjacentFreeBlocks { at });
                    }
                    prev_free = true;
                    stats.free_blocks += 1;
                    stats.free_bytes += size;

                    match self.directory.occurrences(block) {
                        (1, 0) => {}
                        (0, 0) => return Err(CheckError::MissingFromFreeList { at }),
                        (_, 0) => return Err(CheckError::DuplicatedInFreeList { at }),
                        _ => return Err(CheckError::WrongClass { at }),
                    }
                }

                stats.blocks += 1;
                walked += size;
                block = block.next();
            }

            if !block.is_allocated() {
                return Err(CheckError::BadEpilogue);
            }

            if walked != self.grown {
                return Err(CheckError::RegionSizeMismatch {
                    walked,
                    grown: self.grown,
                });
            }

            // Cross check from the directory's side: every linked node must
            // be a free block sitting in the list its size dictates.
            for class in 0..CLASS_COUNT {
                let mut current = self.directory.class_head(class);

                while let Some(node) = current {
                    let listed = BlockPtr::from_payload(node.cast());
                    let at = listed.payload().as_ptr() as usize;

                    if listed.is_allocated() {
                        return Err(CheckError::StrayListNode { at });
                    }
                    if class_of(listed.size()) != class {
                        return Err(CheckError::WrongClass { at });
                    }

                    current = node.as_ref().next;
                }
            }

            Ok(stats)
        }
    }
}
