use std::ptr::NonNull;

use crate::block::BlockPtr;

/// Non-null pointer to `T`, or nothing. Same niche layout as a raw pointer,
/// which matters because these links are stored as bare words inside the
/// managed region.
pub(crate) type Link = Option<NonNull<FreeNode>>;

/// Number of size classes in the directory.
pub(crate) const CLASS_COUNT: usize = 8;

/// Upper bounds of the first `CLASS_COUNT - 1` size classes in bytes. The
/// last class is unbounded and catches everything larger.
const CLASS_LIMITS: [usize; CLASS_COUNT - 1] = [64, 128, 256, 512, 1024, 2048, 4096];

/// The two link words threaded through the payload of every free block.
///
/// A free block's payload is not used by anyone, so its first two words are
/// ours to repurpose:
///
/// ```text
///             +---------------------+
///             |       header        |
/// payload --> +---------------------+ <--+
///             |      prev link      |    |
///             +---------------------+    | FreeNode
///             |      next link      |    |
///             +---------------------+ <--+
///             |   rest of payload   |
///             |     (not used)      |
///             +---------------------+
///             |       footer        |
///             +---------------------+
/// ```
///
/// The minimum block size guarantees there is always room for both links.
/// The moment a block is handed out these words belong to the caller again,
/// so the block must be unlinked *before* any mutation that could overwrite
/// them, and linked only after its tags are marked free.
#[repr(C)]
pub(crate) struct FreeNode {
    pub prev: Link,
    pub next: Link,
}

/// Maps a block size in bytes to its size class index. Total function: sizes
/// above the last bound land in the final class.
#[inline]
pub(crate) fn class_of(size: usize) -> usize {
    CLASS_LIMITS
        .iter()
        .position(|&limit| size <= limit)
        .unwrap_or(CLASS_COUNT - 1)
}

/// The segregated free list directory: one head link per size class, each
/// heading an unordered doubly linked list of free blocks of that class.
///
/// The head links themselves live *inside the managed region*, in a block
/// reserved during heap initialization, so the directory only stores a
/// pointer to them. Insertion is at the head, which makes both `insert` and
/// `remove` O(1) and gives most-recently-freed-first ordering within a
/// class.
pub(crate) struct Directory {
    /// Pointer to `CLASS_COUNT` consecutive head links.
    heads: NonNull<Link>,
}

impl Directory {
    /// Frames `storage` as the directory's head array.
    ///
    /// # Safety
    ///
    /// `storage` must point to at least `CLASS_COUNT` writable words that
    /// stay valid for the lifetime of the directory.
    pub unsafe fn new(storage: NonNull<u8>) -> Self {
        Self {
            heads: storage.cast(),
        }
    }

    #[inline]
    unsafe fn head_ptr(&self, class: usize) -> *mut Link {
        debug_assert!(class < CLASS_COUNT);
        unsafe { self.heads.as_ptr().add(class) }
    }

    /// Head of one class list. Used by the consistency checker to walk the
    /// directory without mutating it.
    #[inline]
    pub(crate) unsafe fn class_head(&self, class: usize) -> Link {
        unsafe { *self.head_ptr(class) }
    }

    /// Resets every class to an empty list.
    pub unsafe fn clear(&mut self) {
        for class in 0..CLASS_COUNT {
            unsafe { *self.head_ptr(class) = None };
        }
    }

    /// Pushes a free block at the head of the list for its size class.
    ///
    /// # Safety
    ///
    /// `block` must be marked free with valid tags and must not already be in
    /// any list; its first two payload words are overwritten here.
    pub unsafe fn insert(&mut self, block: BlockPtr) {
        unsafe {
            debug_assert!(!block.is_allocated());

            let head = self.head_ptr(class_of(block.size()));
            let node = block.payload().cast::<FreeNode>();

            node.as_ptr().write(FreeNode {
                prev: None,
                next: *head,
            });

            if let Some(mut old_head) = *head {
                old_head.as_mut().prev = Some(node);
            }

            *head = Some(node);
        }
    }

    /// Unlinks a free block from its class list using the block's own links.
    ///
    /// # Safety
    ///
    /// `block` must currently be linked into the list for `class_of` of its
    /// size, with its link words intact.
    pub unsafe fn remove(&mut self, block: BlockPtr) {
        unsafe {
            let node = block.payload().cast::<FreeNode>();
            let FreeNode { prev, next } = node.as_ptr().read();

            match prev {
                Some(mut prev) => prev.as_mut().next = next,
                // No predecessor means we were the head of our class.
                None => *self.head_ptr(class_of(block.size())) = next,
            }

            if let Some(mut next) = next {
                next.as_mut().prev = prev;
            }
        }
    }

    /// First-fit search: scans the class that `asize` maps to and then every
    /// higher class, returning the first block whose size is at least
    /// `asize`. Within a class the scan follows insertion order, so the most
    /// recently freed block wins.
    pub unsafe fn find_fit(&self, asize: usize) -> Option<BlockPtr> {
        for class in class_of(asize)..CLASS_COUNT {
            let mut current = unsafe { self.class_head(class) };

            while let Some(node) = current {
                unsafe {
                    let block = BlockPtr::from_payload(node.cast());

                    if block.size() >= asize {
                        return Some(block);
                    }

                    current = node.as_ref().next;
                }
            }
        }

        None
    }

    /// Counts how many times `block` is linked anywhere in the directory,
    /// split into occurrences in its own class and occurrences elsewhere.
    /// Only the consistency checker cares; a healthy heap has every free
    /// block at exactly `(1, 0)` and every allocated block at `(0, 0)`.
    pub(crate) unsafe fn occurrences(&self, block: BlockPtr) -> (usize, usize) {
        let own_class = unsafe { class_of(block.size()) };
        let target = block.payload().cast::<FreeNode>();
        let mut own = 0;
        let mut elsewhere = 0;

        for class in 0..CLASS_COUNT {
            let mut current = unsafe { self.class_head(class) };

            while let Some(node) = current {
                if node == target {
                    if class == own_class {
                        own += 1;
                    } else {
                        elsewhere += 1;
                    }
                }
                current = unsafe { node.as_ref().next };
            }
        }

        (own, elsewhere)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::WORD;

    #[test]
    fn classes_match_size_bounds() {
        assert_eq!(class_of(32), 0);
        assert_eq!(class_of(64), 0);
        assert_eq!(class_of(65), 1);
        assert_eq!(class_of(128), 1);
        assert_eq!(class_of(256), 2);
        assert_eq!(class_of(512), 3);
        assert_eq!(class_of(1024), 4);
        assert_eq!(class_of(2048), 5);
        assert_eq!(class_of(4096), 6);
        assert_eq!(class_of(4097), 7);
        assert_eq!(class_of(usize::MAX & !15), 7);
    }

    /// Storage for hand-built blocks plus a directory head array.
    #[repr(align(16))]
    struct Arena([usize; 64]);

    /// Frames three free blocks inside `arena` and returns them along with a
    /// directory whose heads live at the start of the arena.
    unsafe fn build(arena: &mut Arena, sizes: [usize; 3]) -> (Directory, [BlockPtr; 3]) {
        unsafe {
            let base = NonNull::new(arena.0.as_mut_ptr().cast::<u8>()).unwrap();
            let mut directory = Directory::new(base);
            directory.clear();

            // Blocks start after the head array, one word reserved for the
            // first header.
            let first = BlockPtr::from_payload(
                NonNull::new(arena.0.as_mut_ptr().add(CLASS_COUNT + 1).cast()).unwrap(),
            );
            first.write_tags(sizes[0], false);
            let second = first.next();
            second.write_tags(sizes[1], false);
            let third = second.next();
            third.write_tags(sizes[2], false);

            (directory, [first, second, third])
        }
    }

    #[test]
    fn insert_is_lifo_within_a_class() {
        let mut arena = Arena([0; 64]);

        unsafe {
            let (mut directory, [first, second, _]) =
                build(&mut arena, [4 * WORD, 4 * WORD, 4 * WORD]);

            directory.insert(first);
            directory.insert(second);

            // Both are class 0 on 64 bit; the most recently inserted one must
            // be served first.
            assert_eq!(directory.find_fit(4 * WORD), Some(second));

            directory.remove(second);
            assert_eq!(directory.find_fit(4 * WORD), Some(first));

            directory.remove(first);
            assert_eq!(directory.find_fit(4 * WORD), None);
        }
    }

    #[test]
    fn remove_from_the_middle_relinks_neighbors() {
        let mut arena = Arena([0; 64]);

        unsafe {
            let (mut directory, blocks) = build(&mut arena, [4 * WORD, 4 * WORD, 4 * WORD]);

            for block in blocks {
                directory.insert(block);
            }

            // List order is now: third, second, first.
            directory.remove(blocks[1]);

            assert_eq!(directory.occurrences(blocks[1]), (0, 0));
            assert_eq!(directory.occurrences(blocks[0]), (1, 0));
            assert_eq!(directory.occurrences(blocks[2]), (1, 0));

            // The survivors must still be reachable through the list.
            assert_eq!(directory.find_fit(4 * WORD), Some(blocks[2]));
            directory.remove(blocks[2]);
            assert_eq!(directory.find_fit(4 * WORD), Some(blocks[0]));
        }
    }

    #[test]
    fn find_fit_escalates_to_higher_classes() {
        let mut arena = Arena([0; 64]);

        unsafe {
            // 32 byte block in class 0, 96 byte block in class 1.
            let (mut directory, [small, big, _]) =
                build(&mut arena, [4 * WORD, 12 * WORD, 4 * WORD]);

            directory.insert(small);
            directory.insert(big);

            // A request that fits class 0 bounds but not the resident block
            // must climb to class 1.
            if WORD == 8 {
                assert_eq!(directory.find_fit(6 * WORD), Some(big));
            }
            assert_eq!(directory.find_fit(12 * WORD), Some(big));
            assert_eq!(directory.find_fit(13 * WORD), None);
        }
    }
}
