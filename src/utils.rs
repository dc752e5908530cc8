//! Small helpers that don't belong to any particular module of the
//! allocator.

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two. We use this to round block sizes up to
/// the double word boundary and to round raw addresses up when a region
/// provider hands us storage that is only word aligned.
pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
