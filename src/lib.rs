//! A dynamic memory allocator built on boundary tagged blocks and
//! segregated free lists, managing one contiguous region of address space
//! that only ever grows.
//!
//! The region is obtained from a [`RegionProvider`], an sbrk style monotonic
//! extender. Inside it, every byte belongs to exactly one block framed by a
//! header and footer word, and every free block is threaded through one of
//! eight size class lists whose head links live in the region itself:
//!
//! ```text
//!                     size class directory (in-region)
//!                    +----+----+----+----+---
//!                    | 64 |128 |256 |512 | ...
//!                    +--|-+----+----+--|-+---
//!                       |              |
//!                       v              v
//! +-----+----------+--------+------+-------+------+--------+----------+
//! | pad | prologue | (dir.) | Free | Block | Free | Block  | epilogue |
//! +-----+----------+--------+--|---+-------+--^|--+--------+----------+
//!                              |               |+-- prev link
//!                              +---------------+
//! ```
//!
//! Allocation is first-fit across the size classes with splitting, freeing
//! coalesces eagerly with both physical neighbors, and reallocation grows in
//! place whenever the block borders the end of the region. See [`Heap`] for
//! the full story.
//!
//! The allocator is single threaded and never returns memory to the
//! operating system; both are deliberate.

mod allocator;
mod block;
mod check;
mod freelist;
mod region;
mod utils;

pub use allocator::{Exhausted, Heap};
pub use check::{CheckError, HeapStats};
#[cfg(unix)]
pub use region::Sbrk;
#[cfg(windows)]
pub use region::VirtualRegion;
pub use region::{FixedRegion, RegionProvider};
