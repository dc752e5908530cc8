use std::ptr::NonNull;

use log::debug;

use crate::{
    block::{DWORD, WORD},
    utils::align_up,
};

/// The allocator's only source of bytes: a single contiguous region of
/// virtual address space that grows monotonically and never shrinks.
///
/// This trait is the seam between the heap and whatever backs it: `sbrk` on
/// unix, reserved-then-committed pages on windows, or a plain in-process
/// arena under test.
///
/// # Safety
///
/// Implementors must uphold the region contract the heap is built on:
///
/// * On success, `grow` returns a pointer to `bytes` freshly usable bytes
///   that are *contiguous with the previously returned bytes* and remain
///   valid and exclusively owned by the caller for the provider's lifetime.
/// * The very first pointer returned is aligned to a double word boundary.
/// * On exhaustion, `None` is returned and the region is unchanged.
pub unsafe trait RegionProvider {
    /// Extends the region by `bytes` (a multiple of the word size) and
    /// returns the address of the new bytes, or `None` on exhaustion.
    fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>>;
}

/// Region provider backed by the program break.
///
/// `sbrk` already behaves exactly like the contract asks: each call returns
/// the previous break, and consecutive calls hand out contiguous memory. The
/// constructor rounds the break up to a double word so the first block
/// payload the heap derives from it lands aligned.
#[cfg(unix)]
pub struct Sbrk {
    _not_send: std::marker::PhantomData<*mut u8>,
}

#[cfg(unix)]
impl Sbrk {
    pub fn new() -> Self {
        unsafe {
            let brk = libc::sbrk(0) as usize;
            let pad = align_up(brk, DWORD) - brk;

            if pad > 0 {
                libc::sbrk(pad as libc::intptr_t);
            }
        }

        Self {
            _not_send: std::marker::PhantomData,
        }
    }
}

#[cfg(unix)]
impl Default for Sbrk {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
unsafe impl RegionProvider for Sbrk {
    fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        debug_assert_eq!(bytes % WORD, 0);

        unsafe {
            let addr = libc::sbrk(bytes as libc::intptr_t);

            if addr == usize::MAX as *mut libc::c_void {
                debug!("sbrk refused a {bytes} byte extension");
                return None;
            }

            Some(NonNull::new_unchecked(addr.cast::<u8>()))
        }
    }
}

/// Region provider for windows, which has no program break. We reserve one
/// large contiguous range up front and commit pages out of it monotonically,
/// which gives the same observable behavior as `sbrk`: contiguous growth up
/// to exhaustion of the reservation.
#[cfg(windows)]
pub struct VirtualRegion {
    /// Start of the reserved range.
    base: NonNull<u8>,
    /// Total bytes reserved; growing past this is exhaustion.
    reserved: usize,
    /// Bytes committed so far, page granular.
    committed: usize,
    /// Bytes actually handed out so far.
    used: usize,
    /// Commit granularity reported by the system.
    page_size: usize,
}

#[cfg(windows)]
impl VirtualRegion {
    /// Default reservation: 1 GiB of address space. Only committed pages
    /// consume real memory.
    pub const DEFAULT_RESERVATION: usize = 1 << 30;

    /// Reserves `reservation` bytes of contiguous address space. Returns
    /// `None` if the reservation itself fails.
    pub fn with_reservation(reservation: usize) -> Option<Self> {
        use std::mem::MaybeUninit;
        use windows::Win32::System::{Memory, SystemInformation};

        unsafe {
            let page_size = {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());
                system_info.assume_init().dwPageSize as usize
            };

            let reserved = align_up(reservation, page_size);
            let base = Memory::VirtualAlloc(
                None,
                reserved,
                Memory::MEM_RESERVE,
                Memory::PAGE_NOACCESS,
            );

            Some(Self {
                base: NonNull::new(base.cast())?,
                reserved,
                committed: 0,
                used: 0,
                page_size,
            })
        }
    }

    pub fn new() -> Option<Self> {
        Self::with_reservation(Self::DEFAULT_RESERVATION)
    }
}

#[cfg(windows)]
unsafe impl RegionProvider for VirtualRegion {
    fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        use windows::Win32::System::Memory;

        debug_assert_eq!(bytes % WORD, 0);

        if self.used + bytes > self.reserved {
            debug!("virtual region reservation exhausted at {} bytes", self.used);
            return None;
        }

        let needed = align_up(self.used + bytes, self.page_size);

        if needed > self.committed {
            unsafe {
                let addr = Memory::VirtualAlloc(
                    Some(self.base.as_ptr().add(self.committed) as *const _),
                    needed - self.committed,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                if addr.is_null() {
                    debug!("commit of {} bytes refused", needed - self.committed);
                    return None;
                }
            }

            self.committed = needed;
        }

        let addr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.used)) };
        self.used += bytes;

        Some(addr)
    }
}

/// Deterministic region provider over an in-process arena with a fixed byte
/// capacity. This is what the tests run the heap against: exhaustion is
/// driven by picking the capacity, not by bullying the operating system.
pub struct FixedRegion {
    storage: Box<[usize]>,
    /// Offset of the first double word aligned byte within `storage`.
    start: usize,
    /// Bytes handed out so far, relative to `start`.
    used: usize,
    /// Usable capacity in bytes.
    capacity: usize,
}

impl FixedRegion {
    /// Creates an arena able to serve `capacity` bytes (rounded up to a
    /// double word) before reporting exhaustion.
    pub fn new(capacity: usize) -> Self {
        let capacity = align_up(capacity, DWORD);
        // One extra double word pays for aligning the base address.
        let storage = vec![0usize; (capacity + DWORD) / WORD].into_boxed_slice();
        let base = storage.as_ptr() as usize;
        let start = align_up(base, DWORD) - base;

        Self {
            storage,
            start,
            used: 0,
            capacity,
        }
    }

    /// Bytes served so far.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes still available before exhaustion.
    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }
}

unsafe impl RegionProvider for FixedRegion {
    fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        debug_assert_eq!(bytes % WORD, 0);

        if self.used + bytes > self.capacity {
            debug!(
                "fixed region exhausted: {} bytes requested, {} remaining",
                bytes,
                self.remaining()
            );
            return None;
        }

        let addr = unsafe {
            self.storage
                .as_mut_ptr()
                .cast::<u8>()
                .add(self.start + self.used)
        };
        self.used += bytes;

        NonNull::new(addr)
    }
}
