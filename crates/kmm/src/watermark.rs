//! Non-freeing watermark allocator.
//!
//! The earliest allocator in the bootstrap chain: a first-fit bump allocator
//! over one or more direct-mapped regions. Nothing placed through it is ever
//! reclaimed, which is exactly right for metadata that must outlive every
//! other allocator. The region header lives in-band at the start of each
//! region; the offset is advanced with a compare-exchange so the hot path
//! takes no lock.

use core::mem::{align_of, size_of};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::address::LinearAddress;

/// Errors reported by the watermark allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkError {
    /// Region base is null or not pointer-aligned.
    BadRegion,
    /// The region is too small to hold its own header and one allocation.
    TooSmall,
}

/// In-band header of one watermark region.
#[repr(C)]
struct WatermarkRegion {
    /// First allocatable address, just past this header.
    base: usize,
    /// One past the last allocatable address.
    ceil: usize,
    /// Bump offset from `base`.
    off: AtomicUsize,
    next: AtomicPtr<WatermarkRegion>,
}

/// A non-freeing first-fit bump allocator over direct-mapped regions.
pub struct PhysicalWatermark {
    head: AtomicPtr<WatermarkRegion>,
}

// SAFETY: The region list is append-only via CAS and per-region state is
// advanced atomically; region memory is never reclaimed.
unsafe impl Send for PhysicalWatermark {}
unsafe impl Sync for PhysicalWatermark {}

impl PhysicalWatermark {
    /// Creates an empty watermark with no regions.
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Places a region header at `base` and makes `len` bytes (minus the
    /// header) available for allocation.
    pub fn add_region(&self, base: LinearAddress, len: usize) -> Result<(), WatermarkError> {
        let addr = base.as_usize();
        if addr == 0 || addr % align_of::<WatermarkRegion>() != 0 {
            return Err(WatermarkError::BadRegion);
        }
        if len <= size_of::<WatermarkRegion>() {
            return Err(WatermarkError::TooSmall);
        }

        let region = addr as *mut WatermarkRegion;
        // SAFETY: The caller hands over [base, base + len) for the watermark's
        // exclusive use; the bounds checks above leave room for the header.
        unsafe {
            ptr::write(
                region,
                WatermarkRegion {
                    base: addr + size_of::<WatermarkRegion>(),
                    ceil: addr + len,
                    off: AtomicUsize::new(0),
                    next: AtomicPtr::new(ptr::null_mut()),
                },
            );
        }

        // Push onto the region list.
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: region was just initialized above.
            unsafe { (*region).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange(head, region, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        log::debug!(
            "watermark region added: {:#x}..{:#x}",
            addr,
            addr + len
        );

        Ok(())
    }

    /// Allocates `size` bytes aligned to `align` from the first region with
    /// room, or returns None when every region is exhausted.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn alloc(&self, size: usize, align: usize) -> Option<LinearAddress> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        if size == 0 {
            return None;
        }

        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            // SAFETY: Region headers are written before being linked and never
            // torn down.
            let region = unsafe { &*current };

            let mut claimed = None;
            let result = region.off.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |off| {
                    let aligned = (region.base + off + align - 1) & !(align - 1);
                    let end = aligned + size;
                    if end > region.ceil {
                        return None;
                    }
                    claimed = Some(aligned);
                    Some(end - region.base)
                },
            );

            if result.is_ok() {
                return claimed.map(LinearAddress::new);
            }

            current = region.next.load(Ordering::Acquire);
        }

        None
    }

    /// Returns the number of bytes still allocatable across all regions,
    /// ignoring alignment loss.
    pub fn remaining(&self) -> usize {
        let mut total = 0;
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            // SAFETY: Same as in alloc; regions are immortal once linked.
            let region = unsafe { &*current };
            total += region.ceil - region.base - region.off.load(Ordering::Acquire);
            current = region.next.load(Ordering::Acquire);
        }
        total
    }
}

impl Default for PhysicalWatermark {
    fn default() -> Self {
        Self::new()
    }
}
