//! Software emulation for testing and development.
//!
//! This module provides an emulated physical memory space that can run on any
//! host, so the allocators can be exercised without hardware access or a real
//! higher-half direct map.
//!
//! Unlike the hardware targets, the emulated machine has a 32-bit physical
//! address space, which keeps the per-exponent pool arrays small. Pages stay
//! at the full 4 KiB: the bias tables, the buddy depth cap and the canary
//! layout are all page-exponent arithmetic, and shrinking the page would
//! invalidate the one configuration shared with hardware builds.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

/// Maximum number of bits in a physical address for software emulation.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Maximum number of bits in a virtual address for software emulation.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Page size in bytes (4 KiB, same as the hardware targets).
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`]; the lowest exponent served by the page pools.
pub const PAGE_SHIFT: usize = 12;

/// Validates a physical address for software emulation.
///
/// Physical addresses must fit within 32 bits.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1usize << MAX_PHYSICAL_BITS)
}

/// Validates a virtual address for software emulation.
///
/// The emulated machine keeps x86_64's canonical form (bits 47-63 sign-extended
/// from bit 47) so host pointers, which live in the lower half, stay valid.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let sign = 1usize << (MAX_VIRTUAL_BITS - 1);
    let low_mask = (sign << 1) - 1;
    let canonical = if (addr & sign) != 0 {
        addr | !low_mask
    } else {
        addr & low_mask
    };
    canonical == addr
}

/// Emulated physical memory for software simulation.
///
/// Provides a page-aligned host buffer standing in for physical RAM, with a
/// simple bump allocator for placing test fixtures. Emulated physical
/// addresses are byte offsets into the buffer, so any physical alignment
/// computed by the allocators holds for the host pointers as well (up to the
/// page size the buffer itself is aligned to).
pub struct EmulatedMemory {
    memory: NonNull<u8>,
    size: usize,
    /// Next allocation offset (simple bump allocator).
    next_alloc: AtomicUsize,
}

// SAFETY: The buffer is owned by this struct and all mutation of the bump
// offset goes through atomics; the memory content itself is handed out as raw
// physical space whose synchronization is the allocators' problem.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a new zeroed emulated memory region of the specified size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or the host refuses the allocation.
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, PAGE_SIZE).expect("invalid emulated memory size");
        // SAFETY: layout has non-zero size, checked by from_size_align above.
        let ptr = unsafe { alloc_zeroed(layout) };
        let memory = NonNull::new(ptr).expect("failed to allocate emulated memory");

        Self {
            memory,
            size,
            next_alloc: AtomicUsize::new(0),
        }
    }

    /// Allocates a block of memory from the emulated space.
    ///
    /// Returns the physical address of the allocated block, or None if
    /// there's not enough space.
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        loop {
            let current = self.next_alloc.load(Ordering::Relaxed);

            // Align the current offset
            let aligned = (current + align - 1) & !(align - 1);
            let end = aligned + size;

            if end > self.size {
                return None;
            }

            // Try to claim this allocation
            if self
                .next_alloc
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(aligned);
            }
        }
    }

    /// Translates a physical address to a pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size, "physical address out of bounds");
        // SAFETY: phys is within the buffer, checked above.
        unsafe { self.memory.as_ptr().add(phys) }
    }

    /// Translates a pointer back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        // SAFETY: Both pointers derive from the same buffer; the asserts below
        // reject anything else before the offset is used.
        let offset = unsafe { ptr.offset_from(self.memory.as_ptr()) };
        assert!(offset >= 0, "pointer not within emulated memory");
        assert!(
            (offset as usize) < self.size,
            "pointer not within emulated memory"
        );
        offset as usize
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, PAGE_SIZE).unwrap();
        // SAFETY: The pointer was produced by alloc_zeroed with this layout.
        unsafe { dealloc(self.memory.as_ptr(), layout) };
    }
}
