//! Sub-page object allocation.
//!
//! Eight freelists covering eight contiguous power-of-two size classes,
//! from `2^lowest_exp` up to `2^(lowest_exp + 7)`. Each class grows on
//! demand by pulling pages from the manager and carving a fresh freelist
//! range over them; ownership of a freed address is established by probing
//! the classes in turn.

use core::mem::size_of;

use crate::address::LinearAddress;
use crate::arch;
use crate::freelist::PageFreelist;
use crate::page_source::PageSource;

/// Number of size classes a slab spans.
const CLASS_COUNT: usize = 8;

/// Errors reported when constructing a slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
    /// `lowest_exp` cannot represent a free-chain pointer, or
    /// `pages_per_list` is zero.
    BadParameter,
    /// Not a single class could be backed with memory.
    OutOfMemory,
}

/// A slab allocator over eight power-of-two size classes.
pub struct SlabAllocator {
    lists: [PageFreelist; CLASS_COUNT],
    lowest_exp: usize,
}

impl SlabAllocator {
    /// Creates a slab with classes `2^lowest_exp ..= 2^(lowest_exp + 7)`,
    /// seeding every class with `pages_per_list` pages.
    ///
    /// Classes that cannot be seeded are left empty; they will be retried
    /// on demand. Construction only fails outright when no class got any
    /// memory at all.
    pub fn new<P: PageSource>(
        lowest_exp: usize,
        pages_per_list: usize,
        source: &P,
    ) -> Result<Self, SlabError> {
        if pages_per_list == 0 || (1usize << lowest_exp) < size_of::<*mut ()>() {
            return Err(SlabError::BadParameter);
        }

        let slab = Self {
            lists: [const { PageFreelist::new() }; CLASS_COUNT],
            lowest_exp,
        };

        let extended = slab.expand(pages_per_list, source);
        if extended == 0 {
            return Err(SlabError::OutOfMemory);
        }
        if extended < CLASS_COUNT {
            log::warn!(
                "slab seeded only {} of {} size classes",
                extended,
                CLASS_COUNT
            );
        }

        Ok(slab)
    }

    /// The largest size this slab serves.
    #[inline]
    pub fn largest_object(&self) -> usize {
        1 << (self.lowest_exp + CLASS_COUNT - 1)
    }

    /// Grows every class by `pages_per_list` pages.
    ///
    /// Returns the number of classes successfully extended; on a partial
    /// result the caller decides between retrying and giving up. Extension
    /// stops at the first class the manager cannot back, so the low classes
    /// are always at least as well fed as the high ones.
    pub fn expand<P: PageSource>(&self, pages_per_list: usize, source: &P) -> usize {
        if pages_per_list == 0 {
            return 0;
        }

        for class in 0..CLASS_COUNT {
            let object_size = 1usize << (self.lowest_exp + class);
            let bytes = pages_per_list * arch::PAGE_SIZE;

            let Some(base) = source.alloc_sized(bytes) else {
                log::warn!("slab expansion stopped at class {}: no memory", class);
                return class;
            };

            if self.lists[class]
                .init_range(base, base + bytes, object_size)
                .is_err()
            {
                return class;
            }
        }

        CLASS_COUNT
    }

    /// Allocates `size` bytes, rounded up to the owning class.
    ///
    /// Returns None for zero or oversized requests, and when the class is
    /// empty and cannot be expanded far enough.
    pub fn alloc<P: PageSource>(&self, size: usize, source: &P) -> Option<LinearAddress> {
        if size == 0 || size > self.largest_object() {
            return None;
        }

        let size = size.next_power_of_two();
        let exp = (size.trailing_zeros() as usize).max(self.lowest_exp);
        let class = exp - self.lowest_exp;

        if let Some(addr) = self.lists[class].alloc() {
            return Some(addr);
        }

        // Refill one page per class and retry once, provided the expansion
        // reached our class.
        if self.expand(1, source) > class {
            return self.lists[class].alloc();
        }

        None
    }

    /// Frees the object at `addr`, returning its class size, or 0 when no
    /// class owns the address (the caller then tries the page-level
    /// allocators).
    pub fn free(&self, addr: LinearAddress) -> usize {
        for (class, list) in self.lists.iter().enumerate() {
            if list.free(addr).is_some() {
                return 1 << (self.lowest_exp + class);
            }
        }
        0
    }
}
