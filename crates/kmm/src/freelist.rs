//! Fixed-size object freelists over contiguous ranges.
//!
//! A [`PageFreelist`] is a chain of [`FreelistRange`]s, each a contiguous
//! span partitioned into equally-sized power-of-two objects. The range
//! header lives in-band at the start of the span, consuming as many leading
//! objects as it needs; every remaining object starts out linked into the
//! free chain in ascending address order.
//!
//! The range head is popped and pushed with compare-exchange, so the hot
//! path takes no lock; the list-level ordering lock serializes range
//! traversal, rotation and the ownership scan on free. Allocations are
//! serialized by that lock, which is what makes the unlocked `next` read in
//! the pop loop safe: only an allocation ever unlinks a node, frees only
//! push new heads.

use core::mem::{align_of, size_of};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::address::LinearAddress;

/// Errors reported when constructing a freelist range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreelistError {
    /// Object size is zero, not a power of two, or smaller than a pointer;
    /// or the base is misaligned.
    BadParameter,
    /// The span cannot hold the range header plus at least one object.
    TooSmall,
}

/// A free object, linked through its own first word.
#[repr(C)]
struct FreeObject {
    next: *mut FreeObject,
}

/// In-band header of one contiguous range.
///
/// `base` is the address of the first object (past the header) and `ceil`
/// the exclusive end of the last.
#[repr(C)]
pub struct FreelistRange {
    head: AtomicPtr<FreeObject>,
    free_count: AtomicUsize,
    base: usize,
    ceil: usize,
    object_size: usize,
    /// Guarded by the owning list's ordering lock.
    next: *mut FreelistRange,
}

impl FreelistRange {
    /// Constructs a range in place over `[base, ceil)`.
    ///
    /// Returns the header pointer; the header consumes the leading objects
    /// it overlaps, and everything after it is chained free in address
    /// order.
    fn init(
        base: LinearAddress,
        ceil: LinearAddress,
        object_size: usize,
    ) -> Result<ptr::NonNull<FreelistRange>, FreelistError> {
        if !object_size.is_power_of_two() || object_size < size_of::<*mut ()>() {
            return Err(FreelistError::BadParameter);
        }
        if base.as_usize() == 0
            || base.as_usize() % align_of::<FreelistRange>() != 0
            || base.as_usize() >= ceil.as_usize()
        {
            return Err(FreelistError::BadParameter);
        }

        let header_objects = size_of::<FreelistRange>().div_ceil(object_size);
        let first = base.as_usize() + header_objects * object_size;
        let count = (ceil.as_usize().saturating_sub(first)) / object_size;
        if count == 0 {
            return Err(FreelistError::TooSmall);
        }

        // Chain the objects in ascending address order.
        for i in 0..count {
            let object = (first + i * object_size) as *mut FreeObject;
            let next = if i + 1 < count {
                (first + (i + 1) * object_size) as *mut FreeObject
            } else {
                ptr::null_mut()
            };
            // SAFETY: Every object lies in [first, ceil), memory the caller
            // handed over for this range.
            unsafe { ptr::write(object, FreeObject { next }) };
        }

        let header = base.as_usize() as *mut FreelistRange;
        // SAFETY: The header area is part of the span and does not overlap
        // the first object.
        unsafe {
            ptr::write(
                header,
                FreelistRange {
                    head: AtomicPtr::new(first as *mut FreeObject),
                    free_count: AtomicUsize::new(count),
                    base: first,
                    ceil: first + count * object_size,
                    object_size,
                    next: ptr::null_mut(),
                },
            );
        }

        // SAFETY: header was just written and is non-null.
        Ok(unsafe { ptr::NonNull::new_unchecked(header) })
    }

    /// Returns true if `addr` is an object boundary inside this range.
    fn owns(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.ceil && (addr - self.base) % self.object_size == 0
    }

    /// Pops the head object. Only called with the list ordering lock held,
    /// so pops are serialized; concurrent frees can only push new heads,
    /// which the compare-exchange detects.
    fn pop(&self) -> Option<*mut FreeObject> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            // SAFETY: head is a linked free object; it cannot be unlinked
            // from under us because unlinking happens only here, under the
            // ordering lock.
            let next = unsafe { (*head).next };
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.free_count.fetch_sub(1, Ordering::AcqRel);
                return Some(head);
            }
        }
    }

    /// Pushes `addr` as the new head.
    fn push(&self, addr: usize) {
        let object = addr as *mut FreeObject;
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: The object belongs to this range (checked by the
            // caller) and is exclusively ours until the exchange succeeds.
            unsafe { ptr::write(object, FreeObject { next: head }) };
            if self
                .head
                .compare_exchange(head, object, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                self.free_count.fetch_add(1, Ordering::AcqRel);
                return;
            }
        }
    }

    /// Current number of free objects.
    pub fn free_objects(&self) -> usize {
        self.free_count.load(Ordering::Acquire)
    }

    /// The configured object size.
    pub fn object_size(&self) -> usize {
        self.object_size
    }
}

/// A logical freelist: linked ranges of identical object size behind one
/// ordering lock.
///
/// The range that last satisfied an allocation is rotated to the head, so
/// the typical allocation touches exactly one range.
pub struct PageFreelist {
    head: spin::Mutex<*mut FreelistRange>,
}

// SAFETY: The range chain is only walked and mutated under the ordering
// lock; range-internal state is atomic.
unsafe impl Send for PageFreelist {}
unsafe impl Sync for PageFreelist {}

impl PageFreelist {
    /// Creates an empty freelist.
    pub const fn new() -> Self {
        Self {
            head: spin::Mutex::new(ptr::null_mut()),
        }
    }

    /// Builds a new range over `[base, ceil)` and links it at the head of
    /// this list.
    ///
    /// All ranges of one list must use the same object size; the first
    /// range added fixes it.
    pub fn init_range(
        &self,
        base: LinearAddress,
        ceil: LinearAddress,
        object_size: usize,
    ) -> Result<(), FreelistError> {
        let mut head = self.head.lock();

        if !head.is_null() {
            // SAFETY: Linked ranges are initialized and immortal.
            let existing = unsafe { &**head };
            if existing.object_size != object_size {
                return Err(FreelistError::BadParameter);
            }
        }

        let range = FreelistRange::init(base, ceil, object_size)?;
        // SAFETY: The fresh header is exclusively ours until linked.
        unsafe { (*range.as_ptr()).next = *head };
        *head = range.as_ptr();

        Ok(())
    }

    /// Allocates one object, or returns None when every range is empty.
    pub fn alloc(&self) -> Option<LinearAddress> {
        let mut head = self.head.lock();

        let mut prev: *mut FreelistRange = ptr::null_mut();
        let mut current = *head;
        while !current.is_null() {
            // SAFETY: Linked ranges are initialized and immortal.
            let range = unsafe { &*current };

            if range.free_objects() > 0 {
                if let Some(object) = range.pop() {
                    // Most-recently-useful: rotate the serving range to the
                    // front. Safe to reorder freely, all ranges share one
                    // object size.
                    if !prev.is_null() {
                        // SAFETY: prev and current are linked ranges under
                        // the ordering lock.
                        unsafe {
                            (*prev).next = (*current).next;
                            (*current).next = *head;
                        }
                        *head = current;
                    }
                    return Some(LinearAddress::from_ptr(object));
                }
            }

            prev = current;
            current = range.next;
        }

        None
    }

    /// Frees the object at `addr`, returning it on success or None if no
    /// range of this list owns the address.
    pub fn free(&self, addr: LinearAddress) -> Option<LinearAddress> {
        let owner = {
            let head = self.head.lock();
            let mut current = *head;
            loop {
                if current.is_null() {
                    return None;
                }
                // SAFETY: Linked ranges are initialized and immortal.
                let range = unsafe { &*current };
                if range.owns(addr.as_usize()) {
                    break current;
                }
                current = range.next;
            }
        };

        // The push itself is lock-free; the range cannot disappear.
        // SAFETY: owner was found linked under the lock above.
        unsafe { (*owner).push(addr.as_usize()) };
        Some(addr)
    }

    /// Returns true if any range of this list owns `addr`.
    pub fn owns(&self, addr: LinearAddress) -> bool {
        let head = self.head.lock();
        let mut current = *head;
        while !current.is_null() {
            // SAFETY: Linked ranges are initialized and immortal.
            let range = unsafe { &*current };
            if range.owns(addr.as_usize()) {
                return true;
            }
            current = range.next;
        }
        false
    }

    /// Total free objects across all ranges.
    pub fn free_objects(&self) -> usize {
        let head = self.head.lock();
        let mut total = 0;
        let mut current = *head;
        while !current.is_null() {
            // SAFETY: Linked ranges are initialized and immortal.
            let range = unsafe { &*current };
            total += range.free_objects();
            current = range.next;
        }
        total
    }

    /// Total free bytes across all ranges.
    pub fn free_bytes(&self) -> usize {
        let head = self.head.lock();
        let mut total = 0;
        let mut current = *head;
        while !current.is_null() {
            // SAFETY: Linked ranges are initialized and immortal.
            let range = unsafe { &*current };
            total += range.free_objects() * range.object_size;
            current = range.next;
        }
        total
    }

    /// Number of ranges linked into this list.
    pub fn range_count(&self) -> usize {
        let head = self.head.lock();
        let mut count = 0;
        let mut current = *head;
        while !current.is_null() {
            count += 1;
            // SAFETY: Linked ranges are initialized and immortal.
            current = unsafe { (*current).next };
        }
        count
    }
}

impl Default for PageFreelist {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Hhdm, PhysicalAddress};
    use crate::arch;
    use std::collections::BTreeSet;

    fn fixture(pages: usize) -> (LinearAddress, LinearAddress) {
        if Hhdm::try_current().is_none() {
            Hhdm::set_current(Hhdm::emulated(256 * arch::PAGE_SIZE));
        }
        let phys = Hhdm::current()
            .allocate(pages * arch::PAGE_SIZE, arch::PAGE_SIZE)
            .unwrap();
        let base = LinearAddress::from_physical(PhysicalAddress::new(phys));
        (base, base + pages * arch::PAGE_SIZE)
    }

    #[test]
    fn init_reserves_header_objects() {
        let (base, ceil) = fixture(4);
        let list = PageFreelist::new();
        list.init_range(base, ceil, arch::PAGE_SIZE).unwrap();

        // One page goes to the header.
        assert_eq!(list.free_objects(), 3);
    }

    #[test]
    fn init_rejects_degenerate_spans() {
        let (base, _) = fixture(1);
        let list = PageFreelist::new();

        assert_eq!(
            list.init_range(base, base + 64, 4),
            Err(FreelistError::BadParameter)
        );
        assert_eq!(
            list.init_range(base, base + 64, 48),
            Err(FreelistError::BadParameter)
        );
        // Room for the header only.
        assert_eq!(
            list.init_range(base, base + 64, 64),
            Err(FreelistError::TooSmall)
        );
    }

    #[test]
    fn drain_yields_every_object_once() {
        let (base, ceil) = fixture(8);
        let list = PageFreelist::new();
        list.init_range(base, ceil, arch::PAGE_SIZE).unwrap();

        let mut seen = BTreeSet::new();
        while let Some(addr) = list.alloc() {
            assert!(seen.insert(addr.as_usize()), "object handed out twice");
            assert!(addr.as_usize() >= base.as_usize() + arch::PAGE_SIZE);
            assert!(addr.as_usize() < ceil.as_usize());
            assert_eq!((addr.as_usize() - base.as_usize()) % arch::PAGE_SIZE, 0);
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(list.free_objects(), 0);
    }

    #[test]
    fn alloc_is_ascending_after_init() {
        let (base, ceil) = fixture(4);
        let list = PageFreelist::new();
        list.init_range(base, ceil, arch::PAGE_SIZE).unwrap();

        let a = list.alloc().unwrap();
        let b = list.alloc().unwrap();
        assert_eq!(b - a, arch::PAGE_SIZE);
    }

    #[test]
    fn free_then_alloc_is_lifo() {
        let (base, ceil) = fixture(4);
        let list = PageFreelist::new();
        list.init_range(base, ceil, arch::PAGE_SIZE).unwrap();

        let a = list.alloc().unwrap();
        let _b = list.alloc().unwrap();
        list.free(a).unwrap();
        assert_eq!(list.alloc().unwrap(), a);
    }

    #[test]
    fn full_cycle_restores_free_count() {
        let (base, ceil) = fixture(6);
        let list = PageFreelist::new();
        list.init_range(base, ceil, arch::PAGE_SIZE).unwrap();

        let initial = list.free_objects();
        let mut held = Vec::new();
        while let Some(a) = list.alloc() {
            held.push(a);
        }
        for a in held {
            list.free(a).unwrap();
        }
        assert_eq!(list.free_objects(), initial);
    }

    #[test]
    fn free_rejects_foreign_and_misaligned_addresses() {
        let (base, ceil) = fixture(4);
        let list = PageFreelist::new();
        list.init_range(base, ceil, arch::PAGE_SIZE).unwrap();

        // Outside any range.
        assert!(list.free(ceil + arch::PAGE_SIZE).is_none());
        // Inside, but not an object boundary.
        let a = list.alloc().unwrap();
        assert!(list.free(a + 128).is_none());
        // The real thing still works.
        assert!(list.free(a).is_some());
    }

    #[test]
    fn ranges_do_not_overlap() {
        let (base_a, ceil_a) = fixture(4);
        let (base_b, ceil_b) = fixture(4);
        let list = PageFreelist::new();
        list.init_range(base_a, ceil_a, arch::PAGE_SIZE).unwrap();
        list.init_range(base_b, ceil_b, arch::PAGE_SIZE).unwrap();

        assert_eq!(list.range_count(), 2);

        let mut seen = BTreeSet::new();
        while let Some(addr) = list.alloc() {
            assert!(seen.insert(addr.as_usize()));
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn mismatched_object_size_is_rejected() {
        let (base_a, ceil_a) = fixture(2);
        let (base_b, ceil_b) = fixture(2);
        let list = PageFreelist::new();
        list.init_range(base_a, ceil_a, arch::PAGE_SIZE).unwrap();
        assert_eq!(
            list.init_range(base_b, ceil_b, 512),
            Err(FreelistError::BadParameter)
        );
    }

    #[test]
    fn exhausted_range_rotates_away() {
        let (base_a, ceil_a) = fixture(2);
        let (base_b, ceil_b) = fixture(4);
        let list = PageFreelist::new();
        list.init_range(base_a, ceil_a, arch::PAGE_SIZE).unwrap();
        list.init_range(base_b, ceil_b, arch::PAGE_SIZE).unwrap();

        // Drain everything; allocations from the second range must still
        // arrive once the first is empty.
        let total = list.free_objects();
        let mut got = 0;
        while list.alloc().is_some() {
            got += 1;
        }
        assert_eq!(got, total);
    }

    #[test]
    fn sub_page_objects() {
        let (base, ceil) = fixture(1);
        let list = PageFreelist::new();
        list.init_range(base, ceil, 64).unwrap();

        // 64 objects per page, one consumed by the header.
        assert_eq!(list.free_objects(), 63);

        let a = list.alloc().unwrap();
        assert_eq!(list.free(a), Some(a));
    }
}
