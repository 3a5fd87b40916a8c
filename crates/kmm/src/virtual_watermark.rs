//! Freeing watermark over non-backed ranges.
//!
//! Unlike the physical watermark, this allocator can give memory back. Each
//! managed region keeps two lists of [`RangeNode`] descriptors: one for live
//! allocations and one for free spans. Allocation first-fits over the free
//! list, splitting a span when it is larger than the request; freeing moves
//! the descriptor back and coalesces adjacent free spans in a single linear
//! pass.
//!
//! Descriptor storage is pluggable through [`NodeSource`]. The running
//! kernel backs it with the general allocator; during PMM bootstrap, before
//! any general allocator exists, the manager supplies a
//! [`BootstrapNodePool`] carved out of the physical watermark instead.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::address::LinearAddress;

/// Errors reported by the virtual watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualWatermarkError {
    /// Region base is null or the length is zero.
    BadRegion,
    /// The node source could not supply a descriptor.
    NodesExhausted,
}

/// Descriptor of one contiguous span, linked into either the allocated or
/// the free list of its region.
#[repr(C)]
pub struct RangeNode {
    base: usize,
    ceil: usize,
    next: *mut RangeNode,
}

/// Supplier of [`RangeNode`] storage.
///
/// `alloc_node` may return uninitialized storage; the watermark overwrites
/// every field before linking a node anywhere.
pub trait NodeSource {
    /// Hands out storage for one descriptor, or None when exhausted.
    fn alloc_node(&self) -> Option<NonNull<RangeNode>>;

    /// Takes back a descriptor previously returned by `alloc_node`.
    fn release_node(&self, node: NonNull<RangeNode>);
}

/// Per-region state: the span bounds and the two descriptor lists.
#[repr(C)]
pub struct VirtualWatermarkMeta {
    base: usize,
    ceil: usize,
    allocated: spin::Mutex<*mut RangeNode>,
    free: spin::Mutex<*mut RangeNode>,
    next: *mut VirtualWatermarkMeta,
}

/// A freeing watermark allocator over one or more non-backed ranges.
pub struct VirtualWatermark<S: NodeSource> {
    /// Region list; doubles as the ordering lock over region traversal.
    head: spin::Mutex<*mut VirtualWatermarkMeta>,
    source: S,
}

// SAFETY: All raw pointers are reached only under the ordering lock or the
// per-meta list locks; descriptor memory is owned by the node source.
unsafe impl<S: NodeSource + Send> Send for VirtualWatermark<S> {}
unsafe impl<S: NodeSource + Sync> Sync for VirtualWatermark<S> {}

impl<S: NodeSource> VirtualWatermark<S> {
    /// Creates an empty watermark drawing descriptors from `source`.
    pub const fn new(source: S) -> Self {
        Self {
            head: spin::Mutex::new(ptr::null_mut()),
            source,
        }
    }

    /// Initializes `meta` in place to manage `[base, base + len)` and links
    /// it into the region list.
    ///
    /// The caller provides the meta storage; the watermark provides the
    /// initial free-span descriptor from its node source.
    pub fn add_region(
        &self,
        meta: NonNull<VirtualWatermarkMeta>,
        base: LinearAddress,
        len: usize,
    ) -> Result<(), VirtualWatermarkError> {
        if base.as_usize() == 0 || len == 0 {
            return Err(VirtualWatermarkError::BadRegion);
        }

        let node = self
            .source
            .alloc_node()
            .ok_or(VirtualWatermarkError::NodesExhausted)?;

        // SAFETY: The source hands us exclusive storage for one node.
        unsafe {
            ptr::write(
                node.as_ptr(),
                RangeNode {
                    base: base.as_usize(),
                    ceil: base.as_usize() + len,
                    next: ptr::null_mut(),
                },
            );
        }

        let mut head = self.head.lock();
        // SAFETY: The caller hands over uninitialized meta storage for our
        // exclusive use.
        unsafe {
            ptr::write(
                meta.as_ptr(),
                VirtualWatermarkMeta {
                    base: base.as_usize(),
                    ceil: base.as_usize() + len,
                    allocated: spin::Mutex::new(ptr::null_mut()),
                    free: spin::Mutex::new(node.as_ptr()),
                    next: *head,
                },
            );
        }
        *head = meta.as_ptr();

        Ok(())
    }

    /// Allocates `size` bytes from the first free span that fits.
    pub fn alloc(&self, size: usize) -> Option<LinearAddress> {
        if size == 0 {
            return None;
        }

        let order = self.head.lock();
        let mut current = *order;
        while !current.is_null() {
            // SAFETY: Metas are initialized before linking and never torn down.
            let meta = unsafe { &*current };

            if let Some(addr) = self.alloc_in_meta(meta, size) {
                return Some(addr);
            }

            current = meta.next;
        }

        None
    }

    /// First-fit within one region.
    fn alloc_in_meta(&self, meta: &VirtualWatermarkMeta, size: usize) -> Option<LinearAddress> {
        let mut free = meta.free.lock();

        let mut prev: *mut RangeNode = ptr::null_mut();
        let mut current = *free;
        while !current.is_null() {
            // SAFETY: Nodes on the free list are owned by it while linked.
            let node = unsafe { &mut *current };
            let span = node.ceil - node.base;

            if span < size {
                prev = current;
                current = node.next;
                continue;
            }

            let taken = if span == size {
                // Consume the descriptor whole.
                if prev.is_null() {
                    *free = node.next;
                } else {
                    // SAFETY: prev is a list node we just walked over.
                    unsafe { (*prev).next = node.next };
                }
                node.next = ptr::null_mut();
                current
            } else {
                // Split: a fresh descriptor tracks the allocated prefix, the
                // existing one keeps the shrunken remainder. Nothing is
                // mutated until the descriptor is secured.
                let fresh = self.source.alloc_node()?;
                // SAFETY: Exclusive uninitialized storage from the source.
                unsafe {
                    ptr::write(
                        fresh.as_ptr(),
                        RangeNode {
                            base: node.base,
                            ceil: node.base + size,
                            next: ptr::null_mut(),
                        },
                    );
                }
                node.base += size;
                fresh.as_ptr()
            };

            drop(free);

            // SAFETY: taken was unlinked or freshly written above.
            let base = unsafe { (*taken).base };
            let mut allocated = meta.allocated.lock();
            // SAFETY: taken is exclusively ours until linked here.
            unsafe { (*taken).next = *allocated };
            *allocated = taken;

            return Some(LinearAddress::new(base));
        }

        None
    }

    /// Frees the allocation starting at `addr`, returning the number of
    /// bytes released, or 0 if no region owns such an allocation.
    pub fn free(&self, addr: LinearAddress) -> usize {
        let a = addr.as_usize();

        let order = self.head.lock();
        let mut current = *order;
        while !current.is_null() {
            // SAFETY: Metas are initialized before linking and never torn down.
            let meta = unsafe { &*current };

            if a >= meta.base && a < meta.ceil {
                return self.free_in_meta(meta, a);
            }

            current = meta.next;
        }

        0
    }

    fn free_in_meta(&self, meta: &VirtualWatermarkMeta, addr: usize) -> usize {
        // Detach the descriptor from the allocated list.
        let node = {
            let mut allocated = meta.allocated.lock();
            let mut prev: *mut RangeNode = ptr::null_mut();
            let mut current = *allocated;
            loop {
                if current.is_null() {
                    return 0;
                }
                // SAFETY: Nodes on the allocated list are owned by it.
                let n = unsafe { &mut *current };
                if n.base == addr {
                    if prev.is_null() {
                        *allocated = n.next;
                    } else {
                        // SAFETY: prev was walked over in this loop.
                        unsafe { (*prev).next = n.next };
                    }
                    n.next = ptr::null_mut();
                    break current;
                }
                prev = current;
                current = n.next;
            }
        };

        // SAFETY: node was just unlinked, we own it exclusively.
        let bytes = unsafe { (*node).ceil - (*node).base };

        // Insert into the free list sorted by base, then coalesce adjacent
        // spans in one linear pass.
        let mut free = meta.free.lock();

        let mut prev: *mut RangeNode = ptr::null_mut();
        let mut current = *free;
        // SAFETY: node is ours; list nodes are owned by the list.
        unsafe {
            while !current.is_null() && (*current).base < (*node).base {
                prev = current;
                current = (*current).next;
            }
            (*node).next = current;
            if prev.is_null() {
                *free = node;
            } else {
                (*prev).next = node;
            }
        }

        // Merge pass.
        let mut current = *free;
        while !current.is_null() {
            // SAFETY: All nodes reached here are linked into the free list,
            // which we hold the lock for.
            unsafe {
                let next = (*current).next;
                if !next.is_null() && (*current).ceil == (*next).base {
                    (*current).ceil = (*next).ceil;
                    (*current).next = (*next).next;
                    self.source.release_node(NonNull::new_unchecked(next));
                    continue;
                }
                current = next;
            }
        }

        bytes
    }

    /// Total bytes sitting on free lists across all regions.
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;

        let order = self.head.lock();
        let mut current = *order;
        while !current.is_null() {
            // SAFETY: Metas are initialized before linking.
            let meta = unsafe { &*current };
            let free = meta.free.lock();
            let mut node = *free;
            while !node.is_null() {
                // SAFETY: List nodes are owned by the locked list.
                unsafe {
                    total += (*node).ceil - (*node).base;
                    node = (*node).next;
                }
            }
            current = meta.next;
        }

        total
    }
}

/// Fixed-capacity descriptor pool for PMM bootstrap.
///
/// Backed by a slab of [`RangeNode`] storage placed through the physical
/// watermark; released descriptors are recycled through an intrusive stack.
pub struct BootstrapNodePool {
    slots: *mut RangeNode,
    capacity: usize,
    next: AtomicUsize,
    recycled: AtomicPtr<RangeNode>,
}

// SAFETY: The slot array is owned by the pool; handout is CAS-guarded.
unsafe impl Send for BootstrapNodePool {}
unsafe impl Sync for BootstrapNodePool {}

impl BootstrapNodePool {
    /// Creates a pool over `capacity` node slots at `storage`.
    ///
    /// # Safety
    ///
    /// `storage` must point to memory for at least `capacity` `RangeNode`s,
    /// aligned for `RangeNode`, exclusively owned by the pool from here on.
    pub unsafe fn new(storage: LinearAddress, capacity: usize) -> Self {
        Self {
            slots: storage.as_mut_ptr(),
            capacity,
            next: AtomicUsize::new(0),
            recycled: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl NodeSource for BootstrapNodePool {
    fn alloc_node(&self) -> Option<NonNull<RangeNode>> {
        // Prefer a recycled descriptor.
        loop {
            let head = self.recycled.load(Ordering::Acquire);
            let Some(node) = NonNull::new(head) else {
                break;
            };
            // SAFETY: Nodes on the recycled stack were released to us.
            let next = unsafe { (*head).next };
            if self
                .recycled
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(node);
            }
        }

        // Fall back to bumping the slab.
        let idx = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .ok()?;
        // SAFETY: idx < capacity, within the storage handed to new().
        NonNull::new(unsafe { self.slots.add(idx) })
    }

    fn release_node(&self, node: NonNull<RangeNode>) {
        loop {
            let head = self.recycled.load(Ordering::Acquire);
            // SAFETY: The caller returns exclusive ownership of the node.
            unsafe { (*node.as_ptr()).next = head };
            if self
                .recycled
                .compare_exchange(head, node.as_ptr(), Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Hhdm, PhysicalAddress};
    use crate::arch;
    use core::mem::size_of;

    /// Heap-backed node source for unit tests.
    struct HeapNodes;

    impl NodeSource for HeapNodes {
        fn alloc_node(&self) -> Option<NonNull<RangeNode>> {
            let node = Box::new(RangeNode {
                base: 0,
                ceil: 0,
                next: ptr::null_mut(),
            });
            NonNull::new(Box::into_raw(node))
        }

        fn release_node(&self, node: NonNull<RangeNode>) {
            // SAFETY: Every node came from Box::into_raw above.
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
    }

    fn meta_storage() -> NonNull<VirtualWatermarkMeta> {
        let meta = Box::new(core::mem::MaybeUninit::<VirtualWatermarkMeta>::uninit());
        NonNull::new(Box::into_raw(meta) as *mut VirtualWatermarkMeta).unwrap()
    }

    /// A managed range; the addresses are never dereferenced by the
    /// watermark itself, so a plain numeric range does fine.
    const RANGE_BASE: usize = 0x4000_0000;
    const RANGE_LEN: usize = 0x10000;

    fn watermark() -> VirtualWatermark<HeapNodes> {
        let wm = VirtualWatermark::new(HeapNodes);
        wm.add_region(
            meta_storage(),
            LinearAddress::new(RANGE_BASE),
            RANGE_LEN,
        )
        .unwrap();
        wm
    }

    #[test]
    fn first_fit_allocates_from_range_start() {
        let wm = watermark();
        let a = wm.alloc(0x1000).unwrap();
        assert_eq!(a.as_usize(), RANGE_BASE);

        let b = wm.alloc(0x1000).unwrap();
        assert_eq!(b.as_usize(), RANGE_BASE + 0x1000);
    }

    #[test]
    fn free_returns_span_size() {
        let wm = watermark();
        let a = wm.alloc(0x2000).unwrap();
        assert_eq!(wm.free(a), 0x2000);
    }

    #[test]
    fn free_unknown_address_returns_zero() {
        let wm = watermark();
        wm.alloc(0x1000).unwrap();
        assert_eq!(wm.free(LinearAddress::new(RANGE_BASE + 0x8000)), 0);
        assert_eq!(wm.free(LinearAddress::new(0x100)), 0);
    }

    #[test]
    fn adjacent_frees_coalesce() {
        let wm = watermark();
        let a = wm.alloc(0x1000).unwrap();
        let b = wm.alloc(0x1000).unwrap();
        let c = wm.alloc(0x1000).unwrap();

        // Free out of order; the merge pass has to stitch all three spans
        // (and the tail) back into one.
        assert_eq!(wm.free(b), 0x1000);
        assert_eq!(wm.free(a), 0x1000);
        assert_eq!(wm.free(c), 0x1000);

        assert_eq!(wm.free_bytes(), RANGE_LEN);
        // The whole range must be allocatable as one span again.
        let whole = wm.alloc(RANGE_LEN).unwrap();
        assert_eq!(whole.as_usize(), RANGE_BASE);
    }

    #[test]
    fn exact_fit_consumes_descriptor() {
        let wm = watermark();
        let a = wm.alloc(RANGE_LEN).unwrap();
        assert_eq!(wm.free_bytes(), 0);
        assert!(wm.alloc(1).is_none());

        assert_eq!(wm.free(a), RANGE_LEN);
        assert_eq!(wm.free_bytes(), RANGE_LEN);
    }

    #[test]
    fn double_free_is_refused() {
        let wm = watermark();
        let a = wm.alloc(0x1000).unwrap();
        assert_eq!(wm.free(a), 0x1000);
        assert_eq!(wm.free(a), 0);
    }

    #[test]
    fn spills_across_regions() {
        let wm = VirtualWatermark::new(HeapNodes);
        wm.add_region(meta_storage(), LinearAddress::new(0x4000_0000), 0x1000)
            .unwrap();
        wm.add_region(meta_storage(), LinearAddress::new(0x5000_0000), 0x4000)
            .unwrap();

        // Too big for one region, fits the other.
        let a = wm.alloc(0x2000).unwrap();
        assert_eq!(a.as_usize(), 0x5000_0000);
    }

    #[test]
    fn bootstrap_pool_recycles_nodes() {
        if Hhdm::try_current().is_none() {
            Hhdm::set_current(Hhdm::emulated(16 * arch::PAGE_SIZE));
        }
        let phys = Hhdm::current()
            .allocate(4 * size_of::<RangeNode>(), align_of::<RangeNode>())
            .unwrap();
        let storage = LinearAddress::from_physical(PhysicalAddress::new(phys));

        // SAFETY: storage covers exactly 4 node slots.
        let pool = unsafe { BootstrapNodePool::new(storage, 4) };

        let nodes: Vec<_> = (0..4).map(|_| pool.alloc_node().unwrap()).collect();
        assert!(pool.alloc_node().is_none());

        pool.release_node(nodes[2]);
        let again = pool.alloc_node().unwrap();
        assert_eq!(again, nodes[2]);
        assert!(pool.alloc_node().is_none());
    }

    #[test]
    fn node_exhaustion_fails_cleanly() {
        if Hhdm::try_current().is_none() {
            Hhdm::set_current(Hhdm::emulated(16 * arch::PAGE_SIZE));
        }
        let phys = Hhdm::current()
            .allocate(2 * size_of::<RangeNode>(), align_of::<RangeNode>())
            .unwrap();
        let storage = LinearAddress::from_physical(PhysicalAddress::new(phys));
        // SAFETY: storage covers exactly 2 node slots.
        let pool = unsafe { BootstrapNodePool::new(storage, 2) };

        let wm = VirtualWatermark::new(pool);
        wm.add_region(meta_storage(), LinearAddress::new(0x4000_0000), 0x10000)
            .unwrap();

        // One descriptor left: first split uses it, second split must fail
        // without corrupting the free list.
        assert!(wm.alloc(0x1000).is_some());
        assert!(wm.alloc(0x1000).is_none());
        assert_eq!(wm.free_bytes(), 0x10000 - 0x1000);
    }
}
