//! Binary-buddy allocator over power-of-two regions.
//!
//! A [`BuddyPool`] manages regions of `2^exp` bytes whose blocks range from
//! `2^min_exp` up to the full region. Splitting walks a free block down to
//! the requested size, pushing the upper halves onto the per-level free
//! lists; freeing walks back up, absorbing the sibling block whenever it is
//! free. Two blocks of size `2^k` are buddies iff their offsets from the
//! region base differ in exactly bit `k`, which makes the sibling lookup a
//! single XOR.
//!
//! Block state lives out of band: one byte per smallest-exponent slot
//! records the exponent of the block currently starting there
//! ([`NOT_BLOCK_START`] everywhere else). Free blocks additionally carry an
//! in-band [`BuddyNode`] header whose canary words witness list membership;
//! a block whose canaries do not verify is never handed out and never
//! merged.
//!
//! Region headers come from a dedicated freelist that refills itself from
//! the fast-page pool, and the out-of-band byte array of a region fits one
//! page by construction (the depth cap in `config`), so buddy metadata
//! never allocates through the buddy itself.

use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

#[cfg(feature = "canary")]
use core::sync::atomic::AtomicU64;

use crate::address::LinearAddress;
use crate::arch;
use crate::config;
use crate::freelist::PageFreelist;
use crate::page_source::PageSource;

/// Exponent byte of a slot that is not currently the start of any block.
pub const NOT_BLOCK_START: u8 = 0xFF;

/// Number of per-level free lists a region can need.
const MAX_LEVELS: usize = config::BUDDY_MAX_DEPTH + 1;

/// Errors reported by the buddy allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuddyError {
    /// The pool's exponent span exceeds the depth cap.
    DepthExceeded,
    /// No memory for the region header or the exponent array.
    MetadataExhausted,
}

/// In-band header of a free block.
///
/// Present only while the block sits on a free list; the canaries witness
/// exactly that.
#[repr(C)]
struct BuddyNode {
    canary_low: u64,
    /// Guarded by the region lock.
    next: *mut BuddyNode,
    canary_high: u64,
}

/// Stamps the canary words of a free node.
#[cfg(feature = "canary")]
fn stamp_canaries(node: *mut BuddyNode) {
    // SAFETY: The caller owns the node; atomic release stores make the
    // stamped pattern visible only after the fields are whole.
    unsafe {
        AtomicU64::from_ptr(&raw mut (*node).canary_low).store(config::CANARY_LOW, Ordering::Release);
        AtomicU64::from_ptr(&raw mut (*node).canary_high)
            .store(config::CANARY_HIGH, Ordering::Release);
    }
}

/// Clears the canary words of a node leaving the free lists.
///
/// The release stores matter: the stale free pattern must be gone before
/// any other CPU can reach this block through the exponent array.
#[cfg(feature = "canary")]
fn clear_canaries(node: *mut BuddyNode) {
    // SAFETY: The caller owns the node.
    unsafe {
        AtomicU64::from_ptr(&raw mut (*node).canary_low).store(0, Ordering::Release);
        AtomicU64::from_ptr(&raw mut (*node).canary_high).store(0, Ordering::Release);
    }
}

/// Verifies both canary words of a node.
#[cfg(feature = "canary")]
fn check_canaries(node: *mut BuddyNode) -> bool {
    // SAFETY: The node lies within a region this allocator owns.
    unsafe {
        AtomicU64::from_ptr(&raw mut (*node).canary_low).load(Ordering::Acquire)
            == config::CANARY_LOW
            && AtomicU64::from_ptr(&raw mut (*node).canary_high).load(Ordering::Acquire)
                == config::CANARY_HIGH
    }
}

#[cfg(not(feature = "canary"))]
fn stamp_canaries(_node: *mut BuddyNode) {}

#[cfg(not(feature = "canary"))]
fn clear_canaries(_node: *mut BuddyNode) {}

#[cfg(not(feature = "canary"))]
fn check_canaries(_node: *mut BuddyNode) -> bool {
    true
}

/// One power-of-two region under buddy management.
#[repr(C)]
pub struct BuddyRegion {
    /// Linear address of the region start.
    base: usize,
    exp: usize,
    min_exp: usize,
    /// `2^(exp - min_exp)` exponent bytes, one per smallest slot.
    node_metas: *mut u8,
    /// Free-list heads, indexed by `level - min_exp`.
    free: [AtomicPtr<BuddyNode>; MAX_LEVELS],
    free_count: AtomicUsize,
    /// Guarded by the owning pool's order lock.
    next: *mut BuddyRegion,
    /// Serializes splits and merges, which touch `node_metas` and several
    /// free lists at once.
    lock: spin::Mutex<()>,
}

const _: () = assert!(
    size_of::<BuddyRegion>() <= config::REGION_META_SIZE,
    "region header must fit its freelist object"
);

impl BuddyRegion {
    #[inline]
    fn size(&self) -> usize {
        1 << self.exp
    }

    #[inline]
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size()
    }

    #[inline]
    fn level_index(&self, level: usize) -> usize {
        level - self.min_exp
    }

    #[inline]
    fn slot(&self, offset: usize) -> usize {
        offset >> self.min_exp
    }

    #[inline]
    fn meta(&self, slot: usize) -> u8 {
        // SAFETY: slot < 2^(exp - min_exp); the array spans exactly that.
        unsafe { *self.node_metas.add(slot) }
    }

    #[inline]
    fn set_meta(&self, slot: usize, exp: u8) {
        // SAFETY: As in meta(); mutation happens under the region lock.
        unsafe { *self.node_metas.add(slot) = exp };
    }

    /// True if some free list at `exp_req` or above is non-empty. Advisory:
    /// the answer can go stale the moment it is produced.
    fn has_level(&self, exp_req: usize) -> bool {
        for level in exp_req..=self.exp {
            if !self.free[self.level_index(level)]
                .load(Ordering::Acquire)
                .is_null()
            {
                return true;
            }
        }
        false
    }

    /// Unlinks `node` from the free list at `level`, returning whether it
    /// was actually on it. The scan is the authoritative membership test.
    fn unlink(&self, level: usize, node: *mut BuddyNode) -> bool {
        let head_ptr = &self.free[self.level_index(level)];
        let head = head_ptr.load(Ordering::Acquire);
        if head == node {
            // SAFETY: node is linked; its next field is lock-guarded.
            head_ptr.store(unsafe { (*node).next }, Ordering::Release);
            return true;
        }

        let mut prev = head;
        while !prev.is_null() {
            // SAFETY: All nodes reached here are linked under the lock.
            let next = unsafe { (*prev).next };
            if next == node {
                // SAFETY: prev and node are linked under the lock.
                unsafe { (*prev).next = (*node).next };
                return true;
            }
            prev = next;
        }
        false
    }

    /// Pushes `node` onto the free list at `level` with canaries stamped.
    fn push(&self, level: usize, node: *mut BuddyNode) {
        let head_ptr = &self.free[self.level_index(level)];
        // SAFETY: node is exclusively ours until the head store below.
        unsafe { (*node).next = head_ptr.load(Ordering::Acquire) };
        stamp_canaries(node);
        head_ptr.store(node, Ordering::Release);
        self.free_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Allocates one block of `2^exp_req` bytes.
    fn alloc(&self, exp_req: usize) -> Option<LinearAddress> {
        let _guard = self.lock.lock();

        let mut level = (exp_req..=self.exp).find(|&l| {
            !self.free[self.level_index(l)]
                .load(Ordering::Acquire)
                .is_null()
        })?;

        // Pop the serving block.
        let head_ptr = &self.free[self.level_index(level)];
        let node = head_ptr.load(Ordering::Acquire);
        // SAFETY: node is non-null (found above) and linked under the lock.
        head_ptr.store(unsafe { (*node).next }, Ordering::Release);
        self.free_count.fetch_sub(1, Ordering::AcqRel);

        if !check_canaries(node) {
            // Corrupted free block: refuse it and leave it off every list so
            // it can never circulate again.
            log::error!(
                "buddy canary mismatch at {:#x} (level {}), block quarantined",
                node as usize,
                level
            );
            return None;
        }

        let offset = node as usize - self.base;

        // Split down to the requested size, giving the upper half back at
        // each level.
        while level > exp_req {
            level -= 1;
            self.set_meta(self.slot(offset), level as u8);

            let buddy_offset = offset ^ (1 << level);
            self.set_meta(self.slot(buddy_offset), level as u8);
            self.push(level, (self.base + buddy_offset) as *mut BuddyNode);
        }

        // The block is allocated now: the stale free pattern must not be
        // observable once the lock is released.
        clear_canaries(node);

        Some(LinearAddress::new(node as usize))
    }

    /// Frees the block at `addr`, merging with its buddy as far as
    /// possible. Returns the size of the freed allocation, or 0 if `addr`
    /// does not name an allocated block of this region.
    fn release(&self, addr: usize) -> usize {
        if !self.contains(addr) {
            return 0;
        }
        let offset = addr - self.base;
        if offset & ((1 << self.min_exp) - 1) != 0 {
            return 0;
        }

        let _guard = self.lock.lock();

        let freed_exp = self.meta(self.slot(offset));
        if freed_exp == NOT_BLOCK_START {
            log::warn!("free of {:#x}: not the start of any block", addr);
            return 0;
        }
        let freed_exp = freed_exp as usize;
        if freed_exp < self.min_exp || freed_exp > self.exp || offset & ((1 << freed_exp) - 1) != 0
        {
            log::warn!("free of {:#x}: inconsistent block exponent", addr);
            return 0;
        }

        #[cfg(feature = "canary")]
        {
            if check_canaries(addr as *mut BuddyNode) {
                log::warn!("double free of {:#x}", addr);
                return 0;
            }
            // A stale exponent byte can also name the interior of a block
            // that has since merged upward; such a start lies inside a
            // larger block that is currently free.
            for level in (freed_exp + 1)..=self.exp {
                let ancestor = offset & !((1usize << level) - 1);
                if self.meta(self.slot(ancestor)) == level as u8
                    && check_canaries((self.base + ancestor) as *mut BuddyNode)
                {
                    log::warn!("free of {:#x}: inside a free block", addr);
                    return 0;
                }
            }
        }

        let mut level = freed_exp;
        let mut offset = offset;
        while level < self.exp {
            let buddy_offset = offset ^ (1 << level);
            if self.meta(self.slot(buddy_offset)) != level as u8 {
                break;
            }
            let buddy = (self.base + buddy_offset) as *mut BuddyNode;
            if !check_canaries(buddy) {
                // Buddy is allocated (its exponent byte matches but it holds
                // no free pattern).
                break;
            }
            if !self.unlink(level, buddy) {
                break;
            }
            // The absorbed buddy must never look free again.
            clear_canaries(buddy);
            self.free_count.fetch_sub(1, Ordering::AcqRel);

            // The lower-addressed member represents the merged block.
            offset = offset.min(buddy_offset);
            level += 1;
            self.set_meta(self.slot(offset), level as u8);
        }

        self.set_meta(self.slot(offset), level as u8);
        self.push(level, (self.base + offset) as *mut BuddyNode);

        1 << freed_exp
    }

    /// Free bytes across all levels of this region.
    fn free_bytes(&self) -> usize {
        let _guard = self.lock.lock();
        let mut total = 0;
        for level in self.min_exp..=self.exp {
            let mut node = self.free[self.level_index(level)].load(Ordering::Acquire);
            while !node.is_null() {
                total += 1usize << level;
                // SAFETY: Linked nodes are lock-guarded.
                node = unsafe { (*node).next };
            }
        }
        total
    }
}

/// A set of same-geometry buddy regions plus the freelist their headers
/// live in.
pub struct BuddyPool {
    /// Region list; doubles as the ordering lock over region traversal.
    head: spin::Mutex<*mut BuddyRegion>,
    /// Dedicated header pool, refilled from the fast-page pool.
    metas: PageFreelist,
    exp: usize,
    min_exp: usize,
}

// SAFETY: Region traversal happens under the order lock; region internals
// are lock- and atomic-guarded.
unsafe impl Send for BuddyPool {}
unsafe impl Sync for BuddyPool {}

impl BuddyPool {
    /// Creates an empty pool of `2^exp`-byte regions with blocks down to
    /// `2^min_exp`.
    pub const fn new(exp: usize, min_exp: usize) -> Self {
        Self {
            head: spin::Mutex::new(ptr::null_mut()),
            metas: PageFreelist::new(),
            exp,
            min_exp,
        }
    }

    /// The region exponent of this pool.
    pub fn region_exp(&self) -> usize {
        self.exp
    }

    /// Turns `block` (a naturally-aligned `2^exp`-byte span) into a fresh
    /// region with a single top-level free block.
    pub fn init_region<P: PageSource>(
        &self,
        block: LinearAddress,
        source: &P,
    ) -> Result<(), BuddyError> {
        if self.exp - self.min_exp > config::BUDDY_MAX_DEPTH {
            return Err(BuddyError::DepthExceeded);
        }

        // Region header from the dedicated pool; grow it by one fast page
        // when dry.
        let header = match self.metas.alloc() {
            Some(header) => header,
            None => {
                let page = source.alloc_page().ok_or(BuddyError::MetadataExhausted)?;
                self.metas
                    .init_range(page, page + arch::PAGE_SIZE, config::REGION_META_SIZE)
                    .map_err(|_| BuddyError::MetadataExhausted)?;
                self.metas.alloc().ok_or(BuddyError::MetadataExhausted)?
            }
        };

        // Exponent array: one byte per smallest slot, at most one page by
        // the depth cap.
        let Some(metas_page) = source.alloc_page() else {
            self.metas.free(header);
            return Err(BuddyError::MetadataExhausted);
        };
        let slots = 1usize << (self.exp - self.min_exp);
        // SAFETY: The page is ours and slots <= PAGE_SIZE by the depth cap.
        unsafe { ptr::write_bytes(metas_page.as_mut_ptr::<u8>(), NOT_BLOCK_START, slots) };

        let region = header.as_mut_ptr::<BuddyRegion>();
        // SAFETY: header points at an exclusive REGION_META_SIZE object,
        // large enough per the size assertion above.
        unsafe {
            ptr::write(
                region,
                BuddyRegion {
                    base: block.as_usize(),
                    exp: self.exp,
                    min_exp: self.min_exp,
                    node_metas: metas_page.as_mut_ptr(),
                    free: [const { AtomicPtr::new(ptr::null_mut()) }; MAX_LEVELS],
                    free_count: AtomicUsize::new(0),
                    next: ptr::null_mut(),
                    lock: spin::Mutex::new(()),
                },
            );

            // The whole region starts out as one free top-level block.
            let r = &*region;
            r.set_meta(0, self.exp as u8);
            r.push(self.exp, block.as_usize() as *mut BuddyNode);
        }

        let mut head = self.head.lock();
        // SAFETY: The fresh region is exclusively ours until linked.
        unsafe { (*region).next = *head };
        *head = region;

        log::debug!(
            "buddy region at {:#x}: 2^{} bytes, blocks down to 2^{}",
            block.as_usize(),
            self.exp,
            self.min_exp
        );

        Ok(())
    }

    /// Allocates a naturally-aligned block of at least `size` bytes from
    /// the first region that can serve it.
    pub fn alloc(&self, size: usize) -> Option<LinearAddress> {
        if size == 0 {
            return None;
        }
        let size = size.next_power_of_two().max(1 << self.min_exp);
        let exp_req = size.trailing_zeros() as usize;
        if exp_req > self.exp {
            return None;
        }

        let head = self.head.lock();
        let mut current = *head;
        while !current.is_null() {
            // SAFETY: Linked regions are initialized and immortal.
            let region = unsafe { &*current };
            if let Some(addr) = region.alloc(exp_req) {
                return Some(addr);
            }
            current = region.next;
        }
        None
    }

    /// Frees the block at `addr`, returning the size of the original
    /// allocation or 0 when no region of this pool owns it.
    pub fn free(&self, addr: LinearAddress) -> usize {
        let head = self.head.lock();
        let mut current = *head;
        while !current.is_null() {
            // SAFETY: Linked regions are initialized and immortal.
            let region = unsafe { &*current };
            if region.contains(addr.as_usize()) {
                return region.release(addr.as_usize());
            }
            current = region.next;
        }
        0
    }

    /// True if some existing region can serve a `size`-byte block without
    /// carving a new region.
    pub fn can_serve(&self, size: usize) -> bool {
        let size = size.next_power_of_two().max(1 << self.min_exp);
        let exp_req = size.trailing_zeros() as usize;
        if exp_req > self.exp {
            return false;
        }

        let head = self.head.lock();
        let mut current = *head;
        while !current.is_null() {
            // SAFETY: Linked regions are initialized and immortal.
            let region = unsafe { &*current };
            if region.has_level(exp_req) {
                return true;
            }
            current = region.next;
        }
        false
    }

    /// Number of regions in this pool.
    pub fn region_count(&self) -> usize {
        let head = self.head.lock();
        let mut count = 0;
        let mut current = *head;
        while !current.is_null() {
            count += 1;
            // SAFETY: Linked regions are initialized and immortal.
            current = unsafe { (*current).next };
        }
        count
    }

    /// Free bytes across all regions.
    pub fn free_bytes(&self) -> usize {
        let head = self.head.lock();
        let mut total = 0;
        let mut current = *head;
        while !current.is_null() {
            // SAFETY: Linked regions are initialized and immortal.
            let region = unsafe { &*current };
            total += region.free_bytes();
            current = region.next;
        }
        total
    }
}
