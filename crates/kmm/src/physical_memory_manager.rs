//! The physical memory manager.
//!
//! Orchestrates the whole layered subsystem. Starting from the firmware
//! memory map, `init` claims one available range for bootstrap: a physical
//! watermark takes the first two pages for the metadata-node pool, a
//! virtual watermark manages the rest, and the per-exponent freelist and
//! buddy-pool arrays are carved from it before any page allocator exists.
//! Every usable map entry is then partitioned by the zone's bias table:
//! ratioed biases take their share first, greedy biases absorb aligned
//! leftover, and the residual becomes the fast-page stack.
//!
//! After initialization, `alloc` routes a request by its power-of-two
//! exponent: page-sized requests pop the fast stack, exact bias exponents
//! are served by their freelist in O(1), and everything else goes to the
//! buddy pool of the smallest covering bias, carving a fresh buddy region
//! out of the exponent freelist when none has room. `free` retraces the
//! same ownership order.
//!
//! Memory at physical addresses below `config::LOW_MEMORY_LIMIT` forms a
//! separate zone with its own bias table, pools and fast stack, reached
//! through `low_alloc`/`low_free`.

use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::address::{LinearAddress, PhysicalAddress};
use crate::arch;
use crate::buddy::BuddyPool;
use crate::config::{self, Bias};
use crate::freelist::PageFreelist;
use crate::human_size::HumanSize;
use crate::memmap::MemoryMapEntry;
use crate::page_source::PageSource;
use crate::virtual_watermark::{
    BootstrapNodePool, RangeNode, VirtualWatermark, VirtualWatermarkMeta,
};
use crate::watermark::PhysicalWatermark;

/// Errors that end initialization; the kernel cannot run without a working
/// page allocator, so callers are expected to halt on any of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The memory map has no entries.
    EmptyMemoryMap,
    /// No available entry above the low-memory limit can hold the
    /// bootstrap metadata.
    NoBootstrapRange,
    /// The map walk produced no allocatable memory at all.
    NoUsableMemory,
    /// The bias passes carved no freelist pool out of the map. Fast
    /// pages alone cannot back the buddy layer, so this is fatal too.
    NoFreelists,
}

/// Upper bound on bias-table entries considered per zone.
const MAX_BIASES: usize = 8;

/// Descriptor nodes reserved for the bootstrap watermark.
const BOOTSTRAP_NODES: usize = 64;

/// A free page, linked through its own first word.
#[repr(C)]
struct PageNode {
    next: *mut PageNode,
}

/// Lock-free LIFO stack of single pages; the constant-time hot path for
/// page allocation.
struct FastPageStack {
    head: AtomicPtr<PageNode>,
    count: AtomicUsize,
}

impl FastPageStack {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            count: AtomicUsize::new(0),
        }
    }

    /// Pushes the page at `addr` onto the stack.
    fn push(&self, addr: usize) {
        let node = addr as *mut PageNode;
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: The page is handed over by the caller; it is ours
            // until the exchange succeeds.
            unsafe { (*node).next = head };
            if self
                .head
                .compare_exchange(head, node, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                self.count.fetch_add(1, Ordering::AcqRel);
                return;
            }
        }
    }

    /// Attaches a pre-linked chain of `pages` nodes, `first` becoming the
    /// new top of the stack.
    fn push_chain(&self, first: *mut PageNode, last: *mut PageNode, pages: usize) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: The chain is exclusively ours until the exchange.
            unsafe { (*last).next = head };
            if self
                .head
                .compare_exchange(head, first, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                self.count.fetch_add(pages, Ordering::AcqRel);
                return;
            }
        }
    }

    /// Pops the most recently pushed page.
    fn pop(&self) -> Option<usize> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            // SAFETY: head is a linked free page.
            let next = unsafe { (*head).next };
            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                self.count.fetch_sub(1, Ordering::AcqRel);
                return Some(head as usize);
            }
        }
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// One memory zone: the per-exponent pools, the fast-page stack and the
/// bias table that carved them.
struct Zone {
    /// Indexed by block exponent, `0..MAX_PHYSICAL_BITS` (only bias
    /// exponents are ever populated).
    freelists: &'static [PageFreelist],
    /// Buddy pools, same indexing.
    buddies: &'static [BuddyPool],
    fast: FastPageStack,
    biases: &'static [Bias],
    total_bytes: AtomicUsize,
}

/// Point-in-time occupancy of one zone.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes the zone took ownership of during initialization.
    pub total_bytes: usize,
    /// Pages currently on the fast stack.
    pub fast_pages: usize,
    /// Free bytes across the exponent freelists.
    pub freelist_bytes: usize,
    /// Free bytes across the buddy regions.
    pub buddy_bytes: usize,
    /// Number of buddy regions carved so far.
    pub buddy_regions: usize,
}

/// The kernel's physical page allocator.
///
/// All methods take `&self`: internal state is spinlock- or
/// atomic-guarded throughout, so one instance is shared by every CPU.
pub struct PhysicalMemoryManager {
    high: Zone,
    low: Zone,
    /// Bootstrap pages holding the descriptor pool; never reclaimed.
    bootstrap: PhysicalWatermark,
    /// The watermark the pool arrays were carved from; keeps serving
    /// long-lived manager metadata.
    metadata: VirtualWatermark<BootstrapNodePool>,
}

impl PhysicalMemoryManager {
    /// Initializes the manager from the firmware memory map with the
    /// compile-time bias tables.
    ///
    /// The direct map must already be installed via `Hhdm::set_current`.
    pub fn init(memory_map: &[MemoryMapEntry]) -> Result<Self, InitError> {
        Self::with_biases(memory_map, &config::BIASES_HIGH, &config::BIASES_LOW)
    }

    /// Initializes the manager with explicit bias tables. Used by tests and
    /// bring-up tuning; `init` is the production entry point.
    pub fn with_biases(
        memory_map: &[MemoryMapEntry],
        biases_high: &'static [Bias],
        biases_low: &'static [Bias],
    ) -> Result<Self, InitError> {
        if memory_map.is_empty() {
            return Err(InitError::EmptyMemoryMap);
        }

        let width = arch::MAX_PHYSICAL_BITS;
        for bias in biases_high.iter().chain(biases_low.iter()) {
            if bias.exp >= width {
                log::warn!(
                    "bias 2^{} exceeds the {}-bit physical address space, ignored",
                    bias.exp,
                    width
                );
            }
        }

        // Bootstrap footprint: two watermark pages plus the four pool
        // arrays, each padded to whole pages.
        let freelist_array = align_up(width * size_of::<PageFreelist>(), arch::PAGE_SIZE);
        let buddy_array = align_up(width * size_of::<BuddyPool>(), arch::PAGE_SIZE);
        let bootstrap_len = 2 * arch::PAGE_SIZE + 2 * freelist_array + 2 * buddy_array;

        // First available high-memory entry with room for the bootstrap.
        let mut chosen = None;
        for (index, entry) in memory_map.iter().enumerate() {
            if !entry.is_available() {
                continue;
            }
            let Some((base, len)) = entry.page_bounds() else {
                continue;
            };
            if base.as_usize() < config::LOW_MEMORY_LIMIT || len < bootstrap_len {
                continue;
            }
            chosen = Some((index, base));
            break;
        }
        let (bootstrap_index, bootstrap_base) = chosen.ok_or(InitError::NoBootstrapRange)?;
        let bootstrap_linear = LinearAddress::from_physical(bootstrap_base);

        log::info!(
            "bootstrap metadata: {} at {}",
            HumanSize(bootstrap_len),
            bootstrap_base
        );

        // Watermark the first two pages and place the descriptor pool and
        // the region meta in them.
        let bootstrap = PhysicalWatermark::new();
        bootstrap
            .add_region(bootstrap_linear, 2 * arch::PAGE_SIZE)
            .map_err(|_| InitError::NoBootstrapRange)?;

        let nodes = bootstrap
            .alloc(BOOTSTRAP_NODES * size_of::<RangeNode>(), align_of::<RangeNode>())
            .ok_or(InitError::NoBootstrapRange)?;
        // SAFETY: nodes spans BOOTSTRAP_NODES node slots of watermark
        // memory owned by us alone.
        let node_pool = unsafe { BootstrapNodePool::new(nodes, BOOTSTRAP_NODES) };
        let metadata = VirtualWatermark::new(node_pool);

        let meta = bootstrap
            .alloc(
                size_of::<VirtualWatermarkMeta>(),
                align_of::<VirtualWatermarkMeta>(),
            )
            .ok_or(InitError::NoBootstrapRange)?;
        metadata
            .add_region(
                NonNull::new(meta.as_mut_ptr()).ok_or(InitError::NoBootstrapRange)?,
                bootstrap_linear + 2 * arch::PAGE_SIZE,
                bootstrap_len - 2 * arch::PAGE_SIZE,
            )
            .map_err(|_| InitError::NoBootstrapRange)?;

        let high = Zone {
            freelists: carve_freelist_array(&metadata, width, freelist_array)?,
            buddies: carve_buddy_array(&metadata, width, buddy_array, biases_high)?,
            fast: FastPageStack::new(),
            biases: biases_high,
            total_bytes: AtomicUsize::new(0),
        };
        let low = Zone {
            freelists: carve_freelist_array(&metadata, width, freelist_array)?,
            buddies: carve_buddy_array(&metadata, width, buddy_array, biases_low)?,
            fast: FastPageStack::new(),
            biases: biases_low,
            total_bytes: AtomicUsize::new(0),
        };

        let manager = Self {
            high,
            low,
            bootstrap,
            metadata,
        };

        manager.create_freelists(memory_map, bootstrap_index, bootstrap_base + bootstrap_len);

        let high_stats = manager.stats();
        let low_stats = manager.low_stats();
        if high_stats.total_bytes + low_stats.total_bytes == 0 {
            return Err(InitError::NoUsableMemory);
        }
        if zone_freelist_ranges(&manager.high) + zone_freelist_ranges(&manager.low) == 0 {
            return Err(InitError::NoFreelists);
        }

        log::info!(
            "high memory: {} managed ({} freelist, {} fast pages)",
            HumanSize(high_stats.total_bytes),
            HumanSize(high_stats.freelist_bytes),
            high_stats.fast_pages
        );
        log::info!(
            "low memory: {} managed ({} freelist, {} fast pages)",
            HumanSize(low_stats.total_bytes),
            HumanSize(low_stats.freelist_bytes),
            low_stats.fast_pages
        );
        log::debug!(
            "bootstrap spare: {} watermark, {} metadata",
            HumanSize(manager.bootstrap.remaining()),
            HumanSize(manager.metadata.free_bytes())
        );

        Ok(manager)
    }

    /// Walks the memory map, partitioning every available entry into its
    /// zone's pools. The prefix of the bootstrap entry consumed during
    /// setup is excluded.
    fn create_freelists(
        &self,
        memory_map: &[MemoryMapEntry],
        bootstrap_index: usize,
        bootstrap_end: PhysicalAddress,
    ) {
        for (index, entry) in memory_map.iter().enumerate() {
            if !entry.is_available() {
                continue;
            }
            let Some((mut base, mut len)) = entry.page_bounds() else {
                continue;
            };

            if index == bootstrap_index {
                let consumed = bootstrap_end - base;
                if consumed >= len {
                    continue;
                }
                base = bootstrap_end;
                len -= consumed;
            }

            log::info!(
                "{:3}: {} + {} ({})",
                index,
                base,
                HumanSize(len),
                entry.kind
            );

            let zone = if base.as_usize() < config::LOW_MEMORY_LIMIT {
                &self.low
            } else {
                &self.high
            };
            self.carve_entry(zone, base, len);
        }
    }

    /// Partitions one contiguous span: ratioed biases in table order, then
    /// greedy biases, then the residual (and any alignment gaps) as fast
    /// pages.
    fn carve_entry(&self, zone: &Zone, base: PhysicalAddress, len: usize) {
        zone.total_bytes.fetch_add(len, Ordering::Relaxed);

        let mut cursor = base.as_usize();
        let mut remaining = len;

        // Aligning a carve up to its block size can skip a page-multiple
        // gap; those are collected for the residual pass instead of lost.
        let mut gaps = [(0usize, 0usize); MAX_BIASES];
        let mut gap_count = 0;

        for greedy in [false, true] {
            for bias in zone.biases {
                if bias.is_greedy() != greedy || bias.exp >= zone.freelists.len() {
                    continue;
                }

                let block = bias.block_size();
                let aligned = align_up(cursor, block);
                let skip = aligned - cursor;
                if skip >= remaining {
                    continue;
                }
                let available = remaining - skip;
                if available < bias.min_blocks * block {
                    continue;
                }

                let share = if greedy {
                    available
                } else {
                    available * bias.ratio_num / bias.ratio_den
                };
                let carve = align_down(share, block);
                if carve == 0 {
                    continue;
                }

                let linear = LinearAddress::from_physical(PhysicalAddress::new(aligned));
                match zone.freelists[bias.exp].init_range(linear, linear + carve, block) {
                    Ok(()) => {
                        log::debug!(
                            "  2^{} pool: {} at {:#x}",
                            bias.exp,
                            HumanSize(carve),
                            aligned
                        );
                        if skip > 0 && gap_count < gaps.len() {
                            gaps[gap_count] = (cursor, skip);
                            gap_count += 1;
                        }
                        cursor = aligned + carve;
                        remaining -= skip + carve;
                    }
                    Err(err) => {
                        log::warn!("  2^{} pool rejected {:#x}: {:?}", bias.exp, aligned, err);
                    }
                }
            }
        }

        for &(gap_base, gap_len) in &gaps[..gap_count] {
            self.chain_fast_pages(
                zone,
                LinearAddress::from_physical(PhysicalAddress::new(gap_base)),
                gap_len,
            );
        }
        if remaining >= arch::PAGE_SIZE {
            self.chain_fast_pages(
                zone,
                LinearAddress::from_physical(PhysicalAddress::new(cursor)),
                remaining,
            );
        }
    }

    /// Links `len` bytes at `base` into the zone's fast stack as a chain
    /// of pages in address order.
    fn chain_fast_pages(&self, zone: &Zone, base: LinearAddress, len: usize) {
        let pages = len / arch::PAGE_SIZE;
        if pages == 0 {
            return;
        }

        let first = base.as_mut_ptr::<PageNode>();
        let mut last = first;
        for i in 1..pages {
            let node = (base + i * arch::PAGE_SIZE).as_mut_ptr::<PageNode>();
            // SAFETY: Every node lies in the span handed over to us.
            unsafe { (*last).next = node };
            last = node;
        }
        zone.fast.push_chain(first, last, pages);
    }

    /// Allocates `size` bytes of high memory, rounded up to the next power
    /// of two (at least one page). Returns None when the size cannot be
    /// served.
    pub fn alloc(&self, size: usize) -> Option<LinearAddress> {
        self.zone_alloc(&self.high, size)
    }

    /// Allocates from the low zone (physical addresses below the
    /// low-memory limit).
    pub fn low_alloc(&self, size: usize) -> Option<LinearAddress> {
        self.zone_alloc(&self.low, size)
    }

    /// Frees a high-memory allocation, returning the number of bytes
    /// released (0 for null).
    pub fn free(&self, addr: LinearAddress) -> usize {
        self.zone_free(&self.high, addr)
    }

    /// Frees a low-memory allocation.
    pub fn low_free(&self, addr: LinearAddress) -> usize {
        self.zone_free(&self.low, addr)
    }

    /// Pops one page from the high fast stack, refilling it from the bias
    /// pools when empty.
    pub fn fast_page_alloc(&self) -> Option<LinearAddress> {
        self.zone_fast_alloc(&self.high)
    }

    /// Returns one page to the high fast stack.
    pub fn fast_page_free(&self, addr: LinearAddress) -> usize {
        if addr.as_usize() == 0 {
            return 0;
        }
        self.high.fast.push(addr.as_usize());
        arch::PAGE_SIZE
    }

    /// High-zone occupancy.
    pub fn stats(&self) -> MemoryStats {
        Self::zone_stats(&self.high)
    }

    /// Low-zone occupancy.
    pub fn low_stats(&self) -> MemoryStats {
        Self::zone_stats(&self.low)
    }

    fn zone_alloc(&self, zone: &Zone, size: usize) -> Option<LinearAddress> {
        if size == 0 {
            return None;
        }
        let size = size.max(arch::PAGE_SIZE).next_power_of_two();
        let exp = size.trailing_zeros() as usize;

        if exp == arch::PAGE_SHIFT {
            return self.zone_fast_alloc(zone);
        }
        if exp >= zone.freelists.len() {
            return None;
        }

        // Exact exponent class: constant time.
        if let Some(addr) = zone.freelists[exp].alloc() {
            return Some(addr);
        }

        // Smallest covering bias first, larger ones as fallback.
        let (mut candidates, count) = bias_exponents(zone);
        let candidates = &mut candidates[..count];
        candidates.sort_unstable();

        for &bias_exp in candidates.iter().filter(|&&b| b >= exp) {
            let pool = &zone.buddies[bias_exp];

            if !pool.can_serve(size) {
                // Back a fresh region with a block from the same-exponent
                // freelist.
                if let Some(block) = zone.freelists[bias_exp].alloc() {
                    if let Err(err) = pool.init_region(block, self) {
                        log::warn!("buddy region setup at {:#x} failed: {:?}", block.as_usize(), err);
                        zone.freelists[bias_exp].free(block);
                    }
                }
            }

            if let Some(addr) = pool.alloc(size) {
                return Some(addr);
            }
        }

        None
    }

    fn zone_free(&self, zone: &Zone, addr: LinearAddress) -> usize {
        if addr.as_usize() == 0 {
            return 0;
        }

        let (candidates, count) = bias_exponents(zone);
        for &bias_exp in candidates[..count].iter() {
            let released = zone.buddies[bias_exp].free(addr);
            if released > 0 {
                return released;
            }
            if zone.freelists[bias_exp].free(addr).is_some() {
                return 1 << bias_exp;
            }
        }

        // Owned by no pool: a fast page.
        zone.fast.push(addr.as_usize());
        arch::PAGE_SIZE
    }

    fn zone_fast_alloc(&self, zone: &Zone) -> Option<LinearAddress> {
        if let Some(addr) = zone.fast.pop() {
            return Some(LinearAddress::new(addr));
        }
        self.refill_fast(zone);
        zone.fast.pop().map(LinearAddress::new)
    }

    /// Refills the fast stack by carving whole blocks from the smallest
    /// bias-exponent freelist that has any.
    ///
    /// The refill never draws from a buddy region: a page carved out of a
    /// buddy block would be freed through the buddy later, releasing the
    /// whole containing block while its sibling pages still sit on the
    /// stack. Whole freelist blocks keep the free-path routing unambiguous
    /// (a mid-block page fails the freelist alignment probe and falls
    /// through to the fast pool, which is where it belongs).
    fn refill_fast(&self, zone: &Zone) {
        let (mut candidates, count) = bias_exponents(zone);
        let candidates = &mut candidates[..count];
        candidates.sort_unstable();

        let mut chained = 0;
        for &bias_exp in candidates.iter() {
            let pages_per_block = 1usize << (bias_exp - arch::PAGE_SHIFT);
            while chained < config::FAST_REFILL_MIN_PAGES {
                let Some(block) = zone.freelists[bias_exp].alloc() else {
                    break;
                };
                self.chain_fast_pages(zone, block, 1 << bias_exp);
                chained += pages_per_block;
            }
            if chained >= config::FAST_REFILL_MIN_PAGES {
                break;
            }
        }

        if chained > 0 {
            log::debug!("fast pool refilled with {} pages", chained);
        }
    }

    fn zone_stats(zone: &Zone) -> MemoryStats {
        let mut stats = MemoryStats {
            total_bytes: zone.total_bytes.load(Ordering::Relaxed),
            fast_pages: zone.fast.count(),
            ..MemoryStats::default()
        };

        let (candidates, count) = bias_exponents(zone);
        for &bias_exp in candidates[..count].iter() {
            stats.freelist_bytes += zone.freelists[bias_exp].free_bytes();
            stats.buddy_bytes += zone.buddies[bias_exp].free_bytes();
            stats.buddy_regions += zone.buddies[bias_exp].region_count();
        }

        stats
    }
}

/// The manager is its own allocators' page backing: buddy metadata draws
/// fast pages, the slab draws sized blocks.
impl PageSource for PhysicalMemoryManager {
    fn alloc_page(&self) -> Option<LinearAddress> {
        self.fast_page_alloc()
    }

    fn alloc_sized(&self, size: usize) -> Option<LinearAddress> {
        self.alloc(size)
    }
}

/// Number of freelist ranges the bias passes carved for a zone.
fn zone_freelist_ranges(zone: &Zone) -> usize {
    let (candidates, count) = bias_exponents(zone);
    candidates[..count]
        .iter()
        .map(|&exp| zone.freelists[exp].range_count())
        .sum()
}

/// Distinct bias exponents of a zone, in table order.
fn bias_exponents(zone: &Zone) -> ([usize; MAX_BIASES], usize) {
    let mut exponents = [0usize; MAX_BIASES];
    let mut count = 0;
    for bias in zone.biases {
        if bias.exp >= zone.freelists.len() || count >= MAX_BIASES {
            continue;
        }
        if exponents[..count].contains(&bias.exp) {
            continue;
        }
        exponents[count] = bias.exp;
        count += 1;
    }
    (exponents, count)
}

fn carve_freelist_array(
    metadata: &VirtualWatermark<BootstrapNodePool>,
    width: usize,
    bytes: usize,
) -> Result<&'static [PageFreelist], InitError> {
    let base = metadata.alloc(bytes).ok_or(InitError::NoBootstrapRange)?;
    let array = base.as_mut_ptr::<PageFreelist>();
    for i in 0..width {
        // SAFETY: The carve spans width elements (bytes was computed from
        // it) and the memory is exclusively ours.
        unsafe { ptr::write(array.add(i), PageFreelist::new()) };
    }
    // SAFETY: Just initialized; bootstrap memory is never reclaimed.
    Ok(unsafe { core::slice::from_raw_parts(array, width) })
}

fn carve_buddy_array(
    metadata: &VirtualWatermark<BootstrapNodePool>,
    width: usize,
    bytes: usize,
    biases: &[Bias],
) -> Result<&'static [BuddyPool], InitError> {
    let base = metadata.alloc(bytes).ok_or(InitError::NoBootstrapRange)?;
    let array = base.as_mut_ptr::<BuddyPool>();
    for exp in 0..width {
        let min_exp = biases
            .iter()
            .find(|b| b.exp == exp)
            .map(|b| b.min_buddy_exp)
            .unwrap_or(arch::PAGE_SHIFT);
        // SAFETY: As in carve_freelist_array.
        unsafe { ptr::write(array.add(exp), BuddyPool::new(exp, min_exp)) };
    }
    // SAFETY: Just initialized; bootstrap memory is never reclaimed.
    Ok(unsafe { core::slice::from_raw_parts(array, width) })
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Hhdm;
    use crate::memmap::MemoryKind;
    use crate::slab::SlabAllocator;

    const MIB: u64 = 1 << 20;

    /// The single-entry map most tests use: high memory only.
    fn high_entry(base_mib: u64, len_mib: u64) -> MemoryMapEntry {
        MemoryMapEntry::new(base_mib * MIB, len_mib * MIB, MemoryKind::Available)
    }

    fn setup(buffer_mib: usize) {
        if Hhdm::try_current().is_none() {
            Hhdm::set_current(Hhdm::emulated(buffer_mib << 20));
        }
    }

    fn phys(addr: LinearAddress) -> usize {
        PhysicalAddress::from_linear(addr).as_usize()
    }

    /// What `with_biases` will claim for bootstrap, mirrored here so tests
    /// can account for it.
    fn bootstrap_len() -> usize {
        let width = arch::MAX_PHYSICAL_BITS;
        2 * arch::PAGE_SIZE
            + 2 * align_up(width * size_of::<PageFreelist>(), arch::PAGE_SIZE)
            + 2 * align_up(width * size_of::<BuddyPool>(), arch::PAGE_SIZE)
    }

    static NO_BIASES: [Bias; 0] = [];

    static TWO_MIB_ONLY: [Bias; 1] = [Bias {
        exp: 21,
        min_blocks: 1,
        ratio_num: 1,
        ratio_den: 1,
        min_buddy_exp: 12,
    }];

    /// A quarter of each entry as 64 KiB blocks, the rest as fast pages.
    /// Used by the fast-path tests, which need plenty of residual pages
    /// while still satisfying the freelist-carve requirement of init.
    static SMALL_POOL: [Bias; 1] = [Bias {
        exp: 16,
        min_blocks: 1,
        ratio_num: 1,
        ratio_den: 4,
        min_buddy_exp: 12,
    }];

    #[test]
    fn init_rejects_empty_map() {
        setup(4);
        assert!(matches!(
            PhysicalMemoryManager::init(&[]),
            Err(InitError::EmptyMemoryMap)
        ));
    }

    #[test]
    fn init_requires_a_bootstrap_range() {
        setup(4);

        // Nothing available.
        let reserved = [MemoryMapEntry::new(MIB, 2 * MIB, MemoryKind::Reserved)];
        assert!(matches!(
            PhysicalMemoryManager::init(&reserved),
            Err(InitError::NoBootstrapRange)
        ));

        // Available, but below the low-memory limit.
        let low_only = [MemoryMapEntry::new(0, MIB, MemoryKind::Available)];
        assert!(matches!(
            PhysicalMemoryManager::init(&low_only),
            Err(InitError::NoBootstrapRange)
        ));
    }

    #[test]
    fn init_rejects_bootstrap_only_memory() {
        setup(4);

        // Exactly the bootstrap footprint: nothing is left to manage.
        let map = [MemoryMapEntry::new(
            MIB,
            bootstrap_len() as u64,
            MemoryKind::Available,
        )];
        assert!(matches!(
            PhysicalMemoryManager::with_biases(&map, &NO_BIASES, &NO_BIASES),
            Err(InitError::NoUsableMemory)
        ));
    }

    #[test]
    fn init_without_freelist_pools_is_fatal() {
        setup(8);

        // Plenty of usable memory, but with empty bias tables nothing can
        // become a freelist pool; fast pages alone must not pass.
        let map = [high_entry(1, 7)];
        assert!(matches!(
            PhysicalMemoryManager::with_biases(&map, &NO_BIASES, &NO_BIASES),
            Err(InitError::NoFreelists)
        ));
    }

    #[test]
    fn trivial_alloc_and_free() {
        setup(16);

        let map = [high_entry(1, 15)];
        let pmm = PhysicalMemoryManager::init(&map).unwrap();

        let p = pmm.alloc(arch::PAGE_SIZE).unwrap();
        assert!(phys(p) >= MIB as usize);
        assert!(phys(p) < 16 * MIB as usize);
        assert_eq!(pmm.free(p), arch::PAGE_SIZE);
    }

    #[test]
    fn buddy_split_serves_adjacent_blocks() {
        setup(16);

        let map = [high_entry(1, 15)];
        let pmm = PhysicalMemoryManager::with_biases(&map, &TWO_MIB_ONLY, &NO_BIASES).unwrap();

        let p = pmm.alloc(1 << 16).unwrap();
        let q = pmm.alloc(1 << 16).unwrap();
        assert_eq!(phys(q), phys(p) + 0x10000);
        assert_eq!(pmm.free(p), 1 << 16);
    }

    #[test]
    fn buddy_merges_back_to_top() {
        setup(16);

        let map = [high_entry(1, 15)];
        let pmm = PhysicalMemoryManager::with_biases(&map, &TWO_MIB_ONLY, &NO_BIASES).unwrap();

        let a = pmm.alloc(1 << 20).unwrap();
        let b = pmm.alloc(1 << 20).unwrap();
        assert_eq!(phys(b), phys(a) + (1 << 20));

        assert_eq!(pmm.free(b), 1 << 20);
        assert_eq!(pmm.free(a), 1 << 20);

        // Both halves merged: the region holds one full 2 MiB block again.
        assert!(pmm.high.buddies[21].can_serve(1 << 21));
        assert_eq!(pmm.high.buddies[21].free_bytes(), 1 << 21);
    }

    #[test]
    fn allocations_are_naturally_aligned() {
        setup(16);

        let map = [high_entry(1, 15)];
        let pmm = PhysicalMemoryManager::with_biases(&map, &TWO_MIB_ONLY, &NO_BIASES).unwrap();

        for &size in &[4096usize, 8192, 1 << 16, 1 << 20, 1 << 21] {
            let p = pmm.alloc(size).unwrap();
            assert_eq!(phys(p) % size, 0, "misaligned {}-byte allocation", size);
        }
    }

    #[test]
    fn exact_size_roundtrip() {
        setup(16);

        let map = [high_entry(1, 15)];
        let pmm = PhysicalMemoryManager::with_biases(&map, &TWO_MIB_ONLY, &NO_BIASES).unwrap();

        for &size in &[1usize, 4096, 8192, 1 << 16, 1 << 20, 1 << 21] {
            let p = pmm.alloc(size).unwrap();
            let expected = size.max(arch::PAGE_SIZE).next_power_of_two();
            assert_eq!(pmm.free(p), expected, "roundtrip of {} bytes", size);
        }
    }

    #[test]
    fn fast_pages_are_lifo() {
        setup(8);

        let map = [high_entry(1, 7)];
        let pmm = PhysicalMemoryManager::with_biases(&map, &SMALL_POOL, &NO_BIASES).unwrap();

        let a = pmm.alloc(arch::PAGE_SIZE).unwrap();
        let b = pmm.alloc(arch::PAGE_SIZE).unwrap();
        let c = pmm.alloc(arch::PAGE_SIZE).unwrap();

        pmm.free(b);
        pmm.free(a);
        pmm.free(c);

        assert_eq!(pmm.alloc(arch::PAGE_SIZE).unwrap(), c);
        assert_eq!(pmm.alloc(arch::PAGE_SIZE).unwrap(), a);
        assert_eq!(pmm.alloc(arch::PAGE_SIZE).unwrap(), b);
    }

    #[test]
    fn fast_page_interface_roundtrip() {
        setup(8);

        let map = [high_entry(1, 7)];
        let pmm = PhysicalMemoryManager::with_biases(&map, &SMALL_POOL, &NO_BIASES).unwrap();

        let p = pmm.fast_page_alloc().unwrap();
        assert_eq!(pmm.fast_page_free(p), arch::PAGE_SIZE);
        assert_eq!(pmm.fast_page_alloc().unwrap(), p);
    }

    #[test]
    fn zones_keep_their_sides_of_the_limit() {
        setup(16);

        let map = [
            MemoryMapEntry::new(0, MIB, MemoryKind::Available),
            MemoryMapEntry::new(MIB, 15 * MIB, MemoryKind::Available),
        ];
        let pmm = PhysicalMemoryManager::init(&map).unwrap();

        for _ in 0..16 {
            let p = pmm.low_alloc(arch::PAGE_SIZE).unwrap();
            assert!(phys(p) < config::LOW_MEMORY_LIMIT);
        }
        for _ in 0..16 {
            let p = pmm.alloc(arch::PAGE_SIZE).unwrap();
            assert!(phys(p) >= config::LOW_MEMORY_LIMIT);
        }

        // Low frees land back in the low zone.
        let p = pmm.low_alloc(1 << 16).unwrap();
        assert!(phys(p) < config::LOW_MEMORY_LIMIT);
        assert_eq!(pmm.low_free(p), 1 << 16);
    }

    #[test]
    fn draining_yields_exactly_the_accounted_pages() {
        setup(16);

        // Three disjoint ranges; a quarter of each becomes a 64 KiB pool
        // and the rest fast pages. Page requests must eventually consume
        // both, through the refill path, down to the exact page count the
        // init accounting reports.
        let map = [
            high_entry(1, 2),
            high_entry(4, 2),
            high_entry(8, 2),
        ];
        let pmm = PhysicalMemoryManager::with_biases(&map, &SMALL_POOL, &NO_BIASES).unwrap();

        let stats = pmm.stats();
        assert!(stats.freelist_bytes > 0);
        let expected = stats.fast_pages + stats.freelist_bytes / arch::PAGE_SIZE;

        let mut drained = 0;
        while pmm.alloc(arch::PAGE_SIZE).is_some() {
            drained += 1;
        }
        assert_eq!(drained, expected);

        let after = pmm.stats();
        assert_eq!(after.fast_pages, 0);
        assert_eq!(after.freelist_bytes, 0);
    }

    #[test]
    fn empty_fast_pool_refills_from_bias_blocks() {
        setup(16);

        let map = [high_entry(1, 15)];
        let pmm = PhysicalMemoryManager::with_biases(&map, &TWO_MIB_ONLY, &NO_BIASES).unwrap();

        // Exhaust the residual fast pages.
        let residual = pmm.stats().fast_pages;
        for _ in 0..residual {
            pmm.fast_page_alloc().unwrap();
        }
        assert_eq!(pmm.stats().fast_pages, 0);

        // The next page comes from a carved 2 MiB block.
        let before = pmm.stats().freelist_bytes;
        let p = pmm.fast_page_alloc().unwrap();
        assert_eq!(phys(p) % arch::PAGE_SIZE, 0);
        let after = pmm.stats();
        assert_eq!(after.freelist_bytes, before - (1 << 21));
        assert_eq!(after.fast_pages, (1 << 21) / arch::PAGE_SIZE - 1);
    }

    #[test]
    fn oversized_and_zero_requests_fail_cleanly() {
        setup(8);

        let map = [high_entry(1, 7)];
        let pmm = PhysicalMemoryManager::with_biases(&map, &SMALL_POOL, &NO_BIASES).unwrap();

        assert!(pmm.alloc(0).is_none());
        assert!(pmm.alloc(1 << 22).is_none());
        assert_eq!(pmm.free(LinearAddress::new(0)), 0);
    }

    #[test]
    fn sub_page_requests_round_to_a_page() {
        setup(8);

        let map = [high_entry(1, 7)];
        let pmm = PhysicalMemoryManager::with_biases(&map, &SMALL_POOL, &NO_BIASES).unwrap();

        let p = pmm.alloc(64).unwrap();
        assert_eq!(pmm.free(p), arch::PAGE_SIZE);
    }

    #[test]
    fn reserved_entries_are_skipped() {
        setup(16);

        let map = [
            MemoryMapEntry::new(MIB, 2 * MIB, MemoryKind::Reserved),
            high_entry(4, 2),
            MemoryMapEntry::new(8 * MIB, 2 * MIB, MemoryKind::AcpiNvs),
        ];
        let pmm = PhysicalMemoryManager::with_biases(&map, &SMALL_POOL, &NO_BIASES).unwrap();

        // Only the available entry is managed; every page drained from it
        // maps inside it.
        let mut p = pmm.alloc(arch::PAGE_SIZE);
        while let Some(page) = p {
            let pa = phys(page);
            assert!((4 * MIB as usize..6 * MIB as usize).contains(&pa));
            p = pmm.alloc(arch::PAGE_SIZE);
        }
    }

    #[test]
    fn larger_bias_serves_when_smaller_class_is_exhausted() {
        setup(16);

        let map = [high_entry(1, 15)];
        let pmm = PhysicalMemoryManager::with_biases(&map, &TWO_MIB_ONLY, &NO_BIASES).unwrap();

        // Drain the 2 MiB freelist completely through full-block requests.
        let mut blocks = Vec::new();
        while let Some(b) = pmm.alloc(1 << 21) {
            blocks.push(b);
        }
        assert!(!blocks.is_empty());

        // A 64 KiB request can no longer carve a fresh region; it must
        // fail only if no existing region has room either.
        let before_regions = pmm.stats().buddy_regions;
        let small = pmm.alloc(1 << 16);
        if let Some(p) = small {
            assert_eq!(pmm.stats().buddy_regions, before_regions);
            assert_eq!(pmm.free(p), 1 << 16);
        }

        // Returning one block makes region carving possible again.
        pmm.free(blocks.pop().unwrap());
        let p = pmm.alloc(1 << 16).unwrap();
        assert_eq!(pmm.free(p), 1 << 16);
    }

    #[test]
    fn slab_draws_through_the_page_source_seam() {
        setup(16);

        let map = [high_entry(1, 15)];
        let pmm = PhysicalMemoryManager::init(&map).unwrap();

        let slab = SlabAllocator::new(4, 1, &pmm).unwrap();
        let small = slab.alloc(48, &pmm).unwrap();
        assert_eq!(slab.free(small), 64);

        // The kernel allocator contract: slab first, manager on miss.
        let page = pmm.alloc(arch::PAGE_SIZE).unwrap();
        assert_eq!(slab.free(page), 0);
        assert_eq!(pmm.free(page), arch::PAGE_SIZE);
    }

    #[test]
    fn stats_reflect_bias_carving() {
        setup(16);

        let map = [high_entry(1, 15)];
        let pmm = PhysicalMemoryManager::with_biases(&map, &TWO_MIB_ONLY, &NO_BIASES).unwrap();

        let stats = pmm.stats();
        assert_eq!(stats.total_bytes, 15 * MIB as usize - bootstrap_len());
        // The ratioed 1/1 bias turns every aligned 2 MiB into freelist
        // blocks; the header block is not free.
        assert!(stats.freelist_bytes >= 10 << 20);
        assert_eq!(stats.freelist_bytes % (1 << 21), 0);
        assert!(stats.fast_pages > 0);
        assert_eq!(stats.buddy_regions, 0);

        // Carving a region moves one block from freelist to buddy bytes.
        let p = pmm.alloc(1 << 16).unwrap();
        let after = pmm.stats();
        assert_eq!(after.buddy_regions, 1);
        assert_eq!(after.freelist_bytes, stats.freelist_bytes - (1 << 21));
        assert_eq!(after.buddy_bytes, (1 << 21) - (1 << 16));
        pmm.free(p);
    }
}
