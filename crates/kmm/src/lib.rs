#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Meridian Kernel Memory Manager (KMM)
//!
//! The physical memory manager for the Meridian operating system kernel and
//! the allocator algorithms it composes:
//!
//! - A layered page allocator that partitions the firmware memory map into
//!   fixed-exponent freelist pools and serves constant-time allocations at
//!   several page sizes.
//! - Per-exponent binary-buddy pools, lazily carved out of the freelists,
//!   backing every non-page power-of-two request.
//! - Watermark allocators for bootstrap metadata placement, and a slab
//!   allocator for sub-page kernel objects.
//!
//! Everything runs on linear addresses in the higher-half direct map; the
//! software-emulation mode substitutes a host buffer so the whole stack can
//! be exercised in ordinary tests.

mod address;
mod arch;
mod buddy;
mod config;
mod freelist;
mod human_size;
mod memmap;
mod page_source;
mod physical_memory_manager;
mod slab;
mod virtual_watermark;
mod watermark;

pub use address::{Hhdm, LinearAddress, PhysicalAddress};
pub use buddy::{BuddyError, BuddyPool, NOT_BLOCK_START};
pub use config::{Bias, BIASES_HIGH, BIASES_LOW, HHDM_OFFSET, LOW_MEMORY_LIMIT};
pub use freelist::{FreelistError, FreelistRange, PageFreelist};
pub use human_size::HumanSize;
pub use memmap::{MemoryKind, MemoryMapEntry};
pub use page_source::PageSource;
pub use physical_memory_manager::{InitError, MemoryStats, PhysicalMemoryManager};
pub use slab::{SlabAllocator, SlabError};
pub use virtual_watermark::{
    BootstrapNodePool, NodeSource, RangeNode, VirtualWatermark, VirtualWatermarkError,
    VirtualWatermarkMeta,
};
pub use watermark::{PhysicalWatermark, WatermarkError};

pub use arch::{MAX_PHYSICAL_BITS, PAGE_SHIFT, PAGE_SIZE};
