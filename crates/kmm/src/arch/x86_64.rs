//! x86_64 hardware constants.
//!
//! Address widths and page geometry for x86_64 with 4-level paging. Page
//! table manipulation itself is the pager's concern, not this crate's; only
//! the constants the allocators depend on live here.

/// Maximum number of bits in a physical address on x86_64.
/// This is typically 52 bits on modern CPUs, but we use 48 as a conservative default.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Maximum number of bits in a virtual address on x86_64 with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Default page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`]; the lowest exponent served by the page pools.
pub const PAGE_SHIFT: usize = 12;

/// Validates a physical address for x86_64.
///
/// Physical addresses must not exceed the maximum physical address width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    let max_addr = (1usize << MAX_PHYSICAL_BITS) - 1;
    addr <= max_addr
}

/// Validates a virtual address for x86_64.
///
/// Virtual addresses must be canonical (bits 47-63 must be sign-extended from bit 47).
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
