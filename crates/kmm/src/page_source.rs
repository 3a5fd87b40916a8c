//! Page backing seam.
//!
//! The slab allocator and the buddy metadata path both need pages from the
//! physical memory manager, but neither should depend on the concrete
//! manager type: the slab is client-owned, and the buddy must be testable
//! in isolation. This trait is the seam; the manager implements it.

use crate::address::LinearAddress;

/// Supplier of direct-mapped memory for allocator internals.
pub trait PageSource {
    /// Allocates one PAGE_SIZE page from the fast path.
    fn alloc_page(&self) -> Option<LinearAddress>;

    /// Allocates `size` bytes, rounded up to the next power of two and
    /// naturally aligned.
    fn alloc_sized(&self, size: usize) -> Option<LinearAddress>;
}
