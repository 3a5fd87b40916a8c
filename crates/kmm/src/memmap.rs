//! Boot-time memory map input.
//!
//! The boot environment hands the manager an array of [`MemoryMapEntry`]
//! records describing physical RAM. Entries are not assumed sorted or
//! page-aligned; the only classification the manager honors is
//! [`MemoryKind::Available`], everything else is skipped.

use core::fmt;

use crate::arch;
use crate::address::PhysicalAddress;

/// Classification of a memory-map entry.
///
/// The discriminants follow the common bootloader convention; only
/// `Available` is ever allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryKind {
    /// Usable RAM, free for the manager to carve up.
    Available = 0,
    /// Firmware-reserved memory.
    Reserved = 1,
    /// ACPI tables, reclaimable once parsed.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage.
    AcpiNvs = 3,
    /// Memory reported faulty by the firmware.
    BadMemory = 4,
    /// Bootloader structures, reclaimable after handoff.
    BootloaderReclaimable = 5,
    /// The kernel image and boot modules.
    KernelAndModules = 6,
    /// The boot framebuffer.
    Framebuffer = 7,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryKind::Available => "AVAILABLE",
            MemoryKind::Reserved => "RESERVED",
            MemoryKind::AcpiReclaimable => "ACPI_RECLAIMABLE",
            MemoryKind::AcpiNvs => "ACPI_NVS",
            MemoryKind::BadMemory => "BAD_MEMORY",
            MemoryKind::BootloaderReclaimable => "BOOTLOADER_RECLAIMABLE",
            MemoryKind::KernelAndModules => "KERNEL_AND_MODULES",
            MemoryKind::Framebuffer => "FRAMEBUFFER",
        };
        f.write_str(name)
    }
}

/// A single entry in the boot-time memory map.
///
/// Treated as immutable input: the manager never writes back into the map.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemoryMapEntry {
    /// Base physical address of the region.
    pub base: u64,
    /// Length of the region in bytes.
    pub len: u64,
    /// Classification of the region.
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    /// Creates a new memory-map entry.
    pub const fn new(base: u64, len: u64, kind: MemoryKind) -> Self {
        Self { base, len, kind }
    }

    /// Returns true if this entry describes usable RAM.
    #[inline]
    pub const fn is_available(&self) -> bool {
        matches!(self.kind, MemoryKind::Available)
    }

    /// Returns the page-rounded bounds of the entry: base rounded up and the
    /// end rounded down to [`arch::PAGE_SIZE`].
    ///
    /// Returns `None` if nothing page-sized survives the rounding.
    pub fn page_bounds(&self) -> Option<(PhysicalAddress, usize)> {
        let base = PhysicalAddress::new(self.base as usize).align_up(arch::PAGE_SIZE);
        let end =
            PhysicalAddress::new((self.base + self.len) as usize).align_down(arch::PAGE_SIZE);

        if end.as_usize() <= base.as_usize() {
            return None;
        }

        Some((base, end - base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_detection() {
        let entry = MemoryMapEntry::new(0x1000, 0x1000, MemoryKind::Available);
        assert!(entry.is_available());

        let entry = MemoryMapEntry::new(0x1000, 0x1000, MemoryKind::Reserved);
        assert!(!entry.is_available());
    }

    #[test]
    fn page_bounds_already_aligned() {
        let entry = MemoryMapEntry::new(0x1000, 0x3000, MemoryKind::Available);
        let (base, len) = entry.page_bounds().unwrap();
        assert_eq!(base.as_usize(), 0x1000);
        assert_eq!(len, 0x3000);
    }

    #[test]
    fn page_bounds_rounds_inward() {
        // Base rounds up, end rounds down.
        let entry = MemoryMapEntry::new(0x1234, 0x3000, MemoryKind::Available);
        let (base, len) = entry.page_bounds().unwrap();
        assert_eq!(base.as_usize(), 0x2000);
        assert_eq!(base.as_usize() + len, 0x4000);
    }

    #[test]
    fn page_bounds_too_small() {
        // Less than a page survives the rounding.
        let entry = MemoryMapEntry::new(0x1234, 0x800, MemoryKind::Available);
        assert!(entry.page_bounds().is_none());
    }

    #[test]
    fn kind_names() {
        assert_eq!(format!("{}", MemoryKind::Available), "AVAILABLE");
        assert_eq!(format!("{}", MemoryKind::BadMemory), "BAD_MEMORY");
    }
}
