//! Physical and linear address types.
//!
//! After bootstrap the allocators operate entirely on *linear* addresses in
//! the higher-half direct map (HHDM), a fixed bijection from physical RAM.
//! This module provides the two address newtypes and the global [`Hhdm`]
//! handle that performs the translation, in either direction.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch;

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// The higher-half direct map, translating between physical and linear
/// addresses.
///
/// Two modes are supported:
/// - `Offset`: linear = physical + offset, the real HHDM installed by the
///   boot environment (kernel mode).
/// - `Emulated`: translation into an emulated memory buffer (testing mode).
pub enum Hhdm {
    /// Hardware translation by a fixed direct-map offset.
    Offset { offset: usize },
    /// Emulated translation into a simulated physical memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl Hhdm {
    /// Creates a direct-map translation with the given offset.
    pub const fn offset(offset: usize) -> Self {
        Self::Offset { offset }
    }

    /// Creates an emulated translation with the given memory size.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Installs the global direct map.
    ///
    /// This function must be called exactly once during initialization,
    /// before any allocator is constructed.
    ///
    /// # Panics
    ///
    /// Panics if the direct map has already been installed.
    pub fn set_current(hhdm: Hhdm) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if HHDM.get().is_some() {
                panic!("direct map already installed");
            }
            HHDM.call_once(|| hhdm);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            HHDM.with(|h| {
                if h.get().is_some() {
                    panic!("direct map already installed");
                }
                h.call_once(|| hhdm);
            });
        }
    }

    /// Returns a reference to the global direct map.
    ///
    /// # Panics
    ///
    /// Panics if the direct map has not been installed yet.
    pub fn current() -> &'static Hhdm {
        Self::try_current()
            .expect("direct map not installed; call Hhdm::set_current during initialization")
    }

    /// Returns a reference to the global direct map if it has been installed.
    pub fn try_current() -> Option<&'static Hhdm> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            HHDM.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            HHDM.with(|h| {
                h.get().map(|hhdm| {
                    // SAFETY: We leak the reference to make it 'static. This is
                    // safe because in emulated mode each thread has its own HHDM,
                    // it is never modified once set (spin::Once guarantees this),
                    // and the thread-local lives for the whole thread.
                    unsafe { &*(hhdm as *const Hhdm) }
                })
            })
        }
    }

    /// Translates a physical address to a linear address.
    pub fn to_linear(&self, phys: usize) -> usize {
        match self {
            Self::Offset { offset } => phys.wrapping_add(*offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys) as usize,
        }
    }

    /// Translates a linear address back to a physical address.
    pub fn to_physical(&self, linear: usize) -> usize {
        match self {
            Self::Offset { offset } => linear.wrapping_sub(*offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.ptr_to_phys(linear as *const u8),
        }
    }

    /// Allocates a block from the emulated space (test mode only).
    ///
    /// Returns the physical address of the block, or None if there is not
    /// enough space. Test fixtures use this to place memory-map contents.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        match self {
            Self::Offset { .. } => panic!("cannot allocate from a hardware direct map"),
            Self::Emulated(mem) => mem.allocate(size, align),
        }
    }
}

/// Global direct map handle.
///
/// Installed once during kernel initialization (with the Offset variant). In
/// test/software-emulation mode this is thread-local so each test thread gets
/// its own emulated memory space.
#[cfg(not(any(test, feature = "software-emulation")))]
static HHDM: spin::Once<Hhdm> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static HHDM: spin::Once<Hhdm> = spin::Once::new();
}

/// Defines the functionality common to both address types.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address without validation.
            ///
            /// # Safety
            ///
            /// The caller must ensure that the address is valid for the
            /// current architecture.
            #[inline]
            pub const unsafe fn new_unchecked(addr: usize) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(addr: u64) -> Self {
                Self::new(addr as usize)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     A newtype wrapper around the numeric offset into RAM. Memory-map entries\n\
     arrive as physical addresses; everything else in the manager runs on\n\
     [`LinearAddress`]."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Converts a direct-mapped linear address back to a physical address.
    ///
    /// # Panics
    ///
    /// Panics if the direct map has not been installed via
    /// [`Hhdm::set_current`].
    #[inline]
    pub fn from_linear(linear: LinearAddress) -> Self {
        Self::new(Hhdm::current().to_physical(linear.as_usize()))
    }
}

impl_address_common!(
    LinearAddress,
    "A linear address in the higher-half direct map.\n\n\
     The allocators hand these out and take them back; the fixed direct-map\n\
     bijection makes the corresponding physical address recoverable at any\n\
     time."
);

impl LinearAddress {
    /// Creates a new linear address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Creates a linear address from a physical address through the direct map.
    ///
    /// # Panics
    ///
    /// Panics if the direct map has not been installed via
    /// [`Hhdm::set_current`].
    #[inline]
    pub fn from_physical(phys: PhysicalAddress) -> Self {
        Self::new(Hhdm::current().to_linear(phys.as_usize()))
    }

    /// Creates a linear address from a pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::new(ptr as usize)
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the physical address this linear address maps to.
    ///
    /// # Panics
    ///
    /// Panics if the direct map has not been installed.
    #[inline]
    pub fn to_physical(self) -> PhysicalAddress {
        PhysicalAddress::from_linear(self)
    }
}
