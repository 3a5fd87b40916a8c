//! Byte-count formatting for the init logs.

use core::fmt;

/// Formats a byte count with binary prefixes (KiB, MiB, ...).
///
/// The value is scaled in integer hundredths, so formatting needs no
/// floating point; fractions are truncated to at most two digits and
/// trailing zeros are not printed.
///
/// # Examples
///
/// ```
/// use kmm::HumanSize;
///
/// assert_eq!(format!("{}", HumanSize(512)), "512B");
/// assert_eq!(format!("{}", HumanSize(1024)), "1KiB");
/// assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
/// assert_eq!(format!("{}", HumanSize(3 << 29)), "1.5GiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub usize);

impl HumanSize {
    /// Creates a new human-readable size from bytes.
    #[inline]
    pub const fn new(bytes: usize) -> Self {
        Self(bytes)
    }

    /// Returns the raw byte count.
    #[inline]
    pub const fn bytes(self) -> usize {
        self.0
    }
}

impl From<u64> for HumanSize {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value as usize)
    }
}

impl From<usize> for HumanSize {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

        if self.0 < 1024 {
            return write!(f, "{}B", self.0);
        }

        // Divide down until one more step would leave less than a whole
        // unit, keeping `scaled` in [1024, 1024^2) of UNITS[unit].
        let mut unit = 0;
        let mut scaled = self.0;
        while scaled >= 1024 * 1024 && unit + 2 < UNITS.len() {
            scaled /= 1024;
            unit += 1;
        }

        // The final step is taken in hundredths to keep two fractional
        // digits of UNITS[unit + 1].
        let hundredths = scaled * 100 / 1024;
        let whole = hundredths / 100;
        let frac = hundredths % 100;

        if frac == 0 {
            write!(f, "{}{}", whole, UNITS[unit + 1])
        } else if frac % 10 == 0 {
            write!(f, "{}.{}{}", whole, frac / 10, UNITS[unit + 1])
        } else {
            write!(f, "{}.{:02}{}", whole, frac, UNITS[unit + 1])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_bytes_stay_unscaled() {
        assert_eq!(format!("{}", HumanSize(0)), "0B");
        assert_eq!(format!("{}", HumanSize(512)), "512B");
        assert_eq!(format!("{}", HumanSize(1023)), "1023B");
    }

    #[test]
    fn whole_units_drop_the_fraction() {
        assert_eq!(format!("{}", HumanSize(1024)), "1KiB");
        assert_eq!(format!("{}", HumanSize(10240)), "10KiB");
        assert_eq!(format!("{}", HumanSize(1 << 20)), "1MiB");
        assert_eq!(format!("{}", HumanSize(1 << 30)), "1GiB");
    }

    #[test]
    fn fractions_trim_trailing_zeros() {
        assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
        assert_eq!(format!("{}", HumanSize(3 << 29)), "1.5GiB");
        // 1.25 MiB keeps both digits.
        assert_eq!(format!("{}", HumanSize(5 << 18)), "1.25MiB");
    }

    #[test]
    fn fractions_truncate() {
        // 1025 bytes is 1.0009... KiB; two digits of that is just 1 KiB.
        assert_eq!(format!("{}", HumanSize(1025)), "1KiB");
    }

    #[test]
    fn tops_out_at_the_largest_unit() {
        assert_eq!(format!("{}", HumanSize(1 << 40)), "1TiB");
        assert_eq!(format!("{}", HumanSize(1 << 62)), "4EiB");
    }
}
