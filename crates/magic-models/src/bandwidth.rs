//! Bandwidth bookkeeping unit.
//!
//! Bandwidth values on the wire are bits per second; everything stored
//! internally — quotas, grants, DLM capacities — is kilobits per second.
//! [`Kbps`] is the internal unit and owns both conversions so the boundary
//! stays in one place.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// Bandwidth in kilobits per second.
///
/// A value of zero conventionally means "unlimited" when used as a quota cap
/// and "none" when used as a grant; the interpretation belongs to the caller.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash,
)]
#[serde(transparent)]
pub struct Kbps(pub u32);

impl Kbps {
    /// Zero bandwidth.
    pub const ZERO: Kbps = Kbps(0);

    /// Convert a wire-side bits-per-second value, rounding down to whole
    /// kilobits.
    pub fn from_bps(bps: u64) -> Self {
        Kbps(u32::try_from(bps / 1000).unwrap_or(u32::MAX))
    }

    /// Convert to the wire-side bits-per-second representation.
    pub fn as_bps(self) -> u64 {
        u64::from(self.0) * 1000
    }

    /// True when the value is zero.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Saturating subtraction.
    pub fn saturating_sub(self, other: Kbps) -> Kbps {
        Kbps(self.0.saturating_sub(other.0))
    }

    /// The smaller of two bandwidths.
    pub fn min(self, other: Kbps) -> Kbps {
        Kbps(self.0.min(other.0))
    }
}

impl Add for Kbps {
    type Output = Kbps;

    fn add(self, rhs: Kbps) -> Kbps {
        Kbps(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Kbps {
    fn add_assign(&mut self, rhs: Kbps) {
        *self = *self + rhs;
    }
}

impl Sub for Kbps {
    type Output = Kbps;

    fn sub(self, rhs: Kbps) -> Kbps {
        Kbps(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for Kbps {
    fn sub_assign(&mut self, rhs: Kbps) {
        *self = *self - rhs;
    }
}

impl fmt::Display for Kbps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} kbps", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bps_conversions() {
        assert_eq!(Kbps::from_bps(500_000), Kbps(500));
        assert_eq!(Kbps(500).as_bps(), 500_000);
        // Sub-kilobit remainders round down.
        assert_eq!(Kbps::from_bps(1999), Kbps(1));
    }

    #[test]
    fn from_bps_saturates() {
        assert_eq!(Kbps::from_bps(u64::MAX), Kbps(u32::MAX));
    }

    #[test]
    fn arithmetic_saturates() {
        assert_eq!(Kbps(10) - Kbps(20), Kbps::ZERO);
        assert_eq!(Kbps(u32::MAX) + Kbps(1), Kbps(u32::MAX));
        let mut v = Kbps(100);
        v += Kbps(50);
        v -= Kbps(30);
        assert_eq!(v, Kbps(120));
    }

    #[test]
    fn serde_is_transparent() {
        let json = serde_json::to_string(&Kbps(512)).unwrap();
        assert_eq!(json, "512");
    }
}
