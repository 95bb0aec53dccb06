//! Integer difficulty type.

use bitcoin::pow::Target;
use ruint::aliases::U256;
use std::fmt;

/// Integer share difficulty as announced by pools.
///
/// Stratum pools communicate share difficulty as an integer multiplier of the
/// difficulty-1 target, while getwork pools send the target directly. Jobs
/// always carry a `Target`; this type converts between the two.
///
/// ```text
/// target = MAX_TARGET / difficulty
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Difficulty(u64);

impl Difficulty {
    /// Create a new difficulty value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Calculate difficulty from a target (`MAX_TARGET / target`).
    pub fn from_target(target: Target) -> Self {
        let target = to_u256(target);
        if target == U256::ZERO {
            return Self(u64::MAX);
        }

        let difficulty = to_u256(Target::MAX) / target;
        Self(difficulty.saturating_to())
    }

    /// Convert to the share target used to validate solutions.
    ///
    /// Difficulty 0 is treated as 1.
    pub fn to_target(self) -> Target {
        if self.0 <= 1 {
            return Target::MAX;
        }

        let target = to_u256(Target::MAX) / U256::from(self.0);
        Target::from_le_bytes(target.to_le_bytes())
    }
}

fn to_u256(target: Target) -> U256 {
    U256::from_le_bytes(target.to_le_bytes())
}

impl From<Difficulty> for u64 {
    fn from(diff: Difficulty) -> Self {
        diff.0
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0 as f64;

        let (scaled, suffix) = if value >= 1e15 {
            (value / 1e15, "P")
        } else if value >= 1e12 {
            (value / 1e12, "T")
        } else if value >= 1e9 {
            (value / 1e9, "G")
        } else if value >= 1e6 {
            (value / 1e6, "M")
        } else if value >= 1e3 {
            (value / 1e3, "K")
        } else {
            (value, "")
        };

        if suffix.is_empty() {
            write!(f, "{}", self.0)
        } else if scaled >= 100.0 {
            write!(f, "{:.0}{}", scaled, suffix)
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix)
        } else {
            write!(f, "{:.2}{}", scaled, suffix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difficulty_one_is_max_target() {
        assert_eq!(Difficulty::new(1).to_target(), Target::MAX);
        assert_eq!(Difficulty::new(0).to_target(), Target::MAX);
    }

    #[test]
    fn test_higher_difficulty_means_smaller_target() {
        let easy = Difficulty::new(100).to_target();
        let hard = Difficulty::new(1000).to_target();
        assert!(hard < easy);
    }

    #[test]
    fn test_target_conversion_is_reversible() {
        for value in [2u64, 1024, 65_536, 1_000_000] {
            let diff = Difficulty::new(value);
            assert_eq!(Difficulty::from_target(diff.to_target()), diff);
        }
        assert_eq!(Difficulty::from_target(Target::MAX), Difficulty::new(1));
    }

    #[test]
    fn test_zero_target_saturates() {
        let zero = Target::from_le_bytes([0u8; 32]);
        assert_eq!(Difficulty::from_target(zero), Difficulty::new(u64::MAX));
    }

    #[test]
    fn test_display_uses_si_suffixes() {
        assert_eq!(Difficulty::new(1_500_000_000_000_000).to_string(), "1.50P");
        assert_eq!(Difficulty::new(112_700_000_000_000).to_string(), "113T");
        assert_eq!(Difficulty::new(11_200_000_000_000).to_string(), "11.2T");
        assert_eq!(Difficulty::new(1_500_000).to_string(), "1.50M");
        assert_eq!(Difficulty::new(500).to_string(), "500");
        assert_eq!(Difficulty::new(7).to_string(), "7");
    }
}
