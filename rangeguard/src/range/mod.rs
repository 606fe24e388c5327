//! Abstract integer facts
//!
//! Two kinds of facts describe what an integer value can be at runtime:
//!
//! - [`ConstantRange`]: a half-open interval `[lower, upper)` over the modular
//!   domain `[0, 2^width)`. When `lower >= upper` the interval wraps around
//!   and denotes `[lower, 2^width) ∪ [0, upper)`.
//! - [`KnownBits`]: a per-bit ternary mask, each bit forced to zero, forced to
//!   one, or unknown.
//!
//! All values are carried as `u64` bit patterns truncated to the fact's width,
//! so widths from 1 to 64 bits are supported.

mod known_bits;

pub use known_bits::{BitMask, KnownBits, KnownBitsError};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{InstrumentError, Result};

/// Largest supported bit width
pub const MAX_WIDTH: u32 = 64;

/// All-ones mask for `width` bits
pub fn width_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Number of distinct values of a `width`-bit integer
pub fn domain_size(width: u32) -> u128 {
    1u128 << width
}

// ============================================================================
// Constant Range
// ============================================================================

/// A possibly-wrapping half-open interval of `width`-bit unsigned values
///
/// The full set is encoded as `lower == upper == 2^width - 1` and the empty
/// set as `lower == upper == 0`. No other encoding has `lower == upper`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RangeRepr", into = "RangeRepr")]
pub struct ConstantRange {
    width: u32,
    lower: u64,
    upper: u64,
}

impl ConstantRange {
    /// Create the range `[lower, upper)`
    ///
    /// `lower == upper` is only accepted for the full-set and empty-set
    /// encodings.
    pub fn new(width: u32, lower: u64, upper: u64) -> Result<Self> {
        check_width(width)?;
        let mask = width_mask(width);
        if lower > mask || upper > mask {
            return Err(InstrumentError::invalid_range(format!(
                "bounds [{lower}, {upper}) do not fit in {width} bits"
            )));
        }
        if lower == upper && lower != 0 && lower != mask {
            return Err(InstrumentError::invalid_range(format!(
                "[{lower}, {upper}) is neither the full nor the empty set"
            )));
        }
        Ok(Self { width, lower, upper })
    }

    /// Every value is possible
    pub fn full(width: u32) -> Self {
        let mask = width_mask(width);
        Self {
            width,
            lower: mask,
            upper: mask,
        }
    }

    /// No value is possible
    pub fn empty(width: u32) -> Self {
        Self {
            width,
            lower: 0,
            upper: 0,
        }
    }

    /// The single value `value`
    pub fn single(width: u32, value: u64) -> Self {
        let mask = width_mask(width);
        let value = value & mask;
        Self {
            width,
            lower: value,
            upper: value.wrapping_add(1) & mask,
        }
    }

    /// The unsigned interval `[min, max]`, inclusive on both ends
    pub fn from_unsigned_bounds(width: u32, min: u64, max: u64) -> Self {
        let mask = width_mask(width);
        let (min, max) = (min & mask, max & mask);
        if min > max {
            return Self::empty(width);
        }
        if min == 0 && max == mask {
            return Self::full(width);
        }
        Self {
            width,
            lower: min,
            upper: max.wrapping_add(1) & mask,
        }
    }

    /// The tightest interval covering every value compatible with `known`
    pub fn from_known_bits(known: &KnownBits) -> Self {
        Self::from_unsigned_bounds(known.width(), known.min_value(), known.max_value())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn lower(&self) -> u64 {
        self.lower
    }

    pub fn upper(&self) -> u64 {
        self.upper
    }

    pub fn is_full_set(&self) -> bool {
        self.lower == self.upper && self.lower == width_mask(self.width)
    }

    pub fn is_empty_set(&self) -> bool {
        self.lower == self.upper && self.lower == 0
    }

    /// True when the interval wraps past `2^width - 1` back to zero
    pub fn is_wrapped(&self) -> bool {
        !self.is_full_set() && !self.is_empty_set() && self.lower >= self.upper
    }

    /// Whether `value` (truncated to the range's width) is in the set
    pub fn contains(&self, value: u64) -> bool {
        let value = value & width_mask(self.width);
        if self.is_full_set() {
            true
        } else if self.is_empty_set() {
            false
        } else if self.lower < self.upper {
            self.lower <= value && value < self.upper
        } else {
            value >= self.lower || value < self.upper
        }
    }

    /// Number of values in the set
    pub fn size(&self) -> u128 {
        if self.is_full_set() {
            domain_size(self.width)
        } else if self.is_empty_set() {
            0
        } else if self.lower < self.upper {
            u128::from(self.upper - self.lower)
        } else {
            domain_size(self.width) - u128::from(self.lower) + u128::from(self.upper)
        }
    }

    pub fn single_element(&self) -> Option<u64> {
        (self.size() == 1).then_some(self.lower)
    }

    /// Smallest unsigned member
    pub fn unsigned_min(&self) -> Option<u64> {
        if self.is_empty_set() {
            None
        } else if self.is_full_set() || (self.is_wrapped() && self.upper > 0) {
            Some(0)
        } else {
            Some(self.lower)
        }
    }

    /// Largest unsigned member
    pub fn unsigned_max(&self) -> Option<u64> {
        if self.is_empty_set() {
            None
        } else if self.is_full_set() || self.is_wrapped() {
            Some(width_mask(self.width))
        } else {
            Some(self.upper - 1)
        }
    }

    /// Bits of information the range carries: `width - ceil(log2(size))`
    ///
    /// A single value yields `width`, the full set yields zero. The empty set
    /// pins the value completely and also yields `width`.
    pub fn information_bits(&self) -> u32 {
        let size = self.size();
        if size <= 1 {
            return self.width;
        }
        self.width - ceil_log2(size)
    }

    // ------------------------------------------------------------------------
    // Transfer functions
    // ------------------------------------------------------------------------

    /// Possible values of `self + other` modulo `2^width`
    pub fn add(&self, other: &ConstantRange) -> ConstantRange {
        debug_assert_eq!(self.width, other.width);
        if self.is_empty_set() || other.is_empty_set() {
            return Self::empty(self.width);
        }
        if self.is_full_set() || other.is_full_set() {
            return Self::full(self.width);
        }
        let span = self.size() + other.size() - 1;
        if span >= domain_size(self.width) {
            return Self::full(self.width);
        }
        let mask = width_mask(self.width);
        Self {
            width: self.width,
            lower: self.lower.wrapping_add(other.lower) & mask,
            upper: self.upper.wrapping_add(other.upper).wrapping_sub(1) & mask,
        }
    }

    /// Possible values of `self - other` modulo `2^width`
    pub fn sub(&self, other: &ConstantRange) -> ConstantRange {
        debug_assert_eq!(self.width, other.width);
        if self.is_empty_set() || other.is_empty_set() {
            return Self::empty(self.width);
        }
        if self.is_full_set() || other.is_full_set() {
            return Self::full(self.width);
        }
        let span = self.size() + other.size() - 1;
        if span >= domain_size(self.width) {
            return Self::full(self.width);
        }
        let mask = width_mask(self.width);
        Self {
            width: self.width,
            lower: self.lower.wrapping_sub(other.upper.wrapping_sub(1)) & mask,
            upper: self.upper.wrapping_sub(other.lower) & mask,
        }
    }

    /// Values after zero-extending to `width` bits
    pub fn zero_extend(&self, width: u32) -> ConstantRange {
        if width <= self.width {
            return self.truncate(width);
        }
        if self.is_empty_set() {
            return Self::empty(width);
        }
        let top = width_mask(self.width);
        if self.is_full_set() || (self.is_wrapped() && self.upper != 0) {
            return Self::from_unsigned_bounds(width, 0, top);
        }
        // `[lower, 0)` wraps only to express an upper bound of `2^width`
        let max = if self.upper == 0 { top } else { self.upper - 1 };
        Self::from_unsigned_bounds(width, self.lower, max)
    }

    /// Values after sign-extending to `width` bits
    pub fn sign_extend(&self, width: u32) -> ConstantRange {
        if width <= self.width {
            return self.truncate(width);
        }
        if self.is_empty_set() {
            return Self::empty(width);
        }
        let sign_bit = 1u64 << (self.width - 1);
        match self.unsigned_max() {
            // Every member is non-negative, so the bit pattern is unchanged
            Some(max) if !self.is_wrapped() && !self.is_full_set() && max < sign_bit => {
                Self::from_unsigned_bounds(width, self.lower, max)
            }
            _ => Self::full(width),
        }
    }

    /// Values after truncating to `width` bits
    pub fn truncate(&self, width: u32) -> ConstantRange {
        if width >= self.width {
            return *self;
        }
        if self.is_empty_set() {
            return Self::empty(width);
        }
        match self.unsigned_max() {
            Some(max) if !self.is_wrapped() && !self.is_full_set() && max <= width_mask(width) => {
                Self::from_unsigned_bounds(width, self.lower, max)
            }
            _ => Self::full(width),
        }
    }

    /// Smallest non-wrapping interval containing both ranges
    pub fn hull(&self, other: &ConstantRange) -> ConstantRange {
        debug_assert_eq!(self.width, other.width);
        match (self.unsigned_min(), other.unsigned_min()) {
            (None, _) => *other,
            (_, None) => *self,
            (Some(a), Some(b)) => {
                let max = self.unsigned_max().max(other.unsigned_max()).unwrap_or(0);
                Self::from_unsigned_bounds(self.width, a.min(b), max)
            }
        }
    }

    /// Values of `x % divisor` for unsigned `x` in the range
    pub fn urem_by_constant(&self, divisor: u64) -> ConstantRange {
        if self.is_empty_set() {
            return *self;
        }
        if divisor == 0 {
            return Self::full(self.width);
        }
        let max = match self.unsigned_max() {
            Some(max) => max.min(divisor - 1),
            None => divisor - 1,
        };
        Self::from_unsigned_bounds(self.width, 0, max)
    }
}

impl fmt::Display for ConstantRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_full_set() {
            write!(f, "full-set")
        } else if self.is_empty_set() {
            write!(f, "empty-set")
        } else {
            write!(f, "[{},{})", self.lower, self.upper)
        }
    }
}

fn check_width(width: u32) -> Result<()> {
    if width == 0 || width > MAX_WIDTH {
        return Err(InstrumentError::invalid_range(format!(
            "unsupported bit width {width}"
        )));
    }
    Ok(())
}

fn ceil_log2(n: u128) -> u32 {
    debug_assert!(n > 1);
    128 - (n - 1).leading_zeros()
}

/// Serialized form: `"full"`, `"empty"`, or explicit bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RangeRepr {
    Special { width: u32, set: SpecialSet },
    Bounds { width: u32, lower: u64, upper: u64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SpecialSet {
    Full,
    Empty,
}

impl TryFrom<RangeRepr> for ConstantRange {
    type Error = InstrumentError;

    fn try_from(repr: RangeRepr) -> Result<Self> {
        match repr {
            RangeRepr::Special { width, set } => {
                check_width(width)?;
                Ok(match set {
                    SpecialSet::Full => Self::full(width),
                    SpecialSet::Empty => Self::empty(width),
                })
            }
            RangeRepr::Bounds { width, lower, upper } => Self::new(width, lower, upper),
        }
    }
}

impl From<ConstantRange> for RangeRepr {
    fn from(range: ConstantRange) -> Self {
        if range.is_full_set() {
            RangeRepr::Special { width: range.width, set: SpecialSet::Full }
        } else if range.is_empty_set() {
            RangeRepr::Special { width: range.width, set: SpecialSet::Empty }
        } else {
            RangeRepr::Bounds {
                width: range.width,
                lower: range.lower,
                upper: range.upper,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_special_sets() {
        let full = ConstantRange::full(8);
        assert!(full.is_full_set());
        assert!(!full.is_empty_set());
        assert!(!full.is_wrapped());
        assert_eq!(full.size(), 256);

        let empty = ConstantRange::empty(8);
        assert!(empty.is_empty_set());
        assert!(!empty.contains(0));
        assert_eq!(empty.size(), 0);
    }

    #[test]
    fn test_new_rejects_ambiguous_equal_bounds() {
        assert!(ConstantRange::new(8, 7, 7).is_err());
        assert!(ConstantRange::new(8, 0, 0).unwrap().is_empty_set());
        assert!(ConstantRange::new(8, 255, 255).unwrap().is_full_set());
        assert!(ConstantRange::new(8, 0, 256).is_err());
        assert!(ConstantRange::new(0, 0, 1).is_err());
    }

    #[test]
    fn test_non_wrapping_contains() {
        let r = ConstantRange::new(8, 0, 10).unwrap();
        assert!(!r.is_wrapped());
        assert!(r.contains(0));
        assert!(r.contains(9));
        assert!(!r.contains(10));
        assert!(!r.contains(255));
        assert_eq!(r.size(), 10);
    }

    #[test]
    fn test_wrapping_contains() {
        let r = ConstantRange::new(8, 250, 5).unwrap();
        assert!(r.is_wrapped());
        assert!(r.contains(250));
        assert!(r.contains(255));
        assert!(r.contains(0));
        assert!(r.contains(4));
        assert!(!r.contains(5));
        assert!(!r.contains(249));
        assert_eq!(r.size(), 11);
    }

    #[test]
    fn test_single_max_value_wraps() {
        let r = ConstantRange::single(8, 255);
        assert_eq!((r.lower(), r.upper()), (255, 0));
        assert!(r.is_wrapped());
        assert_eq!(r.single_element(), Some(255));
        assert!(r.contains(255));
        assert!(!r.contains(0));
    }

    #[test]
    fn test_information_bits() {
        assert_eq!(ConstantRange::full(8).information_bits(), 0);
        assert_eq!(ConstantRange::single(8, 3).information_bits(), 8);
        assert_eq!(ConstantRange::new(8, 0, 16).unwrap().information_bits(), 4);
        // 10 values need 4 bits
        assert_eq!(ConstantRange::new(8, 0, 10).unwrap().information_bits(), 4);
        assert_eq!(ConstantRange::empty(8).information_bits(), 8);
        assert_eq!(ConstantRange::full(64).information_bits(), 0);
        assert_eq!(ConstantRange::new(64, 0, 1 << 32).unwrap().information_bits(), 32);
    }

    #[test]
    fn test_add_and_sub() {
        let a = ConstantRange::new(8, 1, 4).unwrap();
        let b = ConstantRange::new(8, 10, 12).unwrap();
        let sum = a.add(&b);
        assert_eq!((sum.lower(), sum.upper()), (11, 15));
        let diff = b.sub(&a);
        assert_eq!((diff.lower(), diff.upper()), (7, 11));

        let big = ConstantRange::new(8, 0, 200).unwrap();
        assert!(big.add(&big).is_full_set());
    }

    #[test]
    fn test_add_wraps_modularly() {
        let a = ConstantRange::single(8, 250);
        let b = ConstantRange::new(8, 0, 10).unwrap();
        let sum = a.add(&b);
        assert!(sum.is_wrapped());
        for x in 0..10u64 {
            assert!(sum.contains((250 + x) & 0xff));
        }
        assert_eq!(sum.size(), 10);
    }

    #[test]
    fn test_extend_and_truncate() {
        let r = ConstantRange::new(8, 3, 0).unwrap();
        let z = r.zero_extend(16);
        assert_eq!((z.lower(), z.upper()), (3, 256));

        let small = ConstantRange::new(16, 2, 100).unwrap();
        assert_eq!(small.truncate(8), ConstantRange::new(8, 2, 100).unwrap());
        assert!(ConstantRange::new(16, 2, 300).unwrap().truncate(8).is_full_set());

        assert_eq!(small.sign_extend(32), ConstantRange::new(32, 2, 100).unwrap());
        assert!(ConstantRange::new(8, 100, 200).unwrap().sign_extend(16).is_full_set());
    }

    #[test]
    fn test_hull() {
        let a = ConstantRange::new(8, 2, 5).unwrap();
        let b = ConstantRange::new(8, 10, 12).unwrap();
        assert_eq!(a.hull(&b), ConstantRange::new(8, 2, 12).unwrap());
        assert_eq!(a.hull(&ConstantRange::empty(8)), a);
        let wrapped = ConstantRange::new(8, 250, 3).unwrap();
        assert!(wrapped.hull(&a).contains(0));
        assert!(wrapped.hull(&a).contains(255));
    }

    #[test]
    fn test_urem_by_constant() {
        let r = ConstantRange::full(32).urem_by_constant(10);
        assert_eq!((r.lower(), r.upper()), (0, 10));
        let tight = ConstantRange::new(32, 0, 4).unwrap().urem_by_constant(10);
        assert_eq!((tight.lower(), tight.upper()), (0, 4));
    }

    #[test]
    fn test_display() {
        assert_eq!(ConstantRange::full(8).to_string(), "full-set");
        assert_eq!(ConstantRange::empty(8).to_string(), "empty-set");
        assert_eq!(ConstantRange::new(8, 0, 10).unwrap().to_string(), "[0,10)");
    }

    #[test]
    fn test_serde_forms() {
        let r: ConstantRange = serde_json::from_str(r#"{"width": 8, "lower": 0, "upper": 10}"#).unwrap();
        assert_eq!(r, ConstantRange::new(8, 0, 10).unwrap());
        let f: ConstantRange = serde_json::from_str(r#"{"width": 16, "set": "full"}"#).unwrap();
        assert!(f.is_full_set());
        let e: ConstantRange = serde_json::from_str(r#"{"width": 16, "set": "empty"}"#).unwrap();
        assert!(e.is_empty_set());
        assert!(serde_json::from_str::<ConstantRange>(r#"{"width": 8, "lower": 4, "upper": 4}"#).is_err());
        let back = serde_json::to_string(&ConstantRange::full(8)).unwrap();
        assert_eq!(back, r#"{"width":8,"set":"full"}"#);
    }
}
