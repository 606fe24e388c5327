//! Per-bit ternary facts
//!
//! A [`KnownBits`] pairs a forced-zero mask with a forced-one mask. A bit set
//! in neither mask is unknown; a bit set in both is a contradiction and is
//! rejected on construction.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::width_mask;

/// A `width`-bit vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitMask {
    pub width: u32,
    pub bits: u64,
}

impl BitMask {
    /// Bits above `width` are dropped
    pub fn new(width: u32, bits: u64) -> Self {
        Self {
            width,
            bits: bits & width_mask(width),
        }
    }

    pub fn zeros(width: u32) -> Self {
        Self { width, bits: 0 }
    }

    pub fn count_ones(&self) -> u32 {
        self.bits.count_ones()
    }

    pub fn is_zero(&self) -> bool {
        self.bits == 0
    }
}

/// Malformed known-bits pair
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KnownBitsError {
    #[error("mask widths differ ({zero_width} vs {one_width})")]
    WidthMismatch { zero_width: u32, one_width: u32 },

    #[error("bits {overlap:#x} are both forced zero and forced one")]
    Conflict { overlap: u64 },
}

/// Forced-zero and forced-one masks over the same width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KnownBits {
    zero: BitMask,
    one: BitMask,
}

impl KnownBits {
    pub fn new(zero: BitMask, one: BitMask) -> Result<Self, KnownBitsError> {
        if zero.width != one.width {
            return Err(KnownBitsError::WidthMismatch {
                zero_width: zero.width,
                one_width: one.width,
            });
        }
        let overlap = zero.bits & one.bits;
        if overlap != 0 {
            return Err(KnownBitsError::Conflict { overlap });
        }
        Ok(Self { zero, one })
    }

    /// Nothing known
    pub fn unknown(width: u32) -> Self {
        Self {
            zero: BitMask::zeros(width),
            one: BitMask::zeros(width),
        }
    }

    /// Every bit known, equal to `value`
    pub fn constant(width: u32, value: u64) -> Self {
        let mask = width_mask(width);
        Self {
            zero: BitMask::new(width, !value & mask),
            one: BitMask::new(width, value & mask),
        }
    }

    /// Build from raw masks already known to be disjoint
    fn from_bits(width: u32, zero: u64, one: u64) -> Self {
        debug_assert_eq!(zero & one, 0);
        Self {
            zero: BitMask::new(width, zero),
            one: BitMask::new(width, one),
        }
    }

    pub fn width(&self) -> u32 {
        self.zero.width
    }

    pub fn zero(&self) -> BitMask {
        self.zero
    }

    pub fn one(&self) -> BitMask {
        self.one
    }

    /// Number of bits fixed to either value
    pub fn known_count(&self) -> u32 {
        self.zero.count_ones() + self.one.count_ones()
    }

    pub fn is_unknown(&self) -> bool {
        self.zero.is_zero() && self.one.is_zero()
    }

    pub fn is_constant(&self) -> bool {
        (self.zero.bits | self.one.bits) == width_mask(self.width())
    }

    /// Smallest value compatible with the known bits
    pub fn min_value(&self) -> u64 {
        self.one.bits
    }

    /// Largest value compatible with the known bits
    pub fn max_value(&self) -> u64 {
        !self.zero.bits & width_mask(self.width())
    }

    /// Whether `value` agrees with every known bit
    pub fn contains(&self, value: u64) -> bool {
        let value = value & width_mask(self.width());
        value & self.zero.bits == 0 && value & self.one.bits == self.one.bits
    }

    /// Most significant bit first: `0` forced zero, `1` forced one, `x` unknown
    pub fn bitstring(&self) -> String {
        (0..self.width())
            .rev()
            .map(|bit| {
                let probe = 1u64 << bit;
                if self.zero.bits & probe != 0 {
                    '0'
                } else if self.one.bits & probe != 0 {
                    '1'
                } else {
                    'x'
                }
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Transfer functions
    // ------------------------------------------------------------------------

    pub fn and(&self, other: &KnownBits) -> KnownBits {
        Self::from_bits(
            self.width(),
            self.zero.bits | other.zero.bits,
            self.one.bits & other.one.bits,
        )
    }

    pub fn or(&self, other: &KnownBits) -> KnownBits {
        Self::from_bits(
            self.width(),
            self.zero.bits & other.zero.bits,
            self.one.bits | other.one.bits,
        )
    }

    pub fn xor(&self, other: &KnownBits) -> KnownBits {
        let zero = (self.zero.bits & other.zero.bits) | (self.one.bits & other.one.bits);
        let one = (self.zero.bits & other.one.bits) | (self.one.bits & other.zero.bits);
        Self::from_bits(self.width(), zero, one)
    }

    pub fn not(&self) -> KnownBits {
        Self::from_bits(self.width(), self.one.bits, self.zero.bits)
    }

    /// Shift left by a constant amount; vacated low bits are zero
    pub fn shl(&self, amount: u32) -> KnownBits {
        let width = self.width();
        if amount >= width {
            return Self::constant(width, 0);
        }
        let vacated = (1u64 << amount) - 1;
        Self::from_bits(width, (self.zero.bits << amount) | vacated, self.one.bits << amount)
    }

    /// Logical shift right by a constant amount; vacated high bits are zero
    pub fn lshr(&self, amount: u32) -> KnownBits {
        let width = self.width();
        if amount >= width {
            return Self::constant(width, 0);
        }
        let vacated = width_mask(width) & !(width_mask(width) >> amount);
        Self::from_bits(width, (self.zero.bits >> amount) | vacated, self.one.bits >> amount)
    }

    /// Arithmetic shift right by a constant amount; vacated bits copy the sign
    pub fn ashr(&self, amount: u32) -> KnownBits {
        let width = self.width();
        let amount = amount.min(width - 1);
        let sign = 1u64 << (width - 1);
        let vacated = width_mask(width) & !(width_mask(width) >> amount);
        let mut zero = self.zero.bits >> amount;
        let mut one = self.one.bits >> amount;
        if self.zero.bits & sign != 0 {
            zero |= vacated;
        } else if self.one.bits & sign != 0 {
            one |= vacated;
        }
        Self::from_bits(width, zero, one)
    }

    /// Possible sums `self + other` modulo `2^width`
    pub fn add(&self, other: &KnownBits) -> KnownBits {
        self.add_with_carry(other, true, false)
    }

    /// Possible differences `self - other` modulo `2^width`
    pub fn sub(&self, other: &KnownBits) -> KnownBits {
        // a - b == a + !b + 1
        self.add_with_carry(&other.not(), false, true)
    }

    fn add_with_carry(&self, other: &KnownBits, carry_zero: bool, carry_one: bool) -> KnownBits {
        let width = self.width();
        let mask = width_mask(width);
        let possible_sum_zero = self
            .max_value()
            .wrapping_add(other.max_value())
            .wrapping_add(u64::from(!carry_zero))
            & mask;
        let possible_sum_one = self
            .min_value()
            .wrapping_add(other.min_value())
            .wrapping_add(u64::from(carry_one))
            & mask;

        let carry_known_zero = !(possible_sum_zero ^ self.zero.bits ^ other.zero.bits) & mask;
        let carry_known_one = possible_sum_one ^ self.one.bits ^ other.one.bits;

        let known = (self.zero.bits | self.one.bits)
            & (other.zero.bits | other.one.bits)
            & (carry_known_zero | carry_known_one);

        Self::from_bits(width, !possible_sum_zero & known, possible_sum_one & known)
    }

    /// New high bits are zero
    pub fn zero_extend(&self, width: u32) -> KnownBits {
        if width <= self.width() {
            return self.truncate(width);
        }
        let high = width_mask(width) & !width_mask(self.width());
        Self::from_bits(width, self.zero.bits | high, self.one.bits)
    }

    /// New high bits copy whatever is known about the sign bit
    pub fn sign_extend(&self, width: u32) -> KnownBits {
        if width <= self.width() {
            return self.truncate(width);
        }
        let high = width_mask(width) & !width_mask(self.width());
        let sign = 1u64 << (self.width() - 1);
        let mut zero = self.zero.bits;
        let mut one = self.one.bits;
        if zero & sign != 0 {
            zero |= high;
        } else if one & sign != 0 {
            one |= high;
        }
        Self::from_bits(width, zero, one)
    }

    pub fn truncate(&self, width: u32) -> KnownBits {
        Self::from_bits(width, self.zero.bits, self.one.bits)
    }

    /// Bits known the same way in both
    pub fn common(&self, other: &KnownBits) -> KnownBits {
        Self::from_bits(
            self.width(),
            self.zero.bits & other.zero.bits,
            self.one.bits & other.one.bits,
        )
    }
}

impl fmt::Display for KnownBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bitstring())
    }
}
