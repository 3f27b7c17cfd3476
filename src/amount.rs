//! Fixed-point money.
//!
//! Amounts are whole micro-units (1e-6), the base unit the payout rail settles in.
//! All ledger arithmetic happens on integers; `f64` only appears at the edges
//! (untrusted quotes coming in, ratios and JSON output going out).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;

pub const MICROS_PER_UNIT: u64 = 1_000_000;
pub const MS_PER_MINUTE: u64 = 60_000;

/// Decimal places kept for per-minute holds and debits.
pub const PER_MINUTE_DECIMALS: u32 = 3;
/// Decimal places kept for flat per-read prices.
pub const PER_READ_DECIMALS: u32 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_micros(micros: u64) -> Self {
        Amount(micros)
    }

    pub const fn micros(self) -> u64 {
        self.0
    }

    /// Convert an untrusted decimal value. Rejects NaN, infinities, negatives and overflow.
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let micros = (value * MICROS_PER_UNIT as f64).round();
        if micros > u64::MAX as f64 {
            return None;
        }
        Some(Amount(micros as u64))
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / MICROS_PER_UNIT as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Round half-up to `decimals` places (0..=6).
    pub fn round_to(self, decimals: u32) -> Self {
        if decimals >= 6 {
            return self;
        }
        let step = 10u64.pow(6 - decimals);
        let rounded = (self.0 as u128 + (step / 2) as u128) / step as u128 * step as u128;
        Amount(rounded.min(u64::MAX as u128) as u64)
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    pub fn checked_mul(self, factor: u64) -> Option<Amount> {
        self.0.checked_mul(factor).map(Amount)
    }

    /// Cost of `ms` milliseconds at `self` per minute, rounded to the nearest micro-unit.
    pub fn for_millis(self, ms: u64) -> Amount {
        let scaled = self.0 as u128 * ms as u128;
        let micros = (scaled + (MS_PER_MINUTE / 2) as u128) / MS_PER_MINUTE as u128;
        Amount(micros.min(u64::MAX as u128) as u64)
    }

    /// Whole milliseconds that `budget` buys at `self` per minute (floored).
    pub fn millis_for(self, budget: Amount) -> u64 {
        if self.0 == 0 {
            return 0;
        }
        let ms = budget.0 as u128 * MS_PER_MINUTE as u128 / self.0 as u128;
        ms.min(u64::MAX as u128) as u64
    }

    /// `self / whole` as a fraction; 0 when `whole` is zero.
    pub fn ratio_of(self, whole: Amount) -> f64 {
        if whole.0 == 0 {
            0.0
        } else {
            self.0 as f64 / whole.0 as f64
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / MICROS_PER_UNIT;
        let frac = format!("{:06}", self.0 % MICROS_PER_UNIT);
        let trimmed = frac.trim_end_matches('0');
        if trimmed.len() < 2 {
            write!(f, "{}.{:0<2}", whole, trimmed)
        } else {
            write!(f, "{}.{}", whole, trimmed)
        }
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, Amount::saturating_add)
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Self {
        iter.copied().sum()
    }
}
