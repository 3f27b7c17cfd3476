//! Price quotes from the pricing oracle, validated before any money is held.

use crate::amount::Amount;
use crate::config::LedgerPolicy;
use crate::error::{Error, Result};
use crate::state::{BillingMode, Terms};
use serde::{Deserialize, Serialize};

/// Untrusted price proposal as produced by the pricing oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub mode: BillingMode,

    /// Rate per minute, or flat price per read
    #[serde(alias = "rateOrPrice", alias = "rate", alias = "price")]
    pub rate_or_price: f64,

    #[serde(default, alias = "minMinutes")]
    pub min_minutes: Option<f64>,

    #[serde(default, alias = "capMinutes")]
    pub cap_minutes: Option<f64>,

    /// Explicit TTL; derived from the terms when absent
    #[serde(default, alias = "ttlSecs")]
    pub ttl_secs: Option<u64>,
}

/// A quote after coercion: safe to hold money against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedQuote {
    pub terms: Terms,
    pub approved_amount: Amount,
    pub ttl_secs: u64,
}

impl PriceQuote {
    pub fn per_minute(rate: f64, min_minutes: f64, cap_minutes: f64) -> Self {
        PriceQuote {
            mode: BillingMode::PerMinute,
            rate_or_price: rate,
            min_minutes: Some(min_minutes),
            cap_minutes: Some(cap_minutes),
            ttl_secs: None,
        }
    }

    pub fn per_read(price: f64) -> Self {
        PriceQuote {
            mode: BillingMode::PerRead,
            rate_or_price: price,
            min_minutes: None,
            cap_minutes: None,
            ttl_secs: None,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    /// Coerce into billing terms.
    ///
    /// Missing or negative minimums become 0; fractional minutes round up;
    /// a missing cap defaults to `max(min, 1)` and a cap below the minimum is
    /// raised to it. An explicit TTL is clamped to `policy.max_ttl_secs`.
    pub fn validate(&self, policy: &LedgerPolicy) -> Result<ValidatedQuote> {
        let rate = Amount::from_f64(self.rate_or_price)
            .filter(|r| !r.is_zero())
            .ok_or_else(|| {
                Error::InvalidQuote(format!(
                    "rate_or_price must be a positive number, got {}",
                    self.rate_or_price
                ))
            })?;

        let terms = match self.mode {
            BillingMode::PerMinute => {
                let min_minutes = whole_minutes(self.min_minutes).unwrap_or(0);
                let cap_minutes = whole_minutes(self.cap_minutes)
                    .filter(|c| *c > 0)
                    .unwrap_or_else(|| min_minutes.max(1))
                    .max(min_minutes);
                if cap_minutes > policy.max_cap_minutes {
                    return Err(Error::InvalidQuote(format!(
                        "cap_minutes {} exceeds maximum {}",
                        cap_minutes, policy.max_cap_minutes
                    )));
                }
                Terms::PerMinute {
                    rate,
                    min_minutes,
                    cap_minutes,
                }
            }
            BillingMode::PerRead => Terms::PerRead { price: rate },
        };

        let approved_amount = terms
            .approved_amount()
            .filter(|a| !a.is_zero())
            .ok_or_else(|| {
                Error::InvalidQuote("approved amount overflows or rounds to zero".to_string())
            })?;

        let ttl_secs = match self.ttl_secs.filter(|t| *t > 0) {
            Some(ttl) => ttl.min(policy.max_ttl_secs),
            None => default_ttl(&terms, policy),
        };

        Ok(ValidatedQuote {
            terms,
            approved_amount,
            ttl_secs,
        })
    }
}

fn whole_minutes(value: Option<f64>) -> Option<u32> {
    let value = value.filter(|v| v.is_finite())?;
    if value <= 0.0 {
        return Some(0);
    }
    Some(value.ceil().min(u32::MAX as f64) as u32)
}

fn default_ttl(terms: &Terms, policy: &LedgerPolicy) -> u64 {
    match terms {
        Terms::PerMinute { cap_minutes, .. } => (*cap_minutes as u64 * 60 + policy.ttl_buffer_secs)
            .max(policy.min_per_minute_ttl_secs),
        Terms::PerRead { .. } => policy.per_read_ttl_secs,
    }
}

/// External price negotiation. Only its output is trusted, and only after `validate`.
pub trait PricingOracle {
    fn quote(&self, payer_id: &str, content_ref: &str) -> Result<PriceQuote>;
}

/// Oracle that always proposes the same quote.
#[derive(Debug, Clone)]
pub struct FixedPriceOracle(pub PriceQuote);

impl PricingOracle for FixedPriceOracle {
    fn quote(&self, _payer_id: &str, _content_ref: &str) -> Result<PriceQuote> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(v: f64) -> Amount {
        Amount::from_f64(v).unwrap()
    }

    #[test]
    fn test_per_minute_hold_uses_cap() {
        let v = PriceQuote::per_minute(0.3, 2.0, 5.0)
            .validate(&LedgerPolicy::default())
            .unwrap();
        assert_eq!(v.approved_amount, amt(1.5));
        assert_eq!(v.ttl_secs, 600); // 5*60+120 = 420, floored at 600
    }

    #[test]
    fn test_long_cap_ttl() {
        let v = PriceQuote::per_minute(0.1, 0.0, 30.0)
            .validate(&LedgerPolicy::default())
            .unwrap();
        assert_eq!(v.ttl_secs, 30 * 60 + 120);
    }

    #[test]
    fn test_cap_defaults_and_coercion() {
        let policy = LedgerPolicy::default();
        let quote = PriceQuote {
            mode: BillingMode::PerMinute,
            rate_or_price: 0.25,
            min_minutes: Some(-3.0),
            cap_minutes: None,
            ttl_secs: None,
        };
        let v = quote.validate(&policy).unwrap();
        assert_eq!(
            v.terms,
            Terms::PerMinute {
                rate: amt(0.25),
                min_minutes: 0,
                cap_minutes: 1
            }
        );

        let quote = PriceQuote::per_minute(0.25, 2.5, 1.0);
        let v = quote.validate(&policy).unwrap();
        assert_eq!(
            v.terms,
            Terms::PerMinute {
                rate: amt(0.25),
                min_minutes: 3,
                cap_minutes: 3
            }
        );
    }

    #[test]
    fn test_rejects_bad_rates() {
        let policy = LedgerPolicy::default();
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = PriceQuote::per_read(rate).validate(&policy).unwrap_err();
            assert!(matches!(err, Error::InvalidQuote(_)));
        }
        // Rounds to 0.00 at per-read precision
        assert!(PriceQuote::per_read(0.001).validate(&policy).is_err());
    }

    #[test]
    fn test_rejects_oversized_cap() {
        let err = PriceQuote::per_minute(0.1, 0.0, 10_000.0)
            .validate(&LedgerPolicy::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQuote(_)));
    }

    #[test]
    fn test_per_read_defaults() {
        let v = PriceQuote::per_read(8.0)
            .validate(&LedgerPolicy::default())
            .unwrap();
        assert_eq!(v.approved_amount, amt(8.0));
        assert_eq!(v.ttl_secs, 900);

        let v = PriceQuote::per_read(1.0)
            .with_ttl(30)
            .validate(&LedgerPolicy::default())
            .unwrap();
        assert_eq!(v.ttl_secs, 30);
    }

    #[test]
    fn test_explicit_ttl_is_clamped() {
        let policy = LedgerPolicy::default();
        let quote: PriceQuote = serde_json::from_str(
            r#"{"mode":"per_read","price":1.0,"ttlSecs":18446744073709551615}"#,
        )
        .unwrap();
        let v = quote.validate(&policy).unwrap();
        assert_eq!(v.ttl_secs, policy.max_ttl_secs);
    }

    #[test]
    fn test_parse_oracle_json() {
        let quote: PriceQuote = serde_json::from_str(
            r#"{"mode":"per_minute","rateOrPrice":0.3,"minMinutes":2,"capMinutes":5}"#,
        )
        .unwrap();
        assert_eq!(quote, PriceQuote::per_minute(0.3, 2.0, 5.0));
    }
}
