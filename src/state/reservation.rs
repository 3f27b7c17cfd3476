use crate::amount::{Amount, MS_PER_MINUTE, PER_MINUTE_DECIMALS, PER_READ_DECIMALS};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    PerMinute,
    PerRead,
}

impl fmt::Display for BillingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BillingMode::PerMinute => write!(f, "per_minute"),
            BillingMode::PerRead => write!(f, "per_read"),
        }
    }
}

/// Validated billing terms for one reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terms {
    PerMinute {
        rate: Amount,
        min_minutes: u32,
        cap_minutes: u32,
    },
    PerRead {
        price: Amount,
    },
}

impl Terms {
    pub fn mode(&self) -> BillingMode {
        match self {
            Terms::PerMinute { .. } => BillingMode::PerMinute,
            Terms::PerRead { .. } => BillingMode::PerRead,
        }
    }

    pub fn rate_or_price(&self) -> Amount {
        match self {
            Terms::PerMinute { rate, .. } => *rate,
            Terms::PerRead { price } => *price,
        }
    }

    /// Worst-case charge, held for the whole session.
    ///
    /// Per-minute terms hold the full cap rather than the minimum.
    pub fn approved_amount(&self) -> Option<Amount> {
        match self {
            Terms::PerMinute {
                rate, cap_minutes, ..
            } => rate
                .checked_mul(*cap_minutes as u64)
                .map(|a| a.round_to(PER_MINUTE_DECIMALS)),
            Terms::PerRead { price } => Some(price.round_to(PER_READ_DECIMALS)),
        }
    }

    /// Billing ceiling in focused milliseconds (per-minute only).
    pub fn cap_ms(&self) -> Option<u64> {
        match self {
            Terms::PerMinute { cap_minutes, .. } => Some(*cap_minutes as u64 * MS_PER_MINUTE),
            Terms::PerRead { .. } => None,
        }
    }
}

/// Reservation lifecycle: `Active -> {Expired, Finalized}`, both terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Expired,
    Finalized,
}

impl ReservationStatus {
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        matches!(
            (self, next),
            (ReservationStatus::Active, ReservationStatus::Expired)
                | (ReservationStatus::Active, ReservationStatus::Finalized)
        )
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservationStatus::Active => write!(f, "active"),
            ReservationStatus::Expired => write!(f, "expired"),
            ReservationStatus::Finalized => write!(f, "finalized"),
        }
    }
}

/// Reservation aggregate: a bounded hold for one metered session.
///
/// Identity: `id`, owned by exactly one ledger account.
///
/// Invariants:
/// - `used_amount <= approved_amount`
/// - `used_ms <= cap_minutes * 60_000` for per-minute terms
/// - status only moves along the transition table above
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub id: String,
    pub account_id: String,
    pub payee_id: String,
    pub content_ref: String,
    pub terms: Terms,
    pub approved_amount: Amount,
    pub used_amount: Amount,

    /// Billable focused time accrued so far
    pub used_ms: u64,

    pub ttl_secs: u64,
    pub created_at: u64,
    pub expires_at: u64,
    pub status: ReservationStatus,
    pub version: u64,
}

impl Reservation {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        id: String,
        account_id: String,
        payee_id: String,
        content_ref: String,
        terms: Terms,
        approved_amount: Amount,
        ttl_secs: u64,
        now_ms: u64,
    ) -> Self {
        Reservation {
            id,
            account_id,
            payee_id,
            content_ref,
            terms,
            approved_amount,
            used_amount: Amount::ZERO,
            used_ms: 0,
            ttl_secs,
            created_at: now_ms,
            expires_at: now_ms.saturating_add(ttl_secs.saturating_mul(1_000)),
            status: ReservationStatus::Active,
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn renew(&mut self, now_ms: u64, window_secs: u64) {
        self.expires_at = now_ms.saturating_add(window_secs.saturating_mul(1_000));
    }

    pub fn used_minutes(&self) -> f64 {
        self.used_ms as f64 / MS_PER_MINUTE as f64
    }

    /// Portion of the hold not yet accrued.
    pub fn remaining_hold(&self) -> Amount {
        self.approved_amount.saturating_sub(self.used_amount)
    }

    pub fn record_usage(&mut self, added_ms: u64, added_amount: Amount) {
        self.used_ms = self.used_ms.saturating_add(added_ms);
        self.used_amount = self.used_amount.saturating_add(added_amount);
    }

    pub fn transition(&mut self, next: ReservationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                entity: "reservation",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Reject anything but an active reservation.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::NotActive {
                id: self.id.clone(),
                status: self.status.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(v: f64) -> Amount {
        Amount::from_f64(v).unwrap()
    }

    fn per_minute() -> Terms {
        Terms::PerMinute {
            rate: amt(0.3),
            min_minutes: 2,
            cap_minutes: 5,
        }
    }

    #[test]
    fn test_approved_amount_uses_cap() {
        assert_eq!(per_minute().approved_amount(), Some(amt(1.5)));
        assert_eq!(
            Terms::PerRead { price: amt(0.125) }.approved_amount(),
            Some(amt(0.13))
        );
    }

    #[test]
    fn test_approved_amount_overflow() {
        let terms = Terms::PerMinute {
            rate: Amount::from_micros(u64::MAX),
            min_minutes: 0,
            cap_minutes: 2,
        };
        assert_eq!(terms.approved_amount(), None);
    }

    #[test]
    fn test_open_sets_expiry() {
        let r = Reservation::open(
            "r1".into(),
            "alice".into(),
            "carol".into(),
            "post-1".into(),
            per_minute(),
            amt(1.5),
            600,
            1_000,
        );
        assert!(r.is_active());
        assert_eq!(r.expires_at, 601_000);
        assert!(!r.is_expired_at(600_999));
        assert!(r.is_expired_at(601_000));
    }

    #[test]
    fn test_expiry_saturates() {
        let mut r = Reservation::open(
            "r1".into(),
            "alice".into(),
            "carol".into(),
            "post-1".into(),
            per_minute(),
            amt(1.5),
            u64::MAX,
            1_000,
        );
        assert_eq!(r.expires_at, u64::MAX);
        r.renew(5_000, u64::MAX);
        assert_eq!(r.expires_at, u64::MAX);
    }

    #[test]
    fn test_transition_table() {
        use ReservationStatus::*;
        assert!(Active.can_transition_to(Expired));
        assert!(Active.can_transition_to(Finalized));
        assert!(!Expired.can_transition_to(Finalized));
        assert!(!Finalized.can_transition_to(Active));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut r = Reservation::open(
            "r1".into(),
            "alice".into(),
            "carol".into(),
            "post-1".into(),
            per_minute(),
            amt(1.5),
            600,
            0,
        );
        r.transition(ReservationStatus::Finalized).unwrap();
        let err = r.transition(ReservationStatus::Expired).unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
        assert!(matches!(r.ensure_active(), Err(Error::NotActive { .. })));
    }

    #[test]
    fn test_record_usage() {
        let mut r = Reservation::open(
            "r1".into(),
            "alice".into(),
            "carol".into(),
            "post-1".into(),
            per_minute(),
            amt(1.5),
            600,
            0,
        );
        r.record_usage(30_000, amt(0.15));
        assert_eq!(r.used_minutes(), 0.5);
        assert_eq!(r.remaining_hold(), amt(1.35));
    }
}
