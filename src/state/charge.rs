use crate::amount::Amount;
use crate::state::BillingMode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a finalized session was refunded in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    LowVisibility,
    TooShort,
}

impl fmt::Display for RefundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefundReason::LowVisibility => write!(f, "low_visibility"),
            RefundReason::TooShort => write!(f, "too_short"),
        }
    }
}

/// Immutable audit and settlement unit produced when a reservation closes.
///
/// Only the settlement claim (`settlement_batch_id`, `settled_at`) is ever
/// written after creation, and only once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalizedCharge {
    pub id: String,
    pub reservation_id: String,
    pub payer_id: String,
    pub payee_id: String,
    pub content_ref: String,
    pub mode: BillingMode,

    /// Focused minutes (per-minute only)
    pub minutes: Option<f64>,

    /// Read count (per-read only)
    pub reads: Option<u32>,

    pub debit: Amount,
    pub valid: bool,
    pub refund_reason: Option<RefundReason>,
    pub created_at: u64,
    pub settlement_batch_id: Option<String>,
    pub settled_at: Option<u64>,
}

impl FinalizedCharge {
    pub fn is_settled(&self) -> bool {
        self.settlement_batch_id.is_some()
    }

    /// Eligible for the next settlement round.
    pub fn is_unsettled_payable(&self) -> bool {
        self.valid && !self.is_settled()
    }

    /// Settled by some batch other than `batch_id`.
    pub fn claimed_elsewhere(&self, batch_id: &str) -> bool {
        matches!(&self.settlement_batch_id, Some(b) if b != batch_id)
    }

    /// Claim for a batch. Returns false (and changes nothing) if already claimed.
    pub fn claim(&mut self, batch_id: &str, settled_at: u64) -> bool {
        if self.is_settled() {
            return false;
        }
        self.settlement_batch_id = Some(batch_id.to_string());
        self.settled_at = Some(settled_at);
        true
    }
}
