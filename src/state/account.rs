use crate::amount::Amount;
use serde::{Deserialize, Serialize};

/// Ledger account: one payer's running allowance totals.
///
/// Invariants:
/// - `available_allowance()` never underflows (saturates at zero)
/// - `pending_hold` equals the sum of `approved_amount` over the payer's active reservations
/// - `version` increases by one on every committed write
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerAccount {
    pub id: String,

    /// Cumulative allowance ever granted
    pub approved_total: Amount,

    /// Cumulative finalized charges
    pub used_total: Amount,

    /// Informational; funds moved on-chain by the payer
    pub deposited_total: Amount,

    /// Sum of approved amounts of currently open reservations
    pub pending_hold: Amount,

    /// Optimistic concurrency version (0 = never persisted)
    pub version: u64,
}

impl LedgerAccount {
    pub fn new(id: String) -> Self {
        LedgerAccount {
            id,
            approved_total: Amount::ZERO,
            used_total: Amount::ZERO,
            deposited_total: Amount::ZERO,
            pending_hold: Amount::ZERO,
            version: 0,
        }
    }

    /// Create an account with an initial allowance
    pub fn with_allowance(id: String, approved_total: Amount) -> Self {
        LedgerAccount {
            approved_total,
            ..LedgerAccount::new(id)
        }
    }

    /// `max(0, approved_total - used_total - pending_hold)`
    pub fn available_allowance(&self) -> Amount {
        self.approved_total
            .saturating_sub(self.used_total)
            .saturating_sub(self.pending_hold)
    }

    /// Room a reservation may still spend, ignoring its own hold.
    pub fn available_excluding_hold(&self, hold: Amount, already_used: Amount) -> Amount {
        let other_holds = self.pending_hold.saturating_sub(hold);
        self.approved_total
            .saturating_sub(self.used_total)
            .saturating_sub(other_holds)
            .saturating_sub(already_used)
    }

    pub fn grant(&mut self, amount: Amount) {
        self.approved_total = self.approved_total.saturating_add(amount);
    }

    pub fn record_deposit(&mut self, amount: Amount) {
        self.deposited_total = self.deposited_total.saturating_add(amount);
    }

    /// Place a hold. Fails without mutating when the allowance cannot cover it.
    pub fn hold(&mut self, amount: Amount) -> Result<(), Amount> {
        let available = self.available_allowance();
        if amount > available {
            return Err(available);
        }
        self.pending_hold = self.pending_hold.saturating_add(amount);
        Ok(())
    }

    /// Release a hold (floored at zero) and book the final debit against it.
    pub fn settle_hold(&mut self, hold: Amount, debit: Amount) {
        self.pending_hold = self.pending_hold.saturating_sub(hold);
        self.used_total = self.used_total.saturating_add(debit);
    }

    /// `(used_total + active_usage) / approved_total`, capped at 1.
    pub fn percent_used(&self, active_usage: Amount) -> f64 {
        self.used_total
            .saturating_add(active_usage)
            .ratio_of(self.approved_total)
            .min(1.0)
    }
}
