pub mod account;
pub mod charge;
pub mod funding;
pub mod hook;
pub mod reservation;
pub mod settlement;
pub mod tick;

pub use account::LedgerAccount;
pub use charge::{FinalizedCharge, RefundReason};
pub use funding::{funding_total, FundingKind, FundingRecord, RailRef};
pub use hook::{LedgerHook, NoOpHook};
pub use reservation::{BillingMode, Reservation, ReservationStatus, Terms};
pub use settlement::{BatchStatus, SettlementBatch};
pub use tick::{attention_summary, Tick};

use crate::amount::Amount;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Core ledger state: every account, reservation, tick, charge and batch.
///
/// Fully reconstructible by replaying the journal over the last snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LedgerState {
    /// Accounts indexed by payer id
    pub accounts: HashMap<String, LedgerAccount>,

    /// Reservations indexed by reservation id
    pub reservations: HashMap<String, Reservation>,

    /// Tick sequences indexed by reservation id, in arrival order
    pub ticks: HashMap<String, Vec<Tick>>,

    /// Finalized charges indexed by charge id
    pub charges: HashMap<String, FinalizedCharge>,

    /// Settlement batches indexed by batch id
    pub batches: HashMap<String, SettlementBatch>,

    /// Approvals and deposits indexed by account id, in arrival order
    pub funding: HashMap<String, Vec<FundingRecord>>,
}

impl LedgerState {
    /// Create empty genesis state
    pub fn new() -> Self {
        LedgerState::default()
    }

    pub fn get_account(&self, id: &str) -> Option<&LedgerAccount> {
        self.accounts.get(id)
    }

    pub fn get_reservation(&self, id: &str) -> Option<&Reservation> {
        self.reservations.get(id)
    }

    pub fn get_charge(&self, id: &str) -> Option<&FinalizedCharge> {
        self.charges.get(id)
    }

    pub fn get_batch(&self, id: &str) -> Option<&SettlementBatch> {
        self.batches.get(id)
    }

    pub fn ticks_for(&self, reservation_id: &str) -> &[Tick] {
        self.ticks
            .get(reservation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn funding_for(&self, account_id: &str) -> &[FundingRecord] {
        self.funding
            .get(account_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn active_reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values().filter(|r| r.is_active())
    }

    pub fn account_reservations<'a>(
        &'a self,
        account_id: &'a str,
    ) -> impl Iterator<Item = &'a Reservation> {
        self.reservations
            .values()
            .filter(move |r| r.account_id == account_id)
    }

    /// The single draft batch, if any.
    pub fn draft_batch(&self) -> Option<&SettlementBatch> {
        self.batches.values().find(|b| b.is_draft())
    }

    /// Hold that `account_id` should carry: sum of approved amounts over its active reservations.
    pub fn expected_hold(&self, account_id: &str) -> Amount {
        self.account_reservations(account_id)
            .filter(|r| r.is_active())
            .map(|r| r.approved_amount)
            .sum()
    }
}
