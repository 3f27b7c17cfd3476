//! Hook: injectable observer for ledger lifecycle events.
//!
//! The ledger calls the hook at each stage. `before_open` runs before any
//! write and may veto; the `on_*` callbacks run after the write is committed
//! and cannot undo it.

use crate::amount::Amount;
use crate::error::Result;
use crate::ledger::UsageStatus;
use crate::state::{FinalizedCharge, Reservation, SettlementBatch, Tick};

/// Trait-based hook for ledger interception.
///
/// Shared across request threads, hence `&self` and `Send + Sync`.
pub trait LedgerHook: Send + Sync {
    /// Called before a hold is placed. Return Err to block the open.
    fn before_open(&self, _account_id: &str, _payee_id: &str, _approved: Amount) -> Result<()> {
        Ok(())
    }

    /// Called after a reservation and its hold are committed.
    fn on_reservation_opened(&self, _reservation: &Reservation) {}

    /// Called after a tick is appended and usage persisted.
    fn on_tick_recorded(&self, _tick: &Tick, _usage: &UsageStatus) {}

    /// Called after a reservation is closed into a charge (finalized or expired).
    fn on_charge_finalized(&self, _charge: &FinalizedCharge) {}

    /// Called after a new draft batch is persisted.
    fn on_batch_drafted(&self, _batch: &SettlementBatch) {}

    /// Called after a batch is marked distributed.
    fn on_batch_distributed(&self, _batch: &SettlementBatch) {}
}

/// No-op hook: default.
#[derive(Debug, Clone, Default)]
pub struct NoOpHook;

impl LedgerHook for NoOpHook {}
