//! Replay: rebuild ledger state from a snapshot and the journal tail.
//!
//! Records are post-images, so replay never re-runs business rules; it only
//! puts rows back where their commit left them.

use crate::state::LedgerState;
use crate::storage::Record;

/// Apply one committed record to state.
pub fn apply_record(state: &mut LedgerState, record: &Record) {
    match record {
        Record::Account(account) => {
            state.accounts.insert(account.id.clone(), account.clone());
        }
        Record::Reservation(reservation) => {
            state
                .reservations
                .insert(reservation.id.clone(), reservation.clone());
        }
        Record::Tick(tick) => {
            state
                .ticks
                .entry(tick.reservation_id.clone())
                .or_default()
                .push(tick.clone());
        }
        Record::Charge(charge) => {
            state.charges.insert(charge.id.clone(), charge.clone());
        }
        Record::Batch(batch) => {
            state.batches.insert(batch.id.clone(), batch.clone());
        }
        Record::BatchDeleted(id) => {
            state.batches.remove(id);
        }
        Record::Funding(record) => {
            state
                .funding
                .entry(record.account_id.clone())
                .or_default()
                .push(record.clone());
        }
    }
}

/// Replay journal entries (one entry per commit) on top of `state`.
pub fn replay_entries<I>(mut state: LedgerState, entries: I) -> LedgerState
where
    I: IntoIterator<Item = Vec<Record>>,
{
    for entry in entries {
        for record in &entry {
            apply_record(&mut state, record);
        }
    }
    state
}
