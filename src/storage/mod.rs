pub mod journal;
pub mod table;

pub use journal::{FileJournal, Journal, NullJournal};
pub use table::{FileStore, MemoryStore, TableStore};

use crate::error::Result;
use crate::state::{
    BatchStatus, FinalizedCharge, FundingRecord, LedgerAccount, LedgerState, Reservation,
    SettlementBatch, Tick,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One row-level write inside an atomic `Store::commit`.
///
/// `expected_version: None` means the row must not exist yet; `Some(v)` means
/// the stored row must still be at version `v` (compare-and-swap).
#[derive(Debug, Clone)]
pub enum Write {
    PutAccount {
        row: LedgerAccount,
        expected_version: Option<u64>,
    },
    PutReservation {
        row: Reservation,
        expected_version: Option<u64>,
    },
    /// Append to the reservation's tick sequence; the store assigns `seq`.
    AppendTick(Tick),
    /// Insert-only.
    InsertCharge(FinalizedCharge),
    /// Append to the account's approval/deposit history.
    AppendFunding(FundingRecord),
}

/// Post-image of a committed write, as stored in the journal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Record {
    Account(LedgerAccount),
    Reservation(Reservation),
    Tick(Tick),
    Charge(FinalizedCharge),
    Batch(SettlementBatch),
    BatchDeleted(String),
    Funding(FundingRecord),
}

/// Storage abstraction for the five ledger tables.
///
/// Implementations must preserve:
/// - All-or-nothing `commit` with every precondition checked before any write
/// - Versioned compare-and-swap on account and reservation rows
/// - `claim_charges` only claims charges with no batch id
/// - At most one draft batch at a time
/// - Durability before acknowledging a write (where the backend is durable)
pub trait Store: Send + Sync {
    fn account(&self, id: &str) -> Result<Option<LedgerAccount>>;

    fn accounts(&self) -> Result<Vec<LedgerAccount>>;

    fn reservation(&self, id: &str) -> Result<Option<Reservation>>;

    fn active_reservations(&self) -> Result<Vec<Reservation>>;

    fn account_reservations(&self, account_id: &str) -> Result<Vec<Reservation>>;

    /// Ticks of a reservation in arrival order.
    fn ticks(&self, reservation_id: &str) -> Result<Vec<Tick>>;

    /// Approvals and deposits of an account, oldest first.
    fn funding(&self, account_id: &str) -> Result<Vec<FundingRecord>>;

    fn charge(&self, id: &str) -> Result<Option<FinalizedCharge>>;

    /// All charges, oldest first.
    fn charges(&self) -> Result<Vec<FinalizedCharge>>;

    /// Valid charges not yet claimed by any batch, oldest first.
    fn unsettled_charges(&self) -> Result<Vec<FinalizedCharge>>;

    /// Apply all writes atomically, or none of them.
    fn commit(&self, writes: Vec<Write>) -> Result<()>;

    /// Set `settlement_batch_id`/`settled_at` on each listed charge that is not
    /// yet claimed. Returns the ids actually claimed.
    fn claim_charges(
        &self,
        charge_ids: &[String],
        batch_id: &str,
        settled_at: u64,
    ) -> Result<Vec<String>>;

    fn batch(&self, id: &str) -> Result<Option<SettlementBatch>>;

    fn draft_batch(&self) -> Result<Option<SettlementBatch>>;

    /// Insert a new batch. Fails with `DraftExists` if a second draft would result.
    fn insert_batch(&self, batch: SettlementBatch) -> Result<()>;

    /// Remove a stale draft. Distributed batches can never be deleted.
    fn delete_draft_batch(&self, id: &str) -> Result<()>;

    /// Replace a batch whose stored status is still `expected`.
    fn update_batch(&self, batch: SettlementBatch, expected: BatchStatus) -> Result<()>;

    /// Consistent copy of every table (audits and reports).
    fn snapshot(&self) -> Result<LedgerState>;
}

/// Shared handle: lets one store back a ledger and other readers at once.
impl<T: Store + ?Sized> Store for Arc<T> {
    fn account(&self, id: &str) -> Result<Option<LedgerAccount>> {
        (**self).account(id)
    }

    fn accounts(&self) -> Result<Vec<LedgerAccount>> {
        (**self).accounts()
    }

    fn reservation(&self, id: &str) -> Result<Option<Reservation>> {
        (**self).reservation(id)
    }

    fn active_reservations(&self) -> Result<Vec<Reservation>> {
        (**self).active_reservations()
    }

    fn account_reservations(&self, account_id: &str) -> Result<Vec<Reservation>> {
        (**self).account_reservations(account_id)
    }

    fn ticks(&self, reservation_id: &str) -> Result<Vec<Tick>> {
        (**self).ticks(reservation_id)
    }

    fn funding(&self, account_id: &str) -> Result<Vec<FundingRecord>> {
        (**self).funding(account_id)
    }

    fn charge(&self, id: &str) -> Result<Option<FinalizedCharge>> {
        (**self).charge(id)
    }

    fn charges(&self) -> Result<Vec<FinalizedCharge>> {
        (**self).charges()
    }

    fn unsettled_charges(&self) -> Result<Vec<FinalizedCharge>> {
        (**self).unsettled_charges()
    }

    fn commit(&self, writes: Vec<Write>) -> Result<()> {
        (**self).commit(writes)
    }

    fn claim_charges(
        &self,
        charge_ids: &[String],
        batch_id: &str,
        settled_at: u64,
    ) -> Result<Vec<String>> {
        (**self).claim_charges(charge_ids, batch_id, settled_at)
    }

    fn batch(&self, id: &str) -> Result<Option<SettlementBatch>> {
        (**self).batch(id)
    }

    fn draft_batch(&self) -> Result<Option<SettlementBatch>> {
        (**self).draft_batch()
    }

    fn insert_batch(&self, batch: SettlementBatch) -> Result<()> {
        (**self).insert_batch(batch)
    }

    fn delete_draft_batch(&self, id: &str) -> Result<()> {
        (**self).delete_draft_batch(id)
    }

    fn update_batch(&self, batch: SettlementBatch, expected: BatchStatus) -> Result<()> {
        (**self).update_batch(batch, expected)
    }

    fn snapshot(&self) -> Result<LedgerState> {
        (**self).snapshot()
    }
}
