use crate::config::Config;
use crate::error::{Error, Result};
use crate::replay::apply_record;
use crate::state::{
    BatchStatus, FinalizedCharge, FundingRecord, LedgerAccount, LedgerState, Reservation,
    SettlementBatch, Tick,
};
use crate::storage::{FileJournal, Journal, NullJournal, Record, Store, Write};
use parking_lot::Mutex;

/// In-process tables behind one mutex, made durable by a `Journal`.
///
/// The mutex is the transaction boundary: preconditions are checked, the
/// journal entry is written and the rows are updated while it is held.
pub struct TableStore<J: Journal> {
    inner: Mutex<Inner<J>>,
}

struct Inner<J> {
    state: LedgerState,
    journal: J,
}

/// Volatile store for tests and embedding.
pub type MemoryStore = TableStore<NullJournal>;

/// Journal-backed store on local disk.
pub type FileStore = TableStore<FileJournal>;

impl<J: Journal> TableStore<J> {
    pub fn with_journal(state: LedgerState, journal: J) -> Self {
        TableStore {
            inner: Mutex::new(Inner { state, journal }),
        }
    }

    /// Journal `records`, then apply them.
    fn persist(inner: &mut Inner<J>, records: Vec<Record>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        inner.journal.append(&records)?;
        for record in &records {
            apply_record(&mut inner.state, record);
        }
        inner.journal.after_commit(&inner.state)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        TableStore::with_journal(LedgerState::new(), NullJournal)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl FileStore {
    /// Open (or create) the store under `config.data_dir`, replaying the journal.
    ///
    /// The data directory stays locked for the store's lifetime; a second open,
    /// from this or another process, fails with `DataDirLocked`.
    pub fn open(config: &Config) -> Result<Self> {
        let mut journal = FileJournal::new(config);
        journal.lock()?;
        let state = journal.recover()?;
        Ok(TableStore::with_journal(state, journal))
    }
}

/// Resolve the new version of a row, or fail if the caller read a stale copy.
fn next_version(
    entity: &'static str,
    id: &str,
    stored: Option<u64>,
    expected: Option<u64>,
) -> Result<u64> {
    match (stored, expected) {
        (None, None) => Ok(1),
        (Some(current), Some(expected)) if current == expected => Ok(current + 1),
        _ => Err(Error::Conflict {
            entity,
            id: id.to_string(),
        }),
    }
}

fn prepare(state: &LedgerState, write: Write) -> Result<Record> {
    match write {
        Write::PutAccount {
            mut row,
            expected_version,
        } => {
            let stored = state.get_account(&row.id).map(|a| a.version);
            row.version = next_version("account", &row.id, stored, expected_version)?;
            Ok(Record::Account(row))
        }
        Write::PutReservation {
            mut row,
            expected_version,
        } => {
            let stored = state.get_reservation(&row.id).map(|r| r.version);
            row.version = next_version("reservation", &row.id, stored, expected_version)?;
            Ok(Record::Reservation(row))
        }
        Write::AppendTick(mut tick) => {
            if state.get_reservation(&tick.reservation_id).is_none() {
                return Err(Error::InvalidReservation(tick.reservation_id));
            }
            tick.seq = state.ticks_for(&tick.reservation_id).len() as u64;
            Ok(Record::Tick(tick))
        }
        Write::InsertCharge(charge) => {
            if state.get_charge(&charge.id).is_some() {
                return Err(Error::StorageError(format!(
                    "Charge {} already exists",
                    charge.id
                )));
            }
            Ok(Record::Charge(charge))
        }
        Write::AppendFunding(record) => {
            if state
                .funding_for(&record.account_id)
                .iter()
                .any(|r| r.id == record.id)
            {
                return Err(Error::StorageError(format!(
                    "Funding record {} already exists",
                    record.id
                )));
            }
            Ok(Record::Funding(record))
        }
    }
}

fn sorted_charges<'a>(charges: impl Iterator<Item = &'a FinalizedCharge>) -> Vec<FinalizedCharge> {
    let mut out: Vec<FinalizedCharge> = charges.cloned().collect();
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    out
}

impl<J: Journal> Store for TableStore<J> {
    fn account(&self, id: &str) -> Result<Option<LedgerAccount>> {
        Ok(self.inner.lock().state.get_account(id).cloned())
    }

    fn accounts(&self) -> Result<Vec<LedgerAccount>> {
        let inner = self.inner.lock();
        let mut accounts: Vec<LedgerAccount> = inner.state.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    fn reservation(&self, id: &str) -> Result<Option<Reservation>> {
        Ok(self.inner.lock().state.get_reservation(id).cloned())
    }

    fn active_reservations(&self) -> Result<Vec<Reservation>> {
        let inner = self.inner.lock();
        let mut active: Vec<Reservation> = inner.state.active_reservations().cloned().collect();
        active.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.id.cmp(&b.id)));
        Ok(active)
    }

    fn account_reservations(&self, account_id: &str) -> Result<Vec<Reservation>> {
        let inner = self.inner.lock();
        let mut rows: Vec<Reservation> = inner
            .state
            .account_reservations(account_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }

    fn ticks(&self, reservation_id: &str) -> Result<Vec<Tick>> {
        Ok(self.inner.lock().state.ticks_for(reservation_id).to_vec())
    }

    fn funding(&self, account_id: &str) -> Result<Vec<FundingRecord>> {
        Ok(self.inner.lock().state.funding_for(account_id).to_vec())
    }

    fn charge(&self, id: &str) -> Result<Option<FinalizedCharge>> {
        Ok(self.inner.lock().state.get_charge(id).cloned())
    }

    fn charges(&self) -> Result<Vec<FinalizedCharge>> {
        let inner = self.inner.lock();
        Ok(sorted_charges(inner.state.charges.values()))
    }

    fn unsettled_charges(&self) -> Result<Vec<FinalizedCharge>> {
        let inner = self.inner.lock();
        Ok(sorted_charges(
            inner
                .state
                .charges
                .values()
                .filter(|c| c.is_unsettled_payable()),
        ))
    }

    fn commit(&self, writes: Vec<Write>) -> Result<()> {
        let mut inner = self.inner.lock();
        let records = writes
            .into_iter()
            .map(|w| prepare(&inner.state, w))
            .collect::<Result<Vec<_>>>()?;
        Self::persist(&mut inner, records)
    }

    fn claim_charges(
        &self,
        charge_ids: &[String],
        batch_id: &str,
        settled_at: u64,
    ) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let mut records = Vec::new();
        let mut claimed = Vec::new();
        for id in charge_ids {
            if let Some(mut charge) = inner.state.get_charge(id).cloned() {
                if charge.claim(batch_id, settled_at) {
                    claimed.push(charge.id.clone());
                    records.push(Record::Charge(charge));
                }
            }
        }
        Self::persist(&mut inner, records)?;
        Ok(claimed)
    }

    fn batch(&self, id: &str) -> Result<Option<SettlementBatch>> {
        Ok(self.inner.lock().state.get_batch(id).cloned())
    }

    fn draft_batch(&self) -> Result<Option<SettlementBatch>> {
        Ok(self.inner.lock().state.draft_batch().cloned())
    }

    fn insert_batch(&self, batch: SettlementBatch) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state.get_batch(&batch.id).is_some() {
            return Err(Error::StorageError(format!(
                "Settlement batch {} already exists",
                batch.id
            )));
        }
        if batch.is_draft() {
            if let Some(existing) = inner.state.draft_batch() {
                return Err(Error::DraftExists(existing.id.clone()));
            }
        }
        Self::persist(&mut inner, vec![Record::Batch(batch)])
    }

    fn delete_draft_batch(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state.get_batch(id) {
            None => return Err(Error::BatchNotFound(id.to_string())),
            Some(batch) if !batch.is_draft() => return Err(Error::NotDraft(id.to_string())),
            Some(_) => {}
        }
        Self::persist(&mut inner, vec![Record::BatchDeleted(id.to_string())])
    }

    fn update_batch(&self, batch: SettlementBatch, expected: BatchStatus) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state.get_batch(&batch.id) {
            None => return Err(Error::BatchNotFound(batch.id)),
            Some(stored) if stored.status != expected => {
                return Err(Error::Conflict {
                    entity: "settlement batch",
                    id: batch.id,
                })
            }
            Some(_) => {}
        }
        Self::persist(&mut inner, vec![Record::Batch(batch)])
    }

    fn snapshot(&self) -> Result<LedgerState> {
        Ok(self.inner.lock().state.clone())
    }
}
