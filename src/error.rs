use crate::amount::Amount;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Insufficient allowance: need {required}, available {available}")]
    InsufficientAllowance { required: Amount, available: Amount },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Account {0} not found")]
    AccountNotFound(String),

    #[error("Invalid quote: {0}")]
    InvalidQuote(String),

    #[error("Invalid tick: {0}")]
    InvalidTick(String),

    #[error("Invalid reservation: {0}")]
    InvalidReservation(String),

    #[error("Reservation {id} is not active (status: {status})")]
    NotActive { id: String, status: String },

    #[error("Illegal {entity} transition: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Settlement batch {0} not found")]
    BatchNotFound(String),

    #[error("Settlement batch {0} already distributed")]
    AlreadyDistributed(String),

    #[error("Settlement batch {0} is not a draft")]
    NotDraft(String),

    #[error("Settlement batch {0} has no totals")]
    EmptyBatch(String),

    #[error("Settlement batch {0} has no payee with a payout address and positive total")]
    NoPayablePayees(String),

    #[error("A draft settlement batch already exists: {0}")]
    DraftExists(String),

    #[error("Settlement consistency violation in batch {batch_id}: {detail}")]
    SettlementConsistencyViolation { batch_id: String, detail: String },

    #[error("Payout failed: {0}")]
    PayoutFailed(String),

    #[error("Concurrent update conflict on {entity} {id}")]
    Conflict { entity: &'static str, id: String },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Data directory {0} is in use by another process")]
    DataDirLocked(String),

    #[error("Rejected by hook: {0}")]
    HookRejected(String),
}

impl Error {
    /// Optimistic-concurrency misses are the only errors the ledger retries on its own.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
