//! Ledger service: the operations that move money between allowance, holds,
//! charges and settlement batches.
//!
//! Every read-compute-write cycle goes through `Store::commit` with version
//! preconditions and is retried on `Conflict`. Work on one reservation is
//! additionally serialized by an in-process keyed lock, and settlement runs
//! under a single mutex.

pub mod finalize;
pub mod open;
pub mod report;
pub mod settlement;
pub mod tick;

pub use finalize::FinalizeOutcome;
pub use open::OpenedReservation;
pub use report::{AccountSummary, AuditFinding, AuditReport, ChargeFilter, LedgerTotals};
pub use settlement::DistributionReceipt;
pub use tick::{TickInput, TickOutcome, UsageStatus};

use crate::amount::Amount;
use crate::clock::{Clock, SystemClock};
use crate::config::LedgerPolicy;
use crate::error::{Error, Result};
use crate::new_id;
use crate::state::{FundingKind, FundingRecord, LedgerAccount, LedgerHook, NoOpHook, RailRef};
use crate::storage::{Store, Write};
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Per-key mutexes, created on first use.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    fn lock(&self, key: &str) -> ArcMutexGuard<RawMutex, ()> {
        let entry = {
            let mut locks = self.locks.lock();
            locks.entry(key.to_string()).or_default().clone()
        };
        entry.lock_arc()
    }

    /// Drop the mutex for a key that will never be locked again.
    fn forget(&self, key: &str) {
        self.locks.lock().remove(key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

pub struct Ledger<S: Store, C: Clock = SystemClock, H: LedgerHook = NoOpHook> {
    store: S,
    clock: C,
    hook: H,
    policy: LedgerPolicy,
    reservation_locks: KeyedLocks,
    settlement_lock: Mutex<()>,
}

impl<S: Store> Ledger<S> {
    pub fn new(store: S) -> Self {
        Ledger::with_parts(store, SystemClock, NoOpHook, LedgerPolicy::default())
    }
}

impl<S: Store, C: Clock, H: LedgerHook> Ledger<S, C, H> {
    pub fn with_parts(store: S, clock: C, hook: H, policy: LedgerPolicy) -> Self {
        Ledger {
            store,
            clock,
            hook,
            policy,
            reservation_locks: KeyedLocks::default(),
            settlement_lock: Mutex::new(()),
        }
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> Ledger<S, C2, H> {
        Ledger::with_parts(self.store, clock, self.hook, self.policy)
    }

    pub fn with_hook<H2: LedgerHook>(self, hook: H2) -> Ledger<S, C, H2> {
        Ledger::with_parts(self.store, self.clock, hook, self.policy)
    }

    pub fn with_policy(mut self, policy: LedgerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Run `attempt` until it stops failing with `Conflict`, up to `max_cas_retries` retries.
    fn with_retries<T>(&self, op: &'static str, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
        let mut retries = 0;
        loop {
            match attempt() {
                Err(e) if e.is_conflict() && retries < self.policy.max_cas_retries => {
                    retries += 1;
                    debug!(op, retries, error = %e, "Optimistic conflict, retrying");
                }
                other => return other,
            }
        }
    }

    fn load_account(&self, account_id: &str) -> Result<LedgerAccount> {
        self.store
            .account(account_id)?
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))
    }

    /// Grant `amount` of additional allowance, creating the account on first use.
    pub fn approve_allowance(&self, account_id: &str, amount: Amount) -> Result<LedgerAccount> {
        self.fund(account_id, FundingKind::Approval, amount, RailRef::default())
    }

    /// `approve_allowance` with the rail transaction that granted it.
    pub fn approve_allowance_with_ref(
        &self,
        account_id: &str,
        amount: Amount,
        rail: RailRef,
    ) -> Result<LedgerAccount> {
        self.fund(account_id, FundingKind::Approval, amount, rail)
    }

    /// Record funds the payer moved on the rail. Informational only.
    pub fn record_deposit(&self, account_id: &str, amount: Amount) -> Result<LedgerAccount> {
        self.fund(account_id, FundingKind::Deposit, amount, RailRef::default())
    }

    pub fn record_deposit_with_ref(
        &self,
        account_id: &str,
        amount: Amount,
        rail: RailRef,
    ) -> Result<LedgerAccount> {
        self.fund(account_id, FundingKind::Deposit, amount, rail)
    }

    /// Apply an approval or deposit and append its record in one commit.
    fn fund(
        &self,
        account_id: &str,
        kind: FundingKind,
        amount: Amount,
        rail: RailRef,
    ) -> Result<LedgerAccount> {
        if amount.is_zero() {
            return Err(Error::InvalidAmount(format!("{} must be positive", kind)));
        }
        let record = FundingRecord {
            id: new_id(kind.id_prefix()),
            account_id: account_id.to_string(),
            kind,
            amount,
            tx_ref: rail.tx_ref,
            chain_id: rail.chain_id,
            created_at: self.clock.now_ms(),
        };

        let account = self.with_retries("fund", || {
            let existing = self.store.account(account_id)?;
            let expected_version = existing.as_ref().map(|a| a.version);
            let mut account =
                existing.unwrap_or_else(|| LedgerAccount::new(account_id.to_string()));
            match kind {
                FundingKind::Approval => account.grant(amount),
                FundingKind::Deposit => account.record_deposit(amount),
            }
            self.store.commit(vec![
                Write::PutAccount {
                    row: account.clone(),
                    expected_version,
                },
                Write::AppendFunding(record.clone()),
            ])?;
            account.version = expected_version.map_or(1, |v| v + 1);
            Ok(account)
        })?;

        info!(
            account_id,
            kind = %kind,
            amount = %amount,
            tx_ref = ?record.tx_ref,
            approved_total = %account.approved_total,
            deposited_total = %account.deposited_total,
            "Funding recorded"
        );
        Ok(account)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_approve_creates_and_accumulates() {
        let ledger = ledger();
        let first = ledger.approve_allowance("alice", amt(10.0)).unwrap();
        assert_eq!(first.version, 1);
        let second = ledger.approve_allowance("alice", amt(2.5)).unwrap();
        assert_eq!(second.approved_total, amt(12.5));
        assert_eq!(second.version, 2);
        assert_eq!(ledger.store().account("alice").unwrap().unwrap(), second);
    }

    #[test]
    fn test_zero_amounts_rejected() {
        let ledger = ledger();
        assert!(matches!(
            ledger.approve_allowance("alice", Amount::ZERO),
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.record_deposit("alice", Amount::ZERO),
            Err(Error::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_funding_history_is_recorded() {
        let (ledger, _) = funded(10.0);
        ledger
            .approve_allowance_with_ref(
                "alice",
                amt(2.5),
                RailRef {
                    tx_ref: Some("0xabc".to_string()),
                    chain_id: Some(84532),
                },
            )
            .unwrap();
        ledger
            .record_deposit_with_ref(
                "alice",
                amt(4.0),
                RailRef {
                    tx_ref: Some("0xdef".to_string()),
                    chain_id: None,
                },
            )
            .unwrap();

        let history = ledger.store().funding("alice").unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].kind, FundingKind::Approval);
        assert_eq!(history[0].tx_ref, None);
        assert_eq!(history[1].amount, amt(2.5));
        assert_eq!(history[1].tx_ref.as_deref(), Some("0xabc"));
        assert_eq!(history[1].chain_id, Some(84532));
        assert_eq!(history[2].kind, FundingKind::Deposit);
        assert!(history[2].id.starts_with("dep_"));
        assert_eq!(history[2].created_at, START_MS);

        // A rejected grant leaves no record behind
        assert!(ledger.approve_allowance("alice", Amount::ZERO).is_err());
        assert_eq!(ledger.store().funding("alice").unwrap().len(), 3);
    }

    #[test]
    fn test_deposit_is_informational() {
        let (ledger, _) = funded(10.0);
        let account = ledger.record_deposit("alice", amt(4.0)).unwrap();
        assert_eq!(account.deposited_total, amt(4.0));
        assert_eq!(account.available_allowance(), amt(10.0));
    }

    #[test]
    fn test_retries_give_up_after_policy_limit() {
        let ledger = ledger();
        let mut calls = 0;
        let result: Result<()> = ledger.with_retries("test", || {
            calls += 1;
            Err(Error::Conflict {
                entity: "account",
                id: "alice".to_string(),
            })
        });
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls, ledger.policy().max_cas_retries + 1);
    }
}
