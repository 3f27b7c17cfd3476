//! Payout collaborators: payee address lookup and the executor that moves money.

use crate::amount::Amount;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

/// One transfer in a payout round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub payee_id: String,
    pub address: String,
    pub amount: Amount,
}

/// Proof of submission returned by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutReceipt {
    pub tx_ref: String,
    pub mocked: bool,
}

/// Executes a payout round on the payment rail.
///
/// Finality on the rail is the executor's concern; the ledger treats a
/// returned receipt as authoritative and never calls twice for one batch.
pub trait PayoutExecutor: Send + Sync {
    fn execute(&self, payouts: &[Payout]) -> Result<PayoutReceipt>;
}

/// Resolves a payee to a payout address.
pub trait PayeeDirectory {
    fn address_of(&self, payee_id: &str) -> Option<String>;
}

impl PayeeDirectory for HashMap<String, String> {
    fn address_of(&self, payee_id: &str) -> Option<String> {
        self.get(payee_id).filter(|a| !a.is_empty()).cloned()
    }
}

impl PayeeDirectory for BTreeMap<String, String> {
    fn address_of(&self, payee_id: &str) -> Option<String> {
        self.get(payee_id).filter(|a| !a.is_empty()).cloned()
    }
}

/// Executor that records nothing on any rail.
///
/// The reference is `0xmock_` plus the SHA-256 of the payout list and a random
/// salt, so two identical rounds still get distinct references.
#[derive(Debug, Default)]
pub struct MockPayoutExecutor {
    calls: AtomicUsize,
}

impl MockPayoutExecutor {
    pub fn new() -> Self {
        MockPayoutExecutor::default()
    }

    /// Number of rounds executed so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PayoutExecutor for MockPayoutExecutor {
    fn execute(&self, payouts: &[Payout]) -> Result<PayoutReceipt> {
        if payouts.is_empty() {
            return Err(Error::PayoutFailed("empty payout list".to_string()));
        }
        let encoded = bincode::serialize(payouts)
            .map_err(|e| Error::PayoutFailed(format!("Failed to encode payouts: {}", e)))?;
        let salt: [u8; 16] = rand::random();

        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        hasher.update(salt);
        let digest = hasher.finalize();

        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(PayoutReceipt {
            tx_ref: format!("0xmock_{}", hex::encode(&digest[..16])),
            mocked: true,
        })
    }
}
