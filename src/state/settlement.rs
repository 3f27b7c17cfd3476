//! Settlement batch aggregate and status.

use crate::amount::Amount;
use crate::error::{Error, Result};
use crate::state::FinalizedCharge;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Batch lifecycle: `Draft -> Distributed`, exactly once, never reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Totals computed, awaiting payout. May be discarded if found stale.
    Draft,
    /// Payout submitted and charges claimed.
    Distributed,
}

impl BatchStatus {
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        matches!((self, next), (BatchStatus::Draft, BatchStatus::Distributed))
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Draft => write!(f, "draft"),
            BatchStatus::Distributed => write!(f, "distributed"),
        }
    }
}

/// Settlement batch aggregate: unsettled charges grouped by payee.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettlementBatch {
    pub id: String,

    /// payee -> summed debit
    pub totals: BTreeMap<String, Amount>,

    /// payee -> charge ids contributing to `totals`
    pub constituent_charges: BTreeMap<String, Vec<String>>,

    pub status: BatchStatus,
    pub payout_tx_ref: Option<String>,
    pub mocked: bool,

    /// Payees left out of the payout (no address or nothing owed); their charges stay unsettled
    #[serde(default)]
    pub skipped_payees: Vec<String>,

    pub created_at: u64,
    pub distributed_at: Option<u64>,
}

impl SettlementBatch {
    /// Group payable charges by payee.
    pub fn draft<'a>(
        id: String,
        charges: impl IntoIterator<Item = &'a FinalizedCharge>,
        now_ms: u64,
    ) -> Self {
        let mut totals: BTreeMap<String, Amount> = BTreeMap::new();
        let mut constituent_charges: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for charge in charges.into_iter().filter(|c| c.is_unsettled_payable()) {
            let total = totals.entry(charge.payee_id.clone()).or_default();
            *total = total.saturating_add(charge.debit);
            constituent_charges
                .entry(charge.payee_id.clone())
                .or_default()
                .push(charge.id.clone());
        }
        SettlementBatch {
            id,
            totals,
            constituent_charges,
            status: BatchStatus::Draft,
            payout_tx_ref: None,
            mocked: false,
            skipped_payees: Vec::new(),
            created_at: now_ms,
            distributed_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    pub fn is_draft(&self) -> bool {
        self.status == BatchStatus::Draft
    }

    pub fn gross_total(&self) -> Amount {
        self.totals.values().sum()
    }

    /// Every charge id referenced by the batch.
    pub fn charge_ids(&self) -> Vec<String> {
        self.constituent_charges.values().flatten().cloned().collect()
    }

    pub fn charge_ids_for(&self, payees: &[String]) -> Vec<String> {
        payees
            .iter()
            .filter_map(|p| self.constituent_charges.get(p))
            .flatten()
            .cloned()
            .collect()
    }

    /// Close the batch as paid under `tx_ref`.
    ///
    /// Skipped payees leave `totals` and `constituent_charges`, so the batch
    /// only ever owns the charges its payout covered. The payee ids are kept in
    /// `skipped_payees`.
    pub fn mark_distributed(
        &mut self,
        tx_ref: String,
        mocked: bool,
        skipped_payees: Vec<String>,
        now_ms: u64,
    ) -> Result<()> {
        if !self.status.can_transition_to(BatchStatus::Distributed) {
            return Err(Error::IllegalTransition {
                entity: "settlement batch",
                from: self.status.to_string(),
                to: BatchStatus::Distributed.to_string(),
            });
        }
        for payee_id in &skipped_payees {
            self.totals.remove(payee_id);
            self.constituent_charges.remove(payee_id);
        }
        self.status = BatchStatus::Distributed;
        self.payout_tx_ref = Some(tx_ref);
        self.mocked = mocked;
        self.skipped_payees = skipped_payees;
        self.distributed_at = Some(now_ms);
        Ok(())
    }
}
