use super::Ledger;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::new_id;
use crate::payout::{PayeeDirectory, Payout, PayoutExecutor};
use crate::state::{BatchStatus, LedgerHook, SettlementBatch};
use crate::storage::Store;
use serde::Serialize;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DistributionReceipt {
    pub batch_id: String,
    pub tx_ref: String,
    pub mocked: bool,
    pub payouts: Vec<Payout>,
    pub skipped_payees: Vec<String>,
}

impl<S: Store, C: Clock, H: LedgerHook> Ledger<S, C, H> {
    /// Return the current draft batch, or draft a new one from unsettled charges.
    ///
    /// A draft that references a charge already settled by another batch is
    /// stale: it is discarded and rebuilt. A draft whose charges are claimed by
    /// the draft itself is reported, never rebuilt. Returns `None` when nothing
    /// is owed.
    pub fn aggregate_draft(&self) -> Result<Option<SettlementBatch>> {
        let _guard = self.settlement_lock.lock();

        if let Some(draft) = self.store.draft_batch()? {
            let mut stale = Vec::new();
            let mut self_claimed = Vec::new();
            for charge_id in draft.charge_ids() {
                if let Some(charge) = self.store.charge(&charge_id)? {
                    if charge.claimed_elsewhere(&draft.id) {
                        stale.push(charge_id);
                    } else if charge.is_settled() {
                        self_claimed.push(charge_id);
                    }
                }
            }
            // Paid but never closed: the draft is evidence for the operator
            if !self_claimed.is_empty() {
                error!(
                    batch_id = %draft.id,
                    claimed = ?self_claimed,
                    "Draft batch already claimed its charges"
                );
                return Err(Error::SettlementConsistencyViolation {
                    batch_id: draft.id,
                    detail: format!(
                        "draft already claimed charges {}; a payout was submitted",
                        self_claimed.join(", ")
                    ),
                });
            }
            if stale.is_empty() {
                debug!(batch_id = %draft.id, "Reusing existing draft batch");
                return Ok(Some(draft));
            }
            warn!(
                batch_id = %draft.id,
                stale_charges = ?stale,
                "Discarding stale draft batch"
            );
            self.store.delete_draft_batch(&draft.id)?;
        }

        let charges = self.store.unsettled_charges()?;
        if charges.is_empty() {
            debug!("No unsettled charges to aggregate");
            return Ok(None);
        }
        let batch = SettlementBatch::draft(new_id("batch"), &charges, self.clock.now_ms());
        self.store.insert_batch(batch.clone())?;

        info!(
            batch_id = %batch.id,
            payees = batch.totals.len(),
            charges = charges.len(),
            gross = %batch.gross_total(),
            "Settlement batch drafted"
        );
        self.hook.on_batch_drafted(&batch);
        Ok(Some(batch))
    }

    /// Pay out a draft batch once and claim its charges.
    ///
    /// Payees without an address or with nothing owed are skipped; their
    /// charges stay unsettled for a later batch. If the payout fails nothing
    /// is claimed and the batch stays a draft. Once the payout has gone out,
    /// any failure to claim or close is a `SettlementConsistencyViolation`
    /// carrying the tx ref, and the batch can never be paid again.
    pub fn distribute(
        &self,
        batch_id: &str,
        directory: &impl PayeeDirectory,
        executor: &impl PayoutExecutor,
    ) -> Result<DistributionReceipt> {
        let _guard = self.settlement_lock.lock();

        let mut batch = self
            .store
            .batch(batch_id)?
            .ok_or_else(|| Error::BatchNotFound(batch_id.to_string()))?;
        match batch.status {
            BatchStatus::Distributed => return Err(Error::AlreadyDistributed(batch.id)),
            BatchStatus::Draft => {}
        }
        if batch.is_empty() {
            return Err(Error::EmptyBatch(batch.id));
        }

        let mut payouts = Vec::new();
        let mut skipped_payees = Vec::new();
        for (payee_id, total) in &batch.totals {
            match directory.address_of(payee_id) {
                Some(address) if !total.is_zero() => payouts.push(Payout {
                    payee_id: payee_id.clone(),
                    address,
                    amount: *total,
                }),
                address => {
                    warn!(
                        batch_id,
                        payee_id = %payee_id,
                        total = %total,
                        has_address = address.is_some(),
                        "Skipping payee"
                    );
                    skipped_payees.push(payee_id.clone());
                }
            }
        }
        if payouts.is_empty() {
            return Err(Error::NoPayablePayees(batch.id));
        }

        self.preflight(&batch)?;

        let receipt = executor.execute(&payouts).map_err(|e| {
            error!(batch_id, error = %e, "Payout failed; batch left as draft");
            e
        })?;

        // Money has left. From here on nothing may fail back into a retryable
        // draft: every problem surfaces as a consistency violation with the tx ref.
        let now = self.clock.now_ms();
        let mut problems = Vec::new();
        if let Err(e) = batch.mark_distributed(
            receipt.tx_ref.clone(),
            receipt.mocked,
            skipped_payees.clone(),
            now,
        ) {
            problems.push(format!("batch not closed: {}", e));
        }

        let expected = batch.charge_ids();
        match self.store.claim_charges(&expected, &batch.id, now) {
            Ok(claimed) => {
                let unclaimed: Vec<String> = expected
                    .into_iter()
                    .filter(|id| !claimed.contains(id))
                    .collect();
                if !unclaimed.is_empty() {
                    problems.push(format!("charges not claimed: {}", unclaimed.join(", ")));
                }
            }
            Err(e) => problems.push(format!("claiming charges failed: {}", e)),
        }

        if !batch.is_draft() {
            if let Err(e) = self.store.update_batch(batch.clone(), BatchStatus::Draft) {
                problems.push(format!("batch record not updated: {}", e));
            }
        }

        if !problems.is_empty() {
            error!(
                batch_id,
                tx_ref = %receipt.tx_ref,
                problems = ?problems,
                "Payout submitted but settlement bookkeeping failed"
            );
            return Err(Error::SettlementConsistencyViolation {
                batch_id: batch.id,
                detail: format!(
                    "payout {} submitted but {}",
                    receipt.tx_ref,
                    problems.join("; ")
                ),
            });
        }

        info!(
            batch_id,
            tx_ref = %receipt.tx_ref,
            mocked = receipt.mocked,
            payees = payouts.len(),
            skipped = skipped_payees.len(),
            "Settlement batch distributed"
        );
        self.hook.on_batch_distributed(&batch);

        Ok(DistributionReceipt {
            batch_id: batch.id,
            tx_ref: receipt.tx_ref,
            mocked: receipt.mocked,
            payouts,
            skipped_payees,
        })
    }

    /// Every charge the batch references must still exist, be valid and be
    /// unclaimed. A charge already claimed by this very batch means an earlier
    /// payout went out without the batch being closed.
    fn preflight(&self, batch: &SettlementBatch) -> Result<()> {
        let mut problems = Vec::new();
        for charge_id in batch.charge_ids() {
            match self.store.charge(&charge_id)? {
                None => problems.push(format!("charge {} missing", charge_id)),
                Some(charge) if !charge.valid => {
                    problems.push(format!("charge {} is not valid", charge_id))
                }
                Some(charge) if charge.claimed_elsewhere(&batch.id) => problems.push(format!(
                    "charge {} already settled by batch {}",
                    charge_id,
                    charge.settlement_batch_id.as_deref().unwrap_or_default()
                )),
                Some(charge) if charge.is_settled() => problems.push(format!(
                    "charge {} already claimed by this batch; a payout was already submitted",
                    charge_id
                )),
                Some(_) => {}
            }
        }
        if problems.is_empty() {
            return Ok(());
        }
        error!(
            batch_id = %batch.id,
            problems = ?problems,
            "Pre-flight check failed; distribution aborted"
        );
        Err(Error::SettlementConsistencyViolation {
            batch_id: batch.id.clone(),
            detail: problems.join("; "),
        })
    }
}
