//! Read-only operator views: account summaries, ledger totals, charge
//! listings and the invariant audit.

use super::Ledger;
use crate::amount::Amount;
use crate::clock::Clock;
use crate::error::Result;
use crate::state::{
    funding_total, BatchStatus, FinalizedCharge, FundingKind, FundingRecord, LedgerHook,
};
use crate::storage::Store;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Approvals and deposits shown in an account summary, newest first.
const RECENT_FUNDING: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSummary {
    pub account_id: String,
    pub approved_total: Amount,

    /// Finalized charges only
    pub lifetime_used: Amount,

    /// Accrued on still-active reservations
    pub active_usage: Amount,

    /// `lifetime_used + active_usage`
    pub used_total: Amount,

    pub deposited_total: Amount,
    pub pending_hold: Amount,
    pub available_allowance: Amount,
    pub percent_used: f64,
    pub active_reservations: usize,

    /// Most recent approvals, newest first
    pub approvals: Vec<FundingRecord>,

    /// Most recent deposits, newest first
    pub deposits: Vec<FundingRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerTotals {
    pub accounts: usize,
    pub approved_total: Amount,
    pub used_total: Amount,
    pub deposited_total: Amount,
    pub pending_hold: Amount,
    pub active_reservations: usize,
    pub unsettled_payable: Amount,
    pub settled: Amount,
    pub batches: usize,
    pub draft_batches: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChargeFilter {
    #[default]
    All,
    Valid,
    Unsettled,
}

impl ChargeFilter {
    fn matches(self, charge: &FinalizedCharge) -> bool {
        match self {
            ChargeFilter::All => true,
            ChargeFilter::Valid => charge.valid,
            ChargeFilter::Unsettled => charge.is_unsettled_payable(),
        }
    }
}

impl FromStr for ChargeFilter {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "all" => Ok(ChargeFilter::All),
            "valid" => Ok(ChargeFilter::Valid),
            "unsettled" => Ok(ChargeFilter::Unsettled),
            other => Err(format!(
                "unknown charge filter '{}' (expected all, valid or unsettled)",
                other
            )),
        }
    }
}

/// One broken invariant found by `audit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditFinding {
    /// `pending_hold` differs from the sum of active holds
    HoldMismatch {
        account_id: String,
        recorded: Amount,
        expected: Amount,
    },
    /// `used_total + pending_hold` exceeds `approved_total`
    OverCommitted {
        account_id: String,
        approved_total: Amount,
        committed: Amount,
    },
    /// Accrued usage beyond the reservation's hold
    ReservationOverused {
        reservation_id: String,
        approved: Amount,
        used: Amount,
    },
    /// A distributed batch references a paid charge that no batch claimed
    UnclaimedCharge { batch_id: String, charge_id: String },
    /// A distributed batch paid a charge that another batch claimed
    ClaimedByOtherBatch {
        batch_id: String,
        charge_id: String,
        claimed_by: String,
    },
    /// A charge is claimed by a batch that was never closed as distributed
    ClaimedWithoutPayout { charge_id: String, batch_id: String },
    /// More than one draft batch exists
    MultipleDrafts { batch_ids: Vec<String> },
    /// An account total differs from the sum of its funding records
    FundingMismatch {
        account_id: String,
        #[serde(rename = "funding_kind")]
        kind: FundingKind,
        recorded: Amount,
        expected: Amount,
    },
}

impl fmt::Display for AuditFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditFinding::HoldMismatch {
                account_id,
                recorded,
                expected,
            } => write!(
                f,
                "account {}: pending hold {} but active reservations hold {}",
                account_id, recorded, expected
            ),
            AuditFinding::OverCommitted {
                account_id,
                approved_total,
                committed,
            } => write!(
                f,
                "account {}: {} committed against {} approved",
                account_id, committed, approved_total
            ),
            AuditFinding::ReservationOverused {
                reservation_id,
                approved,
                used,
            } => write!(
                f,
                "reservation {}: used {} of {} held",
                reservation_id, used, approved
            ),
            AuditFinding::UnclaimedCharge {
                batch_id,
                charge_id,
            } => write!(
                f,
                "batch {}: charge {} was paid but is unclaimed",
                batch_id, charge_id
            ),
            AuditFinding::ClaimedByOtherBatch {
                batch_id,
                charge_id,
                claimed_by,
            } => write!(
                f,
                "batch {}: charge {} was paid but is claimed by batch {}",
                batch_id, charge_id, claimed_by
            ),
            AuditFinding::ClaimedWithoutPayout {
                charge_id,
                batch_id,
            } => write!(
                f,
                "charge {}: claimed by batch {} which is not distributed",
                charge_id, batch_id
            ),
            AuditFinding::MultipleDrafts { batch_ids } => {
                write!(f, "multiple draft batches: {}", batch_ids.join(", "))
            }
            AuditFinding::FundingMismatch {
                account_id,
                kind,
                recorded,
                expected,
            } => write!(
                f,
                "account {}: {} total {} but records sum to {}",
                account_id, kind, recorded, expected
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub accounts_checked: usize,
    pub reservations_checked: usize,
    pub batches_checked: usize,
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

impl<S: Store, C: Clock, H: LedgerHook> Ledger<S, C, H> {
    pub fn account_summary(&self, account_id: &str) -> Result<AccountSummary> {
        let account = self.load_account(account_id)?;
        let active: Vec<_> = self
            .store
            .account_reservations(account_id)?
            .into_iter()
            .filter(|r| r.is_active())
            .collect();
        let active_usage: Amount = active.iter().map(|r| r.used_amount).sum();
        let funding = self.store.funding(account_id)?;
        let recent = |kind: FundingKind| -> Vec<FundingRecord> {
            funding
                .iter()
                .rev()
                .filter(|r| r.kind == kind)
                .take(RECENT_FUNDING)
                .cloned()
                .collect()
        };

        Ok(AccountSummary {
            account_id: account.id.clone(),
            approved_total: account.approved_total,
            lifetime_used: account.used_total,
            active_usage,
            used_total: account.used_total.saturating_add(active_usage),
            deposited_total: account.deposited_total,
            pending_hold: account.pending_hold,
            available_allowance: account.available_allowance(),
            percent_used: account.percent_used(active_usage),
            active_reservations: active.len(),
            approvals: recent(FundingKind::Approval),
            deposits: recent(FundingKind::Deposit),
        })
    }

    pub fn ledger_totals(&self) -> Result<LedgerTotals> {
        let state = self.store.snapshot()?;
        let mut totals = LedgerTotals {
            accounts: state.accounts.len(),
            active_reservations: state.active_reservations().count(),
            batches: state.batches.len(),
            draft_batches: state.batches.values().filter(|b| b.is_draft()).count(),
            ..LedgerTotals::default()
        };
        for account in state.accounts.values() {
            totals.approved_total = totals.approved_total.saturating_add(account.approved_total);
            totals.used_total = totals.used_total.saturating_add(account.used_total);
            totals.deposited_total = totals.deposited_total.saturating_add(account.deposited_total);
            totals.pending_hold = totals.pending_hold.saturating_add(account.pending_hold);
        }
        for charge in state.charges.values().filter(|c| c.valid) {
            if charge.is_settled() {
                totals.settled = totals.settled.saturating_add(charge.debit);
            } else {
                totals.unsettled_payable = totals.unsettled_payable.saturating_add(charge.debit);
            }
        }
        Ok(totals)
    }

    /// Finalized charges, oldest first.
    pub fn list_charges(&self, filter: ChargeFilter) -> Result<Vec<FinalizedCharge>> {
        Ok(self
            .store
            .charges()?
            .into_iter()
            .filter(|c| filter.matches(c))
            .collect())
    }

    /// Recheck the money invariants over one consistent snapshot.
    pub fn audit(&self) -> Result<AuditReport> {
        let state = self.store.snapshot()?;
        let mut report = AuditReport {
            accounts_checked: state.accounts.len(),
            reservations_checked: state.reservations.len(),
            batches_checked: state.batches.len(),
            findings: Vec::new(),
        };

        let mut account_ids: Vec<&String> = state.accounts.keys().collect();
        account_ids.sort();
        for id in account_ids {
            let account = &state.accounts[id];
            let expected = state.expected_hold(id);
            if account.pending_hold != expected {
                report.findings.push(AuditFinding::HoldMismatch {
                    account_id: id.clone(),
                    recorded: account.pending_hold,
                    expected,
                });
            }
            let funding = state.funding_for(id);
            for (kind, recorded) in [
                (FundingKind::Approval, account.approved_total),
                (FundingKind::Deposit, account.deposited_total),
            ] {
                let expected = funding_total(funding, kind);
                if recorded != expected {
                    report.findings.push(AuditFinding::FundingMismatch {
                        account_id: id.clone(),
                        kind,
                        recorded,
                        expected,
                    });
                }
            }
            let committed = account.used_total.saturating_add(account.pending_hold);
            if committed > account.approved_total {
                report.findings.push(AuditFinding::OverCommitted {
                    account_id: id.clone(),
                    approved_total: account.approved_total,
                    committed,
                });
            }
        }

        let mut overused: Vec<_> = state
            .reservations
            .values()
            .filter(|r| r.used_amount > r.approved_amount)
            .collect();
        overused.sort_by(|a, b| a.id.cmp(&b.id));
        for r in overused {
            report.findings.push(AuditFinding::ReservationOverused {
                reservation_id: r.id.clone(),
                approved: r.approved_amount,
                used: r.used_amount,
            });
        }

        let mut batches: Vec<_> = state.batches.values().collect();
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        for batch in batches.iter().filter(|b| b.status == BatchStatus::Distributed) {
            let paid: Vec<String> = batch
                .totals
                .keys()
                .filter(|p| !batch.skipped_payees.contains(p))
                .cloned()
                .collect();
            for charge_id in batch.charge_ids_for(&paid) {
                let claimed_by = state
                    .get_charge(&charge_id)
                    .and_then(|c| c.settlement_batch_id.clone());
                match claimed_by {
                    None => report.findings.push(AuditFinding::UnclaimedCharge {
                        batch_id: batch.id.clone(),
                        charge_id,
                    }),
                    Some(other) if other != batch.id => {
                        report.findings.push(AuditFinding::ClaimedByOtherBatch {
                            batch_id: batch.id.clone(),
                            charge_id,
                            claimed_by: other,
                        })
                    }
                    Some(_) => {}
                }
            }
        }

        let mut claimed: Vec<_> = state
            .charges
            .values()
            .filter_map(|c| Some((c.id.clone(), c.settlement_batch_id.clone()?)))
            .collect();
        claimed.sort();
        for (charge_id, batch_id) in claimed {
            let distributed = state
                .get_batch(&batch_id)
                .is_some_and(|b| b.status == BatchStatus::Distributed);
            if !distributed {
                report
                    .findings
                    .push(AuditFinding::ClaimedWithoutPayout { charge_id, batch_id });
            }
        }

        let drafts: Vec<String> = batches
            .iter()
            .filter(|b| b.is_draft())
            .map(|b| b.id.clone())
            .collect();
        if drafts.len() > 1 {
            report
                .findings
                .push(AuditFinding::MultipleDrafts { batch_ids: drafts });
        }

        for finding in &report.findings {
            warn!(%finding, "Audit finding");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::TickInput;
    use super::*;
    use crate::quote::PriceQuote;
    use crate::state::SettlementBatch;
    use crate::storage::Write;

    #[test]
    fn test_account_summary_includes_active_usage() {
        let (ledger, _) = funded(10.0);
        let id = ledger
            .open("alice", "post", "carol", &PriceQuote::per_minute(0.5, 0.0, 4.0))
            .unwrap()
            .reservation_id;
        ledger.record_tick(&id, TickInput::focused(60_000, 1.0)).unwrap();

        let summary = ledger.account_summary("alice").unwrap();
        assert_eq!(summary.approvals.len(), 1);
        assert_eq!(summary.approvals[0].amount, amt(10.0));
        assert!(summary.deposits.is_empty());
        assert_eq!(summary.pending_hold, amt(2.0));
        assert_eq!(summary.active_usage, amt(0.5));
        assert_eq!(summary.used_total, amt(0.5));
        assert_eq!(summary.lifetime_used, Amount::ZERO);
        assert_eq!(summary.available_allowance, amt(8.0));
        assert_eq!(summary.percent_used, 0.05);
        assert_eq!(summary.active_reservations, 1);
    }

    #[test]
    fn test_totals_and_charge_filters() {
        let (ledger, _) = funded(10.0);
        ledger.approve_allowance("bob", amt(5.0)).unwrap();

        let paid = ledger
            .open("alice", "a", "carol", &PriceQuote::per_read(2.0))
            .unwrap()
            .reservation_id;
        ledger.record_tick(&paid, TickInput::focused(30_000, 1.0)).unwrap();
        ledger.finalize(&paid).unwrap();
        let refunded = ledger
            .open("bob", "b", "carol", &PriceQuote::per_read(1.0))
            .unwrap()
            .reservation_id;
        ledger.finalize(&refunded).unwrap();

        let totals = ledger.ledger_totals().unwrap();
        assert_eq!(totals.accounts, 2);
        assert_eq!(totals.approved_total, amt(15.0));
        assert_eq!(totals.used_total, amt(2.0));
        assert_eq!(totals.pending_hold, Amount::ZERO);
        assert_eq!(totals.unsettled_payable, amt(2.0));

        assert_eq!(ledger.list_charges(ChargeFilter::All).unwrap().len(), 2);
        assert_eq!(ledger.list_charges(ChargeFilter::Valid).unwrap().len(), 1);
        assert_eq!(ledger.list_charges(ChargeFilter::Unsettled).unwrap().len(), 1);
        assert_eq!("unsettled".parse::<ChargeFilter>(), Ok(ChargeFilter::Unsettled));
        assert!("bogus".parse::<ChargeFilter>().is_err());
    }

    #[test]
    fn test_audit_clean_then_detects_hold_drift() {
        let (ledger, _) = funded(10.0);
        ledger
            .open("alice", "post", "carol", &PriceQuote::per_read(3.0))
            .unwrap();
        assert!(ledger.audit().unwrap().is_clean());

        let mut account = ledger.store().account("alice").unwrap().unwrap();
        let version = account.version;
        account.pending_hold = amt(1.0);
        ledger
            .store()
            .commit(vec![Write::PutAccount {
                row: account,
                expected_version: Some(version),
            }])
            .unwrap();

        let report = ledger.audit().unwrap();
        assert_eq!(
            report.findings,
            vec![AuditFinding::HoldMismatch {
                account_id: "alice".to_string(),
                recorded: amt(1.0),
                expected: amt(3.0),
            }]
        );
    }

    #[test]
    fn test_audit_flags_charge_paid_by_two_batches() {
        let (ledger, _) = funded(10.0);
        let id = ledger
            .open("alice", "post", "carol", &PriceQuote::per_read(2.0))
            .unwrap()
            .reservation_id;
        ledger.record_tick(&id, TickInput::focused(30_000, 1.0)).unwrap();
        let charge_id = ledger.finalize(&id).unwrap().charge_id;
        let charge = ledger.store().charge(&charge_id).unwrap().unwrap();

        // A second writer paid the charge under its own batch id
        let mut paid = SettlementBatch::draft("batch_mine".to_string(), [&charge], START_MS);
        ledger
            .store()
            .claim_charges(&[charge_id.clone()], "batch_theirs", START_MS)
            .unwrap();
        paid.mark_distributed("0xmock_1".to_string(), true, Vec::new(), START_MS)
            .unwrap();
        ledger.store().insert_batch(paid).unwrap();

        let report = ledger.audit().unwrap();
        assert_eq!(
            report.findings,
            vec![
                AuditFinding::ClaimedByOtherBatch {
                    batch_id: "batch_mine".to_string(),
                    charge_id: charge_id.clone(),
                    claimed_by: "batch_theirs".to_string(),
                },
                AuditFinding::ClaimedWithoutPayout {
                    charge_id,
                    batch_id: "batch_theirs".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_summary_lists_recent_funding_and_audit_checks_it() {
        let (ledger, _) = funded(1.0);
        for i in 0..12 {
            ledger
                .record_deposit("alice", Amount::from_micros(i + 1))
                .unwrap();
        }
        let summary = ledger.account_summary("alice").unwrap();
        assert_eq!(summary.deposits.len(), 10);
        assert_eq!(summary.deposits[0].amount, Amount::from_micros(12));
        assert_eq!(summary.approvals.len(), 1);
        assert!(ledger.audit().unwrap().is_clean());

        // Allowance that no approval accounts for
        let mut account = ledger.store().account("alice").unwrap().unwrap();
        let version = account.version;
        account.approved_total = amt(5.0);
        ledger
            .store()
            .commit(vec![Write::PutAccount {
                row: account,
                expected_version: Some(version),
            }])
            .unwrap();
        assert_eq!(
            ledger.audit().unwrap().findings,
            vec![AuditFinding::FundingMismatch {
                account_id: "alice".to_string(),
                kind: FundingKind::Approval,
                recorded: amt(5.0),
                expected: amt(1.0),
            }]
        );
    }
}
