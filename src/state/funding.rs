use crate::amount::Amount;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingKind {
    /// Spending allowance granted by the payer
    Approval,
    /// Funds moved on the rail; informational
    Deposit,
}

impl FundingKind {
    pub fn id_prefix(self) -> &'static str {
        match self {
            FundingKind::Approval => "apr",
            FundingKind::Deposit => "dep",
        }
    }
}

impl fmt::Display for FundingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FundingKind::Approval => write!(f, "approval"),
            FundingKind::Deposit => write!(f, "deposit"),
        }
    }
}

/// Where a funding event happened on the payment rail, when known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RailRef {
    pub tx_ref: Option<String>,
    pub chain_id: Option<u64>,
}

/// One approval or deposit. Append-only: the account's `approved_total` and
/// `deposited_total` are the sums of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingRecord {
    pub id: String,
    pub account_id: String,
    pub kind: FundingKind,
    pub amount: Amount,
    pub tx_ref: Option<String>,
    pub chain_id: Option<u64>,
    pub created_at: u64,
}

/// Sum of the records of one kind.
pub fn funding_total<'a>(
    records: impl IntoIterator<Item = &'a FundingRecord>,
    kind: FundingKind,
) -> Amount {
    records
        .into_iter()
        .filter(|r| r.kind == kind)
        .map(|r| r.amount)
        .sum()
}
