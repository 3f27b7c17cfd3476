use super::Ledger;
use crate::amount::Amount;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::new_id;
use crate::quote::{PriceQuote, PricingOracle};
use crate::state::{LedgerHook, Reservation};
use crate::storage::{Store, Write};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenedReservation {
    pub reservation_id: String,
    pub expires_at: u64,
    pub approved_amount: Amount,
}

impl<S: Store, C: Clock, H: LedgerHook> Ledger<S, C, H> {
    /// Place a hold for one metered session.
    ///
    /// The hold is the worst-case charge; the account's available allowance
    /// must cover it at the moment of the compare-and-swap.
    pub fn open(
        &self,
        account_id: &str,
        content_ref: &str,
        payee_id: &str,
        quote: &PriceQuote,
    ) -> Result<OpenedReservation> {
        let validated = quote.validate(&self.policy)?;
        let approved = validated.approved_amount;
        self.hook.before_open(account_id, payee_id, approved)?;

        let reservation = self.with_retries("open", || {
            let mut account = self.load_account(account_id)?;
            let expected_version = account.version;
            account.hold(approved).map_err(|available| {
                warn!(
                    account_id,
                    required = %approved,
                    available = %available,
                    "Open rejected: insufficient allowance"
                );
                Error::InsufficientAllowance {
                    required: approved,
                    available,
                }
            })?;

            let reservation = Reservation::open(
                new_id("res"),
                account_id.to_string(),
                payee_id.to_string(),
                content_ref.to_string(),
                validated.terms.clone(),
                approved,
                validated.ttl_secs,
                self.clock.now_ms(),
            );
            self.store.commit(vec![
                Write::PutAccount {
                    row: account,
                    expected_version: Some(expected_version),
                },
                Write::PutReservation {
                    row: reservation.clone(),
                    expected_version: None,
                },
            ])?;
            Ok(reservation)
        })?;

        info!(
            reservation_id = %reservation.id,
            account_id,
            payee_id,
            mode = %reservation.terms.mode(),
            approved = %approved,
            expires_at = reservation.expires_at,
            "Reservation opened"
        );
        self.hook.on_reservation_opened(&reservation);

        Ok(OpenedReservation {
            reservation_id: reservation.id,
            expires_at: reservation.expires_at,
            approved_amount: approved,
        })
    }

    /// Ask `oracle` for a quote on this payer/content pair, then `open` with it.
    pub fn open_quoted(
        &self,
        account_id: &str,
        content_ref: &str,
        payee_id: &str,
        oracle: &impl PricingOracle,
    ) -> Result<OpenedReservation> {
        let quote = oracle.quote(account_id, content_ref)?;
        self.open(account_id, content_ref, payee_id, &quote)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::quote::FixedPriceOracle;
    use crate::state::{ReservationStatus, Terms};

    #[test]
    fn test_open_places_hold() {
        let (ledger, _) = funded(10.0);
        let opened = ledger
            .open("alice", "post-1", "carol", &PriceQuote::per_minute(0.3, 2.0, 5.0))
            .unwrap();
        assert_eq!(opened.approved_amount, amt(1.5));
        assert_eq!(opened.expires_at, START_MS + 600_000);

        let account = ledger.store().account("alice").unwrap().unwrap();
        assert_eq!(account.pending_hold, amt(1.5));
        assert_eq!(account.available_allowance(), amt(8.5));

        let reservation = ledger
            .store()
            .reservation(&opened.reservation_id)
            .unwrap()
            .unwrap();
        assert_eq!(reservation.status, ReservationStatus::Active);
        assert_eq!(reservation.payee_id, "carol");
        assert!(matches!(reservation.terms, Terms::PerMinute { cap_minutes: 5, .. }));
    }

    #[test]
    fn test_huge_ttl_does_not_open_expired() {
        let (ledger, _) = funded(10.0);
        let opened = ledger
            .open(
                "alice",
                "post-1",
                "carol",
                &PriceQuote::per_read(1.0).with_ttl(u64::MAX),
            )
            .unwrap();
        let max_ttl_ms = ledger.policy().max_ttl_secs * 1_000;
        assert_eq!(opened.expires_at, START_MS + max_ttl_ms);

        let reservation = ledger
            .store()
            .reservation(&opened.reservation_id)
            .unwrap()
            .unwrap();
        assert!(!reservation.is_expired_at(START_MS + 1));
    }

    #[test]
    fn test_second_open_exceeding_allowance_fails() {
        let (ledger, _) = funded(10.0);
        ledger
            .open("alice", "post-1", "carol", &PriceQuote::per_read(8.0))
            .unwrap();
        let err = ledger
            .open("alice", "post-2", "carol", &PriceQuote::per_read(3.0))
            .unwrap_err();
        match err {
            Error::InsufficientAllowance {
                required,
                available,
            } => {
                assert_eq!(required, amt(3.0));
                assert_eq!(available, amt(2.0));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The failed open left nothing behind
        let account = ledger.store().account("alice").unwrap().unwrap();
        assert_eq!(account.pending_hold, amt(8.0));
        assert_eq!(ledger.store().active_reservations().unwrap().len(), 1);
    }

    #[test]
    fn test_open_unknown_account() {
        let ledger = ledger();
        assert!(matches!(
            ledger.open("nobody", "post", "carol", &PriceQuote::per_read(1.0)),
            Err(Error::AccountNotFound(_))
        ));
    }

    #[test]
    fn test_invalid_quote_holds_nothing() {
        let (ledger, _) = funded(10.0);
        assert!(matches!(
            ledger.open("alice", "post", "carol", &PriceQuote::per_read(-1.0)),
            Err(Error::InvalidQuote(_))
        ));
        let account = ledger.store().account("alice").unwrap().unwrap();
        assert_eq!(account.pending_hold, Amount::ZERO);
    }

    #[test]
    fn test_open_quoted_uses_oracle() {
        let (ledger, _) = funded(10.0);
        let oracle = FixedPriceOracle(PriceQuote::per_read(1.25));
        let opened = ledger.open_quoted("alice", "post", "carol", &oracle).unwrap();
        assert_eq!(opened.approved_amount, amt(1.25));
        assert_eq!(opened.expires_at, START_MS + 900_000);
    }
}
