use super::Ledger;
use crate::amount::{Amount, MS_PER_MINUTE, PER_MINUTE_DECIMALS, PER_READ_DECIMALS};
use crate::clock::Clock;
use crate::config::LedgerPolicy;
use crate::error::{Error, Result};
use crate::new_id;
use crate::state::{
    attention_summary, FinalizedCharge, LedgerHook, RefundReason, Reservation, ReservationStatus,
    Terms,
};
use crate::storage::{Store, Write};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizeOutcome {
    pub charge_id: String,
    pub payable: bool,
    pub debit: Amount,
    pub refund_reason: Option<RefundReason>,
}

/// A committed close: what the caller sees and the audit record behind it.
pub(crate) struct Closed {
    pub outcome: FinalizeOutcome,
    pub charge: FinalizedCharge,
}

/// Refund decision and debit for a closed session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assessment {
    pub focused_ms: u64,
    pub valid: bool,
    pub refund_reason: Option<RefundReason>,
    pub debit: Amount,
}

impl Assessment {
    pub fn minutes(&self) -> f64 {
        self.focused_ms as f64 / MS_PER_MINUTE as f64
    }
}

/// Apply the refund policy and billing rules to a session's attention.
///
/// Visibility is only judged when at least one tick was seen; a session with
/// no ticks is refunded as too short.
pub fn assess(
    terms: &Terms,
    approved_amount: Amount,
    focused_ms: u64,
    avg_visibility: Option<f64>,
    policy: &LedgerPolicy,
) -> Assessment {
    let minutes = focused_ms as f64 / MS_PER_MINUTE as f64;
    let refund_reason = if avg_visibility.is_some_and(|v| v < policy.visibility_min) {
        Some(RefundReason::LowVisibility)
    } else if minutes < policy.min_valid_minutes {
        Some(RefundReason::TooShort)
    } else {
        None
    };
    if refund_reason.is_some() {
        return Assessment {
            focused_ms,
            valid: false,
            refund_reason,
            debit: Amount::ZERO,
        };
    }

    let debit = match terms {
        Terms::PerMinute {
            rate,
            min_minutes,
            cap_minutes,
        } => {
            let min_ms = *min_minutes as u64 * MS_PER_MINUTE;
            let cap_ms = *cap_minutes as u64 * MS_PER_MINUTE;
            let billed_minutes = if focused_ms < min_ms {
                *min_minutes as u64
            } else if focused_ms <= cap_ms {
                focused_ms.div_ceil(MS_PER_MINUTE)
            } else {
                *cap_minutes as u64
            };
            rate.checked_mul(billed_minutes)
                .map(|d| d.round_to(PER_MINUTE_DECIMALS))
                .unwrap_or(approved_amount)
        }
        Terms::PerRead { price } => price.round_to(PER_READ_DECIMALS),
    };

    Assessment {
        focused_ms,
        valid: true,
        refund_reason: None,
        // Never bill past the hold
        debit: debit.min(approved_amount),
    }
}

impl<S: Store, C: Clock, H: LedgerHook> Ledger<S, C, H> {
    /// Close an active reservation into a charge or a full refund.
    pub fn finalize(&self, reservation_id: &str) -> Result<FinalizeOutcome> {
        self.closable(reservation_id)?;
        let _guard = self.reservation_locks.lock(reservation_id);

        let closed = self.with_retries("finalize", || {
            let reservation = self.closable(reservation_id)?;
            self.close(reservation, ReservationStatus::Finalized)
        })?;

        info!(
            reservation_id,
            charge_id = %closed.charge.id,
            payable = closed.outcome.payable,
            debit = %closed.outcome.debit,
            refund_reason = ?closed.outcome.refund_reason,
            "Reservation finalized"
        );
        self.reservation_locks.forget(reservation_id);
        self.hook.on_charge_finalized(&closed.charge);
        Ok(closed.outcome)
    }

    fn closable(&self, reservation_id: &str) -> Result<Reservation> {
        let reservation = self
            .store
            .reservation(reservation_id)?
            .ok_or_else(|| Error::InvalidReservation(reservation_id.to_string()))?;
        reservation.ensure_active()?;
        Ok(reservation)
    }

    /// Expire every active reservation whose `expires_at` has passed.
    ///
    /// Returns the outcomes of the reservations this sweep closed. A reservation
    /// closed concurrently by its own session is skipped.
    pub fn sweep_expired(&self) -> Result<Vec<(String, FinalizeOutcome)>> {
        let now = self.clock.now_ms();
        let due: Vec<String> = self
            .store
            .active_reservations()?
            .into_iter()
            .filter(|r| r.is_expired_at(now))
            .map(|r| r.id)
            .collect();

        let mut swept = Vec::with_capacity(due.len());
        for reservation_id in due {
            let guard = self.reservation_locks.lock(&reservation_id);
            let closed = self.with_retries("sweep", || {
                let reservation = match self.store.reservation(&reservation_id)? {
                    Some(r) if r.is_active() && r.is_expired_at(self.clock.now_ms()) => r,
                    _ => return Ok(None),
                };
                self.close(reservation, ReservationStatus::Expired).map(Some)
            })?;
            drop(guard);

            match closed {
                Some(closed) => {
                    info!(
                        reservation_id = %reservation_id,
                        debit = %closed.outcome.debit,
                        payable = closed.outcome.payable,
                        "Reservation expired by sweep"
                    );
                    self.reservation_locks.forget(&reservation_id);
                    self.hook.on_charge_finalized(&closed.charge);
                    swept.push((reservation_id, closed.outcome));
                }
                None => {
                    // Closed by its own session meanwhile: drop the entry the sweep re-created
                    let still_active = self
                        .store
                        .reservation(&reservation_id)?
                        .is_some_and(|r| r.is_active());
                    if !still_active {
                        self.reservation_locks.forget(&reservation_id);
                    }
                }
            }
        }
        if !swept.is_empty() {
            info!(count = swept.len(), "Swept abandoned reservations");
        }
        Ok(swept)
    }

    /// Release the hold, book the debit and write the charge in one commit.
    ///
    /// Caller holds the reservation lock and has checked the reservation is active.
    pub(crate) fn close(
        &self,
        mut reservation: Reservation,
        terminal: ReservationStatus,
    ) -> Result<Closed> {
        let ticks = self.store.ticks(&reservation.id)?;
        let (focused_ms, avg_visibility) = attention_summary(&ticks);
        let avg_visibility = (!ticks.is_empty()).then_some(avg_visibility);
        let assessment = assess(
            &reservation.terms,
            reservation.approved_amount,
            focused_ms,
            avg_visibility,
            &self.policy,
        );

        let mut account = self.load_account(&reservation.account_id)?;
        let account_version = account.version;
        account.settle_hold(reservation.approved_amount, assessment.debit);

        let reservation_version = reservation.version;
        reservation.transition(terminal)?;
        reservation.used_amount = assessment.debit;
        if let Some(cap_ms) = reservation.terms.cap_ms() {
            reservation.used_ms = focused_ms.min(cap_ms);
        }

        let now = self.clock.now_ms();
        let mode = reservation.terms.mode();
        let charge = FinalizedCharge {
            id: new_id("chg"),
            reservation_id: reservation.id.clone(),
            payer_id: reservation.account_id.clone(),
            payee_id: reservation.payee_id.clone(),
            content_ref: reservation.content_ref.clone(),
            mode,
            minutes: matches!(reservation.terms, Terms::PerMinute { .. })
                .then(|| assessment.minutes()),
            reads: matches!(reservation.terms, Terms::PerRead { .. }).then_some(1),
            debit: assessment.debit,
            valid: assessment.valid,
            refund_reason: assessment.refund_reason,
            created_at: now,
            settlement_batch_id: None,
            settled_at: None,
        };

        self.store.commit(vec![
            Write::PutAccount {
                row: account,
                expected_version: Some(account_version),
            },
            Write::PutReservation {
                row: reservation,
                expected_version: Some(reservation_version),
            },
            Write::InsertCharge(charge.clone()),
        ])?;

        Ok(Closed {
            outcome: FinalizeOutcome {
                charge_id: charge.id.clone(),
                payable: assessment.valid,
                debit: assessment.debit,
                refund_reason: assessment.refund_reason,
            },
            charge,
        })
    }
}
