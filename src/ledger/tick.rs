use super::finalize::Closed;
use super::{FinalizeOutcome, Ledger};
use crate::amount::{Amount, MS_PER_MINUTE, PER_READ_DECIMALS};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::state::{LedgerHook, Reservation, ReservationStatus, Terms, Tick};
use crate::storage::{Store, Write};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One activity sample as sent by the client sampler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickInput {
    pub tick_ms: u64,
    pub focus: bool,
    pub visibility: f64,
    pub scroll: f64,
}

impl TickInput {
    pub fn focused(tick_ms: u64, visibility: f64) -> Self {
        TickInput {
            tick_ms,
            focus: true,
            visibility,
            scroll: 0.0,
        }
    }

    pub fn idle(tick_ms: u64) -> Self {
        TickInput {
            tick_ms,
            focus: false,
            visibility: 0.0,
            scroll: 0.0,
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [("visibility", self.visibility), ("scroll", self.scroll)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidTick(format!(
                    "{} must be within 0..=1, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Usage after a tick has been accrued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStatus {
    pub approved_amount: Amount,
    pub reservation_used: Amount,
    pub added_amount: Amount,

    /// Account's finalized spend plus this reservation's accrual
    pub account_used_total: Amount,

    pub percent_used: f64,
    pub needs_deposit: bool,

    /// Hard stop: no further tick can add value
    pub limit_reached: bool,

    /// Soft stop: per-minute billing ceiling hit, consumption may continue
    pub cap_reached: bool,

    pub expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickOutcome {
    Recorded(UsageStatus),

    /// The reservation timed out idle and was closed with its prior ticks.
    Expired {
        used_amount: Amount,
        outcome: FinalizeOutcome,
    },
}

/// Accrual for a single tick before the money ceilings apply.
struct Accrual {
    billable_ms: u64,
    amount: Amount,
    cap_limited: bool,
}

fn accrue(terms: &Terms, used_ms: u64, used_amount: Amount, input: &TickInput) -> Accrual {
    if !input.focus {
        return Accrual {
            billable_ms: 0,
            amount: Amount::ZERO,
            cap_limited: false,
        };
    }
    match terms {
        Terms::PerMinute {
            rate, cap_minutes, ..
        } => {
            let cap_ms = *cap_minutes as u64 * MS_PER_MINUTE;
            let room_ms = cap_ms.saturating_sub(used_ms);
            let billable_ms = input.tick_ms.min(room_ms);
            Accrual {
                billable_ms,
                amount: rate.for_millis(billable_ms),
                cap_limited: input.tick_ms > room_ms,
            }
        }
        // The flat price is charged on the first focused tick only.
        Terms::PerRead { price } => Accrual {
            billable_ms: input.tick_ms,
            amount: if used_amount.is_zero() {
                price.round_to(PER_READ_DECIMALS)
            } else {
                Amount::ZERO
            },
            cap_limited: false,
        },
    }
}

/// Result of one pass through the tick cycle, before hooks and logging.
enum TickStep {
    Recorded(UsageStatus, Tick),
    Expired(Amount, Closed),
}

impl<S: Store, C: Clock, H: LedgerHook> Ledger<S, C, H> {
    /// Accrue one activity sample against an active reservation.
    ///
    /// A tick arriving after `expires_at` without focus closes the reservation
    /// as expired instead of being recorded.
    pub fn record_tick(&self, reservation_id: &str, input: TickInput) -> Result<TickOutcome> {
        input.validate()?;
        // Unknown or closed ids are turned away before a lock entry exists for them
        self.tickable(reservation_id)?;
        let _guard = self.reservation_locks.lock(reservation_id);

        let step = self.with_retries("tick", || self.tick_once(reservation_id, &input))?;
        match step {
            TickStep::Expired(used_amount, closed) => {
                info!(
                    reservation_id,
                    used_amount = %used_amount,
                    debit = %closed.outcome.debit,
                    payable = closed.outcome.payable,
                    "Reservation expired on idle tick"
                );
                self.reservation_locks.forget(reservation_id);
                self.hook.on_charge_finalized(&closed.charge);
                Ok(TickOutcome::Expired {
                    used_amount,
                    outcome: closed.outcome,
                })
            }
            TickStep::Recorded(usage, tick) => {
                debug!(
                    reservation_id,
                    added = %usage.added_amount,
                    used = %usage.reservation_used,
                    limit_reached = usage.limit_reached,
                    cap_reached = usage.cap_reached,
                    "Tick recorded"
                );
                self.hook.on_tick_recorded(&tick, &usage);
                Ok(TickOutcome::Recorded(usage))
            }
        }
    }

    fn tickable(&self, reservation_id: &str) -> Result<Reservation> {
        let reservation = self
            .store
            .reservation(reservation_id)?
            .ok_or_else(|| Error::InvalidReservation(reservation_id.to_string()))?;
        if !reservation.is_active() {
            return Err(Error::InvalidReservation(format!(
                "{} is {}",
                reservation_id, reservation.status
            )));
        }
        Ok(reservation)
    }

    fn tick_once(&self, reservation_id: &str, input: &TickInput) -> Result<TickStep> {
        let mut reservation = self.tickable(reservation_id)?;

        let now = self.clock.now_ms();
        if reservation.is_expired_at(now) {
            if !input.focus {
                let used_amount = reservation.used_amount;
                let closed = self.close(reservation, ReservationStatus::Expired)?;
                return Ok(TickStep::Expired(used_amount, closed));
            }
            reservation.renew(now, self.policy.renewal_window_secs);
        } else if input.focus
            && reservation.expires_at - now
                < self.policy.renewal_lookahead_secs.saturating_mul(1_000)
        {
            reservation.renew(now, self.policy.renewal_window_secs);
        }

        let account = self.load_account(&reservation.account_id)?;
        let accrual = accrue(
            &reservation.terms,
            reservation.used_ms,
            reservation.used_amount,
            input,
        );

        // Hard ceilings: this reservation's own hold, then whatever the
        // account can still cover with other holds taken out.
        let reservation_room = reservation.remaining_hold();
        let account_room =
            account.available_excluding_hold(reservation.approved_amount, reservation.used_amount);
        let ceiling = reservation_room.min(account_room);
        let limit_reached = accrual.amount > ceiling;
        let (billable_ms, added_amount) = if limit_reached {
            let ms = match &reservation.terms {
                Terms::PerMinute { rate, .. } => rate.millis_for(ceiling).min(accrual.billable_ms),
                Terms::PerRead { .. } => accrual.billable_ms,
            };
            (ms, ceiling)
        } else {
            (accrual.billable_ms, accrual.amount)
        };

        let expected_version = reservation.version;
        reservation.record_usage(billable_ms, added_amount);
        let cap_reached = accrual.cap_limited
            || reservation
                .terms
                .cap_ms()
                .is_some_and(|cap| reservation.used_ms >= cap);

        let tick = Tick {
            reservation_id: reservation.id.clone(),
            seq: 0,
            tick_ms: input.tick_ms,
            focus: input.focus,
            visibility: input.visibility,
            scroll: input.scroll,
            recorded_at: now,
        };
        self.store.commit(vec![
            Write::PutReservation {
                row: reservation.clone(),
                expected_version: Some(expected_version),
            },
            Write::AppendTick(tick.clone()),
        ])?;

        let percent_used = account.percent_used(reservation.used_amount);
        let usage = UsageStatus {
            approved_amount: reservation.approved_amount,
            reservation_used: reservation.used_amount,
            added_amount,
            account_used_total: account.used_total.saturating_add(reservation.used_amount),
            percent_used,
            needs_deposit: percent_used >= self.policy.needs_deposit_ratio,
            limit_reached,
            cap_reached,
            expires_at: reservation.expires_at,
        };
        Ok(TickStep::Recorded(usage, tick))
    }
}
