use metered_ledger::clock::ManualClock;
use metered_ledger::config::Config;
use metered_ledger::error::Error;
use metered_ledger::ledger::{Ledger, TickInput, TickOutcome};
use metered_ledger::payout::MockPayoutExecutor;
use metered_ledger::quote::PriceQuote;
use metered_ledger::state::{RefundReason, ReservationStatus};
use metered_ledger::storage::{FileStore, MemoryStore, Store};
use metered_ledger::Amount;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

const START_MS: u64 = 1_700_000_000_000;

fn amt(v: f64) -> Amount {
    Amount::from_f64(v).unwrap()
}

fn create_test_ledger(allowance: f64) -> (Ledger<MemoryStore, Arc<ManualClock>>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START_MS));
    let ledger = Ledger::new(MemoryStore::new()).with_clock(clock.clone());
    ledger.approve_allowance("alice", amt(allowance)).unwrap();
    (ledger, clock)
}

fn assert_invariants<S: Store>(ledger: &Ledger<S, Arc<ManualClock>>) {
    let report = ledger.audit().unwrap();
    assert!(report.is_clean(), "audit findings: {:?}", report.findings);
}

fn payees() -> HashMap<String, String> {
    let mut payees = HashMap::new();
    payees.insert("carol".to_string(), "0xca201".to_string());
    payees
}

/// Open -> Finalize with no ticks is refunded as too short
#[test]
fn test_open_then_finalize_without_ticks() {
    let (ledger, _) = create_test_ledger(10.0);
    let opened = ledger
        .open("alice", "post-1", "carol", &PriceQuote::per_minute(0.3, 2.0, 5.0))
        .unwrap();
    assert_eq!(
        ledger.account_summary("alice").unwrap().pending_hold,
        amt(1.5)
    );

    let outcome = ledger.finalize(&opened.reservation_id).unwrap();
    assert!(!outcome.payable);
    assert_eq!(outcome.debit, Amount::ZERO);
    assert_eq!(outcome.refund_reason, Some(RefundReason::TooShort));

    let summary = ledger.account_summary("alice").unwrap();
    assert_eq!(summary.pending_hold, Amount::ZERO);
    assert_eq!(summary.available_allowance, amt(10.0));
    assert_invariants(&ledger);
}

/// One focused minute at 0.8 visibility bills the two-minute floor
#[test]
fn test_short_session_bills_min_minutes() {
    let (ledger, _) = create_test_ledger(10.0);
    let id = ledger
        .open("alice", "post-1", "carol", &PriceQuote::per_minute(0.3, 2.0, 5.0))
        .unwrap()
        .reservation_id;
    for _ in 0..12 {
        ledger.record_tick(&id, TickInput::focused(5_000, 0.8)).unwrap();
    }

    let outcome = ledger.finalize(&id).unwrap();
    assert!(outcome.payable);
    assert_eq!(outcome.debit, amt(0.6));
    assert_eq!(ledger.account_summary("alice").unwrap().lifetime_used, amt(0.6));
    assert_invariants(&ledger);
}

/// Seven focused minutes bill the five-minute cap
#[test]
fn test_long_session_bills_cap() {
    let (ledger, _) = create_test_ledger(10.0);
    let id = ledger
        .open("alice", "post-1", "carol", &PriceQuote::per_minute(0.3, 2.0, 5.0))
        .unwrap()
        .reservation_id;

    let mut cap_seen = false;
    for _ in 0..7 {
        match ledger.record_tick(&id, TickInput::focused(60_000, 0.8)).unwrap() {
            TickOutcome::Recorded(usage) => {
                assert!(!usage.limit_reached);
                cap_seen |= usage.cap_reached;
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert!(cap_seen);

    let outcome = ledger.finalize(&id).unwrap();
    assert_eq!(outcome.debit, amt(1.5));
    assert_invariants(&ledger);
}

/// Only the remaining allowance can be held
#[test]
fn test_insufficient_allowance_while_first_hold_active() {
    let (ledger, _) = create_test_ledger(10.0);
    ledger
        .open("alice", "post-1", "carol", &PriceQuote::per_read(8.0))
        .unwrap();

    let err = ledger
        .open("alice", "post-2", "carol", &PriceQuote::per_read(3.0))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InsufficientAllowance { available, .. } if available == amt(2.0)
    ));
    assert_invariants(&ledger);
}

/// Aggregate two charges for one payee, distribute once
#[test]
fn test_settlement_round() {
    let (ledger, _) = create_test_ledger(10.0);
    let mut charge_ids = Vec::new();
    for price in [2.0, 3.0] {
        let id = ledger
            .open("alice", "post", "carol", &PriceQuote::per_read(price))
            .unwrap()
            .reservation_id;
        ledger.record_tick(&id, TickInput::focused(30_000, 0.95)).unwrap();
        charge_ids.push(ledger.finalize(&id).unwrap().charge_id);
    }

    let batch = ledger.aggregate_draft().unwrap().unwrap();
    assert_eq!(batch.totals["carol"], amt(5.0));
    // Idempotent while nothing new is finalized
    assert_eq!(ledger.aggregate_draft().unwrap().unwrap(), batch);

    let executor = MockPayoutExecutor::new();
    let receipt = ledger.distribute(&batch.id, &payees(), &executor).unwrap();
    assert!(receipt.mocked);
    assert!(receipt.tx_ref.starts_with("0xmock_"));

    for id in &charge_ids {
        let charge = ledger.store().charge(id).unwrap().unwrap();
        assert_eq!(charge.settlement_batch_id.as_deref(), Some(batch.id.as_str()));
        assert!(charge.settled_at.is_some());
    }
    let stored = ledger.store().batch(&batch.id).unwrap().unwrap();
    assert!(!stored.is_draft());

    assert!(matches!(
        ledger.distribute(&batch.id, &payees(), &executor),
        Err(Error::AlreadyDistributed(_))
    ));
    assert_eq!(executor.call_count(), 1);

    // Settled charges can never be claimed again
    let reclaimed = ledger
        .store()
        .claim_charges(&charge_ids, "batch_other", START_MS)
        .unwrap();
    assert!(reclaimed.is_empty());
    assert_invariants(&ledger);
}

/// An idle tick after expiry closes the session with its accrued usage
#[test]
fn test_idle_tick_after_expiry() {
    let (ledger, clock) = create_test_ledger(10.0);
    let id = ledger
        .open("alice", "post", "carol", &PriceQuote::per_minute(0.3, 0.0, 5.0))
        .unwrap()
        .reservation_id;
    for _ in 0..4 {
        ledger.record_tick(&id, TickInput::focused(60_000, 0.9)).unwrap();
    }
    assert_eq!(ledger.account_summary("alice").unwrap().active_usage, amt(1.2));

    clock.advance_secs(601);
    match ledger.record_tick(&id, TickInput::idle(5_000)).unwrap() {
        TickOutcome::Expired { used_amount, .. } => assert_eq!(used_amount, amt(1.2)),
        other => panic!("expected expiry, got {other:?}"),
    }

    let reservation = ledger.store().reservation(&id).unwrap().unwrap();
    assert_eq!(reservation.status, ReservationStatus::Expired);
    let summary = ledger.account_summary("alice").unwrap();
    assert_eq!(summary.pending_hold, Amount::ZERO);
    assert_eq!(summary.lifetime_used, amt(1.2));
    assert_invariants(&ledger);
}

/// Everything survives a restart, and work continues where it stopped
#[test]
fn test_file_store_restart() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::with_data_dir(temp_dir.path().to_path_buf());
    config.snapshot_every = 3;
    let clock = Arc::new(ManualClock::new(START_MS));

    let (open_id, before) = {
        let ledger = Ledger::new(FileStore::open(&config).unwrap()).with_clock(clock.clone());
        ledger.approve_allowance("alice", amt(10.0)).unwrap();
        let done = ledger
            .open("alice", "a", "carol", &PriceQuote::per_read(2.0))
            .unwrap()
            .reservation_id;
        ledger.record_tick(&done, TickInput::focused(30_000, 1.0)).unwrap();
        ledger.finalize(&done).unwrap();
        let open_id = ledger
            .open("alice", "b", "carol", &PriceQuote::per_minute(0.5, 1.0, 4.0))
            .unwrap()
            .reservation_id;
        ledger.record_tick(&open_id, TickInput::focused(60_000, 1.0)).unwrap();
        (open_id, ledger.store().snapshot().unwrap())
    };

    let ledger = Ledger::new(FileStore::open(&config).unwrap()).with_clock(clock);
    assert_eq!(ledger.store().snapshot().unwrap(), before);
    assert_invariants(&ledger);

    ledger.record_tick(&open_id, TickInput::focused(60_000, 1.0)).unwrap();
    let outcome = ledger.finalize(&open_id).unwrap();
    assert_eq!(outcome.debit, amt(1.0));

    let batch = ledger.aggregate_draft().unwrap().unwrap();
    assert_eq!(batch.totals["carol"], amt(3.0));
    ledger
        .distribute(&batch.id, &payees(), &MockPayoutExecutor::new())
        .unwrap();
    assert!(ledger.aggregate_draft().unwrap().is_none());
}

/// A data directory has one owner at a time, so two settlement runs cannot both see "no draft"
#[test]
fn test_data_dir_has_one_owner() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::with_data_dir(temp_dir.path().to_path_buf());

    let first = Ledger::new(FileStore::open(&config).unwrap());
    first.approve_allowance("alice", amt(10.0)).unwrap();
    assert!(matches!(
        FileStore::open(&config),
        Err(Error::DataDirLocked(_))
    ));

    drop(first);
    let second = Ledger::new(FileStore::open(&config).unwrap());
    let summary = second.account_summary("alice").unwrap();
    assert_eq!(summary.approved_total, amt(10.0));
    assert_eq!(summary.approvals.len(), 1);
}

/// Concurrent opens never promise more than the allowance
#[test]
fn test_concurrent_opens_respect_allowance() {
    let ledger = Arc::new(Ledger::new(MemoryStore::new()));
    ledger.approve_allowance("alice", amt(5.0)).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                ledger.open("alice", &format!("post-{}", i), "carol", &PriceQuote::per_read(1.0))
            })
        })
        .collect();

    let mut opened = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(_) => opened += 1,
            Err(Error::InsufficientAllowance { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(opened, 5);

    let summary = ledger.account_summary("alice").unwrap();
    assert_eq!(summary.pending_hold, amt(5.0));
    assert_eq!(summary.available_allowance, Amount::ZERO);
    assert!(ledger.audit().unwrap().is_clean());
}

/// Concurrent ticks on one reservation are all accounted for
#[test]
fn test_concurrent_ticks_serialize() {
    let ledger = Arc::new(Ledger::new(MemoryStore::new()));
    ledger.approve_allowance("alice", amt(100.0)).unwrap();
    let id = ledger
        .open("alice", "post", "carol", &PriceQuote::per_minute(0.6, 0.0, 60.0))
        .unwrap()
        .reservation_id;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            let id = id.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    ledger.record_tick(&id, TickInput::focused(5_000, 1.0)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let reservation = ledger.store().reservation(&id).unwrap().unwrap();
    assert_eq!(reservation.used_ms, 200_000);
    assert_eq!(reservation.used_amount, amt(2.0));
    assert_eq!(ledger.store().ticks(&id).unwrap().len(), 40);
}

#[derive(Debug, Clone)]
enum Op {
    OpenRead(u8),
    OpenMinute { rate_cents: u8, cap: u8 },
    Tick { slot: usize, ms: u64, focus: bool, visibility: u8 },
    Finalize(usize),
    Advance(u64),
    Sweep,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u8..6).prop_map(Op::OpenRead),
        (1u8..80, 1u8..10).prop_map(|(rate_cents, cap)| Op::OpenMinute { rate_cents, cap }),
        (0usize..8, 0u64..90_000, any::<bool>(), 0u8..=10).prop_map(
            |(slot, ms, focus, visibility)| Op::Tick {
                slot,
                ms,
                focus,
                visibility
            }
        ),
        (0usize..8).prop_map(Op::Finalize),
        (0u64..1_200).prop_map(Op::Advance),
        Just(Op::Sweep),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any interleaving keeps holds equal to active reservations and never overcommits.
    #[test]
    fn prop_holds_match_active_reservations(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let (ledger, clock) = create_test_ledger(12.0);
        let mut reservations: Vec<String> = Vec::new();

        for op in ops {
            match op {
                Op::OpenRead(price) => {
                    if let Ok(opened) = ledger.open("alice", "post", "carol", &PriceQuote::per_read(price as f64)) {
                        reservations.push(opened.reservation_id);
                    }
                }
                Op::OpenMinute { rate_cents, cap } => {
                    let quote = PriceQuote::per_minute(rate_cents as f64 / 100.0, 0.0, cap as f64);
                    if let Ok(opened) = ledger.open("alice", "post", "carol", &quote) {
                        reservations.push(opened.reservation_id);
                    }
                }
                Op::Tick { slot, ms, focus, visibility } => {
                    if let Some(id) = reservations.get(slot) {
                        let input = TickInput {
                            tick_ms: ms,
                            focus,
                            visibility: visibility as f64 / 10.0,
                            scroll: 0.0,
                        };
                        let _ = ledger.record_tick(id, input);
                    }
                }
                Op::Finalize(slot) => {
                    if let Some(id) = reservations.get(slot) {
                        let _ = ledger.finalize(id);
                    }
                }
                Op::Advance(secs) => clock.advance_secs(secs),
                Op::Sweep => {
                    ledger.sweep_expired().unwrap();
                }
            }

            let report = ledger.audit().unwrap();
            prop_assert!(report.is_clean(), "audit findings: {:?}", report.findings);
            let account = ledger.store().account("alice").unwrap().unwrap();
            prop_assert!(account.used_total.saturating_add(account.pending_hold) <= account.approved_total);
        }

        // Closing everything releases every hold
        for id in &reservations {
            let _ = ledger.finalize(id);
        }
        let summary = ledger.account_summary("alice").unwrap();
        prop_assert_eq!(summary.pending_hold, Amount::ZERO);
        prop_assert_eq!(summary.active_reservations, 0);
    }
}
