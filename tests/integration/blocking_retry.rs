//! Blocking Retry Tests
//!
//! A transaction that calls `retry` parks until one of the objects it read
//! is changed by a commit, then runs again. Covers wakeup, timeouts that are
//! carried across attempts, interruption and the refusal cases.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Once};
use std::thread;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;
use umbra::primitives::concurrency::InterruptToken;
use umbra::stm::{Stm, TxnLong};
use umbra::types::StmError;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[test]
fn waiter_wakes_when_a_read_object_changes() {
    init_tracing();
    let stm = Stm::with_defaults();
    let flag = TxnLong::new(&stm, 0);
    let runs = AtomicU32::new(0);

    thread::scope(|scope| {
        let waiter = scope.spawn(|| {
            stm.atomically(|tx| {
                runs.fetch_add(1, Ordering::SeqCst);
                flag.await_value(tx, 1)
            })
        });
        thread::sleep(Duration::from_millis(50));
        flag.atomic_set(1).unwrap();
        waiter.join().unwrap().unwrap();
    });

    assert!(runs.load(Ordering::SeqCst) >= 1);
    assert!(flag.object().orec().snapshot().is_idle());
    assert_eq!(flag.object().orec().listener_count(), 0);
}

#[test]
fn producer_consumer_hand_off() {
    init_tracing();
    let stm = Stm::with_defaults();
    let slot = TxnLong::new(&stm, 0);
    let consumed = TxnLong::new(&stm, 0);
    const ITEMS: i64 = 100;

    thread::scope(|scope| {
        scope.spawn(|| {
            for item in 1..=ITEMS {
                stm.atomically(|tx| {
                    if slot.get(tx)? != 0 {
                        return tx.retry();
                    }
                    slot.set(tx, item)
                })
                .unwrap();
            }
        });
        scope.spawn(|| {
            for _ in 0..ITEMS {
                stm.atomically(|tx| {
                    let item = slot.get(tx)?;
                    if item == 0 {
                        return tx.retry();
                    }
                    slot.set(tx, 0)?;
                    consumed.increment_and_get(tx, item).map(|_| ())
                })
                .unwrap();
            }
        });
    });

    assert_eq!(consumed.atomic_get().unwrap(), ITEMS * (ITEMS + 1) / 2);
    assert_eq!(slot.atomic_get().unwrap(), 0);
}

#[test]
fn retry_times_out_when_nothing_changes() {
    init_tracing();
    let stm = Stm::with_defaults();
    let flag = TxnLong::new(&stm, 0);
    let executor = stm
        .executor(stm.txn_config("patient").timeout(Duration::from_millis(60)))
        .unwrap();

    let started = Instant::now();
    let err = executor.execute(|tx| flag.await_value(tx, 1)).unwrap_err();
    assert!(matches!(err, StmError::RetryTimeout));
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert!(flag.object().orec().snapshot().is_idle());
    assert_eq!(flag.object().orec().listener_count(), 0);
}

#[test]
fn waking_detaches_listeners_from_untouched_objects() {
    init_tracing();
    let stm = Stm::with_defaults();
    let ready = TxnLong::new(&stm, 0);
    let quiet = TxnLong::new(&stm, 0);

    thread::scope(|scope| {
        let waiter = scope.spawn(|| {
            stm.atomically(|tx| {
                quiet.get(tx)?;
                if ready.get(tx)? == 0 {
                    return tx.retry();
                }
                Ok(())
            })
        });
        while quiet.object().orec().listener_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        ready.atomic_set(1).unwrap();
        waiter.join().unwrap().unwrap();
    });

    // quiet was never written, yet keeps no node for the finished waiter
    assert_eq!(quiet.object().orec().listener_count(), 0);
    assert_eq!(ready.object().orec().listener_count(), 0);
    assert!(quiet.object().orec().snapshot().is_idle());
}

#[test]
fn timeout_budget_is_shared_by_all_wakeups() {
    init_tracing();
    let stm = Stm::with_defaults();
    let flag = TxnLong::new(&stm, 0);
    let executor = stm
        .executor(stm.txn_config("budgeted").timeout(Duration::from_millis(200)))
        .unwrap();
    let barrier = Barrier::new(2);

    let started = Instant::now();
    let outcome = thread::scope(|scope| {
        scope.spawn(|| {
            barrier.wait();
            // wakes the waiter without ever satisfying it
            for _ in 0..5 {
                thread::sleep(Duration::from_millis(10));
                flag.atomic_increment_and_get(2).unwrap();
            }
        });
        barrier.wait();
        executor.execute(|tx| flag.await_value(tx, 1))
    });

    assert!(matches!(outcome, Err(StmError::RetryTimeout)));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(5));
}

#[test]
fn interrupt_token_cancels_a_blocked_retry() {
    init_tracing();
    let stm = Stm::with_defaults();
    let flag = TxnLong::new(&stm, 0);
    let token = Arc::new(InterruptToken::new());
    let executor = stm
        .executor(stm.txn_config("cancellable").interrupt_token(Arc::clone(&token)))
        .unwrap();

    let outcome = thread::scope(|scope| {
        let waiter = scope.spawn(|| executor.execute(|tx| flag.await_value(tx, 1)));
        thread::sleep(Duration::from_millis(50));
        token.interrupt();
        waiter.join().unwrap()
    });

    assert!(matches!(outcome, Err(StmError::RetryInterrupted)));
    assert!(!token.is_interrupted());
    assert!(flag.object().orec().snapshot().is_idle());
}

#[test]
fn retry_requires_something_to_wait_for() {
    init_tracing();
    let stm = Stm::with_defaults();
    let err = stm.atomically(|tx| tx.retry::<()>()).unwrap_err();
    assert!(matches!(err, StmError::RetryNotPossible));

    // a commute-only object has no snapshot to watch
    let counter = TxnLong::new(&stm, 0);
    let err = stm
        .atomically(|tx| {
            counter.increment(tx, 1)?;
            tx.retry::<()>()
        })
        .unwrap_err();
    assert!(matches!(err, StmError::RetryNotPossible));
    assert_eq!(counter.atomic_get().unwrap(), 0);
}

#[test]
fn retry_is_refused_when_blocking_is_disabled() {
    init_tracing();
    let stm = Stm::with_defaults();
    let flag = TxnLong::new(&stm, 0);
    let executor = stm
        .executor(stm.txn_config("non-blocking").blocking_allowed(false))
        .unwrap();
    let err = executor.execute(|tx| flag.await_value(tx, 1)).unwrap_err();
    assert!(matches!(err, StmError::RetryNotAllowed));
}
