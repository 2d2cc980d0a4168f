//! Transaction Lifecycle Tests
//!
//! Exercises the public transaction surface end to end:
//! - every finished attempt leaves its orecs idle
//! - writes stay private until commit
//! - unchanged writes are not published when dirty checking is on
//! - illegal lifecycle transitions are reported
//! - objects constructed by an aborted transaction never surface

#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use tracing_subscriber::EnvFilter;
use umbra::stm::{Payload, Stm, TxnConfig, TxnEvent, TxnLong, TxnObject};
use umbra::types::{LockMode, StmError, TxnStatus};

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

fn assert_idle(object: &Arc<TxnObject>) {
    let snapshot = object.orec().snapshot();
    assert!(snapshot.is_idle(), "orec of object {} not idle: {snapshot:?}", object.id());
}

fn fat(family: &str) -> TxnConfig {
    TxnConfig::new(family).speculative(false)
}

#[test]
fn finished_attempts_leave_orecs_idle() {
    init_tracing();
    let stm = Stm::with_defaults();
    let cells: Vec<TxnLong> = (0..8).map(|i| TxnLong::new(&stm, i)).collect();

    // committed read-write transaction
    stm.atomically(|tx| {
        for cell in &cells {
            cell.increment_and_get(tx, 1)?;
        }
        Ok(())
    })
    .unwrap();

    // failing body
    let err = stm
        .atomically(|tx| -> umbra::Result<()> {
            cells[0].set(tx, 100)?;
            cells[1].get(tx)?;
            Err(StmError::user("business rule violated"))
        })
        .unwrap_err();
    assert!(matches!(err, StmError::User(_)));

    // explicit locks released on commit
    stm.executor(fat("locking"))
        .unwrap()
        .execute(|tx| {
            cells[2].get_locked(tx, LockMode::Read)?;
            cells[3].get_locked(tx, LockMode::Write)?;
            cells[4].acquire(tx, LockMode::Exclusive)
        })
        .unwrap();

    // read-only transaction dropped without commit
    {
        let mut tx = stm.new_txn(fat("dropped")).unwrap();
        cells[5].get(&mut tx).unwrap();
        cells[6].get_locked(&mut tx, LockMode::Write).unwrap();
    }

    for cell in &cells {
        assert_idle(cell.object());
    }
    assert_eq!(cells[0].atomic_get().unwrap(), 1);
}

#[test]
fn own_writes_are_private_until_commit() {
    init_tracing();
    let stm = Stm::with_defaults();
    let cell = TxnLong::new(&stm, 10);

    let mut tx = stm.new_txn(fat("private")).unwrap();
    cell.set(&mut tx, 11).unwrap();
    assert_eq!(cell.get(&mut tx).unwrap(), 11);
    assert_eq!(cell.atomic_get().unwrap(), 10);
    assert_eq!(cell.atomic_weak_get(), 10);

    tx.commit().unwrap();
    assert_eq!(tx.status(), TxnStatus::Committed);
    assert_eq!(cell.atomic_get().unwrap(), 11);
}

#[test]
fn unchanged_writes_are_elided_by_the_dirty_check() {
    init_tracing();
    let stm = Stm::with_defaults();
    let cell = TxnLong::new(&stm, 5);
    let before = cell.version();

    stm.atomically(|tx| cell.set(tx, 5)).unwrap();
    assert_eq!(cell.version(), before);

    let always_publish = stm
        .executor(stm.txn_config("blind").dirty_check(false))
        .unwrap();
    always_publish.execute(|tx| cell.set(tx, 5)).unwrap();
    assert_eq!(cell.version(), before + 1);
    assert_eq!(cell.atomic_get().unwrap(), 5);
}

#[test]
fn lifecycle_transitions_are_checked() {
    init_tracing();
    let stm = Stm::with_defaults();
    let cell = TxnLong::new(&stm, 0);

    let mut tx = stm.new_txn(fat("lifecycle")).unwrap();
    cell.set(&mut tx, 1).unwrap();
    tx.prepare().unwrap();
    assert_eq!(tx.status(), TxnStatus::Prepared);
    assert!(matches!(cell.get(&mut tx), Err(StmError::PreparedTransaction(_))));
    // prepared objects are exclusively locked
    assert!(matches!(cell.atomic_set(9), Err(StmError::Locked(_))));
    tx.commit().unwrap();
    tx.commit().unwrap();
    assert!(matches!(tx.prepare(), Err(StmError::DeadTransaction(_))));

    let mut tx = stm.new_txn(fat("lifecycle")).unwrap();
    cell.set(&mut tx, 2).unwrap();
    tx.abort();
    tx.abort();
    assert_eq!(tx.status(), TxnStatus::Aborted);
    assert!(matches!(tx.commit(), Err(StmError::DeadTransaction(_))));
    assert!(matches!(cell.set(&mut tx, 3), Err(StmError::DeadTransaction(_))));
    assert_eq!(cell.atomic_get().unwrap(), 1);
    assert_idle(cell.object());
}

#[test]
fn constructed_objects_surface_only_on_commit() {
    init_tracing();
    let stm = Stm::with_defaults();

    let created = stm
        .atomically(|tx| {
            let cell = TxnLong::new_in(tx, 7)?;
            cell.increment_and_get(tx, 1)?;
            Ok(cell)
        })
        .unwrap();
    assert_eq!(created.atomic_get().unwrap(), 8);
    assert_idle(created.object());

    let mut tx = stm.new_txn(fat("discarded")).unwrap();
    let object = tx.open_for_construction(Payload::Bits(1)).unwrap();
    tx.abort();
    assert!(object.orec().is_exclusive());
    let mut reader = stm.new_txn(fat("reader")).unwrap();
    assert!(matches!(
        reader.read(&object, LockMode::None),
        Err(StmError::ReadWriteConflict(_))
    ));
}

#[test]
fn permanent_listeners_follow_every_attempt() {
    init_tracing();
    let stm = Stm::with_defaults();
    let cell = TxnLong::new(&stm, 0);
    let commits = Arc::new(AtomicUsize::new(0));
    let aborts = Arc::new(AtomicUsize::new(0));

    let config = {
        let commits = Arc::clone(&commits);
        let aborts = Arc::clone(&aborts);
        fat("observed").permanent_listener(Arc::new(move |event: TxnEvent| match event {
            TxnEvent::PostCommit => {
                commits.fetch_add(1, Ordering::SeqCst);
            }
            TxnEvent::PostAbort => {
                aborts.fetch_add(1, Ordering::SeqCst);
            }
            TxnEvent::PrePrepare => {}
        }))
    };
    let executor = stm.executor(config).unwrap();

    let mut first = true;
    executor
        .execute(|tx| {
            cell.increment_and_get(tx, 1)?;
            if first {
                first = false;
                return Err(StmError::ReadWriteConflict("injected"));
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(commits.load(Ordering::SeqCst), 1);
    assert_eq!(aborts.load(Ordering::SeqCst), 1);
    assert_eq!(cell.atomic_get().unwrap(), 1);
}
