//! Isolation Anomaly Tests
//!
//! Documents which anomalies each isolation setting admits.
//!
//! ## Prevented in every mode
//! - Dirty reads: writes are buffered in the transaction until commit
//! - Lost updates: the second writer of an object fails its version check
//! - Inconsistent reads: the read set is revalidated on every new load
//!
//! ## Allowed under Snapshot
//! - Write skew: disjoint writes based on overlapping reads both commit
//!
//! Write skew is ruled out by `Serializable` or by ensuring the reads.
//!
//! ## Conservative policies
//! - Read sets past the scan limit are not revalidated; any write elsewhere
//!   aborts them
//! - Read-biased objects are read without arriving, yet a write to them still
//!   invalidates the readers

#![allow(missing_docs)]

use std::sync::Arc;

use umbra::stm::{Stm, StmConfig, TxnConfig, TxnLong};
use umbra::types::{IsolationLevel, StmError, TxnStatus};

fn fat(family: &str) -> TxnConfig {
    TxnConfig::new(family).speculative(false)
}

/// Two on-call doctors; each transaction lets one go off call if the other
/// is still on call. Returns the outcome of committing both.
fn write_skew(
    stm: &Arc<Stm>,
    config: TxnConfig,
    ensure: bool,
) -> (TxnLong, TxnLong, umbra::Result<()>, umbra::Result<()>) {
    let alice = TxnLong::new(stm, 1);
    let bob = TxnLong::new(stm, 1);

    let mut t1 = stm.new_txn(config.clone()).unwrap();
    let mut t2 = stm.new_txn(config).unwrap();

    if ensure {
        bob.ensure(&mut t1).unwrap();
        alice.ensure(&mut t2).unwrap();
    }
    let bob_seen_by_t1 = bob.get(&mut t1).unwrap();
    let alice_seen_by_t2 = alice.get(&mut t2).unwrap();
    assert_eq!(bob_seen_by_t1 + alice_seen_by_t2, 2);

    // t1 sends alice home because bob is on call, t2 the other way around
    alice.set(&mut t1, 0).unwrap();
    bob.set(&mut t2, 0).unwrap();

    let first = t1.commit();
    let second = t2.commit();
    (alice, bob, first, second)
}

#[test]
fn dirty_reads_are_impossible() {
    let stm = Stm::with_defaults();
    let cell = TxnLong::new(&stm, 1);

    let mut writer = stm.new_txn(fat("writer")).unwrap();
    cell.set(&mut writer, 2).unwrap();

    let mut reader = stm.new_txn(fat("reader")).unwrap();
    assert_eq!(cell.get(&mut reader).unwrap(), 1);
    reader.commit().unwrap();
    writer.commit().unwrap();
    assert_eq!(cell.atomic_get().unwrap(), 2);
}

#[test]
fn lost_updates_are_detected() {
    let stm = Stm::with_defaults();
    let counter = TxnLong::new(&stm, 0);

    let mut t1 = stm.new_txn(fat("updater")).unwrap();
    let mut t2 = stm.new_txn(fat("updater")).unwrap();
    counter.increment_and_get(&mut t1, 1).unwrap();
    counter.increment_and_get(&mut t2, 1).unwrap();

    t1.commit().unwrap();
    assert!(matches!(t2.commit(), Err(StmError::ReadWriteConflict(_))));
    assert_eq!(counter.atomic_get().unwrap(), 1);
}

#[test]
fn read_set_stays_consistent_across_loads() {
    let stm = Stm::with_defaults();
    let a = TxnLong::new(&stm, 50);
    let b = TxnLong::new(&stm, 50);

    let mut auditor = stm.new_txn(fat("auditor")).unwrap();
    let seen_a = a.get(&mut auditor).unwrap();

    // a transfer commits between the auditor's two reads
    stm.executor(fat("transfer"))
        .unwrap()
        .execute(|tx| {
            a.increment_and_get(tx, -10)?;
            b.increment_and_get(tx, 10)?;
            Ok(())
        })
        .unwrap();

    let second = b.get(&mut auditor);
    assert!(
        matches!(second, Err(StmError::ReadWriteConflict(_))),
        "auditor saw a={seen_a} together with the post-transfer b"
    );
}

#[test]
fn snapshot_isolation_admits_write_skew() {
    let stm = Stm::with_defaults();
    let (alice, bob, first, second) = write_skew(&stm, fat("snapshot"), false);
    first.unwrap();
    second.unwrap();
    // nobody is on call any more
    assert_eq!(alice.atomic_get().unwrap() + bob.atomic_get().unwrap(), 0);
}

#[test]
fn ensured_reads_prevent_write_skew() {
    let stm = Stm::with_defaults();
    let (alice, bob, first, second) = write_skew(&stm, fat("ensured"), true);
    first.unwrap();
    assert!(matches!(second, Err(StmError::ReadWriteConflict(_))));
    assert_eq!(alice.atomic_get().unwrap() + bob.atomic_get().unwrap(), 1);
}

#[test]
fn serializable_isolation_prevents_write_skew() {
    let stm = Stm::with_defaults();
    let config = fat("serializable").isolation(IsolationLevel::Serializable);
    let (alice, bob, first, second) = write_skew(&stm, config, false);
    first.unwrap();
    assert!(matches!(second, Err(StmError::ReadWriteConflict(_))));
    assert_eq!(alice.atomic_get().unwrap() + bob.atomic_get().unwrap(), 1);
}

#[test]
fn serializable_executor_keeps_the_invariant_under_retries() {
    let stm = Stm::with_defaults();
    let alice = TxnLong::new(&stm, 1);
    let bob = TxnLong::new(&stm, 1);
    let executor = stm
        .executor(stm.txn_config("on-call").isolation(IsolationLevel::Serializable))
        .unwrap();

    let observer = stm.executor(stm.txn_config("roster")).unwrap();
    let empty_rosters = std::thread::scope(|scope| {
        for (me, other) in [(&alice, &bob), (&bob, &alice)] {
            let executor = executor.clone();
            scope.spawn(move || {
                for _ in 0..200 {
                    executor
                        .execute(|tx| {
                            if other.get(tx)? == 1 {
                                me.set(tx, 0)?;
                            }
                            Ok(())
                        })
                        .unwrap();
                    executor.execute(|tx| me.set(tx, 1)).unwrap();
                }
            });
        }
        (0..2_000)
            .filter(|_| {
                let on_call = observer
                    .execute(|tx| Ok(alice.get(tx)? + bob.get(tx)?))
                    .unwrap();
                on_call == 0
            })
            .count()
    });

    assert_eq!(empty_rosters, 0);
    assert_eq!(alice.atomic_get().unwrap() + bob.atomic_get().unwrap(), 2);
}

#[test]
fn oversized_read_sets_assume_a_conflict() {
    let stm = Stm::new(StmConfig {
        maximum_poor_mans_conflict_scan_length: 2,
        ..StmConfig::default()
    })
    .unwrap();
    let cells: Vec<TxnLong> = (0..4).map(|i| TxnLong::new(&stm, i)).collect();
    let unrelated = TxnLong::new(&stm, 0);

    // within the limit the read set is rescanned and survives
    let mut tx = stm.new_txn(fat("scan-small")).unwrap();
    cells[0].get(&mut tx).unwrap();
    unrelated.atomic_increment_and_get(1).unwrap();
    assert_eq!(cells[1].get(&mut tx).unwrap(), 1);
    tx.commit().unwrap();

    // past it any write elsewhere aborts the reader
    let mut tx = stm.new_txn(fat("scan-large")).unwrap();
    cells[0].get(&mut tx).unwrap();
    cells[1].get(&mut tx).unwrap();
    unrelated.atomic_increment_and_get(1).unwrap();
    let err = cells[2].get(&mut tx).unwrap_err();
    assert!(matches!(
        err,
        StmError::ReadWriteConflict("read set too large to revalidate")
    ));
    assert_eq!(tx.status(), TxnStatus::Aborted);
    for cell in &cells {
        assert!(cell.object().orec().snapshot().is_idle());
    }
}

#[test]
fn read_biased_reads_still_see_concurrent_writes() {
    let stm = Stm::new(StmConfig {
        read_biased_threshold: 2,
        ..StmConfig::default()
    })
    .unwrap();
    let hot = TxnLong::new(&stm, 1);
    let other = TxnLong::new(&stm, 10);

    for _ in 0..2 {
        let mut tx = stm.new_txn(fat("warm-up")).unwrap();
        hot.get(&mut tx).unwrap();
        tx.commit().unwrap();
    }
    let orec = hot.object().orec();
    assert!(orec.is_read_biased());

    let mut reader = stm.new_txn(fat("biased-reader")).unwrap();
    assert_eq!(hot.get(&mut reader).unwrap(), 1);
    assert_eq!(orec.surplus(), 0, "read-biased reads do not arrive");

    hot.atomic_set(2).unwrap();
    assert!(!orec.is_read_biased(), "a write ends read biasing");

    let err = other.get(&mut reader).unwrap_err();
    assert!(matches!(err, StmError::ReadWriteConflict("read set changed")));
    assert_eq!(reader.status(), TxnStatus::Aborted);
    assert!(orec.snapshot().is_idle());
    assert!(other.object().orec().snapshot().is_idle());
    assert_eq!(hot.atomic_get().unwrap(), 2);
}
