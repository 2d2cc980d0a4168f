//! Speculative Escalation Tests
//!
//! Transactions start in the cheapest flavor their family's profile allows
//! and are re-executed in a richer one when they need more. The profile is
//! shared by the family, so later transactions start where earlier ones
//! ended up.

#![allow(missing_docs)]

use std::sync::Arc;

use parking_lot::Mutex;
use umbra::stm::{Stm, Txn, TxnEvent, TxnExecutor, TxnLong, TxnRef};
use umbra::types::{LockMode, SpeculativeFeature, StmError, TxnFlavor};

/// Runs `body` and returns the flavor of every attempt it took.
fn flavors_of<F>(executor: &TxnExecutor, mut body: F) -> Vec<TxnFlavor>
where
    F: FnMut(&mut Txn) -> umbra::Result<()>,
{
    let mut seen = Vec::new();
    executor
        .execute(|tx| {
            seen.push(tx.flavor());
            body(tx)
        })
        .unwrap();
    seen
}

#[test]
fn growing_transaction_walks_up_the_flavors() {
    let stm = Stm::with_defaults();
    let cells: Vec<TxnLong> = (0..1_000).map(|i| TxnLong::new(&stm, i)).collect();
    let executor = stm.executor(stm.txn_config("growing")).unwrap();

    let first = flavors_of(&executor, |tx| cells[0].get(tx).map(|_| ()));
    assert_eq!(first, vec![TxnFlavor::LeanMono]);

    let mut sum = 0;
    let second = flavors_of(&executor, |tx| {
        sum = 0;
        for cell in &cells {
            sum += cell.get(tx)?;
        }
        Ok(())
    });
    assert_eq!(
        second,
        vec![
            TxnFlavor::LeanMono,
            TxnFlavor::LeanFixedLength,
            TxnFlavor::FatVariableLength
        ]
    );
    assert_eq!(sum, (0..1_000).sum::<i64>());

    // the profile remembers the size
    let profile = stm.speculative_config("growing");
    assert!(profile.minimal_length() > profile.max_fixed_length());
    let third = flavors_of(&executor, |tx| cells[0].get(tx).map(|_| ()));
    assert_eq!(third, vec![TxnFlavor::FatVariableLength]);
}

#[test]
fn each_feature_makes_the_family_fat() {
    let stm = Stm::with_defaults();
    let counter = TxnLong::new(&stm, 0);
    let shared: TxnRef<String> = TxnRef::new(&stm, Some(Arc::new("hello".to_owned())));

    type Body<'a> = Box<dyn Fn(&mut Txn) -> umbra::Result<()> + 'a>;
    let cases: Vec<(&str, SpeculativeFeature, Body<'_>)> = vec![
        (
            "commute",
            SpeculativeFeature::Commute,
            Box::new(|tx: &mut Txn| counter.increment(tx, 1)),
        ),
        ("ensure", SpeculativeFeature::Ensure, Box::new(|tx: &mut Txn| counter.ensure(tx))),
        (
            "locks",
            SpeculativeFeature::Locks,
            Box::new(|tx: &mut Txn| counter.get_locked(tx, LockMode::Read).map(|_| ())),
        ),
        (
            "references",
            SpeculativeFeature::NonPrimitivePayload,
            Box::new(|tx: &mut Txn| shared.get(tx).map(|_| ())),
        ),
        (
            "construction",
            SpeculativeFeature::Construction,
            Box::new(|tx: &mut Txn| TxnLong::new_in(tx, 1).map(|_| ())),
        ),
        (
            "listeners",
            SpeculativeFeature::Listeners,
            Box::new(|tx: &mut Txn| tx.register(Arc::new(|_event: TxnEvent| {}))),
        ),
    ];

    for (family, feature, body) in cases {
        let executor = stm.executor(stm.txn_config(family)).unwrap();
        let flavors = flavors_of(&executor, |tx| body(tx));
        assert_eq!(flavors, vec![TxnFlavor::LeanMono, TxnFlavor::FatMono], "{family}");
        let profile = stm.speculative_config(family);
        assert!(profile.is_fat(), "{family}");
        assert!(profile.needs(feature), "{family}");

        let again = flavors_of(&executor, |tx| body(tx));
        assert_eq!(again, vec![TxnFlavor::FatMono], "{family}");
    }

    assert_eq!(counter.atomic_get().unwrap(), 2);
}

#[test]
fn escalations_count_against_the_retry_bound() {
    let stm = Stm::with_defaults();
    let counter = TxnLong::new(&stm, 0);
    let executor = stm
        .executor(stm.txn_config("tight").max_retries(1))
        .unwrap();

    let err = executor
        .execute(|tx| counter.increment(tx, 1))
        .unwrap_err();
    assert!(matches!(err, StmError::TooManyRetries { attempts: 1, .. }));
    assert_eq!(counter.atomic_get().unwrap(), 0);

    // the failed run still taught the profile
    executor.execute(|tx| counter.increment(tx, 1)).unwrap();
    assert_eq!(counter.atomic_get().unwrap(), 1);
}

#[test]
fn non_speculative_families_start_fat() {
    let stm = Stm::with_defaults();
    let a = TxnLong::new(&stm, 1);
    let b = TxnLong::new(&stm, 2);
    let executor = stm
        .executor(stm.txn_config("eager").speculative(false))
        .unwrap();

    let flavors = flavors_of(&executor, |tx| {
        let total = a.get(tx)? + b.get(tx)?;
        a.commute(tx, move |v| v + total)
    });
    assert_eq!(flavors, vec![TxnFlavor::FatVariableLength]);
    assert_eq!(a.atomic_get().unwrap(), 4);
    assert!(!stm.speculative_config("eager").is_fat());
}

#[test]
fn families_escalate_concurrently_without_losing_work() {
    let stm = Stm::with_defaults();
    let cells: Vec<TxnLong> = (0..64).map(|_| TxnLong::new(&stm, 0)).collect();
    let executor = stm.executor(stm.txn_config("fan-out")).unwrap();
    let flavors = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for width in [1usize, 8, 64] {
                    let seen = flavors_of(&executor, |tx| {
                        for cell in &cells[..width] {
                            cell.increment_and_get(tx, 1)?;
                        }
                        Ok(())
                    });
                    flavors.lock().extend(seen);
                }
            });
        }
    });

    assert_eq!(cells[0].atomic_get().unwrap(), 12);
    assert_eq!(cells[7].atomic_get().unwrap(), 8);
    assert_eq!(cells[63].atomic_get().unwrap(), 4);
    assert!(flavors.lock().contains(&TxnFlavor::FatVariableLength));
}
