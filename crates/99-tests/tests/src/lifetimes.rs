//! Reference counts and object pools shared by several participants.

use crate::support::{master, slave, wait_for};
use fusion::{
    Call, CallContext, CallReturn, Object, ObjectPool, ObjectState, Permissions, PoolConfig, Ref,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn churn(handle: Ref, seed: u64, steps: usize) -> i64 {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut held = 0i64;
    for _ in 0..steps {
        if held == 0 || rng.gen_bool(0.6) {
            handle.up().unwrap();
            held += 1;
        } else {
            handle.down().unwrap();
            held -= 1;
        }
    }
    held
}

#[test]
fn counts_are_conserved_across_participants() {
    let (_dir, config, owner) = master();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let watch = Call::new(&owner, move |_: &CallContext<'_>| {
        counter.fetch_add(1, Ordering::SeqCst);
        CallReturn::Return(0)
    })
    .unwrap();

    let shared = Ref::new(&owner).unwrap();
    shared.up().unwrap();
    shared.watch(&watch, 0).unwrap();
    let guest = slave(&config);
    shared.grant(guest.id(), Permissions::REF_UNREF).unwrap();
    let guest_ref = Ref::attach(&guest, shared.id()).unwrap();

    let workers: Vec<_> = [(shared.clone(), 1u64), (guest_ref.clone(), 2), (guest_ref.clone(), 3)]
        .into_iter()
        .map(|(handle, seed)| thread::spawn(move || churn(handle, seed, 500)))
        .collect();
    let held: i64 = workers.into_iter().map(|worker| worker.join().unwrap()).sum();
    assert_eq!(shared.stat().unwrap() as i64, 1 + held);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    for _ in 0..held {
        guest_ref.down().unwrap();
    }
    assert_eq!(shared.down().unwrap(), 0);
    assert!(shared.is_dead().unwrap());
    assert!(guest_ref.up().is_err());
    wait_for(|| fired.load(Ordering::SeqCst) == 1);
}

#[test]
fn remote_enumeration_survives_concurrent_releases() {
    let (_dir, config, owner) = master();
    let destroyed = Arc::new(AtomicUsize::new(0));
    let counter = destroyed.clone();
    let pool = ObjectPool::<u64>::create(&owner, "buffers", PoolConfig::default(), move |_: &Object<u64>| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    let objects: Vec<_> = (0..64u64)
        .map(|serial| {
            let object = pool.create_object().unwrap();
            object.write(&serial).unwrap();
            object.activate().unwrap();
            object
        })
        .collect();

    let guest = slave(&config);
    let remote = ObjectPool::<u64>::attach(&guest, "buffers").unwrap();
    let releaser = thread::spawn(move || {
        for object in objects.iter().step_by(2) {
            object.refs().down().unwrap();
        }
        objects
    });

    for _ in 0..8 {
        let mut seen = HashSet::new();
        remote
            .enumerate(|object| {
                let id = object.id().unwrap();
                assert!(seen.insert(id), "object {id} visited twice");
                assert_eq!(object.state().unwrap(), ObjectState::Active);
                true
            })
            .unwrap();
        assert!(seen.len() <= 64);
    }

    let survivors = releaser.join().unwrap();
    wait_for(|| destroyed.load(Ordering::SeqCst) == 32);
    let mut remaining = Vec::new();
    remote
        .enumerate(|object| {
            remaining.push(object.read().unwrap());
            true
        })
        .unwrap();
    remaining.sort_unstable();
    assert_eq!(remaining, (0..64).filter(|serial| serial % 2 == 1).collect::<Vec<_>>());
    drop(survivors);
}
