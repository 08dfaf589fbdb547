use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use stek_core::{
    CipherAlgorithm, DigestAlgorithm, InMemoryKeyStore, KeyName, KeyStore, ManualClock,
    OsEntropy, RotationPolicy,
};

const RACERS: usize = 32;

fn policy() -> RotationPolicy {
    RotationPolicy::default()
        .with_lifetime(Duration::from_secs(3600))
        .with_rotate_before_expiry(Duration::from_secs(300))
        .with_algorithms(CipherAlgorithm::ChaCha20Poly1305, DigestAlgorithm::Sha256)
}

#[test]
fn threads_racing_to_rotate_observe_one_record() {
    let clock = Arc::new(ManualClock::at(0));
    let store = Arc::new(InMemoryKeyStore::new(
        policy(),
        clock.clone(),
        Arc::new(OsEntropy),
    ));
    let k1 = store.current_record().expect("current").expect("record");

    // Every racer now finds the current key inside its rotation window.
    clock.set(3400);
    let barrier = Arc::new(Barrier::new(RACERS));
    let handles: Vec<_> = (0..RACERS)
        .map(|_| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                *store
                    .current_record()
                    .expect("current")
                    .expect("record")
                    .name()
            })
        })
        .collect();

    let names: HashSet<KeyName> = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .collect();
    assert_eq!(names.len(), 1, "racers saw divergent current keys");
    assert!(!names.contains(k1.name()));
    assert_eq!(store.records().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tasks_racing_on_empty_store_share_first_key() {
    let store: Arc<InMemoryKeyStore> = Arc::new(InMemoryKeyStore::new(
        policy(),
        Arc::new(ManualClock::at(10)),
        Arc::new(OsEntropy),
    ));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..RACERS {
        let store = Arc::clone(&store);
        tasks.spawn(async move {
            let record = KeyStore::current(store.as_ref())
                .await
                .expect("current")
                .expect("record");
            *record.name()
        });
    }

    let mut names = HashSet::new();
    while let Some(result) = tasks.join_next().await {
        names.insert(result.expect("task"));
    }
    assert_eq!(names.len(), 1);
    assert_eq!(store.records().len(), 1);
}

#[test]
fn explicit_rotations_with_same_expectation_publish_once() {
    let store = Arc::new(InMemoryKeyStore::new(
        policy(),
        Arc::new(ManualClock::at(0)),
        Arc::new(OsEntropy),
    ));
    let k1 = *store.current_record().expect("current").expect("record").name();

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                *store.rotate_from(Some(&k1)).expect("rotate").name()
            })
        })
        .collect();

    let names: HashSet<KeyName> = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .collect();
    assert_eq!(names.len(), 1);
    assert_eq!(store.records().len(), 2);
}
