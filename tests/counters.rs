use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tessera::counter::CounterStore;
use tessera::entity::{ContextKey, EntityType};
use tessera::permission::Role;
use tessera::sequencer::{ChangeEvent, ContextSequencer, EntityChange};
use tessera::storage::{MemoryStorage, SeqKind, StorageBackend};
use tokio::task::JoinSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_are_never_lost() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
    let counters = CounterStore::new(storage);

    let mut tasks = JoinSet::new();
    for _ in 0..64 {
        let counters = counters.clone();
        tasks.spawn(async move { counters.increment("usage", "tenant_a", "task", 1) });
    }
    let mut observed = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        observed.push(joined.expect("join").expect("increment"));
    }

    observed.sort_unstable();
    assert_eq!(observed, (1..=64).collect::<Vec<i64>>());
    assert_eq!(counters.get("usage", "tenant_a", "task").expect("read"), 64);
}

#[test]
fn first_increment_creates_the_row_at_delta() {
    let counters = CounterStore::new(Arc::new(MemoryStorage::new()));
    assert_eq!(counters.get("usage", "tenant_a", "project").expect("read"), 0);
    assert_eq!(
        counters
            .increment("usage", "tenant_a", "project", 5)
            .expect("increment"),
        5
    );
    let row = counters
        .read("usage", "tenant_a", "project")
        .expect("read")
        .expect("row");
    assert_eq!(row.value, 5);
    assert_eq!(row.namespace, "usage");
}

#[test]
fn unavailable_storage_fails_without_retry() {
    let storage = Arc::new(MemoryStorage::new());
    let counters = CounterStore::new(storage.clone());
    counters.increment("usage", "tn", "task", 1).expect("first");
    storage.set_available(false);
    let err = counters
        .increment("usage", "tn", "task", 1)
        .expect_err("unavailable");
    assert_eq!(err.code_str(), "storage_unavailable");
    storage.set_available(true);
    assert_eq!(counters.get("usage", "tn", "task").expect("read"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_committed_change_advances_seq_exactly_once() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
    let sequencer = ContextSequencer::new(storage);
    sequencer
        .init_context_counters(EntityType::Project, &["p1".to_string()], Role::Admin)
        .expect("init");
    let key = ContextKey::entity("p1");

    let mut tasks = JoinSet::new();
    for _ in 0..40 {
        let sequencer = sequencer.clone();
        let key = key.clone();
        tasks.spawn(async move {
            sequencer.apply_change(&ChangeEvent::Entity {
                context: key,
                entity_type: EntityType::Task,
                change: EntityChange::Created,
            })
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.expect("join").expect("apply");
    }

    let row = sequencer.get(&key).expect("get").expect("row");
    assert_eq!(row.seq, 40);
    assert_eq!(row.m_seq, 0);
    assert_eq!(row.count("e:task"), 40);

    let verdict = sequencer.catch_up(&key, 35).expect("catch up");
    assert!(verdict.is_behind());
    assert_eq!(verdict.missed, 5);
    assert!(!sequencer.catch_up(&key, 40).expect("catch up").is_behind());
}

#[test]
fn init_is_idempotent_and_keeps_advanced_rows() {
    let sequencer = ContextSequencer::new(Arc::new(MemoryStorage::new()));
    let ids = vec!["o1".to_string(), "o2".to_string()];
    assert_eq!(
        sequencer
            .init_context_counters(EntityType::Organization, &ids, Role::Admin)
            .expect("init"),
        2
    );
    let key = ContextKey::entity("o1");
    sequencer
        .bump_context_seq(&key, SeqKind::Entity)
        .expect("bump");

    assert_eq!(
        sequencer
            .init_context_counters(EntityType::Organization, &ids, Role::Member)
            .expect("re-init"),
        0
    );
    let row = sequencer.get(&key).expect("get").expect("row");
    assert_eq!(row.seq, 1);
    assert_eq!(row.count("m:admin"), 1);
    assert_eq!(row.count("m:member"), 0);
}

#[test]
fn public_context_keys_sequence_independently() {
    let sequencer = ContextSequencer::new(Arc::new(MemoryStorage::new()));
    let public = ContextKey::public(EntityType::Task);
    assert_eq!(
        sequencer
            .bump_context_seq(&public, SeqKind::Entity)
            .expect("bump"),
        1
    );
    let mut deltas = BTreeMap::new();
    deltas.insert("e:task".to_string(), 3);
    let row = sequencer.adjust_counts(&public, &deltas).expect("adjust");
    assert_eq!(row.context_key, "public:task");
    assert_eq!(row.count("e:task"), 3);
    assert!(
        sequencer
            .get(&ContextKey::entity("p1"))
            .expect("get")
            .is_none()
    );
}

proptest! {
    #[test]
    fn final_value_is_the_sum_of_deltas(deltas in proptest::collection::vec(-1_000i64..1_000, 1..40)) {
        let counters = CounterStore::new(Arc::new(MemoryStorage::new()));
        let mut last = 0;
        for delta in &deltas {
            last = counters.increment("rate", "tn", "points:0", *delta).expect("increment");
        }
        prop_assert_eq!(last, deltas.iter().sum::<i64>());
        prop_assert_eq!(counters.get("rate", "tn", "points:0").expect("read"), last);
    }
}
