use std::{collections::HashSet, sync::Arc};

use strand::storage::*;
use tempfile::TempDir;

fn make_test_store() -> (Arc<dyn Storage>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = make_rocksdb_store(dir.path().to_str().unwrap()).unwrap();
    (Arc::new(store), dir)
}

fn make_memory() -> Arc<dyn Storage> {
    Arc::new(make_memory_store())
}

async fn single_partition(store: &Arc<dyn Storage>, name: &str) -> PartitionId {
    let topic = store.create_topic(name, 1, 1).await.unwrap();
    topic.partitions[0].id
}

async fn fail(store: &Arc<dyn Storage>, msg: &MessageRecord, at: u64) -> MessageRecord {
    let mut next = msg.clone();
    next.status = MessageStatus::Failed;
    next.attempt_count += 1;
    next.last_attempt_at = Some(at);
    assert!(store.compare_and_swap_message(msg, &next, None).await.unwrap());
    next
}

// ---------------- shared behaviour, run against both stores ----------------

async fn check_append_and_read(store: Arc<dyn Storage>) {
    let p = single_partition(&store, "t1").await;

    let m0 = store.append(p, b"hello", 10).await.unwrap();
    let m1 = store.append(p, b"world", 11).await.unwrap();

    assert_eq!(m0.offset, 0);
    assert_eq!(m1.offset, 1);
    assert_eq!(m0.status, MessageStatus::Pending);
    assert_eq!(m0.attempt_count, 0);

    let msgs = store.read_log(p, 0, 10).await.unwrap();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].payload, b"hello");
    assert_eq!(msgs[1].payload, b"world");

    let tail = store.read_log(p, 1, 10).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].id, m1.id);

    assert_eq!(store.message(m0.id).await.unwrap(), Some(m0));
}

async fn check_topic_catalog(store: Arc<dyn Storage>) {
    let orders = store.create_topic("orders", 3, 1).await.unwrap();
    let numbers: Vec<_> = orders.partitions.iter().map(|p| p.number).collect();
    assert_eq!(numbers, vec![0, 1, 2]);

    store.create_topic("audit", 1, 2).await.unwrap();

    let err = store.create_topic("orders", 5, 3).await.unwrap_err();
    assert!(matches!(err, StorageError::TopicExists(_)));

    let names: Vec<_> = store
        .list_topics()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["orders", "audit"]);

    // the failed duplicate left nothing behind
    let orders_again = store.topic_by_name("orders").await.unwrap().unwrap();
    assert_eq!(orders_again, orders);
    assert!(store.topic_by_name("missing").await.unwrap().is_none());
}

async fn check_cas_and_indexes(store: Arc<dyn Storage>) {
    let p = single_partition(&store, "t").await;
    let a = store.append(p, b"a", 1).await.unwrap();
    let b = store.append(p, b"b", 1).await.unwrap();

    let b_failed = fail(&store, &b, 100).await;
    let a_failed = fail(&store, &a, 200).await;

    // stale snapshot is refused
    assert!(!store.compare_and_swap_message(&a, &a_failed, None).await.unwrap());

    // oldest last attempt first
    let batch = store.failed_batch(10).await.unwrap();
    let ids: Vec<_> = batch.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![b.id, a.id]);

    // requeue b -> shows up as redeliverable
    let mut b_pending = b_failed.clone();
    b_pending.status = MessageStatus::Pending;
    assert!(
        store
            .compare_and_swap_message(&b_failed, &b_pending, None)
            .await
            .unwrap()
    );
    let redeliver = store.redeliverable(p, 10).await.unwrap();
    assert_eq!(redeliver.len(), 1);
    assert_eq!(redeliver[0].id, b.id);

    let batch = store.failed_batch(10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, a.id);

    assert!(store.failed_batch(0).await.unwrap().is_empty());

    // dead-letter a together with the status change
    let mut a_dead = a_failed.clone();
    a_dead.status = MessageStatus::Dead;
    a_dead.attempt_count += 1;
    let dl = DeadLetterRecord {
        message_id: a.id,
        partition_id: p,
        offset: a.offset,
        payload: a.payload.clone(),
        dead_at: 300,
    };
    assert!(
        store
            .compare_and_swap_message(&a_failed, &a_dead, Some(&dl))
            .await
            .unwrap()
    );
    assert!(store.failed_batch(10).await.unwrap().is_empty());
    assert_eq!(store.dead_letters(10).await.unwrap(), vec![dl]);

    let counts = store.status_counts(3).await.unwrap();
    assert_eq!(
        counts,
        StatusCounts {
            total: 2,
            pending: 1,
            acknowledged: 0,
            failed_retryable: 0,
            dead_letters: 1,
        }
    );
}

async fn check_concurrent_appends(store: Arc<dyn Storage>) {
    const TASKS: usize = 8;
    const PER_TASK: usize = 50;

    let p = single_partition(&store, "hot").await;

    let mut handles = Vec::new();
    for t in 0..TASKS {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut offs = Vec::with_capacity(PER_TASK);
            for i in 0..PER_TASK {
                let payload = format!("{t}-{i}");
                offs.push(store.append(p, payload.as_bytes(), 1).await.unwrap().offset);
            }
            offs
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    all.sort_unstable();

    let expected: Vec<u64> = (0..(TASKS * PER_TASK) as u64).collect();
    assert_eq!(all, expected);

    let stored: Vec<u64> = store
        .read_log(p, 0, TASKS * PER_TASK + 10)
        .await
        .unwrap()
        .iter()
        .map(|m| m.offset)
        .collect();
    assert_eq!(stored, expected);
}

async fn check_group_get_or_create(store: Arc<dyn Storage>) {
    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(
            async move { store.resolve_group("billing").await.unwrap() },
        ));
    }

    let mut ids = HashSet::new();
    for h in handles {
        ids.insert(h.await.unwrap().id);
    }
    assert_eq!(ids.len(), 1);

    let other = store.resolve_group("shipping").await.unwrap();
    assert!(!ids.contains(&other.id));
}

async fn check_cursor_monotonic(store: Arc<dyn Storage>) {
    let p = single_partition(&store, "t").await;
    let g = store.resolve_group("g").await.unwrap().id;

    assert_eq!(store.cursor(g, p).await.unwrap(), None);

    let mut offsets: Vec<u64> = (0..100).collect();
    fastrand::shuffle(&mut offsets);

    let mut high = 0;
    for off in offsets {
        let stored = store.advance_cursor(g, p, off).await.unwrap();
        high = high.max(off);
        assert_eq!(stored, high);
        assert_eq!(store.cursor(g, p).await.unwrap(), Some(high));
    }
}

// ---------------- rocksdb ----------------

#[tokio::test]
async fn append_and_read() {
    let (store, _dir) = make_test_store();
    check_append_and_read(store).await;
}

#[tokio::test]
async fn append_to_unknown_partition() {
    let (store, _dir) = make_test_store();
    let err = store
        .append(uuid::Uuid::new_v4(), b"x", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::PartitionNotFound(_)));
}

#[tokio::test]
async fn topic_catalog() {
    let (store, _dir) = make_test_store();
    check_topic_catalog(store).await;
}

#[tokio::test]
async fn compare_and_swap_maintains_indexes() {
    let (store, _dir) = make_test_store();
    check_cas_and_indexes(store).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_are_gap_free() {
    let (store, _dir) = make_test_store();
    check_concurrent_appends(store).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_group_resolution() {
    let (store, _dir) = make_test_store();
    check_group_get_or_create(store).await;
}

#[tokio::test]
async fn cursor_never_regresses() {
    let (store, _dir) = make_test_store();
    check_cursor_monotonic(store).await;
}

#[tokio::test]
async fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();

    let (partition, first) = {
        let store = make_rocksdb_store(&path).unwrap();
        let topic = store.create_topic("durable", 2, 1).await.unwrap();
        let p = topic.partitions[1].id;
        store.append(p, b"one", 1).await.unwrap();
        let first = store.append(p, b"two", 1).await.unwrap();
        let g = store.resolve_group("g").await.unwrap();
        store.advance_cursor(g.id, p, 1).await.unwrap();
        (p, first)
    };

    let store = make_rocksdb_store(&path).unwrap();
    let topic = store.topic_by_name("durable").await.unwrap().unwrap();
    assert_eq!(topic.partitions.len(), 2);
    assert_eq!(store.message(first.id).await.unwrap(), Some(first));

    // offsets continue where they left off
    let third = store.append(partition, b"three", 2).await.unwrap();
    assert_eq!(third.offset, 2);

    let g = store.resolve_group("g").await.unwrap();
    assert_eq!(store.cursor(g.id, partition).await.unwrap(), Some(1));
}

// ---------------- memory ----------------

#[tokio::test]
async fn memory_append_and_read() {
    check_append_and_read(make_memory()).await;
}

#[tokio::test]
async fn memory_topic_catalog() {
    check_topic_catalog(make_memory()).await;
}

#[tokio::test]
async fn memory_compare_and_swap_maintains_indexes() {
    check_cas_and_indexes(make_memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_concurrent_appends_are_gap_free() {
    check_concurrent_appends(make_memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_concurrent_group_resolution() {
    check_group_get_or_create(make_memory()).await;
}

#[tokio::test]
async fn memory_cursor_never_regresses() {
    check_cursor_monotonic(make_memory()).await;
}
