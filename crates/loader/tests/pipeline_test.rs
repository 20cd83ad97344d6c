use cluster::mem::{FailMode, MemCluster};
use cluster::{Cluster, Namespace, ShardId};
use keys::KeySpec;
use loader::{BoundedQueue, DocSink, LoadSettings, Loader, QueuePlan};
use serde_json::json;
use std::sync::Arc;

fn base_settings(ns: &Namespace, plan: &str, key: Option<&str>) -> LoadSettings {
    let mut settings = LoadSettings::new(ns.clone());
    settings.queue_plan = QueuePlan::parse(plan).unwrap();
    if let Some(key) = key {
        settings.sharded = true;
        settings.shard_key = Some(KeySpec::parse(key).unwrap());
    }
    // Deterministic worker counts, independent of the host.
    settings.batcher.threads = 4;
    settings
}

fn feed_ints(sink: &DocSink, field: &str, values: impl Iterator<Item = i64>) -> anyhow::Result<()> {
    for v in values {
        sink.push(json!({ field: v, "payload": format!("doc-{v}") }))
            .map_err(|_| anyhow::anyhow!("document sink is closed"))?;
    }
    sink.end_wait();
    Ok(())
}

fn stored_field(cluster: &MemCluster, ns: &Namespace, shard: &ShardId, field: &str) -> Vec<i64> {
    cluster
        .shard_docs(ns, shard)
        .iter()
        .map(|doc| doc[field].as_i64().unwrap())
        .collect()
}

#[test]
fn test_single_shard_ram_load_sorts_on_finalize() {
    let cluster = Arc::new(MemCluster::new(1, false));
    let ns = Namespace::new("db", "events");

    let mut settings = base_settings(&ns, r#"{"ram": 1}"#, Some(r#"{"k": 1}"#));
    settings.batch_size = 500;
    // A single connection keeps arrival order observable.
    settings.end_point.thread_count = 1;

    let loader = Loader::new(cluster.clone(), settings).unwrap();
    let outcome = loader
        .run(|sink| feed_ints(&sink, "k", 1..=10_000))
        .unwrap();

    assert_eq!(outcome.stats.accepted, 10_000);
    assert_eq!(outcome.stats.rejected, 0);
    assert_eq!(outcome.stats.batches_sealed, 20);
    assert_eq!(outcome.stats.write_attempt_docs, 10_000);
    assert_eq!(outcome.stats.docs_written, 10_000);
    assert_eq!(cluster.doc_count(&ns), 10_000);
    assert_eq!(cluster.misroutes(), 0);

    // The ram strategy sorts everything it buffered before flushing.
    let shard = cluster.shards().unwrap().remove(0);
    let ks = stored_field(&cluster, &ns, &shard, "k");
    assert_eq!(ks.len(), 10_000);
    assert!(ks.windows(2).all(|w| w[0] <= w[1]), "store is not sorted");
    assert_eq!(ks[0], 1);
    assert_eq!(ks[9_999], 10_000);
}

#[test]
fn test_two_shard_hashed_load_distributes() {
    let cluster = Arc::new(MemCluster::new(2, false));
    let ns = Namespace::new("db", "users");

    let mut settings = base_settings(&ns, r#"{"direct": 4}"#, Some(r#"{"user_id": "hashed"}"#));
    settings.batch_size = 100;

    let loader = Loader::new(cluster.clone(), settings).unwrap();
    let outcome = loader
        .run(|sink| feed_ints(&sink, "user_id", 0..20_000))
        .unwrap();

    assert_eq!(outcome.stats.accepted, 20_000);
    assert_eq!(outcome.stats.docs_written, 20_000);
    assert_eq!(cluster.doc_count(&ns), 20_000);
    assert_eq!(cluster.misroutes(), 0);

    // A uniform hashed key splits the load roughly evenly.
    for shard in cluster.shards().unwrap() {
        let docs = cluster.shard_docs(&ns, &shard).len();
        assert!(
            (6_000..=14_000).contains(&docs),
            "shard {shard} holds {docs} of 20000 documents"
        );
    }
}

#[test]
fn test_waterfall_interleaves_shards() {
    let cluster = MemCluster::new(2, false);
    let ns = Namespace::new("db", "users");
    let spec = KeySpec::parse(r#"{"user_id": "hashed"}"#).unwrap();

    cluster.enable_sharding("db").unwrap();
    cluster.shard_collection(&ns, &spec, false, Some(8)).unwrap();
    let map = cluster.chunk_map(&ns, &spec).unwrap();

    let settings = base_settings(&ns, r#"{"direct": 4}"#, None);

    let stats = Arc::new(loader::LoadStats::default());
    let mut pools = std::collections::HashMap::new();
    for shard in map.shards() {
        let pool = loader::EndPointPool::start(
            &cluster,
            shard.clone(),
            ns.clone(),
            Default::default(),
            &settings.end_point,
            stats.clone(),
        )
        .unwrap();
        pools.insert(shard, pool);
    }

    let dispatcher = loader::Dispatcher::new(&map, &pools, &settings, 1 << 30, stats);
    let order: Vec<(String, usize)> = dispatcher
        .waterfall()
        .iter()
        .map(|slot| (slot.shard.to_string(), slot.index))
        .collect();

    // A shard's i-th slot precedes its (i+1)-th, and shards alternate.
    assert_eq!(
        order,
        vec![
            ("shard-0".to_string(), 0),
            ("shard-1".to_string(), 0),
            ("shard-0".to_string(), 1),
            ("shard-1".to_string(), 1),
            ("shard-0".to_string(), 2),
            ("shard-1".to_string(), 2),
            ("shard-0".to_string(), 3),
            ("shard-1".to_string(), 3),
        ]
    );

    for pool in pools.values() {
        pool.end_wait();
        pool.join();
    }
}

#[test]
fn test_inbox_backpressure() {
    let inbox = Arc::new(BoundedQueue::new(4));
    let sink = DocSink::new(inbox.clone());
    let pushed = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    // The batcher pool is "paused": nothing consumes the inbox.
    let producer = {
        let (sink, pushed) = (sink.clone(), pushed.clone());
        std::thread::spawn(move || {
            for i in 0..10 {
                sink.push(json!({"k": i})).unwrap();
                pushed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        })
    };

    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(pushed.load(std::sync::atomic::Ordering::SeqCst), 4);

    // The first pop unblocks the producer immediately.
    assert!(inbox.pop().is_some());
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert!(pushed.load(std::sync::atomic::Ordering::SeqCst) >= 5);

    // Drain the remaining nine documents; each blocked push resumes as
    // its slot frees.
    for _ in 0..9 {
        assert!(inbox.pop().is_some());
    }
    producer.join().unwrap();
    assert_eq!(pushed.load(std::sync::atomic::Ordering::SeqCst), 10);
    assert!(inbox.is_empty());
}

#[test]
fn test_degraded_connection_is_evicted_without_loss() {
    let cluster = Arc::new(MemCluster::new(1, false));
    let ns = Namespace::new("db", "events");
    // Connections are handed ordinals in connect() order; the pool's
    // second connection fails every write.
    cluster.fail_connection(1, FailMode::Transient);

    let mut settings = base_settings(&ns, r#"{"direct": 1}"#, Some(r#"{"k": 1}"#));
    settings.batch_size = 50;
    settings.end_point.thread_count = 3;
    settings.end_point.max_retries = 2;

    let loader = Loader::new(cluster.clone(), settings).unwrap();
    let outcome = loader.run(|sink| feed_ints(&sink, "k", 0..3_000)).unwrap();

    // Every document lands despite the failing connection.
    assert_eq!(outcome.stats.accepted, 3_000);
    assert_eq!(outcome.stats.write_attempt_docs, 3_000);
    assert_eq!(outcome.stats.docs_written, 3_000);
    assert_eq!(outcome.stats.fatal_docs, 0);
    assert_eq!(outcome.stats.evicted_connections, 1);
    assert!(outcome.stats.retries >= 2);

    assert_eq!(cluster.doc_count(&ns), 3_000);
    assert_eq!(cluster.writes_by_conn(1), 0);
    assert_eq!(
        cluster.writes_by_conn(0) + cluster.writes_by_conn(2),
        3_000
    );
}

#[test]
fn test_graceful_shutdown_accounts_everything() {
    let cluster = Arc::new(MemCluster::new(2, false));
    let ns = Namespace::new("db", "events");

    let mut settings = base_settings(&ns, r#"{"direct": 2}"#, Some(r#"{"k": "hashed"}"#));
    settings.batch_size = 64;

    let loader = Loader::new(cluster.clone(), settings).unwrap();
    let outcome = loader.run(|sink| feed_ints(&sink, "k", 0..1_000)).unwrap();

    // run() returning means every worker joined; the counters prove
    // every queue drained.
    assert_eq!(outcome.stats.accepted, 1_000);
    assert_eq!(outcome.stats.docs_written, 1_000);
    assert_eq!(outcome.stats.fatal_docs, 0);
    assert_eq!(cluster.doc_count(&ns), 1_000);
    assert!(cluster.balancer_stopped());
}

#[test]
fn test_disk_strategy_spills_and_merges_sorted() {
    let cluster = Arc::new(MemCluster::new(1, false));
    let ns = Namespace::new("db", "events");
    let work = tempfile::tempdir().unwrap();

    let mut settings = base_settings(&ns, r#"{"disk": 1}"#, Some(r#"{"k": 1}"#));
    settings.batch_size = 100;
    settings.work_path = Some(work.path().to_path_buf());
    // Spill on every sealed batch.
    settings.ram_max = Some(1);
    settings.end_point.thread_count = 1;

    let loader = Loader::new(cluster.clone(), settings).unwrap();
    let outcome = loader
        .run(|sink| feed_ints(&sink, "k", (1..=2_000).rev()))
        .unwrap();

    assert_eq!(outcome.stats.accepted, 2_000);
    assert_eq!(outcome.stats.docs_written, 2_000);
    assert!(outcome.stats.spilled_runs >= 1, "no run was spilled");
    assert_eq!(cluster.doc_count(&ns), 2_000);

    // The merge of spilled runs and the in-memory remainder is sorted.
    let shard = cluster.shards().unwrap().remove(0);
    let ks = stored_field(&cluster, &ns, &shard, "k");
    assert!(ks.windows(2).all(|w| w[0] <= w[1]), "store is not sorted");
}

#[test]
fn test_documents_missing_key_fields_are_rejected() {
    let cluster = Arc::new(MemCluster::new(1, false));
    let ns = Namespace::new("db", "events");

    let settings = base_settings(&ns, r#"{"direct": 1}"#, Some(r#"{"k": 1}"#));
    let loader = Loader::new(cluster.clone(), settings).unwrap();

    let outcome = loader
        .run(|sink| {
            for i in 0..10 {
                let doc = if i % 3 == 0 {
                    json!({"other": i})
                } else {
                    json!({"k": i})
                };
                sink.push(doc)
                    .map_err(|_| anyhow::anyhow!("document sink is closed"))?;
            }
            sink.end_wait();
            Ok(())
        })
        .unwrap();

    assert_eq!(outcome.stats.rejected, 4);
    assert_eq!(outcome.stats.accepted, 6);
    assert_eq!(outcome.stats.docs_written, 6);
    assert_eq!(cluster.doc_count(&ns), 6);
}

#[test]
fn test_add_id_synthesizes_missing_ids() {
    let cluster = Arc::new(MemCluster::new(1, false));
    let ns = Namespace::new("db", "events");

    let mut settings = base_settings(&ns, r#"{"direct": 1}"#, Some(r#"{"_id": 1}"#));
    settings.add_id = true;

    let loader = Loader::new(cluster.clone(), settings).unwrap();
    let outcome = loader
        .run(|sink| {
            for i in 0..100 {
                sink.push(json!({"n": i}))
                    .map_err(|_| anyhow::anyhow!("document sink is closed"))?;
            }
            sink.end_wait();
            Ok(())
        })
        .unwrap();

    assert_eq!(outcome.stats.accepted, 100);
    assert_eq!(outcome.stats.docs_written, 100);

    let shard = cluster.shards().unwrap().remove(0);
    for doc in cluster.shard_docs(&ns, &shard) {
        assert!(doc["_id"].is_string(), "missing synthesized _id: {doc}");
    }
}

#[test]
fn test_unsharded_load_uses_single_chunk() {
    let cluster = Arc::new(MemCluster::new(2, false));
    let ns = Namespace::new("db", "plain");

    let settings = base_settings(&ns, r#"{"direct": 1}"#, None);
    let loader = Loader::new(cluster.clone(), settings).unwrap();
    let outcome = loader.run(|sink| feed_ints(&sink, "v", 0..500)).unwrap();

    assert_eq!(outcome.stats.accepted, 500);
    assert_eq!(outcome.stats.docs_written, 500);
    // Everything lands on the primary shard.
    let shards = cluster.shards().unwrap();
    assert_eq!(cluster.shard_docs(&ns, &shards[0]).len(), 500);
    assert_eq!(cluster.shard_docs(&ns, &shards[1]).len(), 0);
}

#[test]
fn test_sharded_load_requires_key() {
    let cluster = Arc::new(MemCluster::new(1, false));
    let mut settings = base_settings(&Namespace::new("db", "events"), r#"{"direct": 1}"#, None);
    settings.sharded = true;

    // The pipeline never starts: construction fails.
    assert!(matches!(
        Loader::new(cluster, settings),
        Err(loader::Error::Config(_))
    ));
}
