//! An in-process Cluster used by tests and `mem://` connection strings.
//! It models just enough of a sharded cluster for the load data-plane:
//! sharding enablement, even pre-splitting of hashed key spaces, explicit
//! split points for ranged keys, per-shard document storage, and injected
//! connection failures.

use crate::{
    Chunk, ChunkId, ChunkMap, Cluster, KeyBound, Namespace, ShardId, WriteConcern, WriteConn,
    WriteError,
};
use anyhow::Context;
use keys::{KeySpec, ShardKey};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How an injected connection behaves on write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailMode {
    /// Every write fails with a retryable error.
    Transient,
    /// Every write is rejected with a non-retryable error.
    Rejected,
}

#[derive(Default)]
struct CollectionState {
    key: Option<KeySpec>,
    unique: bool,
    total_chunks: Option<u32>,
    splits: Option<Vec<ShardKey>>,
}

#[derive(Default)]
struct State {
    sharded_databases: Vec<String>,
    collections: HashMap<String, CollectionState>,
    balancer_stopped: bool,
}

struct Shared {
    shards: Vec<ShardId>,
    state: Mutex<State>,
    // Documents stored per (namespace, shard).
    docs: Mutex<HashMap<(String, ShardId), Vec<Value>>>,
    // Documents written through each connection ordinal.
    writes_by_conn: Mutex<HashMap<usize, u64>>,
    fail: Mutex<HashMap<usize, FailMode>>,
    conn_seq: AtomicUsize,
    misroutes: AtomicU64,
}

pub struct MemCluster {
    shared: Arc<Shared>,
    direct_load: bool,
}

impl std::fmt::Debug for MemCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemCluster").finish_non_exhaustive()
    }
}

impl MemCluster {
    pub fn new(num_shards: usize, direct_load: bool) -> Self {
        let shards = (0..num_shards.max(1))
            .map(|i| ShardId::new(format!("shard-{i}")))
            .collect();

        Self {
            shared: Arc::new(Shared {
                shards,
                state: Default::default(),
                docs: Default::default(),
                writes_by_conn: Default::default(),
                fail: Default::default(),
                conn_seq: AtomicUsize::new(0),
                misroutes: AtomicU64::new(0),
            }),
            direct_load,
        }
    }

    /// Build from a `mem://` URL, e.g. `mem://local?shards=2`.
    pub fn from_url(url: &url::Url, direct_load: bool) -> Self {
        let num_shards = url
            .query_pairs()
            .find(|(k, _)| k == "shards")
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(1);

        Self::new(num_shards, direct_load)
    }

    pub fn direct_load(&self) -> bool {
        self.direct_load
    }

    /// Preset explicit split points for a ranged (non-hashed) key, in
    /// place of the data-driven splitting a real cluster would perform.
    pub fn set_split_points(&self, ns: &Namespace, splits: Vec<ShardKey>) {
        let mut state = self.shared.state.lock().unwrap();
        state.collections.entry(ns.to_string()).or_default().splits = Some(splits);
    }

    /// Make the connection with the given ordinal (in `connect()` order)
    /// fail all subsequent writes.
    pub fn fail_connection(&self, ordinal: usize, mode: FailMode) {
        self.shared.fail.lock().unwrap().insert(ordinal, mode);
    }

    pub fn balancer_stopped(&self) -> bool {
        self.shared.state.lock().unwrap().balancer_stopped
    }

    /// Total documents stored for the namespace, across shards.
    pub fn doc_count(&self, ns: &Namespace) -> usize {
        let docs = self.shared.docs.lock().unwrap();
        docs.iter()
            .filter(|((n, _), _)| *n == ns.to_string())
            .map(|(_, v)| v.len())
            .sum()
    }

    /// Documents stored for the namespace on one shard.
    pub fn shard_docs(&self, ns: &Namespace, shard: &ShardId) -> Vec<Value> {
        let docs = self.shared.docs.lock().unwrap();
        docs.get(&(ns.to_string(), shard.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Documents written through the given connection ordinal.
    pub fn writes_by_conn(&self, ordinal: usize) -> u64 {
        *self
            .shared
            .writes_by_conn
            .lock()
            .unwrap()
            .get(&ordinal)
            .unwrap_or(&0)
    }

    /// Documents which arrived at a shard whose chunks do not cover
    /// their shard key. Always zero for a correct data plane.
    pub fn misroutes(&self) -> u64 {
        self.shared.misroutes.load(AtomicOrdering::Relaxed)
    }

    fn build_chunk_map(shared: &Shared, ns: &Namespace, spec: &KeySpec) -> anyhow::Result<ChunkMap> {
        let state = shared.state.lock().unwrap();
        let coll = state
            .collections
            .get(&ns.to_string())
            .with_context(|| format!("namespace {ns} is not sharded"))?;

        let mut bounds = vec![KeyBound::Min];

        if spec.is_hashed() {
            let total = coll.total_chunks.unwrap_or(shared.shards.len() as u32) as usize;
            let step = (u64::MAX / total as u64).max(1);
            for k in 1..total {
                let split = i64::MIN.wrapping_add((step * k as u64) as i64);
                bounds.push(KeyBound::Key(ShardKey::from(vec![Value::from(split)])));
            }
        } else if let Some(splits) = &coll.splits {
            let mut splits = splits.clone();
            splits.sort_by(|l, r| spec.compare(l, r));
            bounds.extend(splits.into_iter().map(KeyBound::Key));
        }
        bounds.push(KeyBound::Max);

        let chunks = bounds
            .windows(2)
            .enumerate()
            .map(|(i, w)| Chunk {
                id: ChunkId::new(format!("chunk-{i}")),
                shard: shared.shards[i % shared.shards.len()].clone(),
                min: w[0].clone(),
                max: w[1].clone(),
            })
            .collect();

        Ok(ChunkMap::new(spec.clone(), chunks)?)
    }
}

impl Cluster for MemCluster {
    fn shards(&self) -> anyhow::Result<Vec<ShardId>> {
        Ok(self.shared.shards.clone())
    }

    fn is_sharded(&self, ns: &Namespace) -> anyhow::Result<bool> {
        let state = self.shared.state.lock().unwrap();
        Ok(state
            .collections
            .get(&ns.to_string())
            .map(|c| c.key.is_some())
            .unwrap_or(false))
    }

    fn enable_sharding(&self, database: &str) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if !state.sharded_databases.iter().any(|d| d == database) {
            state.sharded_databases.push(database.to_string());
        }
        Ok(())
    }

    fn shard_collection(
        &self,
        ns: &Namespace,
        key: &KeySpec,
        unique: bool,
        total_chunks: Option<u32>,
    ) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if !state.sharded_databases.iter().any(|d| *d == ns.database) {
            anyhow::bail!("sharding is not enabled for database {:?}", ns.database);
        }

        let coll = state.collections.entry(ns.to_string()).or_default();
        coll.key = Some(key.clone());
        coll.unique = unique;
        coll.total_chunks = total_chunks;
        Ok(())
    }

    fn stop_balancer(&self, _timeout: Duration) -> anyhow::Result<()> {
        self.shared.state.lock().unwrap().balancer_stopped = true;
        Ok(())
    }

    fn wait_chunks_per_shard(
        &self,
        ns: &Namespace,
        per_shard: usize,
        _timeout: Duration,
    ) -> anyhow::Result<()> {
        let spec = {
            let state = self.shared.state.lock().unwrap();
            state
                .collections
                .get(&ns.to_string())
                .and_then(|c| c.key.clone())
                .with_context(|| format!("namespace {ns} is not sharded"))?
        };
        let map = Self::build_chunk_map(&self.shared, ns, &spec)?;

        for shard in &self.shared.shards {
            let owned = map.chunks().iter().filter(|c| c.shard == *shard).count();
            if owned < per_shard {
                anyhow::bail!("shard {shard} owns {owned} chunks of {ns}, want {per_shard}");
            }
        }
        Ok(())
    }

    fn drop_database(&self, database: &str) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        state
            .collections
            .retain(|ns, _| !ns.starts_with(&format!("{database}.")));
        state.sharded_databases.retain(|d| d != database);
        drop(state);

        let mut docs = self.shared.docs.lock().unwrap();
        docs.retain(|(ns, _), _| !ns.starts_with(&format!("{database}.")));
        Ok(())
    }

    fn drop_collection(&self, ns: &Namespace) -> anyhow::Result<()> {
        self.shared
            .state
            .lock()
            .unwrap()
            .collections
            .remove(&ns.to_string());
        let mut docs = self.shared.docs.lock().unwrap();
        docs.retain(|(n, _), _| *n != ns.to_string());
        Ok(())
    }

    fn drop_indexes(&self, _ns: &Namespace) -> anyhow::Result<()> {
        Ok(())
    }

    fn chunk_map(&self, ns: &Namespace, spec: &KeySpec) -> anyhow::Result<ChunkMap> {
        Self::build_chunk_map(&self.shared, ns, spec)
    }

    fn connect(&self, shard: &ShardId) -> anyhow::Result<Box<dyn WriteConn>> {
        if !self.shared.shards.contains(shard) {
            anyhow::bail!("unknown shard {shard}");
        }
        let ordinal = self.shared.conn_seq.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::debug!(%shard, ordinal, "opened shard connection");

        Ok(Box::new(MemConn {
            shared: self.shared.clone(),
            shard: shard.clone(),
            ordinal,
            routing: None,
        }))
    }
}

struct MemConn {
    shared: Arc<Shared>,
    shard: ShardId,
    ordinal: usize,
    // Lazily-built chunk map used to verify that arriving documents
    // belong on this shard.
    routing: Option<ChunkMap>,
}

impl WriteConn for MemConn {
    fn write(
        &mut self,
        ns: &Namespace,
        docs: &[Value],
        _concern: &WriteConcern,
    ) -> Result<(), WriteError> {
        match self.shared.fail.lock().unwrap().get(&self.ordinal).copied() {
            Some(FailMode::Transient) => {
                return Err(WriteError::Retryable(anyhow::anyhow!(
                    "injected network failure on connection {}",
                    self.ordinal
                )));
            }
            Some(FailMode::Rejected) => {
                return Err(WriteError::Fatal(anyhow::anyhow!(
                    "injected write rejection on connection {}",
                    self.ordinal
                )));
            }
            None => (),
        }

        if self.routing.is_none() {
            let spec = {
                let state = self.shared.state.lock().unwrap();
                state
                    .collections
                    .get(&ns.to_string())
                    .and_then(|c| c.key.clone())
            };
            if let Some(spec) = spec {
                self.routing = MemCluster::build_chunk_map(&self.shared, ns, &spec).ok();
            }
        }
        if let Some(map) = &self.routing {
            for doc in docs {
                let routed = map
                    .spec()
                    .extract(doc)
                    .ok()
                    .and_then(|key| map.route(&key).map(|c| c.shard.clone()));
                if routed.as_ref() != Some(&self.shard) {
                    self.shared.misroutes.fetch_add(1, AtomicOrdering::Relaxed);
                }
            }
        }

        let mut store = self.shared.docs.lock().unwrap();
        store
            .entry((ns.to_string(), self.shard.clone()))
            .or_default()
            .extend_from_slice(docs);
        drop(store);

        *self
            .shared
            .writes_by_conn
            .lock()
            .unwrap()
            .entry(self.ordinal)
            .or_default() += docs.len() as u64;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn sharded_fixture(shards: usize, chunks: u32) -> (MemCluster, Namespace, KeySpec) {
        let cluster = MemCluster::new(shards, false);
        let ns = Namespace::new("db", "events");
        let spec = KeySpec::parse(r#"{"user_id": "hashed"}"#).unwrap();

        cluster.enable_sharding("db").unwrap();
        cluster
            .shard_collection(&ns, &spec, false, Some(chunks))
            .unwrap();
        (cluster, ns, spec)
    }

    #[test]
    fn test_hashed_presplit_distributes_chunks() {
        let (cluster, ns, spec) = sharded_fixture(2, 8);
        let map = cluster.chunk_map(&ns, &spec).unwrap();

        assert_eq!(map.chunks().len(), 8);
        for shard in cluster.shards().unwrap() {
            let owned = map.chunks().iter().filter(|c| c.shard == shard).count();
            assert_eq!(owned, 4);
        }
        cluster
            .wait_chunks_per_shard(&ns, 4, Duration::from_secs(1))
            .unwrap();
    }

    #[test]
    fn test_every_hashed_key_routes() {
        let (cluster, ns, spec) = sharded_fixture(2, 8);
        let map = cluster.chunk_map(&ns, &spec).unwrap();

        for i in 0..1000 {
            let key = spec.extract(&json!({"user_id": i})).unwrap();
            assert!(map.route(&key).is_some(), "key {i} did not route");
        }
    }

    #[test]
    fn test_shard_collection_requires_enabled_database() {
        let cluster = MemCluster::new(1, false);
        let ns = Namespace::new("db", "events");
        let spec = KeySpec::parse(r#"{"k": 1}"#).unwrap();

        assert!(cluster.shard_collection(&ns, &spec, false, None).is_err());
    }

    #[test]
    fn test_drop_operations() {
        let (cluster, ns, _spec) = sharded_fixture(1, 1);
        let shard = cluster.shards().unwrap().remove(0);

        let mut conn = cluster.connect(&shard).unwrap();
        conn.write(&ns, &[json!({"user_id": 1})], &WriteConcern::default())
            .unwrap();
        assert_eq!(cluster.doc_count(&ns), 1);

        cluster.drop_collection(&ns).unwrap();
        assert_eq!(cluster.doc_count(&ns), 0);
        assert!(!cluster.is_sharded(&ns).unwrap());

        cluster.drop_database("db").unwrap();
        assert!(cluster
            .shard_collection(&ns, &KeySpec::parse(r#"{"k": 1}"#).unwrap(), false, None)
            .is_err());
    }

    #[test]
    fn test_write_and_failure_injection() {
        let (cluster, ns, _spec) = sharded_fixture(1, 1);
        let shard = cluster.shards().unwrap().remove(0);

        let mut healthy = cluster.connect(&shard).unwrap();
        let mut failing = cluster.connect(&shard).unwrap();
        cluster.fail_connection(1, FailMode::Transient);

        healthy
            .write(&ns, &[json!({"user_id": 1})], &WriteConcern::default())
            .unwrap();
        let err = failing
            .write(&ns, &[json!({"user_id": 2})], &WriteConcern::default())
            .unwrap_err();

        assert!(matches!(err, WriteError::Retryable(_)));
        assert_eq!(cluster.doc_count(&ns), 1);
        assert_eq!(cluster.writes_by_conn(0), 1);
        assert_eq!(cluster.writes_by_conn(1), 0);
        assert_eq!(cluster.misroutes(), 0);
    }
}
