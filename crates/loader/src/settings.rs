use cluster::{Namespace, WriteConcern};
use keys::KeySpec;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("a shard key is required to load a sharded collection")]
    MissingShardKey,
    #[error(transparent)]
    ShardKey(#[from] keys::Error),
    #[error("failed to parse load queue document")]
    QueueJson(#[from] serde_json::Error),
    #[error("unknown load queue strategy {0:?}")]
    UnknownStrategy(String),
    #[error("load queue strategy {strategy:?} has non-numeric count {value}")]
    BadQueueCount { strategy: String, value: Value },
    #[error("at least one load queue must be configured")]
    NoQueues,
    #[error("{requested} batcher threads leave fewer than one of {available} available")]
    InsufficientThreads { requested: i64, available: usize },
    #[error("the disk queue strategy requires a work path")]
    MissingWorkPath,
    #[error("end point thread count must be positive")]
    NoEndPoints,
}

/// How a chunk's queue slot treats sealed batches.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Buffer in memory; finalization sorts by shard key before flushing.
    Ram,
    /// Forward to the shard's end points as batches seal.
    Direct,
    /// Buffer in memory, spilling sorted runs to the work path under
    /// memory pressure; finalization merges and flushes.
    Disk,
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "ram" => Ok(Strategy::Ram),
            "direct" => Ok(Strategy::Direct),
            "disk" => Ok(Strategy::Disk),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Strategy::Ram => "ram",
            Strategy::Direct => "direct",
            Strategy::Disk => "disk",
        })
    }
}

/// QueuePlan is the expansion of the configured `{strategy: count}`
/// document into an ordered ring of strategies. A shard's i-th chunk is
/// served with the ring's `i mod len` entry, and the ring length is the
/// number of chunks each shard is pre-split into.
#[derive(Debug, Clone)]
pub struct QueuePlan {
    ring: Vec<Strategy>,
    describe: String,
}

impl QueuePlan {
    /// Parse a plan such as `{"ram": 2, "disk": 1}`. Declaration order
    /// is preserved.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut de = serde_json::Deserializer::from_str(text);
        let entries = serde::de::Deserializer::deserialize_map(&mut de, ObjectInOrder)?;

        let mut ring = Vec::new();
        let mut describe = Vec::new();
        for (name, value) in entries {
            let strategy: Strategy = name.parse()?;
            let count = match value.as_u64() {
                Some(n) => n as usize,
                None => {
                    return Err(ConfigError::BadQueueCount {
                        strategy: name,
                        value,
                    })
                }
            };
            describe.push(format!("{strategy}:{count}"));
            ring.extend(std::iter::repeat(strategy).take(count));
        }
        if ring.is_empty() {
            return Err(ConfigError::NoQueues);
        }

        Ok(Self {
            ring,
            describe: describe.join(","),
        })
    }

    pub fn single(strategy: Strategy) -> Self {
        Self {
            ring: vec![strategy],
            describe: format!("{strategy}:1"),
        }
    }

    /// Queues (and therefore pre-split chunks) per shard.
    pub fn chunks_per_shard(&self) -> usize {
        self.ring.len()
    }

    /// Strategy for a shard's i-th chunk.
    pub fn strategy_for(&self, index: usize) -> Strategy {
        self.ring[index % self.ring.len()]
    }

    pub fn has_disk(&self) -> bool {
        self.ring.contains(&Strategy::Disk)
    }

    /// Compact rendering for logs and the stats file, e.g. `ram:2,disk:1`.
    pub fn describe(&self) -> &str {
        &self.describe
    }
}

// Collects object entries in declaration order; serde_json's Map would
// re-sort them and queue order is significant.
struct ObjectInOrder;

impl<'de> serde::de::Visitor<'de> for ObjectInOrder {
    type Value = Vec<(String, Value)>;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "a load queue object")
    }

    fn visit_map<A: serde::de::MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut entries = Vec::new();
        while let Some(entry) = map.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Resolve the configured batcher thread count: 0 means twice the
/// hardware concurrency, a negative value means hardware concurrency
/// minus that many.
pub fn resolve_threads(requested: i64) -> Result<usize, ConfigError> {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    match requested {
        0 => Ok(available * 2),
        n if n > 0 => Ok(n as usize),
        n => {
            let want = available as i64 + n;
            if want < 1 {
                Err(ConfigError::InsufficientThreads {
                    requested: n,
                    available,
                })
            } else {
                Ok(want as usize)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatcherSettings {
    /// Raw thread request; see `resolve_threads`.
    pub threads: i64,
    /// Capacity of the batcher inbox.
    pub queue_size: usize,
}

impl Default for BatcherSettings {
    fn default() -> Self {
        Self {
            threads: 0,
            queue_size: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndPointSettings {
    /// Persistent connections per shard.
    pub thread_count: usize,
    /// Capacity of each end point's inbound task queue.
    pub queue_size: usize,
    /// Bypass the routing tier and write straight to shards.
    pub direct_load: bool,
    /// Retry budget for transient write failures before a connection is
    /// marked degraded and evicted.
    pub max_retries: u32,
}

impl Default for EndPointSettings {
    fn default() -> Self {
        Self {
            thread_count: 3,
            queue_size: 20,
            direct_load: false,
            max_retries: 4,
        }
    }
}

/// Everything the Loader needs to run one load.
#[derive(Clone)]
pub struct LoadSettings {
    pub ns: Namespace,
    pub sharded: bool,
    pub shard_key: Option<KeySpec>,
    pub shard_key_unique: bool,
    /// Synthesize `_id` when the key includes it and a document lacks it.
    pub add_id: bool,
    pub drop_db: bool,
    pub drop_coll: bool,
    pub drop_indexes: bool,
    pub stop_balancer: bool,
    pub balancer_timeout: Duration,
    pub queue_plan: QueuePlan,
    pub batch_size: usize,
    pub batcher: BatcherSettings,
    pub end_point: EndPointSettings,
    /// Finalizer pool size; defaults to the resolved batcher threads.
    pub threads_max: Option<usize>,
    /// Buffered batches per ram/disk queue slot.
    pub slot_queue_size: usize,
    pub work_path: Option<PathBuf>,
    /// Memory threshold for the disk strategy; sampled from free system
    /// RAM when unset.
    pub ram_max: Option<u64>,
    pub write_concern: WriteConcern,
}

impl LoadSettings {
    pub fn new(ns: Namespace) -> Self {
        Self {
            ns,
            sharded: false,
            shard_key: None,
            shard_key_unique: false,
            add_id: true,
            drop_db: false,
            drop_coll: false,
            drop_indexes: false,
            stop_balancer: true,
            balancer_timeout: Duration::from_secs(120),
            queue_plan: QueuePlan::single(Strategy::Direct),
            batch_size: 500,
            batcher: BatcherSettings::default(),
            end_point: EndPointSettings::default(),
            threads_max: None,
            slot_queue_size: 1 << 20,
            work_path: None,
            ram_max: None,
            write_concern: WriteConcern::default(),
        }
    }

    /// The balancer is always stopped for direct loads.
    pub fn effective_stop_balancer(&self) -> bool {
        self.stop_balancer || self.end_point.direct_load
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sharded && self.shard_key.is_none() {
            return Err(ConfigError::MissingShardKey);
        }
        if self.queue_plan.has_disk() && self.work_path.is_none() {
            return Err(ConfigError::MissingWorkPath);
        }
        if self.end_point.thread_count == 0 {
            return Err(ConfigError::NoEndPoints);
        }
        resolve_threads(self.batcher.threads)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_queue_plan_expansion() {
        let plan = QueuePlan::parse(r#"{"ram": 2, "disk": 1}"#).unwrap();
        assert_eq!(plan.chunks_per_shard(), 3);
        assert_eq!(plan.strategy_for(0), Strategy::Ram);
        assert_eq!(plan.strategy_for(1), Strategy::Ram);
        assert_eq!(plan.strategy_for(2), Strategy::Disk);
        assert_eq!(plan.strategy_for(3), Strategy::Ram); // Ring wraps.
        assert_eq!(plan.describe(), "ram:2,disk:1");
        assert!(plan.has_disk());
    }

    #[test]
    fn test_queue_plan_rejects_empty() {
        assert!(matches!(QueuePlan::parse("{}"), Err(ConfigError::NoQueues)));
        assert!(matches!(
            QueuePlan::parse(r#"{"ram": 0}"#),
            Err(ConfigError::NoQueues)
        ));
    }

    #[test]
    fn test_queue_plan_rejects_unknown_strategy() {
        assert!(matches!(
            QueuePlan::parse(r#"{"tape": 1}"#),
            Err(ConfigError::UnknownStrategy(s)) if s == "tape"
        ));
    }

    #[test]
    fn test_queue_plan_rejects_non_numeric_count() {
        assert!(matches!(
            QueuePlan::parse(r#"{"ram": "two"}"#),
            Err(ConfigError::BadQueueCount { .. })
        ));
        assert!(matches!(
            QueuePlan::parse(r#"{"ram": -1}"#),
            Err(ConfigError::BadQueueCount { .. })
        ));
    }

    #[test]
    fn test_resolve_threads() {
        let available = std::thread::available_parallelism().unwrap().get();

        assert_eq!(resolve_threads(0).unwrap(), available * 2);
        assert_eq!(resolve_threads(3).unwrap(), 3);
        assert!(matches!(
            resolve_threads(-(available as i64)),
            Err(ConfigError::InsufficientThreads { .. })
        ));
    }

    #[test]
    fn test_validate_sharded_requires_key() {
        let mut settings = LoadSettings::new(Namespace::new("db", "c"));
        settings.sharded = true;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingShardKey)
        ));

        settings.shard_key = Some(KeySpec::parse(r#"{"k": 1}"#).unwrap());
        settings.validate().unwrap();
    }

    #[test]
    fn test_validate_disk_requires_work_path() {
        let mut settings = LoadSettings::new(Namespace::new("db", "c"));
        settings.queue_plan = QueuePlan::parse(r#"{"disk": 1}"#).unwrap();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingWorkPath)
        ));

        settings.work_path = Some(std::env::temp_dir());
        settings.validate().unwrap();
    }

    #[test]
    fn test_direct_load_forces_balancer_stop() {
        let mut settings = LoadSettings::new(Namespace::new("db", "c"));
        settings.stop_balancer = false;
        assert!(!settings.effective_stop_balancer());

        settings.end_point.direct_load = true;
        assert!(settings.effective_stop_balancer());
    }
}
