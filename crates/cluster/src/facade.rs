use crate::{ChunkMap, Namespace, ShardId};
use keys::KeySpec;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Cluster is the facade over the destination cluster's control plane:
/// topology discovery, sharding enablement, pre-splitting, balancer
/// control, and the per-shard connection factory. The wire protocol
/// lives entirely behind this trait; `mem::MemCluster` backs tests and
/// `mem://` connection strings, and a production driver implements the
/// same surface.
pub trait Cluster: Send + Sync + fmt::Debug {
    /// All shards of the cluster.
    fn shards(&self) -> anyhow::Result<Vec<ShardId>>;

    fn is_sharded(&self, ns: &Namespace) -> anyhow::Result<bool>;

    fn enable_sharding(&self, database: &str) -> anyhow::Result<()>;

    /// Shard the namespace on |key|, optionally pre-splitting into
    /// |total_chunks| chunks distributed across the shards.
    fn shard_collection(
        &self,
        ns: &Namespace,
        key: &KeySpec,
        unique: bool,
        total_chunks: Option<u32>,
    ) -> anyhow::Result<()>;

    /// Stop the balancer and wait until it reports stopped.
    fn stop_balancer(&self, timeout: Duration) -> anyhow::Result<()>;

    /// Wait until every shard owns at least |per_shard| chunks of the
    /// namespace.
    fn wait_chunks_per_shard(
        &self,
        ns: &Namespace,
        per_shard: usize,
        timeout: Duration,
    ) -> anyhow::Result<()>;

    fn drop_database(&self, database: &str) -> anyhow::Result<()>;

    fn drop_collection(&self, ns: &Namespace) -> anyhow::Result<()>;

    fn drop_indexes(&self, ns: &Namespace) -> anyhow::Result<()>;

    /// The namespace's chunk layout under |spec|.
    fn chunk_map(&self, ns: &Namespace, spec: &KeySpec) -> anyhow::Result<ChunkMap>;

    /// Open a persistent write connection to one shard.
    fn connect(&self, shard: &ShardId) -> anyhow::Result<Box<dyn WriteConn>>;
}

/// One persistent connection to one shard.
pub trait WriteConn: Send {
    /// Insert a batch of documents. The call is synchronous and the
    /// documents are durable to the given concern when it returns.
    fn write(
        &mut self,
        ns: &Namespace,
        docs: &[Value],
        concern: &WriteConcern,
    ) -> Result<(), WriteError>;
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    /// Network interruption, primary step-down, or another failure the
    /// end-point worker should retry against a healthy connection.
    #[error("transient write failure")]
    Retryable(#[source] anyhow::Error),
    /// Duplicate key, document too large, and other rejections which
    /// retrying cannot cure. The batch is accounted and dropped.
    #[error("write rejected by the destination")]
    Fatal(#[source] anyhow::Error),
}

/// Durability requirement attached to every write task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteConcern {
    Nodes(u32),
    Majority,
}

impl Default for WriteConcern {
    fn default() -> Self {
        WriteConcern::Nodes(1)
    }
}

impl WriteConcern {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "majority" => Some(WriteConcern::Majority),
            n => n.parse().ok().map(WriteConcern::Nodes),
        }
    }
}

impl fmt::Display for WriteConcern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WriteConcern::Nodes(n) => write!(f, "{n}"),
            WriteConcern::Majority => f.write_str("majority"),
        }
    }
}
