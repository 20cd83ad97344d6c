//! The in-process data plane of a bulk load: staged worker pools joined
//! by bounded queues, routing parsed documents to per-(shard, chunk)
//! batch queues and draining them through per-shard connection pools.

mod batch;
mod batcher;
mod dispatch;
mod endpoint;
mod finalize;
mod queue;
mod round_robin;
mod settings;
mod spill;
mod stats;

pub use batch::{Batch, BatchBuilder};
pub use batcher::{default_id_generator, BatcherPool, DocSink, IdGenerator};
pub use dispatch::{Dispatcher, QueueSlot};
pub use endpoint::{EndPointPool, Gate, WriteTask};
pub use queue::{BoundedQueue, Rejected};
pub use round_robin::RoundRobin;
pub use settings::{
    resolve_threads, BatcherSettings, ConfigError, EndPointSettings, LoadSettings, QueuePlan,
    Strategy,
};
pub use stats::{append_stats_row, LoadStats, Snapshot, StatsRow};

use cluster::{Chunk, ChunkId, ChunkMap, Cluster, KeyBound};
use keys::KeySpec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cluster setup failed")]
    Setup(#[source] anyhow::Error),
    #[error(transparent)]
    Topology(#[from] cluster::TopologyError),
    #[error("input processing failed")]
    Input(#[source] anyhow::Error),
    #[error("failed to start worker threads")]
    Spawn(#[from] std::io::Error),
}

/// Counters and timings of one completed load.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub stats: Snapshot,
    pub input_secs: f64,
    pub total_secs: f64,
}

/// Loader owns a whole load: cluster setup, the staged pipeline, and
/// waterfall finalization. The input adapter is handed a `DocSink` and
/// drives it until its file set is exhausted.
pub struct Loader {
    cluster: Arc<dyn Cluster>,
    settings: LoadSettings,
    stats: Arc<LoadStats>,
    id_gen: IdGenerator,
}

impl Loader {
    pub fn new(cluster: Arc<dyn Cluster>, settings: LoadSettings) -> Result<Self, Error> {
        settings.validate()?;
        Ok(Self {
            cluster,
            settings,
            stats: Arc::new(LoadStats::default()),
            id_gen: default_id_generator(),
        })
    }

    /// Replace the `_id` generator used when `add_id` synthesizes one.
    pub fn with_id_generator(mut self, id_gen: IdGenerator) -> Self {
        self.id_gen = id_gen;
        self
    }

    pub fn stats(&self) -> Arc<LoadStats> {
        self.stats.clone()
    }

    /// Run the load to completion. `feed` is the input adapter: it
    /// pushes every parsed document into the sink and returns when its
    /// input is exhausted.
    pub fn run<F>(&self, feed: F) -> Result<LoadOutcome, Error>
    where
        F: FnOnce(DocSink) -> anyhow::Result<()>,
    {
        let started = Instant::now();
        let settings = &self.settings;

        let map = Arc::new(self.setup()?);
        tracing::info!(
            ns = %settings.ns,
            chunks = map.chunks().len(),
            shards = map.shards().len(),
            queuing = settings.queue_plan.describe(),
            "cluster is ready; starting pipeline"
        );

        let mut pools = HashMap::new();
        for shard in map.shards() {
            let pool = EndPointPool::start(
                self.cluster.as_ref(),
                shard.clone(),
                settings.ns.clone(),
                settings.write_concern.clone(),
                &settings.end_point,
                self.stats.clone(),
            )
            .map_err(Error::Setup)?;
            pools.insert(shard, pool);
        }

        let ram_max = settings.ram_max.unwrap_or_else(spill::sample_free_ram);
        let dispatcher = Arc::new(dispatch::Dispatcher::new(
            &map,
            &pools,
            settings,
            ram_max,
            self.stats.clone(),
        ));

        let threads = settings::resolve_threads(settings.batcher.threads)?;
        let inbox = Arc::new(BoundedQueue::new(settings.batcher.queue_size));
        let batchers = BatcherPool::start(
            threads,
            inbox.clone(),
            map.clone(),
            dispatcher.clone(),
            settings.batch_size,
            settings.sharded,
            settings.add_id,
            self.id_gen.clone(),
            self.stats.clone(),
        )?;

        // Drive the input adapter on this thread while the pipeline
        // runs, then drain stage by stage, left to right.
        let input_started = Instant::now();
        let input_result = feed(DocSink::new(inbox.clone()));
        inbox.end_wait();
        batchers.join();
        let input_secs = input_started.elapsed().as_secs_f64();

        dispatcher.end_wait();
        finalize::run_waterfall(
            &dispatcher,
            settings.threads_max.unwrap_or(threads),
            settings.batch_size,
        );

        for pool in pools.values() {
            pool.end_wait();
        }
        for pool in pools.values() {
            pool.join();
        }

        input_result.map_err(Error::Input)?;

        let outcome = LoadOutcome {
            stats: self.stats.snapshot(),
            input_secs,
            total_secs: started.elapsed().as_secs_f64(),
        };
        tracing::info!(
            accepted = outcome.stats.accepted,
            rejected = outcome.stats.rejected,
            written = outcome.stats.docs_written,
            retries = outcome.stats.retries,
            dropped = outcome.stats.fatal_docs,
            evicted_connections = outcome.stats.evicted_connections,
            input_secs = outcome.input_secs,
            total_secs = outcome.total_secs,
            "load complete"
        );
        Ok(outcome)
    }

    // Pre-load cluster work: drops, sharding enablement, pre-split,
    // balancer stop, and the frozen chunk map. Everything here is fatal;
    // nothing tears the pipeline down once it starts.
    fn setup(&self) -> Result<ChunkMap, Error> {
        let settings = &self.settings;
        let cluster = self.cluster.as_ref();
        let ns = &settings.ns;

        if settings.drop_db {
            cluster
                .drop_database(&ns.database)
                .map_err(Error::Setup)?;
        } else {
            if settings.drop_coll {
                cluster.drop_collection(ns).map_err(Error::Setup)?;
            }
            if settings.drop_indexes {
                cluster.drop_indexes(ns).map_err(Error::Setup)?;
            }
        }

        if settings.effective_stop_balancer() {
            cluster
                .stop_balancer(settings.balancer_timeout)
                .map_err(Error::Setup)?;
        }

        if !settings.sharded {
            if cluster.is_sharded(ns).map_err(Error::Setup)? {
                return Err(Error::Setup(anyhow::anyhow!(
                    "collection {ns} is sharded; configure a sharded load"
                )));
            }
            let shards = cluster.shards().map_err(Error::Setup)?;
            let Some(primary) = shards.into_iter().next() else {
                return Err(Error::Setup(anyhow::anyhow!("cluster reports no shards")));
            };

            let spec = KeySpec::parse(r#"{"_id": 1}"#).map_err(ConfigError::from)?;
            return Ok(ChunkMap::new(
                spec,
                vec![Chunk {
                    id: ChunkId::new("chunk-0"),
                    shard: primary,
                    min: KeyBound::Min,
                    max: KeyBound::Max,
                }],
            )?);
        }

        let spec = settings
            .shard_key
            .clone()
            .ok_or(ConfigError::MissingShardKey)?;

        cluster
            .enable_sharding(&ns.database)
            .map_err(Error::Setup)?;

        let shards = cluster.shards().map_err(Error::Setup)?;
        let chunks_per_shard = settings.queue_plan.chunks_per_shard();
        let total_chunks = spec
            .is_hashed()
            .then(|| (chunks_per_shard * shards.len()) as u32);

        cluster
            .shard_collection(ns, &spec, settings.shard_key_unique, total_chunks)
            .map_err(Error::Setup)?;

        if spec.is_hashed() {
            cluster
                .wait_chunks_per_shard(ns, chunks_per_shard, settings.balancer_timeout)
                .map_err(Error::Setup)?;
        }

        Ok(cluster.chunk_map(ns, &spec).map_err(Error::Setup)?)
    }
}
