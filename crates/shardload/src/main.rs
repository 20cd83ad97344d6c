mod logging;

use anyhow::Context;
use clap::Parser;
use cluster::{Namespace, WriteConcern};
use keys::KeySpec;
use loader::{LoadSettings, Loader, QueuePlan, StatsRow};
use sources::SourceConfig;
use std::path::PathBuf;
use std::time::Duration;

/// shardload bulk-loads a directory of JSON documents into a sharded
/// document-database cluster as fast as the cluster will accept them.
#[derive(Debug, Parser)]
#[command(author, name = "shardload", version)]
struct Shardload {
    #[command(flatten)]
    log: logging::LogArgs,

    /// Cluster connection string; the default scheme prefix is
    /// prepended when none is given.
    #[arg(long, env = "SHARDLOAD_CONNSTR")]
    connstr: String,

    /// Destination namespace, database.collection.
    #[arg(long)]
    ns: String,

    /// Load into a sharded collection; requires --shard-key-json.
    #[arg(long)]
    sharded: bool,

    /// Ordered shard key document, e.g. '{"user_id": "hashed"}' or
    /// '{"region": 1, "ts": -1}'.
    #[arg(long)]
    shard_key_json: Option<String>,

    /// Declare the shard-key index unique.
    #[arg(long)]
    shard_key_unique: bool,

    /// Synthesize _id when the shard key includes it and a document
    /// arrives without one.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    add_id: bool,

    /// Drop the destination database before loading.
    #[arg(long)]
    drop_db: bool,

    /// Drop the destination collection before loading.
    #[arg(long)]
    drop_coll: bool,

    /// Drop the destination collection's indexes before loading.
    #[arg(long)]
    drop_indexes: bool,

    /// Stop the balancer before loading. Always on for --direct-load.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    stop_balancer: bool,

    /// Seconds to wait for the balancer to stop (and for pre-split
    /// chunks to settle).
    #[arg(long, default_value_t = 120)]
    balancer_wait_secs: u64,

    /// Per-shard load queues by strategy, e.g. '{"ram": 2, "disk": 1}'.
    #[arg(long, default_value = r#"{"direct": 1}"#)]
    load_queue_json: String,

    /// Documents per sealed batch.
    #[arg(long, default_value_t = 500)]
    batch_size: usize,

    /// Batcher threads: 0 means twice the hardware concurrency, a
    /// negative value leaves that many cores free.
    #[arg(long, default_value_t = 0)]
    threads: i64,

    /// Capacity of the batcher inbox.
    #[arg(long, default_value_t = 1000)]
    batcher_queue_size: usize,

    /// Connections (each with its own worker thread) per shard.
    #[arg(long, default_value_t = 3)]
    endpoint_threads: usize,

    /// Capacity of each end point's inbound task queue.
    #[arg(long, default_value_t = 20)]
    endpoint_queue_size: usize,

    /// Bypass the routing tier and write straight to shards.
    #[arg(long)]
    direct_load: bool,

    /// Finalizer threads; defaults to the batcher thread count.
    #[arg(long)]
    threads_max: Option<usize>,

    /// Work directory for the disk queue strategy.
    #[arg(long)]
    work_path: Option<PathBuf>,

    /// Write concern: a node count or "majority".
    #[arg(long, default_value = "1")]
    write_concern: String,

    /// Input file format.
    #[arg(long, default_value = "json")]
    input_type: String,

    /// Directory of input files.
    #[arg(long)]
    load_dir: PathBuf,

    /// Regex an input file's name must match.
    #[arg(long)]
    file_regex: Option<String>,

    /// Reader threads in the input adapter.
    #[arg(long, default_value_t = 2)]
    input_threads: usize,

    /// CSV file to append one statistics row to.
    #[arg(long)]
    stats_file: Option<PathBuf>,

    /// Free-form note carried into the stats row.
    #[arg(long, default_value = "")]
    stats_file_note: String,
}

fn main() -> anyhow::Result<()> {
    let args = Shardload::parse();
    logging::init_logging(&args.log);

    let settings = build_settings(&args)?;
    let source = SourceConfig {
        dir: args.load_dir.clone(),
        file_regex: args.file_regex.clone(),
        format: args.input_type.parse()?,
        threads: args.input_threads,
    };

    let url = cluster::normalize(&args.connstr)?;
    let cluster = cluster::dial(&url, args.direct_load)
        .with_context(|| format!("cannot connect to {url}"))?;

    let loader = Loader::new(cluster, settings)?;
    let outcome = loader.run(|sink| {
        let summary = sources::run(&source, &sink)?;
        tracing::info!(
            files = summary.files,
            docs = summary.docs,
            failed_files = summary.failed_files,
            "input exhausted"
        );
        Ok(())
    })?;

    if let Some(path) = &args.stats_file {
        let queuing = describe_queuing(&args)?;
        let row = StatsRow {
            total_secs: outcome.total_secs,
            input_secs: outcome.input_secs,
            bypass: args.direct_load,
            input_type: &args.input_type,
            key: args.shard_key_json.as_deref().unwrap_or(""),
            queuing: &queuing,
            queue_size: args.batch_size,
            threads: loader::resolve_threads(args.threads)?,
            endpoint_conns: args.endpoint_threads,
            write_concern: &args.write_concern,
            note: &args.stats_file_note,
        };
        if let Err(error) = loader::append_stats_row(path, &row) {
            tracing::warn!(path = %path.display(), %error, "failed to append stats row");
        }
    }
    Ok(())
}

fn describe_queuing(args: &Shardload) -> anyhow::Result<String> {
    Ok(QueuePlan::parse(&args.load_queue_json)?.describe().to_string())
}

fn build_settings(args: &Shardload) -> anyhow::Result<LoadSettings> {
    let ns = Namespace::parse(&args.ns)?;
    let mut settings = LoadSettings::new(ns);

    settings.sharded = args.sharded;
    settings.shard_key = args
        .shard_key_json
        .as_deref()
        .map(KeySpec::parse)
        .transpose()
        .context("failed to parse --shard-key-json")?;
    settings.shard_key_unique = args.shard_key_unique;
    settings.add_id = args.add_id;
    settings.drop_db = args.drop_db;
    settings.drop_coll = args.drop_coll;
    settings.drop_indexes = args.drop_indexes;
    settings.stop_balancer = args.stop_balancer;
    settings.balancer_timeout = Duration::from_secs(args.balancer_wait_secs);
    settings.queue_plan =
        QueuePlan::parse(&args.load_queue_json).context("failed to parse --load-queue-json")?;
    settings.batch_size = args.batch_size;
    settings.batcher.threads = args.threads;
    settings.batcher.queue_size = args.batcher_queue_size;
    settings.end_point.thread_count = args.endpoint_threads;
    settings.end_point.queue_size = args.endpoint_queue_size;
    settings.end_point.direct_load = args.direct_load;
    settings.threads_max = args.threads_max;
    settings.work_path = args.work_path.clone();
    settings.write_concern = WriteConcern::parse(&args.write_concern)
        .with_context(|| format!("invalid write concern {:?}", args.write_concern))?;

    Ok(settings)
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_args() -> Shardload {
        Shardload::parse_from([
            "shardload",
            "--connstr",
            "mem://local?shards=2",
            "--ns",
            "db.events",
            "--load-dir",
            "/tmp/in",
        ])
    }

    #[test]
    fn test_build_settings_defaults() {
        let settings = build_settings(&base_args()).unwrap();
        assert_eq!(settings.ns.to_string(), "db.events");
        assert!(!settings.sharded);
        assert!(settings.add_id);
        assert_eq!(settings.batch_size, 500);
        assert_eq!(settings.queue_plan.describe(), "direct:1");
    }

    #[test]
    fn test_empty_queue_plan_is_fatal() {
        let mut args = base_args();
        args.load_queue_json = "{}".to_string();
        assert!(build_settings(&args).is_err());
    }

    #[test]
    fn test_bad_namespace_is_fatal() {
        let mut args = base_args();
        args.ns = "nodot".to_string();
        assert!(build_settings(&args).is_err());
    }

    #[test]
    fn test_sharded_key_round_trips() {
        let mut args = base_args();
        args.sharded = true;
        args.shard_key_json = Some(r#"{"user_id": "hashed"}"#.to_string());

        let settings = build_settings(&args).unwrap();
        assert!(settings.shard_key.unwrap().is_hashed());
    }
}
