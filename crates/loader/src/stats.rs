use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// LoadStats accumulates counters across every stage of a load. All
/// counters are monotonic; nothing here is on a lock-protected path.
#[derive(Default)]
pub struct LoadStats {
    /// Documents accepted by the batcher (keyed and routed).
    pub accepted: AtomicU64,
    /// Documents rejected for a missing key field or uncovered key.
    pub rejected: AtomicU64,
    /// Batches sealed and handed to the dispatcher.
    pub batches_sealed: AtomicU64,
    /// Documents offered to the end-point layer, counted once per batch
    /// before any retries.
    pub write_attempt_docs: AtomicU64,
    /// Documents durably written.
    pub docs_written: AtomicU64,
    /// Transient write failures that were retried.
    pub retries: AtomicU64,
    /// Documents dropped on non-retryable write failures.
    pub fatal_docs: AtomicU64,
    /// Connections evicted after exhausting their retry budget.
    pub evicted_connections: AtomicU64,
    /// Sorted runs spilled to the work path by disk queue slots.
    pub spilled_runs: AtomicU64,
}

impl LoadStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            batches_sealed: self.batches_sealed.load(Ordering::Relaxed),
            write_attempt_docs: self.write_attempt_docs.load(Ordering::Relaxed),
            docs_written: self.docs_written.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            fatal_docs: self.fatal_docs.load(Ordering::Relaxed),
            evicted_connections: self.evicted_connections.load(Ordering::Relaxed),
            spilled_runs: self.spilled_runs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Snapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub batches_sealed: u64,
    pub write_attempt_docs: u64,
    pub docs_written: u64,
    pub retries: u64,
    pub fatal_docs: u64,
    pub evicted_connections: u64,
    pub spilled_runs: u64,
}

/// One appended row of the stats file.
pub struct StatsRow<'a> {
    pub total_secs: f64,
    pub input_secs: f64,
    pub bypass: bool,
    pub input_type: &'a str,
    pub key: &'a str,
    pub queuing: &'a str,
    pub queue_size: usize,
    pub threads: usize,
    pub endpoint_conns: usize,
    pub write_concern: &'a str,
    pub note: &'a str,
}

const STATS_HEADER: [&str; 12] = [
    "time(s)",
    "time",
    "bypass",
    "type",
    "input time(s)",
    "key",
    "queuing",
    "queue size",
    "threads",
    "endpoint conns",
    "wc",
    "note",
];

/// Append one run's row to the stats CSV, writing the header first when
/// the file is empty. Failures here are the caller's to log and ignore:
/// they never affect the outcome of a load.
pub fn append_stats_row(path: &Path, row: &StatsRow) -> anyhow::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let is_empty = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    if is_empty {
        writer.write_record(STATS_HEADER)?;
    }
    writer.write_record([
        format!("{:.3}", row.total_secs),
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        row.bypass.to_string(),
        row.input_type.to_string(),
        format!("{:.3}", row.input_secs),
        row.key.to_string(),
        row.queuing.to_string(),
        row.queue_size.to_string(),
        row.threads.to_string(),
        row.endpoint_conns.to_string(),
        row.write_concern.to_string(),
        row.note.to_string(),
    ])?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn row<'a>(note: &'a str) -> StatsRow<'a> {
        StatsRow {
            total_secs: 12.5,
            input_secs: 3.25,
            bypass: false,
            input_type: "json",
            key: r#"{"k": 1}"#,
            queuing: "direct:1",
            queue_size: 500,
            threads: 4,
            endpoint_conns: 3,
            write_concern: "1",
            note,
        }
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.csv");

        append_stats_row(&path, &row("first")).unwrap();
        append_stats_row(&path, &row("second")).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("time(s),time,bypass,type"));
        assert!(lines[1].ends_with("first"));
        assert!(lines[2].ends_with("second"));
    }

    #[test]
    fn test_snapshot_reads_counters() {
        let stats = LoadStats::default();
        LoadStats::add(&stats.accepted, 10);
        LoadStats::add(&stats.docs_written, 10);

        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 10);
        assert_eq!(snap.docs_written, 10);
        assert_eq!(snap.rejected, 0);
    }
}
