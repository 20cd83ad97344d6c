//! Disk-spill support for the `disk` queue strategy: sorted runs of
//! documents written under the work path, merged back into key order at
//! finalization.

use keys::{KeySpec, ShardKey};
use serde_json::Value;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum SpillError {
    #[error("spill file IO error")]
    Io(#[from] io::Error),
    #[error("spill file record error")]
    Json(#[from] serde_json::Error),
}

// One document of a spill run: the extracted key alongside the body, so
// merging never re-extracts.
#[derive(serde::Deserialize)]
struct RunRecord {
    k: Vec<Value>,
    d: Value,
}

#[derive(serde::Serialize)]
struct RunRecordRef<'a> {
    k: &'a [Value],
    d: &'a Value,
}

/// SpillState owns one queue slot's directory of sorted runs.
pub struct SpillState {
    dir: PathBuf,
    runs: Vec<PathBuf>,
}

impl SpillState {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            runs: Vec::new(),
        }
    }

    pub fn has_runs(&self) -> bool {
        !self.runs.is_empty()
    }

    /// Sort the given documents by shard key and write them as one run.
    /// On failure the partial run file is removed and the documents are
    /// handed back so the caller can keep them buffered.
    pub fn write_run(
        &mut self,
        spec: &KeySpec,
        mut pairs: Vec<(ShardKey, Value)>,
    ) -> Result<(), (SpillError, Vec<(ShardKey, Value)>)> {
        pairs.sort_by(|(l, _), (r, _)| spec.compare(l, r));

        let path = self.dir.join(format!("run-{:05}.jsonl", self.runs.len()));
        match write_run_file(&self.dir, &path, &pairs) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), docs = pairs.len(), "spilled sorted run");
                self.runs.push(path);
                Ok(())
            }
            Err(err) => {
                let _ = std::fs::remove_file(&path);
                Err((err, pairs))
            }
        }
    }

    /// Merge all runs with an in-memory remainder into one ascending
    /// stream of documents. Run files are removed afterwards with
    /// `cleanup`.
    pub fn merge(
        &mut self,
        spec: &KeySpec,
        mut remainder: Vec<(ShardKey, Value)>,
    ) -> Result<MergeIter, SpillError> {
        remainder.sort_by(|(l, _), (r, _)| spec.compare(l, r));

        let mut sources = Vec::with_capacity(self.runs.len() + 1);
        for run in &self.runs {
            sources.push(Source::new_run(run)?);
        }
        sources.push(Source::new_mem(remainder));

        Ok(MergeIter {
            spec: spec.clone(),
            sources,
        })
    }

    /// Best-effort removal of the run directory.
    pub fn cleanup(&mut self) {
        if self.runs.is_empty() {
            return;
        }
        self.runs.clear();
        if let Err(error) = std::fs::remove_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), %error, "failed to remove spill directory");
        }
    }
}

fn write_run_file(dir: &Path, path: &Path, pairs: &[(ShardKey, Value)]) -> Result<(), SpillError> {
    std::fs::create_dir_all(dir)?;
    let mut writer = BufWriter::new(File::create(path)?);

    for (key, body) in pairs {
        let record = RunRecordRef {
            k: key.values(),
            d: body,
        };
        serde_json::to_writer(&mut writer, &record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

// A merge source: either a run file being streamed, or the in-memory
// remainder. Each holds its next document at `head`.
struct Source {
    head: Option<(ShardKey, Value)>,
    kind: SourceKind,
}

enum SourceKind {
    Run(io::Lines<BufReader<File>>),
    Mem(std::vec::IntoIter<(ShardKey, Value)>),
}

impl Source {
    fn new_run(path: &Path) -> Result<Self, SpillError> {
        let mut source = Self {
            head: None,
            kind: SourceKind::Run(BufReader::new(File::open(path)?).lines()),
        };
        source.advance()?;
        Ok(source)
    }

    fn new_mem(pairs: Vec<(ShardKey, Value)>) -> Self {
        let mut source = Self {
            head: None,
            kind: SourceKind::Mem(pairs.into_iter()),
        };
        source.advance().expect("memory source cannot fail");
        source
    }

    fn advance(&mut self) -> Result<(), SpillError> {
        self.head = match &mut self.kind {
            SourceKind::Run(lines) => match lines.next() {
                None => None,
                Some(line) => {
                    let record: RunRecord = serde_json::from_str(&line?)?;
                    Some((ShardKey::from(record.k), record.d))
                }
            },
            SourceKind::Mem(iter) => iter.next(),
        };
        Ok(())
    }
}

/// MergeIter yields documents from every source in ascending key order.
/// The number of sources is small (runs per slot), so each step is a
/// linear scan for the minimum head.
pub struct MergeIter {
    spec: KeySpec,
    sources: Vec<Source>,
}

impl Iterator for MergeIter {
    type Item = Result<(ShardKey, Value), SpillError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut min: Option<usize> = None;
        for index in 0..self.sources.len() {
            let Some((key, _)) = &self.sources[index].head else {
                continue;
            };
            let better = match min {
                None => true,
                Some(best) => {
                    let (best_key, _) = self.sources[best].head.as_ref().unwrap();
                    self.spec.compare(key, best_key) == std::cmp::Ordering::Less
                }
            };
            if better {
                min = Some(index);
            }
        }

        let index = min?;
        let item = self.sources[index].head.take().unwrap();
        if let Err(err) = self.sources[index].advance() {
            return Some(Err(err));
        }
        Some(Ok(item))
    }
}

const DEFAULT_RAM_MAX: u64 = 1 << 30;

/// Free system RAM sampled at startup, used as the spill threshold for
/// disk queue slots. Falls back to a fixed budget when the OS gives no
/// answer.
pub fn sample_free_ram() -> u64 {
    if let Ok(text) = std::fs::read_to_string("/proc/meminfo") {
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("MemAvailable:") {
                if let Some(kb) = rest
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    return kb * 1024;
                }
            }
        }
    }
    DEFAULT_RAM_MAX
}
