//! The input adapter: walks a directory of files, parses each as a
//! stream of JSON documents, and pushes them into the loader's batcher
//! inbox. Parsing fans out over a small pool of reader threads; the
//! sink is told to end-wait once every file has been consumed.

use loader::DocSink;
use serde_json::Value;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown input type {0:?}")]
    UnknownFormat(String),
    #[error("bad file regex {pattern:?}")]
    BadRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to list load directory {dir:?}")]
    ListDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Recognized input file formats. JSON accepts any whitespace-separated
/// stream of documents, which subsumes JSON-lines.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Format {
    Json,
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "json" | "jsonl" => Ok(Format::Json),
            other => Err(Error::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Directory holding the input files (not recursed).
    pub dir: PathBuf,
    /// Optional regex that file names must match.
    pub file_regex: Option<String>,
    pub format: Format,
    /// Reader threads parsing files concurrently.
    pub threads: usize,
}

/// What one run of the adapter consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub files: usize,
    pub docs: u64,
    /// Files abandoned on an open or parse error. Each is logged;
    /// none aborts the load.
    pub failed_files: u64,
}

/// Parse every matching file and push its documents into the sink,
/// then end-wait the sink. Returns once all reader threads are done.
pub fn run(config: &SourceConfig, sink: &DocSink) -> Result<Summary, Error> {
    let filter = config
        .file_regex
        .as_deref()
        .map(regex::Regex::new)
        .transpose()
        .map_err(|source| Error::BadRegex {
            pattern: config.file_regex.clone().unwrap_or_default(),
            source,
        })?;

    let mut files = Vec::new();
    let entries = std::fs::read_dir(&config.dir).map_err(|source| Error::ListDir {
        dir: config.dir.clone(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| Error::ListDir {
            dir: config.dir.clone(),
            source,
        })?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let matched = match (&filter, name.to_str()) {
            (Some(regex), Some(name)) => regex.is_match(name),
            (Some(_), None) => false,
            (None, _) => true,
        };
        if matched {
            files.push(entry.path());
        }
    }
    files.sort();

    tracing::info!(
        dir = %config.dir.display(),
        files = files.len(),
        threads = config.threads,
        "parsing input files"
    );

    let total_files = files.len();
    let work = Mutex::new(VecDeque::from(files));
    let docs = AtomicU64::new(0);
    let failed_files = AtomicU64::new(0);

    std::thread::scope(|scope| {
        for _ in 0..config.threads.max(1) {
            scope.spawn(|| loop {
                let Some(path) = work.lock().unwrap().pop_front() else {
                    return;
                };
                if let Err(error) = parse_file(&path, sink, &docs) {
                    failed_files.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(path = %path.display(), %error, "abandoning input file");
                }
            });
        }
    });
    sink.end_wait();

    Ok(Summary {
        files: total_files,
        docs: docs.load(Ordering::Relaxed),
        failed_files: failed_files.load(Ordering::Relaxed),
    })
}

// Stream one file's documents into the sink. Any amount of whitespace
// (including newlines) may separate documents. Documents delivered
// before a mid-file failure stay delivered, and stay counted.
fn parse_file(path: &std::path::Path, sink: &DocSink, docs: &AtomicU64) -> Result<(), anyhow::Error> {
    let reader = BufReader::new(File::open(path)?);
    let stream = serde_json::Deserializer::from_reader(reader).into_iter::<Value>();

    for next in stream {
        let doc = next?;
        if sink.push(doc).is_err() {
            // The pipeline refused the document: it is shutting down.
            anyhow::bail!("document sink is closed");
        }
        docs.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}
