use crate::batch::BatchBuilder;
use crate::dispatch::Dispatcher;
use crate::queue::{BoundedQueue, Rejected};
use crate::stats::LoadStats;
use cluster::ChunkMap;
use keys::ShardKey;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// DocSink is the hand-off the input adapter pushes parsed documents
/// into. `end_wait` signals that the file set is exhausted.
#[derive(Clone)]
pub struct DocSink {
    inbox: Arc<BoundedQueue<Value>>,
}

impl DocSink {
    pub fn new(inbox: Arc<BoundedQueue<Value>>) -> Self {
        Self { inbox }
    }

    /// Push one parsed document, blocking while the inbox is full.
    pub fn push(&self, doc: Value) -> Result<(), Rejected<Value>> {
        self.inbox.push(doc)
    }

    pub fn end_wait(&self) {
        self.inbox.end_wait();
    }
}

/// Generator for synthesized `_id` values.
pub type IdGenerator = Arc<dyn Fn() -> Value + Send + Sync>;

pub fn default_id_generator() -> IdGenerator {
    Arc::new(|| Value::String(uuid::Uuid::new_v4().to_string()))
}

struct Shared {
    map: Arc<ChunkMap>,
    dispatcher: Arc<Dispatcher>,
    // One builder per chunk, locked independently; the dense index
    // matches the chunk map's chunk order.
    builders: Vec<Mutex<BatchBuilder>>,
    stats: Arc<LoadStats>,
    // An unsharded load routes everything to its single chunk.
    sharded: bool,
    add_id: bool,
    id_gen: IdGenerator,
}

/// BatcherPool is the worker pool between the input adapter and the
/// dispatcher: each worker pops a document, extracts its shard key,
/// resolves the owning chunk, and appends to that chunk's builder,
/// sealing and dispatching full batches. At end-of-stream the workers
/// flush every partial builder and exit.
pub struct BatcherPool {
    handles: Vec<JoinHandle<()>>,
}

impl BatcherPool {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        threads: usize,
        inbox: Arc<BoundedQueue<Value>>,
        map: Arc<ChunkMap>,
        dispatcher: Arc<Dispatcher>,
        batch_size: usize,
        sharded: bool,
        add_id: bool,
        id_gen: IdGenerator,
        stats: Arc<LoadStats>,
    ) -> std::io::Result<Self> {
        let builders = (0..map.chunks().len())
            .map(|_| Mutex::new(BatchBuilder::new(batch_size)))
            .collect();

        let shared = Arc::new(Shared {
            map,
            dispatcher,
            builders,
            stats,
            sharded,
            add_id,
            id_gen,
        });

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = shared.clone();
            let inbox = inbox.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("batcher-{i}"))
                    .spawn(move || run_worker(shared, inbox))?,
            );
        }
        Ok(Self { handles })
    }

    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::error!("batcher worker panicked");
            }
        }
    }
}

fn run_worker(shared: Arc<Shared>, inbox: Arc<BoundedQueue<Value>>) {
    while let Some(doc) = inbox.pop() {
        route_one(&shared, doc);
    }
    // End of stream: seal and dispatch every non-empty builder. All
    // workers walk the full set; the per-chunk lock makes each flush
    // happen exactly once.
    for (chunk_index, cell) in shared.builders.iter().enumerate() {
        let sealed = cell.lock().unwrap().seal();
        if let Some(batch) = sealed {
            LoadStats::add(&shared.stats.batches_sealed, 1);
            shared.dispatcher.push(chunk_index, batch);
        }
    }
}

fn route_one(shared: &Shared, mut doc: Value) {
    let (key, chunk_index) = if shared.sharded {
        let spec = shared.map.spec();

        // Synthesize `_id` when the key needs it and the document
        // arrived without one.
        if shared.add_id && spec.includes_id() {
            if let Some(fields) = doc.as_object_mut() {
                if !fields.contains_key("_id") {
                    fields.insert("_id".to_string(), (shared.id_gen)());
                }
            }
        }

        let key = match spec.extract(&doc) {
            Ok(key) => key,
            Err(error) => {
                LoadStats::add(&shared.stats.rejected, 1);
                tracing::debug!(%error, "rejecting document");
                return;
            }
        };
        match shared.map.route_index(&key) {
            Some(chunk_index) => (key, chunk_index),
            None => {
                LoadStats::add(&shared.stats.rejected, 1);
                tracing::debug!("rejecting document: no chunk covers its key");
                return;
            }
        }
    } else {
        // Unsharded: a single chunk owns the whole key space.
        (ShardKey::from(vec![Value::Null]), 0)
    };

    LoadStats::add(&shared.stats.accepted, 1);

    // Append under the chunk's lock; hand the sealed batch off outside it.
    let sealed = {
        let mut builder = shared.builders[chunk_index].lock().unwrap();
        builder.push(key, doc)
    };
    if let Some(batch) = sealed {
        LoadStats::add(&shared.stats.batches_sealed, 1);
        shared.dispatcher.push(chunk_index, batch);
    }
}
