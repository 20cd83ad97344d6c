use crate::batch::Batch;
use crate::queue::{BoundedQueue, Rejected};
use crate::round_robin::RoundRobin;
use crate::settings::EndPointSettings;
use crate::stats::LoadStats;
use cluster::{Cluster, Namespace, ShardId, WriteConcern, WriteConn, WriteError};
use exponential_backoff::Backoff;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Gate counts outstanding write tasks so that finalization can wait
/// for one queue slot's batches to land before moving on.
pub struct Gate {
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl Gate {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: Mutex::new(count),
            cond: Condvar::new(),
        })
    }

    pub fn done(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.cond.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining > 0 {
            remaining = self.cond.wait(remaining).unwrap();
        }
    }
}

/// One write task: a sealed batch bound for this pool's shard.
pub struct WriteTask {
    pub batch: Batch,
    // Set once the batch has been counted as attempted; re-queued tasks
    // are not counted twice.
    counted: bool,
    gate: Option<Arc<Gate>>,
}

impl WriteTask {
    pub fn new(batch: Batch) -> Self {
        Self {
            batch,
            counted: false,
            gate: None,
        }
    }

    pub fn with_gate(batch: Batch, gate: Arc<Gate>) -> Self {
        Self {
            batch,
            counted: false,
            gate: Some(gate),
        }
    }

    fn finish(mut self) {
        if let Some(gate) = self.gate.take() {
            gate.done();
        }
    }
}

// A task discarded on `terminate` must still release its gate, or
// finalization would wait forever on work that no longer exists.
impl Drop for WriteTask {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.done();
        }
    }
}

struct EndPoint {
    ordinal: usize,
    queue: BoundedQueue<WriteTask>,
}

/// EndPointPool is one shard's fixed set of persistent connections,
/// each with its own inbound task queue and worker thread. A
/// round-robin cursor picks the connection for each submitted batch;
/// degraded connections are evicted from the cursor and their queued
/// work re-dealt to the survivors.
pub struct EndPointPool {
    shard: ShardId,
    ns: Namespace,
    concern: WriteConcern,
    endpoints: Vec<Arc<EndPoint>>,
    cursor: RoundRobin<usize>,
    stats: Arc<LoadStats>,
    max_retries: u32,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl EndPointPool {
    pub fn start(
        cluster: &dyn Cluster,
        shard: ShardId,
        ns: Namespace,
        concern: WriteConcern,
        settings: &EndPointSettings,
        stats: Arc<LoadStats>,
    ) -> anyhow::Result<Arc<Self>> {
        let mut conns = Vec::with_capacity(settings.thread_count);
        for _ in 0..settings.thread_count {
            conns.push(cluster.connect(&shard)?);
        }

        let endpoints: Vec<_> = (0..settings.thread_count)
            .map(|ordinal| {
                Arc::new(EndPoint {
                    ordinal,
                    queue: BoundedQueue::new(settings.queue_size),
                })
            })
            .collect();

        let pool = Arc::new(Self {
            shard: shard.clone(),
            ns,
            concern,
            cursor: RoundRobin::new((0..settings.thread_count).collect()),
            endpoints,
            stats,
            max_retries: settings.max_retries,
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(conns.len());
        for (endpoint, conn) in pool.endpoints.iter().cloned().zip(conns) {
            let pool = pool.clone();
            let handle = std::thread::Builder::new()
                .name(format!("endpoint-{}-{}", shard, endpoint.ordinal))
                .spawn(move || run_worker(pool, endpoint, conn))?;
            handles.push(handle);
        }
        *pool.handles.lock().unwrap() = handles;

        Ok(pool)
    }

    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    /// Connections still in rotation.
    pub fn live_connections(&self) -> usize {
        self.cursor.len()
    }

    /// Submit a task to the next connection in rotation, blocking while
    /// its queue is full. Returns the task if no connection can take it.
    pub fn submit(&self, mut task: WriteTask) -> Result<(), WriteTask> {
        if !task.counted {
            task.counted = true;
            LoadStats::add(&self.stats.write_attempt_docs, task.batch.len() as u64);
        }

        // A rejected push means that endpoint was concurrently evicted;
        // move on to the next cursor pick. Two full rotations without a
        // taker means the pool is shut down.
        for _ in 0..(self.endpoints.len() * 2).max(1) {
            let Some(ordinal) = self.cursor.next() else {
                return Err(task);
            };
            match self.endpoints[ordinal].queue.push(task) {
                Ok(()) => return Ok(()),
                Err(Rejected(returned)) => task = returned,
            }
        }
        Err(task)
    }

    /// Stop accepting new tasks; workers drain what is queued and exit.
    pub fn end_wait(&self) {
        for endpoint in &self.endpoints {
            endpoint.queue.end_wait();
        }
    }

    pub fn terminate(&self) {
        for endpoint in &self.endpoints {
            endpoint.queue.terminate();
        }
    }

    /// Join all worker threads. Call after `end_wait`.
    pub fn join(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!(shard = %self.shard, "end point worker panicked");
            }
        }
    }

    /// Tasks currently buffered across all inbound queues.
    pub fn queued_tasks(&self) -> usize {
        self.endpoints.iter().map(|e| e.queue.len()).sum()
    }

    // Count a task's documents as undeliverable and release its gate.
    fn account_lost(&self, task: WriteTask) {
        LoadStats::add(&self.stats.fatal_docs, task.batch.len() as u64);
        tracing::error!(
            shard = %self.shard,
            docs = task.batch.len(),
            "no live connection remains; dropping batch"
        );
        task.finish();
    }
}

enum SendOutcome {
    Written,
    Dropped,
    Degraded,
}

fn run_worker(pool: Arc<EndPointPool>, endpoint: Arc<EndPoint>, mut conn: Box<dyn WriteConn>) {
    let backoff = Backoff::new(
        pool.max_retries,
        Duration::from_millis(100),
        Some(Duration::from_secs(5)),
    );

    while let Some(task) = endpoint.queue.pop() {
        match send_with_retry(&pool, &endpoint, &mut conn, &backoff, &task) {
            SendOutcome::Written => {
                LoadStats::add(&pool.stats.docs_written, task.batch.len() as u64);
                task.finish();
            }
            SendOutcome::Dropped => {
                LoadStats::add(&pool.stats.fatal_docs, task.batch.len() as u64);
                task.finish();
            }
            SendOutcome::Degraded => {
                evict(&pool, &endpoint, task);
                return;
            }
        }
    }
}

fn send_with_retry(
    pool: &EndPointPool,
    endpoint: &EndPoint,
    conn: &mut Box<dyn WriteConn>,
    backoff: &Backoff,
    task: &WriteTask,
) -> SendOutcome {
    let mut failures = 0u32;
    loop {
        match conn.write(&pool.ns, task.batch.bodies(), &pool.concern) {
            Ok(()) => return SendOutcome::Written,
            Err(WriteError::Fatal(error)) => {
                tracing::error!(
                    shard = %pool.shard,
                    ordinal = endpoint.ordinal,
                    docs = task.batch.len(),
                    error = ?error,
                    "batch rejected; dropping"
                );
                return SendOutcome::Dropped;
            }
            Err(WriteError::Retryable(error)) => {
                failures += 1;
                LoadStats::add(&pool.stats.retries, 1);

                match backoff.next(failures) {
                    Some(delay) => {
                        tracing::warn!(
                            shard = %pool.shard,
                            ordinal = endpoint.ordinal,
                            failures,
                            error = ?error,
                            "transient write failure; backing off"
                        );
                        std::thread::sleep(delay);
                    }
                    None => return SendOutcome::Degraded,
                }
            }
        }
    }
}

// Remove this connection from rotation and re-deal its work, current
// task included, to the surviving connections.
fn evict(pool: &EndPointPool, endpoint: &EndPoint, task: WriteTask) {
    LoadStats::add(&pool.stats.evicted_connections, 1);
    tracing::warn!(
        shard = %pool.shard,
        ordinal = endpoint.ordinal,
        "retry budget exhausted; evicting connection"
    );

    pool.cursor.remove(&endpoint.ordinal);
    endpoint.queue.end_wait();

    let mut requeue = vec![task];
    requeue.extend(endpoint.queue.drain());
    for task in requeue {
        if let Err(task) = pool.submit(task) {
            pool.account_lost(task);
        }
    }
}
