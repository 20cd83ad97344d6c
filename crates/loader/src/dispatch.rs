use crate::batch::Batch;
use crate::endpoint::{EndPointPool, Gate, WriteTask};
use crate::queue::{BoundedQueue, Rejected};
use crate::settings::{LoadSettings, Strategy};
use crate::spill::SpillState;
use crate::stats::LoadStats;
use cluster::{ChunkId, ChunkMap, ShardId};
use keys::{KeySpec, ShardKey};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// QueueSlot is the dispatcher's logical queue for one (shard, chunk)
/// pair: a bounded wait-queue of sealed batches, the strategy tag that
/// governs buffering and finalization, and a non-owning reference to
/// the owning shard's end-point pool.
pub struct QueueSlot {
    pub chunk: ChunkId,
    pub shard: ShardId,
    // Position of the owning shard in the chunk map's shard list.
    shard_ordinal: usize,
    /// Ordinal of this slot among its shard's slots; the waterfall
    /// interleaves on it.
    pub index: usize,
    pub strategy: Strategy,
    queue: BoundedQueue<Batch>,
    pool: Arc<EndPointPool>,
    // Disk-strategy state.
    spill: Mutex<Option<SpillState>>,
    buffered_bytes: AtomicUsize,
    spill_budget: usize,
    stats: Arc<LoadStats>,
}

impl QueueSlot {
    /// Batches currently buffered.
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    fn push(&self, spec: &KeySpec, batch: Batch) {
        match self.strategy {
            // Forward to the shard's end points as batches seal.
            Strategy::Direct => {
                if let Err(task) = self.pool.submit(WriteTask::new(batch)) {
                    self.account_closed(task.batch.len());
                }
            }
            Strategy::Ram => {
                if let Err(Rejected(batch)) = self.queue.push(batch) {
                    self.account_closed(batch.len());
                }
            }
            Strategy::Disk => {
                let bytes = batch.approx_bytes();
                if let Err(Rejected(batch)) = self.queue.push(batch) {
                    self.account_closed(batch.len());
                    return;
                }
                let buffered = self.buffered_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
                if buffered > self.spill_budget {
                    self.spill_now(spec);
                }
            }
        }
    }

    fn spill_now(&self, spec: &KeySpec) {
        let mut guard = self.spill.lock().unwrap();
        let Some(spill) = guard.as_mut() else {
            return;
        };

        let batches = self.queue.drain();
        if batches.is_empty() {
            return;
        }
        let bytes: usize = batches.iter().map(Batch::approx_bytes).sum();
        let pairs: Vec<_> = batches.into_iter().flat_map(Batch::into_pairs).collect();

        match spill.write_run(spec, pairs) {
            Ok(()) => {
                self.buffered_bytes.fetch_sub(bytes, Ordering::Relaxed);
                LoadStats::add(&self.stats.spilled_runs, 1);
            }
            Err((error, pairs)) => {
                tracing::error!(
                    chunk = %self.chunk,
                    %error,
                    "failed to spill; keeping documents in memory"
                );
                // The queue was just drained, so re-buffering cannot block.
                if let Err(Rejected(batch)) = self.queue.push(Batch::from_pairs(pairs)) {
                    self.account_closed(batch.len());
                }
            }
        }
    }

    /// Strategy-dependent preparation of everything this slot buffered,
    /// yielding the batches to flush.
    fn prep(&self, spec: &KeySpec, batch_size: usize) -> Vec<Batch> {
        let drained = self.queue.drain();

        match self.strategy {
            // Pre-sorted upstream or deferred to the database.
            Strategy::Direct => drained,
            Strategy::Ram => {
                let mut pairs: Vec<_> = drained.into_iter().flat_map(Batch::into_pairs).collect();
                pairs.sort_by(|(l, _), (r, _)| spec.compare(l, r));
                rebatch(pairs, batch_size)
            }
            Strategy::Disk => {
                let mut remainder: Vec<_> =
                    drained.into_iter().flat_map(Batch::into_pairs).collect();
                let mut guard = self.spill.lock().unwrap();
                let Some(spill) = guard.as_mut() else {
                    remainder.sort_by(|(l, _), (r, _)| spec.compare(l, r));
                    return rebatch(remainder, batch_size);
                };

                let mut pairs = Vec::new();
                match spill.merge(spec, remainder) {
                    Ok(merged) => {
                        for item in merged {
                            match item {
                                Ok(pair) => pairs.push(pair),
                                Err(error) => {
                                    tracing::error!(
                                        chunk = %self.chunk,
                                        %error,
                                        "spill merge lost a run record"
                                    );
                                    LoadStats::add(&self.stats.fatal_docs, 1);
                                }
                            }
                        }
                    }
                    Err(error) => {
                        tracing::error!(chunk = %self.chunk, %error, "failed to open spill runs");
                    }
                }
                spill.cleanup();
                rebatch(pairs, batch_size)
            }
        }
    }

    /// Flush prepared batches through the shard's end-point pool and
    /// wait for them to land.
    fn do_load(&self, batches: Vec<Batch>) {
        if batches.is_empty() {
            return;
        }
        let gate = Gate::new(batches.len());
        for batch in batches {
            if let Err(task) = self.pool.submit(WriteTask::with_gate(batch, gate.clone())) {
                self.account_closed(task.batch.len());
            }
        }
        gate.wait();
    }

    /// Run this slot's finalization: prep, then flush.
    pub fn finalize(&self, spec: &KeySpec, batch_size: usize) {
        tracing::debug!(
            chunk = %self.chunk,
            shard = %self.shard,
            index = self.index,
            strategy = %self.strategy,
            buffered = self.buffered(),
            "finalizing queue slot"
        );
        let batches = self.prep(spec, batch_size);
        self.do_load(batches);
    }

    fn account_closed(&self, docs: usize) {
        LoadStats::add(&self.stats.fatal_docs, docs as u64);
        tracing::error!(
            chunk = %self.chunk,
            docs,
            "dispatch queue is closed; dropping batch"
        );
    }
}

fn rebatch(pairs: Vec<(ShardKey, Value)>, batch_size: usize) -> Vec<Batch> {
    let mut batches = Vec::with_capacity(pairs.len() / batch_size + 1);
    let mut pairs = pairs.into_iter().peekable();
    while pairs.peek().is_some() {
        batches.push(Batch::from_pairs(pairs.by_ref().take(batch_size).collect()));
    }
    batches
}

/// Dispatcher owns one QueueSlot per chunk of the frozen chunk map,
/// in chunk-map order, and computes the waterfall finalization order.
pub struct Dispatcher {
    spec: KeySpec,
    slots: Vec<Arc<QueueSlot>>,
}

impl Dispatcher {
    pub fn new(
        map: &ChunkMap,
        pools: &HashMap<ShardId, Arc<EndPointPool>>,
        settings: &LoadSettings,
        ram_max: u64,
        stats: Arc<LoadStats>,
    ) -> Self {
        let shards = map.shards();

        // Budget the sampled RAM across this load's disk slots.
        let mut counts: HashMap<ShardId, usize> = HashMap::new();
        let disk_slots = map
            .chunks()
            .iter()
            .filter(|chunk| {
                let index = counts.entry(chunk.shard.clone()).or_default();
                let strategy = settings.queue_plan.strategy_for(*index);
                *index += 1;
                strategy == Strategy::Disk
            })
            .count();
        let per_slot_budget = (ram_max / disk_slots.max(1) as u64).max(1) as usize;

        let mut per_shard_index: HashMap<ShardId, usize> = HashMap::new();
        let slots = map
            .chunks()
            .iter()
            .map(|chunk| {
                let index_slot = per_shard_index.entry(chunk.shard.clone()).or_default();
                let index = *index_slot;
                *index_slot += 1;

                let strategy = settings.queue_plan.strategy_for(index);
                let spill = match (strategy, &settings.work_path) {
                    (Strategy::Disk, Some(work_path)) => Some(SpillState::new(
                        work_path.join(format!("slot-{}", chunk.id)),
                    )),
                    _ => None,
                };

                Arc::new(QueueSlot {
                    chunk: chunk.id.clone(),
                    shard: chunk.shard.clone(),
                    shard_ordinal: shards.iter().position(|s| *s == chunk.shard).unwrap(),
                    index,
                    strategy,
                    queue: BoundedQueue::new(settings.slot_queue_size),
                    pool: pools[&chunk.shard].clone(),
                    spill: Mutex::new(spill),
                    buffered_bytes: AtomicUsize::new(0),
                    spill_budget: per_slot_budget,
                    stats: stats.clone(),
                })
            })
            .collect();

        Self {
            spec: map.spec().clone(),
            slots,
        }
    }

    pub fn spec(&self) -> &KeySpec {
        &self.spec
    }

    pub fn slots(&self) -> &[Arc<QueueSlot>] {
        &self.slots
    }

    /// Route a sealed batch to the chunk's slot. Slot indices align
    /// with the chunk map's chunk order.
    pub fn push(&self, chunk_index: usize, batch: Batch) {
        self.slots[chunk_index].push(&self.spec, batch);
    }

    /// The finalization order: a shard's i-th slot precedes its
    /// (i+1)-th, and shards interleave round-robin so that no single
    /// shard is the last to drain.
    pub fn waterfall(&self) -> Vec<Arc<QueueSlot>> {
        let mut order = self.slots.clone();
        order.sort_by_key(|slot| (slot.index, slot.shard_ordinal));
        order
    }

    /// Refuse further batches on every slot.
    pub fn end_wait(&self) {
        for slot in &self.slots {
            slot.queue.end_wait();
        }
    }

    pub fn terminate(&self) {
        for slot in &self.slots {
            slot.queue.terminate();
        }
    }
}
