use crate::dispatch::Dispatcher;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Drain every queue slot in waterfall order with a pool of finalizer
/// threads. Each thread claims the next slot, runs its strategy's prep,
/// and flushes it through the owning shard's end points; threads exit
/// when the list is empty.
pub fn run_waterfall(dispatcher: &Dispatcher, threads_max: usize, batch_size: usize) {
    let order = dispatcher.waterfall();
    tracing::info!(slots = order.len(), threads = threads_max, "starting waterfall finalization");
    let list = Mutex::new(VecDeque::from(order));

    std::thread::scope(|scope| {
        for _ in 0..threads_max.max(1) {
            scope.spawn(|| loop {
                let Some(slot) = list.lock().unwrap().pop_front() else {
                    return;
                };
                slot.finalize(dispatcher.spec(), batch_size);
            });
        }
    });
}
