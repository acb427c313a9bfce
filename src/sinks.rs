//! Result channel & sink fan-out (spec.md §4.H).
//!
//! Two sink kinds: synchronous (invoked in registration order on the
//! emitting task; a panic is caught and logged) and asynchronous
//! (submitted to a bounded worker-pool channel; overflow degrades to
//! direct execution on the submitting task rather than dropping work).
//! The bounded result channel has its own backpressure policy, separate
//! from ingress: near-full sends try to drop the oldest queued batch and
//! retry once before giving up, with a throttled summary log line.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::stats::StatsCollector;
use crate::value::Record;

pub type Batch = Vec<Record>;

/// A synchronous sink: runs on the emitting task, in registration order.
pub trait SyncSink: Send + Sync {
    fn handle(&self, batch: &[Record]);
}

/// An asynchronous sink: dispatched through the worker pool (or inline on
/// overflow).
#[async_trait]
pub trait AsyncSink: Send + Sync {
    async fn handle(&self, batch: Batch);
}

impl<F: Fn(&[Record]) + Send + Sync> SyncSink for F {
    fn handle(&self, batch: &[Record]) {
        self(batch)
    }
}

struct SinkTask {
    sink: Arc<dyn AsyncSink>,
    batch: Batch,
}

/// Emits one summary line either every ≥10s or every ≥1000 drops,
/// whichever comes first (spec.md §4.H).
struct ThrottledLogger {
    state: StdMutex<(Instant, u64)>,
}

impl ThrottledLogger {
    fn new() -> Self {
        Self {
            state: StdMutex::new((Instant::now(), 0)),
        }
    }

    fn note_drop(&self) {
        let mut state = self.state.lock().unwrap();
        state.1 += 1;
        let elapsed = state.0.elapsed();
        if state.1 >= 1000 || elapsed >= Duration::from_secs(10) {
            warn!(
                dropped = state.1,
                since_last_log_secs = elapsed.as_secs(),
                "result channel backpressure: dropping batches"
            );
            state.1 = 0;
            state.0 = Instant::now();
        }
    }
}

/// A shared, lockable handle to the result-channel receiver. Whoever
/// calls `recv` first gets the next batch — the external consumer
/// obtained via `Stream::results_chan` and the factory's fallback
/// drainer task are both holders of a clone, competing naturally so the
/// channel never backs up when nothing else is consuming it.
#[derive(Clone)]
pub struct ResultChannel {
    receiver: Arc<Mutex<mpsc::Receiver<Batch>>>,
}

impl ResultChannel {
    pub async fn recv(&self) -> Option<Batch> {
        self.receiver.lock().await.recv().await
    }
}

/// Bounded result queue plus sync/async sink fan-out (spec.md §4.H).
pub struct ResultFanout {
    sync_sinks: RwLock<Vec<Arc<dyn SyncSink>>>,
    async_sinks: RwLock<Vec<Arc<dyn AsyncSink>>>,
    task_tx: mpsc::Sender<SinkTask>,
    result_tx: mpsc::Sender<Batch>,
    result_rx: Arc<Mutex<mpsc::Receiver<Batch>>>,
    stats: Arc<StatsCollector>,
    drop_log: ThrottledLogger,
    worker_handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl ResultFanout {
    /// Builds the fan-out and immediately spawns `worker_count` sink
    /// workers (default 8, spec.md §4.H) pulling from the shared task
    /// channel.
    pub fn new(
        result_buffer_size: usize,
        sink_pool_size: usize,
        worker_count: usize,
        stats: Arc<StatsCollector>,
    ) -> Arc<Self> {
        let (result_tx, result_rx) = mpsc::channel(result_buffer_size.max(1));
        let (task_tx, task_rx) = mpsc::channel(sink_pool_size.max(1));
        let shared_rx = Arc::new(Mutex::new(task_rx));

        let mut handles = Vec::with_capacity(worker_count.max(1));
        for _ in 0..worker_count.max(1) {
            let shared_rx = shared_rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = shared_rx.lock().await;
                        rx.recv().await
                    };
                    match task {
                        Some(task) => task.sink.handle(task.batch).await,
                        None => break,
                    }
                }
            }));
        }

        Arc::new(Self {
            sync_sinks: RwLock::new(Vec::new()),
            async_sinks: RwLock::new(Vec::new()),
            task_tx,
            result_tx,
            result_rx: Arc::new(Mutex::new(result_rx)),
            stats,
            drop_log: ThrottledLogger::new(),
            worker_handles: StdMutex::new(handles),
        })
    }

    pub fn stop(&self) {
        for handle in self.worker_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    pub async fn add_sink(&self, sink: Arc<dyn SyncSink>) {
        self.sync_sinks.write().await.push(sink);
    }

    pub async fn add_async_sink(&self, sink: Arc<dyn AsyncSink>) {
        self.async_sinks.write().await.push(sink);
    }

    pub fn results_chan(&self) -> ResultChannel {
        ResultChannel {
            receiver: self.result_rx.clone(),
        }
    }

    pub fn result_chan_cap(&self) -> usize {
        self.result_tx.max_capacity()
    }

    pub fn result_chan_len(&self) -> usize {
        self.result_chan_cap().saturating_sub(self.result_tx.capacity())
    }

    pub fn sink_pool_cap(&self) -> usize {
        self.task_tx.max_capacity()
    }

    pub fn sink_pool_len(&self) -> usize {
        self.sink_pool_cap().saturating_sub(self.task_tx.capacity())
    }

    /// Runs the sync sinks, submits async-sink tasks, then pushes the
    /// batch onto the bounded result channel.
    pub async fn emit(&self, batch: Batch) {
        {
            let sinks = self.sync_sinks.read().await;
            for sink in sinks.iter() {
                let sink = sink.clone();
                let batch_ref = batch.clone();
                if let Err(panic) =
                    std::panic::catch_unwind(AssertUnwindSafe(|| sink.handle(&batch_ref)))
                {
                    error!(?panic, "synchronous sink panicked");
                }
            }
        }

        {
            let sinks = self.async_sinks.read().await;
            for sink in sinks.iter() {
                let task = SinkTask {
                    sink: sink.clone(),
                    batch: batch.clone(),
                };
                match self.task_tx.try_send(task) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(task))
                    | Err(mpsc::error::TrySendError::Closed(task)) => {
                        task.sink.handle(task.batch).await;
                    }
                }
            }
        }

        self.send_result(batch).await;
    }

    async fn send_result(&self, batch: Batch) {
        match self.result_tx.try_send(batch) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(batch)) => {
                let cap = self.result_tx.max_capacity() as f64;
                let usage = if cap > 0.0 {
                    1.0 - (self.result_tx.capacity() as f64 / cap)
                } else {
                    0.0
                };

                if usage > 0.9 {
                    let dropped_oldest = {
                        let mut rx = self.result_rx.lock().await;
                        rx.try_recv().ok()
                    };
                    if dropped_oldest.is_some() && self.result_tx.try_send(batch).is_ok() {
                        self.stats.inc_dropped();
                        self.drop_log.note_drop();
                        return;
                    }
                }

                self.stats.inc_dropped();
                self.drop_log.note_drop();
            }
        }
    }
}

impl crate::metrics::ChannelOccupancy for ResultFanout {
    fn result_chan_len(&self) -> usize {
        ResultFanout::result_chan_len(self)
    }
    fn result_chan_cap(&self) -> usize {
        ResultFanout::result_chan_cap(self)
    }
    fn sink_pool_len(&self) -> usize {
        ResultFanout::sink_pool_len(self)
    }
    fn sink_pool_cap(&self) -> usize {
        ResultFanout::sink_pool_cap(self)
    }
}
