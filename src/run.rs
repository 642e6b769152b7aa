//! Generation run controller — one streaming AI session per posting.
//!
//! Liveness is enforced by a per-posting generation counter rather than by
//! blocking: `stop` and `regenerate` bump the counter, and the streaming
//! task discards any event whose captured counter value went stale. That
//! keeps `stop` fire-and-forget even when the underlying stream is slow to
//! unwind, and keeps a regenerated run's transcript free of leftover
//! chunks from its predecessor.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::db::Database;
use crate::error::{PipelineError, Result};
use crate::models::{GenerationRun, RunStatus};

/// One event from the underlying generation capability.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Error(String),
}

/// A live stream handed out by a backend. `cancel` is the best-effort
/// upstream cancellation signal; the backend's producer should give up
/// when it fires.
pub struct GenerationStream {
    pub events: mpsc::Receiver<StreamEvent>,
    pub cancel: Arc<Notify>,
}

/// The abstract "begin a generation, receive streamed tokens" capability.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn begin(&self, prompt: &str) -> anyhow::Result<GenerationStream>;
}

/// The consumer side refused a chunk (disconnected, closed, ...).
#[derive(Debug)]
pub struct SinkClosed;

/// Streaming transport adapter: delivers chunks to the caller in order.
/// Awaiting `deliver` is the controller's backpressure point.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn deliver(&self, posting_id: i64, chunk: &str) -> std::result::Result<(), SinkClosed>;
}

/// Writes chunks straight to the terminal as they stream in.
pub struct StdoutSink;

#[async_trait]
impl ChunkSink for StdoutSink {
    async fn deliver(&self, _posting_id: i64, chunk: &str) -> std::result::Result<(), SinkClosed> {
        use std::io::Write;
        print!("{}", chunk);
        std::io::stdout().flush().map_err(|_| SinkClosed)
    }
}

/// Run persistence as the controller sees it.
pub trait RunStore: Send + Sync {
    fn create_run(&self, posting_id: i64, generation: u64) -> Result<i64>;
    fn finish_run(&self, run: &GenerationRun) -> Result<()>;
}

impl RunStore for StdMutex<Database> {
    fn create_run(&self, posting_id: i64, generation: u64) -> Result<i64> {
        self.lock().unwrap().create_run(posting_id, generation)
    }

    fn finish_run(&self, run: &GenerationRun) -> Result<()> {
        self.lock().unwrap().finish_run(run)
    }
}

struct RunSlot {
    /// Live counter for this posting; survives across runs.
    generation: Arc<AtomicU64>,
    current: Option<Arc<StdMutex<GenerationRun>>>,
    /// Cancellation signal of the current backend stream.
    cancel: Arc<Notify>,
}

impl RunSlot {
    fn new() -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
            current: None,
            cancel: Arc::new(Notify::new()),
        }
    }
}

#[derive(Debug)]
pub struct RunHandle {
    pub run_id: i64,
    pub posting_id: i64,
    pub generation: u64,
    run: Arc<StdMutex<GenerationRun>>,
    task: JoinHandle<()>,
}

impl RunHandle {
    /// Wait for the streaming task to finish and return the final run
    /// record (completed, stopped or failed).
    pub async fn wait(self) -> GenerationRun {
        let _ = self.task.await;
        self.run.lock().unwrap().clone()
    }
}

pub struct RunController {
    store: Arc<dyn RunStore>,
    slots: Mutex<HashMap<i64, RunSlot>>,
}

impl RunController {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Start a run for a posting. Fails with `AlreadyStreaming` while a
    /// run for the same posting is live; terminal runs may be superseded
    /// freely.
    pub async fn start(
        &self,
        posting_id: i64,
        prompt: &str,
        backend: &dyn GenerationBackend,
        sink: Arc<dyn ChunkSink>,
    ) -> Result<RunHandle> {
        let mut slots = self.slots.lock().await;
        self.start_locked(&mut slots, posting_id, prompt, backend, sink).await
    }

    /// Stop the live run, if any. The caller-visible transition to
    /// `stopped` is immediate; the streaming task discovers it has been
    /// superseded on its own time. Returns whether a live run was stopped.
    pub async fn stop(&self, posting_id: i64) -> bool {
        let mut slots = self.slots.lock().await;
        self.stop_locked(&mut slots, posting_id)
    }

    /// Stop-then-start as one atomic step: no other caller can observe an
    /// intermediate status between the two, and the generation counter
    /// strictly increases whether or not a run was live.
    pub async fn regenerate(
        &self,
        posting_id: i64,
        prompt: &str,
        backend: &dyn GenerationBackend,
        sink: Arc<dyn ChunkSink>,
    ) -> Result<RunHandle> {
        let mut slots = self.slots.lock().await;
        let stopped = self.stop_locked(&mut slots, posting_id);
        if !stopped {
            slots
                .entry(posting_id)
                .or_insert_with(RunSlot::new)
                .generation
                .fetch_add(1, Ordering::AcqRel);
        }
        self.start_locked(&mut slots, posting_id, prompt, backend, sink).await
    }

    /// Current run record for a posting, if one was ever started in this
    /// process.
    pub async fn snapshot(&self, posting_id: i64) -> Option<GenerationRun> {
        let slots = self.slots.lock().await;
        slots
            .get(&posting_id)
            .and_then(|slot| slot.current.as_ref())
            .map(|run| run.lock().unwrap().clone())
    }

    pub async fn status(&self, posting_id: i64) -> RunStatus {
        self.snapshot(posting_id)
            .await
            .map(|run| run.status)
            .unwrap_or(RunStatus::Idle)
    }

    async fn start_locked(
        &self,
        slots: &mut HashMap<i64, RunSlot>,
        posting_id: i64,
        prompt: &str,
        backend: &dyn GenerationBackend,
        sink: Arc<dyn ChunkSink>,
    ) -> Result<RunHandle> {
        let slot = slots.entry(posting_id).or_insert_with(RunSlot::new);

        if let Some(current) = &slot.current {
            if current.lock().unwrap().status == RunStatus::Streaming {
                return Err(PipelineError::AlreadyStreaming { id: posting_id });
            }
        }

        let generation = slot.generation.load(Ordering::Acquire);
        let run_id = self.store.create_run(posting_id, generation)?;
        let run = Arc::new(StdMutex::new(GenerationRun {
            id: run_id,
            posting_id,
            status: RunStatus::Streaming,
            generation,
            chunks: Vec::new(),
            error: None,
        }));
        slot.current = Some(run.clone());

        let stream = match backend.begin(prompt).await {
            Ok(stream) => stream,
            Err(e) => {
                let snapshot = {
                    let mut r = run.lock().unwrap();
                    r.status = RunStatus::Failed;
                    r.error = Some(e.to_string());
                    r.clone()
                };
                if let Err(persist_err) = self.store.finish_run(&snapshot) {
                    warn!(run_id, error = %persist_err, "failed to persist failed run");
                }
                return Err(PipelineError::GenerationFailed {
                    run_id,
                    reason: e.to_string(),
                });
            }
        };
        slot.cancel = stream.cancel.clone();

        let task = tokio::spawn(stream_run(
            stream,
            generation,
            slot.generation.clone(),
            run.clone(),
            sink,
            self.store.clone(),
            posting_id,
        ));

        debug!(posting_id, run_id, generation, "generation run started");
        Ok(RunHandle {
            run_id,
            posting_id,
            generation,
            run,
            task,
        })
    }

    fn stop_locked(&self, slots: &mut HashMap<i64, RunSlot>, posting_id: i64) -> bool {
        let Some(slot) = slots.get_mut(&posting_id) else {
            return false;
        };
        let Some(run) = slot.current.clone() else {
            return false;
        };

        let snapshot = {
            let mut r = run.lock().unwrap();
            if r.status != RunStatus::Streaming {
                return false;
            }
            // bump first: anything still in flight from this stream is
            // stale the moment we release the lock
            slot.generation.fetch_add(1, Ordering::AcqRel);
            r.status = RunStatus::Stopped;
            r.clone()
        };

        // fire-and-forget towards the backend; never wait for the task
        slot.cancel.notify_waiters();

        if let Err(e) = self.store.finish_run(&snapshot) {
            warn!(run_id = snapshot.id, error = %e, "failed to persist stopped run");
        }
        debug!(posting_id, run_id = snapshot.id, "generation run stopped");
        true
    }
}

/// The streaming task: pull events from the backend, append and forward
/// chunks while the captured generation value is still live, discard
/// everything once superseded.
async fn stream_run(
    mut stream: GenerationStream,
    generation: u64,
    live: Arc<AtomicU64>,
    run: Arc<StdMutex<GenerationRun>>,
    sink: Arc<dyn ChunkSink>,
    store: Arc<dyn RunStore>,
    posting_id: i64,
) {
    while let Some(event) = stream.events.recv().await {
        match event {
            StreamEvent::Delta(chunk) => {
                {
                    let mut r = run.lock().unwrap();
                    if live.load(Ordering::Acquire) != generation {
                        debug!(posting_id, generation, "discarding stale chunk");
                        return;
                    }
                    r.chunks.push(chunk.clone());
                }
                if sink.deliver(posting_id, &chunk).await.is_err() {
                    // consumer went away; equivalent to stop
                    let snapshot = {
                        let mut r = run.lock().unwrap();
                        if live.load(Ordering::Acquire) != generation {
                            return;
                        }
                        live.fetch_add(1, Ordering::AcqRel);
                        r.status = RunStatus::Stopped;
                        r.clone()
                    };
                    stream.cancel.notify_waiters();
                    warn!(posting_id, run_id = snapshot.id, "transport rejected chunk; run stopped");
                    if let Err(e) = store.finish_run(&snapshot) {
                        warn!(run_id = snapshot.id, error = %e, "failed to persist stopped run");
                    }
                    return;
                }
            }
            StreamEvent::Done => {
                let snapshot = {
                    let mut r = run.lock().unwrap();
                    if live.load(Ordering::Acquire) != generation {
                        debug!(posting_id, generation, "discarding stale completion");
                        return;
                    }
                    r.status = RunStatus::Completed;
                    r.clone()
                };
                if let Err(e) = store.finish_run(&snapshot) {
                    warn!(run_id = snapshot.id, error = %e, "failed to persist completed run");
                }
                debug!(posting_id, run_id = snapshot.id, "generation run completed");
                return;
            }
            StreamEvent::Error(reason) => {
                let snapshot = {
                    let mut r = run.lock().unwrap();
                    if live.load(Ordering::Acquire) != generation {
                        return;
                    }
                    r.status = RunStatus::Failed;
                    r.error = Some(reason.clone());
                    r.clone()
                };
                warn!(posting_id, run_id = snapshot.id, %reason, "generation run failed");
                if let Err(e) = store.finish_run(&snapshot) {
                    warn!(run_id = snapshot.id, error = %e, "failed to persist failed run");
                }
                return;
            }
        }
    }

    // the backend dropped its sender without a Done; a cancelled stream
    // ends this way too, in which case the counter already moved on
    let snapshot = {
        let mut r = run.lock().unwrap();
        if live.load(Ordering::Acquire) != generation {
            return;
        }
        r.status = RunStatus::Failed;
        r.error = Some("stream ended without completion".to_string());
        r.clone()
    };
    warn!(posting_id, run_id = snapshot.id, "stream ended without completion");
    if let Err(e) = store.finish_run(&snapshot) {
        warn!(run_id = snapshot.id, error = %e, "failed to persist failed run");
    }
}
