//! Throttled transcript persistence.
//!
//! Each appended line notifies the queue; saves run at most once per
//! throttle window and always cover the contiguous slice between the
//! high-water mark and the length observed at notify time. A failed save
//! leaves the mark in place so the slice rides along with the next save.
//! There is no retry of its own.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::protocol::TranscriptLineRecord;
use crate::throttle::Throttle;
use crate::transcript::TranscriptReader;
use crate::{ConfabLiveError, Result};

/// Destination for transcript line batches.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn save_lines(&self, records: &[TranscriptLineRecord]) -> Result<()>;
}

/// Bulk persistence endpoint of the product API.
pub struct HttpTranscriptStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpTranscriptStore {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl TranscriptStore for HttpTranscriptStore {
    async fn save_lines(&self, records: &[TranscriptLineRecord]) -> Result<()> {
        let url = format!("{}/transcripts/lines/bulk", self.base_url);
        let mut request = self.client.post(&url).timeout(self.timeout).json(&records);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ConfabLiveError::Persistence(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| ConfabLiveError::Persistence(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Minimum spacing between saves.
    pub throttle_window: Duration,
    /// Per-request timeout for the bulk endpoint.
    pub request_timeout: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            throttle_window: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
        }
    }
}

enum PersistCommand {
    /// A line was appended; `length` is the transcript length at call time.
    Notify { length: usize },
    Flush { done: oneshot::Sender<()> },
    /// Drop pending work and rewind the high-water mark for a new session.
    Reset,
    Shutdown { done: oneshot::Sender<()> },
}

struct QueueShared {
    last_saved: AtomicUsize,
    saves: AtomicU64,
    last_error: Mutex<Option<String>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the persistence worker. Cheap to clone.
#[derive(Clone)]
pub struct ThrottledPersistenceQueue {
    tx: mpsc::UnboundedSender<PersistCommand>,
    shared: Arc<QueueShared>,
}

impl ThrottledPersistenceQueue {
    /// Spawn the worker. With no session id the queue accepts notifications
    /// but never saves.
    pub fn spawn(
        config: PersistenceConfig,
        session_id: Option<String>,
        transcript: TranscriptReader,
        store: Arc<dyn TranscriptStore>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(QueueShared {
            last_saved: AtomicUsize::new(0),
            saves: AtomicU64::new(0),
            last_error: Mutex::new(None),
            worker: Mutex::new(None),
        });
        let worker = PersistWorker {
            rx,
            throttle: Throttle::new(config.throttle_window),
            transcript,
            store,
            session_id,
            shared: Arc::clone(&shared),
        };
        let handle = tokio::spawn(worker.run());
        *shared
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Self { tx, shared }
    }

    /// Record that the transcript now has `length` lines. Fire and forget;
    /// the worker decides when a save actually runs.
    pub fn notify(&self, length: usize) {
        let _ = self.tx.send(PersistCommand::Notify { length });
    }

    /// Rewind for a fresh session. Must run after the transcript itself has
    /// been cleared; commands on the queue are processed in order, so a
    /// reset enqueued before the first notify of the new session wins.
    pub fn reset(&self) {
        let _ = self.tx.send(PersistCommand::Reset);
    }

    /// Save everything unsaved right now, bypassing the throttle window.
    /// Returns once the save attempt (if any) has completed.
    pub async fn flush_now(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .tx
            .send(PersistCommand::Flush { done: done_tx })
            .is_err()
        {
            return;
        }
        let _ = done_rx.await;
    }

    /// Flush and stop the worker. Idempotent.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .tx
            .send(PersistCommand::Shutdown { done: done_tx })
            .is_ok()
        {
            let _ = done_rx.await;
        }
        let handle = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Index one past the last line known to be stored.
    pub fn last_saved_index(&self) -> usize {
        self.shared.last_saved.load(Ordering::SeqCst)
    }

    pub fn saves_completed(&self) -> u64 {
        self.shared.saves.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct PersistWorker {
    rx: mpsc::UnboundedReceiver<PersistCommand>,
    throttle: Throttle<usize>,
    transcript: TranscriptReader,
    store: Arc<dyn TranscriptStore>,
    session_id: Option<String>,
    shared: Arc<QueueShared>,
}

impl PersistWorker {
    async fn run(mut self) {
        if self.session_id.is_none() {
            info!("No session id; transcript lines will not be persisted");
        }
        loop {
            let deadline = self.throttle.deadline();
            let wake = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(60));
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(PersistCommand::Notify { length }) => {
                        if let Some(target) = self.throttle.offer(length, Instant::now()) {
                            self.run_save(target).await;
                        }
                    }
                    Some(PersistCommand::Flush { done }) => {
                        self.flush_all().await;
                        let _ = done.send(());
                    }
                    Some(PersistCommand::Reset) => {
                        self.throttle.cancel();
                        self.shared.last_saved.store(0, Ordering::SeqCst);
                        *self
                            .shared
                            .last_error
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) = None;
                        debug!("Persistence watermark reset");
                    }
                    Some(PersistCommand::Shutdown { done }) => {
                        self.flush_all().await;
                        let _ = done.send(());
                        break;
                    }
                    None => break,
                },
                _ = time::sleep_until(wake), if deadline.is_some() => {
                    if let Some(target) = self.throttle.take_due(Instant::now()) {
                        self.run_save(target).await;
                    }
                }
            }
        }
        debug!("Persistence worker stopped");
    }

    /// Save up to the current transcript length, regardless of the window.
    async fn flush_all(&mut self) {
        self.throttle.cancel();
        let target = self.transcript.len().await;
        if self.run_save(target).await {
            self.throttle.mark_ran(Instant::now());
        }
    }

    /// Attempt one save covering `[last_saved, target)`. Returns whether a
    /// store call was made.
    async fn run_save(&mut self, target: usize) -> bool {
        let Some(session_id) = self.session_id.clone() else {
            return false;
        };
        let from = self.shared.last_saved.load(Ordering::SeqCst);
        if target <= from {
            return false;
        }
        let lines = self.transcript.snapshot_range(from, target).await;
        if lines.is_empty() {
            return false;
        }
        let records: Vec<TranscriptLineRecord> = lines
            .iter()
            .map(|line| TranscriptLineRecord::from_line(&session_id, line))
            .collect();

        match self.store.save_lines(&records).await {
            Ok(()) => {
                self.shared.last_saved.store(target, Ordering::SeqCst);
                self.shared.saves.fetch_add(1, Ordering::SeqCst);
                *self
                    .shared
                    .last_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = None;
                debug!(from, to = target, lines = records.len(), "Transcript slice saved");
            }
            Err(e) => {
                warn!(from, to = target, "Transcript save failed: {}", e);
                *self
                    .shared
                    .last_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
            }
        }
        true
    }
}
