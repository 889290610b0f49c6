//! Incremental conversation analysis.
//!
//! Two artifact kinds are regenerated from the growing transcript: a
//! timeline of notable moments and a rolling summary. Regeneration is
//! expensive, so a scheduler gates calls on transcript growth and spacing,
//! and a generation counter makes sure a response that raced with a newer
//! request or a reset is thrown away instead of clobbering fresher state.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{Listeners, Subscription};
use crate::pipeline::SessionPhase;
use crate::protocol::{RegenerateRequest, RegenerateResponse};
use crate::transcript::{Speaker, TranscriptReader};
use crate::{ConfabLiveError, Result};

/// Category of a timeline moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    Milestone,
    Decision,
    TopicShift,
    ActionItem,
    Question,
    Agreement,
    SpeakerChange,
    KeyStatement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Medium,
    High,
}

/// One notable moment extracted from the conversation.
///
/// The backend keeps `id` stable across regenerations so events already on
/// screen do not jump when the set is replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: TimelineEventType,
    pub title: String,
    pub description: String,
    pub importance: Importance,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub speaker: Option<Speaker>,
    #[serde(default)]
    pub quoted_content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTimeline {
    pub events: Vec<TimelineEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub overview: String,
    pub key_points: Vec<String>,
    pub action_items: Vec<String>,
}

/// An artifact the analysis backend can regenerate incrementally.
pub trait AnalysisArtifact:
    Clone + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Path segment of the regenerate endpoint for this artifact.
    const KIND: &'static str;

    fn is_empty(&self) -> bool;
}

impl AnalysisArtifact for ConversationTimeline {
    const KIND: &'static str = "timeline";

    fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl AnalysisArtifact for ConversationSummary {
    const KIND: &'static str = "summary";

    fn is_empty(&self) -> bool {
        self.overview.is_empty() && self.key_points.is_empty() && self.action_items.is_empty()
    }
}

/// Regenerates an artifact from the full transcript plus the previous
/// artifact. Stateless per call.
#[async_trait]
pub trait ArtifactBackend<T: AnalysisArtifact>: Send + Sync {
    async fn regenerate(&self, request: RegenerateRequest<T>) -> Result<RegenerateResponse<T>>;
}

/// Regenerate endpoint of the product API.
pub struct HttpAnalysisBackend<T> {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> HttpAnalysisBackend<T> {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            // Regeneration goes through a language model; allow for slow calls.
            timeout: Duration::from_secs(30),
            _marker: PhantomData,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl<T: AnalysisArtifact> ArtifactBackend<T> for HttpAnalysisBackend<T> {
    async fn regenerate(&self, request: RegenerateRequest<T>) -> Result<RegenerateResponse<T>> {
        let url = format!("{}/analysis/{}/regenerate", self.base_url, T::KIND);
        let mut req = self.client.post(&url).timeout(self.timeout).json(&request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| ConfabLiveError::Analysis(e.to_string()))?
            .error_for_status()
            .map_err(|e| ConfabLiveError::Analysis(e.to_string()))?;
        response
            .json::<RegenerateResponse<T>>()
            .await
            .map_err(|e| ConfabLiveError::Analysis(e.to_string()))
    }
}

/// Gates controlling when a regeneration may run.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Minimum transcript words before the first call.
    pub min_words: usize,
    /// New lines required since the last successful call.
    pub min_new_lines: usize,
    /// Minimum spacing between call starts.
    pub min_interval: Duration,
    /// Background re-evaluation cadence.
    pub background_interval: Duration,
    /// Conversation type hint forwarded to the backend.
    pub conversation_type: Option<String>,
}

impl AnalysisConfig {
    pub fn timeline() -> Self {
        Self {
            min_words: 20,
            min_new_lines: 3,
            min_interval: Duration::from_secs(8),
            background_interval: Duration::from_secs(10),
            conversation_type: None,
        }
    }

    /// Summaries tolerate smaller increments than the timeline.
    pub fn summary() -> Self {
        Self {
            min_new_lines: 1,
            ..Self::timeline()
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self::timeline()
    }
}

/// Point-in-time view of a scheduler, also emitted to subscribers on every
/// applied update.
#[derive(Debug, Clone)]
pub struct AnalysisSnapshot<T> {
    pub artifact: T,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub in_flight: bool,
    pub generation: u64,
}

struct AnalysisState<T> {
    artifact: T,
    /// Characters of transcript the backend has consumed.
    last_processed_length: usize,
    /// Line count at the last applied response.
    lines_at_last_success: usize,
    last_dispatch: Option<Instant>,
    in_flight_token: Option<u64>,
    last_updated_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl<T: AnalysisArtifact> AnalysisState<T> {
    fn fresh() -> Self {
        Self {
            artifact: T::default(),
            last_processed_length: 0,
            lines_at_last_success: 0,
            last_dispatch: None,
            in_flight_token: None,
            last_updated_at: None,
            error: None,
        }
    }

    fn snapshot(&self, generation: &AtomicU64) -> AnalysisSnapshot<T> {
        AnalysisSnapshot {
            artifact: self.artifact.clone(),
            last_updated_at: self.last_updated_at,
            error: self.error.clone(),
            in_flight: self.in_flight_token.is_some(),
            generation: generation.load(Ordering::SeqCst),
        }
    }
}

struct BackgroundTask {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

struct SchedulerInner<T: AnalysisArtifact> {
    config: AnalysisConfig,
    backend: Arc<dyn ArtifactBackend<T>>,
    transcript: TranscriptReader,
    phase_rx: watch::Receiver<SessionPhase>,
    session_id: Option<String>,
    /// Bumped on every dispatch and every reset. A response is applied only
    /// if its request token is still the newest generation.
    generation: AtomicU64,
    state: TokioMutex<AnalysisState<T>>,
    listeners: Listeners<AnalysisSnapshot<T>>,
    background: Mutex<Option<BackgroundTask>>,
}

/// Decides when to regenerate one artifact kind and owns its latest value.
pub struct IncrementalAnalysisScheduler<T: AnalysisArtifact> {
    inner: Arc<SchedulerInner<T>>,
}

impl<T: AnalysisArtifact> Clone for IncrementalAnalysisScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: AnalysisArtifact> IncrementalAnalysisScheduler<T> {
    pub fn new(
        config: AnalysisConfig,
        backend: Arc<dyn ArtifactBackend<T>>,
        transcript: TranscriptReader,
        phase_rx: watch::Receiver<SessionPhase>,
        session_id: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                backend,
                transcript,
                phase_rx,
                session_id,
                generation: AtomicU64::new(0),
                state: TokioMutex::new(AnalysisState::fresh()),
                listeners: Listeners::new(),
                background: Mutex::new(None),
            }),
        }
    }

    /// Regenerate if the growth and spacing gates allow it. Returns whether
    /// a backend call was made.
    pub async fn evaluate(&self) -> bool {
        self.dispatch(false).await
    }

    /// User-requested regeneration. Skips every gate except one: the
    /// transcript must have grown since the last applied response.
    pub async fn refresh(&self) -> bool {
        self.dispatch(true).await
    }

    async fn dispatch(&self, force: bool) -> bool {
        let inner = &self.inner;
        if !force {
            let phase = *inner.phase_rx.borrow();
            if !matches!(phase, SessionPhase::Active | SessionPhase::Paused) {
                return false;
            }
        }

        let words = inner.transcript.word_count().await;
        let lines = inner.transcript.len().await;
        let text_len = inner.transcript.text_len().await;

        let (token, existing, last_len) = {
            let mut state = inner.state.lock().await;
            if force {
                if text_len <= state.last_processed_length {
                    return false;
                }
            } else {
                if words < inner.config.min_words {
                    return false;
                }
                if lines.saturating_sub(state.lines_at_last_success) < inner.config.min_new_lines {
                    return false;
                }
                if let Some(last) = state.last_dispatch {
                    if last.elapsed() < inner.config.min_interval {
                        return false;
                    }
                }
                if state.in_flight_token.is_some() {
                    return false;
                }
            }
            let token = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            state.in_flight_token = Some(token);
            state.last_dispatch = Some(Instant::now());
            (token, state.artifact.clone(), state.last_processed_length)
        };

        let request = RegenerateRequest {
            request_id: Uuid::new_v4(),
            session_id: inner.session_id.clone(),
            conversation_type: inner.config.conversation_type.clone(),
            transcript: inner.transcript.full_text().await,
            existing_artifact: existing,
            last_processed_length: last_len,
        };
        debug!(kind = T::KIND, token, force, "Dispatching regeneration");

        let result = inner.backend.regenerate(request).await;

        let mut state = inner.state.lock().await;
        let current = inner.generation.load(Ordering::SeqCst) == token;
        let mut notify = false;
        match result {
            Ok(response) if current => {
                state.artifact = response.artifact;
                state.last_processed_length = response.last_processed_length;
                state.lines_at_last_success = lines;
                state.last_updated_at = Some(Utc::now());
                state.error = None;
                notify = true;
                info!(
                    kind = T::KIND,
                    new_items = response.new_items_count,
                    "Analysis updated"
                );
            }
            Ok(_) => {
                debug!(kind = T::KIND, token, "Discarding stale response");
            }
            Err(e) if current => {
                warn!(kind = T::KIND, "Regeneration failed: {}", e);
                state.error = Some(e.to_string());
                notify = true;
            }
            Err(e) => {
                debug!(kind = T::KIND, token, "Ignoring stale failure: {}", e);
            }
        }
        if state.in_flight_token == Some(token) {
            state.in_flight_token = None;
        }
        let snapshot = state.snapshot(&inner.generation);
        drop(state);
        if notify {
            inner.listeners.emit(&snapshot);
        }
        true
    }

    /// Clear the artifact and invalidate any in-flight response.
    pub async fn reset(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock().await;
        let token = state.in_flight_token;
        *state = AnalysisState::fresh();
        // Leave the in-flight marker so the losing response still clears it.
        state.in_flight_token = token;
        let snapshot = state.snapshot(&self.inner.generation);
        drop(state);
        self.inner.listeners.emit(&snapshot);
        debug!(kind = T::KIND, "Analysis state reset");
    }

    /// Start the periodic re-evaluation timer. No-op when already running.
    pub fn start_background(&self) {
        let mut guard = self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let scheduler = self.clone();
        let interval = self.inner.config.background_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the cadence
            // starts one interval from now.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        scheduler.dispatch(false).await;
                    }
                }
            }
            debug!(kind = T::KIND, "Background analysis stopped");
        });
        *guard = Some(BackgroundTask {
            shutdown: shutdown_tx,
            handle,
        });
    }

    /// Stop the background timer and wait for any tick in progress.
    pub async fn stop(&self) {
        let task = self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.shutdown.send(());
            let _ = task.handle.await;
        }
    }

    pub async fn snapshot(&self) -> AnalysisSnapshot<T> {
        let state = self.inner.state.lock().await;
        state.snapshot(&self.inner.generation)
    }

    pub async fn artifact(&self) -> T {
        self.inner.state.lock().await.artifact.clone()
    }

    /// Observe applied updates, stored errors and resets.
    pub fn subscribe(
        &self,
        callback: impl Fn(&AnalysisSnapshot<T>) + Send + 'static,
    ) -> Subscription {
        self.inner.listeners.subscribe(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::{AccumulatorConfig, SharedTranscript};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    fn event(title: &str) -> TimelineEvent {
        TimelineEvent {
            id: format!("evt-{}", title),
            event_type: TimelineEventType::Decision,
            title: title.to_string(),
            description: String::new(),
            importance: Importance::Medium,
            timestamp: Utc::now(),
            speaker: None,
            quoted_content: None,
        }
    }

    /// Responds immediately with a single event titled after the call index.
    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ArtifactBackend<ConversationTimeline> for CountingBackend {
        async fn regenerate(
            &self,
            request: RegenerateRequest<ConversationTimeline>,
        ) -> Result<RegenerateResponse<ConversationTimeline>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(RegenerateResponse {
                artifact: ConversationTimeline {
                    events: vec![event(&format!("call-{}", call))],
                },
                last_processed_length: request.transcript.len(),
                new_items_count: 1,
                generated_at: Utc::now(),
            })
        }
    }

    /// Holds each call until the matching gate resolves with an artifact.
    struct GatedBackend {
        calls: AtomicUsize,
        gates: TokioMutex<VecDeque<oneshot::Receiver<ConversationTimeline>>>,
    }

    #[async_trait]
    impl ArtifactBackend<ConversationTimeline> for GatedBackend {
        async fn regenerate(
            &self,
            request: RegenerateRequest<ConversationTimeline>,
        ) -> Result<RegenerateResponse<ConversationTimeline>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.gates.lock().await.pop_front();
            let artifact = match gate {
                Some(rx) => rx
                    .await
                    .map_err(|_| ConfabLiveError::Analysis("gate dropped".to_string()))?,
                None => ConversationTimeline::default(),
            };
            Ok(RegenerateResponse {
                artifact,
                last_processed_length: request.transcript.len(),
                new_items_count: 1,
                generated_at: Utc::now(),
            })
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl ArtifactBackend<ConversationTimeline> for FailingBackend {
        async fn regenerate(
            &self,
            _request: RegenerateRequest<ConversationTimeline>,
        ) -> Result<RegenerateResponse<ConversationTimeline>> {
            Err(ConfabLiveError::Analysis("model overloaded".to_string()))
        }
    }

    struct Fixture {
        shared: SharedTranscript,
        phase_tx: watch::Sender<SessionPhase>,
        scheduler: IncrementalAnalysisScheduler<ConversationTimeline>,
    }

    fn fixture(
        backend: Arc<dyn ArtifactBackend<ConversationTimeline>>,
        phase: SessionPhase,
    ) -> Fixture {
        let shared = SharedTranscript::new(AccumulatorConfig::default());
        let (phase_tx, phase_rx) = watch::channel(phase);
        let scheduler = IncrementalAnalysisScheduler::new(
            AnalysisConfig::timeline(),
            backend,
            shared.reader(),
            phase_rx,
            Some("sess-1".to_string()),
        );
        Fixture {
            shared,
            phase_tx,
            scheduler,
        }
    }

    async fn seed(shared: &SharedTranscript, lines: &[&str]) {
        for line in lines {
            shared.append(line, Utc::now(), None, None).await;
        }
    }

    /// Three lines, 24 words: clears the word and line gates.
    async fn seed_enough(shared: &SharedTranscript) {
        seed(
            shared,
            &[
                "let's walk through the launch readiness checklist together",
                "engineering signed off on the rollback plan yesterday",
                "support needs one more week for macro updates",
            ],
        )
        .await;
    }

    async fn wait_for_calls(calls: &AtomicUsize, expected: usize) {
        for _ in 0..1000 {
            if calls.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("backend never reached {} calls", expected);
    }

    #[tokio::test]
    async fn test_word_threshold_triggers_single_dispatch() {
        let backend = Arc::new(CountingBackend::default());
        let fx = fixture(
            Arc::clone(&backend) as Arc<dyn ArtifactBackend<ConversationTimeline>>,
            SessionPhase::Active,
        );

        // 19 words over three lines: below the word gate.
        seed(
            &fx.shared,
            &[
                "the beta cohort doubled its usage last",
                "week and retention looks strong so",
                "far we should expand the rollout",
            ],
        )
        .await;
        assert!(!fx.scheduler.evaluate().await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        // One more word crosses the threshold.
        seed(&fx.shared, &["agreed"]).await;
        assert!(fx.scheduler.evaluate().await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        // An immediate re-evaluation is inside the spacing window.
        assert!(!fx.scheduler.evaluate().await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        let snapshot = fx.scheduler.snapshot().await;
        assert_eq!(snapshot.artifact.events.len(), 1);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn test_stale_response_is_discarded() {
        let (gate_a_tx, gate_a) = oneshot::channel();
        let (gate_b_tx, gate_b) = oneshot::channel();
        let backend = Arc::new(GatedBackend {
            calls: AtomicUsize::new(0),
            gates: TokioMutex::new(VecDeque::from([gate_a, gate_b])),
        });
        let fx = fixture(
            Arc::clone(&backend) as Arc<dyn ArtifactBackend<ConversationTimeline>>,
            SessionPhase::Active,
        );
        seed_enough(&fx.shared).await;

        let scheduler_a = fx.scheduler.clone();
        let call_a = tokio::spawn(async move { scheduler_a.evaluate().await });
        wait_for_calls(&backend.calls, 1).await;

        // A user refresh starts call B while A is still in flight.
        seed(&fx.shared, &["one more line for the refresh"]).await;
        let scheduler_b = fx.scheduler.clone();
        let call_b = tokio::spawn(async move { scheduler_b.refresh().await });
        wait_for_calls(&backend.calls, 2).await;

        // B resolves first and is applied.
        gate_b_tx
            .send(ConversationTimeline {
                events: vec![event("from-b")],
            })
            .expect("gate b");
        assert!(call_b.await.expect("join b"));
        assert_eq!(fx.scheduler.artifact().await.events[0].title, "from-b");

        // A resolves afterwards and must not overwrite B.
        gate_a_tx
            .send(ConversationTimeline {
                events: vec![event("from-a")],
            })
            .expect("gate a");
        assert!(call_a.await.expect("join a"));
        assert_eq!(fx.scheduler.artifact().await.events[0].title, "from-b");

        let snapshot = fx.scheduler.snapshot().await;
        assert!(!snapshot.in_flight);
    }

    #[tokio::test]
    async fn test_idle_phase_blocks_unforced_calls() {
        let backend = Arc::new(CountingBackend::default());
        let fx = fixture(
            Arc::clone(&backend) as Arc<dyn ArtifactBackend<ConversationTimeline>>,
            SessionPhase::Idle,
        );
        seed_enough(&fx.shared).await;

        assert!(!fx.scheduler.evaluate().await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        // A forced refresh works even while idle.
        assert!(fx.scheduler.refresh().await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_paused_phase_still_evaluates() {
        let backend = Arc::new(CountingBackend::default());
        let fx = fixture(
            Arc::clone(&backend) as Arc<dyn ArtifactBackend<ConversationTimeline>>,
            SessionPhase::Active,
        );
        seed_enough(&fx.shared).await;
        fx.phase_tx.send_replace(SessionPhase::Paused);

        assert!(fx.scheduler.evaluate().await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_spaces_out_calls() {
        let backend = Arc::new(CountingBackend::default());
        let fx = fixture(
            Arc::clone(&backend) as Arc<dyn ArtifactBackend<ConversationTimeline>>,
            SessionPhase::Active,
        );
        seed_enough(&fx.shared).await;
        assert!(fx.scheduler.evaluate().await);

        // New lines arrive, but the spacing window is still open.
        seed_enough(&fx.shared).await;
        assert!(!fx.scheduler.evaluate().await);

        time::sleep(Duration::from_secs(9)).await;
        assert!(fx.scheduler.evaluate().await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_new_lines_gate() {
        let backend = Arc::new(CountingBackend::default());
        let fx = fixture(
            Arc::clone(&backend) as Arc<dyn ArtifactBackend<ConversationTimeline>>,
            SessionPhase::Active,
        );
        seed_enough(&fx.shared).await;
        assert!(fx.scheduler.evaluate().await);
        time::sleep(Duration::from_secs(9)).await;

        seed(&fx.shared, &["one", "two"]).await;
        assert!(!fx.scheduler.evaluate().await);

        seed(&fx.shared, &["three"]).await;
        assert!(fx.scheduler.evaluate().await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_call_blocks_unforced_evaluation() {
        let (gate_tx, gate) = oneshot::channel();
        let backend = Arc::new(GatedBackend {
            calls: AtomicUsize::new(0),
            gates: TokioMutex::new(VecDeque::from([gate])),
        });
        let fx = fixture(
            Arc::clone(&backend) as Arc<dyn ArtifactBackend<ConversationTimeline>>,
            SessionPhase::Active,
        );
        seed_enough(&fx.shared).await;

        let scheduler = fx.scheduler.clone();
        let in_flight = tokio::spawn(async move { scheduler.evaluate().await });
        wait_for_calls(&backend.calls, 1).await;

        // Growth and spacing gates are satisfied; only the in-flight call
        // holds the next one back.
        seed_enough(&fx.shared).await;
        time::sleep(Duration::from_secs(9)).await;
        assert!(!fx.scheduler.evaluate().await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        gate_tx
            .send(ConversationTimeline::default())
            .expect("gate");
        assert!(in_flight.await.expect("join"));
    }

    #[tokio::test]
    async fn test_backend_error_is_stored_and_cleared() {
        let fx = fixture(Arc::new(FailingBackend), SessionPhase::Active);
        seed_enough(&fx.shared).await;

        assert!(fx.scheduler.evaluate().await);
        let snapshot = fx.scheduler.snapshot().await;
        assert!(snapshot
            .error
            .as_deref()
            .is_some_and(|e| e.contains("model overloaded")));
        assert!(snapshot.artifact.is_empty());
        assert!(!snapshot.in_flight);
    }

    #[tokio::test]
    async fn test_reset_discards_in_flight_response() {
        let (gate_tx, gate) = oneshot::channel();
        let backend = Arc::new(GatedBackend {
            calls: AtomicUsize::new(0),
            gates: TokioMutex::new(VecDeque::from([gate])),
        });
        let fx = fixture(
            Arc::clone(&backend) as Arc<dyn ArtifactBackend<ConversationTimeline>>,
            SessionPhase::Active,
        );
        seed_enough(&fx.shared).await;

        let scheduler = fx.scheduler.clone();
        let in_flight = tokio::spawn(async move { scheduler.evaluate().await });
        wait_for_calls(&backend.calls, 1).await;

        fx.scheduler.reset().await;
        gate_tx
            .send(ConversationTimeline {
                events: vec![event("late")],
            })
            .expect("gate");
        in_flight.await.expect("join");

        let snapshot = fx.scheduler.snapshot().await;
        assert!(snapshot.artifact.is_empty());
        assert!(!snapshot.in_flight);
    }

    #[tokio::test]
    async fn test_forced_refresh_requires_new_text() {
        let backend = Arc::new(CountingBackend::default());
        let fx = fixture(
            Arc::clone(&backend) as Arc<dyn ArtifactBackend<ConversationTimeline>>,
            SessionPhase::Active,
        );
        seed_enough(&fx.shared).await;
        assert!(fx.scheduler.refresh().await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        // Nothing new to process.
        assert!(!fx.scheduler.refresh().await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        seed(&fx.shared, &["fresh material arrived"]).await;
        assert!(fx.scheduler.refresh().await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_timer_evaluates_periodically() {
        let backend = Arc::new(CountingBackend::default());
        let fx = fixture(
            Arc::clone(&backend) as Arc<dyn ArtifactBackend<ConversationTimeline>>,
            SessionPhase::Active,
        );
        seed_enough(&fx.shared).await;
        fx.scheduler.start_background();

        time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        // Gates still apply: no new lines, so later ticks stay quiet.
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        fx.scheduler.stop().await;
        seed_enough(&fx.shared).await;
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_updates_reach_subscribers() {
        let backend = Arc::new(CountingBackend::default());
        let fx = fixture(
            Arc::clone(&backend) as Arc<dyn ArtifactBackend<ConversationTimeline>>,
            SessionPhase::Active,
        );
        seed_enough(&fx.shared).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = fx.scheduler.subscribe(move |snapshot| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(snapshot.artifact.events.len());
        });

        fx.scheduler.evaluate().await;
        let seen = seen.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(seen.as_slice(), &[1]);
    }

    #[tokio::test]
    async fn test_summary_config_uses_smaller_line_gate() {
        assert_eq!(AnalysisConfig::summary().min_new_lines, 1);
        assert_eq!(AnalysisConfig::timeline().min_new_lines, 3);
    }
}
