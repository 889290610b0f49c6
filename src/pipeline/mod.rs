//! The conversation pipeline.
//!
//! Owns one of everything: capture, session client, transcript, persistence
//! queue, two analysis schedulers and the usage meter, and sequences them
//! through the session lifecycle. A single event loop consumes session
//! events so transcript mutation stays single-writer; teardown drains that
//! loop before the final flush so nothing decoded is left behind.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analysis::{
    AnalysisConfig, AnalysisSnapshot, ArtifactBackend, ConversationSummary, ConversationTimeline,
    HttpAnalysisBackend, IncrementalAnalysisScheduler,
};
use crate::audio::{AudioCaptureStreamer, AudioSource, CaptureConfig};
use crate::events::{Listeners, Subscription};
use crate::persist::{
    HttpTranscriptStore, PersistenceConfig, ThrottledPersistenceQueue, TranscriptStore,
};
use crate::protocol::{SessionSettings, UsageLimits};
use crate::session::{
    ConnectionState, SessionEvent, TranscriptionSessionClient, TransportConnector, WsConnector,
};
use crate::transcript::{
    AccumulatorConfig, SharedTranscript, TalkStats, TranscriptLine, TranscriptReader,
};
use crate::usage::{HttpMeteringBackend, MeteringBackend, UsageEvent, UsageMeter, UsageMeterConfig, UsageSnapshot};
use crate::{ConfabLiveError, Result};

/// Lifecycle of the pipeline as a whole, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Active,
    Paused,
    Error,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Active => "active",
            SessionPhase::Paused => "paused",
            SessionPhase::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Where the product API lives.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub realtime_endpoint: String,
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.confab.app/v1".to_string(),
            realtime_endpoint: "wss://api.confab.app/v1/transcribe".to_string(),
            api_key: None,
        }
    }
}

/// The swappable backends behind the pipeline. Production code uses
/// [`PipelineBackends::live`]; tests plug in fakes.
pub struct PipelineBackends {
    pub audio: Arc<dyn AudioSource>,
    pub connector: Arc<dyn TransportConnector>,
    pub store: Arc<dyn TranscriptStore>,
    pub timeline: Arc<dyn ArtifactBackend<ConversationTimeline>>,
    pub summary: Arc<dyn ArtifactBackend<ConversationSummary>>,
    pub metering: Arc<dyn MeteringBackend>,
}

impl PipelineBackends {
    /// Real microphone plus the HTTP/WebSocket backends of the product API.
    /// Capture uses [`CaptureConfig::default`]; swap the `audio` field to
    /// pick a device.
    pub fn live(api: &ApiConfig) -> Self {
        Self {
            audio: Arc::new(AudioCaptureStreamer::new(CaptureConfig::default())),
            connector: Arc::new(WsConnector::new(
                api.realtime_endpoint.clone(),
                api.api_key.clone(),
            )),
            store: Arc::new(HttpTranscriptStore::new(
                api.base_url.clone(),
                api.api_key.clone(),
            )),
            timeline: Arc::new(HttpAnalysisBackend::<ConversationTimeline>::new(
                api.base_url.clone(),
                api.api_key.clone(),
            )),
            summary: Arc::new(HttpAnalysisBackend::<ConversationSummary>::new(
                api.base_url.clone(),
                api.api_key.clone(),
            )),
            metering: Arc::new(HttpMeteringBackend::new(
                api.base_url.clone(),
                api.api_key.clone(),
            )),
        }
    }
}

/// Behavior knobs for one pipeline instance. Endpoints and credentials live
/// in [`ApiConfig`]; capture hardware selection lives with the audio backend.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Server-side session identifier. Without one, persistence and usage
    /// reporting are disabled while everything local still works.
    pub session_id: Option<String>,
    pub settings: SessionSettings,
    pub accumulator: AccumulatorConfig,
    pub persistence: PersistenceConfig,
    pub timeline: AnalysisConfig,
    pub summary: AnalysisConfig,
    pub usage: UsageMeterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            session_id: None,
            settings: SessionSettings::default(),
            accumulator: AccumulatorConfig::default(),
            persistence: PersistenceConfig::default(),
            timeline: AnalysisConfig::timeline(),
            summary: AnalysisConfig::summary(),
            usage: UsageMeterConfig::default(),
        }
    }
}

/// Everything the UI layer needs to observe.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    PhaseChanged(SessionPhase),
    /// A finalized transcript line was appended.
    Line(TranscriptLine),
    /// In-progress recognition for the live caption; not yet part of the
    /// transcript.
    PartialTranscript(String),
    TimelineUpdated,
    SummaryUpdated,
    Usage(UsageEvent),
    Error(String),
}

/// Counters for the status line.
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub phase: SessionPhase,
    pub lines: usize,
    pub words: usize,
    pub talk: TalkStats,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub saves_completed: u64,
    pub session_seconds: u64,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {} lines, {} words ({}) | {} frames / {} KiB sent | {} saves | {}s recorded",
            self.phase,
            self.lines,
            self.words,
            self.talk,
            self.frames_sent,
            self.bytes_sent / 1024,
            self.saves_completed,
            self.session_seconds
        )
    }
}

enum ControlCommand {
    /// Ack once every session event queued before this command is handled.
    Drain(oneshot::Sender<()>),
    Shutdown,
}

struct PipelineCore {
    audio: Arc<dyn AudioSource>,
    client: Arc<TranscriptionSessionClient>,
    transcript: SharedTranscript,
    persistence: ThrottledPersistenceQueue,
    timeline: IncrementalAnalysisScheduler<ConversationTimeline>,
    summary: IncrementalAnalysisScheduler<ConversationSummary>,
    usage: UsageMeter,
    phase_tx: Arc<watch::Sender<SessionPhase>>,
    listeners: Listeners<PipelineEvent>,
}

impl PipelineCore {
    fn phase(&self) -> SessionPhase {
        *self.phase_tx.borrow()
    }

    fn set_phase(&self, phase: SessionPhase) {
        let changed = *self.phase_tx.borrow() != phase;
        self.phase_tx.send_replace(phase);
        if changed {
            info!(%phase, "Pipeline phase changed");
            self.listeners.emit(&PipelineEvent::PhaseChanged(phase));
        }
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => debug!("Transcription session acknowledged"),
            SessionEvent::Transcript(event) => {
                if event.is_final {
                    let line = self
                        .transcript
                        .append(&event.text, event.timestamp, None, event.confidence)
                        .await;
                    if let Some(line) = line {
                        let length = self.transcript.len().await;
                        self.persistence.notify(length);
                        self.listeners.emit(&PipelineEvent::Line(line));
                        // Analysis can stall on a slow model; never hold up
                        // the transcript for it.
                        let timeline = self.timeline.clone();
                        tokio::spawn(async move { timeline.evaluate().await });
                        let summary = self.summary.clone();
                        tokio::spawn(async move { summary.evaluate().await });
                    }
                } else {
                    self.listeners
                        .emit(&PipelineEvent::PartialTranscript(event.text));
                }
            }
            SessionEvent::Disconnected => {
                if matches!(self.phase(), SessionPhase::Active | SessionPhase::Paused) {
                    let reason = "transcription session disconnected";
                    self.listeners
                        .emit(&PipelineEvent::Error(reason.to_string()));
                    self.handle_transport_loss(reason).await;
                }
            }
            SessionEvent::Error(message) => {
                self.listeners
                    .emit(&PipelineEvent::Error(message.clone()));
                let lost = matches!(self.client.state(), ConnectionState::Error)
                    && matches!(self.phase(), SessionPhase::Active | SessionPhase::Paused);
                if lost {
                    self.handle_transport_loss(&message).await;
                }
            }
        }
    }

    /// The connection died mid-session: keep what we have, stop everything
    /// that produces more.
    async fn handle_transport_loss(&self, reason: &str) {
        warn!("Transport lost: {}", reason);
        let _ = self.audio.release();
        self.persistence.flush_now().await;
        self.timeline.stop().await;
        self.summary.stop().await;
        self.usage.stop_tracking().await;
        self.set_phase(SessionPhase::Error);
    }
}

async fn run_event_loop(
    core: Arc<PipelineCore>,
    mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    mut control_rx: mpsc::UnboundedReceiver<ControlCommand>,
) {
    loop {
        tokio::select! {
            // Session events first: a drain ack must not overtake them.
            biased;
            event = session_rx.recv() => match event {
                Some(event) => core.handle_session_event(event).await,
                None => break,
            },
            command = control_rx.recv() => match command {
                Some(ControlCommand::Drain(ack)) => {
                    let _ = ack.send(());
                }
                Some(ControlCommand::Shutdown) | None => break,
            },
        }
    }
    debug!("Pipeline event loop stopped");
}

/// Drives one live conversation end to end.
///
/// Construct inside a tokio runtime; the event loop and the persistence
/// worker are spawned immediately.
pub struct ConversationPipeline {
    config: PipelineConfig,
    core: Arc<PipelineCore>,
    phase_rx: watch::Receiver<SessionPhase>,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    audio_pump: Mutex<Option<JoinHandle<()>>>,
    _forwarders: [Subscription; 3],
}

impl ConversationPipeline {
    pub fn new(config: PipelineConfig, backends: PipelineBackends) -> Self {
        let transcript = SharedTranscript::new(config.accumulator.clone());
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Idle);
        let phase_tx = Arc::new(phase_tx);

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let client = Arc::new(TranscriptionSessionClient::new(
            Arc::clone(&backends.connector),
            config.settings.clone(),
            session_tx,
        ));
        let persistence = ThrottledPersistenceQueue::spawn(
            config.persistence.clone(),
            config.session_id.clone(),
            transcript.reader(),
            Arc::clone(&backends.store),
        );
        let timeline = IncrementalAnalysisScheduler::new(
            config.timeline.clone(),
            Arc::clone(&backends.timeline),
            transcript.reader(),
            phase_rx.clone(),
            config.session_id.clone(),
        );
        let summary = IncrementalAnalysisScheduler::new(
            config.summary.clone(),
            Arc::clone(&backends.summary),
            transcript.reader(),
            phase_rx.clone(),
            config.session_id.clone(),
        );
        let usage = UsageMeter::new(config.usage.clone(), Arc::clone(&backends.metering));
        let listeners = Listeners::new();

        let forward = listeners.clone();
        let timeline_sub = timeline.subscribe(move |_| forward.emit(&PipelineEvent::TimelineUpdated));
        let forward = listeners.clone();
        let summary_sub = summary.subscribe(move |_| forward.emit(&PipelineEvent::SummaryUpdated));
        let forward = listeners.clone();
        let usage_sub =
            usage.subscribe(move |event| forward.emit(&PipelineEvent::Usage(event.clone())));

        let core = Arc::new(PipelineCore {
            audio: backends.audio,
            client,
            transcript,
            persistence,
            timeline,
            summary,
            usage,
            phase_tx,
            listeners,
        });

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let event_loop = tokio::spawn(run_event_loop(Arc::clone(&core), session_rx, control_rx));

        Self {
            config,
            core,
            phase_rx,
            control_tx,
            event_loop: Mutex::new(Some(event_loop)),
            audio_pump: Mutex::new(None),
            _forwarders: [timeline_sub, summary_sub, usage_sub],
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase_rx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase_rx.clone()
    }

    /// Observe transcript lines, artifact updates, usage and errors.
    pub fn subscribe(&self, callback: impl Fn(&PipelineEvent) + Send + 'static) -> Subscription {
        self.core.listeners.subscribe(callback)
    }

    pub fn transcript_reader(&self) -> TranscriptReader {
        self.core.transcript.reader()
    }

    pub async fn timeline_snapshot(&self) -> AnalysisSnapshot<ConversationTimeline> {
        self.core.timeline.snapshot().await
    }

    pub async fn summary_snapshot(&self) -> AnalysisSnapshot<ConversationSummary> {
        self.core.summary.snapshot().await
    }

    pub async fn usage_snapshot(&self) -> UsageSnapshot {
        self.core.usage.snapshot().await
    }

    /// User-requested timeline regeneration.
    pub async fn refresh_timeline(&self) -> bool {
        self.core.timeline.refresh().await
    }

    /// User-requested summary regeneration.
    pub async fn refresh_summary(&self) -> bool {
        self.core.summary.refresh().await
    }

    pub async fn refresh_usage_limits(&self) -> Result<UsageLimits> {
        self.core.usage.refresh_limits().await
    }

    /// Tell the meter whether the UI surface is visible.
    pub fn set_ui_visible(&self, visible: bool) {
        self.core.usage.set_visible(visible);
    }

    pub async fn stats(&self) -> PipelineStats {
        PipelineStats {
            phase: self.phase(),
            lines: self.core.transcript.len().await,
            words: self.core.transcript.word_count().await,
            talk: self.core.transcript.talk_stats().await,
            frames_sent: self.core.client.frames_sent(),
            bytes_sent: self.core.client.bytes_sent(),
            saves_completed: self.core.persistence.saves_completed(),
            session_seconds: self.core.usage.snapshot().await.session_seconds,
        }
    }

    /// Start capturing, transcribing, persisting, analyzing and metering.
    ///
    /// No-op when a session is already running. Audio starts first so
    /// permission problems surface before anything touches the network.
    pub async fn start_session(&self) -> Result<()> {
        if matches!(self.phase(), SessionPhase::Active | SessionPhase::Paused) {
            debug!("Session already running; start ignored");
            return Ok(());
        }
        info!(
            session = self.config.session_id.as_deref().unwrap_or("-"),
            "Starting conversation session"
        );

        match self.core.usage.refresh_limits().await {
            Ok(limits) if !limits.can_record => {
                warn!("Monthly recording limit reached; refusing to start");
                return Err(ConfabLiveError::Metering(
                    "monthly recording limit reached".to_string(),
                ));
            }
            Ok(limits) => debug!(remaining = limits.minutes_remaining, "Usage limits ok"),
            Err(e) => debug!("Limit preflight skipped: {}", e),
        }

        self.core.transcript.clear().await;
        self.core.persistence.reset();
        self.core.timeline.reset().await;
        self.core.summary.reset().await;
        self.core
            .usage
            .begin_session(self.config.session_id.clone())
            .await;
        if let Some(stale) = self
            .audio_pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            stale.abort();
        }

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if let Err(e) = self.core.audio.start(frames_tx) {
            self.core.set_phase(SessionPhase::Error);
            self.core
                .listeners
                .emit(&PipelineEvent::Error(e.to_string()));
            return Err(e);
        }

        if let Err(e) = self.core.client.connect().await {
            let _ = self.core.audio.release();
            self.core.set_phase(SessionPhase::Error);
            return Err(e);
        }
        if let Err(e) = self.core.client.start_streaming() {
            let _ = self.core.client.disconnect().await;
            let _ = self.core.audio.release();
            self.core.set_phase(SessionPhase::Error);
            return Err(e);
        }

        let client = Arc::clone(&self.core.client);
        let pump = tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                if client.send_audio(&frame).is_err() {
                    break;
                }
            }
            debug!("Audio pump finished");
        });
        *self
            .audio_pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(pump);

        self.core.timeline.start_background();
        self.core.summary.start_background();
        self.core.usage.start_tracking();
        self.core.set_phase(SessionPhase::Active);
        info!("Session active");
        Ok(())
    }

    /// Wind the session down, keeping everything already transcribed.
    ///
    /// Order matters: capture stops and the billable clock freezes first,
    /// the commit flushes the backend, the event queue drains, and only
    /// then does persistence finalize. Every step tolerates being called
    /// after a transport loss.
    pub async fn stop_session(&self) -> Result<()> {
        if matches!(self.phase(), SessionPhase::Idle) {
            return Ok(());
        }
        info!("Stopping conversation session");

        let _ = self.core.audio.release();
        let pump = self
            .audio_pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        // The billable clock measures capture time; freeze it with the
        // microphone, not after the network drain.
        self.core.usage.stop_tracking().await;
        if let Err(e) = self.core.client.disconnect().await {
            warn!("Session teardown error: {}", e);
        }
        self.drain_session_events().await;
        self.core.persistence.flush_now().await;
        self.core.timeline.stop().await;
        self.core.summary.stop().await;

        let words = self.core.transcript.word_count().await;
        if words < self.config.timeline.min_words {
            debug!(words, "Discarding analysis of a too-short session");
            self.core.timeline.reset().await;
        }
        if words < self.config.summary.min_words {
            self.core.summary.reset().await;
        }

        self.core.set_phase(SessionPhase::Idle);
        info!("Session stopped");
        Ok(())
    }

    /// Suspend capture and the usage clock without closing the connection.
    pub async fn pause(&self) -> Result<()> {
        if !matches!(self.phase(), SessionPhase::Active) {
            return Ok(());
        }
        let _ = self.core.audio.pause();
        self.core.persistence.flush_now().await;
        self.core.usage.set_suspended(true);
        self.core.set_phase(SessionPhase::Paused);
        Ok(())
    }

    /// Resume after [`ConversationPipeline::pause`]. Fails if the
    /// transcription connection did not survive the pause.
    pub async fn resume(&self) -> Result<()> {
        if !matches!(self.phase(), SessionPhase::Paused) {
            return Ok(());
        }
        if !matches!(
            self.core.client.state(),
            ConnectionState::Open | ConnectionState::Streaming
        ) {
            self.core.set_phase(SessionPhase::Error);
            return Err(ConfabLiveError::NotConnected);
        }
        let _ = self.core.audio.resume();
        self.core.usage.set_suspended(false);
        self.core.set_phase(SessionPhase::Active);
        Ok(())
    }

    /// Stop the session and shut down the workers. The pipeline cannot be
    /// used afterwards.
    pub async fn close(&self) {
        let _ = self.stop_session().await;
        self.core.persistence.shutdown().await;
        let _ = self.control_tx.send(ControlCommand::Shutdown);
        let handle = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Pipeline closed");
    }

    /// Barrier: returns once every session event queued so far is handled.
    async fn drain_session_events(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .control_tx
            .send(ControlCommand::Drain(ack_tx))
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        ClientMessage, RegenerateRequest, RegenerateResponse, ServerMessage, TranscriptLineRecord,
        UsageReport, UsageReportAck,
    };
    use crate::session::{MessageSink, MessageSource};
    use crate::AnalysisArtifact;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::marker::PhantomData;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex as TokioMutex;
    use tokio::time;

    #[derive(Default)]
    struct FakeAudio {
        frames_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
        active: AtomicBool,
        paused: AtomicBool,
        starts: AtomicUsize,
    }

    impl FakeAudio {
        fn emit_frame(&self, frame: Vec<u8>) {
            let guard = self.frames_tx.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(frame);
            }
        }

        fn is_paused(&self) -> bool {
            self.paused.load(Ordering::SeqCst)
        }
    }

    impl AudioSource for FakeAudio {
        fn start(&self, frames: mpsc::UnboundedSender<Vec<u8>>) -> Result<()> {
            if self.active.swap(true, Ordering::SeqCst) {
                return Err(ConfabLiveError::CaptureActive);
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.paused.store(false, Ordering::SeqCst);
            *self.frames_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(frames);
            Ok(())
        }

        fn pause(&self) -> Result<()> {
            self.paused.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn resume(&self) -> Result<()> {
            self.paused.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self) -> Result<()> {
            self.active.store(false, Ordering::SeqCst);
            self.frames_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        fn current_level(&self) -> f32 {
            0.0
        }
    }

    struct DeniedAudio;

    impl AudioSource for DeniedAudio {
        fn start(&self, _frames: mpsc::UnboundedSender<Vec<u8>>) -> Result<()> {
            Err(ConfabLiveError::Permission(
                "microphone permission denied".to_string(),
            ))
        }

        fn pause(&self) -> Result<()> {
            Ok(())
        }

        fn resume(&self) -> Result<()> {
            Ok(())
        }

        fn release(&self) -> Result<()> {
            Ok(())
        }

        fn is_active(&self) -> bool {
            false
        }

        fn current_level(&self) -> f32 {
            0.0
        }
    }

    struct FakeSink {
        sent: Arc<TokioMutex<Vec<ClientMessage>>>,
    }

    #[async_trait]
    impl MessageSink for FakeSink {
        async fn send(&mut self, message: ClientMessage) -> Result<()> {
            self.sent.lock().await.push(message);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeSource {
        rx: mpsc::UnboundedReceiver<Result<ServerMessage>>,
    }

    #[async_trait]
    impl MessageSource for FakeSource {
        async fn next_message(&mut self) -> Option<Result<ServerMessage>> {
            self.rx.recv().await
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        sent: Arc<TokioMutex<Vec<ClientMessage>>>,
        server_tx: Mutex<Option<mpsc::UnboundedSender<Result<ServerMessage>>>>,
        connects: AtomicUsize,
    }

    impl FakeTransport {
        fn push_final(&self, text: &str) {
            let guard = self.server_tx.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(Ok(ServerMessage::TranscriptCompleted {
                    text: text.to_string(),
                    confidence: Some(0.9),
                }));
            }
        }

        fn push_delta(&self, text: &str) {
            let guard = self.server_tx.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(Ok(ServerMessage::TranscriptDelta {
                    text: text.to_string(),
                    confidence: None,
                }));
            }
        }

        fn drop_server(&self) {
            self.server_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
    }

    #[async_trait]
    impl TransportConnector for FakeTransport {
        async fn connect(&self) -> Result<(Box<dyn MessageSink>, Box<dyn MessageSource>)> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            *self.server_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
            Ok((
                Box::new(FakeSink {
                    sent: Arc::clone(&self.sent),
                }),
                Box::new(FakeSource { rx }),
            ))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        batches: TokioMutex<Vec<Vec<TranscriptLineRecord>>>,
    }

    #[async_trait]
    impl TranscriptStore for MemoryStore {
        async fn save_lines(&self, records: &[TranscriptLineRecord]) -> Result<()> {
            self.batches.lock().await.push(records.to_vec());
            Ok(())
        }
    }

    struct StubBackend<T> {
        calls: AtomicUsize,
        _marker: PhantomData<fn() -> T>,
    }

    impl<T> StubBackend<T> {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                _marker: PhantomData,
            }
        }
    }

    #[async_trait]
    impl<T: AnalysisArtifact> ArtifactBackend<T> for StubBackend<T> {
        async fn regenerate(&self, request: RegenerateRequest<T>) -> Result<RegenerateResponse<T>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RegenerateResponse {
                artifact: T::default(),
                last_processed_length: request.transcript.len(),
                new_items_count: 0,
                generated_at: Utc::now(),
            })
        }
    }

    struct StubMetering {
        can_record: bool,
        reports: AtomicUsize,
    }

    #[async_trait]
    impl MeteringBackend for StubMetering {
        async fn record_usage(&self, _report: UsageReport) -> Result<UsageReportAck> {
            self.reports.fetch_add(1, Ordering::SeqCst);
            Ok(UsageReportAck {
                total_minutes_used: 1,
            })
        }

        async fn fetch_limits(&self) -> Result<UsageLimits> {
            Ok(UsageLimits {
                minutes_used: 10,
                minutes_limit: 600,
                minutes_remaining: 590,
                percentage_used: 1.7,
                can_record: self.can_record,
            })
        }
    }

    struct Fixture {
        audio: Arc<FakeAudio>,
        transport: Arc<FakeTransport>,
        store: Arc<MemoryStore>,
        timeline: Arc<StubBackend<ConversationTimeline>>,
        summary: Arc<StubBackend<ConversationSummary>>,
        metering: Arc<StubMetering>,
        pipeline: ConversationPipeline,
    }

    fn fixture_with(audio: Arc<dyn AudioSource>, can_record: bool) -> Fixture {
        let fake_audio = Arc::new(FakeAudio::default());
        let transport = Arc::new(FakeTransport::default());
        let store = Arc::new(MemoryStore::default());
        let timeline = Arc::new(StubBackend::<ConversationTimeline>::new());
        let summary = Arc::new(StubBackend::<ConversationSummary>::new());
        let metering = Arc::new(StubMetering {
            can_record,
            reports: AtomicUsize::new(0),
        });
        let backends = PipelineBackends {
            audio,
            connector: Arc::clone(&transport) as Arc<dyn TransportConnector>,
            store: Arc::clone(&store) as Arc<dyn TranscriptStore>,
            timeline: Arc::clone(&timeline) as Arc<dyn ArtifactBackend<ConversationTimeline>>,
            summary: Arc::clone(&summary) as Arc<dyn ArtifactBackend<ConversationSummary>>,
            metering: Arc::clone(&metering) as Arc<dyn MeteringBackend>,
        };
        let config = PipelineConfig {
            session_id: Some("sess-1".to_string()),
            ..PipelineConfig::default()
        };
        Fixture {
            audio: fake_audio,
            transport,
            store,
            timeline,
            summary,
            metering,
            pipeline: ConversationPipeline::new(config, backends),
        }
    }

    fn fixture() -> Fixture {
        let audio = Arc::new(FakeAudio::default());
        let mut fx = fixture_with(Arc::clone(&audio) as Arc<dyn AudioSource>, true);
        fx.audio = audio;
        fx
    }

    fn collect(pipeline: &ConversationPipeline) -> (Arc<Mutex<Vec<String>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = pipeline.subscribe(move |event| {
            let label = match event {
                PipelineEvent::PhaseChanged(phase) => format!("phase:{}", phase),
                PipelineEvent::Line(line) => format!("line:{}", line.text),
                PipelineEvent::PartialTranscript(text) => format!("partial:{}", text),
                PipelineEvent::TimelineUpdated => "timeline".to_string(),
                PipelineEvent::SummaryUpdated => "summary".to_string(),
                PipelineEvent::Usage(_) => "usage".to_string(),
                PipelineEvent::Error(message) => format!("error:{}", message),
            };
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(label);
        });
        (seen, subscription)
    }

    async fn settle() {
        time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lifecycle_end_to_end() {
        let fx = fixture();
        let (events, _sub) = collect(&fx.pipeline);

        fx.pipeline.start_session().await.expect("start");
        assert_eq!(fx.pipeline.phase(), SessionPhase::Active);
        assert_eq!(fx.audio.starts.load(Ordering::SeqCst), 1);
        assert_eq!(fx.transport.connects.load(Ordering::SeqCst), 1);
        settle().await;

        {
            let sent = fx.transport.sent.lock().await;
            assert!(matches!(sent[0], ClientMessage::Configure { .. }));
        }

        fx.audio.emit_frame(vec![0u8; 64]);
        settle().await;
        {
            let sent = fx.transport.sent.lock().await;
            assert!(sent.iter().any(|m| matches!(m, ClientMessage::AppendAudio { .. })));
        }

        fx.transport.push_final("hello team let's begin");
        settle().await;
        let stats = fx.pipeline.stats().await;
        assert_eq!(stats.lines, 1);
        assert_eq!(stats.frames_sent, 1);

        fx.pipeline.stop_session().await.expect("stop");
        assert_eq!(fx.pipeline.phase(), SessionPhase::Idle);
        assert!(!fx.audio.is_active());
        {
            let sent = fx.transport.sent.lock().await;
            assert!(matches!(sent.last(), Some(ClientMessage::Commit)));
        }
        {
            let batches = fx.store.batches.lock().await;
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].len(), 1);
            assert_eq!(batches[0][0].content, "hello team let's begin");
        }

        let seen = events.lock().unwrap_or_else(PoisonError::into_inner).clone();
        assert!(seen.contains(&"phase:active".to_string()));
        assert!(seen.contains(&"line:hello team let's begin".to_string()));
        assert!(seen.contains(&"phase:idle".to_string()));

        fx.pipeline.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_session_is_idempotent() {
        let fx = fixture();
        fx.pipeline.start_session().await.expect("start");
        settle().await;

        fx.pipeline.stop_session().await.expect("first stop");
        fx.pipeline.stop_session().await.expect("second stop");

        let sent = fx.transport.sent.lock().await;
        let commits = sent
            .iter()
            .filter(|m| matches!(m, ClientMessage::Commit))
            .count();
        assert_eq!(commits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_active_is_a_no_op() {
        let fx = fixture();
        fx.pipeline.start_session().await.expect("start");
        fx.pipeline.start_session().await.expect("second start");

        assert_eq!(fx.transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(fx.audio.starts.load(Ordering::SeqCst), 1);
        assert_eq!(fx.pipeline.phase(), SessionPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_suspends_capture_and_usage_clock() {
        let fx = fixture();
        fx.pipeline.start_session().await.expect("start");

        time::sleep(Duration::from_millis(10_500)).await;
        fx.pipeline.pause().await.expect("pause");
        assert_eq!(fx.pipeline.phase(), SessionPhase::Paused);
        assert!(fx.audio.is_paused());

        // A minute goes by without counting.
        time::sleep(Duration::from_secs(60)).await;
        fx.pipeline.resume().await.expect("resume");
        assert_eq!(fx.pipeline.phase(), SessionPhase::Active);
        assert!(!fx.audio.is_paused());

        time::sleep(Duration::from_secs(10)).await;
        fx.pipeline.stop_session().await.expect("stop");
        assert_eq!(fx.pipeline.usage_snapshot().await.session_seconds, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_preserves_state_and_allows_restart() {
        let fx = fixture();
        fx.pipeline.start_session().await.expect("start");
        fx.transport.push_final("only line so far");
        settle().await;

        fx.transport.drop_server();
        let mut phases = fx.pipeline.subscribe_phase();
        phases
            .wait_for(|p| *p == SessionPhase::Error)
            .await
            .expect("phase");
        assert!(!fx.audio.is_active());
        // The line survived and was flushed.
        assert_eq!(fx.pipeline.stats().await.lines, 1);
        assert_eq!(fx.store.batches.lock().await.len(), 1);

        fx.pipeline.start_session().await.expect("restart");
        assert_eq!(fx.transport.connects.load(Ordering::SeqCst), 2);
        assert_eq!(fx.pipeline.phase(), SessionPhase::Active);
        // Fresh session, fresh transcript.
        assert_eq!(fx.pipeline.stats().await.lines, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_reached_blocks_start() {
        let audio = Arc::new(FakeAudio::default());
        let fx = fixture_with(Arc::clone(&audio) as Arc<dyn AudioSource>, false);

        let err = fx.pipeline.start_session().await.expect_err("blocked");
        assert!(matches!(err, ConfabLiveError::Metering(_)));
        assert_eq!(fx.pipeline.phase(), SessionPhase::Idle);
        assert_eq!(fx.transport.connects.load(Ordering::SeqCst), 0);
        assert_eq!(audio.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_microphone_fails_before_connecting() {
        let fx = fixture_with(Arc::new(DeniedAudio), true);

        let err = fx.pipeline.start_session().await.expect_err("denied");
        assert!(matches!(err, ConfabLiveError::Permission(_)));
        assert_eq!(fx.pipeline.phase(), SessionPhase::Error);
        assert_eq!(fx.transport.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_lines_drive_persistence_and_analysis() {
        let fx = fixture();
        fx.pipeline.start_session().await.expect("start");

        fx.transport
            .push_final("let's walk through the launch readiness checklist together");
        fx.transport
            .push_final("engineering signed off on the rollback plan yesterday");
        fx.transport
            .push_final("support needs one more week for macro updates");
        settle().await;

        // 24 words over three lines clears both schedulers' gates once.
        assert_eq!(fx.timeline.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.summary.calls.load(Ordering::SeqCst), 1);

        // The burst coalesces into a single save on the trailing edge.
        time::sleep(Duration::from_millis(2_500)).await;
        {
            let batches = fx.store.batches.lock().await;
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].len(), 3);
        }

        fx.pipeline.stop_session().await.expect("stop");
        assert_eq!(fx.store.batches.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_transcripts_only_feed_the_caption() {
        let fx = fixture();
        let (events, _sub) = collect(&fx.pipeline);
        fx.pipeline.start_session().await.expect("start");

        fx.transport.push_delta("we should prob");
        settle().await;

        assert_eq!(fx.pipeline.stats().await.lines, 0);
        let seen = events.lock().unwrap_or_else(PoisonError::into_inner).clone();
        assert!(seen.contains(&"partial:we should prob".to_string()));

        fx.pipeline.stop_session().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_minutes_reported_during_session() {
        let fx = fixture();
        fx.pipeline.start_session().await.expect("start");

        time::sleep(Duration::from_millis(61_500)).await;
        fx.pipeline.stop_session().await.expect("stop");

        // One full minute plus the 1s partial.
        assert_eq!(fx.metering.reports.load(Ordering::SeqCst), 2);
    }
}
