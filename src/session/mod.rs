//! Duplex transcription session client.
//!
//! One WebSocket connection per recording session. A writer task owns the
//! outbound half and drains a command queue, which guarantees the configure
//! message precedes any audio and that teardown flushes queued frames before
//! the close frame goes out. A reader task decodes inbound messages into
//! [`SessionEvent`]s for the pipeline.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::protocol::{ClientMessage, ServerMessage, SessionSettings, TranscriptEvent};
use crate::{ConfabLiveError, Result};

/// How long teardown waits for transcripts finalized by the commit before
/// shutting the reader down.
const COMMIT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Connection lifecycle. `Streaming` is `Open` plus an explicit go-ahead for
/// audio; both accept frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Streaming,
    Closing,
    Closed,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Events the session surfaces to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Transcript(TranscriptEvent),
    /// The server ended the session or the transport closed.
    Disconnected,
    Error(String),
}

/// Outbound half of a transport connection.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, message: ClientMessage) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a transport connection. `None` means the stream ended
/// cleanly.
#[async_trait]
pub trait MessageSource: Send {
    async fn next_message(&mut self) -> Option<Result<ServerMessage>>;
}

/// Dials the transcription backend. Swapped for an in-memory pair in tests.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self) -> Result<(Box<dyn MessageSink>, Box<dyn MessageSource>)>;
}

/// Transport endpoint and session parameters.
#[derive(Debug, Clone)]
pub struct SessionClientConfig {
    /// WebSocket endpoint of the realtime transcription service.
    pub endpoint: String,
    /// Bearer token; omitted from the handshake when `None`.
    pub api_key: Option<String>,
    pub settings: SessionSettings,
}

impl Default for SessionClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.confab.app/v1/transcribe".to_string(),
            api_key: None,
            settings: SessionSettings::default(),
        }
    }
}

/// WebSocket-backed [`TransportConnector`].
pub struct WsConnector {
    endpoint: String,
    api_key: Option<String>,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
        }
    }

    pub fn from_config(config: &SessionClientConfig) -> Self {
        Self::new(config.endpoint.clone(), config.api_key.clone())
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    async fn connect(&self) -> Result<(Box<dyn MessageSink>, Box<dyn MessageSource>)> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| ConfabLiveError::Transport(format!("invalid endpoint: {}", e)))?;
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| ConfabLiveError::Transport(format!("invalid api key: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| ConfabLiveError::Transport(e.to_string()))?;
        debug!(endpoint = %self.endpoint, "WebSocket connected");
        let (sink, source) = stream.split();
        Ok((Box::new(WsSink { inner: sink }), Box::new(WsSource { inner: source })))
    }
}

struct WsSink {
    inner: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&mut self, message: ClientMessage) -> Result<()> {
        let json = message.to_json()?;
        self.inner
            .send(Message::Text(json))
            .await
            .map_err(|e| ConfabLiveError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| ConfabLiveError::Transport(e.to_string()))
    }
}

struct WsSource {
    inner: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

#[async_trait]
impl MessageSource for WsSource {
    async fn next_message(&mut self) -> Option<Result<ServerMessage>> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(raw))) => match ServerMessage::from_json(&raw) {
                    Ok(message) => return Some(Ok(message)),
                    // A malformed payload is a server bug, not a reason to
                    // drop the session.
                    Err(e) => warn!("Skipping undecodable message: {}", e),
                },
                Some(Ok(Message::Close(_))) => return None,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Some(Err(ConfabLiveError::Transport(e.to_string()))),
                None => return None,
            }
        }
    }
}

enum WriterCommand {
    Send(ClientMessage),
    Close,
}

/// Client for one realtime transcription session.
///
/// Connection state is published on a watch channel; decoded transcript
/// events go to the event channel handed to [`TranscriptionSessionClient::new`].
pub struct TranscriptionSessionClient {
    connector: Arc<dyn TransportConnector>,
    settings: SessionSettings,
    events: mpsc::UnboundedSender<SessionEvent>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<WriterCommand>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    committed: AtomicBool,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl TranscriptionSessionClient {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        settings: SessionSettings,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        Self {
            connector,
            settings,
            events,
            state_tx: Arc::new(state_tx),
            state_rx,
            writer_tx: Mutex::new(None),
            writer_task: Mutex::new(None),
            reader_task: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            committed: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Dial the backend and send the session configuration.
    ///
    /// Valid from `Idle`, `Closed` or `Error`; any in-progress connection is
    /// rejected rather than replaced.
    pub async fn connect(&self) -> Result<()> {
        let current = self.state();
        if !matches!(
            current,
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Error
        ) {
            return Err(ConfabLiveError::AlreadyConnected);
        }

        self.state_tx.send_replace(ConnectionState::Connecting);
        let (sink, source) = match self.connector.connect().await {
            Ok(pair) => pair,
            Err(e) => {
                self.state_tx.send_replace(ConnectionState::Error);
                let _ = self.events.send(SessionEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        self.committed.store(false, Ordering::SeqCst);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        // Enqueued before the sender is published, so configuration is always
        // the first message on the wire.
        writer_tx
            .send(WriterCommand::Send(ClientMessage::Configure {
                session: self.settings.clone(),
            }))
            .map_err(|_| ConfabLiveError::Transport("writer queue closed".to_string()))?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let writer = tokio::spawn(run_writer(sink, writer_rx));
        let reader = tokio::spawn(run_reader(
            source,
            self.events.clone(),
            Arc::clone(&self.state_tx),
            shutdown_rx,
        ));

        *lock(&self.writer_tx) = Some(writer_tx);
        *lock(&self.writer_task) = Some(writer);
        *lock(&self.reader_task) = Some(reader);
        *lock(&self.shutdown_tx) = Some(shutdown_tx);

        self.state_tx.send_replace(ConnectionState::Open);
        let _ = self.events.send(SessionEvent::Connected);
        info!("Transcription session open");
        Ok(())
    }

    /// Mark the session as actively streaming audio.
    pub fn start_streaming(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Open | ConnectionState::Streaming => {
                self.state_tx.send_replace(ConnectionState::Streaming);
                Ok(())
            }
            _ => Err(ConfabLiveError::NotConnected),
        }
    }

    /// Queue one encoded PCM frame. Synchronous so the audio pump can call it
    /// per frame without backpressure on the capture thread.
    pub fn send_audio(&self, pcm: &[u8]) -> Result<()> {
        if !matches!(
            self.state(),
            ConnectionState::Open | ConnectionState::Streaming
        ) {
            return Err(ConfabLiveError::NotConnected);
        }
        let guard = lock(&self.writer_tx);
        let Some(tx) = guard.as_ref() else {
            return Err(ConfabLiveError::NotConnected);
        };
        tx.send(WriterCommand::Send(ClientMessage::append_audio(pcm)))
            .map_err(|_| ConfabLiveError::Transport("writer queue closed".to_string()))?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(pcm.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Commit buffered audio and close the connection.
    ///
    /// Exactly one commit is sent per connection no matter how many times or
    /// how concurrently this is called; later calls return immediately.
    pub async fn disconnect(&self) -> Result<()> {
        if matches!(self.state(), ConnectionState::Idle) {
            return Ok(());
        }
        if self.committed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.state_tx.send_replace(ConnectionState::Closing);
        if let Some(tx) = lock(&self.writer_tx).take() {
            let _ = tx.send(WriterCommand::Send(ClientMessage::Commit));
            let _ = tx.send(WriterCommand::Close);
        }

        // The writer drains every queued frame before acting on Close.
        let writer = lock(&self.writer_task).take();
        if let Some(handle) = writer {
            let _ = handle.await;
        }

        // The commit may still produce final transcripts; give the reader a
        // moment to collect them before forcing it down.
        let reader = lock(&self.reader_task).take();
        if let Some(mut handle) = reader {
            if tokio::time::timeout(COMMIT_DRAIN_GRACE, &mut handle)
                .await
                .is_err()
            {
                if let Some(shutdown) = lock(&self.shutdown_tx).take() {
                    let _ = shutdown.send(());
                }
                let _ = handle.await;
            }
        }
        let _ = lock(&self.shutdown_tx).take();

        self.state_tx.send_replace(ConnectionState::Closed);
        info!(
            frames = self.frames_sent.load(Ordering::Relaxed),
            bytes = self.bytes_sent.load(Ordering::Relaxed),
            "Transcription session closed"
        );
        Ok(())
    }
}

async fn run_writer(
    mut sink: Box<dyn MessageSink>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Send(message) => {
                if let Err(e) = sink.send(message).await {
                    warn!("Session write failed: {}", e);
                    break;
                }
            }
            WriterCommand::Close => {
                let _ = sink.close().await;
                break;
            }
        }
    }
}

async fn run_reader(
    mut source: Box<dyn MessageSource>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let teardown_in_progress =
        |state: &watch::Sender<ConnectionState>| {
            matches!(
                *state.borrow(),
                ConnectionState::Closing | ConnectionState::Closed
            )
        };

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            message = source.next_message() => match message {
                Some(Ok(ServerMessage::Connected)) => {
                    debug!("Backend acknowledged session");
                }
                Some(Ok(ServerMessage::SpeechStarted)) => debug!("Speech started"),
                Some(Ok(ServerMessage::SpeechStopped)) => debug!("Speech stopped"),
                Some(Ok(message @ ServerMessage::TranscriptDelta { .. }))
                | Some(Ok(message @ ServerMessage::TranscriptCompleted { .. })) => {
                    if let Some(event) = message.into_transcript_event(Utc::now()) {
                        let _ = events.send(SessionEvent::Transcript(event));
                    }
                }
                Some(Ok(ServerMessage::Error { message })) => {
                    warn!("Backend error: {}", message);
                    let _ = events.send(SessionEvent::Error(message));
                }
                Some(Ok(ServerMessage::Disconnected)) => {
                    if !teardown_in_progress(&state) {
                        state.send_replace(ConnectionState::Closed);
                        let _ = events.send(SessionEvent::Disconnected);
                    }
                    break;
                }
                Some(Ok(ServerMessage::Unknown)) => {
                    debug!("Ignoring unrecognized message type");
                }
                Some(Err(e)) => {
                    if !teardown_in_progress(&state) {
                        state.send_replace(ConnectionState::Error);
                        let _ = events.send(SessionEvent::Error(e.to_string()));
                    }
                    break;
                }
                None => {
                    if !teardown_in_progress(&state) {
                        state.send_replace(ConnectionState::Closed);
                        let _ = events.send(SessionEvent::Disconnected);
                    }
                    break;
                }
            }
        }
    }
}
