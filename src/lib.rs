//! Confab Live - the live conversation intelligence pipeline
//!
//! This crate provides the client-side machinery that powers a Confab
//! meeting session. It features:
//!
//! - Microphone capture framed as 16-bit little-endian PCM
//! - A duplex transcription session client with explicit lifecycle states
//! - Speaker-attributed transcript accumulation with talk-time statistics
//! - Throttled persistence of the unsaved transcript suffix
//! - Incremental timeline/summary regeneration guarded by generation tokens
//! - Minute-boundary usage metering with limit signals
//!
//! # Example
//!
//! ```no_run
//! use confab_live::{ApiConfig, ConversationPipeline, PipelineBackends, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> confab_live::Result<()> {
//!     let config = PipelineConfig {
//!         session_id: Some(confab_live::utils::generate_session_id()),
//!         ..PipelineConfig::default()
//!     };
//!     let backends = PipelineBackends::live(&ApiConfig::default());
//!     let pipeline = ConversationPipeline::new(config, backends);
//!
//!     pipeline.start_session().await?;
//!     // ... surface transcript lines, timeline and usage via pipeline.subscribe(...)
//!     pipeline.stop_session().await?;
//!     pipeline.close().await;
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod audio;
pub mod events;
pub mod persist;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod throttle;
pub mod transcript;
pub mod usage;

// Re-export commonly used types for convenience
pub use analysis::{
    AnalysisArtifact, AnalysisConfig, AnalysisSnapshot, ArtifactBackend, ConversationSummary,
    ConversationTimeline, HttpAnalysisBackend, Importance, IncrementalAnalysisScheduler,
    TimelineEvent, TimelineEventType,
};
pub use audio::{AudioCaptureStreamer, AudioSource, CaptureConfig};
pub use persist::{HttpTranscriptStore, PersistenceConfig, ThrottledPersistenceQueue, TranscriptStore};
pub use pipeline::{
    ApiConfig, ConversationPipeline, PipelineBackends, PipelineConfig, PipelineEvent,
    PipelineStats, SessionPhase,
};
pub use protocol::{SessionSettings, TranscriptEvent, VadSettings};
pub use session::{
    ConnectionState, SessionClientConfig, SessionEvent, TranscriptionSessionClient, WsConnector,
};
pub use transcript::{
    AccumulatorConfig, SharedTranscript, Speaker, TalkStats, TranscriptAccumulator, TranscriptLine,
    TranscriptReader,
};
pub use usage::{HttpMeteringBackend, MeteringBackend, UsageEvent, UsageMeter, UsageMeterConfig, UsageSnapshot};

// Error types
use thiserror::Error;

/// Errors that can occur in the confab-live pipeline
#[derive(Error, Debug)]
pub enum ConfabLiveError {
    /// Audio device unavailable or microphone permission denied
    #[error("audio capture unavailable: {0}")]
    Permission(String),

    /// A capture handle is already held; release it before starting again
    #[error("audio capture already active")]
    CaptureActive,

    /// Transport-level failure on the transcription connection
    #[error("transport error: {0}")]
    Transport(String),

    /// connect() called while a session is already open
    #[error("session already connected")]
    AlreadyConnected,

    /// Streaming requested without an open session
    #[error("session not connected")]
    NotConnected,

    /// Regenerate endpoint failure
    #[error("analysis request failed: {0}")]
    Analysis(String),

    /// Transcript persistence failure
    #[error("transcript save failed: {0}")]
    Persistence(String),

    /// Usage metering failure
    #[error("usage metering failed: {0}")]
    Metering(String),

    /// Wire message encoding/decoding error
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// Result type alias for confab-live operations
pub type Result<T> = std::result::Result<T, ConfabLiveError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Utility functions shared across the pipeline
pub mod utils {
    use uuid::Uuid;

    /// Whitespace-delimited token count, the word measure used by talk
    /// statistics and the analysis gates.
    pub fn word_count(text: &str) -> usize {
        text.split_whitespace().count()
    }

    /// Generate a fresh session identifier.
    pub fn generate_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Duration in seconds represented by a 16-bit mono PCM byte payload.
    pub fn pcm_duration_secs(byte_len: u64, sample_rate: u32) -> f64 {
        if sample_rate == 0 {
            return 0.0;
        }
        (byte_len as f64 / 2.0) / sample_rate as f64
    }
}
