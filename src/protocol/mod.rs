//! Wire shapes for the pipeline's external collaborators.
//!
//! Transport messages (the duplex transcription connection) are internally
//! tagged JSON with snake_case tags. REST payloads (persistence, analysis,
//! metering) use camelCase field names to match the product API.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::transcript::{Speaker, TranscriptLine};
use crate::Result;

/// One-time session configuration, sent before any audio.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    /// Transcription model identifier.
    pub model: String,
    /// BCP-47 language tag.
    pub language: String,
    /// Audio encoding of appended frames.
    pub encoding: String,
    /// Sample rate of appended frames in Hz.
    pub sample_rate_hz: u32,
    /// Voice-activity-detection tuning.
    pub vad: VadSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: "realtime-v2".to_string(),
            language: "en".to_string(),
            encoding: "pcm_s16le".to_string(),
            sample_rate_hz: 16_000,
            vad: VadSettings::default(),
        }
    }
}

/// Voice-activity-detection thresholds forwarded to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VadSettings {
    /// Speech probability threshold in [0, 1].
    pub threshold: f32,
    /// Trailing silence before an utterance is finalized.
    pub silence_duration_ms: u32,
    /// Audio retained from before speech onset.
    pub prefix_padding_ms: u32,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            silence_duration_ms: 500,
            prefix_padding_ms: 300,
        }
    }
}

/// Outbound transport messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Session configuration; always the first message after connect.
    Configure { session: SessionSettings },
    /// A base64-encoded 16-bit LE PCM frame.
    AppendAudio { audio: String },
    /// Flush buffered audio and finalize pending utterances.
    Commit,
}

impl ClientMessage {
    /// Wrap a PCM frame for transmission.
    pub fn append_audio(pcm: &[u8]) -> Self {
        ClientMessage::AppendAudio {
            audio: BASE64.encode(pcm),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Inbound transport messages. Unrecognized types decode to `Unknown` so
/// new backend message kinds never break the reader.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected,
    SpeechStarted,
    SpeechStopped,
    TranscriptDelta {
        text: String,
        #[serde(default)]
        confidence: Option<f32>,
    },
    TranscriptCompleted {
        text: String,
        #[serde(default)]
        confidence: Option<f32>,
    },
    Disconnected,
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Neutral transcript event for delta/completed messages, `None` for
    /// everything else.
    pub fn into_transcript_event(self, timestamp: DateTime<Utc>) -> Option<TranscriptEvent> {
        match self {
            ServerMessage::TranscriptDelta { text, confidence } => Some(TranscriptEvent {
                text,
                confidence,
                is_final: false,
                timestamp,
            }),
            ServerMessage::TranscriptCompleted { text, confidence } => Some(TranscriptEvent {
                text,
                confidence,
                is_final: true,
                timestamp,
            }),
            _ => None,
        }
    }
}

/// Decoded transcript event in the shape the accumulator consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub text: String,
    pub confidence: Option<f32>,
    /// Final events extend the transcript; partials only update the live
    /// caption.
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
}

/// Row shape for the bulk transcript persistence endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptLineRecord {
    pub session_id: String,
    pub content: String,
    pub speaker: Speaker,
    pub confidence_score: Option<f32>,
    pub sequence_number: u64,
    pub is_final: bool,
}

impl TranscriptLineRecord {
    pub fn from_line(session_id: &str, line: &TranscriptLine) -> Self {
        Self {
            session_id: session_id.to_string(),
            content: line.text.clone(),
            speaker: line.speaker,
            confidence_score: line.confidence,
            sequence_number: line.id,
            // The accumulator stores only finalized lines.
            is_final: true,
        }
    }
}

/// Request body for the stateless regenerate endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateRequest<T: Serialize> {
    /// Correlation id for log tracing; the backend echoes it in logs only.
    pub request_id: Uuid,
    pub session_id: Option<String>,
    pub conversation_type: Option<String>,
    pub transcript: String,
    pub existing_artifact: T,
    /// Characters of the transcript the backend has already consumed.
    pub last_processed_length: usize,
}

/// Response body from the regenerate endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateResponse<T: DeserializeOwned> {
    #[serde(bound = "T: DeserializeOwned")]
    pub artifact: T,
    pub last_processed_length: usize,
    #[serde(default)]
    pub new_items_count: usize,
    pub generated_at: DateTime<Utc>,
}

/// One usage-metering unit: a full minute or the trailing partial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub session_id: String,
    pub seconds_recorded: u32,
    pub minute_timestamp: DateTime<Utc>,
}

/// Acknowledgement from the metering endpoint; authoritative for the
/// monthly total.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReportAck {
    pub total_minutes_used: u32,
}

/// Authoritative monthly limits from the limit-check endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimits {
    pub minutes_used: u32,
    pub minutes_limit: u32,
    pub minutes_remaining: u32,
    pub percentage_used: f32,
    pub can_record: bool,
}
