//! Transcript accumulation and speaker attribution.
//!
//! [`TranscriptAccumulator`] owns the append-only line sequence for one
//! conversation session. Every other component sees the transcript through
//! a read-only [`TranscriptReader`]; only the pipeline's event loop holds
//! the writing [`SharedTranscript`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::utils::word_count;

/// Which side of the conversation produced a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Speaker {
    Me,
    Them,
}

impl Speaker {
    pub fn flip(self) -> Self {
        match self {
            Speaker::Me => Speaker::Them,
            Speaker::Them => Speaker::Me,
        }
    }
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Speaker::Me => write!(f, "ME"),
            Speaker::Them => write!(f, "THEM"),
        }
    }
}

/// One finalized line of the conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptLine {
    /// Ordinal id; equals the line's index in the session transcript.
    pub id: u64,
    pub text: String,
    pub speaker: Speaker,
    pub timestamp: DateTime<Utc>,
    /// Backend confidence in [0, 1], when reported.
    pub confidence: Option<f32>,
}

/// Configuration for the accumulator.
#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    /// Gap between consecutive events beyond which the heuristic flips the
    /// attributed speaker.
    pub speaker_flip_gap: Duration,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            speaker_flip_gap: Duration::from_millis(2000),
        }
    }
}

/// Per-speaker word totals, maintained incrementally on append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalkStats {
    pub me_words: usize,
    pub them_words: usize,
}

impl TalkStats {
    pub fn total(&self) -> usize {
        self.me_words + self.them_words
    }

    /// Fraction of words spoken by ME, in [0, 1]. Zero on an empty
    /// transcript.
    pub fn me_ratio(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.me_words as f64 / total as f64
        }
    }
}

impl std::fmt::Display for TalkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ME {:.0}% / THEM {:.0}% ({} words)",
            self.me_ratio() * 100.0,
            (1.0 - self.me_ratio()) * 100.0,
            self.total()
        )
    }
}

/// Append-only transcript for a single session.
///
/// Speaker attribution is a heuristic, not diarization: the first line is
/// ME, a gap above the configured threshold flips the previous speaker, and
/// anything else keeps it. Known approximation; upstream speaker tags take
/// precedence when present.
#[derive(Debug)]
pub struct TranscriptAccumulator {
    config: AccumulatorConfig,
    lines: Vec<TranscriptLine>,
    stats: TalkStats,
    /// Length `full_text()` would have, maintained incrementally.
    text_len: usize,
}

impl TranscriptAccumulator {
    pub fn new(config: AccumulatorConfig) -> Self {
        Self {
            config,
            lines: Vec::new(),
            stats: TalkStats::default(),
            text_len: 0,
        }
    }

    /// Append a finalized piece of text. Returns `None` (with no side
    /// effect) for empty or whitespace-only input, which upstream partial
    /// events frequently produce.
    pub fn append(
        &mut self,
        text: &str,
        timestamp: DateTime<Utc>,
        speaker: Option<Speaker>,
        confidence: Option<f32>,
    ) -> Option<&TranscriptLine> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            debug!("Ignoring empty transcript event");
            return None;
        }

        let speaker = speaker.unwrap_or_else(|| self.attribute(timestamp));
        let words = word_count(trimmed);
        match speaker {
            Speaker::Me => self.stats.me_words += words,
            Speaker::Them => self.stats.them_words += words,
        }
        if !self.lines.is_empty() {
            self.text_len += 1; // joining newline
        }
        self.text_len += trimmed.len();

        let line = TranscriptLine {
            id: self.lines.len() as u64,
            text: trimmed.to_string(),
            speaker,
            timestamp,
            confidence,
        };
        self.lines.push(line);
        self.lines.last()
    }

    fn attribute(&self, timestamp: DateTime<Utc>) -> Speaker {
        match self.lines.last() {
            None => Speaker::Me,
            Some(prev) => {
                let gap_ms = (timestamp - prev.timestamp).num_milliseconds();
                if gap_ms > self.config.speaker_flip_gap.as_millis() as i64 {
                    prev.speaker.flip()
                } else {
                    prev.speaker
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[TranscriptLine] {
        &self.lines
    }

    /// Lines in `[start, end)`, clamped to the current length.
    pub fn range(&self, start: usize, end: usize) -> &[TranscriptLine] {
        let end = end.min(self.lines.len());
        let start = start.min(end);
        &self.lines[start..end]
    }

    /// The whole transcript joined by newlines, as sent to the regenerate
    /// endpoints.
    pub fn full_text(&self) -> String {
        let mut text = String::with_capacity(self.text_len);
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                text.push('\n');
            }
            text.push_str(&line.text);
        }
        text
    }

    /// Length of [`full_text`](Self::full_text) without building it.
    pub fn text_len(&self) -> usize {
        self.text_len
    }

    pub fn word_count(&self) -> usize {
        self.stats.total()
    }

    pub fn talk_stats(&self) -> TalkStats {
        self.stats
    }

    /// Reset for session reuse.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.stats = TalkStats::default();
        self.text_len = 0;
    }
}

impl Default for TranscriptAccumulator {
    fn default() -> Self {
        Self::new(AccumulatorConfig::default())
    }
}

/// Writing handle to the session transcript. Held only by the pipeline's
/// event loop; everything else gets a [`TranscriptReader`].
#[derive(Debug, Clone)]
pub struct SharedTranscript {
    inner: Arc<RwLock<TranscriptAccumulator>>,
}

impl SharedTranscript {
    pub fn new(config: AccumulatorConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TranscriptAccumulator::new(config))),
        }
    }

    pub fn reader(&self) -> TranscriptReader {
        TranscriptReader {
            inner: self.inner.clone(),
        }
    }

    pub async fn append(
        &self,
        text: &str,
        timestamp: DateTime<Utc>,
        speaker: Option<Speaker>,
        confidence: Option<f32>,
    ) -> Option<TranscriptLine> {
        self.inner
            .write()
            .await
            .append(text, timestamp, speaker, confidence)
            .cloned()
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn word_count(&self) -> usize {
        self.inner.read().await.word_count()
    }

    pub async fn talk_stats(&self) -> TalkStats {
        self.inner.read().await.talk_stats()
    }
}

/// Read-only view of the session transcript.
#[derive(Debug, Clone)]
pub struct TranscriptReader {
    inner: Arc<RwLock<TranscriptAccumulator>>,
}

impl TranscriptReader {
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn word_count(&self) -> usize {
        self.inner.read().await.word_count()
    }

    pub async fn text_len(&self) -> usize {
        self.inner.read().await.text_len()
    }

    pub async fn full_text(&self) -> String {
        self.inner.read().await.full_text()
    }

    pub async fn talk_stats(&self) -> TalkStats {
        self.inner.read().await.talk_stats()
    }

    /// Clone of the lines in `[start, end)`.
    pub async fn snapshot_range(&self, start: usize, end: usize) -> Vec<TranscriptLine> {
        self.inner.read().await.range(start, end).to_vec()
    }

    pub async fn snapshot(&self) -> Vec<TranscriptLine> {
        self.inner.read().await.lines().to_vec()
    }
}
