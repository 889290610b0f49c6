//! Microphone capture.
//!
//! The cpal stream is owned by a dedicated OS thread because streams are not
//! `Send`. The public handle talks to that thread over a command channel and
//! receives encoded frames back on a tokio channel, so the async side never
//! touches the audio callback directly.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::{ConfabLiveError, Result};

/// Capture parameters. The defaults match what the transcription backend
/// expects, so most callers never change them.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Requested sample rate in Hz.
    pub sample_rate: u32,
    /// Requested channel count.
    pub channels: u16,
    /// Samples per emitted frame.
    pub frame_samples: usize,
    /// Input device name; `None` selects the system default.
    pub device_name: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_samples: 4096,
            device_name: None,
        }
    }
}

/// Abstraction over the microphone so the pipeline can run against a fake
/// source in tests.
pub trait AudioSource: Send + Sync {
    /// Begin capture, delivering encoded frames to `frames`. Errors if
    /// capture is already running or the device is unavailable.
    fn start(&self, frames: UnboundedSender<Vec<u8>>) -> Result<()>;

    /// Suspend frame delivery without tearing the stream down.
    fn pause(&self) -> Result<()>;

    /// Resume frame delivery after `pause`.
    fn resume(&self) -> Result<()>;

    /// Stop capture and free the device. Safe to call repeatedly.
    fn release(&self) -> Result<()>;

    fn is_active(&self) -> bool;

    /// Most recent RMS input level in [0, 1].
    fn current_level(&self) -> f32;
}

/// Encode float samples as 16-bit little-endian PCM.
pub fn encode_pcm16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Accumulates callback buffers into fixed-size encoded frames. Callback
/// buffer sizes are device-dependent and rarely line up with frame
/// boundaries, so a partial frame is carried over to the next push.
#[derive(Debug)]
pub struct FrameChunker {
    frame_samples: usize,
    buffer: Vec<f32>,
}

impl FrameChunker {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples,
            buffer: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Append samples and drain every complete frame.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.buffer.len() >= self.frame_samples {
            let rest = self.buffer.split_off(self.frame_samples);
            let frame = std::mem::replace(&mut self.buffer, rest);
            frames.push(encode_pcm16le(&frame));
        }
        frames
    }

    /// Samples currently held back waiting for a full frame.
    pub fn pending_samples(&self) -> usize {
        self.buffer.len()
    }
}

enum CaptureCommand {
    Pause,
    Resume,
    Stop,
}

/// Captures microphone audio and streams encoded frames to a channel.
///
/// `start` spawns the worker thread and only returns once the device is
/// delivering audio, so permission and device failures surface at the call
/// site instead of silently producing no frames.
pub struct AudioCaptureStreamer {
    config: CaptureConfig,
    control_tx: Mutex<Option<std_mpsc::Sender<CaptureCommand>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    active: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    /// f32 RMS level stored as raw bits.
    level: Arc<AtomicU32>,
}

impl AudioCaptureStreamer {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            control_tx: Mutex::new(None),
            worker: Mutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            level: Arc::new(AtomicU32::new(0f32.to_bits())),
        }
    }

    fn lock_control(&self) -> std::sync::MutexGuard<'_, Option<std_mpsc::Sender<CaptureCommand>>> {
        match self.control_tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<thread::JoinHandle<()>>> {
        match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl AudioSource for AudioCaptureStreamer {
    fn start(&self, frames: UnboundedSender<Vec<u8>>) -> Result<()> {
        let mut control = self.lock_control();
        if control.is_some() {
            return Err(ConfabLiveError::CaptureActive);
        }

        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let config = self.config.clone();
        let paused = Arc::clone(&self.paused);
        let level = Arc::clone(&self.level);
        paused.store(false, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || capture_worker(config, frames, cmd_rx, ready_tx, paused, level))
            .map_err(|e| ConfabLiveError::Permission(format!("failed to spawn capture thread: {}", e)))?;

        // Block until the worker reports whether the device opened; capture
        // startup takes tens of milliseconds.
        match ready_rx.recv() {
            Ok(Ok(())) => {
                *control = Some(cmd_tx);
                *self.lock_worker() = Some(handle);
                self.active.store(true, Ordering::SeqCst);
                info!(
                    sample_rate = self.config.sample_rate,
                    frame_samples = self.config.frame_samples,
                    "Audio capture started"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(ConfabLiveError::Permission(
                    "capture thread exited before reporting readiness".to_string(),
                ))
            }
        }
    }

    fn pause(&self) -> Result<()> {
        if let Some(tx) = self.lock_control().as_ref() {
            let _ = tx.send(CaptureCommand::Pause);
            debug!("Audio capture paused");
        }
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        if let Some(tx) = self.lock_control().as_ref() {
            let _ = tx.send(CaptureCommand::Resume);
            debug!("Audio capture resumed");
        }
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let sender = self.lock_control().take();
        let Some(tx) = sender else {
            return Ok(());
        };
        let _ = tx.send(CaptureCommand::Stop);
        drop(tx);
        if let Some(handle) = self.lock_worker().take() {
            if handle.join().is_err() {
                warn!("Capture thread panicked during shutdown");
            }
        }
        self.active.store(false, Ordering::SeqCst);
        self.level.store(0f32.to_bits(), Ordering::Relaxed);
        info!("Audio capture released");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn current_level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }
}

impl Drop for AudioCaptureStreamer {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn capture_worker(
    config: CaptureConfig,
    frames: UnboundedSender<Vec<u8>>,
    commands: std_mpsc::Receiver<CaptureCommand>,
    ready: std_mpsc::Sender<Result<()>>,
    paused: Arc<AtomicBool>,
    level: Arc<AtomicU32>,
) {
    let host = cpal::default_host();
    let device = match find_device(&host, config.device_name.as_deref()) {
        Ok(device) => device,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let device_name = device.name().unwrap_or_else(|_| "<unnamed>".to_string());

    let stream_config = cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut chunker = FrameChunker::new(config.frame_samples);
    let callback_paused = Arc::clone(&paused);
    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            if callback_paused.load(Ordering::Relaxed) {
                return;
            }
            level.store(rms_level(data).to_bits(), Ordering::Relaxed);
            for frame in chunker.push(data) {
                // Receiver gone means the session is tearing down; the worker
                // will get its Stop command shortly.
                if frames.send(frame).is_err() {
                    return;
                }
            }
        },
        move |e| error!("Audio stream error: {}", e),
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(ConfabLiveError::Permission(format!(
                "failed to open input stream on '{}': {}",
                device_name, e
            ))));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(ConfabLiveError::Permission(format!(
            "failed to start input stream on '{}': {}",
            device_name, e
        ))));
        return;
    }

    debug!(device = %device_name, "Capture stream playing");
    if ready.send(Ok(())).is_err() {
        return;
    }

    loop {
        match commands.recv() {
            Ok(CaptureCommand::Pause) => paused.store(true, Ordering::SeqCst),
            Ok(CaptureCommand::Resume) => paused.store(false, Ordering::SeqCst),
            Ok(CaptureCommand::Stop) | Err(_) => break,
        }
    }

    drop(stream);
    debug!(device = %device_name, "Capture stream closed");
}

fn find_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    match name {
        Some(wanted) => {
            let mut devices = host.input_devices().map_err(|e| {
                ConfabLiveError::Permission(format!("failed to enumerate input devices: {}", e))
            })?;
            devices
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| {
                    ConfabLiveError::Permission(format!("input device '{}' not found", wanted))
                })
        }
        None => host.default_input_device().ok_or_else(|| {
            ConfabLiveError::Permission("no default input device available".to_string())
        }),
    }
}

fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Names of the input devices cpal can currently see.
pub fn available_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            warn!("Failed to enumerate input devices: {}", e);
            Vec::new()
        }
    }
}
