//! Recording-time metering.
//!
//! A 1 Hz ticker counts recorded seconds while the UI is visible and the
//! session is not paused. Each completed minute is reported to the metering
//! endpoint exactly once: the watermark advances when the report is issued,
//! not when it succeeds, so a failed report is never retried and never
//! inflates a later one. The server stays authoritative for monthly totals.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::events::{Listeners, Subscription};
use crate::protocol::{UsageLimits, UsageReport, UsageReportAck};
use crate::{ConfabLiveError, Result};

/// Metering endpoints. Implementations without credentials report
/// `has_credentials() == false` and are never called.
#[async_trait]
pub trait MeteringBackend: Send + Sync {
    fn has_credentials(&self) -> bool {
        true
    }

    async fn record_usage(&self, report: UsageReport) -> Result<UsageReportAck>;

    async fn fetch_limits(&self) -> Result<UsageLimits>;
}

/// Metering endpoints of the product API.
pub struct HttpMeteringBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpMeteringBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl MeteringBackend for HttpMeteringBackend {
    fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    async fn record_usage(&self, report: UsageReport) -> Result<UsageReportAck> {
        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ConfabLiveError::Metering("metering credentials missing".to_string()))?;
        let url = format!("{}/usage/track", self.base_url);
        self.client
            .post(&url)
            .timeout(self.timeout)
            .bearer_auth(key)
            .json(&report)
            .send()
            .await
            .map_err(|e| ConfabLiveError::Metering(e.to_string()))?
            .error_for_status()
            .map_err(|e| ConfabLiveError::Metering(e.to_string()))?
            .json::<UsageReportAck>()
            .await
            .map_err(|e| ConfabLiveError::Metering(e.to_string()))
    }

    async fn fetch_limits(&self) -> Result<UsageLimits> {
        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ConfabLiveError::Metering("metering credentials missing".to_string()))?;
        let url = format!("{}/usage/limits", self.base_url);
        self.client
            .get(&url)
            .timeout(self.timeout)
            .bearer_auth(key)
            .send()
            .await
            .map_err(|e| ConfabLiveError::Metering(e.to_string()))?
            .error_for_status()
            .map_err(|e| ConfabLiveError::Metering(e.to_string()))?
            .json::<UsageLimits>()
            .await
            .map_err(|e| ConfabLiveError::Metering(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct UsageMeterConfig {
    /// Remaining minutes at which the approaching-limit warning fires.
    pub approaching_threshold_minutes: u32,
    pub tick_interval: Duration,
}

impl Default for UsageMeterConfig {
    fn default() -> Self {
        Self {
            approaching_threshold_minutes: 10,
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Point-in-time meter view, emitted on every counted tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub session_seconds: u64,
    /// Whole minutes of this session already elapsed.
    pub session_minutes_completed: u32,
    pub minutes_used: u32,
    pub minutes_limit: u32,
    pub minutes_remaining: u32,
    pub percentage_used: f32,
    pub can_record: bool,
}

#[derive(Debug, Clone)]
pub enum UsageEvent {
    Updated(UsageSnapshot),
    ApproachingLimit { minutes_remaining: u32 },
    LimitReached,
}

struct MeterState {
    session_id: Option<String>,
    session_seconds: u64,
    /// Highest whole minute already reported, advanced at issue time.
    last_minute_reported: u64,
    monthly: Option<UsageLimits>,
    approaching_fired: bool,
    limit_fired: bool,
}

impl MeterState {
    fn new() -> Self {
        Self {
            session_id: None,
            session_seconds: 0,
            last_minute_reported: 0,
            monthly: None,
            approaching_fired: false,
            limit_fired: false,
        }
    }

    fn snapshot(&self) -> UsageSnapshot {
        let session_minutes_completed = (self.session_seconds / 60) as u32;
        match &self.monthly {
            Some(limits) => UsageSnapshot {
                session_seconds: self.session_seconds,
                session_minutes_completed,
                minutes_used: limits.minutes_used,
                minutes_limit: limits.minutes_limit,
                minutes_remaining: limits.minutes_remaining,
                percentage_used: limits.percentage_used,
                can_record: limits.can_record,
            },
            None => UsageSnapshot {
                session_seconds: self.session_seconds,
                session_minutes_completed,
                can_record: true,
                ..UsageSnapshot::default()
            },
        }
    }

    /// Latched threshold events. Each fires once per crossing and re-arms
    /// when the limit clears.
    fn threshold_events(&mut self, approaching_threshold: u32) -> Vec<UsageEvent> {
        let Some(limits) = &self.monthly else {
            return Vec::new();
        };
        let mut events = Vec::new();
        if limits.minutes_remaining == 0 || !limits.can_record {
            if !self.limit_fired {
                self.limit_fired = true;
                events.push(UsageEvent::LimitReached);
            }
        } else {
            self.limit_fired = false;
            if limits.minutes_remaining <= approaching_threshold {
                if !self.approaching_fired {
                    self.approaching_fired = true;
                    events.push(UsageEvent::ApproachingLimit {
                        minutes_remaining: limits.minutes_remaining,
                    });
                }
            } else {
                self.approaching_fired = false;
            }
        }
        events
    }
}

struct TickerTask {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

struct MeterInner {
    config: UsageMeterConfig,
    backend: Arc<dyn MeteringBackend>,
    state: TokioMutex<MeterState>,
    tracking: AtomicBool,
    visible: AtomicBool,
    suspended: AtomicBool,
    listeners: Listeners<UsageEvent>,
    ticker: Mutex<Option<TickerTask>>,
}

/// Counts recorded time and reports completed minutes.
#[derive(Clone)]
pub struct UsageMeter {
    inner: Arc<MeterInner>,
}

impl UsageMeter {
    pub fn new(config: UsageMeterConfig, backend: Arc<dyn MeteringBackend>) -> Self {
        Self {
            inner: Arc::new(MeterInner {
                config,
                backend,
                state: TokioMutex::new(MeterState::new()),
                tracking: AtomicBool::new(false),
                visible: AtomicBool::new(true),
                suspended: AtomicBool::new(false),
                listeners: Listeners::new(),
                ticker: Mutex::new(None),
            }),
        }
    }

    /// Reset session counters for a new recording session.
    pub async fn begin_session(&self, session_id: Option<String>) {
        let mut state = self.inner.state.lock().await;
        state.session_id = session_id;
        state.session_seconds = 0;
        state.last_minute_reported = 0;
        state.approaching_fired = false;
        state.limit_fired = false;
    }

    /// Start the 1 Hz ticker. Re-entrant; a second call while tracking is a
    /// no-op rather than a second ticker.
    pub fn start_tracking(&self) {
        if self.inner.tracking.swap(true, Ordering::SeqCst) {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let meter = self.clone();
        let tick_interval = self.inner.config.tick_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The immediate first tick would count a second that has not
            // elapsed yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => meter.tick().await,
                }
            }
        });
        *self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(TickerTask {
            shutdown: shutdown_tx,
            handle,
        });
        info!("Usage tracking started");
    }

    /// Stop the ticker and report the trailing partial minute, if any.
    pub async fn stop_tracking(&self) {
        if !self.inner.tracking.swap(false, Ordering::SeqCst) {
            return;
        }
        let task = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.shutdown.send(());
            let _ = task.handle.await;
        }

        let report = {
            let state = self.inner.state.lock().await;
            let leftover = state
                .session_seconds
                .saturating_sub(state.last_minute_reported * 60);
            if leftover > 0 {
                state.session_id.clone().map(|session_id| UsageReport {
                    session_id,
                    seconds_recorded: leftover as u32,
                    minute_timestamp: Utc::now(),
                })
            } else {
                None
            }
        };
        if let Some(report) = report {
            if self.inner.backend.has_credentials() {
                debug!(
                    seconds = report.seconds_recorded,
                    "Reporting partial minute"
                );
                self.send_report(report).await;
            }
        }
        info!("Usage tracking stopped");
    }

    pub fn is_tracking(&self) -> bool {
        self.inner.tracking.load(Ordering::SeqCst)
    }

    /// Whether the UI surface is visible. Hidden UI suppresses the clock.
    pub fn set_visible(&self, visible: bool) {
        self.inner.visible.store(visible, Ordering::SeqCst);
    }

    /// Pause suppression, same mechanism as hidden UI.
    pub fn set_suspended(&self, suspended: bool) {
        self.inner.suspended.store(suspended, Ordering::SeqCst);
    }

    /// Fetch authoritative monthly limits and store them.
    pub async fn refresh_limits(&self) -> Result<UsageLimits> {
        if !self.inner.backend.has_credentials() {
            return Err(ConfabLiveError::Metering(
                "metering credentials missing".to_string(),
            ));
        }
        let limits = self.inner.backend.fetch_limits().await?;
        let (snapshot, events) = {
            let mut state = self.inner.state.lock().await;
            state.monthly = Some(limits.clone());
            let events = state.threshold_events(self.inner.config.approaching_threshold_minutes);
            (state.snapshot(), events)
        };
        self.inner.listeners.emit(&UsageEvent::Updated(snapshot));
        for event in events {
            self.inner.listeners.emit(&event);
        }
        Ok(limits)
    }

    pub async fn snapshot(&self) -> UsageSnapshot {
        self.inner.state.lock().await.snapshot()
    }

    pub fn subscribe(&self, callback: impl Fn(&UsageEvent) + Send + 'static) -> Subscription {
        self.inner.listeners.subscribe(callback)
    }

    async fn tick(&self) {
        if !self.inner.visible.load(Ordering::SeqCst) || self.inner.suspended.load(Ordering::SeqCst)
        {
            return;
        }
        let (snapshot, report) = {
            let mut state = self.inner.state.lock().await;
            state.session_seconds += 1;
            let minute = state.session_seconds / 60;
            let report = if minute > state.last_minute_reported {
                state.last_minute_reported = minute;
                state.session_id.clone().map(|session_id| UsageReport {
                    session_id,
                    seconds_recorded: 60,
                    minute_timestamp: Utc::now(),
                })
            } else {
                None
            };
            (state.snapshot(), report)
        };
        self.inner.listeners.emit(&UsageEvent::Updated(snapshot));

        if let Some(report) = report {
            if self.inner.backend.has_credentials() {
                let meter = self.clone();
                // Off the tick path so a slow endpoint cannot stall the clock.
                tokio::spawn(async move { meter.send_report(report).await });
            } else {
                debug!("No metering credentials; skipping minute report");
            }
        }
    }

    async fn send_report(&self, report: UsageReport) {
        match self.inner.backend.record_usage(report).await {
            Ok(ack) => self.apply_monthly_total(ack.total_minutes_used).await,
            // The watermark has already advanced; this minute is not retried.
            Err(e) => warn!("Usage report failed: {}", e),
        }
    }

    async fn apply_monthly_total(&self, total_minutes_used: u32) {
        let (snapshot, events) = {
            let mut state = self.inner.state.lock().await;
            let Some(limits) = &mut state.monthly else {
                debug!("No monthly limits cached; ignoring usage ack");
                return;
            };
            limits.minutes_used = total_minutes_used;
            limits.minutes_remaining = limits.minutes_limit.saturating_sub(total_minutes_used);
            limits.percentage_used = if limits.minutes_limit > 0 {
                total_minutes_used as f32 * 100.0 / limits.minutes_limit as f32
            } else {
                0.0
            };
            limits.can_record = limits.minutes_remaining > 0;
            let events = state.threshold_events(self.inner.config.approaching_threshold_minutes);
            (state.snapshot(), events)
        };
        self.inner.listeners.emit(&UsageEvent::Updated(snapshot));
        for event in events {
            self.inner.listeners.emit(&event);
        }
    }
}
