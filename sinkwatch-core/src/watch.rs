//! Watch subscriptions and the scheduler that re-scans them.
//!
//! A watch is keyed by (site id, normalized URL). Every run re-scans the
//! page, persists the result, recomputes the page's [`WatchSummary`] from
//! the store and compares it with the summary of the previous run. A
//! changed run sends one notification.

use crate::data::Database;
use crate::error::{CoreError, Result};
use crate::model::{WatchFilter, WatchRun, WatchState, WatchSummary};
use crate::notify::{Notifier, discord_settings};
use crate::persist::save_scan;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sinkwatch_scanner::Scanner;
use sinkwatch_scanner::origin::normalize_url;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lower bound for the re-scan interval, in minutes.
pub const MIN_FREQ_MIN: i64 = 5;
/// Interval used when a subscription asks for zero or a negative frequency.
pub const DEFAULT_FREQ_MIN: i64 = 1440;

const WATCH_WAIT_SECS: u64 = 7;
const WATCH_SCRIPT_TIMEOUT_SECS: u64 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRequest {
    pub url: String,
    pub freq_min: i64,
    pub enabled: bool,
}

impl WatchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            freq_min: DEFAULT_FREQ_MIN,
            enabled: true,
        }
    }
}

pub fn next_run_at(now: DateTime<Utc>, freq_min: i64) -> DateTime<Utc> {
    now + ChronoDuration::minutes(freq_min.max(MIN_FREQ_MIN))
}

/// Creates or updates the watch for `request.url`. The first run is due one
/// interval from now.
pub fn subscribe(db: &Database, request: &WatchRequest, now: DateTime<Utc>) -> Result<WatchState> {
    let target = normalize_url(&request.url)?;
    let freq_min = if request.freq_min <= 0 {
        DEFAULT_FREQ_MIN
    } else {
        request.freq_min
    };

    let watch = WatchState {
        site_id: target.site_id.clone(),
        url_norm: target.url_norm.clone(),
        url: target.raw.clone(),
        enabled: request.enabled,
        freq_min,
        next_run_at: next_run_at(now, freq_min),
        last_run_at: None,
        last_change_at: None,
        last_summary: WatchSummary::default(),
        created_at: now,
        updated_at: now,
    };
    let outcome = db.upsert_watch(&watch)?;
    info!("Watch {:?} for {} every {} min", outcome, watch.url_norm, freq_min);

    db.get_watch(&watch.site_id, &watch.url_norm)?
        .ok_or_else(|| CoreError::NotFound(format!("watch {}", watch.url_norm)))
}

/// Removes a watch. Returns whether one existed.
pub fn unsubscribe(db: &Database, site_id: &str, url_norm: &str) -> Result<bool> {
    let removed = db.delete_watch(site_id, url_norm)?;
    if removed {
        info!("Removed watch for {}", url_norm);
    }
    Ok(removed)
}

/// Removes the watch of a raw URL.
pub fn unsubscribe_url(db: &Database, url: &str) -> Result<bool> {
    let target = normalize_url(url)?;
    unsubscribe(db, &target.site_id, &target.url_norm)
}

pub fn list_watches(db: &Database, filter: &WatchFilter) -> Result<Vec<WatchState>> {
    db.list_watches(filter)
}

fn rfc3339(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

pub fn summary_digest(site_id: &str, url_norm: &str, summary: &WatchSummary) -> String {
    let mut hasher = Sha256::new();
    for part in [
        site_id.to_string(),
        url_norm.to_string(),
        rfc3339(summary.last_endpoint_at),
        rfc3339(summary.last_sink_at),
        summary.endpoints.to_string(),
        summary.sinks.to_string(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update(b"\x1f");
    }
    format!("{:x}", hasher.finalize())
}

/// Reads the page's current aggregates from the store.
pub fn compute_summary(db: &Database, site_id: &str, url_norm: &str) -> Result<WatchSummary> {
    let (endpoints, last_endpoint_at) = db.page_endpoint_aggregate(site_id, url_norm)?;
    let (sinks, last_sink_at) = db.page_sink_aggregate(site_id, url_norm)?;
    let mut summary = WatchSummary {
        endpoints,
        sinks,
        last_endpoint_at,
        last_sink_at,
        digest: String::new(),
    };
    summary.digest = summary_digest(site_id, url_norm, &summary);
    Ok(summary)
}

fn advanced(current: Option<DateTime<Utc>>, previous: Option<DateTime<Utc>>) -> bool {
    match (current, previous) {
        (Some(c), Some(p)) => c > p,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Any count difference, in either direction, or a newer timestamp.
pub fn is_changed(previous: &WatchSummary, current: &WatchSummary) -> bool {
    current.endpoints != previous.endpoints
        || current.sinks != previous.sinks
        || advanced(current.last_endpoint_at, previous.last_endpoint_at)
        || advanced(current.last_sink_at, previous.last_sink_at)
}

pub fn change_message(watch: &WatchState, previous: &WatchSummary, current: &WatchSummary) -> String {
    format!(
        "**sinkwatch** change on {}\nsite: {}\nendpoints: {} -> {}\nsinks: {} -> {}\nlast endpoint: {}\nlast sink: {}",
        watch.url,
        watch.site_id,
        previous.endpoints,
        current.endpoints,
        previous.sinks,
        current.sinks,
        rfc3339(current.last_endpoint_at),
        rfc3339(current.last_sink_at),
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            batch_size: 50,
        }
    }
}

/// Result of one watch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Unchanged,
    Changed { notified: bool },
    /// The scan or save failed. The previous summary is kept.
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub unchanged: usize,
    pub changed: usize,
    pub notified: usize,
    pub failed: usize,
}

impl TickReport {
    fn record(&mut self, status: &RunStatus) {
        match status {
            RunStatus::Unchanged => self.unchanged += 1,
            RunStatus::Changed { notified } => {
                self.changed += 1;
                if *notified {
                    self.notified += 1;
                }
            }
            RunStatus::Failed(_) => self.failed += 1,
        }
    }
}

pub struct WatchScheduler {
    db: Arc<Database>,
    scanner: Scanner,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
}

impl WatchScheduler {
    /// Watch runs use a 7 second settle wait and an 8 second script timeout
    /// on top of the scanner's other settings.
    pub fn new(
        db: Arc<Database>,
        scanner: &Scanner,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        let scan_config = scanner
            .config()
            .clone()
            .with_wait(WATCH_WAIT_SECS)
            .with_script_timeout(WATCH_SCRIPT_TIMEOUT_SECS);
        Self {
            db,
            scanner: scanner.with_config(scan_config),
            notifier,
            config,
        }
    }

    /// Runs every watch due at `now`, up to the batch size, one after another.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = self.db.due_watches(now, self.config.batch_size)?;
        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            debug!("No watches due");
            return Ok(report);
        }

        info!("{} watches due", due.len());
        for watch in &due {
            let status = self.run_watch(watch, now).await;
            report.record(&status);
        }

        info!(
            "Watch tick done: {} changed, {} unchanged, {} failed, {} notified",
            report.changed, report.unchanged, report.failed, report.notified
        );
        Ok(report)
    }

    /// Runs one watch immediately, whether or not it is due or enabled.
    pub async fn scan_now(&self, site_id: &str, url_norm: &str) -> Result<RunStatus> {
        let watch = self
            .db
            .get_watch(site_id, url_norm)?
            .ok_or_else(|| CoreError::NotFound(format!("watch {} {}", site_id, url_norm)))?;
        Ok(self.run_watch(&watch, Utc::now()).await)
    }

    /// Ticks until `shutdown` turns true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.tick_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Watch scheduler started, tick every {}s", self.config.tick_secs);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_due(Utc::now()).await {
                        error!("Watch tick failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Watch scheduler stopped");
    }

    async fn run_watch(&self, watch: &WatchState, now: DateTime<Utc>) -> RunStatus {
        let next = next_run_at(now, watch.freq_min);

        let evaluated = match self.scan_and_summarize(watch).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                warn!("Watch run failed for {}: {}", watch.url_norm, e);
                Err(e.to_string())
            }
        };

        let (status, run) = match evaluated {
            Ok(summary) => {
                let changed = is_changed(&watch.last_summary, &summary);
                let status = if changed {
                    RunStatus::Changed {
                        notified: self.notify(watch, &summary).await,
                    }
                } else {
                    RunStatus::Unchanged
                };
                let run = WatchRun {
                    ran_at: now,
                    next_run_at: next,
                    summary: Some(summary),
                    changed,
                };
                (status, run)
            }
            Err(reason) => {
                let run = WatchRun {
                    ran_at: now,
                    next_run_at: next,
                    summary: None,
                    changed: false,
                };
                (RunStatus::Failed(reason), run)
            }
        };

        if let Err(e) = self.db.record_watch_run(&watch.site_id, &watch.url_norm, &run) {
            error!("Could not record watch run for {}: {}", watch.url_norm, e);
        }
        debug!("Watch {} -> {:?}, next run {}", watch.url_norm, status, next);
        status
    }

    async fn scan_and_summarize(&self, watch: &WatchState) -> Result<WatchSummary> {
        let scan = self.scanner.scan(&watch.url).await?;
        save_scan(&self.db, &scan, Utc::now())?;
        compute_summary(&self.db, &watch.site_id, &watch.url_norm)
    }

    /// Sends the change message when Discord notifications are enabled.
    /// Failures are logged and reported as not notified.
    async fn notify(&self, watch: &WatchState, summary: &WatchSummary) -> bool {
        let settings = match discord_settings(&self.db) {
            Ok(s) => s,
            Err(e) => {
                warn!("Could not read notification settings: {}", e);
                return false;
            }
        };
        if !settings.enabled || settings.webhook_url.is_empty() {
            debug!("Notifications disabled; change on {} not sent", watch.url_norm);
            return false;
        }

        let message = change_message(watch, &watch.last_summary, summary);
        match self.notifier.send(&settings.webhook_url, &message).await {
            Ok(()) => {
                info!("Notified change on {}", watch.url_norm);
                true
            }
            Err(e) => {
                warn!("Notification for {} failed: {}", watch.url_norm, e);
                false
            }
        }
    }
}
