// Tests for watch subscriptions and scheduled re-scans

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sinkwatch_core::data::Database;
use sinkwatch_core::error::{CoreError, Result as CoreResult};
use sinkwatch_core::model::WatchFilter;
use sinkwatch_core::notify::{Notifier, set_discord_settings};
use sinkwatch_core::watch::{
    DEFAULT_FREQ_MIN, RunStatus, SchedulerConfig, WatchRequest, WatchScheduler, compute_summary,
    list_watches, subscribe, unsubscribe_url,
};
use sinkwatch_scanner::renderer::http::parse_document;
use sinkwatch_scanner::{
    Instrumentation, RenderOptions, RenderedPage, Renderer, ScanConfig, ScanError, Scanner,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const WEBHOOK: &str = "https://discord.com/api/webhooks/123/token";
const PAGE: &str = "https://www.example.com/";

struct StubRenderer {
    html: Mutex<String>,
    fail: AtomicBool,
}

impl StubRenderer {
    fn new(html: &str) -> Arc<Self> {
        Arc::new(Self {
            html: Mutex::new(html.to_string()),
            fail: AtomicBool::new(false),
        })
    }

    fn set_html(&self, html: &str) {
        *self.html.lock().unwrap() = html.to_string();
    }
}

#[async_trait]
impl Renderer for StubRenderer {
    async fn render(
        &self,
        url: &str,
        _options: &RenderOptions,
        _instrumentation: Option<&Instrumentation>,
    ) -> Result<RenderedPage, ScanError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ScanError::Navigation(format!("{}: connection refused", url)));
        }
        let html = self.html.lock().unwrap().clone();
        let (resources, script_urls, scripts) = parse_document(&html, url)?;
        Ok(RenderedPage {
            final_url: url.to_string(),
            html,
            resources,
            script_urls,
            scripts,
            runtime_log: serde_json::Value::Null,
        })
    }

    async fn fetch_script(&self, url: &str, _timeout: std::time::Duration) -> Result<String, ScanError> {
        Err(ScanError::Other(format!("no script at {}", url)))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
    fail: bool,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, destination: &str, content: &str) -> CoreResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), content.to_string()));
        if self.fail {
            return Err(CoreError::Notify("webhook answered 500".to_string()));
        }
        Ok(())
    }
}

impl RecordingNotifier {
    fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

struct Harness {
    _temp_dir: TempDir,
    db: Arc<Database>,
    renderer: Arc<StubRenderer>,
    notifier: Arc<RecordingNotifier>,
    scheduler: WatchScheduler,
}

fn harness(html: &str, notifier: RecordingNotifier, config: SchedulerConfig) -> Harness {
    let temp_dir = TempDir::new().unwrap();
    let db = Arc::new(Database::new(&temp_dir.path().join("test.db")).unwrap());
    let renderer = StubRenderer::new(html);
    let notifier = Arc::new(notifier);
    let scanner = Scanner::new(renderer.clone(), ScanConfig::default());
    let scheduler = WatchScheduler::new(db.clone(), &scanner, notifier.clone(), config);
    Harness {
        _temp_dir: temp_dir,
        db,
        renderer,
        notifier,
        scheduler,
    }
}

fn watch_request(url: &str, freq_min: i64) -> WatchRequest {
    WatchRequest {
        url: url.to_string(),
        freq_min,
        enabled: true,
    }
}

const QUIET_PAGE: &str = "<html><body><p>nothing to see</p></body></html>";
const EVAL_PAGE: &str = r#"<html><body><script>eval("1+1")</script></body></html>"#;

// ============================================================================
// Subscription Tests
// ============================================================================

#[test]
fn test_subscribe_normalizes_and_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
    let now = Utc::now();

    let watch = subscribe(&db, &watch_request("WWW.Example.com", 0), now).unwrap();
    assert_eq!(watch.site_id, "example.com");
    assert_eq!(watch.url_norm, PAGE);
    assert_eq!(watch.freq_min, DEFAULT_FREQ_MIN);
    assert_eq!(
        watch.next_run_at.timestamp_millis(),
        (now + Duration::minutes(DEFAULT_FREQ_MIN)).timestamp_millis()
    );

    let fast = subscribe(&db, &watch_request(PAGE, 1), now).unwrap();
    assert_eq!(fast.freq_min, 1);
    assert_eq!(
        fast.next_run_at.timestamp_millis(),
        (now + Duration::minutes(5)).timestamp_millis()
    );
    assert_eq!(fast.created_at.timestamp_millis(), watch.created_at.timestamp_millis());
    assert_eq!(list_watches(&db, &WatchFilter::default()).unwrap().len(), 1);

    assert!(unsubscribe_url(&db, "www.example.com").unwrap());
    assert!(list_watches(&db, &WatchFilter::default()).unwrap().is_empty());
}

#[test]
fn test_subscribe_rejects_bad_url() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("test.db")).unwrap();

    let result = subscribe(&db, &watch_request("   ", 10), Utc::now());
    assert!(matches!(result, Err(CoreError::Validation(_))));
}

// ============================================================================
// Scheduler Tests
// ============================================================================

fn after(start: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    start + Duration::minutes(minutes)
}

#[tokio::test]
async fn test_unchanged_run_sends_nothing() {
    let h = harness(QUIET_PAGE, RecordingNotifier::default(), SchedulerConfig::default());
    set_discord_settings(&h.db, WEBHOOK, true, Utc::now()).unwrap();
    let start = Utc::now();
    subscribe(&h.db, &watch_request(PAGE, 5), start).unwrap();

    let report = h.scheduler.run_due(after(start, 6)).await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.changed, 0);
    assert!(h.notifier.messages().is_empty());

    let watch = h.db.get_watch("example.com", PAGE).unwrap().unwrap();
    assert_eq!(
        watch.last_run_at.unwrap().timestamp_millis(),
        after(start, 6).timestamp_millis()
    );
    assert_eq!(
        watch.next_run_at.timestamp_millis(),
        after(start, 11).timestamp_millis()
    );
    assert!(watch.last_change_at.is_none());
}

#[tokio::test]
async fn test_new_sink_triggers_one_notification() {
    let h = harness(QUIET_PAGE, RecordingNotifier::default(), SchedulerConfig::default());
    set_discord_settings(&h.db, WEBHOOK, true, Utc::now()).unwrap();
    let start = Utc::now();
    subscribe(&h.db, &watch_request(PAGE, 5), start).unwrap();
    h.scheduler.run_due(after(start, 6)).await.unwrap();

    h.renderer.set_html(EVAL_PAGE);
    let report = h.scheduler.run_due(after(start, 12)).await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(report.notified, 1);

    let messages = h.notifier.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, WEBHOOK);
    assert!(messages[0].1.contains("sinks: 0 -> 1"));

    let watch = h.db.get_watch("example.com", PAGE).unwrap().unwrap();
    assert_eq!(watch.last_summary.sinks, 1);
    assert_eq!(watch.last_summary.endpoints, 0);
    assert_eq!(watch.last_summary.digest.len(), 64);
    assert!(watch.last_change_at.is_some());
    assert_eq!(
        watch.last_summary,
        compute_summary(&h.db, "example.com", PAGE).unwrap()
    );
}

#[tokio::test]
async fn test_not_due_watch_is_skipped() {
    let h = harness(EVAL_PAGE, RecordingNotifier::default(), SchedulerConfig::default());
    let start = Utc::now();
    subscribe(&h.db, &watch_request(PAGE, 30), start).unwrap();

    let report = h.scheduler.run_due(after(start, 10)).await.unwrap();
    assert_eq!(report.due, 0);
    assert!(h.db.get_watch("example.com", PAGE).unwrap().unwrap().last_run_at.is_none());
}

#[tokio::test]
async fn test_disabled_notifications_still_record_change() {
    let h = harness(EVAL_PAGE, RecordingNotifier::default(), SchedulerConfig::default());
    let start = Utc::now();
    subscribe(&h.db, &watch_request(PAGE, 5), start).unwrap();

    let report = h.scheduler.run_due(after(start, 6)).await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(report.notified, 0);
    assert!(h.notifier.messages().is_empty());
    assert!(h.db.get_watch("example.com", PAGE).unwrap().unwrap().last_change_at.is_some());
}

#[tokio::test]
async fn test_failed_scan_keeps_summary_and_reschedules() {
    let h = harness(QUIET_PAGE, RecordingNotifier::default(), SchedulerConfig::default());
    set_discord_settings(&h.db, WEBHOOK, true, Utc::now()).unwrap();
    let start = Utc::now();
    subscribe(&h.db, &watch_request(PAGE, 5), start).unwrap();

    h.renderer.fail.store(true, Ordering::SeqCst);
    let report = h.scheduler.run_due(after(start, 6)).await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(h.notifier.messages().is_empty());

    let watch = h.db.get_watch("example.com", PAGE).unwrap().unwrap();
    assert_eq!(watch.last_summary.digest, "");
    assert_eq!(
        watch.next_run_at.timestamp_millis(),
        after(start, 11).timestamp_millis()
    );
}

#[tokio::test]
async fn test_failing_notifier_does_not_stop_batch() {
    let notifier = RecordingNotifier {
        fail: true,
        ..Default::default()
    };
    let h = harness(EVAL_PAGE, notifier, SchedulerConfig::default());
    set_discord_settings(&h.db, WEBHOOK, true, Utc::now()).unwrap();
    let start = Utc::now();
    subscribe(&h.db, &watch_request("https://www.example.com/a", 5), start).unwrap();
    subscribe(&h.db, &watch_request("https://www.example.com/b", 5), start).unwrap();

    let report = h.scheduler.run_due(after(start, 6)).await.unwrap();
    assert_eq!(report.due, 2);
    assert_eq!(report.changed, 2);
    assert_eq!(report.notified, 0);
    assert_eq!(h.notifier.messages().len(), 2);

    for url in ["https://www.example.com/a", "https://www.example.com/b"] {
        let watch = h.db.get_watch("example.com", url).unwrap().unwrap();
        assert!(watch.last_run_at.is_some());
    }
}

#[tokio::test]
async fn test_batch_size_bounds_tick() {
    let config = SchedulerConfig {
        batch_size: 2,
        ..Default::default()
    };
    let h = harness(QUIET_PAGE, RecordingNotifier::default(), config);
    let start = Utc::now();
    for page in ["a", "b", "c"] {
        let url = format!("https://www.example.com/{}", page);
        subscribe(&h.db, &watch_request(&url, 5), start).unwrap();
    }

    let first = h.scheduler.run_due(after(start, 6)).await.unwrap();
    assert_eq!(first.due, 2);
    let second = h.scheduler.run_due(after(start, 6)).await.unwrap();
    assert_eq!(second.due, 1);
}

#[tokio::test]
async fn test_scan_now_runs_immediately() {
    let h = harness(EVAL_PAGE, RecordingNotifier::default(), SchedulerConfig::default());
    subscribe(&h.db, &watch_request(PAGE, 60), Utc::now()).unwrap();

    let status = h.scheduler.scan_now("example.com", PAGE).await.unwrap();
    assert_eq!(status, RunStatus::Changed { notified: false });
    assert!(h.db.get_watch("example.com", PAGE).unwrap().unwrap().last_run_at.is_some());

    let missing = h.scheduler.scan_now("example.com", "https://www.example.com/none").await;
    assert!(matches!(missing, Err(CoreError::NotFound(_))));
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let h = harness(QUIET_PAGE, RecordingNotifier::default(), SchedulerConfig::default());
    let (tx, rx) = tokio::sync::watch::channel(false);

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();
    });
    tokio::time::timeout(std::time::Duration::from_secs(5), h.scheduler.run(rx))
        .await
        .expect("scheduler did not stop");
    stopper.await.unwrap();
}
