use crate::error::{Result, ScanError};
use crate::hooks::{Instrumentation, parse_runtime_log};
use crate::origin::normalize_url;
use crate::paths::{extract_paths, unique_sorted};
use crate::renderer::http::DEFAULT_USER_AGENT;
use crate::renderer::{RenderOptions, Renderer};
use crate::result::{PageScan, ScriptSource};
use crate::sinks::{dedupe, scan_static};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Fixed part of the page deadline; the settle wait is added on top.
const PAGE_TIMEOUT_BASE_SECS: u64 = 45;

/// Slack on the outer render bound so a renderer's own page deadline fires
/// first and it can release the page before giving up.
const RENDER_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub wait_secs: u64,
    pub script_timeout_secs: u64,
    /// Defaults to 45 seconds plus `wait_secs`.
    pub page_timeout_secs: Option<u64>,
    pub max_script_bytes: usize,
    pub dynamic_hooks: bool,
    pub user_agent: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            wait_secs: 6,
            script_timeout_secs: 8,
            page_timeout_secs: None,
            max_script_bytes: 2 * 1024 * 1024,
            dynamic_hooks: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ScanConfig {
    pub fn with_wait(mut self, secs: u64) -> Self {
        self.wait_secs = secs;
        self
    }

    pub fn with_script_timeout(mut self, secs: u64) -> Self {
        self.script_timeout_secs = secs;
        self
    }

    pub fn with_page_timeout(mut self, secs: u64) -> Self {
        self.page_timeout_secs = Some(secs);
        self
    }

    pub fn with_dynamic_hooks(mut self, enabled: bool) -> Self {
        self.dynamic_hooks = enabled;
        self
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(
            self.page_timeout_secs
                .unwrap_or(PAGE_TIMEOUT_BASE_SECS + self.wait_secs),
        )
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }
}

/// Runs the render → extract → detect pipeline for single pages.
#[derive(Clone)]
pub struct Scanner {
    renderer: Arc<dyn Renderer>,
    config: ScanConfig,
}

impl Scanner {
    pub fn new(renderer: Arc<dyn Renderer>, config: ScanConfig) -> Self {
        Self { renderer, config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Same renderer, different knobs.
    pub fn with_config(&self, config: ScanConfig) -> Self {
        Self {
            renderer: Arc::clone(&self.renderer),
            config,
        }
    }

    /// Scans one page.
    ///
    /// Only an invalid URL or a failed/timed-out render is an error. Script
    /// download problems end up in [`PageScan::errors`].
    ///
    /// With a script-running renderer and dynamic hooks on, a sink that both
    /// appears in the source and executes is reported twice: once from the
    /// static pass and once with source type `runtime`. The two carry
    /// different positions and signatures, so [`dedupe`] keeps both.
    pub async fn scan(&self, raw_url: &str) -> Result<PageScan> {
        let target = normalize_url(raw_url)?;
        let started = Instant::now();
        let page_timeout = self.config.page_timeout();
        let deadline = started + page_timeout;
        let scanned_at = Utc::now();

        info!("Scanning {}", target.url_norm);

        let instrumentation = (self.config.dynamic_hooks && self.renderer.runs_scripts())
            .then(Instrumentation::new);
        let options = RenderOptions {
            wait: Duration::from_secs(self.config.wait_secs),
            timeout: page_timeout,
        };

        let rendered = tokio::time::timeout(
            page_timeout + RENDER_GRACE,
            self.renderer.render(&target.raw, &options, instrumentation.as_ref()),
        )
        .await
        .map_err(|_| ScanError::Timeout(page_timeout.as_secs()))??;

        let mut scan = PageScan::new(target, scanned_at);
        scan.final_url = rendered.final_url.clone();

        let mut endpoints = extract_paths(&rendered.html);
        let script_urls = unique_sorted(rendered.script_urls.iter().map(String::as_str));

        let (fetched, errors) = self.fetch_scripts(&script_urls, deadline).await;
        for script in &fetched {
            endpoints.extend(extract_paths(&script.text));
        }
        scan.errors = errors;

        let mut sources = rendered.scripts;
        sources.extend(fetched);

        let mut sinks = scan_static(
            &rendered.html,
            &sources,
            scan.url_norm(),
            scan.site_id(),
            scanned_at,
        );
        let runtime = parse_runtime_log(
            &rendered.runtime_log,
            scan.url_norm(),
            scan.site_id(),
            scanned_at,
        );
        debug!("{} static and {} runtime sink hits", sinks.len(), runtime.len());
        sinks.extend(runtime);

        scan.sinks = dedupe(sinks);
        scan.endpoints = unique_sorted(endpoints);
        scan.resources = unique_sorted(rendered.resources);
        scan.script_urls = script_urls;
        scan.duration = started.elapsed();

        info!(
            "Scanned {} in {:.2}s: {} endpoints, {} scripts, {} sinks, {} errors",
            scan.url_norm(),
            scan.duration.as_secs_f64(),
            scan.endpoints.len(),
            scan.script_urls.len(),
            scan.sinks.len(),
            scan.errors.len()
        );

        Ok(scan)
    }

    /// Releases the renderer's resources, such as a browser process.
    pub async fn shutdown(&self) -> Result<()> {
        self.renderer.shutdown().await
    }

    /// Downloads script bodies concurrently, each bounded by the smaller of
    /// the per-script timeout and what is left of the page deadline.
    async fn fetch_scripts(
        &self,
        urls: &[String],
        deadline: Instant,
    ) -> (Vec<ScriptSource>, Vec<String>) {
        let per_script = self.config.script_timeout();

        let fetches = urls.iter().map(|url| {
            let renderer = Arc::clone(&self.renderer);
            async move {
                let budget = per_script.min(deadline.saturating_duration_since(Instant::now()));
                if budget.is_zero() {
                    return (url, Err("page deadline exceeded".to_string()));
                }
                let outcome = match tokio::time::timeout(budget, renderer.fetch_script(url, budget)).await {
                    Ok(Ok(text)) => Ok(text),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {}ms", budget.as_millis())),
                };
                (url, outcome)
            }
        });

        let mut scripts = Vec::new();
        let mut errors = Vec::new();
        for (url, outcome) in join_all(fetches).await {
            match outcome {
                Ok(text) => scripts.push(ScriptSource::external(url.clone(), text)),
                Err(reason) => {
                    warn!("Script fetch failed: {} -> {}", url, reason);
                    errors.push(format!("{} -> {}", url, reason));
                }
            }
        }
        (scripts, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::RenderedPage;
    use crate::sinks::{SinkKind, SourceType};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubRenderer {
        page: RenderedPage,
        scripts: HashMap<String, String>,
        render_delay: Duration,
        script_delay: Duration,
    }

    impl StubRenderer {
        fn new(html: &str) -> Self {
            Self {
                page: RenderedPage {
                    final_url: "https://example.com/".to_string(),
                    html: html.to_string(),
                    ..Default::default()
                },
                scripts: HashMap::new(),
                render_delay: Duration::ZERO,
                script_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Renderer for StubRenderer {
        async fn render(
            &self,
            _url: &str,
            _options: &RenderOptions,
            _instrumentation: Option<&Instrumentation>,
        ) -> Result<RenderedPage> {
            tokio::time::sleep(self.render_delay).await;
            Ok(self.page.clone())
        }

        async fn fetch_script(&self, url: &str, _timeout: Duration) -> Result<String> {
            tokio::time::sleep(self.script_delay).await;
            self.scripts
                .get(url)
                .cloned()
                .ok_or_else(|| ScanError::Other("404 Not Found".to_string()))
        }
    }

    /// Bounds its own work by `options.timeout` and notes whether it got to
    /// clean up afterwards, like a browser closing its tab.
    #[derive(Default)]
    struct DeadlineRenderer {
        cleaned_up: Arc<AtomicBool>,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Renderer for DeadlineRenderer {
        async fn render(
            &self,
            _url: &str,
            options: &RenderOptions,
            _instrumentation: Option<&Instrumentation>,
        ) -> Result<RenderedPage> {
            let outcome =
                tokio::time::timeout(options.timeout, tokio::time::sleep(Duration::from_secs(600))).await;
            self.cleaned_up.store(true, Ordering::SeqCst);
            match outcome {
                Ok(()) => Ok(RenderedPage::default()),
                Err(_) => Err(ScanError::Timeout(options.timeout.as_secs())),
            }
        }

        async fn fetch_script(&self, _url: &str, _timeout: Duration) -> Result<String> {
            Ok(String::new())
        }

        async fn shutdown(&self) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scanner(stub: StubRenderer, config: ScanConfig) -> Scanner {
        Scanner::new(Arc::new(stub), config)
    }

    #[tokio::test]
    async fn test_scan_collects_paths_and_sinks() {
        let mut stub = StubRenderer::new(r#"<a href="/about">x</a><script>eval("1+1")</script>"#);
        stub.page.scripts = vec![ScriptSource::inline(r#"eval("1+1")"#)];
        stub.page.script_urls = vec![
            "https://example.com/app.js".to_string(),
            "https://example.com/missing.js".to_string(),
        ];
        stub.scripts.insert(
            "https://example.com/app.js".to_string(),
            "fetch('/api/v1/me'); el.innerHTML = x;".to_string(),
        );

        let scan = scanner(stub, ScanConfig::default()).scan("example.com").await.unwrap();

        assert_eq!(scan.url_norm(), "https://example.com/");
        assert_eq!(scan.site_id(), "example.com");
        assert_eq!(scan.endpoints, vec!["/about", "/api/v1/me"]);
        assert_eq!(scan.errors, vec!["https://example.com/missing.js -> Other error: 404 Not Found"]);

        let eval: Vec<_> = scan.sinks.iter().filter(|s| s.kind == SinkKind::Eval).collect();
        assert_eq!(eval.len(), 1);
        assert_eq!(eval[0].source_type, SourceType::Inline);

        let from_app: Vec<_> = scan
            .sinks
            .iter()
            .filter(|s| s.source_url == "https://example.com/app.js")
            .map(|s| s.kind)
            .collect();
        assert!(from_app.contains(&SinkKind::Fetch));
        assert!(from_app.contains(&SinkKind::InnerHtml));
    }

    #[tokio::test]
    async fn test_invalid_url_fails_before_render() {
        let result = scanner(StubRenderer::new(""), ScanConfig::default()).scan("  ").await;
        assert!(matches!(result, Err(ScanError::InvalidUrl(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_timeout_fails_scan() {
        let mut stub = StubRenderer::new("<html></html>");
        stub.render_delay = Duration::from_secs(120);
        let config = ScanConfig::default().with_page_timeout(5);

        let result = scanner(stub, config).scan("https://example.com").await;
        assert!(matches!(result, Err(ScanError::Timeout(5))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renderer_deadline_fires_before_outer_bound() {
        let renderer = DeadlineRenderer::default();
        let cleaned_up = Arc::clone(&renderer.cleaned_up);
        let config = ScanConfig::default().with_page_timeout(5);

        let result = Scanner::new(Arc::new(renderer), config)
            .scan("https://example.com")
            .await;

        assert!(matches!(result, Err(ScanError::Timeout(5))));
        assert!(cleaned_up.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_reaches_renderer() {
        let renderer = DeadlineRenderer::default();
        let shutdowns = Arc::clone(&renderer.shutdowns);
        let scanner = Scanner::new(Arc::new(renderer), ScanConfig::default());

        scanner.with_config(ScanConfig::default().with_wait(7)).shutdown().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_static_and_runtime_eval_both_reported() {
        let mut stub = StubRenderer::new(r#"<script>eval("1+1")</script>"#);
        stub.page.scripts = vec![ScriptSource::inline(r#"eval("1+1")"#)];
        stub.page.runtime_log = serde_json::json!([
            {"kind": "eval", "file": "", "line": 3, "col": 9, "func": "", "snippet": "1+1"}
        ]);

        let scan = scanner(stub, ScanConfig::default()).scan("example.com").await.unwrap();

        let mut eval: Vec<_> = scan
            .sinks
            .iter()
            .filter(|s| s.kind == SinkKind::Eval)
            .map(|s| s.source_type)
            .collect();
        eval.sort_by_key(|t| t.as_str());
        assert_eq!(eval, vec![SourceType::Inline, SourceType::Runtime]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_script_becomes_error_entry() {
        let mut stub = StubRenderer::new("<html></html>");
        stub.page.script_urls = vec!["https://example.com/slow.js".to_string()];
        stub.scripts
            .insert("https://example.com/slow.js".to_string(), "eval(1)".to_string());
        stub.script_delay = Duration::from_secs(30);
        let config = ScanConfig::default().with_script_timeout(2);

        let scan = scanner(stub, config).scan("https://example.com").await.unwrap();
        assert_eq!(scan.errors.len(), 1);
        assert!(scan.errors[0].starts_with("https://example.com/slow.js -> timed out"));
        assert!(scan.sinks.is_empty());
    }

    #[test]
    fn test_config_defaults() {
        let config = ScanConfig::default();
        assert_eq!(config.page_timeout(), Duration::from_secs(51));
        assert_eq!(config.script_timeout(), Duration::from_secs(8));
        assert_eq!(config.max_script_bytes, 2 * 1024 * 1024);
        assert_eq!(ScanConfig::default().with_wait(7).page_timeout(), Duration::from_secs(52));
    }
}
