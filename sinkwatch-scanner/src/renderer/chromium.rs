//! Headless Chromium renderer using chromiumoxide.

use super::http::{build_client, fetch_text};
use super::{RenderOptions, RenderedPage, Renderer};
use crate::error::{Result, ScanError};
use crate::hooks::Instrumentation;
use crate::result::ScriptSource;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Environment variable naming the browser executable.
pub const CHROMIUM_ENV: &str = "SINKWATCH_CHROMIUM";

const RESOURCES_JS: &str = "performance.getEntriesByType('resource').map(r => r.name)";
const SCRIPT_URLS_JS: &str =
    "Array.from(document.querySelectorAll('script[src]')).map(s => new URL(s.src, location.href).href)";
const INLINE_SCRIPTS_JS: &str =
    "Array.from(document.querySelectorAll('script:not([src])')).map(s => s.textContent || '')";

fn browser_err(e: impl std::fmt::Display) -> ScanError {
    ScanError::Browser(e.to_string())
}

/// Closes a tab when dropped, so a cancelled render never leaks it.
struct PageGuard {
    page: Option<Page>,
}

impl PageGuard {
    fn new(page: Page) -> Self {
        Self { page: Some(page) }
    }

    async fn close(mut self, url: &str) {
        if let Some(page) = self.page.take()
            && let Err(e) = page.close().await
        {
            debug!("Closing page for {} failed: {}", url, e);
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(page) = self.page.take()
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(async move {
                let _ = page.close().await;
            });
        }
    }
}

pub struct ChromiumRenderer {
    browser: Mutex<Browser>,
    client: Client,
    max_script_bytes: usize,
    handler: JoinHandle<()>,
}

impl ChromiumRenderer {
    /// Launches a headless browser. `SINKWATCH_CHROMIUM` overrides executable discovery.
    pub async fn launch(user_agent: &str, max_script_bytes: usize) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg(format!("--user-agent={}", user_agent));
        if let Ok(path) = std::env::var(CHROMIUM_ENV) {
            builder = builder.chrome_executable(PathBuf::from(path));
        }
        let config = builder.build().map_err(browser_err)?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(browser_err)?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler event error: {}", e);
                }
            }
        });

        Ok(Self {
            browser: Mutex::new(browser),
            client: build_client(user_agent)?,
            max_script_bytes,
            handler,
        })
    }

    async fn drive(
        &self,
        page: &Page,
        url: &str,
        options: &RenderOptions,
        instrumentation: Option<&Instrumentation>,
    ) -> Result<RenderedPage> {
        if let Some(inst) = instrumentation {
            page.evaluate_on_new_document(AddScriptToEvaluateOnNewDocumentParams::new(inst.script()))
                .await
                .map_err(browser_err)?;
        }

        page.goto(url)
            .await
            .map_err(|e| ScanError::Navigation(format!("{}: {}", url, e)))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| ScanError::Navigation(format!("{}: {}", url, e)))?;
        tokio::time::sleep(options.wait).await;

        let html = page.content().await.map_err(browser_err)?;
        let final_url = page
            .url()
            .await
            .map_err(browser_err)?
            .unwrap_or_else(|| url.to_string());

        let resources: Vec<String> = best_effort(page, RESOURCES_JS, url).await;
        let script_urls: Vec<String> = best_effort(page, SCRIPT_URLS_JS, url).await;
        let inline: Vec<String> = best_effort(page, INLINE_SCRIPTS_JS, url).await;
        let scripts = inline
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .map(ScriptSource::inline)
            .collect();

        let runtime_log = match instrumentation {
            Some(inst) => match evaluate::<String>(page, &inst.collect_expression()).await {
                Ok(raw) => serde_json::Value::String(raw),
                Err(e) => {
                    warn!("Could not collect runtime sink log from {}: {}", url, e);
                    serde_json::Value::Null
                }
            },
            None => serde_json::Value::Null,
        };

        Ok(RenderedPage {
            final_url,
            html,
            resources,
            script_urls,
            scripts,
            runtime_log,
        })
    }
}

async fn evaluate<T: DeserializeOwned>(page: &Page, expr: &str) -> Result<T> {
    page.evaluate(expr)
        .await
        .map_err(browser_err)?
        .into_value::<T>()
        .map_err(browser_err)
}

async fn best_effort<T: DeserializeOwned + Default>(page: &Page, expr: &str, url: &str) -> T {
    match evaluate(page, expr).await {
        Ok(v) => v,
        Err(e) => {
            warn!("Evaluation failed on {}: {}", url, e);
            T::default()
        }
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn render(
        &self,
        url: &str,
        options: &RenderOptions,
        instrumentation: Option<&Instrumentation>,
    ) -> Result<RenderedPage> {
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(browser_err)?;
        let guard = PageGuard::new(page.clone());

        let outcome = tokio::time::timeout(
            options.timeout,
            self.drive(&page, url, options, instrumentation),
        )
        .await;

        guard.close(url).await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(ScanError::Timeout(options.timeout.as_secs())),
        }
    }

    async fn fetch_script(&self, url: &str, timeout: Duration) -> Result<String> {
        fetch_text(&self.client, url, timeout, self.max_script_bytes).await
    }

    fn runs_scripts(&self) -> bool {
        true
    }

    async fn shutdown(&self) -> Result<()> {
        let result = self.browser.lock().await.close().await.map_err(browser_err);
        self.handler.abort();
        result.map(|_| ())
    }
}
