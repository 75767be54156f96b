//! Page renderers.
//!
//! A `Renderer` turns a URL into HTML, resource and script URLs, inline
//! script sources and (for real browsers) a runtime sink log. The HTTP
//! renderer is always available; the Chromium renderer needs the `browser`
//! feature.

#[cfg(feature = "browser")]
pub mod chromium;
pub mod http;

use crate::error::Result;
use crate::hooks::Instrumentation;
use crate::result::ScriptSource;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(feature = "browser")]
pub use chromium::ChromiumRenderer;
pub use http::HttpRenderer;

/// Per-render knobs.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Settle time after the document is ready.
    pub wait: Duration,
    /// Bound on the whole render step.
    pub timeout: Duration,
}

/// Raw output of rendering one page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderedPage {
    pub final_url: String,
    pub html: String,
    /// Every URL the page loaded.
    pub resources: Vec<String>,
    /// Absolute `<script src>` URLs.
    pub script_urls: Vec<String>,
    /// Inline script bodies.
    pub scripts: Vec<ScriptSource>,
    /// What the instrumentation recorded, `Null` when nothing ran.
    pub runtime_log: serde_json::Value,
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Navigate to `url` and collect the rendered page.
    ///
    /// When `instrumentation` is given, its script must be installed before
    /// any page script runs and its log collected at the end.
    async fn render(
        &self,
        url: &str,
        options: &RenderOptions,
        instrumentation: Option<&Instrumentation>,
    ) -> Result<RenderedPage>;

    /// Download one external script body.
    async fn fetch_script(&self, url: &str, timeout: Duration) -> Result<String>;

    /// Whether `render` executes page JavaScript.
    fn runs_scripts(&self) -> bool {
        false
    }

    /// Release long-lived resources. Later renders may fail.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
