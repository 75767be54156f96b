use super::{RenderOptions, RenderedPage, Renderer};
use crate::error::{Result, ScanError};
use crate::hooks::Instrumentation;
use crate::paths::unique_sorted;
use crate::result::ScriptSource;
use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; sinkwatch/0.1)";

/// Attributes that make the browser load something.
const RESOURCE_ATTRS: &[(&str, &str)] = &[
    ("link[href]", "href"),
    ("script[src]", "src"),
    ("img[src]", "src"),
    ("iframe[src]", "src"),
    ("frame[src]", "src"),
    ("source[src]", "src"),
    ("video[src]", "src"),
    ("audio[src]", "src"),
    ("embed[src]", "src"),
    ("object[data]", "data"),
];

/// Fetches pages over plain HTTP and reads them with an HTML parser.
///
/// No JavaScript runs, so the runtime log is always empty and resources are
/// approximated from loading attributes in the markup.
pub struct HttpRenderer {
    client: Client,
    max_script_bytes: usize,
}

impl HttpRenderer {
    pub fn new(user_agent: &str, max_script_bytes: usize) -> Result<Self> {
        Ok(Self {
            client: build_client(user_agent)?,
            max_script_bytes,
        })
    }

    pub fn with_client(client: Client, max_script_bytes: usize) -> Self {
        Self {
            client,
            max_script_bytes,
        }
    }
}

pub(crate) fn build_client(user_agent: &str) -> Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(ScanError::from)
}

/// GETs `url` and decodes the body, refusing anything over `max_bytes`.
pub(crate) async fn fetch_text(
    client: &Client,
    url: &str,
    timeout: Duration,
    max_bytes: usize,
) -> Result<String> {
    let mut response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await?
        .error_for_status()?;

    if let Some(len) = response.content_length()
        && len as usize > max_bytes
    {
        return Err(ScanError::Other(format!("body of {} bytes exceeds {} byte limit", len, max_bytes)));
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > max_bytes {
            return Err(ScanError::Other(format!("body exceeds {} byte limit", max_bytes)));
        }
        body.extend_from_slice(&chunk);
    }

    Ok(String::from_utf8_lossy(&body).into_owned())
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn render(
        &self,
        url: &str,
        options: &RenderOptions,
        instrumentation: Option<&Instrumentation>,
    ) -> Result<RenderedPage> {
        if instrumentation.is_some() {
            debug!("HTTP renderer does not execute scripts; runtime hooks skipped for {}", url);
        }

        let response = self
            .client
            .get(url)
            .timeout(options.timeout)
            .send()
            .await
            .map_err(|e| ScanError::Navigation(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            warn!("{} answered {}; scanning the body anyway", url, status);
        }
        let final_url = response.url().to_string();
        let html = response
            .text()
            .await
            .map_err(|e| ScanError::Navigation(format!("{}: {}", url, e)))?;

        let (resources, script_urls, scripts) = parse_document(&html, &final_url)?;
        debug!(
            "Parsed {}: {} resources, {} script URLs, {} inline scripts",
            final_url,
            resources.len(),
            script_urls.len(),
            scripts.len()
        );

        Ok(RenderedPage {
            final_url,
            html,
            resources,
            script_urls,
            scripts,
            runtime_log: serde_json::Value::Null,
        })
    }

    async fn fetch_script(&self, url: &str, timeout: Duration) -> Result<String> {
        fetch_text(&self.client, url, timeout, self.max_script_bytes).await
    }
}

fn selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| ScanError::ParseError(format!("selector {}: {}", s, e)))
}

/// Extracts (resources, script URLs, inline scripts) from a document.
pub fn parse_document(
    html: &str,
    base_url: &str,
) -> Result<(Vec<String>, Vec<String>, Vec<ScriptSource>)> {
    let document = Html::parse_document(html);

    let mut resources = Vec::new();
    for (css, attr) in RESOURCE_ATTRS {
        let sel = selector(css)?;
        for element in document.select(&sel) {
            if let Some(value) = element.value().attr(attr)
                && let Some(absolute) = resolve_url(base_url, value)
            {
                resources.push(absolute);
            }
        }
    }

    let script_sel = selector("script")?;
    let mut script_urls = Vec::new();
    let mut scripts = Vec::new();
    for element in document.select(&script_sel) {
        let el = element.value();
        if !is_executable_type(el.attr("type")) {
            continue;
        }
        match el.attr("src") {
            Some(src) => {
                if let Some(absolute) = resolve_url(base_url, src) {
                    script_urls.push(absolute);
                }
            }
            None => {
                let text: String = element.text().collect();
                if !text.trim().is_empty() {
                    scripts.push(ScriptSource::inline(text));
                }
            }
        }
    }

    Ok((unique_sorted(resources), unique_sorted(script_urls), scripts))
}

fn is_executable_type(ty: Option<&str>) -> bool {
    match ty.map(|t| t.trim().to_ascii_lowercase()) {
        None => true,
        Some(t) => t.is_empty() || t == "module" || t.contains("javascript") || t.contains("ecmascript"),
    }
}

/// Resolves `href` against `base`, dropping non-fetchable schemes and fragments.
pub fn resolve_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("data:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
    {
        return None;
    }

    let base_url = Url::parse(base).ok()?;
    let mut resolved = base_url.join(href).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_document_splits_scripts() {
        let html = r#"<html><head>
            <script src="/static/app.js"></script>
            <script src="https://cdn.other.com/lib.js#v"></script>
            <script type="application/ld+json">{"a": 1}</script>
            <script>eval("1+1")</script>
            <link rel="stylesheet" href="css/site.css">
        </head><body><img src="data:image/png;base64,AA"><a href="/x">x</a></body></html>"#;

        let (resources, script_urls, scripts) = parse_document(html, "https://example.com/dir/page").unwrap();

        assert_eq!(
            script_urls,
            vec!["https://cdn.other.com/lib.js", "https://example.com/static/app.js"]
        );
        assert_eq!(scripts, vec![ScriptSource::inline(r#"eval("1+1")"#)]);
        assert!(resources.contains(&"https://example.com/dir/css/site.css".to_string()));
        assert!(resources.contains(&"https://example.com/static/app.js".to_string()));
        assert!(!resources.iter().any(|r| r.starts_with("data:")));
        assert!(!resources.iter().any(|r| r.ends_with("/x")));
    }

    #[test]
    fn test_resolve_url() {
        let base = "https://example.com/a/b";
        assert_eq!(resolve_url(base, "c.js"), Some("https://example.com/a/c.js".to_string()));
        assert_eq!(resolve_url(base, "//cdn.com/x"), Some("https://cdn.com/x".to_string()));
        assert_eq!(resolve_url(base, "/y#frag"), Some("https://example.com/y".to_string()));
        assert_eq!(resolve_url(base, "javascript:void(0)"), None);
        assert_eq!(resolve_url(base, "#top"), None);
        assert_eq!(resolve_url(base, ""), None);
    }

    #[test]
    fn test_executable_types() {
        assert!(is_executable_type(None));
        assert!(is_executable_type(Some("text/javascript")));
        assert!(is_executable_type(Some("module")));
        assert!(!is_executable_type(Some("application/json")));
        assert!(!is_executable_type(Some("text/template")));
    }
}
