use crate::origin::NormalizedUrl;
use crate::sinks::SinkFinding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Source text of one script as the renderer saw it.
///
/// `id` is the script URL, or empty for inline scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSource {
    pub id: String,
    pub text: String,
}

impl ScriptSource {
    pub fn inline(text: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            text: text.into(),
        }
    }

    pub fn external(url: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: url.into(),
            text: text.into(),
        }
    }
}

/// Everything one page scan produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageScan {
    pub target: NormalizedUrl,
    /// URL the renderer ended on after redirects.
    pub final_url: String,
    pub resources: Vec<String>,
    /// Path references found in the HTML and fetched scripts.
    pub endpoints: Vec<String>,
    pub script_urls: Vec<String>,
    pub sinks: Vec<SinkFinding>,
    /// Non-fatal failures, one `"<url> -> <reason>"` string each.
    pub errors: Vec<String>,
    pub scanned_at: DateTime<Utc>,
    pub duration: Duration,
}

impl PageScan {
    pub fn new(target: NormalizedUrl, scanned_at: DateTime<Utc>) -> Self {
        Self {
            final_url: target.raw.clone(),
            target,
            resources: Vec::new(),
            endpoints: Vec::new(),
            script_urls: Vec::new(),
            sinks: Vec::new(),
            errors: Vec::new(),
            scanned_at,
            duration: Duration::from_secs(0),
        }
    }

    pub fn site_id(&self) -> &str {
        &self.target.site_id
    }

    pub fn url_norm(&self) -> &str {
        &self.target.url_norm
    }
}
