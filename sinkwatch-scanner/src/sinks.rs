//! Static sink detection.
//!
//! A fixed catalogue of (kind, pattern, scope) rows is matched against the
//! rendered HTML and every script source independently. Patterns operate on
//! raw text and ignore string/comment boundaries, so over-detection is
//! expected.

use crate::result::ScriptSource;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

/// Characters of context kept on each side of a match.
pub const SNIPPET_RADIUS: usize = 120;

/// Upper bound on a stored snippet, also applied before signing.
pub const MAX_SNIPPET_CHARS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SinkKind {
    #[serde(rename = "innerHTML")]
    InnerHtml,
    #[serde(rename = "dangerouslySetInnerHTML")]
    DangerouslySetInnerHtml,
    #[serde(rename = "eval")]
    Eval,
    #[serde(rename = "newFunction")]
    NewFunction,
    #[serde(rename = "setTimeoutStr")]
    SetTimeoutStr,
    #[serde(rename = "setIntervalStr")]
    SetIntervalStr,
    #[serde(rename = "documentWrite")]
    DocumentWrite,
    #[serde(rename = "prompt")]
    Prompt,
    #[serde(rename = "alert")]
    Alert,
    #[serde(rename = "confirm")]
    Confirm,
    #[serde(rename = "fetch")]
    Fetch,
    #[serde(rename = "XMLHttpRequest")]
    XmlHttpRequest,
    #[serde(rename = "syncXHR")]
    SyncXhr,
    #[serde(rename = "localStorage")]
    LocalStorage,
    #[serde(rename = "sessionStorage")]
    SessionStorage,
    #[serde(rename = "JSON.parse")]
    JsonParse,
    #[serde(rename = "JSON.stringify")]
    JsonStringify,
    #[serde(rename = "postMessageSend")]
    PostMessageSend,
    #[serde(rename = "postMessageRecv")]
    PostMessageRecv,
    #[serde(rename = "postMessageListen")]
    PostMessageListen,
    #[serde(rename = "inlineEventHandler")]
    InlineEventHandler,
    #[serde(rename = "directDOM")]
    DirectDom,
    #[serde(rename = "heavyLoop")]
    HeavyLoop,
}

impl SinkKind {
    pub const ALL: [SinkKind; 23] = [
        SinkKind::InnerHtml,
        SinkKind::DangerouslySetInnerHtml,
        SinkKind::Eval,
        SinkKind::NewFunction,
        SinkKind::SetTimeoutStr,
        SinkKind::SetIntervalStr,
        SinkKind::DocumentWrite,
        SinkKind::Prompt,
        SinkKind::Alert,
        SinkKind::Confirm,
        SinkKind::Fetch,
        SinkKind::XmlHttpRequest,
        SinkKind::SyncXhr,
        SinkKind::LocalStorage,
        SinkKind::SessionStorage,
        SinkKind::JsonParse,
        SinkKind::JsonStringify,
        SinkKind::PostMessageSend,
        SinkKind::PostMessageRecv,
        SinkKind::PostMessageListen,
        SinkKind::InlineEventHandler,
        SinkKind::DirectDom,
        SinkKind::HeavyLoop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::InnerHtml => "innerHTML",
            SinkKind::DangerouslySetInnerHtml => "dangerouslySetInnerHTML",
            SinkKind::Eval => "eval",
            SinkKind::NewFunction => "newFunction",
            SinkKind::SetTimeoutStr => "setTimeoutStr",
            SinkKind::SetIntervalStr => "setIntervalStr",
            SinkKind::DocumentWrite => "documentWrite",
            SinkKind::Prompt => "prompt",
            SinkKind::Alert => "alert",
            SinkKind::Confirm => "confirm",
            SinkKind::Fetch => "fetch",
            SinkKind::XmlHttpRequest => "XMLHttpRequest",
            SinkKind::SyncXhr => "syncXHR",
            SinkKind::LocalStorage => "localStorage",
            SinkKind::SessionStorage => "sessionStorage",
            SinkKind::JsonParse => "JSON.parse",
            SinkKind::JsonStringify => "JSON.stringify",
            SinkKind::PostMessageSend => "postMessageSend",
            SinkKind::PostMessageRecv => "postMessageRecv",
            SinkKind::PostMessageListen => "postMessageListen",
            SinkKind::InlineEventHandler => "inlineEventHandler",
            SinkKind::DirectDom => "directDOM",
            SinkKind::HeavyLoop => "heavyLoop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a finding's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Html,
    Script,
    Inline,
    Runtime,
    Blob,
    Data,
    Dynamic,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Html => "html",
            SourceType::Script => "script",
            SourceType::Inline => "inline",
            SourceType::Runtime => "runtime",
            SourceType::Blob => "blob",
            SourceType::Data => "data",
            SourceType::Dynamic => "dynamic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "html" => Some(SourceType::Html),
            "script" => Some(SourceType::Script),
            "inline" => Some(SourceType::Inline),
            "runtime" => Some(SourceType::Runtime),
            "blob" => Some(SourceType::Blob),
            "data" => Some(SourceType::Data),
            "dynamic" => Some(SourceType::Dynamic),
            _ => None,
        }
    }
}

/// Which inputs a catalogue row is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Html,
    Script,
    Both,
}

impl Scope {
    fn covers_html(self) -> bool {
        matches!(self, Scope::Html | Scope::Both)
    }

    fn covers_script(self) -> bool {
        matches!(self, Scope::Script | Scope::Both)
    }
}

/// One row of the sink catalogue.
#[derive(Debug, Clone, Copy)]
pub struct SinkPattern {
    pub kind: SinkKind,
    pub pattern: &'static str,
    pub scope: Scope,
}

/// A double- or single-quoted JavaScript string literal.
macro_rules! js_str {
    () => {
        r#"(?:"(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*')"#
    };
}

pub const CATALOGUE: &[SinkPattern] = &[
    SinkPattern { kind: SinkKind::InnerHtml, pattern: r"\.innerHTML\s*=", scope: Scope::Script },
    SinkPattern {
        kind: SinkKind::DangerouslySetInnerHtml,
        pattern: r"dangerouslySetInnerHTML\s*:",
        scope: Scope::Script,
    },
    SinkPattern { kind: SinkKind::Eval, pattern: r"\beval\s*\(", scope: Scope::Script },
    SinkPattern { kind: SinkKind::NewFunction, pattern: r"\bnew\s+Function\s*\(", scope: Scope::Script },
    SinkPattern {
        kind: SinkKind::SetTimeoutStr,
        pattern: concat!(r"\bsetTimeout\s*\(\s*", js_str!()),
        scope: Scope::Script,
    },
    SinkPattern {
        kind: SinkKind::SetIntervalStr,
        pattern: concat!(r"\bsetInterval\s*\(\s*", js_str!()),
        scope: Scope::Script,
    },
    SinkPattern { kind: SinkKind::DocumentWrite, pattern: r"\bdocument\.write(?:ln)?\s*\(", scope: Scope::Script },
    SinkPattern { kind: SinkKind::Prompt, pattern: r"\bprompt\s*\(", scope: Scope::Script },
    SinkPattern { kind: SinkKind::Alert, pattern: r"\balert\s*\(", scope: Scope::Script },
    SinkPattern { kind: SinkKind::Confirm, pattern: r"\bconfirm\s*\(", scope: Scope::Script },
    SinkPattern { kind: SinkKind::Fetch, pattern: r"\bfetch\s*\(", scope: Scope::Script },
    SinkPattern { kind: SinkKind::XmlHttpRequest, pattern: r"\bnew\s+XMLHttpRequest\b", scope: Scope::Script },
    SinkPattern {
        kind: SinkKind::SyncXhr,
        pattern: r"\.open\s*\([^,]+,[^,]+,\s*false\s*\)",
        scope: Scope::Script,
    },
    SinkPattern { kind: SinkKind::LocalStorage, pattern: r"\blocalStorage\b", scope: Scope::Script },
    SinkPattern { kind: SinkKind::SessionStorage, pattern: r"\bsessionStorage\b", scope: Scope::Script },
    SinkPattern { kind: SinkKind::JsonParse, pattern: r"\bJSON\.parse\s*\(", scope: Scope::Script },
    SinkPattern { kind: SinkKind::JsonStringify, pattern: r"\bJSON\.stringify\s*\(", scope: Scope::Script },
    SinkPattern { kind: SinkKind::PostMessageSend, pattern: r"\.postMessage\s*\(", scope: Scope::Script },
    SinkPattern {
        kind: SinkKind::PostMessageRecv,
        pattern: r#"addEventListener\s*\(\s*['"]message['"]|\.onmessage\s*="#,
        scope: Scope::Both,
    },
    SinkPattern {
        kind: SinkKind::InlineEventHandler,
        pattern: concat!(r"\bon[a-zA-Z]+\s*=\s*", js_str!()),
        scope: Scope::Html,
    },
    SinkPattern {
        kind: SinkKind::DirectDom,
        pattern: r"document\.(?:getElementById|getElementsByClassName|querySelector(?:All)?)\s*\(",
        scope: Scope::Both,
    },
    SinkPattern {
        kind: SinkKind::HeavyLoop,
        pattern: r"for\s*\([^;]*;[^;]*<=?\s*\d{7,}\s*;|for\s*\(\s*;\s*;\s*\)|while\s*\(\s*(?:true|1)\s*\)",
        scope: Scope::Script,
    },
];

static COMPILED: Lazy<Vec<(SinkPattern, Regex)>> = Lazy::new(|| {
    CATALOGUE
        .iter()
        .map(|p| {
            let re = Regex::new(p.pattern)
                .unwrap_or_else(|e| panic!("sink pattern for {} is invalid: {}", p.kind, e));
            (*p, re)
        })
        .collect()
});

/// One detected sink occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkFinding {
    pub site_id: String,
    pub page_url: String,
    pub source_type: SourceType,
    pub source_url: String,
    pub kind: SinkKind,
    pub line: u32,
    pub col: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub func: Option<String>,
    pub snippet: String,
    pub detected_at: DateTime<Utc>,
}

impl SinkFinding {
    /// Content-addressed deduplication key.
    pub fn signature(&self) -> String {
        signature(
            &self.site_id,
            &self.page_url,
            &self.source_url,
            self.kind,
            self.line,
            self.col,
            &self.snippet,
        )
    }
}

/// SHA-256 hex digest over the identifying fields of a finding.
pub fn signature(
    site_id: &str,
    page_url: &str,
    source_url: &str,
    kind: SinkKind,
    line: u32,
    col: u32,
    snippet: &str,
) -> String {
    let snippet = truncate_chars(snippet, MAX_SNIPPET_CHARS);
    let mut hasher = Sha256::new();
    for part in [site_id, page_url, source_url, kind.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update(b"\x1f");
    }
    hasher.update(format!("{}:{}", line, col).as_bytes());
    hasher.update(b"\x1f");
    hasher.update(snippet.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Drops findings whose signature was already seen, keeping first occurrence order.
pub fn dedupe(findings: Vec<SinkFinding>) -> Vec<SinkFinding> {
    let mut seen = HashSet::with_capacity(findings.len());
    findings
        .into_iter()
        .filter(|f| seen.insert(f.signature()))
        .collect()
}

/// Classifies a raw script identifier into a (url, source type) pair.
///
/// Total over all inputs: anonymous sources become `<page>#inline`, tagged
/// sources (`sc-…` from the source-tagging hooks) are anchored to the page,
/// and anything unrecognised passes through as a plain script.
pub fn normalize_source(page_url: &str, raw: &str) -> (String, SourceType) {
    if raw.is_empty() || raw == "<anonymous>" {
        return (format!("{}#inline", page_url), SourceType::Inline);
    }
    if raw.starts_with("blob:") {
        return (raw.to_string(), SourceType::Blob);
    }
    if raw.starts_with("data:") {
        return (raw.to_string(), SourceType::Data);
    }
    if raw.starts_with("sc-") && !raw.contains("://") {
        return (format!("{}#{}", page_url, raw), SourceType::Dynamic);
    }
    (raw.to_string(), SourceType::Script)
}

/// Runs the static pass over the page HTML and every script source.
pub fn scan_static(
    html: &str,
    scripts: &[ScriptSource],
    page_url: &str,
    site_id: &str,
    detected_at: DateTime<Utc>,
) -> Vec<SinkFinding> {
    let mut out = Vec::new();

    for (pattern, re) in COMPILED.iter() {
        if pattern.scope.covers_html() {
            scan_text(
                html,
                re,
                pattern.kind,
                (page_url, SourceType::Html),
                (site_id, page_url),
                detected_at,
                &mut out,
            );
        }
    }

    for script in scripts {
        if script.text.is_empty() {
            continue;
        }
        let (source_url, source_type) = normalize_source(page_url, &script.id);
        for (pattern, re) in COMPILED.iter() {
            if pattern.scope.covers_script() {
                scan_text(
                    &script.text,
                    re,
                    pattern.kind,
                    (&source_url, source_type),
                    (site_id, page_url),
                    detected_at,
                    &mut out,
                );
            }
        }
    }

    out
}

fn scan_text(
    text: &str,
    re: &Regex,
    kind: SinkKind,
    (source_url, source_type): (&str, SourceType),
    (site_id, page_url): (&str, &str),
    detected_at: DateTime<Utc>,
    out: &mut Vec<SinkFinding>,
) {
    for m in re.find_iter(text) {
        let (line, col) = line_col(text, m.start());
        out.push(SinkFinding {
            site_id: site_id.to_string(),
            page_url: page_url.to_string(),
            source_type,
            source_url: source_url.to_string(),
            kind,
            line,
            col,
            func: None,
            snippet: snippet_around(text, m.start()),
            detected_at,
        });
    }
}

/// 1-based line and column of the byte offset `idx`.
pub fn line_col(text: &str, idx: usize) -> (u32, u32) {
    let before = &text[..idx];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|nl| nl + 1).unwrap_or(0);
    let col = before[line_start..].chars().count() + 1;
    (line as u32, col as u32)
}

/// Up to `SNIPPET_RADIUS` characters either side of `idx`.
pub fn snippet_around(text: &str, idx: usize) -> String {
    let start = text[..idx]
        .char_indices()
        .rev()
        .nth(SNIPPET_RADIUS - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let end = text[idx..]
        .char_indices()
        .nth(SNIPPET_RADIUS)
        .map(|(i, _)| idx + i)
        .unwrap_or(text.len());
    text[start..end].to_string()
}

pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn inline(text: &str) -> ScriptSource {
        ScriptSource {
            id: String::new(),
            text: text.to_string(),
        }
    }

    fn kinds(findings: &[SinkFinding]) -> Vec<SinkKind> {
        findings.iter().map(|f| f.kind).collect()
    }

    #[test]
    fn test_catalogue_compiles() {
        assert_eq!(COMPILED.len(), CATALOGUE.len());
    }

    #[test]
    fn test_inline_eval_yields_single_finding() {
        let html = r#"<html><body><script>eval("1+1")</script></body></html>"#;
        let scripts = vec![inline(r#"eval("1+1")"#)];
        let findings = scan_static(html, &scripts, "https://example.com/", "example.com", now());

        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.kind, SinkKind::Eval);
        assert_eq!(f.source_type, SourceType::Inline);
        assert_eq!(f.source_url, "https://example.com/#inline");
        assert!(f.snippet.contains("eval("));
        assert_eq!((f.line, f.col), (1, 1));
    }

    #[test]
    fn test_string_timers_only() {
        let js = "setTimeout(\"go()\", 10);\nsetTimeout(fn, 10);\nsetInterval('tick()', 5);";
        let findings = scan_static("", &[inline(js)], "p", "s", now());
        assert_eq!(kinds(&findings), vec![SinkKind::SetTimeoutStr, SinkKind::SetIntervalStr]);
        assert_eq!(findings[1].line, 3);
    }

    #[test]
    fn test_html_scope_patterns() {
        let html = "<div>\n  <button onclick=\"go()\">x</button>\n</div>";
        let findings = scan_static(html, &[], "https://a.com/", "a.com", now());
        assert_eq!(kinds(&findings), vec![SinkKind::InlineEventHandler]);
        assert_eq!(findings[0].source_type, SourceType::Html);
        assert_eq!((findings[0].line, findings[0].col), (2, 11));
    }

    #[test]
    fn test_script_scope_not_applied_to_html() {
        let html = "<p>eval(x) and localStorage</p>";
        assert!(scan_static(html, &[], "p", "s", now()).is_empty());
    }

    #[test]
    fn test_sync_xhr_and_constructor() {
        let js = "var x = new XMLHttpRequest();\nx.open('GET', '/a', false);";
        let k = kinds(&scan_static("", &[inline(js)], "p", "s", now()));
        assert!(k.contains(&SinkKind::XmlHttpRequest));
        assert!(k.contains(&SinkKind::SyncXhr));
    }

    #[test]
    fn test_heavy_loop_threshold() {
        let big = "for (var i = 0; i < 1000000; i++) {}";
        let small = "for (var i = 0; i < 100000; i++) {}";
        let forever = "while (true) { }";
        assert_eq!(kinds(&scan_static("", &[inline(big)], "p", "s", now())), vec![SinkKind::HeavyLoop]);
        assert!(scan_static("", &[inline(small)], "p", "s", now()).is_empty());
        assert_eq!(kinds(&scan_static("", &[inline(forever)], "p", "s", now())), vec![SinkKind::HeavyLoop]);
    }

    #[test]
    fn test_postmessage_and_dom_queries() {
        let js = "window.addEventListener('message', h);\nparent.postMessage(d, '*');\ndocument.querySelectorAll('a');";
        let k = kinds(&scan_static("", &[inline(js)], "p", "s", now()));
        assert_eq!(
            k,
            vec![SinkKind::PostMessageSend, SinkKind::PostMessageRecv, SinkKind::DirectDom]
        );
    }

    #[test]
    fn test_line_col_counts_chars() {
        let text = "ab\ncdé eval(";
        let idx = text.find("eval").unwrap();
        assert_eq!(line_col(text, idx), (2, 5));
    }

    #[test]
    fn test_snippet_bounds() {
        let text = format!("{}MARK{}", "x".repeat(300), "y".repeat(300));
        let idx = text.find("MARK").unwrap();
        let snippet = snippet_around(&text, idx);
        assert_eq!(snippet.chars().count(), 2 * SNIPPET_RADIUS);
        assert!(snippet.starts_with('x'));
        assert!(snippet.contains("MARK"));

        let short = snippet_around("eval(1)", 0);
        assert_eq!(short, "eval(1)");
    }

    #[test]
    fn test_snippet_respects_multibyte_boundaries() {
        let text = format!("{}eval(){}", "é".repeat(200), "ü".repeat(200));
        let idx = text.find("eval").unwrap();
        let snippet = snippet_around(&text, idx);
        assert_eq!(snippet.chars().count(), 2 * SNIPPET_RADIUS);
    }

    #[test]
    fn test_signature_is_stable_and_discriminating() {
        let html = "<script>eval(a); eval(b);</script>";
        let scripts = vec![inline("eval(a); eval(b);")];
        let first = scan_static(html, &scripts, "https://x.io/", "x.io", now());
        let second = scan_static(html, &scripts, "https://x.io/", "x.io", now());

        let sigs = |fs: &[SinkFinding]| fs.iter().map(|f| f.signature()).collect::<Vec<_>>();
        assert_eq!(sigs(&first), sigs(&second));
        assert_eq!(first.len(), 2);
        assert_ne!(first[0].signature(), first[1].signature());
        assert_eq!(first[0].signature().len(), 64);
    }

    #[test]
    fn test_signature_ignores_snippet_tail_past_limit() {
        let a = format!("{}A", "s".repeat(MAX_SNIPPET_CHARS));
        let b = format!("{}B", "s".repeat(MAX_SNIPPET_CHARS));
        assert_eq!(
            signature("s", "p", "u", SinkKind::Eval, 1, 1, &a),
            signature("s", "p", "u", SinkKind::Eval, 1, 1, &b)
        );
    }

    #[test]
    fn test_dedupe_keeps_first() {
        let scripts = vec![inline("eval(x)"), inline("eval(x)")];
        let findings = scan_static("", &scripts, "p", "s", now());
        assert_eq!(findings.len(), 2);
        assert_eq!(dedupe(findings).len(), 1);
    }

    #[test]
    fn test_normalize_source() {
        let page = "https://a.com/x";
        assert_eq!(normalize_source(page, ""), ("https://a.com/x#inline".into(), SourceType::Inline));
        assert_eq!(
            normalize_source(page, "<anonymous>"),
            ("https://a.com/x#inline".into(), SourceType::Inline)
        );
        assert_eq!(normalize_source(page, "blob:https://a.com/1").1, SourceType::Blob);
        assert_eq!(normalize_source(page, "data:text/javascript,1").1, SourceType::Data);
        assert_eq!(
            normalize_source(page, "sc-eval-3.js"),
            ("https://a.com/x#sc-eval-3.js".into(), SourceType::Dynamic)
        );
        assert_eq!(
            normalize_source(page, "sc-https://cdn.com/a.js"),
            ("sc-https://cdn.com/a.js".into(), SourceType::Script)
        );
        assert_eq!(
            normalize_source(page, "https://cdn.com/a.js"),
            ("https://cdn.com/a.js".into(), SourceType::Script)
        );
    }

    #[test]
    fn test_kind_round_trip_names() {
        for kind in SinkKind::ALL {
            assert_eq!(SinkKind::parse(kind.as_str()), Some(kind));
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
