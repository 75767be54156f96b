//! Runtime sink instrumentation.
//!
//! Before navigation the renderer injects a script built from [`HOOKS`]. Each
//! hook wraps one browser API, records the call site from a stack trace, and
//! then calls through to the wrapped API. Records accumulate in a
//! per-session global that the renderer reads back after the page settles.

use crate::sinks::{SinkFinding, SinkKind, SourceType, normalize_source, truncate_chars, MAX_SNIPPET_CHARS};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

/// What a wrapped call records as its snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// The first argument.
    First,
    /// All arguments joined with commas.
    Joined,
    /// The first argument, only when it is a string. Other calls are not recorded.
    StringFirst,
    /// The request URL of a `fetch` call.
    RequestUrl,
    /// The URL argument of `XMLHttpRequest.open`.
    OpenUrl,
    /// The URL of an `open` call whose async flag is `false`.
    SyncOpen,
    /// The handler source of an `on*` attribute.
    EventAttribute,
}

impl Capture {
    fn js(self) -> &'static str {
        match self {
            Capture::First => "function (a) { return a[0]; }",
            Capture::Joined => "function (a) { return Array.prototype.join.call(a, \",\"); }",
            Capture::StringFirst => "function (a) { return typeof a[0] === \"string\" ? a[0] : SKIP; }",
            Capture::RequestUrl => {
                "function (a) { var i = a[0]; return typeof i === \"string\" ? i : (i && i.url) || \"\"; }"
            }
            Capture::OpenUrl => "function (a) { return a[1]; }",
            Capture::SyncOpen => "function (a) { return a.length > 2 && a[2] === false ? a[1] : SKIP; }",
            Capture::EventAttribute => {
                "function (a) { return /^on[a-z]+$/i.test(String(a[0])) ? a[1] : SKIP; }"
            }
        }
    }
}

/// Appends a `//# sourceURL=<label>-<n>.js` marker to dynamically compiled code
/// so later stack frames name it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceTag {
    pub label: &'static str,
    /// Tag the last argument (function body) instead of the first.
    pub last: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Replace a callable with a recording wrapper.
    Call {
        capture: Capture,
        tag: Option<SourceTag>,
    },
    /// Replace an accessor's setter, recording the assigned value.
    Setter,
    /// Wrap `message` listeners passed to an `addEventListener`-style method.
    MessageListener,
    /// Wrap handlers assigned to an `onmessage`-style property.
    MessageProperty,
    /// Wrap a `Storage.prototype` method, recording calls made on the store
    /// whose `window` property is named after the hook's kind.
    Storage,
}

#[derive(Debug, Clone, Copy)]
pub struct Hook {
    pub kind: SinkKind,
    /// JavaScript expression for the object owning `name`.
    pub owner: &'static str,
    pub name: &'static str,
    pub strategy: Strategy,
}

const fn call(kind: SinkKind, owner: &'static str, name: &'static str, capture: Capture) -> Hook {
    Hook {
        kind,
        owner,
        name,
        strategy: Strategy::Call { capture, tag: None },
    }
}

const fn tagged(
    kind: SinkKind,
    name: &'static str,
    capture: Capture,
    label: &'static str,
    last: bool,
) -> Hook {
    Hook {
        kind,
        owner: "window",
        name,
        strategy: Strategy::Call {
            capture,
            tag: Some(SourceTag { label, last }),
        },
    }
}

const fn storage(kind: SinkKind, name: &'static str) -> Hook {
    Hook {
        kind,
        owner: "Storage.prototype",
        name,
        strategy: Strategy::Storage,
    }
}

/// Kinds only the static pass reports. `JSON.stringify` is left unwrapped
/// because collecting the log calls it; the others have no browser API to
/// wrap. `postMessageListen` is recorded by the message hooks.
pub const STATIC_ONLY_KINDS: &[SinkKind] = &[
    SinkKind::JsonStringify,
    SinkKind::DangerouslySetInnerHtml,
    SinkKind::HeavyLoop,
];

pub const HOOKS: &[Hook] = &[
    tagged(SinkKind::Eval, "eval", Capture::First, "sc-eval", false),
    tagged(SinkKind::NewFunction, "Function", Capture::Joined, "sc-fn", true),
    tagged(SinkKind::SetTimeoutStr, "setTimeout", Capture::StringFirst, "sc-timeout", false),
    tagged(SinkKind::SetIntervalStr, "setInterval", Capture::StringFirst, "sc-interval", false),
    call(SinkKind::DocumentWrite, "document", "write", Capture::Joined),
    call(SinkKind::DocumentWrite, "document", "writeln", Capture::Joined),
    Hook {
        kind: SinkKind::InnerHtml,
        owner: "Element.prototype",
        name: "innerHTML",
        strategy: Strategy::Setter,
    },
    call(SinkKind::Fetch, "window", "fetch", Capture::RequestUrl),
    call(SinkKind::XmlHttpRequest, "XMLHttpRequest.prototype", "open", Capture::OpenUrl),
    call(SinkKind::SyncXhr, "XMLHttpRequest.prototype", "open", Capture::SyncOpen),
    call(SinkKind::InlineEventHandler, "Element.prototype", "setAttribute", Capture::EventAttribute),
    call(SinkKind::DirectDom, "Document.prototype", "getElementById", Capture::First),
    call(SinkKind::DirectDom, "Document.prototype", "getElementsByClassName", Capture::First),
    call(SinkKind::DirectDom, "Document.prototype", "querySelector", Capture::First),
    call(SinkKind::DirectDom, "Document.prototype", "querySelectorAll", Capture::First),
    call(SinkKind::Alert, "window", "alert", Capture::First),
    call(SinkKind::Confirm, "window", "confirm", Capture::First),
    call(SinkKind::Prompt, "window", "prompt", Capture::First),
    call(SinkKind::JsonParse, "JSON", "parse", Capture::First),
    storage(SinkKind::LocalStorage, "setItem"),
    storage(SinkKind::LocalStorage, "getItem"),
    storage(SinkKind::SessionStorage, "setItem"),
    storage(SinkKind::SessionStorage, "getItem"),
    call(SinkKind::PostMessageSend, "window", "postMessage", Capture::First),
    Hook {
        kind: SinkKind::PostMessageRecv,
        owner: "window",
        name: "addEventListener",
        strategy: Strategy::MessageListener,
    },
    Hook {
        kind: SinkKind::PostMessageRecv,
        owner: "window",
        name: "onmessage",
        strategy: Strategy::MessageProperty,
    },
];

/// Shared helpers. `__LOG__`, `__GUARD__` and `__TAG__` are substituted per session.
const PRELUDE: &str = r#"
  var w = window;
  if (w["__GUARD__"]) return;
  try { Object.defineProperty(w, "__GUARD__", { value: true }); } catch (_) { w["__GUARD__"] = true; }
  var sink = w["__LOG__"] = [];
  var SKIP = {};
  var seq = 0;
  function snip(x) {
    try { var s = String(x == null ? "" : x); return s.length > 200 ? s.slice(0, 200) : s; }
    catch (_) { return ""; }
  }
  function callsite() {
    try {
      var frames = (new Error().stack || "").split("\n").slice(1);
      for (var i = 0; i < frames.length; i++) {
        var m = frames[i].match(/at\s+(?:(.*?)\s+\()?(.*?):(\d+):(\d+)\)?/);
        if (!m) continue;
        var file = (m[2] || "").trim();
        if (file.indexOf("__TAG__") !== -1 || file.indexOf("extensions::") === 0) continue;
        return { func: (m[1] || "").trim(), file: file, line: +m[3], col: +m[4] };
      }
    } catch (_) {}
    return { func: "", file: "", line: 0, col: 0 };
  }
  function record(kind, value, site) {
    var cs = site || callsite();
    try {
      sink.push({ kind: kind, file: cs.file, line: cs.line, col: cs.col, func: cs.func, snippet: snip(value), when: Date.now() });
    } catch (_) {}
  }
  function tag(code, label) {
    if (typeof code !== "string") return code;
    seq++;
    return code + "\n//# sourceURL=" + label + "-" + seq + ".js";
  }
  function wrapCall(owner, name, kind, pick, label, last) {
    var orig = owner[name];
    if (typeof orig !== "function") return;
    var wrapped = function () {
      try { var v = pick(arguments); if (v !== SKIP) record(kind, v); } catch (_) {}
      if (label) {
        var args = Array.prototype.slice.call(arguments);
        var at = last ? args.length - 1 : 0;
        if (at >= 0) args[at] = tag(args[at], label);
        return orig.apply(this, args);
      }
      return orig.apply(this, arguments);
    };
    try { wrapped.prototype = orig.prototype; } catch (_) {}
    owner[name] = wrapped;
  }
  function wrapSetter(proto, name, kind) {
    var d = Object.getOwnPropertyDescriptor(proto, name);
    if (!d || !d.set) return;
    Object.defineProperty(proto, name, {
      configurable: true,
      enumerable: d.enumerable,
      get: d.get,
      set: function (v) { record(kind, v); return d.set.call(this, v); }
    });
  }
  function deliver(kind, handler, site) {
    return function (ev) {
      record(kind, ev && ev.origin, { func: handler.name || site.func, file: site.file, line: site.line, col: site.col });
      return handler.apply(this, arguments);
    };
  }
  function wrapListener(owner, name, kind) {
    var orig = owner[name];
    if (typeof orig !== "function") return;
    owner[name] = function (type, handler) {
      if (String(type).toLowerCase() === "message" && typeof handler === "function") {
        var site = callsite();
        record("postMessageListen", "", site);
        var args = Array.prototype.slice.call(arguments);
        args[1] = deliver(kind, handler, site);
        return orig.apply(this, args);
      }
      return orig.apply(this, arguments);
    };
  }
  function wrapStorage(proto, name, kind) {
    var orig = proto[name];
    if (typeof orig !== "function") return;
    proto[name] = function () {
      try { if (this === w[kind]) record(kind, Array.prototype.join.call(arguments, ",")); } catch (_) {}
      return orig.apply(this, arguments);
    };
  }
  function wrapProperty(owner, name, kind) {
    var d = null, o = owner;
    while (o && !(d = Object.getOwnPropertyDescriptor(o, name))) o = Object.getPrototypeOf(o);
    if (!d || !d.set) return;
    var raw = null;
    Object.defineProperty(owner, name, {
      configurable: true,
      get: function () { return raw; },
      set: function (fn) {
        raw = fn;
        if (typeof fn !== "function") return d.set.call(this, fn);
        var site = callsite();
        record("postMessageListen", "", site);
        return d.set.call(this, deliver(kind, fn, site));
      }
    });
  }
"#;

/// Per-scan instrumentation state.
///
/// The log variable and install guard carry a fresh session id, so repeated
/// scans in one browser never share or suppress each other's hooks.
#[derive(Debug, Clone)]
pub struct Instrumentation {
    session: String,
}

impl Default for Instrumentation {
    fn default() -> Self {
        Self::new()
    }
}

impl Instrumentation {
    pub fn new() -> Self {
        Self {
            session: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn log_var(&self) -> String {
        format!("__sw_log_{}", self.session)
    }

    pub fn guard_var(&self) -> String {
        format!("__sw_installed_{}", self.session)
    }

    fn source_tag(&self) -> String {
        format!("sw-hooks-{}", self.session)
    }

    /// The script to evaluate on every new document before page scripts run.
    pub fn script(&self) -> String {
        let mut js = String::from("(function () {\ntry {\n");
        js.push_str(
            &PRELUDE
                .replace("__LOG__", &self.log_var())
                .replace("__GUARD__", &self.guard_var())
                .replace("__TAG__", &self.source_tag()),
        );
        for hook in HOOKS {
            js.push_str("  try { ");
            js.push_str(&hook_call(hook));
            js.push_str(" } catch (_) {}\n");
        }
        js.push_str("} catch (_) {}\n})();\n//# sourceURL=");
        js.push_str(&self.source_tag());
        js.push('\n');
        js
    }

    /// Expression returning the collected log as a JSON string.
    pub fn collect_expression(&self) -> String {
        format!("JSON.stringify(window[\"{}\"] || [])", self.log_var())
    }
}

fn hook_call(hook: &Hook) -> String {
    let kind = hook.kind.as_str();
    match hook.strategy {
        Strategy::Call { capture, tag } => {
            let (label, last) = match tag {
                Some(t) => (format!("\"{}\"", t.label), t.last),
                None => ("null".to_string(), false),
            };
            format!(
                "wrapCall({}, \"{}\", \"{}\", {}, {}, {});",
                hook.owner,
                hook.name,
                kind,
                capture.js(),
                label,
                last
            )
        }
        Strategy::Setter => format!("wrapSetter({}, \"{}\", \"{}\");", hook.owner, hook.name, kind),
        Strategy::MessageListener => {
            format!("wrapListener({}, \"{}\", \"{}\");", hook.owner, hook.name, kind)
        }
        Strategy::MessageProperty => {
            format!("wrapProperty({}, \"{}\", \"{}\");", hook.owner, hook.name, kind)
        }
        Strategy::Storage => format!("wrapStorage({}, \"{}\", \"{}\");", hook.owner, hook.name, kind),
    }
}

#[derive(Debug, Deserialize)]
struct RuntimeEntry {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    file: String,
    #[serde(default)]
    line: u32,
    #[serde(default)]
    col: u32,
    #[serde(default)]
    func: String,
    #[serde(default)]
    snippet: String,
}

/// Converts a collected runtime log into findings.
///
/// Accepts either the JSON string produced by [`Instrumentation::collect_expression`]
/// or an already-decoded array. Entries that fail to decode or name an
/// unknown kind are skipped.
pub fn parse_runtime_log(
    value: &serde_json::Value,
    page_url: &str,
    site_id: &str,
    detected_at: DateTime<Utc>,
) -> Vec<SinkFinding> {
    let decoded;
    let entries = match value {
        serde_json::Value::String(s) => match serde_json::from_str::<serde_json::Value>(s) {
            Ok(serde_json::Value::Array(items)) => {
                decoded = items;
                &decoded
            }
            _ => {
                debug!("Runtime log for {} is not a JSON array", page_url);
                return Vec::new();
            }
        },
        serde_json::Value::Array(items) => items,
        _ => return Vec::new(),
    };

    entries
        .iter()
        .filter_map(|raw| {
            let entry: RuntimeEntry = serde_json::from_value(raw.clone()).ok()?;
            let Some(kind) = SinkKind::parse(&entry.kind) else {
                debug!("Skipping unknown runtime sink kind {:?}", entry.kind);
                return None;
            };
            let (source_url, _) = normalize_source(page_url, &entry.file);
            Some(SinkFinding {
                site_id: site_id.to_string(),
                page_url: page_url.to_string(),
                source_type: SourceType::Runtime,
                source_url,
                kind,
                line: entry.line,
                col: entry.col,
                func: Some(entry.func).filter(|f| !f.is_empty()),
                snippet: truncate_chars(&entry.snippet, MAX_SNIPPET_CHARS).to_string(),
                detected_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_sessions_are_isolated() {
        let a = Instrumentation::new();
        let b = Instrumentation::new();
        assert_ne!(a.log_var(), b.log_var());
        assert_ne!(a.guard_var(), b.guard_var());
        assert!(!a.script().contains(&b.log_var()));
    }

    #[test]
    fn test_script_installs_every_hook_once() {
        let inst = Instrumentation::new();
        let js = inst.script();
        assert!(js.contains(&inst.guard_var()));
        assert!(js.contains(&inst.log_var()));
        assert!(!js.contains("__LOG__"));
        assert!(!js.contains("__GUARD__"));
        for hook in HOOKS {
            assert!(js.contains(&format!("\"{}\"", hook.name)), "missing hook {}", hook.name);
        }
        let guarded = js.lines().filter(|l| l.starts_with("  try { wrap")).count();
        assert_eq!(guarded, HOOKS.len());
    }

    #[test]
    fn test_every_kind_is_hooked_or_static_only() {
        for kind in SinkKind::ALL {
            let hooked = HOOKS.iter().any(|h| h.kind == kind) || kind == SinkKind::PostMessageListen;
            let static_only = STATIC_ONLY_KINDS.contains(&kind);
            assert!(hooked != static_only, "{} must be hooked or listed as static-only", kind);
        }
    }

    #[test]
    fn test_storage_hooks_check_the_store() {
        let js = Instrumentation::new().script();
        assert!(js.contains("wrapStorage(Storage.prototype, \"setItem\", \"localStorage\");"));
        assert!(js.contains("wrapStorage(Storage.prototype, \"getItem\", \"sessionStorage\");"));
        assert!(js.contains("this === w[kind]"));
        assert!(js.contains("wrapCall(JSON, \"parse\", \"JSON.parse\""));
    }

    #[test]
    fn test_script_tags_dynamic_code() {
        let js = Instrumentation::new().script();
        assert!(js.contains("\"sc-eval\""));
        assert!(js.contains("\"sc-fn\", true"));
        assert!(js.contains("sourceURL="));
    }

    #[test]
    fn test_collect_expression_reads_session_log() {
        let inst = Instrumentation::new();
        assert_eq!(
            inst.collect_expression(),
            format!("JSON.stringify(window[\"{}\"] || [])", inst.log_var())
        );
    }

    #[test]
    fn test_parse_runtime_log_entries() {
        let log = json!([
            {"kind": "eval", "file": "https://cdn.a.com/app.js", "line": 12, "col": 4, "func": "boot", "snippet": "1+1", "when": 1},
            {"kind": "innerHTML", "file": "", "line": 0, "col": 0, "func": "", "snippet": "<b>"},
            {"kind": "postMessageListen", "file": "sc-eval-2.js", "line": 1, "col": 1, "func": "", "snippet": ""},
            {"kind": "mystery", "file": "x", "line": 1, "col": 1}
        ]);
        let findings = parse_runtime_log(&log, "https://a.com/", "a.com", now());
        assert_eq!(findings.len(), 3);

        assert_eq!(findings[0].kind, SinkKind::Eval);
        assert_eq!(findings[0].source_type, SourceType::Runtime);
        assert_eq!(findings[0].source_url, "https://cdn.a.com/app.js");
        assert_eq!(findings[0].func.as_deref(), Some("boot"));
        assert_eq!((findings[0].line, findings[0].col), (12, 4));

        assert_eq!(findings[1].source_url, "https://a.com/#inline");
        assert_eq!(findings[1].func, None);

        assert_eq!(findings[2].kind, SinkKind::PostMessageListen);
        assert_eq!(findings[2].source_url, "https://a.com/#sc-eval-2.js");
    }

    #[test]
    fn test_parse_runtime_log_from_json_string() {
        let raw = json!("[{\"kind\":\"fetch\",\"file\":\"https://a.com/x.js\",\"line\":3,\"col\":9,\"snippet\":\"/api/me\"}]");
        let findings = parse_runtime_log(&raw, "https://a.com/", "a.com", now());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, SinkKind::Fetch);
        assert_eq!(findings[0].snippet, "/api/me");
    }

    #[test]
    fn test_parse_runtime_log_tolerates_garbage() {
        assert!(parse_runtime_log(&json!(null), "p", "s", now()).is_empty());
        assert!(parse_runtime_log(&json!("not json"), "p", "s", now()).is_empty());
        assert!(parse_runtime_log(&json!([1, "x", {"line": "bad"}]), "p", "s", now()).is_empty());
    }
}
