//! Origin classification: URL normalization, registrable-domain grouping and
//! path categorization.

use crate::error::{Result, ScanError};
use crate::paths::unique_sorted;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use url::Url;

/// An explicit scheme at the very start of the input.
static LEADING_SCHEME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://").expect("scheme pattern is valid")
});

/// A page URL split into the pieces the store keys on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedUrl {
    /// The URL as given (after scheme defaulting).
    pub raw: String,
    /// `scheme://host[:port]/path[?query]`, lowercase host, no fragment.
    pub url_norm: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    /// Registrable domain of `host`.
    pub site_id: String,
}

/// Parses and normalizes a user-supplied page URL.
///
/// A missing scheme defaults to `https://`. Empty input, unparseable input and
/// URLs without a host are rejected.
pub fn normalize_url(raw: &str) -> Result<NormalizedUrl> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ScanError::InvalidUrl("empty URL".to_string()));
    }

    let with_scheme = if LEADING_SCHEME_RE.is_match(trimmed) {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let parsed = Url::parse(&with_scheme)
        .map_err(|e| ScanError::InvalidUrl(format!("{}: {}", trimmed, e)))?;

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ScanError::InvalidUrl(format!("{}: missing host", trimmed)))?
        .to_ascii_lowercase();

    let scheme = parsed.scheme().to_ascii_lowercase();
    let path = match parsed.path() {
        "" => "/".to_string(),
        p => p.to_string(),
    };

    let authority = match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.clone(),
    };
    let mut url_norm = format!("{}://{}{}", scheme, authority, path);
    if let Some(q) = parsed.query()
        && !q.is_empty()
    {
        url_norm.push('?');
        url_norm.push_str(q);
    }

    Ok(NormalizedUrl {
        raw: with_scheme,
        url_norm,
        scheme,
        site_id: registrable_domain(&host),
        host,
        path,
    })
}

/// Public-suffix-aware registrable domain ("eTLD+1").
///
/// IP literals and hosts the suffix list cannot place fall back to the
/// lowercased host.
pub fn registrable_domain(host: &str) -> String {
    let host = host
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if host.is_empty() || host.parse::<IpAddr>().is_ok() {
        return host;
    }
    match psl::domain_str(&host) {
        Some(domain) => domain.to_string(),
        None => host,
    }
}

pub fn same_site(a: &str, b: &str) -> bool {
    registrable_domain(a) == registrable_domain(b)
}

/// Host of an absolute URL, `None` for relative references.
fn absolute_host(item: &str) -> Option<String> {
    let parsed = Url::parse(item).ok()?;
    parsed.host_str().map(|h| h.to_ascii_lowercase())
}

/// Partitions references into same-site items and a map of external site id
/// to the items under it. Relative references are always internal.
pub fn split_internal_external(
    items: &[String],
    page_host: &str,
) -> (Vec<String>, BTreeMap<String, Vec<String>>) {
    let mut internal = Vec::new();
    let mut external: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for item in unique_sorted(items.iter().map(String::as_str)) {
        match absolute_host(&item) {
            Some(host) if !same_site(&host, page_host) => {
                external.entry(registrable_domain(&host)).or_default().push(item);
            }
            _ => internal.push(item),
        }
    }

    (internal, external)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Api,
    Javascript,
    Html,
    Asp,
    Aspx,
    Php,
    Jsp,
    Others,
    Routes,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Api,
        Category::Javascript,
        Category::Html,
        Category::Asp,
        Category::Aspx,
        Category::Php,
        Category::Jsp,
        Category::Others,
        Category::Routes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Api => "api",
            Category::Javascript => "javascript",
            Category::Html => "html",
            Category::Asp => "asp",
            Category::Aspx => "aspx",
            Category::Php => "php",
            Category::Jsp => "jsp",
            Category::Others => "others",
            Category::Routes => "routes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extension of the last path segment, including the dot, lowercased.
fn extension(path: &str) -> Option<String> {
    let last = path.rsplit('/').next().unwrap_or(path);
    last.rfind('.').map(|i| last[i..].to_ascii_lowercase())
}

/// Categorizes an endpoint or resource seen on `host`.
///
/// A file extension wins; without one, an `api.` host or an `/api` path
/// segment means [`Category::Api`], anything else is a route.
pub fn categorize(host: &str, item: &str) -> Category {
    let lowered = item.to_ascii_lowercase();

    let (path, item_host) = match Url::parse(&lowered) {
        Ok(u) if u.has_host() => (u.path().to_string(), u.host_str().map(str::to_string)),
        _ => {
            let end = lowered.find(['?', '#']).unwrap_or(lowered.len());
            (lowered[..end].to_string(), None)
        }
    };

    match extension(&path).as_deref() {
        Some(".js") => return Category::Javascript,
        Some(".html") | Some(".htm") => return Category::Html,
        Some(".asp") => return Category::Asp,
        Some(".aspx") => return Category::Aspx,
        Some(".php") => return Category::Php,
        Some(".jsp") => return Category::Jsp,
        Some(_) => return Category::Others,
        None => {}
    }

    let host = item_host.unwrap_or_else(|| host.to_ascii_lowercase());
    if host.starts_with("api.") || lowered.contains("/api") {
        Category::Api
    } else {
        Category::Routes
    }
}

/// Groups distinct items by category. Every category key is present.
pub fn group_paths(items: &[String], host: &str) -> BTreeMap<Category, Vec<String>> {
    let mut groups: BTreeMap<Category, Vec<String>> =
        Category::ALL.iter().map(|c| (*c, Vec::new())).collect();
    let mut seen = BTreeSet::new();
    for item in items {
        if item.is_empty() || !seen.insert(item.as_str()) {
            continue;
        }
        groups.entry(categorize(host, item)).or_default().push(item.clone());
    }
    groups
}

/// Everything a page references under one external site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalGroup {
    pub site_id: String,
    pub endpoints: Vec<String>,
    pub resources: Vec<String>,
    pub scripts: Vec<String>,
    /// Concrete hosts seen under this site.
    pub hosts: Vec<String>,
}

/// Merges the external partitions of endpoints, resources and scripts into
/// one group per external site.
pub fn build_externals(
    endpoints: &BTreeMap<String, Vec<String>>,
    resources: &BTreeMap<String, Vec<String>>,
    scripts: &BTreeMap<String, Vec<String>>,
) -> BTreeMap<String, ExternalGroup> {
    let mut out: BTreeMap<String, ExternalGroup> = BTreeMap::new();

    for (site, items) in endpoints {
        group_for(&mut out, site).endpoints = unique_sorted(items.iter().map(String::as_str));
    }
    for (site, items) in resources {
        group_for(&mut out, site).resources = unique_sorted(items.iter().map(String::as_str));
    }
    for (site, items) in scripts {
        group_for(&mut out, site).scripts = unique_sorted(items.iter().map(String::as_str));
    }

    for eg in out.values_mut() {
        let hosts: BTreeSet<String> = eg
            .endpoints
            .iter()
            .chain(&eg.resources)
            .chain(&eg.scripts)
            .filter_map(|u| absolute_host(u))
            .collect();
        eg.hosts = hosts.into_iter().collect();
    }

    out
}

fn group_for<'a>(out: &'a mut BTreeMap<String, ExternalGroup>, site: &str) -> &'a mut ExternalGroup {
    out.entry(site.to_string()).or_insert_with(|| ExternalGroup {
        site_id: site.to_string(),
        ..Default::default()
    })
}
