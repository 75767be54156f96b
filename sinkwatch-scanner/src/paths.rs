//! Lexical discovery of path-like string literals in HTML and JavaScript.
//!
//! Matching is a plain regex scan over raw text: no HTML or JS parsing. It
//! surfaces false positives (fragments of comments, regex literals) rather
//! than miss paths hidden in unusual places.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

/// A quoted token (`"`, `'` or backtick) starting with `/`, `./` or `../`.
static QUOTED_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r##"["'`]((?:/|\.\./|\./)[a-zA-Z0-9_?&=./\-#]*)["'`]"##)
        .expect("quoted path pattern is valid")
});

/// Exclusive length bounds for an extracted path.
const MIN_LEN: usize = 1;
const MAX_LEN: usize = 200;

/// Returns true when `s` looks like a relative or absolute-path reference.
pub fn is_relative_like(s: &str) -> bool {
    if s.len() <= MIN_LEN || s.len() >= MAX_LEN {
        return false;
    }
    if !(s.starts_with('/') || s.starts_with("./") || s.starts_with("../")) {
        return false;
    }
    s.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

/// Extracts the distinct, alphabetically ordered path references in `text`.
pub fn extract_paths(text: &str) -> Vec<String> {
    unique_sorted(
        QUOTED_PATH_RE
            .captures_iter(text)
            .filter_map(|cap| cap.get(1))
            .map(|m| m.as_str())
            .filter(|p| is_relative_like(p))
            .map(str::to_string),
    )
}

/// Deduplicates and sorts, dropping empty strings.
pub fn unique_sorted<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items
        .into_iter()
        .map(Into::into)
        .filter(|s: &String| !s.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
