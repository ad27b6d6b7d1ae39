//! Regex reference extraction over raw body text.
//!
//! Two complementary patterns: a strict form that matches absolute
//! `http(s)` URLs bounded by non-URL characters, and a lax form that
//! catches unquoted `src=`/`href=` attribute values the DOM pass may have
//! missed (broken markup, templated fragments). Results are deduplicated
//! preserving discovery order and joined with the DOM-extracted assets by
//! the caller.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Absolute URLs bounded by whitespace, quotes, or markup delimiters.
#[allow(clippy::expect_used)]
static STRICT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s<>"'\\)\]]+"#).expect("static pattern is valid")
});

/// Unquoted attribute references, possibly relative.
#[allow(clippy::expect_used)]
static LAX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:href|src)\s*=\s*([^\s"'<>`]+)"#).expect("static pattern is valid")
});

/// Extracts URL candidates from `body`, resolving relative lax matches
/// against `base`. The result is deduplicated, in discovery order.
#[must_use]
pub fn extract_with_regex(body: &str, base: &url::Url) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for found in STRICT.find_iter(body) {
        push_unique(found.as_str().to_string(), &mut seen, &mut urls);
    }

    for captures in LAX.captures_iter(body) {
        let Some(reference) = captures.get(1) else {
            continue;
        };
        let reference = reference.as_str();
        if reference.starts_with("javascript:") || reference.starts_with("data:") {
            continue;
        }
        let resolved = if reference.starts_with("http://") || reference.starts_with("https://") {
            reference.to_string()
        } else {
            match base.join(reference) {
                Ok(absolute) if matches!(absolute.scheme(), "http" | "https") => {
                    absolute.to_string()
                }
                _ => continue,
            }
        };
        push_unique(resolved, &mut seen, &mut urls);
    }

    urls
}

fn push_unique(url: String, seen: &mut HashSet<String>, urls: &mut Vec<String>) {
    if seen.insert(url.clone()) {
        urls.push(url);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn base() -> url::Url {
        url::Url::parse("http://ex/dir/").unwrap()
    }

    #[test]
    fn test_strict_matches_absolute_urls_in_text() {
        let urls = extract_with_regex(
            "see http://a.ex/one and (https://b.ex/two) for details",
            &base(),
        );
        assert_eq!(urls, vec!["http://a.ex/one", "https://b.ex/two"]);
    }

    #[test]
    fn test_strict_stops_at_quotes() {
        let urls = extract_with_regex(r#"<a href="http://a.ex/page">x</a>"#, &base());
        assert_eq!(urls, vec!["http://a.ex/page"]);
    }

    #[test]
    fn test_lax_catches_unquoted_relative_references() {
        let urls = extract_with_regex("<img src=pic.gif><a href=/top>t</a>", &base());
        assert_eq!(urls, vec!["http://ex/dir/pic.gif", "http://ex/top"]);
    }

    #[test]
    fn test_quoted_attributes_are_left_to_the_dom_pass() {
        // The quote terminates the lax match before it can start.
        let urls = extract_with_regex(r#"<img src="/b.png">"#, &base());
        assert!(urls.is_empty());
    }

    #[test]
    fn test_results_are_deduplicated_in_order() {
        let urls = extract_with_regex(
            "http://a.ex/x then http://b.ex/y then http://a.ex/x again",
            &base(),
        );
        assert_eq!(urls, vec!["http://a.ex/x", "http://b.ex/y"]);
    }

    #[test]
    fn test_lax_skips_unfetchable_schemes() {
        let urls = extract_with_regex("<a href=javascript:void(0)>j</a>", &base());
        assert!(urls.is_empty());
    }
}
