//! HTML reference extraction.
//!
//! Harvests outlinks (`<a href>`) and assets (`img`, `script`, `link`,
//! `source`, and friends) from a parsed document, resolving every
//! reference against the document base: the first `<base href>` when
//! present, otherwise the document's own URL.

use std::sync::LazyLock;

use scraper::{Html, Selector};
use tracing::trace;

/// References harvested from one document, already absolute.
#[derive(Debug, Default)]
pub struct ExtractedRefs {
    /// `<a href>` targets: candidate new seeds.
    pub outlinks: Vec<String>,
    /// Embedded resources captured alongside the page.
    pub assets: Vec<String>,
}

#[allow(clippy::expect_used)]
static BASE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("base[href]").expect("static selector is valid"));

#[allow(clippy::expect_used)]
static OUTLINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("static selector is valid"));

/// Asset-bearing elements and the attribute that carries the reference.
#[allow(clippy::expect_used)]
static ASSET_SELECTORS: LazyLock<Vec<(Selector, &'static str)>> = LazyLock::new(|| {
    [
        ("img[src]", "src"),
        ("script[src]", "src"),
        ("link[href]", "href"),
        ("source[src]", "src"),
        ("video[src]", "src"),
        ("audio[src]", "src"),
        ("iframe[src]", "src"),
        ("embed[src]", "src"),
    ]
    .into_iter()
    .map(|(selector, attr)| {
        (
            Selector::parse(selector).expect("static selector is valid"),
            attr,
        )
    })
    .collect()
});

/// Extracts outlinks and assets from `html`, resolved against `url`.
#[must_use]
pub fn extract_html(html: &str, url: &url::Url) -> ExtractedRefs {
    let document = Html::parse_document(html);

    // <base> tag resolution: the first base[href] rebases every reference
    // in the document.
    let base = document
        .select(&BASE_SELECTOR)
        .next()
        .and_then(|element| element.value().attr("href"))
        .and_then(|href| url.join(href.trim()).ok())
        .unwrap_or_else(|| url.clone());

    let mut refs = ExtractedRefs::default();

    for element in document.select(&OUTLINK_SELECTOR) {
        if let Some(href) = element.value().attr("href") {
            if let Some(absolute) = resolve(href, &base) {
                trace!(url = %absolute, "outlink");
                refs.outlinks.push(absolute);
            }
        }
    }

    for (selector, attr) in ASSET_SELECTORS.iter() {
        for element in document.select(selector) {
            if let Some(value) = element.value().attr(attr) {
                if let Some(absolute) = resolve(value, &base) {
                    trace!(url = %absolute, "asset");
                    refs.assets.push(absolute);
                }
            }
        }
    }

    refs
}

/// Resolves a reference against the document base, filtering out anything
/// that cannot be fetched over HTTP.
fn resolve(reference: &str, base: &url::Url) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() || reference.starts_with('#') {
        return None;
    }
    if reference.starts_with("javascript:")
        || reference.starts_with("mailto:")
        || reference.starts_with("tel:")
        || reference.starts_with("data:")
    {
        return None;
    }
    let absolute = base.join(reference).ok()?;
    match absolute.scheme() {
        "http" | "https" => Some(absolute.to_string()),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn base() -> url::Url {
        url::Url::parse("http://ex/").unwrap()
    }

    #[test]
    fn test_outlinks_and_assets_are_split() {
        let refs = extract_html(
            r#"<a href="/a">x</a><img src="/b.png">"#,
            &base(),
        );
        assert_eq!(refs.outlinks, vec!["http://ex/a"]);
        assert_eq!(refs.assets, vec!["http://ex/b.png"]);
    }

    #[test]
    fn test_references_resolve_against_base_tag() {
        let refs = extract_html(
            r#"<head><base href="http://cdn.ex/static/"></head>
               <body><img src="logo.png"><a href="page">p</a></body>"#,
            &base(),
        );
        assert_eq!(refs.assets, vec!["http://cdn.ex/static/logo.png"]);
        assert_eq!(refs.outlinks, vec!["http://cdn.ex/static/page"]);
    }

    #[test]
    fn test_unfetchable_schemes_are_skipped() {
        let refs = extract_html(
            r##"<a href="javascript:void(0)">j</a>
               <a href="mailto:a@ex">m</a>
               <a href="#top">t</a>
               <img src="data:image/png;base64,xyz">
               <a href="/real">r</a>"##,
            &base(),
        );
        assert_eq!(refs.outlinks, vec!["http://ex/real"]);
        assert!(refs.assets.is_empty());
    }

    #[test]
    fn test_asset_elements_are_covered() {
        let refs = extract_html(
            r#"<script src="/app.js"></script>
               <link href="/style.css" rel="stylesheet">
               <source src="/clip.webm">
               <iframe src="/frame"></iframe>"#,
            &base(),
        );
        assert_eq!(
            refs.assets,
            vec![
                "http://ex/app.js",
                "http://ex/style.css",
                "http://ex/clip.webm",
                "http://ex/frame"
            ]
        );
    }

    #[test]
    fn test_absolute_references_pass_through() {
        let refs = extract_html(r#"<a href="https://other.org/p">o</a>"#, &base());
        assert_eq!(refs.outlinks, vec!["https://other.org/p"]);
    }
}
