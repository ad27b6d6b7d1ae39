//! HTTP `Link` header extraction (RFC 8288 surface form).
//!
//! A header reads:
//!
//! ```text
//! <url1>; rel="what", <url2>; rel="any"; another="yes", <url3>; rel="thing"
//! ```
//!
//! Entries are separated by `, `, parts within an entry by `;`; the first
//! part is always the URL, the rest are key=value attributes. Malformed
//! entries are skipped silently. Only the URL between `<>` is captured;
//! the attribute scan stops at the first `rel` (rel semantics are not
//! interpreted at this layer, downstream may filter).

/// Extracts the URL of each well-formed entry of a `Link` header value.
#[must_use]
pub fn extract_link_header(header: &str) -> Vec<String> {
    let mut urls = Vec::new();

    for entry in header.split(", ") {
        let mut parts = entry.split(';');
        let Some(first) = parts.next() else {
            continue;
        };

        let url = first
            .trim()
            .trim_matches(|c| c == '<' || c == '>')
            .trim();
        if url.is_empty() {
            continue;
        }

        for attr in parts {
            let Some((key, _value)) = parse_attr(attr) else {
                continue;
            };
            if key == "rel" {
                break;
            }
        }

        urls.push(url.to_string());
    }

    urls
}

/// Parses one `key=value` attribute; the value is quote-stripped.
fn parse_attr(attr: &str) -> Option<(&str, &str)> {
    let (key, value) = attr.split_once('=')?;
    Some((key.trim(), value.trim().trim_matches('"')))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_entry_header() {
        let urls = extract_link_header(r#"<http://a/>; rel="next", <http://b/>; rel="prev""#);
        assert_eq!(urls, vec!["http://a/", "http://b/"]);
    }

    #[test]
    fn test_multiple_attributes_per_entry() {
        let urls = extract_link_header(
            r#"<http://one/>; rel="preconnect"; crossorigin="anonymous", <http://two/>; title="t"; rel="next""#,
        );
        assert_eq!(urls, vec!["http://one/", "http://two/"]);
    }

    #[test]
    fn test_entry_without_attributes() {
        assert_eq!(extract_link_header("<http://bare/>"), vec!["http://bare/"]);
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        // Empty URL part.
        assert!(extract_link_header(r#"<>; rel="next""#).is_empty());
        // Attributes without '=' do not break the entry's URL.
        assert_eq!(
            extract_link_header("<http://a/>; malformed"),
            vec!["http://a/"]
        );
    }

    #[test]
    fn test_empty_header() {
        assert!(extract_link_header("").is_empty());
    }

    #[test]
    fn test_attr_parsing_strips_quotes() {
        assert_eq!(parse_attr(r#" rel="next" "#), Some(("rel", "next")));
        assert_eq!(parse_attr("anchor=#frag"), Some(("anchor", "#frag")));
        assert_eq!(parse_attr("no-equals"), None);
    }
}
