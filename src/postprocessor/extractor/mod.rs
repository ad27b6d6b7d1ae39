//! Content-type-specific reference extraction.

pub mod html;
pub mod link_header;
pub mod url_regex;

pub use html::{extract_html, ExtractedRefs};
pub use link_header::extract_link_header;
pub use url_regex::extract_with_regex;
