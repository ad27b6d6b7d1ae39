//! Core data model: the item tree and the URL records it carries.

mod item;
mod url;

pub use item::{ConsistencyViolation, Item, ItemError, ItemSource, ItemStatus, Node, NodeId};
pub use url::{Body, Response, Url, UrlError, UrlKind, MAX_URL_LENGTH};
