//! Per-configuration-type extension points.

use std::fmt::Debug;
use std::hash::Hash;

use serde::de::DeserializeOwned;

use crate::store::{Document, Filter};
use crate::{MimirError, Result};

/// Supplies the type-specific parts of a cache instance.
///
/// The [`CacheEngine`](super::CacheEngine) is written once; each
/// configuration type plugs in how to find its documents, how to parse them
/// and how to key them.
pub trait CacheSource: Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// Instance name, used as the `instance` metric label and in logs.
    fn name(&self) -> &str;

    /// Collection the documents live in.
    fn collection(&self) -> &str;

    /// Query used by full reloads.
    fn store_filter(&self) -> Filter;

    /// Turn a raw document into a validated value.
    ///
    /// Errors are caught by the engine: the document is skipped and logged.
    fn parse(&self, document: &Document) -> Result<Self::Value>;

    fn extract_key(&self, value: &Self::Value) -> Self::Key;
}

/// Deserialize a document body into `T`, mapping failures to
/// [`MimirError::Parse`] tagged with the document id.
pub fn parse_body<T: DeserializeOwned>(document: &Document) -> Result<T> {
    serde_json::from_value(document.body.clone()).map_err(|e| MimirError::parse(&document.id, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Named {
        name: String,
    }

    #[test]
    fn parse_body_reads_fields() {
        let doc = Document::new("1", json!({"name": "alpha"}));
        let named: Named = parse_body(&doc).unwrap();
        assert_eq!(named.name, "alpha");
    }

    #[test]
    fn parse_body_reports_document_id() {
        let doc = Document::new("broken-7", json!({"name": 12}));
        let err = parse_body::<Named>(&doc).unwrap_err();
        match err {
            MimirError::Parse { id, .. } => assert_eq!(id, "broken-7"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
