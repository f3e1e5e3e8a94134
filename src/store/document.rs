//! Raw documents, query filters and change records exchanged with the store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A raw document as returned by the backing store.
///
/// `id` is the store-side document key; `body` is the full document. Parsing
/// into a typed configuration record is the job of a
/// [`CacheSource`](crate::cache::CacheSource).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }
}

/// Equality filter over top-level document fields.
///
/// An empty filter matches every document. Clauses are ANDed.
///
/// ```rust
/// # use mimir::store::Filter;
/// # use serde_json::json;
/// let filter = Filter::all().eq("status", "active");
/// assert!(filter.matches(&json!({"status": "active", "kind": "rss"})));
/// assert!(!filter.matches(&json!({"status": "paused"})));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    /// A filter matching every document.
    pub fn all() -> Self {
        Self::default()
    }

    /// Require `field == value`.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    /// The `(field, value)` clauses, in insertion order.
    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Whether `body` satisfies every clause.
    pub fn matches(&self, body: &Value) -> bool {
        self.clauses
            .iter()
            .all(|(field, expected)| body.get(field) == Some(expected))
    }
}

/// Kind of mutation reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Replace,
    Delete,
}

impl OperationKind {
    /// Every operation the watcher subscribes to.
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Insert,
        OperationKind::Update,
        OperationKind::Replace,
        OperationKind::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Replace => "replace",
            OperationKind::Delete => "delete",
        }
    }
}

/// Opaque, store-defined position in a change feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single change-feed notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub operation: OperationKind,
    /// Store-side key of the mutated document.
    pub document_key: String,
    /// Post-image of the document, when the store supplies one.
    pub full_document: Option<Value>,
    /// Position to resume from to receive the records after this one.
    pub resume_token: ResumeToken,
}

/// Shallow-merge `patch` into `target` (top-level fields only).
///
/// Non-object values replace the target wholesale.
pub(crate) fn merge_fields(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(fields)) => {
            for (field, value) in fields {
                existing.insert(field, value);
            }
        }
        (target, patch) => *target = patch,
    }
}
