//! Invalidation signals.

use std::fmt;

use serde::Serialize;

use crate::store::OperationKind;

/// Why a snapshot was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    ChangeFeedInsert,
    ChangeFeedUpdate,
    ChangeFeedReplace,
    ChangeFeedDelete,
    /// The snapshot outlived the configured TTL.
    TtlExpired,
    /// The watcher re-established a dropped subscription; records may have
    /// been missed in between.
    Reconnected,
    Manual,
}

impl InvalidationReason {
    /// Label value used for the `reason` metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationReason::ChangeFeedInsert => "change_feed_insert",
            InvalidationReason::ChangeFeedUpdate => "change_feed_update",
            InvalidationReason::ChangeFeedReplace => "change_feed_replace",
            InvalidationReason::ChangeFeedDelete => "change_feed_delete",
            InvalidationReason::TtlExpired => "ttl_expired",
            InvalidationReason::Reconnected => "reconnected",
            InvalidationReason::Manual => "manual",
        }
    }
}

impl From<OperationKind> for InvalidationReason {
    fn from(op: OperationKind) -> Self {
        match op {
            OperationKind::Insert => InvalidationReason::ChangeFeedInsert,
            OperationKind::Update => InvalidationReason::ChangeFeedUpdate,
            OperationKind::Replace => InvalidationReason::ChangeFeedReplace,
            OperationKind::Delete => InvalidationReason::ChangeFeedDelete,
        }
    }
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an invalidation is about: one document, or the whole collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    /// Store-side document key.
    Key(String),
    All,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Key(key) => f.write_str(key),
            Subject::All => f.write_str("all"),
        }
    }
}

/// Signal that the current snapshot must be discarded.
///
/// Ephemeral: produced by the watcher or by TTL expiry detection, consumed
/// by the engine, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationSignal {
    pub reason: InvalidationReason,
    pub subject: Subject,
}

impl InvalidationSignal {
    pub fn new(reason: InvalidationReason, subject: Subject) -> Self {
        Self { reason, subject }
    }

    /// Operator-requested invalidation of the whole collection.
    pub fn manual() -> Self {
        Self::new(InvalidationReason::Manual, Subject::All)
    }

    /// Invalidation caused by a change-feed record for `key`.
    pub fn from_change(operation: OperationKind, key: impl Into<String>) -> Self {
        Self::new(operation.into(), Subject::Key(key.into()))
    }
}

/// Anything that can receive invalidation signals.
///
/// The watcher only ever sees its cache through this trait.
pub trait Invalidate: Send + Sync {
    fn invalidate(&self, signal: InvalidationSignal);
}
