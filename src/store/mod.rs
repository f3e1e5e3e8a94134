//! Backing store interfaces.
//!
//! The cache never writes. It needs two read-only capabilities from the
//! document store:
//!
//! - [`DocumentStore`]: `find(filter)`, used by full reloads.
//! - [`ChangeFeed`]: a resumable stream of per-document mutations, used by
//!   the [`Watcher`](crate::watcher::Watcher) to invalidate eagerly.
//!
//! Both are shared by reference between every cache instance and watcher,
//! so implementations must tolerate concurrent callers.
//!
//! [`MemoryStore`] implements both and is what the tests run against.

pub mod document;
pub mod memory;

pub use document::{ChangeRecord, Document, Filter, OperationKind, ResumeToken};
pub use memory::MemoryStore;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::Result;

/// Stream of change records. An `Err` item or end of stream means the
/// subscription is gone and must be re-established.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<ChangeRecord>> + Send>>;

/// Query side of the backing store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Return every document in `collection` matching `filter`.
    ///
    /// Fails with [`MimirError::StoreUnavailable`](crate::MimirError::StoreUnavailable)
    /// when the store cannot be reached.
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>>;
}

/// Change-notification side of the backing store.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a subscription to `operations` on `collection`.
    ///
    /// With `resume_from`, the stream starts with the first record after
    /// that position; otherwise it starts at "now".
    async fn subscribe(
        &self,
        collection: &str,
        operations: &[OperationKind],
        resume_from: Option<ResumeToken>,
    ) -> Result<ChangeStream>;
}
