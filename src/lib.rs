//! Mimir - self-healing configuration cache
//!
//! This crate keeps small, frequently read configuration collections
//! (ingestion sources, agent configs, prompt templates) in memory and
//! coherent with a backing document store. Reads are served from an
//! immutable snapshot; a change-feed watcher invalidates the snapshot when
//! the store changes, and the next read reloads it. A TTL bounds staleness
//! if the watcher dies, and a failed reload keeps serving the last good
//! snapshot.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mimir::{ConfigCaches, MemoryStore, Settings};
//!
//! #[tokio::main]
//! async fn main() -> mimir::Result<()> {
//!     let settings = Settings::load(None)?;
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let caches = ConfigCaches::new(store.clone(), store, &settings);
//!     caches.start().await?;
//!
//!     let summarizers = caches.agents.of_type("summarizer").await?;
//!     println!("{} summarizer agents", summarizers.len());
//!
//!     let report = caches.shutdown().await;
//!     assert!(report.is_clean());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;
pub mod health;
pub mod instances;
pub mod lifecycle;
pub mod logging;
pub mod settings;
pub mod store;
pub mod telemetry;
pub mod watcher;

// Re-export main types at crate root
pub use error::{MimirError, Result};

pub use cache::{
    CacheConfig, CacheEngine, CacheHealth, CacheSnapshot, CacheSource, Invalidate,
    InvalidationReason, InvalidationSignal, ManagedCache, Subject,
};
pub use health::{HealthReport, InstanceHealth};
pub use instances::{
    AgentConfig, AgentConfigCache, AgentConfigs, ConfigCaches, PromptCache, PromptTemplate,
    Prompts, SourceConfig, SourceConfigCache, SourceConfigs,
};
pub use lifecycle::{CacheService, ShutdownReport};
pub use logging::LogControl;
pub use settings::Settings;
pub use store::{
    ChangeFeed, ChangeRecord, Document, DocumentStore, Filter, MemoryStore, OperationKind,
    ResumeToken,
};
pub use watcher::{BackoffConfig, Watcher, WatcherState, WatcherStatus};
