//! Caching subsystem.
//!
//! - [`CacheEngine`]: the generic read-through cache. Holds one immutable
//!   [`CacheSnapshot`] per configuration type, reloads it wholesale from the
//!   store on invalidation or TTL expiry, and deduplicates concurrent
//!   reloads. See the [`engine`] module docs for the validity and failure
//!   rules.
//!
//! - [`CacheSource`]: the three per-type extension points (store filter,
//!   parser, key extractor). Concrete sources live in
//!   [`instances`](crate::instances).
//!
//! - [`InvalidationSignal`]: what the [`Watcher`](crate::watcher::Watcher)
//!   sends through the [`Invalidate`] trait when the store changes.

pub mod engine;
pub mod invalidation;
pub mod snapshot;
pub mod source;

pub use engine::{CacheConfig, CacheEngine, CacheHealth, ManagedCache};
pub use invalidation::{Invalidate, InvalidationReason, InvalidationSignal, Subject};
pub use snapshot::CacheSnapshot;
pub use source::{CacheSource, parse_body};
