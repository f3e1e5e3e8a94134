//! Mimir error types

use std::time::Duration;

/// Mimir error types
#[derive(Debug, thiserror::Error)]
pub enum MimirError {
    // Backing store errors
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("change feed disconnected: {0}")]
    ChangeFeedDisconnected(String),

    // Data errors
    /// A single document could not be turned into a cached value.
    ///
    /// Never escapes a reload: the engine skips the document and logs it.
    #[error("failed to parse document '{id}': {message}")]
    Parse { id: String, message: String },

    /// A prompt template could not be rendered with the given variables.
    #[error("failed to render prompt '{name}': {message}")]
    Render { name: String, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Lifecycle errors
    /// The first load of a cache failed, so the service must not start.
    #[error("cache '{name}' failed to warm: {source}")]
    Startup {
        name: String,
        #[source]
        source: Box<MimirError>,
    },

    #[error("watcher '{name}' did not stop within {timeout:?}")]
    ShutdownTimeout { name: String, timeout: Duration },

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl MimirError {
    /// Build a [`MimirError::Parse`] for the given document id.
    pub fn parse(id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        MimirError::Parse {
            id: id.into(),
            message: message.to_string(),
        }
    }

    /// Whether the failure is an infrastructure hiccup worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MimirError::StoreUnavailable(_) | MimirError::ChangeFeedDisconnected(_)
        )
    }
}

/// Result type alias for Mimir operations
pub type Result<T> = std::result::Result<T, MimirError>;
