//! Logging setup and runtime log-level control.
//!
//! [`init`] installs a global `tracing` subscriber whose filter sits behind a
//! reload layer. The returned [`LogControl`] changes verbosity while the
//! process runs, e.g. to watch reload and invalidation decisions at `debug`
//! on a live service.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

use crate::{MimirError, Result};

/// Log target of this crate, as used in filter directives.
pub const TARGET: &str = "mimir";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_directive` when set. Fails if the directive
/// does not parse or a global subscriber is already installed.
pub fn init(default_directive: &str) -> Result<LogControl> {
    let directive = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| default_directive.to_string());
    let (filter_layer, control) = filter_layer(&directive)?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| MimirError::Configuration(format!("Failed to install logger: {e}")))?;

    Ok(control)
}

/// Build a reloadable filter layer without installing it.
///
/// For embedding services that assemble their own subscriber.
pub fn filter_layer(directive: &str) -> Result<(reload::Layer<EnvFilter, Registry>, LogControl)> {
    let filter = parse(directive)?;
    let (layer, handle) = reload::Layer::new(filter);
    let control = LogControl {
        handle,
        base: Arc::new(Mutex::new(directive.to_string())),
        active: Arc::new(Mutex::new(directive.to_string())),
    };
    Ok((layer, control))
}

fn parse(directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directive)
        .map_err(|e| MimirError::Configuration(format!("Invalid log directive '{directive}': {e}")))
}

/// Handle for changing the active log filter.
#[derive(Clone)]
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    /// Directive everything but this crate falls back to.
    base: Arc<Mutex<String>>,
    active: Arc<Mutex<String>>,
}

impl std::fmt::Debug for LogControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogControl")
            .field("active", &self.current())
            .finish()
    }
}

impl LogControl {
    /// Replace the whole filter, e.g. `"warn,mimir::watcher=trace"`.
    ///
    /// On a parse error the previous filter stays active.
    pub fn set_directive(&self, directive: &str) -> Result<()> {
        self.apply(directive)?;
        *lock(&self.base) = directive.to_string();
        Ok(())
    }

    /// Change only this crate's verbosity; other targets keep the base
    /// directive.
    pub fn set_level(&self, level: Level) -> Result<()> {
        let base = lock(&self.base).clone();
        let level = level.as_str().to_ascii_lowercase();
        let directive = if base.trim().is_empty() {
            format!("{TARGET}={level}")
        } else {
            format!("{base},{TARGET}={level}")
        };
        self.apply(&directive)
    }

    /// The directive currently in effect.
    pub fn current(&self) -> String {
        lock(&self.active).clone()
    }

    fn apply(&self, directive: &str) -> Result<()> {
        let filter = parse(directive)?;
        self.handle
            .reload(filter)
            .map_err(|e| MimirError::Configuration(format!("Failed to reload log filter: {e}")))?;
        *lock(&self.active) = directive.to_string();
        tracing::info!(directive, "log filter changed");
        Ok(())
    }
}

fn lock(slot: &Mutex<String>) -> std::sync::MutexGuard<'_, String> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scoped(directive: &str) -> (tracing::subscriber::DefaultGuard, LogControl) {
        let (layer, control) = filter_layer(directive).unwrap();
        let guard = tracing_subscriber::registry().with(layer).set_default();
        (guard, control)
    }

    #[test]
    fn set_level_raises_only_this_crate() {
        let (_guard, control) = scoped("warn");
        assert!(!tracing::enabled!(target: "mimir::cache", Level::DEBUG));

        control.set_level(Level::DEBUG).unwrap();
        assert_eq!(control.current(), "warn,mimir=debug");
        assert!(tracing::enabled!(target: "mimir::cache", Level::DEBUG));
        assert!(!tracing::enabled!(target: "hyper::client", Level::DEBUG));
    }

    #[test]
    fn set_level_replaces_previous_level() {
        let (_guard, control) = scoped("info");
        control.set_level(Level::TRACE).unwrap();
        control.set_level(Level::ERROR).unwrap();
        assert_eq!(control.current(), "info,mimir=error");
    }

    #[test]
    fn invalid_directive_keeps_previous_filter() {
        let (_guard, control) = scoped("info");
        let err = control.set_directive("mimir=loud").unwrap_err();
        assert!(matches!(err, MimirError::Configuration(_)));
        assert_eq!(control.current(), "info");
    }

    #[test]
    fn set_directive_becomes_new_base() {
        let (_guard, control) = scoped("info");
        control.set_directive("error").unwrap();
        control.set_level(Level::DEBUG).unwrap();
        assert_eq!(control.current(), "error,mimir=debug");
    }

    #[test]
    fn invalid_initial_directive_is_rejected() {
        assert!(filter_layer("mimir=notalevel").is_err());
    }
}
