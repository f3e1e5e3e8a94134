//! Concrete cache instances.
//!
//! Each configuration type plugs a [`CacheSource`](crate::cache::CacheSource)
//! into the shared [`CacheEngine`] and layers its domain queries on top as
//! inherent methods, filtering the snapshot in memory.
//!
//! | Instance | Store filter | Key |
//! |---|---|---|
//! | [`SourceConfigs`] | `status = active` | `id` |
//! | [`AgentConfigs`] | `status = active` | `id` |
//! | [`Prompts`] | all documents | `id` (one per version) |
//!
//! [`ConfigCaches`] wires all three into one [`CacheService`].

pub mod agent_config;
pub mod prompt;
pub mod source_config;

pub use agent_config::{AgentConfig, AgentConfigCache, AgentConfigs};
pub use prompt::{PromptCache, PromptTemplate, Prompts};
pub use source_config::{SourceConfig, SourceConfigCache, SourceConfigs};

use std::sync::Arc;

use crate::Result;
use crate::cache::CacheEngine;
use crate::health::HealthReport;
use crate::lifecycle::{CacheService, ShutdownReport};
use crate::settings::Settings;
use crate::store::{ChangeFeed, DocumentStore};

/// The standard configuration caches of a service.
pub struct ConfigCaches {
    pub sources: Arc<SourceConfigCache>,
    pub agents: Arc<AgentConfigCache>,
    pub prompts: Arc<PromptCache>,
    service: CacheService,
}

impl ConfigCaches {
    /// Build the three caches and register them with one service.
    ///
    /// Nothing is loaded until [`start`](Self::start).
    pub fn new(
        store: Arc<dyn DocumentStore>,
        feed: Arc<dyn ChangeFeed>,
        settings: &Settings,
    ) -> Self {
        let config = settings.cache_config();
        let collections = &settings.collections;

        let sources = Arc::new(CacheEngine::new(
            SourceConfigs::new(&collections.source_configs),
            Arc::clone(&store),
            config.clone(),
        ));
        let agents = Arc::new(CacheEngine::new(
            AgentConfigs::new(&collections.agent_configs),
            Arc::clone(&store),
            config.clone(),
        ));
        let prompts = Arc::new(CacheEngine::new(
            Prompts::new(&collections.prompts),
            store,
            config,
        ));

        let mut service = CacheService::new(feed, settings.backoff_config())
            .shutdown_timeout(settings.shutdown_timeout());
        service.register(Arc::clone(&sources));
        service.register(Arc::clone(&agents));
        service.register(Arc::clone(&prompts));

        Self {
            sources,
            agents,
            prompts,
            service,
        }
    }

    /// Warm all caches, then start their watchers. See
    /// [`CacheService::start`].
    pub async fn start(&self) -> Result<()> {
        self.service.start().await
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        self.service.shutdown().await
    }

    pub fn health(&self) -> HealthReport {
        self.service.health()
    }

    pub fn service(&self) -> &CacheService {
        &self.service
    }
}
