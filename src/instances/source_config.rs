//! Ingestion source definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheEngine, CacheSource, parse_body};
use crate::store::{Document, Filter};
use crate::{MimirError, Result};

/// One configured ingestion source (a feed, crawler target, API poller...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Falls back to the document id when absent from the body.
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Source kind, e.g. "rss", "web", "api".
    pub kind: String,
    /// Required. Only documents with `status == "active"` are loaded.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Cron-style schedule; `None` for push-driven sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, serde_json::Value>,
}

impl SourceConfig {
    pub fn is_scheduled(&self) -> bool {
        self.schedule.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

/// Cache instance for active source configs, keyed by id.
#[derive(Debug, Clone)]
pub struct SourceConfigs {
    collection: String,
}

impl SourceConfigs {
    pub const NAME: &'static str = "source_configs";

    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
        }
    }
}

impl Default for SourceConfigs {
    fn default() -> Self {
        Self::new(Self::NAME)
    }
}

impl CacheSource for SourceConfigs {
    type Key = String;
    type Value = SourceConfig;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    fn store_filter(&self) -> Filter {
        Filter::all().eq("status", "active")
    }

    fn parse(&self, document: &Document) -> Result<SourceConfig> {
        let mut config: SourceConfig = parse_body(document)?;
        if config.id.is_empty() {
            config.id = document.id.clone();
        }
        if config.name.trim().is_empty() {
            return Err(MimirError::parse(&document.id, "name must not be empty"));
        }
        if config.kind.trim().is_empty() {
            return Err(MimirError::parse(&document.id, "kind must not be empty"));
        }
        Ok(config)
    }

    fn extract_key(&self, value: &SourceConfig) -> String {
        value.id.clone()
    }
}

/// Cache of active ingestion sources.
pub type SourceConfigCache = CacheEngine<SourceConfigs>;

impl CacheEngine<SourceConfigs> {
    /// Active sources of the given kind, ordered by id.
    pub async fn active_of_kind(&self, kind: &str) -> Result<Vec<SourceConfig>> {
        self.select(|c| c.kind == kind).await
    }

    /// Active sources that run on a schedule, ordered by id.
    pub async fn scheduled(&self) -> Result<Vec<SourceConfig>> {
        self.select(SourceConfig::is_scheduled).await
    }

    async fn select(&self, keep: impl Fn(&SourceConfig) -> bool) -> Result<Vec<SourceConfig>> {
        let snapshot = self.snapshot().await?;
        let mut selected: Vec<SourceConfig> = snapshot
            .items()
            .values()
            .filter(|&c| keep(c))
            .cloned()
            .collect();
        selected.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn cache_with(store: &Arc<MemoryStore>) -> SourceConfigCache {
        CacheEngine::new(SourceConfigs::default(), store.clone(), CacheConfig::default())
    }

    #[test]
    fn parse_fills_id_from_document() {
        let doc = Document::new(
            "src-1",
            json!({"name": "News", "kind": "rss", "status": "active"}),
        );
        let config = SourceConfigs::default().parse(&doc).unwrap();
        assert_eq!(config.id, "src-1");
        assert_eq!(config.status, "active");
        assert!(!config.is_scheduled());
    }

    #[test]
    fn parse_requires_status() {
        let doc = Document::new("src-3", json!({"name": "News", "kind": "rss"}));
        let err = SourceConfigs::default().parse(&doc).unwrap_err();
        assert!(err.to_string().contains("status"));
    }

    #[test]
    fn parse_rejects_blank_kind() {
        let doc = Document::new(
            "src-2",
            json!({"name": "News", "kind": " ", "status": "active"}),
        );
        assert!(SourceConfigs::default().parse(&doc).is_err());
    }

    #[tokio::test]
    async fn only_active_sources_are_loaded() {
        let store = Arc::new(MemoryStore::new());
        store.insert(
            "source_configs",
            "a",
            json!({"name": "A", "kind": "rss", "status": "active"}),
        );
        store.insert(
            "source_configs",
            "b",
            json!({"name": "B", "kind": "rss", "status": "paused"}),
        );
        let cache = cache_with(&store);

        let all = cache.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("a"));
    }

    #[tokio::test]
    async fn domain_queries_filter_in_memory() {
        let store = Arc::new(MemoryStore::new());
        store.insert(
            "source_configs",
            "b",
            json!({"name": "B", "kind": "web", "status": "active", "schedule": "0 * * * *"}),
        );
        store.insert(
            "source_configs",
            "a",
            json!({"name": "A", "kind": "web", "status": "active"}),
        );
        store.insert(
            "source_configs",
            "c",
            json!({"name": "C", "kind": "rss", "status": "active", "schedule": "*/5 * * * *"}),
        );
        let cache = cache_with(&store);

        let web: Vec<String> = cache
            .active_of_kind("web")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(web, vec!["a", "b"]);

        let scheduled: Vec<String> = cache
            .scheduled()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(scheduled, vec!["b", "c"]);
        assert_eq!(store.find_calls(), 1);
    }
}
