//! Agent behavior configs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheEngine, CacheSource, parse_body};
use crate::store::{Document, Filter};
use crate::{MimirError, Result};

/// How one agent behaves: which model it calls and with what parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Falls back to the document id when absent from the body.
    #[serde(default)]
    pub id: String,
    /// Agent role, e.g. "summarizer", "classifier".
    pub agent_type: String,
    /// Model identifier the agent calls.
    pub model: String,
    /// Required. Only documents with `status == "active"` are loaded.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Cache instance for active agent configs, keyed by id.
#[derive(Debug, Clone)]
pub struct AgentConfigs {
    collection: String,
}

impl AgentConfigs {
    pub const NAME: &'static str = "agent_configs";

    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
        }
    }
}

impl Default for AgentConfigs {
    fn default() -> Self {
        Self::new(Self::NAME)
    }
}

impl CacheSource for AgentConfigs {
    type Key = String;
    type Value = AgentConfig;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    fn store_filter(&self) -> Filter {
        Filter::all().eq("status", "active")
    }

    fn parse(&self, document: &Document) -> Result<AgentConfig> {
        let mut config: AgentConfig = parse_body(document)?;
        if config.id.is_empty() {
            config.id = document.id.clone();
        }
        if config.model.trim().is_empty() {
            return Err(MimirError::parse(&document.id, "model must not be empty"));
        }
        if let Some(t) = config.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(MimirError::parse(
                &document.id,
                format!("temperature {t} outside 0.0..=2.0"),
            ));
        }
        Ok(config)
    }

    fn extract_key(&self, value: &AgentConfig) -> String {
        value.id.clone()
    }
}

/// Cache of active agent configs.
pub type AgentConfigCache = CacheEngine<AgentConfigs>;

impl CacheEngine<AgentConfigs> {
    /// Agents of the given type, ordered by id.
    pub async fn of_type(&self, agent_type: &str) -> Result<Vec<AgentConfig>> {
        self.select(|c| c.agent_type == agent_type).await
    }

    /// Agents calling the given model, ordered by id.
    pub async fn for_model(&self, model: &str) -> Result<Vec<AgentConfig>> {
        self.select(|c| c.model == model).await
    }

    async fn select(&self, keep: impl Fn(&AgentConfig) -> bool) -> Result<Vec<AgentConfig>> {
        let snapshot = self.snapshot().await?;
        let mut selected: Vec<AgentConfig> = snapshot
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

    #[test]
    fn parse_rejects_out_of_range_temperature() {
        let doc = Document::new(
            "hot",
            json!({"agent_type": "writer", "model": "m", "status": "active", "temperature": 3.5}),
        );
        let err = AgentConfigs::default().parse(&doc).unwrap_err();
        assert!(matches!(err, MimirError::Parse { ref id, .. } if id == "hot"));
    }

    #[test]
    fn parse_requires_status() {
        let doc = Document::new("x", json!({"agent_type": "writer", "model": "m"}));
        let err = AgentConfigs::default().parse(&doc).unwrap_err();
        assert!(err.to_string().contains("status"));
    }

    #[test]
    fn parse_requires_model() {
        let doc = Document::new("x", json!({"agent_type": "writer"}));
        assert!(AgentConfigs::default().parse(&doc).is_err());
    }

    #[tokio::test]
    async fn of_type_and_for_model() {
        let store = Arc::new(MemoryStore::new());
        store.insert(
            "agent_configs",
            "a",
            json!({"agent_type": "summarizer", "model": "small", "status": "active"}),
        );
        store.insert(
            "agent_configs",
            "b",
            json!({"agent_type": "classifier", "model": "small", "status": "active"}),
        );
        store.insert(
            "agent_configs",
            "c",
            json!({"agent_type": "summarizer", "model": "large", "status": "active"}),
        );
        let cache: AgentConfigCache =
            CacheEngine::new(AgentConfigs::default(), store.clone(), CacheConfig::default());

        let summarizers: Vec<String> = cache
            .of_type("summarizer")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(summarizers, vec!["a", "c"]);

        let small: Vec<String> = cache
            .for_model("small")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(small, vec!["a", "b"]);
    }
}
