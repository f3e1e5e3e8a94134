//! Versioned prompt templates.
//!
//! Several versions of a prompt share a `name`; each document is one
//! version, cached under its own id. Placeholders use `{{variable}}`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheEngine, CacheSource, parse_body};
use crate::store::{Document, Filter};
use crate::{MimirError, Result};

/// One version of a prompt template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Falls back to the document id when absent from the body.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub template: String,
    /// Variables the template expects, if declared.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<String>,
}

fn default_version() -> u32 {
    1
}

impl PromptTemplate {
    /// Substitute every `{{variable}}` from `vars`.
    ///
    /// Whitespace inside the braces is ignored. A placeholder with no value
    /// is an error; an unterminated `{{` is copied through literally.
    pub fn render(&self, vars: &HashMap<String, String>) -> Result<String> {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            out.push_str(&rest[..start]);
            let variable = rest[start + 2..start + 2 + len].trim();
            let value = vars.get(variable).ok_or_else(|| MimirError::Render {
                name: self.name.clone(),
                message: format!("missing variable '{variable}'"),
            })?;
            out.push_str(value);
            rest = &rest[start + 2 + len + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Cache instance for prompt templates, keyed by id.
#[derive(Debug, Clone)]
pub struct Prompts {
    collection: String,
}

impl Prompts {
    pub const NAME: &'static str = "prompts";

    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
        }
    }
}

impl Default for Prompts {
    fn default() -> Self {
        Self::new(Self::NAME)
    }
}

impl CacheSource for Prompts {
    type Key = String;
    type Value = PromptTemplate;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    fn store_filter(&self) -> Filter {
        Filter::all()
    }

    fn parse(&self, document: &Document) -> Result<PromptTemplate> {
        let mut prompt: PromptTemplate = parse_body(document)?;
        if prompt.id.is_empty() {
            prompt.id = document.id.clone();
        }
        if prompt.name.trim().is_empty() {
            return Err(MimirError::parse(&document.id, "name must not be empty"));
        }
        if let Some(missing) = prompt
            .variables
            .iter()
            .find(|v| !prompt.template.contains(v.as_str()))
        {
            return Err(MimirError::parse(
                &document.id,
                format!("declared variable '{missing}' not used in template"),
            ));
        }
        Ok(prompt)
    }

    fn extract_key(&self, value: &PromptTemplate) -> String {
        value.id.clone()
    }
}

/// Cache of prompt templates.
pub type PromptCache = CacheEngine<Prompts>;

impl CacheEngine<Prompts> {
    /// Highest version of the named prompt.
    pub async fn latest(&self, name: &str) -> Result<Option<PromptTemplate>> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot
            .items()
            .values()
            .filter(|p| p.name == name)
            .max_by(|a, b| a.version.cmp(&b.version).then_with(|| a.id.cmp(&b.id)))
            .cloned())
    }

    /// Render the latest version of the named prompt.
    ///
    /// `Ok(None)` if no prompt has that name.
    pub async fn render(&self, name: &str, vars: &HashMap<String, String>) -> Result<Option<String>> {
        match self.latest(name).await? {
            Some(prompt) => prompt.render(vars).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn template(text: &str) -> PromptTemplate {
        PromptTemplate {
            id: "p".to_string(),
            name: "greeting".to_string(),
            version: 1,
            template: text.to_string(),
            variables: Vec::new(),
        }
    }

    #[test]
    fn render_substitutes_variables() {
        let rendered = template("Hello {{ name }}, welcome to {{place}}.")
            .render(&vars(&[("name", "Ada"), ("place", "the lab")]))
            .unwrap();
        assert_eq!(rendered, "Hello Ada, welcome to the lab.");
    }

    #[test]
    fn render_reports_missing_variable() {
        let err = template("Hi {{name}}").render(&HashMap::new()).unwrap_err();
        assert!(matches!(err, MimirError::Render { .. }));
    }

    #[test]
    fn render_keeps_unterminated_braces() {
        let rendered = template("a {{b").render(&HashMap::new()).unwrap();
        assert_eq!(rendered, "a {{b");
    }

    #[test]
    fn parse_rejects_unused_declared_variable() {
        let doc = Document::new(
            "p1",
            json!({"name": "x", "template": "plain", "variables": ["topic"]}),
        );
        assert!(Prompts::default().parse(&doc).is_err());
    }

    #[tokio::test]
    async fn latest_picks_highest_version() {
        let store = Arc::new(MemoryStore::new());
        store.insert(
            "prompts",
            "sum-v1",
            json!({"name": "summary", "version": 1, "template": "Summarize: {{text}}"}),
        );
        store.insert(
            "prompts",
            "sum-v2",
            json!({"name": "summary", "version": 2, "template": "Briefly summarize: {{text}}"}),
        );
        let cache: PromptCache =
            CacheEngine::new(Prompts::default(), store.clone(), CacheConfig::default());

        let latest = cache.latest("summary").await.unwrap().unwrap();
        assert_eq!(latest.id, "sum-v2");

        let rendered = cache
            .render("summary", &vars(&[("text", "the report")]))
            .await
            .unwrap();
        assert_eq!(rendered.as_deref(), Some("Briefly summarize: the report"));
        assert!(cache.render("unknown", &HashMap::new()).await.unwrap().is_none());
    }
}
