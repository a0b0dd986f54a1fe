// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::types::{SubagentEntry, SubagentLookup};

/// Name to agent-definition lookup, populated before execution
#[derive(Clone)]
pub struct SubagentTypeRegistry {
    agents: Arc<RwLock<HashMap<String, SubagentEntry>>>,
}

impl SubagentTypeRegistry {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register an entry, replacing any existing one with the same name
    pub async fn register(&self, entry: SubagentEntry) {
        let mut agents = self.agents.write().await;
        log::debug!("Registered sub-agent type: {} ({:?})", entry.name, entry.source);
        agents.insert(entry.name.clone(), entry);
    }

    pub async fn get(&self, name: &str) -> Option<SubagentEntry> {
        let agents = self.agents.read().await;
        agents.get(name).cloned()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.agents.read().await.contains_key(name)
    }

    /// All entries, sorted by name
    pub async fn list(&self) -> Vec<SubagentEntry> {
        let agents = self.agents.read().await;
        let mut entries: Vec<_> = agents.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub async fn clear(&self) {
        self.agents.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}

impl Default for SubagentTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubagentLookup for SubagentTypeRegistry {
    async fn get(&self, name: &str) -> Option<SubagentEntry> {
        SubagentTypeRegistry::get(self, name).await
    }

    async fn get_all(&self) -> Vec<SubagentEntry> {
        self.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adk::agent::{AgentDefinition, AgentSource};

    fn entry(name: &str) -> SubagentEntry {
        SubagentEntry::new(
            AgentDefinition::new(name).with_description(format!("Mock agent: {}", name)),
            AgentSource::Project,
        )
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = SubagentTypeRegistry::new();
        registry.register(entry("codebase-analyzer")).await;

        let retrieved = registry.get("codebase-analyzer").await;
        assert!(retrieved.is_some());
        assert_eq!(retrieved.unwrap().definition.name, "codebase-analyzer");
        assert!(registry.has("codebase-analyzer").await);
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let registry = SubagentTypeRegistry::new();
        assert!(registry.get("nonexistent").await.is_none());
        assert!(!registry.has("nonexistent").await);
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let registry = SubagentTypeRegistry::new();
        registry.register(entry("zeta")).await;
        registry.register(entry("alpha")).await;
        registry.register(entry("mid")).await;

        let names: Vec<_> = registry.list().await.into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_register_overwrites_existing() {
        let registry = SubagentTypeRegistry::new();
        registry.register(entry("same")).await;
        registry
            .register(SubagentEntry::new(AgentDefinition::new("same"), AgentSource::User))
            .await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get("same").await.unwrap().source, AgentSource::User);
    }

    #[tokio::test]
    async fn test_clear() {
        let registry = SubagentTypeRegistry::new();
        registry.register(entry("a")).await;
        registry.clear().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_registry_is_clone() {
        let registry = SubagentTypeRegistry::new();
        registry.register(entry("one")).await;

        let cloned = registry.clone();
        assert!(cloned.has("one").await);

        cloned.register(entry("two")).await;
        assert!(registry.has("two").await);
    }

    #[tokio::test]
    async fn test_lookup_trait() {
        let registry = SubagentTypeRegistry::new();
        registry.register(entry("a")).await;
        let lookup: Arc<dyn SubagentLookup> = Arc::new(registry);
        assert!(lookup.get("a").await.is_some());
        assert_eq!(lookup.get_all().await.len(), 1);
    }
}
