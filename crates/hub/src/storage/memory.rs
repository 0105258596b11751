use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{NodeRecord, NodeRepository};

/// In-memory node store. Loses everything on restart; the alias-backup
/// decorator is what keeps operator names durable in this mode.
#[derive(Default)]
pub struct MemoryStore {
    nodes: RwLock<HashMap<String, NodeRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeRepository for MemoryStore {
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn upsert(&self, mut node: NodeRecord) -> anyhow::Result<()> {
        let mut guard = self.nodes.write().await;
        if node.alias.trim().is_empty() {
            if let Some(existing) = guard.get(&node.id) {
                node.alias = existing.alias.clone();
            }
        }
        guard.insert(node.id.clone(), node);
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<NodeRecord>> {
        let guard = self.nodes.read().await;
        Ok(guard.values().cloned().collect())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<NodeRecord>> {
        let guard = self.nodes.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn rename(&self, id: &str, name: &str) -> anyhow::Result<()> {
        let mut guard = self.nodes.write().await;
        if let Some(node) = guard.get_mut(id) {
            node.alias = name.trim().to_string();
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        let mut guard = self.nodes.write().await;
        guard.remove(id);
        Ok(())
    }
}
