use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{DynNodeRepository, NodeRecord, NodeRepository};

#[derive(Debug, Default, Serialize, Deserialize)]
struct AliasBackupPayload {
    aliases: HashMap<String, String>,
}

/// Decorator that shadows node aliases to a local JSON file so operator
/// names survive restarts of bases that lose them (and database resets).
pub struct AliasBackupStore {
    base: DynNodeRepository,
    path: PathBuf,
    aliases: RwLock<HashMap<String, String>>,
}

impl AliasBackupStore {
    pub fn new(base: DynNodeRepository, path: PathBuf) -> Self {
        Self {
            base,
            path,
            aliases: RwLock::new(HashMap::new()),
        }
    }

    fn alias_for(&self, id: &str) -> Option<String> {
        let guard = self.aliases.read().unwrap_or_else(|e| e.into_inner());
        guard
            .get(id)
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
    }

    fn with_alias(&self, mut node: NodeRecord) -> NodeRecord {
        if node.alias.trim().is_empty() {
            if let Some(alias) = self.alias_for(&node.id) {
                node.alias = alias;
            }
        }
        node
    }

    async fn load_aliases(&self) -> anyhow::Result<()> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(());
            }
            Err(err) => return Err(err).context("read alias backup file"),
        };
        if bytes.is_empty() {
            return Ok(());
        }

        let loaded = match serde_json::from_slice::<AliasBackupPayload>(&bytes) {
            Ok(payload) => payload.aliases,
            // Legacy format: a plain id -> alias map.
            Err(_) => serde_json::from_slice::<HashMap<String, String>>(&bytes)
                .context("parse alias backup file")?,
        };

        let mut guard = self.aliases.write().unwrap_or_else(|e| e.into_inner());
        *guard = loaded;
        Ok(())
    }

    async fn save_aliases(&self) -> anyhow::Result<()> {
        let payload = {
            let guard = self.aliases.read().unwrap_or_else(|e| e.into_inner());
            AliasBackupPayload {
                aliases: guard
                    .iter()
                    .filter(|(_, alias)| !alias.trim().is_empty())
                    .map(|(id, alias)| (id.clone(), alias.clone()))
                    .collect(),
            }
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("create alias backup directory")?;
            set_mode(parent, 0o700).await;
        }

        if let Ok(prev) = tokio::fs::read(&self.path).await {
            let bak = self.path.with_extension("json.bak");
            let _ = tokio::fs::write(&bak, prev).await;
            set_mode(&bak, 0o600).await;
        }

        let bytes = serde_json::to_vec_pretty(&payload).context("serialize alias backup")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .context("write alias backup tmp file")?;
        set_mode(&tmp, 0o600).await;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("replace alias backup file")?;
        Ok(())
    }

    /// Re-apply recorded aliases to base rows that lost theirs.
    async fn restore_aliases(&self) -> anyhow::Result<()> {
        let nodes = self.base.list().await?;
        for node in nodes {
            if !node.alias.trim().is_empty() {
                continue;
            }
            if let Some(alias) = self.alias_for(&node.id) {
                let _ = self.base.rename(&node.id, &alias).await;
            }
        }
        Ok(())
    }
}

// The alias file is operator state; keep it out of reach of other users
// the same way the agent treats its identity file.
#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await;
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) {}

#[async_trait]
impl NodeRepository for AliasBackupStore {
    async fn init(&self) -> anyhow::Result<()> {
        self.base.init().await?;
        self.load_aliases().await?;
        self.restore_aliases().await
    }

    async fn upsert(&self, node: NodeRecord) -> anyhow::Result<()> {
        let unnamed = node.alias.trim().is_empty();
        let id = node.id.clone();
        self.base.upsert(node).await?;
        if unnamed {
            if let Some(alias) = self.alias_for(&id) {
                let _ = self.base.rename(&id, &alias).await;
            }
        }
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<NodeRecord>> {
        let nodes = self.base.list().await?;
        Ok(nodes.into_iter().map(|n| self.with_alias(n)).collect())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<NodeRecord>> {
        let node = self.base.get(id).await?;
        Ok(node.map(|n| self.with_alias(n)))
    }

    async fn rename(&self, id: &str, name: &str) -> anyhow::Result<()> {
        let trimmed = name.trim();
        self.base.rename(id, trimmed).await?;
        {
            let mut guard = self.aliases.write().unwrap_or_else(|e| e.into_inner());
            if trimmed.is_empty() {
                guard.remove(id);
            } else {
                guard.insert(id.to_string(), trimmed.to_string());
            }
        }
        self.save_aliases().await
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        // Keep the alias entry: a reaped node that reconnects gets its
        // name back.
        self.base.delete(id).await
    }

    async fn close(&self) {
        self.base.close().await;
    }
}
