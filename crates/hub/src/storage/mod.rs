//! Durable store of known nodes.
//!
//! The repository is polymorphic: an in-memory map, a SQLite table, and an
//! alias-backup decorator that shadows operator-assigned names to a local
//! JSON file. Variants compose by wrapping; the hub never crashes on a
//! storage failure and instead falls back to a weaker variant at startup.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::HubConfig;
use crate::persistence::Db;

mod alias_backup;
mod memory;
mod sqlite;

pub use alias_backup::AliasBackupStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Stable identity of a host as seen by the hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct NodeRecord {
    pub id: String,
    pub alias: String,
    pub machine_id: String,
    pub version: String,
    pub remote_addr: String,
    pub last_seen: Option<DateTime<Utc>>,
}

pub type DynNodeRepository = Arc<dyn NodeRepository>;

#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn init(&self) -> anyhow::Result<()>;
    /// Insert or refresh a node row. The alias is operator state and must
    /// survive an upsert that carries an empty alias.
    async fn upsert(&self, node: NodeRecord) -> anyhow::Result<()>;
    async fn list(&self) -> anyhow::Result<Vec<NodeRecord>>;
    async fn get(&self, id: &str) -> anyhow::Result<Option<NodeRecord>>;
    async fn rename(&self, id: &str, name: &str) -> anyhow::Result<()>;
    async fn delete(&self, id: &str) -> anyhow::Result<()>;
    async fn close(&self) {}
}

/// Build the node repository for the given configuration.
///
/// Fallback chain, mirroring the startup policy: SQLite base when a pool
/// is available, else memory; alias backup wrapped around the base; a
/// failing alias backup degrades to alias backup over memory, and failing
/// that, to plain memory. Every downgrade is logged and startup proceeds.
pub async fn open_node_repository(cfg: &HubConfig, pool: Option<Db>) -> DynNodeRepository {
    let base: DynNodeRepository = match pool {
        Some(pool) => Arc::new(SqliteStore::new(pool)),
        None => Arc::new(MemoryStore::new()),
    };

    let alias_path = cfg.alias_backup_path();
    let primary = Arc::new(AliasBackupStore::new(base, alias_path.clone()));
    if let Err(err) = primary.init().await {
        warn!(
            ?err,
            path = %alias_path.display(),
            "node store init failed, falling back to in-memory storage"
        );
        let fallback = Arc::new(AliasBackupStore::new(
            Arc::new(MemoryStore::new()),
            alias_path.clone(),
        ));
        if let Err(err) = fallback.init().await {
            warn!(
                ?err,
                path = %alias_path.display(),
                "alias backup unavailable, running with plain in-memory storage"
            );
            return Arc::new(MemoryStore::new());
        }
        return fallback;
    }
    primary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_node_repository_degrades_to_memory_when_alias_path_is_unusable() {
        let mut cfg = HubConfig::default();
        // A file in place of the state directory makes the alias file
        // unwritable and the backup unreadable.
        let blocker = tempfile::NamedTempFile::new().expect("tmp");
        cfg.aliases_file = Some(format!("{}/aliases.json", blocker.path().display()));

        let repo = open_node_repository(&cfg, None).await;
        repo.upsert(NodeRecord {
            id: "n1".into(),
            ..Default::default()
        })
        .await
        .expect("upsert");
        assert_eq!(repo.list().await.expect("list").len(), 1);
    }
}
