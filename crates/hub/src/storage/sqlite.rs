use async_trait::async_trait;

use super::{NodeRecord, NodeRepository};
use crate::persistence::Db;

/// SQLite-backed node store over the shared pool. The `nodes` table is
/// created by the embedded migrations before this store is constructed.
pub struct SqliteStore {
    pool: Db,
}

impl SqliteStore {
    pub fn new(pool: Db) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NodeRepository for SqliteStore {
    async fn init(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1 FROM nodes LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert(&self, node: NodeRecord) -> anyhow::Result<()> {
        // The alias column is deliberately left out of the conflict
        // update: rename is the only writer of operator names.
        sqlx::query(
            r#"
            INSERT INTO nodes (id, alias, machine_id, version, remote_addr, last_seen)
            VALUES (?1, '', ?2, ?3, ?4, ?5)
            ON CONFLICT (id) DO UPDATE SET
                machine_id = excluded.machine_id,
                version = excluded.version,
                remote_addr = excluded.remote_addr,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(&node.id)
        .bind(&node.machine_id)
        .bind(&node.version)
        .bind(&node.remote_addr)
        .bind(node.last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<NodeRecord>> {
        let records = sqlx::query_as::<_, NodeRecord>(
            r#"
            SELECT id, alias, machine_id, version, remote_addr, last_seen
            FROM nodes
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<NodeRecord>> {
        let record = sqlx::query_as::<_, NodeRecord>(
            r#"
            SELECT id, alias, machine_id, version, remote_addr, last_seen
            FROM nodes
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn rename(&self, id: &str, name: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE nodes SET alias = ?2 WHERE id = ?1")
            .bind(id)
            .bind(name.trim())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM nodes WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
