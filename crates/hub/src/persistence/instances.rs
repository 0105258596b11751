use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::Db;

/// One running container of an app on a node. The id is
/// `<node_id>::<container_id>` so a container that moves hosts gets a
/// fresh row.
#[derive(Debug, Clone, FromRow, serde::Serialize)]
pub struct InstanceRecord {
    pub id: String,
    pub node_id: String,
    pub app_id: String,
    pub container_id: String,
    pub status: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub fn instance_id(node_id: &str, container_id: &str) -> String {
    format!("{node_id}::{container_id}")
}

pub async fn upsert_instance(
    pool: &Db,
    node_id: &str,
    app_id: &str,
    container_id: &str,
    status: &str,
) -> anyhow::Result<()> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO instances (id, node_id, app_id, container_id, status, last_seen, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
        ON CONFLICT (id) DO UPDATE SET
            status = excluded.status,
            last_seen = excluded.last_seen
        "#,
    )
    .bind(instance_id(node_id, container_id))
    .bind(node_id)
    .bind(app_id)
    .bind(container_id)
    .bind(status)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_instances_for_app(pool: &Db, app_id: &str) -> anyhow::Result<Vec<InstanceRecord>> {
    let records = sqlx::query_as::<_, InstanceRecord>(
        r#"
        SELECT id, node_id, app_id, container_id, status, last_seen, created_at
        FROM instances
        WHERE app_id = ?1
        ORDER BY created_at ASC
        "#,
    )
    .bind(app_id)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::test_pool;

    #[tokio::test]
    async fn upsert_preserves_created_at_and_updates_status() {
        let pool = test_pool().await;
        upsert_instance(&pool, "n1", "app-1", "c1", "running")
            .await
            .expect("insert");
        let before = list_instances_for_app(&pool, "app-1").await.expect("list");

        upsert_instance(&pool, "n1", "app-1", "c1", "exited")
            .await
            .expect("update");
        let after = list_instances_for_app(&pool, "app-1").await.expect("list");

        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, instance_id("n1", "c1"));
        assert_eq!(after[0].status, "exited");
        assert_eq!(after[0].created_at, before[0].created_at);
    }
}
