use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum AppStatus {
    Deploying,
    RollingUpdate,
    Stable,
    Terminated,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Deploying => "deploying",
            AppStatus::RollingUpdate => "rolling_update",
            AppStatus::Stable => "stable",
            AppStatus::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum RevisionStatus {
    Rolling,
    Canary,
    Stable,
    Failed,
}

impl RevisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevisionStatus::Rolling => "rolling",
            RevisionStatus::Canary => "canary",
            RevisionStatus::Stable => "stable",
            RevisionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, FromRow, serde::Serialize)]
pub struct AppRecord {
    pub id: String,
    pub active_revision_id: String,
    pub status: AppStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, serde::Serialize)]
pub struct RevisionRecord {
    pub id: String,
    pub app_id: String,
    pub image: String,
    pub status: RevisionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRevision {
    pub id: String,
    pub app_id: String,
    pub image: String,
    pub status: RevisionStatus,
    pub created_at: DateTime<Utc>,
}

pub async fn create_app(pool: &Db, id: &str, status: AppStatus) -> anyhow::Result<AppRecord> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO apps (id, active_revision_id, status, created_at, updated_at)
        VALUES (?1, '', ?2, ?3, ?3)
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(now)
    .execute(pool)
    .await?;

    get_app(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("app insert did not return row"))
}

pub async fn get_app(pool: &Db, id: &str) -> anyhow::Result<Option<AppRecord>> {
    let record = sqlx::query_as::<_, AppRecord>(
        r#"
        SELECT id, active_revision_id, status, created_at, updated_at
        FROM apps
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_apps(pool: &Db) -> anyhow::Result<Vec<AppRecord>> {
    let records = sqlx::query_as::<_, AppRecord>(
        r#"
        SELECT id, active_revision_id, status, created_at, updated_at
        FROM apps
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn list_apps_by_status(pool: &Db, status: AppStatus) -> anyhow::Result<Vec<AppRecord>> {
    let records = sqlx::query_as::<_, AppRecord>(
        r#"
        SELECT id, active_revision_id, status, created_at, updated_at
        FROM apps
        WHERE status = ?1
        ORDER BY created_at ASC
        "#,
    )
    .bind(status)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn update_app_status(pool: &Db, id: &str, status: AppStatus) -> anyhow::Result<()> {
    sqlx::query("UPDATE apps SET status = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(id)
        .bind(status)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_app_active_revision(
    pool: &Db,
    app_id: &str,
    revision_id: &str,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE apps SET active_revision_id = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(app_id)
        .bind(revision_id)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn create_revision(pool: &Db, rev: NewRevision) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO revisions (id, app_id, image, status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&rev.id)
    .bind(&rev.app_id)
    .bind(&rev.image)
    .bind(rev.status)
    .bind(rev.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_revision(pool: &Db, id: &str) -> anyhow::Result<Option<RevisionRecord>> {
    let record = sqlx::query_as::<_, RevisionRecord>(
        r#"
        SELECT id, app_id, image, status, created_at
        FROM revisions
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Latest revision for an app; `created_at` ordering with the id as a
/// tiebreaker for same-instant inserts.
pub async fn latest_revision(pool: &Db, app_id: &str) -> anyhow::Result<Option<RevisionRecord>> {
    let record = sqlx::query_as::<_, RevisionRecord>(
        r#"
        SELECT id, app_id, image, status, created_at
        FROM revisions
        WHERE app_id = ?1
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(app_id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_revisions(pool: &Db) -> anyhow::Result<Vec<RevisionRecord>> {
    let records = sqlx::query_as::<_, RevisionRecord>(
        r#"
        SELECT id, app_id, image, status, created_at
        FROM revisions
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn update_revision_status(
    pool: &Db,
    id: &str,
    status: RevisionStatus,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE revisions SET status = ?2 WHERE id = ?1")
        .bind(id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::test_pool;
    use chrono::Duration;

    #[tokio::test]
    async fn latest_revision_orders_by_created_at() {
        let pool = test_pool().await;
        create_app(&pool, "app-1", AppStatus::RollingUpdate)
            .await
            .expect("app");

        let now = Utc::now();
        create_revision(
            &pool,
            NewRevision {
                id: "rev-1".into(),
                app_id: "app-1".into(),
                image: "nginx:1.0".into(),
                status: RevisionStatus::Stable,
                created_at: now - Duration::hours(1),
            },
        )
        .await
        .expect("rev-1");
        create_revision(
            &pool,
            NewRevision {
                id: "rev-2".into(),
                app_id: "app-1".into(),
                image: "nginx:1.1".into(),
                status: RevisionStatus::Rolling,
                created_at: now,
            },
        )
        .await
        .expect("rev-2");

        let latest = latest_revision(&pool, "app-1")
            .await
            .expect("query")
            .expect("revision");
        assert_eq!(latest.id, "rev-2");
        assert_eq!(latest.status, RevisionStatus::Rolling);
    }

    #[tokio::test]
    async fn app_status_round_trips_snake_case() {
        let pool = test_pool().await;
        create_app(&pool, "app-1", AppStatus::RollingUpdate)
            .await
            .expect("app");

        let apps = list_apps_by_status(&pool, AppStatus::RollingUpdate)
            .await
            .expect("list");
        assert_eq!(apps.len(), 1);

        update_app_status(&pool, "app-1", AppStatus::Stable)
            .await
            .expect("update");
        update_app_active_revision(&pool, "app-1", "rev-9")
            .await
            .expect("update");
        let app = get_app(&pool, "app-1").await.expect("get").expect("app");
        assert_eq!(app.status, AppStatus::Stable);
        assert_eq!(app.active_revision_id, "rev-9");
    }
}
