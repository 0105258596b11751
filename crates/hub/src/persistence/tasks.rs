use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum TaskType {
    Deploy,
    Stop,
    FetchLogs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// Tasks are append-only; rows mutate only through status transitions.
#[derive(Debug, Clone, FromRow, serde::Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub node_id: String,
    pub target_id: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub node_id: String,
    pub target_id: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

pub async fn create_task(pool: &Db, task: NewTask) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tasks (id, task_type, status, node_id, target_id, payload, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
        "#,
    )
    .bind(&task.id)
    .bind(task.task_type)
    .bind(task.status)
    .bind(&task.node_id)
    .bind(&task.target_id)
    .bind(&task.payload)
    .bind(task.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_task(pool: &Db, id: &str) -> anyhow::Result<Option<TaskRecord>> {
    let record = sqlx::query_as::<_, TaskRecord>(
        r#"
        SELECT id, task_type, status, node_id, target_id, payload, created_at, updated_at
        FROM tasks
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// The most recent deploy task for an app; the canary verifier keys off
/// this row.
pub async fn latest_deploy_task_for_app(
    pool: &Db,
    app_id: &str,
) -> anyhow::Result<Option<TaskRecord>> {
    let record = sqlx::query_as::<_, TaskRecord>(
        r#"
        SELECT id, task_type, status, node_id, target_id, payload, created_at, updated_at
        FROM tasks
        WHERE target_id = ?1 AND task_type = ?2
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(app_id)
    .bind(TaskType::Deploy)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_tasks(
    pool: &Db,
    node_id: Option<&str>,
    status: Option<TaskStatus>,
) -> anyhow::Result<Vec<TaskRecord>> {
    let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
        r#"
        SELECT id, task_type, status, node_id, target_id, payload, created_at, updated_at
        FROM tasks
        WHERE 1 = 1
        "#,
    );
    if let Some(node_id) = node_id {
        qb.push(" AND node_id = ");
        qb.push_bind(node_id);
    }
    if let Some(status) = status {
        qb.push(" AND status = ");
        qb.push_bind(status);
    }
    qb.push(" ORDER BY created_at ASC, id ASC");

    let records = qb.build_query_as::<TaskRecord>().fetch_all(pool).await?;
    Ok(records)
}

pub async fn list_all_tasks(pool: &Db) -> anyhow::Result<Vec<TaskRecord>> {
    list_tasks(pool, None, None).await
}

pub async fn update_task_status(pool: &Db, id: &str, status: TaskStatus) -> anyhow::Result<u64> {
    let result = sqlx::query("UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(id)
        .bind(status)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
