//! Operator-facing rollout operations. The controller in
//! `crate::controller` advances what these create.

use chrono::Utc;
use quay_common::api::{AppSummary, DeployRequest, TaskView, UpdateAppRequest};
use serde_json::json;
use uuid::Uuid;

use crate::error::{ApiResult, AppError};
use crate::persistence::{
    apps, instances, tasks, AppStatus, Db, NewRevision, NewTask, RevisionStatus, TaskRecord,
    TaskStatus, TaskType,
};

/// Create an app with its first revision. The revision starts `rolling`
/// and the rollout controller canaries it like any other update.
pub async fn deploy(pool: &Db, req: DeployRequest) -> ApiResult<AppSummary> {
    let image = req.image.trim().to_string();
    if image.is_empty() {
        return Err(AppError::invalid_argument("image is required"));
    }

    let app_id = format!("app-{}", Uuid::new_v4());
    let app = apps::create_app(pool, &app_id, AppStatus::RollingUpdate).await?;
    apps::create_revision(
        pool,
        NewRevision {
            id: format!("rev-{}", Uuid::new_v4()),
            app_id: app_id.clone(),
            image: image.clone(),
            status: RevisionStatus::Rolling,
            created_at: Utc::now(),
        },
    )
    .await?;

    Ok(AppSummary {
        id: app.id,
        status: app.status.as_str().to_string(),
        active_revision_id: app.active_revision_id,
        image,
        revision_status: RevisionStatus::Rolling.as_str().to_string(),
        created_at: app.created_at,
        updated_at: app.updated_at,
    })
}

/// Roll the app to a new image by appending a `rolling` revision.
pub async fn update_app(pool: &Db, app_id: &str, req: UpdateAppRequest) -> ApiResult<AppSummary> {
    let image = req.image.trim().to_string();
    if image.is_empty() {
        return Err(AppError::invalid_argument("image is required"));
    }

    let app = apps::get_app(pool, app_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("app {app_id} not found")))?;
    if app.status == AppStatus::Terminated {
        return Err(AppError::conflict("app is terminated"));
    }
    if app.status == AppStatus::RollingUpdate {
        return Err(AppError::conflict("a rollout is already in progress"));
    }

    apps::create_revision(
        pool,
        NewRevision {
            id: format!("rev-{}", Uuid::new_v4()),
            app_id: app_id.to_string(),
            image: image.clone(),
            status: RevisionStatus::Rolling,
            created_at: Utc::now(),
        },
    )
    .await?;
    apps::update_app_status(pool, app_id, AppStatus::RollingUpdate).await?;

    let app = apps::get_app(pool, app_id)
        .await?
        .ok_or_else(|| AppError::internal("app vanished during update"))?;
    Ok(AppSummary {
        id: app.id,
        status: app.status.as_str().to_string(),
        active_revision_id: app.active_revision_id,
        image,
        revision_status: RevisionStatus::Rolling.as_str().to_string(),
        created_at: app.created_at,
        updated_at: app.updated_at,
    })
}

/// Terminate an app and queue stop tasks for every known instance.
pub async fn delete_app(pool: &Db, app_id: &str) -> ApiResult<()> {
    let app = apps::get_app(pool, app_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("app {app_id} not found")))?;

    let now = Utc::now();
    for instance in instances::list_instances_for_app(pool, &app.id).await? {
        tasks::create_task(
            pool,
            NewTask {
                id: format!("task-{}", Uuid::new_v4()),
                task_type: TaskType::Stop,
                status: TaskStatus::Pending,
                node_id: instance.node_id,
                target_id: instance.container_id,
                payload: String::new(),
                created_at: now,
            },
        )
        .await?;
    }

    apps::update_app_status(pool, &app.id, AppStatus::Terminated).await?;
    Ok(())
}

pub async fn list_apps(pool: &Db) -> ApiResult<Vec<AppSummary>> {
    let records = apps::list_apps(pool).await?;
    let mut summaries = Vec::with_capacity(records.len());
    for app in records {
        let latest = apps::latest_revision(pool, &app.id).await?;
        let (image, revision_status) = latest
            .map(|rev| (rev.image, rev.status.as_str().to_string()))
            .unwrap_or_default();
        summaries.push(AppSummary {
            id: app.id,
            status: app.status.as_str().to_string(),
            active_revision_id: app.active_revision_id,
            image,
            revision_status,
            created_at: app.created_at,
            updated_at: app.updated_at,
        });
    }
    Ok(summaries)
}

/// A point-in-time JSON snapshot of the rollout state.
pub async fn backup_state(pool: &Db) -> ApiResult<serde_json::Value> {
    let apps = apps::list_apps(pool).await?;
    let revisions = apps::list_revisions(pool).await?;
    let tasks = tasks::list_all_tasks(pool).await?;
    Ok(json!({
        "taken_at": Utc::now(),
        "apps": apps,
        "revisions": revisions,
        "tasks": tasks,
    }))
}

pub async fn list_tasks(
    pool: &Db,
    node_id: Option<&str>,
    status: Option<&str>,
) -> ApiResult<Vec<TaskView>> {
    let status = match status {
        Some(raw) => Some(
            TaskStatus::parse(raw)
                .ok_or_else(|| AppError::invalid_argument(format!("unknown status {raw}")))?,
        ),
        None => None,
    };
    let records = tasks::list_tasks(pool, node_id, status).await?;
    Ok(records.into_iter().map(task_view).collect())
}

pub async fn update_task_status(pool: &Db, task_id: &str, status: &str) -> ApiResult<()> {
    let status = TaskStatus::parse(status)
        .ok_or_else(|| AppError::invalid_argument(format!("unknown status {status}")))?;
    let updated = tasks::update_task_status(pool, task_id, status).await?;
    if updated == 0 {
        return Err(AppError::not_found(format!("task {task_id} not found")));
    }
    Ok(())
}

fn task_view(task: TaskRecord) -> TaskView {
    TaskView {
        id: task.id,
        task_type: match task.task_type {
            TaskType::Deploy => "deploy",
            TaskType::Stop => "stop",
            TaskType::FetchLogs => "fetch_logs",
        }
        .to_string(),
        status: match task.status {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
        .to_string(),
        node_id: task.node_id,
        target_id: task.target_id,
        payload: task.payload,
        created_at: task.created_at,
        updated_at: task.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::test_pool;

    fn deploy_req(image: &str) -> DeployRequest {
        DeployRequest {
            image: image.into(),
            replicas: 1,
            ports: Vec::new(),
            env: Default::default(),
            restart_policy: None,
        }
    }

    #[tokio::test]
    async fn deploy_creates_app_and_rolling_revision() {
        let pool = test_pool().await;
        let summary = deploy(&pool, deploy_req("nginx:1.0")).await.expect("deploy");
        assert_eq!(summary.status, "rolling_update");
        assert_eq!(summary.revision_status, "rolling");

        let rev = apps::latest_revision(&pool, &summary.id)
            .await
            .expect("query")
            .expect("revision");
        assert_eq!(rev.image, "nginx:1.0");
        assert_eq!(rev.status, RevisionStatus::Rolling);
    }

    #[tokio::test]
    async fn deploy_rejects_empty_image() {
        let pool = test_pool().await;
        let err = deploy(&pool, deploy_req("  ")).await.expect_err("invalid");
        assert_eq!(err.code, "invalid_argument");
    }

    #[tokio::test]
    async fn update_conflicts_while_a_rollout_is_in_flight() {
        let pool = test_pool().await;
        let summary = deploy(&pool, deploy_req("nginx:1.0")).await.expect("deploy");

        let err = update_app(
            &pool,
            &summary.id,
            UpdateAppRequest {
                image: "nginx:1.1".into(),
            },
        )
        .await
        .expect_err("conflict");
        assert_eq!(err.code, "conflict");

        apps::update_app_status(&pool, &summary.id, AppStatus::Stable)
            .await
            .expect("stabilize");
        let updated = update_app(
            &pool,
            &summary.id,
            UpdateAppRequest {
                image: "nginx:1.1".into(),
            },
        )
        .await
        .expect("update");
        assert_eq!(updated.status, "rolling_update");
        assert_eq!(updated.image, "nginx:1.1");
    }

    #[tokio::test]
    async fn delete_terminates_and_stops_instances() {
        let pool = test_pool().await;
        let summary = deploy(&pool, deploy_req("nginx:1.0")).await.expect("deploy");
        instances::upsert_instance(&pool, "n1", &summary.id, "c1", "running")
            .await
            .expect("instance");

        delete_app(&pool, &summary.id).await.expect("delete");

        let app = apps::get_app(&pool, &summary.id)
            .await
            .expect("get")
            .expect("app");
        assert_eq!(app.status, AppStatus::Terminated);

        let stop_tasks = list_tasks(&pool, Some("n1"), Some("pending"))
            .await
            .expect("tasks");
        assert_eq!(stop_tasks.len(), 1);
        assert_eq!(stop_tasks[0].task_type, "stop");
        assert_eq!(stop_tasks[0].target_id, "c1");
    }

    #[tokio::test]
    async fn backup_state_includes_all_tables() {
        let pool = test_pool().await;
        deploy(&pool, deploy_req("nginx:1.0")).await.expect("deploy");
        let snapshot = backup_state(&pool).await.expect("backup");
        assert_eq!(snapshot["apps"].as_array().expect("apps").len(), 1);
        assert_eq!(snapshot["revisions"].as_array().expect("revs").len(), 1);
        assert!(snapshot["tasks"].as_array().expect("tasks").is_empty());
    }

    #[tokio::test]
    async fn task_status_updates_validate_input() {
        let pool = test_pool().await;
        let err = update_task_status(&pool, "task-1", "bogus")
            .await
            .expect_err("invalid");
        assert_eq!(err.code, "invalid_argument");

        let err = update_task_status(&pool, "task-1", "completed")
            .await
            .expect_err("missing");
        assert_eq!(err.code, "not_found");
    }
}
