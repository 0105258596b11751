//! Rollout controller: a periodic loop that advances apps in
//! `rolling_update` through a one-node canary to `stable` or back to the
//! previous revision.
//!
//! The controller talks to agents exclusively by writing tasks; it reads
//! the session registry only to prefer a connected node when scheduling.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use crate::persistence::{
    apps, tasks, AppRecord, AppStatus, Db, NewTask, RevisionRecord, RevisionStatus, TaskStatus,
    TaskType,
};
use crate::registry::SessionRegistry;
use crate::storage::DynNodeRepository;
use crate::telemetry;

pub struct RolloutController {
    db: Db,
    repo: DynNodeRepository,
    registry: SessionRegistry,
    /// A canary task older than this without completing fails the rollout.
    task_timeout: ChronoDuration,
    /// Minimum observation window before a completed canary is promoted.
    hold: ChronoDuration,
}

impl RolloutController {
    pub fn new(
        db: Db,
        repo: DynNodeRepository,
        registry: SessionRegistry,
        task_timeout: Duration,
        hold: Duration,
    ) -> Self {
        Self {
            db,
            repo,
            registry,
            task_timeout: ChronoDuration::from_std(task_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(60)),
            hold: ChronoDuration::from_std(hold).unwrap_or_else(|_| ChronoDuration::seconds(10)),
        }
    }

    pub async fn run(self, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        telemetry::record_rollout_tick("error");
                        warn!(?err, "rollout tick failed");
                    } else {
                        telemetry::record_rollout_tick("ok");
                    }
                }
            }
        }
    }

    /// One pass over every app mid-rollout. Per-app failures are logged
    /// and retried next tick.
    pub async fn tick(&self) -> anyhow::Result<()> {
        let rolling = apps::list_apps_by_status(&self.db, AppStatus::RollingUpdate).await?;
        for app in rolling {
            if let Err(err) = self.advance(&app).await {
                warn!(?err, app_id = %app.id, "failed to advance rollout");
            }
        }
        Ok(())
    }

    async fn advance(&self, app: &AppRecord) -> anyhow::Result<()> {
        let Some(rev) = apps::latest_revision(&self.db, &app.id).await? else {
            warn!(app_id = %app.id, "app is rolling_update but has no revisions");
            return Ok(());
        };

        match rev.status {
            RevisionStatus::Rolling => self.start_canary(app, &rev).await,
            RevisionStatus::Canary => self.verify_canary(app, &rev).await,
            RevisionStatus::Stable => {
                apps::update_app_status(&self.db, &app.id, AppStatus::Stable).await?;
                Ok(())
            }
            RevisionStatus::Failed => self.rollback(app, &rev).await,
        }
    }

    async fn start_canary(&self, app: &AppRecord, rev: &RevisionRecord) -> anyhow::Result<()> {
        let Some(node_id) = self.pick_canary_node().await? else {
            info!(app_id = %app.id, "no nodes available for canary");
            return Ok(());
        };

        let task_id = self
            .create_deploy_task(&app.id, &node_id, &rev.image)
            .await?;
        apps::update_revision_status(&self.db, &rev.id, RevisionStatus::Canary).await?;
        info!(
            app_id = %app.id,
            revision_id = %rev.id,
            %node_id,
            %task_id,
            "canary deploy scheduled"
        );
        Ok(())
    }

    async fn verify_canary(&self, app: &AppRecord, rev: &RevisionRecord) -> anyhow::Result<()> {
        let Some(task) = tasks::latest_deploy_task_for_app(&self.db, &app.id).await? else {
            warn!(app_id = %app.id, "canary revision has no deploy task");
            return Ok(());
        };

        let now = Utc::now();
        if task.status == TaskStatus::Failed {
            info!(app_id = %app.id, revision_id = %rev.id, "canary task failed, rolling back");
            apps::update_revision_status(&self.db, &rev.id, RevisionStatus::Failed).await?;
            return self.rollback(app, rev).await;
        }

        if task.status != TaskStatus::Completed && now - task.created_at > self.task_timeout {
            info!(
                app_id = %app.id,
                revision_id = %rev.id,
                "canary task did not complete in time, rolling back"
            );
            apps::update_revision_status(&self.db, &rev.id, RevisionStatus::Failed).await?;
            return self.rollback(app, rev).await;
        }

        if task.status == TaskStatus::Completed && now - rev.created_at > self.hold {
            apps::update_revision_status(&self.db, &rev.id, RevisionStatus::Stable).await?;
            apps::update_app_status(&self.db, &app.id, AppStatus::Stable).await?;
            apps::update_app_active_revision(&self.db, &app.id, &rev.id).await?;
            info!(app_id = %app.id, revision_id = %rev.id, "canary promoted");
        }

        Ok(())
    }

    /// Restore the previous good revision. `active_revision_id` still
    /// names it, so it is left untouched.
    async fn rollback(&self, app: &AppRecord, failed: &RevisionRecord) -> anyhow::Result<()> {
        if app.active_revision_id.is_empty() || app.active_revision_id == failed.id {
            // No earlier stable point to return to.
            apps::update_app_status(&self.db, &app.id, AppStatus::Stable).await?;
            return Ok(());
        }

        let Some(previous) = apps::get_revision(&self.db, &app.active_revision_id).await? else {
            warn!(
                app_id = %app.id,
                revision_id = %app.active_revision_id,
                "active revision row is missing, marking app stable"
            );
            apps::update_app_status(&self.db, &app.id, AppStatus::Stable).await?;
            return Ok(());
        };

        if let Some(node_id) = self.pick_canary_node().await? {
            let task_id = self
                .create_deploy_task(&app.id, &node_id, &previous.image)
                .await?;
            info!(
                app_id = %app.id,
                revision_id = %previous.id,
                %node_id,
                %task_id,
                "rollback deploy scheduled"
            );
        } else {
            warn!(app_id = %app.id, "no nodes available for rollback deploy");
        }

        apps::update_app_status(&self.db, &app.id, AppStatus::Stable).await?;
        Ok(())
    }

    async fn create_deploy_task(
        &self,
        app_id: &str,
        node_id: &str,
        image: &str,
    ) -> anyhow::Result<String> {
        let task_id = format!("task-{}", Uuid::new_v4());
        tasks::create_task(
            &self.db,
            NewTask {
                id: task_id.clone(),
                task_type: TaskType::Deploy,
                status: TaskStatus::Pending,
                node_id: node_id.to_string(),
                target_id: app_id.to_string(),
                payload: json!({ "image": image }).to_string(),
                created_at: Utc::now(),
            },
        )
        .await?;
        Ok(task_id)
    }

    /// First-available scheduling: the first repository row with a live
    /// session wins, else the first row at all.
    async fn pick_canary_node(&self) -> anyhow::Result<Option<String>> {
        let nodes = self.repo.list().await?;
        let sessions = self.registry.snapshot().await;
        for node in &nodes {
            if sessions.contains_key(&node.id) {
                return Ok(Some(node.id.clone()));
            }
        }
        Ok(nodes.into_iter().next().map(|n| n.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{test_pool, NewRevision};
    use crate::storage::{MemoryStore, NodeRecord};
    use std::sync::Arc;

    fn controller(db: Db, repo: DynNodeRepository) -> RolloutController {
        RolloutController::new(
            db,
            repo,
            SessionRegistry::new(),
            Duration::from_secs(60),
            Duration::from_secs(10),
        )
    }

    async fn seed_node(repo: &DynNodeRepository, id: &str) {
        repo.upsert(NodeRecord {
            id: id.into(),
            last_seen: Some(Utc::now()),
            ..Default::default()
        })
        .await
        .expect("node");
    }

    async fn seed_app(db: &Db, app_id: &str, active: &str) {
        apps::create_app(db, app_id, AppStatus::RollingUpdate)
            .await
            .expect("app");
        if !active.is_empty() {
            apps::update_app_active_revision(db, app_id, active)
                .await
                .expect("active");
        }
    }

    async fn seed_revision(db: &Db, id: &str, app_id: &str, image: &str, status: RevisionStatus, age_secs: i64) {
        apps::create_revision(
            db,
            NewRevision {
                id: id.into(),
                app_id: app_id.into(),
                image: image.into(),
                status,
                created_at: Utc::now() - ChronoDuration::seconds(age_secs),
            },
        )
        .await
        .expect("revision");
    }

    #[tokio::test]
    async fn canary_success_promotes_the_new_revision() {
        let db = test_pool().await;
        let repo: DynNodeRepository = Arc::new(MemoryStore::new());
        seed_node(&repo, "n1").await;
        seed_app(&db, "app-1", "rev-1").await;
        seed_revision(&db, "rev-1", "app-1", "nginx:1.0", RevisionStatus::Stable, 3600).await;
        // Created 15s ago so the observation hold has already passed.
        seed_revision(&db, "rev-2", "app-1", "nginx:1.1", RevisionStatus::Rolling, 15).await;

        let controller = controller(db.clone(), repo);

        controller.tick().await.expect("tick");
        let rev = apps::get_revision(&db, "rev-2")
            .await
            .expect("query")
            .expect("rev");
        assert_eq!(rev.status, RevisionStatus::Canary);
        let task = tasks::latest_deploy_task_for_app(&db, "app-1")
            .await
            .expect("query")
            .expect("task");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.node_id, "n1");
        assert!(task.payload.contains("nginx:1.1"));

        tasks::update_task_status(&db, &task.id, TaskStatus::Completed)
            .await
            .expect("complete");

        controller.tick().await.expect("tick");
        let rev = apps::get_revision(&db, "rev-2")
            .await
            .expect("query")
            .expect("rev");
        assert_eq!(rev.status, RevisionStatus::Stable);
        let app = apps::get_app(&db, "app-1").await.expect("query").expect("app");
        assert_eq!(app.status, AppStatus::Stable);
        assert_eq!(app.active_revision_id, "rev-2");
    }

    #[tokio::test]
    async fn canary_failure_rolls_back_to_the_previous_revision() {
        let db = test_pool().await;
        let repo: DynNodeRepository = Arc::new(MemoryStore::new());
        seed_node(&repo, "n1").await;
        seed_app(&db, "app-1", "rev-stable").await;
        seed_revision(&db, "rev-stable", "app-1", "nginx:1.0", RevisionStatus::Stable, 3600).await;
        seed_revision(&db, "rev-fail", "app-1", "nginx:bad", RevisionStatus::Rolling, 0).await;

        let controller = controller(db.clone(), repo);

        controller.tick().await.expect("tick");
        let task = tasks::latest_deploy_task_for_app(&db, "app-1")
            .await
            .expect("query")
            .expect("task");
        tasks::update_task_status(&db, &task.id, TaskStatus::Failed)
            .await
            .expect("fail");

        controller.tick().await.expect("tick");

        let rev = apps::get_revision(&db, "rev-fail")
            .await
            .expect("query")
            .expect("rev");
        assert_eq!(rev.status, RevisionStatus::Failed);

        // The rollback task carries the previous image.
        let all = tasks::list_all_tasks(&db).await.expect("tasks");
        assert_eq!(all.len(), 2);
        let rollback = tasks::latest_deploy_task_for_app(&db, "app-1")
            .await
            .expect("query")
            .expect("task");
        assert!(rollback.payload.contains("nginx:1.0"), "{}", rollback.payload);

        let app = apps::get_app(&db, "app-1").await.expect("query").expect("app");
        assert_eq!(app.status, AppStatus::Stable);
        assert_eq!(app.active_revision_id, "rev-stable");
    }

    #[tokio::test]
    async fn stuck_canary_task_times_out_into_rollback() {
        let db = test_pool().await;
        let repo: DynNodeRepository = Arc::new(MemoryStore::new());
        seed_node(&repo, "n1").await;
        seed_app(&db, "app-1", "rev-1").await;
        seed_revision(&db, "rev-1", "app-1", "nginx:1.0", RevisionStatus::Stable, 3600).await;
        seed_revision(&db, "rev-2", "app-1", "nginx:1.1", RevisionStatus::Canary, 120).await;
        // A pending deploy task well past the completion window.
        tasks::create_task(
            &db,
            NewTask {
                id: "task-stuck".into(),
                task_type: TaskType::Deploy,
                status: TaskStatus::Pending,
                node_id: "n1".into(),
                target_id: "app-1".into(),
                payload: r#"{"image":"nginx:1.1"}"#.into(),
                created_at: Utc::now() - ChronoDuration::seconds(120),
            },
        )
        .await
        .expect("task");

        controller(db.clone(), repo).tick().await.expect("tick");

        let rev = apps::get_revision(&db, "rev-2")
            .await
            .expect("query")
            .expect("rev");
        assert_eq!(rev.status, RevisionStatus::Failed);
        let app = apps::get_app(&db, "app-1").await.expect("query").expect("app");
        assert_eq!(app.status, AppStatus::Stable);
        assert_eq!(app.active_revision_id, "rev-1");
    }

    #[tokio::test]
    async fn completed_canary_waits_out_the_hold_window() {
        let db = test_pool().await;
        let repo: DynNodeRepository = Arc::new(MemoryStore::new());
        seed_node(&repo, "n1").await;
        seed_app(&db, "app-1", "").await;
        // Revision just created; hold window not yet satisfied.
        seed_revision(&db, "rev-1", "app-1", "nginx:1.0", RevisionStatus::Canary, 2).await;
        tasks::create_task(
            &db,
            NewTask {
                id: "task-1".into(),
                task_type: TaskType::Deploy,
                status: TaskStatus::Completed,
                node_id: "n1".into(),
                target_id: "app-1".into(),
                payload: r#"{"image":"nginx:1.0"}"#.into(),
                created_at: Utc::now(),
            },
        )
        .await
        .expect("task");

        controller(db.clone(), repo).tick().await.expect("tick");

        let rev = apps::get_revision(&db, "rev-1")
            .await
            .expect("query")
            .expect("rev");
        assert_eq!(rev.status, RevisionStatus::Canary);
        let app = apps::get_app(&db, "app-1").await.expect("query").expect("app");
        assert_eq!(app.status, AppStatus::RollingUpdate);
    }

    #[tokio::test]
    async fn rolling_revision_waits_when_no_nodes_exist() {
        let db = test_pool().await;
        let repo: DynNodeRepository = Arc::new(MemoryStore::new());
        seed_app(&db, "app-1", "").await;
        seed_revision(&db, "rev-1", "app-1", "nginx:1.0", RevisionStatus::Rolling, 0).await;

        controller(db.clone(), repo).tick().await.expect("tick");

        let rev = apps::get_revision(&db, "rev-1")
            .await
            .expect("query")
            .expect("rev");
        assert_eq!(rev.status, RevisionStatus::Rolling);
        assert!(tasks::list_all_tasks(&db).await.expect("tasks").is_empty());
    }

    #[tokio::test]
    async fn failure_without_a_previous_revision_just_stabilizes() {
        let db = test_pool().await;
        let repo: DynNodeRepository = Arc::new(MemoryStore::new());
        seed_node(&repo, "n1").await;
        seed_app(&db, "app-1", "").await;
        seed_revision(&db, "rev-1", "app-1", "nginx:bad", RevisionStatus::Failed, 30).await;

        controller(db.clone(), repo).tick().await.expect("tick");

        let app = apps::get_app(&db, "app-1").await.expect("query").expect("app");
        assert_eq!(app.status, AppStatus::Stable);
        assert_eq!(app.active_revision_id, "");
        assert!(tasks::list_all_tasks(&db).await.expect("tasks").is_empty());
    }

    #[tokio::test]
    async fn pick_canary_node_prefers_connected_nodes() {
        let db = test_pool().await;
        let repo: DynNodeRepository = Arc::new(MemoryStore::new());
        seed_node(&repo, "offline").await;
        seed_node(&repo, "online").await;

        let registry = SessionRegistry::new();
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        std::mem::forget(rx);
        registry
            .insert(Arc::new(crate::registry::AgentSession::new(
                "online".into(),
                String::new(),
                String::new(),
                String::new(),
                tx,
            )))
            .await;

        let controller = RolloutController::new(
            db,
            repo,
            registry,
            Duration::from_secs(60),
            Duration::from_secs(10),
        );
        let picked = controller.pick_canary_node().await.expect("pick");
        assert_eq!(picked.as_deref(), Some("online"));
    }
}
