use chrono::{Duration, Utc};
use quay_common::api::{NodeInfo, NodeStatus};
use tracing::warn;

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::telemetry;

/// List known nodes with their live connection status.
///
/// Listing doubles as the stale-node reap: rows that are disconnected and
/// past the inactivity TTL are deleted on the way out. A failed delete is
/// logged and the row stays in the result.
pub async fn list_nodes(state: &AppState) -> ApiResult<Vec<NodeInfo>> {
    let records = state.repo.list().await?;
    let sessions = state.registry.snapshot().await;
    let cutoff = Utc::now()
        - Duration::seconds(state.config.node_ttl_secs.min(i64::MAX as u64) as i64);

    let mut nodes = Vec::with_capacity(records.len());
    for record in records {
        let connected = sessions.contains_key(&record.id);
        let expired = !connected && record.last_seen.map(|t| t < cutoff).unwrap_or(false);
        if expired {
            match state.repo.delete(&record.id).await {
                Ok(()) => {
                    telemetry::record_node_reaped();
                    continue;
                }
                Err(err) => {
                    warn!(?err, node_id = %record.id, "failed to reap stale node");
                }
            }
        }

        nodes.push(NodeInfo {
            node_id: record.id,
            alias: record.alias,
            machine_id: record.machine_id,
            version: record.version,
            status: if connected {
                NodeStatus::Connected
            } else {
                NodeStatus::Disconnected
            },
            remote_addr: record.remote_addr,
            last_seen: record.last_seen,
        });
    }

    Ok(nodes)
}

/// Rename a node. An empty name clears the alias.
pub async fn rename_node(state: &AppState, node_id: &str, name: &str) -> ApiResult<()> {
    let node_id = node_id.trim();
    if node_id.is_empty() {
        return Err(AppError::invalid_argument("node id is required"));
    }

    let node = state.repo.get(node_id).await?;
    if node.is_none() {
        return Err(AppError::not_found(format!("node {node_id} not found")));
    }

    state.repo.rename(node_id, name.trim()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::dispatch::{Dispatcher, PendingCommands};
    use crate::registry::{AgentSession, SessionRegistry};
    use crate::storage::{MemoryStore, NodeRecord};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    fn test_state() -> AppState {
        let registry = SessionRegistry::new();
        AppState {
            config: Arc::new(HubConfig::default()),
            repo: Arc::new(MemoryStore::new()),
            registry: registry.clone(),
            dispatcher: Dispatcher::new(
                registry,
                PendingCommands::default(),
                StdDuration::from_secs(30),
            ),
            db: None,
            metrics_handle: crate::telemetry::init_metrics_recorder(),
        }
    }

    async fn seed(state: &AppState, id: &str, last_seen_secs_ago: i64) {
        state
            .repo
            .upsert(NodeRecord {
                id: id.into(),
                last_seen: Some(Utc::now() - Duration::seconds(last_seen_secs_ago)),
                ..Default::default()
            })
            .await
            .expect("upsert");
    }

    async fn connect(state: &AppState, id: &str) {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        std::mem::forget(rx);
        state
            .registry
            .insert(Arc::new(AgentSession::new(
                id.into(),
                String::new(),
                String::new(),
                String::new(),
                tx,
            )))
            .await;
    }

    #[tokio::test]
    async fn list_reaps_disconnected_nodes_past_the_ttl() {
        let state = test_state();
        seed(&state, "fresh", 10).await;
        seed(&state, "stale", 660).await;

        let nodes = list_nodes(&state).await.expect("list");
        let ids: Vec<_> = nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["fresh"]);
        assert!(state.repo.get("stale").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn connected_nodes_are_never_reaped() {
        let state = test_state();
        seed(&state, "stale-but-live", 660).await;
        connect(&state, "stale-but-live").await;

        let nodes = list_nodes(&state).await.expect("list");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].status, NodeStatus::Connected);
    }

    #[tokio::test]
    async fn nodes_without_last_seen_are_kept() {
        let state = test_state();
        state
            .repo
            .upsert(NodeRecord {
                id: "silent".into(),
                ..Default::default()
            })
            .await
            .expect("upsert");

        let nodes = list_nodes(&state).await.expect("list");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].status, NodeStatus::Disconnected);
    }

    #[tokio::test]
    async fn rename_validates_node_id_and_existence() {
        let state = test_state();
        let err = rename_node(&state, "  ", "name").await.expect_err("empty");
        assert_eq!(err.code, "invalid_argument");

        let err = rename_node(&state, "ghost", "name")
            .await
            .expect_err("missing");
        assert_eq!(err.code, "not_found");

        seed(&state, "n1", 0).await;
        rename_node(&state, "n1", "edge-west").await.expect("rename");
        let node = state.repo.get("n1").await.expect("get").expect("node");
        assert_eq!(node.alias, "edge-west");

        // Renaming to the same value is a no-op, an empty name clears.
        rename_node(&state, "n1", "edge-west").await.expect("again");
        rename_node(&state, "n1", "").await.expect("clear");
        let node = state.repo.get("n1").await.expect("get").expect("node");
        assert_eq!(node.alias, "");
    }
}
