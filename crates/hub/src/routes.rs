use axum::routing::{get, post, put};
use axum::Router;

use crate::app_state::AppState;
use crate::http;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/nodes", get(http::nodes::list_nodes))
        .route(
            "/api/v1/nodes/{node_id}/rename",
            post(http::nodes::rename_node),
        )
        .route(
            "/api/v1/nodes/{node_id}/exec",
            post(http::nodes::exec_command),
        )
        .route(
            "/api/v1/apps",
            get(http::apps::list_apps).post(http::apps::deploy),
        )
        .route(
            "/api/v1/apps/{app_id}",
            put(http::apps::update_app).delete(http::apps::delete_app),
        )
        .route("/api/v1/state/backup", post(http::apps::backup_state))
        .route("/api/v1/tasks", get(http::apps::list_tasks))
        .route(
            "/api/v1/tasks/{task_id}/status",
            post(http::apps::update_task_status),
        )
}
