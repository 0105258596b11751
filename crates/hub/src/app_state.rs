use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::HubConfig;
use crate::dispatch::Dispatcher;
use crate::error::AppError;
use crate::persistence::Db;
use crate::registry::SessionRegistry;
use crate::storage::DynNodeRepository;

/// Shared hub state, cloned into HTTP handlers and background loops.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub repo: DynNodeRepository,
    pub registry: SessionRegistry,
    pub dispatcher: Dispatcher,
    /// Absent when the hub runs on the in-memory fallback; the rollout
    /// surface is unavailable in that mode.
    pub db: Option<Db>,
    pub metrics_handle: PrometheusHandle,
}

impl AppState {
    pub fn db(&self) -> Result<&Db, AppError> {
        self.db
            .as_ref()
            .ok_or_else(|| AppError::unavailable("rollout storage is not configured"))
    }
}
