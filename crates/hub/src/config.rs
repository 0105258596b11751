use std::env;
use std::path::PathBuf;

use serde::Deserialize;

pub const ENV_PREFIX: &str = "QUAY_HUB";

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Address the agent gate listener binds.
    pub gate_host: String,
    pub gate_port: u16,
    /// Address the operator HTTP API binds.
    pub http_host: String,
    pub http_port: u16,
    pub metrics_host: String,
    pub metrics_port: u16,
    /// SQLite connection string; empty means in-memory node storage and
    /// no rollout controller.
    #[serde(default)]
    pub database_url: String,
    pub state_dir: String,
    /// Overrides the default `<state_dir>/node_aliases.json`.
    #[serde(default)]
    pub aliases_file: Option<String>,
    /// The gate listener itself is plaintext; this flag only produces a
    /// warning so misconfigured deployments are visible in logs.
    #[serde(default)]
    pub use_tls: bool,
    pub node_ttl_secs: u64,
    pub command_timeout_secs: u64,
    pub rollout_tick_secs: u64,
    pub canary_task_timeout_secs: u64,
    pub canary_hold_secs: u64,
}

impl HubConfig {
    pub fn alias_backup_path(&self) -> PathBuf {
        match &self.aliases_file {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
            _ => PathBuf::from(&self.state_dir).join("node_aliases.json"),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            gate_host: "0.0.0.0".into(),
            gate_port: 5051,
            http_host: "0.0.0.0".into(),
            http_port: 1499,
            metrics_host: "127.0.0.1".into(),
            metrics_port: 9190,
            database_url: String::new(),
            state_dir: "/var/lib/quay".into(),
            aliases_file: None,
            use_tls: false,
            node_ttl_secs: 600,
            command_timeout_secs: 30,
            rollout_tick_secs: 2,
            canary_task_timeout_secs: 60,
            canary_hold_secs: 10,
        }
    }
}

// (ENV_NAME, config_key)
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("QUAY_HUB_GATE_HOST", "gate_host"),
    ("QUAY_HUB_GATE_PORT", "gate_port"),
    ("QUAY_HUB_HTTP_HOST", "http_host"),
    ("QUAY_HUB_HTTP_PORT", "http_port"),
    ("QUAY_HUB_METRICS_HOST", "metrics_host"),
    ("QUAY_HUB_METRICS_PORT", "metrics_port"),
    ("QUAY_HUB_DATABASE_URL", "database_url"),
    ("QUAY_HUB_STATE_DIR", "state_dir"),
    ("QUAY_HUB_ALIASES_FILE", "aliases_file"),
    ("QUAY_HUB_USE_TLS", "use_tls"),
    ("QUAY_HUB_NODE_TTL_SECS", "node_ttl_secs"),
    ("QUAY_HUB_COMMAND_TIMEOUT_SECS", "command_timeout_secs"),
    ("QUAY_HUB_ROLLOUT_TICK_SECS", "rollout_tick_secs"),
    ("QUAY_HUB_CANARY_TASK_TIMEOUT_SECS", "canary_task_timeout_secs"),
    ("QUAY_HUB_CANARY_HOLD_SECS", "canary_hold_secs"),
];

pub fn load() -> anyhow::Result<HubConfig> {
    let defaults = HubConfig::default();
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("hub").required(false))
        .set_default("gate_host", defaults.gate_host)?
        .set_default("gate_port", defaults.gate_port)?
        .set_default("http_host", defaults.http_host)?
        .set_default("http_port", defaults.http_port)?
        .set_default("metrics_host", defaults.metrics_host)?
        .set_default("metrics_port", defaults.metrics_port)?
        .set_default("database_url", defaults.database_url)?
        .set_default("state_dir", defaults.state_dir)?
        .set_default("aliases_file", Option::<String>::None)?
        .set_default("use_tls", defaults.use_tls)?
        .set_default("node_ttl_secs", defaults.node_ttl_secs)?
        .set_default("command_timeout_secs", defaults.command_timeout_secs)?
        .set_default("rollout_tick_secs", defaults.rollout_tick_secs)?
        .set_default(
            "canary_task_timeout_secs",
            defaults.canary_task_timeout_secs,
        )?
        .set_default("canary_hold_secs", defaults.canary_hold_secs)?;

    for (env_key, cfg_key) in ENV_OVERRIDES {
        if let Ok(value) = env::var(env_key) {
            builder = builder.set_override(*cfg_key, value)?;
        }
    }

    let cfg: HubConfig = builder.build()?.try_deserialize()?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &HubConfig) -> anyhow::Result<()> {
    if cfg.gate_host.trim().is_empty() {
        anyhow::bail!("gate_host cannot be empty");
    }
    if cfg.state_dir.trim().is_empty() {
        anyhow::bail!("state_dir cannot be empty");
    }
    if cfg.command_timeout_secs == 0 {
        anyhow::bail!("command_timeout_secs must be > 0");
    }
    if cfg.rollout_tick_secs == 0 {
        anyhow::bail!("rollout_tick_secs must be > 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_backup_path_prefers_explicit_file() {
        let mut cfg = HubConfig::default();
        cfg.state_dir = "/var/lib/quay".into();
        assert_eq!(
            cfg.alias_backup_path(),
            PathBuf::from("/var/lib/quay/node_aliases.json")
        );

        cfg.aliases_file = Some("/etc/quay/aliases.json".into());
        assert_eq!(
            cfg.alias_backup_path(),
            PathBuf::from("/etc/quay/aliases.json")
        );

        cfg.aliases_file = Some("   ".into());
        assert_eq!(
            cfg.alias_backup_path(),
            PathBuf::from("/var/lib/quay/node_aliases.json")
        );
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let mut cfg = HubConfig::default();
        cfg.command_timeout_secs = 0;
        assert!(validate(&cfg).is_err());

        let mut cfg = HubConfig::default();
        cfg.rollout_tick_secs = 0;
        assert!(validate(&cfg).is_err());

        assert!(validate(&HubConfig::default()).is_ok());
    }
}
