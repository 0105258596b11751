use std::env;
use std::path::PathBuf;

use serde::Deserialize;

pub const ENV_PREFIX: &str = "QUAY_AGENT";

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Hub gate endpoint the agent dials into.
    pub hub_host: String,
    pub hub_port: u16,
    /// Holds the node identity file and other agent-local state.
    pub state_dir: String,
    /// Compose projects live here, one subdirectory per stack name.
    pub stacks_dir: String,
    /// Dial the hub over TLS. Implied by `ca_cert_path`.
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
    pub heartbeat_interval_secs: u64,
    pub reconnect_backoff_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub max_concurrent_commands: usize,
    pub metrics_host: String,
    pub metrics_port: u16,
}

impl AgentConfig {
    pub fn node_id_path(&self) -> PathBuf {
        PathBuf::from(&self.state_dir).join("node_id")
    }

    pub fn tls_enabled(&self) -> bool {
        self.use_tls || self.ca_cert_path.is_some()
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hub_host: "127.0.0.1".into(),
            hub_port: 5051,
            state_dir: "/var/lib/quay-agent".into(),
            stacks_dir: "/var/lib/quay-agent/stacks".into(),
            use_tls: false,
            ca_cert_path: None,
            tls_insecure_skip_verify: false,
            heartbeat_interval_secs: 30,
            reconnect_backoff_ms: 500,
            reconnect_backoff_max_ms: 30_000,
            max_concurrent_commands: 32,
            metrics_host: "127.0.0.1".into(),
            metrics_port: 9191,
        }
    }
}

// (ENV_NAME, config_key)
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("QUAY_AGENT_HUB_HOST", "hub_host"),
    ("QUAY_AGENT_HUB_PORT", "hub_port"),
    ("QUAY_AGENT_STATE_DIR", "state_dir"),
    ("QUAY_AGENT_STACKS_DIR", "stacks_dir"),
    ("QUAY_AGENT_USE_TLS", "use_tls"),
    ("QUAY_AGENT_CA_CERT_PATH", "ca_cert_path"),
    (
        "QUAY_AGENT_TLS_INSECURE_SKIP_VERIFY",
        "tls_insecure_skip_verify",
    ),
    (
        "QUAY_AGENT_HEARTBEAT_INTERVAL_SECS",
        "heartbeat_interval_secs",
    ),
    ("QUAY_AGENT_RECONNECT_BACKOFF_MS", "reconnect_backoff_ms"),
    (
        "QUAY_AGENT_RECONNECT_BACKOFF_MAX_MS",
        "reconnect_backoff_max_ms",
    ),
    (
        "QUAY_AGENT_MAX_CONCURRENT_COMMANDS",
        "max_concurrent_commands",
    ),
    ("QUAY_AGENT_METRICS_HOST", "metrics_host"),
    ("QUAY_AGENT_METRICS_PORT", "metrics_port"),
];

pub fn load() -> anyhow::Result<AgentConfig> {
    let defaults = AgentConfig::default();
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("agent").required(false))
        .set_default("hub_host", defaults.hub_host)?
        .set_default("hub_port", defaults.hub_port)?
        .set_default("state_dir", defaults.state_dir)?
        .set_default("stacks_dir", defaults.stacks_dir)?
        .set_default("use_tls", defaults.use_tls)?
        .set_default("ca_cert_path", Option::<String>::None)?
        .set_default(
            "tls_insecure_skip_verify",
            defaults.tls_insecure_skip_verify,
        )?
        .set_default(
            "heartbeat_interval_secs",
            defaults.heartbeat_interval_secs,
        )?
        .set_default("reconnect_backoff_ms", defaults.reconnect_backoff_ms)?
        .set_default(
            "reconnect_backoff_max_ms",
            defaults.reconnect_backoff_max_ms,
        )?
        .set_default(
            "max_concurrent_commands",
            defaults.max_concurrent_commands as u64,
        )?
        .set_default("metrics_host", defaults.metrics_host)?
        .set_default("metrics_port", defaults.metrics_port)?;

    for (env_key, cfg_key) in ENV_OVERRIDES {
        if let Ok(value) = env::var(env_key) {
            builder = builder.set_override(*cfg_key, value)?;
        }
    }

    let cfg: AgentConfig = builder.build()?.try_deserialize()?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &AgentConfig) -> anyhow::Result<()> {
    if cfg.hub_host.trim().is_empty() {
        anyhow::bail!("hub_host cannot be empty");
    }
    if cfg.hub_port == 0 {
        anyhow::bail!("hub_port must be > 0");
    }
    if cfg.heartbeat_interval_secs == 0 {
        anyhow::bail!("heartbeat_interval_secs must be > 0");
    }
    if cfg.max_concurrent_commands == 0 {
        anyhow::bail!("max_concurrent_commands must be > 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_path_lives_under_the_state_dir() {
        let mut cfg = AgentConfig::default();
        cfg.state_dir = "/tmp/agent".into();
        assert_eq!(cfg.node_id_path(), PathBuf::from("/tmp/agent/node_id"));
    }

    #[test]
    fn tls_is_implied_by_a_ca_path() {
        let mut cfg = AgentConfig::default();
        assert!(!cfg.tls_enabled());
        cfg.ca_cert_path = Some("/etc/quay/ca.pem".into());
        assert!(cfg.tls_enabled());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = AgentConfig::default();
        cfg.hub_port = 0;
        assert!(validate(&cfg).is_err());

        let mut cfg = AgentConfig::default();
        cfg.max_concurrent_commands = 0;
        assert!(validate(&cfg).is_err());

        assert!(validate(&AgentConfig::default()).is_ok());
    }
}
