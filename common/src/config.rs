// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub node: NodeConfig,
    pub database: DatabaseConfig,
    pub store: StoreConfig,
    pub pool: PoolConfig,
    pub engine: EngineConfig,
    pub cluster: ClusterConfig,
    pub observability: ObservabilityConfig,
}

/// Identity of this cluster member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub scheduler_name: String,
    /// Prefix folded into every trigger status document id
    #[serde(default)]
    pub instance_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_status_table")]
    pub status_table: String,
    #[serde(default = "default_job_config_table")]
    pub job_config_table: String,
}

fn default_status_table() -> String {
    "scheduler_trigger_status".to_string()
}

fn default_job_config_table() -> String {
    "scheduler_job_configs".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub misfire_threshold_ms: u64,
    /// When false, a failed startup load is fatal
    pub reinitialize_on_topology_change: bool,
    pub watchlist_recheck_seconds: u64,
    /// Upper bound on how long a failed status write waits for its retry
    pub unflushed_retry_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub keep_alive_seconds: u64,
    pub poll_interval_ms: u64,
    pub shutdown_join_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub idle_wait_ms: u64,
    pub max_batch_size: usize,
    pub batch_time_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Address the confirmation endpoint binds to
    pub listen_addr: String,
    pub confirm_timeout_ms: u64,
    /// Base URL of every peer, keyed by node id
    #[serde(default)]
    pub peers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment-specific configuration
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.node.node_id.is_empty() {
            return Err("Node node_id cannot be empty".to_string());
        }
        if self.node.scheduler_name.is_empty() {
            return Err("Node scheduler_name cannot be empty".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        if self.store.watchlist_recheck_seconds == 0 {
            return Err("Store watchlist_recheck_seconds must be greater than 0".to_string());
        }
        if self.store.unflushed_retry_interval_seconds == 0 {
            return Err(
                "Store unflushed_retry_interval_seconds must be greater than 0".to_string(),
            );
        }

        if self.pool.max_workers == 0 {
            return Err("Pool max_workers must be greater than 0".to_string());
        }
        if self.pool.poll_interval_ms == 0 {
            return Err("Pool poll_interval_ms must be greater than 0".to_string());
        }

        if self.engine.max_batch_size == 0 {
            return Err("Engine max_batch_size must be greater than 0".to_string());
        }

        if let Some((node, _)) = self.cluster.peers.iter().find(|(_, url)| url.is_empty()) {
            return Err(format!("Cluster peer '{}' has an empty URL", node));
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                node_id: "node-1".to_string(),
                scheduler_name: "default".to_string(),
                instance_prefix: None,
            },
            database: DatabaseConfig {
                url: "postgresql://localhost/scheduler".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
                status_table: default_status_table(),
                job_config_table: default_job_config_table(),
            },
            store: StoreConfig {
                misfire_threshold_ms: 10_000,
                reinitialize_on_topology_change: true,
                watchlist_recheck_seconds: 10,
                unflushed_retry_interval_seconds: 30,
            },
            pool: PoolConfig {
                max_workers: 3,
                keep_alive_seconds: 3600,
                poll_interval_ms: 1000,
                shutdown_join_timeout_seconds: 5,
            },
            engine: EngineConfig {
                idle_wait_ms: 30_000,
                max_batch_size: 1,
                batch_time_window_ms: 0,
            },
            cluster: ClusterConfig {
                listen_addr: "0.0.0.0:8086".to_string(),
                confirm_timeout_ms: 5000,
                peers: HashMap::new(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_empty_node_id() {
        let mut settings = Settings::default();
        settings.node.node_id = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_workers() {
        let mut settings = Settings::default();
        settings.pool.max_workers = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_empty_peer_url() {
        let mut settings = Settings::default();
        settings
            .cluster
            .peers
            .insert("node-2".to_string(), String::new());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_path_reads_default_toml() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = toml_from(&Settings::default());
        fs::write(dir.path().join("default.toml"), defaults).unwrap();
        fs::write(
            dir.path().join("local.toml"),
            "[node]\nnode_id = \"node-7\"\nscheduler_name = \"alerts\"\n",
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.node.node_id, "node-7");
        assert_eq!(settings.node.scheduler_name, "alerts");
        assert_eq!(settings.pool.max_workers, 3);
        assert_eq!(settings.database.status_table, "scheduler_trigger_status");
    }

    fn toml_from(settings: &Settings) -> String {
        format!(
            r#"
[node]
node_id = "{node_id}"
scheduler_name = "{scheduler_name}"

[database]
url = "{url}"
max_connections = {max_connections}
min_connections = {min_connections}
connect_timeout_seconds = {connect_timeout}

[store]
misfire_threshold_ms = {misfire}
reinitialize_on_topology_change = true
watchlist_recheck_seconds = {recheck}
unflushed_retry_interval_seconds = {retry}

[pool]
max_workers = {max_workers}
keep_alive_seconds = {keep_alive}
poll_interval_ms = {poll}
shutdown_join_timeout_seconds = {join}

[engine]
idle_wait_ms = {idle_wait}
max_batch_size = {batch}
batch_time_window_ms = {window}

[cluster]
listen_addr = "{listen}"
confirm_timeout_ms = {confirm}

[observability]
log_level = "info"
metrics_port = {metrics_port}
"#,
            node_id = settings.node.node_id,
            scheduler_name = settings.node.scheduler_name,
            url = settings.database.url,
            max_connections = settings.database.max_connections,
            min_connections = settings.database.min_connections,
            connect_timeout = settings.database.connect_timeout_seconds,
            misfire = settings.store.misfire_threshold_ms,
            recheck = settings.store.watchlist_recheck_seconds,
            retry = settings.store.unflushed_retry_interval_seconds,
            max_workers = settings.pool.max_workers,
            keep_alive = settings.pool.keep_alive_seconds,
            poll = settings.pool.poll_interval_ms,
            join = settings.pool.shutdown_join_timeout_seconds,
            idle_wait = settings.engine.idle_wait_ms,
            batch = settings.engine.max_batch_size,
            window = settings.engine.batch_time_window_ms,
            listen = settings.cluster.listen_addr,
            confirm = settings.cluster.confirm_timeout_ms,
            metrics_port = settings.observability.metrics_port,
        )
    }
}
