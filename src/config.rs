//! Configuration system for the taskmesh node
//!
//! Supports multiple configuration sources with the following precedence
//! (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (TASKMESH_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coordinator::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::transport::TransportConfig;
use crate::worker::WorkerTuning;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity and mesh topology
    pub node: NodeSettings,

    /// Coordinator tick behaviour
    pub coordinator: CoordinatorSettings,

    /// Worker tuning coefficients
    pub worker: WorkerSettings,

    /// Transport link settings
    pub transport: TransportSettings,

    /// Logging configuration
    pub logging: LoggingSettings,

    /// Resource name → URI table served to the mesh
    pub resources: HashMap<String, String>,
}

/// Node identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Mesh-wide node id (auto-generated if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Human-readable node name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// TCP listen address for inbound mesh links (empty = no listener)
    pub listen_addr: String,

    /// Root server to join and persistently reconnect to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_addr: Option<String>,

    /// Shared transport secret; enables frame encryption when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Number of workers (0 = one per CPU core, capped at 8)
    pub workers: usize,
}

/// Coordinator tick settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Base tick interval in milliseconds
    pub tick_ms: u64,

    /// Tick slowdown factor while fully idle
    pub idle_tick_factor: u32,

    /// Consecutive zero-server ticks before the isolated broadcast
    pub isolation_threshold: u32,

    /// Task factories drained per tick
    pub max_tasks: usize,

    /// Jobs pulled per factory per tick (scaled by factory priority)
    pub jobs_per_task: f32,

    /// Server link cap
    pub max_servers: usize,

    /// Dial servers learned from peer-list replies
    pub learn_peers: bool,
}

/// Worker tuning settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Target queue capacity (hard bound is twice this)
    pub max_jobs: usize,

    /// Queue floor below which no relaying happens
    pub min_jobs: usize,

    /// Peer link capacity per worker
    pub max_peers: usize,

    /// Failed-job retry buffer capacity
    pub max_failed_jobs: usize,

    /// Relay probability slope over queue occupancy
    pub relay_p: f64,

    /// Peer discovery probability at zero peers
    pub connect_p: f64,

    /// Relay probability floor above `min_jobs`
    pub min_job_p: f64,

    /// Weight of peer-link occupancy in the relay probability
    pub peer_relay_c: f64,

    /// Probability of relaying upstream instead of to a peer
    pub parental_relay_p: f64,

    /// Denominator coefficient of the activity rating
    pub activity_c: f64,

    /// Numerator of the sleep multiplier
    pub activity_sleep_c: f64,

    /// Offset added to activity in the sleep multiplier denominator
    pub activity_sleep_offset: f64,

    /// Weight of the parent-activity term in the sleep multiplier
    pub peer_activity_sleep_c: f64,

    /// Sleep ceiling as a multiple of `min_sleep_ms`
    pub max_sleep_c: f64,

    /// Sleep floor in milliseconds
    pub min_sleep_ms: u64,

    /// Execution loop idle pause in milliseconds
    pub exec_idle_ms: u64,
}

/// Transport link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Socket connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Correlated-reply deadline in milliseconds
    pub reply_timeout_ms: u64,

    /// Idle time before a confirmation probe, in milliseconds
    pub idle_timeout_ms: u64,

    /// Consecutive reconnect attempts before permanent disconnect
    pub max_reconnect_attempts: u32,

    /// Inbound reply store capacity
    pub inbox_capacity: usize,

    /// Background ping/status probe cadence in received messages
    pub ping_every_messages: u64,

    /// Payload size of the periodic ping probe
    pub ping_payload_len: usize,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings::default(),
            coordinator: CoordinatorSettings::default(),
            worker: WorkerSettings::default(),
            transport: TransportSettings::default(),
            logging: LoggingSettings::default(),
            resources: HashMap::new(),
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            listen_addr: "0.0.0.0:9400".to_string(),
            root_addr: None,
            secret: None,
            workers: 0,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            idle_tick_factor: 10,
            isolation_threshold: 200,
            max_tasks: 4,
            jobs_per_task: 1.0,
            max_servers: 8,
            learn_peers: true,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let t = WorkerTuning::default();
        Self {
            max_jobs: t.max_jobs,
            min_jobs: t.min_jobs,
            max_peers: t.max_peers,
            max_failed_jobs: t.max_failed_jobs,
            relay_p: t.relay_p,
            connect_p: t.connect_p,
            min_job_p: t.min_job_p,
            peer_relay_c: t.peer_relay_c,
            parental_relay_p: t.parental_relay_p,
            activity_c: t.activity_c,
            activity_sleep_c: t.activity_sleep_c,
            activity_sleep_offset: t.activity_sleep_offset,
            peer_activity_sleep_c: t.peer_activity_sleep_c,
            max_sleep_c: t.max_sleep_c,
            min_sleep_ms: t.min_sleep.as_millis() as u64,
            exec_idle_ms: t.exec_idle.as_millis() as u64,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        let t = TransportConfig::default();
        Self {
            connect_timeout_ms: t.connect_timeout.as_millis() as u64,
            reply_timeout_ms: t.reply_timeout.as_millis() as u64,
            idle_timeout_ms: t.idle_timeout.as_millis() as u64,
            max_reconnect_attempts: t.max_reconnect_attempts,
            inbox_capacity: t.inbox_capacity,
            ping_every_messages: t.ping_every_messages,
            ping_payload_len: t.ping_payload_len,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 50,
            max_files: 5,
            json_format: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration: file (explicit path or search), then env
    /// overrides, then validation.
    pub fn load(explicit_path: Option<&str>) -> Result<Self> {
        let mut config = match Self::find_config_file(explicit_path)? {
            Some(path) => {
                debug!(path = %path.display(), "Loading configuration file");
                let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                    path: path.clone(),
                    source: e,
                })?;
                toml::from_str(&content).map_err(|e| Error::ConfigParse {
                    message: e.to_string(),
                    source: Some(e),
                })?
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let expanded = shellexpand::tilde(path);
            let path = PathBuf::from(expanded.as_ref());
            if path.exists() {
                return Ok(Some(path));
            } else {
                return Err(Error::config_not_found(path));
            }
        }

        let search_paths = [
            PathBuf::from("taskmesh.toml"),
            PathBuf::from("config.toml"),
            dirs::config_dir()
                .map(|p| p.join("taskmesh").join("node.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".taskmesh").join("node.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/taskmesh/node.toml"),
        ];

        for path in &search_paths {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TASKMESH_NODE_ID") {
            self.node.id = Some(val);
        }
        if let Ok(val) = std::env::var("TASKMESH_NODE_NAME") {
            self.node.name = Some(val);
        }
        if let Ok(val) = std::env::var("TASKMESH_LISTEN_ADDR") {
            self.node.listen_addr = val;
        }
        if let Ok(val) = std::env::var("TASKMESH_ROOT_ADDR") {
            self.node.root_addr = Some(val);
        }
        if let Ok(val) = std::env::var("TASKMESH_SECRET") {
            self.node.secret = Some(val);
        }
        if let Ok(val) = std::env::var("TASKMESH_WORKERS") {
            if let Ok(n) = val.parse() {
                self.node.workers = n;
            }
        }

        if let Ok(val) = std::env::var("TASKMESH_TICK_MS") {
            if let Ok(n) = val.parse() {
                self.coordinator.tick_ms = n;
            }
        }
        if let Ok(val) = std::env::var("TASKMESH_MAX_SERVERS") {
            if let Ok(n) = val.parse() {
                self.coordinator.max_servers = n;
            }
        }

        if let Ok(val) = std::env::var("TASKMESH_MAX_JOBS") {
            if let Ok(n) = val.parse() {
                self.worker.max_jobs = n;
            }
        }
        if let Ok(val) = std::env::var("TASKMESH_MAX_PEERS") {
            if let Ok(n) = val.parse() {
                self.worker.max_peers = n;
            }
        }

        if let Ok(val) = std::env::var("TASKMESH_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("TASKMESH_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("TASKMESH_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Validate field values
    pub fn validate(&self) -> Result<()> {
        if !self.node.listen_addr.is_empty() {
            self.node.listen_addr.parse::<SocketAddr>().map_err(|_| {
                Error::config_field_invalid(
                    "node.listen_addr",
                    format!("not a socket address: {}", self.node.listen_addr),
                )
            })?;
        }
        if let Some(ref root) = self.node.root_addr {
            root.parse::<SocketAddr>().map_err(|_| {
                Error::config_field_invalid(
                    "node.root_addr",
                    format!("not a socket address: {root}"),
                )
            })?;
        }
        if let Some(ref secret) = self.node.secret {
            if secret.is_empty() {
                return Err(Error::config_field_invalid(
                    "node.secret",
                    "secret must not be empty when set",
                ));
            }
        }

        if self.worker.max_jobs == 0 {
            return Err(Error::config_field_invalid(
                "worker.max_jobs",
                "must be at least 1",
            ));
        }
        if self.worker.min_jobs >= self.worker.max_jobs {
            return Err(Error::config_field_invalid(
                "worker.min_jobs",
                "must be below worker.max_jobs",
            ));
        }
        if self.worker.max_peers == 0 {
            return Err(Error::config_field_invalid(
                "worker.max_peers",
                "must be at least 1",
            ));
        }
        for (field, value) in [
            ("worker.relay_p", self.worker.relay_p),
            ("worker.connect_p", self.worker.connect_p),
            ("worker.min_job_p", self.worker.min_job_p),
            ("worker.parental_relay_p", self.worker.parental_relay_p),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::config_field_invalid(
                    field,
                    format!("probability out of range: {value}"),
                ));
            }
        }
        if self.worker.max_sleep_c < 1.0 {
            return Err(Error::config_field_invalid(
                "worker.max_sleep_c",
                "must be at least 1.0",
            ));
        }
        if self.worker.min_sleep_ms == 0 {
            return Err(Error::config_field_invalid(
                "worker.min_sleep_ms",
                "must be at least 1",
            ));
        }

        if self.coordinator.tick_ms == 0 {
            return Err(Error::config_field_invalid(
                "coordinator.tick_ms",
                "must be at least 1",
            ));
        }
        if self.coordinator.max_servers == 0 {
            return Err(Error::config_field_invalid(
                "coordinator.max_servers",
                "must be at least 1",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "warning", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!("unknown level: {}", self.logging.level),
            ));
        }

        Ok(())
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write a default configuration file
    pub fn write_default(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            return Err(Error::Config(format!(
                "refusing to overwrite existing file: {} (use --force)",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let content = Self::default().to_toml()?;
        fs::write(path, content).map_err(|e| Error::IoWrite {
            path: path.to_path_buf(),
            source: e,
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Conversions into runtime structs
    // ─────────────────────────────────────────────────────────────

    /// Resolved worker count (0 = one per core, capped)
    pub fn worker_count(&self) -> usize {
        if self.node.workers > 0 {
            self.node.workers
        } else {
            num_cpus::get().min(8)
        }
    }

    pub fn worker_tuning(&self) -> WorkerTuning {
        let w = &self.worker;
        WorkerTuning {
            max_jobs: w.max_jobs,
            min_jobs: w.min_jobs,
            max_peers: w.max_peers,
            max_failed_jobs: w.max_failed_jobs,
            relay_p: w.relay_p,
            connect_p: w.connect_p,
            min_job_p: w.min_job_p,
            peer_relay_c: w.peer_relay_c,
            parental_relay_p: w.parental_relay_p,
            activity_c: w.activity_c,
            activity_sleep_c: w.activity_sleep_c,
            activity_sleep_offset: w.activity_sleep_offset,
            peer_activity_sleep_c: w.peer_activity_sleep_c,
            max_sleep_c: w.max_sleep_c,
            min_sleep: Duration::from_millis(w.min_sleep_ms),
            exec_idle: Duration::from_millis(w.exec_idle_ms),
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        let t = &self.transport;
        TransportConfig {
            connect_timeout: Duration::from_millis(t.connect_timeout_ms),
            reply_timeout: Duration::from_millis(t.reply_timeout_ms),
            idle_timeout: Duration::from_millis(t.idle_timeout_ms),
            max_reconnect_attempts: t.max_reconnect_attempts,
            inbox_capacity: t.inbox_capacity,
            ping_every_messages: t.ping_every_messages,
            ping_payload_len: t.ping_payload_len,
            ..TransportConfig::default()
        }
    }

    /// Build the coordinator configuration (validation already done)
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let node_id = self.node.id.clone().unwrap_or_else(|| {
            let host = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "node".to_string());
            format!("{}-{}", host, &uuid::Uuid::new_v4().to_string()[..8])
        });

        CoordinatorConfig {
            node_id,
            worker_count: self.worker_count(),
            worker_tuning: self.worker_tuning(),
            base_tick: Duration::from_millis(self.coordinator.tick_ms),
            idle_tick_factor: self.coordinator.idle_tick_factor,
            isolation_threshold: self.coordinator.isolation_threshold,
            max_tasks: self.coordinator.max_tasks,
            jobs_per_task: self.coordinator.jobs_per_task,
            max_servers: self.coordinator.max_servers,
            listen_addr: if self.node.listen_addr.is_empty() {
                None
            } else {
                self.node.listen_addr.parse().ok()
            },
            root_addr: self.node.root_addr.as_ref().and_then(|a| a.parse().ok()),
            secret: self.node.secret.clone(),
            transport: self.transport_config(),
            learn_peers: self.coordinator.learn_peers,
            ..CoordinatorConfig::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
