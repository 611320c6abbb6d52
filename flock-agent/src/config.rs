//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flock_core::{BackoffPolicy, SwarmConfig};

use crate::conn::ConnConfig;
use crate::scheduler::SchedulerConfig;
use crate::store::StoreLayout;

/// Agent configuration. File: `$FLOCK_CONFIG`, ~/.config/flock/config.toml
/// or /etc/flock/config.toml (first one present wins).
/// Env overrides: FLOCK_LISTEN_PORT, FLOCK_LOG_LEVEL, FLOCK_DATA_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Peer listen port (default 7878).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// "compact", "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub conn: ConnSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    /// Parent of every region not set explicitly.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    pub upload_dir: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub trash_dir: Option<PathBuf>,
    pub link_dir: Option<PathBuf>,
    #[serde(default = "default_cache_budget_bytes")]
    pub cache_budget_bytes: u64,
    #[serde(default = "default_trash_grace_secs")]
    pub trash_grace_secs: u64,
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnSection {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSection {
    #[serde(default = "default_max_global_conns")]
    pub max_global_conns: usize,
    #[serde(default = "default_max_conns_per_swarm")]
    pub max_conns_per_swarm: usize,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_pipeline_depth")]
    pub pipeline_depth: usize,
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
    #[serde(default = "default_max_integrity_failures")]
    pub max_integrity_failures: u32,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_listen_port() -> u16 {
    7878
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/flock")
}
fn default_cache_budget_bytes() -> u64 {
    10 * 1024 * 1024 * 1024 // 10 GiB
}
fn default_trash_grace_secs() -> u64 {
    3600
}
fn default_eviction_interval_secs() -> u64 {
    60
}
fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_handshake_timeout_ms() -> u64 {
    ConnConfig::default().handshake_timeout.as_millis() as u64
}
fn default_read_timeout_ms() -> u64 {
    ConnConfig::default().read_timeout.as_millis() as u64
}
fn default_write_timeout_ms() -> u64 {
    ConnConfig::default().write_timeout.as_millis() as u64
}
fn default_keepalive_interval_ms() -> u64 {
    ConnConfig::default().keepalive_interval.as_millis() as u64
}
fn default_idle_timeout_ms() -> u64 {
    ConnConfig::default().idle_timeout.as_millis() as u64
}
fn default_max_frame_bytes() -> u32 {
    ConnConfig::default().max_frame_len
}
fn default_max_global_conns() -> usize {
    flock_core::admission::DEFAULT_MAX_GLOBAL_CONNS
}
fn default_max_conns_per_swarm() -> usize {
    flock_core::admission::DEFAULT_MAX_CONNS_PER_SWARM
}
fn default_dial_timeout_ms() -> u64 {
    SchedulerConfig::default().dial_timeout.as_millis() as u64
}
fn default_backoff_base_ms() -> u64 {
    BackoffPolicy::default().base.as_millis() as u64
}
fn default_backoff_max_ms() -> u64 {
    BackoffPolicy::default().max.as_millis() as u64
}
fn default_retry_limit() -> u32 {
    BackoffPolicy::default().retry_limit
}
fn default_pipeline_depth() -> usize {
    SwarmConfig::default().pipeline_depth
}
fn default_stall_timeout_ms() -> u64 {
    SwarmConfig::default().stall_timeout.as_millis() as u64
}
fn default_max_integrity_failures() -> u32 {
    SwarmConfig::default().max_integrity_failures
}
fn default_tick_interval_ms() -> u64 {
    SchedulerConfig::default().tick_interval.as_millis() as u64
}
fn default_drain_timeout_ms() -> u64 {
    SchedulerConfig::default().drain_timeout.as_millis() as u64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            store: StoreSection::default(),
            conn: ConnSection::default(),
            scheduler: SchedulerSection::default(),
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            upload_dir: None,
            download_dir: None,
            cache_dir: None,
            trash_dir: None,
            link_dir: None,
            cache_budget_bytes: default_cache_budget_bytes(),
            trash_grace_secs: default_trash_grace_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for ConnSection {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_global_conns: default_max_global_conns(),
            max_conns_per_swarm: default_max_conns_per_swarm(),
            dial_timeout_ms: default_dial_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            retry_limit: default_retry_limit(),
            pipeline_depth: default_pipeline_depth(),
            stall_timeout_ms: default_stall_timeout_ms(),
            max_integrity_failures: default_max_integrity_failures(),
            tick_interval_ms: default_tick_interval_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("bad value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

impl Config {
    pub fn store_layout(&self) -> StoreLayout {
        let s = &self.store;
        let base = StoreLayout::under(&s.data_dir);
        StoreLayout {
            upload: s.upload_dir.clone().unwrap_or(base.upload),
            download: s.download_dir.clone().unwrap_or(base.download),
            cache: s.cache_dir.clone().unwrap_or(base.cache),
            trash: s.trash_dir.clone().unwrap_or(base.trash),
            links: s.link_dir.clone().unwrap_or(base.links),
        }
    }

    pub fn trash_grace(&self) -> Duration {
        Duration::from_secs(self.store.trash_grace_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.store.eviction_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.store.sweep_interval_secs)
    }

    pub fn conn_config(&self) -> ConnConfig {
        let c = &self.conn;
        ConnConfig {
            handshake_timeout: Duration::from_millis(c.handshake_timeout_ms),
            read_timeout: Duration::from_millis(c.read_timeout_ms),
            write_timeout: Duration::from_millis(c.write_timeout_ms),
            keepalive_interval: Duration::from_millis(c.keepalive_interval_ms),
            idle_timeout: Duration::from_millis(c.idle_timeout_ms),
            max_frame_len: c.max_frame_bytes,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let s = &self.scheduler;
        SchedulerConfig {
            dial_timeout: Duration::from_millis(s.dial_timeout_ms),
            backoff: BackoffPolicy {
                base: Duration::from_millis(s.backoff_base_ms),
                max: Duration::from_millis(s.backoff_max_ms),
                retry_limit: s.retry_limit,
            },
            swarm: SwarmConfig {
                pipeline_depth: s.pipeline_depth,
                stall_timeout: Duration::from_millis(s.stall_timeout_ms),
                max_integrity_failures: s.max_integrity_failures,
            },
            tick_interval: Duration::from_millis(s.tick_interval_ms),
            drain_timeout: Duration::from_millis(s.drain_timeout_ms),
        }
    }

    /// Reject settings the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("conn.handshake_timeout_ms", self.conn.handshake_timeout_ms),
            ("conn.read_timeout_ms", self.conn.read_timeout_ms),
            ("conn.write_timeout_ms", self.conn.write_timeout_ms),
            ("conn.keepalive_interval_ms", self.conn.keepalive_interval_ms),
            ("conn.idle_timeout_ms", self.conn.idle_timeout_ms),
            ("conn.max_frame_bytes", u64::from(self.conn.max_frame_bytes)),
            ("scheduler.max_global_conns", self.scheduler.max_global_conns as u64),
            ("scheduler.max_conns_per_swarm", self.scheduler.max_conns_per_swarm as u64),
            ("scheduler.dial_timeout_ms", self.scheduler.dial_timeout_ms),
            ("scheduler.retry_limit", u64::from(self.scheduler.retry_limit)),
            ("scheduler.pipeline_depth", self.scheduler.pipeline_depth as u64),
            ("scheduler.tick_interval_ms", self.scheduler.tick_interval_ms),
            ("store.eviction_interval_secs", self.store.eviction_interval_secs),
            ("store.sweep_interval_secs", self.store.sweep_interval_secs),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        let quiet = self.conn.read_timeout_ms.min(self.conn.idle_timeout_ms);
        if self.conn.keepalive_interval_ms >= quiet {
            return Err(ConfigError::Invalid(
                "conn.keepalive_interval_ms must be below conn.read_timeout_ms and conn.idle_timeout_ms"
                    .into(),
            ));
        }
        if self.scheduler.backoff_base_ms > self.scheduler.backoff_max_ms {
            return Err(ConfigError::Invalid(
                "scheduler.backoff_base_ms must not exceed scheduler.backoff_max_ms".into(),
            ));
        }
        if self.scheduler.max_conns_per_swarm > self.scheduler.max_global_conns {
            return Err(ConfigError::Invalid(
                "scheduler.max_conns_per_swarm must not exceed scheduler.max_global_conns".into(),
            ));
        }
        match self.log_format.as_str() {
            "compact" | "pretty" | "json" => Ok(()),
            other => Err(ConfigError::Invalid(format!("unknown log_format {other:?}"))),
        }
    }
}

/// Load config: defaults, then the first config file present, then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |var| std::env::var(var).ok())?;
    c.validate()?;
    Ok(c)
}

fn apply_env(c: &mut Config, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    if let Some(s) = get("FLOCK_LISTEN_PORT") {
        c.listen_port = s.parse::<u16>().map_err(|_| ConfigError::Env {
            var: "FLOCK_LISTEN_PORT",
            value: s.clone(),
        })?;
    }
    if let Some(s) = get("FLOCK_LOG_LEVEL") {
        c.log_level = s;
    }
    if let Some(s) = get("FLOCK_DATA_DIR") {
        c.store.data_dir = PathBuf::from(s);
    }
    Ok(())
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("FLOCK_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/flock/config.toml"));
    }
    out.push(PathBuf::from("/etc/flock/config.toml"));
    out
}

pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
