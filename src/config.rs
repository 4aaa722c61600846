use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Config {
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PlatformConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_log")]
    pub log: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log: default_log(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    "./data".into()
}

fn default_log() -> String {
    "stagehand=info".to_owned()
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> SocketAddr {
    ([127, 0, 0, 1], 7700).into()
}

#[derive(Debug, Deserialize)]
pub(crate) struct SupervisorConfig {
    #[serde(default = "default_start_port")]
    pub start_port: u16,
    #[serde(default = "default_restart_max")]
    pub auto_restart_max: u32,
    #[serde(default = "default_restart_window_secs")]
    pub auto_restart_window_secs: u64,
    #[serde(default = "default_log_max_size_mib")]
    pub log_max_size_mib: u64,
    #[serde(default = "default_log_max_files")]
    pub log_max_files: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            start_port: default_start_port(),
            auto_restart_max: default_restart_max(),
            auto_restart_window_secs: default_restart_window_secs(),
            log_max_size_mib: default_log_max_size_mib(),
            log_max_files: default_log_max_files(),
        }
    }
}

fn default_start_port() -> u16 {
    5200
}

fn default_restart_max() -> u32 {
    5
}

fn default_restart_window_secs() -> u64 {
    60
}

fn default_log_max_size_mib() -> u64 {
    10
}

fn default_log_max_files() -> u32 {
    5
}

impl SupervisorConfig {
    pub fn log_max_size_bytes(&self) -> u64 {
        self.log_max_size_mib * 1024 * 1024
    }
}

/// Reads the environment-variable overrides named in the external
/// interfaces section, layering them over whatever `Config` loaded from
/// TOML. Environment variables win; an unset or unparsable variable leaves
/// the TOML-derived (or default) value untouched.
pub(crate) fn apply_env_overrides(mut cfg: Config) -> Config {
    if let Some(v) = parse_env("PAAS_START_PORT") {
        cfg.supervisor.start_port = v;
    }
    if let Some(v) = parse_env("PAAS_AUTO_RESTART_MAX") {
        cfg.supervisor.auto_restart_max = v;
    }
    if let Some(v) = parse_env("PAAS_AUTO_RESTART_WINDOW_SECS") {
        cfg.supervisor.auto_restart_window_secs = v;
    }
    if let Some(v) = parse_env("PAAS_LOG_MAX_SIZE_MIB") {
        cfg.supervisor.log_max_size_mib = v;
    }
    if let Some(v) = parse_env("PAAS_LOG_MAX_FILES") {
        cfg.supervisor.log_max_files = v;
    }
    if let Ok(v) = std::env::var("PAAS_DATA_DIR") {
        cfg.platform.data_dir = v.into();
    }
    if let Some(v) = parse_env("PAAS_BIND") {
        cfg.server.bind = v;
    }
    if let Ok(v) = std::env::var("PAAS_LOG") {
        cfg.platform.log = v;
    }
    cfg
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
