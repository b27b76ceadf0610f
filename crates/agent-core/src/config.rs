//! Agent configuration, read from the environment (`.env` is loaded by the host).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Host-level settings for one agent instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Seeds the stored server URL when none has been set yet
    pub server_url: Option<String>,
    /// Database path (None: FLEET_DB_PATH or ~/.fleet-agent/agent.redb)
    pub db_path: Option<String>,
    /// Root of the forms/ and packages/ payload directories
    pub data_dir: PathBuf,
    /// Device identity override
    pub device_id: Option<String>,
    /// Maximum wall-clock time for one sync job
    pub job_timeout_secs: u64,
    pub http_timeout_secs: u64,
    /// Program handed a downloaded package path to install it
    pub install_command: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: env_string("FLEET_SERVER_URL"),
            db_path: env_string("FLEET_DB_PATH"),
            data_dir: env_string("FLEET_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_data_dir),
            device_id: env_string("FLEET_DEVICE_ID"),
            job_timeout_secs: env_u64("FLEET_JOB_TIMEOUT_SECS", DEFAULT_JOB_TIMEOUT_SECS),
            http_timeout_secs: env_u64("FLEET_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS),
            install_command: env_string("FLEET_INSTALL_COMMAND"),
        }
    }
}

impl AgentConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".fleet-agent")
        .join("data")
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    match env_string(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}, using {}", key, raw, default);
            default
        }),
        None => default,
    }
}
