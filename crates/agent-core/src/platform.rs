//! ============================================================================
//! Platform - Host services the agent depends on
//! ============================================================================
//! Device identity, connectivity, payload storage directories and the
//! package installer handoff. `HostPlatform` is the implementation used by
//! the CLI host; tests provide their own.
//! ============================================================================

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::types::AgentError;

/// Where the machine identity is read from when none is configured
const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Local payload directories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageDir {
    Forms,
    Packages,
}

impl StorageDir {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Forms => "forms",
            Self::Packages => "packages",
        }
    }
}

/// Host services consumed by the executor and sync controller
pub trait Platform: Send + Sync {
    /// Stable hardware identity of this device
    fn device_id(&self) -> Result<String, AgentError>;

    /// Whether the device currently has network connectivity
    fn is_connected(&self) -> bool;

    /// Resolve (creating if needed) a local payload directory
    fn storage_dir(&self, dir: StorageDir) -> Result<PathBuf, AgentError>;

    /// Hand a downloaded package to the host installer. Returns once the
    /// handoff is made; the install itself completes out of band.
    fn install_package(&self, artifact: &Path) -> Result<(), AgentError>;
}

/// Platform backed by the local machine
pub struct HostPlatform {
    device_id: Option<String>,
    data_dir: PathBuf,
    install_command: Option<String>,
    connected: AtomicBool,
}

impl HostPlatform {
    pub fn new(
        device_id: Option<String>,
        data_dir: PathBuf,
        install_command: Option<String>,
    ) -> Self {
        Self {
            device_id,
            data_dir,
            install_command,
            connected: AtomicBool::new(true),
        }
    }

    /// Record a connectivity change reported by the host
    pub fn set_connected(&self, connected: bool) {
        info!("Connectivity: {}", if connected { "online" } else { "offline" });
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Platform for HostPlatform {
    fn device_id(&self) -> Result<String, AgentError> {
        if let Some(id) = &self.device_id {
            return Ok(id.clone());
        }

        let id = std::fs::read_to_string(MACHINE_ID_PATH)
            .map_err(|e| AgentError::DeviceIdentity(format!("{}: {}", MACHINE_ID_PATH, e)))?;
        let id = id.trim();
        if id.is_empty() {
            return Err(AgentError::DeviceIdentity(format!("{} is empty", MACHINE_ID_PATH)));
        }
        Ok(id.to_string())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn storage_dir(&self, dir: StorageDir) -> Result<PathBuf, AgentError> {
        let path = self.data_dir.join(dir.dir_name());
        std::fs::create_dir_all(&path)
            .map_err(|e| AgentError::Storage(format!("Cannot create {}: {}", path.display(), e)))?;
        Ok(path)
    }

    fn install_package(&self, artifact: &Path) -> Result<(), AgentError> {
        let command = self
            .install_command
            .as_deref()
            .ok_or_else(|| AgentError::NotConfigured("no install command".to_string()))?;

        debug!("Launching installer: {} {}", command, artifact.display());

        // Detached: the installer runs out of band and reports back through
        // a package-added event.
        tokio::process::Command::new(command)
            .arg(artifact)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AgentError::Install(format!("{}: {}", command, e)))?;

        info!("Install handed off for {}", artifact.display());
        Ok(())
    }
}
