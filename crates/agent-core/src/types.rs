//! ============================================================================
//! Core Types for the Fleet Agent
//! ============================================================================
//! Task records, their lifecycle states, and the events that drive a sync
//! cycle. Tasks are persisted with bincode and exported as JSON.
//! ============================================================================

use serde::{Deserialize, Serialize};

/// Kind of administrative work a task asks the device to perform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Download a form definition into the local forms directory
    AddForm,
    /// Download a package artifact and hand it to the host installer
    InstallPackage,
    /// Stored record of a type this build has no handler for.
    /// Never produced by the task list parser.
    Unknown,
}

impl TaskType {
    /// Parse a wire name. Case-sensitive; `Unknown` is not a wire name.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "ADD_FORM" => Some(Self::AddForm),
            "INSTALL_PACKAGE" => Some(Self::InstallPackage),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddForm => "ADD_FORM",
            Self::InstallPackage => "INSTALL_PACKAGE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of device-management work, keyed by the server-assigned id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    /// Correlation name, e.g. the package name of an install
    pub name: Option<String>,
    /// Payload location
    pub url: Option<String>,
    /// Opaque type-specific parameters
    pub extras: Option<String>,
    pub status: TaskStatus,
    /// True once the server has acknowledged `status`
    pub status_synced: bool,
    /// Insertion order within the store (assigned on insert)
    pub seq: u64,
    pub received_at: i64,
    pub updated_at: i64,
}

impl Task {
    /// A freshly parsed task: PENDING, nothing to report yet.
    pub fn new(id: impl Into<String>, task_type: TaskType) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: id.into(),
            task_type,
            name: None,
            url: None,
            extras: None,
            status: TaskStatus::Pending,
            status_synced: true,
            seq: 0,
            received_at: now,
            updated_at: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_extras(mut self, extras: impl Into<String>) -> Self {
        self.extras = Some(extras.into());
        self
    }
}

/// Trigger delivered by the host; each one becomes a single worker job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Server signalled that a new task list is available
    NewTasksAvailable,
    /// Network connectivity changed (handled only when now connected)
    ConnectivityRestored,
    /// Host reports a package was installed
    PackageInstallConfirmed(String),
    /// Device properties changed (informational)
    DevicePropertiesChanged,
    /// Device finished booting
    BootCompleted,
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewTasksAvailable => "new_tasks",
            Self::ConnectivityRestored => "connectivity",
            Self::PackageInstallConfirmed(_) => "package_added",
            Self::DevicePropertiesChanged => "properties_changed",
            Self::BootCompleted => "boot_completed",
        }
    }
}

/// Engine-level failure classes
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Task list parse error: {0}")]
    Parse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Device identity unavailable: {0}")]
    DeviceIdentity(String),

    #[error("Install handoff failed: {0}")]
    Install(String),

    #[error("Not configured: {0}")]
    NotConfigured(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_wire_names_are_case_sensitive() {
        assert_eq!(TaskType::from_wire("ADD_FORM"), Some(TaskType::AddForm));
        assert_eq!(
            TaskType::from_wire("INSTALL_PACKAGE"),
            Some(TaskType::InstallPackage)
        );
        assert_eq!(TaskType::from_wire("add_form"), None);
        assert_eq!(TaskType::from_wire("UNKNOWN"), None);
        assert_eq!(TaskType::from_wire("BOGUS"), None);
    }

    #[test]
    fn test_new_task_is_pending_and_synced() {
        let task = Task::new("1", TaskType::AddForm).with_url("http://x/form.xml");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.status_synced);
        assert_eq!(task.url.as_deref(), Some("http://x/form.xml"));
        assert!(task.name.is_none());
    }

    #[test]
    fn test_status_json_names() {
        let json = serde_json::to_string(&TaskStatus::Success).unwrap();
        assert_eq!(json, "\"SUCCESS\"");
        let json = serde_json::to_string(&TaskType::InstallPackage).unwrap();
        assert_eq!(json, "\"INSTALL_PACKAGE\"");
    }
}
