//! ============================================================================
//! Database Types - Summary records and preference keys for redb storage
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Preference: base URL of the management server
pub const PREF_SERVER_URL: &str = "server_url";

/// Preference: a task list fetch is owed (survives restarts)
pub const PREF_NEW_TASKS_PENDING: &str = "new_tasks_pending";

/// Preference: device identity last registered with the server
pub const PREF_REGISTERED_DEVICE_ID: &str = "registered_device_id";

/// Aggregate view of the task table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub total_tasks: usize,
    /// Task count keyed by status name (PENDING, SUCCESS, FAILED)
    pub task_counts: HashMap<String, usize>,
    /// Tasks whose latest status has not been acknowledged by the server
    pub unsynced_tasks: usize,
}
