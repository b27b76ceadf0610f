//! ============================================================================
//! AGENT-CORE: Device task synchronization engine
//! ============================================================================
//! This crate handles all backend logic for the fleet agent:
//! - Task list fetch, parse and idempotent merge into a redb store
//! - Task execution (form downloads, package installs) with retry-on-failure
//! - Status update reporting with synced-flag bookkeeping
//! - Single-consumer worker queue with per-job timeouts
//! ============================================================================

pub mod config;
pub mod db;
pub mod executor;
pub mod platform;
pub mod registration;
pub mod status_report;
pub mod sync;
pub mod tasklist;
pub mod transport;
pub mod types;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::AgentConfig;
pub use db::{AgentDb, DbStats};
pub use executor::TaskExecutor;
pub use platform::{HostPlatform, Platform, StorageDir};
pub use registration::DeviceRegistrar;
pub use status_report::StatusReport;
pub use sync::SyncController;
pub use tasklist::{parse_task_list, task_list_url};
pub use transport::{HttpTransport, Transport};
pub use types::*;
pub use worker::{JobHandler, Worker, WorkerHandle, WorkerStats};
