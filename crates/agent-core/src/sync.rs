//! ============================================================================
//! Sync Controller - Event-driven task synchronization
//! ============================================================================
//! Each trigger event runs one sequence:
//!
//! ```text
//! registration gate -> [fetch + merge task list] -> process pending -> send status
//! ```
//!
//! | Event                     | Actions                                              |
//! |---------------------------|------------------------------------------------------|
//! | NewTasksAvailable         | set trigger flag; if online: fetch, process, report  |
//! | ConnectivityRestored      | if online: fetch if flagged, process, report         |
//! | PackageInstallConfirmed   | mark matching install SUCCESS; if online: report     |
//! | DevicePropertiesChanged   | log only                                             |
//! | BootCompleted             | log only                                             |
//!
//! Failures never escape a sequence. Network and parse errors leave the
//! trigger flag and task statuses as they were so the next event retries.
//! ============================================================================

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::db::AgentDb;
use crate::executor::TaskExecutor;
use crate::platform::Platform;
use crate::registration::DeviceRegistrar;
use crate::status_report::{StatusReport, UPDATE_PATH};
use crate::tasklist::{parse_task_list, task_list_url};
use crate::transport::{endpoint, Transport};
use crate::types::{AgentError, SyncEvent, TaskStatus, TaskType};
use crate::worker::JobHandler;

/// Orchestrates fetch, execution and status reporting for one device.
/// Collaborators are injected by the hosting process.
pub struct SyncController {
    db: Arc<AgentDb>,
    transport: Arc<dyn Transport>,
    platform: Arc<dyn Platform>,
    executor: TaskExecutor,
    registrar: DeviceRegistrar,
}

impl SyncController {
    pub fn new(db: Arc<AgentDb>, transport: Arc<dyn Transport>, platform: Arc<dyn Platform>) -> Self {
        Self {
            executor: TaskExecutor::new(transport.clone(), platform.clone()),
            registrar: DeviceRegistrar::new(db.clone(), transport.clone()),
            db,
            transport,
            platform,
        }
    }

    pub fn db(&self) -> &Arc<AgentDb> {
        &self.db
    }

    /// Run the full handling sequence for one event.
    pub async fn handle_event(&self, event: &SyncEvent) {
        info!("Handling sync event: {}", event.kind());

        let device_id = match self.platform.device_id() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("{}", e);
                None
            }
        };

        let connected = self.platform.is_connected();
        debug!("Connected: {}", connected);

        self.sync_device_registration(device_id.as_deref(), connected).await;

        match event {
            SyncEvent::NewTasksAvailable => {
                // Remember the owed fetch in case it cannot happen now
                if let Err(e) = self.db.set_new_tasks_pending(true) {
                    error!("Failed to set new tasks flag: {}", e);
                }
                if connected {
                    self.fetch_process_report(device_id.as_deref(), true).await;
                }
            }
            SyncEvent::ConnectivityRestored => {
                if connected {
                    let owed = match self.db.new_tasks_pending() {
                        Ok(flag) => flag,
                        Err(e) => {
                            error!("Failed to read new tasks flag: {}", e);
                            false
                        }
                    };
                    self.fetch_process_report(device_id.as_deref(), owed).await;
                }
            }
            SyncEvent::PackageInstallConfirmed(package_name) => {
                if let Err(e) = self.handle_package_added(package_name) {
                    error!("Failed to record install of {}: {}", package_name, e);
                }
                if connected {
                    self.report(device_id.as_deref()).await;
                }
            }
            SyncEvent::DevicePropertiesChanged => {
                debug!("Device properties changed");
            }
            SyncEvent::BootCompleted => {
                debug!("Boot completed");
            }
        }
    }

    async fn fetch_process_report(&self, device_id: Option<&str>, fetch: bool) {
        if fetch {
            match device_id {
                Some(id) => match self.request_new_tasks(id).await {
                    Ok(added) => info!("{} new tasks were added", added),
                    Err(e) => warn!("Task list fetch failed, will retry: {}", e),
                },
                None => warn!("Skipping task list fetch: no device identity"),
            }
        }

        match self.process_pending_tasks().await {
            Ok(processed) => debug!("Processed {} pending tasks", processed),
            Err(e) => error!("Processing pending tasks stopped: {}", e),
        }

        self.report(device_id).await;
    }

    async fn report(&self, device_id: Option<&str>) {
        let Some(id) = device_id else {
            warn!("Skipping status update: no device identity");
            return;
        };
        match self.send_status_updates(id).await {
            Ok(true) => {}
            Ok(false) => info!("Status update not delivered, will retry"),
            Err(e) => warn!("Status update failed: {}", e),
        }
    }

    async fn sync_device_registration(&self, device_id: Option<&str>, connected: bool) {
        let Some(id) = device_id else { return };

        match self.registrar.registration_needed(id) {
            Ok(false) => {}
            Ok(true) => {
                if !connected {
                    debug!("Registration needed but offline");
                    return;
                }
                let base_url = match self.server_url() {
                    Ok(url) => url,
                    Err(e) => {
                        warn!("Cannot register device: {}", e);
                        return;
                    }
                };
                info!("Registering device {}", id);
                if let Err(e) = self.registrar.register(&base_url, id).await {
                    warn!("Device registration failed: {}", e);
                }
            }
            Err(e) => error!("Failed to check registration: {}", e),
        }
    }

    /// Fetch this device's task list and merge it into the store.
    /// The trigger flag is cleared only when fetch, parse and merge all
    /// succeed; any failure leaves the store untouched.
    pub async fn request_new_tasks(&self, device_id: &str) -> Result<usize, AgentError> {
        info!("Requesting new tasks");

        let base_url = self.server_url()?;
        let url = task_list_url(&base_url, device_id);
        info!("Task list url: {}", url);

        let doc = self.transport.get_text(&url).await?;
        let tasks = parse_task_list(&doc)?;

        let added = self
            .db
            .insert_tasks(&tasks)
            .map_err(|e| AgentError::Storage(e.to_string()))?;
        self.db
            .set_new_tasks_pending(false)
            .map_err(|e| AgentError::Storage(e.to_string()))?;

        Ok(added)
    }

    /// Attempt every task that was PENDING when the pass started, committing
    /// each result before moving on. Every attempt is persisted, so a task
    /// that stays PENDING is reported again as attempted.
    /// Returns how many tasks were attempted.
    pub async fn process_pending_tasks(&self) -> Result<usize, AgentError> {
        let tasks = self
            .db
            .pending_tasks()
            .map_err(|e| AgentError::Storage(e.to_string()))?;
        debug!("There are {} pending tasks", tasks.len());

        for task in &tasks {
            let status = self.executor.attempt(task).await;
            self.db
                .set_task_status(&task.id, status)
                .map_err(|e| AgentError::Storage(e.to_string()))?;
            info!("Task {} is now {}", task.id, status);
        }

        Ok(tasks.len())
    }

    /// Report every unsynced task. Returns true if the server accepted the
    /// report or there was nothing to report.
    pub async fn send_status_updates(&self, device_id: &str) -> Result<bool, AgentError> {
        let tasks = self
            .db
            .unsynced_tasks()
            .map_err(|e| AgentError::Storage(e.to_string()))?;
        debug!("Tasks with status updates: {}", tasks.len());
        if tasks.is_empty() {
            return Ok(true);
        }

        let mut report = StatusReport::new(device_id);
        for task in &tasks {
            report.add_task(task);
        }
        let body = report
            .to_xml()
            .map_err(|e| AgentError::Parse(e.to_string()))?;

        let base_url = self.server_url()?;
        let success = self
            .transport
            .post_document(&endpoint(&base_url, UPDATE_PATH), body)
            .await;
        info!(
            "Status update message {}successful",
            if success { "" } else { "NOT " }
        );

        if success {
            for task in &tasks {
                self.db
                    .set_task_synced(&task.id, true)
                    .map_err(|e| AgentError::Storage(e.to_string()))?;
            }
        }
        Ok(success)
    }

    /// Mark the first PENDING install task for `package_name` as SUCCESS.
    /// Returns the id of the task that matched, if any.
    pub fn handle_package_added(&self, package_name: &str) -> anyhow::Result<Option<String>> {
        debug!("Package added: {}", package_name);

        let matched = self.db.pending_tasks()?.into_iter().find(|t| {
            t.task_type == TaskType::InstallPackage && t.name.as_deref() == Some(package_name)
        });

        match matched {
            Some(task) => {
                self.db.set_task_status(&task.id, TaskStatus::Success)?;
                info!("Task {} (INSTALL_PACKAGE) successful", task.id);
                Ok(Some(task.id))
            }
            None => {
                debug!("No pending install task for {}", package_name);
                Ok(None)
            }
        }
    }

    fn server_url(&self) -> Result<String, AgentError> {
        match self.db.server_url() {
            Ok(Some(url)) if !url.trim().is_empty() => Ok(url),
            Ok(_) => Err(AgentError::NotConfigured("server url".to_string())),
            Err(e) => Err(AgentError::Storage(e.to_string())),
        }
    }
}

#[async_trait]
impl JobHandler for SyncController {
    async fn run_job(&self, event: SyncEvent) {
        self.handle_event(&event).await;
    }
}
