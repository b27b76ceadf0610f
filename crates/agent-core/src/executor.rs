//! ============================================================================
//! Task Executor - Runs one task and decides its next status
//! ============================================================================
//! - ADD_FORM: download the form into the forms directory
//! - INSTALL_PACKAGE: download the artifact, then hand it to the installer
//! - anything else: FAILED, since it can never become runnable
//!
//! Any download, storage or handoff failure leaves the task PENDING so a
//! later cycle retries it. The executor never gives up on a transient error.
//! ============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::platform::{Platform, StorageDir};
use crate::transport::Transport;
use crate::types::{AgentError, Task, TaskStatus, TaskType};

/// Executor for device-management tasks
pub struct TaskExecutor {
    transport: Arc<dyn Transport>,
    platform: Arc<dyn Platform>,
}

impl TaskExecutor {
    pub fn new(transport: Arc<dyn Transport>, platform: Arc<dyn Platform>) -> Self {
        Self {
            transport,
            platform,
        }
    }

    /// Attempt a task, returning the status it should move to.
    pub async fn attempt(&self, task: &Task) -> TaskStatus {
        info!(
            "Attempting task {} (type: {}, url: {:?})",
            task.id,
            task.task_type.as_str(),
            task.url
        );

        match task.task_type {
            TaskType::AddForm => self.attempt_add_form(task).await,
            TaskType::InstallPackage => self.attempt_install_package(task).await,
            TaskType::Unknown => {
                warn!("Task {}: unrecognized task type", task.id);
                TaskStatus::Failed
            }
        }
    }

    async fn attempt_add_form(&self, task: &Task) -> TaskStatus {
        match self.fetch_payload(task, StorageDir::Forms).await {
            Ok(path) => {
                info!("Task {}: form downloaded to {}", task.id, path.display());
                TaskStatus::Success
            }
            Err(e) => {
                warn!("Task {}: form download failed, will retry: {}", task.id, e);
                TaskStatus::Pending
            }
        }
    }

    async fn attempt_install_package(&self, task: &Task) -> TaskStatus {
        let artifact = match self.fetch_payload(task, StorageDir::Packages).await {
            Ok(path) => path,
            Err(e) => {
                warn!("Task {}: package download failed, will retry: {}", task.id, e);
                return TaskStatus::Pending;
            }
        };

        if let Err(e) = self.platform.install_package(&artifact) {
            warn!("Task {}: install handoff failed, will retry: {}", task.id, e);
            return TaskStatus::Pending;
        }

        match &task.name {
            // Nothing to correlate a confirmation with; assume the install went through.
            None => {
                info!("Task {}: install started, no package name to confirm", task.id);
                TaskStatus::Success
            }
            Some(name) => {
                info!("Task {}: install started, awaiting confirmation for {}", task.id, name);
                TaskStatus::Pending
            }
        }
    }

    async fn fetch_payload(&self, task: &Task, dir: StorageDir) -> Result<PathBuf, AgentError> {
        let dest_dir = self.platform.storage_dir(dir)?;
        let url = task
            .url
            .as_deref()
            .ok_or_else(|| AgentError::Network("task has no url".to_string()))?;
        self.transport.download(url, &dest_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePlatform, FakeTransport};

    const FORM_URL: &str = "http://server/forms/survey.xml";
    const APK_URL: &str = "http://server/apps/app.apk";
    const DEAD_URL: &str = "http://unreachable/payload.bin";

    fn executor() -> (TaskExecutor, Arc<FakeTransport>, Arc<FakePlatform>) {
        let transport = Arc::new(FakeTransport::new());
        transport.serve_file(FORM_URL);
        transport.serve_file(APK_URL);
        let platform = Arc::new(FakePlatform::new("imei-1"));
        let exec = TaskExecutor::new(transport.clone(), platform.clone());
        (exec, transport, platform)
    }

    #[tokio::test]
    async fn test_add_form_success() {
        let (exec, _transport, platform) = executor();
        let task = Task::new("1", TaskType::AddForm).with_url(FORM_URL);

        assert_eq!(exec.attempt(&task).await, TaskStatus::Success);
        assert!(platform.data_dir().join("forms").join("survey.xml").is_file());
    }

    #[tokio::test]
    async fn test_unreachable_url_stays_pending_for_every_known_type() {
        let (exec, _transport, platform) = executor();

        let form = Task::new("1", TaskType::AddForm).with_url(DEAD_URL);
        assert_eq!(exec.attempt(&form).await, TaskStatus::Pending);

        let named = Task::new("2", TaskType::InstallPackage)
            .with_name("com.example.app")
            .with_url(DEAD_URL);
        assert_eq!(exec.attempt(&named).await, TaskStatus::Pending);

        let unnamed = Task::new("3", TaskType::InstallPackage).with_url(DEAD_URL);
        assert_eq!(exec.attempt(&unnamed).await, TaskStatus::Pending);

        assert!(platform.installs().is_empty());
    }

    #[tokio::test]
    async fn test_missing_url_stays_pending() {
        let (exec, _transport, _platform) = executor();
        let task = Task::new("1", TaskType::AddForm);
        assert_eq!(exec.attempt(&task).await, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_type_fails() {
        let (exec, _transport, _platform) = executor();
        let task = Task::new("1", TaskType::Unknown).with_url(FORM_URL);
        assert_eq!(exec.attempt(&task).await, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_storage_dir_failure_stays_pending() {
        let (exec, _transport, platform) = executor();
        platform.fail_storage(true);

        let task = Task::new("1", TaskType::AddForm).with_url(FORM_URL);
        assert_eq!(exec.attempt(&task).await, TaskStatus::Pending);
        let task = Task::new("2", TaskType::InstallPackage).with_url(APK_URL);
        assert_eq!(exec.attempt(&task).await, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_install_with_name_waits_for_confirmation() {
        let (exec, _transport, platform) = executor();
        let task = Task::new("1", TaskType::InstallPackage)
            .with_name("com.example.app")
            .with_url(APK_URL);

        assert_eq!(exec.attempt(&task).await, TaskStatus::Pending);
        let installs = platform.installs();
        assert_eq!(installs.len(), 1);
        assert!(installs[0].ends_with("packages/app.apk"));
    }

    #[tokio::test]
    async fn test_install_without_name_is_optimistic_success() {
        let (exec, _transport, platform) = executor();
        let task = Task::new("1", TaskType::InstallPackage).with_url(APK_URL);

        assert_eq!(exec.attempt(&task).await, TaskStatus::Success);
        assert_eq!(platform.installs().len(), 1);
    }

    #[tokio::test]
    async fn test_install_handoff_failure_stays_pending() {
        let (exec, _transport, platform) = executor();
        platform.fail_install(true);

        let task = Task::new("1", TaskType::InstallPackage).with_url(APK_URL);
        assert_eq!(exec.attempt(&task).await, TaskStatus::Pending);
    }
}
