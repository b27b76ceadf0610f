// ============================================================================
// Test doubles for the transport and platform seams
// ============================================================================

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::platform::{Platform, StorageDir};
use crate::transport::{file_name_for, Transport};
use crate::types::AgentError;

/// Scripted management server
pub struct FakeTransport {
    task_list: Mutex<Result<String, AgentError>>,
    post_ok: AtomicBool,
    files: Mutex<HashSet<String>>,
    stalled: Mutex<HashSet<String>>,
    gets: Mutex<Vec<String>>,
    posts: Mutex<Vec<(String, String)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            task_list: Mutex::new(Err(AgentError::Network("no task list scripted".to_string()))),
            post_ok: AtomicBool::new(true),
            files: Mutex::new(HashSet::new()),
            stalled: Mutex::new(HashSet::new()),
            gets: Mutex::new(Vec::new()),
            posts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_task_list(&self, doc: &str) {
        *self.task_list.lock().unwrap() = Ok(doc.to_string());
    }

    pub fn fail_task_list(&self) {
        *self.task_list.lock().unwrap() = Err(AgentError::Network("connection refused".to_string()));
    }

    pub fn set_post_ok(&self, ok: bool) {
        self.post_ok.store(ok, Ordering::SeqCst);
    }

    /// Make `url` downloadable
    pub fn serve_file(&self, url: &str) {
        self.files.lock().unwrap().insert(url.to_string());
    }

    /// Make downloads of `url` hang forever
    pub fn stall_download(&self, url: &str) {
        self.stalled.lock().unwrap().insert(url.to_string());
    }

    pub fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }

    pub fn posts(&self) -> Vec<(String, String)> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get_text(&self, url: &str) -> Result<String, AgentError> {
        self.gets.lock().unwrap().push(url.to_string());
        self.task_list.lock().unwrap().clone()
    }

    async fn post_document(&self, url: &str, body: String) -> bool {
        self.posts.lock().unwrap().push((url.to_string(), body));
        self.post_ok.load(Ordering::SeqCst)
    }

    async fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, AgentError> {
        let stalled = self.stalled.lock().unwrap().contains(url);
        if stalled {
            std::future::pending::<()>().await;
        }
        if !self.files.lock().unwrap().contains(url) {
            return Err(AgentError::Network(format!("{} unreachable", url)));
        }
        let dest = dest_dir.join(file_name_for(url)?);
        std::fs::write(&dest, url.as_bytes())
            .map_err(|e| AgentError::Storage(e.to_string()))?;
        Ok(dest)
    }
}

/// In-memory host with a scratch data directory
pub struct FakePlatform {
    device_id: String,
    connected: AtomicBool,
    connectivity_reads: AtomicUsize,
    storage_fails: AtomicBool,
    install_fails: AtomicBool,
    installs: Mutex<Vec<PathBuf>>,
    data_dir: tempfile::TempDir,
}

impl FakePlatform {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            connected: AtomicBool::new(true),
            connectivity_reads: AtomicUsize::new(0),
            storage_fails: AtomicBool::new(false),
            install_fails: AtomicBool::new(false),
            installs: Mutex::new(Vec::new()),
            data_dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn connectivity_reads(&self) -> usize {
        self.connectivity_reads.load(Ordering::SeqCst)
    }

    pub fn fail_storage(&self, fail: bool) {
        self.storage_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_install(&self, fail: bool) {
        self.install_fails.store(fail, Ordering::SeqCst);
    }

    pub fn installs(&self) -> Vec<PathBuf> {
        self.installs.lock().unwrap().clone()
    }

    pub fn data_dir(&self) -> &Path {
        self.data_dir.path()
    }
}

impl Platform for FakePlatform {
    fn device_id(&self) -> Result<String, AgentError> {
        Ok(self.device_id.clone())
    }

    fn is_connected(&self) -> bool {
        self.connectivity_reads.fetch_add(1, Ordering::SeqCst);
        self.connected.load(Ordering::SeqCst)
    }

    fn storage_dir(&self, dir: StorageDir) -> Result<PathBuf, AgentError> {
        if self.storage_fails.load(Ordering::SeqCst) {
            return Err(AgentError::Storage("sd card not mounted".to_string()));
        }
        let path = self.data_dir.path().join(dir.dir_name());
        std::fs::create_dir_all(&path).map_err(|e| AgentError::Storage(e.to_string()))?;
        Ok(path)
    }

    fn install_package(&self, artifact: &Path) -> Result<(), AgentError> {
        if self.install_fails.load(Ordering::SeqCst) {
            return Err(AgentError::Install("installer unavailable".to_string()));
        }
        self.installs.lock().unwrap().push(artifact.to_path_buf());
        Ok(())
    }
}
