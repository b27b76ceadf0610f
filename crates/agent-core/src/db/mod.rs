// ============================================================================
// AgentDb - Embedded Database (redb)
// ============================================================================
// Durable task store and preference table for the sync engine.
// Default path: ~/.fleet-agent/agent.redb (override via FLEET_DB_PATH env var)
//
// Only the worker's single consumer writes here, so every operation runs in
// its own transaction and is durable when it returns.
// ============================================================================

pub mod types;

pub use types::{DbStats, PREF_NEW_TASKS_PENDING, PREF_REGISTERED_DEVICE_ID, PREF_SERVER_URL};

use anyhow::{anyhow, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::types::{Task, TaskStatus};

// Table definitions
const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");
const PREFS: TableDefinition<&str, &[u8]> = TableDefinition::new("prefs");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_SEQ_KEY: &str = "next_task_seq";

/// Embedded database for the fleet agent
pub struct AgentDb {
    db: Database,
    path: PathBuf,
}

impl AgentDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses FLEET_DB_PATH env var or ~/.fleet-agent/agent.redb
    pub fn open(path: Option<&str>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("FLEET_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            let agent_dir = home.join(".fleet-agent");
            std::fs::create_dir_all(&agent_dir)
                .map_err(|e| anyhow!("Failed to create .fleet-agent directory: {}", e))?;
            agent_dir.join("agent.redb")
        };

        info!("Opening database at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open database: {}", e))?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let _ = write_txn.open_table(TASKS).map_err(|e| anyhow!("Failed to create tasks table: {}", e))?;
            let _ = write_txn.open_table(PREFS).map_err(|e| anyhow!("Failed to create prefs table: {}", e))?;
            let _ = write_txn.open_table(META).map_err(|e| anyhow!("Failed to create meta table: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        info!("Database ready");

        Ok(Self { db, path: db_path })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Task Operations
    // ========================================================================

    /// Insert a task unless its id is already known.
    /// Returns true if a new row was added; an existing row is left untouched.
    pub fn insert_task(&self, task: &Task) -> Result<bool> {
        Ok(self.insert_tasks(std::slice::from_ref(task))? == 1)
    }

    /// Merge a batch of tasks in one transaction. Either every new task is
    /// stored or none is. Returns the number of tasks that were new.
    pub fn insert_tasks(&self, tasks: &[Task]) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let mut added = 0;
        {
            let mut table = write_txn.open_table(TASKS)
                .map_err(|e| anyhow!("Failed to open tasks table: {}", e))?;
            let mut meta = write_txn.open_table(META)
                .map_err(|e| anyhow!("Failed to open meta table: {}", e))?;

            let mut next_seq = meta.get(NEXT_SEQ_KEY)
                .map_err(|e| anyhow!("Failed to read task sequence: {}", e))?
                .map(|v| v.value())
                .unwrap_or(0);

            for task in tasks {
                let key = task_key(&task.id);
                let exists = table.get(key.as_str())
                    .map_err(|e| anyhow!("Failed to get task: {}", e))?
                    .is_some();
                if exists {
                    debug!("Task {} already known, skipping", task.id);
                    continue;
                }

                let mut record = task.clone();
                record.seq = next_seq;
                record.received_at = now;
                record.updated_at = now;
                next_seq += 1;

                let value = bincode::serialize(&record)
                    .map_err(|e| anyhow!("Failed to serialize task: {}", e))?;
                table.insert(key.as_str(), value.as_slice())
                    .map_err(|e| anyhow!("Failed to insert task: {}", e))?;
                added += 1;
            }

            meta.insert(NEXT_SEQ_KEY, next_seq)
                .map_err(|e| anyhow!("Failed to store task sequence: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Inserted {} of {} tasks", added, tasks.len());
        Ok(added)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let key = task_key(task_id);

        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(TASKS)
            .map_err(|e| anyhow!("Failed to open tasks table: {}", e))?;

        match table.get(key.as_str()).map_err(|e| anyhow!("Failed to get task: {}", e))? {
            Some(value) => {
                let task: Task = bincode::deserialize(value.value())
                    .map_err(|e| anyhow!("Failed to deserialize task: {}", e))?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// All tasks in insertion order, optionally filtered by status.
    pub fn list_tasks(&self, status_filter: Option<TaskStatus>) -> Result<Vec<Task>> {
        let mut results = self.scan_tasks(|task| match status_filter {
            Some(status) => task.status == status,
            None => true,
        })?;
        results.sort_by_key(|t| t.seq);
        Ok(results)
    }

    /// Tasks still waiting to be attempted.
    pub fn pending_tasks(&self) -> Result<Vec<Task>> {
        self.list_tasks(Some(TaskStatus::Pending))
    }

    /// Tasks whose current status the server has not acknowledged, any status.
    pub fn unsynced_tasks(&self) -> Result<Vec<Task>> {
        let mut results = self.scan_tasks(|task| !task.status_synced)?;
        results.sort_by_key(|t| t.seq);
        Ok(results)
    }

    /// Record a new status. The change is unreported until a status update
    /// round trip succeeds, so the synced flag is cleared.
    pub fn set_task_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        self.update_task(task_id, |task| {
            task.status = status;
            task.status_synced = false;
        })?;
        debug!("Updated task {} status to {}", task_id, status);
        Ok(())
    }

    /// Update only the synced flag.
    pub fn set_task_synced(&self, task_id: &str, synced: bool) -> Result<()> {
        self.update_task(task_id, |task| task.status_synced = synced)?;
        debug!("Updated task {} synced to {}", task_id, synced);
        Ok(())
    }

    fn update_task(&self, task_id: &str, apply: impl FnOnce(&mut Task)) -> Result<()> {
        let key = task_key(task_id);

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(TASKS)
                .map_err(|e| anyhow!("Failed to open tasks table: {}", e))?;

            let mut task: Task = {
                let value = table.get(key.as_str())
                    .map_err(|e| anyhow!("Failed to get task: {}", e))?
                    .ok_or_else(|| anyhow!("Task not found: {}", task_id))?;
                let task: Task = bincode::deserialize(value.value())
                    .map_err(|e| anyhow!("Failed to deserialize task: {}", e))?;
                task
            };

            apply(&mut task);
            task.updated_at = chrono::Utc::now().timestamp();

            let value = bincode::serialize(&task)
                .map_err(|e| anyhow!("Failed to serialize task: {}", e))?;
            table.insert(key.as_str(), value.as_slice())
                .map_err(|e| anyhow!("Failed to update task: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(())
    }

    fn scan_tasks(&self, keep: impl Fn(&Task) -> bool) -> Result<Vec<Task>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(TASKS)
            .map_err(|e| anyhow!("Failed to open tasks table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate tasks: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let task: Task = bincode::deserialize(value.value())
                .map_err(|e| anyhow!("Failed to deserialize task: {}", e))?;
            if keep(&task) {
                results.push(task);
            }
        }
        Ok(results)
    }

    // ========================================================================
    // Preference Operations
    // ========================================================================

    pub fn get_pref<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(PREFS)
            .map_err(|e| anyhow!("Failed to open prefs table: {}", e))?;

        match table.get(key).map_err(|e| anyhow!("Failed to get pref {}: {}", key, e))? {
            Some(value) => {
                let pref: T = bincode::deserialize(value.value())
                    .map_err(|e| anyhow!("Failed to deserialize pref {}: {}", key, e))?;
                Ok(Some(pref))
            }
            None => Ok(None),
        }
    }

    pub fn set_pref<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = bincode::serialize(value)
            .map_err(|e| anyhow!("Failed to serialize pref {}: {}", key, e))?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(PREFS)
                .map_err(|e| anyhow!("Failed to open prefs table: {}", e))?;
            table.insert(key, value.as_slice())
                .map_err(|e| anyhow!("Failed to insert pref {}: {}", key, e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored pref: {}", key);
        Ok(())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self.get_pref::<bool>(key)?.unwrap_or(default))
    }

    pub fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set_pref(key, &value)
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.get_pref::<String>(key)
    }

    pub fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.set_pref(key, &value.to_string())
    }

    /// Trigger Flag: a task list fetch is owed.
    pub fn new_tasks_pending(&self) -> Result<bool> {
        self.get_bool(PREF_NEW_TASKS_PENDING, false)
    }

    pub fn set_new_tasks_pending(&self, pending: bool) -> Result<()> {
        self.set_bool(PREF_NEW_TASKS_PENDING, pending)
    }

    pub fn server_url(&self) -> Result<Option<String>> {
        self.get_string(PREF_SERVER_URL)
    }

    pub fn set_server_url(&self, url: &str) -> Result<()> {
        self.set_string(PREF_SERVER_URL, url)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<DbStats> {
        let all_tasks = self.list_tasks(None)?;

        let mut task_counts = HashMap::new();
        for task in &all_tasks {
            *task_counts.entry(task.status.to_string()).or_insert(0usize) += 1;
        }

        Ok(DbStats {
            total_tasks: all_tasks.len(),
            task_counts,
            unsynced_tasks: all_tasks.iter().filter(|t| !t.status_synced).count(),
        })
    }
}

fn task_key(task_id: &str) -> String {
    format!("tasks:{}", task_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;

    fn test_db() -> (AgentDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.redb");
        let db = AgentDb::open(Some(path.to_str().unwrap())).unwrap();
        (db, dir)
    }

    #[test]
    fn test_insert_is_idempotent() {
        let (db, _dir) = test_db();

        let task = Task::new("1", TaskType::AddForm).with_url("http://server/form.xml");
        assert!(db.insert_task(&task).unwrap());

        let duplicate = Task::new("1", TaskType::InstallPackage).with_name("com.other");
        assert!(!db.insert_task(&duplicate).unwrap());

        let all = db.list_tasks(None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].task_type, TaskType::AddForm);
        assert_eq!(all[0].url.as_deref(), Some("http://server/form.xml"));
        assert!(all[0].name.is_none());
    }

    #[test]
    fn test_insert_tasks_counts_only_new() {
        let (db, _dir) = test_db();
        db.insert_task(&Task::new("a", TaskType::AddForm)).unwrap();

        let batch = vec![
            Task::new("a", TaskType::AddForm),
            Task::new("b", TaskType::AddForm),
            Task::new("c", TaskType::InstallPackage),
        ];
        assert_eq!(db.insert_tasks(&batch).unwrap(), 2);
        assert_eq!(db.insert_tasks(&batch).unwrap(), 0);
        assert_eq!(db.list_tasks(None).unwrap().len(), 3);
    }

    #[test]
    fn test_list_follows_insertion_order() {
        let (db, _dir) = test_db();
        for id in ["z", "m", "a"] {
            db.insert_task(&Task::new(id, TaskType::AddForm)).unwrap();
        }
        let ids: Vec<_> = db.pending_tasks().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["z", "m", "a"]);
    }

    #[test]
    fn test_set_status_clears_synced() {
        let (db, _dir) = test_db();
        db.insert_task(&Task::new("1", TaskType::AddForm)).unwrap();
        assert!(db.unsynced_tasks().unwrap().is_empty());

        db.set_task_status("1", TaskStatus::Success).unwrap();

        let task = db.get_task("1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert!(!task.status_synced);
        assert!(db.pending_tasks().unwrap().is_empty());
        assert_eq!(db.unsynced_tasks().unwrap().len(), 1);

        db.set_task_synced("1", true).unwrap();
        let task = db.get_task("1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert!(task.status_synced);
        assert!(db.unsynced_tasks().unwrap().is_empty());
    }

    #[test]
    fn test_unsynced_includes_pending_status_changes() {
        let (db, _dir) = test_db();
        db.insert_task(&Task::new("1", TaskType::AddForm)).unwrap();
        db.set_task_status("1", TaskStatus::Pending).unwrap();

        let unsynced = db.unsynced_tasks().unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].status, TaskStatus::Pending);
    }

    #[test]
    fn test_update_missing_task_errors() {
        let (db, _dir) = test_db();
        assert!(db.set_task_status("nope", TaskStatus::Failed).is_err());
        assert!(db.set_task_synced("nope", true).is_err());
    }

    #[test]
    fn test_prefs_roundtrip_and_defaults() {
        let (db, _dir) = test_db();
        assert!(!db.new_tasks_pending().unwrap());
        assert!(db.server_url().unwrap().is_none());

        db.set_new_tasks_pending(true).unwrap();
        db.set_server_url("http://manage.example.org/").unwrap();

        assert!(db.new_tasks_pending().unwrap());
        assert_eq!(
            db.server_url().unwrap().as_deref(),
            Some("http://manage.example.org/")
        );
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.redb");
        {
            let db = AgentDb::open(Some(path.to_str().unwrap())).unwrap();
            db.insert_task(&Task::new("1", TaskType::AddForm)).unwrap();
            db.set_new_tasks_pending(true).unwrap();
        }
        let db = AgentDb::open(Some(path.to_str().unwrap())).unwrap();
        assert!(db.get_task("1").unwrap().is_some());
        assert!(db.new_tasks_pending().unwrap());

        // Sequence keeps counting after reopen
        db.insert_task(&Task::new("2", TaskType::AddForm)).unwrap();
        assert_eq!(db.get_task("2").unwrap().unwrap().seq, 1);
    }

    #[test]
    fn test_stats() {
        let (db, _dir) = test_db();
        db.insert_task(&Task::new("1", TaskType::AddForm)).unwrap();
        db.insert_task(&Task::new("2", TaskType::AddForm)).unwrap();
        db.set_task_status("2", TaskStatus::Failed).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.total_tasks, 2);
        assert_eq!(stats.task_counts.get("PENDING"), Some(&1));
        assert_eq!(stats.task_counts.get("FAILED"), Some(&1));
        assert_eq!(stats.unsynced_tasks, 1);
    }
}
