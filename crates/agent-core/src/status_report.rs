//! ============================================================================
//! Status Report - Outbound status update document
//! ============================================================================
//! Collects (task id, status) pairs for one sync cycle and renders them as
//! the document POSTed to the server. Building and sending are separate so a
//! failed send simply drops the report; the next cycle rebuilds it from the
//! store's unsynced set.
//! ============================================================================

use anyhow::{anyhow, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use std::io::Cursor;

use crate::types::{Task, TaskStatus};

/// Server path status updates are POSTed to
pub const UPDATE_PATH: &str = "update";

/// One entry of a status report
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    pub task_id: String,
    pub status: TaskStatus,
}

/// Status update for a single sync cycle. Never persisted.
#[derive(Debug, Clone)]
pub struct StatusReport {
    device_id: String,
    entries: Vec<StatusEntry>,
}

impl StatusReport {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn add_task(&mut self, task: &Task) {
        self.entries.push(StatusEntry {
            task_id: task.id.clone(),
            status: task.status,
        });
    }

    pub fn entries(&self) -> &[StatusEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the report:
    /// `<statusupdate imei=".."><task id=".." status=".."/>..</statusupdate>`
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(|e| anyhow!("Failed to write declaration: {}", e))?;

        let root = BytesStart::new("statusupdate")
            .with_attributes([("imei", self.device_id.as_str())]);
        writer
            .write_event(Event::Start(root))
            .map_err(|e| anyhow!("Failed to write report root: {}", e))?;

        for entry in &self.entries {
            let el = BytesStart::new("task").with_attributes([
                ("id", entry.task_id.as_str()),
                ("status", entry.status.as_str()),
            ]);
            writer
                .write_event(Event::Empty(el))
                .map_err(|e| anyhow!("Failed to write entry {}: {}", entry.task_id, e))?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("statusupdate")))
            .map_err(|e| anyhow!("Failed to close report: {}", e))?;

        String::from_utf8(writer.into_inner().into_inner())
            .map_err(|e| anyhow!("Report is not UTF-8: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;

    fn task_with_status(id: &str, status: TaskStatus) -> Task {
        let mut task = Task::new(id, TaskType::AddForm);
        task.status = status;
        task.status_synced = false;
        task
    }

    #[test]
    fn test_report_lists_every_entry() {
        let mut report = StatusReport::new("356938035643809");
        report.add_task(&task_with_status("1", TaskStatus::Success));
        report.add_task(&task_with_status("2", TaskStatus::Failed));
        report.add_task(&task_with_status("3", TaskStatus::Pending));
        assert_eq!(report.len(), 3);

        let xml = report.to_xml().unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<statusupdate imei=\"356938035643809\">"));
        assert!(xml.contains("<task id=\"1\" status=\"SUCCESS\"/>"));
        assert!(xml.contains("<task id=\"2\" status=\"FAILED\"/>"));
        assert!(xml.contains("<task id=\"3\" status=\"PENDING\"/>"));
        assert!(xml.ends_with("</statusupdate>"));
    }

    #[test]
    fn test_attribute_values_are_escaped() {
        let mut report = StatusReport::new("dev\"1");
        report.add_task(&task_with_status("a&b<c>", TaskStatus::Success));

        let xml = report.to_xml().unwrap();
        assert!(xml.contains("imei=\"dev&quot;1\""));
        assert!(xml.contains("id=\"a&amp;b&lt;c&gt;\""));
    }

    #[test]
    fn test_empty_report_is_still_well_formed() {
        let report = StatusReport::new("42");
        assert!(report.is_empty());
        let xml = report.to_xml().unwrap();
        assert!(xml.contains("<statusupdate imei=\"42\"></statusupdate>"));
    }
}
