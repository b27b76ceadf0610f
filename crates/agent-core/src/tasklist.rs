//! ============================================================================
//! Task List Parser - Server task list document -> Task records
//! ============================================================================
//! The server describes outstanding work as an XML document whose `task`
//! elements carry `id`, `type`, `name`, `url` and `extras` attributes.
//! Entries with an unknown type or no id are skipped; a document that is not
//! well formed fails as a whole so nothing from it is merged.
//! ============================================================================

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, warn};

use crate::transport::endpoint;
use crate::types::{AgentError, Task, TaskType};

const TASK_ELEMENT: &[u8] = b"task";

/// URL of the device-specific task list.
/// `isDevice=true` makes the server count the request as a device contact.
pub fn task_list_url(base_url: &str, device_id: &str) -> String {
    let device_id: String = url::form_urlencoded::byte_serialize(device_id.as_bytes()).collect();
    format!("{}?isDevice=true&imei={}", endpoint(base_url, "tasklist"), device_id)
}

/// Parse a task list document into tasks, in document order.
pub fn parse_task_list(doc: &str) -> Result<Vec<Task>, AgentError> {
    let mut reader = Reader::from_str(doc);
    reader.config_mut().trim_text(true);

    let mut tasks = Vec::new();
    let mut depth = 0usize;
    let mut roots = 0usize;

    loop {
        let event = reader.read_event().map_err(|e| {
            AgentError::Parse(format!("at byte {}: {}", reader.buffer_position(), e))
        })?;

        match event {
            Event::Start(ref el) | Event::Empty(ref el) => {
                if depth == 0 {
                    roots += 1;
                    if roots > 1 {
                        return Err(AgentError::Parse("multiple root elements".to_string()));
                    }
                }
                if el.name().as_ref() == TASK_ELEMENT {
                    if let Some(task) = parse_task_element(el)? {
                        tasks.push(task);
                    }
                }
                if matches!(event, Event::Start(_)) {
                    depth += 1;
                }
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Eof => break,
            _ => {}
        }
    }

    if roots == 0 {
        return Err(AgentError::Parse("document has no root element".to_string()));
    }
    if depth != 0 {
        return Err(AgentError::Parse("unexpected end of document".to_string()));
    }

    debug!("Parsed {} tasks from task list", tasks.len());
    Ok(tasks)
}

/// Build a task from one `task` element, or None if the entry must be skipped.
fn parse_task_element(el: &BytesStart<'_>) -> Result<Option<Task>, AgentError> {
    let mut id = None;
    let mut type_name = None;
    let mut name = None;
    let mut url = None;
    let mut extras = None;

    for attr in el.attributes() {
        let attr = attr.map_err(|e| AgentError::Parse(format!("bad attribute: {}", e)))?;
        let value = attr
            .unescape_value()
            .map_err(|e| AgentError::Parse(format!("bad attribute value: {}", e)))?
            .into_owned();

        match attr.key.as_ref() {
            b"id" => id = Some(value),
            b"type" => type_name = Some(value),
            b"name" => name = Some(value),
            b"url" => url = Some(value),
            b"extras" => extras = Some(value),
            _ => {}
        }
    }

    let Some(id) = id else {
        warn!("Skipping task entry without id");
        return Ok(None);
    };

    let task_type = match type_name.as_deref().and_then(TaskType::from_wire) {
        Some(t) => t,
        None => {
            warn!("Skipping task {}: type not recognized: {:?}", id, type_name);
            return Ok(None);
        }
    };

    debug!("Task {}: type={} name={:?} url={:?}", id, task_type.as_str(), name, url);

    let mut task = Task::new(id, task_type);
    task.name = name;
    task.url = url;
    task.extras = extras;
    Ok(Some(task))
}
