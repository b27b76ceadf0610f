//! Device registration gate.
//!
//! Before any event is handled the agent makes sure the server knows this
//! device's identity. The last identity the server accepted is kept in the
//! preference table; a mismatch (first run, swapped hardware) triggers a new
//! registration.

use anyhow::{anyhow, Result};
use quick_xml::events::{BytesDecl, BytesStart, Event};
use quick_xml::Writer;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::{AgentDb, PREF_REGISTERED_DEVICE_ID};
use crate::transport::{endpoint, Transport};

/// Server path registrations are POSTed to
pub const REGISTER_PATH: &str = "register";

pub struct DeviceRegistrar {
    db: Arc<AgentDb>,
    transport: Arc<dyn Transport>,
}

impl DeviceRegistrar {
    pub fn new(db: Arc<AgentDb>, transport: Arc<dyn Transport>) -> Self {
        Self { db, transport }
    }

    pub fn registration_needed(&self, device_id: &str) -> Result<bool> {
        let registered = self.db.get_string(PREF_REGISTERED_DEVICE_ID)?;
        Ok(registered.as_deref() != Some(device_id))
    }

    /// Register `device_id` with the server. Returns true once the server
    /// has accepted it.
    pub async fn register(&self, base_url: &str, device_id: &str) -> Result<bool> {
        let body = registration_document(device_id)?;
        let url = endpoint(base_url, REGISTER_PATH);

        if !self.transport.post_document(&url, body).await {
            warn!("Device registration for {} was not accepted", device_id);
            return Ok(false);
        }

        self.db.set_string(PREF_REGISTERED_DEVICE_ID, device_id)?;
        info!("Device {} registered", device_id);
        Ok(true)
    }
}

fn registration_document(device_id: &str) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|e| anyhow!("Failed to write declaration: {}", e))?;
    writer
        .write_event(Event::Empty(
            BytesStart::new("register").with_attributes([("imei", device_id)]),
        ))
        .map_err(|e| anyhow!("Failed to write registration: {}", e))?;

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| anyhow!("Registration is not UTF-8: {}", e))
}
