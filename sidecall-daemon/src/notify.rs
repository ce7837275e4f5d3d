//! Notification dispatch implementations and contact resolution.

use std::collections::HashMap;
use std::sync::Mutex;

use sidecall_core::{ContactResolver, NotificationDispatch};
use tracing::info;

/// Renders dispatch calls as log lines. The daemon has no platform
/// notification surface; the alert text itself is the product here.
pub struct LogDispatch;

impl NotificationDispatch for LogDispatch {
    fn show_incoming_call(&self, title: &str, body: &str) {
        info!(title, body, "incoming alert");
    }

    fn show_missed_call(&self, body: &str) {
        info!(body, "missed call alert");
    }

    fn cancel_incoming_call(&self) {
        info!("incoming alert cancelled");
    }
}

/// One recorded dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchCall {
    IncomingCall { title: String, body: String },
    MissedCall { body: String },
    Cancel,
}

/// Records every dispatch call; for tests.
#[derive(Default)]
pub struct RecordingDispatch {
    calls: Mutex<Vec<DispatchCall>>,
}

impl RecordingDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<DispatchCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<DispatchCall> {
        std::mem::take(&mut self.calls.lock().unwrap())
    }
}

impl NotificationDispatch for RecordingDispatch {
    fn show_incoming_call(&self, title: &str, body: &str) {
        self.calls.lock().unwrap().push(DispatchCall::IncomingCall {
            title: title.to_string(),
            body: body.to_string(),
        });
    }

    fn show_missed_call(&self, body: &str) {
        self.calls.lock().unwrap().push(DispatchCall::MissedCall {
            body: body.to_string(),
        });
    }

    fn cancel_incoming_call(&self) {
        self.calls.lock().unwrap().push(DispatchCall::Cancel);
    }
}

/// Contact lookup that always misses; numbers are shown raw.
pub struct NoContacts;

impl ContactResolver for NoContacts {
    fn display_name(&self, _number: &str) -> Option<String> {
        None
    }
}

/// Fixed-table lookup; for tests.
#[derive(Default)]
pub struct StaticContacts {
    entries: HashMap<String, String>,
}

impl StaticContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, number: impl Into<String>, name: impl Into<String>) -> Self {
        self.entries.insert(number.into(), name.into());
        self
    }
}

impl ContactResolver for StaticContacts {
    fn display_name(&self, number: &str) -> Option<String> {
        self.entries.get(number).cloned()
    }
}
