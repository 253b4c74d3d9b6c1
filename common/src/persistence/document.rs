// Persisted trigger status document and its id encoding

use crate::models::{Trigger, TriggerKey};
use crate::store::{TriggerRecord, TriggerState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of one trigger as written to the backing store.
/// Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStatusDocument {
    pub state: TriggerState,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub next_fire_time: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub previous_fire_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub times_triggered: u32,
}

impl TriggerStatusDocument {
    pub fn from_record(record: &TriggerRecord) -> Self {
        Self {
            state: record.state,
            next_fire_time: record.trigger.next_fire_time,
            previous_fire_time: record.trigger.previous_fire_time,
            info: record.state_info.clone(),
            node: record.node.clone(),
            times_triggered: record.trigger.times_triggered,
        }
    }

    /// Final document for a trigger that was dropped from memory
    pub fn deleted(trigger: &Trigger, node: &str) -> Self {
        Self {
            state: TriggerState::Deleted,
            next_fire_time: trigger.next_fire_time,
            previous_fire_time: trigger.previous_fire_time,
            info: None,
            node: node.to_string(),
            times_triggered: trigger.times_triggered,
        }
    }

    /// Copy the persisted fields onto a record
    pub fn apply_to(&self, record: &mut TriggerRecord) {
        record.state = self.state;
        record.trigger.next_fire_time = self.next_fire_time;
        record.trigger.previous_fire_time = self.previous_fire_time;
        record.state_info = self.info.clone();
        record.node = self.node.clone();
        record.trigger.times_triggered = self.times_triggered;
    }

    /// Parse a stored document. Anything unreadable becomes an ERROR document
    /// so the trigger is isolated instead of failing the whole load.
    pub fn from_json_lenient(value: serde_json::Value) -> Self {
        match serde_json::from_value::<TriggerStatusDocument>(value) {
            Ok(document) => document,
            Err(e) => Self {
                state: TriggerState::Error,
                next_fire_time: None,
                previous_fire_time: None,
                info: Some(format!("unreadable status document: {}", e)),
                node: String::new(),
                times_triggered: 0,
            },
        }
    }
}

/// Document id for a trigger: `[prefix.]group.name` with `\` and `.` backslash-escaped
/// in every component, so distinct keys never share an id.
pub fn status_document_id(prefix: Option<&str>, key: &TriggerKey) -> String {
    let mut id = String::with_capacity(key.group.len() + key.name.len() + 8);
    if let Some(prefix) = prefix {
        push_escaped(&mut id, prefix);
        id.push('.');
    }
    push_escaped(&mut id, &key.group);
    id.push('.');
    push_escaped(&mut id, &key.name);
    id
}

fn push_escaped(out: &mut String, component: &str) {
    for c in component.chars() {
        if c == '\\' || c == '.' {
            out.push('\\');
        }
        out.push(c);
    }
}
