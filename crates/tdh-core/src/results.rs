//! Per-record and per-batch outcome types exposed by the sync engine.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Outcome of one push to one publish channel for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierResponse {
    pub service: String,
    pub status: u16,
    pub success: bool,
    #[serde(default)]
    pub echoedid: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl NotifierResponse {
    pub fn delivered(service: impl Into<String>, status: u16, echoedid: Option<String>) -> Self {
        Self {
            service: service.into(),
            status,
            success: true,
            echoedid,
            error: None,
        }
    }

    pub fn failed(service: impl Into<String>, status: u16, error: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            status,
            success: false,
            echoedid: None,
            error: Some(error.into()),
        }
    }
}

/// Outcome of one record in one import pass.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateDetail {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub operation: String,
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub error: u32,
    pub objectcompared: u32,
    pub objectchanged: u32,
    pub objectimagechanged: u32,
    #[serde(default)]
    pub changes: Option<JsonValue>,
    #[serde(default)]
    pub pushchannels: BTreeSet<String>,
    #[serde(default)]
    pub pushed: BTreeMap<String, NotifierResponse>,
    #[serde(default)]
    pub exception: Option<String>,
}

impl UpdateDetail {
    pub fn for_record(id: impl Into<String>, record_type: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            record_type: record_type.into(),
            operation: operation.into(),
            ..Default::default()
        }
    }

    /// A record that failed before or during persistence.
    pub fn failed(
        id: impl Into<String>,
        record_type: impl Into<String>,
        operation: impl Into<String>,
        exception: impl Into<String>,
    ) -> Self {
        Self {
            error: 1,
            exception: Some(exception.into()),
            ..Self::for_record(id, record_type, operation)
        }
    }
}

/// Aggregate of every [`UpdateDetail`] produced by one batch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateResult {
    pub id: String,
    pub source: String,
    pub operation: String,
    pub updatetype: String,
    pub message: String,
    pub otherinfo: String,
    pub recordsmodified: u32,
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub error: u32,
    pub objectcompared: u32,
    pub objectchanged: u32,
    pub objectimagechanged: u32,
    #[serde(default)]
    pub objectchanges: Vec<JsonValue>,
    #[serde(default)]
    pub pushchannels: BTreeSet<String>,
    #[serde(default)]
    pub pushed: BTreeMap<String, Vec<NotifierResponse>>,
    pub exception: String,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStatus {
    Pending,
    Exhausted,
    Resolved,
}

/// Failed channel delivery awaiting an out-of-band retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryQueueEntry {
    pub channel: String,
    pub record_id: String,
    pub record_type: String,
    pub origin: String,
    pub reason: String,
    pub attempt: u32,
    pub last_attempt_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: RetryStatus,
    #[serde(default)]
    pub image_changed: bool,
    #[serde(default)]
    pub is_delete: bool,
}
