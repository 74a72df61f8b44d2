//! Runtime, workflow and task descriptors exposed to expressions as
//! `$runtime`, `$workflow` and `$task`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Describes the engine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub name: String,
    pub version: String,
}

impl Default for RuntimeDescriptor {
    fn default() -> Self {
        Self {
            name: "rook".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Timestamp in the two shapes expressions expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateTimeDescriptor {
    pub iso8601: String,
    pub epoch: EpochDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochDescriptor {
    pub seconds: i64,
    pub milliseconds: i64,
}

impl From<DateTime<Utc>> for DateTimeDescriptor {
    fn from(dt: DateTime<Utc>) -> Self {
        Self {
            iso8601: dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            epoch: EpochDescriptor {
                seconds: dt.timestamp(),
                milliseconds: dt.timestamp_millis(),
            },
        }
    }
}

/// Describes the running workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDescriptor {
    pub id: String,
    pub definition: WorkflowNaming,
    pub input: Value,
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTimeDescriptor>,
}

/// The identifying slice of a definition (the full document would bloat every
/// evaluation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNaming {
    pub namespace: String,
    pub name: String,
    pub version: String,
}

/// Describes the task currently being evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub name: String,
    /// Position path, e.g. `/do/2/fetchUser`.
    pub reference: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTimeDescriptor>,
}
