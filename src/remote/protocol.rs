//! Remote-control messages: one JSON object per line, tagged by `"type"`.
//!
//! Task requests (`set_angle`, `set_freq_range`, ...) share their shape with
//! [`TaskRequest`]. Control requests query or steer existing tasks.
//!
//! ```json
//! {"type":"set_freq","set":"sources","value":2400000000}
//! {"ok":true,"task":"5e0c3f0a-..."}
//! {"type":"status","task":"5e0c3f0a-..."}
//! {"ok":true,"snapshot":{"state":"completed",...}}
//! ```

use crate::error::BenchError;
use crate::tasks::{TaskId, TaskRequest, TaskSnapshot, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Requests that do not start a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Snapshot of one task
    Status {
        /// Task id
        task: TaskId,
    },
    /// Cancel one task
    Stop {
        /// Task id
        task: TaskId,
    },
    /// Block until the task ends, then reply with its snapshot
    Wait {
        /// Task id
        task: TaskId,
    },
    /// All tasks plus the registered device sets
    List,
    /// Drop every finished task from the table
    Purge,
}

const CONTROL_TYPES: &[&str] = &["status", "stop", "wait", "list", "purge"];

/// A parsed request line.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Starts a task
    Task(TaskRequest),
    /// Queries or steers existing tasks
    Control(ControlRequest),
}

impl Request {
    /// Parse one request line. The error text is meant for a `parse` reply.
    pub fn parse(line: &str) -> Result<Self, String> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| format!("invalid JSON: {}", e))?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| "missing \"type\" field".to_string())?;

        if CONTROL_TYPES.contains(&kind.as_str()) {
            serde_json::from_value(value)
                .map(Request::Control)
                .map_err(|e| format!("bad '{}' request: {}", kind, e))
        } else {
            serde_json::from_value(value)
                .map(Request::Task)
                .map_err(|e| format!("bad '{}' request: {}", kind, e))
        }
    }
}

/// Error part of a failed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyError {
    /// Stable category, see [`BenchError::kind`]
    pub kind: String,
    /// Human-readable text
    pub message: String,
}

/// One reply line. Only the fields relevant to the request are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Whether the request succeeded
    pub ok: bool,
    /// Submitted or stopped task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskId>,
    /// State a stopped task was in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    /// Task state for status and wait
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<TaskSnapshot>,
    /// Every known task, for list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<TaskSnapshot>>,
    /// Device set names mapped to their member names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sets: Option<BTreeMap<String, Vec<String>>>,
    /// Number of finished tasks dropped by a purge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purged: Option<usize>,
    /// Set when `ok` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl Reply {
    fn ok() -> Self {
        Self {
            ok: true,
            task: None,
            state: None,
            snapshot: None,
            tasks: None,
            sets: None,
            purged: None,
            error: None,
        }
    }

    /// Task accepted.
    pub fn submitted(task: TaskId) -> Self {
        Self {
            task: Some(task),
            ..Self::ok()
        }
    }

    /// Stop accepted; `state` is the state the task was in.
    pub fn stopping(task: TaskId, state: TaskState) -> Self {
        Self {
            task: Some(task),
            state: Some(state),
            ..Self::ok()
        }
    }

    /// Reply to status or wait.
    pub fn snapshot(snapshot: TaskSnapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
            ..Self::ok()
        }
    }

    /// Reply to list.
    pub fn listing(tasks: Vec<TaskSnapshot>, sets: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            tasks: Some(tasks),
            sets: Some(sets),
            ..Self::ok()
        }
    }

    /// Reply to purge.
    pub fn purged(count: usize) -> Self {
        Self {
            purged: Some(count),
            ..Self::ok()
        }
    }

    /// Failed request.
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(ReplyError {
                kind: kind.into(),
                message: message.into(),
            }),
            ..Self::ok()
        }
    }

    /// Serialize as a single line, without the terminator.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"ok":false,"error":{{"kind":"internal","message":"reply not serializable: {}"}}}}"#,
                e.to_string().replace('"', "'")
            )
        })
    }
}

impl From<&BenchError> for Reply {
    fn from(err: &BenchError) -> Self {
        Reply::error(err.kind(), err.to_string())
    }
}
