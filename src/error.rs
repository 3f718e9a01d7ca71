//! Error types for the bench controller.
//!
//! Failures are split along the lines the hardware imposes on us:
//!
//! - **`TransportError`**: the bus itself failed. The link is not open, a read
//!   timed out before any reply, the peer closed the connection, or a reply
//!   was malformed. These are returned as `Err` and abort the issuing call.
//! - **`ProtocolError`**: the instrument answered, but the answer says the
//!   command did not go through (OPC wait exhausted, non-empty error
//!   register). The Instrument Link reports these as an
//!   [`OperationResult`](crate::link::OperationResult) value; `ProtocolError`
//!   is what that value turns into once a caller decides it is fatal.
//! - **`RangeError`** and `BenchError::Configuration` / `BenchError::Unsupported`:
//!   rejected before any hardware command is issued.
//! - **`TaskError`**: lifecycle misuse reported synchronously to the
//!   submitter (unknown task, stopping a finished task, busy device).
//!
//! `BenchError` consolidates all of them so `?` works across layers.

use crate::devices::Capability;
use crate::range::RangeError;
use crate::tasks::{TaskId, TaskState};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type BenchResult<T> = std::result::Result<T, BenchError>;

/// Failures of the physical/virtual instrument bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Link to the named instrument is not open
    #[error("Instrument '{0}' is not connected")]
    NotConnected(String),

    /// Underlying read or write failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Reply expected but none arrived in time
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// Peer hung up
    #[error("Connection closed by instrument")]
    Closed,

    /// Reply arrived but could not be parsed
    #[error("Malformed reply: {0}")]
    MalformedReply(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Command-semantic failures reported by the instrument itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// OPC polling ran out of time
    #[error("Operation did not complete within {waited:?} after '{command}'")]
    OpcTimeout {
        /// Command whose completion was awaited
        command: String,
        /// Time spent polling
        waited: Duration,
    },

    /// Error register was not empty after the command
    #[error("Instrument reported error after '{command}': {message}")]
    Device {
        /// Command that raised the error
        command: String,
        /// Error register text, verbatim
        message: String,
    },
}

/// Task lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// No task with this id, or it was purged
    #[error("Task {0} not found")]
    NotFound(TaskId),

    /// Stop requested for a task in a terminal state
    #[error("Task {id} already finished ({state})")]
    AlreadyFinished {
        /// The finished task
        id: TaskId,
        /// Its terminal state
        state: TaskState,
    },

    /// An unfinished task already drives one of the devices
    #[error("Device '{device}' is busy with task {task}")]
    DeviceBusy {
        /// First contended device
        device: String,
        /// Task holding it
        task: TaskId,
    },

    /// No device set with this name
    #[error("Device set '{0}' not registered")]
    UnknownDeviceSet(String),
}

/// Umbrella error for the crate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BenchError {
    /// Bus failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Instrument rejected or never finished a command
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Invalid setup or request, caught before any I/O
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Sweep range failed validation
    #[error("Invalid range: {0}")]
    Range(#[from] RangeError),

    /// Operation outside what the device can do
    #[error("Device '{device}' does not support {capability}")]
    Unsupported {
        /// Device name
        device: String,
        /// Missing capability
        capability: Capability,
    },

    /// Task lifecycle misuse
    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

impl BenchError {
    /// Short machine-readable category, used by the remote-control replies.
    pub fn kind(&self) -> &'static str {
        match self {
            BenchError::Transport(_) => "transport",
            BenchError::Protocol(_) => "protocol",
            BenchError::Configuration(_) | BenchError::Range(_) | BenchError::Unsupported { .. } => {
                "configuration"
            }
            BenchError::Task(TaskError::DeviceBusy { .. }) => "busy",
            BenchError::Task(_) => "task",
        }
    }
}
