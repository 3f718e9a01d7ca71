//! Core library for the rf_bench controller.
//!
//! Drives RF/antenna test-bench instruments (positioners, signal generators,
//! network analyzers) over a command/response link, groups them into device
//! sets, and runs set-points and sweeps as asynchronous, cancellable tasks.
//!
//! Layers, bottom up:
//!
//! - [`adapters`]: byte transports (TCP, serial, in-process simulator)
//! - [`link`]: the instrument command protocol with OPC and error checks
//! - [`devices`]: role types and vendor drivers
//! - [`registry`] and [`device_set`]: device ownership and fan-out
//! - [`tasks`]: the task engine
//! - [`remote`]: the JSON-line control server
//!
//! [`bench::Bench`] wires them together from a [`config::BenchConfig`].

pub mod adapters;
pub mod bench;
pub mod config;
pub mod device_set;
pub mod devices;
pub mod error;
pub mod link;
pub mod range;
pub mod registry;
pub mod remote;
pub mod tasks;
pub mod telemetry;

pub use bench::Bench;
pub use error::{BenchError, BenchResult};
