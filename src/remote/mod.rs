//! Remote control over TCP.
//!
//! A thin boundary: each request line maps onto one [`TaskManager`](crate::tasks::TaskManager)
//! call and each reply reports its result.

pub mod protocol;
pub mod server;

pub use protocol::{ControlRequest, Reply, ReplyError, Request};
pub use server::{dispatch, RemoteServer};
