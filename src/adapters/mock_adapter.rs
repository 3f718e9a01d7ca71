//! Mock instrument transport
//!
//! Simulates an instrument at the far end of a [`Transport`] so benches can
//! run without hardware. It provides:
//! - The standard queries (`*IDN?`, `*OPC?`, `SYSTEM:ERROR?`) with sane defaults
//! - Positioner status and position queries that track `ORDER` commands
//! - Fixed and one-shot replies for arbitrary commands
//! - Device-error, stuck-OPC and transport-failure injection
//! - A shared command log for test verification
//!
//! Clones share state, so a test can keep one handle while the device owns
//! another.

use super::Transport;
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Positioner status: reference set and in position.
const STATUS_SETTLED: u32 = 0x000A_0000;
/// Positioner status: reference set and motion block active.
const STATUS_MOVING: u32 = 0x0003_0000;

#[derive(Default)]
struct SimState {
    call_log: Vec<String>,
    outbox: VecDeque<String>,
    fixed_replies: HashMap<String, String>,
    queued_replies: HashMap<String, VecDeque<String>>,
    pending_errors: VecDeque<String>,
    sticky_error: Option<String>,
    error_triggers: Vec<(String, String)>,
    opc_stuck: bool,
    position_counts: i64,
    moving_polls: u32,
    moving_remaining: u32,
}

/// Scriptable instrument simulator.
///
/// # Example
///
/// ```
/// use rf_bench::adapters::MockTransport;
///
/// let mock = MockTransport::new("gen1").with_reply("*IDN?", "Keysight,N5183B,0,1.0");
/// assert!(mock.commands().is_empty());
/// ```
#[derive(Clone)]
pub struct MockTransport {
    name: Arc<str>,
    connected: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
    should_fail_next: Arc<AtomicBool>,
    state: Arc<Mutex<SimState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new("mock")
    }
}

impl MockTransport {
    /// Create a connected simulator with default replies.
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            connected: Arc::new(AtomicBool::new(true)),
            latency_ms: Arc::new(AtomicU64::new(0)),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock()
    }

    /// Set simulated latency in milliseconds
    pub fn with_latency(self, ms: u64) -> Self {
        self.latency_ms.store(ms, Ordering::SeqCst);
        self
    }

    /// Always answer `command` with `reply`.
    pub fn with_reply(self, command: &str, reply: &str) -> Self {
        self.state()
            .fixed_replies
            .insert(command.to_string(), reply.to_string());
        self
    }

    /// Answer the next `command` with `reply`, then fall back to defaults.
    pub fn queue_reply(&self, command: &str, reply: &str) {
        self.state()
            .queued_replies
            .entry(command.to_string())
            .or_default()
            .push_back(reply.to_string());
    }

    /// Make every error query report `message`.
    pub fn with_device_error(self, message: &str) -> Self {
        self.state().sticky_error = Some(message.to_string());
        self
    }

    /// Report `message` on the next error query only.
    pub fn push_device_error(&self, message: &str) {
        self.state().pending_errors.push_back(message.to_string());
    }

    /// Raise `message` in the error register whenever a command starting with
    /// `prefix` is written.
    pub fn fail_on(self, prefix: &str, message: &str) -> Self {
        self.state()
            .error_triggers
            .push((prefix.to_string(), message.to_string()));
        self
    }

    /// Never report operation complete.
    pub fn never_complete(self) -> Self {
        self.state().opc_stuck = true;
        self
    }

    /// Report a positioner as moving for `polls` status reads after each move.
    pub fn with_settle_polls(self, polls: u32) -> Self {
        self.state().moving_polls = polls;
        self
    }

    /// Inject a transport failure for the next operation
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> bool {
        self.should_fail_next.swap(false, Ordering::SeqCst)
    }

    /// Set the connection state manually
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Commands written so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().call_log.clone()
    }

    /// Commands written so far, without the standard OPC/error queries.
    pub fn setting_commands(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| !is_opc_query(c) && !is_error_query(c))
            .collect()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        self.state().call_log.clear();
    }

    async fn simulate_latency(&self) {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn respond(state: &mut SimState, command: &str) -> Option<String> {
        if let Some(reply) = state
            .queued_replies
            .get_mut(command)
            .and_then(VecDeque::pop_front)
        {
            return Some(reply);
        }
        if let Some(reply) = state.fixed_replies.get(command) {
            return Some(reply.clone());
        }

        if command == "*IDN?" {
            return Some("MOCK,Instrument,0,1.0".to_string());
        }
        if is_opc_query(command) {
            let token = if state.opc_stuck { "0" } else { "+1" };
            return Some(token.to_string());
        }
        if is_error_query(command) {
            let reply = state
                .pending_errors
                .pop_front()
                .or_else(|| state.sticky_error.clone())
                .unwrap_or_else(|| "+0,\"No error\"".to_string());
            return Some(reply);
        }
        if command == "TRJSTAT" {
            let status = if state.moving_remaining > 0 {
                state.moving_remaining -= 1;
                STATUS_MOVING
            } else {
                STATUS_SETTLED
            };
            return Some(format!("H{:08X}", status));
        }
        if command == "PFB" {
            return Some(state.position_counts.to_string());
        }
        None
    }

    fn track(state: &mut SimState, command: &str) {
        let mut words = command.split_whitespace();
        match words.next() {
            Some("ORDER") => {
                if let Some(counts) = words.nth(1).and_then(|w| w.parse::<i64>().ok()) {
                    state.position_counts = counts;
                }
            }
            Some("MOVE") => state.moving_remaining = state.moving_polls,
            Some("STOP") => state.moving_remaining = 0,
            _ => {}
        }

        let raised: Vec<String> = state
            .error_triggers
            .iter()
            .filter(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, message)| message.clone())
            .collect();
        state.pending_errors.extend(raised);
    }
}

fn is_opc_query(command: &str) -> bool {
    command.eq_ignore_ascii_case("*OPC?")
}

fn is_error_query(command: &str) -> bool {
    command.eq_ignore_ascii_case("SYSTEM:ERROR?") || command.eq_ignore_ascii_case("SYST:ERR?")
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        self.simulate_latency().await;
        if !self.is_connected() {
            return Err(TransportError::NotConnected(self.name.to_string()));
        }
        if self.check_failure() {
            return Err(TransportError::Io("injected failure".to_string()));
        }

        let mut state = self.state();
        state.call_log.push(command.to_string());
        Self::track(&mut state, command);
        if let Some(reply) = Self::respond(&mut state, command) {
            state.outbox.push_back(reply);
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<String, TransportError> {
        self.simulate_latency().await;
        if !self.is_connected() {
            return Err(TransportError::NotConnected(self.name.to_string()));
        }
        if self.check_failure() {
            return Err(TransportError::Io("injected failure".to_string()));
        }

        self.state()
            .outbox
            .pop_front()
            .ok_or(TransportError::Timeout(Duration::ZERO))
    }

    async fn clear(&mut self) -> Result<(), TransportError> {
        self.state().outbox.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        format!("MockTransport({})", self.name)
    }
}
