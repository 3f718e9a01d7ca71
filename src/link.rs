//! Instrument Link: the command/response protocol over one transport.
//!
//! Instruments acknowledge a command long before the physical action is done,
//! so "did it finish" and "did it fail" are asked separately:
//!
//! - [`InstrumentLink::send`] writes a command and, for queries, reads the reply.
//! - [`InstrumentLink::send_wait`] then polls the operation-complete query
//!   until a pass token comes back or the OPC timeout elapses.
//! - [`InstrumentLink::send_err`] then reads the error register.
//! - [`InstrumentLink::send_wait_err`] does both.
//!
//! Transport failures abort the call with `Err(TransportError)`. An OPC
//! timeout or a non-empty error register is a normal [`OperationResult`]
//! the caller has to inspect.

use crate::adapters::Transport;
use crate::error::{BenchError, BenchResult, ProtocolError, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use strfmt::strfmt;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

/// Named arguments for command templates.
pub type CommandArgs = HashMap<String, String>;

/// Build [`CommandArgs`] from `name => value` pairs.
///
/// ```
/// let args = rf_bench::cmd_args! { "port" => 2, "power" => -10.5 };
/// assert_eq!(args["power"], "-10.5");
/// ```
#[macro_export]
macro_rules! cmd_args {
    ($($name:expr => $value:expr),* $(,)?) => {{
        let mut args = $crate::link::CommandArgs::new();
        $( args.insert($name.to_string(), $value.to_string()); )*
        args
    }};
}

/// A formatted instruction plus whether a reply line must be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Wire text, without terminator
    pub text: String,
    /// Read one reply line after writing
    pub expect_reply: bool,
}

impl Command {
    /// A command whose reply expectation follows SCPI convention: queries end in `?`.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let expect_reply = text.trim_end().ends_with('?');
        Self { text, expect_reply }
    }

    /// A command that always produces a reply, such as a drive status word.
    pub fn query(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            expect_reply: true,
        }
    }

    /// Substitute `{name}` placeholders in `template`.
    pub fn render(template: &str, args: &CommandArgs) -> BenchResult<String> {
        strfmt(template, args).map_err(|e| {
            BenchError::Configuration(format!("cannot format command '{}': {}", template, e))
        })
    }
}

/// Reply of a single operation-complete query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpcState {
    /// A pass token came back
    Complete,
    /// Anything else, verbatim
    Pending(String),
}

/// Protocol outcome of a verified command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Completed with an empty error register
    Success,
    /// No pass token within the OPC timeout
    OpcTimeout {
        /// Time spent polling
        waited: Duration,
    },
    /// Error register reported a failure
    DeviceError {
        /// Error register text
        message: String,
    },
}

/// What a verified send returns: the command, its outcome and any reply data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    /// Command as sent
    pub command: String,
    /// Protocol verdict
    pub outcome: Outcome,
    /// Reply to the command itself, for queries
    pub reply: Option<String>,
}

impl OperationResult {
    fn success(command: &str, reply: Option<String>) -> Self {
        Self {
            command: command.to_string(),
            outcome: Outcome::Success,
            reply,
        }
    }

    /// Whether the command completed without a device error.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    /// Error text reported by the instrument, if any.
    pub fn device_error(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::DeviceError { message } => Some(message),
            _ => None,
        }
    }

    /// Turn a protocol failure into an error, keeping the reply on success.
    pub fn into_result(self) -> Result<Option<String>, ProtocolError> {
        match self.outcome {
            Outcome::Success => Ok(self.reply),
            Outcome::OpcTimeout { waited } => Err(ProtocolError::OpcTimeout {
                command: self.command,
                waited,
            }),
            Outcome::DeviceError { message } => Err(ProtocolError::Device {
                command: self.command,
                message,
            }),
        }
    }
}

/// Result of [`InstrumentLink::poll_until`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate accepted a reply
    Done {
        /// Accepted reply
        reply: String,
        /// Queries sent, including the accepted one
        polls: u32,
    },
    /// Timeout elapsed first
    TimedOut {
        /// Last reply seen
        last_reply: String,
        /// Time spent polling
        waited: Duration,
    },
}

/// Vendor-specific completion and error tokens of one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    /// Identification query
    pub idn_query: String,
    /// Operation-complete query
    pub opc_query: String,
    /// OPC replies that mean done
    pub opc_pass_tokens: Vec<String>,
    /// Pause between OPC queries
    pub opc_poll_interval: Duration,
    /// Give up on OPC polling after this long
    pub opc_timeout: Duration,
    /// Error register query
    pub error_query: String,
    /// Error register reply that means no error
    pub no_error_reply: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            idn_query: "*IDN?".to_string(),
            opc_query: "*OPC?".to_string(),
            opc_pass_tokens: vec!["+1".to_string(), "1".to_string()],
            opc_poll_interval: Duration::from_millis(250),
            opc_timeout: Duration::from_secs(30),
            error_query: "SYSTEM:ERROR?".to_string(),
            no_error_reply: "+0,\"No error\"".to_string(),
        }
    }
}

impl LinkConfig {
    fn is_pass_token(&self, reply: &str) -> bool {
        self.opc_pass_tokens.iter().any(|token| token == reply)
    }

    fn is_no_error(&self, reply: &str) -> bool {
        if reply == self.no_error_reply {
            return true;
        }
        // `0,"No error"` and `+0,"No error"` both mean an empty queue.
        reply
            .split(',')
            .next()
            .and_then(|code| code.trim().parse::<i32>().ok())
            == Some(0)
    }
}

/// Protocol session with one instrument. Owns its transport exclusively.
pub struct InstrumentLink {
    name: String,
    transport: Box<dyn Transport>,
    config: LinkConfig,
}

impl std::fmt::Debug for InstrumentLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentLink")
            .field("name", &self.name)
            .field("transport", &self.transport.describe())
            .finish()
    }
}

impl InstrumentLink {
    /// Link called `name` over `transport`.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>, config: LinkConfig) -> Self {
        Self {
            name: name.into(),
            transport,
            config,
        }
    }

    /// Instrument name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Completion and error tokens in use.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Whether the transport is open.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Write `command`; read and return the reply when one is expected.
    pub async fn send_command(&mut self, command: &Command) -> Result<Option<String>, TransportError> {
        if !self.transport.is_connected() {
            return Err(TransportError::NotConnected(self.name.clone()));
        }

        debug!(device = %self.name, command = %command.text, "write");
        self.transport.write(&command.text).await?;

        if !command.expect_reply {
            return Ok(None);
        }

        let reply = self.transport.read().await?;
        let reply = reply.trim().to_string();
        debug!(device = %self.name, command = %command.text, reply = %reply, "read");
        if reply.is_empty() {
            return Err(TransportError::MalformedReply(format!(
                "empty reply to '{}'",
                command.text
            )));
        }
        Ok(Some(reply))
    }

    /// Send a command; queries (trailing `?`) return their reply.
    pub async fn send(&mut self, command: &str) -> Result<Option<String>, TransportError> {
        self.send_command(&Command::new(command)).await
    }

    /// Send a command that must produce a reply and return it.
    pub async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.send_command(&Command::query(command))
            .await?
            .ok_or_else(|| TransportError::MalformedReply(format!("no reply to '{}'", command)))
    }

    /// Send, then wait for operation complete.
    pub async fn send_wait(&mut self, command: &str) -> Result<OperationResult, TransportError> {
        let reply = self.send(command).await?;
        match self.wait().await? {
            None => Ok(OperationResult::success(command, reply)),
            Some(waited) => Ok(OperationResult {
                command: command.to_string(),
                outcome: Outcome::OpcTimeout { waited },
                reply,
            }),
        }
    }

    /// Send, then check the error register.
    pub async fn send_err(&mut self, command: &str) -> Result<OperationResult, TransportError> {
        let reply = self.send(command).await?;
        self.check_errors(command, reply).await
    }

    /// Send, wait for operation complete, then check the error register.
    ///
    /// When the OPC wait times out the error register is not read; the
    /// timeout is reported instead.
    pub async fn send_wait_err(&mut self, command: &str) -> Result<OperationResult, TransportError> {
        let result = self.send_wait(command).await?;
        if !result.is_success() {
            return Ok(result);
        }
        self.check_errors(command, result.reply).await
    }

    /// `send_wait_err` each command in order, stopping at the first one that
    /// does not succeed. Returns that result, or the last one.
    pub async fn send_sequence(
        &mut self,
        commands: &[String],
    ) -> Result<OperationResult, TransportError> {
        let mut last = OperationResult::success("", None);
        for command in commands {
            last = self.send_wait_err(command).await?;
            if !last.is_success() {
                break;
            }
        }
        Ok(last)
    }

    /// [`send`](Self::send) after rendering `template` with `args`.
    pub async fn send_fmt(
        &mut self,
        template: &str,
        args: &CommandArgs,
    ) -> BenchResult<Option<String>> {
        let command = Command::render(template, args)?;
        Ok(self.send(&command).await?)
    }

    /// [`send_wait`](Self::send_wait) after rendering `template` with `args`.
    pub async fn send_wait_fmt(
        &mut self,
        template: &str,
        args: &CommandArgs,
    ) -> BenchResult<OperationResult> {
        let command = Command::render(template, args)?;
        Ok(self.send_wait(&command).await?)
    }

    /// [`send_err`](Self::send_err) after rendering `template` with `args`.
    pub async fn send_err_fmt(
        &mut self,
        template: &str,
        args: &CommandArgs,
    ) -> BenchResult<OperationResult> {
        let command = Command::render(template, args)?;
        Ok(self.send_err(&command).await?)
    }

    /// [`send_wait_err`](Self::send_wait_err) after rendering `template` with `args`.
    pub async fn send_wait_err_fmt(
        &mut self,
        template: &str,
        args: &CommandArgs,
    ) -> BenchResult<OperationResult> {
        let command = Command::render(template, args)?;
        Ok(self.send_wait_err(&command).await?)
    }

    /// Instrument identification string.
    pub async fn idn(&mut self) -> Result<String, TransportError> {
        let query = self.config.idn_query.clone();
        self.query(&query).await
    }

    /// One operation-complete query.
    pub async fn opc(&mut self) -> Result<OpcState, TransportError> {
        let query = self.config.opc_query.clone();
        let reply = self.query(&query).await?;
        if self.config.is_pass_token(&reply) {
            Ok(OpcState::Complete)
        } else {
            Ok(OpcState::Pending(reply))
        }
    }

    /// Read the error register; `None` when it holds the no-error literal.
    pub async fn error_state(&mut self) -> Result<Option<String>, TransportError> {
        let query = self.config.error_query.clone();
        let reply = self.query(&query).await?;
        if self.config.is_no_error(&reply) {
            Ok(None)
        } else {
            Ok(Some(reply))
        }
    }

    /// Poll the OPC query until complete. Returns the time waited on timeout.
    pub async fn wait(&mut self) -> Result<Option<Duration>, TransportError> {
        let query = Command::query(self.config.opc_query.clone());
        let tokens = self.config.opc_pass_tokens.clone();
        match self
            .poll_until(&query, |reply| tokens.iter().any(|t| t == reply))
            .await?
        {
            PollOutcome::Done { .. } => Ok(None),
            PollOutcome::TimedOut { last_reply, waited } => {
                warn!(
                    device = %self.name,
                    last_reply = %last_reply,
                    waited_ms = waited.as_millis() as u64,
                    "operation complete never reported"
                );
                Ok(Some(waited))
            }
        }
    }

    /// Repeat `query` until `done` accepts the reply, sleeping the poll
    /// interval between attempts, bounded by the OPC timeout.
    pub async fn poll_until<F>(
        &mut self,
        query: &Command,
        mut done: F,
    ) -> Result<PollOutcome, TransportError>
    where
        F: FnMut(&str) -> bool + Send,
    {
        let started = Instant::now();
        let mut polls = 0u32;
        loop {
            polls += 1;
            let reply = self.send_command(query).await?.unwrap_or_default();
            trace!(device = %self.name, query = %query.text, reply = %reply, polls, "poll");
            if done(&reply) {
                return Ok(PollOutcome::Done { reply, polls });
            }

            let waited = started.elapsed();
            if waited >= self.config.opc_timeout {
                return Ok(PollOutcome::TimedOut {
                    last_reply: reply,
                    waited,
                });
            }
            tokio::time::sleep(self.config.opc_poll_interval).await;
        }
    }

    /// Device clear: drop unread input on the transport.
    pub async fn clear(&mut self) -> Result<(), TransportError> {
        debug!(device = %self.name, "clear");
        self.transport.clear().await
    }

    async fn check_errors(
        &mut self,
        command: &str,
        reply: Option<String>,
    ) -> Result<OperationResult, TransportError> {
        match self.error_state().await? {
            None => Ok(OperationResult::success(command, reply)),
            Some(message) => {
                error!(device = %self.name, command = %command, error = %message, "instrument error");
                Ok(OperationResult {
                    command: command.to_string(),
                    outcome: Outcome::DeviceError { message },
                    reply,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;
    use tracing_test::traced_test;

    fn link(mock: &MockTransport) -> InstrumentLink {
        let config = LinkConfig {
            opc_poll_interval: Duration::from_millis(5),
            opc_timeout: Duration::from_millis(40),
            ..LinkConfig::default()
        };
        InstrumentLink::new("dut", Box::new(mock.clone()), config)
    }

    #[test]
    fn test_command_reply_inference() {
        assert!(Command::new("*IDN?").expect_reply);
        assert!(!Command::new(":FREQ 1e9").expect_reply);
        assert!(Command::query("TRJSTAT").expect_reply);
    }

    #[test]
    fn test_render_named_arguments() {
        let args = crate::cmd_args! { "port" => 3, "power" => -7.5 };
        let text = Command::render(":SOURce:POWer{port}:LEVel {power}", &args).unwrap();
        assert_eq!(text, ":SOURce:POWer3:LEVel -7.5");

        let err = Command::render(":FREQ {missing}", &args).unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }

    #[tokio::test]
    async fn test_send_without_reply() {
        let mock = MockTransport::new("dut");
        let mut link = link(&mock);
        assert_eq!(link.send(":FREQ 1000").await.unwrap(), None);
        assert_eq!(mock.commands(), vec![":FREQ 1000"]);
    }

    #[tokio::test]
    async fn test_query_returns_reply() {
        let mock = MockTransport::new("dut").with_reply("*IDN?", "Keysight,M9807A,X,1.0");
        let mut link = link(&mock);
        assert_eq!(link.idn().await.unwrap(), "Keysight,M9807A,X,1.0");
    }

    #[tokio::test]
    async fn test_empty_reply_is_malformed() {
        let mock = MockTransport::new("dut").with_reply("FOO?", "  ");
        let mut link = link(&mock);
        assert!(matches!(
            link.send("FOO?").await,
            Err(TransportError::MalformedReply(_))
        ));
    }

    #[tokio::test]
    async fn test_send_wait_err_success() {
        let mock = MockTransport::new("dut");
        let mut link = link(&mock);
        let result = link.send_wait_err(":FREQ 2400000000").await.unwrap();
        assert!(result.is_success());
        assert_eq!(
            mock.commands(),
            vec![":FREQ 2400000000", "*OPC?", "SYSTEM:ERROR?"]
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_device_error_is_reported_not_raised() {
        let mock = MockTransport::new("dut").fail_on(":FREQ", "-222,\"Data out of range\"");
        let mut link = link(&mock);
        let result = link.send_err(":FREQ 99e9").await.unwrap();
        assert_eq!(result.device_error(), Some("-222,\"Data out of range\""));
        assert!(logs_contain("instrument error"));

        let err = result.into_result().unwrap_err();
        assert!(matches!(err, ProtocolError::Device { .. }));
    }

    #[tokio::test]
    async fn test_zero_code_means_no_error() {
        let mock = MockTransport::new("dut").with_reply("SYSTEM:ERROR?", "0,\"No error\"");
        let mut link = link(&mock);
        assert_eq!(link.error_state().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_opc_timeout_is_a_failure() {
        let mock = MockTransport::new("dut").never_complete();
        let mut link = link(&mock);
        let result = link.send_wait_err("MOVE 0").await.unwrap();
        assert!(matches!(result.outcome, Outcome::OpcTimeout { waited } if waited >= Duration::from_millis(40)));
        // The error register is not consulted after a timeout.
        assert!(!mock.commands().iter().any(|c| c == "SYSTEM:ERROR?"));
        assert!(matches!(
            result.into_result(),
            Err(ProtocolError::OpcTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_opc_passes_after_pending_polls() {
        let mock = MockTransport::new("dut");
        mock.queue_reply("*OPC?", "0");
        mock.queue_reply("*OPC?", "0");
        let mut link = link(&mock);
        let result = link.send_wait("INIT").await.unwrap();
        assert!(result.is_success());
        let polls = mock.commands().iter().filter(|c| *c == "*OPC?").count();
        assert_eq!(polls, 3);
    }

    #[tokio::test]
    async fn test_transport_failure_is_raised() {
        let mock = MockTransport::new("dut");
        mock.set_connected(false);
        let mut link = link(&mock);
        assert!(matches!(
            link.send_wait_err(":FREQ 1").await,
            Err(TransportError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_fmt_overload() {
        let mock = MockTransport::new("dut");
        let mut link = link(&mock);
        let result = link
            .send_wait_err_fmt(":FREQ {hz}", &crate::cmd_args! { "hz" => 1.5e9 })
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(mock.commands()[0], ":FREQ 1500000000");
    }
}
