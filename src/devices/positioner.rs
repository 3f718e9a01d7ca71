//! Positioner ("Rbd") role.
//!
//! A positioner drives one servo axis per link. Drives of this kind do not
//! implement the SCPI operation-complete and error queues; a move is
//! verified by polling the drive status word until the axis reports in
//! position with the motion block released.

use super::{
    unsupported, AxisReading, Capability, DeviceStatus, Operation, Role, Settable, SweepReport,
    SweepTarget,
};
use crate::cmd_args;
use crate::error::{BenchError, BenchResult, TransportError};
use crate::link::{Command, InstrumentLink, OperationResult, Outcome, PollOutcome};
use crate::range::SweepRange;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Decoded drive status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisStatus {
    /// Status word as read
    pub raw: u32,
    /// Axis has been homed
    pub referenced: bool,
    /// Target reached
    pub in_position: bool,
    /// A move is still executing
    pub move_blocked: bool,
}

impl AxisStatus {
    /// Motion finished: in position and not blocked by a running move.
    pub fn is_settled(&self) -> bool {
        self.in_position && !self.move_blocked
    }
}

/// Vendor command grammar of a positioner drive.
pub trait PositionerDriver: Send + Sync + fmt::Debug {
    /// Model name as used in the config.
    fn model(&self) -> &'static str;

    /// Commands sent to every axis on connect, before the first status read.
    fn init_commands(&self) -> Vec<String>;

    /// Pause after the init commands while the drive enables.
    fn init_delay(&self) -> Duration;

    /// Reference run.
    fn home_command(&self) -> String;

    /// Commands that move the axis to `position` degrees.
    fn move_commands(&self, position: f64) -> BenchResult<Vec<String>>;

    /// Halt the axis.
    fn stop_command(&self) -> String;

    /// Query for the drive status word.
    fn status_query(&self) -> Command;

    /// Decode a status word reply.
    fn parse_status(&self, reply: &str) -> Result<AxisStatus, TransportError>;

    /// Query for the actual position.
    fn position_query(&self) -> Command;

    /// Decode a position reply into degrees.
    fn parse_position(&self, reply: &str) -> Result<f64, TransportError>;
}

/// Tesart servo drive, one drive per axis.
#[derive(Debug, Clone)]
pub struct TesartRbd {
    velocity: u32,
    acceleration: u32,
    init_delay: Duration,
}

impl TesartRbd {
    const SCALE: f64 = 1000.0;
    const BIT_MOVE_BLOCK: u32 = 0x0001_0000;
    const BIT_REF_SET: u32 = 0x0002_0000;
    const BIT_IN_POS: u32 = 0x0008_0000;

    /// Driver with the default motion profile.
    pub fn new() -> Self {
        Self {
            velocity: 50,
            acceleration: 3,
            init_delay: Duration::from_secs(10),
        }
    }

    /// Override velocity and acceleration of the motion profile.
    pub fn with_motion(mut self, velocity: u32, acceleration: u32) -> Self {
        self.velocity = velocity;
        self.acceleration = acceleration;
        self
    }

    /// Override the pause after enabling the drive.
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }
}

impl Default for TesartRbd {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionerDriver for TesartRbd {
    fn model(&self) -> &'static str {
        "tesart"
    }

    fn init_commands(&self) -> Vec<String> {
        vec!["PROMPT 0".into(), "CLRFAULT".into(), "EN".into()]
    }

    fn init_delay(&self) -> Duration {
        self.init_delay
    }

    fn home_command(&self) -> String {
        "MH".into()
    }

    fn move_commands(&self, position: f64) -> BenchResult<Vec<String>> {
        let counts = (position * Self::SCALE).round() as i64;
        let order = Command::render(
            "ORDER 0 {counts} {vel} 8192 {acc} {acc} 0 -1 0 0",
            &cmd_args! {
                "counts" => counts,
                "vel" => self.velocity,
                "acc" => self.acceleration,
            },
        )?;
        Ok(vec![order, "MOVE 0".into()])
    }

    fn stop_command(&self) -> String {
        "STOP".into()
    }

    fn status_query(&self) -> Command {
        Command::query("TRJSTAT")
    }

    fn parse_status(&self, reply: &str) -> Result<AxisStatus, TransportError> {
        let digits = reply.trim().trim_start_matches('H');
        let raw = u32::from_str_radix(digits, 16).map_err(|_| {
            TransportError::MalformedReply(format!("bad TRJSTAT word '{}'", reply))
        })?;
        Ok(AxisStatus {
            raw,
            referenced: raw & Self::BIT_REF_SET != 0,
            in_position: raw & Self::BIT_IN_POS != 0,
            move_blocked: raw & Self::BIT_MOVE_BLOCK != 0,
        })
    }

    fn position_query(&self) -> Command {
        Command::query("PFB")
    }

    fn parse_position(&self, reply: &str) -> Result<f64, TransportError> {
        reply
            .trim()
            .parse::<f64>()
            .map(|counts| counts / Self::SCALE)
            .map_err(|_| TransportError::MalformedReply(format!("bad PFB value '{}'", reply)))
    }
}

/// A multi-axis positioner.
#[derive(Debug)]
pub struct Positioner {
    id: String,
    axes: Vec<InstrumentLink>,
    driver: Box<dyn PositionerDriver>,
}

impl Positioner {
    /// Positioner called `id` with one link per axis.
    pub fn new(id: impl Into<String>, axes: Vec<InstrumentLink>, driver: Box<dyn PositionerDriver>) -> Self {
        Self {
            id: id.into(),
            axes,
            driver,
        }
    }

    /// Driver model name.
    pub fn model(&self) -> &str {
        self.driver.model()
    }

    /// Number of axes.
    pub fn axis_count(&self) -> usize {
        self.axes.len()
    }

    /// Whether every axis link is open.
    pub fn is_connected(&self) -> bool {
        !self.axes.is_empty() && self.axes.iter().all(InstrumentLink::is_connected)
    }

    fn axis(&mut self, axis: usize) -> BenchResult<&mut InstrumentLink> {
        let count = self.axes.len();
        self.axes.get_mut(axis).ok_or_else(|| {
            BenchError::Configuration(format!("axis {} out of range (positioner has {})", axis, count))
        })
    }

    /// Enable every axis and home the ones without a reference.
    pub async fn initialize(&mut self) -> BenchResult<()> {
        for axis in 0..self.axes.len() {
            for command in self.driver.init_commands() {
                self.axes[axis].send(&command).await?;
            }
            self.axes[axis].clear().await?;

            let delay = self.driver.init_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let status = self.status(axis).await?;
            if !status.referenced {
                info!(device = %self.id, axis, "homing axis");
                let home = self.driver.home_command();
                self.axes[axis].send(&home).await?;
            }
        }
        Ok(())
    }

    /// Read and decode the status word of `axis`.
    pub async fn status(&mut self, axis: usize) -> BenchResult<AxisStatus> {
        let query = self.driver.status_query();
        let link = self.axis(axis)?;
        link.clear().await?;
        let reply = link.send_command(&query).await?.unwrap_or_default();
        Ok(self.driver.parse_status(&reply)?)
    }

    /// Actual position of `axis`, in degrees.
    pub async fn position(&mut self, axis: usize) -> BenchResult<f64> {
        let query = self.driver.position_query();
        let link = self.axis(axis)?;
        link.clear().await?;
        let reply = link.send_command(&query).await?.unwrap_or_default();
        Ok(self.driver.parse_position(&reply)?)
    }

    /// Move `axis` to `angle` and wait until it settles.
    pub async fn set_angle(&mut self, axis: usize, angle: f64) -> BenchResult<OperationResult> {
        let commands = self.driver.move_commands(angle)?;
        let query = self.driver.status_query();

        info!(device = %self.id, axis, angle, "moving axis");
        let link = self.axis(axis)?;
        for command in &commands {
            link.send(command).await?;
        }

        let mut decode_error = None;
        let driver = &self.driver;
        let link = self
            .axes
            .get_mut(axis)
            .ok_or_else(|| BenchError::Configuration(format!("axis {} out of range", axis)))?;
        let outcome = link
            .poll_until(&query, |reply| match driver.parse_status(reply) {
                Ok(status) => status.is_settled(),
                Err(e) => {
                    decode_error = Some(e);
                    true
                }
            })
            .await?;
        if let Some(e) = decode_error {
            return Err(e.into());
        }

        let command = commands.join("; ");
        match outcome {
            PollOutcome::Done { polls, .. } => {
                debug!(device = %self.id, axis, polls, "axis settled");
                Ok(OperationResult {
                    command,
                    outcome: Outcome::Success,
                    reply: None,
                })
            }
            PollOutcome::TimedOut { waited, .. } => Ok(OperationResult {
                command,
                outcome: Outcome::OpcTimeout { waited },
                reply: None,
            }),
        }
    }

    /// Step `axis` through `range`, settling at every value.
    pub async fn set_angle_range(&mut self, axis: usize, range: &SweepRange) -> BenchResult<SweepReport> {
        self.sweep(SweepTarget::Angle { axis }, range).await
    }

    /// Halt every axis.
    pub async fn stop(&mut self) -> BenchResult<()> {
        let command = self.driver.stop_command();
        info!(device = %self.id, "stopping all axes");
        for link in &mut self.axes {
            link.send(&command).await?;
        }
        Ok(())
    }

    /// Position and status word of every axis.
    pub async fn status_report(&mut self) -> BenchResult<DeviceStatus> {
        let mut axes = Vec::with_capacity(self.axes.len());
        if self.is_connected() {
            for axis in 0..self.axes.len() {
                let status = self.status(axis).await?;
                let position = self.position(axis).await?;
                axes.push(AxisReading {
                    axis,
                    position,
                    status,
                });
            }
        }
        Ok(DeviceStatus {
            id: self.id.clone(),
            role: Role::Positioner,
            model: self.model().to_string(),
            connected: self.is_connected(),
            identity: None,
            axes,
            measurement: None,
        })
    }
}

#[async_trait]
impl Settable for Positioner {
    fn device_id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Angle, Capability::Stop, Capability::Status]
    }

    async fn apply(&mut self, operation: &Operation) -> BenchResult<OperationResult> {
        match operation {
            Operation::SetAngle { axis, value } => self.set_angle(*axis, *value).await,
            other => Err(unsupported(&self.id, other.capability())),
        }
    }
}
