//! Device hierarchy
//!
//! Three roles specialise the Instrument Link: [`Positioner`] ("Rbd"),
//! [`Generator`] and [`NetworkAnalyzer`] ("Vna"). Each role owns its links and
//! a boxed vendor driver that only formats commands and parses replies; the
//! verification protocol and range decomposition live in the role and in the
//! [`Settable`] trait, so vendors never reimplement them.
//!
//! [`Device`] is the tagged variant the registry stores.

use crate::error::{BenchError, BenchResult};
use crate::link::OperationResult;
use crate::range::SweepRange;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

pub mod analyzer;
pub mod factory;
pub mod generator;
pub mod positioner;

pub use analyzer::{AnalyzerDriver, KeysightM9807A, NetworkAnalyzer, PlanarS50244};
pub use factory::build_device;
pub use generator::{Generator, GeneratorDriver, KeysightGen};
pub use positioner::{AxisStatus, Positioner, PositionerDriver, TesartRbd};

/// Device role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Turntable or tower drive ("Rbd")
    Positioner,
    /// Signal generator
    Generator,
    /// Vector network analyzer ("Vna")
    Analyzer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Positioner => "positioner",
            Role::Generator => "generator",
            Role::Analyzer => "analyzer",
        };
        f.write_str(name)
    }
}

/// Something a device can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Axis moves
    Angle,
    /// Stimulus frequency
    Frequency,
    /// Output power
    Power,
    /// Switch-module routing
    Path,
    /// RF output on/off
    Output,
    /// Analyzer measurement setup
    Measurement,
    /// Halting motion
    Stop,
    /// Status reporting
    Status,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Angle => "angle",
            Capability::Frequency => "frequency",
            Capability::Power => "power",
            Capability::Path => "path",
            Capability::Output => "output",
            Capability::Measurement => "measurement",
            Capability::Stop => "stop",
            Capability::Status => "status",
        };
        f.write_str(name)
    }
}

/// What an analyzer measures between its ports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementType {
    /// Through path between two ports (S21-like)
    #[default]
    Transmission,
    /// Reflection at the source port (S11-like)
    Reflection,
}

impl fmt::Display for MeasurementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementType::Transmission => f.write_str("transmission"),
            MeasurementType::Reflection => f.write_str("reflection"),
        }
    }
}

fn default_source_port() -> u32 {
    1
}

/// Measurement setup applied to an analyzer before sweeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Transmission or reflection
    #[serde(default)]
    pub kind: MeasurementType,
    /// Resolution bandwidth in Hz
    pub rbw: f64,
    /// 1-based port that drives the stimulus
    #[serde(default = "default_source_port")]
    pub source_port: u32,
    /// Stimulus comes from an external generator instead of the analyzer
    #[serde(default)]
    pub external_generator: bool,
}

impl MeasurementConfig {
    /// Check the values that do not depend on a particular analyzer.
    pub fn validate(&self) -> BenchResult<()> {
        if !self.rbw.is_finite() || self.rbw <= 0.0 {
            return Err(BenchError::Configuration(format!(
                "resolution bandwidth must be positive, got {}",
                self.rbw
            )));
        }
        if self.source_port == 0 {
            return Err(BenchError::Configuration("analyzer ports start at 1".into()));
        }
        Ok(())
    }
}

/// A single settable action on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Move one positioner axis, in degrees
    SetAngle {
        /// 0-based axis index
        axis: usize,
        /// Target angle
        value: f64,
    },
    /// Stimulus frequency in Hz
    SetFrequency {
        /// Hz
        value: f64,
    },
    /// Output power in dBm
    SetPower {
        /// dBm
        value: f64,
    },
    /// Switch path per module, in module order. `None` leaves a module as is.
    SetPath {
        /// 1-based path state per module
        paths: Vec<Option<u32>>,
    },
    /// RF output on or off
    SetOutput {
        /// Output state
        enabled: bool,
    },
    /// Analyzer measurement setup
    Configure {
        /// Setup to apply
        measurement: MeasurementConfig,
    },
}

impl Operation {
    /// Capability a device needs to take this operation.
    pub fn capability(&self) -> Capability {
        match self {
            Operation::SetAngle { .. } => Capability::Angle,
            Operation::SetFrequency { .. } => Capability::Frequency,
            Operation::SetPower { .. } => Capability::Power,
            Operation::SetPath { .. } => Capability::Path,
            Operation::SetOutput { .. } => Capability::Output,
            Operation::Configure { .. } => Capability::Measurement,
        }
    }

    /// Numeric value applied, for progress reporting.
    pub fn value(&self) -> Option<f64> {
        match self {
            Operation::SetAngle { value, .. }
            | Operation::SetFrequency { value }
            | Operation::SetPower { value } => Some(*value),
            Operation::SetPath { .. } | Operation::SetOutput { .. } | Operation::Configure { .. } => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::SetAngle { axis, value } => write!(f, "set_angle(axis {}, {})", axis, value),
            Operation::SetFrequency { value } => write!(f, "set_freq({})", value),
            Operation::SetPower { value } => write!(f, "set_power({})", value),
            Operation::SetPath { paths } => write!(f, "set_path({:?})", paths),
            Operation::SetOutput { enabled } => write!(f, "set_output({})", enabled),
            Operation::Configure { measurement } => write!(
                f,
                "configure({}, rbw {}, port {})",
                measurement.kind, measurement.rbw, measurement.source_port
            ),
        }
    }
}

/// The swept quantity of a range request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum SweepTarget {
    /// One positioner axis
    Angle {
        /// 0-based axis index
        axis: usize,
    },
    /// Stimulus frequency
    Frequency,
    /// Output power
    Power,
}

impl SweepTarget {
    /// Capability needed to sweep this quantity.
    pub fn capability(&self) -> Capability {
        match self {
            SweepTarget::Angle { .. } => Capability::Angle,
            SweepTarget::Frequency => Capability::Frequency,
            SweepTarget::Power => Capability::Power,
        }
    }

    /// The single-value operation applied at `value`.
    pub fn operation(&self, value: f64) -> Operation {
        match *self {
            SweepTarget::Angle { axis } => Operation::SetAngle { axis, value },
            SweepTarget::Frequency => Operation::SetFrequency { value },
            SweepTarget::Power => Operation::SetPower { value },
        }
    }
}

/// Fixed dimensions of a device, known without talking to it.
///
/// The registry keeps a copy so requests can be checked against every
/// member of a set before any command is sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGeometry {
    /// Positioner axes
    pub axes: usize,
    /// Analyzer switch modules
    pub switch_modules: usize,
    /// Analyzer ports
    pub ports: u32,
}

impl DeviceGeometry {
    /// Reject `operation` if it addresses an axis, switch module or port
    /// that `device` does not have.
    pub fn check(&self, device: &str, operation: &Operation) -> BenchResult<()> {
        match operation {
            Operation::SetAngle { axis, .. } if *axis >= self.axes => Err(BenchError::Configuration(format!(
                "axis {} out of range ({} has {})",
                axis, device, self.axes
            ))),
            Operation::SetPath { paths } if paths.len() > self.switch_modules => {
                Err(BenchError::Configuration(format!(
                    "{} has {} switch modules, {} paths given",
                    device,
                    self.switch_modules,
                    paths.len()
                )))
            }
            Operation::Configure { measurement } if measurement.source_port > self.ports => {
                Err(BenchError::Configuration(format!(
                    "{} has {} ports, source port {} requested",
                    device, self.ports, measurement.source_port
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Step that stopped a device-level sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    /// Step index in the range
    pub index: usize,
    /// Value of that step
    pub value: f64,
    /// Why it failed
    pub error: BenchError,
}

/// Outcome of a device-level sweep: what got applied, and what stopped it.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    /// Range as requested
    pub range: SweepRange,
    /// Values applied, in order
    pub completed: Vec<f64>,
    /// Set when a step failed
    pub failure: Option<StepFailure>,
}

impl SweepReport {
    /// Whether every step was applied.
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// Snapshot of a device for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Device name
    pub id: String,
    /// Device role
    pub role: Role,
    /// Driver model
    pub model: String,
    /// Whether every link is open
    pub connected: bool,
    /// Identification reply, when the device answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Per-axis readings for positioners
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub axes: Vec<AxisReading>,
    /// Measurement setup last applied to an analyzer
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub measurement: Option<MeasurementConfig>,
}

/// Position and status word of one positioner axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisReading {
    /// 0-based axis index
    pub axis: usize,
    /// Position in degrees
    pub position: f64,
    /// Decoded status word
    pub status: AxisStatus,
}

pub(crate) fn unsupported(device: &str, capability: Capability) -> BenchError {
    BenchError::Unsupported {
        device: device.to_string(),
        capability,
    }
}

/// Shared behaviour of every role: apply one operation, and sweep a range
/// by applying its steps in order.
#[async_trait]
pub trait Settable: Send {
    /// Device name used in logs and errors.
    fn device_id(&self) -> &str;

    /// Everything this device can be asked to do.
    fn capabilities(&self) -> Vec<Capability>;

    /// Whether `capability` is among [`capabilities`](Self::capabilities).
    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Apply one operation, verified for completion and errors.
    ///
    /// Transport failures and unsupported operations are `Err`; OPC timeouts
    /// and instrument errors come back in the [`OperationResult`].
    async fn apply(&mut self, operation: &Operation) -> BenchResult<OperationResult>;

    /// Walk `range` one verified step at a time, halting at the first failure.
    async fn sweep(&mut self, target: SweepTarget, range: &SweepRange) -> BenchResult<SweepReport> {
        if !self.supports(target.capability()) {
            return Err(unsupported(self.device_id(), target.capability()));
        }
        let values = range.steps()?;

        let mut report = SweepReport {
            range: *range,
            completed: Vec::with_capacity(values.len()),
            failure: None,
        };
        for (index, value) in values.into_iter().enumerate() {
            let outcome = match self.apply(&target.operation(value)).await {
                Ok(result) => result.into_result().map_err(BenchError::from),
                Err(e) => Err(e),
            };
            if let Err(error) = outcome {
                warn!(device = %self.device_id(), step = index, value, %error, "sweep halted");
                report.failure = Some(StepFailure {
                    index,
                    value,
                    error,
                });
                break;
            }
            report.completed.push(value);
        }
        Ok(report)
    }
}

/// A configured instrument of any role.
#[derive(Debug)]
pub enum Device {
    /// Axis drive
    Positioner(Positioner),
    /// Signal source
    Generator(Generator),
    /// Network analyzer
    Analyzer(NetworkAnalyzer),
}

impl Device {
    /// Device name.
    pub fn id(&self) -> &str {
        self.device_id()
    }

    /// Device role.
    pub fn role(&self) -> Role {
        match self {
            Device::Positioner(_) => Role::Positioner,
            Device::Generator(_) => Role::Generator,
            Device::Analyzer(_) => Role::Analyzer,
        }
    }

    /// Driver model name.
    pub fn model(&self) -> &str {
        match self {
            Device::Positioner(d) => d.model(),
            Device::Generator(d) => d.model(),
            Device::Analyzer(d) => d.model(),
        }
    }

    /// Axis, switch-module and port counts.
    pub fn geometry(&self) -> DeviceGeometry {
        match self {
            Device::Positioner(d) => DeviceGeometry {
                axes: d.axis_count(),
                ..DeviceGeometry::default()
            },
            Device::Generator(_) => DeviceGeometry::default(),
            Device::Analyzer(d) => DeviceGeometry {
                switch_modules: d.switch_module_count(),
                ports: d.port_count(),
                ..DeviceGeometry::default()
            },
        }
    }

    /// Whether every link of the device is open.
    pub fn is_connected(&self) -> bool {
        match self {
            Device::Positioner(d) => d.is_connected(),
            Device::Generator(d) => d.is_connected(),
            Device::Analyzer(d) => d.is_connected(),
        }
    }

    /// Bring the instrument into a known state after connecting.
    pub async fn initialize(&mut self) -> BenchResult<()> {
        info!(device = %self.id(), role = %self.role(), model = %self.model(), "initializing");
        match self {
            Device::Positioner(d) => d.initialize().await,
            Device::Generator(d) => d.preset().await.map(|_| ()),
            Device::Analyzer(d) => d.preset().await.map(|_| ()),
        }
    }

    /// Halt physical motion. Devices without motion report `Unsupported`.
    pub async fn stop(&mut self) -> BenchResult<()> {
        match self {
            Device::Positioner(d) => d.stop().await,
            _ => Err(unsupported(self.id(), Capability::Stop)),
        }
    }

    /// Query identity and readings.
    pub async fn status(&mut self) -> BenchResult<DeviceStatus> {
        match self {
            Device::Positioner(d) => d.status_report().await,
            Device::Generator(d) => d.status_report().await,
            Device::Analyzer(d) => d.status_report().await,
        }
    }
}

#[async_trait]
impl Settable for Device {
    fn device_id(&self) -> &str {
        match self {
            Device::Positioner(d) => d.device_id(),
            Device::Generator(d) => d.device_id(),
            Device::Analyzer(d) => d.device_id(),
        }
    }

    fn capabilities(&self) -> Vec<Capability> {
        match self {
            Device::Positioner(d) => d.capabilities(),
            Device::Generator(d) => d.capabilities(),
            Device::Analyzer(d) => d.capabilities(),
        }
    }

    async fn apply(&mut self, operation: &Operation) -> BenchResult<OperationResult> {
        match self {
            Device::Positioner(d) => d.apply(operation).await,
            Device::Generator(d) => d.apply(operation).await,
            Device::Analyzer(d) => d.apply(operation).await,
        }
    }
}
