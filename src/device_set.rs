//! Device sets: many devices operated as one.
//!
//! A set fans an operation out to its members sequentially, in stored
//! order. Members lacking the capability are skipped; a member failure is
//! recorded and the remaining members still run. Nothing is rolled back.

use crate::devices::{Capability, DeviceStatus, MeasurementConfig, Operation, Settable, SweepTarget};
use crate::error::{BenchError, BenchResult};
use crate::range::SweepRange;
use crate::registry::{DeviceId, DeviceRegistry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const SETTABLE: [Capability; 6] = [
    Capability::Angle,
    Capability::Frequency,
    Capability::Power,
    Capability::Path,
    Capability::Output,
    Capability::Measurement,
];

/// Result of one member in a fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberResult {
    /// Member name
    pub device: String,
    /// Outcome on that member
    pub result: Result<(), BenchError>,
}

/// Serializable description of a failed member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberFailure {
    /// Member name
    pub device: String,
    /// Error category
    pub kind: String,
    /// Error text
    pub message: String,
}

/// Aggregate of a fan-out: per-member results plus the skipped members.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutReport {
    /// Operation as displayed
    pub operation: String,
    /// Members that ran, in order
    pub results: Vec<MemberResult>,
    /// Members lacking the capability
    pub skipped: Vec<String>,
}

impl FanOutReport {
    /// Whether every member that ran succeeded.
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|m| m.result.is_ok())
    }

    /// Names of the members that took the operation.
    pub fn succeeded(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|m| m.result.is_ok())
            .map(|m| m.device.as_str())
            .collect()
    }

    /// Failed members with their errors.
    pub fn failures(&self) -> Vec<MemberFailure> {
        self.results
            .iter()
            .filter_map(|m| match &m.result {
                Ok(()) => None,
                Err(e) => Some(MemberFailure {
                    device: m.device.clone(),
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                }),
            })
            .collect()
    }

    /// First member error, if any.
    pub fn first_error(&self) -> Option<&BenchError> {
        self.results.iter().find_map(|m| m.result.as_ref().err())
    }
}

/// Outcome of a set-level sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SetSweepReport {
    /// Range as requested
    pub range: SweepRange,
    /// Values applied to every member
    pub completed: Vec<f64>,
    /// Step index, value and fan-out report of the step that failed.
    pub failure: Option<(usize, f64, FanOutReport)>,
}

fn torn_down(device: &str) -> BenchError {
    BenchError::Configuration(format!("device '{}' was torn down", device))
}

/// Ordered, non-owning group of registry devices.
#[derive(Debug, Clone)]
pub struct DeviceSet {
    name: String,
    members: Vec<DeviceId>,
    names: Vec<String>,
    registry: DeviceRegistry,
}

impl DeviceSet {
    /// Build a set, checking every member exists and can be set.
    pub fn new(name: impl Into<String>, members: Vec<DeviceId>, registry: DeviceRegistry) -> BenchResult<Self> {
        let name = name.into();
        if members.is_empty() {
            return Err(BenchError::Configuration(format!("device set '{}' is empty", name)));
        }
        let mut names = Vec::with_capacity(members.len());
        for (index, id) in members.iter().enumerate() {
            if members[..index].contains(id) {
                return Err(BenchError::Configuration(format!(
                    "device set '{}' lists device {} twice",
                    name, id
                )));
            }
            let caps = registry.capabilities(*id).ok_or_else(|| {
                BenchError::Configuration(format!("device set '{}': no device {}", name, id))
            })?;
            if !caps.iter().any(|c| SETTABLE.contains(c)) {
                return Err(BenchError::Configuration(format!(
                    "device set '{}': device {} supports no settable operation",
                    name, id
                )));
            }
            names.push(registry.name(*id).unwrap_or_else(|| id.to_string()));
        }
        Ok(Self {
            name,
            members,
            names,
            registry,
        })
    }

    /// Build a set from device names.
    pub fn from_names(name: impl Into<String>, names: &[String], registry: DeviceRegistry) -> BenchResult<Self> {
        let name = name.into();
        let members = names
            .iter()
            .map(|n| {
                registry.lookup(n).ok_or_else(|| {
                    BenchError::Configuration(format!("device set '{}': unknown device '{}'", name, n))
                })
            })
            .collect::<BenchResult<Vec<_>>>()?;
        Self::new(name, members, registry)
    }

    /// Set name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Member ids in fan-out order.
    pub fn members(&self) -> &[DeviceId] {
        &self.members
    }

    /// Member names, parallel to [`members`](Self::members).
    pub fn member_names(&self) -> &[String] {
        &self.names
    }

    /// Members able to perform `capability`, in set order.
    ///
    /// Zero eligible members is a configuration error.
    pub fn eligible(&self, capability: Capability) -> BenchResult<Vec<DeviceId>> {
        let eligible: Vec<DeviceId> = self
            .members
            .iter()
            .copied()
            .filter(|id| self.registry.supports(*id, capability))
            .collect();
        if eligible.is_empty() {
            return Err(BenchError::Configuration(format!(
                "no member of device set '{}' supports {}",
                self.name, capability
            )));
        }
        Ok(eligible)
    }

    /// Eligible members for `operation`, after checking it against the
    /// axes, switch modules and ports of every one of them.
    ///
    /// Fails as a whole when any eligible member cannot take the operation,
    /// so nothing is sent to the others either.
    pub fn validate(&self, operation: &Operation) -> BenchResult<Vec<DeviceId>> {
        let eligible = self.eligible(operation.capability())?;
        for id in &eligible {
            if let Some(geometry) = self.registry.geometry(*id) {
                let name = self.registry.name(*id).unwrap_or_else(|| id.to_string());
                geometry.check(&name, operation)?;
            }
        }
        Ok(eligible)
    }

    /// Apply `operation` to every capable member in order.
    pub async fn execute(&self, operation: &Operation) -> BenchResult<FanOutReport> {
        let capability = operation.capability();
        self.validate(operation)?;

        let mut report = FanOutReport {
            operation: operation.to_string(),
            results: Vec::with_capacity(self.members.len()),
            skipped: Vec::new(),
        };
        for (id, device_name) in self.members.iter().zip(&self.names) {
            let result = match (self.registry.capabilities(*id), self.registry.get(*id)) {
                (Some(caps), Some(device)) => {
                    if !caps.contains(&capability) {
                        report.skipped.push(device_name.clone());
                        continue;
                    }
                    let mut device = device.lock().await;
                    debug!(set = %self.name, device = %device_name, %operation, "fan-out");
                    match device.apply(operation).await {
                        Ok(result) => result.into_result().map(|_| ()).map_err(BenchError::from),
                        Err(e) => Err(e),
                    }
                }
                _ => Err(torn_down(device_name)),
            };
            if let Err(e) = &result {
                warn!(set = %self.name, device = %device_name, %operation, error = %e, "member failed");
            }
            report.results.push(MemberResult {
                device: device_name.clone(),
                result,
            });
        }
        Ok(report)
    }

    /// Move `axis` of every positioner to `value` degrees.
    pub async fn set_angle(&self, axis: usize, value: f64) -> BenchResult<FanOutReport> {
        self.execute(&Operation::SetAngle { axis, value }).await
    }

    /// Set the frequency of every generator and analyzer.
    pub async fn set_freq(&self, value: f64) -> BenchResult<FanOutReport> {
        self.execute(&Operation::SetFrequency { value }).await
    }

    /// Set the output power of every generator and analyzer.
    pub async fn set_power(&self, value: f64) -> BenchResult<FanOutReport> {
        self.execute(&Operation::SetPower { value }).await
    }

    /// Route the switch modules of every analyzer.
    pub async fn set_path(&self, paths: Vec<Option<u32>>) -> BenchResult<FanOutReport> {
        self.execute(&Operation::SetPath { paths }).await
    }

    /// Switch RF output of every source.
    pub async fn set_output(&self, enabled: bool) -> BenchResult<FanOutReport> {
        self.execute(&Operation::SetOutput { enabled }).await
    }

    /// Apply a measurement setup to every analyzer in the set.
    pub async fn configure(&self, measurement: MeasurementConfig) -> BenchResult<FanOutReport> {
        self.execute(&Operation::Configure { measurement }).await
    }

    /// Step through `range`, fanning each value out before the next.
    /// Stops after the first step with a failing member.
    pub async fn sweep(&self, target: SweepTarget, range: &SweepRange) -> BenchResult<SetSweepReport> {
        self.validate(&target.operation(range.start))?;
        let values = range.steps()?;

        let mut report = SetSweepReport {
            range: *range,
            completed: Vec::with_capacity(values.len()),
            failure: None,
        };
        for (index, value) in values.into_iter().enumerate() {
            let step = self.execute(&target.operation(value)).await?;
            if !step.is_success() {
                report.failure = Some((index, value, step));
                break;
            }
            report.completed.push(value);
        }
        Ok(report)
    }

    /// Sweep `axis` through `range`.
    pub async fn set_angle_range(&self, axis: usize, range: &SweepRange) -> BenchResult<SetSweepReport> {
        self.sweep(SweepTarget::Angle { axis }, range).await
    }

    /// Sweep frequency through `range`.
    pub async fn set_freq_range(&self, range: &SweepRange) -> BenchResult<SetSweepReport> {
        self.sweep(SweepTarget::Frequency, range).await
    }

    /// Sweep power through `range`.
    pub async fn set_power_range(&self, range: &SweepRange) -> BenchResult<SetSweepReport> {
        self.sweep(SweepTarget::Power, range).await
    }

    /// Forward a stop to every member that can halt motion.
    ///
    /// Waits for a member's in-flight step to finish before stopping it.
    pub async fn stop(&self) -> FanOutReport {
        let mut report = FanOutReport {
            operation: "stop".to_string(),
            results: Vec::new(),
            skipped: Vec::new(),
        };
        for (id, device_name) in self.members.iter().zip(&self.names) {
            let result = match (self.registry.capabilities(*id), self.registry.get(*id)) {
                (Some(caps), Some(device)) => {
                    if !caps.contains(&Capability::Stop) {
                        report.skipped.push(device_name.clone());
                        continue;
                    }
                    device.lock().await.stop().await
                }
                _ => Err(torn_down(device_name)),
            };
            report.results.push(MemberResult {
                device: device_name.clone(),
                result,
            });
        }
        info!(set = %self.name, stopped = report.results.len(), "stop forwarded");
        report
    }

    /// Status of every member, in set order.
    pub async fn status(&self) -> Vec<BenchResult<DeviceStatus>> {
        let mut statuses = Vec::with_capacity(self.members.len());
        for (id, device_name) in self.members.iter().zip(&self.names) {
            let status = match self.registry.get(*id) {
                None => Err(torn_down(device_name)),
                Some(device) => device.lock().await.status().await,
            };
            statuses.push(status);
        }
        statuses
    }
}
