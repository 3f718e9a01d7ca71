//! Task model
//!
//! A task is one submitted request against a named device set: a single
//! set-point or a swept range. The [`TaskManager`] validates and decomposes
//! it into ordered [`Operation`] steps, then runs those steps in the
//! background while the submitter polls or waits on the task id.

use crate::device_set::MemberFailure;
use crate::devices::{Capability, MeasurementConfig, Operation, SweepTarget};
use crate::error::{BenchError, BenchResult};
use crate::range::SweepRange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

mod manager;

pub use manager::{TaskManager, DEFAULT_MAX_STEPS, DEFAULT_RETAIN_FINISHED};

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(TaskId)
    }
}

/// Lifecycle state: `Pending -> Running -> {Completed, Failed, Stopped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted, not started
    Pending,
    /// Executing steps
    Running,
    /// Every step applied
    Completed,
    /// A step failed; later steps were not run
    Failed,
    /// Cancelled by a stop request
    Stopped,
}

impl TaskState {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Stopped)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Running, TaskState::Completed)
                | (TaskState::Running, TaskState::Failed)
                | (TaskState::Running, TaskState::Stopped)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Single set-point or swept range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// One operation
    Single,
    /// One operation per range value
    Range,
}

/// Where a cursor step moves within the last range swept on a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDirection {
    /// One value towards `stop`
    Next,
    /// One value back towards `start`
    Prev,
    /// Back to the first value
    Start,
}

impl fmt::Display for StepDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepDirection::Next => f.write_str("next"),
            StepDirection::Prev => f.write_str("prev"),
            StepDirection::Start => f.write_str("start"),
        }
    }
}

/// Position within the values of the last range a set was swept through.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepCursor {
    values: Arc<[f64]>,
    index: usize,
}

impl SweepCursor {
    /// Cursor on `values[index]`. `index` is clamped to the last value.
    pub fn new(values: Arc<[f64]>, index: usize) -> Self {
        let index = index.min(values.len().saturating_sub(1));
        Self { values, index }
    }

    /// Position of the cursor.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Value under the cursor.
    pub fn value(&self) -> Option<f64> {
        self.values.get(self.index).copied()
    }

    /// Every value of the sweep.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// The same values with the cursor on `index`.
    pub fn at(&self, index: usize) -> Self {
        Self::new(Arc::clone(&self.values), index)
    }

    /// Index reached by moving in `direction`; `None` past either end.
    pub fn target(&self, direction: StepDirection) -> Option<usize> {
        match direction {
            StepDirection::Next => Some(self.index + 1).filter(|i| *i < self.values.len()),
            StepDirection::Prev => self.index.checked_sub(1),
            StepDirection::Start => Some(0).filter(|_| !self.values.is_empty()),
        }
    }
}

/// Ordered steps of a task, and the sweep cursor they walk.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPlan {
    /// Operations in execution order
    pub steps: Vec<Operation>,
    /// Swept quantity and the cursor position of the first step. Step `i`
    /// of the plan sits on value `index + i`.
    pub cursor: Option<(SweepTarget, SweepCursor)>,
}

/// A user-level intent against a named device set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskRequest {
    /// Move one axis of every positioner
    SetAngle {
        /// Target device set
        set: String,
        /// 0-based axis, default 0
        #[serde(default)]
        axis: usize,
        /// Degrees
        value: f64,
    },
    /// Sweep one axis of every positioner
    SetAngleRange {
        /// Target device set
        set: String,
        /// 0-based axis, default 0
        #[serde(default)]
        axis: usize,
        /// Degrees
        range: SweepRange,
    },
    /// Set the stimulus frequency
    SetFreq {
        /// Target device set
        set: String,
        /// Hz
        value: f64,
    },
    /// Sweep the stimulus frequency
    SetFreqRange {
        /// Target device set
        set: String,
        /// Hz
        range: SweepRange,
    },
    /// Set the output power
    SetPower {
        /// Target device set
        set: String,
        /// dBm
        value: f64,
    },
    /// Sweep the output power
    SetPowerRange {
        /// Target device set
        set: String,
        /// dBm
        range: SweepRange,
    },
    /// Route analyzer switch modules
    SetPath {
        /// Target device set
        set: String,
        /// 1-based path state per module, `null` to leave one as is
        paths: Vec<Option<u32>>,
    },
    /// Switch RF output
    SetOutput {
        /// Target device set
        set: String,
        /// Output state
        enabled: bool,
    },
    /// Measurement setup for the analyzers of the set
    Configure {
        /// Target device set
        set: String,
        /// Setup to apply
        measurement: MeasurementConfig,
    },
    /// Move one value along the last range swept on the set
    Step {
        /// Target device set
        set: String,
        /// Which recorded sweep to follow
        sweep: SweepTarget,
        /// Where to move
        direction: StepDirection,
    },
}

impl TaskRequest {
    /// Name of the target device set.
    pub fn set_name(&self) -> &str {
        match self {
            TaskRequest::SetAngle { set, .. }
            | TaskRequest::SetAngleRange { set, .. }
            | TaskRequest::SetFreq { set, .. }
            | TaskRequest::SetFreqRange { set, .. }
            | TaskRequest::SetPower { set, .. }
            | TaskRequest::SetPowerRange { set, .. }
            | TaskRequest::SetPath { set, .. }
            | TaskRequest::SetOutput { set, .. }
            | TaskRequest::Configure { set, .. }
            | TaskRequest::Step { set, .. } => set,
        }
    }

    /// Range requests expand to many steps; everything else is one.
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskRequest::SetAngleRange { .. }
            | TaskRequest::SetFreqRange { .. }
            | TaskRequest::SetPowerRange { .. } => TaskKind::Range,
            _ => TaskKind::Single,
        }
    }

    /// What every eligible member must be able to do.
    pub fn capability(&self) -> Capability {
        match self {
            TaskRequest::SetAngle { .. } | TaskRequest::SetAngleRange { .. } => Capability::Angle,
            TaskRequest::SetFreq { .. } | TaskRequest::SetFreqRange { .. } => Capability::Frequency,
            TaskRequest::SetPower { .. } | TaskRequest::SetPowerRange { .. } => Capability::Power,
            TaskRequest::SetPath { .. } => Capability::Path,
            TaskRequest::SetOutput { .. } => Capability::Output,
            TaskRequest::Configure { .. } => Capability::Measurement,
            TaskRequest::Step { sweep, .. } => sweep.capability(),
        }
    }

    /// Swept quantity whose cursor this request reads, for cursor steps.
    pub fn cursor_target(&self) -> Option<SweepTarget> {
        match self {
            TaskRequest::Step { sweep, .. } => Some(*sweep),
            _ => None,
        }
    }

    /// Validate parameters and expand into the ordered steps to execute.
    ///
    /// `cursor` is the set's current cursor for [`cursor_target`](Self::cursor_target);
    /// a cursor step without one is a configuration error.
    pub fn plan(&self, max_steps: usize, cursor: Option<&SweepCursor>) -> BenchResult<TaskPlan> {
        let sweep = |target: SweepTarget, range: &SweepRange| -> BenchResult<TaskPlan> {
            range.validate_with_limit(max_steps)?;
            let values: Arc<[f64]> = range.steps()?.into();
            Ok(TaskPlan {
                steps: values.iter().map(|v| target.operation(*v)).collect(),
                cursor: Some((target, SweepCursor::new(values, 0))),
            })
        };
        let single = |value: f64, op: Operation| -> BenchResult<TaskPlan> {
            if !value.is_finite() {
                return Err(BenchError::Configuration(format!("{} is not a finite value", value)));
            }
            Ok(TaskPlan::once(op))
        };

        match self {
            TaskRequest::SetAngle { axis, value, .. } => single(
                *value,
                Operation::SetAngle {
                    axis: *axis,
                    value: *value,
                },
            ),
            TaskRequest::SetAngleRange { axis, range, .. } => sweep(SweepTarget::Angle { axis: *axis }, range),
            TaskRequest::SetFreq { value, .. } => single(*value, Operation::SetFrequency { value: *value }),
            TaskRequest::SetFreqRange { range, .. } => sweep(SweepTarget::Frequency, range),
            TaskRequest::SetPower { value, .. } => single(*value, Operation::SetPower { value: *value }),
            TaskRequest::SetPowerRange { range, .. } => sweep(SweepTarget::Power, range),
            TaskRequest::SetPath { paths, .. } => {
                if paths.iter().all(Option::is_none) {
                    return Err(BenchError::Configuration("no switch path given".into()));
                }
                if paths.iter().flatten().any(|p| *p == 0) {
                    return Err(BenchError::Configuration("switch path states start at 1".into()));
                }
                Ok(TaskPlan::once(Operation::SetPath { paths: paths.clone() }))
            }
            TaskRequest::SetOutput { enabled, .. } => Ok(TaskPlan::once(Operation::SetOutput { enabled: *enabled })),
            TaskRequest::Configure { measurement, .. } => {
                measurement.validate()?;
                Ok(TaskPlan::once(Operation::Configure {
                    measurement: measurement.clone(),
                }))
            }
            TaskRequest::Step {
                set,
                sweep: target,
                direction,
            } => {
                let cursor = cursor.ok_or_else(|| {
                    BenchError::Configuration(format!(
                        "no {} sweep recorded for device set '{}'",
                        target.capability(),
                        set
                    ))
                })?;
                let index = cursor.target(*direction).ok_or_else(|| {
                    BenchError::Configuration(format!(
                        "cannot step {} from point {} of {} in the {} sweep",
                        direction,
                        cursor.index() + 1,
                        cursor.values().len(),
                        target.capability()
                    ))
                })?;
                let cursor = cursor.at(index);
                let value = cursor.value().ok_or_else(|| {
                    BenchError::Configuration(format!("{} sweep has no values", target.capability()))
                })?;
                Ok(TaskPlan {
                    steps: vec![target.operation(value)],
                    cursor: Some((*target, cursor)),
                })
            }
        }
    }
}

impl TaskPlan {
    fn once(operation: Operation) -> Self {
        Self {
            steps: vec![operation],
            cursor: None,
        }
    }
}

/// Why a task failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Index of the failing step
    pub step: usize,
    /// Value of the failing step
    pub value: Option<f64>,
    /// Error category
    pub kind: String,
    /// Error text of the first failing member
    pub message: String,
    /// Per-member errors of the failing fan-out
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<MemberFailure>,
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task id
    pub id: TaskId,
    /// Single or range
    pub kind: TaskKind,
    /// Request as submitted
    pub request: TaskRequest,
    /// Target device set
    pub set: String,
    /// Lifecycle state
    pub state: TaskState,
    /// Steps the request expanded to
    pub total_steps: usize,
    /// Steps applied to every eligible member
    pub completed_steps: usize,
    /// Value of the last completed step
    pub last_value: Option<f64>,
    /// Set when the task failed
    pub failure: Option<TaskFailure>,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// First step start
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time
    pub finished_at: Option<DateTime<Utc>>,
}
