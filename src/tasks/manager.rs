//! Background execution of bench tasks.
//!
//! Every task runs on its own tokio task with a child of the manager's
//! shutdown token. Stopping one task cancels its child token; `stop_all`
//! cancels the parent and installs a fresh one for later submissions.

use super::{StepDirection, SweepCursor, TaskFailure, TaskId, TaskPlan, TaskRequest, TaskSnapshot, TaskState};
use crate::device_set::{DeviceSet, FanOutReport};
use crate::devices::{MeasurementConfig, SweepTarget};
use crate::error::{BenchError, BenchResult, TaskError};
use crate::range::SweepRange;
use crate::registry::DeviceId;
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Default upper bound on steps a range task may expand to.
pub const DEFAULT_MAX_STEPS: usize = 10_000;

/// Default number of finished tasks kept for status queries.
pub const DEFAULT_RETAIN_FINISHED: usize = 1000;

struct TaskEntry {
    snapshot: TaskSnapshot,
    devices: Vec<DeviceId>,
    cancel: CancellationToken,
    updates: watch::Receiver<TaskSnapshot>,
}

type CursorKey = (String, SweepTarget);

struct Inner {
    sets: RwLock<HashMap<String, DeviceSet>>,
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
    cursors: Mutex<HashMap<CursorKey, SweepCursor>>,
    /// Parent of every task token. Lock order: `tasks` before `shutdown`.
    shutdown: Mutex<CancellationToken>,
    max_steps: usize,
    retain_finished: usize,
}

/// Accepts task requests, runs them in the background and tracks their state.
///
/// Cloning gives another handle to the same manager.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STEPS)
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("sets", &self.set_names())
            .field("tasks", &self.lock_tasks().len())
            .field("max_steps", &self.inner.max_steps)
            .field("retain_finished", &self.inner.retain_finished)
            .finish()
    }
}

impl TaskManager {
    /// Manager expanding ranges to at most `max_steps` steps.
    pub fn new(max_steps: usize) -> Self {
        Self::with_limits(max_steps, DEFAULT_RETAIN_FINISHED)
    }

    /// Manager that also keeps at most `retain_finished` finished tasks,
    /// dropping the oldest first.
    pub fn with_limits(max_steps: usize, retain_finished: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                sets: RwLock::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                cursors: Mutex::new(HashMap::new()),
                shutdown: Mutex::new(CancellationToken::new()),
                max_steps,
                retain_finished: retain_finished.max(1),
            }),
        }
    }

    /// Step limit for range tasks.
    pub fn max_steps(&self) -> usize {
        self.inner.max_steps
    }

    /// Finished tasks kept before the oldest are dropped.
    pub fn retain_finished(&self) -> usize {
        self.inner.retain_finished
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<TaskId, TaskEntry>> {
        self.inner.tasks.lock()
    }

    /// Make `set` addressable by name.
    pub fn register_set(&self, set: DeviceSet) -> BenchResult<()> {
        let mut sets = self.inner.sets.write();
        if sets.contains_key(set.name()) {
            return Err(BenchError::Configuration(format!(
                "device set '{}' already registered",
                set.name()
            )));
        }
        info!(set = %set.name(), members = ?set.member_names(), "device set registered");
        sets.insert(set.name().to_string(), set);
        Ok(())
    }

    /// Registered set called `name`.
    pub fn set(&self, name: &str) -> Option<DeviceSet> {
        self.inner.sets.read().get(name).cloned()
    }

    /// Names of all registered sets, sorted.
    pub fn set_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.sets.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Position of `set` within the last `target` range it was driven through.
    pub fn cursor(&self, set: &str, target: SweepTarget) -> Option<SweepCursor> {
        self.inner.cursors.lock().get(&(set.to_string(), target)).cloned()
    }

    /// Validate `request` and start it in the background.
    ///
    /// Every validation failure is returned here and no task is created,
    /// including an axis, switch module or port that any eligible member
    /// lacks. A request touching a device that an unfinished task already
    /// uses is rejected with [`TaskError::DeviceBusy`].
    pub fn submit(&self, request: TaskRequest) -> BenchResult<TaskId> {
        let set = self
            .set(request.set_name())
            .ok_or_else(|| TaskError::UnknownDeviceSet(request.set_name().to_string()))?;
        let cursor = request
            .cursor_target()
            .and_then(|target| self.cursor(set.name(), target));
        let plan = request.plan(self.inner.max_steps, cursor.as_ref())?;
        let first = plan
            .steps
            .first()
            .ok_or_else(|| BenchError::Configuration("task has no steps".into()))?;
        // Range steps only differ in value, so the first one stands for all.
        let devices = set.validate(first)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BenchError::Configuration(format!("no async runtime for task: {}", e)))?;

        let id = TaskId::new();
        let snapshot = TaskSnapshot {
            id,
            kind: request.kind(),
            set: set.name().to_string(),
            request: request.clone(),
            state: TaskState::Pending,
            total_steps: plan.steps.len(),
            completed_steps: 0,
            last_value: None,
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        let (tx, updates) = watch::channel(snapshot.clone());
        let cancel = {
            let mut tasks = self.lock_tasks();
            if let Some((task, device)) = find_busy(&tasks, &devices) {
                let device = set
                    .members()
                    .iter()
                    .zip(set.member_names())
                    .find(|(member, _)| **member == device)
                    .map(|(_, name)| name.clone())
                    .unwrap_or_else(|| device.to_string());
                return Err(TaskError::DeviceBusy { device, task }.into());
            }

            let cancel = self.inner.shutdown.lock().child_token();
            tasks.insert(
                id,
                TaskEntry {
                    snapshot,
                    devices,
                    cancel: cancel.clone(),
                    updates,
                },
            );
            cancel
        };
        info!(task = %id, set = %set.name(), steps = plan.steps.len(), request = ?request, "task submitted");

        let inner = Arc::clone(&self.inner);
        let span = info_span!("task", task = %id);
        runtime.spawn(run_task(inner, id, set, plan, cancel, tx).instrument(span));
        Ok(id)
    }

    /// Submit [`TaskRequest::SetAngle`].
    pub fn set_angle_task(&self, set: &str, axis: usize, value: f64) -> BenchResult<TaskId> {
        self.submit(TaskRequest::SetAngle {
            set: set.to_string(),
            axis,
            value,
        })
    }

    /// Submit [`TaskRequest::SetAngleRange`].
    pub fn set_angle_range_task(&self, set: &str, axis: usize, range: SweepRange) -> BenchResult<TaskId> {
        self.submit(TaskRequest::SetAngleRange {
            set: set.to_string(),
            axis,
            range,
        })
    }

    /// Submit [`TaskRequest::SetFreq`].
    pub fn set_freq_task(&self, set: &str, value: f64) -> BenchResult<TaskId> {
        self.submit(TaskRequest::SetFreq {
            set: set.to_string(),
            value,
        })
    }

    /// Submit [`TaskRequest::SetFreqRange`].
    pub fn set_freq_range_task(&self, set: &str, range: SweepRange) -> BenchResult<TaskId> {
        self.submit(TaskRequest::SetFreqRange {
            set: set.to_string(),
            range,
        })
    }

    /// Submit [`TaskRequest::SetPower`].
    pub fn set_power_task(&self, set: &str, value: f64) -> BenchResult<TaskId> {
        self.submit(TaskRequest::SetPower {
            set: set.to_string(),
            value,
        })
    }

    /// Submit [`TaskRequest::SetPowerRange`].
    pub fn set_power_range_task(&self, set: &str, range: SweepRange) -> BenchResult<TaskId> {
        self.submit(TaskRequest::SetPowerRange {
            set: set.to_string(),
            range,
        })
    }

    /// Submit [`TaskRequest::SetPath`].
    pub fn set_path_task(&self, set: &str, paths: Vec<Option<u32>>) -> BenchResult<TaskId> {
        self.submit(TaskRequest::SetPath {
            set: set.to_string(),
            paths,
        })
    }

    /// Submit [`TaskRequest::SetOutput`].
    pub fn set_output_task(&self, set: &str, enabled: bool) -> BenchResult<TaskId> {
        self.submit(TaskRequest::SetOutput {
            set: set.to_string(),
            enabled,
        })
    }

    /// Submit [`TaskRequest::Configure`].
    pub fn configure_task(&self, set: &str, measurement: MeasurementConfig) -> BenchResult<TaskId> {
        self.submit(TaskRequest::Configure {
            set: set.to_string(),
            measurement,
        })
    }

    /// Move `set` one point along the last `sweep` range it ran.
    pub fn step_task(&self, set: &str, sweep: SweepTarget, direction: StepDirection) -> BenchResult<TaskId> {
        self.submit(TaskRequest::Step {
            set: set.to_string(),
            sweep,
            direction,
        })
    }

    /// Current snapshot of `id`.
    pub fn status(&self, id: TaskId) -> BenchResult<TaskSnapshot> {
        self.lock_tasks()
            .get(&id)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| TaskError::NotFound(id).into())
    }

    /// All known tasks, oldest first.
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<TaskSnapshot> = self
            .lock_tasks()
            .values()
            .map(|entry| entry.snapshot.clone())
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Request cancellation of an unfinished task.
    ///
    /// The step in flight finishes; the task then forwards a stop to its
    /// devices and ends `Stopped`, also when that step was the last one.
    /// Returns the state at the time of the call.
    pub fn stop(&self, id: TaskId) -> BenchResult<TaskState> {
        let tasks = self.lock_tasks();
        let entry = tasks.get(&id).ok_or(TaskError::NotFound(id))?;
        let state = entry.snapshot.state;
        if state.is_terminal() {
            return Err(TaskError::AlreadyFinished { id, state }.into());
        }
        entry.cancel.cancel();
        info!(task = %id, %state, "stop requested");
        Ok(state)
    }

    /// Wait until `id` reaches a terminal state.
    ///
    /// The final snapshot is returned even when retention has already
    /// dropped the task from the table.
    pub async fn wait(&self, id: TaskId) -> BenchResult<TaskSnapshot> {
        let mut rx = self
            .lock_tasks()
            .get(&id)
            .map(|entry| entry.updates.clone())
            .ok_or(TaskError::NotFound(id))?;
        let result = match rx.wait_for(|snapshot| snapshot.state.is_terminal()).await {
            Ok(snapshot) => Ok(snapshot.clone()),
            // Executor gone without a terminal update; the table is final then.
            Err(_) => self.status(id),
        };
        result
    }

    /// Stop every unfinished task and wait for all of them to end.
    ///
    /// Cancels the shared parent token, so every task submitted before
    /// this call is stopped. Later submissions get a fresh parent.
    pub async fn stop_all(&self) -> Vec<TaskSnapshot> {
        let running: Vec<TaskId> = {
            let tasks = self.lock_tasks();
            let parent = std::mem::replace(&mut *self.inner.shutdown.lock(), CancellationToken::new());
            parent.cancel();
            tasks
                .values()
                .filter(|entry| !entry.snapshot.state.is_terminal())
                .map(|entry| entry.snapshot.id)
                .collect()
        };
        if !running.is_empty() {
            info!(count = running.len(), "stopping all tasks");
        }
        futures::future::join_all(running.into_iter().map(|id| self.wait(id)))
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }

    /// Drop finished tasks from the table. Returns how many were removed.
    pub fn purge_finished(&self) -> usize {
        let mut tasks = self.lock_tasks();
        let before = tasks.len();
        tasks.retain(|_, entry| !entry.snapshot.state.is_terminal());
        let removed = before - tasks.len();
        if removed > 0 {
            debug!(removed, "finished tasks purged");
        }
        removed
    }
}

/// First unfinished task holding any of `devices`.
fn find_busy(tasks: &HashMap<TaskId, TaskEntry>, devices: &[DeviceId]) -> Option<(TaskId, DeviceId)> {
    tasks
        .values()
        .filter(|entry| !entry.snapshot.state.is_terminal())
        .find_map(|entry| {
            devices
                .iter()
                .find(|d| entry.devices.contains(*d))
                .map(|d| (entry.snapshot.id, *d))
        })
}

/// Remove the oldest finished tasks beyond `keep`.
fn prune_finished(tasks: &mut HashMap<TaskId, TaskEntry>, keep: usize) -> usize {
    let mut finished: Vec<(TaskId, chrono::DateTime<Utc>)> = tasks
        .values()
        .filter(|entry| entry.snapshot.state.is_terminal())
        .map(|entry| {
            let at = entry.snapshot.finished_at.unwrap_or(entry.snapshot.created_at);
            (entry.snapshot.id, at)
        })
        .collect();
    if finished.len() <= keep {
        return 0;
    }
    finished.sort_by_key(|(_, at)| *at);
    let excess = finished.len() - keep;
    for (id, _) in finished.into_iter().take(excess) {
        tasks.remove(&id);
    }
    excess
}

impl Inner {
    fn update(&self, id: TaskId, tx: &watch::Sender<TaskSnapshot>, f: impl FnOnce(&mut TaskSnapshot)) {
        let mut tasks = self.tasks.lock();
        if let Some(entry) = tasks.get_mut(&id) {
            f(&mut entry.snapshot);
            tx.send_replace(entry.snapshot.clone());
        }
    }

    /// Move `id` to `next`, ignoring transitions the state machine forbids.
    fn transition(&self, id: TaskId, next: TaskState, tx: &watch::Sender<TaskSnapshot>) {
        let mut tasks = self.tasks.lock();
        self.transition_locked(&mut tasks, id, next, tx);
    }

    /// Mark `id` completed unless a stop arrived first.
    ///
    /// The check shares the table lock with [`TaskManager::stop`], so a stop
    /// accepted while the task was running can never end up `Completed`.
    fn complete(&self, id: TaskId, cancel: &CancellationToken, tx: &watch::Sender<TaskSnapshot>) -> bool {
        let mut tasks = self.tasks.lock();
        if cancel.is_cancelled() {
            return false;
        }
        self.transition_locked(&mut tasks, id, TaskState::Completed, tx);
        true
    }

    fn transition_locked(
        &self,
        tasks: &mut HashMap<TaskId, TaskEntry>,
        id: TaskId,
        next: TaskState,
        tx: &watch::Sender<TaskSnapshot>,
    ) {
        let Some(entry) = tasks.get_mut(&id) else {
            return;
        };
        let current = entry.snapshot.state;
        if !current.can_transition_to(next) {
            warn!(task = %id, from = %current, to = %next, "invalid task transition ignored");
            return;
        }
        entry.snapshot.state = next;
        let now = Utc::now();
        match next {
            TaskState::Running => entry.snapshot.started_at = Some(now),
            s if s.is_terminal() => entry.snapshot.finished_at = Some(now),
            _ => {}
        }
        tx.send_replace(entry.snapshot.clone());
        if next.is_terminal() {
            let pruned = prune_finished(tasks, self.retain_finished);
            if pruned > 0 {
                debug!(pruned, "oldest finished tasks dropped");
            }
        }
    }

    fn record_cursor(&self, set: &str, target: SweepTarget, cursor: SweepCursor) {
        self.cursors.lock().insert((set.to_string(), target), cursor);
    }
}

fn failure_from_report(step: usize, value: Option<f64>, report: &FanOutReport) -> TaskFailure {
    let (kind, message) = report
        .first_error()
        .map(|e| (e.kind().to_string(), e.to_string()))
        .unwrap_or_else(|| ("protocol".to_string(), "step failed".to_string()));
    TaskFailure {
        step,
        value,
        kind,
        message,
        members: report.failures(),
    }
}

async fn halt(inner: &Inner, id: TaskId, set: &DeviceSet, tx: &watch::Sender<TaskSnapshot>, completed: usize) {
    let report = set.stop().await;
    if !report.is_success() {
        warn!(task = %id, failures = ?report.failures(), "stop not accepted by every device");
    }
    inner.transition(id, TaskState::Stopped, tx);
    info!(task = %id, completed, "task stopped");
}

async fn run_task(
    inner: Arc<Inner>,
    id: TaskId,
    set: DeviceSet,
    plan: TaskPlan,
    cancel: CancellationToken,
    tx: watch::Sender<TaskSnapshot>,
) {
    inner.transition(id, TaskState::Running, &tx);
    info!(task = %id, set = %set.name(), "task running");
    let steps = plan.steps;

    for (index, operation) in steps.iter().enumerate() {
        if cancel.is_cancelled() {
            halt(&inner, id, &set, &tx, index).await;
            return;
        }

        let value = operation.value();
        let failure = match set.execute(operation).await {
            Ok(report) if report.is_success() => None,
            Ok(report) => Some(failure_from_report(index, value, &report)),
            Err(e) => Some(TaskFailure {
                step: index,
                value,
                kind: e.kind().to_string(),
                message: e.to_string(),
                members: Vec::new(),
            }),
        };

        match failure {
            None => {
                if let Some((target, cursor)) = &plan.cursor {
                    inner.record_cursor(set.name(), *target, cursor.at(cursor.index() + index));
                }
                inner.update(id, &tx, |snapshot| {
                    snapshot.completed_steps = index + 1;
                    snapshot.last_value = value;
                });
                debug!(task = %id, step = index, %operation, "step done");
            }
            Some(failure) => {
                warn!(task = %id, step = index, error = %failure.message, "task failed");
                inner.update(id, &tx, |snapshot| snapshot.failure = Some(failure));
                inner.transition(id, TaskState::Failed, &tx);
                return;
            }
        }
    }

    if inner.complete(id, &cancel, &tx) {
        info!(task = %id, steps = steps.len(), "task completed");
    } else {
        halt(&inner, id, &set, &tx, steps.len()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;
    use crate::devices::{Device, Generator, KeysightGen, Operation};
    use crate::link::{InstrumentLink, LinkConfig};
    use crate::registry::DeviceRegistry;
    use crate::tasks::TaskKind;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn generator_set(names: &[&str]) -> (TaskManager, Vec<MockTransport>) {
        generator_set_in(TaskManager::new(100), names)
    }

    fn generator_set_in(manager: TaskManager, names: &[&str]) -> (TaskManager, Vec<MockTransport>) {
        let registry = DeviceRegistry::new();
        let mut mocks = Vec::new();
        let mut ids = Vec::new();
        for name in names {
            let mock = MockTransport::new(*name);
            let config = LinkConfig {
                opc_poll_interval: Duration::from_millis(1),
                opc_timeout: Duration::from_millis(30),
                ..LinkConfig::default()
            };
            let link = InstrumentLink::new(*name, Box::new(mock.clone()), config);
            ids.push(registry.insert(Device::Generator(Generator::new(*name, link, Box::new(KeysightGen)))));
            mocks.push(mock);
        }
        manager
            .register_set(DeviceSet::new("gens", ids, registry).unwrap())
            .unwrap();
        (manager, mocks)
    }

    #[tokio::test]
    async fn test_single_task_completes() {
        let (manager, mocks) = generator_set(&["gen_a"]);
        let id = manager.set_freq_task("gens", 2.4e9).unwrap();
        let snapshot = manager.wait(id).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Completed);
        assert_eq!(snapshot.kind, TaskKind::Single);
        assert_eq!(snapshot.completed_steps, 1);
        assert_eq!(snapshot.last_value, Some(2.4e9));
        assert!(snapshot.started_at.is_some() && snapshot.finished_at.is_some());
        assert_eq!(mocks[0].setting_commands(), vec![":FREQ 2400000000".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_set_rejected() {
        let (manager, _) = generator_set(&["gen_a"]);
        let err = assert_err!(manager.set_freq_task("nope", 1.0));
        assert_eq!(err, BenchError::Task(TaskError::UnknownDeviceSet("nope".into())));
        assert!(manager.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_ineligible_request_rejected() {
        let (manager, _) = generator_set(&["gen_a"]);
        let err = manager.set_angle_task("gens", 0, 10.0).unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert!(manager.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_and_finished() {
        let (manager, _) = generator_set(&["gen_a"]);
        let missing = TaskId::new();
        assert_eq!(
            manager.stop(missing).unwrap_err(),
            BenchError::Task(TaskError::NotFound(missing))
        );

        let id = assert_ok!(manager.set_output_task("gens", true));
        manager.wait(id).await.unwrap();
        assert_eq!(
            manager.stop(id).unwrap_err(),
            BenchError::Task(TaskError::AlreadyFinished {
                id,
                state: TaskState::Completed
            })
        );
    }

    #[tokio::test]
    async fn test_purge_keeps_unfinished() {
        let (manager, mocks) = generator_set(&["gen_a"]);
        let done = manager.set_power_task("gens", -10.0).unwrap();
        manager.wait(done).await.unwrap();

        let _stuck = mocks[0].clone().never_complete();
        let slow = manager.set_power_task("gens", -5.0).unwrap();
        assert_eq!(manager.purge_finished(), 1);
        assert!(manager.status(done).is_err());
        assert!(manager.status(slow).is_ok());
        assert_eq!(manager.wait(slow).await.unwrap().state, TaskState::Failed);
    }

    #[test]
    fn test_submit_outside_runtime_is_an_error() {
        let (manager, _) = generator_set(&["gen_a"]);
        let err = manager.set_freq_task("gens", 1.0e9).unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert!(manager.tasks().is_empty());
    }

    #[test]
    fn test_duplicate_set_rejected() {
        let (manager, _) = generator_set(&["gen_a"]);
        let set = manager.set("gens").unwrap();
        assert!(manager.register_set(set).is_err());
        assert_eq!(manager.set_names(), vec!["gens".to_string()]);
    }

    #[tokio::test]
    async fn test_step_walks_the_last_range() {
        let (manager, mocks) = generator_set(&["gen_a"]);
        let range = manager
            .set_freq_range_task("gens", SweepRange::new(1.0e9, 3.0e9, 1.0e9))
            .unwrap();
        manager.wait(range).await.unwrap();
        let cursor = manager.cursor("gens", SweepTarget::Frequency).unwrap();
        assert_eq!(cursor.index(), 2);

        let err = manager
            .step_task("gens", SweepTarget::Frequency, StepDirection::Next)
            .unwrap_err();
        assert_eq!(err.kind(), "configuration");

        mocks[0].clear_log();
        for direction in [StepDirection::Prev, StepDirection::Prev] {
            let id = manager.step_task("gens", SweepTarget::Frequency, direction).unwrap();
            assert_eq!(manager.wait(id).await.unwrap().state, TaskState::Completed);
        }
        assert_eq!(
            mocks[0].setting_commands(),
            vec![":FREQ 2000000000".to_string(), ":FREQ 1000000000".to_string()]
        );
        assert!(manager
            .step_task("gens", SweepTarget::Frequency, StepDirection::Prev)
            .is_err());

        let id = manager
            .step_task("gens", SweepTarget::Frequency, StepDirection::Start)
            .unwrap();
        let snapshot = manager.wait(id).await.unwrap();
        assert_eq!(snapshot.last_value, Some(1.0e9));
        assert!(manager.cursor("gens", SweepTarget::Power).is_none());
    }

    #[tokio::test]
    async fn test_step_without_sweep_rejected() {
        let (manager, _) = generator_set(&["gen_a"]);
        let err = manager
            .step_task("gens", SweepTarget::Power, StepDirection::Next)
            .unwrap_err();
        assert!(err.to_string().contains("no power sweep recorded for device set 'gens'"));
        assert!(manager.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_configure_needs_an_analyzer() {
        let (manager, mocks) = generator_set(&["gen_a"]);
        let measurement = MeasurementConfig {
            kind: Default::default(),
            rbw: 1.0e3,
            source_port: 1,
            external_generator: false,
        };
        let err = manager.configure_task("gens", measurement).unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert!(mocks[0].commands().is_empty());
    }

    #[tokio::test]
    async fn test_retention_drops_oldest_finished() {
        let (manager, _) = generator_set_in(TaskManager::with_limits(100, 2), &["gen_a"]);
        let mut ids = Vec::new();
        for value in [-10.0, -9.0, -8.0] {
            let id = manager.set_power_task("gens", value).unwrap();
            let snapshot = manager.wait(id).await.unwrap();
            assert_eq!(snapshot.state, TaskState::Completed);
            ids.push(id);
        }
        assert_eq!(manager.tasks().len(), 2);
        assert!(manager.status(ids[0]).is_err());
        assert!(manager.status(ids[2]).is_ok());
    }

    #[tokio::test]
    async fn test_stop_all_leaves_later_tasks_running() {
        let (manager, mocks) = generator_set(&["gen_a"]);
        let _slow = mocks[0].clone().with_latency(5);
        manager
            .set_power_range_task("gens", SweepRange::new(-30.0, 0.0, 1.0))
            .unwrap();
        let stopped = manager.stop_all().await;
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].state, TaskState::Stopped);

        let _ = mocks[0].clone().with_latency(0);
        let id = manager.set_power_task("gens", -1.0).unwrap();
        assert_eq!(manager.wait(id).await.unwrap().state, TaskState::Completed);
    }

    #[test]
    fn test_operation_value_feeds_cursor() {
        let cursor = SweepCursor::new(vec![0.0, 0.5].into(), 0);
        let next = cursor.at(cursor.index() + 1);
        assert_eq!(SweepTarget::Power.operation(next.value().unwrap()), Operation::SetPower { value: 0.5 });
    }
}
