//! Bench assembly from configuration.

use crate::config::BenchConfig;
use crate::device_set::DeviceSet;
use crate::devices::factory::build_device;
use crate::error::BenchResult;
use crate::registry::DeviceRegistry;
use crate::tasks::{TaskManager, TaskSnapshot};
use tracing::{info, instrument};

/// Connected instruments, their device sets and the task manager driving them.
#[derive(Debug, Clone)]
pub struct Bench {
    registry: DeviceRegistry,
    manager: TaskManager,
}

impl Bench {
    /// Connect and initialize every enabled instrument, then register the
    /// configured device sets.
    ///
    /// Instruments come up in configuration order; the first failure aborts.
    #[instrument(skip(config), fields(bench = %config.application.name))]
    pub async fn from_config(config: &BenchConfig) -> BenchResult<Self> {
        let registry = DeviceRegistry::new();
        for instrument in config.enabled_instruments() {
            let mut device = build_device(instrument).await?;
            device.initialize().await?;
            let id = registry.insert(device);
            info!(device = %instrument.id, %id, "instrument ready");
        }

        let manager = TaskManager::with_limits(config.tasks.max_steps, config.tasks.retain_finished);
        for set in &config.device_sets {
            manager.register_set(DeviceSet::from_names(&set.name, &set.members, registry.clone())?)?;
        }
        info!(
            devices = registry.len(),
            sets = config.device_sets.len(),
            "bench assembled"
        );
        Ok(Self { registry, manager })
    }

    /// Every connected instrument.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The task manager owning the device sets.
    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    /// Stop every running task and wait for them to end.
    pub async fn shutdown(&self) -> Vec<TaskSnapshot> {
        let stopped = self.manager.stop_all().await;
        info!(tasks = stopped.len(), "bench shut down");
        stopped
    }
}
