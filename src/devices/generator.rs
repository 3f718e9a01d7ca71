//! Signal generator role.

use super::{unsupported, Capability, DeviceStatus, Operation, Role, Settable, SweepReport, SweepTarget};
use crate::cmd_args;
use crate::error::BenchResult;
use crate::link::{Command, InstrumentLink, OperationResult};
use crate::range::SweepRange;
use async_trait::async_trait;
use std::fmt;

/// Vendor command grammar of a generator.
pub trait GeneratorDriver: Send + Sync + fmt::Debug {
    /// Model name as used in the config.
    fn model(&self) -> &'static str;

    /// CW frequency in Hz.
    fn frequency_command(&self, hz: f64) -> BenchResult<String>;

    /// Output level in dBm.
    fn power_command(&self, dbm: f64) -> BenchResult<String>;

    /// RF output on or off.
    fn output_command(&self, enabled: bool) -> String;

    /// Commands that bring the generator to its default state with RF off.
    fn preset_commands(&self) -> Vec<String>;
}

/// Keysight analog/vector signal generators (MXG/EXG family).
#[derive(Debug, Clone, Copy, Default)]
pub struct KeysightGen;

impl GeneratorDriver for KeysightGen {
    fn model(&self) -> &'static str {
        "keysight"
    }

    fn frequency_command(&self, hz: f64) -> BenchResult<String> {
        Command::render(":FREQ {hz}", &cmd_args! { "hz" => hz })
    }

    fn power_command(&self, dbm: f64) -> BenchResult<String> {
        Command::render(":SOURCE:POWER {dbm}", &cmd_args! { "dbm" => dbm })
    }

    fn output_command(&self, enabled: bool) -> String {
        format!("OUTPUT:STATE {}", if enabled { "ON" } else { "OFF" })
    }

    fn preset_commands(&self) -> Vec<String> {
        vec![
            "SYSTEM:PRESET".to_string(),
            ":MODULATION:STATE OFF".to_string(),
            self.output_command(false),
        ]
    }
}

/// A generator: one link plus its vendor grammar.
#[derive(Debug)]
pub struct Generator {
    id: String,
    link: InstrumentLink,
    driver: Box<dyn GeneratorDriver>,
}

impl Generator {
    /// Generator called `id` on `link`.
    pub fn new(id: impl Into<String>, link: InstrumentLink, driver: Box<dyn GeneratorDriver>) -> Self {
        Self {
            id: id.into(),
            link,
            driver,
        }
    }

    /// Driver model name.
    pub fn model(&self) -> &str {
        self.driver.model()
    }

    /// Whether the link is open.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Set the stimulus frequency, verified.
    pub async fn set_freq(&mut self, hz: f64) -> BenchResult<OperationResult> {
        let command = self.driver.frequency_command(hz)?;
        Ok(self.link.send_wait_err(&command).await?)
    }

    /// Step the frequency through `range`.
    pub async fn set_freq_range(&mut self, range: &SweepRange) -> BenchResult<SweepReport> {
        self.sweep(SweepTarget::Frequency, range).await
    }

    /// Set the output level, verified.
    pub async fn set_power(&mut self, dbm: f64) -> BenchResult<OperationResult> {
        let command = self.driver.power_command(dbm)?;
        Ok(self.link.send_wait_err(&command).await?)
    }

    /// Step the output level through `range`.
    pub async fn set_power_range(&mut self, range: &SweepRange) -> BenchResult<SweepReport> {
        self.sweep(SweepTarget::Power, range).await
    }

    /// Switch RF output.
    pub async fn set_output(&mut self, enabled: bool) -> BenchResult<OperationResult> {
        let command = self.driver.output_command(enabled);
        Ok(self.link.send_wait_err(&command).await?)
    }

    /// Restore the default state.
    pub async fn preset(&mut self) -> BenchResult<OperationResult> {
        let commands = self.driver.preset_commands();
        Ok(self.link.send_sequence(&commands).await?)
    }

    /// Identity and last applied setup.
    pub async fn status_report(&mut self) -> BenchResult<DeviceStatus> {
        let identity = if self.link.is_connected() {
            Some(self.link.idn().await?)
        } else {
            None
        };
        Ok(DeviceStatus {
            id: self.id.clone(),
            role: Role::Generator,
            model: self.model().to_string(),
            connected: self.link.is_connected(),
            identity,
            axes: Vec::new(),
            measurement: None,
        })
    }
}

#[async_trait]
impl Settable for Generator {
    fn device_id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![
            Capability::Frequency,
            Capability::Power,
            Capability::Output,
            Capability::Status,
        ]
    }

    async fn apply(&mut self, operation: &Operation) -> BenchResult<OperationResult> {
        match operation {
            Operation::SetFrequency { value } => self.set_freq(*value).await,
            Operation::SetPower { value } => self.set_power(*value).await,
            Operation::SetOutput { enabled } => self.set_output(*enabled).await,
            other => Err(unsupported(&self.id, other.capability())),
        }
    }
}
