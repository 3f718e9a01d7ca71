//! Network analyzer role.
//!
//! Frequency on an analyzer is a sweep span; a single frequency is a span of
//! one point. Power is applied to every source port. Analyzers fitted with
//! switch modules additionally route signal paths.

use super::{
    unsupported, Capability, DeviceStatus, MeasurementConfig, Operation, Role, Settable, SweepReport,
    SweepTarget,
};
use crate::cmd_args;
use crate::error::{BenchError, BenchResult};
use crate::link::{Command, InstrumentLink, OperationResult};
use crate::range::SweepRange;
use async_trait::async_trait;
use std::fmt;
use tracing::debug;

/// Vendor command grammar of a network analyzer.
pub trait AnalyzerDriver: Send + Sync + fmt::Debug {
    /// Model name as used in the config.
    fn model(&self) -> &'static str;

    /// Number of test ports.
    fn port_count(&self) -> u32;

    /// Number of path switch modules. Zero means no path routing.
    fn switch_modules(&self) -> usize {
        0
    }

    /// Commands that set the stimulus to `points` points from `start` to `stop`.
    fn span_commands(&self, start: f64, stop: f64, points: u32) -> BenchResult<Vec<String>>;

    /// Source power of `port` (1-based).
    fn power_command(&self, port: u32, dbm: f64) -> BenchResult<String>;

    /// Route switch module `module` (1-based) to path state `path`.
    fn path_command(&self, module: usize, _path: u32) -> BenchResult<String> {
        Err(BenchError::Configuration(format!(
            "{} has no switch module {}",
            self.model(),
            module
        )))
    }

    /// Sent once after path changes to re-arm the measurement.
    fn path_commit_command(&self) -> Option<String> {
        None
    }

    /// RF output on or off.
    fn output_command(&self, enabled: bool) -> String;

    /// Commands that restore the default state.
    fn preset_commands(&self) -> Vec<String>;

    /// Reference, trigger and bandwidth setup for a measurement.
    fn configure_commands(&self, measurement: &MeasurementConfig) -> BenchResult<Vec<String>>;
}

/// Keysight M9807A PXIe analyzer with M9157 switch modules.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeysightM9807A;

impl KeysightM9807A {
    /// Test ports of the chassis.
    pub const PORTS: u32 = 8;
    /// M9157 modules in the chassis.
    pub const SWITCH_MODULES: usize = 4;
}

impl AnalyzerDriver for KeysightM9807A {
    fn model(&self) -> &'static str {
        "m9807a"
    }

    fn port_count(&self) -> u32 {
        Self::PORTS
    }

    fn switch_modules(&self) -> usize {
        Self::SWITCH_MODULES
    }

    fn span_commands(&self, start: f64, stop: f64, points: u32) -> BenchResult<Vec<String>> {
        Ok(vec![
            Command::render(":SENSe:FREQuency:STARt {hz}", &cmd_args! { "hz" => start })?,
            Command::render(":SENSe:FREQuency:STOP {hz}", &cmd_args! { "hz" => stop })?,
            Command::render(":SENSe:SWEep:POINts {n}", &cmd_args! { "n" => points })?,
        ])
    }

    fn power_command(&self, port: u32, dbm: f64) -> BenchResult<String> {
        Command::render(
            ":SOURce:POWer{port}:LEVel:IMMediate:AMPLitude {dbm},\"Port {port}\"",
            &cmd_args! { "port" => port, "dbm" => dbm },
        )
    }

    fn path_command(&self, module: usize, path: u32) -> BenchResult<String> {
        Command::render(
            "SENS:SWIT:M9157:MOD{module}:SWIT:PATH STAT{path}",
            &cmd_args! { "module" => module, "path" => path },
        )
    }

    fn path_commit_command(&self) -> Option<String> {
        Some("INIT".to_string())
    }

    fn output_command(&self, enabled: bool) -> String {
        format!(":OUTPut:STATe {}", if enabled { "ON" } else { "OFF" })
    }

    fn preset_commands(&self) -> Vec<String> {
        vec![":SYSTEM:PRESET".to_string()]
    }

    fn configure_commands(&self, measurement: &MeasurementConfig) -> BenchResult<Vec<String>> {
        Ok(vec![
            ":SENSE:ROSC:SOUR PXIBackplane".to_string(),
            ":SENSe:SWEep:MODE HOLD".to_string(),
            Command::render(
                ":SENSe:BANDwidth:RESolution {rbw}",
                &cmd_args! { "rbw" => measurement.rbw },
            )?,
        ])
    }
}

/// Planar S50244 two-port analyzer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanarS50244;

impl AnalyzerDriver for PlanarS50244 {
    fn model(&self) -> &'static str {
        "s50244"
    }

    fn port_count(&self) -> u32 {
        2
    }

    fn span_commands(&self, start: f64, stop: f64, points: u32) -> BenchResult<Vec<String>> {
        Ok(vec![
            Command::render(":SENSe:SWEep:POINts {n}", &cmd_args! { "n" => points })?,
            Command::render(":SENSe:FREQuency:STARt {hz}", &cmd_args! { "hz" => start })?,
            Command::render(":SENSe:FREQuency:STOP {hz}", &cmd_args! { "hz" => stop })?,
        ])
    }

    fn power_command(&self, port: u32, dbm: f64) -> BenchResult<String> {
        Command::render(
            ":SOURce:POWer:PORT{port}:LEVel:IMMediate:AMPLitude {dbm}",
            &cmd_args! { "port" => port, "dbm" => dbm },
        )
    }

    fn output_command(&self, enabled: bool) -> String {
        format!(":OUTPUT:STATE {}", if enabled { "ON" } else { "OFF" })
    }

    fn preset_commands(&self) -> Vec<String> {
        vec![
            ":SYSTEM:PRESET".to_string(),
            ":SOURce:POWer:PORT:COUPle 0".to_string(),
            self.output_command(false),
        ]
    }

    fn configure_commands(&self, measurement: &MeasurementConfig) -> BenchResult<Vec<String>> {
        Ok(vec![
            ":TRIGger:SEQuence:SCOPe ACTive".to_string(),
            "TRIG:SCOP ALL".to_string(),
            Command::render(
                ":SENSe:BANDwidth:RESolution {rbw}",
                &cmd_args! { "rbw" => measurement.rbw },
            )?,
        ])
    }
}

/// A network analyzer: one link, its grammar, the current switch paths and
/// the measurement setup last applied.
#[derive(Debug)]
pub struct NetworkAnalyzer {
    id: String,
    link: InstrumentLink,
    driver: Box<dyn AnalyzerDriver>,
    paths: Vec<u32>,
    measurement: Option<MeasurementConfig>,
}

impl NetworkAnalyzer {
    /// Analyzer called `id` on `link`.
    pub fn new(id: impl Into<String>, link: InstrumentLink, driver: Box<dyn AnalyzerDriver>) -> Self {
        let paths = vec![1; driver.switch_modules()];
        Self {
            id: id.into(),
            link,
            driver,
            paths,
            measurement: None,
        }
    }

    /// Driver model name.
    pub fn model(&self) -> &str {
        self.driver.model()
    }

    /// Number of test ports.
    pub fn port_count(&self) -> u32 {
        self.driver.port_count()
    }

    /// Number of switch modules.
    pub fn switch_module_count(&self) -> usize {
        self.driver.switch_modules()
    }

    /// Measurement setup in effect, `None` until configured or after a preset.
    pub fn measurement(&self) -> Option<&MeasurementConfig> {
        self.measurement.as_ref()
    }

    /// Apply a measurement setup.
    pub async fn configure(&mut self, measurement: &MeasurementConfig) -> BenchResult<OperationResult> {
        measurement.validate()?;
        let ports = self.driver.port_count();
        if measurement.source_port > ports {
            return Err(BenchError::Configuration(format!(
                "{} has {} ports, source port {} requested",
                self.id, ports, measurement.source_port
            )));
        }
        let commands = self.driver.configure_commands(measurement)?;
        let result = self.link.send_sequence(&commands).await?;
        if result.is_success() {
            debug!(device = %self.id, kind = %measurement.kind, rbw = measurement.rbw, "measurement configured");
            self.measurement = Some(measurement.clone());
        }
        Ok(result)
    }

    /// Whether the link is open.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Current path state of every switch module.
    pub fn paths(&self) -> &[u32] {
        &self.paths
    }

    /// Stimulus span of `points` points.
    pub async fn set_span(&mut self, start: f64, stop: f64, points: u32) -> BenchResult<OperationResult> {
        if points == 0 {
            return Err(BenchError::Configuration("sweep needs at least one point".into()));
        }
        let commands = self.driver.span_commands(start, stop, points)?;
        Ok(self.link.send_sequence(&commands).await?)
    }

    /// Set the stimulus frequency, verified.
    pub async fn set_freq(&mut self, hz: f64) -> BenchResult<OperationResult> {
        self.set_span(hz, hz, 1).await
    }

    /// Step the frequency through `range`.
    pub async fn set_freq_range(&mut self, range: &SweepRange) -> BenchResult<SweepReport> {
        self.sweep(SweepTarget::Frequency, range).await
    }

    /// Set the output level, verified.
    pub async fn set_power(&mut self, dbm: f64) -> BenchResult<OperationResult> {
        let commands = (1..=self.driver.port_count())
            .map(|port| self.driver.power_command(port, dbm))
            .collect::<BenchResult<Vec<_>>>()?;
        Ok(self.link.send_sequence(&commands).await?)
    }

    /// Step the output level through `range`.
    pub async fn set_power_range(&mut self, range: &SweepRange) -> BenchResult<SweepReport> {
        self.sweep(SweepTarget::Power, range).await
    }

    /// Route each switch module; modules already on the requested path are
    /// left alone.
    pub async fn set_path(&mut self, paths: &[Option<u32>]) -> BenchResult<OperationResult> {
        let modules = self.driver.switch_modules();
        if modules == 0 {
            return Err(unsupported(&self.id, Capability::Path));
        }
        if paths.len() > modules {
            return Err(BenchError::Configuration(format!(
                "{} has {} switch modules, {} paths given",
                self.id,
                modules,
                paths.len()
            )));
        }
        if paths.iter().flatten().any(|p| *p == 0) {
            return Err(BenchError::Configuration("switch path states start at 1".into()));
        }

        for (index, requested) in paths.iter().enumerate() {
            let Some(path) = *requested else { continue };
            if self.paths[index] == path {
                debug!(device = %self.id, module = index + 1, path, "switch already on path");
                continue;
            }
            let command = self.driver.path_command(index + 1, path)?;
            let result = self.link.send_wait_err(&command).await?;
            if !result.is_success() {
                return Ok(result);
            }
            self.paths[index] = path;
        }

        match self.driver.path_commit_command() {
            Some(command) => Ok(self.link.send_wait_err(&command).await?),
            None => Ok(self.link.send_sequence(&[]).await?),
        }
    }

    /// Switch RF output.
    pub async fn set_output(&mut self, enabled: bool) -> BenchResult<OperationResult> {
        let command = self.driver.output_command(enabled);
        Ok(self.link.send_wait_err(&command).await?)
    }

    /// Restore the default state.
    pub async fn preset(&mut self) -> BenchResult<OperationResult> {
        let commands = self.driver.preset_commands();
        let result = self.link.send_sequence(&commands).await?;
        if result.is_success() {
            self.paths = vec![1; self.driver.switch_modules()];
            self.measurement = None;
        }
        Ok(result)
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
            role: Role::Analyzer,
            model: self.model().to_string(),
            connected: self.link.is_connected(),
            identity,
            axes: Vec::new(),
            measurement: self.measurement.clone(),
        })
    }
}

#[async_trait]
impl Settable for NetworkAnalyzer {
    fn device_id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<Capability> {
        let mut caps = vec![
            Capability::Frequency,
            Capability::Power,
            Capability::Output,
            Capability::Measurement,
            Capability::Status,
        ];
        if self.driver.switch_modules() > 0 {
            caps.push(Capability::Path);
        }
        caps
    }

    async fn apply(&mut self, operation: &Operation) -> BenchResult<OperationResult> {
        match operation {
            Operation::SetFrequency { value } => self.set_freq(*value).await,
            Operation::SetPower { value } => self.set_power(*value).await,
            Operation::SetPath { paths } => self.set_path(paths).await,
            Operation::SetOutput { enabled } => self.set_output(*enabled).await,
            Operation::Configure { measurement } => self.configure(measurement).await,
            other => Err(unsupported(&self.id, other.capability())),
        }
    }
}
