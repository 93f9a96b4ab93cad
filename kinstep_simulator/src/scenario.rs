//! Homing scenario files.
//!
//! ```toml
//! [simulation]
//! duration = 0.5
//!
//! [[mcu]]
//! name = "mcu"
//! freq = 72000000.0
//! trigger_time = 0.120
//! ```

use std::path::Path;

use kinstep_host::trsync::REASON_ENDSTOP_HIT;
use kinstep_shared::config::TrsyncConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Scenario load error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Invalid scenario: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Scenario {
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub trsync: TrsyncConfig,
    #[serde(default, rename = "mcu")]
    pub mcus: Vec<McuScenario>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationSettings {
    /// Host time at which the simulation gives up
    #[serde(default = "default_duration")]
    pub duration: f64,
    /// Host time the dispatch is started
    #[serde(default)]
    pub start_time: f64,
    #[serde(default = "default_dispatch_reason")]
    pub dispatch_reason: u32,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            duration: default_duration(),
            start_time: 0.0,
            dispatch_reason: default_dispatch_reason(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McuScenario {
    pub name: String,
    #[serde(default = "default_freq")]
    pub freq: f64,
    /// MCU uptime in seconds at host time zero
    #[serde(default)]
    pub offset: f64,
    /// Seconds between trsync_state reports (default: 30% of the expire timeout)
    #[serde(default)]
    pub status_period: Option<f64>,
    /// One-way transport delay in seconds
    #[serde(default = "default_latency")]
    pub latency: f64,
    /// Host time the endstop closes
    #[serde(default)]
    pub trigger_time: Option<f64>,
    /// Whether the MCU trips itself when its expire clock passes
    #[serde(default = "default_watchdog")]
    pub watchdog: bool,
    /// Host time window during which status reports are lost
    #[serde(default)]
    pub lost_reports: Option<[f64; 2]>,
}

fn default_duration() -> f64 {
    0.5
}
fn default_dispatch_reason() -> u32 {
    REASON_ENDSTOP_HIT
}
fn default_freq() -> f64 {
    50_000_000.0
}
fn default_latency() -> f64 {
    0.000_5
}
fn default_watchdog() -> bool {
    true
}

impl McuScenario {
    pub fn status_period(&self, trsync: &TrsyncConfig, mcu_count: usize) -> f64 {
        self.status_period
            .unwrap_or_else(|| trsync.expire_timeout(mcu_count) * 0.3)
    }

    pub fn reports_lost_at(&self, host_time: f64) -> bool {
        self.lost_reports
            .is_some_and(|[start, end]| (start..end).contains(&host_time))
    }
}

impl Scenario {
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.mcus.is_empty() {
            return Err(ScenarioError::Invalid("at least one [[mcu]] is required".to_string()));
        }
        if !(self.simulation.duration > self.simulation.start_time) {
            return Err(ScenarioError::Invalid("duration must be after start_time".to_string()));
        }
        for (i, mcu) in self.mcus.iter().enumerate() {
            if !(mcu.freq > 0.0) {
                return Err(ScenarioError::Invalid(format!("mcu '{}': freq must be > 0", mcu.name)));
            }
            if !(mcu.offset >= 0.0) {
                return Err(ScenarioError::Invalid(format!("mcu '{}': offset must be >= 0", mcu.name)));
            }
            if !(mcu.latency >= 0.0) {
                return Err(ScenarioError::Invalid(format!("mcu '{}': latency must be >= 0", mcu.name)));
            }
            if mcu.status_period.is_some_and(|p| !(p > 0.0)) {
                return Err(ScenarioError::Invalid(format!("mcu '{}': status_period must be > 0", mcu.name)));
            }
            if self.mcus[..i].iter().any(|m| m.name == mcu.name) {
                return Err(ScenarioError::Invalid(format!("duplicate mcu name '{}'", mcu.name)));
            }
        }
        Ok(())
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ScenarioError> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?;
        let scenario: Scenario = settings.try_deserialize()?;
        scenario.validate()?;
        Ok(scenario)
    }
}

/// Load and validate a scenario file.
pub fn load_scenario(path: &Path) -> Result<Scenario, ScenarioError> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .map_err(|e| {
            tracing::error!("Failed to load scenario '{}': {}", path.display(), e);
            e
        })?;
    let scenario: Scenario = settings.try_deserialize()?;
    scenario.validate()?;
    tracing::info!(mcus = scenario.mcus.len(), "scenario loaded from {}", path.display());
    Ok(scenario)
}
