//! Shared configuration logic for host, simulator, and tests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Shaper damping ratio when none is configured.
pub const DEFAULT_DAMPING_RATIO: f64 = 0.1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default, rename = "stepper")]
    pub steppers: BTreeMap<String, StepperConfig>,
    #[serde(default)]
    pub delta: Option<DeltaConfig>,
    #[serde(default)]
    pub rotary_delta: Option<RotaryDeltaConfig>,
    #[serde(default)]
    pub winch: Option<WinchConfig>,
    #[serde(default)]
    pub extruder: Option<ExtruderConfig>,
    #[serde(default)]
    pub input_shaper: Option<InputShaperConfig>,
    #[serde(default)]
    pub dual_carriage: Option<DualCarriageConfig>,
    #[serde(default)]
    pub trsync: TrsyncConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    #[serde(default = "default_kinematics")]
    pub kinematics: String,
    #[serde(default = "default_max_velocity")]
    pub max_velocity: f64,
    #[serde(default = "default_max_accel")]
    pub max_accel: f64,
    #[serde(default)]
    pub printer_name: Option<String>,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            kinematics: default_kinematics(),
            max_velocity: default_max_velocity(),
            max_accel: default_max_accel(),
            printer_name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepperConfig {
    #[serde(default = "default_rotation_distance")]
    pub rotation_distance: f64,
    #[serde(default = "default_microsteps")]
    pub microsteps: u32,
    #[serde(default = "default_full_steps_per_rotation")]
    pub full_steps_per_rotation: u32,
    /// Kinematic role of this stepper: an axis letter for cartesian machines,
    /// '+' or '-' for the corexy/corexz belts. Unused by delta and winch.
    #[serde(default)]
    pub axis: Option<String>,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            rotation_distance: default_rotation_distance(),
            microsteps: default_microsteps(),
            full_steps_per_rotation: default_full_steps_per_rotation(),
            axis: None,
        }
    }
}

impl StepperConfig {
    pub fn step_distance(&self) -> f64 {
        self.rotation_distance / (self.full_steps_per_rotation as f64 * self.microsteps as f64)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeltaConfig {
    pub radius: f64,
    pub arm_length: f64,
    #[serde(default = "default_delta_angles")]
    pub angles: [f64; 3],
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RotaryDeltaConfig {
    pub shoulder_radius: f64,
    pub shoulder_height: f64,
    pub upper_arm_length: f64,
    pub lower_arm_length: f64,
    #[serde(default = "default_delta_angles")]
    pub angles: [f64; 3],
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WinchConfig {
    pub anchors: Vec<[f64; 3]>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtruderConfig {
    #[serde(default = "default_rotation_distance")]
    pub rotation_distance: f64,
    #[serde(default = "default_microsteps")]
    pub microsteps: u32,
    #[serde(default = "default_full_steps_per_rotation")]
    pub full_steps_per_rotation: u32,
    #[serde(default)]
    pub pressure_advance: f64,
    #[serde(default = "default_pressure_advance_smooth_time")]
    pub pressure_advance_smooth_time: f64,
}

impl Default for ExtruderConfig {
    fn default() -> Self {
        Self {
            rotation_distance: default_rotation_distance(),
            microsteps: default_microsteps(),
            full_steps_per_rotation: default_full_steps_per_rotation(),
            pressure_advance: 0.0,
            pressure_advance_smooth_time: default_pressure_advance_smooth_time(),
        }
    }
}

impl ExtruderConfig {
    pub fn step_distance(&self) -> f64 {
        self.rotation_distance / (self.full_steps_per_rotation as f64 * self.microsteps as f64)
    }
}

/// One number, or one per toolhead/mode. Accepts `48.0`, `[48.0, 52.0]`
/// or the comma separated `"48.0, 52.0"`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NumberList {
    One(f64),
    Many(Vec<f64>),
    Text(String),
}

impl NumberList {
    /// Values in order; blank entries of the text form are skipped.
    pub fn values(&self) -> Result<Vec<f64>, ConfigError> {
        match self {
            NumberList::One(v) => Ok(vec![*v]),
            NumberList::Many(v) => Ok(v.clone()),
            NumberList::Text(text) => text
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| {
                    item.parse::<f64>()
                        .map_err(|_| ConfigError::Invalid(format!("'{}' is not a number", item)))
                })
                .collect(),
        }
    }
}

impl From<f64> for NumberList {
    fn from(value: f64) -> Self {
        NumberList::One(value)
    }
}

/// One name, or one per toolhead/mode, as an array or a comma separated string.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NameList {
    One(String),
    Many(Vec<String>),
}

impl NameList {
    pub fn values(&self) -> Vec<String> {
        let items: &[String] = match self {
            NameList::One(s) => std::slice::from_ref(s),
            NameList::Many(v) => v,
        };
        items
            .iter()
            .flat_map(|item| item.split(','))
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl From<&str> for NameList {
    fn from(value: &str) -> Self {
        NameList::One(value.to_string())
    }
}

/// `[input_shaper]`. Every per-axis entry takes one value, two (one per
/// toolhead) or four (toolhead 0, toolhead 1, copy mode, mirror mode).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputShaperConfig {
    /// Used for an axis without its own `shaper_type_<axis>`
    #[serde(default = "default_shaper_type")]
    pub shaper_type: String,
    #[serde(default)]
    pub shaper_type_x: Option<NameList>,
    #[serde(default = "default_shaper_freq")]
    pub shaper_freq_x: NumberList,
    #[serde(default = "default_damping_ratio")]
    pub damping_ratio_x: NumberList,
    #[serde(default)]
    pub shaper_type_y: Option<NameList>,
    #[serde(default = "default_shaper_freq")]
    pub shaper_freq_y: NumberList,
    #[serde(default = "default_damping_ratio")]
    pub damping_ratio_y: NumberList,
}

impl Default for InputShaperConfig {
    fn default() -> Self {
        Self {
            shaper_type: default_shaper_type(),
            shaper_type_x: None,
            shaper_freq_x: default_shaper_freq(),
            damping_ratio_x: default_damping_ratio(),
            shaper_type_y: None,
            shaper_freq_y: default_shaper_freq(),
            damping_ratio_y: default_damping_ratio(),
        }
    }
}

impl InputShaperConfig {
    fn axis_entries(&self, axis: char) -> Result<(&Option<NameList>, &NumberList, &NumberList), ConfigError> {
        match axis {
            'x' => Ok((&self.shaper_type_x, &self.shaper_freq_x, &self.damping_ratio_x)),
            'y' => Ok((&self.shaper_type_y, &self.shaper_freq_y, &self.damping_ratio_y)),
            other => Err(ConfigError::Invalid(format!("No input shaper settings for axis '{}'", other))),
        }
    }

    /// Shaper type names for `axis`, never empty.
    pub fn shaper_types(&self, axis: char) -> Result<Vec<String>, ConfigError> {
        let (types, _, _) = self.axis_entries(axis)?;
        let names = types.as_ref().map(NameList::values).unwrap_or_default();
        if names.is_empty() {
            Ok(vec![self.shaper_type.clone()])
        } else {
            Ok(names)
        }
    }

    /// Frequencies for `axis`, never empty.
    pub fn shaper_freqs(&self, axis: char) -> Result<Vec<f64>, ConfigError> {
        let (_, freqs, _) = self.axis_entries(axis)?;
        let values = freqs.values()?;
        Ok(if values.is_empty() { vec![0.0] } else { values })
    }

    /// Damping ratios for `axis`, never empty.
    pub fn damping_ratios(&self, axis: char) -> Result<Vec<f64>, ConfigError> {
        let (_, _, ratios) = self.axis_entries(axis)?;
        let values = ratios.values()?;
        Ok(if values.is_empty() { vec![DEFAULT_DAMPING_RATIO] } else { values })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CarriageMode {
    /// Only the primary carriage moves; the second one stays parked
    #[default]
    Primary,
    Copy,
    Mirror,
}

impl CarriageMode {
    /// 0 for primary, 1 for copy, 2 for mirror.
    pub fn index(self) -> usize {
        match self {
            CarriageMode::Primary => 0,
            CarriageMode::Copy => 1,
            CarriageMode::Mirror => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(CarriageMode::Primary),
            1 => Some(CarriageMode::Copy),
            2 => Some(CarriageMode::Mirror),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CarriageMode::Primary => "PRIMARY",
            CarriageMode::Copy => "COPY",
            CarriageMode::Mirror => "MIRROR",
        }
    }

    /// Scale applied to the carriage's axis in this mode; zero parks it.
    pub fn scale(self) -> f64 {
        match self {
            CarriageMode::Primary => 0.0,
            CarriageMode::Copy => 1.0,
            CarriageMode::Mirror => -1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DualCarriageConfig {
    #[serde(default = "default_dual_carriage_axis")]
    pub axis: String,
    /// Name of the `[stepper.*]` entry driving the second carriage
    pub stepper: String,
    #[serde(default)]
    pub mode: CarriageMode,
    #[serde(default)]
    pub offset: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrsyncConfig {
    #[serde(default = "default_trsync_timeout")]
    pub timeout: f64,
    #[serde(default = "default_trsync_single_mcu_timeout")]
    pub single_mcu_timeout: f64,
    #[serde(default = "default_min_extend_fraction")]
    pub min_extend_fraction: f64,
}

impl Default for TrsyncConfig {
    fn default() -> Self {
        Self {
            timeout: default_trsync_timeout(),
            single_mcu_timeout: default_trsync_single_mcu_timeout(),
            min_extend_fraction: default_min_extend_fraction(),
        }
    }
}

impl TrsyncConfig {
    /// Expire window in seconds for a homing session spanning `mcu_count` MCUs.
    pub fn expire_timeout(&self, mcu_count: usize) -> f64 {
        if mcu_count > 1 {
            self.timeout
        } else {
            self.single_mcu_timeout
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.printer.max_velocity <= 0.0 || self.printer.max_accel <= 0.0 {
            return Err(ConfigError::Invalid(
                "printer max_velocity and max_accel must be > 0".to_string(),
            ));
        }
        for (name, stepper) in &self.steppers {
            if stepper.rotation_distance <= 0.0
                || stepper.microsteps == 0
                || stepper.full_steps_per_rotation == 0
            {
                return Err(ConfigError::Invalid(format!(
                    "Stepper '{}' must have positive rotation_distance, microsteps and full_steps_per_rotation",
                    name
                )));
            }
        }
        match self.printer.kinematics.as_str() {
            "cartesian" | "corexy" | "corexz" | "none" => {}
            "delta" => {
                let delta = self.delta.as_ref().ok_or_else(|| {
                    ConfigError::Invalid("delta kinematics requires a [delta] section".to_string())
                })?;
                if delta.arm_length <= delta.radius || delta.radius <= 0.0 {
                    return Err(ConfigError::Invalid(
                        "delta arm_length must exceed radius, and radius must be > 0".to_string(),
                    ));
                }
            }
            "rotary_delta" => {
                let rd = self.rotary_delta.as_ref().ok_or_else(|| {
                    ConfigError::Invalid(
                        "rotary_delta kinematics requires a [rotary_delta] section".to_string(),
                    )
                })?;
                if rd.upper_arm_length <= 0.0 || rd.lower_arm_length <= 0.0 {
                    return Err(ConfigError::Invalid(
                        "rotary_delta arm lengths must be > 0".to_string(),
                    ));
                }
            }
            "winch" => {
                let winch = self.winch.as_ref().ok_or_else(|| {
                    ConfigError::Invalid("winch kinematics requires a [winch] section".to_string())
                })?;
                if winch.anchors.is_empty() {
                    return Err(ConfigError::Invalid("winch needs at least one anchor".to_string()));
                }
            }
            other => {
                return Err(ConfigError::Invalid(format!("Unknown kinematics '{}'", other)));
            }
        }
        if let Some(extruder) = &self.extruder {
            if extruder.pressure_advance < 0.0 || extruder.pressure_advance_smooth_time < 0.0 {
                return Err(ConfigError::Invalid(
                    "pressure_advance and pressure_advance_smooth_time must be >= 0".to_string(),
                ));
            }
        }
        if let Some(shaper) = &self.input_shaper {
            for axis in ['x', 'y'] {
                if let Some(freq) = shaper.shaper_freqs(axis)?.into_iter().find(|f| !(*f >= 0.0)) {
                    return Err(ConfigError::Invalid(format!(
                        "Shaper frequency for axis '{}' must be >= 0: {}",
                        axis, freq
                    )));
                }
                if let Some(damping) = shaper
                    .damping_ratios(axis)?
                    .into_iter()
                    .find(|d| !(0.0..=1.0).contains(d))
                {
                    return Err(ConfigError::Invalid(format!(
                        "Shaper damping for axis '{}' must be between 0 and 1: {}",
                        axis, damping
                    )));
                }
            }
        }
        if let Some(dc) = &self.dual_carriage {
            if dc.axis != "x" && dc.axis != "y" {
                return Err(ConfigError::Invalid(format!(
                    "dual_carriage axis must be 'x' or 'y', got '{}'",
                    dc.axis
                )));
            }
            if !self.steppers.contains_key(&dc.stepper) {
                return Err(ConfigError::Invalid(format!(
                    "dual_carriage stepper '{}' is not defined",
                    dc.stepper
                )));
            }
        }
        let trsync = &self.trsync;
        if trsync.timeout <= 0.0 || trsync.single_mcu_timeout <= 0.0 {
            return Err(ConfigError::Invalid("trsync timeouts must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&trsync.min_extend_fraction) {
            return Err(ConfigError::Invalid(
                "trsync min_extend_fraction must be in [0, 1)".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_kinematics() -> String { "cartesian".to_string() }
fn default_max_velocity() -> f64 { 300.0 }
fn default_max_accel() -> f64 { 3000.0 }
fn default_rotation_distance() -> f64 { 40.0 }
fn default_microsteps() -> u32 { 16 }
fn default_full_steps_per_rotation() -> u32 { 200 }
fn default_delta_angles() -> [f64; 3] { [210.0, 330.0, 90.0] }
fn default_pressure_advance_smooth_time() -> f64 { 0.040 }
fn default_shaper_type() -> String { "mzv".to_string() }
fn default_shaper_freq() -> NumberList { NumberList::One(0.0) }
fn default_damping_ratio() -> NumberList { NumberList::One(DEFAULT_DAMPING_RATIO) }
fn default_dual_carriage_axis() -> String { "x".to_string() }
fn default_trsync_timeout() -> f64 { 0.025 }
fn default_trsync_single_mcu_timeout() -> f64 { 0.250 }
fn default_min_extend_fraction() -> f64 { 0.4 }

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}
