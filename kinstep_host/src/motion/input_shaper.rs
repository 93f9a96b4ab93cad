// src/motion/input_shaper.rs - Input shaper definitions
//! Impulse trains for the supported shaper families and the per-axis
//! parameter holder used to configure [`InputShaper`] kinematics.
//!
//! [`InputShaper`]: super::kinematics::InputShaper

use std::f64::consts::PI;
use std::str::FromStr;

use kinstep_shared::config::{CarriageMode, ConfigError, InputShaperConfig};
use serde::{Deserialize, Serialize};

use super::kinematics::{InputShaper, KinematicsError};

pub const SHAPER_VIBRATION_REDUCTION: f64 = 20.0;
pub use kinstep_shared::config::DEFAULT_DAMPING_RATIO;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShaperType {
    Zv,
    Mzv,
    Zvd,
    Ei,
    TwoHumpEi,
    ThreeHumpEi,
}

impl ShaperType {
    pub fn name(self) -> &'static str {
        match self {
            ShaperType::Zv => "zv",
            ShaperType::Mzv => "mzv",
            ShaperType::Zvd => "zvd",
            ShaperType::Ei => "ei",
            ShaperType::TwoHumpEi => "2hump_ei",
            ShaperType::ThreeHumpEi => "3hump_ei",
        }
    }

    /// Amplitudes and times of the shaper tuned to `freq` Hz.
    pub fn pulses(self, freq: f64, damping_ratio: f64) -> (Vec<f64>, Vec<f64>) {
        let df = (1.0 - damping_ratio * damping_ratio).sqrt();
        let t_d = 1.0 / (freq * df);
        let v_tol = 1.0 / SHAPER_VIBRATION_REDUCTION;
        match self {
            ShaperType::Zv => {
                let k = (-damping_ratio * PI / df).exp();
                (vec![1.0, k], vec![0.0, 0.5 * t_d])
            }
            ShaperType::Mzv => {
                let k = (-0.75 * damping_ratio * PI / df).exp();
                let a1 = 1.0 - 1.0 / 2f64.sqrt();
                let a2 = (2f64.sqrt() - 1.0) * k;
                let a3 = a1 * k * k;
                (vec![a1, a2, a3], vec![0.0, 0.375 * t_d, 0.75 * t_d])
            }
            ShaperType::Zvd => {
                let k = (-damping_ratio * PI / df).exp();
                (vec![1.0, 2.0 * k, k * k], vec![0.0, 0.5 * t_d, t_d])
            }
            ShaperType::Ei => {
                let k = (-damping_ratio * PI / df).exp();
                let a1 = 0.25 * (1.0 + v_tol);
                let a2 = 0.5 * (1.0 - v_tol) * k;
                let a3 = a1 * k * k;
                (vec![a1, a2, a3], vec![0.0, 0.5 * t_d, t_d])
            }
            ShaperType::TwoHumpEi => {
                let k = (-damping_ratio * PI / df).exp();
                let v2 = v_tol * v_tol;
                let x = (v2 * ((1.0 - v2).sqrt() + 1.0)).powf(1.0 / 3.0);
                let a1 = (3.0 * x * x + 2.0 * x + 3.0 * v2) / (16.0 * x);
                let a2 = (0.5 - a1) * k;
                let a3 = a2 * k;
                let a4 = a1 * k * k * k;
                (
                    vec![a1, a2, a3, a4],
                    vec![0.0, 0.5 * t_d, t_d, 1.5 * t_d],
                )
            }
            ShaperType::ThreeHumpEi => {
                let k = (-damping_ratio * PI / df).exp();
                let k2 = k * k;
                let a1 = 0.0625 * (1.0 + 3.0 * v_tol + 2.0 * (2.0 * (v_tol + 1.0) * v_tol).sqrt());
                let a2 = 0.25 * (1.0 - v_tol) * k;
                let a3 = (0.5 * (1.0 + v_tol) - 2.0 * a1) * k2;
                let a4 = a2 * k2;
                let a5 = a1 * k2 * k2;
                (
                    vec![a1, a2, a3, a4, a5],
                    vec![0.0, 0.5 * t_d, t_d, 1.5 * t_d, 2.0 * t_d],
                )
            }
        }
    }
}

impl FromStr for ShaperType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zv" => Ok(ShaperType::Zv),
            "mzv" => Ok(ShaperType::Mzv),
            "zvd" => Ok(ShaperType::Zvd),
            "ei" => Ok(ShaperType::Ei),
            "2hump_ei" => Ok(ShaperType::TwoHumpEi),
            "3hump_ei" => Ok(ShaperType::ThreeHumpEi),
            other => Err(ConfigError::Invalid(format!("Unsupported shaper type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ShaperParams {
    shaper_type: ShaperType,
    freq: f64,
    damping_ratio: f64,
}

impl ShaperParams {
    fn pulses(&self) -> (Vec<f64>, Vec<f64>) {
        if self.freq == 0.0 {
            (Vec::new(), Vec::new())
        } else {
            self.shaper_type.pulses(self.freq, self.damping_ratio)
        }
    }
}

fn check_freq(freq: f64) -> Result<(), ConfigError> {
    if freq >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("Frequency must be non-negative: {}", freq)))
    }
}

fn check_damping_ratio(damping_ratio: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&damping_ratio) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "Damping ratio must be between 0.0 and 1.0: {}",
            damping_ratio
        )))
    }
}

/// Runtime change to one axis; `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ShaperUpdate {
    pub shaper_type: Option<ShaperType>,
    pub shaper_freq: Option<f64>,
    pub damping_ratio: Option<f64>,
}

impl ShaperUpdate {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(freq) = self.shaper_freq {
            check_freq(freq)?;
        }
        if let Some(damping_ratio) = self.damping_ratio {
            check_damping_ratio(damping_ratio)?;
        }
        Ok(())
    }
}

/// Runtime reconfiguration of both axes. A toolhead or mode selects the
/// configured entries before the per-axis changes are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SetInputShaper {
    pub toolhead: Option<usize>,
    pub mode: Option<CarriageMode>,
    /// Shaper type for both axes, over any per-axis type
    pub shaper_type: Option<ShaperType>,
    pub x: ShaperUpdate,
    pub y: ShaperUpdate,
}

impl SetInputShaper {
    pub fn axis_update(&self, axis: char) -> ShaperUpdate {
        let update = if axis == 'y' { self.y } else { self.x };
        ShaperUpdate {
            shaper_type: self.shaper_type.or(update.shaper_type),
            ..update
        }
    }
}

/// Shaper configuration for one axis.
///
/// Each parameter holds one entry, or one per toolhead, or four entries
/// covering toolhead 0, toolhead 1, copy mode and mirror mode. The entry in
/// use follows the active toolhead and carriage mode.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisInputShaper {
    axis: char,
    shaper_types: Vec<ShaperType>,
    shaper_freqs: Vec<f64>,
    damping_ratios: Vec<f64>,
    toolhead_idx: usize,
    mode: CarriageMode,
    params: ShaperParams,
    /// Parameters put aside by `disable_shaping`
    saved: Option<ShaperParams>,
}

impl AxisInputShaper {
    pub fn new(axis: char, shaper_type: ShaperType, freq: f64, damping_ratio: f64) -> Result<Self, ConfigError> {
        Self::with_entries(axis, vec![shaper_type], vec![freq], vec![damping_ratio])
    }

    /// Build from per-toolhead/mode lists. Empty frequency or damping lists
    /// fall back to an unshaped axis and the default damping ratio.
    pub fn with_entries(
        axis: char,
        shaper_types: Vec<ShaperType>,
        mut shaper_freqs: Vec<f64>,
        mut damping_ratios: Vec<f64>,
    ) -> Result<Self, ConfigError> {
        if axis != 'x' && axis != 'y' {
            return Err(ConfigError::Invalid(format!("Input shaping is only supported on x and y, not '{}'", axis)));
        }
        let Some(&shaper_type) = shaper_types.first() else {
            return Err(ConfigError::Invalid(format!("No shaper type given for axis '{}'", axis)));
        };
        if shaper_freqs.is_empty() {
            shaper_freqs.push(0.0);
        }
        if damping_ratios.is_empty() {
            damping_ratios.push(DEFAULT_DAMPING_RATIO);
        }
        shaper_freqs.iter().try_for_each(|&f| check_freq(f))?;
        damping_ratios.iter().try_for_each(|&d| check_damping_ratio(d))?;
        let params = ShaperParams {
            shaper_type,
            freq: shaper_freqs[0],
            damping_ratio: damping_ratios[0],
        };
        Ok(Self {
            axis,
            shaper_types,
            shaper_freqs,
            damping_ratios,
            toolhead_idx: 0,
            mode: CarriageMode::Primary,
            params,
            saved: None,
        })
    }

    /// Both axes from an `[input_shaper]` section.
    pub fn from_config(config: &InputShaperConfig) -> Result<[Self; 2], ConfigError> {
        let axis = |axis: char| -> Result<Self, ConfigError> {
            let shaper_types = config
                .shaper_types(axis)?
                .iter()
                .map(|name| name.parse::<ShaperType>())
                .collect::<Result<Vec<_>, _>>()?;
            Self::with_entries(axis, shaper_types, config.shaper_freqs(axis)?, config.damping_ratios(axis)?)
        };
        Ok([axis('x')?, axis('y')?])
    }

    pub fn axis(&self) -> char {
        self.axis
    }

    pub fn get_name(&self) -> String {
        format!("shaper_{}", self.axis)
    }

    pub fn shaper_type(&self) -> ShaperType {
        self.params.shaper_type
    }

    pub fn freq(&self) -> f64 {
        self.params.freq
    }

    pub fn damping_ratio(&self) -> f64 {
        self.params.damping_ratio
    }

    pub fn toolhead_mode(&self) -> (usize, CarriageMode) {
        (self.toolhead_idx, self.mode)
    }

    /// Entry of the configured lists that applies to the current toolhead
    /// and mode. Picked by the number of shaper types.
    pub fn param_index(&self) -> usize {
        match self.shaper_types.len() {
            2 => self.toolhead_idx,
            4 if self.mode == CarriageMode::Primary => self.toolhead_idx,
            4 => self.mode.index() + 1,
            _ => 0,
        }
    }

    /// Switch to the entries for `toolhead_idx` in `mode`. While shaping is
    /// disabled the selection takes effect on `enable_shaping`.
    pub fn set_toolhead_mode(&mut self, toolhead_idx: usize, mode: CarriageMode) {
        self.toolhead_idx = toolhead_idx;
        self.mode = mode;
        let idx = self.param_index();
        let pick = |len: usize| idx.min(len - 1);
        let params = ShaperParams {
            shaper_type: self.shaper_types[pick(self.shaper_types.len())],
            freq: self.shaper_freqs[pick(self.shaper_freqs.len())],
            damping_ratio: self.damping_ratios[pick(self.damping_ratios.len())],
        };
        tracing::debug!(
            shaper = %self.get_name(),
            toolhead = toolhead_idx,
            mode = mode.name(),
            index = idx,
            "shaper entry selected"
        );
        match &mut self.saved {
            Some(saved) => *saved = params,
            None => self.params = params,
        }
    }

    /// Apply a runtime change. Explicit parameters replace anything put
    /// aside by `disable_shaping`.
    pub fn update(&mut self, update: &ShaperUpdate) -> Result<(), ConfigError> {
        update.validate()?;
        let mut params = self.saved.take().unwrap_or_else(|| self.params.clone());
        if let Some(shaper_type) = update.shaper_type {
            params.shaper_type = shaper_type;
        }
        if let Some(freq) = update.shaper_freq {
            params.freq = freq;
        }
        if let Some(damping_ratio) = update.damping_ratio {
            params.damping_ratio = damping_ratio;
        }
        self.params = params;
        Ok(())
    }

    pub fn is_shaping(&self) -> bool {
        self.params.freq != 0.0
    }

    /// Current impulse train; empty when shaping is off.
    pub fn get_shaper(&self) -> (Vec<f64>, Vec<f64>) {
        self.params.pulses()
    }

    pub fn disable_shaping(&mut self) {
        if self.saved.is_none() && self.is_shaping() {
            self.saved = Some(self.params.clone());
        }
        self.params.freq = 0.0;
    }

    pub fn enable_shaping(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.params = saved;
        }
    }

    /// Push these parameters into a shaper model. On failure shaping is
    /// turned off for the axis and the error returned.
    pub fn apply_to(&mut self, is: &mut InputShaper) -> Result<(), KinematicsError> {
        let (a, t) = self.get_shaper();
        match is.set_shaper_params(self.axis, a.len(), &a, &t) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.disable_shaping();
                let (a, t) = self.get_shaper();
                if let Err(clear) = is.set_shaper_params(self.axis, a.len(), &a, &t) {
                    tracing::warn!(shaper = %self.get_name(), error = %clear, "failed to clear shaper");
                }
                Err(e)
            }
        }
    }

    /// Human readable summary, e.g. `shaper_type_x:mzv shaper_freq_x:50.000 damping_ratio_x:0.100000`.
    pub fn report(&self) -> String {
        format!(
            "shaper_type_{axis}:{} shaper_freq_{axis}:{:.3} damping_ratio_{axis}:{:.6}",
            self.params.shaper_type.name(),
            self.params.freq,
            self.params.damping_ratio,
            axis = self.axis
        )
    }
}
