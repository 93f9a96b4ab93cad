// src/motion/mod.rs - Step generation

pub mod input_shaper;
pub mod itersolve;
pub mod kinematics;
pub mod step_generation;

pub use input_shaper::{AxisInputShaper, SetInputShaper, ShaperType, ShaperUpdate};
pub use itersolve::{StepEvent, StepGenError, StepperHandle};
pub use kinematics::{KinematicsError, KinematicsType, StepperKinematics};
pub use step_generation::{MoveTiming, StepGenerator, StepGeneratorError};

use kinstep_shared::config::{Config, ConfigError, ExtruderConfig, StepperConfig};
use kinstep_shared::trapq::{Axis, Coord};
use thiserror::Error;

use kinematics::{
    create_kinematics, delta_towers, single_char, AttachError, DualCarriage, ExtruderStepper, RotaryDeltaStepper,
    WinchStepper,
};

#[derive(Debug, Error)]
pub enum MotionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Kinematics error: {0}")]
    Kinematics(#[from] KinematicsError),
    #[error("Step generation error: {0}")]
    StepGeneration(#[from] StepGeneratorError),
}

/// Axis token for a cartesian-family stepper: explicit `axis`, otherwise the
/// name suffix (`stepper_x` -> `x`).
fn stepper_axis<'a>(name: &'a str, stepper: &'a StepperConfig) -> Result<&'a str, ConfigError> {
    if let Some(axis) = stepper.axis.as_deref() {
        return Ok(axis);
    }
    name.strip_prefix("stepper_")
        .filter(|suffix| suffix.len() == 1)
        .ok_or_else(|| ConfigError::Invalid(format!("Stepper '{}' needs an axis", name)))
}

fn require_count(kind: &str, steppers: usize, wanted: usize) -> Result<(), ConfigError> {
    if steppers == wanted {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{} kinematics needs {} steppers, {} configured",
            kind, wanted, steppers
        )))
    }
}

/// Build the toolhead steppers described by `config`, in stepper name order.
pub fn build_steppers(config: &Config) -> Result<Vec<StepperHandle>, MotionError> {
    let kinematics_type: KinematicsType = config.printer.kinematics.parse()?;
    let dc_stepper = config.dual_carriage.as_ref().map(|dc| dc.stepper.as_str());
    let steppers: Vec<(&String, &StepperConfig)> = config.steppers.iter().collect();
    let mut handles = Vec::with_capacity(steppers.len());
    match kinematics_type {
        KinematicsType::Cartesian | KinematicsType::CoreXY | KinematicsType::CoreXZ => {
            for (name, sc) in &steppers {
                let axis = stepper_axis(name, sc)?;
                let sk = create_kinematics(kinematics_type, axis)?;
                handles.push(StepperHandle::new(name.as_str(), sc.step_distance(), sk));
            }
        }
        KinematicsType::Delta => {
            let delta = config
                .delta
                .as_ref()
                .ok_or_else(|| ConfigError::Invalid("missing [delta] section".to_string()))?;
            require_count("delta", steppers.len(), 3)?;
            let towers = delta_towers(delta.radius, delta.arm_length, delta.angles)?;
            for ((name, sc), tower) in steppers.iter().zip(towers) {
                handles.push(StepperHandle::new(name.as_str(), sc.step_distance(), Box::new(tower)));
            }
        }
        KinematicsType::RotaryDelta => {
            let rd = config
                .rotary_delta
                .as_ref()
                .ok_or_else(|| ConfigError::Invalid("missing [rotary_delta] section".to_string()))?;
            require_count("rotary_delta", steppers.len(), 3)?;
            for ((name, sc), angle) in steppers.iter().zip(rd.angles) {
                let sk = RotaryDeltaStepper::new(
                    rd.shoulder_radius,
                    rd.shoulder_height,
                    angle.to_radians(),
                    rd.upper_arm_length,
                    rd.lower_arm_length,
                )?;
                // Rotary steppers move in radians
                let step_dist = sc.step_distance() / sc.rotation_distance * std::f64::consts::TAU;
                handles.push(StepperHandle::new(name.as_str(), step_dist, Box::new(sk)));
            }
        }
        KinematicsType::Winch => {
            let winch = config
                .winch
                .as_ref()
                .ok_or_else(|| ConfigError::Invalid("missing [winch] section".to_string()))?;
            require_count("winch", steppers.len(), winch.anchors.len())?;
            for ((name, sc), anchor) in steppers.iter().zip(&winch.anchors) {
                let sk = WinchStepper::new(Coord::new(anchor[0], anchor[1], anchor[2]));
                handles.push(StepperHandle::new(name.as_str(), sc.step_distance(), Box::new(sk)));
            }
        }
        KinematicsType::None => {}
    }
    if let (Some(dc), Some(dc_name)) = (&config.dual_carriage, dc_stepper) {
        let axis = single_char(&dc.axis)?;
        let (scale, offset) = (dc.mode.scale(), dc.offset);
        let moved_axis = Axis::from_char(axis).ok_or(KinematicsError::InvalidAxis(axis))?;
        for handle in &mut handles {
            let is_dc = handle.name() == dc_name;
            if !is_dc && !handle.is_active_axis(moved_axis) {
                continue;
            }
            let (s, o) = if is_dc { (scale, offset) } else { (1.0, 0.0) };
            handle.wrap_kinematics(|orig| {
                let mut dc = DualCarriage::new(orig);
                match dc.set_transform(axis, s, o) {
                    Ok(()) => Ok(Box::new(dc) as Box<dyn StepperKinematics>),
                    Err(error) => Err(AttachError {
                        error,
                        kinematics: dc.into_inner(),
                    }),
                }
            })?;
        }
        tracing::info!(axis = %axis, mode = ?dc.mode, "dual carriage configured");
    }
    tracing::info!(
        kinematics = %config.printer.kinematics,
        steppers = handles.len(),
        "toolhead steppers built"
    );
    Ok(handles)
}

/// Build the extruder stepper with its pressure advance settings.
pub fn build_extruder(config: &ExtruderConfig) -> Result<StepperHandle, MotionError> {
    let mut sk = ExtruderStepper::new();
    sk.set_pressure_advance(config.pressure_advance, config.pressure_advance_smooth_time)?;
    Ok(StepperHandle::new("extruder", config.step_distance(), Box::new(sk)))
}
