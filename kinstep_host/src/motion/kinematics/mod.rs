// src/motion/kinematics/mod.rs
//! Per-stepper kinematic models.
//!
//! A model maps the toolhead trajectory to the linear position of one
//! stepper. The iterative solver only ever asks for positions, so each model
//! is a single function of the current move and a time offset into it.

use std::any::Any;
use std::fmt;
use std::str::FromStr;

use kinstep_shared::trapq::{Axis, Coord, Move, MoveCursor};
use thiserror::Error;

mod cartesian;
mod delta;
mod extruder;
mod idex;
mod rotary_delta;
mod shaper;
mod winch;

pub use cartesian::{CartesianStepper, CoreXYStepper, CoreXZStepper};
pub use delta::{delta_towers, DeltaStepper};
pub use extruder::ExtruderStepper;
pub use idex::DualCarriage;
pub use rotary_delta::RotaryDeltaStepper;
pub use shaper::{InputShaper, ShaperPulses, MAX_PULSES};
pub use winch::WinchStepper;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum KinematicsError {
    #[error("Invalid axis '{0}'")]
    InvalidAxis(char),
    #[error("Invalid kinematic parameter: {0}")]
    InvalidParameter(String),
}

/// Axes of the toolhead motion that can move a stepper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ActiveFlags(u8);

impl ActiveFlags {
    pub const NONE: Self = Self(0);
    pub const X: Self = Self(1 << 0);
    pub const Y: Self = Self(1 << 1);
    pub const Z: Self = Self(1 << 2);
    pub const XY: Self = Self(Self::X.0 | Self::Y.0);
    pub const XYZ: Self = Self(Self::X.0 | Self::Y.0 | Self::Z.0);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn from_axis(axis: Axis) -> Self {
        match axis {
            Axis::X => Self::X,
            Axis::Y => Self::Y,
            Axis::Z => Self::Z,
        }
    }

    /// True when the direction ratios of `m` move any of these axes.
    pub fn moves_with(self, m: &Move) -> bool {
        (self.contains(Self::X) && m.axes_r.x != 0.0)
            || (self.contains(Self::Y) && m.axes_r.y != 0.0)
            || (self.contains(Self::Z) && m.axes_r.z != 0.0)
    }
}

impl std::ops::BitOr for ActiveFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Position function of one stepper.
pub trait StepperKinematics: Any + Send + Sync {
    /// Stepper position `move_time` seconds into the move under `cursor`.
    fn calc_position(&self, cursor: &MoveCursor<'_>, move_time: f64) -> f64;

    fn active_flags(&self) -> ActiveFlags;

    /// Seconds before an active move during which steps must still be generated.
    fn gen_steps_pre_active(&self) -> f64 {
        0.0
    }

    /// Seconds after an active move during which steps must still be generated.
    fn gen_steps_post_active(&self) -> f64 {
        0.0
    }

    fn name(&self) -> &'static str;

    /// Model wrapped by this one, for wrappers such as input shaping.
    fn delegate_mut(&mut self) -> Option<&mut dyn StepperKinematics> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl fmt::Debug for dyn StepperKinematics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepperKinematics")
            .field("name", &self.name())
            .field("active_flags", &self.active_flags())
            .finish()
    }
}

/// First model of type `T` in the chain starting at `sk`, looking through
/// wrappers.
pub fn find_kinematics_mut<T: StepperKinematics>(sk: &mut dyn StepperKinematics) -> Option<&mut T> {
    if sk.as_any().is::<T>() {
        return sk.as_any_mut().downcast_mut::<T>();
    }
    sk.delegate_mut().and_then(find_kinematics_mut::<T>)
}

/// Evaluate a model at a fixed toolhead coordinate.
pub fn position_at(sk: &dyn StepperKinematics, coord: Coord) -> f64 {
    let m = Move::stationary(coord);
    sk.calc_position(&MoveCursor::single(&m), 0.5 * m.move_t)
}

/// A wrapper refused a delegate; the delegate is handed back unchanged.
#[derive(Error)]
#[error("Cannot attach {} kinematics: {}", .kinematics.name(), .error)]
pub struct AttachError {
    pub error: KinematicsError,
    pub kinematics: Box<dyn StepperKinematics>,
}

impl fmt::Debug for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachError")
            .field("error", &self.error)
            .field("kinematics", &self.kinematics.name())
            .finish()
    }
}

/// Printer kinematics families selectable in `[printer] kinematics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KinematicsType {
    Cartesian,
    CoreXY,
    CoreXZ,
    Delta,
    RotaryDelta,
    Winch,
    None,
}

impl FromStr for KinematicsType {
    type Err = KinematicsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cartesian" => Ok(Self::Cartesian),
            "corexy" => Ok(Self::CoreXY),
            "corexz" => Ok(Self::CoreXZ),
            "delta" => Ok(Self::Delta),
            "rotary_delta" => Ok(Self::RotaryDelta),
            "winch" => Ok(Self::Winch),
            "none" => Ok(Self::None),
            other => Err(KinematicsError::InvalidParameter(format!(
                "unknown kinematics '{}'",
                other
            ))),
        }
    }
}

/// Parse a single-character axis token such as `"x"` or `"+"`.
pub(crate) fn single_char(token: &str) -> Result<char, KinematicsError> {
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(KinematicsError::InvalidParameter(format!(
            "expected a single axis character, got '{}'",
            token
        ))),
    }
}

/// Factory for the stepper model of a cartesian-family machine.
pub fn create_kinematics(
    kinematics_type: KinematicsType,
    axis: &str,
) -> Result<Box<dyn StepperKinematics>, KinematicsError> {
    let token = single_char(axis)?;
    match kinematics_type {
        KinematicsType::Cartesian => Ok(Box::new(CartesianStepper::new(token)?)),
        KinematicsType::CoreXY => match token {
            '+' | '-' => Ok(Box::new(CoreXYStepper::new(token)?)),
            'z' => Ok(Box::new(CartesianStepper::new(token)?)),
            other => Err(KinematicsError::InvalidAxis(other)),
        },
        KinematicsType::CoreXZ => match token {
            '+' | '-' => Ok(Box::new(CoreXZStepper::new(token)?)),
            'y' => Ok(Box::new(CartesianStepper::new(token)?)),
            other => Err(KinematicsError::InvalidAxis(other)),
        },
        other => Err(KinematicsError::InvalidParameter(format!(
            "{:?} steppers are built from their geometry section",
            other
        ))),
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use kinstep_shared::trapq::{Coord, Move, MovePhase};

    /// Constant velocity move along `axes_r` starting at `start`.
    pub fn cruise(start: Coord, axes_r: Coord, velocity: f64, move_t: f64) -> Move {
        Move {
            print_time: 0.0,
            move_t,
            start_v: velocity,
            half_accel: 0.0,
            start_pos: start,
            axes_r,
            phase: MovePhase::Cruise,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_follow_move_direction() {
        let m = Move {
            axes_r: Coord::new(0.0, 1.0, 0.0),
            ..Move::default()
        };
        assert!(ActiveFlags::XY.moves_with(&m));
        assert!(!ActiveFlags::X.moves_with(&m));
        assert!(!(ActiveFlags::X | ActiveFlags::Z).moves_with(&m));
        assert_eq!(ActiveFlags::XY.without(ActiveFlags::X), ActiveFlags::Y);
    }

    #[test]
    fn factory_maps_axis_tokens() {
        let sk = create_kinematics(KinematicsType::CoreXY, "-").unwrap();
        assert_eq!(sk.name(), "corexy");
        assert_eq!(position_at(sk.as_ref(), Coord::new(3.0, 1.0, 0.0)), 2.0);
        let z = create_kinematics(KinematicsType::CoreXY, "z").unwrap();
        assert_eq!(z.active_flags(), ActiveFlags::Z);
        assert_eq!(
            create_kinematics(KinematicsType::Cartesian, "q").unwrap_err(),
            KinematicsError::InvalidAxis('q')
        );
        assert!(create_kinematics(KinematicsType::Delta, "x").is_err());
        assert!("hexapod".parse::<KinematicsType>().is_err());
    }
}
