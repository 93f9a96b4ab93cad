// src/motion/kinematics/cartesian.rs
//! Linear axis, CoreXY and CoreXZ stepper models.

use std::any::Any;

use kinstep_shared::trapq::{Axis, MoveCursor};

use super::{ActiveFlags, KinematicsError, StepperKinematics};

/// Stepper that follows one cartesian axis directly
#[derive(Debug, Clone)]
pub struct CartesianStepper {
    axis: Axis,
}

impl CartesianStepper {
    pub fn new(axis: char) -> Result<Self, KinematicsError> {
        let axis = Axis::from_char(axis).ok_or(KinematicsError::InvalidAxis(axis))?;
        Ok(Self { axis })
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }
}

impl StepperKinematics for CartesianStepper {
    fn calc_position(&self, cursor: &MoveCursor<'_>, move_time: f64) -> f64 {
        cursor.get().axis_position(self.axis, move_time)
    }

    fn active_flags(&self) -> ActiveFlags {
        ActiveFlags::from_axis(self.axis)
    }

    fn name(&self) -> &'static str {
        "cartesian"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Sign applied to the second axis of a belt pair
fn belt_sign(token: char) -> Result<f64, KinematicsError> {
    match token {
        '+' => Ok(1.0),
        '-' => Ok(-1.0),
        other => Err(KinematicsError::InvalidAxis(other)),
    }
}

/// CoreXY belt: position is `x + y` for '+' and `x - y` for '-'.
#[derive(Debug, Clone)]
pub struct CoreXYStepper {
    sign: f64,
}

impl CoreXYStepper {
    pub fn new(token: char) -> Result<Self, KinematicsError> {
        Ok(Self {
            sign: belt_sign(token)?,
        })
    }
}

impl StepperKinematics for CoreXYStepper {
    fn calc_position(&self, cursor: &MoveCursor<'_>, move_time: f64) -> f64 {
        let c = cursor.get().get_coord(move_time);
        c.x + self.sign * c.y
    }

    fn active_flags(&self) -> ActiveFlags {
        ActiveFlags::XY
    }

    fn name(&self) -> &'static str {
        "corexy"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// CoreXZ belt: position is `x + z` for '+' and `x - z` for '-'.
#[derive(Debug, Clone)]
pub struct CoreXZStepper {
    sign: f64,
}

impl CoreXZStepper {
    pub fn new(token: char) -> Result<Self, KinematicsError> {
        Ok(Self {
            sign: belt_sign(token)?,
        })
    }
}

impl StepperKinematics for CoreXZStepper {
    fn calc_position(&self, cursor: &MoveCursor<'_>, move_time: f64) -> f64 {
        let c = cursor.get().get_coord(move_time);
        c.x + self.sign * c.z
    }

    fn active_flags(&self) -> ActiveFlags {
        ActiveFlags::X | ActiveFlags::Z
    }

    fn name(&self) -> &'static str {
        "corexz"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
