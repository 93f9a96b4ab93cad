// src/motion/kinematics/delta.rs
//! Linear delta tower carriage.

use std::any::Any;

use kinstep_shared::trapq::{Coord, MoveCursor};

use super::{ActiveFlags, KinematicsError, StepperKinematics};

#[derive(Debug, Clone)]
pub struct DeltaStepper {
    arm2: f64,
    tower_x: f64,
    tower_y: f64,
}

impl DeltaStepper {
    pub fn new(arm_length: f64, tower_x: f64, tower_y: f64) -> Result<Self, KinematicsError> {
        if !(arm_length > 0.0) {
            return Err(KinematicsError::InvalidParameter(format!(
                "delta arm length must be > 0, got {}",
                arm_length
            )));
        }
        Ok(Self {
            arm2: arm_length * arm_length,
            tower_x,
            tower_y,
        })
    }

    pub fn tower(&self) -> (f64, f64) {
        (self.tower_x, self.tower_y)
    }

    /// Whether the arm can reach `c` from this tower.
    pub fn is_reachable(&self, c: Coord) -> bool {
        self.radicand(c) >= 0.0
    }

    fn radicand(&self, c: Coord) -> f64 {
        let dx = self.tower_x - c.x;
        let dy = self.tower_y - c.y;
        self.arm2 - dx * dx - dy * dy
    }
}

impl StepperKinematics for DeltaStepper {
    // Out of reach coordinates produce NaN, which the solver reports.
    fn calc_position(&self, cursor: &MoveCursor<'_>, move_time: f64) -> f64 {
        let c = cursor.get().get_coord(move_time);
        self.radicand(c).sqrt() + c.z
    }

    fn active_flags(&self) -> ActiveFlags {
        ActiveFlags::XYZ
    }

    fn name(&self) -> &'static str {
        "delta"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Build the three tower steppers of a delta printer; `angles` are in degrees.
pub fn delta_towers(
    radius: f64,
    arm_length: f64,
    angles: [f64; 3],
) -> Result<[DeltaStepper; 3], KinematicsError> {
    if arm_length <= radius {
        return Err(KinematicsError::InvalidParameter(format!(
            "delta arm length {} must exceed radius {}",
            arm_length, radius
        )));
    }
    let tower = |angle: f64| {
        let a = angle.to_radians();
        DeltaStepper::new(arm_length, a.cos() * radius, a.sin() * radius)
    };
    Ok([tower(angles[0])?, tower(angles[1])?, tower(angles[2])?])
}
