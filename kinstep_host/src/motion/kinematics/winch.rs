// src/motion/kinematics/winch.rs
//! Cable winch: the stepper position is the cable length to its anchor.

use std::any::Any;

use kinstep_shared::trapq::{Coord, MoveCursor};

use super::{ActiveFlags, StepperKinematics};

#[derive(Debug, Clone)]
pub struct WinchStepper {
    anchor: Coord,
}

impl WinchStepper {
    pub fn new(anchor: Coord) -> Self {
        Self { anchor }
    }

    pub fn anchor(&self) -> Coord {
        self.anchor
    }
}

impl StepperKinematics for WinchStepper {
    fn calc_position(&self, cursor: &MoveCursor<'_>, move_time: f64) -> f64 {
        let c = cursor.get().get_coord(move_time);
        let dx = self.anchor.x - c.x;
        let dy = self.anchor.y - c.y;
        let dz = self.anchor.z - c.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    fn active_flags(&self) -> ActiveFlags {
        ActiveFlags::XYZ
    }

    fn name(&self) -> &'static str {
        "winch"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
