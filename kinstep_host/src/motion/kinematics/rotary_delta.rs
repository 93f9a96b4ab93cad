// src/motion/kinematics/rotary_delta.rs
//! Rotary delta shoulder joint. Positions are upper arm angles in radians.

use std::any::Any;

use kinstep_shared::trapq::MoveCursor;

use super::{ActiveFlags, KinematicsError, StepperKinematics};

#[derive(Debug, Clone)]
pub struct RotaryDeltaStepper {
    cos: f64,
    sin: f64,
    shoulder_radius: f64,
    shoulder_height: f64,
    upper_arm: f64,
    upper_arm2: f64,
    lower_arm2: f64,
}

impl RotaryDeltaStepper {
    /// `angle` is the shoulder's bearing around the z axis, in radians.
    pub fn new(
        shoulder_radius: f64,
        shoulder_height: f64,
        angle: f64,
        upper_arm: f64,
        lower_arm: f64,
    ) -> Result<Self, KinematicsError> {
        if !(upper_arm > 0.0 && lower_arm > 0.0) {
            return Err(KinematicsError::InvalidParameter(format!(
                "rotary delta arm lengths must be > 0 (upper={}, lower={})",
                upper_arm, lower_arm
            )));
        }
        Ok(Self {
            cos: angle.cos(),
            sin: angle.sin(),
            shoulder_radius,
            shoulder_height,
            upper_arm,
            upper_arm2: upper_arm * upper_arm,
            lower_arm2: lower_arm * lower_arm,
        })
    }
}

impl StepperKinematics for RotaryDeltaStepper {
    fn calc_position(&self, cursor: &MoveCursor<'_>, move_time: f64) -> f64 {
        let c = cursor.get().get_coord(move_time);
        // Shoulder frame: x points away from the centre, upper arm in the xz plane
        let sx = c.x * self.cos + c.y * self.sin - self.shoulder_radius;
        let sy = -c.x * self.sin + c.y * self.cos;
        let sz = c.z - self.shoulder_height;
        let dist2 = sx * sx + sy * sy + sz * sz;
        let dist_xz = (sx * sx + sz * sz).sqrt();
        let cos_elbow = (self.upper_arm2 - self.lower_arm2 + dist2) / (2.0 * dist_xz * self.upper_arm);
        sz.atan2(sx) + cos_elbow.acos()
    }

    fn active_flags(&self) -> ActiveFlags {
        ActiveFlags::XYZ
    }

    fn name(&self) -> &'static str {
        "rotary_delta"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::kinematics::position_at;
    use kinstep_shared::trapq::Coord;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn horizontal_upper_arm_is_zero_angle() {
        let sk = RotaryDeltaStepper::new(0.0, 0.0, 0.0, 1.0, 1.0).unwrap();
        let angle = position_at(&sk, Coord::new(1.0, 0.0, -1.0));
        assert!(angle.abs() < 1e-12);
    }

    #[test]
    fn shoulder_bearing_rotates_frame() {
        let sk = RotaryDeltaStepper::new(0.0, 0.0, FRAC_PI_2, 1.0, 1.0).unwrap();
        let angle = position_at(&sk, Coord::new(0.0, 1.0, -1.0));
        assert!(angle.abs() < 1e-12);
        let raised = position_at(&sk, Coord::new(0.0, 1.0, -0.5));
        assert!(raised > 0.0);
    }

    #[test]
    fn rejects_bad_arms() {
        assert!(RotaryDeltaStepper::new(30.0, 100.0, 0.0, 0.0, 200.0).is_err());
    }
}
