// src/motion/kinematics/idex.rs
//! Dual carriage (IDEX) wrapper: applies a per-axis affine transform to the
//! toolhead coordinate before handing it to the carriage's own model.

use std::any::Any;

use kinstep_shared::trapq::MoveCursor;

use super::{ActiveFlags, KinematicsError, StepperKinematics};

#[derive(Debug)]
pub struct DualCarriage {
    orig: Box<dyn StepperKinematics>,
    x_scale: f64,
    x_offs: f64,
    y_scale: f64,
    y_offs: f64,
    active_flags: ActiveFlags,
}

impl DualCarriage {
    pub fn new(orig: Box<dyn StepperKinematics>) -> Self {
        let active_flags = orig.active_flags();
        Self {
            orig,
            x_scale: 1.0,
            x_offs: 0.0,
            y_scale: 1.0,
            y_offs: 0.0,
            active_flags,
        }
    }

    /// Bind a new delegate, returning the previous one. The transform is
    /// kept; an axis stays parked while its scale is zero.
    pub fn set_sk(&mut self, orig: Box<dyn StepperKinematics>) -> Box<dyn StepperKinematics> {
        let previous = std::mem::replace(&mut self.orig, orig);
        self.active_flags = self.orig.active_flags();
        if self.x_scale == 0.0 {
            self.active_flags = self.active_flags.without(ActiveFlags::X);
        }
        if self.y_scale == 0.0 {
            self.active_flags = self.active_flags.without(ActiveFlags::Y);
        }
        previous
    }

    /// Map `axis` as `pos * scale + offs`. A zero scale parks the carriage on
    /// that axis, so toolhead motion along it no longer moves this stepper.
    pub fn set_transform(&mut self, axis: char, scale: f64, offs: f64) -> Result<(), KinematicsError> {
        let flag = match axis {
            'x' => {
                self.x_scale = scale;
                self.x_offs = offs;
                ActiveFlags::X
            }
            'y' => {
                self.y_scale = scale;
                self.y_offs = offs;
                ActiveFlags::Y
            }
            other => return Err(KinematicsError::InvalidAxis(other)),
        };
        if scale == 0.0 {
            self.active_flags = self.active_flags.without(flag);
        } else if self.orig.active_flags().contains(flag) {
            self.active_flags = self.active_flags | flag;
        }
        Ok(())
    }

    pub fn transform(&self, axis: char) -> Option<(f64, f64)> {
        match axis {
            'x' => Some((self.x_scale, self.x_offs)),
            'y' => Some((self.y_scale, self.y_offs)),
            _ => None,
        }
    }

    pub fn delegate(&self) -> &dyn StepperKinematics {
        self.orig.as_ref()
    }

    pub fn into_inner(self) -> Box<dyn StepperKinematics> {
        self.orig
    }
}

impl StepperKinematics for DualCarriage {
    fn calc_position(&self, cursor: &MoveCursor<'_>, move_time: f64) -> f64 {
        let mut m = cursor.get();
        m.start_pos.x = m.start_pos.x * self.x_scale + self.x_offs;
        m.start_pos.y = m.start_pos.y * self.y_scale + self.y_offs;
        m.axes_r.x *= self.x_scale;
        m.axes_r.y *= self.y_scale;
        self.orig.calc_position(&cursor.with_current(&m), move_time)
    }

    fn active_flags(&self) -> ActiveFlags {
        self.active_flags
    }

    fn gen_steps_pre_active(&self) -> f64 {
        self.orig.gen_steps_pre_active()
    }

    fn gen_steps_post_active(&self) -> f64 {
        self.orig.gen_steps_post_active()
    }

    fn name(&self) -> &'static str {
        "dual_carriage"
    }

    fn delegate_mut(&mut self) -> Option<&mut dyn StepperKinematics> {
        Some(self.orig.as_mut())
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
    use crate::motion::kinematics::test_util::cruise;
    use crate::motion::kinematics::{position_at, CartesianStepper, ExtruderStepper};
    use kinstep_shared::trapq::{Coord, TrapQueue};

    #[test]
    fn mirror_transform_applies_to_delegate() {
        let mut dc = DualCarriage::new(Box::new(CartesianStepper::new('x').unwrap()));
        assert_eq!(position_at(&dc, Coord::new(12.0, 0.0, 0.0)), 12.0);
        dc.set_transform('x', -1.0, 300.0).unwrap();
        assert_eq!(position_at(&dc, Coord::new(12.0, 0.0, 0.0)), 288.0);
        assert_eq!(dc.set_transform('z', 1.0, 0.0), Err(KinematicsError::InvalidAxis('z')));
    }

    #[test]
    fn zero_scale_parks_axis() {
        let mut dc = DualCarriage::new(Box::new(CartesianStepper::new('x').unwrap()));
        dc.set_transform('x', 0.0, 250.0).unwrap();
        assert!(dc.active_flags().is_empty());
        assert_eq!(position_at(&dc, Coord::new(12.0, 0.0, 0.0)), 250.0);
        dc.set_transform('x', 1.0, 0.0).unwrap();
        assert_eq!(dc.active_flags(), ActiveFlags::X);
        // Never gains an axis the delegate does not move
        dc.set_transform('y', 1.0, 0.0).unwrap();
        assert_eq!(dc.active_flags(), ActiveFlags::X);
    }

    #[test]
    fn set_sk_keeps_transform() {
        let mut dc = DualCarriage::new(Box::new(CartesianStepper::new('x').unwrap()));
        dc.set_transform('x', 0.0, 5.0).unwrap();
        dc.set_transform('y', -1.0, 200.0).unwrap();
        let old = dc.set_sk(Box::new(CartesianStepper::new('y').unwrap()));
        assert_eq!(old.active_flags(), ActiveFlags::X);
        assert_eq!(dc.active_flags(), ActiveFlags::Y);
        assert_eq!(dc.transform('x'), Some((0.0, 5.0)));
        assert_eq!(dc.transform('y'), Some((-1.0, 200.0)));
        assert_eq!(position_at(&dc, Coord::new(0.0, 30.0, 0.0)), 170.0);
        // A parked axis stays parked under the new delegate
        dc.set_sk(Box::new(CartesianStepper::new('x').unwrap()));
        assert!(dc.active_flags().is_empty());
        assert_eq!(position_at(&dc, Coord::new(12.0, 0.0, 0.0)), 5.0);
    }

    #[test]
    fn moving_copy_keeps_time_and_velocity() {
        let m = cruise(Coord::new(10.0, 0.0, 0.0), Coord::new(1.0, 0.0, 0.0), 20.0, 1.0);
        let cursor = MoveCursor::single(&m);
        let mut dc = DualCarriage::new(Box::new(CartesianStepper::new('x').unwrap()));
        dc.set_transform('x', -1.0, 300.0).unwrap();
        for i in 0..=4 {
            let t = i as f64 * 0.25;
            let expected = 300.0 - (10.0 + 20.0 * t);
            assert!((dc.calc_position(&cursor, t) - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn delegate_sees_neighbouring_moves() {
        // A smoothed extruder looks across move boundaries; behind a dual
        // carriage it must still see the real queue around the current move.
        let mut tq = TrapQueue::new();
        tq.append(1.0, 0.0, 1.0, 0.0, Coord::default(), Coord::new(1.0, 0.0, 0.0), 0.0, 10.0, 0.0)
            .unwrap();
        tq.append(2.0, 0.0, 1.0, 0.0, Coord::new(10.0, 0.0, 0.0), Coord::new(1.0, 0.0, 0.0), 0.0, 10.0, 0.0)
            .unwrap();
        let mut ex = ExtruderStepper::new();
        ex.set_pressure_advance(0.0, 0.2).unwrap();
        let reference = ex.calc_position(&tq.cursor(1).unwrap(), 0.95);
        let dc = DualCarriage::new(Box::new(ex));
        let cursor = tq.cursor(1).unwrap();
        assert!((dc.calc_position(&cursor, 0.95) - reference).abs() < 1e-9);
        let current = cursor.get();
        let alone = MoveCursor::single(&current);
        assert!((dc.calc_position(&alone, 0.95) - reference).abs() > 1e-3);
    }

    #[test]
    fn delegate_is_reachable_for_reconfiguration() {
        let mut dc = DualCarriage::new(Box::new(CartesianStepper::new('x').unwrap()));
        let inner = dc.delegate_mut().unwrap();
        assert_eq!(inner.name(), "cartesian");
        assert!(inner.delegate_mut().is_none());
    }
}
