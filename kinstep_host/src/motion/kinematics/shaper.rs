// src/motion/kinematics/shaper.rs
//! Input shaping wrapper.
//!
//! The shaped X/Y position is the convolution of the commanded trajectory
//! with a short train of weighted impulses. The delegate model is evaluated
//! at the shaped coordinate, so any XY kinematics can be shaped.

use std::any::Any;

use kinstep_shared::trapq::{Axis, MoveCursor};

use super::{ActiveFlags, AttachError, KinematicsError, StepperKinematics};

pub const MAX_PULSES: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pulse {
    pub t: f64,
    pub a: f64,
}

/// Normalized, time-centred impulse train, ordered by increasing time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ShaperPulses {
    num_pulses: usize,
    pulses: [Pulse; MAX_PULSES],
}

impl ShaperPulses {
    /// Build from a shaper definition with amplitudes `a` at times `t`.
    pub fn new(n: usize, a: &[f64], t: &[f64]) -> Result<Self, KinematicsError> {
        if n > MAX_PULSES {
            return Err(KinematicsError::InvalidParameter(format!(
                "shaper has {} pulses, at most {} supported",
                n, MAX_PULSES
            )));
        }
        if a.len() != n || t.len() != n {
            return Err(KinematicsError::InvalidParameter(format!(
                "shaper needs {} amplitudes and times, got {} and {}",
                n,
                a.len(),
                t.len()
            )));
        }
        let mut sp = Self::default();
        if n == 0 {
            return Ok(sp);
        }
        let sum_a: f64 = a.iter().sum();
        if sum_a == 0.0 || !sum_a.is_finite() {
            return Err(KinematicsError::InvalidParameter(
                "shaper amplitudes must have a non-zero sum".to_string(),
            ));
        }
        // Stored reversed in time relative to the usual definition
        for i in 0..n {
            sp.pulses[n - i - 1] = Pulse {
                a: a[i] / sum_a,
                t: -t[i],
            };
        }
        sp.num_pulses = n;
        let shift: f64 = sp.pulses().iter().map(|p| p.a * p.t).sum();
        for p in &mut sp.pulses[..n] {
            p.t -= shift;
        }
        Ok(sp)
    }

    pub fn pulses(&self) -> &[Pulse] {
        &self.pulses[..self.num_pulses]
    }

    pub fn is_empty(&self) -> bool {
        self.num_pulses == 0
    }

    /// Time the shaped position looks ahead of the commanded one.
    fn lookahead(&self) -> f64 {
        self.pulses().last().map_or(0.0, |p| p.t)
    }

    /// Time the shaped position lags behind the commanded one.
    fn lookbehind(&self) -> f64 {
        self.pulses().first().map_or(0.0, |p| -p.t)
    }

    fn shaped_position(&self, cursor: &MoveCursor<'_>, axis: Axis, move_time: f64) -> f64 {
        self.pulses()
            .iter()
            .map(|p| p.a * cursor.axis_position_across_moves(axis, move_time + p.t))
            .sum()
    }
}

fn check_delegate(sk: &dyn StepperKinematics) -> Result<(), KinematicsError> {
    let flags = sk.active_flags();
    if flags.contains(ActiveFlags::X) || flags.contains(ActiveFlags::Y) {
        Ok(())
    } else {
        Err(KinematicsError::InvalidParameter(format!(
            "{} kinematics moves neither X nor Y",
            sk.name()
        )))
    }
}

#[derive(Debug)]
pub struct InputShaper {
    orig: Box<dyn StepperKinematics>,
    sx: ShaperPulses,
    sy: ShaperPulses,
}

impl InputShaper {
    /// Wrap `orig`, which must move X or Y. Starts unshaped.
    pub fn new(orig: Box<dyn StepperKinematics>) -> Result<Self, AttachError> {
        if let Err(error) = check_delegate(orig.as_ref()) {
            return Err(AttachError {
                error,
                kinematics: orig,
            });
        }
        Ok(Self {
            orig,
            sx: ShaperPulses::default(),
            sy: ShaperPulses::default(),
        })
    }

    /// Replace the delegate, returning the previous one. Pulses are kept for
    /// the axes the new delegate moves.
    pub fn set_sk(
        &mut self,
        orig: Box<dyn StepperKinematics>,
    ) -> Result<Box<dyn StepperKinematics>, AttachError> {
        if let Err(error) = check_delegate(orig.as_ref()) {
            return Err(AttachError {
                error,
                kinematics: orig,
            });
        }
        let previous = std::mem::replace(&mut self.orig, orig);
        let flags = self.orig.active_flags();
        if !flags.contains(ActiveFlags::X) {
            self.sx = ShaperPulses::default();
        }
        if !flags.contains(ActiveFlags::Y) {
            self.sy = ShaperPulses::default();
        }
        Ok(previous)
    }

    /// Configure the impulse train for `axis`. An axis the delegate does not
    /// move is left unshaped. On error the axis is left unshaped too.
    pub fn set_shaper_params(
        &mut self,
        axis: char,
        n: usize,
        a: &[f64],
        t: &[f64],
    ) -> Result<(), KinematicsError> {
        let flag = match axis {
            'x' => ActiveFlags::X,
            'y' => ActiveFlags::Y,
            other => return Err(KinematicsError::InvalidAxis(other)),
        };
        let result = if self.orig.active_flags().contains(flag) {
            ShaperPulses::new(n, a, t)
        } else {
            Ok(ShaperPulses::default())
        };
        let slot = if flag == ActiveFlags::X {
            &mut self.sx
        } else {
            &mut self.sy
        };
        match result {
            Ok(sp) => {
                *slot = sp;
                Ok(())
            }
            Err(e) => {
                *slot = ShaperPulses::default();
                Err(e)
            }
        }
    }

    /// Look-ahead and look-behind of the shaped axes the delegate moves
    /// right now. The delegate can change under us through `delegate_mut`.
    fn generation_windows(&self) -> (f64, f64) {
        let flags = self.orig.active_flags();
        let mut pre = 0.0f64;
        let mut post = 0.0f64;
        for (flag, sp) in [(ActiveFlags::X, &self.sx), (ActiveFlags::Y, &self.sy)] {
            if flags.contains(flag) && !sp.is_empty() {
                pre = pre.max(sp.lookahead());
                post = post.max(sp.lookbehind());
            }
        }
        (pre, post)
    }

    /// Extra time around each move the stepper must be scanned for steps.
    pub fn get_step_generation_window(&self) -> f64 {
        let (pre, post) = self.generation_windows();
        pre.max(post)
    }

    pub fn pulses(&self, axis: Axis) -> Option<&ShaperPulses> {
        match axis {
            Axis::X => Some(&self.sx),
            Axis::Y => Some(&self.sy),
            Axis::Z => None,
        }
    }

    pub fn delegate(&self) -> &dyn StepperKinematics {
        self.orig.as_ref()
    }

    /// Reconfigure the wrapped model in place, e.g. a dual carriage
    /// changing mode. Pulses already set are kept.
    pub fn delegate_mut(&mut self) -> &mut dyn StepperKinematics {
        self.orig.as_mut()
    }

    pub fn into_inner(self) -> Box<dyn StepperKinematics> {
        self.orig
    }
}

impl StepperKinematics for InputShaper {
    fn calc_position(&self, cursor: &MoveCursor<'_>, move_time: f64) -> f64 {
        if self.sx.is_empty() && self.sy.is_empty() {
            return self.orig.calc_position(cursor, move_time);
        }
        let mut m = cursor.get();
        if !self.sx.is_empty() {
            m.start_pos.x = self.sx.shaped_position(cursor, Axis::X, move_time);
            m.axes_r.x = 0.0;
        }
        if !self.sy.is_empty() {
            m.start_pos.y = self.sy.shaped_position(cursor, Axis::Y, move_time);
            m.axes_r.y = 0.0;
        }
        self.orig.calc_position(&cursor.with_current(&m), move_time)
    }

    fn active_flags(&self) -> ActiveFlags {
        self.orig.active_flags()
    }

    fn gen_steps_pre_active(&self) -> f64 {
        self.generation_windows().0
    }

    fn gen_steps_post_active(&self) -> f64 {
        self.generation_windows().1
    }

    fn name(&self) -> &'static str {
        "input_shaper"
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
    use crate::motion::kinematics::{CartesianStepper, CoreXYStepper, DualCarriage, WinchStepper};
    use kinstep_shared::trapq::{Coord, TrapQueue};

    fn shaped_x() -> InputShaper {
        InputShaper::new(Box::new(CartesianStepper::new('x').unwrap())).unwrap()
    }

    #[test]
    fn unit_impulse_is_identity() {
        let mut is = shaped_x();
        is.set_shaper_params('x', 1, &[1.0], &[0.0]).unwrap();
        assert_eq!(is.get_step_generation_window(), 0.0);
        let m = cruise(Coord::new(3.0, 0.0, 0.0), Coord::new(1.0, 0.0, 0.0), 20.0, 1.0);
        let cursor = MoveCursor::single(&m);
        let orig = CartesianStepper::new('x').unwrap();
        for i in 0..=10 {
            let t = i as f64 * 0.1;
            assert!((is.calc_position(&cursor, t) - orig.calc_position(&cursor, t)).abs() < 1e-12);
        }
    }

    #[test]
    fn pulses_are_normalized_and_centred() {
        let sp = ShaperPulses::new(2, &[1.0, 1.0], &[0.0, 0.02]).unwrap();
        let pulses = sp.pulses();
        assert_eq!(pulses.len(), 2);
        assert!((pulses[0].a - 0.5).abs() < 1e-12);
        assert!((pulses[0].t + 0.01).abs() < 1e-12);
        assert!((pulses[1].t - 0.01).abs() < 1e-12);
        let centre: f64 = pulses.iter().map(|p| p.a * p.t).sum();
        assert!(centre.abs() < 1e-15);
    }

    #[test]
    fn shaped_position_smooths_across_moves() {
        let mut tq = TrapQueue::new();
        tq.append(1.0, 0.0, 1.0, 0.0, Coord::default(), Coord::new(1.0, 0.0, 0.0), 0.0, 10.0, 0.0)
            .unwrap();
        let mut is = shaped_x();
        is.set_shaper_params('x', 2, &[1.0, 1.0], &[0.0, 0.2]).unwrap();
        assert!((is.get_step_generation_window() - 0.1).abs() < 1e-12);
        assert!((is.gen_steps_pre_active() - 0.1).abs() < 1e-12);
        let cursor = tq.cursor(1).unwrap();
        // At move start half the weight still sees the lead-in hold at 0
        assert!((is.calc_position(&cursor, 0.0) - 0.5).abs() < 1e-9);
        assert!((is.calc_position(&cursor, 0.5) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_params_leave_axis_unshaped() {
        let mut is = shaped_x();
        is.set_shaper_params('x', 2, &[1.0, 1.0], &[0.0, 0.2]).unwrap();
        let err = is.set_shaper_params('x', 6, &[1.0; 6], &[0.0; 6]).unwrap_err();
        assert!(matches!(err, KinematicsError::InvalidParameter(_)));
        assert!(is.pulses(Axis::X).unwrap().is_empty());
        assert_eq!(is.get_step_generation_window(), 0.0);
        assert_eq!(
            is.set_shaper_params('z', 1, &[1.0], &[0.0]),
            Err(KinematicsError::InvalidAxis('z'))
        );
        assert!(is.set_shaper_params('x', 2, &[1.0], &[0.0, 0.1]).is_err());
        assert!(is.set_shaper_params('x', 2, &[1.0, -1.0], &[0.0, 0.1]).is_err());
    }

    #[test]
    fn axis_not_moved_by_delegate_is_skipped() {
        let mut is = shaped_x();
        is.set_shaper_params('y', 2, &[1.0, 1.0], &[0.0, 0.2]).unwrap();
        assert!(is.pulses(Axis::Y).unwrap().is_empty());
        let mut xy = InputShaper::new(Box::new(CoreXYStepper::new('+').unwrap())).unwrap();
        xy.set_shaper_params('y', 2, &[1.0, 1.0], &[0.0, 0.2]).unwrap();
        assert!(!xy.pulses(Axis::Y).unwrap().is_empty());
    }

    #[test]
    fn attach_rejects_z_only_delegate() {
        let err = InputShaper::new(Box::new(CartesianStepper::new('z').unwrap())).unwrap_err();
        assert_eq!(err.kinematics.active_flags(), ActiveFlags::Z);
        let mut is = shaped_x();
        let prev = is.set_sk(Box::new(WinchStepper::new(Coord::default()))).unwrap();
        assert_eq!(prev.name(), "cartesian");
    }

    #[test]
    fn shaped_dual_carriage_changes_mode_in_place() {
        let dc = DualCarriage::new(Box::new(CartesianStepper::new('x').unwrap()));
        let mut is = InputShaper::new(Box::new(dc)).unwrap();
        is.set_shaper_params('x', 2, &[1.0, 1.0], &[0.0, 0.2]).unwrap();
        let m = cruise(Coord::new(100.0, 0.0, 0.0), Coord::new(1.0, 0.0, 0.0), 10.0, 1.0);
        let cursor = MoveCursor::single(&m);
        assert!((is.calc_position(&cursor, 0.5) - 105.0).abs() < 1e-9);

        // Mirror mode through the wrapper: shaping stays on
        let dc = is.delegate_mut().as_any_mut().downcast_mut::<DualCarriage>().unwrap();
        dc.set_transform('x', -1.0, 300.0).unwrap();
        assert!((is.calc_position(&cursor, 0.5) - 195.0).abs() < 1e-9);
        assert!((is.get_step_generation_window() - 0.1).abs() < 1e-12);

        // Parked: the stepper no longer moves and needs no extra window
        let dc = is.delegate_mut().as_any_mut().downcast_mut::<DualCarriage>().unwrap();
        dc.set_transform('x', 0.0, 250.0).unwrap();
        assert!(is.active_flags().is_empty());
        assert_eq!(is.get_step_generation_window(), 0.0);
        assert_eq!(is.calc_position(&cursor, 0.5), 250.0);

        // Back to copy mode: the kept pulses apply again
        let dc = is.delegate_mut().as_any_mut().downcast_mut::<DualCarriage>().unwrap();
        dc.set_transform('x', 1.0, 0.0).unwrap();
        assert!((is.get_step_generation_window() - 0.1).abs() < 1e-12);
        assert!(!is.pulses(Axis::X).unwrap().is_empty());
    }
}
