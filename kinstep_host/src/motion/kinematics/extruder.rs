// src/motion/kinematics/extruder.rs
//! Extruder stepper with smoothed pressure advance.
//!
//! Extruder queues carry the filament position in `start_pos.x` with
//! `axes_r.x == 1`; `axes_r.y != 0` marks a move that extrudes, and only those
//! get pressure advance. With advance enabled the position is
//!
//! ```text
//! pa_position(t) = nominal_position(t) + pressure_advance * nominal_velocity(t)
//! smooth(t) = ∫ pa_position(x) * (hst - |t - x|) dx over [t - hst, t + hst] / hst²
//! ```
//!
//! where `hst` is half the smoothing time.

use std::any::Any;

use kinstep_shared::trapq::{Move, MoveCursor};

use super::{ActiveFlags, KinematicsError, StepperKinematics};

/// ∫ base + t·(start_v + t·half_accel) dt over [start, end]
fn extruder_integrate(base: f64, start_v: f64, half_accel: f64, start: f64, end: f64) -> f64 {
    let half_v = 0.5 * start_v;
    let sixth_a = half_accel / 3.0;
    let si = start * (base + start * (half_v + start * sixth_a));
    let ei = end * (base + end * (half_v + end * sixth_a));
    ei - si
}

/// ∫ t·(base + t·(start_v + t·half_accel)) dt over [start, end]
fn extruder_integrate_time(base: f64, start_v: f64, half_accel: f64, start: f64, end: f64) -> f64 {
    let half_b = 0.5 * base;
    let third_v = start_v / 3.0;
    let eighth_a = 0.25 * half_accel;
    let si = start * start * (half_b + start * (third_v + start * eighth_a));
    let ei = end * end * (half_b + end * (third_v + end * eighth_a));
    ei - si
}

/// Weighted integral of one move's advanced position over [start, end],
/// with the weight `t - time_offset`.
fn pa_move_integrate(m: &Move, pressure_advance: f64, base: f64, start: f64, end: f64, time_offset: f64) -> f64 {
    let start = start.max(0.0);
    let end = end.min(m.move_t);
    let pa = if m.axes_r.y != 0.0 { pressure_advance } else { 0.0 };
    let base = base + pa * m.start_v;
    let start_v = m.start_v + pa * 2.0 * m.half_accel;
    let ha = m.half_accel;
    let iext = extruder_integrate(base, start_v, ha, start, end);
    let wgt_ext = extruder_integrate_time(base, start_v, ha, start, end);
    wgt_ext - time_offset * iext
}

/// Triangle-weighted integral of the advanced position around `move_time`,
/// relative to the start position of the current move.
fn pa_range_integrate(cursor: &MoveCursor<'_>, move_time: f64, pressure_advance: f64, hst: f64) -> f64 {
    let m = cursor.get();
    let mut start = move_time - hst;
    let mut end = move_time + hst;
    let start_base = m.start_pos.x;
    let mut res = pa_move_integrate(&m, pressure_advance, 0.0, start, move_time, start);
    res -= pa_move_integrate(&m, pressure_advance, 0.0, move_time, end, end);

    let mut prev = *cursor;
    while start < 0.0 {
        prev = prev.prev();
        let pm = prev.get();
        start += pm.move_t;
        let base = pm.start_pos.x - start_base;
        res += pa_move_integrate(&pm, pressure_advance, base, start, pm.move_t, start);
    }

    let mut next = *cursor;
    let mut cur_t = m.move_t;
    while end > cur_t {
        end -= cur_t;
        next = next.next();
        let nm = next.get();
        cur_t = nm.move_t;
        let base = nm.start_pos.x - start_base;
        res -= pa_move_integrate(&nm, pressure_advance, base, 0.0, end, end);
    }
    res
}

#[derive(Debug, Clone, Default)]
pub struct ExtruderStepper {
    pressure_advance: f64,
    half_smooth_time: f64,
    inv_half_smooth_time2: f64,
}

impl ExtruderStepper {
    pub fn new() -> Self {
        Self::default()
    }

    /// A zero `smooth_time` disables advance and smoothing altogether.
    pub fn set_pressure_advance(&mut self, pressure_advance: f64, smooth_time: f64) -> Result<(), KinematicsError> {
        if !(pressure_advance >= 0.0) || !(smooth_time >= 0.0) {
            return Err(KinematicsError::InvalidParameter(format!(
                "pressure advance {} and smooth time {} must be >= 0",
                pressure_advance, smooth_time
            )));
        }
        let hst = 0.5 * smooth_time;
        self.half_smooth_time = hst;
        self.pressure_advance = pressure_advance;
        self.inv_half_smooth_time2 = if hst > 0.0 { 1.0 / (hst * hst) } else { 0.0 };
        tracing::debug!(pressure_advance, smooth_time, "extruder pressure advance updated");
        Ok(())
    }

    pub fn pressure_advance(&self) -> f64 {
        self.pressure_advance
    }

    pub fn smooth_time(&self) -> f64 {
        2.0 * self.half_smooth_time
    }
}

impl StepperKinematics for ExtruderStepper {
    fn calc_position(&self, cursor: &MoveCursor<'_>, move_time: f64) -> f64 {
        let m = cursor.get();
        let hst = self.half_smooth_time;
        if hst == 0.0 {
            return m.start_pos.x + m.get_distance(move_time);
        }
        let area = pa_range_integrate(cursor, move_time, self.pressure_advance, hst);
        m.start_pos.x + area * self.inv_half_smooth_time2
    }

    fn active_flags(&self) -> ActiveFlags {
        ActiveFlags::X
    }

    fn gen_steps_pre_active(&self) -> f64 {
        self.half_smooth_time
    }

    fn gen_steps_post_active(&self) -> f64 {
        self.half_smooth_time
    }

    fn name(&self) -> &'static str {
        "extruder"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
