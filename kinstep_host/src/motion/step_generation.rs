// src/motion/step_generation.rs - Step generation flush coordinator
//! Drives every stepper's solver forward together and releases motion queue
//! entries once no stepper can look at them any more.

use std::collections::BTreeMap;
use std::sync::Arc;

use kinstep_shared::config::CarriageMode;
use kinstep_shared::trapq::{Coord, SharedTrapQueue};
use thiserror::Error;

use super::input_shaper::{AxisInputShaper, SetInputShaper};
use super::itersolve::{StepEvent, StepGenError, StepperHandle};
use super::kinematics::{DualCarriage, ExtruderStepper, InputShaper, KinematicsError, StepperKinematics};

/// Minimum delay between the planner's time and step generation.
pub const SDS_CHECK_TIME: f64 = 0.001;
/// Retired moves are kept this long for diagnostics.
pub const MOVE_HISTORY_EXPIRE: f64 = 30.0;

#[derive(Debug, Error)]
pub enum StepGeneratorError {
    #[error("Stepper '{stepper}': {source}")]
    Step {
        stepper: String,
        #[source]
        source: StepGenError,
    },
    #[error("Unknown stepper '{0}'")]
    UnknownStepper(String),
    #[error("Stepper '{stepper}': {source}")]
    Kinematics {
        stepper: String,
        #[source]
        source: KinematicsError,
    },
    #[error("Failed to configure shaper(s) {} with given parameters", .0.join(", "))]
    ShaperConfig(Vec<String>),
    #[error("Invalid input shaper request: {0}")]
    InvalidShaperRequest(String),
    #[error("Motion queue error: {0}")]
    Queue(String),
    #[error("Motion queue lock poisoned")]
    QueuePoisoned,
}

/// Rest-to-rest trapezoid for one move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveTiming {
    pub distance: f64,
    pub accel_t: f64,
    pub cruise_t: f64,
    pub decel_t: f64,
    pub cruise_v: f64,
    pub accel: f64,
}

impl MoveTiming {
    /// Fastest profile not exceeding `max_v` and `accel`; short moves never
    /// reach `max_v` and get no cruise phase.
    pub fn plan(distance: f64, max_v: f64, accel: f64) -> Self {
        let cruise_v = max_v.min((distance * accel).sqrt());
        let (accel_t, cruise_t) = if cruise_v > 0.0 {
            let accel_t = cruise_v / accel;
            (accel_t, (distance - cruise_v * accel_t) / cruise_v)
        } else {
            (0.0, 0.0)
        };
        Self {
            distance,
            accel_t,
            cruise_t: cruise_t.max(0.0),
            decel_t: accel_t,
            cruise_v,
            accel,
        }
    }

    pub fn total_time(&self) -> f64 {
        self.accel_t + self.cruise_t + self.decel_t
    }
}

pub struct StepGenerator {
    trapq: SharedTrapQueue,
    /// Queues other than the toolhead queue (extruders)
    extra_queues: Vec<SharedTrapQueue>,
    steppers: Vec<StepperHandle>,
    /// Scan window last reported by each stepper, parallel to `steppers`
    scan_windows: Vec<f64>,
    kin_flush_delay: f64,
    kin_flush_times: Vec<f64>,
    last_flush_time: f64,
    /// Carriage driving the toolhead, as last reported by a mode change
    active_toolhead: usize,
    active_mode: CarriageMode,
}

impl StepGenerator {
    pub fn new(trapq: SharedTrapQueue) -> Self {
        Self {
            trapq,
            extra_queues: Vec::new(),
            steppers: Vec::new(),
            scan_windows: Vec::new(),
            kin_flush_delay: SDS_CHECK_TIME,
            kin_flush_times: Vec::new(),
            last_flush_time: 0.0,
            active_toolhead: 0,
            active_mode: CarriageMode::Primary,
        }
    }

    pub fn trapq(&self) -> &SharedTrapQueue {
        &self.trapq
    }

    /// Register a stepper. Steppers without a queue are attached to the
    /// toolhead queue; steppers on another queue get it retired on flush.
    pub fn add_stepper(&mut self, mut stepper: StepperHandle) {
        match stepper.trapq() {
            None => stepper.set_trapq(Some(Arc::clone(&self.trapq))),
            Some(tq) => {
                let known = Arc::ptr_eq(tq, &self.trapq) || self.extra_queues.iter().any(|q| Arc::ptr_eq(q, tq));
                if !known {
                    self.extra_queues.push(Arc::clone(tq));
                }
            }
        }
        let flags = stepper.kinematics().active_flags();
        tracing::info!(stepper = stepper.name(), model = stepper.kinematics().name(), ?flags, "stepper registered");
        let window = scan_window(&stepper);
        if window > 0.0 {
            self.note_step_generation_scan_time(window, 0.0);
        }
        self.steppers.push(stepper);
        self.scan_windows.push(window);
    }

    pub fn steppers(&self) -> &[StepperHandle] {
        &self.steppers
    }

    pub fn stepper_mut(&mut self, name: &str) -> Result<&mut StepperHandle, StepGeneratorError> {
        self.steppers
            .iter_mut()
            .find(|s| s.name() == name)
            .ok_or_else(|| StepGeneratorError::UnknownStepper(name.to_string()))
    }

    /// Change an extruder's pressure advance and widen or shrink the flush
    /// delay to its new smoothing window.
    pub fn set_pressure_advance(&mut self, name: &str, pressure_advance: f64, smooth_time: f64) -> Result<(), StepGeneratorError> {
        let stepper = self.stepper_mut(name)?;
        let Some(es) = stepper.kinematics_mut::<ExtruderStepper>() else {
            return Err(StepGeneratorError::Kinematics {
                stepper: name.to_string(),
                source: KinematicsError::InvalidParameter("not an extruder".to_string()),
            });
        };
        es.set_pressure_advance(pressure_advance, smooth_time)
            .map_err(|source| StepGeneratorError::Kinematics {
                stepper: name.to_string(),
                source,
            })?;
        tracing::info!(stepper = name, pressure_advance, smooth_time, "pressure advance set");
        self.refresh_scan_windows();
        Ok(())
    }

    /// Pick up scan window changes made to models since they were registered.
    fn refresh_scan_windows(&mut self) {
        let mut changes = Vec::new();
        for (stepper, old) in self.steppers.iter().zip(self.scan_windows.iter_mut()) {
            let window = scan_window(stepper);
            if window != *old {
                changes.push((window, *old));
                *old = window;
            }
        }
        for (window, old) in changes {
            self.note_step_generation_scan_time(window, old);
        }
    }

    pub fn kin_flush_delay(&self) -> f64 {
        self.kin_flush_delay
    }

    pub fn last_flush_time(&self) -> f64 {
        self.last_flush_time
    }

    /// Queue a straight toolhead move from `start` to `end` beginning at
    /// `print_time`. Returns the time the move finishes.
    pub fn queue_move(
        &self,
        print_time: f64,
        start: Coord,
        end: Coord,
        max_v: f64,
        accel: f64,
    ) -> Result<(f64, MoveTiming), StepGeneratorError> {
        let d = Coord::new(end.x - start.x, end.y - start.y, end.z - start.z);
        let distance = (d.x * d.x + d.y * d.y + d.z * d.z).sqrt();
        let timing = MoveTiming::plan(distance, max_v, accel);
        if distance == 0.0 {
            return Ok((print_time, timing));
        }
        let axes_r = Coord::new(d.x / distance, d.y / distance, d.z / distance);
        self.trapq
            .write()
            .map_err(|_| StepGeneratorError::QueuePoisoned)?
            .append(
                print_time,
                timing.accel_t,
                timing.cruise_t,
                timing.decel_t,
                start,
                axes_r,
                0.0,
                timing.cruise_v,
                timing.accel,
            )
            .map_err(|e| StepGeneratorError::Queue(e.to_string()))?;
        Ok((print_time + timing.total_time(), timing))
    }

    /// Queue filament motion on an extruder queue alongside a toolhead move
    /// with `timing`. Extrusion scales the toolhead profile by `e_dist / distance`.
    pub fn queue_extrude(
        queue: &SharedTrapQueue,
        print_time: f64,
        timing: &MoveTiming,
        e_start: f64,
        e_dist: f64,
    ) -> Result<(), StepGeneratorError> {
        if timing.distance == 0.0 || e_dist == 0.0 {
            return Ok(());
        }
        let ratio = e_dist / timing.distance;
        // Only forward extrusion is pressure advanced
        let can_pa = if e_dist > 0.0 { 1.0 } else { 0.0 };
        queue
            .write()
            .map_err(|_| StepGeneratorError::QueuePoisoned)?
            .append(
                print_time,
                timing.accel_t,
                timing.cruise_t,
                timing.decel_t,
                Coord::new(e_start, 0.0, 0.0),
                Coord::new(1.0, can_pa, 0.0),
                0.0,
                timing.cruise_v * ratio,
                timing.accel * ratio,
            )
            .map_err(|e| StepGeneratorError::Queue(e.to_string()))
    }

    /// Replace the scan window `old_delay` with `delay` (zero means none).
    pub fn note_step_generation_scan_time(&mut self, delay: f64, old_delay: f64) {
        if old_delay != 0.0 {
            if let Some(pos) = self.kin_flush_times.iter().position(|&d| d == old_delay) {
                self.kin_flush_times.swap_remove(pos);
            }
        }
        if delay != 0.0 {
            self.kin_flush_times.push(delay);
        }
        self.kin_flush_delay = self.kin_flush_times.iter().copied().fold(SDS_CHECK_TIME, f64::max);
        tracing::debug!(kin_flush_delay = self.kin_flush_delay, "step generation scan window updated");
    }

    /// Generate steps up to `flush_time - kin_flush_delay` on every stepper
    /// and retire moves no stepper can still look at.
    pub fn flush(&mut self, flush_time: f64) -> Result<BTreeMap<String, Vec<StepEvent>>, StepGeneratorError> {
        self.refresh_scan_windows();
        let sg_time = (flush_time - self.kin_flush_delay).max(self.last_flush_time);
        // Idle queues hold their last position up to the flush time
        for tq in std::iter::once(&self.trapq).chain(self.extra_queues.iter()) {
            let mut tq = tq.write().map_err(|_| StepGeneratorError::QueuePoisoned)?;
            tq.hold_until(sg_time)
                .map_err(|e| StepGeneratorError::Queue(e.to_string()))?;
        }
        let mut out = BTreeMap::new();
        for stepper in &mut self.steppers {
            let has_moves = match stepper.trapq() {
                Some(tq) => !tq.read().map_err(|_| StepGeneratorError::QueuePoisoned)?.is_empty(),
                None => false,
            };
            if !has_moves {
                continue;
            }
            let steps = stepper.advance(sg_time).map_err(|source| StepGeneratorError::Step {
                stepper: stepper.name().to_string(),
                source,
            })?;
            if !steps.is_empty() {
                out.insert(stepper.name().to_string(), steps);
            }
        }
        let free_time = sg_time - self.kin_flush_delay;
        let clear_history_time = sg_time - MOVE_HISTORY_EXPIRE;
        for tq in std::iter::once(&self.trapq).chain(self.extra_queues.iter()) {
            tq.write()
                .map_err(|_| StepGeneratorError::QueuePoisoned)?
                .finalize_moves(free_time, clear_history_time);
        }
        self.last_flush_time = sg_time;
        Ok(out)
    }

    /// Apply input shaping to every toolhead stepper that moves X or Y,
    /// wrapping its model on first use. Failing axes are disabled and named
    /// in the returned error.
    pub fn configure_input_shaper(&mut self, shapers: &mut [AxisInputShaper]) -> Result<(), StepGeneratorError> {
        let mut failed: Vec<String> = Vec::new();
        for stepper in &mut self.steppers {
            let on_toolhead = stepper.trapq().is_some_and(|tq| Arc::ptr_eq(tq, &self.trapq));
            if !on_toolhead {
                continue;
            }
            if stepper.kinematics_mut::<InputShaper>().is_none() {
                let wrapped = stepper.wrap_kinematics(|sk| InputShaper::new(sk).map(|is| Box::new(is) as Box<dyn StepperKinematics>));
                if let Err(e) = wrapped {
                    tracing::debug!(stepper = stepper.name(), error = %e, "stepper not shaped");
                    continue;
                }
            }
            let Some(is) = stepper.kinematics_mut::<InputShaper>() else {
                continue;
            };
            for shaper in shapers.iter_mut() {
                let name = shaper.get_name();
                if failed.contains(&name) {
                    continue;
                }
                if let Err(e) = shaper.apply_to(is) {
                    tracing::warn!(shaper = %name, error = %e, "input shaper rejected parameters");
                    failed.push(name);
                }
            }
        }
        self.refresh_scan_windows();
        if failed.is_empty() {
            for shaper in shapers.iter() {
                tracing::info!("{}", shaper.report());
            }
            Ok(())
        } else {
            Err(StepGeneratorError::ShaperConfig(failed))
        }
    }

    pub fn active_toolhead(&self) -> (usize, CarriageMode) {
        (self.active_toolhead, self.active_mode)
    }

    /// Move a dual carriage stepper to a new transform on `axis`, looking
    /// through any shaper wrapped around it.
    pub fn set_carriage_transform(
        &mut self,
        name: &str,
        axis: char,
        scale: f64,
        offset: f64,
    ) -> Result<(), StepGeneratorError> {
        let stepper = self.stepper_mut(name)?;
        let Some(dc) = stepper.kinematics_mut::<DualCarriage>() else {
            return Err(StepGeneratorError::Kinematics {
                stepper: name.to_string(),
                source: KinematicsError::InvalidParameter("not a dual carriage".to_string()),
            });
        };
        dc.set_transform(axis, scale, offset)
            .map_err(|source| StepGeneratorError::Kinematics {
                stepper: name.to_string(),
                source,
            })?;
        tracing::info!(stepper = name, axis = %axis, scale, offset, "carriage transform set");
        self.refresh_scan_windows();
        Ok(())
    }

    /// The dual carriage switched to `carriage_idx` in `mode`: select the
    /// matching shaper entries and reapply them.
    pub fn handle_dual_carriage_mode_change(
        &mut self,
        shapers: &mut [AxisInputShaper],
        carriage_idx: usize,
        mode: CarriageMode,
    ) -> Result<(), StepGeneratorError> {
        self.active_toolhead = carriage_idx;
        self.active_mode = mode;
        tracing::info!(toolhead = carriage_idx, mode = mode.name(), "dual carriage mode changed");
        for shaper in shapers.iter_mut() {
            shaper.set_toolhead_mode(carriage_idx, mode);
        }
        self.configure_input_shaper(shapers)
    }

    /// Change shaper parameters at runtime. Nothing is changed when the
    /// request is invalid.
    pub fn set_input_shaper(
        &mut self,
        shapers: &mut [AxisInputShaper],
        request: &SetInputShaper,
    ) -> Result<(), StepGeneratorError> {
        let selection = if request.toolhead.is_some() || request.mode.is_some() {
            let toolhead = request.toolhead.unwrap_or(self.active_toolhead);
            if toolhead > 1 {
                return Err(StepGeneratorError::InvalidShaperRequest(format!(
                    "Invalid TOOLHEAD index: {}",
                    toolhead
                )));
            }
            Some((toolhead, request.mode.unwrap_or(self.active_mode)))
        } else {
            None
        };
        for shaper in shapers.iter() {
            request
                .axis_update(shaper.axis())
                .validate()
                .map_err(|e| StepGeneratorError::InvalidShaperRequest(e.to_string()))?;
        }
        for shaper in shapers.iter_mut() {
            if let Some((toolhead, mode)) = selection {
                shaper.set_toolhead_mode(toolhead, mode);
            }
            shaper
                .update(&request.axis_update(shaper.axis()))
                .map_err(|e| StepGeneratorError::InvalidShaperRequest(e.to_string()))?;
        }
        self.configure_input_shaper(shapers)
    }

    /// Active toolhead and mode followed by one line per shaper.
    pub fn input_shaper_report(&self, shapers: &[AxisInputShaper]) -> Vec<String> {
        std::iter::once(format!(
            "Active toolhead: {}, Mode: {}",
            self.active_toolhead,
            self.active_mode.name()
        ))
        .chain(shapers.iter().map(AxisInputShaper::report))
        .collect()
    }
}

fn scan_window(stepper: &StepperHandle) -> f64 {
    let sk = stepper.kinematics();
    sk.gen_steps_pre_active().max(sk.gen_steps_post_active())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::input_shaper::ShaperType;
    use crate::motion::kinematics::{CartesianStepper, ExtruderStepper};
    use kinstep_shared::trapq::{Coord, MovePhase, TrapQueue};

    fn xy_generator() -> StepGenerator {
        let mut tq = TrapQueue::new();
        tq.append(1.0, 0.0, 1.0, 0.0, Coord::default(), Coord::new(1.0, 0.0, 0.0), 0.0, 10.0, 0.0)
            .unwrap();
        let mut sg = StepGenerator::new(tq.into_shared());
        for axis in ['x', 'y', 'z'] {
            sg.add_stepper(StepperHandle::new(
                format!("stepper_{}", axis),
                0.01,
                Box::new(CartesianStepper::new(axis).unwrap()),
            ));
        }
        sg
    }

    #[test]
    fn flush_generates_and_retires() {
        let mut sg = xy_generator();
        let steps = sg.flush(1.5 + SDS_CHECK_TIME).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps["stepper_x"].len(), 500);
        // Lead-in hold ended at 1.0 and is retired
        assert_eq!(sg.trapq().read().unwrap().len(), 1);
        // Flushing to an earlier time is a no-op
        assert!(sg.flush(1.0).unwrap().is_empty());
        let rest = sg.flush(5.0).unwrap();
        assert_eq!(rest["stepper_x"].len(), 500);
        // Only the idle hold up to the flush time remains
        let tq = sg.trapq().read().unwrap();
        assert_eq!(tq.len(), 1);
        assert_eq!(tq.moves()[0].phase, MovePhase::Null);
        assert!((tq.end_time().unwrap() - (5.0 - SDS_CHECK_TIME)).abs() < 1e-12);
    }

    #[test]
    fn scan_window_tracks_largest_entry() {
        let mut sg = xy_generator();
        assert_eq!(sg.kin_flush_delay(), SDS_CHECK_TIME);
        sg.note_step_generation_scan_time(0.02, 0.0);
        sg.note_step_generation_scan_time(0.005, 0.0);
        assert_eq!(sg.kin_flush_delay(), 0.02);
        sg.note_step_generation_scan_time(0.0, 0.02);
        assert_eq!(sg.kin_flush_delay(), 0.005);
    }

    #[test]
    fn input_shaper_wraps_xy_steppers_once() {
        let mut sg = xy_generator();
        let mut shapers = [
            AxisInputShaper::new('x', ShaperType::Zv, 50.0, 0.0).unwrap(),
            AxisInputShaper::new('y', ShaperType::Zv, 50.0, 0.0).unwrap(),
        ];
        sg.configure_input_shaper(&mut shapers).unwrap();
        assert!(sg.stepper_mut("stepper_x").unwrap().kinematics_mut::<InputShaper>().is_some());
        assert!(sg.stepper_mut("stepper_z").unwrap().kinematics_mut::<InputShaper>().is_none());
        // ZV at 50 Hz: pulses at +-5 ms
        assert!((sg.kin_flush_delay() - 0.005).abs() < 1e-12);
        sg.configure_input_shaper(&mut shapers).unwrap();
        let is = sg.stepper_mut("stepper_x").unwrap().kinematics_mut::<InputShaper>().unwrap();
        assert_eq!(is.delegate().name(), "cartesian");
        assert!((sg.kin_flush_delay() - 0.005).abs() < 1e-12);
        assert!(matches!(sg.stepper_mut("stepper_e"), Err(StepGeneratorError::UnknownStepper(_))));
    }

    #[test]
    fn extruder_queue_is_flushed_and_not_shaped() {
        let mut sg = xy_generator();
        let mut etq = TrapQueue::new();
        etq.append(1.0, 0.0, 0.5, 0.0, Coord::default(), Coord::new(1.0, 1.0, 0.0), 0.0, 2.0, 0.0)
            .unwrap();
        let mut extruder = StepperHandle::new("extruder", 0.01, Box::new(ExtruderStepper::new()));
        extruder.set_trapq(Some(etq.into_shared()));
        sg.add_stepper(extruder);
        let mut shapers = [AxisInputShaper::new('x', ShaperType::Mzv, 40.0, 0.1).unwrap()];
        sg.configure_input_shaper(&mut shapers).unwrap();
        let e = sg.stepper_mut("extruder").unwrap();
        assert!(e.kinematics_mut::<ExtruderStepper>().is_some());
        let steps = sg.flush(3.0).unwrap();
        // Extruder queue ends at 1.5 and holds its position afterwards
        assert_eq!(steps["extruder"].len(), 100);
    }

    fn extruder_generator(pressure_advance: Option<(f64, f64)>) -> StepGenerator {
        let mut etq = TrapQueue::new();
        let dir = Coord::new(1.0, 1.0, 0.0);
        etq.append(0.5, 0.1, 0.3, 0.1, Coord::default(), dir, 0.0, 10.0, 100.0)
            .unwrap();
        etq.append(1.0, 0.1, 0.3, 0.1, Coord::new(4.0, 0.0, 0.0), dir, 0.0, 10.0, 100.0)
            .unwrap();
        let mut es = ExtruderStepper::new();
        if let Some((pa, smooth_time)) = pressure_advance {
            es.set_pressure_advance(pa, smooth_time).unwrap();
        }
        let mut extruder = StepperHandle::new("extruder", 0.01, Box::new(es));
        extruder.set_trapq(Some(etq.into_shared()));
        let mut sg = StepGenerator::new(TrapQueue::new().into_shared());
        sg.add_stepper(extruder);
        sg
    }

    fn flush_every_10ms(sg: &mut StepGenerator) -> Vec<StepEvent> {
        let mut steps = Vec::new();
        for i in 50..=300 {
            if let Some(s) = sg.flush(i as f64 / 100.0).unwrap().remove("extruder") {
                steps.extend(s);
            }
        }
        steps
    }

    fn assert_same_steps(a: &[StepEvent], b: &[StepEvent]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert_eq!(x.dir, y.dir);
            assert!((x.print_time - y.print_time).abs() < 1e-6, "{} vs {}", x.print_time, y.print_time);
        }
    }

    #[test]
    fn pressure_advance_change_widens_flush_delay() {
        let reference = extruder_generator(Some((0.05, 0.2))).flush(3.0).unwrap().remove("extruder").unwrap();
        assert!(reference.len() >= 700);

        let mut sg = extruder_generator(None);
        assert_eq!(sg.kin_flush_delay(), SDS_CHECK_TIME);
        sg.set_pressure_advance("extruder", 0.05, 0.2).unwrap();
        assert!((sg.kin_flush_delay() - 0.1).abs() < 1e-12);
        assert_same_steps(&flush_every_10ms(&mut sg), &reference);

        // Changes made on the model directly are picked up by the next flush
        let mut sg = extruder_generator(None);
        sg.stepper_mut("extruder")
            .unwrap()
            .kinematics_mut::<ExtruderStepper>()
            .unwrap()
            .set_pressure_advance(0.05, 0.2)
            .unwrap();
        assert_same_steps(&flush_every_10ms(&mut sg), &reference);
        assert!((sg.kin_flush_delay() - 0.1).abs() < 1e-12);

        sg.set_pressure_advance("extruder", 0.0, 0.0).unwrap();
        assert_eq!(sg.kin_flush_delay(), SDS_CHECK_TIME);
        assert!(matches!(
            sg.set_pressure_advance("extruder", -1.0, 0.0),
            Err(StepGeneratorError::Kinematics { .. })
        ));
        assert!(matches!(
            sg.set_pressure_advance("stepper_x", 0.1, 0.04),
            Err(StepGeneratorError::UnknownStepper(_))
        ));
    }

    #[test]
    fn short_moves_never_reach_cruise() {
        let t = MoveTiming::plan(1.0, 100.0, 1000.0);
        assert!(t.cruise_t < 1e-12);
        assert!((t.cruise_v - 1000f64.sqrt()).abs() < 1e-9);
        let t = MoveTiming::plan(100.0, 100.0, 1000.0);
        assert!((t.accel_t - 0.1).abs() < 1e-12);
        assert!((t.cruise_t - 0.9).abs() < 1e-12);
        assert!((t.total_time() - 1.1).abs() < 1e-12);
    }

    #[test]
    fn queued_move_steps_cover_distance() {
        let mut sg = StepGenerator::new(TrapQueue::new().into_shared());
        sg.add_stepper(StepperHandle::new("stepper_x", 0.01, Box::new(CartesianStepper::new('x').unwrap())));
        sg.add_stepper(StepperHandle::new("stepper_y", 0.01, Box::new(CartesianStepper::new('y').unwrap())));
        let start = Coord::default();
        let (end_time, timing) = sg.queue_move(0.1, start, Coord::new(3.0, 4.0, 0.0), 50.0, 500.0).unwrap();
        assert!((timing.distance - 5.0).abs() < 1e-12);
        let steps = sg.flush(end_time + 0.1).unwrap();
        assert_eq!(steps["stepper_x"].len(), 300);
        assert_eq!(steps["stepper_y"].len(), 400);
        assert!(steps["stepper_y"].iter().all(|s| s.dir == 1));
    }

    #[test]
    fn extrusion_follows_toolhead_profile() {
        let etq = TrapQueue::new().into_shared();
        let timing = MoveTiming::plan(10.0, 50.0, 500.0);
        StepGenerator::queue_extrude(&etq, 0.5, &timing, 2.0, 0.5).unwrap();
        let tq = etq.read().unwrap();
        let last = tq.moves().last().unwrap();
        assert!((last.get_coord(last.move_t).x - 2.5).abs() < 1e-9);
        assert_eq!(last.axes_r, Coord::new(1.0, 1.0, 0.0));
    }

    fn idex_generator() -> StepGenerator {
        use kinstep_shared::config::{Config, DualCarriageConfig, StepperConfig};
        let mut config = Config::default();
        for (name, axis) in [("stepper_x", None), ("dual_carriage", Some("x")), ("stepper_y", None)] {
            let sc = StepperConfig {
                axis: axis.map(str::to_string),
                ..StepperConfig::default()
            };
            config.steppers.insert(name.to_string(), sc);
        }
        config.dual_carriage = Some(DualCarriageConfig {
            axis: "x".to_string(),
            stepper: "dual_carriage".to_string(),
            mode: CarriageMode::Copy,
            offset: 0.0,
        });
        let mut sg = StepGenerator::new(TrapQueue::new().into_shared());
        for stepper in crate::motion::build_steppers(&config).unwrap() {
            sg.add_stepper(stepper);
        }
        sg
    }

    fn idex_shapers() -> [AxisInputShaper; 2] {
        [
            AxisInputShaper::with_entries('x', vec![ShaperType::Zv; 4], vec![40.0, 41.0, 42.0, 43.0], vec![0.0]).unwrap(),
            AxisInputShaper::new('y', ShaperType::Zv, 50.0, 0.0).unwrap(),
        ]
    }

    fn window_of(sg: &StepGenerator, name: &str) -> f64 {
        let stepper = sg.steppers().iter().find(|s| s.name() == name).unwrap();
        scan_window(stepper)
    }

    #[test]
    fn shaped_dual_carriage_follows_mode_changes() {
        let mut sg = idex_generator();
        let mut shapers = idex_shapers();
        sg.handle_dual_carriage_mode_change(&mut shapers, 0, CarriageMode::Copy).unwrap();
        assert_eq!(sg.active_toolhead(), (0, CarriageMode::Copy));
        assert_eq!(shapers[0].freq(), 42.0);
        let dc = sg.stepper_mut("dual_carriage").unwrap();
        assert_eq!(dc.kinematics().name(), "input_shaper");
        assert!(dc.kinematics_mut::<InputShaper>().is_some());
        assert!((window_of(&sg, "dual_carriage") - 0.25 / 42.0).abs() < 1e-12);

        // Mirror through the shaper wrapper, then announce the mode
        sg.set_carriage_transform("dual_carriage", 'x', -1.0, 300.0).unwrap();
        sg.handle_dual_carriage_mode_change(&mut shapers, 1, CarriageMode::Mirror).unwrap();
        assert_eq!(shapers[0].freq(), 43.0);
        let dc = sg.stepper_mut("dual_carriage").unwrap();
        assert_eq!(dc.calc_position_from_coord(10.0, 0.0, 0.0), 290.0);
        assert!((window_of(&sg, "dual_carriage") - 0.25 / 43.0).abs() < 1e-12);
        assert!((sg.kin_flush_delay() - 0.25 / 43.0).abs() < 1e-12);

        // Parking drops the carriage out of shaping and step generation
        sg.set_carriage_transform("dual_carriage", 'x', 0.0, 300.0).unwrap();
        sg.handle_dual_carriage_mode_change(&mut shapers, 0, CarriageMode::Primary).unwrap();
        assert_eq!(shapers[0].freq(), 40.0);
        let dc = sg.stepper_mut("dual_carriage").unwrap();
        assert!(!dc.is_active_axis(kinstep_shared::trapq::Axis::X));
        assert_eq!(dc.calc_position_from_coord(10.0, 0.0, 0.0), 300.0);
        assert_eq!(window_of(&sg, "dual_carriage"), 0.0);
        assert!((sg.kin_flush_delay() - 0.25 / 40.0).abs() < 1e-12);

        // Back to copy mode: shaped again with the copy entry
        sg.set_carriage_transform("dual_carriage", 'x', 1.0, 0.0).unwrap();
        sg.handle_dual_carriage_mode_change(&mut shapers, 0, CarriageMode::Copy).unwrap();
        assert!((window_of(&sg, "dual_carriage") - 0.25 / 42.0).abs() < 1e-12);

        assert!(matches!(
            sg.set_carriage_transform("stepper_y", 'x', 1.0, 0.0),
            Err(StepGeneratorError::Kinematics { .. })
        ));
        assert!(matches!(
            sg.set_carriage_transform("dual_carriage", 'z', 1.0, 0.0),
            Err(StepGeneratorError::Kinematics { .. })
        ));
    }

    #[test]
    fn set_input_shaper_validates_before_applying() {
        let mut sg = xy_generator();
        let mut shapers = [
            AxisInputShaper::new('x', ShaperType::Zv, 50.0, 0.0).unwrap(),
            AxisInputShaper::new('y', ShaperType::Zv, 50.0, 0.0).unwrap(),
        ];
        sg.configure_input_shaper(&mut shapers).unwrap();
        assert!((sg.kin_flush_delay() - 0.005).abs() < 1e-12);

        let bad_toolhead = SetInputShaper {
            toolhead: Some(2),
            ..SetInputShaper::default()
        };
        assert!(matches!(
            sg.set_input_shaper(&mut shapers, &bad_toolhead),
            Err(StepGeneratorError::InvalidShaperRequest(_))
        ));
        let mut bad_damping = SetInputShaper::default();
        bad_damping.x.shaper_freq = Some(60.0);
        bad_damping.y.damping_ratio = Some(1.5);
        assert!(sg.set_input_shaper(&mut shapers, &bad_damping).is_err());
        assert_eq!(shapers[0].freq(), 50.0);

        let mut request = SetInputShaper {
            shaper_type: Some(ShaperType::Ei),
            ..SetInputShaper::default()
        };
        request.x.shaper_type = Some(ShaperType::Zvd);
        request.x.shaper_freq = Some(60.0);
        sg.set_input_shaper(&mut shapers, &request).unwrap();
        assert_eq!(shapers[0].shaper_type(), ShaperType::Ei);
        assert_eq!(shapers[1].shaper_type(), ShaperType::Ei);
        assert_eq!(shapers[1].freq(), 50.0);
        // Undamped EI is symmetric: half its period at 50 Hz on y
        assert!((sg.kin_flush_delay() - 0.01).abs() < 1e-12);
        let report = sg.input_shaper_report(&shapers);
        assert_eq!(report[0], "Active toolhead: 0, Mode: PRIMARY");
        assert!(report[1].starts_with("shaper_type_x:ei shaper_freq_x:60.000"));
    }

    #[test]
    fn set_input_shaper_selects_toolhead_entries() {
        let mut sg = idex_generator();
        let mut shapers = idex_shapers();
        sg.configure_input_shaper(&mut shapers).unwrap();
        assert_eq!(shapers[0].freq(), 40.0);
        let request = SetInputShaper {
            toolhead: Some(1),
            ..SetInputShaper::default()
        };
        sg.set_input_shaper(&mut shapers, &request).unwrap();
        assert_eq!(shapers[0].freq(), 41.0);
        assert_eq!(shapers[0].toolhead_mode(), (1, CarriageMode::Primary));
        // Selection alone does not move the active toolhead
        assert_eq!(sg.active_toolhead(), (0, CarriageMode::Primary));
        let request = SetInputShaper {
            mode: Some(CarriageMode::Mirror),
            ..SetInputShaper::default()
        };
        sg.set_input_shaper(&mut shapers, &request).unwrap();
        assert_eq!(shapers[0].freq(), 43.0);
        assert_eq!(shapers[1].freq(), 50.0);
    }
}
