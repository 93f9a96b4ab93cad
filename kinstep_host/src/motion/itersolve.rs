// src/motion/itersolve.rs - Iterative step time solver
//! Finds the exact times at which a stepper crosses each step boundary. Step
//! boundaries lie a whole number of step lengths from the commanded position,
//! so a move of `n.f` step lengths emits exactly `n` steps.
//!
//! The kinematic model only provides `position(move, t)`; step times are the
//! roots of `position(t) - boundary` found with a bracketed secant search.
//! Steps are committed in strictly increasing time order.

use std::any::Any;
use std::sync::Arc;

use kinstep_shared::trapq::{Axis, Coord, MoveCursor, SharedTrapQueue, TrapQueue};
use serde::Serialize;
use thiserror::Error;

use super::kinematics::{
    find_kinematics_mut, position_at, ActiveFlags, AttachError, KinematicsError, StepperKinematics,
};

/// Initial forward search window when no step has been bracketed yet.
pub const SEEK_TIME_RESET: f64 = 0.000_100;
/// Root search iterations allowed per step before giving up.
pub const MAX_SEARCH_ITERATIONS: usize = 200;
const POSITION_TOLERANCE: f64 = 0.000_000_001;
const TIME_TOLERANCE: f64 = 0.000_000_001;
const DIR_CHANGE_MARGIN: f64 = 0.000_000_010;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StepGenError {
    #[error("Flush time {flush_time:.6} is beyond the queued moves (queue end {queue_end:?})")]
    Range { flush_time: f64, queue_end: Option<f64> },
    #[error("Step search did not converge near {print_time:.6} after {iterations} iterations")]
    NonMonotonic { print_time: f64, iterations: usize },
    #[error("{model} kinematics returned a non-finite position at {print_time:.6}")]
    NonFinitePosition { model: &'static str, print_time: f64 },
    #[error("Step at {print_time:.9} does not follow previous step at {last_step_time:.9}")]
    StepOrdering { print_time: f64, last_step_time: f64 },
    #[error("Motion queue lock poisoned")]
    QueuePoisoned,
}

/// One step pulse produced by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepEvent {
    /// Absolute print time of the step
    pub print_time: f64,
    /// +1 or -1
    pub dir: i8,
    /// Commanded position once the step has been taken
    pub position: f64,
}

#[derive(Debug, Clone, Copy)]
struct TimePos {
    time: f64,
    position: f64,
}

/// Stand-in model while a wrapper is being attached.
struct Detached;

impl StepperKinematics for Detached {
    fn calc_position(&self, _cursor: &MoveCursor<'_>, _move_time: f64) -> f64 {
        f64::NAN
    }

    fn active_flags(&self) -> ActiveFlags {
        ActiveFlags::NONE
    }

    fn name(&self) -> &'static str {
        "detached"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Step generation state for one stepper motor.
#[derive(Debug)]
pub struct StepperHandle {
    name: String,
    step_dist: f64,
    commanded_pos: f64,
    last_flush_time: f64,
    last_move_time: f64,
    last_step_time: f64,
    last_dir: bool,
    kinematics: Box<dyn StepperKinematics>,
    trapq: Option<SharedTrapQueue>,
}

impl StepperHandle {
    pub fn new(name: impl Into<String>, step_dist: f64, kinematics: Box<dyn StepperKinematics>) -> Self {
        Self {
            name: name.into(),
            step_dist,
            commanded_pos: 0.0,
            last_flush_time: 0.0,
            last_move_time: 0.0,
            last_step_time: f64::NEG_INFINITY,
            last_dir: false,
            kinematics,
            trapq: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_dist(&self) -> f64 {
        self.step_dist
    }

    pub fn set_step_dist(&mut self, step_dist: f64) {
        self.step_dist = step_dist;
    }

    pub fn commanded_pos(&self) -> f64 {
        self.commanded_pos
    }

    pub fn last_flush_time(&self) -> f64 {
        self.last_flush_time
    }

    pub fn last_step_time(&self) -> Option<f64> {
        self.last_step_time.is_finite().then_some(self.last_step_time)
    }

    pub fn trapq(&self) -> Option<&SharedTrapQueue> {
        self.trapq.as_ref()
    }

    pub fn set_trapq(&mut self, trapq: Option<SharedTrapQueue>) {
        self.trapq = trapq;
    }

    pub fn kinematics(&self) -> &dyn StepperKinematics {
        self.kinematics.as_ref()
    }

    /// The model of type `T`, found through any wrappers around it.
    pub fn kinematics_mut<T: StepperKinematics>(&mut self) -> Option<&mut T> {
        find_kinematics_mut::<T>(self.kinematics.as_mut())
    }

    /// Swap in a new model; returns the previous one.
    pub fn replace_kinematics(&mut self, kinematics: Box<dyn StepperKinematics>) -> Box<dyn StepperKinematics> {
        std::mem::replace(&mut self.kinematics, kinematics)
    }

    /// Wrap the current model with `wrap`. If the wrapper refuses it, the
    /// original model is restored.
    pub fn wrap_kinematics<F>(&mut self, wrap: F) -> Result<(), KinematicsError>
    where
        F: FnOnce(Box<dyn StepperKinematics>) -> Result<Box<dyn StepperKinematics>, AttachError>,
    {
        let orig = self.replace_kinematics(Box::new(Detached));
        match wrap(orig) {
            Ok(wrapped) => {
                self.kinematics = wrapped;
                Ok(())
            }
            Err(AttachError { error, kinematics }) => {
                self.kinematics = kinematics;
                Err(error)
            }
        }
    }

    /// Stepper position for a stationary toolhead at (x, y, z).
    pub fn calc_position_from_coord(&self, x: f64, y: f64, z: f64) -> f64 {
        position_at(self.kinematics.as_ref(), Coord::new(x, y, z))
    }

    pub fn set_position(&mut self, x: f64, y: f64, z: f64) {
        self.commanded_pos = self.calc_position_from_coord(x, y, z);
    }

    pub fn is_active_axis(&self, axis: Axis) -> bool {
        self.kinematics.active_flags().contains(ActiveFlags::from_axis(axis))
    }

    /// Start time of the next queued move that will move this stepper, if
    /// one starts before `flush_time` ends.
    pub fn check_active(&self, flush_time: f64) -> Result<Option<f64>, StepGenError> {
        let Some(trapq) = &self.trapq else {
            return Ok(None);
        };
        let tq = trapq.read().map_err(|_| StepGenError::QueuePoisoned)?;
        let Some(first) = tq.first_move_after(self.last_flush_time) else {
            return Ok(None);
        };
        let flags = self.kinematics.active_flags();
        for m in &tq.moves()[first..] {
            if flags.moves_with(m) {
                return Ok(Some(m.print_time));
            }
            if flush_time <= m.end_time() {
                break;
            }
        }
        Ok(None)
    }

    /// Generate every step up to `flush_time`.
    pub fn advance(&mut self, flush_time: f64) -> Result<Vec<StepEvent>, StepGenError> {
        let mut steps = Vec::new();
        if flush_time <= self.last_flush_time {
            return Ok(steps);
        }
        let trapq = self.trapq.as_ref().map(Arc::clone).ok_or(StepGenError::Range {
            flush_time,
            queue_end: None,
        })?;
        let tq = trapq.read().map_err(|_| StepGenError::QueuePoisoned)?;
        let queue_end = tq.end_time();
        match queue_end {
            Some(end) if flush_time <= end => {}
            _ => return Err(StepGenError::Range { flush_time, queue_end }),
        }
        self.generate_steps(&tq, flush_time, &mut steps)?;
        tracing::trace!(stepper = %self.name, flush_time, steps = steps.len(), "generated steps");
        Ok(steps)
    }

    fn generate_steps(&mut self, tq: &TrapQueue, flush_time: f64, out: &mut Vec<StepEvent>) -> Result<(), StepGenError> {
        let last_flush_time = self.last_flush_time;
        self.last_flush_time = flush_time;
        let moves = tq.moves();
        let Some(mut idx) = tq.first_move_after(last_flush_time) else {
            return Ok(());
        };
        let flags = self.kinematics.active_flags();
        let pre_active = self.kinematics.gen_steps_pre_active();
        let post_active = self.kinematics.gen_steps_post_active();
        let mut force_steps_time = self.last_move_time + post_active;
        let mut skip_count = 0usize;
        while idx < moves.len() {
            let m = &moves[idx];
            let move_start = m.print_time;
            let move_end = m.end_time();
            if flags.moves_with(m) {
                if skip_count > 0 && pre_active > 0.0 {
                    // Steps leading up to stepper activity
                    let abs_start = (move_start - pre_active).max(last_flush_time).max(force_steps_time);
                    let mut pm = idx - 1;
                    skip_count -= 1;
                    while skip_count > 0 && pm > 0 && moves[pm].print_time > abs_start {
                        pm -= 1;
                        skip_count -= 1;
                    }
                    for back in pm..idx {
                        self.gen_steps_range(tq, back, abs_start, flush_time, out)?;
                    }
                }
                self.gen_steps_range(tq, idx, last_flush_time, flush_time, out)?;
                if move_end >= flush_time {
                    self.last_move_time = flush_time;
                    return Ok(());
                }
                skip_count = 0;
                self.last_move_time = move_end;
                force_steps_time = move_end + post_active;
            } else {
                if move_start < force_steps_time {
                    // Steps trailing stepper activity
                    let abs_end = force_steps_time.min(flush_time);
                    self.gen_steps_range(tq, idx, last_flush_time, abs_end, out)?;
                    skip_count = 1;
                } else {
                    skip_count += 1;
                }
                if flush_time + pre_active <= move_end {
                    return Ok(());
                }
            }
            idx += 1;
        }
        Ok(())
    }

    fn eval(&self, cursor: &MoveCursor<'_>, print_time: f64, move_time: f64) -> Result<f64, StepGenError> {
        let position = self.kinematics.calc_position(cursor, move_time);
        if position.is_finite() {
            Ok(position)
        } else {
            Err(StepGenError::NonFinitePosition {
                model: self.kinematics.name(),
                print_time: print_time + move_time,
            })
        }
    }

    fn commit_step(&mut self, print_time: f64, dir: bool, position: f64, out: &mut Vec<StepEvent>) -> Result<(), StepGenError> {
        if print_time <= self.last_step_time {
            tracing::error!(
                stepper = %self.name,
                print_time,
                last_step_time = self.last_step_time,
                "step times out of order"
            );
            return Err(StepGenError::StepOrdering {
                print_time,
                last_step_time: self.last_step_time,
            });
        }
        self.last_step_time = print_time;
        out.push(StepEvent {
            print_time,
            dir: if dir { 1 } else { -1 },
            position,
        });
        Ok(())
    }

    /// Find the steps of move `idx` between the absolute times `abs_start`
    /// and `abs_end`.
    fn gen_steps_range(
        &mut self,
        tq: &TrapQueue,
        idx: usize,
        abs_start: f64,
        abs_end: f64,
        out: &mut Vec<StepEvent>,
    ) -> Result<(), StepGenError> {
        let Some(cursor) = tq.cursor(idx) else {
            return Ok(());
        };
        let m = cursor.get();
        let step_dist = self.step_dist;
        let start = (abs_start - m.print_time).max(0.0);
        let end = (abs_end - m.print_time).min(m.move_t);
        if start >= end {
            return Ok(());
        }
        let signed_step = |dir: bool| if dir { step_dist } else { -step_dist };
        let mut old_guess = TimePos {
            time: start,
            position: self.commanded_pos,
        };
        let mut guess = old_guess;
        let mut sdir = self.last_dir;
        let mut is_dir_change = false;
        let mut have_bracket = false;
        let mut check_oscillate = false;
        let mut target = self.commanded_pos + signed_step(sdir);
        let mut last_time = start;
        let mut low_time = start;
        let mut high_time = (start + SEEK_TIME_RESET).min(end);
        let mut iterations = 0usize;
        loop {
            // Secant guess from the two most recent positions
            let guess_dist = guess.position - target;
            let og_dist = old_guess.position - target;
            let mut next_time = (old_guess.time * guess_dist - guess.time * og_dist) / (guess_dist - og_dist);
            if !(next_time > low_time && next_time < high_time) {
                if have_bracket {
                    // Poor guess, bisect instead
                    next_time = 0.5 * (low_time + high_time);
                    check_oscillate = false;
                } else if guess.time >= end {
                    break;
                } else {
                    // Exponential search forward
                    next_time = high_time;
                    high_time = (2.0 * high_time - last_time).min(end);
                }
            }
            iterations += 1;
            if iterations > MAX_SEARCH_ITERATIONS {
                tracing::error!(stepper = %self.name, print_time = m.print_time + guess.time, "step search diverged");
                return Err(StepGenError::NonMonotonic {
                    print_time: m.print_time + guess.time,
                    iterations,
                });
            }
            old_guess = guess;
            guess = TimePos {
                time: next_time,
                position: self.eval(&cursor, m.print_time, next_time)?,
            };
            let guess_dist = guess.position - target;
            if guess_dist.abs() > POSITION_TOLERANCE {
                let rel_dist = if sdir { guess_dist } else { -guess_dist };
                if rel_dist > 0.0 {
                    // Past the boundary, so a step lies before this guess
                    if have_bracket && old_guess.time <= low_time {
                        if check_oscillate {
                            old_guess = guess;
                        }
                        check_oscillate = true;
                    }
                    high_time = guess.time;
                    have_bracket = true;
                } else if rel_dist < -(step_dist + step_dist + DIR_CHANGE_MARGIN) {
                    // Back past the previous boundary: the stepper reversed
                    sdir = !sdir;
                    target += 2.0 * signed_step(sdir);
                    low_time = last_time;
                    high_time = guess.time;
                    is_dir_change = true;
                    have_bracket = true;
                    check_oscillate = false;
                } else {
                    low_time = guess.time;
                }
                if !have_bracket || high_time - low_time > TIME_TOLERANCE {
                    continue;
                }
            }

            self.commit_step(m.print_time + guess.time, sdir, target, out)?;
            target += signed_step(sdir);
            iterations = 0;

            let mut seek_time_delta = (1.5 * (guess.time - last_time)).max(TIME_TOLERANCE);
            if is_dir_change && seek_time_delta > SEEK_TIME_RESET {
                seek_time_delta = SEEK_TIME_RESET;
            }
            last_time = guess.time;
            low_time = guess.time;
            high_time = (guess.time + seek_time_delta).min(end);
            is_dir_change = false;
            have_bracket = false;
            check_oscillate = false;
        }
        self.commanded_pos = target - signed_step(sdir);
        self.last_dir = sdir;
        Ok(())
    }
}
