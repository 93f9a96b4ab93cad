// src/trapq.rs - Trapezoidal motion segment queue
//! Time ordered queue of trapezoid motion segments.
//!
//! The planner appends moves in strictly increasing time order. Step
//! generation reads them through [`MoveCursor`], and the flush logic retires
//! them with [`TrapQueue::finalize_moves`] once every stepper has generated
//! steps past them. Retired moves with motion are kept in a bounded history
//! for diagnostics.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use thiserror::Error;

pub const NEVER_TIME: f64 = 9_999_999_999_999_999.9;
/// Longest hold move inserted ahead of the first queued move.
pub const MAX_NULL_MOVE: f64 = 1.0;
/// Moves starting this close to the end of the previous move are treated as adjacent.
const TIME_EPSILON: f64 = 0.000_000_001;

pub type SharedTrapQueue = Arc<RwLock<TrapQueue>>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TrapQueueError {
    #[error("Move at {print_time:.6} starts before end of queue {queue_end:.6}")]
    OutOfOrder { print_time: f64, queue_end: f64 },
    #[error("Invalid move timing (print_time={print_time}, move_t={move_t})")]
    InvalidTiming { print_time: f64, move_t: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'x' | 'X' => Some(Axis::X),
            'y' | 'Y' => Some(Axis::Y),
            'z' | 'Z' => Some(Axis::Z),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Axis::X => 'x',
            Axis::Y => 'y',
            Axis::Z => 'z',
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Coord {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn axis(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    pub fn set_axis(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
        }
    }
}

/// Phase of a trapezoid a move belongs to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovePhase {
    /// Stationary filler between (or ahead of) real moves
    #[default]
    Null,
    Accel,
    Cruise,
    Decel,
}

/// One segment of motion: position is a quadratic in move time along `axes_r`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Move {
    pub print_time: f64,
    pub move_t: f64,
    pub start_v: f64,
    pub half_accel: f64,
    pub start_pos: Coord,
    pub axes_r: Coord,
    pub phase: MovePhase,
}

impl Move {
    /// A stationary move holding `pos` over `[print_time, print_time + move_t]`.
    pub fn hold(print_time: f64, move_t: f64, pos: Coord) -> Self {
        Self {
            print_time,
            move_t,
            start_pos: pos,
            ..Self::default()
        }
    }

    /// A stationary move used to evaluate a kinematic model at a fixed coordinate.
    pub fn stationary(pos: Coord) -> Self {
        Self::hold(0.0, MAX_NULL_MOVE, pos)
    }

    pub fn end_time(&self) -> f64 {
        self.print_time + self.move_t
    }

    pub fn is_null(&self) -> bool {
        self.start_v == 0.0 && self.half_accel == 0.0
    }

    /// Distance travelled along the move direction after `move_time` seconds.
    pub fn get_distance(&self, move_time: f64) -> f64 {
        (self.start_v + self.half_accel * move_time) * move_time
    }

    /// Velocity along the move direction at `move_time`.
    pub fn get_velocity(&self, move_time: f64) -> f64 {
        self.start_v + 2.0 * self.half_accel * move_time
    }

    pub fn get_coord(&self, move_time: f64) -> Coord {
        let move_dist = self.get_distance(move_time);
        Coord {
            x: self.start_pos.x + self.axes_r.x * move_dist,
            y: self.start_pos.y + self.axes_r.y * move_dist,
            z: self.start_pos.z + self.axes_r.z * move_dist,
        }
    }

    pub fn axis_position(&self, axis: Axis, move_time: f64) -> f64 {
        self.start_pos.axis(axis) + self.axes_r.axis(axis) * self.get_distance(move_time)
    }
}

/// A move and its neighbours inside a queue.
///
/// Walking before the first or past the last move yields virtual hold moves
/// of [`MAX_NULL_MOVE`] seconds at the boundary position, so models that look
/// backwards or forwards in time always see a continuous trajectory.
#[derive(Debug, Clone, Copy)]
pub struct MoveCursor<'a> {
    moves: &'a [Move],
    index: isize,
    /// Replacement for the move at the given index
    substitute: Option<(isize, &'a Move)>,
}

impl<'a> MoveCursor<'a> {
    pub fn new(moves: &'a [Move], index: usize) -> Option<Self> {
        if index >= moves.len() {
            return None;
        }
        Some(Self {
            moves,
            index: index as isize,
            substitute: None,
        })
    }

    pub fn single(m: &'a Move) -> Self {
        Self {
            moves: std::slice::from_ref(m),
            index: 0,
            substitute: None,
        }
    }

    /// Same place in the queue, but reading `m` in place of the current move.
    /// Neighbouring moves are unchanged.
    pub fn with_current<'b>(&self, m: &'b Move) -> MoveCursor<'b>
    where
        'a: 'b,
    {
        MoveCursor {
            moves: self.moves,
            index: self.index,
            substitute: Some((self.index, m)),
        }
    }

    /// True when the cursor points at a queued move rather than a virtual hold.
    pub fn is_queued(&self) -> bool {
        self.index >= 0 && (self.index as usize) < self.moves.len()
    }

    pub fn get(&self) -> Move {
        if let Some((index, m)) = self.substitute {
            if index == self.index {
                return *m;
            }
        }
        let len = self.moves.len() as isize;
        if self.index < 0 {
            let first = self.moves[0];
            let back = -self.index as f64;
            Move::hold(
                first.print_time - back * MAX_NULL_MOVE,
                MAX_NULL_MOVE,
                first.start_pos,
            )
        } else if self.index >= len {
            let last = self.moves[(len - 1) as usize];
            let ahead = (self.index - len) as f64;
            Move::hold(
                last.end_time() + ahead * MAX_NULL_MOVE,
                MAX_NULL_MOVE,
                last.get_coord(last.move_t),
            )
        } else {
            self.moves[self.index as usize]
        }
    }

    pub fn prev(&self) -> Self {
        Self {
            index: self.index - 1,
            ..*self
        }
    }

    pub fn next(&self) -> Self {
        Self {
            index: self.index + 1,
            ..*self
        }
    }

    /// Coordinate at `move_time` relative to the start of this move; the time
    /// may fall outside the move, in which case neighbouring moves are used.
    pub fn coord_across_moves(&self, move_time: f64) -> Coord {
        let mut cursor = *self;
        let mut m = cursor.get();
        let mut time = move_time;
        while time < 0.0 {
            cursor = cursor.prev();
            m = cursor.get();
            time += m.move_t;
        }
        while time > m.move_t {
            time -= m.move_t;
            cursor = cursor.next();
            m = cursor.get();
        }
        m.get_coord(time)
    }

    pub fn axis_position_across_moves(&self, axis: Axis, move_time: f64) -> f64 {
        self.coord_across_moves(move_time).axis(axis)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrapQueue {
    moves: Vec<Move>,
    /// Retired moves, newest first
    history: VecDeque<Move>,
    retired_before: f64,
}

impl TrapQueue {
    pub fn new() -> Self {
        Self {
            moves: Vec::new(),
            history: VecDeque::new(),
            retired_before: f64::NEG_INFINITY,
        }
    }

    pub fn into_shared(self) -> SharedTrapQueue {
        Arc::new(RwLock::new(self))
    }

    /// Queue a fully prepared move, filling any gap with a hold move.
    pub fn add_move(&mut self, m: Move) -> Result<(), TrapQueueError> {
        if !m.print_time.is_finite() || !m.move_t.is_finite() || m.move_t < 0.0 {
            return Err(TrapQueueError::InvalidTiming {
                print_time: m.print_time,
                move_t: m.move_t,
            });
        }
        match self.moves.last() {
            Some(prev) => {
                let prev_end = prev.end_time();
                if m.print_time < prev_end - TIME_EPSILON {
                    return Err(TrapQueueError::OutOfOrder {
                        print_time: m.print_time,
                        queue_end: prev_end,
                    });
                }
                if m.print_time > prev_end + TIME_EPSILON {
                    let hold_pos = prev.get_coord(prev.move_t);
                    self.moves
                        .push(Move::hold(prev_end, m.print_time - prev_end, hold_pos));
                }
            }
            None => {
                let start = m.print_time - MAX_NULL_MOVE;
                self.moves.push(Move::hold(start, MAX_NULL_MOVE, m.start_pos));
            }
        }
        self.moves.push(m);
        Ok(())
    }

    /// Split a trapezoid (accel, cruise, decel) into queued moves.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        print_time: f64,
        accel_t: f64,
        cruise_t: f64,
        decel_t: f64,
        start_pos: Coord,
        axes_r: Coord,
        start_v: f64,
        cruise_v: f64,
        accel: f64,
    ) -> Result<(), TrapQueueError> {
        let mut cur_time = print_time;
        let mut cur_pos = start_pos;
        if accel_t > 0.0 {
            let m = Move {
                print_time: cur_time,
                move_t: accel_t,
                start_v,
                half_accel: 0.5 * accel,
                start_pos: cur_pos,
                axes_r,
                phase: MovePhase::Accel,
            };
            self.add_move(m)?;
            cur_time += accel_t;
            cur_pos = m.get_coord(accel_t);
        }
        if cruise_t > 0.0 {
            let m = Move {
                print_time: cur_time,
                move_t: cruise_t,
                start_v: cruise_v,
                half_accel: 0.0,
                start_pos: cur_pos,
                axes_r,
                phase: MovePhase::Cruise,
            };
            self.add_move(m)?;
            cur_time += cruise_t;
            cur_pos = m.get_coord(cruise_t);
        }
        if decel_t > 0.0 {
            self.add_move(Move {
                print_time: cur_time,
                move_t: decel_t,
                start_v: cruise_v,
                half_accel: -0.5 * accel,
                start_pos: cur_pos,
                axes_r,
                phase: MovePhase::Decel,
            })?;
        }
        Ok(())
    }

    /// Hold the last queued position until `print_time`. Does nothing on an
    /// empty queue or when the queue already reaches that far.
    pub fn hold_until(&mut self, print_time: f64) -> Result<(), TrapQueueError> {
        let Some(last) = self.moves.last() else {
            return Ok(());
        };
        let end = last.end_time();
        if print_time <= end {
            return Ok(());
        }
        let pos = last.get_coord(last.move_t);
        self.add_move(Move::hold(end, print_time - end, pos))
    }

    fn retire(&mut self, print_time: f64) {
        let count = self
            .moves
            .iter()
            .take_while(|m| m.end_time() <= print_time)
            .count();
        for m in self.moves.drain(..count) {
            self.retired_before = self.retired_before.max(m.end_time());
            if !m.is_null() {
                self.history.push_front(m);
            }
        }
    }

    /// Retire moves that end at or before `print_time` and expire history
    /// older than `clear_history_time`.
    pub fn finalize_moves(&mut self, print_time: f64, clear_history_time: f64) {
        self.retire(print_time);
        self.retired_before = self.retired_before.max(print_time.min(self.first_start()));
        while self.history.len() > 1 {
            match self.history.back() {
                Some(oldest) if oldest.end_time() <= clear_history_time => {
                    self.history.pop_back();
                }
                _ => break,
            }
        }
    }

    fn first_start(&self) -> f64 {
        self.moves.first().map_or(NEVER_TIME, |m| m.print_time)
    }

    /// Note a position change: every queued move is flushed and history past
    /// `print_time` is discarded.
    pub fn set_position(&mut self, print_time: f64, pos: Coord) {
        self.retire(NEVER_TIME);
        while let Some(first) = self.history.front_mut() {
            if first.print_time < print_time {
                if first.end_time() > print_time {
                    first.move_t = print_time - first.print_time;
                }
                break;
            }
            self.history.pop_front();
        }
        self.history.push_front(Move::hold(print_time, 0.0, pos));
    }

    /// Active and historical moves overlapping `[start_time, end_time]`, newest first.
    pub fn extract_old(&self, max: usize, start_time: f64, end_time: f64) -> Vec<Move> {
        let mut res = Vec::new();
        let candidates = self.moves.iter().rev().chain(self.history.iter());
        for m in candidates {
            if res.len() >= max {
                break;
            }
            if m.print_time > end_time {
                continue;
            }
            if m.end_time() < start_time {
                break;
            }
            res.push(*m);
        }
        res
    }

    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    pub fn history(&self) -> impl Iterator<Item = &Move> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// End time of the last queued move.
    pub fn end_time(&self) -> Option<f64> {
        self.moves.last().map(Move::end_time)
    }

    /// Moves ending at or before this time have been released.
    pub fn retired_before(&self) -> f64 {
        self.retired_before
    }

    /// Index of the first move still in progress after `time`.
    pub fn first_move_after(&self, time: f64) -> Option<usize> {
        self.moves.iter().position(|m| time < m.end_time())
    }

    pub fn cursor(&self, index: usize) -> Option<MoveCursor<'_>> {
        MoveCursor::new(&self.moves, index)
    }
}
