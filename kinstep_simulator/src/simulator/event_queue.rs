//! Event queue and simulation clock for the homing simulator

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use kinstep_host::trsync::TrsyncState;
use kinstep_shared::transport::QueueMessage;

/// Simulation event type
#[derive(Debug, Clone, PartialEq)]
pub enum SimEventType {
    /// MCU samples its trsync state and reports it
    StatusReport { mcu: usize },
    /// Endstop on an MCU closes
    EndstopTrip { mcu: usize },
    /// trsync_state arrives at the host
    HostReceive { mcu: usize, state: TrsyncState },
    /// Host command arrives at an MCU
    McuReceive { mcu: usize, msg: QueueMessage },
}

/// Simulation event
#[derive(Debug, Clone)]
pub struct SimEvent {
    pub timestamp: Duration,
    /// Insertion order, breaks timestamp ties
    pub seq: u64,
    pub event_type: SimEventType,
}

impl PartialEq for SimEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for SimEvent {}
impl PartialOrd for SimEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SimEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Earliest-first event queue
#[derive(Debug, Default)]
pub struct SimEventQueue {
    queue: BinaryHeap<Reverse<SimEvent>>,
    next_seq: u64,
}

impl SimEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, timestamp: Duration, event_type: SimEventType) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse(SimEvent {
            timestamp,
            seq,
            event_type,
        }));
    }

    pub fn pop(&mut self) -> Option<SimEvent> {
        self.queue.pop().map(|Reverse(e)| e)
    }

    /// Pop the next event only if `accept` takes it.
    pub fn pop_if<F: FnOnce(&SimEvent) -> bool>(&mut self, accept: F) -> Option<SimEvent> {
        let take = self.queue.peek().is_some_and(|Reverse(next)| accept(next));
        if take { self.pop() } else { None }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Simulation clock
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    pub current_time: Duration,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to `t`; the clock never runs backwards.
    pub fn advance_to(&mut self, t: Duration) {
        self.current_time = self.current_time.max(t);
    }

    pub fn seconds(&self) -> f64 {
        self.current_time.as_secs_f64()
    }
}
