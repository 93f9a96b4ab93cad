//! Discrete-event simulation of a multi-MCU homing move.
//!
//! Every simulated MCU runs its own clock, reports its trsync state at a
//! fixed period, honours the host's set-timeout and trigger commands after a
//! transport delay, and (optionally) trips itself when its expire clock
//! passes. The host side is a real [`TrDispatch`]. Reports that reach the
//! host at the same instant are handed over as one batch.

pub mod event_queue;

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use kinstep_host::trsync::{
    DispatchError, StatusOutcome, TrDispatch, TrDispatchMcu, TriggerEvent, TrsyncState, TrsyncWindow,
    REASON_COMMS_TIMEOUT, REASON_ENDSTOP_HIT,
};
use kinstep_shared::clock::ClockEstimate;
use kinstep_shared::transport::{CommandQueueId, OutgoingMessage, QueueMessage, SerialQueue, TransportError};
use serde::Serialize;
use thiserror::Error;

use crate::scenario::Scenario;
use event_queue::{SimClock, SimEventQueue, SimEventType};

pub const MSG_TRSYNC_SET_TIMEOUT: u32 = 0x30;
pub const MSG_TRSYNC_TRIGGER: u32 = 0x31;
pub const MSG_TRSYNC_STATE: u32 = 0x32;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Message for unknown command queue {0}")]
    UnknownQueue(u32),
}

/// Host-side transport: a crossbeam channel drained by the event loop.
#[derive(Debug, Clone)]
pub struct ChannelQueue(pub Sender<OutgoingMessage>);

impl SerialQueue for ChannelQueue {
    fn send(&self, cq: CommandQueueId, msg: QueueMessage) -> Result<(), TransportError> {
        self.0
            .send(OutgoingMessage { cq, msg })
            .map_err(|_| TransportError::Closed)
    }
}

/// One row of the message log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub time: f64,
    pub mcu: String,
    pub direction: &'static str,
    pub message: &'static str,
    /// MCU clock carried by the message
    pub clock: u64,
    /// can_trigger for states, reason for triggers
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct McuSummary {
    pub name: String,
    pub trip_reason: Option<u32>,
    pub trip_time: Option<f64>,
    pub reports_sent: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimReport {
    pub trigger: Option<TriggerEvent>,
    pub trigger_mcu: Option<String>,
    pub extensions: usize,
    pub lapse: Option<String>,
    /// Dispatch was still running at the end of the simulated window
    pub stopped_by_host: bool,
    /// Host time of the last delivered event
    pub end_time: f64,
    pub mcus: Vec<McuSummary>,
}

struct SimMcu {
    name: String,
    clock_est: ClockEstimate,
    period: Duration,
    latency: Duration,
    watchdog: bool,
    expire_clock: Option<u64>,
    tripped: Option<(u32, u64)>,
    trip_time: Option<f64>,
    reports_sent: usize,
}

impl SimMcu {
    fn clock_at(&self, host_time: f64) -> u64 {
        self.clock_est.clock_from_time(host_time)
    }

    fn trip(&mut self, reason: u32, clock: u64, host_time: f64) {
        if self.tripped.is_none() {
            tracing::debug!(mcu = %self.name, reason, clock, "trsync tripped");
            self.tripped = Some((reason, clock));
            self.trip_time = Some(host_time);
        }
    }
}

pub struct HomingSimulator {
    scenario: Scenario,
    queue: SimEventQueue,
    clock: SimClock,
    dispatch: TrDispatch,
    endpoints: Vec<TrDispatchMcu>,
    mcus: Vec<SimMcu>,
    outbox: Receiver<OutgoingMessage>,
    log: Vec<MessageRecord>,
    extensions: usize,
    lapse: Option<String>,
}

fn secs(t: f64) -> Duration {
    Duration::from_secs_f64(t.max(0.0))
}

impl HomingSimulator {
    pub fn new(scenario: Scenario) -> Result<Self, SimError> {
        let (tx, outbox) = crossbeam_channel::unbounded();
        let transport: std::sync::Arc<dyn SerialQueue> = std::sync::Arc::new(ChannelQueue(tx));
        let dispatch = TrDispatch::new();
        let count = scenario.mcus.len();
        let start = scenario.simulation.start_time;
        let mut endpoints = Vec::with_capacity(count);
        let mut mcus = Vec::with_capacity(count);
        for (i, ms) in scenario.mcus.iter().enumerate() {
            let oid = i as u32;
            let clock_est = ClockEstimate::new((ms.offset * ms.freq) as u64, 0.0, ms.freq);
            let tdm = dispatch.mcu_alloc(
                std::sync::Arc::clone(&transport),
                CommandQueueId(oid),
                oid,
                MSG_TRSYNC_SET_TIMEOUT,
                MSG_TRSYNC_TRIGGER,
                MSG_TRSYNC_STATE,
            )?;
            TrsyncWindow::for_move(&scenario.trsync, count, start, &clock_est).apply(&tdm, clock_est)?;
            endpoints.push(tdm);
            mcus.push(SimMcu {
                name: ms.name.clone(),
                clock_est,
                period: secs(ms.status_period(&scenario.trsync, count)),
                latency: secs(ms.latency),
                watchdog: ms.watchdog,
                expire_clock: None,
                tripped: None,
                trip_time: None,
                reports_sent: 0,
            });
        }
        Ok(Self {
            scenario,
            queue: SimEventQueue::new(),
            clock: SimClock::new(),
            dispatch,
            endpoints,
            mcus,
            outbox,
            log: Vec::new(),
            extensions: 0,
            lapse: None,
        })
    }

    pub fn messages(&self) -> &[MessageRecord] {
        &self.log
    }

    /// Deliver everything the host queued since the last call.
    fn pump_outbox(&mut self) -> Result<(), SimError> {
        let now = self.clock.current_time;
        while let Ok(OutgoingMessage { cq, msg }) = self.outbox.try_recv() {
            let mcu = self
                .mcus
                .get(cq.0 as usize)
                .ok_or(SimError::UnknownQueue(cq.0))?;
            let (message, value) = match msg.msgtag() {
                Some(MSG_TRSYNC_SET_TIMEOUT) => ("trsync_set_timeout", 0),
                Some(MSG_TRSYNC_TRIGGER) => ("trsync_trigger", msg.fields.get(2).copied().unwrap_or(0)),
                _ => ("unknown", 0),
            };
            self.log.push(MessageRecord {
                time: now.as_secs_f64(),
                mcu: mcu.name.clone(),
                direction: "host->mcu",
                message,
                clock: msg.req_clock,
                value,
            });
            let at = now + mcu.latency;
            self.queue.schedule(at, SimEventType::McuReceive { mcu: cq.0 as usize, msg });
        }
        Ok(())
    }

    fn send_state(&mut self, idx: usize) {
        let now = self.clock.seconds();
        let mcu = &mut self.mcus[idx];
        let clock = mcu.clock_at(now);
        let state = match mcu.tripped {
            Some((reason, trip_clock)) => TrsyncState {
                oid: idx as u32,
                can_trigger: false,
                trigger_reason: reason,
                clock: trip_clock as u32,
            },
            None => TrsyncState {
                oid: idx as u32,
                can_trigger: true,
                trigger_reason: 0,
                clock: clock as u32,
            },
        };
        let at = self.clock.current_time + mcu.latency;
        if self.scenario.mcus[idx].reports_lost_at(now) {
            tracing::debug!(mcu = %mcu.name, clock, "status report lost");
            return;
        }
        mcu.reports_sent += 1;
        self.queue.schedule(at, SimEventType::HostReceive { mcu: idx, state });
    }

    fn handle_host_batch(&mut self, batch: Vec<(usize, TrsyncState)>) -> Result<(), SimError> {
        let now = self.clock.seconds();
        for (idx, state) in &batch {
            self.log.push(MessageRecord {
                time: now,
                mcu: self.mcus[*idx].name.clone(),
                direction: "mcu->host",
                message: "trsync_state",
                clock: u64::from(state.clock),
                value: u32::from(state.can_trigger),
            });
        }
        let updates: Vec<(&TrDispatchMcu, TrsyncState)> =
            batch.iter().map(|(idx, st)| (&self.endpoints[*idx], *st)).collect();
        match self.dispatch.handle_trsync_batch(&updates) {
            Ok(outcomes) => {
                for outcome in outcomes {
                    match outcome {
                        StatusOutcome::Extended { .. } => self.extensions += 1,
                        StatusOutcome::Triggered(event) => {
                            tracing::info!(
                                mcu = %self.mcus[event.endpoint].name,
                                host_time = event.host_time,
                                "homing trigger"
                            );
                        }
                        _ => {}
                    }
                }
            }
            Err(e @ DispatchError::ExtensionLapsed { .. }) => {
                tracing::warn!("{}", e);
                self.lapse = Some(e.to_string());
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn handle_mcu_receive(&mut self, idx: usize, msg: QueueMessage) {
        let now = self.clock.seconds();
        let mcu = &mut self.mcus[idx];
        match msg.msgtag() {
            Some(MSG_TRSYNC_SET_TIMEOUT) => mcu.expire_clock = Some(msg.req_clock),
            Some(MSG_TRSYNC_TRIGGER) => {
                let reason = msg.fields.get(2).copied().unwrap_or(0);
                let clock = mcu.clock_at(now);
                mcu.trip(reason, clock, now);
            }
            other => tracing::warn!(mcu = %mcu.name, ?other, "unexpected message"),
        }
    }

    /// Run the scenario to completion.
    pub fn run(&mut self) -> Result<SimReport, SimError> {
        let start = secs(self.scenario.simulation.start_time);
        let end = secs(self.scenario.simulation.duration);
        self.clock.advance_to(start);
        self.dispatch.start(self.scenario.simulation.dispatch_reason)?;
        self.pump_outbox()?;
        for (i, ms) in self.scenario.mcus.iter().enumerate() {
            self.queue.schedule(start + self.mcus[i].period, SimEventType::StatusReport { mcu: i });
            if let Some(t) = ms.trigger_time {
                self.queue.schedule(secs(t), SimEventType::EndstopTrip { mcu: i });
            }
        }

        while let Some(event) = self.queue.pop() {
            if event.timestamp > end {
                break;
            }
            self.clock.advance_to(event.timestamp);
            let now = self.clock.seconds();
            match event.event_type {
                SimEventType::StatusReport { mcu } => {
                    let m = &mut self.mcus[mcu];
                    if m.watchdog {
                        if let Some(expire) = m.expire_clock {
                            if m.clock_at(now) >= expire {
                                m.trip(REASON_COMMS_TIMEOUT, expire, now);
                            }
                        }
                    }
                    self.send_state(mcu);
                    if self.dispatch.is_active()? {
                        let next = event.timestamp + self.mcus[mcu].period;
                        self.queue.schedule(next, SimEventType::StatusReport { mcu });
                    }
                }
                SimEventType::EndstopTrip { mcu } => {
                    let m = &mut self.mcus[mcu];
                    let clock = m.clock_at(now);
                    m.trip(REASON_ENDSTOP_HIT, clock, now);
                    self.send_state(mcu);
                }
                SimEventType::HostReceive { mcu, state } => {
                    let mut batch = vec![(mcu, state)];
                    let t = event.timestamp;
                    while let Some(next) = self.queue.pop_if(|e| {
                        e.timestamp == t && matches!(e.event_type, SimEventType::HostReceive { .. })
                    }) {
                        if let SimEventType::HostReceive { mcu, state } = next.event_type {
                            batch.push((mcu, state));
                        }
                    }
                    self.handle_host_batch(batch)?;
                    self.pump_outbox()?;
                }
                SimEventType::McuReceive { mcu, msg } => self.handle_mcu_receive(mcu, msg),
            }
        }

        let stopped_by_host = self.dispatch.stop()?;
        if stopped_by_host {
            tracing::warn!("dispatch still active at end of simulation, stopped by host");
        }
        self.pump_outbox()?;
        // Deliver commands still in flight
        while let Some(event) = self.queue.pop() {
            if let SimEventType::McuReceive { mcu, msg } = event.event_type {
                self.clock.advance_to(event.timestamp);
                self.handle_mcu_receive(mcu, msg);
            }
        }
        let trigger = self.dispatch.trigger_result()?;
        Ok(SimReport {
            trigger,
            trigger_mcu: trigger.map(|t| self.mcus[t.endpoint].name.clone()),
            extensions: self.extensions,
            lapse: self.lapse.clone(),
            stopped_by_host,
            end_time: self.clock.seconds(),
            mcus: self
                .mcus
                .iter()
                .map(|m| McuSummary {
                    name: m.name.clone(),
                    trip_reason: m.tripped.map(|(reason, _)| reason),
                    trip_time: m.trip_time,
                    reports_sent: m.reports_sent,
                })
                .collect(),
        })
    }

    /// Write the message log as CSV.
    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut wtr = csv::Writer::from_writer(writer);
        for record in &self.log {
            wtr.serialize(record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}
