// src/trsync/trdispatch.rs - Cross-MCU trigger dispatch
//! One logical stop condition shared by several trigger-sync endpoints.
//!
//! Each MCU taking part in a homing move owns a `trsync` object that trips
//! locally when its endstop fires or when its expire clock passes. The host
//! keeps every endpoint's expire clock ahead of its reported status, and as
//! soon as one endpoint reports a trigger the others are told to stop too.
//!
//! All endpoint fields live behind the single dispatch lock. Outgoing
//! messages are only enqueued while the lock is held.

use std::sync::{Arc, Mutex, MutexGuard};

use kinstep_shared::clock::ClockEstimate;
use kinstep_shared::transport::{CommandQueueId, QueueMessage, SerialQueue, TransportError};
use serde::Serialize;
use thiserror::Error;

pub const REASON_ENDSTOP_HIT: u32 = 1;
pub const REASON_COMMS_TIMEOUT: u32 = 2;
pub const REASON_HOST_REQUEST: u32 = 3;
pub const REASON_PAST_END_TIME: u32 = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Trigger dispatch is already active")]
    AlreadyActive,
    #[error("Trigger dispatch has no endpoints")]
    NoEndpoints,
    #[error("trsync oid {oid} reported clock {status_clock} past its expire clock {expire_clock}")]
    ExtensionLapsed {
        oid: u32,
        status_clock: u64,
        expire_clock: u64,
    },
    #[error("Failed to arm trsync oid {oid}: {source}")]
    Transport {
        oid: u32,
        #[source]
        source: TransportError,
    },
    #[error("Trigger dispatch lock poisoned")]
    LockPoisoned,
}

/// Parsed `trsync_state` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrsyncState {
    pub oid: u32,
    pub can_trigger: bool,
    pub trigger_reason: u32,
    /// Low 32 bits of the MCU clock the state was sampled at
    pub clock: u32,
}

impl TrsyncState {
    /// Decode `[msgtag, oid, can_trigger, trigger_reason, clock]`.
    pub fn from_fields(fields: &[u32]) -> Option<Self> {
        match *fields {
            [_, oid, can_trigger, trigger_reason, clock] => Some(Self {
                oid,
                can_trigger: can_trigger != 0,
                trigger_reason,
                clock,
            }),
            _ => None,
        }
    }
}

/// The trigger that stopped a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TriggerEvent {
    /// Registration index of the winning endpoint
    pub endpoint: usize,
    pub oid: u32,
    pub trigger_reason: u32,
    /// MCU clock of the trigger report
    pub clock: u64,
    /// `clock` mapped onto the host timeline
    pub host_time: f64,
    pub generation: u64,
}

/// What a single status update did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusOutcome {
    /// Dispatch idle, oid mismatch or stale clock
    Ignored,
    /// Status noted, expire clock still far enough ahead
    Recorded,
    Extended { expire_clock: u64 },
    /// This report won and stopped the dispatch
    Triggered(TriggerEvent),
    /// Trigger report or lapse beaten by an earlier trigger in the same batch
    Superseded,
}

struct Endpoint {
    transport: Arc<dyn SerialQueue>,
    cq: CommandQueueId,
    oid: u32,
    set_timeout_msgtag: u32,
    trigger_msgtag: u32,
    state_msgtag: u32,
    last_status_clock: u64,
    expire_clock: u64,
    expire_ticks: u64,
    min_extend_ticks: u64,
    clock_est: ClockEstimate,
    notified: bool,
}

impl Endpoint {
    fn send_set_timeout(&self) -> Result<(), TransportError> {
        let msg = QueueMessage::new(vec![self.set_timeout_msgtag, self.oid, self.expire_clock as u32])
            .with_req_clock(self.expire_clock);
        self.transport.send(self.cq, msg)
    }

    /// Tell the MCU to stop; failures are logged and otherwise ignored.
    fn send_trigger(&mut self, reason: u32) {
        self.notified = true;
        let msg = QueueMessage::new(vec![self.trigger_msgtag, self.oid, reason]);
        if let Err(e) = self.transport.send(self.cq, msg) {
            tracing::warn!(oid = self.oid, reason, "failed to send trsync_trigger: {}", e);
        }
    }
}

#[derive(Default)]
struct DispatchState {
    is_active: bool,
    can_trigger: bool,
    dispatch_reason: u32,
    generation: u64,
    endpoints: Vec<Endpoint>,
    trigger: Option<TriggerEvent>,
}

impl DispatchState {
    fn broadcast_trigger(&mut self, reason: u32) {
        for ep in self.endpoints.iter_mut().filter(|ep| !ep.notified) {
            ep.send_trigger(reason);
        }
    }

    fn halt(&mut self) {
        self.is_active = false;
        self.can_trigger = false;
    }
}

/// Shared dispatch handle; clones refer to the same dispatch.
#[derive(Clone, Default)]
pub struct TrDispatch {
    state: Arc<Mutex<DispatchState>>,
}

impl std::fmt::Debug for TrDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("TrDispatch");
        match self.state.lock() {
            Ok(state) => d
                .field("is_active", &state.is_active)
                .field("generation", &state.generation)
                .field("endpoints", &state.endpoints.len()),
            Err(_) => d.field("state", &"<poisoned>"),
        };
        d.finish()
    }
}

impl TrDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, DispatchState>, DispatchError> {
        self.state.lock().map_err(|_| DispatchError::LockPoisoned)
    }

    /// Register an MCU's trsync object. Endpoints win trigger ties in
    /// allocation order.
    pub fn mcu_alloc(
        &self,
        transport: Arc<dyn SerialQueue>,
        cq: CommandQueueId,
        oid: u32,
        set_timeout_msgtag: u32,
        trigger_msgtag: u32,
        state_msgtag: u32,
    ) -> Result<TrDispatchMcu, DispatchError> {
        let mut state = self.lock()?;
        if state.is_active {
            return Err(DispatchError::AlreadyActive);
        }
        let index = state.endpoints.len();
        state.endpoints.push(Endpoint {
            transport,
            cq,
            oid,
            set_timeout_msgtag,
            trigger_msgtag,
            state_msgtag,
            last_status_clock: 0,
            expire_clock: 0,
            expire_ticks: 0,
            min_extend_ticks: 0,
            clock_est: ClockEstimate::from_frequency(1.0),
            notified: false,
        });
        tracing::debug!(oid, index, "trsync endpoint registered");
        Ok(TrDispatchMcu {
            dispatch: self.clone(),
            index,
        })
    }

    /// Arm every endpoint. `reason` is what the other MCUs are told when one
    /// of them triggers.
    pub fn start(&self, reason: u32) -> Result<(), DispatchError> {
        let mut state = self.lock()?;
        if state.is_active {
            return Err(DispatchError::AlreadyActive);
        }
        if state.endpoints.is_empty() {
            return Err(DispatchError::NoEndpoints);
        }
        state.generation += 1;
        state.trigger = None;
        state.dispatch_reason = reason;
        state.is_active = true;
        state.can_trigger = true;
        let mut failed = None;
        for ep in state.endpoints.iter_mut() {
            ep.notified = false;
            if let Err(source) = ep.send_set_timeout() {
                failed = Some(DispatchError::Transport { oid: ep.oid, source });
                break;
            }
        }
        if let Some(err) = failed {
            tracing::error!("trigger dispatch failed to start: {}", err);
            state.halt();
            state.broadcast_trigger(REASON_HOST_REQUEST);
            return Err(err);
        }
        tracing::info!(
            generation = state.generation,
            endpoints = state.endpoints.len(),
            reason,
            "trigger dispatch started"
        );
        Ok(())
    }

    /// Stop an active dispatch. Returns false if it was already idle.
    pub fn stop(&self) -> Result<bool, DispatchError> {
        let mut state = self.lock()?;
        if !state.is_active {
            return Ok(false);
        }
        state.halt();
        state.broadcast_trigger(REASON_HOST_REQUEST);
        tracing::info!(generation = state.generation, "trigger dispatch stopped by host");
        Ok(true)
    }

    pub fn is_active(&self) -> Result<bool, DispatchError> {
        Ok(self.lock()?.is_active)
    }

    pub fn generation(&self) -> Result<u64, DispatchError> {
        Ok(self.lock()?.generation)
    }

    pub fn endpoint_count(&self) -> Result<usize, DispatchError> {
        Ok(self.lock()?.endpoints.len())
    }

    /// Winning trigger of the most recent dispatch, if one fired.
    pub fn trigger_result(&self) -> Result<Option<TriggerEvent>, DispatchError> {
        Ok(self.lock()?.trigger)
    }

    /// Apply several status updates under one lock acquisition. Trigger
    /// reports in the batch race on host time; ties go to the endpoint
    /// registered first. A lapsed endpoint only aborts the dispatch if its
    /// expire time comes before every trigger report in the batch.
    pub fn handle_trsync_batch(
        &self,
        updates: &[(&TrDispatchMcu, TrsyncState)],
    ) -> Result<Vec<StatusOutcome>, DispatchError> {
        let mut state = self.lock()?;
        let mut outcomes = vec![StatusOutcome::Ignored; updates.len()];
        // (update index, endpoint, host time, clock)
        let mut reports: Vec<(usize, usize, f64, u64)> = Vec::new();
        // (host time the endpoint expired, error)
        let mut lapses: Vec<(f64, DispatchError)> = Vec::new();
        let mut pending_extend: Vec<(usize, usize, u64)> = Vec::new();
        for (i, (tdm, st)) in updates.iter().enumerate() {
            if !Arc::ptr_eq(&tdm.dispatch.state, &self.state) {
                tracing::warn!(oid = st.oid, "status update for an endpoint of another dispatch");
                continue;
            }
            if !state.is_active || !state.can_trigger {
                continue;
            }
            let ep = &mut state.endpoints[tdm.index];
            if st.oid != ep.oid {
                tracing::debug!(expected = ep.oid, got = st.oid, "trsync_state oid mismatch");
                continue;
            }
            let clock = ep.clock_est.clock_from_clock32(st.clock);
            if clock <= ep.last_status_clock {
                continue;
            }
            ep.clock_est = ep.clock_est.observe(clock);
            ep.last_status_clock = clock;
            if !st.can_trigger {
                reports.push((i, tdm.index, ep.clock_est.clock_to_time(clock), clock));
                outcomes[i] = StatusOutcome::Superseded;
            } else if clock > ep.expire_clock {
                let err = DispatchError::ExtensionLapsed {
                    oid: ep.oid,
                    status_clock: clock,
                    expire_clock: ep.expire_clock,
                };
                lapses.push((ep.clock_est.clock_to_time(ep.expire_clock), err));
                outcomes[i] = StatusOutcome::Superseded;
            } else {
                pending_extend.push((i, tdm.index, clock));
                outcomes[i] = StatusOutcome::Recorded;
            }
        }

        let winner = reports.iter().copied().min_by(|a, b| a.2.total_cmp(&b.2).then(a.1.cmp(&b.1)));
        let first_lapse = lapses.into_iter().min_by(|a, b| a.0.total_cmp(&b.0));
        if let Some((i, index, host_time, clock)) = winner {
            match first_lapse {
                Some((expired_at, err)) if expired_at < host_time => {
                    return Err(abort_on_lapse(&mut state, err));
                }
                Some((_, err)) => tracing::warn!("ignored after earlier trigger: {}", err),
                None => {}
            }
            let event = TriggerEvent {
                endpoint: index,
                oid: state.endpoints[index].oid,
                trigger_reason: updates[i].1.trigger_reason,
                clock,
                host_time,
                generation: state.generation,
            };
            state.halt();
            state.endpoints[index].notified = true;
            let reason = state.dispatch_reason;
            state.broadcast_trigger(reason);
            state.trigger = Some(event);
            tracing::info!(
                oid = event.oid,
                trigger_reason = event.trigger_reason,
                host_time = event.host_time,
                "trigger dispatch fired"
            );
            outcomes[i] = StatusOutcome::Triggered(event);
            return Ok(outcomes);
        }
        if let Some((_, err)) = first_lapse {
            return Err(abort_on_lapse(&mut state, err));
        }
        for (i, index, clock) in pending_extend {
            let ep = &mut state.endpoints[index];
            if clock + ep.min_extend_ticks < ep.expire_clock {
                continue;
            }
            ep.expire_clock = clock + ep.expire_ticks;
            if let Err(e) = ep.send_set_timeout() {
                tracing::warn!(oid = ep.oid, "failed to extend trsync timeout: {}", e);
            }
            tracing::trace!(oid = ep.oid, expire_clock = ep.expire_clock, "trsync timeout extended");
            outcomes[i] = StatusOutcome::Extended {
                expire_clock: ep.expire_clock,
            };
        }
        Ok(outcomes)
    }
}

fn abort_on_lapse(state: &mut DispatchState, err: DispatchError) -> DispatchError {
    tracing::error!("{}", err);
    state.halt();
    state.broadcast_trigger(REASON_COMMS_TIMEOUT);
    err
}

/// One MCU's participation in a [`TrDispatch`].
#[derive(Debug, Clone)]
pub struct TrDispatchMcu {
    dispatch: TrDispatch,
    index: usize,
}

impl TrDispatchMcu {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn dispatch(&self) -> &TrDispatch {
        &self.dispatch
    }

    /// Message tag of the `trsync_state` responses routed to this endpoint.
    pub fn state_msgtag(&self) -> Result<u32, DispatchError> {
        Ok(self.dispatch.lock()?.endpoints[self.index].state_msgtag)
    }

    pub fn expire_clock(&self) -> Result<u64, DispatchError> {
        Ok(self.dispatch.lock()?.endpoints[self.index].expire_clock)
    }

    pub fn last_status_clock(&self) -> Result<u64, DispatchError> {
        Ok(self.dispatch.lock()?.endpoints[self.index].last_status_clock)
    }

    /// Load the clock window for the next dispatch. Only allowed while idle.
    pub fn setup(
        &self,
        last_status_clock: u64,
        expire_clock: u64,
        expire_ticks: u64,
        min_extend_ticks: u64,
        clock_est: ClockEstimate,
    ) -> Result<(), DispatchError> {
        let mut state = self.dispatch.lock()?;
        if state.is_active {
            return Err(DispatchError::AlreadyActive);
        }
        let ep = &mut state.endpoints[self.index];
        ep.last_status_clock = last_status_clock;
        ep.expire_clock = expire_clock;
        ep.expire_ticks = expire_ticks;
        ep.min_extend_ticks = min_extend_ticks;
        ep.clock_est = clock_est.observe(last_status_clock);
        Ok(())
    }

    /// Replace the clock estimate, e.g. after a clock sync update.
    pub fn update_clock_est(&self, clock_est: ClockEstimate) -> Result<(), DispatchError> {
        let mut state = self.dispatch.lock()?;
        let ep = &mut state.endpoints[self.index];
        ep.clock_est = clock_est.observe(ep.clock_est.last_clock);
        Ok(())
    }

    pub fn handle_trsync_state(&self, state: TrsyncState) -> Result<StatusOutcome, DispatchError> {
        let outcomes = self.dispatch.handle_trsync_batch(&[(self, state)])?;
        Ok(outcomes.into_iter().next().unwrap_or(StatusOutcome::Ignored))
    }
}
