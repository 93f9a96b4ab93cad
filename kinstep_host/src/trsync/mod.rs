// src/trsync/mod.rs - Homing trigger synchronisation
pub mod trdispatch;

pub use trdispatch::{
    DispatchError, StatusOutcome, TrDispatch, TrDispatchMcu, TriggerEvent, TrsyncState, REASON_COMMS_TIMEOUT,
    REASON_ENDSTOP_HIT, REASON_HOST_REQUEST, REASON_PAST_END_TIME,
};

use kinstep_shared::clock::ClockEstimate;
use kinstep_shared::config::TrsyncConfig;

/// Clock window handed to [`TrDispatchMcu::setup`] for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrsyncWindow {
    pub last_status_clock: u64,
    pub expire_clock: u64,
    pub expire_ticks: u64,
    pub min_extend_ticks: u64,
}

impl TrsyncWindow {
    /// Window for a homing move starting at `print_time` across `mcu_count` MCUs.
    pub fn for_move(config: &TrsyncConfig, mcu_count: usize, print_time: f64, clock_est: &ClockEstimate) -> Self {
        let expire_ticks = clock_est.seconds_to_clock(config.expire_timeout(mcu_count));
        let min_extend_ticks = (expire_ticks as f64 * config.min_extend_fraction + 0.5) as u64;
        let last_status_clock = clock_est.clock_from_time(print_time);
        Self {
            last_status_clock,
            expire_clock: last_status_clock + expire_ticks,
            expire_ticks,
            min_extend_ticks,
        }
    }

    pub fn apply(&self, tdm: &TrDispatchMcu, clock_est: ClockEstimate) -> Result<(), DispatchError> {
        tdm.setup(
            self.last_status_clock,
            self.expire_clock,
            self.expire_ticks,
            self.min_extend_ticks,
            clock_est,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_mcu_gets_longer_window() {
        let config = TrsyncConfig::default();
        let ce = ClockEstimate::from_frequency(1_000_000.0);
        let multi = TrsyncWindow::for_move(&config, 2, 1.0, &ce);
        assert_eq!(multi.expire_ticks, 25_000);
        assert_eq!(multi.min_extend_ticks, 10_000);
        assert_eq!(multi.last_status_clock, 1_000_000);
        assert_eq!(multi.expire_clock, 1_025_000);
        let single = TrsyncWindow::for_move(&config, 1, 1.0, &ce);
        assert_eq!(single.expire_ticks, 250_000);
    }
}
