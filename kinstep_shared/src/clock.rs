// src/clock.rs - MCU clock correlation
//! Mapping between an MCU's tick counter and host time.
//!
//! A [`ClockEstimate`] is a plain value: the clock sync layer produces a new
//! one whenever it refines its regression, and consumers replace their copy.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockEstimate {
    /// Most recent 64-bit clock seen from the MCU (used to extend 32-bit clocks)
    pub last_clock: u64,
    pub conv_clock: u64,
    pub conv_time: f64,
    pub est_freq: f64,
}

impl ClockEstimate {
    pub fn new(conv_clock: u64, conv_time: f64, est_freq: f64) -> Self {
        Self {
            last_clock: conv_clock,
            conv_clock,
            conv_time,
            est_freq,
        }
    }

    /// Clock that reads zero at host time zero.
    pub fn from_frequency(est_freq: f64) -> Self {
        Self::new(0, 0.0, est_freq)
    }

    pub fn clock_to_time(&self, clock: u64) -> f64 {
        let delta = clock.wrapping_sub(self.conv_clock) as i64;
        delta as f64 / self.est_freq + self.conv_time
    }

    pub fn clock_from_time(&self, time: f64) -> u64 {
        let delta = ((time - self.conv_time) * self.est_freq + 0.5).floor() as i64;
        self.conv_clock.wrapping_add_signed(delta)
    }

    /// Extend a 32-bit clock reported by the MCU using the last known clock.
    pub fn clock_from_clock32(&self, clock32: u32) -> u64 {
        let delta = clock32.wrapping_sub(self.last_clock as u32) as i32;
        self.last_clock.wrapping_add_signed(delta as i64)
    }

    pub fn seconds_to_clock(&self, seconds: f64) -> u64 {
        (seconds * self.est_freq).max(0.0) as u64
    }

    /// Copy of this estimate that has seen `clock`.
    pub fn observe(self, clock: u64) -> Self {
        Self {
            last_clock: self.last_clock.max(clock),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_between_clock_and_time() {
        let ce = ClockEstimate::new(1_000_000, 10.0, 1_000_000.0);
        assert_eq!(ce.clock_to_time(1_500_000), 10.5);
        assert_eq!(ce.clock_to_time(500_000), 9.5);
        assert_eq!(ce.clock_from_time(10.25), 1_250_000);
        assert_eq!(ce.seconds_to_clock(0.025), 25_000);
    }

    #[test]
    fn extends_32bit_clock_across_wrap() {
        let ce = ClockEstimate::new(0, 0.0, 1.0e6).observe(0x1_FFFF_FF00);
        assert_eq!(ce.clock_from_clock32(0x0000_0010), 0x2_0000_0010);
        assert_eq!(ce.clock_from_clock32(0xFFFF_FE00), 0x1_FFFF_FE00);
    }

    #[test]
    fn observe_never_moves_backwards() {
        let ce = ClockEstimate::from_frequency(1.0).observe(100).observe(50);
        assert_eq!(ce.last_clock, 100);
    }
}
