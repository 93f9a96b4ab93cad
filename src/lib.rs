//! kinstep: iterative step time generation, multi-MCU homing trigger
//! dispatch and USB hub port power control.
//!
//! The work lives in the member crates; this crate ties them together for
//! the integration tests and benchmarks.

pub use kinstep_host::{hardware, motion, trsync};
pub use kinstep_shared as shared;
pub use kinstep_simulator as simulator;
