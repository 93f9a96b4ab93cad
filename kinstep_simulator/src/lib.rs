//! Offline homing simulator: scenario files in, message log and trigger
//! report out.
pub mod scenario;
pub mod simulator;

pub use scenario::{load_scenario, Scenario, ScenarioError};
pub use simulator::{HomingSimulator, MessageRecord, SimError, SimReport};
