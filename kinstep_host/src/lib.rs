// kinstep_host: step generation, homing trigger dispatch and hub control
pub mod hardware;
pub mod motion;
pub mod trsync;
