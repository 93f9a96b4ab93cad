// kinstep_shared: motion queue, clock and transport types shared by host and simulator

pub mod clock;
pub mod config;
pub mod transport;
pub mod trapq;

pub use clock::ClockEstimate;
pub use transport::{CommandQueueId, OutgoingMessage, QueueMessage, SerialQueue, TransportError};
pub use trapq::{Axis, Coord, Move, MoveCursor, MovePhase, SharedTrapQueue, TrapQueue};
