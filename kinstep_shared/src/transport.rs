// src/transport.rs - Command queue interface towards an MCU
//! Fire-and-forget message submission.
//!
//! Framing, retransmission and flow control live in the serial layer; callers
//! only enqueue already-encoded command fields. Sending never blocks.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
}

/// Identifies one command queue on a serial connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CommandQueueId(pub u32);

/// One encoded command: message tag followed by its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub fields: Vec<u32>,
    /// Do not transmit before this MCU clock
    pub min_clock: u64,
    /// Clock by which the message is needed on the MCU
    pub req_clock: u64,
}

impl QueueMessage {
    pub fn new(fields: Vec<u32>) -> Self {
        Self {
            fields,
            min_clock: 0,
            req_clock: 0,
        }
    }

    pub fn with_req_clock(mut self, req_clock: u64) -> Self {
        self.req_clock = req_clock;
        self
    }

    pub fn msgtag(&self) -> Option<u32> {
        self.fields.first().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub cq: CommandQueueId,
    pub msg: QueueMessage,
}

pub trait SerialQueue: Send + Sync {
    /// Enqueue a message for transmission.
    fn send(&self, cq: CommandQueueId, msg: QueueMessage) -> Result<(), TransportError>;
}

impl SerialQueue for UnboundedSender<OutgoingMessage> {
    fn send(&self, cq: CommandQueueId, msg: QueueMessage) -> Result<(), TransportError> {
        UnboundedSender::send(self, OutgoingMessage { cq, msg }).map_err(|_| TransportError::Closed)
    }
}
