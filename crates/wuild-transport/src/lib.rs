//! # Wuild Transport
//!
//! The framed RPC transport: bidirectional ordered delivery of typed
//! frames over a single TCP connection, with back-pressure
//! (acknowledged byte windows), heartbeats (line tests), a
//! connection-options handshake and request/reply correlation.
//!
//! The channel is a stream of *segments*: a one-byte type, then for
//! user-range types (>= 0x10) a four-byte payload length and the payload.
//! Service segments (`Ack`, `LineTest`, `ConnOptions`) have fixed
//! payloads and never carry a frame header. One frame may span many
//! segments; acknowledgements may interleave between them.
//!
//! [`FrameHandler`] drives one connection from a spawned worker task;
//! [`FrameService`] accepts connections and hands each one to an
//! accepted-mode handler tagged with a process-monotonic owner id.

use thiserror::Error;

mod assembler;
mod handler;
mod service;
mod settings;

pub use assembler::{SegmentAssembler, SegmentEvent};
pub use handler::{
    typed_reader, FrameHandler, FrameReader, OutputSender, ReplyNotifier, ReplyOutcome,
};
pub use service::{FrameService, ServiceHooks};
pub use settings::FrameHandlerSettings;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport errors. Connection-level failures are local to one handler.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection error: {message}")]
    ConnectionError { message: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("acknowledge not received within the configured timeout")]
    AcknowledgeTimeout,

    #[error("malformed input: {message}")]
    Malformed { message: String },

    #[error("handler is not running")]
    NotRunning,

    #[error("request failed: {0:?}")]
    RequestFailed(RequestFailure),

    #[error("frame reader registration error: {message}")]
    ReaderRegistration { message: String },
}

/// Why a correlated request did not produce a decoded reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFailure {
    Timeout,
    Error,
    Decode,
}

impl TransportError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }
}
