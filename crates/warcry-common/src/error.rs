// error.rs — error taxonomy for the network core
//
// Configuration errors abort the session before the simulation starts and
// propagate out of the handshake. Wire errors are per-datagram; the engine
// logs and drops the offending datagram and keeps running.

use thiserror::Error;

use crate::proto::PROTOCOL_VERSION;

/// Malformed datagram. Never fatal in-game; the datagram is dropped.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("short buffer: need {need} bytes, got {got}")]
    Short { need: usize, got: usize },

    #[error("unknown opcode tag {0:#04x}")]
    UnknownOpcode(u8),

    #[error("protocol version {got}, expected {PROTOCOL_VERSION}")]
    BadVersion { got: i32 },
}

/// Session-level failure. Everything here is fatal and surfaces before the
/// game starts; past the handshake the engine recovers locally instead.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("incompatible network protocol version {got}, expected {want}")]
    VersionMismatch { got: i32, want: i32 },

    #[error("incompatible network lag {got}, expected {want}")]
    LagMismatch { got: i32, want: i32 },

    #[error("incompatible network updates {got}, expected {want}")]
    UpdatesMismatch { got: i32, want: i32 },

    #[error("not enough human player slots for {wanted} network players")]
    NotEnoughSlots { wanted: u8 },

    #[error("can't resolve host {0}")]
    UnresolvableHost(String),

    #[error("no free ports {first}-{second} available")]
    NoFreePort { first: u16, second: u16 },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),
}
