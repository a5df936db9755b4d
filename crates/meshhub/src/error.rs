//! # Error Definitions
//!
//! Every failure the hub reports, from framing up to remote execution.

use crate::packet::HubId;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A peer broke the protocol: unexpected packet, bad state, unknown tag.
    Protocol(String),
    /// The connection could not be established or was lost.
    Connection(String),
    /// A bounded wait expired. Names the wait.
    Timeout(&'static str),
    /// The remote evaluation failed. Carries only the remote message.
    RemoteExecution(String),
    /// An outbound packet exceeded the 16-bit frame limit. Nothing was written.
    PacketTooLarge(usize),
    UnknownHub(HubId),
    UnknownInterface(String),
    /// The target hub left the mesh while a call was outstanding.
    HubUnavailable(HubId),
    /// A remote stream handle already has an operation in flight.
    StreamBusy,
    Io(String),
    Call(meshcall::Error),
    Pack(meshpack::Error),
    /// The connection or hub has shut down.
    Closed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Self::Connection(msg) => write!(f, "Connection error: {}", msg),
            Self::Timeout(what) => write!(f, "Timed out waiting for {}", what),
            Self::RemoteExecution(msg) => write!(f, "Remote execution failed: {}", msg),
            Self::PacketTooLarge(n) => write!(f, "Packet of {} bytes exceeds the frame limit", n),
            Self::UnknownHub(id) => write!(f, "Unknown hub {}", id),
            Self::UnknownInterface(name) => write!(f, "Unknown interface {}", name),
            Self::HubUnavailable(id) => write!(f, "Hub {} became unavailable", id),
            Self::StreamBusy => write!(f, "Stream already has an operation in flight"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::Call(e) => write!(f, "{}", e),
            Self::Pack(e) => write!(f, "Malformed packet: {}", e),
            Self::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<meshcall::Error> for Error {
    fn from(e: meshcall::Error) -> Self {
        Self::Call(e)
    }
}

impl From<meshpack::Error> for Error {
    fn from(e: meshpack::Error) -> Self {
        Self::Pack(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
