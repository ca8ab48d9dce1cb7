//! Error types for the ECMG <-> SCS protocol.

use thiserror::Error;

/// Protocol-level errors that can occur while encoding or decoding messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The protocol version byte does not match the negotiated version.
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// Message type is unknown or unsupported.
    #[error("Unknown message type: 0x{0:04X}")]
    UnknownMessageType(u16),

    /// Message body is larger than the allowed maximum.
    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    /// Message or parameter body is shorter than declared.
    #[error("Incomplete message: expected {expected} bytes, got {actual}")]
    Incomplete { expected: usize, actual: usize },

    /// A mandatory parameter is missing from the message.
    #[error("Missing parameter 0x{0:04X} in {1}")]
    MissingParameter(u16, &'static str),

    /// A parameter has an unexpected length.
    #[error("Invalid length {got} for parameter 0x{param:04X}")]
    InvalidParameterLength { param: u16, got: usize },

    /// The peer reported an error_status in a channel_error or stream_error.
    #[error("Peer error: status 0x{0:04X}")]
    PeerError(u16),
}
