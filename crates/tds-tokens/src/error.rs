//! Protocol-level error types.

use thiserror::Error;

/// Errors raised while decoding the token stream.
///
/// Every variant other than [`ProtocolError::Io`] indicates a wire violation:
/// the response cannot be trusted past the point of failure and the
/// connection should be closed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The byte stream violated the TDS token grammar.
    #[error("bad stream: {0}")]
    BadStream(String),

    /// A bounded read ran out of bytes before the structure was complete.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// A token tag that the dispatcher does not recognize. Token lengths are
    /// not self-describing for every tag, so an unknown token is fatal.
    #[error("unknown token type 0x{0:02X}")]
    UnknownToken(u8),

    /// An unexpected packet type header on a server response.
    #[error("unexpected packet type 0x{0:02X}")]
    UnexpectedPacketType(u8),

    /// UCS-2 payload that does not decode as UTF-16.
    #[error("invalid string encoding: {0}")]
    StringEncoding(String),

    /// Transport failure underneath the packet framing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Shorthand for a [`ProtocolError::BadStream`] with a formatted message.
    pub fn bad_stream(msg: impl Into<String>) -> Self {
        Self::BadStream(msg.into())
    }
}
