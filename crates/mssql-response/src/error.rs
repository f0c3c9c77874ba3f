//! Response-runtime error types.

use mssql_ae::CryptoError;
use tds_tokens::{ProtocolError, ServerError};
use thiserror::Error;

/// Errors surfaced to the consumer of a response.
#[derive(Debug, Error)]
pub enum Error {
    /// Wire violation or transport failure. Fatal to the response; the
    /// connection should be closed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A SQL error reported by the server, taken from the terminal DONE's
    /// buffered ERROR tokens. Not fatal to the connection.
    #[error("{0}")]
    Server(ServerError),

    /// The server flagged an internal error via the DONE SRVERROR bit.
    #[error("SQL Server had internal error")]
    ServerInternal,

    /// The caller's cancellation took effect and the server confirmed it.
    #[error("operation was canceled")]
    Cancelled,

    /// The attention handshake never produced a confirmation; the session
    /// is unusable.
    #[error("did not get cancellation confirmation from the server")]
    NoCancelConfirmation,

    /// Key loading or cell decryption failed. Includes the fatal
    /// `Unimplemented` keystore auth mode.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// An output parameter could not be assigned. Non-fatal to parsing;
    /// delivered as a value on the token channel.
    #[error("output parameter {name}: {reason}")]
    Scan {
        /// Output parameter name, `@` already stripped.
        name: String,
        /// Why the assignment failed.
        reason: String,
    },
}

impl Error {
    /// Whether the connection must be discarded after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::NoCancelConfirmation | Self::Crypto(_)
        )
    }
}

/// Result alias for response operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_classes() {
        assert!(Error::Protocol(ProtocolError::UnexpectedEof).is_fatal());
        assert!(Error::NoCancelConfirmation.is_fatal());
        assert!(!Error::Cancelled.is_fatal());
        assert!(!Error::Server(ServerError::default()).is_fatal());
        assert!(
            !Error::Scan {
                name: "x".into(),
                reason: "null".into()
            }
            .is_fatal()
        );
    }
}
