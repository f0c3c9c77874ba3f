//! Always Encrypted error types.

use thiserror::Error;

/// Errors from key loading, key unwrapping, and cell decryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The configured keystore could not be read.
    #[error("keystore error: {0}")]
    Keystore(String),

    /// The keystore auth mode has no implementation.
    #[error("keystore auth mode {0} is unimplemented")]
    Unimplemented(&'static str),

    /// The encrypted CEK envelope is malformed.
    #[error("invalid encrypted CEK: {0}")]
    InvalidCek(String),

    /// The configured certificate does not match the CEK's key path.
    #[error(
        "invalid certificate being used to decrypt: {key_path} requested but {fingerprint} provided"
    )]
    CertificateMismatch {
        /// Key path embedded in the CEK value.
        key_path: String,
        /// SHA-1 fingerprint of the configured certificate.
        fingerprint: String,
    },

    /// RSA unwrap of the CEK failed.
    #[error("CEK decryption failed: {0}")]
    CekDecryption(String),

    /// Cell encryption failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Cell decryption or MAC verification failed.
    #[error("decryption failed: {0}")]
    Decryption(String),
}
