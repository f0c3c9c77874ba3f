//! Column Master Key stores.
//!
//! The only implemented store is a PKCS#12 (PFX) file holding the CMK's
//! RSA private key and certificate. The store is opened lazily, on the
//! first result set that carries encrypted columns, so a missing file or a
//! wrong secret surfaces as a decryption-time error rather than at
//! connection open.

use std::path::PathBuf;

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;

use crate::error::CryptoError;

/// How the keystore authenticates and what format it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeystoreAuth {
    /// PKCS#12 container on disk, opened with a secret.
    Pfx,
    /// Platform certificate store. Not implemented.
    CertificateStore,
    /// Azure Key Vault. Not implemented.
    AzureKeyVault,
}

impl KeystoreAuth {
    fn name(self) -> &'static str {
        match self {
            Self::Pfx => "PFX",
            Self::CertificateStore => "CERTIFICATE_STORE",
            Self::AzureKeyVault => "AZURE_KEY_VAULT",
        }
    }
}

/// Keystore location and credentials.
#[derive(Debug, Clone)]
pub struct KeystoreConfig {
    /// Path of the keystore file.
    pub location: PathBuf,
    /// Secret protecting the keystore.
    pub secret: String,
    /// Auth mode; only [`KeystoreAuth::Pfx`] is implemented.
    pub auth: KeystoreAuth,
}

impl KeystoreConfig {
    /// Configure a PFX keystore.
    pub fn pfx(location: impl Into<PathBuf>, secret: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            secret: secret.into(),
            auth: KeystoreAuth::Pfx,
        }
    }

    /// Open the store and extract the key material.
    pub fn load(&self) -> Result<KeyMaterial, CryptoError> {
        match self.auth {
            KeystoreAuth::Pfx => self.load_pfx(),
            other => Err(CryptoError::Unimplemented(other.name())),
        }
    }

    fn load_pfx(&self) -> Result<KeyMaterial, CryptoError> {
        let bytes = std::fs::read(&self.location).map_err(|e| {
            CryptoError::Keystore(format!("cannot read {}: {e}", self.location.display()))
        })?;
        let pfx = p12::PFX::parse(&bytes)
            .map_err(|e| CryptoError::Keystore(format!("PKCS#12 parse failed: {e:?}")))?;

        let key_der = pfx
            .key_bags(&self.secret)
            .map_err(|e| CryptoError::Keystore(format!("PKCS#12 key bags: {e:?}")))?
            .into_iter()
            .next()
            .ok_or_else(|| CryptoError::Keystore("PKCS#12 container holds no private key".into()))?;
        let certificate_der = pfx
            .cert_bags(&self.secret)
            .map_err(|e| CryptoError::Keystore(format!("PKCS#12 cert bags: {e:?}")))?
            .into_iter()
            .next()
            .ok_or_else(|| CryptoError::Keystore("PKCS#12 container holds no certificate".into()))?;

        let private_key = RsaPrivateKey::from_pkcs8_der(&key_der)
            .or_else(|_| RsaPrivateKey::from_pkcs1_der(&key_der))
            .map_err(|e| CryptoError::Keystore(format!("RSA private key parse failed: {e}")))?;

        tracing::debug!(
            path = %self.location.display(),
            "loaded column master key from PFX keystore"
        );

        Ok(KeyMaterial {
            private_key,
            certificate_der,
        })
    }
}

/// Key material extracted from a keystore.
#[derive(Clone)]
pub struct KeyMaterial {
    /// The Column Master Key's RSA private key.
    pub private_key: RsaPrivateKey,
    /// The CMK certificate, DER encoded; its SHA-1 fingerprint gates CEK
    /// decryption.
    pub certificate_der: Vec<u8>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("certificate_der_len", &self.certificate_der.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unimplemented_auth_modes_fail_loudly() {
        let config = KeystoreConfig {
            location: "/dev/null".into(),
            secret: String::new(),
            auth: KeystoreAuth::CertificateStore,
        };
        assert!(matches!(
            config.load(),
            Err(CryptoError::Unimplemented("CERTIFICATE_STORE"))
        ));

        let config = KeystoreConfig {
            auth: KeystoreAuth::AzureKeyVault,
            ..config
        };
        assert!(matches!(
            config.load(),
            Err(CryptoError::Unimplemented("AZURE_KEY_VAULT"))
        ));
    }

    #[test]
    fn missing_file_is_a_keystore_error() {
        let config = KeystoreConfig::pfx("/nonexistent/path/to/store.pfx", "secret");
        assert!(matches!(config.load(), Err(CryptoError::Keystore(_))));
    }

    #[test]
    fn garbage_file_fails_pkcs12_parse() {
        let path = std::env::temp_dir().join("mssql-ae-keystore-garbage.pfx");
        std::fs::write(&path, b"definitely not PKCS#12").expect("write temp file");
        let config = KeystoreConfig::pfx(&path, "secret");
        let result = config.load();
        let _ = std::fs::remove_file(&path);
        assert!(matches!(result, Err(CryptoError::Keystore(_))));
    }
}
