//! Encrypted-CEK envelope parsing and RSA-OAEP unwrapping.
//!
//! The certificate-store provider wraps a Column Encryption Key as:
//!
//! ```text
//! version (1) | key_path_len (2, LE) | ciphertext_len (2, LE)
//! | key_path (UTF-16LE, key_path_len bytes)
//! | ciphertext (ciphertext_len bytes)
//! | signature (remainder)
//! ```
//!
//! The key path embeds the SHA-1 thumbprint of the Column Master Key
//! certificate, which lets the client check it is holding the right key
//! before attempting the unwrap.

use rsa::{Oaep, RsaPrivateKey};
use sha1::{Digest, Sha1};

use crate::error::CryptoError;

/// Version byte of the encrypted-CEK envelope.
const CEK_VERSION_BYTE: u8 = 0x01;

/// A parsed encrypted-CEK envelope.
#[derive(Debug, Clone)]
pub struct EncryptedCek {
    /// Column Master Key path, thumbprint included.
    pub key_path: String,
    /// RSA-wrapped CEK.
    pub ciphertext: Vec<u8>,
    /// Trailing signature over the envelope. Not verified here; the
    /// certificate check below is what gates decryption.
    pub signature: Vec<u8>,
}

impl EncryptedCek {
    /// Parse an envelope, validating every length against the blob before
    /// slicing.
    pub fn parse(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() < 5 {
            return Err(CryptoError::InvalidCek("encrypted CEK too short".into()));
        }
        if data[0] != CEK_VERSION_BYTE {
            return Err(CryptoError::InvalidCek(format!(
                "invalid version: expected {CEK_VERSION_BYTE:#04x}, got {:#04x}",
                data[0]
            )));
        }

        let key_path_len = u16::from_le_bytes([data[1], data[2]]) as usize;
        let ciphertext_len = u16::from_le_bytes([data[3], data[4]]) as usize;

        let key_path_end = 5usize
            .checked_add(key_path_len)
            .ok_or_else(|| CryptoError::InvalidCek("key path length overflows".into()))?;
        let ciphertext_end = key_path_end
            .checked_add(ciphertext_len)
            .ok_or_else(|| CryptoError::InvalidCek("ciphertext length overflows".into()))?;
        if data.len() < ciphertext_end {
            return Err(CryptoError::InvalidCek(format!(
                "envelope of {} bytes cannot hold key path {key_path_len} + ciphertext {ciphertext_len}",
                data.len()
            )));
        }

        let key_path = decode_utf16le(&data[5..key_path_end])
            .ok_or_else(|| CryptoError::InvalidCek("key path is not valid UTF-16".into()))?;
        let ciphertext = data[key_path_end..ciphertext_end].to_vec();
        let signature = data[ciphertext_end..].to_vec();

        Ok(Self {
            key_path,
            ciphertext,
            signature,
        })
    }

    /// Check that the DER certificate matches the thumbprint embedded in
    /// the key path.
    #[must_use]
    pub fn verify_certificate(&self, certificate_der: &[u8]) -> bool {
        let fingerprint = sha1_hex(certificate_der);
        self.key_path.to_lowercase().contains(&fingerprint)
    }

    /// Unwrap the CEK with the Column Master Key's RSA private key.
    ///
    /// RSA-OAEP with SHA-1, as used by the certificate-store provider.
    pub fn decrypt(&self, private_key: &RsaPrivateKey) -> Result<Vec<u8>, CryptoError> {
        let padding = Oaep::new::<Sha1>();
        private_key
            .decrypt(padding, &self.ciphertext)
            .map_err(|e| CryptoError::CekDecryption(format!("RSA-OAEP failed: {e}")))
    }
}

/// Lowercase hex SHA-1 of a DER certificate.
#[must_use]
pub fn sha1_hex(der: &[u8]) -> String {
    let digest = Sha1::digest(der);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn decode_utf16le(data: &[u8]) -> Option<String> {
    if data.len() % 2 != 0 {
        return None;
    }
    let chars: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&chars).ok()
}

/// Build an envelope. Shared by the tests here and by the integration
/// suites that synthesize server responses.
#[must_use]
pub fn encode_envelope(key_path: &str, ciphertext: &[u8], signature: &[u8]) -> Vec<u8> {
    let key_path_utf16: Vec<u8> = key_path.encode_utf16().flat_map(u16::to_le_bytes).collect();
    let mut out = Vec::with_capacity(5 + key_path_utf16.len() + ciphertext.len() + signature.len());
    out.push(CEK_VERSION_BYTE);
    out.extend_from_slice(&(key_path_utf16.len() as u16).to_le_bytes());
    out.extend_from_slice(&(ciphertext.len() as u16).to_le_bytes());
    out.extend_from_slice(&key_path_utf16);
    out.extend_from_slice(ciphertext);
    out.extend_from_slice(signature);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let encoded = encode_envelope("CurrentUser/My/ab12cd", &[0xAA, 0xBB], &[0x01; 4]);
        let cek = EncryptedCek::parse(&encoded).unwrap();
        assert_eq!(cek.key_path, "CurrentUser/My/ab12cd");
        assert_eq!(cek.ciphertext, vec![0xAA, 0xBB]);
        assert_eq!(cek.signature, vec![0x01; 4]);
    }

    #[test]
    fn rejects_bad_version() {
        let mut encoded = encode_envelope("p", &[0x00], &[]);
        encoded[0] = 0x02;
        assert!(matches!(
            EncryptedCek::parse(&encoded),
            Err(CryptoError::InvalidCek(_))
        ));
    }

    #[test]
    fn rejects_truncated_envelope() {
        let encoded = encode_envelope("path", &[0xAA; 16], &[]);
        assert!(EncryptedCek::parse(&encoded[..8]).is_err());
        assert!(EncryptedCek::parse(&[0x01, 0x00]).is_err());
    }

    #[test]
    fn certificate_fingerprint_match() {
        let cert_der = b"not really a certificate";
        let fingerprint = sha1_hex(cert_der);
        let path = format!("CurrentUser/My/{}", fingerprint.to_uppercase());

        let encoded = encode_envelope(&path, &[0x00], &[]);
        let cek = EncryptedCek::parse(&encoded).unwrap();
        assert!(cek.verify_certificate(cert_der));
        assert!(!cek.verify_certificate(b"a different certificate"));
    }

    #[test]
    fn rsa_unwrap_roundtrip() {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_key = private_key.to_public_key();

        let root_key = [0x42u8; 32];
        let wrapped = public_key
            .encrypt(&mut rng, Oaep::new::<Sha1>(), &root_key)
            .unwrap();

        let encoded = encode_envelope("CurrentUser/My/test", &wrapped, &[]);
        let cek = EncryptedCek::parse(&encoded).unwrap();
        assert_eq!(cek.decrypt(&private_key).unwrap(), root_key);
    }
}
