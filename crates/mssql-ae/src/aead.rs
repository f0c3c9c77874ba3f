//! AEAD_AES_256_CBC_HMAC_SHA256 cell encryption.
//!
//! SQL Server's Always Encrypted cells use an Encrypt-then-MAC scheme:
//! three sub-keys are derived from the Column Encryption Key with
//! HMAC-SHA256 and fixed labels, the plaintext is AES-256-CBC encrypted
//! with PKCS#7 padding, and an HMAC-SHA256 tag covers the version byte, IV
//! and ciphertext.
//!
//! Ciphertext layout:
//!
//! ```text
//! version (1) | MAC (32) | IV (16) | AES-256-CBC ciphertext (>= 16)
//! ```
//!
//! The version byte is normally `0x01`, but the column decryption path
//! feeds the CEK version from the key table, so it is a constructor
//! parameter here.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::CryptoError;

/// AES block size in bytes.
const AES_BLOCK_SIZE: usize = 16;

/// AES-256 key size in bytes.
const AES_KEY_SIZE: usize = 32;

/// HMAC-SHA256 output size in bytes.
const MAC_SIZE: usize = 32;

/// IV size in bytes.
const IV_SIZE: usize = 16;

/// Minimum ciphertext size: version + MAC + IV + one AES block.
const MIN_CIPHERTEXT_SIZE: usize = 1 + MAC_SIZE + IV_SIZE + AES_BLOCK_SIZE;

/// Key derivation labels fixed by the algorithm.
const ENCRYPTION_KEY_LABEL: &[u8] = b"Microsoft SQL Server cell encryption key";
const MAC_KEY_LABEL: &[u8] = b"Microsoft SQL Server cell MAC key";
const IV_KEY_LABEL: &[u8] = b"Microsoft SQL Server cell IV key";

/// Algorithm name mixed into key derivation.
const ALGORITHM_NAME: &[u8] = b"AEAD_AES_256_CBC_HMAC_SHA_256";

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Deterministic or randomized cell encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionKind {
    /// Same plaintext, same ciphertext; the IV is derived from the
    /// plaintext.
    Deterministic,
    /// Fresh random IV for every encryption.
    Randomized,
}

impl EncryptionKind {
    /// Map the wire encryption-type byte.
    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Deterministic),
            2 => Some(Self::Randomized),
            _ => None,
        }
    }
}

/// Keys derived from a Column Encryption Key.
struct DerivedKeys {
    enc_key: [u8; AES_KEY_SIZE],
    mac_key: [u8; AES_KEY_SIZE],
    iv_key: [u8; AES_KEY_SIZE],
}

impl DerivedKeys {
    fn derive(cek: &[u8]) -> Result<Self, CryptoError> {
        if cek.len() != AES_KEY_SIZE {
            return Err(CryptoError::Encryption(format!(
                "CEK must be {AES_KEY_SIZE} bytes, got {}",
                cek.len()
            )));
        }
        let cek_length = (cek.len() as u16).to_le_bytes();
        Ok(Self {
            enc_key: Self::derive_key(cek, ENCRYPTION_KEY_LABEL, &cek_length)?,
            mac_key: Self::derive_key(cek, MAC_KEY_LABEL, &cek_length)?,
            iv_key: Self::derive_key(cek, IV_KEY_LABEL, &cek_length)?,
        })
    }

    fn derive_key(
        cek: &[u8],
        label: &[u8],
        cek_length: &[u8],
    ) -> Result<[u8; AES_KEY_SIZE], CryptoError> {
        let mut mac = HmacSha256::new_from_slice(cek)
            .map_err(|e| CryptoError::Encryption(format!("HMAC init failed: {e}")))?;
        mac.update(label);
        mac.update(ALGORITHM_NAME);
        mac.update(cek_length);

        let result = mac.finalize().into_bytes();
        let mut key = [0u8; AES_KEY_SIZE];
        key.copy_from_slice(&result);
        Ok(key)
    }

    fn generate_iv(
        &self,
        kind: EncryptionKind,
        plaintext: &[u8],
    ) -> Result<[u8; IV_SIZE], CryptoError> {
        match kind {
            EncryptionKind::Randomized => {
                let mut iv = [0u8; IV_SIZE];
                rand::thread_rng().fill_bytes(&mut iv);
                Ok(iv)
            }
            EncryptionKind::Deterministic => {
                let mut mac = HmacSha256::new_from_slice(&self.iv_key)
                    .map_err(|e| CryptoError::Encryption(format!("HMAC init failed: {e}")))?;
                mac.update(plaintext);
                let result = mac.finalize().into_bytes();
                let mut iv = [0u8; IV_SIZE];
                iv.copy_from_slice(&result[..IV_SIZE]);
                Ok(iv)
            }
        }
    }
}

impl Drop for DerivedKeys {
    fn drop(&mut self) {
        self.enc_key.fill(0);
        self.mac_key.fill(0);
        self.iv_key.fill(0);
    }
}

/// Cell cipher for one Column Encryption Key.
pub struct AeadCipher {
    keys: DerivedKeys,
    version: u8,
}

impl AeadCipher {
    /// Create a cipher with the standard version byte `0x01`.
    pub fn new(cek: &[u8]) -> Result<Self, CryptoError> {
        Self::with_version(cek, 0x01)
    }

    /// Create a cipher with an explicit algorithm version byte. The column
    /// path uses the CEK version from the key table.
    pub fn with_version(cek: &[u8], version: u8) -> Result<Self, CryptoError> {
        Ok(Self {
            keys: DerivedKeys::derive(cek)?,
            version,
        })
    }

    /// Encrypt a cell. Used to round-trip-test decryption and to encrypt
    /// parameter values.
    pub fn encrypt(&self, plaintext: &[u8], kind: EncryptionKind) -> Result<Vec<u8>, CryptoError> {
        let iv = self.keys.generate_iv(kind, plaintext)?;

        let padded_len = (plaintext.len() / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE;
        let mut cipher_buf = vec![0u8; padded_len];
        cipher_buf[..plaintext.len()].copy_from_slice(plaintext);

        let cipher = Aes256CbcEnc::new_from_slices(&self.keys.enc_key, &iv)
            .map_err(|e| CryptoError::Encryption(format!("AES init failed: {e}")))?;
        let ciphertext = cipher
            .encrypt_padded_mut::<Pkcs7>(&mut cipher_buf, plaintext.len())
            .map_err(|e| CryptoError::Encryption(format!("AES encryption failed: {e}")))?;

        let mac = self.compute_mac(&iv, ciphertext)?;

        let mut output = Vec::with_capacity(1 + MAC_SIZE + IV_SIZE + ciphertext.len());
        output.push(self.version);
        output.extend_from_slice(&mac);
        output.extend_from_slice(&iv);
        output.extend_from_slice(ciphertext);
        Ok(output)
    }

    /// Decrypt a cell, verifying the version byte and the MAC.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < MIN_CIPHERTEXT_SIZE {
            return Err(CryptoError::Decryption(format!(
                "ciphertext too short: {} bytes, minimum {MIN_CIPHERTEXT_SIZE}",
                ciphertext.len()
            )));
        }
        if ciphertext[0] != self.version {
            return Err(CryptoError::Decryption(format!(
                "invalid version byte: expected {:#04x}, got {:#04x}",
                self.version, ciphertext[0]
            )));
        }

        let stored_mac = &ciphertext[1..1 + MAC_SIZE];
        let iv = &ciphertext[1 + MAC_SIZE..1 + MAC_SIZE + IV_SIZE];
        let encrypted = &ciphertext[1 + MAC_SIZE + IV_SIZE..];

        let computed_mac = self.compute_mac(iv, encrypted)?;
        if !constant_time_compare(stored_mac, &computed_mac) {
            return Err(CryptoError::Decryption(
                "MAC verification failed: data may be tampered".into(),
            ));
        }

        let cipher = Aes256CbcDec::new_from_slices(&self.keys.enc_key, iv)
            .map_err(|e| CryptoError::Decryption(format!("AES init failed: {e}")))?;
        let mut buf = encrypted.to_vec();
        let plaintext = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|e| CryptoError::Decryption(format!("AES decryption failed: {e}")))?;
        Ok(plaintext.to_vec())
    }

    /// MAC = HMAC-SHA256(mac_key, version | IV | ciphertext | version_length).
    fn compute_mac(&self, iv: &[u8], ciphertext: &[u8]) -> Result<[u8; MAC_SIZE], CryptoError> {
        let mut mac = HmacSha256::new_from_slice(&self.keys.mac_key)
            .map_err(|e| CryptoError::Encryption(format!("HMAC init failed: {e}")))?;
        mac.update(&[self.version]);
        mac.update(iv);
        mac.update(ciphertext);
        mac.update(&[1u8]); // version_length

        let result = mac.finalize().into_bytes();
        let mut output = [0u8; MAC_SIZE];
        output.copy_from_slice(&result);
        Ok(output)
    }
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
