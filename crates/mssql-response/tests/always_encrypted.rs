//! End-to-end Always Encrypted row decryption: a synthetic response with a
//! CEK table and an encrypted INT4 column, decrypted through the full
//! reader path for both encryption types.

mod common;

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use mssql_response::{Error, KeyMaterial, Outputs, Session, SqlValue, Token, read_response};
use mssql_ae::{AeadCipher, EncryptionKind, key_unwrap, sha1_hex};
use rsa::{Oaep, RsaPrivateKey};
use sha1::Sha1;
use tds_tokens::{
    BytesSource, COLUMN_FLAG_ENCRYPTED, COLUMN_FLAG_NULLABLE, DoneStatus, TokenType, TypeId, codec,
};
use tokio::sync::{Mutex, mpsc};

use common::done;

struct Fixture {
    session: Arc<Session>,
    cipher: AeadCipher,
    colmetadata: Vec<u8>,
}

/// Build a session holding a generated CMK and the COLMETADATA bytes of a
/// result set with one encrypted INT4 column named "secret".
fn fixture(encryption_type: u8) -> Fixture {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("generate CMK");
    let public_key = private_key.to_public_key();

    let certificate_der = b"synthetic column master key certificate".to_vec();
    let key_path = format!("CurrentUser/My/{}", sha1_hex(&certificate_der));

    let root_key = [0x5Au8; 32];
    let wrapped_key = public_key
        .encrypt(&mut rng, Oaep::new::<Sha1>(), &root_key)
        .expect("wrap CEK");
    let envelope = key_unwrap::encode_envelope(&key_path, &wrapped_key, &[]);

    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::ColMetaData as u8);
    buf.put_u16_le(1); // one column

    // CEK table: one entry, one value.
    buf.put_u16_le(1);
    buf.put_i32_le(1); // database id
    buf.put_i32_le(1); // cek id
    buf.put_i32_le(1); // cek version; doubles as the AEAD version byte
    buf.put_slice(&[0u8; 8]); // md version
    buf.put_u8(1); // value count
    buf.put_u16_le(envelope.len() as u16);
    buf.put_slice(&envelope);
    codec::write_b_varchar(&mut buf, "MSSQL_CERTIFICATE_STORE");
    codec::write_us_varchar(&mut buf, &key_path);
    codec::write_b_varchar(&mut buf, "RSA_OAEP");

    // Column: ciphertext arrives as varbinary, plaintext is INT4.
    buf.put_u32_le(0); // user type
    buf.put_u16_le(COLUMN_FLAG_ENCRYPTED | COLUMN_FLAG_NULLABLE);
    buf.put_u8(TypeId::BigVarBinary as u8);
    buf.put_u16_le(8000); // max length
    // crypto metadata
    buf.put_u16_le(0); // CEK ordinal
    buf.put_u32_le(0); // plaintext user type
    buf.put_u8(TypeId::Int4 as u8);
    buf.put_u8(2); // AEAD_AES_256_CBC_HMAC_SHA256
    buf.put_u8(encryption_type);
    buf.put_u8(1); // normalization rule version
    codec::write_b_varchar(&mut buf, "secret");

    Fixture {
        session: Arc::new(Session::with_key_material(KeyMaterial {
            private_key,
            certificate_der,
        })),
        cipher: AeadCipher::with_version(&root_key, 1).expect("derive keys"),
        colmetadata: buf.to_vec(),
    }
}

fn encrypted_row(cipher: &AeadCipher, kind: EncryptionKind, plaintext: i32) -> Vec<u8> {
    let ciphertext = cipher
        .encrypt(&plaintext.to_le_bytes(), kind)
        .expect("encrypt cell");
    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::Row as u8);
    buf.put_u16_le(ciphertext.len() as u16);
    buf.put_slice(&ciphertext);
    buf.to_vec()
}

async fn collect(session: &Arc<Session>, bytes: Vec<u8>) -> Vec<Result<Token, Error>> {
    let source = Arc::new(Mutex::new(BytesSource::new(bytes)));
    let (tx, mut rx) = mpsc::channel(5);
    tokio::spawn(read_response(
        source,
        Arc::clone(session),
        Outputs::none(),
        tx,
    ));
    let mut items = Vec::new();
    while let Some(item) = rx.recv().await {
        items.push(item);
    }
    items
}

async fn roundtrip(encryption_type: u8, kind: EncryptionKind) {
    let fx = fixture(encryption_type);
    let mut bytes = fx.colmetadata.clone();
    bytes.extend_from_slice(&encrypted_row(&fx.cipher, kind, 42));
    bytes.extend_from_slice(&done(DoneStatus::FINAL, 0));

    let items = collect(&fx.session, bytes).await;
    assert_eq!(items.len(), 3);
    match items[0].as_ref().unwrap() {
        Token::Columns(cols) => {
            assert!(cols[0].is_encrypted());
            assert!(cols[0].crypto.is_some());
        }
        other => panic!("expected Columns, got {other:?}"),
    }
    match items[1].as_ref().unwrap() {
        Token::Row(row) => assert_eq!(row, &vec![SqlValue::Int(42)]),
        other => panic!("expected decrypted Row, got {other:?}"),
    }
}

#[tokio::test]
async fn deterministic_roundtrip() {
    roundtrip(1, EncryptionKind::Deterministic).await;
}

#[tokio::test]
async fn randomized_roundtrip() {
    roundtrip(2, EncryptionKind::Randomized).await;
}

#[tokio::test]
async fn null_encrypted_cell_skips_decryption() {
    let fx = fixture(1);
    let mut bytes = fx.colmetadata.clone();
    // NBCROW with the single column marked null.
    bytes.push(TokenType::NbcRow as u8);
    bytes.push(0x01);
    bytes.extend_from_slice(&done(DoneStatus::FINAL, 0));

    let items = collect(&fx.session, bytes).await;
    match items[1].as_ref().unwrap() {
        Token::Row(row) => assert_eq!(row, &vec![SqlValue::Null]),
        other => panic!("expected Row, got {other:?}"),
    }
}

#[tokio::test]
async fn wrong_certificate_is_rejected() {
    let fx = fixture(1);
    let mut bytes = fx.colmetadata.clone();
    bytes.extend_from_slice(&encrypted_row(&fx.cipher, EncryptionKind::Deterministic, 42));
    bytes.extend_from_slice(&done(DoneStatus::FINAL, 0));

    // Same response, but a session whose certificate does not match the
    // fingerprint in the CEK's key path.
    let mut rng = rand::thread_rng();
    let other_session = Arc::new(Session::with_key_material(KeyMaterial {
        private_key: RsaPrivateKey::new(&mut rng, 2048).expect("generate key"),
        certificate_der: b"a different certificate".to_vec(),
    }));

    let items = collect(&other_session, bytes).await;
    // Columns still decode; the row fails at decryption.
    assert!(matches!(items[0].as_ref().unwrap(), Token::Columns(_)));
    assert!(matches!(
        items[1],
        Err(Error::Crypto(mssql_ae::CryptoError::CertificateMismatch { .. }))
    ));
}

#[tokio::test]
async fn tampered_ciphertext_fails_mac() {
    let fx = fixture(2);
    let mut row = encrypted_row(&fx.cipher, EncryptionKind::Randomized, 42);
    let last = row.len() - 1;
    row[last] ^= 0xFF;

    let mut bytes = fx.colmetadata.clone();
    bytes.extend_from_slice(&row);
    bytes.extend_from_slice(&done(DoneStatus::FINAL, 0));

    let items = collect(&fx.session, bytes).await;
    assert!(matches!(items[1], Err(Error::Crypto(_))));
}
