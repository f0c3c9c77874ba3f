//! The response reader task.
//!
//! One task per server response: it owns the packet source for the
//! duration of the response, parses tokens in wire order, applies
//! ENVCHANGE side effects synchronously, decrypts encrypted cells, and
//! pushes tokens into a bounded channel. Parse failures are published as
//! `Err` values on the same channel; the channel closing is the
//! end-of-response signal.

use std::sync::Arc;

use mssql_ae::{AeadCipher, EncryptedCek, sha1_hex};
use tds_tokens::{
    BytesSource, ColMetaData, Column, Done, FeatureExtAck, FedAuthInfo, LoginAck, Order,
    PacketType, ProtocolError, ResponseSource, ReturnValue, ServerError, SqlValue, Token,
    TokenType, decode_nbc_row, decode_return_status, decode_row, decode_sspi,
};
use tokio::sync::{Mutex, mpsc};

use crate::error::{Error, Result};
use crate::outputs::Outputs;
use crate::session::Session;

/// Capacity of the token channel between reader and consumer.
pub(crate) const TOKEN_CHANNEL_CAPACITY: usize = 5;

/// Read one server response, pushing tokens into `tx`.
///
/// The source lock is held for the whole response, which is what makes a
/// second reader (spawned for the cancellation drain) wait until this one
/// finishes. Dropping `tx` closes the channel.
pub async fn read_response<S>(
    source: Arc<Mutex<S>>,
    session: Arc<Session>,
    outputs: Outputs,
    tx: mpsc::Sender<std::result::Result<Token, Error>>,
) where
    S: ResponseSource + 'static,
{
    let mut guard = source.lock().await;
    if let Err(err) = run(&mut *guard, &session, &outputs, &tx).await {
        tracing::debug!(error = %err, "response reader aborted");
        let _ = tx.send(Err(err)).await;
    }
}

async fn run<S>(
    src: &mut S,
    session: &Session,
    outputs: &Outputs,
    tx: &mpsc::Sender<std::result::Result<Token, Error>>,
) -> Result<()>
where
    S: ResponseSource + ?Sized,
{
    let packet_type = src.begin_read().await?;
    if packet_type != PacketType::TabularResult {
        return Err(ProtocolError::bad_stream(format!(
            "unexpected packet type in reply: got {packet_type:?}, expected TabularResult"
        ))
        .into());
    }

    let mut columns: Option<Arc<Vec<Column>>> = None;
    let mut errors: Vec<ServerError> = Vec::new();

    loop {
        let tag = src.read_u8().await?;
        let token_type =
            TokenType::from_u8(tag).ok_or(ProtocolError::UnknownToken(tag))?;
        tracing::trace!(token = ?token_type, "got token");

        match token_type {
            TokenType::Sspi => {
                let payload = decode_sspi(src).await?;
                emit(tx, Token::Sspi(payload)).await;
                return Ok(());
            }

            TokenType::FedAuthInfo => {
                let info = FedAuthInfo::decode(src).await?;
                emit(tx, Token::FedAuthInfo(info)).await;
                return Ok(());
            }

            TokenType::ReturnStatus => {
                let status = decode_return_status(src).await?;
                emit(tx, Token::ReturnStatus(status)).await;
            }

            TokenType::LoginAck => {
                let ack = LoginAck::decode(src).await?;
                emit(tx, Token::LoginAck(ack)).await;
            }

            TokenType::FeatureExtAck => {
                let ack = FeatureExtAck::decode(src).await?;
                emit(tx, Token::FeatureExtAck(ack)).await;
            }

            TokenType::Order => {
                let order = Order::decode(src).await?;
                emit(tx, Token::Order(order)).await;
            }

            TokenType::ColMetaData => {
                let meta = ColMetaData::decode(src, session.always_encrypted()).await?;
                let cols = Arc::new(meta.columns);
                // Load the keystore as soon as encrypted columns appear so
                // a bad store surfaces here rather than at the first row.
                if session.always_encrypted() && cols.iter().any(Column::is_encrypted) {
                    session.key_material()?;
                }
                columns = Some(Arc::clone(&cols));
                emit(tx, Token::Columns(cols)).await;
            }

            TokenType::Row => {
                let cols = current_columns(&columns)?;
                let mut row = decode_row(src, &cols).await?;
                decrypt_row(session, &cols, &mut row).await?;
                emit(tx, Token::Row(row)).await;
            }

            TokenType::NbcRow => {
                let cols = current_columns(&columns)?;
                let mut row = decode_nbc_row(src, &cols).await?;
                decrypt_row(session, &cols, &mut row).await?;
                emit(tx, Token::Row(row)).await;
            }

            TokenType::EnvChange => {
                crate::envchange::process_env_change(src, session).await?;
            }

            TokenType::Error => {
                let err = ServerError::decode(src).await?;
                tracing::debug!(number = err.number, message = %err.message, "got ERROR");
                errors.push(err);
            }

            TokenType::Info => {
                let info = ServerError::decode(src).await?;
                tracing::debug!(number = info.number, message = %info.message, "got INFO");
            }

            TokenType::ReturnValue => {
                let rv = ReturnValue::decode(src, session.always_encrypted()).await?;
                let name = rv.output_name().to_string();
                if !name.is_empty() {
                    if let Some(slot) = outputs.get(&name) {
                        if let Err(reason) = slot.assign(rv.value) {
                            emit_err(tx, Error::Scan { name, reason }).await;
                        }
                    }
                }
            }

            TokenType::DoneInProc => {
                let done = Done::decode(src).await?;
                if done.status.count() {
                    tracing::debug!(rows = done.row_count, "rows affected");
                }
                emit(tx, Token::DoneInProc(done)).await;
            }

            TokenType::Done | TokenType::DoneProc => {
                let mut done = Done::decode(src).await?;
                done.errors = std::mem::take(&mut errors);
                tracing::debug!(status = done.status.0, "got DONE or DONEPROC");
                if done.status.srverror() {
                    emit_err(tx, Error::ServerInternal).await;
                    return Ok(());
                }
                let more = done.status.more();
                emit(tx, Token::Done(done)).await;
                if !more {
                    return Ok(());
                }
            }
        }
    }
}

fn current_columns(columns: &Option<Arc<Vec<Column>>>) -> Result<Arc<Vec<Column>>> {
    columns.clone().ok_or_else(|| {
        ProtocolError::bad_stream("row token without preceding column metadata").into()
    })
}

async fn emit(tx: &mpsc::Sender<std::result::Result<Token, Error>>, token: Token) {
    let _ = tx.send(Ok(token)).await;
}

async fn emit_err(tx: &mpsc::Sender<std::result::Result<Token, Error>>, err: Error) {
    let _ = tx.send(Err(err)).await;
}

/// Decrypt the encrypted cells of a freshly decoded row in place.
///
/// Each encrypted non-null cell is varbinary ciphertext. The column's CEK
/// entry supplies the wrapped key (always its first value); the unwrapped
/// key decrypts the cell, and the plaintext is re-read through the crypto
/// metadata's plaintext TYPE_INFO.
async fn decrypt_row(
    session: &Session,
    columns: &[Column],
    row: &mut [SqlValue],
) -> Result<()> {
    for (cell, column) in row.iter_mut().zip(columns) {
        let Some(crypto) = &column.crypto else {
            continue;
        };
        if cell.is_null() {
            continue;
        }
        let SqlValue::Binary(ciphertext) = cell else {
            return Err(ProtocolError::bad_stream(format!(
                "encrypted column {:?} did not decode as varbinary",
                column.name
            ))
            .into());
        };

        let keys = session.key_material()?;
        let entry = crypto.entry().ok_or_else(|| {
            ProtocolError::bad_stream("encrypted column without a CEK table entry")
        })?;
        let cek_value = entry.primary_value().ok_or_else(|| {
            ProtocolError::bad_stream("CEK table entry carries no key values")
        })?;

        let wrapped = EncryptedCek::parse(&cek_value.encrypted_key)?;
        if !wrapped.verify_certificate(&keys.certificate_der) {
            return Err(Error::Crypto(mssql_ae::CryptoError::CertificateMismatch {
                key_path: wrapped.key_path.clone(),
                fingerprint: sha1_hex(&keys.certificate_der),
            }));
        }

        let root_key = wrapped.decrypt(&keys.private_key)?;
        let cipher = AeadCipher::with_version(&root_key, entry.cek_version as u8)?;
        let plaintext = cipher.decrypt(ciphertext)?;

        let mut plain_src = BytesSource::new(plaintext);
        *cell = crypto.plain_type.read_value(&mut plain_src).await?;
    }
    Ok(())
}
