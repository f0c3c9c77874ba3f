//! ENVCHANGE decoding and session mutation.
//!
//! An ENVCHANGE token is a 2-byte total size followed by sub-records of
//! (type byte, new value, old value) whose payload shapes depend on the
//! type. The whole record is pulled into memory first: sub-record parsing
//! is then naturally bounded, and abandoning an unknown sub-record (whose
//! shape we cannot know) can never desynchronize the outer token stream.

use tds_tokens::{BytesSource, Collation, ProtocolError, ResponseSource};

use crate::error::Result;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvChangeType {
    Database,
    Language,
    Charset,
    PacketSize,
    SortId,
    SortFlags,
    SqlCollation,
    BeginTran,
    CommitTran,
    RollbackTran,
    EnlistDtc,
    DefectTran,
    MirrorPartner,
    PromoteTran,
    TranMgrAddr,
    TranEnded,
    ResetConnAck,
    StartedInstanceName,
    Routing,
}

impl EnvChangeType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Database),
            2 => Some(Self::Language),
            3 => Some(Self::Charset),
            4 => Some(Self::PacketSize),
            5 => Some(Self::SortId),
            6 => Some(Self::SortFlags),
            7 => Some(Self::SqlCollation),
            8 => Some(Self::BeginTran),
            9 => Some(Self::CommitTran),
            10 => Some(Self::RollbackTran),
            11 => Some(Self::EnlistDtc),
            12 => Some(Self::DefectTran),
            13 => Some(Self::MirrorPartner),
            15 => Some(Self::PromoteTran),
            16 => Some(Self::TranMgrAddr),
            17 => Some(Self::TranEnded),
            18 => Some(Self::ResetConnAck),
            19 => Some(Self::StartedInstanceName),
            20 => Some(Self::Routing),
            _ => None,
        }
    }
}

/// Decode an ENVCHANGE body from `src` and apply its effects to the
/// session. A packet-size change additionally resizes `src`'s buffer.
pub(crate) async fn process_env_change<S>(src: &mut S, session: &Session) -> Result<()>
where
    S: ResponseSource + ?Sized,
{
    let size = src.read_u16().await? as usize;
    let record = src.read_bytes(size).await?;
    let mut rec = BytesSource::new(record);

    while rec.remaining() > 0 {
        let type_byte = rec.read_u8().await?;
        let Some(env_type) = EnvChangeType::from_u8(type_byte) else {
            // The sub-record shape is unknown, so the rest of this record
            // cannot be skipped safely.
            tracing::warn!(
                env_type = type_byte,
                "unknown ENVCHANGE record type, abandoning remainder of record"
            );
            return Ok(());
        };

        match env_type {
            EnvChangeType::Database => {
                let database = rec.read_b_varchar().await?;
                let _ = rec.read_b_varchar().await?;
                session.set_database(database);
            }

            EnvChangeType::Language
            | EnvChangeType::Charset
            | EnvChangeType::SortId
            | EnvChangeType::SortFlags
            | EnvChangeType::EnlistDtc
            | EnvChangeType::DefectTran
            | EnvChangeType::PromoteTran
            | EnvChangeType::TranMgrAddr
            | EnvChangeType::TranEnded
            | EnvChangeType::ResetConnAck
            | EnvChangeType::StartedInstanceName => {
                let _ = rec.read_b_varchar().await?;
                let _ = rec.read_b_varchar().await?;
            }

            EnvChangeType::PacketSize => {
                let new_size = rec.read_b_varchar().await?;
                let _ = rec.read_b_varchar().await?;
                let size: usize = new_size.parse().map_err(|_| {
                    ProtocolError::bad_stream(format!(
                        "invalid packet size value returned from server: {new_size:?}"
                    ))
                })?;
                src.resize_buffer(size).await?;
                session.set_packet_size(size as u32);
            }

            EnvChangeType::SqlCollation => {
                let len = rec.read_u8().await?;
                if len != 5 {
                    return Err(ProtocolError::bad_stream(format!(
                        "invalid SQL collation size returned from server: {len}"
                    ))
                    .into());
                }
                let lcid = rec.read_u32().await?;
                let sort_id = rec.read_u8().await?;
                session.set_collation(Collation { lcid, sort_id });
                let _ = rec.read_b_varchar().await?;
            }

            EnvChangeType::BeginTran => {
                let tranid = rec.read_b_varbyte().await?;
                let tranid: [u8; 8] = tranid.try_into().map_err(|bad: Vec<u8>| {
                    ProtocolError::bad_stream(format!(
                        "invalid size of transaction identifier: {}",
                        bad.len()
                    ))
                })?;
                session.set_tranid(u64::from_le_bytes(tranid));
                tracing::debug!(tranid = session.tranid(), "BEGIN TRANSACTION");
                let _ = rec.read_b_varbyte().await?;
            }

            EnvChangeType::CommitTran | EnvChangeType::RollbackTran => {
                let _ = rec.read_b_varbyte().await?;
                let _ = rec.read_b_varbyte().await?;
                if env_type == EnvChangeType::CommitTran {
                    tracing::debug!(tranid = session.tranid(), "COMMIT TRANSACTION");
                } else {
                    tracing::debug!(tranid = session.tranid(), "ROLLBACK TRANSACTION");
                }
                session.set_tranid(0);
            }

            EnvChangeType::MirrorPartner => {
                let partner = rec.read_b_varchar().await?;
                let _ = rec.read_b_varchar().await?;
                session.set_partner(partner);
            }

            EnvChangeType::Routing => {
                // ValueLength USHORT, Protocol BYTE (0 = TCP), new port
                // USHORT, alternate server US_VARCHAR, then a 2-byte
                // all-zero old value.
                let _value_len = rec.read_u16().await?;
                let protocol = rec.read_u8().await?;
                if protocol != 0 {
                    return Err(ProtocolError::bad_stream(format!(
                        "routing protocol {protocol} is not TCP"
                    ))
                    .into());
                }
                let port = rec.read_u16().await?;
                let server = rec.read_us_varchar().await?;
                let _ = rec.read_u16().await?;
                session.set_routing(server, port);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use tds_tokens::codec;

    fn record(body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16_le(body.len() as u16);
        buf.put_slice(body);
        buf.to_vec()
    }

    #[tokio::test]
    async fn database_change_sets_session() {
        // type=1, new value "db", zero-length old value
        let bytes = record(&[0x01, 0x02, b'd', 0x00, b'b', 0x00, 0x00]);
        let session = Session::new();
        let mut src = BytesSource::new(bytes);
        process_env_change(&mut src, &session).await.unwrap();
        assert_eq!(session.database(), "db");
    }

    #[tokio::test]
    async fn packet_size_resizes_source() {
        let mut body = BytesMut::new();
        body.put_u8(4);
        codec::write_b_varchar(&mut body, "8192");
        codec::write_b_varchar(&mut body, "4096");

        let session = Session::new();
        let mut src = BytesSource::new(record(&body));
        process_env_change(&mut src, &session).await.unwrap();
        assert_eq!(src.buffer_size(), 8192);
        assert_eq!(session.packet_size(), Some(8192));
    }

    #[tokio::test]
    async fn packet_size_rejects_non_numeric() {
        let mut body = BytesMut::new();
        body.put_u8(4);
        codec::write_b_varchar(&mut body, "not a number");
        codec::write_b_varchar(&mut body, "");

        let session = Session::new();
        let mut src = BytesSource::new(record(&body));
        assert!(process_env_change(&mut src, &session).await.is_err());
    }

    #[tokio::test]
    async fn transaction_lifecycle() {
        let mut body = BytesMut::new();
        body.put_u8(8); // BeginTran
        body.put_u8(8); // B_VARBYTE length
        body.put_u64_le(0x1122334455667788);
        body.put_u8(0); // empty old value

        let session = Session::new();
        let mut src = BytesSource::new(record(&body));
        process_env_change(&mut src, &session).await.unwrap();
        assert_eq!(session.tranid(), 0x1122334455667788);

        let mut body = BytesMut::new();
        body.put_u8(9); // CommitTran
        body.put_u8(0);
        body.put_u8(0);
        let mut src = BytesSource::new(record(&body));
        process_env_change(&mut src, &session).await.unwrap();
        assert_eq!(session.tranid(), 0);
    }

    #[tokio::test]
    async fn begin_tran_requires_eight_bytes() {
        let mut body = BytesMut::new();
        body.put_u8(8);
        body.put_u8(4); // wrong length
        body.put_u32_le(7);
        body.put_u8(0);

        let session = Session::new();
        let mut src = BytesSource::new(record(&body));
        assert!(process_env_change(&mut src, &session).await.is_err());
    }

    #[tokio::test]
    async fn routing_change() {
        let mut body = BytesMut::new();
        body.put_u8(20);
        let server = "srv2";
        body.put_u16_le((1 + 2 + 2 + server.len() * 2) as u16); // value length
        body.put_u8(0); // protocol = TCP
        body.put_u16_le(1433);
        codec::write_us_varchar(&mut body, server);
        body.put_u16_le(0); // old value

        let session = Session::new();
        let mut src = BytesSource::new(record(&body));
        process_env_change(&mut src, &session).await.unwrap();
        assert_eq!(session.routing(), Some(("srv2".into(), 1433)));
    }

    #[tokio::test]
    async fn routing_rejects_non_tcp_protocol() {
        let mut body = BytesMut::new();
        body.put_u8(20);
        body.put_u16_le(5);
        body.put_u8(1); // not TCP
        body.put_u16_le(1433);
        codec::write_us_varchar(&mut body, "");
        body.put_u16_le(0);

        let session = Session::new();
        let mut src = BytesSource::new(record(&body));
        assert!(process_env_change(&mut src, &session).await.is_err());
    }

    #[tokio::test]
    async fn sql_collation_recorded() {
        let mut body = BytesMut::new();
        body.put_u8(7);
        body.put_u8(5); // collation size
        body.put_u32_le(0x0409);
        body.put_u8(0x34);
        body.put_u8(0); // old value, empty B_VARCHAR

        let session = Session::new();
        let mut src = BytesSource::new(record(&body));
        process_env_change(&mut src, &session).await.unwrap();
        let collation = session.collation().unwrap();
        assert_eq!(collation.lcid, 0x0409);
        assert_eq!(collation.sort_id, 0x34);
    }

    #[tokio::test]
    async fn unknown_type_abandons_record_but_consumes_it() {
        // unknown type 99 followed by garbage; the record is consumed so
        // bytes after it remain readable
        let mut bytes = record(&[99, 0xDE, 0xAD, 0xBE, 0xEF]);
        bytes.push(0x55); // trailing byte after the ENVCHANGE record

        let session = Session::new();
        let mut src = BytesSource::new(bytes);
        process_env_change(&mut src, &session).await.unwrap();
        assert_eq!(src.read_u8().await.unwrap(), 0x55);
    }

    #[tokio::test]
    async fn applying_a_stream_twice_is_idempotent() {
        let mut body = BytesMut::new();
        body.put_u8(1);
        codec::write_b_varchar(&mut body, "newdb");
        codec::write_b_varchar(&mut body, "olddb");
        body.put_u8(13);
        codec::write_b_varchar(&mut body, "mirror");
        codec::write_b_varchar(&mut body, "");
        let bytes = record(&body);

        let session = Session::new();
        for _ in 0..2 {
            let mut src = BytesSource::new(bytes.clone());
            process_env_change(&mut src, &session).await.unwrap();
        }
        assert_eq!(session.database(), "newdb");
        assert_eq!(session.partner(), "mirror");
    }
}
