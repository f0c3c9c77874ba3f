//! # tds-tokens
//!
//! Server-response token grammar for the MS-TDS (Tabular Data Stream)
//! protocol spoken by Microsoft SQL Server.
//!
//! After a request is issued, the server replies with one or more messages
//! composed of heterogeneous, self-describing tokens. This crate decodes
//! that grammar: primitive length-prefixed strings, TYPE_INFO blocks with
//! their cell readers, COLMETADATA/ROW/NBCROW, completion and error tokens,
//! and the Always Encrypted key metadata.
//!
//! The crate is transport-agnostic. Decoders consume a
//! [`source::ResponseSource`]; the framing layer that reassembles TDS
//! packets into such a source lives in the `mssql-response` crate, and
//! [`source::BytesSource`] serves in-memory buffers (fixtures, decrypted
//! cell plaintext).
//!
//! Ordering rules the decoders rely on:
//!
//! - ROW and NBCROW are only valid against the most recent COLMETADATA of
//!   the same response; the row decoders take that column list explicitly.
//! - A CEK table is tied to the COLMETADATA that carried it and is shared
//!   read-only by that result set's columns.
//! - A DONE with a cleared MORE bit terminates the message.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod crypto;
pub mod error;
pub mod packet;
pub mod source;
pub mod token;
pub mod typeinfo;
pub mod types;
pub mod value;

pub use crypto::{
    CIPHER_ALGORITHM_CUSTOM, CekEntry, CekTable, CekValue, CryptoMetadata,
    ENCRYPTION_TYPE_DETERMINISTIC, ENCRYPTION_TYPE_RANDOMIZED,
};
pub use error::ProtocolError;
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketType,
    STATUS_END_OF_MESSAGE,
};
pub use source::{BytesSource, ResponseSource};
pub use token::{
    ColMetaData, Column, Done, DoneStatus, FeatureAck, FeatureExtAck, FedAuthInfo, LoginAck, Order,
    ReturnValue, ServerError, Token, TokenType, decode_nbc_row, decode_return_status, decode_row,
    decode_sspi,
};
pub use typeinfo::{Collation, TypeInfo};
pub use types::{COLUMN_FLAG_ENCRYPTED, COLUMN_FLAG_NULLABLE, TypeId};
pub use value::SqlValue;
