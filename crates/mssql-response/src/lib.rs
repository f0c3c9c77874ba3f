//! # mssql-response
//!
//! Runtime for decoding SQL Server response token streams.
//!
//! A response is read by a dedicated task ([`reader::read_response`]) that
//! owns the packet source for one response, parses tokens in wire order
//! with the `tds-tokens` grammar, applies ENVCHANGE effects to the shared
//! [`Session`], decrypts Always Encrypted cells via `mssql-ae`, and pushes
//! typed tokens into a bounded channel. The caller consumes them through a
//! [`TokenProcessor`], which also owns the cancellation story: a cancelled
//! context triggers the TDS attention packet on the writer half and a
//! drain of up to two responses for the server's confirmation.
//!
//! ```text
//! FramedSource -> read_response -> mpsc(5) -> TokenProcessor -> caller
//!                      |                           |
//!                 Session state               PacketSink (attention)
//! ```
//!
//! Tokens reach the consumer in exact wire order; ENVCHANGE side effects
//! are visible before any later token is delivered, because the reader
//! applies them synchronously during the parse.

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod envchange;

pub mod error;
pub mod framed;
pub mod outputs;
pub mod processor;
pub mod reader;
pub mod session;

pub use error::{Error, Result};
pub use framed::{FramedSource, PacketSink};
pub use outputs::{OutputSlot, Outputs};
pub use processor::TokenProcessor;
pub use reader::read_response;
pub use session::{AeConfig, Session};

pub use mssql_ae::{KeyMaterial, KeystoreAuth, KeystoreConfig};
pub use tds_tokens::{Column, Done, DoneStatus, ServerError, SqlValue, Token};
