//! Session state observed and mutated by the token stream.
//!
//! ENVCHANGE tokens, COLMETADATA and RETURNSTATUS all leave marks on the
//! session. Only the reader task writes these fields, and the consumer
//! reads them between token deliveries; the mutexes exist for Rust
//! soundness across the task boundary, not for contention.

use std::sync::Arc;

use mssql_ae::{KeyMaterial, KeystoreConfig};
use parking_lot::Mutex;
use tds_tokens::{Collation, Column};

use crate::error::{Error, Result};

/// Always Encrypted configuration for a session.
#[derive(Debug, Clone)]
pub struct AeConfig {
    /// Where the Column Master Key lives.
    pub keystore: KeystoreConfig,
}

struct AeState {
    config: Option<AeConfig>,
    keys: Option<Arc<KeyMaterial>>,
}

#[derive(Default)]
struct SessionState {
    database: String,
    partner: String,
    routed_server: String,
    routed_port: u16,
    tranid: u64,
    collation: Option<Collation>,
    packet_size: Option<u32>,
    columns: Option<Arc<Vec<Column>>>,
    return_status: Option<i32>,
}

/// Shared session state for one connection.
pub struct Session {
    state: Mutex<SessionState>,
    ae: Option<Mutex<AeState>>,
}

impl Session {
    /// A session without Always Encrypted.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            ae: None,
        }
    }

    /// A session with Always Encrypted backed by a keystore. The store is
    /// opened lazily on the first encrypted result set.
    #[must_use]
    pub fn with_always_encrypted(config: AeConfig) -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            ae: Some(Mutex::new(AeState {
                config: Some(config),
                keys: None,
            })),
        }
    }

    /// A session with Always Encrypted and pre-loaded key material, for
    /// embedders that hold keys in memory instead of a PFX file.
    #[must_use]
    pub fn with_key_material(keys: KeyMaterial) -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            ae: Some(Mutex::new(AeState {
                config: None,
                keys: Some(Arc::new(keys)),
            })),
        }
    }

    /// Whether column encryption was negotiated for this session.
    #[must_use]
    pub fn always_encrypted(&self) -> bool {
        self.ae.is_some()
    }

    /// Column Master Key material, loading the keystore on first use.
    pub(crate) fn key_material(&self) -> Result<Arc<KeyMaterial>> {
        let ae = self.ae.as_ref().ok_or_else(|| {
            Error::Protocol(tds_tokens::ProtocolError::bad_stream(
                "encrypted column on a session without Always Encrypted",
            ))
        })?;
        let mut state = ae.lock();
        if let Some(keys) = &state.keys {
            return Ok(Arc::clone(keys));
        }
        let config = state.config.as_ref().ok_or_else(|| {
            Error::Crypto(mssql_ae::CryptoError::Keystore(
                "no keystore configured".into(),
            ))
        })?;
        let keys = Arc::new(config.keystore.load()?);
        state.keys = Some(Arc::clone(&keys));
        Ok(keys)
    }

    /// Current database name.
    #[must_use]
    pub fn database(&self) -> String {
        self.state.lock().database.clone()
    }

    pub(crate) fn set_database(&self, database: String) {
        self.state.lock().database = database;
    }

    /// Mirroring partner, when the server announced one.
    #[must_use]
    pub fn partner(&self) -> String {
        self.state.lock().partner.clone()
    }

    pub(crate) fn set_partner(&self, partner: String) {
        self.state.lock().partner = partner;
    }

    /// Routing target announced by the server, if any.
    #[must_use]
    pub fn routing(&self) -> Option<(String, u16)> {
        let state = self.state.lock();
        if state.routed_server.is_empty() {
            None
        } else {
            Some((state.routed_server.clone(), state.routed_port))
        }
    }

    pub(crate) fn set_routing(&self, server: String, port: u16) {
        let mut state = self.state.lock();
        state.routed_server = server;
        state.routed_port = port;
    }

    /// Current transaction descriptor; zero outside a transaction.
    #[must_use]
    pub fn tranid(&self) -> u64 {
        self.state.lock().tranid
    }

    pub(crate) fn set_tranid(&self, tranid: u64) {
        self.state.lock().tranid = tranid;
    }

    /// Collation announced by the server.
    #[must_use]
    pub fn collation(&self) -> Option<Collation> {
        self.state.lock().collation
    }

    pub(crate) fn set_collation(&self, collation: Collation) {
        self.state.lock().collation = Some(collation);
    }

    /// Packet size from the last ENVCHANGE resize.
    #[must_use]
    pub fn packet_size(&self) -> Option<u32> {
        self.state.lock().packet_size
    }

    pub(crate) fn set_packet_size(&self, size: u32) {
        self.state.lock().packet_size = Some(size);
    }

    /// Columns of the most recent result set.
    #[must_use]
    pub fn columns(&self) -> Option<Arc<Vec<Column>>> {
        self.state.lock().columns.clone()
    }

    /// Replace the current columns; called by the consumer on every
    /// `Columns` token.
    pub fn set_columns(&self, columns: Arc<Vec<Column>>) {
        self.state.lock().columns = Some(columns);
    }

    /// Return status of the last RPC.
    #[must_use]
    pub fn return_status(&self) -> Option<i32> {
        self.state.lock().return_status
    }

    /// Record an RPC return status.
    pub fn set_return_status(&self, status: i32) {
        self.state.lock().return_status = Some(status);
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("database", &state.database)
            .field("tranid", &state.tranid)
            .field("always_encrypted", &self.ae.is_some())
            .finish_non_exhaustive()
    }
}
