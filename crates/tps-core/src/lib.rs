//! Token processing core: secure-channel session keys negotiated with a key
//! service, server-side key generation and recovery through an escrow service,
//! failover across backend connection pools, and a buffered audit trail with
//! chained signatures.
//!
//! The daemon and any request handlers interact with this crate through
//! [`TrustEngine`].

pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod failover;
pub mod fs_utils;
pub mod pool;
pub mod protocol;
pub mod scheduler;
pub mod signing;
pub mod state;
pub mod transport;

pub use audit::{
    AuditRecord, AuditSettings, AuditSink, AuditTrail, ChainReport, FileAuditSink,
    MemoryAuditSink, Outcome, events, verify_chain,
};
pub use config::{ConfigStore, MemoryConfigStore};
pub use crypto::{KeyProvider, SoftKeyProvider, SymmetricKey};
pub use error::{TpsError, TpsResult};
pub use failover::{FailoverCoordinator, FailoverMode};
pub use pool::{ConnectionHandle, ConnectionPool, Endpoint, EndpointList, PoolEntry, PoolKind};
pub use protocol::{
    EcCurve, KeyRecoveryRequest, KeyType, RequestDefaults, ServerKeyGenRequest, ServerKeyResult,
    ServerKeygenMaterial, SessionKeyEngine, SessionKeyRequest, SessionKeyResult,
};
pub use scheduler::{BackgroundTasks, FlushScheduler, LogExpiry};
pub use signing::{AuditSigner, EcdsaAuditSigner, KeyRing};
pub use state::EngineState;
pub use transport::{HttpTransport, ResponseFields, Transport, TransportResponse};

use std::sync::Arc;

use protocol::{CHALLENGE_LEN, HOST_CRYPTOGRAM_LEN};

/// Primary façade: the protocol engine, shared engine state and audit trail
/// assembled once at startup and shared by `Arc` across worker threads.
pub struct TrustEngine {
    state: Arc<EngineState>,
    protocol: SessionKeyEngine,
    audit: Arc<AuditTrail>,
    defaults: RequestDefaults,
}

impl TrustEngine {
    pub fn new(protocol: SessionKeyEngine, audit: Arc<AuditTrail>) -> Self {
        Self {
            state: Arc::clone(protocol.state()),
            protocol,
            audit,
            defaults: RequestDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: RequestDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Build pools, failover mode, key ring, audit trail and protocol engine
    /// from one configuration store. The trail is returned unopened.
    pub fn from_config(
        config: &dyn ConfigStore,
        transport: Arc<dyn Transport>,
        keys: Arc<dyn KeyProvider>,
    ) -> TpsResult<Self> {
        let state = Arc::new(EngineState::from_config(config)?);
        let key_ring = KeyRing::from_config(config)?;
        let audit = Arc::new(AuditTrail::from_config(config, &key_ring)?);
        let protocol = SessionKeyEngine::from_config(config, state, transport, keys)?;
        Ok(Self::new(protocol, audit).with_defaults(RequestDefaults::from_config(config)?))
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    /// Key set and archive flag applied when a request does not name its own.
    pub fn defaults(&self) -> &RequestDefaults {
        &self.defaults
    }

    pub fn establish_session_key(&self, req: &SessionKeyRequest) -> TpsResult<SessionKeyResult> {
        self.protocol.establish_session_key(req)
    }

    pub fn server_side_key_generate(&self, req: &ServerKeyGenRequest) -> TpsResult<ServerKeyResult> {
        self.protocol.server_side_key_generate(req)
    }

    pub fn recover_key(&self, req: &KeyRecoveryRequest) -> TpsResult<ServerKeyResult> {
        self.protocol.recover_key(req)
    }

    pub fn compute_host_cryptogram(
        &self,
        card_challenge: &[u8; CHALLENGE_LEN],
        host_challenge: &[u8; CHALLENGE_LEN],
    ) -> TpsResult<[u8; HOST_CRYPTOGRAM_LEN]> {
        self.protocol
            .compute_host_cryptogram(card_challenge, host_challenge)
    }

    pub fn verify_card_cryptogram(
        &self,
        card_challenge: &[u8; CHALLENGE_LEN],
        host_challenge: &[u8; CHALLENGE_LEN],
        card_cryptogram: &[u8],
    ) -> TpsResult<bool> {
        self.protocol
            .verify_card_cryptogram(card_challenge, host_challenge, card_cryptogram)
    }

    pub fn audit_append(&self, record: &AuditRecord) -> TpsResult<()> {
        self.audit.append(record)
    }

    /// Record the outcome of an operation on behalf of `subject`.
    pub fn audit_outcome<T>(
        &self,
        event: &str,
        subject: &str,
        result: &TpsResult<T>,
        detail: &str,
    ) -> TpsResult<()> {
        let record = match result {
            Ok(_) => AuditRecord::new(event, subject, Outcome::Success, detail),
            Err(err) => AuditRecord::new(event, subject, Outcome::Failure, format!("{detail}: {err}")),
        };
        self.audit.append(&record)
    }

    pub fn audit_flush_now(&self) -> TpsResult<()> {
        self.audit.flush_now()
    }

    pub fn set_flush_interval(&self, seconds: u64) {
        self.audit.set_flush_interval(seconds);
    }

    pub fn set_buffer_capacity(&self, capacity: usize) -> TpsResult<()> {
        self.audit.set_buffer_capacity(capacity)
    }

    pub fn enable_signing(&self, enabled: bool) -> TpsResult<()> {
        self.audit.enable_signing(enabled)
    }

    pub fn enable_audit(&self, enabled: bool) {
        self.audit.enable_audit(enabled);
    }

    pub fn get_pool(&self, id: &str) -> Option<ConnectionHandle> {
        self.state.get_pool(id)
    }

    pub fn record_failure(&self, pool: &PoolEntry) -> Endpoint {
        self.state.record_failure(pool)
    }

    pub fn current_endpoint(&self, pool: &PoolEntry) -> Endpoint {
        self.state.current_endpoint(pool)
    }
}
