//! Session-key establishment, cryptogram computation, and escrow-backed key
//! generation/recovery.
//!
//! The engine talks to backends through [`Transport`], moves between replicas
//! through [`EngineState::record_failure`], and never writes audit records:
//! callers audit the outcome of every operation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::{
    config::ConfigStore,
    crypto::{DES_BLOCK_LEN, KeyProvider, SymmetricKey},
    error::{TpsError, TpsResult},
    pool::{PoolEntry, PoolKind},
    state::EngineState,
    transport::{ResponseFields, Transport, encode_fields},
};

pub const COMPUTE_SESSION_KEY_PATH: &str = "/tks/agent/tks/computeSessionKey";
pub const SERVER_KEYGEN_PATH: &str = "/kra/agent/kra/GenerateKeyPair";
pub const KEY_RECOVERY_PATH: &str = "/kra/agent/kra/TokenKeyRecovery";

pub const CHALLENGE_LEN: usize = 8;
pub const HOST_CRYPTOGRAM_LEN: usize = 8;

/// EC key sizes an escrow service will generate, paired with curve names.
const EC_CURVES: [(u32, EcCurve); 3] = [
    (256, EcCurve::NistP256),
    (384, EcCurve::NistP384),
    (521, EcCurve::NistP521),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeyRequest {
    pub cuid: Vec<u8>,
    pub key_diversification: Vec<u8>,
    pub card_challenge: [u8; CHALLENGE_LEN],
    pub host_challenge: [u8; CHALLENGE_LEN],
    pub card_cryptogram: Vec<u8>,
    pub target_pool_id: String,
    pub key_set: String,
    pub server_side_keygen: bool,
}

/// Key material returned only when server-side key generation was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeygenMaterial {
    /// DES key wrapped for the escrow service's transport key.
    pub escrow_wrapped_key: Vec<u8>,
    /// The same DES key wrapped under the local transport key (KEK).
    pub local_wrapped_key: Vec<u8>,
    pub key_check: Vec<u8>,
}

/// Owned by the caller; both session keys are zeroized when this is dropped.
#[derive(Debug)]
pub struct SessionKeyResult {
    pub mac_session_key: SymmetricKey,
    pub enc_session_key: SymmetricKey,
    pub host_cryptogram: [u8; HOST_CRYPTOGRAM_LEN],
    pub server_keygen: Option<ServerKeygenMaterial>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcCurve {
    NistP256,
    NistP384,
    NistP521,
}

impl EcCurve {
    pub fn name(self) -> &'static str {
        match self {
            EcCurve::NistP256 => "nistp256",
            EcCurve::NistP384 => "nistp384",
            EcCurve::NistP521 => "nistp521",
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            EcCurve::NistP256 => 256,
            EcCurve::NistP384 => 384,
            EcCurve::NistP521 => 521,
        }
    }

    /// Map a requested key size to a curve, falling back to P-256.
    pub fn from_key_size(size: u32) -> Self {
        EC_CURVES
            .iter()
            .find(|(bits, _)| *bits == size)
            .map(|(_, curve)| *curve)
            .unwrap_or_else(|| {
                warn!(size, "unsupported EC key size requested; using nistp256");
                EcCurve::NistP256
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Rsa,
    Ec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeyGenRequest {
    pub cuid: Vec<u8>,
    pub user_id: String,
    pub target_pool_id: String,
    /// `ServerKeygenMaterial::escrow_wrapped_key` from the session-key exchange.
    pub escrow_wrapped_key: Vec<u8>,
    pub key_type: KeyType,
    pub key_size: u32,
    pub archive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecoveryRequest {
    pub cuid: Vec<u8>,
    pub user_id: String,
    pub target_pool_id: String,
    pub escrow_wrapped_key: Vec<u8>,
    /// Base64 certificate whose escrowed private key should be released.
    pub certificate: String,
}

/// Public key, wrapped private key and IV returned by the escrow service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeyResult {
    pub public_key: String,
    pub wrapped_private_key: Vec<u8>,
    pub iv_param: Vec<u8>,
}

/// Per-deployment request defaults: `channel.defKeySet` and
/// `kra.keyGen.archive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDefaults {
    pub key_set: String,
    pub archive: bool,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            key_set: "defKeySet".into(),
            archive: true,
        }
    }
}

impl RequestDefaults {
    pub fn from_config(config: &dyn ConfigStore) -> TpsResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            key_set: config.get_string("channel.defKeySet", &defaults.key_set),
            archive: config.get_bool("kra.keyGen.archive", defaults.archive)?,
        })
    }
}

pub struct SessionKeyEngine {
    state: Arc<EngineState>,
    transport: Arc<dyn Transport>,
    keys: Arc<dyn KeyProvider>,
    transport_key: SymmetricKey,
    diversification_key: SymmetricKey,
}

impl SessionKeyEngine {
    pub fn new(
        state: Arc<EngineState>,
        transport: Arc<dyn Transport>,
        keys: Arc<dyn KeyProvider>,
        transport_key: SymmetricKey,
        diversification_key: SymmetricKey,
    ) -> Self {
        Self {
            state,
            transport,
            keys,
            transport_key,
            diversification_key,
        }
    }

    /// Read `tks.transportKey` and `tks.diversificationKey` (hex) from config.
    pub fn from_config(
        config: &dyn ConfigStore,
        state: Arc<EngineState>,
        transport: Arc<dyn Transport>,
        keys: Arc<dyn KeyProvider>,
    ) -> TpsResult<Self> {
        let transport_key = config
            .get("tks.transportKey")
            .ok_or_else(|| TpsError::config("tks.transportKey is not configured"))?;
        let diversification_key = config
            .get("tks.diversificationKey")
            .ok_or_else(|| TpsError::config("tks.diversificationKey is not configured"))?;
        Ok(Self::new(
            state,
            transport,
            keys,
            SymmetricKey::from_hex(&Zeroizing::new(transport_key))?,
            SymmetricKey::from_hex(&Zeroizing::new(diversification_key))?,
        ))
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn establish_session_key(&self, req: &SessionKeyRequest) -> TpsResult<SessionKeyResult> {
        let pool = self.state.require_pool(&req.target_pool_id)?;
        expect_kind(&pool, PoolKind::Tks)?;

        let cuid = hex::encode_upper(&req.cuid);
        let kdd = hex::encode_upper(&req.key_diversification);
        let card_challenge = hex::encode_upper(req.card_challenge);
        let host_challenge = hex::encode_upper(req.host_challenge);
        let card_cryptogram = hex::encode_upper(&req.card_cryptogram);
        let body = encode_fields([
            ("CUID", cuid.as_str()),
            ("KDD", kdd.as_str()),
            ("card_challenge", card_challenge.as_str()),
            ("host_challenge", host_challenge.as_str()),
            ("card_cryptogram", card_cryptogram.as_str()),
            ("keySet", req.key_set.as_str()),
            (
                "serversideKeygen",
                if req.server_side_keygen { "true" } else { "false" },
            ),
        ]);

        let response = self.send_with_failover(&pool, COMPUTE_SESSION_KEY_PATH, &body)?;
        check_status(&response)?;

        let wrapped_mac = response.require_hex("sessionKey")?;
        let wrapped_enc = response.require_hex("encSessionKey")?;

        let mac_session_key = self.unwrap_and_extend(&wrapped_mac)?;
        let enc_session_key = self.unwrap_and_extend(&wrapped_enc)?;

        let server_keygen = if req.server_side_keygen {
            Some(ServerKeygenMaterial {
                escrow_wrapped_key: response.require_hex("drm_trans_desKey")?,
                local_wrapped_key: response.require_hex("kek_wrapped_desKey")?,
                key_check: response.require_hex("keycheck")?,
            })
        } else {
            None
        };

        let cryptogram = response.require_hex("hostCryptogram")?;
        let host_cryptogram: [u8; HOST_CRYPTOGRAM_LEN] =
            cryptogram.as_slice().try_into().map_err(|_| {
                TpsError::MalformedResponse(format!(
                    "hostCryptogram must be {HOST_CRYPTOGRAM_LEN} bytes, got {}",
                    cryptogram.len()
                ))
            })?;

        info!(
            pool = pool.id.as_str(),
            cuid = cuid.as_str(),
            server_side_keygen = req.server_side_keygen,
            "session keys established"
        );
        Ok(SessionKeyResult {
            mac_session_key,
            enc_session_key,
            host_cryptogram,
            server_keygen,
        })
    }

    /// Card-side-equivalent host cryptogram over `card_challenge || host_challenge`.
    pub fn compute_host_cryptogram(
        &self,
        card_challenge: &[u8; CHALLENGE_LEN],
        host_challenge: &[u8; CHALLENGE_LEN],
    ) -> TpsResult<[u8; HOST_CRYPTOGRAM_LEN]> {
        self.challenge_mac(card_challenge, host_challenge)
    }

    /// Check the card's cryptogram, a MAC over `host_challenge || card_challenge`
    /// under the same derived session key.
    pub fn verify_card_cryptogram(
        &self,
        card_challenge: &[u8; CHALLENGE_LEN],
        host_challenge: &[u8; CHALLENGE_LEN],
        card_cryptogram: &[u8],
    ) -> TpsResult<bool> {
        let session = self.derive_auth_key(card_challenge, host_challenge)?;
        let mut block = [0u8; 2 * CHALLENGE_LEN];
        block[..CHALLENGE_LEN].copy_from_slice(host_challenge);
        block[CHALLENGE_LEN..].copy_from_slice(card_challenge);
        let expected = self.keys.cbc_mac(&session, [0u8; DES_BLOCK_LEN], &block)?;
        Ok(expected.as_slice().ct_eq(card_cryptogram).into())
    }

    pub fn server_side_key_generate(&self, req: &ServerKeyGenRequest) -> TpsResult<ServerKeyResult> {
        let pool = self.state.require_pool(&req.target_pool_id)?;
        expect_kind(&pool, PoolKind::Kra)?;

        let cuid = hex::encode_upper(&req.cuid);
        let wrapped = hex::encode_upper(&req.escrow_wrapped_key);
        // Unsupported EC sizes fall back to a curve; keysize follows the curve.
        let curve = match req.key_type {
            KeyType::Ec => Some(EcCurve::from_key_size(req.key_size)),
            KeyType::Rsa => None,
        };
        let key_size = curve.map_or(req.key_size, EcCurve::bits).to_string();
        let mut fields = vec![
            ("CUID", cuid.as_str()),
            ("userid", req.user_id.as_str()),
            ("drm_trans_desKey", wrapped.as_str()),
            ("archive", if req.archive { "true" } else { "false" }),
            ("keysize", key_size.as_str()),
        ];
        match curve {
            None => fields.push(("keytype", "RSA")),
            Some(curve) => {
                fields.push(("keytype", "EC"));
                fields.push(("eckeycurve", curve.name()));
            }
        }
        let body = encode_fields(fields);

        let response = self.send_with_failover(&pool, SERVER_KEYGEN_PATH, &body)?;
        let result = parse_server_key_result(&response)?;
        info!(
            pool = pool.id.as_str(),
            cuid = cuid.as_str(),
            key_type = ?req.key_type,
            archive = req.archive,
            "server-side key generated"
        );
        Ok(result)
    }

    pub fn recover_key(&self, req: &KeyRecoveryRequest) -> TpsResult<ServerKeyResult> {
        let pool = self.state.require_pool(&req.target_pool_id)?;
        expect_kind(&pool, PoolKind::Kra)?;

        let cuid = hex::encode_upper(&req.cuid);
        let wrapped = hex::encode_upper(&req.escrow_wrapped_key);
        let body = encode_fields([
            ("CUID", cuid.as_str()),
            ("userid", req.user_id.as_str()),
            ("drm_trans_desKey", wrapped.as_str()),
            ("cert", req.certificate.as_str()),
        ]);

        let response = self.send_with_failover(&pool, KEY_RECOVERY_PATH, &body)?;
        let result = parse_server_key_result(&response)?;
        info!(pool = pool.id.as_str(), cuid = cuid.as_str(), "escrowed key recovered");
        Ok(result)
    }

    /// Try the current endpoint, failing over after each transport error.
    /// Exactly `retry_count + 1` attempts are made.
    fn send_with_failover(
        &self,
        pool: &PoolEntry,
        path: &str,
        body: &str,
    ) -> TpsResult<ResponseFields> {
        let attempts = pool.endpoints.retry_count.saturating_add(1);
        for attempt in 1..=attempts {
            let endpoint = self.state.current_endpoint(pool);
            metrics::counter!("tps_backend_attempts_total", "pool" => pool.id.clone())
                .increment(1);
            match self.transport.send(pool, &endpoint, path, body) {
                Ok(response) => {
                    debug!(
                        pool = pool.id.as_str(),
                        endpoint = %endpoint,
                        attempt,
                        "backend responded"
                    );
                    return Ok(ResponseFields::parse(&response.body));
                }
                Err(err) if err.is_retriable() => {
                    warn!(
                        pool = pool.id.as_str(),
                        endpoint = %endpoint,
                        attempt,
                        attempts,
                        error = %err,
                        "backend request failed"
                    );
                    self.state.record_failure(pool);
                }
                Err(err) => return Err(err),
            }
        }
        Err(TpsError::BackendUnreachable {
            pool: pool.id.clone(),
            attempts,
        })
    }

    fn unwrap_and_extend(&self, wrapped: &[u8]) -> TpsResult<SymmetricKey> {
        let double = self.keys.unwrap_key(&self.transport_key, wrapped)?;
        self.keys.extend(double)
    }

    fn derive_auth_key(
        &self,
        card_challenge: &[u8; CHALLENGE_LEN],
        host_challenge: &[u8; CHALLENGE_LEN],
    ) -> TpsResult<SymmetricKey> {
        let block = challenge_block(card_challenge, host_challenge);
        let derived = Zeroizing::new(self.keys.encrypt_ecb(&self.diversification_key, &block)?);
        self.keys.extend(SymmetricKey::from_bytes(&derived)?)
    }

    fn challenge_mac(
        &self,
        card_challenge: &[u8; CHALLENGE_LEN],
        host_challenge: &[u8; CHALLENGE_LEN],
    ) -> TpsResult<[u8; HOST_CRYPTOGRAM_LEN]> {
        let session = self.derive_auth_key(card_challenge, host_challenge)?;
        let block = challenge_block(card_challenge, host_challenge);
        self.keys.cbc_mac(&session, [0u8; DES_BLOCK_LEN], &block)
    }
}

fn challenge_block(
    card_challenge: &[u8; CHALLENGE_LEN],
    host_challenge: &[u8; CHALLENGE_LEN],
) -> [u8; 2 * CHALLENGE_LEN] {
    let mut block = [0u8; 2 * CHALLENGE_LEN];
    block[..CHALLENGE_LEN].copy_from_slice(card_challenge);
    block[CHALLENGE_LEN..].copy_from_slice(host_challenge);
    block
}

fn expect_kind(pool: &PoolEntry, kind: PoolKind) -> TpsResult<()> {
    if pool.kind != kind {
        return Err(TpsError::InvalidRequest(format!(
            "pool {} is a {:?} connector, expected {:?}",
            pool.id, pool.kind, kind
        )));
    }
    Ok(())
}

fn check_status(response: &ResponseFields) -> TpsResult<()> {
    match response.status()? {
        0 => Ok(()),
        status => Err(TpsError::BackendRejected { status }),
    }
}

fn parse_server_key_result(response: &ResponseFields) -> TpsResult<ServerKeyResult> {
    check_status(response)?;
    let public_key = response.require("public_key")?.to_string();
    let wrapped_private_key = match response.get("wrapped_priv_key") {
        Some(_) => response.require_hex("wrapped_priv_key")?,
        None => {
            warn!("escrow response carried no wrapped private key");
            Vec::new()
        }
    };
    let iv_param = match response.get("iv_param") {
        Some(_) => response.require_hex("iv_param")?,
        None => {
            warn!("escrow response carried no IV parameter");
            Vec::new()
        }
    };
    Ok(ServerKeyResult {
        public_key,
        wrapped_private_key,
        iv_param,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ec_sizes_map_to_allowed_curves() {
        assert_eq!(EcCurve::from_key_size(256), EcCurve::NistP256);
        assert_eq!(EcCurve::from_key_size(384), EcCurve::NistP384);
        assert_eq!(EcCurve::from_key_size(521), EcCurve::NistP521);
        assert_eq!(EcCurve::from_key_size(1024), EcCurve::NistP256);
        assert_eq!(EcCurve::NistP521.name(), "nistp521");
        assert_eq!(EcCurve::from_key_size(1024).bits(), 256);
    }

    #[test]
    fn missing_public_key_is_fatal_but_private_key_is_not() {
        let ok = ResponseFields::parse("status=0&public_key=MFkw&iv_param=0102");
        let result = parse_server_key_result(&ok).unwrap();
        assert_eq!(result.public_key, "MFkw");
        assert!(result.wrapped_private_key.is_empty());
        assert_eq!(result.iv_param, vec![1, 2]);

        let missing = ResponseFields::parse("status=0&wrapped_priv_key=AA");
        assert!(matches!(
            parse_server_key_result(&missing),
            Err(TpsError::MalformedResponse(_))
        ));
    }

    #[test]
    fn request_defaults_from_config() {
        let mut config = crate::config::MemoryConfigStore::new();
        assert_eq!(
            RequestDefaults::from_config(&config).unwrap(),
            RequestDefaults::default()
        );
        config
            .set("channel.defKeySet", "prodKeySet")
            .set("kra.keyGen.archive", "false");
        let defaults = RequestDefaults::from_config(&config).unwrap();
        assert_eq!(defaults.key_set, "prodKeySet");
        assert!(!defaults.archive);
    }

    #[test]
    fn nonzero_status_is_rejected() {
        let response = ResponseFields::parse("status=4&public_key=MFkw");
        assert!(matches!(
            parse_server_key_result(&response),
            Err(TpsError::BackendRejected { status: 4 })
        ));
    }
}
