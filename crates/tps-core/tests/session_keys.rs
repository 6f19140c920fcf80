use std::sync::Arc;

use parking_lot::Mutex;
use tps_core::{
    ConnectionPool, Endpoint, EndpointList, EngineState, FailoverMode, KeyProvider,
    KeyRecoveryRequest, KeyType, PoolEntry, PoolKind, ResponseFields, ServerKeyGenRequest,
    SessionKeyEngine, SessionKeyRequest, SoftKeyProvider, SymmetricKey, TpsError, TpsResult,
    Transport, TransportResponse,
};

const TRANSPORT_KEY: &str = "404142434445464748494A4B4C4D4E4F";
const DIVERSIFICATION_KEY: &str = "0123456789ABCDEFFEDCBA9876543210";
const MAC_KEY: [u8; 16] = [
    0x10, 0x32, 0x54, 0x76, 0x98, 0xBA, 0xDC, 0xFE, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF,
];
const ENC_KEY: [u8; 16] = [
    0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6, 0x07, 0x18, 0x29, 0x3A, 0x4B, 0x5C, 0x6D, 0x7E, 0x8F, 0x90,
];

#[derive(Debug, Clone)]
struct Call {
    pool: String,
    endpoint: Endpoint,
    path: String,
    body: String,
}

/// Fails the first `failures` requests, then answers with `body`.
struct ScriptedBackend {
    failures: Mutex<usize>,
    body: String,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedBackend {
    fn new(failures: usize, body: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(failures),
            body: body.into(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

impl Transport for ScriptedBackend {
    fn send(
        &self,
        pool: &PoolEntry,
        endpoint: &Endpoint,
        path: &str,
        body: &str,
    ) -> TpsResult<TransportResponse> {
        self.calls.lock().push(Call {
            pool: pool.id.clone(),
            endpoint: endpoint.clone(),
            path: path.to_string(),
            body: body.to_string(),
        });
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(TpsError::Transport(format!("{endpoint} refused connection")));
        }
        Ok(TransportResponse {
            status: 200,
            body: self.body.clone(),
        })
    }
}

fn pools(retries: u32) -> ConnectionPool {
    let mut pools = ConnectionPool::new();
    let tks = EndpointList::new(vec![
        Endpoint::new("tks-a.example", 8443),
        Endpoint::new("tks-b.example", 8443),
    ])
    .unwrap()
    .with_retry_count(retries);
    pools.insert("tks1", PoolKind::Tks, tks).unwrap();
    let kra = EndpointList::new(vec![Endpoint::new("kra-a.example", 8443)])
        .unwrap()
        .with_retry_count(retries);
    pools.insert("kra1", PoolKind::Kra, kra).unwrap();
    pools
}

fn engine(backend: Arc<ScriptedBackend>, retries: u32) -> SessionKeyEngine {
    SessionKeyEngine::new(
        Arc::new(EngineState::new(pools(retries), FailoverMode::Independent)),
        backend,
        Arc::new(SoftKeyProvider::new()),
        SymmetricKey::from_hex(TRANSPORT_KEY).unwrap(),
        SymmetricKey::from_hex(DIVERSIFICATION_KEY).unwrap(),
    )
}

fn wrapped_hex(key: &[u8; 16]) -> String {
    let provider = SoftKeyProvider::new();
    let transport = SymmetricKey::from_hex(TRANSPORT_KEY).unwrap();
    let wrapped = provider
        .wrap_key(&transport, &SymmetricKey::from_bytes(key).unwrap())
        .unwrap();
    hex::encode_upper(wrapped)
}

fn session_body() -> String {
    format!(
        "status=0&sessionKey={}&encSessionKey={}&hostCryptogram=0102030405060708\
         &drm_trans_desKey=AABBCCDD&kek_wrapped_desKey=11223344&keycheck=C0FFEE",
        wrapped_hex(&MAC_KEY),
        wrapped_hex(&ENC_KEY)
    )
}

fn session_request(server_side_keygen: bool) -> SessionKeyRequest {
    SessionKeyRequest {
        cuid: vec![0x40, 0x90, 0x00, 0x01],
        key_diversification: vec![0x00, 0x01, 0x02, 0x03],
        card_challenge: [1, 2, 3, 4, 5, 6, 7, 8],
        host_challenge: [8, 7, 6, 5, 4, 3, 2, 1],
        card_cryptogram: vec![0xAA; 8],
        target_pool_id: "tks1".into(),
        key_set: "defKeySet".into(),
        server_side_keygen,
    }
}

fn triple(key: &[u8; 16]) -> Vec<u8> {
    let mut out = key.to_vec();
    out.extend_from_slice(&key[..8]);
    out
}

#[test]
fn session_keys_are_unwrapped_and_extended() {
    let backend = ScriptedBackend::new(0, session_body());
    let engine = engine(backend.clone(), 2);

    let result = engine.establish_session_key(&session_request(true)).unwrap();
    assert_eq!(result.mac_session_key.as_bytes(), triple(&MAC_KEY).as_slice());
    assert_eq!(result.enc_session_key.as_bytes(), triple(&ENC_KEY).as_slice());
    assert_eq!(result.host_cryptogram, [1, 2, 3, 4, 5, 6, 7, 8]);
    let keygen = result.server_keygen.expect("keygen material");
    assert_eq!(keygen.escrow_wrapped_key, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    assert_eq!(keygen.local_wrapped_key, vec![0x11, 0x22, 0x33, 0x44]);
    assert_eq!(keygen.key_check, vec![0xC0, 0xFF, 0xEE]);

    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].pool, "tks1");
    assert_eq!(calls[0].path, "/tks/agent/tks/computeSessionKey");
    let sent = ResponseFields::parse(&calls[0].body);
    assert_eq!(sent.get("CUID"), Some("40900001"));
    assert_eq!(sent.get("card_challenge"), Some("0102030405060708"));
    assert_eq!(sent.get("keySet"), Some("defKeySet"));
    assert_eq!(sent.get("serversideKeygen"), Some("true"));
}

#[test]
fn keygen_material_absent_unless_requested() {
    let backend = ScriptedBackend::new(0, session_body());
    let result = engine(backend, 0)
        .establish_session_key(&session_request(false))
        .unwrap();
    assert!(result.server_keygen.is_none());
}

#[test]
fn transport_failures_fail_over_then_succeed() {
    let backend = ScriptedBackend::new(1, session_body());
    let engine = engine(backend.clone(), 2);
    engine.establish_session_key(&session_request(false)).unwrap();

    let calls = backend.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].endpoint.host, "tks-a.example");
    assert_eq!(calls[1].endpoint.host, "tks-b.example");
    let pool = engine.state().get_pool("tks1").unwrap();
    assert_eq!(pool.endpoints.current_index(), 1);
}

#[test]
fn gives_up_after_retry_count_plus_one_attempts() {
    for retries in [0u32, 1, 4] {
        let backend = ScriptedBackend::new(usize::MAX, "");
        let engine = engine(backend.clone(), retries);
        let err = engine
            .establish_session_key(&session_request(false))
            .unwrap_err();
        assert!(matches!(
            err,
            TpsError::BackendUnreachable { ref pool, attempts } if pool == "tks1" && attempts == retries + 1
        ));
        assert_eq!(backend.calls().len(), retries as usize + 1);
    }
}

#[test]
fn backend_rejection_is_not_retried() {
    let backend = ScriptedBackend::new(0, "status=3");
    let err = engine(backend.clone(), 5)
        .establish_session_key(&session_request(false))
        .unwrap_err();
    assert!(matches!(err, TpsError::BackendRejected { status: 3 }));
    assert_eq!(backend.calls().len(), 1);
}

#[test]
fn malformed_responses_are_reported() {
    let short_cryptogram = session_body().replace("0102030405060708", "0102");
    let backend = ScriptedBackend::new(0, short_cryptogram);
    assert!(matches!(
        engine(backend, 0).establish_session_key(&session_request(false)),
        Err(TpsError::MalformedResponse(_))
    ));

    let backend = ScriptedBackend::new(0, "status=0&encSessionKey=00");
    assert!(matches!(
        engine(backend, 0).establish_session_key(&session_request(false)),
        Err(TpsError::MalformedResponse(_))
    ));
}

#[test]
fn pool_lookup_and_kind_are_checked() {
    let backend = ScriptedBackend::new(0, session_body());
    let engine = engine(backend.clone(), 0);
    let mut request = session_request(false);
    request.target_pool_id = "tks9".into();
    assert!(matches!(
        engine.establish_session_key(&request),
        Err(TpsError::PoolNotFound(_))
    ));
    request.target_pool_id = "kra1".into();
    assert!(matches!(
        engine.establish_session_key(&request),
        Err(TpsError::InvalidRequest(_))
    ));
    assert!(backend.calls().is_empty());
}

#[test]
fn host_cryptogram_is_deterministic_and_sensitive() {
    let engine = engine(ScriptedBackend::new(0, ""), 0);
    let card = [0x11; 8];
    let host = [0x22; 8];
    let first = engine.compute_host_cryptogram(&card, &host).unwrap();
    assert_eq!(first, engine.compute_host_cryptogram(&card, &host).unwrap());

    let mut flipped = host;
    flipped[7] ^= 0x01;
    assert_ne!(first, engine.compute_host_cryptogram(&card, &flipped).unwrap());
    let mut flipped = card;
    flipped[0] ^= 0x80;
    assert_ne!(first, engine.compute_host_cryptogram(&flipped, &host).unwrap());
}

#[test]
fn card_cryptogram_verification() {
    let engine = engine(ScriptedBackend::new(0, ""), 0);
    let card = [0x31; 8];
    let host = [0x42; 8];

    // The card MACs host || card under the same derived key.
    let provider = SoftKeyProvider::new();
    let diversification = SymmetricKey::from_hex(DIVERSIFICATION_KEY).unwrap();
    let mut challenges = card.to_vec();
    challenges.extend_from_slice(&host);
    let derived = provider.encrypt_ecb(&diversification, &challenges).unwrap();
    let session = provider
        .extend(SymmetricKey::from_bytes(&derived).unwrap())
        .unwrap();
    let mut reversed = host.to_vec();
    reversed.extend_from_slice(&card);
    let expected = provider.cbc_mac(&session, [0u8; 8], &reversed).unwrap();

    assert!(engine.verify_card_cryptogram(&card, &host, &expected).unwrap());
    let mut tampered = expected;
    tampered[3] ^= 0x04;
    assert!(!engine.verify_card_cryptogram(&card, &host, &tampered).unwrap());
    assert!(!engine.verify_card_cryptogram(&card, &host, &expected[..4]).unwrap());
}

#[test]
fn server_side_keygen_sends_curve_for_ec() {
    let backend = ScriptedBackend::new(
        0,
        "status=0&public_key=MFkwEwYHKoZI&wrapped_priv_key=DEADBEEF&iv_param=0001020304050607",
    );
    let engine = engine(backend.clone(), 0);
    let result = engine
        .server_side_key_generate(&ServerKeyGenRequest {
            cuid: vec![0x01, 0x02],
            user_id: "jdoe".into(),
            target_pool_id: "kra1".into(),
            escrow_wrapped_key: vec![0xAA, 0xBB],
            key_type: KeyType::Ec,
            key_size: 384,
            archive: true,
        })
        .unwrap();
    assert_eq!(result.public_key, "MFkwEwYHKoZI");
    assert_eq!(result.wrapped_private_key, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(result.iv_param, vec![0, 1, 2, 3, 4, 5, 6, 7]);

    let calls = backend.calls();
    assert_eq!(calls[0].path, "/kra/agent/kra/GenerateKeyPair");
    let sent = ResponseFields::parse(&calls[0].body);
    assert_eq!(sent.get("userid"), Some("jdoe"));
    assert_eq!(sent.get("drm_trans_desKey"), Some("AABB"));
    assert_eq!(sent.get("archive"), Some("true"));
    assert_eq!(sent.get("keytype"), Some("EC"));
    assert_eq!(sent.get("keysize"), Some("384"));
    assert_eq!(sent.get("eckeycurve"), Some("nistp384"));
}

#[test]
fn unsupported_ec_size_sends_fallback_curve_size() {
    let backend = ScriptedBackend::new(0, "status=0&public_key=MFkw");
    engine(backend.clone(), 0)
        .server_side_key_generate(&ServerKeyGenRequest {
            cuid: vec![0x01],
            user_id: "jdoe".into(),
            target_pool_id: "kra1".into(),
            escrow_wrapped_key: vec![0xAA],
            key_type: KeyType::Ec,
            key_size: 1024,
            archive: false,
        })
        .unwrap();
    let sent = ResponseFields::parse(&backend.calls()[0].body);
    assert_eq!(sent.get("keysize"), Some("256"));
    assert_eq!(sent.get("eckeycurve"), Some("nistp256"));
}

#[test]
fn rsa_keygen_omits_curve() {
    let backend = ScriptedBackend::new(0, "status=0&public_key=MIIB");
    engine(backend.clone(), 0)
        .server_side_key_generate(&ServerKeyGenRequest {
            cuid: vec![0x01],
            user_id: "jdoe".into(),
            target_pool_id: "kra1".into(),
            escrow_wrapped_key: vec![0xAA],
            key_type: KeyType::Rsa,
            key_size: 2048,
            archive: false,
        })
        .unwrap();
    let sent = ResponseFields::parse(&backend.calls()[0].body);
    assert_eq!(sent.get("keytype"), Some("RSA"));
    assert_eq!(sent.get("eckeycurve"), None);
}

#[test]
fn recovery_posts_certificate() {
    let backend = ScriptedBackend::new(0, "status=0&public_key=MIIB&wrapped_priv_key=0A0B");
    let result = engine(backend.clone(), 0)
        .recover_key(&KeyRecoveryRequest {
            cuid: vec![0x01],
            user_id: "jdoe".into(),
            target_pool_id: "kra1".into(),
            escrow_wrapped_key: vec![0xAA],
            certificate: "MIIC+/base64==".into(),
        })
        .unwrap();
    assert_eq!(result.wrapped_private_key, vec![0x0A, 0x0B]);
    assert!(result.iv_param.is_empty());
    let call = &backend.calls()[0];
    assert_eq!(call.path, "/kra/agent/kra/TokenKeyRecovery");
    assert_eq!(
        ResponseFields::parse(&call.body).get("cert"),
        Some("MIIC+/base64==")
    );
}
