//! Signing provider for the audit chain.

use std::{collections::HashMap, path::Path, sync::Arc};

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use p256::ecdsa::{
    Signature, SigningKey, VerifyingKey,
    signature::{Signer, Verifier},
};
use pkcs8::{DecodePrivateKey, DecodePublicKey};

use crate::{
    config::ConfigStore,
    error::{TpsError, TpsResult},
};

const SIGNING_KEY_PREFIX: &str = "signing.keys";

pub trait AuditSigner: Send + Sync {
    fn sign(&self, data: &[u8]) -> TpsResult<Vec<u8>>;
}

/// ECDSA P-256 / SHA-256 signer.
pub struct EcdsaAuditSigner {
    key: SigningKey,
}

impl EcdsaAuditSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    pub fn from_pkcs8_pem(pem: &str) -> TpsResult<Self> {
        let key = SigningKey::from_pkcs8_pem(pem).map_err(TpsError::crypto)?;
        Ok(Self::new(key))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.key.verifying_key()
    }
}

impl AuditSigner for EcdsaAuditSigner {
    fn sign(&self, data: &[u8]) -> TpsResult<Vec<u8>> {
        let signature: Signature = self
            .key
            .try_sign(data)
            .map_err(TpsError::crypto)?;
        Ok(signature.to_bytes().to_vec())
    }
}

/// Base64 without any line terminators, as written into signature records.
pub fn encode_signature(raw: &[u8]) -> String {
    B64.encode(raw).replace(['\r', '\n'], "")
}

pub fn verify_signature(key: &VerifyingKey, data: &[u8], encoded: &str) -> bool {
    let Ok(raw) = B64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&raw) else {
        return false;
    };
    key.verify(data, &signature).is_ok()
}

pub fn verifying_key_from_pem(pem: &str) -> TpsResult<VerifyingKey> {
    VerifyingKey::from_public_key_pem(pem).map_err(TpsError::crypto)
}

/// Private keys looked up by logical nickname.
#[derive(Default, Clone)]
pub struct KeyRing {
    keys: HashMap<String, Arc<EcdsaAuditSigner>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, nickname: impl Into<String>, signer: EcdsaAuditSigner) {
        self.keys.insert(nickname.into(), Arc::new(signer));
    }

    pub fn find_private_key(&self, nickname: &str) -> Option<Arc<EcdsaAuditSigner>> {
        self.keys.get(nickname).cloned()
    }

    /// Load every `signing.keys.<nickname>` PEM path from configuration.
    pub fn from_config(config: &dyn ConfigStore) -> TpsResult<Self> {
        let mut ring = Self::new();
        for nickname in config.children(SIGNING_KEY_PREFIX) {
            let Some(path) = config.get(&format!("{SIGNING_KEY_PREFIX}.{nickname}")) else {
                continue;
            };
            ring.insert(nickname, load_pem_signer(Path::new(&path))?);
        }
        Ok(ring)
    }
}

fn load_pem_signer(path: &Path) -> TpsResult<EcdsaAuditSigner> {
    let pem = std::fs::read_to_string(path)
        .map_err(|e| TpsError::Config(format!("{}: {e}", path.display())))?;
    EcdsaAuditSigner::from_pkcs8_pem(&pem)
}
