//! Symmetric key handles and the triple-DES operations used by the secure
//! channel: transport-key unwrap, key-length extension and CBC-MAC.

use std::fmt;

use des::{
    TdesEde3,
    cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray},
};
use zeroize::Zeroizing;

use crate::error::{TpsError, TpsResult};

pub const DES_BLOCK_LEN: usize = 8;
pub const DOUBLE_KEY_LEN: usize = 16;
pub const TRIPLE_KEY_LEN: usize = 24;
/// Session keys travel wrapped as exactly one double-length key.
pub const WRAPPED_KEY_LEN: usize = 16;

/// Owned symmetric key material. Zeroized when dropped, never cloned, so a
/// handle is released exactly once by whoever owns it last.
pub struct SymmetricKey {
    material: Zeroizing<Vec<u8>>,
}

impl SymmetricKey {
    pub fn from_bytes(bytes: &[u8]) -> TpsResult<Self> {
        match bytes.len() {
            DOUBLE_KEY_LEN | TRIPLE_KEY_LEN => Ok(Self {
                material: Zeroizing::new(bytes.to_vec()),
            }),
            other => Err(TpsError::KeyOperationFailed(format!(
                "unsupported triple-DES key length {other}"
            ))),
        }
    }

    pub fn from_hex(hex_key: &str) -> TpsResult<Self> {
        let bytes = Zeroizing::new(hex::decode(hex_key.trim()).map_err(TpsError::crypto)?);
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.material
    }

    pub fn len(&self) -> usize {
        self.material.len()
    }

    pub fn is_empty(&self) -> bool {
        self.material.is_empty()
    }

    pub fn is_triple_length(&self) -> bool {
        self.material.len() == TRIPLE_KEY_LEN
    }

    fn cipher(&self) -> TpsResult<TdesEde3> {
        let mut key = Zeroizing::new([0u8; TRIPLE_KEY_LEN]);
        match self.material.len() {
            TRIPLE_KEY_LEN => key.copy_from_slice(&self.material),
            DOUBLE_KEY_LEN => {
                key[..DOUBLE_KEY_LEN].copy_from_slice(&self.material);
                key[DOUBLE_KEY_LEN..].copy_from_slice(&self.material[..DES_BLOCK_LEN]);
            }
            other => {
                return Err(TpsError::KeyOperationFailed(format!(
                    "unsupported triple-DES key length {other}"
                )));
            }
        }
        TdesEde3::new_from_slice(key.as_slice()).map_err(TpsError::crypto)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("len", &self.material.len())
            .finish_non_exhaustive()
    }
}

/// Symmetric-key provider. Implementations may be backed by a token; the
/// software one below keeps material in process memory.
pub trait KeyProvider: Send + Sync {
    /// Decrypt a 16-byte wrapped key under the transport key (3DES-ECB, no padding).
    fn unwrap_key(&self, transport: &SymmetricKey, wrapped: &[u8]) -> TpsResult<SymmetricKey>;

    /// Inverse of [`KeyProvider::unwrap_key`].
    fn wrap_key(&self, transport: &SymmetricKey, key: &SymmetricKey) -> TpsResult<Vec<u8>>;

    /// Derive an 8-byte sub-key from `key`, keyed on the key itself.
    fn derive8(&self, key: &SymmetricKey) -> TpsResult<[u8; DES_BLOCK_LEN]>;

    fn encrypt_ecb(&self, key: &SymmetricKey, data: &[u8]) -> TpsResult<Vec<u8>>;

    /// Triple-DES CBC-MAC without padding; returns the last cipher block.
    fn cbc_mac(
        &self,
        key: &SymmetricKey,
        icv: [u8; DES_BLOCK_LEN],
        data: &[u8],
    ) -> TpsResult<[u8; DES_BLOCK_LEN]>;

    /// Extend a double-length key to `K1 || K2 || derive8(K)`. The input handle
    /// is consumed and released here.
    fn extend(&self, key: SymmetricKey) -> TpsResult<SymmetricKey> {
        if key.is_triple_length() {
            return Ok(key);
        }
        if key.len() != DOUBLE_KEY_LEN {
            return Err(TpsError::KeyOperationFailed(format!(
                "cannot extend key of length {}",
                key.len()
            )));
        }
        let tail = Zeroizing::new(self.derive8(&key)?);
        let mut extended = Zeroizing::new(Vec::with_capacity(TRIPLE_KEY_LEN));
        extended.extend_from_slice(key.as_bytes());
        extended.extend_from_slice(tail.as_slice());
        SymmetricKey::from_bytes(&extended)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SoftKeyProvider;

impl SoftKeyProvider {
    pub fn new() -> Self {
        Self
    }
}

fn require_blocks(data: &[u8]) -> TpsResult<()> {
    if data.is_empty() || data.len() % DES_BLOCK_LEN != 0 {
        return Err(TpsError::KeyOperationFailed(format!(
            "data length {} is not a positive multiple of {DES_BLOCK_LEN}",
            data.len()
        )));
    }
    Ok(())
}

impl KeyProvider for SoftKeyProvider {
    fn unwrap_key(&self, transport: &SymmetricKey, wrapped: &[u8]) -> TpsResult<SymmetricKey> {
        if wrapped.len() != WRAPPED_KEY_LEN {
            return Err(TpsError::KeyOperationFailed(format!(
                "wrapped key must be {WRAPPED_KEY_LEN} bytes, got {}",
                wrapped.len()
            )));
        }
        let cipher = transport.cipher()?;
        let mut plain = Zeroizing::new(wrapped.to_vec());
        for chunk in plain.chunks_exact_mut(DES_BLOCK_LEN) {
            cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        }
        SymmetricKey::from_bytes(&plain)
    }

    fn wrap_key(&self, transport: &SymmetricKey, key: &SymmetricKey) -> TpsResult<Vec<u8>> {
        if key.len() != DOUBLE_KEY_LEN {
            return Err(TpsError::KeyOperationFailed(
                "only double-length keys can be wrapped for transport".into(),
            ));
        }
        self.encrypt_ecb(transport, key.as_bytes())
    }

    fn derive8(&self, key: &SymmetricKey) -> TpsResult<[u8; DES_BLOCK_LEN]> {
        // Extract-key-from-key at bit offset 0: the first DES component.
        let bytes = key.as_bytes();
        if bytes.len() < DES_BLOCK_LEN {
            return Err(TpsError::crypto("key too short for sub-key extraction"));
        }
        let mut out = [0u8; DES_BLOCK_LEN];
        out.copy_from_slice(&bytes[..DES_BLOCK_LEN]);
        Ok(out)
    }

    fn encrypt_ecb(&self, key: &SymmetricKey, data: &[u8]) -> TpsResult<Vec<u8>> {
        require_blocks(data)?;
        let cipher = key.cipher()?;
        let mut out = data.to_vec();
        for chunk in out.chunks_exact_mut(DES_BLOCK_LEN) {
            cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        }
        Ok(out)
    }

    fn cbc_mac(
        &self,
        key: &SymmetricKey,
        icv: [u8; DES_BLOCK_LEN],
        data: &[u8],
    ) -> TpsResult<[u8; DES_BLOCK_LEN]> {
        require_blocks(data)?;
        let cipher = key.cipher()?;
        let mut chain = icv;
        for chunk in data.chunks_exact(DES_BLOCK_LEN) {
            for (c, d) in chain.iter_mut().zip(chunk) {
                *c ^= d;
            }
            cipher.encrypt_block(GenericArray::from_mut_slice(&mut chain));
        }
        Ok(chain)
    }
}
