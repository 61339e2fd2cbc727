//! In-process secp256k1 key

use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;

use super::{eip191_hash, RecoverableSignature, Signer, SignerError, SignerKind};
use crate::identity::{Address, PkpPublicKey};

/// Signer backed by a private key held in memory
#[derive(Clone)]
pub struct LocalKeySigner {
    key: SigningKey,
    address: Address,
}

impl LocalKeySigner {
    pub fn new(key: SigningKey) -> Self {
        let address = Address::from_verifying_key(key.verifying_key());
        Self { key, address }
    }

    /// Freshly generated identity
    pub fn random() -> Self {
        Self::new(SigningKey::random(&mut OsRng))
    }

    /// Parse a hex private key, with or without `0x`
    pub fn from_hex(private_key: &str) -> Result<Self, SignerError> {
        let raw = hex::decode(private_key.trim().trim_start_matches("0x"))
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        SigningKey::from_slice(&raw)
            .map(Self::new)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))
    }

    pub fn public_key(&self) -> PkpPublicKey {
        PkpPublicKey::from_verifying_key(self.key.verifying_key().clone())
    }

    /// Sign a 32-byte digest as-is
    pub fn sign_prehash(&self, digest: &[u8; 32]) -> Result<RecoverableSignature, SignerError> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(digest)
            .map_err(|e| SignerError::Rejected(e.to_string()))?;
        Ok(RecoverableSignature::from_parts(&signature, recovery_id))
    }
}

impl std::fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for LocalKeySigner {
    fn address(&self) -> Address {
        self.address
    }

    fn kind(&self) -> SignerKind {
        SignerKind::LocalKey
    }

    async fn sign_message(&self, message: &[u8]) -> Result<RecoverableSignature, SignerError> {
        self.sign_prehash(&eip191_hash(message))
    }
}
