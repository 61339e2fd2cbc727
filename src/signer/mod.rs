//! Signers for sign-in messages and capacity delegations
//!
//! The orchestrator never holds a key itself. Anything that can produce an
//! EIP-191 personal signature for an address implements [`Signer`]: a local
//! secp256k1 key, or a custodian reached over a channel (browser extension,
//! hardware wallet).

pub mod custody;
pub mod local;
pub mod siwe;

use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::identity::{keccak256, Address};
use crate::models::AuthSig;

pub use custody::{CustodySigner, SignRequest};
pub use local::LocalKeySigner;
pub use siwe::SiweMessage;

/// How an auth sig was produced, as the network expects it
pub const DERIVED_VIA: &str = "web3.eth.personal.sign";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Signing rejected: {0}")]
    Rejected(String),

    #[error("Signer unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    #[error("Signature recovers to {recovered}, expected {expected}")]
    AddressMismatch { expected: Address, recovered: Address },
}

/// Where the key behind a signer lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerKind {
    LocalKey,
    BrowserExtension,
    HardwareWallet,
}

impl SignerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignerKind::LocalKey => "local_key",
            SignerKind::BrowserExtension => "browser_extension",
            SignerKind::HardwareWallet => "hardware_wallet",
        }
    }
}

/// A personal-sign capability bound to one address
#[async_trait]
pub trait Signer: Send + Sync {
    /// Address the signatures are expected to recover to
    fn address(&self) -> Address;

    fn kind(&self) -> SignerKind;

    /// Produce an EIP-191 personal signature over `message`
    async fn sign_message(&self, message: &[u8]) -> Result<RecoverableSignature, SignerError>;
}

/// Hash a message the way `personal_sign` does
pub fn eip191_hash(message: &[u8]) -> [u8; 32] {
    let mut data = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    data.extend_from_slice(message);
    keccak256(&data)
}

/// 65-byte `r || s || v` signature
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature([u8; 65]);

impl RecoverableSignature {
    pub fn from_parts(signature: &Signature, recovery_id: RecoveryId) -> Self {
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&signature.to_bytes());
        bytes[64] = 27 + recovery_id.to_byte();
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignerError> {
        let bytes: [u8; 65] = bytes.try_into().map_err(|_| {
            SignerError::MalformedSignature(format!("expected 65 bytes, got {}", bytes.len()))
        })?;
        match bytes[64] {
            0 | 1 | 27 | 28 => Ok(Self(bytes)),
            v => Err(SignerError::MalformedSignature(format!(
                "invalid recovery byte {}",
                v
            ))),
        }
    }

    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    fn recovery_id(&self) -> Result<RecoveryId, SignerError> {
        let v = self.0[64];
        let normalized = if v >= 27 { v - 27 } else { v };
        RecoveryId::from_byte(normalized)
            .ok_or_else(|| SignerError::MalformedSignature(format!("invalid recovery byte {}", v)))
    }

    /// Recover the public key that signed a 32-byte digest
    pub fn recover_prehash(&self, digest: &[u8; 32]) -> Result<VerifyingKey, SignerError> {
        let signature = Signature::from_slice(&self.0[..64])
            .map_err(|e| SignerError::MalformedSignature(e.to_string()))?;
        VerifyingKey::recover_from_prehash(digest, &signature, self.recovery_id()?)
            .map_err(|e| SignerError::MalformedSignature(e.to_string()))
    }
}

impl std::fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecoverableSignature({})", self.to_hex())
    }
}

impl std::str::FromStr for RecoverableSignature {
    type Err = SignerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim().trim_start_matches("0x"))
            .map_err(|e| SignerError::MalformedSignature(e.to_string()))?;
        Self::from_slice(&raw)
    }
}

impl Serialize for RecoverableSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RecoverableSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Recover the address behind a personal signature
pub fn recover_signer(
    message: &[u8],
    signature: &RecoverableSignature,
) -> Result<Address, SignerError> {
    let key = signature.recover_prehash(&eip191_hash(message))?;
    Ok(Address::from_verifying_key(&key))
}

/// Sign `to_sign` and package it as an auth sig.
///
/// The signature is checked against the signer's address before it is
/// returned, so a signer that produces garbage fails here rather than at the
/// network.
pub async fn generate_auth_sig(
    signer: &dyn Signer,
    to_sign: String,
) -> Result<AuthSig, SignerError> {
    let expected = signer.address();
    let signature = signer.sign_message(to_sign.as_bytes()).await?;
    let recovered = recover_signer(to_sign.as_bytes(), &signature)?;
    if recovered != expected {
        return Err(SignerError::AddressMismatch {
            expected,
            recovered,
        });
    }

    Ok(AuthSig {
        sig: signature,
        derived_via: DERIVED_VIA.to_string(),
        signed_message: to_sign,
        address: expected,
    })
}

/// Check that an auth sig's signature recovers to its claimed address
pub fn verify_auth_sig(auth_sig: &AuthSig) -> Result<(), SignerError> {
    let recovered = recover_signer(auth_sig.signed_message.as_bytes(), &auth_sig.sig)?;
    if recovered != auth_sig.address {
        return Err(SignerError::AddressMismatch {
            expected: auth_sig.address,
            recovered,
        });
    }
    Ok(())
}
