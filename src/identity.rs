//! Ethereum-style identities used by the network: addresses and PKP public keys

use k256::ecdsa::VerifyingKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// Keccak-256 digest
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// A 20-byte account address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Derive the address controlled by a secp256k1 key
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.as_affine().to_encoded_point(false);
        // Skip the 0x04 SEC1 tag
        let hash = keccak256(&point.as_bytes()[1..]);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&hash[12..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex without the `0x` prefix
    pub fn to_hex_unprefixed(&self) -> String {
        hex::encode(self.0)
    }

    /// EIP-55 mixed-case checksum encoding
    pub fn to_checksum(&self) -> String {
        let lower = self.to_hex_unprefixed();
        let hash = keccak256(lower.as_bytes());
        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for (i, c) in lower.chars().enumerate() {
            let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
            if c.is_ascii_alphabetic() && nibble >= 8 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_checksum())
    }
}

impl std::str::FromStr for Address {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(strip_hex_prefix(s.trim()))
            .map_err(|e| IdentityError::InvalidAddress(format!("{}: {}", s, e)))?;
        let bytes: [u8; 20] = raw
            .try_into()
            .map_err(|_| IdentityError::InvalidAddress(format!("{}: expected 20 bytes", s)))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_checksum())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Public key of a Programmable Key Pair held by the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkpPublicKey(VerifyingKey);

impl PkpPublicKey {
    pub fn from_verifying_key(key: VerifyingKey) -> Self {
        Self(key)
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.0
    }

    /// Uncompressed SEC1 bytes (65 bytes, 0x04 tagged)
    pub fn to_uncompressed(&self) -> Vec<u8> {
        self.0.as_affine().to_encoded_point(false).as_bytes().to_vec()
    }

    pub fn eth_address(&self) -> Address {
        Address::from_verifying_key(&self.0)
    }
}

impl std::fmt::Display for PkpPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_uncompressed()))
    }
}

impl std::str::FromStr for PkpPublicKey {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(strip_hex_prefix(s.trim()))
            .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;
        VerifyingKey::from_sec1_bytes(&raw)
            .map(Self)
            .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))
    }
}

impl Serialize for PkpPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PkpPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A PKP as reported by the network or derived from a configured key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PkpInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    pub public_key: PkpPublicKey,
    pub eth_address: Address,
}

impl PkpInfo {
    /// Describe an existing PKP from its public key alone
    pub fn from_public_key(public_key: PkpPublicKey) -> Self {
        let eth_address = public_key.eth_address();
        Self {
            token_id: None,
            public_key,
            eth_address,
        }
    }
}
