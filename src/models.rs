//! Data models for credentials, delegations, sessions and executions

use chrono::{DateTime, Days, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::capability::{ResourceAbilityRequest, Scope, WILDCARD};
use crate::conditions::ConditionGate;
use crate::identity::{keccak256, Address, PkpPublicKey};
use crate::signer::{RecoverableSignature, SignerError};

/// Rate parameters for minting a capacity credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintParams {
    pub requests_per_kilosecond: u64,
    #[serde(rename = "daysUntilUTCMidnightExpiration")]
    pub days_until_utc_midnight_expiration: u32,
}

impl Default for MintParams {
    fn default() -> Self {
        Self {
            requests_per_kilosecond: 10,
            days_until_utc_midnight_expiration: 1,
        }
    }
}

impl MintParams {
    /// UTC midnight `days` days after `now`, or `None` past the calendar's end
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = now
            .date_naive()
            .checked_add_days(Days::new(u64::from(self.days_until_utc_midnight_expiration)))?;
        let midnight = date.and_hms_opt(0, 0, 0)?;
        Some(Utc.from_utc_datetime(&midnight))
    }
}

/// A rate-limited usage allowance on the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityCredential {
    pub token_id: String,
    /// Known only when this process minted the credential
    pub requests_per_kilosecond: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CapacityCredential {
    /// A credential minted elsewhere, known only by id
    pub fn existing(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            requests_per_kilosecond: None,
            expires_at: None,
        }
    }
}

/// Personal signature over a sign-in message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSig {
    pub sig: RecoverableSignature,
    pub derived_via: String,
    pub signed_message: String,
    pub address: Address,
}

/// Proof that a credential's usage was extended to other identities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationGrant {
    pub credential_id: String,
    pub delegator: Address,
    pub delegatees: Vec<Address>,
    pub uses: u32,
    pub auth_sig: AuthSig,
}

impl DelegationGrant {
    pub fn permits(&self, delegate: &Address) -> bool {
        self.uses > 0 && self.delegatees.contains(delegate)
    }
}

/// Short-lived, scoped authorization for execution calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAuthorization {
    pub session_key: String,
    pub delegate: Address,
    pub scope: Scope,
    pub expires_at: DateTime<Utc>,
    /// Per-node session signatures, opaque to this crate
    #[serde(default)]
    pub node_signatures: BTreeMap<String, Value>,
}

impl SessionAuthorization {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// The code a Lit Action runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionDescriptor {
    /// Inline JavaScript source
    Code(String),
    /// Code pinned on IPFS by content id
    IpfsId(String),
}

impl ActionDescriptor {
    /// Inline code has no content id to scope by, so it needs the wildcard
    pub fn resource_id(&self) -> &str {
        match self {
            ActionDescriptor::Code(_) => WILDCARD,
            ActionDescriptor::IpfsId(cid) => cid,
        }
    }
}

/// An action plus its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub action: ActionDescriptor,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// PKP the action signs with, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<PkpPublicKey>,
    /// Conditions the action checks before it signs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<ConditionGate>,
}

impl ExecutionRequest {
    pub fn new(action: ActionDescriptor) -> Self {
        Self {
            action,
            params: Map::new(),
            signing_key: None,
            conditions: None,
        }
    }

    pub fn code(source: impl Into<String>) -> Self {
        Self::new(ActionDescriptor::Code(source.into()))
    }

    pub fn ipfs(cid: impl Into<String>) -> Self {
        Self::new(ActionDescriptor::IpfsId(cid.into()))
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Sign with `key`; the key is also passed to the action as `publicKey`
    pub fn signing_with(mut self, key: PkpPublicKey) -> Self {
        self.params
            .insert("publicKey".to_string(), Value::String(key.to_string()));
        self.signing_key = Some(key);
        self
    }

    /// Ask the action to sign the keccak-256 digest of `data` under `sig_name`
    pub fn sign_digest_of(self, data: &[u8], sig_name: &str) -> Self {
        let digest = keccak256(data).to_vec();
        self.with_param("toSign", digest)
            .with_param("sigName", sig_name)
    }

    /// Have the action check `gate` against the delegate before signing
    pub fn gated_by(mut self, gate: ConditionGate) -> Self {
        self.conditions = Some(gate);
        self
    }

    /// Copy of this request carrying the delegate's proof for the conditions
    ///
    /// The action receives `conditions`, `chain` and `authSig` alongside its
    /// other parameters. Ungated requests are returned unchanged.
    pub fn with_condition_proof(&self, auth_sig: &AuthSig) -> Self {
        let mut request = self.clone();
        if let Some(gate) = &self.conditions {
            request.params.insert(
                "conditions".to_string(),
                serde_json::to_value(&gate.conditions).unwrap_or_default(),
            );
            request
                .params
                .insert("chain".to_string(), Value::String(gate.chain.clone()));
            request.params.insert(
                "authSig".to_string(),
                serde_json::to_value(auth_sig).unwrap_or_default(),
            );
        }
        request
    }

    /// Resource/ability pairs a session must hold to run this request
    pub fn required_scope(&self) -> Vec<ResourceAbilityRequest> {
        let mut required = vec![ResourceAbilityRequest::lit_action_execution(
            self.action.resource_id(),
        )];
        if let Some(key) = &self.signing_key {
            required.push(ResourceAbilityRequest::pkp_signing(key.to_string()));
        }
        required
    }
}

/// A combined signature returned by an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSignature {
    pub signature: RecoverableSignature,
    pub public_key: PkpPublicKey,
    /// Hex digest that was signed
    pub data_signed: String,
    #[serde(default = "default_sig_type")]
    pub sig_type: String,
}

fn default_sig_type() -> String {
    "K256".to_string()
}

impl ActionSignature {
    fn digest(&self) -> Result<[u8; 32], SignerError> {
        let raw = hex::decode(self.data_signed.trim_start_matches("0x"))
            .map_err(|e| SignerError::MalformedSignature(e.to_string()))?;
        raw.try_into()
            .map_err(|_| SignerError::MalformedSignature("signed data is not 32 bytes".into()))
    }

    pub fn recover_public_key(&self) -> Result<PkpPublicKey, SignerError> {
        let key = self.signature.recover_prehash(&self.digest()?)?;
        Ok(PkpPublicKey::from_verifying_key(key))
    }

    pub fn recover_address(&self) -> Result<Address, SignerError> {
        Ok(self.recover_public_key()?.eth_address())
    }

    /// Whether the signature recovers to `expected`
    pub fn verify(&self, expected: &PkpPublicKey) -> bool {
        self.recover_public_key()
            .map(|key| &key == expected)
            .unwrap_or(false)
    }
}

/// What an action produced
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    pub signatures: BTreeMap<String, ActionSignature>,
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub logs: String,
}

/// Status of a recorded flow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// A flow run as recorded by the demo server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub delegate: Option<Address>,
    pub credential_id: Option<String>,
    /// Stage that failed, for error runs
    pub failed_stage: Option<String>,
    pub error: Option<String>,
    pub result: Option<ExecutionResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
