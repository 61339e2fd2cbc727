//! Client interface to the key-management network
//!
//! A [`NetworkClient`] opens one [`NetworkSession`] per flow. Sessions share
//! nothing, so concurrent flows against the same client stay independent.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::Scope;
use crate::conditions::{AccessControlCondition, EncryptedData};
use crate::identity::{Address, PkpInfo};
use crate::models::{
    AuthSig, CapacityCredential, DelegationGrant, ExecutionRequest, ExecutionResult, MintParams,
    SessionAuthorization,
};
use crate::signer::{Signer, SignerError};

pub use http::HttpNetworkClient;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Connection-level failure; the request may not have arrived
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The action ran and reported an error payload
    #[error("Action failed: {0}")]
    ActionFailed(String),

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Session is not connected")]
    NotConnected,

    #[error("Signing failed: {0}")]
    Signer(#[from] SignerError),
}

impl NetworkError {
    pub fn is_transport(&self) -> bool {
        matches!(self, NetworkError::Transport(_) | NetworkError::NotConnected)
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            NetworkError::Decode(e.to_string())
        } else {
            NetworkError::Transport(e.to_string())
        }
    }
}

/// What the network asks the delegate to sign for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCallbackParams {
    pub resource_ability_requests: Scope,
    pub expiration: DateTime<Utc>,
    pub uri: String,
    /// Freshness nonce issued by the network
    pub nonce: String,
}

/// Produces the delegate's signature when the network needs one
#[async_trait]
pub trait AuthCallback: Send + Sync {
    async fn authenticate(&self, params: AuthCallbackParams) -> Result<AuthSig, SignerError>;
}

#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Open a session; the caller must `disconnect` it when done
    async fn connect(&self) -> Result<Box<dyn NetworkSession>, NetworkError>;
}

/// One connected session with the network
#[async_trait]
pub trait NetworkSession: Send + Sync {
    /// Latest block hash, used as a sign-in nonce
    async fn latest_blockhash(&self) -> Result<String, NetworkError>;

    async fn mint_capacity_credential(
        &self,
        owner: Address,
        params: &MintParams,
    ) -> Result<CapacityCredential, NetworkError>;

    async fn create_delegation_grant(
        &self,
        owner: &dyn Signer,
        credential_id: &str,
        delegatees: &[Address],
        uses: u32,
    ) -> Result<DelegationGrant, NetworkError>;

    async fn get_session_authorization(
        &self,
        delegate: Address,
        grants: &[DelegationGrant],
        requests: &Scope,
        expiration: DateTime<Utc>,
        callback: &dyn AuthCallback,
    ) -> Result<SessionAuthorization, NetworkError>;

    /// Run an action once. Never retried: actions may have irreversible effects.
    async fn execute(
        &self,
        session: &SessionAuthorization,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, NetworkError>;

    async fn mint_pkp(&self, owner: Address) -> Result<PkpInfo, NetworkError>;

    /// Encrypt `data` so only callers satisfying `conditions` can decrypt it.
    /// Needs no session authorization.
    async fn encrypt(
        &self,
        conditions: &[AccessControlCondition],
        chain: &str,
        data: &[u8],
    ) -> Result<EncryptedData, NetworkError>;

    /// Ask the network to release the plaintext; the session must hold
    /// decryption on the data's access control resource
    async fn decrypt(
        &self,
        session: &SessionAuthorization,
        encrypted: &EncryptedData,
    ) -> Result<Vec<u8>, NetworkError>;

    async fn disconnect(&self) -> Result<(), NetworkError>;
}
