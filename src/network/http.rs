//! HTTP binding to a network gateway

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{AuthCallback, AuthCallbackParams, NetworkClient, NetworkError, NetworkSession};
use crate::capability::Scope;
use crate::conditions::{AccessControlCondition, EncryptedData};
use crate::config::{LitNetwork, NetworkConfig};
use crate::identity::{Address, PkpInfo, PkpPublicKey};
use crate::models::{
    ActionDescriptor, ActionSignature, AuthSig, CapacityCredential, DelegationGrant,
    ExecutionRequest, ExecutionResult, MintParams, SessionAuthorization,
};
use crate::signer::{generate_auth_sig, Signer, SiweMessage};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const SESSION_HEADER: &str = "x-lit-session";
const DELEGATION_URI: &str = "lit:capability:delegation";
const DELEGATION_TTL_DAYS: i64 = 7;

/// Gateway client; each `connect` yields an independent session
#[derive(Debug, Clone)]
pub struct HttpNetworkClient {
    client: Client,
    base_url: String,
    network: LitNetwork,
    api_key: Option<String>,
}

impl HttpNetworkClient {
    pub fn new(base_url: impl Into<String>, network: LitNetwork) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            network,
            api_key: None,
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        let client = Self::new(&config.gateway_url, config.network);
        match config.api_key() {
            Some(key) => client.with_api_key(key),
            None => client,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl NetworkClient for HttpNetworkClient {
    async fn connect(&self) -> Result<Box<dyn NetworkSession>, NetworkError> {
        tracing::info!("Connecting to the {} network", self.network.as_str());

        let mut request = self
            .client
            .post(format!("{}/handshake", self.base_url))
            .json(&HandshakeRequest {
                network: self.network,
            });
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let handshake: HandshakeResponse = read_json(request.send().await?, "connect").await?;
        if handshake.network != self.network {
            return Err(NetworkError::Decode(format!(
                "gateway serves {}, expected {}",
                handshake.network.as_str(),
                self.network.as_str()
            )));
        }

        tracing::info!("Connected to the {} network", self.network.as_str());

        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            session_id: handshake.session_id,
            closed: AtomicBool::new(false),
        }))
    }
}

/// A connected gateway session
pub struct HttpSession {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    session_id: String,
    closed: AtomicBool,
}

impl HttpSession {
    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, NetworkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::NotConnected);
        }
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header(SESSION_HEADER, &self.session_id);
        if let Some(key) = &self.api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        Ok(builder)
    }
}

#[async_trait]
impl NetworkSession for HttpSession {
    async fn latest_blockhash(&self) -> Result<String, NetworkError> {
        let response = self.request(Method::GET, "/blockhash")?.send().await?;
        let body: BlockhashResponse = read_json(response, "get latest blockhash").await?;
        Ok(body.blockhash)
    }

    async fn mint_capacity_credential(
        &self,
        owner: Address,
        params: &MintParams,
    ) -> Result<CapacityCredential, NetworkError> {
        let response = self
            .request(Method::POST, "/capacity-credits")?
            .json(&MintCreditRequest {
                owner,
                params: *params,
            })
            .send()
            .await?;
        let body: MintCreditResponse = read_json(response, "mint capacity credit").await?;

        if body.capacity_token_id_str.trim().is_empty() {
            return Err(NetworkError::Decode(
                "mint response carried no token id".to_string(),
            ));
        }

        Ok(CapacityCredential {
            token_id: body.capacity_token_id_str,
            requests_per_kilosecond: Some(params.requests_per_kilosecond),
            expires_at: body.expires_at.or_else(|| params.expires_at(Utc::now())),
        })
    }

    async fn create_delegation_grant(
        &self,
        owner: &dyn Signer,
        credential_id: &str,
        delegatees: &[Address],
        uses: u32,
    ) -> Result<DelegationGrant, NetworkError> {
        let nonce = self.latest_blockhash().await?;
        let now = Utc::now();
        let to_sign = SiweMessage::new(
            owner.address(),
            DELEGATION_URI,
            nonce,
            now,
            now + Duration::days(DELEGATION_TTL_DAYS),
        )
        .with_capacity_delegation(credential_id, delegatees, uses)
        .render();
        let auth_sig = generate_auth_sig(owner, to_sign).await?;

        let response = self
            .request(Method::POST, "/capacity-delegations")?
            .json(&DelegationRequest {
                capacity_token_id: credential_id,
                delegatee_addresses: delegatees,
                uses: uses.to_string(),
                auth_sig: &auth_sig,
            })
            .send()
            .await?;
        check_status(response, "delegate capacity credit").await?;

        Ok(DelegationGrant {
            credential_id: credential_id.to_string(),
            delegator: owner.address(),
            delegatees: delegatees.to_vec(),
            uses,
            auth_sig,
        })
    }

    async fn get_session_authorization(
        &self,
        delegate: Address,
        grants: &[DelegationGrant],
        requests: &Scope,
        expiration: DateTime<Utc>,
        callback: &dyn AuthCallback,
    ) -> Result<SessionAuthorization, NetworkError> {
        let nonce = self.latest_blockhash().await?;
        let auth_sig = callback
            .authenticate(AuthCallbackParams {
                resource_ability_requests: requests.clone(),
                expiration,
                uri: format!("lit:session:{}", self.session_id),
                nonce,
            })
            .await?;

        let capability_auth_sigs: Vec<&AuthSig> = grants.iter().map(|g| &g.auth_sig).collect();
        let response = self
            .request(Method::POST, "/session-sigs")?
            .json(&SessionSigsRequest {
                delegate,
                capability_auth_sigs,
                resource_ability_requests: requests,
                expiration,
                auth_sig: &auth_sig,
            })
            .send()
            .await?;
        let body: SessionSigsResponse = read_json(response, "get session signatures").await?;

        Ok(SessionAuthorization {
            session_key: body.session_key,
            delegate,
            scope: body.resource_ability_requests,
            expires_at: body.expiration,
            node_signatures: body.signatures,
        })
    }

    async fn execute(
        &self,
        session: &SessionAuthorization,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, NetworkError> {
        let (code, ipfs_id) = match &request.action {
            ActionDescriptor::Code(code) => (Some(code.as_str()), None),
            ActionDescriptor::IpfsId(cid) => (None, Some(cid.as_str())),
        };

        let response = self
            .request(Method::POST, "/execute")?
            .json(&ExecuteRequest {
                session_key: &session.session_key,
                session_sigs: &session.node_signatures,
                code,
                ipfs_id,
                js_params: &request.params,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            // Only an explicit `success: false` means the action itself ran and failed
            if let Ok(ExecuteResponse {
                success: false,
                error,
                ..
            }) = serde_json::from_str::<ExecuteResponse>(&text)
            {
                return Err(NetworkError::ActionFailed(
                    error.unwrap_or_else(|| "action reported failure".to_string()),
                ));
            }
            return Err(NetworkError::Rejected {
                status: status.as_u16(),
                message: format!("Failed to execute action: {}", error_message(&text)),
            });
        }

        let body: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| NetworkError::Decode(format!("Failed to execute action: {}", e)))?;

        if !body.success {
            return Err(NetworkError::ActionFailed(
                body.error
                    .unwrap_or_else(|| "action reported failure".to_string()),
            ));
        }

        Ok(ExecutionResult {
            signatures: body.signatures,
            response: body.response,
            logs: body.logs,
        })
    }

    async fn mint_pkp(&self, owner: Address) -> Result<PkpInfo, NetworkError> {
        let response = self
            .request(Method::POST, "/pkps")?
            .json(&MintPkpRequest { owner })
            .send()
            .await?;
        let body: MintPkpResponse = read_json(response, "mint PKP").await?;

        let info = PkpInfo {
            token_id: Some(body.token_id),
            eth_address: body.public_key.eth_address(),
            public_key: body.public_key,
        };
        if info.eth_address != body.eth_address {
            return Err(NetworkError::Decode(format!(
                "PKP address {} does not match its public key",
                body.eth_address
            )));
        }
        Ok(info)
    }

    async fn encrypt(
        &self,
        conditions: &[AccessControlCondition],
        chain: &str,
        data: &[u8],
    ) -> Result<EncryptedData, NetworkError> {
        let response = self
            .request(Method::POST, "/encrypt")?
            .json(&EncryptRequest {
                access_control_conditions: conditions,
                chain,
                data_to_encrypt: STANDARD.encode(data),
            })
            .send()
            .await?;
        let body: EncryptResponse = read_json(response, "encrypt").await?;

        Ok(EncryptedData {
            ciphertext: body.ciphertext,
            data_to_encrypt_hash: body.data_to_encrypt_hash,
            access_control_conditions: conditions.to_vec(),
            chain: chain.to_string(),
        })
    }

    async fn decrypt(
        &self,
        session: &SessionAuthorization,
        encrypted: &EncryptedData,
    ) -> Result<Vec<u8>, NetworkError> {
        let response = self
            .request(Method::POST, "/decrypt")?
            .json(&DecryptRequest {
                session_key: &session.session_key,
                session_sigs: &session.node_signatures,
                encrypted,
            })
            .send()
            .await?;
        let body: DecryptResponse = read_json(response, "decrypt").await?;

        STANDARD
            .decode(body.decrypted_data)
            .map_err(|e| NetworkError::Decode(format!("Failed to decrypt: {}", e)))
    }

    async fn disconnect(&self) -> Result<(), NetworkError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut request = self
            .client
            .delete(format!("{}/handshake/{}", self.base_url, self.session_id));
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        check_status(request.send().await?, "disconnect").await?;
        Ok(())
    }
}

/// Pull a readable message out of an error body
pub(crate) fn error_message(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(body)) => body
            .get("error")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| text.to_string()),
        _ => text.to_string(),
    }
}

async fn check_status(response: Response, what: &str) -> Result<Response, NetworkError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    Err(NetworkError::Rejected {
        status: status.as_u16(),
        message: format!("Failed to {}: {}", what, error_message(&text)),
    })
}

async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, NetworkError> {
    check_status(response, what)
        .await?
        .json()
        .await
        .map_err(|e| NetworkError::Decode(format!("Failed to {}: {}", what, e)))
}

// Wire types

#[derive(Debug, Serialize)]
struct HandshakeRequest {
    network: LitNetwork,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeResponse {
    session_id: String,
    network: LitNetwork,
}

#[derive(Debug, Deserialize)]
struct BlockhashResponse {
    blockhash: String,
}

#[derive(Debug, Serialize)]
struct MintCreditRequest {
    owner: Address,
    #[serde(flatten)]
    params: MintParams,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MintCreditResponse {
    capacity_token_id_str: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DelegationRequest<'a> {
    capacity_token_id: &'a str,
    delegatee_addresses: &'a [Address],
    uses: String,
    auth_sig: &'a AuthSig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionSigsRequest<'a> {
    delegate: Address,
    capability_auth_sigs: Vec<&'a AuthSig>,
    resource_ability_requests: &'a Scope,
    expiration: DateTime<Utc>,
    auth_sig: &'a AuthSig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionSigsResponse {
    session_key: String,
    resource_ability_requests: Scope,
    expiration: DateTime<Utc>,
    #[serde(default)]
    signatures: BTreeMap<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest<'a> {
    session_key: &'a str,
    session_sigs: &'a BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipfs_id: Option<&'a str>,
    js_params: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    signatures: BTreeMap<String, ActionSignature>,
    #[serde(default)]
    response: Value,
    #[serde(default)]
    logs: String,
    #[serde(default)]
    error: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EncryptRequest<'a> {
    access_control_conditions: &'a [AccessControlCondition],
    chain: &'a str,
    /// Base64 plaintext
    data_to_encrypt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptResponse {
    ciphertext: String,
    data_to_encrypt_hash: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DecryptRequest<'a> {
    session_key: &'a str,
    session_sigs: &'a BTreeMap<String, Value>,
    #[serde(flatten)]
    encrypted: &'a EncryptedData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecryptResponse {
    /// Base64 plaintext
    decrypted_data: String,
}

#[derive(Debug, Serialize)]
struct MintPkpRequest {
    owner: Address,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MintPkpResponse {
    token_id: String,
    public_key: PkpPublicKey,
    eth_address: Address,
}
