//! Delegated execution flow
//!
//! One run walks four stages in order, each gating the next:
//!
//! 1. acquire a capacity credential (reuse the configured one or mint),
//! 2. delegate it to the delegate identity,
//! 3. obtain a session authorization signed by the delegate,
//! 4. execute the action under that session.
//!
//! Every run opens its own network session and disconnects it on every exit
//! path. Nothing is retried and nothing is compensated: a credential minted
//! by a run that later fails is left on the network and logged so it can be
//! reused through `LIT_CAPACITY_CREDIT_TOKEN_ID`.
//!
//! Decryption walks the same first three stages and then asks the network for
//! the plaintext instead of running an action.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::capability::{ResourceAbilityRequest, Scope};
use crate::conditions::{AccessControlCondition, ConditionGate, EncryptedData};
use crate::config::NetworkConfig;
use crate::error::{FlowError, Stage};
use crate::identity::{PkpInfo, PkpPublicKey};
use crate::models::{
    AuthSig, CapacityCredential, DelegationGrant, ExecutionRequest, ExecutionResult, MintParams,
    SessionAuthorization,
};
use crate::network::{AuthCallback, AuthCallbackParams, NetworkClient, NetworkSession};
use crate::signer::{generate_auth_sig, Signer, SignerError, SiweMessage};

/// URI the delegate's condition proof is issued for
const CONDITION_PROOF_URI: &str = "http://localhost";

/// Whether stage 2 produces a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationMode {
    Grant { uses: u32 },
    /// Present no capacity delegation. Only the credential owner can
    /// authorize a session this way.
    Omit,
}

/// Inputs for one delegated run
#[derive(Clone)]
pub struct FlowRequest {
    pub owner: Arc<dyn Signer>,
    pub delegate: Arc<dyn Signer>,
    pub execution: ExecutionRequest,
    /// Existing credential to reuse instead of minting
    pub credential_id: Option<String>,
    pub delegation: DelegationMode,
    pub scope: Scope,
}

impl FlowRequest {
    /// PKP signing and Lit Action execution on every resource, one delegated use
    pub fn new(owner: Arc<dyn Signer>, delegate: Arc<dyn Signer>, execution: ExecutionRequest) -> Self {
        Self {
            owner,
            delegate,
            execution,
            credential_id: None,
            delegation: DelegationMode::Grant { uses: 1 },
            scope: Scope::signing_and_execution(),
        }
    }

    pub fn with_credential(mut self, credential_id: impl Into<String>) -> Self {
        self.credential_id = Some(credential_id.into());
        self
    }

    pub fn with_delegation(mut self, delegation: DelegationMode) -> Self {
        self.delegation = delegation;
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }
}

impl std::fmt::Debug for FlowRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRequest")
            .field("owner", &self.owner.address())
            .field("delegate", &self.delegate.address())
            .field("execution", &self.execution)
            .field("credential_id", &self.credential_id)
            .field("delegation", &self.delegation)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Inputs for decrypting data gated by access control conditions
#[derive(Clone)]
pub struct DecryptionRequest {
    pub owner: Arc<dyn Signer>,
    /// Must satisfy the data's conditions
    pub delegate: Arc<dyn Signer>,
    pub encrypted: EncryptedData,
    pub credential_id: Option<String>,
    pub delegation: DelegationMode,
    pub scope: Scope,
}

impl DecryptionRequest {
    /// Decryption on every access control resource, one delegated use
    pub fn new(owner: Arc<dyn Signer>, delegate: Arc<dyn Signer>, encrypted: EncryptedData) -> Self {
        Self {
            owner,
            delegate,
            encrypted,
            credential_id: None,
            delegation: DelegationMode::Grant { uses: 1 },
            scope: Scope::decryption(),
        }
    }

    pub fn with_credential(mut self, credential_id: impl Into<String>) -> Self {
        self.credential_id = Some(credential_id.into());
        self
    }

    pub fn with_delegation(mut self, delegation: DelegationMode) -> Self {
        self.delegation = delegation;
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Pair the session needs to release this data
    pub fn required_scope(&self) -> ResourceAbilityRequest {
        ResourceAbilityRequest::decryption(&self.encrypted.data_to_encrypt_hash)
    }
}

impl std::fmt::Debug for DecryptionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionRequest")
            .field("owner", &self.owner.address())
            .field("delegate", &self.delegate.address())
            .field("data_to_encrypt_hash", &self.encrypted.data_to_encrypt_hash)
            .field("credential_id", &self.credential_id)
            .field("delegation", &self.delegation)
            .field("scope", &self.scope)
            .finish()
    }
}

/// The parts of a request the first three stages read
struct Authority<'a> {
    owner: &'a dyn Signer,
    delegate: &'a dyn Signer,
    credential_id: Option<&'a str>,
    delegation: DelegationMode,
    scope: &'a Scope,
}

impl FlowRequest {
    fn authority(&self) -> Authority<'_> {
        Authority {
            owner: self.owner.as_ref(),
            delegate: self.delegate.as_ref(),
            credential_id: self.credential_id.as_deref(),
            delegation: self.delegation,
            scope: &self.scope,
        }
    }
}

impl DecryptionRequest {
    fn authority(&self) -> Authority<'_> {
        Authority {
            owner: self.owner.as_ref(),
            delegate: self.delegate.as_ref(),
            credential_id: self.credential_id.as_deref(),
            delegation: self.delegation,
            scope: &self.scope,
        }
    }
}

/// Output of stages 1 to 3
struct Authorized {
    credential: CapacityCredential,
    grants: Vec<DelegationGrant>,
    session: SessionAuthorization,
}

/// Artifacts of a successful run
#[derive(Debug, Clone)]
pub struct FlowOutcome {
    pub credential: CapacityCredential,
    pub grants: Vec<DelegationGrant>,
    pub session: SessionAuthorization,
    pub result: ExecutionResult,
}

/// Signs the session message the network hands back, as the delegate
struct DelegateAuthCallback<'a> {
    signer: &'a dyn Signer,
    expected_scope: &'a Scope,
    expected_expiration: DateTime<Utc>,
}

#[async_trait]
impl AuthCallback for DelegateAuthCallback<'_> {
    async fn authenticate(&self, params: AuthCallbackParams) -> Result<AuthSig, SignerError> {
        if &params.resource_ability_requests != self.expected_scope {
            return Err(SignerError::Rejected(format!(
                "asked to sign for {}, requested {}",
                params.resource_ability_requests, self.expected_scope
            )));
        }
        if params.expiration > self.expected_expiration {
            return Err(SignerError::Rejected(format!(
                "asked to sign until {}, requested {}",
                params.expiration, self.expected_expiration
            )));
        }

        let to_sign = SiweMessage::new(
            self.signer.address(),
            params.uri,
            params.nonce,
            Utc::now(),
            params.expiration,
        )
        .with_scope(&params.resource_ability_requests)
        .render();

        generate_auth_sig(self.signer, to_sign).await
    }
}

pub struct DelegatedExecutionOrchestrator {
    network: Arc<dyn NetworkClient>,
    mint_params: MintParams,
    session_ttl: chrono::Duration,
}

impl DelegatedExecutionOrchestrator {
    pub fn new(network: Arc<dyn NetworkClient>, config: &NetworkConfig) -> Self {
        Self {
            network,
            mint_params: config.mint_params(),
            session_ttl: config.session_ttl(),
        }
    }

    pub fn with_session_ttl(mut self, session_ttl: chrono::Duration) -> Self {
        self.session_ttl = session_ttl;
        self
    }

    /// Run all four stages. Returns the outcome or exactly one typed error.
    pub async fn run(&self, request: FlowRequest) -> Result<FlowOutcome, FlowError> {
        tracing::info!(
            "Starting delegated flow: owner {} delegate {}",
            request.owner.address(),
            request.delegate.address()
        );

        let session = self
            .network
            .connect()
            .await
            .map_err(|e| FlowError::from_network(Stage::Connect, e))?;

        let outcome = self.run_stages(session.as_ref(), &request).await;
        release(session.as_ref()).await;

        match &outcome {
            Ok(_) => tracing::info!("Delegated flow finished"),
            Err(e) => tracing::error!("Delegated flow failed at {}: {}", e.stage(), e),
        }
        outcome
    }

    async fn run_stages(
        &self,
        session: &dyn NetworkSession,
        request: &FlowRequest,
    ) -> Result<FlowOutcome, FlowError> {
        let authority = request.authority();
        let authorized = self.authorize_delegate(session, &authority).await?;

        let result = execute(session, request, &authorized.session)
            .await
            .inspect_err(|_| abandoned(&authority, &authorized.credential))?;

        Ok(FlowOutcome {
            credential: authorized.credential,
            grants: authorized.grants,
            session: authorized.session,
            result,
        })
    }

    /// Stages 1 to 3: credential, delegation, session
    async fn authorize_delegate(
        &self,
        session: &dyn NetworkSession,
        authority: &Authority<'_>,
    ) -> Result<Authorized, FlowError> {
        let credential = self.acquire_credential(session, authority).await?;

        let grants = delegate(session, authority, &credential)
            .await
            .inspect_err(|_| abandoned(authority, &credential))?;

        let authorization = self
            .authorize(session, authority, &grants)
            .await
            .inspect_err(|_| abandoned(authority, &credential))?;

        Ok(Authorized {
            credential,
            grants,
            session: authorization,
        })
    }

    /// Encrypt `data` under `conditions`. Needs no credential or session.
    pub async fn encrypt(
        &self,
        conditions: &[AccessControlCondition],
        chain: &str,
        data: &[u8],
    ) -> Result<EncryptedData, FlowError> {
        let gate = ConditionGate::new(conditions.to_vec(), chain)
            .map_err(|e| FlowError::Encryption(e.to_string()))?;

        let session = self
            .network
            .connect()
            .await
            .map_err(|e| FlowError::from_network(Stage::Connect, e))?;
        tracing::info!(
            "Encrypting {} byte(s) under {} condition(s) on {}",
            data.len(),
            gate.conditions.len(),
            gate.chain
        );
        let encrypted = session
            .encrypt(&gate.conditions, &gate.chain, data)
            .await
            .map_err(|e| FlowError::from_network(Stage::Encrypt, e));
        release(session.as_ref()).await;

        let encrypted = encrypted?;
        tracing::info!("Encrypted data {}", encrypted.data_to_encrypt_hash);
        Ok(encrypted)
    }

    /// Authorize the delegate for decryption and ask the network for the plaintext
    pub async fn decrypt(&self, request: DecryptionRequest) -> Result<Vec<u8>, FlowError> {
        tracing::info!(
            "Starting decryption of {} for {}",
            request.encrypted.data_to_encrypt_hash,
            request.delegate.address()
        );

        let session = self
            .network
            .connect()
            .await
            .map_err(|e| FlowError::from_network(Stage::Connect, e))?;

        let outcome = self.decrypt_stages(session.as_ref(), &request).await;
        release(session.as_ref()).await;

        match &outcome {
            Ok(plaintext) => tracing::info!("Decrypted {} byte(s)", plaintext.len()),
            Err(e) => tracing::error!("Decryption failed at {}: {}", e.stage(), e),
        }
        outcome
    }

    async fn decrypt_stages(
        &self,
        session: &dyn NetworkSession,
        request: &DecryptionRequest,
    ) -> Result<Vec<u8>, FlowError> {
        let authority = request.authority();
        let authorized = self.authorize_delegate(session, &authority).await?;

        let required = request.required_scope();
        if !authorized.session.scope.covers(&required) {
            abandoned(&authority, &authorized.credential);
            return Err(FlowError::Authorization(format!(
                "session does not cover {}",
                required
            )));
        }

        session
            .decrypt(&authorized.session, &request.encrypted)
            .await
            .map_err(|e| FlowError::from_network(Stage::Decrypt, e))
            .inspect_err(|_| abandoned(&authority, &authorized.credential))
    }

    async fn acquire_credential(
        &self,
        session: &dyn NetworkSession,
        authority: &Authority<'_>,
    ) -> Result<CapacityCredential, FlowError> {
        if let Some(id) = authority.credential_id.map(str::trim) {
            if !id.is_empty() {
                tracing::info!("Using provided capacity credit {}", id);
                return Ok(CapacityCredential::existing(id));
            }
        }

        tracing::info!(
            "Minting capacity credit: {} requests/ks, expires in {} day(s)",
            self.mint_params.requests_per_kilosecond,
            self.mint_params.days_until_utc_midnight_expiration
        );
        let credential = session
            .mint_capacity_credential(authority.owner.address(), &self.mint_params)
            .await
            .map_err(|e| FlowError::from_network(Stage::MintCredential, e))?;

        if credential.token_id.trim().is_empty() {
            return Err(FlowError::CredentialMint(
                "network returned no token id".to_string(),
            ));
        }
        tracing::info!("Minted capacity credit {}", credential.token_id);
        Ok(credential)
    }

    async fn authorize(
        &self,
        session: &dyn NetworkSession,
        authority: &Authority<'_>,
        grants: &[DelegationGrant],
    ) -> Result<SessionAuthorization, FlowError> {
        let delegate = authority.delegate.address();
        if grants.is_empty() && delegate != authority.owner.address() {
            return Err(FlowError::Authorization(format!(
                "{} holds no capacity delegation",
                delegate
            )));
        }
        if let Some(grant) = grants.iter().find(|g| !g.permits(&delegate)) {
            return Err(FlowError::Authorization(format!(
                "grant for credential {} does not cover {}",
                grant.credential_id, delegate
            )));
        }

        tracing::info!("Requesting session signatures for {}", authority.scope);
        let expiration = Utc::now()
            .checked_add_signed(self.session_ttl)
            .ok_or_else(|| {
                FlowError::Authorization(format!(
                    "session lifetime of {}s is out of range",
                    self.session_ttl.num_seconds()
                ))
            })?;
        let callback = DelegateAuthCallback {
            signer: authority.delegate,
            expected_scope: authority.scope,
            expected_expiration: expiration,
        };

        let authorization = session
            .get_session_authorization(delegate, grants, authority.scope, expiration, &callback)
            .await
            .map_err(|e| FlowError::from_network(Stage::AuthorizeSession, e))?;

        if &authorization.scope != authority.scope {
            return Err(FlowError::Authorization(format!(
                "network granted {}, requested {}",
                authorization.scope, authority.scope
            )));
        }
        if authorization.is_expired_at(Utc::now()) {
            return Err(FlowError::Authorization(format!(
                "session expired at {}",
                authorization.expires_at
            )));
        }

        tracing::info!("Session authorized until {}", authorization.expires_at);
        Ok(authorization)
    }

    /// Describe the PKP actions sign with, minting one when none is configured
    pub async fn provision_pkp(
        &self,
        owner: &dyn Signer,
        configured: Option<PkpPublicKey>,
    ) -> Result<PkpInfo, FlowError> {
        if let Some(public_key) = configured {
            tracing::info!("Using provided PKP {}", public_key);
            return Ok(PkpInfo::from_public_key(public_key));
        }

        tracing::info!("PKP wasn't provided, minting a new one");
        let session = self
            .network
            .connect()
            .await
            .map_err(|e| FlowError::from_network(Stage::Connect, e))?;
        let minted = session
            .mint_pkp(owner.address())
            .await
            .map_err(|e| FlowError::from_network(Stage::ProvisionPkp, e));
        release(session.as_ref()).await;

        let info = minted?;
        tracing::info!(
            "Minted PKP {} ({})",
            info.token_id.as_deref().unwrap_or("?"),
            info.eth_address
        );
        Ok(info)
    }
}

async fn delegate(
    session: &dyn NetworkSession,
    authority: &Authority<'_>,
    credential: &CapacityCredential,
) -> Result<Vec<DelegationGrant>, FlowError> {
    let uses = match authority.delegation {
        DelegationMode::Omit => {
            tracing::info!("Skipping capacity delegation");
            return Ok(Vec::new());
        }
        DelegationMode::Grant { uses } => uses,
    };
    if uses == 0 {
        return Err(FlowError::Delegation(
            "a grant needs at least one use".to_string(),
        ));
    }

    let delegate = authority.delegate.address();
    tracing::info!(
        "Delegating capacity credit {} to {} ({} use(s))",
        credential.token_id,
        delegate,
        uses
    );
    let grant = session
        .create_delegation_grant(authority.owner, &credential.token_id, &[delegate], uses)
        .await
        .map_err(|e| FlowError::from_network(Stage::Delegate, e))?;
    Ok(vec![grant])
}

async fn execute(
    session: &dyn NetworkSession,
    request: &FlowRequest,
    authorization: &SessionAuthorization,
) -> Result<ExecutionResult, FlowError> {
    let missing = authorization
        .scope
        .missing(&request.execution.required_scope());
    if !missing.is_empty() {
        let missing: Vec<String> = missing.iter().map(|m| m.to_string()).collect();
        return Err(FlowError::Authorization(format!(
            "session does not cover {}",
            missing.join(", ")
        )));
    }
    if authorization.is_expired_at(Utc::now()) {
        return Err(FlowError::Authorization(format!(
            "session expired at {}",
            authorization.expires_at
        )));
    }

    let proven;
    let execution = match &request.execution.conditions {
        Some(gate) => {
            let proof = condition_proof(session, request, authorization, gate).await?;
            proven = request.execution.with_condition_proof(&proof);
            &proven
        }
        None => &request.execution,
    };

    tracing::info!("Executing Lit Action");
    let result = session
        .execute(authorization, execution)
        .await
        .map_err(|e| FlowError::from_network(Stage::Execute, e))?;

    if let Some(key) = &request.execution.signing_key {
        if let Some((name, _)) = result.signatures.iter().find(|(_, sig)| !sig.verify(key)) {
            return Err(FlowError::Execution(format!(
                "signature {} does not verify against {}",
                name, key
            )));
        }
    }
    tracing::info!(
        "Lit Action executed with {} signature(s)",
        result.signatures.len()
    );
    Ok(result)
}

/// The delegate's sign-in proof the action checks its conditions against
async fn condition_proof(
    session: &dyn NetworkSession,
    request: &FlowRequest,
    authorization: &SessionAuthorization,
    gate: &ConditionGate,
) -> Result<AuthSig, FlowError> {
    tracing::info!(
        "Proving {} condition(s) on {} as {}",
        gate.conditions.len(),
        gate.chain,
        request.delegate.address()
    );
    let nonce = session
        .latest_blockhash()
        .await
        .map_err(|e| FlowError::from_network(Stage::Execute, e))?;
    let to_sign = SiweMessage::new(
        request.delegate.address(),
        CONDITION_PROOF_URI,
        nonce,
        Utc::now(),
        authorization.expires_at,
    )
    .with_scope(&authorization.scope)
    .render();

    generate_auth_sig(request.delegate.as_ref(), to_sign)
        .await
        .map_err(|e| FlowError::Authorization(format!("condition proof: {}", e)))
}

fn abandoned(authority: &Authority<'_>, credential: &CapacityCredential) {
    if authority.credential_id.is_none() {
        tracing::warn!(
            "Capacity credit {} was minted but the flow failed; it can be reused",
            credential.token_id
        );
    }
}

async fn release(session: &dyn NetworkSession) {
    if let Err(e) = session.disconnect().await {
        tracing::warn!("Failed to disconnect from the network: {}", e);
    }
}
