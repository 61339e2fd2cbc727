//! In-memory network used by the integration tests
//!
//! Checks what a real gateway would check: auth sig recovery, sign-in nonces,
//! grant coverage and session expiry. Actions that ask for a signature are
//! signed with a local PKP key. Address conditions are evaluated against the
//! proving address; any other condition passes unless told otherwise.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use litflow::capability::{ResourceAbilityRequest, Scope};
use litflow::conditions::{AccessControlCondition, EncryptedData};
use litflow::identity::{keccak256, Address, PkpInfo, PkpPublicKey};
use litflow::models::{
    ActionSignature, AuthSig, CapacityCredential, DelegationGrant, ExecutionRequest,
    ExecutionResult, MintParams, SessionAuthorization,
};
use litflow::network::{AuthCallback, AuthCallbackParams, NetworkClient, NetworkError, NetworkSession};
use litflow::signer::{generate_auth_sig, verify_auth_sig, LocalKeySigner, Signer, SiweMessage};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Connect,
    Blockhash,
    Mint,
    Delegate,
    Session,
    Execute,
    MintPkp,
    Encrypt,
    Decrypt,
    Disconnect,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    failures: HashMap<Call, NetworkError>,
    granted_scope: Option<Scope>,
    asked_scope: Option<Scope>,
    stretched_expiration: Option<Duration>,
    expired_sessions: bool,
    empty_token_id: bool,
    conditions_unmet: bool,
    credit_owners: HashMap<String, Address>,
    /// Plaintexts by data hash
    secrets: HashMap<String, (Vec<u8>, Vec<AccessControlCondition>)>,
}

#[derive(Clone)]
pub struct FakeNetwork {
    pkp: Arc<LocalKeySigner>,
    state: Arc<Mutex<FakeState>>,
    next_id: Arc<AtomicU64>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self {
            pkp: Arc::new(LocalKeySigner::random()),
            state: Arc::new(Mutex::new(FakeState::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Make every `call` fail with `error`
    pub fn fail(self, call: Call, error: NetworkError) -> Self {
        self.state.lock().unwrap().failures.insert(call, error);
        self
    }

    /// Answer session requests with `scope` instead of the requested one
    pub fn grant_scope(self, scope: Scope) -> Self {
        self.state.lock().unwrap().granted_scope = Some(scope);
        self
    }

    /// Ask the delegate to sign for `scope` instead of the requested one
    pub fn ask_scope(self, scope: Scope) -> Self {
        self.state.lock().unwrap().asked_scope = Some(scope);
        self
    }

    /// Ask the delegate to sign for a session that outlives the requested one
    pub fn stretch_expiration(self, by: Duration) -> Self {
        self.state.lock().unwrap().stretched_expiration = Some(by);
        self
    }

    /// Fail every condition that is not an address check
    pub fn conditions_unmet(self) -> Self {
        self.state.lock().unwrap().conditions_unmet = true;
        self
    }

    pub fn expired_sessions(self) -> Self {
        self.state.lock().unwrap().expired_sessions = true;
        self
    }

    pub fn empty_token_id(self) -> Self {
        self.state.lock().unwrap().empty_token_id = true;
        self
    }

    pub fn pkp(&self) -> PkpPublicKey {
        self.pkp.public_key()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: Call) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

fn record(state: &Mutex<FakeState>, call: Call) -> Result<(), NetworkError> {
    let mut state = state.lock().unwrap();
    state.calls.push(call);
    match state.failures.get(&call) {
        Some(error) => Err(error.clone()),
        None => Ok(()),
    }
}

fn unauthorized(message: impl Into<String>) -> NetworkError {
    NetworkError::Rejected {
        status: 401,
        message: message.into(),
    }
}

#[async_trait]
impl NetworkClient for FakeNetwork {
    async fn connect(&self) -> Result<Box<dyn NetworkSession>, NetworkError> {
        record(&self.state, Call::Connect)?;
        Ok(Box::new(FakeSession {
            network: self.clone(),
            id: self.next_id(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeSession {
    network: FakeNetwork,
    id: u64,
    closed: AtomicBool,
}

impl FakeSession {
    fn enter(&self, call: Call) -> Result<(), NetworkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::NotConnected);
        }
        record(&self.network.state, call)
    }

    fn nonce(&self) -> String {
        format!("0x{:064x}", self.id)
    }

    fn conditions_hold(&self, conditions: &[AccessControlCondition], caller: Address) -> bool {
        let unmet = self.network.state.lock().unwrap().conditions_unmet;
        conditions.iter().all(|c| match c.required_address() {
            Some(address) => address == caller,
            None => !unmet,
        })
    }

    /// What a conditional signing action does before it signs
    fn check_conditions(
        &self,
        session: &SessionAuthorization,
        request: &ExecutionRequest,
    ) -> Result<(), NetworkError> {
        let Some(conditions) = request.params.get("conditions") else {
            return Ok(());
        };
        let conditions: Vec<AccessControlCondition> = serde_json::from_value(conditions.clone())
            .map_err(|e| NetworkError::ActionFailed(format!("conditions: {}", e)))?;
        let auth_sig: AuthSig = request
            .params
            .get("authSig")
            .cloned()
            .ok_or_else(|| NetworkError::ActionFailed("authSig is not defined".to_string()))
            .and_then(|v| {
                serde_json::from_value(v)
                    .map_err(|e| NetworkError::ActionFailed(format!("authSig: {}", e)))
            })?;
        verify_auth_sig(&auth_sig).map_err(|e| NetworkError::ActionFailed(e.to_string()))?;
        if auth_sig.address != session.delegate {
            return Err(NetworkError::ActionFailed(
                "authSig is not from the session holder".to_string(),
            ));
        }
        if !self.conditions_hold(&conditions, auth_sig.address) {
            return Err(NetworkError::ActionFailed("conditions not met".to_string()));
        }
        Ok(())
    }

    fn sign_action(&self, request: &ExecutionRequest) -> Result<ExecutionResult, NetworkError> {
        let mut result = ExecutionResult {
            response: Value::String("done".to_string()),
            ..ExecutionResult::default()
        };

        let Some(to_sign) = request.params.get("toSign") else {
            return Ok(result);
        };
        let bytes: Vec<u8> = serde_json::from_value(to_sign.clone())
            .map_err(|e| NetworkError::ActionFailed(format!("toSign: {}", e)))?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| NetworkError::ActionFailed("toSign must be 32 bytes".to_string()))?;
        let sig_name = request
            .params
            .get("sigName")
            .and_then(Value::as_str)
            .unwrap_or("sig");

        let signature = self
            .network
            .pkp
            .sign_prehash(&digest)
            .map_err(|e| NetworkError::ActionFailed(e.to_string()))?;
        result.signatures.insert(
            sig_name.to_string(),
            ActionSignature {
                signature,
                public_key: self.network.pkp.public_key(),
                data_signed: format!("0x{}", hex::encode(digest)),
                sig_type: "K256".to_string(),
            },
        );
        result.logs = format!("signed {}", sig_name);
        Ok(result)
    }
}

#[async_trait]
impl NetworkSession for FakeSession {
    async fn latest_blockhash(&self) -> Result<String, NetworkError> {
        self.enter(Call::Blockhash)?;
        Ok(self.nonce())
    }

    async fn mint_capacity_credential(
        &self,
        owner: Address,
        params: &MintParams,
    ) -> Result<CapacityCredential, NetworkError> {
        self.enter(Call::Mint)?;
        let mut state = self.network.state.lock().unwrap();
        let token_id = if state.empty_token_id {
            String::new()
        } else {
            format!("{}", 1000 + self.network.next_id())
        };
        state.credit_owners.insert(token_id.clone(), owner);

        Ok(CapacityCredential {
            token_id,
            requests_per_kilosecond: Some(params.requests_per_kilosecond),
            expires_at: params.expires_at(Utc::now()),
        })
    }

    async fn create_delegation_grant(
        &self,
        owner: &dyn Signer,
        credential_id: &str,
        delegatees: &[Address],
        uses: u32,
    ) -> Result<DelegationGrant, NetworkError> {
        self.enter(Call::Delegate)?;
        let holder = self
            .network
            .state
            .lock()
            .unwrap()
            .credit_owners
            .get(credential_id)
            .copied();
        if holder.is_some_and(|holder| holder != owner.address()) {
            return Err(unauthorized(format!(
                "{} does not own credit {}",
                owner.address(),
                credential_id
            )));
        }

        let now = Utc::now();
        let to_sign = SiweMessage::new(
            owner.address(),
            "lit:capability:delegation",
            self.nonce(),
            now,
            now + Duration::days(7),
        )
        .with_capacity_delegation(credential_id, delegatees, uses)
        .render();
        let auth_sig = generate_auth_sig(owner, to_sign).await?;

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
        self.enter(Call::Session)?;

        for grant in grants {
            verify_auth_sig(&grant.auth_sig).map_err(|e| unauthorized(e.to_string()))?;
            if !grant.permits(&delegate) {
                return Err(unauthorized(format!("grant does not cover {}", delegate)));
            }
        }

        let (asked_scope, asked_expiration) = {
            let state = self.network.state.lock().unwrap();
            (
                state.asked_scope.clone().unwrap_or_else(|| requests.clone()),
                expiration + state.stretched_expiration.unwrap_or_else(Duration::zero),
            )
        };
        let nonce = self.nonce();
        let auth_sig = callback
            .authenticate(AuthCallbackParams {
                resource_ability_requests: asked_scope,
                expiration: asked_expiration,
                uri: format!("lit:session:{}", self.id),
                nonce: nonce.clone(),
            })
            .await?;
        verify_auth_sig(&auth_sig).map_err(|e| unauthorized(e.to_string()))?;
        if auth_sig.address != delegate {
            return Err(unauthorized("session signed by the wrong address"));
        }
        let (signed_nonce, recaps) = SiweMessage::parse_fields(&auth_sig.signed_message);
        if signed_nonce.as_deref() != Some(nonce.as_str()) || recaps.is_empty() {
            return Err(unauthorized("stale or malformed session message"));
        }

        let state = self.network.state.lock().unwrap();
        let expires_at = if state.expired_sessions {
            Utc::now() - Duration::minutes(1)
        } else {
            expiration
        };
        let mut node_signatures = BTreeMap::new();
        node_signatures.insert(
            "node-1".to_string(),
            serde_json::json!({ "sig": auth_sig.sig.to_hex() }),
        );

        Ok(SessionAuthorization {
            session_key: format!("session-{}", self.id),
            delegate,
            scope: state.granted_scope.clone().unwrap_or_else(|| requests.clone()),
            expires_at,
            node_signatures,
        })
    }

    async fn execute(
        &self,
        session: &SessionAuthorization,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, NetworkError> {
        self.enter(Call::Execute)?;
        if session.is_expired_at(Utc::now()) {
            return Err(unauthorized("session expired"));
        }
        self.check_conditions(session, request)?;
        self.sign_action(request)
    }

    async fn mint_pkp(&self, _owner: Address) -> Result<PkpInfo, NetworkError> {
        self.enter(Call::MintPkp)?;
        Ok(PkpInfo {
            token_id: Some(format!("{}", self.network.next_id())),
            ..PkpInfo::from_public_key(self.network.pkp.public_key())
        })
    }

    async fn encrypt(
        &self,
        conditions: &[AccessControlCondition],
        chain: &str,
        data: &[u8],
    ) -> Result<EncryptedData, NetworkError> {
        self.enter(Call::Encrypt)?;
        let hash = hex::encode(keccak256(data));
        self.network
            .state
            .lock()
            .unwrap()
            .secrets
            .insert(hash.clone(), (data.to_vec(), conditions.to_vec()));

        Ok(EncryptedData {
            ciphertext: format!("sealed-{}", hash),
            data_to_encrypt_hash: hash,
            access_control_conditions: conditions.to_vec(),
            chain: chain.to_string(),
        })
    }

    async fn decrypt(
        &self,
        session: &SessionAuthorization,
        encrypted: &EncryptedData,
    ) -> Result<Vec<u8>, NetworkError> {
        self.enter(Call::Decrypt)?;
        if session.is_expired_at(Utc::now()) {
            return Err(unauthorized("session expired"));
        }
        let required = ResourceAbilityRequest::decryption(&encrypted.data_to_encrypt_hash);
        if !session.scope.covers(&required) {
            return Err(unauthorized(format!("session does not cover {}", required)));
        }

        let stored = self
            .network
            .state
            .lock()
            .unwrap()
            .secrets
            .get(&encrypted.data_to_encrypt_hash)
            .cloned();
        let Some((plaintext, conditions)) = stored else {
            return Err(NetworkError::Rejected {
                status: 404,
                message: "unknown ciphertext".to_string(),
            });
        };
        if conditions != encrypted.access_control_conditions {
            return Err(unauthorized("conditions do not match the ciphertext"));
        }
        if !self.conditions_hold(&conditions, session.delegate) {
            return Err(unauthorized("conditions not met"));
        }
        Ok(plaintext)
    }

    async fn disconnect(&self) -> Result<(), NetworkError> {
        self.closed.store(true, Ordering::SeqCst);
        record(&self.network.state, Call::Disconnect)
    }
}

/// The data signed in the happy-path scenario
pub const MESSAGE: [u8; 5] = [1, 2, 3, 4, 5];

pub fn digest_of_message() -> [u8; 32] {
    keccak256(&MESSAGE)
}
