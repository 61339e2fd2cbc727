//! Integration tests for the HTTP network client

use litflow::capability::Scope;
use litflow::conditions::{AccessControlCondition, ConditionGate};
use litflow::config::{LitNetwork, NetworkConfig};
use litflow::error::FlowError;
use litflow::identity::keccak256;
use litflow::models::{ExecutionRequest, MintParams, SessionAuthorization};
use litflow::network::{HttpNetworkClient, NetworkClient, NetworkError};
use litflow::orchestrator::{DelegatedExecutionOrchestrator, FlowRequest};
use litflow::signer::{verify_auth_sig, LocalKeySigner, Signer, SiweMessage};
use std::sync::Arc;
use std::collections::BTreeMap;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SESSION_ID: &str = "sess_123";

async fn mount_handshake(mock_server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/handshake"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "sessionId": SESSION_ID,
            "network": "datil-dev"
        })))
        .mount(mock_server)
        .await;
}

async fn mount_blockhash(mock_server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/blockhash"))
        .and(header("x-lit-session", SESSION_ID))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "blockhash": "0xfeed" })),
        )
        .mount(mock_server)
        .await;
}

async fn mount_disconnect(mock_server: &MockServer) {
    Mock::given(method("DELETE"))
        .and(path(format!("/handshake/{}", SESSION_ID)))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(mock_server)
        .await;
}

fn client(mock_server: &MockServer) -> HttpNetworkClient {
    HttpNetworkClient::new(mock_server.uri(), LitNetwork::DatilDev)
}

#[tokio::test]
async fn test_connect_sends_api_key() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/handshake"))
        .and(header("x-api-key", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "sessionId": SESSION_ID,
            "network": "datil-dev"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let result = client(&mock_server).with_api_key("secret").connect().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_connect_rejects_wrong_network() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/handshake"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "sessionId": SESSION_ID,
            "network": "datil"
        })))
        .mount(&mock_server)
        .await;

    let result = client(&mock_server).connect().await;
    assert!(matches!(result, Err(NetworkError::Decode(_))));
}

#[tokio::test]
async fn test_connect_refused_is_transport() {
    let client = HttpNetworkClient::new("http://127.0.0.1:1", LitNetwork::DatilDev);
    let result = client.connect().await;
    assert!(matches!(result, Err(ref e) if e.is_transport()));
}

#[tokio::test]
async fn test_mint_capacity_credit() {
    let mock_server = MockServer::start().await;
    mount_handshake(&mock_server).await;

    Mock::given(method("POST"))
        .and(path("/capacity-credits"))
        .and(header("x-lit-session", SESSION_ID))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "capacityTokenIdStr": "4242"
        })))
        .mount(&mock_server)
        .await;

    let owner = LocalKeySigner::random();
    let session = client(&mock_server).connect().await.unwrap();
    let credential = session
        .mint_capacity_credential(owner.address(), &MintParams::default())
        .await
        .unwrap();

    assert_eq!(credential.token_id, "4242");
    assert_eq!(credential.requests_per_kilosecond, Some(10));
    assert!(credential.expires_at.is_some());
}

#[tokio::test]
async fn test_mint_capacity_credit_error() {
    let mock_server = MockServer::start().await;
    mount_handshake(&mock_server).await;

    Mock::given(method("POST"))
        .and(path("/capacity-credits"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_json(serde_json::json!({ "error": "mint reverted" })),
        )
        .mount(&mock_server)
        .await;

    let owner = LocalKeySigner::random();
    let session = client(&mock_server).connect().await.unwrap();
    let result = session
        .mint_capacity_credential(owner.address(), &MintParams::default())
        .await;

    match result {
        Err(NetworkError::Rejected { status, message }) => {
            assert_eq!(status, 500);
            assert!(message.contains("mint reverted"));
        }
        other => panic!("expected a rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_delegation_grant_is_signed_by_owner() {
    let mock_server = MockServer::start().await;
    mount_handshake(&mock_server).await;
    mount_blockhash(&mock_server).await;

    Mock::given(method("POST"))
        .and(path("/capacity-delegations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let owner = LocalKeySigner::random();
    let delegate = LocalKeySigner::random().address();
    let session = client(&mock_server).connect().await.unwrap();
    let grant = session
        .create_delegation_grant(&owner, "4242", &[delegate], 1)
        .await
        .unwrap();

    assert!(grant.permits(&delegate));
    assert_eq!(grant.auth_sig.address, owner.address());
    verify_auth_sig(&grant.auth_sig).unwrap();

    let (nonce, recaps) = SiweMessage::parse_fields(&grant.auth_sig.signed_message);
    assert_eq!(nonce.as_deref(), Some("0xfeed"));
    assert!(recaps[0].att.contains_key("lit-ratelimitincrease://4242"));
}

#[tokio::test]
async fn test_closed_session_refuses_requests() {
    let mock_server = MockServer::start().await;
    mount_handshake(&mock_server).await;
    mount_disconnect(&mock_server).await;

    let session = client(&mock_server).connect().await.unwrap();
    session.disconnect().await.unwrap();
    // a second disconnect is a no-op
    session.disconnect().await.unwrap();

    let result = session.latest_blockhash().await;
    assert!(matches!(result, Err(NetworkError::NotConnected)));
}

#[tokio::test]
async fn test_mint_pkp_checks_address() {
    let mock_server = MockServer::start().await;
    mount_handshake(&mock_server).await;

    let pkp = LocalKeySigner::random();
    Mock::given(method("POST"))
        .and(path("/pkps"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "tokenId": "99",
            "publicKey": pkp.public_key().to_string(),
            "ethAddress": LocalKeySigner::random().address().to_string()
        })))
        .mount(&mock_server)
        .await;

    let session = client(&mock_server).connect().await.unwrap();
    let result = session.mint_pkp(LocalKeySigner::random().address()).await;
    assert!(matches!(result, Err(NetworkError::Decode(_))));
}

async fn mount_flow(mock_server: &MockServer, pkp: &LocalKeySigner, digest: [u8; 32]) {
    mount_handshake(mock_server).await;
    mount_blockhash(mock_server).await;

    Mock::given(method("POST"))
        .and(path("/capacity-credits"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "capacityTokenIdStr": "4242"
        })))
        .mount(mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/capacity-delegations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/session-sigs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "sessionKey": "session-key",
            "resourceAbilityRequests": Scope::signing_and_execution(),
            "expiration": (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
            "signatures": { "node-1": { "sig": "0x00" } }
        })))
        .mount(mock_server)
        .await;

    let signature = pkp.sign_prehash(&digest).unwrap();
    Mock::given(method("POST"))
        .and(path("/execute"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "signatures": {
                "sig1": {
                    "signature": signature.to_hex(),
                    "publicKey": pkp.public_key().to_string(),
                    "dataSigned": format!("0x{}", hex::encode(digest))
                }
            },
            "response": "done",
            "logs": ""
        })))
        .mount(mock_server)
        .await;
}

#[tokio::test]
async fn test_full_flow_over_http() {
    let mock_server = MockServer::start().await;
    let pkp = LocalKeySigner::random();
    let message = [1u8, 2, 3, 4, 5];
    mount_flow(&mock_server, &pkp, keccak256(&message)).await;
    mount_disconnect(&mock_server).await;

    let network = Arc::new(client(&mock_server));
    let orchestrator = DelegatedExecutionOrchestrator::new(network, &NetworkConfig::default());
    let execution = ExecutionRequest::code("signEcdsa()")
        .signing_with(pkp.public_key())
        .sign_digest_of(&message, "sig1");
    let request = FlowRequest::new(
        Arc::new(LocalKeySigner::random()),
        Arc::new(LocalKeySigner::random()),
        execution,
    );

    let outcome = orchestrator.run(request).await.unwrap();

    assert_eq!(outcome.credential.token_id, "4242");
    assert_eq!(outcome.session.session_key, "session-key");
    let signature = &outcome.result.signatures["sig1"];
    assert_eq!(signature.recover_address().unwrap(), pkp.address());
}

#[tokio::test]
async fn test_action_error_over_http() {
    let mock_server = MockServer::start().await;
    let pkp = LocalKeySigner::random();
    mount_handshake(&mock_server).await;
    mount_blockhash(&mock_server).await;
    mount_disconnect(&mock_server).await;

    Mock::given(method("POST"))
        .and(path("/session-sigs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "sessionKey": "session-key",
            "resourceAbilityRequests": Scope::signing_and_execution(),
            "expiration": (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339()
        })))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/capacity-delegations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/execute"))
        .respond_with(ResponseTemplate::new(502).set_body_json(serde_json::json!({
            "success": false,
            "error": "ReferenceError: toSign is not defined"
        })))
        .mount(&mock_server)
        .await;

    let network = Arc::new(client(&mock_server));
    let orchestrator = DelegatedExecutionOrchestrator::new(network, &NetworkConfig::default());
    let request = FlowRequest::new(
        Arc::new(LocalKeySigner::random()),
        Arc::new(LocalKeySigner::random()),
        ExecutionRequest::code("oops()").signing_with(pkp.public_key()),
    )
    .with_credential("4242");

    let err = orchestrator.run(request).await.unwrap_err();
    match err {
        FlowError::Execution(message) => assert!(message.contains("toSign is not defined")),
        other => panic!("expected an execution error, got {:?}", other),
    }
}

fn session_for(delegate: &LocalKeySigner, scope: Scope) -> SessionAuthorization {
    SessionAuthorization {
        session_key: "session-key".to_string(),
        delegate: delegate.address(),
        scope,
        expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        node_signatures: BTreeMap::new(),
    }
}

#[tokio::test]
async fn test_gateway_rejection_on_execute_is_not_an_action_failure() {
    let mock_server = MockServer::start().await;
    mount_handshake(&mock_server).await;

    Mock::given(method("POST"))
        .and(path("/execute"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(serde_json::json!({ "error": "invalid session signature" })),
        )
        .mount(&mock_server)
        .await;

    let session = client(&mock_server).connect().await.unwrap();
    let result = session
        .execute(
            &session_for(&LocalKeySigner::random(), Scope::signing_and_execution()),
            &ExecutionRequest::code("go()"),
        )
        .await;

    match result {
        Err(NetworkError::Rejected { status, message }) => {
            assert_eq!(status, 401);
            assert!(message.contains("invalid session signature"));
        }
        other => panic!("expected a rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_action_on_execute_is_an_action_failure() {
    let mock_server = MockServer::start().await;
    mount_handshake(&mock_server).await;

    Mock::given(method("POST"))
        .and(path("/execute"))
        .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
            "success": false,
            "error": "conditions not met"
        })))
        .mount(&mock_server)
        .await;

    let session = client(&mock_server).connect().await.unwrap();
    let result = session
        .execute(
            &session_for(&LocalKeySigner::random(), Scope::signing_and_execution()),
            &ExecutionRequest::code("go()"),
        )
        .await;

    assert_eq!(
        result,
        Err(NetworkError::ActionFailed("conditions not met".to_string()))
    );
}

#[tokio::test]
async fn test_encrypt_sends_conditions_and_base64_data() {
    let mock_server = MockServer::start().await;
    mount_handshake(&mock_server).await;

    Mock::given(method("POST"))
        .and(path("/encrypt"))
        .and(header("x-lit-session", SESSION_ID))
        .and(body_partial_json(serde_json::json!({
            "chain": "ethereum",
            "dataToEncrypt": "c2VjcmV0"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ciphertext": "opaque",
            "dataToEncryptHash": "abc123"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let conditions = vec![AccessControlCondition::min_balance("ethereum", "1")];
    let session = client(&mock_server).connect().await.unwrap();
    let encrypted = session
        .encrypt(&conditions, "ethereum", b"secret")
        .await
        .unwrap();

    assert_eq!(encrypted.ciphertext, "opaque");
    assert_eq!(encrypted.data_to_encrypt_hash, "abc123");
    assert_eq!(encrypted.access_control_conditions, conditions);
    assert_eq!(encrypted.chain, "ethereum");
}

#[tokio::test]
async fn test_decrypt_returns_plaintext() {
    let mock_server = MockServer::start().await;
    mount_handshake(&mock_server).await;

    Mock::given(method("POST"))
        .and(path("/decrypt"))
        .and(body_partial_json(serde_json::json!({
            "sessionKey": "session-key",
            "ciphertext": "opaque",
            "dataToEncryptHash": "abc123"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "decryptedData": "c2VjcmV0"
        })))
        .mount(&mock_server)
        .await;

    let delegate = LocalKeySigner::random();
    let gate = ConditionGate::for_address(delegate.address());
    let encrypted = litflow::conditions::EncryptedData {
        ciphertext: "opaque".to_string(),
        data_to_encrypt_hash: "abc123".to_string(),
        access_control_conditions: gate.conditions,
        chain: gate.chain,
    };

    let session = client(&mock_server).connect().await.unwrap();
    let plaintext = session
        .decrypt(&session_for(&delegate, Scope::decryption()), &encrypted)
        .await
        .unwrap();

    assert_eq!(plaintext, b"secret");
}

#[tokio::test]
async fn test_decrypt_with_garbage_payload_is_a_decode_error() {
    let mock_server = MockServer::start().await;
    mount_handshake(&mock_server).await;

    Mock::given(method("POST"))
        .and(path("/decrypt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "decryptedData": "not base64!"
        })))
        .mount(&mock_server)
        .await;

    let delegate = LocalKeySigner::random();
    let gate = ConditionGate::for_address(delegate.address());
    let encrypted = litflow::conditions::EncryptedData {
        ciphertext: "opaque".to_string(),
        data_to_encrypt_hash: "abc123".to_string(),
        access_control_conditions: gate.conditions,
        chain: gate.chain,
    };

    let session = client(&mock_server).connect().await.unwrap();
    let result = session
        .decrypt(&session_for(&delegate, Scope::decryption()), &encrypted)
        .await;

    assert!(matches!(result, Err(NetworkError::Decode(_))));
}
