//! HTTP handlers for the demo server
//!
//! `POST /flows` starts a delegated run in the background with a freshly
//! generated delegate key and returns immediately; the run's outcome is
//! recorded in the store and read back through `GET /flows/:id`. A flow that
//! carries access control conditions runs the conditional signing action.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::conditions::{AccessControlCondition, ConditionGate, DEFAULT_CHAIN};
use crate::error::{AppError, Result};
use crate::models::{ExecutionRequest, FlowRun, RunStatus};
use crate::orchestrator::{DelegationMode, FlowRequest};
use crate::signer::{LocalKeySigner, Signer};
use crate::AppState;

/// Signs `toSign` with `publicKey` and reports the share under `sigName`
pub const SIGN_ACTION: &str = r#"(async () => {
  const sigShare = await Lit.Actions.signEcdsa({ toSign, publicKey, sigName });
})();"#;

/// Signs only when `conditions` hold for the holder of `authSig`
pub const CONDITIONAL_SIGN_ACTION: &str = r#"(async () => {
  const allowed = await Lit.Actions.checkConditions({ conditions, authSig, chain });
  if (!allowed) {
    throw new Error("conditions not met");
  }
  const sigShare = await Lit.Actions.signEcdsa({ toSign, publicKey, sigName });
})();"#;

pub const DEFAULT_MESSAGE: [u8; 5] = [1, 2, 3, 4, 5];
pub const DEFAULT_SIG_NAME: &str = "sig1";

/// Action parameters the server fills in itself
const RESERVED_PARAMS: [&str; 6] = ["toSign", "sigName", "publicKey", "conditions", "chain", "authSig"];

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/flows", get(list_flows).post(submit_flow))
        .route("/flows/:id", get(get_flow))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SubmitFlow {
    /// Inline action source; defaults to a PKP signing action
    pub code: Option<String>,
    pub ipfs_id: Option<String>,
    /// Bytes whose keccak-256 digest the action signs
    pub message: Option<Vec<u8>>,
    pub sig_name: Option<String>,
    /// Extra action parameters
    pub params: Option<Map<String, Value>>,
    /// Conditions the action checks against the delegate before signing
    pub conditions: Option<Vec<AccessControlCondition>>,
    /// Chain the conditions are evaluated on, `ethereum` by default
    pub chain: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmittedFlow {
    pub id: Uuid,
    pub status: RunStatus,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

impl SubmitFlow {
    fn into_execution(self, state: &AppState) -> Result<ExecutionRequest> {
        let gate = match (self.conditions, self.chain) {
            (Some(conditions), chain) => Some(
                ConditionGate::new(conditions, chain.unwrap_or_else(|| DEFAULT_CHAIN.to_string()))
                    .map_err(|e| AppError::BadRequest(e.to_string()))?,
            ),
            (None, Some(_)) => {
                return Err(AppError::BadRequest(
                    "chain is only meaningful with conditions".to_string(),
                ))
            }
            (None, None) => None,
        };

        let mut request = match (self.code, self.ipfs_id) {
            (Some(_), Some(_)) => {
                return Err(AppError::BadRequest(
                    "Specify either code or ipfs_id, not both".to_string(),
                ))
            }
            (Some(code), None) if code.trim().is_empty() => {
                return Err(AppError::BadRequest("Action code is empty".to_string()))
            }
            (Some(code), None) => ExecutionRequest::code(code),
            (None, Some(cid)) => ExecutionRequest::ipfs(cid),
            (None, None) if gate.is_some() => ExecutionRequest::code(CONDITIONAL_SIGN_ACTION),
            (None, None) => ExecutionRequest::code(SIGN_ACTION),
        };

        for (name, value) in self.params.unwrap_or_default() {
            if RESERVED_PARAMS.contains(&name.as_str()) {
                return Err(AppError::BadRequest(format!(
                    "Parameter {} is set by the server",
                    name
                )));
            }
            request = request.with_param(name, value);
        }
        if let Some(gate) = gate {
            request = request.gated_by(gate);
        }

        let message = self.message.unwrap_or_else(|| DEFAULT_MESSAGE.to_vec());
        let sig_name = self
            .sig_name
            .unwrap_or_else(|| DEFAULT_SIG_NAME.to_string());

        Ok(request
            .signing_with(state.pkp.public_key.clone())
            .sign_digest_of(&message, &sig_name))
    }
}

async fn submit_flow(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitFlow>,
) -> Result<(StatusCode, Json<SubmittedFlow>)> {
    let execution = body.into_execution(&state)?;
    let delegate = LocalKeySigner::random();
    let run = state.store.create_run(delegate.address()).await?;

    let mut request = FlowRequest::new(state.owner.clone(), Arc::new(delegate), execution)
        .with_delegation(DelegationMode::Grant {
            uses: state.config.delegation_uses,
        });
    if let Some(id) = state.config.capacity_token_id() {
        request = request.with_credential(id);
    }

    tracing::info!("Accepted flow {}", run.id);
    let run_id = run.id;
    let task_state = state.clone();
    tokio::spawn(async move {
        record_outcome(&task_state, run_id, request).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmittedFlow {
            id: run.id,
            status: run.status,
        }),
    ))
}

async fn record_outcome(state: &AppState, run_id: Uuid, request: FlowRequest) {
    let recorded = match state.orchestrator.run(request).await {
        Ok(outcome) => {
            state
                .store
                .complete_run(run_id, &outcome.credential.token_id, &outcome.result)
                .await
        }
        Err(e) => state.store.fail_run(run_id, &e).await,
    };
    if let Err(e) = recorded {
        tracing::error!("Failed to record outcome of flow {}: {}", run_id, e);
    }
}

async fn get_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<FlowRun>> {
    Ok(Json(state.store.get_run(id).await?))
}

async fn list_flows(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<FlowRun>>> {
    let limit = params.limit.clamp(1, 100);
    Ok(Json(state.store.list_runs(limit).await?))
}
