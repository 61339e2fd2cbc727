//! Error types for the flow and the demo server

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::network::NetworkError;

/// Steps of a delegated flow, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Connect,
    MintCredential,
    Delegate,
    AuthorizeSession,
    Execute,
    ProvisionPkp,
    Encrypt,
    Decrypt,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::MintCredential => "mint_credential",
            Stage::Delegate => "delegate",
            Stage::AuthorizeSession => "authorize_session",
            Stage::Execute => "execute",
            Stage::ProvisionPkp => "provision_pkp",
            Stage::Encrypt => "encrypt",
            Stage::Decrypt => "decrypt",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a delegated flow stopped. Exactly one of these is returned per failed run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("Credential mint failed: {0}")]
    CredentialMint(String),

    #[error("Delegation failed: {0}")]
    Delegation(String),

    /// Expired grant or session, scope mismatch, or a bad signature
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// The network ran the action and reported a failure
    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Transport error during {stage}: {message}")]
    Transport { stage: Stage, message: String },

    #[error("PKP provisioning failed: {0}")]
    Provision(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// The network refused to release the key, or returned garbage
    #[error("Decryption failed: {0}")]
    Decryption(String),
}

impl FlowError {
    pub fn stage(&self) -> Stage {
        match self {
            FlowError::CredentialMint(_) => Stage::MintCredential,
            FlowError::Delegation(_) => Stage::Delegate,
            FlowError::Authorization(_) => Stage::AuthorizeSession,
            FlowError::Execution(_) => Stage::Execute,
            FlowError::Transport { stage, .. } => *stage,
            FlowError::Provision(_) => Stage::ProvisionPkp,
            FlowError::Encryption(_) => Stage::Encrypt,
            FlowError::Decryption(_) => Stage::Decrypt,
        }
    }

    /// Classify a network failure by the stage it happened in
    pub fn from_network(stage: Stage, err: NetworkError) -> Self {
        if err.is_transport() {
            return FlowError::Transport {
                stage,
                message: err.to_string(),
            };
        }
        let message = err.to_string();
        match stage {
            Stage::Connect => FlowError::Transport { stage, message },
            Stage::MintCredential => FlowError::CredentialMint(message),
            Stage::Delegate => FlowError::Delegation(message),
            Stage::AuthorizeSession => FlowError::Authorization(message),
            Stage::Execute => FlowError::Execution(message),
            Stage::ProvisionPkp => FlowError::Provision(message),
            Stage::Encrypt => FlowError::Encryption(message),
            Stage::Decrypt => FlowError::Decryption(message),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }
            AppError::Flow(e) => {
                tracing::error!("Flow error at {}: {}", e.stage(), e);
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
            AppError::NotFound(e) => (StatusCode::NOT_FOUND, e.clone()),
            AppError::BadRequest(e) => (StatusCode::BAD_REQUEST, e.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.clone())
            }
        };

        (status, message).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
