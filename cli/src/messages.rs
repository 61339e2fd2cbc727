//! Wire types for the litflow demo server
//!
//! These mirror the server's JSON. Addresses, keys and signatures are kept as
//! strings; the CLI only displays them.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Body of `POST /flows`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitFlow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipfs_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Map<String, serde_json::Value>>,
    /// Access control conditions, passed through as JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedFlow {
    pub id: Uuid,
    pub status: RunStatus,
}

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

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSignature {
    pub signature: String,
    pub public_key: String,
    pub data_signed: String,
    #[serde(default)]
    pub sig_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    pub signatures: BTreeMap<String, ActionSignature>,
    #[serde(default)]
    pub response: serde_json::Value,
    #[serde(default)]
    pub logs: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub delegate: Option<String>,
    pub credential_id: Option<String>,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
    pub result: Option<ExecutionResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
