//! HTTP client for the litflow demo server

use anyhow::{anyhow, bail, Result};
use reqwest::Client;
use std::time::Duration;
use uuid::Uuid;

use crate::messages::{FlowRun, RunStatus, SubmitFlow, SubmittedFlow};

pub struct LitflowClient {
    client: Client,
    base_url: String,
}

impl LitflowClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn health(&self) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("Server unhealthy: {}", response.status());
        }
        Ok(response.text().await?)
    }

    pub async fn submit(&self, request: &SubmitFlow) -> Result<SubmittedFlow> {
        let response = self
            .client
            .post(format!("{}/flows", self.base_url))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Failed to submit flow: {} - {}", status, text));
        }

        Ok(response.json().await?)
    }

    pub async fn get_flow(&self, id: Uuid) -> Result<FlowRun> {
        let response = self
            .client
            .get(format!("{}/flows/{}", self.base_url, id))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Failed to get flow: {} - {}", status, text));
        }

        Ok(response.json().await?)
    }

    pub async fn list_flows(&self, limit: u32) -> Result<Vec<FlowRun>> {
        let response = self
            .client
            .get(format!("{}/flows", self.base_url))
            .query(&[("limit", limit)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Failed to list flows: {} - {}", status, text));
        }

        Ok(response.json().await?)
    }

    /// Poll until the run leaves `pending` or `timeout` passes
    pub async fn wait(&self, id: Uuid, interval: Duration, timeout: Duration) -> Result<FlowRun> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.get_flow(id).await?;
            if run.status != RunStatus::Pending {
                return Ok(run);
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("Flow {} still pending after {:?}", id, timeout);
            }
            tracing::debug!("Flow {} pending", id);
            tokio::time::sleep(interval).await;
        }
    }
}
