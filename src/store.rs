//! Database store for flow runs

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, FlowError, Result};
use crate::identity::Address;
use crate::models::{ExecutionResult, FlowRun, RunStatus};

/// Database store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a new pending run
    pub async fn create_run(&self, delegate: Address) -> Result<FlowRun> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO runs (id, status, delegate, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(RunStatus::Pending.as_str())
        .bind(delegate.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(FlowRun {
            id,
            status: RunStatus::Pending,
            delegate: Some(delegate),
            credential_id: None,
            failed_stage: None,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn complete_run(
        &self,
        id: Uuid,
        credential_id: &str,
        result: &ExecutionResult,
    ) -> Result<()> {
        let result = serde_json::to_string(result)
            .map_err(|e| AppError::Internal(format!("Failed to encode result: {}", e)))?;

        let outcome = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?, credential_id = ?, result = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(RunStatus::Success.as_str())
        .bind(credential_id)
        .bind(result)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Run {} not found", id)));
        }
        Ok(())
    }

    pub async fn fail_run(&self, id: Uuid, error: &FlowError) -> Result<()> {
        let outcome = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?, failed_stage = ?, error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(RunStatus::Error.as_str())
        .bind(error.stage().as_str())
        .bind(error.to_string())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Run {} not found", id)));
        }
        Ok(())
    }

    pub async fn get_run(&self, id: Uuid) -> Result<FlowRun> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, status, delegate, credential_id, failed_stage, error, result, created_at, updated_at
            FROM runs
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Run {} not found", id)))?;

        row.try_into()
    }

    /// Most recent first
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<FlowRun>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, status, delegate, credential_id, failed_stage, error, result, created_at, updated_at
            FROM runs
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    status: String,
    delegate: Option<String>,
    credential_id: Option<String>,
    failed_stage: Option<String>,
    error: Option<String>,
    result: Option<String>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl TryFrom<RunRow> for FlowRun {
    type Error = AppError;

    fn try_from(row: RunRow) -> Result<Self> {
        let delegate = row
            .delegate
            .map(|s| s.parse::<Address>())
            .transpose()
            .map_err(|e| AppError::Internal(format!("Invalid delegate address: {}", e)))?;
        let result = row
            .result
            .map(|s| serde_json::from_str::<ExecutionResult>(&s))
            .transpose()
            .map_err(|e| AppError::Internal(format!("Invalid stored result: {}", e)))?;

        Ok(FlowRun {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| AppError::Internal(format!("Invalid UUID: {}", e)))?,
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid status: {}", e)))?,
            delegate,
            credential_id: row.credential_id,
            failed_stage: row.failed_stage,
            error: row.error,
            result,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
