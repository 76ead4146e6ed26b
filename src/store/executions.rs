//! Execution history persistence.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::automation::context::{
    ComponentResult, Execution, ExecutionStatus, TriggerEvent,
};

type ExecutionRow = (
    Uuid,                  // id
    Uuid,                  // automation_id
    String,                // status
    Value,                 // trigger_data
    Option<Value>,         // component_results
    Option<String>,        // error
    DateTime<Utc>,         // started_at
    Option<DateTime<Utc>>, // completed_at
    Option<i64>,           // duration_ms
);

const SELECT_COLUMNS: &str =
    "id, automation_id, status, trigger_data, component_results, error, started_at, completed_at, duration_ms";

#[derive(Clone)]
pub struct ExecutionStore {
    pool: PgPool,
}

impl ExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a fresh PENDING row for an incoming trigger.
    pub async fn insert_pending(
        &self,
        id: Uuid,
        automation_id: Uuid,
        event: &TriggerEvent,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO executions (id, automation_id, status, trigger_data, started_at)
            VALUES ($1, $2, 'PENDING', $3, NOW())
            "#,
        )
        .bind(id)
        .bind(automation_id)
        .bind(serde_json::to_value(event).unwrap_or(Value::Null))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_running(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE executions SET status = 'RUNNING' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Finalize a run with its full result tree.
    pub async fn finalize(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        results: &[ComponentResult],
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE executions
            SET status = $2, component_results = $3, error = $4,
                completed_at = NOW(),
                duration_ms = EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(serde_json::to_value(results).unwrap_or(Value::Null))
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Execution>, sqlx::Error> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM executions WHERE id = $1",
            SELECT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(row_to_execution))
    }

    pub async fn list(
        &self,
        automation_id: Option<Uuid>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Execution>, sqlx::Error> {
        let rows: Vec<ExecutionRow> = if let Some(automation_id) = automation_id {
            sqlx::query_as(&format!(
                "SELECT {} FROM executions WHERE automation_id = $1 \
                 ORDER BY started_at DESC LIMIT $2 OFFSET $3",
                SELECT_COLUMNS
            ))
            .bind(automation_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(&format!(
                "SELECT {} FROM executions ORDER BY started_at DESC LIMIT $1 OFFSET $2",
                SELECT_COLUMNS
            ))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows.into_iter().filter_map(row_to_execution).collect())
    }

    /// Aggregates for one rule's history.
    pub async fn stats(&self, automation_id: Uuid) -> Result<ExecutionStats, sqlx::Error> {
        let row: (i64, i64, i64, i64, Option<f64>) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE status = 'SUCCESS'),
                COUNT(*) FILTER (WHERE status = 'FAILED'),
                COUNT(*) FILTER (WHERE status IN ('PENDING', 'RUNNING')),
                AVG(duration_ms)::double precision
            FROM executions
            WHERE automation_id = $1
            "#,
        )
        .bind(automation_id)
        .fetch_one(&self.pool)
        .await?;

        let (total, succeeded, failed, in_flight, avg_duration_ms) = row;
        let finished = succeeded + failed;
        Ok(ExecutionStats {
            automation_id,
            total,
            succeeded,
            failed,
            in_flight,
            success_rate: if finished > 0 {
                Some(succeeded as f64 / finished as f64)
            } else {
                None
            },
            avg_duration_ms,
        })
    }

    /// Finalize runs left PENDING/RUNNING by a crash. Called once at boot.
    pub async fn fail_interrupted(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'FAILED', error = 'interrupted by engine restart',
                completed_at = NOW(),
                duration_ms = EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000
            WHERE status IN ('PENDING', 'RUNNING')
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub automation_id: Uuid,
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub in_flight: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_duration_ms: Option<f64>,
}

fn row_to_execution(row: ExecutionRow) -> Option<Execution> {
    let (id, automation_id, status, trigger_data, component_results, error, started_at, completed_at, duration_ms) =
        row;

    Some(Execution {
        id,
        automation_id,
        status: ExecutionStatus::parse(&status)?,
        trigger_data: serde_json::from_value(trigger_data).ok()?,
        component_results: component_results
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default(),
        error,
        started_at,
        completed_at,
        duration_ms,
    })
}
