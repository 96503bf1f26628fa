//! Persistence & CRUD: append-only strategy versioning and the
//! execution artifact log.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::data::pool::ConnectionBundle;
use crate::error::WorkerError;

/// A persisted strategy version.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StrategyRecord {
    pub strategyid: i64,
    pub userid: String,
    pub name: String,
    pub description: Option<String>,
    pub prompt: Option<String>,
    pub python_code: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub alert_active: bool,
    pub score: Option<f64>,
    pub min_timeframe: Option<String>,
    pub alert_universe_full: Option<Vec<String>>,
}

/// One row of the `execution_logs` execution-artifact log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub userid: String,
    pub prompt: Option<String>,
    pub source_code: String,
    pub execution_id: String,
    pub result: Option<serde_json::Value>,
    pub prints: Option<String>,
    pub plots: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

fn row_to_strategy(row: &sqlx::postgres::PgRow) -> StrategyRecord {
    StrategyRecord {
        strategyid: row.get("strategyid"),
        userid: row.get("userid"),
        name: row.get("name"),
        description: row.try_get("description").ok(),
        prompt: row.try_get("prompt").ok(),
        python_code: row.get("pythoncode"),
        version: row.get("version"),
        created_at: row.get("createdat"),
        updated_at: row.get("updated_at"),
        alert_active: row.get("alertactive"),
        score: row.try_get("score").ok(),
        min_timeframe: row.try_get("min_timeframe").ok(),
        alert_universe_full: row.try_get("alert_universe_full").ok(),
    }
}

/// Fetch one strategy's source. `version` pins a specific version; when
/// it doesn't exist, falls back to the latest version for that strategy
/// and logs a warning rather than failing.
pub async fn fetch_strategy_code(
    pool: &PgPool,
    user_id: &str,
    strategy_id: i64,
    version: Option<i32>,
) -> Result<StrategyRecord, WorkerError> {
    if let Some(v) = version {
        let row = sqlx::query(
            "SELECT * FROM strategies WHERE userid = $1 AND strategyid = $2 AND version = $3",
        )
        .bind(user_id)
        .bind(strategy_id)
        .bind(v)
        .fetch_optional(pool)
        .await?;
        if let Some(row) = row {
            return Ok(row_to_strategy(&row));
        }
        tracing::warn!(
            strategy_id,
            version = v,
            "requested strategy version not found, falling back to latest"
        );
    }

    let row = sqlx::query(
        "SELECT * FROM strategies WHERE userid = $1 AND strategyid = $2 \
         ORDER BY version DESC LIMIT 1",
    )
    .bind(user_id)
    .bind(strategy_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref()
        .map(row_to_strategy)
        .ok_or_else(|| WorkerError::Other(anyhow::anyhow!("no such strategy")))
}

#[derive(Debug, Clone, Default)]
pub struct SaveStrategyParams {
    pub strategy_id: Option<i64>,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub prompt: Option<String>,
    pub python_code: String,
    pub alert_active: bool,
    pub score: Option<f64>,
    pub min_timeframe: Option<String>,
    pub alert_universe_full: Option<Vec<String>>,
}

/// Insert a new version row. With `strategy_id` present, appends
/// `version = max(version)+1` under the same `(user_id, name)`; absent,
/// inserts a fresh `version = 1` row.
///
/// Runs inside [`ConnectionBundle::with_transaction`] so the
/// max-version-then-insert pair is atomic — two concurrent saves under
/// the same `(user_id, name)` can't both observe the same `MAX(version)`
/// and collide.
pub async fn save_strategy(
    bundle: &ConnectionBundle,
    params: SaveStrategyParams,
) -> Result<StrategyRecord, WorkerError> {
    bundle
        .with_transaction(move |conn| {
            Box::pin(async move {
                let (strategyid, next_version) = match params.strategy_id {
                    Some(id) => {
                        let current: Option<i32> = sqlx::query_scalar(
                            "SELECT MAX(version) FROM strategies WHERE userid = $1 AND strategyid = $2 FOR UPDATE",
                        )
                        .bind(&params.user_id)
                        .bind(id)
                        .fetch_one(&mut *conn)
                        .await
                        .map_err(WorkerError::Database)?;
                        (id, current.unwrap_or(0) + 1)
                    }
                    None => {
                        let id: i64 = sqlx::query_scalar(
                            "SELECT COALESCE(MAX(strategyid), 0) + 1 FROM strategies",
                        )
                        .fetch_one(&mut *conn)
                        .await
                        .map_err(WorkerError::Database)?;
                        (id, 1)
                    }
                };

                let row = sqlx::query(
                    "INSERT INTO strategies \
                        (strategyid, userid, name, description, prompt, pythoncode, version, \
                         createdat, updated_at, alertactive, score, min_timeframe, alert_universe_full) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, now(), now(), $8, $9, $10, $11) \
                     RETURNING *",
                )
                .bind(strategyid)
                .bind(&params.user_id)
                .bind(&params.name)
                .bind(&params.description)
                .bind(&params.prompt)
                .bind(&params.python_code)
                .bind(next_version)
                .bind(params.alert_active)
                .bind(params.score)
                .bind(&params.min_timeframe)
                .bind(&params.alert_universe_full)
                .fetch_one(&mut *conn)
                .await
                .map_err(WorkerError::Database)?;

                Ok(row_to_strategy(&row))
            })
        })
        .await
}

/// Append one row to the execution artifact log.
pub async fn save_execution_log(pool: &PgPool, log: &ExecutionLog) -> Result<(), WorkerError> {
    sqlx::query(
        "INSERT INTO execution_logs \
            (userid, prompt, source_code, execution_id, result, prints, plots, error_message, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())",
    )
    .bind(&log.userid)
    .bind(&log.prompt)
    .bind(&log.source_code)
    .bind(&log.execution_id)
    .bind(&log.result)
    .bind(&log.prints)
    .bind(&log.plots)
    .bind(&log.error_message)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_log_carries_execution_id_for_correlation() {
        let log = ExecutionLog {
            userid: "u1".into(),
            prompt: None,
            source_code: "fn strategy() { return []; }".into(),
            execution_id: "exec-123".into(),
            result: Some(serde_json::json!([])),
            prints: None,
            plots: None,
            error_message: None,
        };
        assert_eq!(log.execution_id, "exec-123");
    }
}
