//! Postgres connection pool bootstrap, plus the scoped-transaction
//! helper that the persistence layer hands callers needing atomic
//! multi-statement writes.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::RwLock;

use crate::config::WorkerConfig;
use crate::error::WorkerError;

pub async fn connect(config: &WorkerConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")
}

/// Postgres error code for "current transaction is aborted, commands
/// ignored until end of transaction block" — surfaces when a prior
/// statement in the same transaction failed and the caller kept using
/// the connection. On this code, force-close and re-establish the
/// connection before the next use.
const ABORTED_TRANSACTION_CODE: &str = "25P02";

fn is_aborted_transaction_code(code: Option<&str>) -> bool {
    code == Some(ABORTED_TRANSACTION_CODE)
}

fn is_aborted_transaction_error(err: &WorkerError) -> bool {
    matches!(
        err,
        WorkerError::Database(sqlx::Error::Database(db_err))
            if is_aborted_transaction_code(db_err.code().as_deref())
    )
}

/// Owns the live pool behind a lock so a `25P02`-triggered reconnect can
/// swap it out without callers needing to know the pool was replaced.
pub struct ConnectionBundle {
    pool: RwLock<PgPool>,
    database_url: String,
    max_connections: u32,
}

impl ConnectionBundle {
    pub fn new(pool: PgPool, config: &WorkerConfig) -> Self {
        Self {
            pool: RwLock::new(pool),
            database_url: config.database_url.clone(),
            max_connections: config.database_max_connections,
        }
    }

    pub async fn pool(&self) -> PgPool {
        self.pool.read().await.clone()
    }

    /// Force-close the current pool and dial a fresh one. Called after an
    /// aborted-transaction-state error so the next `with_transaction` call
    /// starts from a clean connection.
    async fn reconnect(&self) -> Result<(), WorkerError> {
        let fresh = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.database_url)
            .await
            .map_err(WorkerError::Database)?;
        let old = std::mem::replace(&mut *self.pool.write().await, fresh);
        old.close().await;
        Ok(())
    }

    /// Acquire a cursor, yield it to `f`, commit on normal return, roll
    /// back on any error. On `25P02` (aborted transaction state), forces
    /// a pool reconnect before returning the error.
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T, WorkerError>
    where
        F: for<'c> FnOnce(&'c mut sqlx::PgConnection) -> BoxFuture<'c, Result<T, WorkerError>>,
    {
        let pool = self.pool().await;
        let mut tx = pool.begin().await.map_err(WorkerError::Database)?;
        let outcome = f(&mut *tx).await;

        match outcome {
            Ok(value) => {
                tx.commit().await.map_err(WorkerError::Database)?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback().await;
                if is_aborted_transaction_error(&err) {
                    self.reconnect().await?;
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_transaction_code_matches_only_25p02() {
        assert!(is_aborted_transaction_code(Some("25P02")));
        assert!(!is_aborted_transaction_code(Some("42601")));
        assert!(!is_aborted_transaction_code(None));
    }
}
