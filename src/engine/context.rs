//! Accessor provider: a process-wide singleton holding the execution
//! context (`mode, symbols, start_date, end_date`)
//! that both the engine and the sandbox-bound accessor functions read.
//! The engine is responsible for setting it before each run; the worker
//! processes one task at a time per provider instance, so there is no
//! per-task ownership to model here.

use std::sync::OnceLock;

use chrono::NaiveDate;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Backtest,
    Validation,
    Screening,
    Alert,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub mode: Option<Mode>,
    pub symbols: Vec<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

fn provider() -> &'static RwLock<ExecutionContext> {
    static PROVIDER: OnceLock<RwLock<ExecutionContext>> = OnceLock::new();
    PROVIDER.get_or_init(|| RwLock::new(ExecutionContext::default()))
}

/// Set the context before invoking the sandbox. Overwrites whatever was
/// there; interleaved runs against the same provider are unsupported.
pub async fn set(ctx: ExecutionContext) {
    *provider().write().await = ctx;
}

pub async fn current() -> ExecutionContext {
    provider().read().await.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_current_round_trips() {
        set(ExecutionContext {
            mode: Some(Mode::Backtest),
            symbols: vec!["AAPL".into()],
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            end_date: NaiveDate::from_ymd_opt(2024, 2, 1),
        })
        .await;

        let ctx = current().await;
        assert_eq!(ctx.mode, Some(Mode::Backtest));
        assert_eq!(ctx.symbols, vec!["AAPL".to_string()]);
    }
}
