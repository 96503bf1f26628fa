//! Per-mode orchestration and accessor provider: backtest/validation/
//! screening/alert execution, ranking, and the shared per-task
//! execution context.

pub mod context;
pub mod modes;
pub mod ranking;
