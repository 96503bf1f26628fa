//! Strategy engine: per-mode orchestration (backtest / validation /
//! screening / alert), result shaping, and the
//! `{success, …}` envelope every mode returns instead of ever letting a
//! strategy failure propagate as an error.

use std::time::Instant;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPool;

use crate::config::WorkerConfig;
use crate::engine::context::{self, ExecutionContext, Mode};
use crate::engine::ranking::{rank_for_screening, to_alert, AlertRecord, RankedResult};
use crate::error::{ErrorDetails, WorkerError};
use crate::strategy::plot::PlotRecord;
use crate::strategy::sandbox::{self, SandboxLimits};
use crate::strategy::validator;
use crate::timeframe::{Timeframe, Unit};

pub type Instance = serde_json::Map<String, Value>;

/// Drop non-mapping / ticker-less values and inject a wall-clock
/// timestamp where missing.
fn to_instances(value: Value) -> Vec<Instance> {
    let Value::Array(items) = value else {
        return Vec::new();
    };
    let now = Utc::now().timestamp();
    items
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(mut m) if m.contains_key("ticker") => {
                m.entry("timestamp".to_string()).or_insert(Value::from(now));
                Some(m)
            }
            _ => None,
        })
        .collect()
}

/// Truncate to `cap`, reporting whether anything was dropped. The
/// sandbox's host-exposed list has no way to intercept individual
/// `push`/`append` calls the way a tracked collection type could, so
/// the cap is enforced here, once, on the full returned collection —
/// same observed behaviour (`instance_limit_reached` flag, exactly
/// `cap` instances survive) without needing per-call instrumentation.
fn enforce_cap(instances: Vec<Instance>, cap: usize) -> (Vec<Instance>, bool) {
    if instances.len() > cap {
        (instances.into_iter().take(cap).collect(), true)
    } else {
        (instances, false)
    }
}

struct SandboxRun {
    instances: Vec<Instance>,
    limit_reached: bool,
    plots: PlotRecord,
    prints: String,
    elapsed_ms: u64,
    failure: Option<(WorkerError, ErrorDetails)>,
}

async fn execute(
    pool: &PgPool,
    config: &WorkerConfig,
    cap: usize,
    timeout: std::time::Duration,
    source: &str,
    exec_ctx: ExecutionContext,
) -> SandboxRun {
    context::set(exec_ctx).await;
    let limits = SandboxLimits {
        max_accessor_calls: 10_000,
        timeout,
    };

    let start = Instant::now();
    let outcome = sandbox::run(pool.clone(), config.max_batch_concurrency, limits, source).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(outcome) => {
            let instances = to_instances(outcome.value);
            let (instances, limit_reached) = enforce_cap(instances, cap);
            SandboxRun {
                instances,
                limit_reached,
                plots: outcome.plots,
                prints: outcome.prints,
                elapsed_ms,
                failure: None,
            }
        }
        Err(failure) => SandboxRun {
            instances: Vec::new(),
            limit_reached: false,
            plots: PlotRecord::default(),
            prints: String::new(),
            elapsed_ms,
            failure: Some((failure.error, failure.details)),
        },
    }
}

fn truncated_traceback(details: &ErrorDetails) -> ErrorDetails {
    // Cap the traceback so a pathological strategy can't balloon the
    // envelope.
    let mut d = details.clone();
    if let Some(tb) = &d.full_traceback {
        if tb.len() > 4000 {
            d.full_traceback = Some(format!("{}… (truncated)", &tb[..4000]));
        }
    }
    d
}

// ---------------------------------------------------------------- Backtest

#[derive(Debug, Serialize, JsonSchema)]
pub struct BacktestSummary {
    pub total_instances: usize,
    pub symbols_processed: usize,
    pub date_range: (String, String),
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct BacktestResult {
    pub success: bool,
    pub instances: Vec<Instance>,
    pub symbols_processed: usize,
    pub strategy_prints: String,
    pub strategy_plots: PlotRecord,
    pub response_images: Vec<Value>,
    pub instance_limit_reached: bool,
    pub summary: Option<BacktestSummary>,
    pub execution_time_ms: u64,
    pub error: Option<String>,
    pub error_details: Option<ErrorDetails>,
}

/// Run a strategy in backtest mode.
pub async fn run_backtest(
    pool: &PgPool,
    config: &WorkerConfig,
    source: &str,
    symbols: Vec<String>,
    start_date: NaiveDate,
    end_date: NaiveDate,
    max_instances: usize,
) -> BacktestResult {
    let exec_ctx = ExecutionContext {
        mode: Some(Mode::Backtest),
        symbols: symbols.clone(),
        start_date: Some(start_date),
        end_date: Some(end_date),
    };
    let timeout = std::time::Duration::from_secs(config.validation_timeout_secs * 4);
    let run = execute(pool, config, max_instances, timeout, source, exec_ctx).await;

    if let Some((error, details)) = run.failure {
        return BacktestResult {
            success: false,
            instances: Vec::new(),
            symbols_processed: symbols.len(),
            strategy_prints: run.prints,
            strategy_plots: run.plots,
            response_images: Vec::new(),
            instance_limit_reached: false,
            summary: None,
            execution_time_ms: run.elapsed_ms,
            error: Some(error.to_string()),
            error_details: Some(truncated_traceback(&details)),
        };
    }

    BacktestResult {
        success: true,
        summary: Some(BacktestSummary {
            total_instances: run.instances.len(),
            symbols_processed: symbols.len(),
            date_range: (start_date.to_string(), end_date.to_string()),
        }),
        instances: run.instances,
        symbols_processed: symbols.len(),
        strategy_prints: run.prints,
        strategy_plots: run.plots,
        response_images: Vec::new(),
        instance_limit_reached: run.limit_reached,
        execution_time_ms: run.elapsed_ms,
        error: None,
        error_details: None,
    }
}

// -------------------------------------------------------------- Validation

#[derive(Debug, Serialize, JsonSchema)]
pub struct ValidationResult {
    pub success: bool,
    pub instances_generated: usize,
    pub instance_limit_reached: bool,
    pub max_instances_configured: usize,
    pub execution_time_ms: u64,
    pub message: String,
}

/// Convert `min_bars` units of `timeframe` to a whole number of calendar
/// days, rounded up, for the validation date window. Only minute/hour/day
/// units are converted; week/month/quarter/year timeframes fall back to
/// the default window. Does not account for weekend/holiday gaps in the
/// underlying series — a known bias.
fn window_days(timeframe: &str, min_bars: i64) -> Option<i64> {
    let tf = Timeframe::parse(timeframe).ok()?;
    if !matches!(tf.unit, Unit::Minute | Unit::Hour | Unit::Day) {
        return None;
    }
    let total_minutes = tf.approx_minutes() * min_bars as f64;
    let days = (total_minutes / (60.0 * 24.0)).ceil() as i64;
    Some(days.max(1))
}

const DEFAULT_VALIDATION_WINDOW_DAYS: i64 = 30;
const VALIDATION_SYMBOL_CAP: usize = 10;

/// Fast-path validation pre-flight. Uses the validator's extracted
/// metadata for symbol/date-window selection
/// rather than caller-supplied values; a data-only issue (no rows,
/// empty frame) is tolerated — only a programming error fails this mode.
pub async fn run_validation(pool: &PgPool, config: &WorkerConfig, source: &str) -> ValidationResult {
    let start = Instant::now();

    let metadata = match validator::validate(source) {
        Ok(m) => m,
        Err(e) => {
            return ValidationResult {
                success: false,
                instances_generated: 0,
                instance_limit_reached: false,
                max_instances_configured: config.instance_cap_validation,
                execution_time_ms: start.elapsed().as_millis() as u64,
                message: e.to_string(),
            }
        }
    };

    let symbols: Vec<String> = metadata
        .alert_universe_full
        .clone()
        .unwrap_or_default()
        .into_iter()
        .take(VALIDATION_SYMBOL_CAP)
        .collect();
    if symbols.is_empty() {
        return ValidationResult {
            success: false,
            instances_generated: 0,
            instance_limit_reached: false,
            max_instances_configured: config.instance_cap_validation,
            execution_time_ms: start.elapsed().as_millis() as u64,
            message: WorkerError::NoTickersForValidation.to_string(),
        };
    }

    let (timeframe, min_bars) = &metadata.max_timeframe_min_bars;
    let window = window_days(timeframe, *min_bars).unwrap_or(DEFAULT_VALIDATION_WINDOW_DAYS);
    let end_date = Utc::now().date_naive();
    let start_date = end_date - ChronoDuration::days(window);

    let exec_ctx = ExecutionContext {
        mode: Some(Mode::Validation),
        symbols,
        start_date: Some(start_date),
        end_date: Some(end_date),
    };
    let timeout = std::time::Duration::from_secs(config.validation_timeout_secs);
    let run = execute(
        pool,
        config,
        config.instance_cap_validation,
        timeout,
        source,
        exec_ctx,
    )
    .await;

    if let Some((error, _)) = run.failure {
        return ValidationResult {
            success: false,
            instances_generated: 0,
            instance_limit_reached: false,
            max_instances_configured: config.instance_cap_validation,
            execution_time_ms: run.elapsed_ms,
            message: error.to_string(),
        };
    }

    ValidationResult {
        success: true,
        instances_generated: run.instances.len(),
        instance_limit_reached: run.limit_reached,
        max_instances_configured: config.instance_cap_validation,
        execution_time_ms: run.elapsed_ms,
        message: "strategy ran to completion".to_string(),
    }
}

// --------------------------------------------------------------- Screening

#[derive(Debug, Serialize, JsonSchema)]
pub struct ScreeningResult {
    pub success: bool,
    pub ranked_results: Vec<RankedResult>,
    pub strategy_prints: String,
    pub strategy_plots: PlotRecord,
    pub instance_limit_reached: bool,
    pub execution_time_ms: u64,
    pub error: Option<String>,
    pub error_details: Option<ErrorDetails>,
}

/// Run a strategy in screening mode.
pub async fn run_screening(
    pool: &PgPool,
    config: &WorkerConfig,
    source: &str,
    symbols: Vec<String>,
    limit: usize,
) -> ScreeningResult {
    let exec_ctx = ExecutionContext {
        mode: Some(Mode::Screening),
        symbols,
        start_date: None,
        end_date: None,
    };
    let timeout = std::time::Duration::from_secs(config.validation_timeout_secs * 4);
    let run = execute(
        pool,
        config,
        config.instance_cap_default,
        timeout,
        source,
        exec_ctx,
    )
    .await;

    if let Some((error, details)) = run.failure {
        return ScreeningResult {
            success: false,
            ranked_results: Vec::new(),
            strategy_prints: run.prints,
            strategy_plots: run.plots,
            instance_limit_reached: false,
            execution_time_ms: run.elapsed_ms,
            error: Some(error.to_string()),
            error_details: Some(truncated_traceback(&details)),
        };
    }

    ScreeningResult {
        success: true,
        ranked_results: rank_for_screening(run.instances, limit),
        strategy_prints: run.prints,
        strategy_plots: run.plots,
        instance_limit_reached: run.limit_reached,
        execution_time_ms: run.elapsed_ms,
        error: None,
        error_details: None,
    }
}

// ------------------------------------------------------------------ Alert

#[derive(Debug, Serialize, JsonSchema)]
pub struct AlertResult {
    pub success: bool,
    pub alerts: Vec<AlertRecord>,
    pub signals: std::collections::BTreeMap<String, Instance>,
    pub instance_limit_reached: bool,
    pub execution_time_ms: u64,
    pub error: Option<String>,
    pub error_details: Option<ErrorDetails>,
}

/// Run a strategy in alert mode.
pub async fn run_alert(
    pool: &PgPool,
    config: &WorkerConfig,
    source: &str,
    symbols: Vec<String>,
) -> AlertResult {
    let exec_ctx = ExecutionContext {
        mode: Some(Mode::Alert),
        symbols,
        start_date: None,
        end_date: None,
    };
    let timeout = std::time::Duration::from_secs(config.validation_timeout_secs * 4);
    let run = execute(
        pool,
        config,
        config.instance_cap_default,
        timeout,
        source,
        exec_ctx,
    )
    .await;

    if let Some((error, details)) = run.failure {
        return AlertResult {
            success: false,
            alerts: Vec::new(),
            signals: std::collections::BTreeMap::new(),
            instance_limit_reached: false,
            execution_time_ms: run.elapsed_ms,
            error: Some(error.to_string()),
            error_details: Some(truncated_traceback(&details)),
        };
    }

    let now = Utc::now().timestamp();
    let signals: std::collections::BTreeMap<String, Instance> = run
        .instances
        .iter()
        .filter_map(|i| {
            i.get("ticker")
                .and_then(Value::as_str)
                .map(|t| (t.to_string(), i.clone()))
        })
        .collect();
    let alerts = run.instances.into_iter().map(|i| to_alert(i, now)).collect();

    AlertResult {
        success: true,
        alerts,
        signals,
        instance_limit_reached: run.limit_reached,
        execution_time_ms: run.elapsed_ms,
        error: None,
        error_details: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_days_rounds_up_and_falls_back_to_thirty() {
        // ceil(1h * 20 / 24h) = 1 day
        assert_eq!(window_days("1h", 20), Some(1));
        assert_eq!(window_days("bogus", 1), None);
    }

    #[test]
    fn window_days_only_converts_minute_hour_day_units() {
        assert_eq!(window_days("5m", 10), Some(1));
        assert_eq!(window_days("2d", 3), Some(6));
        assert_eq!(window_days("3w", 1), None);
        assert_eq!(window_days("1mo", 1), None);
        assert_eq!(window_days("1q", 1), None);
        assert_eq!(window_days("2y", 1), None);
    }

    #[test]
    fn enforce_cap_reports_truncation_only_when_exceeded() {
        let few: Vec<Instance> = (0..5).map(|_| serde_json::Map::new()).collect();
        let (kept, limited) = enforce_cap(few, 10);
        assert_eq!(kept.len(), 5);
        assert!(!limited);

        let many: Vec<Instance> = (0..20).map(|_| serde_json::Map::new()).collect();
        let (kept, limited) = enforce_cap(many, 10);
        assert_eq!(kept.len(), 10);
        assert!(limited);
    }

    #[test]
    fn to_instances_drops_non_objects_and_ticker_less_entries() {
        let value = serde_json::json!([
            {"ticker": "AAPL", "score": 0.5},
            {"no_ticker": true},
            null,
            "not an object"
        ]);
        let instances = to_instances(value);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].get("ticker").unwrap(), "AAPL");
        assert!(instances[0].contains_key("timestamp"));
    }
}
