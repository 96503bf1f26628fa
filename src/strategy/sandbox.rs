//! Sandboxed strategy execution runtime.
//!
//! Builds a `rhai::Engine` with exactly three host functions registered
//! (`get_bar_data`, `get_general_data`, `generate_equity_curve`), runs
//! the validated entry point, and normalizes whatever it returns.
//! Per-call accessor counts are tracked in a `DashMap` against an
//! instance cap (`INSTANCE_CAP_DEFAULT` / `INSTANCE_CAP_VALIDATION`);
//! a `rhai::Engine::on_progress` hook enforces the wall-clock validation
//! timeout without needing a second OS thread.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use dashmap::DashMap;
use polars::prelude::*;
use rhai::{Array, Dynamic, Engine, Map as RhaiMap, Scope};
use sqlx::postgres::PgPool;
use tokio::runtime::Handle;

use crate::data::bar_accessor::{get_bar_data, GetBarDataParams};
use crate::data::general_accessor::get_general_data;
use crate::data::{BarFilters, GeneralFilters, RangeFilter};
use crate::error::{ErrorDetails, WorkerError};
use crate::strategy::output::normalize;
use crate::strategy::plot::{PlotCapture, PlotRecord, PrintCapture};

#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub max_accessor_calls: usize,
    pub timeout: Duration,
}

/// Per-run execution context shared across every host function
/// invocation made by the script.
pub struct SandboxContext {
    pool: PgPool,
    max_concurrency: usize,
    call_counts: DashMap<&'static str, AtomicUsize>,
    limits: SandboxLimits,
}

impl SandboxContext {
    pub fn new(pool: PgPool, max_concurrency: usize, limits: SandboxLimits) -> Arc<Self> {
        Arc::new(Self {
            pool,
            max_concurrency,
            call_counts: DashMap::new(),
            limits,
        })
    }

    #[cfg(test)]
    fn new_for_test(limits: SandboxLimits) -> Arc<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool never dials out");
        Arc::new(Self {
            pool,
            max_concurrency: 1,
            call_counts: DashMap::new(),
            limits,
        })
    }

    fn bump(&self, name: &'static str) -> Result<(), WorkerError> {
        let entry = self
            .call_counts
            .entry(name)
            .or_insert_with(|| AtomicUsize::new(0));
        let prev = entry.fetch_add(1, Ordering::SeqCst);
        if prev + 1 > self.limits.max_accessor_calls {
            return Err(WorkerError::StrategyCompliance(format!(
                "`{name}` called more than the allotted {} times for this run",
                self.limits.max_accessor_calls
            )));
        }
        Ok(())
    }
}

fn to_string_vec(arr: &Array) -> Vec<String> {
    arr.iter()
        .filter_map(|d| d.clone().try_cast::<rhai::ImmutableString>())
        .map(|s| s.to_string())
        .collect()
}

fn parse_date(map: &RhaiMap, key: &str) -> Option<NaiveDate> {
    map.get(key)
        .and_then(|d| d.clone().try_cast::<rhai::ImmutableString>())
        .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

fn filters_from_map(map: &RhaiMap) -> BarFilters {
    let tickers = map
        .get("tickers")
        .and_then(|d| d.clone().try_cast::<Array>())
        .map(|a| to_string_vec(&a));
    BarFilters { tickers }
}

fn general_filters_from_map(map: &RhaiMap) -> GeneralFilters {
    let range = |min_key: &str, max_key: &str| RangeFilter {
        min: map.get(min_key).and_then(|d| d.clone().try_cast::<f64>()),
        max: map.get(max_key).and_then(|d| d.clone().try_cast::<f64>()),
    };
    GeneralFilters {
        tickers: map
            .get("tickers")
            .and_then(|d| d.clone().try_cast::<Array>())
            .map(|a| to_string_vec(&a)),
        active: map.get("active").and_then(|d| d.clone().try_cast::<bool>()),
        sector: map
            .get("sector")
            .and_then(|d| d.clone().try_cast::<rhai::ImmutableString>())
            .map(|s| s.to_string()),
        industry: map
            .get("industry")
            .and_then(|d| d.clone().try_cast::<rhai::ImmutableString>())
            .map(|s| s.to_string()),
        primary_exchange: map
            .get("primary_exchange")
            .and_then(|d| d.clone().try_cast::<rhai::ImmutableString>())
            .map(|s| s.to_string()),
        market_cap: range("market_cap_min", "market_cap_max"),
        total_employees: range("total_employees_min", "total_employees_max"),
        weighted_shares_outstanding: range(
            "weighted_shares_outstanding_min",
            "weighted_shares_outstanding_max",
        ),
    }
}

fn frame_to_rows(df: &DataFrame) -> Array {
    let height = df.height();
    let mut rows = Vec::with_capacity(height);
    for i in 0..height {
        let mut row = RhaiMap::new();
        for col in df.get_columns() {
            let name: &str = col.name();
            let value = match col.get(i) {
                Ok(AnyValue::String(s)) => Dynamic::from(s.to_string()),
                Ok(AnyValue::Int64(v)) => Dynamic::from(v),
                Ok(AnyValue::Float64(v)) => Dynamic::from(v),
                Ok(AnyValue::Null) | Err(_) => Dynamic::UNIT,
                Ok(other) => Dynamic::from(other.to_string()),
            };
            row.insert(name.into(), value);
        }
        rows.push(Dynamic::from(row));
    }
    rows
}

/// Run an async future to completion from inside a synchronous rhai
/// host function. Requires a multi-threaded tokio runtime (the one this
/// worker always starts under).
fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::task::block_in_place(|| Handle::current().block_on(fut))
}

/// Combine per-instance equity series into one aligned series,
/// optionally summed per distinct value of `group_column` first. Each
/// instance is a rhai array of
/// `#{timestamp, equity}` maps; purely in-memory, no DB access.
pub fn generate_equity_curve(instances: &Array, group_column: Option<&str>) -> Array {
    let mut by_timestamp: BTreeMap<i64, f64> = BTreeMap::new();
    let mut grouped: BTreeMap<String, BTreeMap<i64, f64>> = BTreeMap::new();

    for instance in instances {
        let Some(rows) = instance.clone().try_cast::<Array>() else {
            continue;
        };
        let group_key = group_column
            .and_then(|col| {
                rows.first()
                    .and_then(|r| r.clone().try_cast::<RhaiMap>())
                    .and_then(|m| m.get(col).cloned())
            })
            .map(|d| d.to_string())
            .unwrap_or_default();

        for row in &rows {
            let Some(map) = row.clone().try_cast::<RhaiMap>() else {
                continue;
            };
            let ts = map
                .get("timestamp")
                .and_then(|d| d.clone().try_cast::<i64>())
                .unwrap_or(0);
            let equity = map
                .get("equity")
                .and_then(|d| d.clone().try_cast::<f64>())
                .unwrap_or(0.0);

            if group_column.is_some() {
                *grouped.entry(group_key.clone()).or_default().entry(ts).or_insert(0.0) += equity;
            } else {
                *by_timestamp.entry(ts).or_insert(0.0) += equity;
            }
        }
    }

    let source: Vec<(i64, f64)> = if group_column.is_some() {
        let mut merged: BTreeMap<i64, f64> = BTreeMap::new();
        for series in grouped.values() {
            for (ts, v) in series {
                *merged.entry(*ts).or_insert(0.0) += v;
            }
        }
        merged.into_iter().collect()
    } else {
        by_timestamp.into_iter().collect()
    };

    source
        .into_iter()
        .map(|(ts, equity)| {
            let mut m = RhaiMap::new();
            m.insert("timestamp".into(), Dynamic::from(ts));
            m.insert("equity".into(), Dynamic::from(equity));
            Dynamic::from(m)
        })
        .collect()
}

/// Build an engine wired to `ctx`, with `plot(...)` writing into
/// `plot_capture`, `print`/`debug` writing into `print_capture`, and a
/// progress hook enforcing `ctx.limits.timeout`.
pub fn build_engine(
    ctx: Arc<SandboxContext>,
    plot_capture: PlotCapture,
    print_capture: PrintCapture,
) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_expr_depths(64, 32);

    {
        let ctx = ctx.clone();
        engine.register_fn(
            "get_bar_data",
            move |timeframe: &str, columns: Array, min_bars: i64, filters: RhaiMap| -> Array {
                if ctx.bump("get_bar_data").is_err() {
                    return Array::new();
                }
                let exec_ctx = block_on(crate::engine::context::current());
                let mut bar_filters = filters_from_map(&filters);
                if !bar_filters.has_tickers() && !exec_ctx.symbols.is_empty() {
                    bar_filters.tickers = Some(exec_ctx.symbols.clone());
                }
                let params = GetBarDataParams {
                    timeframe: timeframe.to_string(),
                    columns: Some(to_string_vec(&columns)),
                    min_bars,
                    filters: bar_filters,
                    aggregate_mode: filters
                        .get("aggregate_mode")
                        .and_then(|d| d.clone().try_cast::<bool>())
                        .unwrap_or(false),
                    extended_hours: filters
                        .get("extended_hours")
                        .and_then(|d| d.clone().try_cast::<bool>())
                        .unwrap_or(false),
                    start_date: parse_date(&filters, "start_date").or(exec_ctx.start_date),
                    end_date: parse_date(&filters, "end_date").or(exec_ctx.end_date),
                };
                match block_on(get_bar_data(&ctx.pool, ctx.max_concurrency, params)) {
                    Ok(df) => frame_to_rows(&df),
                    Err(e) => {
                        tracing::warn!(error = %e, "get_bar_data call inside sandbox failed");
                        Array::new()
                    }
                }
            },
        );
    }

    {
        let ctx = ctx.clone();
        engine.register_fn(
            "get_general_data",
            move |columns: Array, filters: RhaiMap| -> Array {
                if ctx.bump("get_general_data").is_err() {
                    return Array::new();
                }
                let cols = to_string_vec(&columns);
                let cols = if cols.is_empty() { None } else { Some(cols) };
                match block_on(get_general_data(
                    &ctx.pool,
                    cols,
                    general_filters_from_map(&filters),
                )) {
                    Ok(rows) => rows
                        .into_iter()
                        .map(|s| {
                            let json = serde_json::to_value(&s).unwrap_or_default();
                            let mut m = RhaiMap::new();
                            if let serde_json::Value::Object(obj) = json {
                                for (k, v) in obj {
                                    let d = match v {
                                        serde_json::Value::String(s) => Dynamic::from(s),
                                        serde_json::Value::Number(n) => n
                                            .as_i64()
                                            .map(Dynamic::from)
                                            .unwrap_or_else(|| Dynamic::from(n.as_f64().unwrap_or(0.0))),
                                        serde_json::Value::Bool(b) => Dynamic::from(b),
                                        _ => Dynamic::UNIT,
                                    };
                                    m.insert(k.into(), d);
                                }
                            }
                            Dynamic::from(m)
                        })
                        .collect(),
                    Err(e) => {
                        tracing::warn!(error = %e, "get_general_data call inside sandbox failed");
                        Array::new()
                    }
                }
            },
        );
    }

    {
        let ctx = ctx.clone();
        engine.register_fn(
            "generate_equity_curve",
            move |instances: Array| -> Array {
                if ctx.bump("generate_equity_curve").is_err() {
                    return Array::new();
                }
                generate_equity_curve(&instances, None)
            },
        );
        engine.register_fn(
            "generate_equity_curve",
            move |instances: Array, group_column: &str| -> Array {
                generate_equity_curve(&instances, Some(group_column))
            },
        );
    }

    {
        let plot_capture = plot_capture.clone();
        engine.register_fn("plot", move |name: &str, x: Array, y: Array| {
            let x: Vec<f64> = x.iter().filter_map(|d| d.clone().try_cast::<f64>()).collect();
            let y: Vec<f64> = y.iter().filter_map(|d| d.clone().try_cast::<f64>()).collect();
            plot_capture.push(name.to_string(), x, y);
        });
    }

    {
        let print_capture = print_capture.clone();
        engine.on_print(move |line| print_capture.push_line(line));
    }
    {
        let print_capture = print_capture.clone();
        engine.on_debug(move |line, _src, pos| print_capture.push_line(&format!("{pos:?}: {line}")));
    }

    let deadline = Instant::now() + ctx.limits.timeout;
    engine.on_progress(move |_ops| {
        if Instant::now() >= deadline {
            Some(Dynamic::from("timeout".to_string()))
        } else {
            None
        }
    });

    engine
}

/// Entry points tried in order when resolving the callable to invoke.
const ENTRY_CANDIDATES: &[&str] = &["strategy", "strategy_function", "main", "run"];

/// Output of one successful sandboxed run.
#[derive(Debug)]
pub struct SandboxOutcome {
    pub value: serde_json::Value,
    pub plots: PlotRecord,
    pub prints: String,
}

/// A failed run, carrying both the classified error and the line-level
/// context extracted from the user source.
#[derive(Debug)]
pub struct SandboxFailure {
    pub error: WorkerError,
    pub details: ErrorDetails,
}

/// Pull `±3` lines of source around `line` (1-indexed), prefixed with
/// line numbers, for the failing frame's context.
fn code_context(source: &str, line: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let start = line.saturating_sub(4);
    let end = (line + 3).min(lines.len());
    lines[start..end]
        .iter()
        .enumerate()
        .map(|(i, text)| format!("{:>4} | {text}", start + i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

fn classify_eval_error(source: &str, err: &rhai::EvalAltResult) -> SandboxFailure {
    let is_timeout = matches!(err, rhai::EvalAltResult::ErrorTerminated(..))
        || err.to_string().contains("timeout");
    if is_timeout {
        return SandboxFailure {
            error: WorkerError::ValidationTimeout,
            details: ErrorDetails::from_error(&WorkerError::ValidationTimeout),
        };
    }

    let line = err.position().line();
    let error = WorkerError::Runtime(err.to_string());
    let mut details = ErrorDetails::from_error(&error).with_traceback(err.to_string());
    if let Some(line) = line {
        details = details.with_location(line, code_context(source, line));
    }
    SandboxFailure { error, details }
}

/// Run `source`'s entry point to completion and normalize its return
/// value. `source` must already have passed
/// [`crate::strategy::validator::validate`].
pub async fn run(
    pool: PgPool,
    max_concurrency: usize,
    limits: SandboxLimits,
    source: &str,
) -> Result<SandboxOutcome, SandboxFailure> {
    let ctx = SandboxContext::new(pool, max_concurrency, limits);
    let plot_capture = PlotCapture::new();
    let print_capture = PrintCapture::new();
    let engine = build_engine(ctx, plot_capture.clone(), print_capture.clone());

    let owned_source = source.to_string();
    let result = tokio::task::spawn_blocking(move || {
        let engine = engine;
        let ast = match engine.compile(&owned_source) {
            Ok(ast) => ast,
            Err(e) => {
                return Err(SandboxFailure {
                    error: WorkerError::StrategyCompliance(format!("script does not parse: {e}")),
                    details: ErrorDetails::from_error(&WorkerError::StrategyCompliance(e.to_string())),
                })
            }
        };

        let entry = ENTRY_CANDIDATES
            .iter()
            .find(|name| ast.iter_functions().any(|f| f.name == **name && f.params.is_empty()));
        let Some(entry) = entry else {
            return Err(SandboxFailure {
                error: WorkerError::NoStrategyFunction,
                details: ErrorDetails::from_error(&WorkerError::NoStrategyFunction),
            });
        };

        let mut scope = Scope::new();
        engine
            .call_fn::<Dynamic>(&mut scope, &ast, entry, ())
            .map_err(|e| classify_eval_error(&owned_source, &e))
    })
    .await
    .map_err(|e| SandboxFailure {
        error: WorkerError::Other(anyhow::anyhow!(e.to_string())),
        details: ErrorDetails::from_error(&WorkerError::Other(anyhow::anyhow!(e.to_string()))),
    })?;

    let result = result?;
    let value = normalize(&result).map_err(|e| SandboxFailure {
        details: ErrorDetails::from_error(&e),
        error: e,
    })?;

    Ok(SandboxOutcome {
        value,
        plots: plot_capture.into_record(),
        prints: print_capture.into_buffer(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equity_curve_sums_overlapping_timestamps() {
        let a: Array = vec![
            row(0, 100.0),
            row(1, 101.0),
        ];
        let b: Array = vec![
            row(0, 50.0),
            row(1, 49.0),
        ];
        let instances: Array = vec![Dynamic::from(a), Dynamic::from(b)];

        let combined = generate_equity_curve(&instances, None);
        assert_eq!(combined.len(), 2);
        let first = combined[0].clone().try_cast::<RhaiMap>().unwrap();
        assert_eq!(first.get("equity").unwrap().as_float().unwrap(), 150.0);
    }

    fn row(ts: i64, equity: f64) -> Dynamic {
        let mut m = RhaiMap::new();
        m.insert("timestamp".into(), Dynamic::from(ts));
        m.insert("equity".into(), Dynamic::from(equity));
        Dynamic::from(m)
    }

    #[test]
    fn instance_cap_blocks_further_calls() {
        let ctx = SandboxContext::new_for_test(SandboxLimits {
            max_accessor_calls: 2,
            timeout: Duration::from_secs(5),
        });
        assert!(ctx.bump("get_bar_data").is_ok());
        assert!(ctx.bump("get_bar_data").is_ok());
        assert!(ctx.bump("get_bar_data").is_err());
    }
}
