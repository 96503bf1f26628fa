use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use garde::Validate;
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Json},
    model::{Implementation, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ServerHandler,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::PgPool;

use crate::config::WorkerConfig;
use crate::data::pool::ConnectionBundle;
use crate::engine::modes::{self, AlertResult, BacktestResult, ScreeningResult, ValidationResult};
use crate::persistence::{self, StrategyRecord};
use crate::strategy::validator;
use crate::task::bus::MessageBus;
use crate::task::context::{MessageType, TaskContext};

fn default_max_instances(config: &WorkerConfig) -> usize {
    config.instance_cap_default
}

fn default_screening_limit() -> usize {
    50
}


#[derive(Clone)]
pub struct StrategyWorkerServer {
    connections: Arc<ConnectionBundle>,
    bus: Arc<dyn MessageBus>,
    config: Arc<WorkerConfig>,
    tool_router: ToolRouter<Self>,
}

impl StrategyWorkerServer {
    pub fn new(pool: PgPool, bus: Arc<dyn MessageBus>, config: WorkerConfig) -> Self {
        let connections = Arc::new(ConnectionBundle::new(pool, &config));
        Self {
            connections,
            bus,
            config: Arc::new(config),
            tool_router: Self::tool_router(),
        }
    }

    /// Wrap one mode execution with a task context: publishes a
    /// `running` progress frame, spawns the heartbeat loop,
    /// runs `work`, publishes the final `result` frame, then tears the
    /// heartbeat down. A zero-subscriber caller disconnect is absorbed
    /// here — it never prevents `work` from completing.
    async fn with_task<T, F>(&self, status: &str, work: F) -> T
    where
        T: serde::Serialize,
        F: std::future::Future<Output = T>,
    {
        let ctx = TaskContext::new(
            self.bus.clone(),
            self.config.worker_id.clone(),
            Duration::from_millis(self.config.heartbeat_interval_ms),
        );
        let heartbeat = ctx.spawn_heartbeat();
        let _ = ctx
            .publish(MessageType::Progress, status, json!({"phase": "started"}), None)
            .await;

        let result = work.await;

        let result_json = serde_json::to_value(&result).unwrap_or(serde_json::Value::Null);
        ctx.publish_result(status, result_json, None).await;
        ctx.destroy();
        let _ = heartbeat.await;

        result
    }
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct ValidateStrategyParams {
    /// Full strategy source (one zero-arg `strategy` entry point returning
    /// a list of mappings).
    #[garde(length(min = 1))]
    pub strategy_source: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct RunBacktestParams {
    /// Full strategy source.
    #[garde(length(min = 1))]
    pub strategy_source: String,
    /// Ticker universe to run the strategy over.
    #[garde(length(min = 1), inner(pattern(r"^[A-Za-z0-9._-]+$")))]
    pub symbols: Vec<String>,
    /// Inclusive start date (YYYY-MM-DD).
    #[garde(pattern(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$"))]
    pub start_date: String,
    /// Inclusive end date (YYYY-MM-DD).
    #[garde(pattern(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$"))]
    pub end_date: String,
    /// Instance cap override (default: the worker's configured `INSTANCE_CAP_DEFAULT`).
    #[garde(inner(range(min = 1)))]
    pub max_instances: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct RunScreeningParams {
    /// Full strategy source.
    #[garde(length(min = 1))]
    pub strategy_source: String,
    /// Ticker universe to screen.
    #[garde(length(min = 1), inner(pattern(r"^[A-Za-z0-9._-]+$")))]
    pub symbols: Vec<String>,
    /// Maximum number of ranked results to return (default: 50).
    #[serde(default = "default_screening_limit")]
    #[garde(range(min = 1))]
    pub limit: usize,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct RunAlertParams {
    /// Full strategy source.
    #[garde(length(min = 1))]
    pub strategy_source: String,
    /// Ticker universe to evaluate for alerts.
    #[garde(length(min = 1), inner(pattern(r"^[A-Za-z0-9._-]+$")))]
    pub symbols: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct SaveStrategyToolParams {
    /// Existing strategy id to append a new version to. Omit to create a
    /// brand-new strategy (starts at `version = 1`).
    #[garde(skip)]
    pub strategy_id: Option<i64>,
    /// Owning user id.
    #[garde(length(min = 1))]
    pub user_id: String,
    /// Strategy name.
    #[garde(length(min = 1, max = 200))]
    pub name: String,
    #[garde(inner(length(max = 2000)))]
    pub description: Option<String>,
    /// The natural-language prompt that produced this source, if any.
    #[garde(inner(length(max = 2000)))]
    pub prompt: Option<String>,
    /// Full strategy source.
    #[garde(length(min = 1))]
    pub strategy_source: String,
    /// Whether this strategy is actively monitored for alerts.
    #[serde(default)]
    #[garde(skip)]
    pub alert_active: bool,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct FetchStrategyParams {
    /// Owning user id.
    #[garde(length(min = 1))]
    pub user_id: String,
    /// Strategy id.
    #[garde(range(min = 1))]
    pub strategy_id: i64,
    /// Pin a specific version; omit for the latest.
    #[garde(inner(range(min = 1)))]
    pub version: Option<i32>,
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("invalid date {s:?}: {e}"))
}

use rmcp::handler::server::wrapper::Parameters;

#[tool_router]
impl StrategyWorkerServer {
    /// Compile, security-scan, and dry-run a strategy against a small
    /// ticker sample.
    ///
    /// **Workflow Phase**: 1/4 (entry point)
    /// **When to use**: Before `run_backtest`/`run_screening`/`run_alert`, to
    ///   catch compile errors, forbidden imports/builtins, and shape
    ///   violations without spending a full backtest window.
    /// **Prerequisites**: None
    /// **Next tools**: `run_backtest`, `run_screening`, `run_alert`, or
    ///   `save_strategy` once validation succeeds.
    ///
    /// Picks its own ticker sample (up to 10, from the strategy's own
    /// `get_bar_data` filter literals) and date window (derived from the
    /// widest timeframe/`min_bars` combination found), rather than taking
    /// them from the caller. Fails with `NoTickersForValidation` only if
    /// the strategy never names a concrete ticker anywhere.
    #[tool(name = "validate_strategy", annotations(read_only_hint = true))]
    async fn validate_strategy(
        &self,
        Parameters(params): Parameters<ValidateStrategyParams>,
    ) -> Result<Json<ValidationResult>, String> {
        params
            .validate()
            .map_err(|e| format!("Validation error: {e}"))?;

        let pool = self.connections.pool().await;
        let config = self.config.clone();
        let result = self
            .with_task("validating", async move {
                modes::run_validation(&pool, &config, &params.strategy_source).await
            })
            .await;
        Ok(Json(result))
    }

    /// Run a strategy over a date range and ticker universe, collecting
    /// every emitted instance.
    ///
    /// **Workflow Phase**: 2/4 (historical run)
    /// **When to use**: After `validate_strategy` succeeds, to see what the
    ///   strategy actually produces over a historical window.
    /// **Prerequisites**: `validate_strategy` recommended (not enforced)
    /// **Next tool**: `save_strategy` once results look right
    ///
    /// Returns every surviving instance plus a `summary` (total instance
    /// count, symbols processed, date range) and captured `print`/`plot`
    /// output. Truncates to `max_instances` (flagging `instance_limit_reached`)
    /// rather than failing when a strategy emits too much.
    #[tool(name = "run_backtest", annotations(read_only_hint = true))]
    async fn run_backtest(
        &self,
        Parameters(params): Parameters<RunBacktestParams>,
    ) -> Result<Json<BacktestResult>, String> {
        params
            .validate()
            .map_err(|e| format!("Validation error: {e}"))?;
        let start_date = parse_date(&params.start_date)?;
        let end_date = parse_date(&params.end_date)?;

        let pool = self.connections.pool().await;
        let config = self.config.clone();
        let max_instances = params.max_instances.unwrap_or_else(|| default_max_instances(&config));
        let result = self
            .with_task("running backtest", async move {
                modes::run_backtest(
                    &pool,
                    &config,
                    &params.strategy_source,
                    params.symbols,
                    start_date,
                    end_date,
                    max_instances,
                )
                .await
            })
            .await;
        Ok(Json(result))
    }

    /// Run a strategy over a ticker universe and rank the resulting
    /// instances.
    ///
    /// **Workflow Phase**: 3/4 (ranking, alternative to backtest)
    /// **When to use**: When the goal is "which of these tickers looks
    ///   best right now" rather than a full historical run.
    /// **Prerequisites**: `validate_strategy` recommended
    /// **Next tool**: `run_alert` to convert top candidates into alerts,
    ///   or `save_strategy` to persist.
    ///
    /// Ranks by `score` descending when every instance carries one,
    /// otherwise by `timestamp` descending, then truncates to `limit`.
    #[tool(name = "run_screening", annotations(read_only_hint = true))]
    async fn run_screening(
        &self,
        Parameters(params): Parameters<RunScreeningParams>,
    ) -> Result<Json<ScreeningResult>, String> {
        params
            .validate()
            .map_err(|e| format!("Validation error: {e}"))?;

        let pool = self.connections.pool().await;
        let config = self.config.clone();
        let limit = params.limit;
        let result = self
            .with_task("running screening", async move {
                modes::run_screening(&pool, &config, &params.strategy_source, params.symbols, limit).await
            })
            .await;
        Ok(Json(result))
    }

    /// Run a strategy over a ticker universe and convert every surviving
    /// instance into a priority-classified alert.
    ///
    /// **Workflow Phase**: 4/4 (alerting)
    /// **When to use**: For a strategy already marked `alert_active`, to
    ///   produce notification-ready records for a monitoring loop.
    /// **Prerequisites**: `validate_strategy` recommended
    ///
    /// Each alert carries `{symbol, type, message, timestamp, data,
    /// priority}`; priority is `high` when `score` or `signal_strength`
    /// exceeds `0.8`, else `medium`. Also returns a `signals` map keyed by
    /// ticker for callers that want the raw per-symbol instance.
    #[tool(name = "run_alert", annotations(read_only_hint = true))]
    async fn run_alert(
        &self,
        Parameters(params): Parameters<RunAlertParams>,
    ) -> Result<Json<AlertResult>, String> {
        params
            .validate()
            .map_err(|e| format!("Validation error: {e}"))?;

        let pool = self.connections.pool().await;
        let config = self.config.clone();
        let result = self
            .with_task("running alert scan", async move {
                modes::run_alert(&pool, &config, &params.strategy_source, params.symbols).await
            })
            .await;
        Ok(Json(result))
    }

    /// Persist a strategy version. Runs the same compliance scan as
    /// `validate_strategy` first so the stored row carries an accurate
    /// `min_timeframe`/`alert_universe_full`; refuses to save code that
    /// fails the scan.
    ///
    /// **Workflow Phase**: after any successful run, to keep the source
    /// **When to use**: to persist a new strategy, or append a new
    ///   version to an existing one (pass `strategy_id`)
    /// **Prerequisites**: source must pass the same compliance checks as
    ///   `validate_strategy`
    ///
    /// With `strategy_id` present, appends `version = max(version)+1`
    /// under that `(user_id, name)`; with it absent, inserts a fresh
    /// `version = 1` row. Never overwrites a prior version in place.
    #[tool(
        name = "save_strategy",
        annotations(destructive_hint = false, idempotent_hint = false)
    )]
    async fn save_strategy(
        &self,
        Parameters(params): Parameters<SaveStrategyToolParams>,
    ) -> Result<Json<StrategyRecord>, String> {
        params
            .validate()
            .map_err(|e| format!("Validation error: {e}"))?;

        let metadata = validator::validate(&params.strategy_source)
            .map_err(|e| format!("Strategy failed compliance checks: {e}"))?;

        let save_params = persistence::SaveStrategyParams {
            strategy_id: params.strategy_id,
            user_id: params.user_id,
            name: params.name,
            description: params.description,
            prompt: params.prompt,
            python_code: params.strategy_source,
            alert_active: params.alert_active,
            score: None,
            min_timeframe: Some(metadata.min_timeframe),
            alert_universe_full: metadata.alert_universe_full,
        };

        persistence::save_strategy(&self.connections, save_params)
            .await
            .map(Json)
            .map_err(|e| format!("Error: {e}"))
    }

    /// Fetch a persisted strategy's source and metadata.
    ///
    /// **Workflow Phase**: retrieval, any time
    /// **When to use**: to re-run or re-validate a strategy saved earlier
    /// **Prerequisites**: the strategy must have been saved via `save_strategy`
    ///
    /// `version` pins a specific row; when it doesn't exist, falls back
    /// to the latest version for that strategy (and logs a warning)
    /// rather than failing.
    #[tool(name = "fetch_strategy", annotations(read_only_hint = true))]
    async fn fetch_strategy(
        &self,
        Parameters(params): Parameters<FetchStrategyParams>,
    ) -> Result<Json<StrategyRecord>, String> {
        params
            .validate()
            .map_err(|e| format!("Validation error: {e}"))?;

        persistence::fetch_strategy_code(&self.connections.pool().await, &params.user_id, params.strategy_id, params.version)
            .await
            .map(Json)
            .map_err(|e| format!("Error: {e}"))
    }
}

#[tool_handler]
impl ServerHandler for StrategyWorkerServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "strategy-worker".into(),
                title: Some("Strategy Execution Worker".into()),
                version: "0.1.0".into(),
                description: Some(
                    "Sandboxed strategy execution worker: validates, backtests, screens, \
                     and alerts on user-authored strategies against bar and security data."
                        .into(),
                ),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Strategy execution worker. \
                \n\nRecommended workflow:\
                \n1. validate_strategy({ strategy_source }) — compile, security-scan, and dry-run \
                the strategy against a small self-selected ticker sample and date window. Catches \
                forbidden imports/builtins, missing or malformed entry points, and runtime errors \
                before committing to a full run.\
                \n2. run_backtest({ strategy_source, symbols, start_date, end_date, max_instances? }) \
                — run the strategy over a historical window and a caller-supplied ticker universe, \
                collecting every emitted instance plus prints/plots.\
                \n3. run_screening({ strategy_source, symbols, limit? }) — run the strategy over a \
                ticker universe and return the top-ranked instances (by score, else by recency).\
                \n4. run_alert({ strategy_source, symbols }) — run the strategy and convert every \
                surviving instance into a priority-classified alert record.\
                \n5. save_strategy({ strategy_id?, user_id, name, strategy_source, ... }) — persist \
                a validated strategy; omit strategy_id to create new, pass it to append a version.\
                \n6. fetch_strategy({ user_id, strategy_id, version? }) — retrieve a saved strategy's \
                source for re-validation or re-run.\
                \n\nEvery run_* tool always returns a `{success, ...}` envelope — a failing strategy \
                never surfaces as a transport-level error, only as `success: false` with `error`/\
                `error_details` populated."
                    .into(),
            ),
        }
    }
}
