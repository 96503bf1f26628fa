//! Classified domain errors.
//!
//! Internal plumbing (DB pool setup, file IO, config loading) keeps using
//! `anyhow::Result` exactly as the rest of this stack. `WorkerError` is only
//! for the failure kinds that the engine must tell apart to shape a
//! `{success:false, error, error_details}` envelope.

use schemars::JsonSchema;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Import of forbidden module: {0}")]
    SecurityImport(String),

    #[error("Call to forbidden builtin: {0}")]
    SecurityBuiltin(String),

    #[error("Access to forbidden attribute: {0}")]
    SecurityAttribute(String),

    #[error("Forbidden pattern detected: {0}")]
    SecurityPattern(String),

    #[error("{0}")]
    StrategyCompliance(String),

    #[error("Invalid timeframe: {0}")]
    BadTimeframe(String),

    #[error("Invalid column projection: {0}")]
    BadColumn(String),

    #[error("Column projection is empty after allow-list filtering")]
    EmptyProjection,

    #[error("No strategy entry point found (looked for: strategy, strategy_function, main, run)")]
    NoStrategyFunction,

    #[error("No tickers available for validation — strategy has no extractable ticker universe")]
    NoTickersForValidation,

    #[error("Validation timeout – strategy may have infinite loops or performance issues")]
    ValidationTimeout,

    #[error("No subscribers on channel")]
    NoSubscribers,

    #[error("Task cancelled")]
    Cancelled,

    #[error("Runtime error in strategy: {0}")]
    Runtime(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkerError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SecurityImport(_)
            | Self::SecurityBuiltin(_)
            | Self::SecurityAttribute(_)
            | Self::SecurityPattern(_) => "SecurityError",
            Self::StrategyCompliance(_) => "StrategyComplianceError",
            Self::BadTimeframe(_) => "BadTimeframe",
            Self::BadColumn(_) => "BadColumn",
            Self::EmptyProjection => "EmptyProjection",
            Self::NoStrategyFunction => "NoStrategyFunction",
            Self::NoTickersForValidation => "NoTickersForValidation",
            Self::ValidationTimeout => "ValidationTimeout",
            Self::NoSubscribers => "NoSubscribers",
            Self::Cancelled => "Cancelled",
            Self::Runtime(_) => "RuntimeError",
            Self::Database(_) => "DatabaseError",
            Self::Other(_) => "Error",
        }
    }
}

/// Classified failure detail attached to an engine response envelope.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ErrorDetails {
    pub error_type: String,
    pub error_message: String,
    pub line_number: Option<usize>,
    pub code_context: Option<String>,
    pub full_traceback: Option<String>,
}

impl ErrorDetails {
    pub fn from_error(err: &WorkerError) -> Self {
        Self {
            error_type: err.kind().to_string(),
            error_message: err.to_string(),
            line_number: None,
            code_context: None,
            full_traceback: None,
        }
    }

    pub fn with_location(mut self, line_number: usize, code_context: String) -> Self {
        self.line_number = Some(line_number);
        self.code_context = Some(code_context);
        self
    }

    pub fn with_traceback(mut self, traceback: String) -> Self {
        self.full_traceback = Some(traceback);
        self
    }
}
