//! Strategy source security, compliance, metadata extraction, and
//! execution.

pub mod fingerprint;
pub mod output;
pub mod plot;
pub mod sandbox;
pub mod validator;

use serde::{Deserialize, Serialize};

/// `GetBarDataCall` fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetBarDataCall {
    pub line_number: usize,
    pub timeframe: String,
    pub min_bars: i64,
    pub filter_analysis: FilterAnalysis,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterAnalysis {
    pub has_tickers: bool,
    pub specific_tickers: Vec<String>,
}

/// Metadata extracted from a validated strategy source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyMetadata {
    pub calls: Vec<GetBarDataCall>,
    pub min_timeframe: String,
    pub max_timeframe_min_bars: (String, i64),
    pub alert_universe_full: Option<Vec<String>>,
}
