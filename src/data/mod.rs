//! Data layer: the query builder, bar-data accessor, general-data
//! accessor, and the shared row/filter types they operate on.

pub mod bar_accessor;
pub mod general_accessor;
pub mod pool;
pub mod query;

use serde::{Deserialize, Serialize};

/// Column allow-list for `get_bar_data`.
pub const BAR_COLUMNS: &[&str] = &[
    "ticker",
    "timestamp",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "transactions",
];

/// Default column allow-list for `get_general_data`.
pub const GENERAL_COLUMNS: &[&str] = &[
    "securityid",
    "ticker",
    "name",
    "sector",
    "industry",
    "market",
    "primary_exchange",
    "active",
    "description",
    "cik",
    "market_cap",
    "share_class_shares_outstanding",
    "share_class_figi",
    "total_employees",
    "weighted_shares_outstanding",
];

/// Filters accepted by `get_bar_data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BarFilters {
    pub tickers: Option<Vec<String>>,
}

impl BarFilters {
    pub fn has_tickers(&self) -> bool {
        self.tickers.as_ref().is_some_and(|t| !t.is_empty())
    }
}

/// Numeric range filter, used for `market_cap_min/max` etc.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RangeFilter {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Filters accepted by `get_general_data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralFilters {
    pub tickers: Option<Vec<String>>,
    pub active: Option<bool>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub primary_exchange: Option<String>,
    pub market_cap: RangeFilter,
    pub total_employees: RangeFilter,
    pub weighted_shares_outstanding: RangeFilter,
}

/// One row of OHLCV bar data, as returned (post price/volume rescaling) by
/// the query layer. Callers hold a `polars::DataFrame` assembled from
/// these, not this struct directly, but it's the unit the SQL layer
/// decodes rows into before columnar assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub ticker: String,
    pub timestamp: i64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<i64>,
    pub transactions: Option<i64>,
}

/// One row of the `securities` table (current version only — `maxdate IS
/// NULL`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Security {
    pub securityid: i64,
    pub ticker: String,
    pub name: Option<String>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub market: Option<String>,
    pub primary_exchange: Option<String>,
    pub active: bool,
    pub description: Option<String>,
    pub cik: Option<String>,
    pub market_cap: Option<f64>,
    pub share_class_shares_outstanding: Option<f64>,
    pub share_class_figi: Option<String>,
    pub total_employees: Option<i64>,
    pub weighted_shares_outstanding: Option<f64>,
}

pub fn clamp_min_bars(min_bars: i64) -> i64 {
    min_bars.clamp(1, 10_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_min_bars_enforces_allowed_range() {
        assert_eq!(clamp_min_bars(0), 1);
        assert_eq!(clamp_min_bars(-5), 1);
        assert_eq!(clamp_min_bars(1), 1);
        assert_eq!(clamp_min_bars(20000), 10_000);
        assert_eq!(clamp_min_bars(500), 500);
    }

    #[test]
    fn has_tickers_distinguishes_absent_from_empty_from_populated() {
        assert!(!BarFilters { tickers: None }.has_tickers());
        assert!(!BarFilters {
            tickers: Some(vec![])
        }
        .has_tickers());
        assert!(BarFilters {
            tickers: Some(vec!["AAPL".into()])
        }
        .has_tickers());
    }
}
