//! Timeframe parser.
//!
//! Maps a user-visible timeframe string (`"5m"`, `"2h"`, `"3w"`, `"7"`,
//! `"2y"`, …) to a `(bucket_width, base_table)` pair.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Unit {
    fn pg_unit(self) -> &'static str {
        match self {
            Unit::Minute => "minutes",
            Unit::Hour => "hours",
            Unit::Day => "days",
            Unit::Week => "weeks",
            Unit::Month => "months",
            Unit::Quarter => "months", // quarters aren't a Postgres interval unit; expressed as 3*n months
            Unit::Year => "years",
        }
    }

    fn minutes_per_unit(self) -> f64 {
        match self {
            Unit::Minute => 1.0,
            Unit::Hour => 60.0,
            Unit::Day => 60.0 * 24.0,
            Unit::Week => 60.0 * 24.0 * 7.0,
            Unit::Month => 60.0 * 24.0 * 30.0,
            Unit::Quarter => 60.0 * 24.0 * 91.0,
            Unit::Year => 60.0 * 24.0 * 365.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseTable {
    Ohlcv1m,
    Ohlcv1d,
}

impl BaseTable {
    pub fn as_str(self) -> &'static str {
        match self {
            BaseTable::Ohlcv1m => "ohlcv_1m",
            BaseTable::Ohlcv1d => "ohlcv_1d",
        }
    }
}

/// A parsed timeframe: `count` repetitions of `unit`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Timeframe {
    pub count: i64,
    pub unit: Unit,
    raw: String,
}

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `mo` must be tried before the bare `m` alternative.
    RE.get_or_init(|| Regex::new(r"^(\d+)(mo|m|h|d|w|q|y)?$").unwrap())
}

impl Timeframe {
    pub fn parse(raw: &str) -> Result<Self, WorkerError> {
        let caps = pattern()
            .captures(raw)
            .ok_or_else(|| WorkerError::BadTimeframe(raw.to_string()))?;

        let count: i64 = caps[1]
            .parse()
            .map_err(|_| WorkerError::BadTimeframe(raw.to_string()))?;
        if count <= 0 {
            return Err(WorkerError::BadTimeframe(raw.to_string()));
        }

        let unit = match caps.get(2).map(|m| m.as_str()) {
            None | Some("m") => Unit::Minute,
            Some("h") => Unit::Hour,
            Some("d") => Unit::Day,
            Some("w") => Unit::Week,
            Some("mo") => Unit::Month,
            Some("q") => Unit::Quarter,
            Some("y") => Unit::Year,
            _ => return Err(WorkerError::BadTimeframe(raw.to_string())),
        };

        Ok(Self {
            count,
            unit,
            raw: raw.to_string(),
        })
    }

    /// Sub-daily units (`m`, `h`) live in `ohlcv_1m`; daily-or-higher units
    /// live in `ohlcv_1d`.
    pub fn base_table(&self) -> BaseTable {
        match self.unit {
            Unit::Minute | Unit::Hour => BaseTable::Ohlcv1m,
            Unit::Day | Unit::Week | Unit::Month | Unit::Quarter | Unit::Year => {
                BaseTable::Ohlcv1d
            }
        }
    }

    /// `1m` and `1d` bypass aggregation entirely.
    pub fn is_direct(&self) -> bool {
        self.count == 1 && matches!(self.unit, Unit::Minute | Unit::Day)
    }

    /// Postgres `time_bucket` interval literal, e.g. `"5 minutes"`,
    /// `"2 years"`. Quarters are expressed in months since Postgres has no
    /// native quarter interval unit.
    pub fn pg_interval(&self) -> String {
        let count = if self.unit == Unit::Quarter {
            self.count * 3
        } else {
            self.count
        };
        format!("{count} {}", self.unit.pg_unit())
    }

    /// Approximate duration in minutes, used to compare timeframes for
    /// "smallest bucket" / "largest bucket" selection (§4.5).
    pub fn approx_minutes(&self) -> f64 {
        self.count as f64 * self.unit.minutes_per_unit()
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_timeframe_strings() {
        let tf = Timeframe::parse("5m").unwrap();
        assert_eq!(tf.pg_interval(), "5 minutes");
        assert_eq!(tf.base_table(), BaseTable::Ohlcv1m);

        let tf = Timeframe::parse("2h").unwrap();
        assert_eq!(tf.pg_interval(), "2 hours");
        assert_eq!(tf.base_table(), BaseTable::Ohlcv1m);

        let tf = Timeframe::parse("3w").unwrap();
        assert_eq!(tf.pg_interval(), "3 weeks");
        assert_eq!(tf.base_table(), BaseTable::Ohlcv1d);

        let tf = Timeframe::parse("7").unwrap();
        assert_eq!(tf.pg_interval(), "7 minutes");
        assert_eq!(tf.base_table(), BaseTable::Ohlcv1m);

        let tf = Timeframe::parse("2y").unwrap();
        assert_eq!(tf.pg_interval(), "2 years");
        assert_eq!(tf.base_table(), BaseTable::Ohlcv1d);

        assert!(Timeframe::parse("5xy").is_err());
    }

    #[test]
    fn direct_access_sentinel_is_exactly_1m_and_1d() {
        assert!(Timeframe::parse("1m").unwrap().is_direct());
        assert!(Timeframe::parse("1d").unwrap().is_direct());
        assert!(!Timeframe::parse("2m").unwrap().is_direct());
        assert!(!Timeframe::parse("1h").unwrap().is_direct());
        assert!(!Timeframe::parse("1w").unwrap().is_direct());
    }

    #[test]
    fn rejects_malformed_and_zero() {
        assert!(Timeframe::parse("").is_err());
        assert!(Timeframe::parse("m5").is_err());
        assert!(Timeframe::parse("0d").is_err());
        assert!(Timeframe::parse("-3d").is_err());
        assert!(Timeframe::parse("5xyz").is_err());
    }

    #[test]
    fn quarter_and_month_units_resolve_to_daily_table() {
        assert_eq!(
            Timeframe::parse("1q").unwrap().base_table(),
            BaseTable::Ohlcv1d
        );
        assert_eq!(
            Timeframe::parse("1mo").unwrap().base_table(),
            BaseTable::Ohlcv1d
        );
        assert_eq!(Timeframe::parse("1q").unwrap().pg_interval(), "3 months");
    }

    #[test]
    fn approx_minutes_orders_timeframes_by_duration() {
        let a = Timeframe::parse("1h").unwrap();
        let b = Timeframe::parse("1d").unwrap();
        let c = Timeframe::parse("1w").unwrap();
        assert!(a.approx_minutes() < b.approx_minutes());
        assert!(b.approx_minutes() < c.approx_minutes());
    }
}
