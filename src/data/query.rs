//! Query builder.
//!
//! Emits parameterised SQL plus a positional parameter list for the two
//! windowing modes (realtime / date-range) over either the direct-access
//! path (`1m`/`1d`) or the aggregated `time_bucket` CTE path.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::America::New_York;
use sqlx::postgres::PgArguments;
use sqlx::Arguments;

use crate::data::{BarFilters, BAR_COLUMNS};
use crate::error::WorkerError;
use crate::timeframe::{BaseTable, Timeframe};

/// A single bound parameter. Kept as an enum (rather than binding directly
/// via chained `.bind()` calls) because the parameter list's shape depends
/// on which optional filters are present.
#[derive(Debug, Clone)]
pub enum SqlParam {
    TextArray(Vec<String>),
    BigInt(i64),
    TimestampTz(DateTime<Utc>),
}

#[derive(Debug, Default)]
struct ParamBuilder {
    params: Vec<SqlParam>,
}

impl ParamBuilder {
    fn push(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }
}

#[derive(Debug)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl BuiltQuery {
    /// Realize the parameter list into `sqlx`'s dynamic argument container.
    pub fn arguments(&self) -> Result<PgArguments, sqlx::error::BoxDynError> {
        let mut args = PgArguments::default();
        for param in &self.params {
            match param {
                SqlParam::TextArray(v) => args.add(v.clone())?,
                SqlParam::BigInt(n) => args.add(*n)?,
                SqlParam::TimestampTz(t) => args.add(*t)?,
            }
        }
        Ok(args)
    }
}

/// Naive datetimes are interpreted as already being in America/New_York
/// wall-clock time (no conversion); the database stores market timestamps
/// in that zone.
pub fn normalize_est(date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).unwrap();
    New_York
        .from_local_datetime(&naive)
        .single()
        .unwrap_or_else(|| New_York.from_utc_datetime(&naive))
        .with_timezone(&Utc)
}

use chrono::TimeZone;

/// Filter the caller's requested column projection down to the allow-list,
/// preserving caller order.
pub fn filter_bar_columns(requested: &[String]) -> Vec<String> {
    requested
        .iter()
        .filter(|c| BAR_COLUMNS.contains(&c.as_str()))
        .cloned()
        .collect()
}

fn column_expr(col: &str) -> &'static str {
    match col {
        "ticker" => "ticker",
        "timestamp" => "EXTRACT(EPOCH FROM ts)::bigint AS timestamp",
        "open" => "open",
        "high" => "high",
        "low" => "low",
        "close" => "close",
        "volume" => "volume",
        "transactions" => "transactions",
        _ => unreachable!("caller must pre-filter via filter_bar_columns"),
    }
}

/// Build the `bars` CTE body: the unified `(ticker, ts, open, high, low,
/// close, volume, transactions)` shape, either read straight off a base
/// table (direct path) or aggregated via `time_bucket` (aggregated path).
fn build_base_cte(
    timeframe: &Timeframe,
    extended_hours: bool,
    filters: &BarFilters,
    pb: &mut ParamBuilder,
) -> String {
    let base = timeframe.base_table();
    let mut ticker_filter = String::new();
    if filters.has_tickers() {
        let placeholder = pb.push(SqlParam::TextArray(filters.tickers.clone().unwrap()));
        ticker_filter = format!(" AND o.ticker = ANY({placeholder})");
    }

    // Extended-hours filtering only makes sense against minute-resolution
    // rows. Aggregated timeframes built on ohlcv_1d never see this filter
    // applied, regardless of the caller's flag.
    let eh_filter = if base == BaseTable::Ohlcv1m && !extended_hours {
        " AND EXTRACT(DOW FROM o.timestamp AT TIME ZONE 'America/New_York') BETWEEN 1 AND 5\
          AND (o.timestamp AT TIME ZONE 'America/New_York')::time >= TIME '09:30'\
          AND (o.timestamp AT TIME ZONE 'America/New_York')::time < TIME '16:00'"
            .to_string()
    } else {
        String::new()
    };

    if timeframe.is_direct() {
        format!(
            "SELECT o.ticker AS ticker, o.timestamp AS ts, \
                    o.open::float8 / 1000.0 AS open, o.high::float8 / 1000.0 AS high, \
                    o.low::float8 / 1000.0 AS low, o.close::float8 / 1000.0 AS close, \
                    o.volume AS volume, o.transactions AS transactions \
             FROM {table} o WHERE true{ticker_filter}{eh_filter}",
            table = base.as_str(),
        )
    } else {
        let interval = timeframe.pg_interval();
        format!(
            "SELECT o.ticker AS ticker, \
                    time_bucket('{interval}', o.timestamp AT TIME ZONE 'America/New_York') AS ts, \
                    first(o.open::float8 / 1000.0, o.timestamp) AS open, \
                    max(o.high::float8 / 1000.0) AS high, \
                    min(o.low::float8 / 1000.0) AS low, \
                    last(o.close::float8 / 1000.0, o.timestamp) AS close, \
                    sum(o.volume)::bigint AS volume, \
                    NULL::bigint AS transactions \
             FROM {table} o WHERE true{ticker_filter}{eh_filter} \
             GROUP BY o.ticker, ts",
            table = base.as_str(),
        )
    }
}

/// Build the full query for realtime mode: latest `min_bars` per ticker,
/// descending, dropping tickers with insufficient history.
pub fn build_realtime_query(
    timeframe: &Timeframe,
    columns: &[String],
    min_bars: i64,
    filters: &BarFilters,
    extended_hours: bool,
) -> Result<BuiltQuery, WorkerError> {
    let projection = filter_bar_columns(columns);
    if projection.is_empty() {
        return Err(WorkerError::EmptyProjection);
    }

    let mut pb = ParamBuilder::default();
    let base_cte = build_base_cte(timeframe, extended_hours, filters, &mut pb);
    let min_bars_placeholder = pb.push(SqlParam::BigInt(min_bars));

    let select_list = projection
        .iter()
        .map(|c| column_expr(c))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        "WITH bars AS ({base_cte}), \
         ranked AS ( \
           SELECT *, \
                  ROW_NUMBER() OVER (PARTITION BY ticker ORDER BY ts DESC) AS rn, \
                  COUNT(*) OVER (PARTITION BY ticker) AS total_bars \
           FROM bars \
         ) \
         SELECT {select_list} FROM ranked \
         WHERE rn <= {min_bars_placeholder} AND total_bars >= {min_bars_placeholder} \
         ORDER BY ticker, ts DESC"
    );

    Ok(BuiltQuery {
        sql,
        params: pb.params,
    })
}

/// Build the full query for date-range mode: in-range bars plus up to
/// `min_bars - 1` pre-roll bars before `start`, ascending.
pub fn build_date_range_query(
    timeframe: &Timeframe,
    columns: &[String],
    min_bars: i64,
    filters: &BarFilters,
    extended_hours: bool,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<BuiltQuery, WorkerError> {
    let projection = filter_bar_columns(columns);
    if projection.is_empty() {
        return Err(WorkerError::EmptyProjection);
    }

    let mut pb = ParamBuilder::default();
    let base_cte = build_base_cte(timeframe, extended_hours, filters, &mut pb);
    let start_ts = pb.push(SqlParam::TimestampTz(normalize_est(start)));
    // end is exclusive-of-next-day inclusive-of-end-date: bound at end+1 day.
    let end_ts = pb.push(SqlParam::TimestampTz(normalize_est(
        end.succ_opt().unwrap_or(end),
    )));
    let pre_roll_limit = pb.push(SqlParam::BigInt((min_bars - 1).max(0)));

    let select_list = projection
        .iter()
        .map(|c| column_expr(c))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        "WITH bars AS ({base_cte}), \
         in_range AS ( \
           SELECT ticker, ts, open, high, low, close, volume, transactions \
           FROM bars WHERE ts >= {start_ts} AND ts < {end_ts} \
         ), \
         pre_roll AS ( \
           SELECT ticker, ts, open, high, low, close, volume, transactions, \
                  ROW_NUMBER() OVER (PARTITION BY ticker ORDER BY ts DESC) AS rn \
           FROM bars WHERE ts < {start_ts} \
         ), \
         combined AS ( \
           SELECT ticker, ts, open, high, low, close, volume, transactions FROM in_range \
           UNION ALL \
           SELECT ticker, ts, open, high, low, close, volume, transactions \
           FROM pre_roll WHERE rn <= {pre_roll_limit} \
         ) \
         SELECT {select_list} FROM combined ORDER BY ticker, ts ASC"
    );

    Ok(BuiltQuery {
        sql,
        params: pb.params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn empty_projection_after_allow_list_filter_is_an_error() {
        let tf = Timeframe::parse("1d").unwrap();
        let bogus = cols(&["evil_column", "another_bogus_one"]);
        let err =
            build_realtime_query(&tf, &bogus, 5, &BarFilters::default(), false).unwrap_err();
        assert!(matches!(err, WorkerError::EmptyProjection));
    }

    #[test]
    fn unknown_columns_are_dropped_not_fatal_when_some_survive() {
        let requested = cols(&["ticker", "bogus", "close"]);
        let filtered = filter_bar_columns(&requested);
        assert_eq!(filtered, vec!["ticker".to_string(), "close".to_string()]);
    }

    #[test]
    fn direct_path_divides_prices_by_1000_and_extracts_epoch() {
        let tf = Timeframe::parse("1d").unwrap();
        let query = build_realtime_query(
            &tf,
            &cols(&["ticker", "timestamp", "open", "close"]),
            1,
            &BarFilters {
                tickers: Some(vec!["AAPL".into()]),
            },
            false,
        )
        .unwrap();
        assert!(query.sql.contains("o.open::float8 / 1000.0"));
        assert!(query.sql.contains("EXTRACT(EPOCH FROM ts)::bigint"));
        assert!(query.sql.contains("ohlcv_1d"));
        assert!(!query.sql.contains("time_bucket"));
    }

    #[test]
    fn aggregated_path_uses_time_bucket_and_first_last() {
        let tf = Timeframe::parse("5m").unwrap();
        let query = build_realtime_query(
            &tf,
            &cols(&["ticker", "timestamp", "close"]),
            3,
            &BarFilters::default(),
            false,
        )
        .unwrap();
        assert!(query.sql.contains("time_bucket('5 minutes'"));
        assert!(query.sql.contains("first("));
        assert!(query.sql.contains("last("));
        assert!(query.sql.contains("ohlcv_1m"));
    }

    #[test]
    fn extended_hours_filter_applies_only_to_minute_base_table() {
        let tf_minute = Timeframe::parse("1m").unwrap();
        let q = build_realtime_query(
            &tf_minute,
            &cols(&["ticker", "close"]),
            1,
            &BarFilters::default(),
            false,
        )
        .unwrap();
        assert!(q.sql.contains("BETWEEN 1 AND 5"));

        let tf_daily = Timeframe::parse("1w").unwrap();
        let q2 = build_realtime_query(
            &tf_daily,
            &cols(&["ticker", "close"]),
            1,
            &BarFilters::default(),
            false,
        )
        .unwrap();
        assert!(!q2.sql.contains("BETWEEN 1 AND 5"));
    }

    #[test]
    fn extended_hours_true_suppresses_the_filter() {
        let tf = Timeframe::parse("1m").unwrap();
        let q = build_realtime_query(
            &tf,
            &cols(&["ticker", "close"]),
            1,
            &BarFilters::default(),
            true,
        )
        .unwrap();
        assert!(!q.sql.contains("BETWEEN 1 AND 5"));
    }

    #[test]
    fn realtime_orders_descending_date_range_orders_ascending() {
        let tf = Timeframe::parse("1d").unwrap();
        let realtime = build_realtime_query(
            &tf,
            &cols(&["ticker", "close"]),
            5,
            &BarFilters::default(),
            false,
        )
        .unwrap();
        assert!(realtime.sql.trim_end().ends_with("ORDER BY ticker, ts DESC"));

        let date_range = build_date_range_query(
            &tf,
            &cols(&["ticker", "close"]),
            3,
            &BarFilters::default(),
            false,
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 2).unwrap(),
        )
        .unwrap();
        assert!(date_range.sql.trim_end().ends_with("ORDER BY ticker, ts ASC"));
        assert!(date_range.sql.contains("pre_roll"));
    }

    #[test]
    fn pre_roll_limit_is_min_bars_minus_one_and_never_negative() {
        let tf = Timeframe::parse("1d").unwrap();
        let q = build_date_range_query(
            &tf,
            &cols(&["ticker", "close"]),
            1,
            &BarFilters::default(),
            false,
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 2).unwrap(),
        )
        .unwrap();
        // min_bars=1 => pre_roll_limit param should bind to 0
        let last_param = q.params.last().unwrap();
        assert!(matches!(last_param, SqlParam::BigInt(0)));
    }

    #[test]
    fn normalize_est_treats_naive_date_as_ny_wall_clock() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let utc = normalize_est(d);
        // Jan 15 2024 00:00 America/New_York == 05:00 UTC (EST, UTC-5)
        assert_eq!(utc.format("%H:%M").to_string(), "05:00");
    }
}
