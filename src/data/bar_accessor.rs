//! Bar-data accessor: the public `get_bar_data` operation. Decides
//! single-shot vs. batched execution, fans batches out concurrently
//! (bounded), and assembles a column-major `polars::DataFrame`.

use futures::stream::{self, StreamExt};
use polars::prelude::*;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::data::general_accessor::resolve_universe;
use crate::data::query::{build_date_range_query, build_realtime_query, BuiltQuery};
use crate::data::{clamp_min_bars, BarFilters, GeneralFilters};
use crate::error::WorkerError;
use crate::timeframe::Timeframe;
use chrono::NaiveDate;

const BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct GetBarDataParams {
    pub timeframe: String,
    pub columns: Option<Vec<String>>,
    pub min_bars: i64,
    pub filters: BarFilters,
    pub aggregate_mode: bool,
    pub extended_hours: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Decide whether the batching path is required.
fn needs_batching(params: &GetBarDataParams) -> bool {
    if params.aggregate_mode {
        return false;
    }
    !params.filters.has_tickers()
        || params
            .filters
            .tickers
            .as_ref()
            .is_some_and(|t| t.len() > BATCH_SIZE)
}

fn build_query(params: &GetBarDataParams, columns: &[String]) -> Result<BuiltQuery, WorkerError> {
    let timeframe = Timeframe::parse(&params.timeframe)?;
    let min_bars = clamp_min_bars(params.min_bars);

    match (params.start_date, params.end_date) {
        (Some(start), Some(end)) => build_date_range_query(
            &timeframe,
            columns,
            min_bars,
            &params.filters,
            params.extended_hours,
            start,
            end,
        ),
        _ => build_realtime_query(
            &timeframe,
            columns,
            min_bars,
            &params.filters,
            params.extended_hours,
        ),
    }
}

async fn run_single_query(
    pool: &PgPool,
    params: &GetBarDataParams,
    columns: &[String],
) -> Result<DataFrame, WorkerError> {
    let query = match build_query(params, columns) {
        Ok(q) => q,
        Err(WorkerError::EmptyProjection) => return Ok(empty_frame(columns)),
        Err(e) => return Err(e),
    };
    let args = query
        .arguments()
        .map_err(|e| WorkerError::Other(anyhow::anyhow!(e.to_string())))?;

    let rows = sqlx::query_with(&query.sql, args).fetch_all(pool).await?;
    rows_to_frame(&rows, columns)
}

fn empty_frame(columns: &[String]) -> DataFrame {
    let series: Vec<Column> = columns
        .iter()
        .map(|c| match c.as_str() {
            "ticker" => Column::new(c.as_str().into(), Vec::<String>::new()),
            "timestamp" | "volume" | "transactions" => {
                Column::new(c.as_str().into(), Vec::<i64>::new())
            }
            _ => Column::new(c.as_str().into(), Vec::<f64>::new()),
        })
        .collect();
    DataFrame::new(series).unwrap_or_default()
}

fn rows_to_frame(rows: &[sqlx::postgres::PgRow], columns: &[String]) -> Result<DataFrame, WorkerError> {
    if rows.is_empty() {
        return Ok(empty_frame(columns));
    }

    let mut series = Vec::with_capacity(columns.len());
    for col in columns {
        let column = match col.as_str() {
            "ticker" => Column::new(
                "ticker".into(),
                rows.iter()
                    .map(|r| r.get::<String, _>("ticker"))
                    .collect::<Vec<_>>(),
            ),
            "timestamp" => Column::new(
                "timestamp".into(),
                rows.iter()
                    .map(|r| r.get::<i64, _>("timestamp"))
                    .collect::<Vec<_>>(),
            ),
            "open" | "high" | "low" | "close" => Column::new(
                col.as_str().into(),
                rows.iter()
                    .map(|r| r.try_get::<f64, _>(col.as_str()).ok())
                    .collect::<Vec<_>>(),
            ),
            "volume" => Column::new(
                "volume".into(),
                rows.iter()
                    .map(|r| r.try_get::<i64, _>("volume").ok())
                    .collect::<Vec<_>>(),
            ),
            "transactions" => Column::new(
                "transactions".into(),
                rows.iter()
                    .map(|r| r.try_get::<i64, _>("transactions").ok())
                    .collect::<Vec<_>>(),
            ),
            other => return Err(WorkerError::BadColumn(other.to_string())),
        };
        series.push(column);
    }
    DataFrame::new(series).map_err(|e| WorkerError::Other(e.into()))
}

/// `get_bar_data(timeframe, columns?, min_bars=1, filters?, aggregate_mode,
/// extended_hours, start_date?, end_date?)`.
pub async fn get_bar_data(
    pool: &PgPool,
    max_concurrency: usize,
    mut params: GetBarDataParams,
) -> Result<DataFrame, WorkerError> {
    let _ = Timeframe::parse(&params.timeframe)?; // surface BadTimeframe eagerly
    params.min_bars = clamp_min_bars(params.min_bars);

    let requested = params
        .columns
        .clone()
        .unwrap_or_else(|| crate::data::BAR_COLUMNS.iter().map(|s| (*s).to_string()).collect());
    let columns = crate::data::query::filter_bar_columns(&requested);
    if columns.is_empty() {
        return Ok(DataFrame::default());
    }

    if !needs_batching(&params) {
        return match run_single_query(pool, &params, &columns).await {
            Ok(df) => Ok(df),
            Err(e) => {
                tracing::error!(error = %e, "get_bar_data single-shot query failed");
                Err(e)
            }
        };
    }

    let tickers = if params.filters.has_tickers() {
        params.filters.tickers.clone().unwrap()
    } else {
        resolve_universe(pool, &GeneralFilters::default()).await.unwrap_or_default()
    };

    let batches: Vec<Vec<String>> = tickers
        .chunks(BATCH_SIZE)
        .map(<[String]>::to_vec)
        .collect();

    let results: Vec<Option<DataFrame>> = stream::iter(batches.into_iter().map(|batch| {
        let mut batch_params = params.clone();
        batch_params.filters = BarFilters {
            tickers: Some(batch),
        };
        let columns = columns.clone();
        async move {
            match run_single_query(pool, &batch_params, &columns).await {
                Ok(df) => Some(df),
                Err(e) => {
                    tracing::warn!(error = %e, "batch query failed, skipping batch");
                    None
                }
            }
        }
    }))
    .buffer_unordered(max_concurrency.max(1))
    .collect()
    .await;

    let frames: Vec<DataFrame> = results.into_iter().flatten().filter(|df| df.height() > 0).collect();
    if frames.is_empty() {
        return Ok(empty_frame(&columns));
    }

    let mut iter = frames.into_iter();
    let mut acc = iter.next().unwrap();
    for df in iter {
        acc = acc.vstack(&df).map_err(|e| WorkerError::Other(e.into()))?;
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters_with(tickers: Vec<&str>) -> BarFilters {
        BarFilters {
            tickers: Some(tickers.into_iter().map(String::from).collect()),
        }
    }

    #[test]
    fn batching_used_when_no_tickers_supplied() {
        let params = GetBarDataParams {
            timeframe: "1d".into(),
            min_bars: 1,
            ..Default::default()
        };
        assert!(needs_batching(&params));
    }

    #[test]
    fn batching_used_when_ticker_list_exceeds_1000() {
        let many: Vec<String> = (0..1500).map(|i| format!("T{i}")).collect();
        let params = GetBarDataParams {
            timeframe: "1d".into(),
            min_bars: 1,
            filters: BarFilters {
                tickers: Some(many),
            },
            ..Default::default()
        };
        assert!(needs_batching(&params));
    }

    #[test]
    fn explicit_small_ticker_list_is_single_shot() {
        let params = GetBarDataParams {
            timeframe: "1d".into(),
            min_bars: 1,
            filters: filters_with(vec!["AAPL", "MSFT"]),
            ..Default::default()
        };
        assert!(!needs_batching(&params));
    }

    #[test]
    fn aggregate_mode_always_disables_batching() {
        let many: Vec<String> = (0..2000).map(|i| format!("T{i}")).collect();
        let params = GetBarDataParams {
            timeframe: "1d".into(),
            min_bars: 1,
            aggregate_mode: true,
            filters: BarFilters {
                tickers: Some(many),
            },
            ..Default::default()
        };
        assert!(!needs_batching(&params));
    }

    #[test]
    fn empty_explicit_ticker_list_with_aggregate_off_takes_batching_path() {
        let params = GetBarDataParams {
            timeframe: "1d".into(),
            min_bars: 1,
            filters: BarFilters {
                tickers: Some(vec![]),
            },
            ..Default::default()
        };
        assert!(needs_batching(&params));
    }
}
