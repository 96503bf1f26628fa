//! General-data accessor: queries the `securities` table for
//! current-version rows under field filters and ticker resolution.

use sqlx::postgres::{PgArguments, PgPool};
use sqlx::{Arguments, Row};

use crate::data::{GeneralFilters, Security, GENERAL_COLUMNS};
use crate::error::WorkerError;

fn filter_general_columns(requested: &[String]) -> Vec<String> {
    requested
        .iter()
        .filter(|c| GENERAL_COLUMNS.contains(&c.as_str()))
        .cloned()
        .collect()
}

struct WhereClause {
    sql: String,
    args: PgArguments,
}

fn build_where(filters: &GeneralFilters, resolved_ids: Option<&[i64]>) -> Result<WhereClause, sqlx::error::BoxDynError> {
    let mut clauses = vec!["maxdate IS NULL".to_string()];
    let mut args = PgArguments::default();
    let mut n = 0usize;

    // `active` defaults to true unless explicitly overridden.
    let active = filters.active.unwrap_or(true);
    n += 1;
    args.add(active)?;
    clauses.push(format!("active = ${n}"));

    if let Some(sector) = &filters.sector {
        n += 1;
        args.add(sector.clone())?;
        clauses.push(format!("sector = ${n}"));
    }
    if let Some(industry) = &filters.industry {
        n += 1;
        args.add(industry.clone())?;
        clauses.push(format!("industry = ${n}"));
    }
    if let Some(exch) = &filters.primary_exchange {
        n += 1;
        args.add(exch.clone())?;
        clauses.push(format!("primary_exchange = ${n}"));
    }
    if let Some(min) = filters.market_cap.min {
        n += 1;
        args.add(min)?;
        clauses.push(format!("market_cap >= ${n}"));
    }
    if let Some(max) = filters.market_cap.max {
        n += 1;
        args.add(max)?;
        clauses.push(format!("market_cap <= ${n}"));
    }
    if let Some(min) = filters.total_employees.min {
        n += 1;
        args.add(min)?;
        clauses.push(format!("total_employees >= ${n}"));
    }
    if let Some(max) = filters.total_employees.max {
        n += 1;
        args.add(max)?;
        clauses.push(format!("total_employees <= ${n}"));
    }
    if let Some(min) = filters.weighted_shares_outstanding.min {
        n += 1;
        args.add(min)?;
        clauses.push(format!("weighted_shares_outstanding >= ${n}"));
    }
    if let Some(max) = filters.weighted_shares_outstanding.max {
        n += 1;
        args.add(max)?;
        clauses.push(format!("weighted_shares_outstanding <= ${n}"));
    }

    if let Some(ids) = resolved_ids {
        n += 1;
        args.add(ids.to_vec())?;
        clauses.push(format!("securityid = ANY(${n})"));
    }

    Ok(WhereClause {
        sql: clauses.join(" AND "),
        args,
    })
}

/// Resolve a ticker list to `securityid`s under the given filters (minus
/// the ticker filter itself). An explicit non-empty ticker list that
/// resolves to zero ids means the overall result is empty — the caller
/// must honor `Ok(vec![]) => empty result`, not "ignore the filter".
async fn resolve_ticker_ids(
    pool: &PgPool,
    tickers: &[String],
    filters: &GeneralFilters,
) -> Result<Vec<i64>, WorkerError> {
    let mut scoped = filters.clone();
    scoped.tickers = None;
    let where_clause = build_where(&scoped, None).map_err(|e| WorkerError::Other(e.into()))?;

    let sql = format!(
        "SELECT securityid FROM securities WHERE {} AND ticker = ANY($last)",
        where_clause.sql
    );
    // sqlx positional args must be contiguous; append the ticker array as
    // the final placeholder.
    let n = where_clause_arg_count(&where_clause.sql);
    let sql = sql.replace("$last", &format!("${}", n + 1));
    let mut args = where_clause.args;
    args.add(tickers.to_vec())
        .map_err(|e| WorkerError::Other(anyhow::anyhow!(e.to_string())))?;

    let rows = sqlx::query_with(&sql, args)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get::<i64, _>("securityid")).collect())
}

fn where_clause_arg_count(sql: &str) -> usize {
    sql.matches('$').count()
}

/// `get_general_data(columns?, filters?)`.
pub async fn get_general_data(
    pool: &PgPool,
    columns: Option<Vec<String>>,
    filters: GeneralFilters,
) -> Result<Vec<Security>, WorkerError> {
    let requested = columns.unwrap_or_else(|| GENERAL_COLUMNS.iter().map(|s| (*s).to_string()).collect());
    let projection = filter_general_columns(&requested);
    if projection.is_empty() {
        return Ok(vec![]);
    }

    let resolved_ids = if let Some(tickers) = &filters.tickers {
        if tickers.is_empty() {
            None
        } else {
            let ids = resolve_ticker_ids(pool, tickers, &filters).await?;
            if ids.is_empty() {
                return Ok(vec![]);
            }
            Some(ids)
        }
    } else {
        None
    };

    let where_clause =
        build_where(&filters, resolved_ids.as_deref()).map_err(|e| WorkerError::Other(e.into()))?;
    let sql = format!(
        "SELECT securityid, ticker, name, sector, industry, market, primary_exchange, \
                active, description, cik, market_cap, share_class_shares_outstanding, \
                share_class_figi, total_employees, weighted_shares_outstanding \
         FROM securities WHERE {}",
        where_clause.sql
    );

    let rows = sqlx::query_with(&sql, where_clause.args)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|r| Security {
            securityid: r.get("securityid"),
            ticker: r.get("ticker"),
            name: r.try_get("name").ok(),
            sector: r.try_get("sector").ok(),
            industry: r.try_get("industry").ok(),
            market: r.try_get("market").ok(),
            primary_exchange: r.try_get("primary_exchange").ok(),
            active: r.get("active"),
            description: r.try_get("description").ok(),
            cik: r.try_get("cik").ok(),
            market_cap: r.try_get("market_cap").ok(),
            share_class_shares_outstanding: r.try_get("share_class_shares_outstanding").ok(),
            share_class_figi: r.try_get("share_class_figi").ok(),
            total_employees: r.try_get("total_employees").ok(),
            weighted_shares_outstanding: r.try_get("weighted_shares_outstanding").ok(),
        })
        .collect())
}

/// Resolve the active universe (used by the bar-data accessor's batching
/// path when the caller didn't supply an explicit ticker list).
pub async fn resolve_universe(
    pool: &PgPool,
    filters: &GeneralFilters,
) -> Result<Vec<String>, WorkerError> {
    let where_clause = build_where(filters, None).map_err(|e| WorkerError::Other(e.into()))?;
    let sql = format!("SELECT ticker FROM securities WHERE {}", where_clause.sql);
    let rows = sqlx::query_with(&sql, where_clause.args)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get::<String, _>("ticker")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_general_columns_drops_unknown_keeps_allowed() {
        let requested = vec!["ticker".to_string(), "bogus".to_string(), "sector".to_string()];
        let filtered = filter_general_columns(&requested);
        assert_eq!(filtered, vec!["ticker".to_string(), "sector".to_string()]);
    }

    #[test]
    fn default_general_columns_are_the_full_allow_list() {
        assert_eq!(GENERAL_COLUMNS.len(), 15);
    }
}
