//! Strategy validator.
//!
//! Two independent passes: a security scan over the raw source (regex
//! based — the dialect is small enough that a text scan catches every
//! forbidden construct without needing rhai's unstable `internals`
//! feature), and a compliance pass over the parsed `rhai::AST` that
//! checks the strategy shape itself.

use std::sync::OnceLock;

use regex::Regex;
use rhai::Engine;

use crate::error::WorkerError;
use crate::strategy::fingerprint::extract_calls;
use crate::strategy::StrategyMetadata;
use crate::timeframe::Timeframe;

/// Builtins that would let a strategy escape the sandbox (dynamic
/// eval / dynamic dispatch) even though rhai's default engine carries no
/// filesystem or process access.
const FORBIDDEN_BUILTINS: &[&str] = &["eval", "call"];

/// Host-registered function names a strategy must not shadow.
const RESERVED_NAMES: &[&str] = &[
    "get_bar_data",
    "get_general_data",
    "generate_equity_curve",
    "print",
    "debug",
    "eval",
    "call",
    "Fn",
];

const ENTRY_POINT: &str = "strategy";

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bimport\s+").unwrap())
}

fn dunder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b__[A-Za-z0-9_]+__\b").unwrap())
}

fn fn_decl_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bfn\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(([^)]*)\)").unwrap())
}

fn forbidden_pattern_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Host-escape attempts that have no legitimate place in a strategy:
    // namespaced paths into a (nonexistent) host module system, and raw
    // shell-style backticks.
    RE.get_or_init(|| Regex::new(r"::\s*(std|process|fs|os|net)\b|`").unwrap())
}

/// Stage 1: reject forbidden imports, builtins, attribute-style
/// reflection, and other disallowed patterns.
pub fn scan_security(source: &str) -> Result<(), WorkerError> {
    if let Some(m) = import_re().find(source) {
        let tail = source[m.end()..].split_whitespace().next().unwrap_or("");
        return Err(WorkerError::SecurityImport(tail.trim_matches('"').to_string()));
    }

    for builtin in FORBIDDEN_BUILTINS {
        let re = Regex::new(&format!(r"\b{}\s*\(", regex::escape(builtin))).unwrap();
        if re.is_match(source) {
            return Err(WorkerError::SecurityBuiltin((*builtin).to_string()));
        }
    }

    if let Some(m) = dunder_re().find(source) {
        return Err(WorkerError::SecurityAttribute(m.as_str().to_string()));
    }

    if let Some(m) = forbidden_pattern_re().find(source) {
        return Err(WorkerError::SecurityPattern(m.as_str().to_string()));
    }

    Ok(())
}

/// Pull the body text of `fn name(...) { ... }` via brace matching.
fn function_body(source: &str, header_end: usize) -> Option<&str> {
    let rest = &source[header_end..];
    let brace_start = rest.find('{')?;
    let mut depth = 0i32;
    for (i, ch) in rest.char_indices().skip(brace_start) {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&rest[brace_start + 1..i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Stage 2: parse the script, confirm exactly one zero-arg `strategy`
/// entry point exists, no function reuses a reserved name, and the
/// entry point returns a value on every path that isn't unit.
pub fn scan_compliance(source: &str) -> Result<(), WorkerError> {
    let engine = Engine::new();
    let ast = engine
        .compile(source)
        .map_err(|e| WorkerError::StrategyCompliance(format!("script does not parse: {e}")))?;

    let mut entry_arity = None;
    for f in ast.iter_functions() {
        if RESERVED_NAMES.contains(&f.name) {
            return Err(WorkerError::StrategyCompliance(format!(
                "function `{}` reuses a reserved host name",
                f.name
            )));
        }
        if f.name == ENTRY_POINT {
            entry_arity = Some(f.params.len());
        }
    }

    match entry_arity {
        None => return Err(WorkerError::NoStrategyFunction),
        Some(n) if n != 0 => {
            return Err(WorkerError::StrategyCompliance(format!(
                "`{ENTRY_POINT}` must take no parameters, found {n}"
            )))
        }
        _ => {}
    }

    // Locate `fn strategy(...)` header in the raw (comment-stripped by
    // regex scan already having run) source to inspect its body text.
    let header = fn_decl_re()
        .captures_iter(source)
        .find(|c| &c[1] == ENTRY_POINT)
        .ok_or(WorkerError::NoStrategyFunction)?;
    let header_end = header.get(0).unwrap().end();
    let body = function_body(source, header_end)
        .ok_or_else(|| WorkerError::StrategyCompliance("malformed strategy body".into()))?;

    let has_non_unit_return = body
        .match_indices("return")
        .any(|(i, _)| !body[i + "return".len()..].trim_start().starts_with(';'));
    if !has_non_unit_return {
        return Err(WorkerError::StrategyCompliance(
            "`strategy` must return a value; no non-unit `return` statement found".into(),
        ));
    }

    Ok(())
}

/// Run both validation stages and, on success, extract the metadata the
/// engine needs to plan execution.
pub fn validate(source: &str) -> Result<StrategyMetadata, WorkerError> {
    scan_security(source)?;
    scan_compliance(source)?;

    let calls = extract_calls(source);
    let timeframes: Vec<Timeframe> = calls
        .iter()
        .filter_map(|c| Timeframe::parse(&c.timeframe).ok())
        .collect();

    let min_timeframe = timeframes
        .iter()
        .min_by(|a, b| a.approx_minutes().total_cmp(&b.approx_minutes()))
        .map(|t| t.raw().to_string())
        .unwrap_or_else(|| "1d".to_string());

    let max_timeframe_min_bars = calls
        .iter()
        .zip(timeframes.iter())
        .max_by(|(_, a), (_, b)| a.approx_minutes().total_cmp(&b.approx_minutes()))
        .map(|(c, t)| (t.raw().to_string(), c.min_bars))
        .unwrap_or_else(|| ("1d".to_string(), 1));

    // If every call restricts to an explicit ticker list, the union is
    // the full alert universe; any call with no ticker filter means the
    // universe is effectively unbounded (resolved from `securities` at
    // run time instead).
    let alert_universe_full = if calls.is_empty() || calls.iter().any(|c| !c.filter_analysis.has_tickers) {
        None
    } else {
        let mut all: Vec<String> = calls
            .iter()
            .flat_map(|c| c.filter_analysis.specific_tickers.clone())
            .collect();
        all.sort();
        all.dedup();
        Some(all)
    };

    Ok(StrategyMetadata {
        calls,
        min_timeframe,
        max_timeframe_min_bars,
        alert_universe_full,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
        fn strategy() {
            let bars = get_bar_data("1d", (), 5, #{});
            return [];
        }
    "#;

    #[test]
    fn accepts_well_formed_strategy() {
        let meta = validate(VALID).unwrap();
        assert_eq!(meta.calls.len(), 1);
        assert_eq!(meta.min_timeframe, "1d");
    }

    #[test]
    fn rejects_import_statement() {
        let src = r#"
            import "oops" as x;
            fn strategy() { return []; }
        "#;
        assert!(matches!(
            validate(src),
            Err(WorkerError::SecurityImport(_))
        ));
    }

    #[test]
    fn rejects_eval_builtin() {
        let src = r#"
            fn strategy() {
                eval("1 + 1");
                return [];
            }
        "#;
        assert!(matches!(
            validate(src),
            Err(WorkerError::SecurityBuiltin(_))
        ));
    }

    #[test]
    fn rejects_dunder_attribute_access() {
        let src = r#"
            fn strategy() {
                let x = this.__class__;
                return [x];
            }
        "#;
        assert!(matches!(
            validate(src),
            Err(WorkerError::SecurityAttribute(_))
        ));
    }

    #[test]
    fn rejects_missing_entry_point() {
        let src = "fn not_strategy() { return []; }";
        assert!(matches!(validate(src), Err(WorkerError::NoStrategyFunction)));
    }

    #[test]
    fn rejects_entry_point_with_parameters() {
        let src = "fn strategy(x) { return [x]; }";
        assert!(matches!(
            validate(src),
            Err(WorkerError::StrategyCompliance(_))
        ));
    }

    #[test]
    fn rejects_reserved_name_reuse() {
        let src = r#"
            fn get_bar_data() { return (); }
            fn strategy() { return []; }
        "#;
        assert!(matches!(
            validate(src),
            Err(WorkerError::StrategyCompliance(_))
        ));
    }

    #[test]
    fn rejects_bare_return_with_no_value() {
        let src = r#"
            fn strategy() {
                return;
            }
        "#;
        assert!(matches!(
            validate(src),
            Err(WorkerError::StrategyCompliance(_))
        ));
    }

    #[test]
    fn derives_widest_and_narrowest_timeframe() {
        let src = r#"
            fn strategy() {
                let a = get_bar_data("5m", (), 3, #{});
                let b = get_bar_data("1w", (), 10, #{});
                return [];
            }
        "#;
        let meta = validate(src).unwrap();
        assert_eq!(meta.min_timeframe, "5m");
        assert_eq!(meta.max_timeframe_min_bars, ("1w".to_string(), 10));
    }

    #[test]
    fn alert_universe_is_none_when_any_call_has_no_ticker_filter() {
        let src = r#"
            fn strategy() {
                let a = get_bar_data("1d", (), 1, #{ tickers: ["AAPL"] });
                let b = get_bar_data("1d", (), 1, #{});
                return [];
            }
        "#;
        let meta = validate(src).unwrap();
        assert!(meta.alert_universe_full.is_none());
    }

    #[test]
    fn alert_universe_is_union_when_all_calls_scope_tickers() {
        let src = r#"
            fn strategy() {
                let a = get_bar_data("1d", (), 1, #{ tickers: ["AAPL"] });
                let b = get_bar_data("1h", (), 1, #{ tickers: ["MSFT", "AAPL"] });
                return [];
            }
        "#;
        let meta = validate(src).unwrap();
        assert_eq!(
            meta.alert_universe_full,
            Some(vec!["AAPL".to_string(), "MSFT".to_string()])
        );
    }
}
