//! Extracts `get_bar_data(...)` call-site fingerprints from strategy
//! source via a raw-text scan.
//!
//! Walking rhai's AST would tell us the shape of a call; it would not
//! tell us, cheaply and robustly across rhai versions, which argument
//! position holds a ticker-list literal. A text pass over the
//! comment-stripped source, keyed on balanced parens, is more direct.

use crate::strategy::{FilterAnalysis, GetBarDataCall};

/// Blank out `//` and `/* */` comments without removing characters, so
/// line numbers in the stripped text still match the original source.
fn strip_comments(src: &str) -> String {
    let bytes = src.as_bytes();
    let mut out: Vec<u8> = bytes.to_vec();
    let mut i = 0;
    let mut in_string = false;
    while i < bytes.len() {
        match bytes[i] {
            b'"' if !in_string => {
                in_string = true;
                i += 1;
            }
            b'"' if in_string => {
                in_string = false;
                i += 1;
            }
            b'\\' if in_string => {
                i += 2;
            }
            b'/' if !in_string && i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    out[i] = b' ';
                    i += 1;
                }
            }
            b'/' if !in_string && i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                out[i] = b' ';
                out[i + 1] = b' ';
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    if out[i] != b'\n' {
                        out[i] = b' ';
                    }
                    i += 1;
                }
                if i + 1 < bytes.len() {
                    out[i] = b' ';
                    out[i + 1] = b' ';
                    i += 2;
                }
            }
            _ => i += 1,
        }
    }
    String::from_utf8(out).unwrap_or_default()
}

fn line_of(src: &str, byte_offset: usize) -> usize {
    src[..byte_offset.min(src.len())].matches('\n').count() + 1
}

/// Find the argument-list text of the first `name(` occurrence at or
/// after `from`, returning `(args_text, start_offset_of_name)`.
fn next_call(src: &str, name: &str, from: usize) -> Option<(String, usize)> {
    let needle_pos = src[from..].find(name)?;
    let call_start = from + needle_pos;
    let after_name = call_start + name.len();
    let rest = &src[after_name..];
    let open = rest.find('(')?;
    // Reject identifiers that merely contain `name` as a substring
    // (e.g. `my_get_bar_data`) by requiring a non-identifier boundary.
    if call_start > 0 {
        let prev = src.as_bytes()[call_start - 1];
        if prev.is_ascii_alphanumeric() || prev == b'_' {
            return next_call(src, name, after_name);
        }
    }
    if rest[..open].trim() != "" {
        // whitespace only allowed between name and '('
        return next_call(src, name, after_name);
    }

    let mut depth = 0i32;
    let mut end = None;
    for (i, ch) in rest.char_indices().skip(open) {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end?;
    Some((rest[open + 1..end].to_string(), call_start))
}

/// Split a top-level-comma-separated argument list, respecting nested
/// `()`, `[]`, and `#{ }` map literals.
fn split_args(args: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut cur = String::new();
    let mut in_string = false;
    for ch in args.chars() {
        match ch {
            '"' => {
                in_string = !in_string;
                cur.push(ch);
            }
            '(' | '[' | '{' if !in_string => {
                depth += 1;
                cur.push(ch);
            }
            ')' | ']' | '}' if !in_string => {
                depth -= 1;
                cur.push(ch);
            }
            ',' if depth == 0 && !in_string => {
                parts.push(cur.trim().to_string());
                cur.clear();
            }
            _ => cur.push(ch),
        }
    }
    if !cur.trim().is_empty() {
        parts.push(cur.trim().to_string());
    }
    parts
}

fn string_literal(arg: &str) -> Option<String> {
    let t = arg.trim();
    if t.len() >= 2 && t.starts_with('"') && t.ends_with('"') {
        Some(t[1..t.len() - 1].to_string())
    } else {
        None
    }
}

fn int_literal(arg: &str) -> Option<i64> {
    arg.trim().parse().ok()
}

/// Pull a `tickers: [...]` entry out of a `#{ ... }` filter map literal.
fn extract_tickers(filters_arg: &str) -> FilterAnalysis {
    let t = filters_arg.trim();
    let Some(braces_start) = t.find('{') else {
        return FilterAnalysis::default();
    };
    let body = &t[braces_start + 1..t.rfind('}').unwrap_or(t.len())];

    for entry in split_args(body) {
        let Some((key, value)) = entry.split_once(':') else {
            continue;
        };
        let key = key.trim().trim_matches('"');
        if key != "tickers" && key != "ticker" {
            continue;
        }
        let value = value.trim();
        if let Some(inner) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
            let tickers: Vec<String> = split_args(inner)
                .iter()
                .filter_map(|a| string_literal(a))
                .map(|s| s.to_uppercase())
                .collect();
            return FilterAnalysis {
                has_tickers: true,
                specific_tickers: tickers,
            };
        }
        if let Some(single) = string_literal(value) {
            return FilterAnalysis {
                has_tickers: true,
                specific_tickers: vec![single.to_uppercase()],
            };
        }
    }
    FilterAnalysis::default()
}

/// Scan `source` for every `get_bar_data(...)` call site, positional
/// arguments `(timeframe, columns, min_bars, filters, aggregate_mode,
/// extended_hours, start_date, end_date)`.
pub fn extract_calls(source: &str) -> Vec<GetBarDataCall> {
    let stripped = strip_comments(source);
    let mut calls = Vec::new();
    let mut from = 0usize;

    while let Some((args_text, call_start)) = next_call(&stripped, "get_bar_data", from) {
        let args = split_args(&args_text);

        let timeframe = args
            .first()
            .and_then(|a| string_literal(a))
            .unwrap_or_else(|| "1d".to_string());
        let min_bars = args.get(2).and_then(|a| int_literal(a)).unwrap_or(1);
        let filter_analysis = args
            .get(3)
            .map(|a| extract_tickers(a))
            .unwrap_or_default();

        calls.push(GetBarDataCall {
            line_number: line_of(&stripped, call_start),
            timeframe,
            min_bars,
            filter_analysis,
        });

        from = call_start + "get_bar_data".len();
    }

    calls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_timeframe_and_min_bars() {
        let src = r#"
            fn strategy() {
                let bars = get_bar_data("5m", (), 20, #{});
                return [];
            }
        "#;
        let calls = extract_calls(src);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].timeframe, "5m");
        assert_eq!(calls[0].min_bars, 20);
        assert!(!calls[0].filter_analysis.has_tickers);
    }

    #[test]
    fn extracts_explicit_ticker_filter() {
        let src = r#"get_bar_data("1d", (), 1, #{ tickers: ["aapl", "msft"] });"#;
        let calls = extract_calls(src);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].filter_analysis.has_tickers);
        assert_eq!(
            calls[0].filter_analysis.specific_tickers,
            vec!["AAPL".to_string(), "MSFT".to_string()]
        );
    }

    #[test]
    fn ignores_calls_inside_comments_and_strings() {
        let src = r#"
            // get_bar_data("1d", (), 1, #{});
            fn strategy() {
                let note = "call get_bar_data in docs";
                return [];
            }
        "#;
        assert!(extract_calls(src).is_empty());
    }

    #[test]
    fn does_not_match_similarly_named_functions() {
        let src = r#"my_get_bar_data("1d", (), 1, #{});"#;
        assert!(extract_calls(src).is_empty());
    }

    #[test]
    fn finds_multiple_call_sites_with_correct_line_numbers() {
        let src = "fn strategy() {\n    let a = get_bar_data(\"1d\", (), 1, #{});\n    let b = get_bar_data(\"1h\", (), 5, #{});\n    return [];\n}\n";
        let calls = extract_calls(src);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].line_number, 2);
        assert_eq!(calls[1].line_number, 3);
    }

    #[test]
    fn defaults_min_bars_to_one_when_omitted() {
        let src = r#"get_bar_data("1d");"#;
        let calls = extract_calls(src);
        assert_eq!(calls[0].min_bars, 1);
    }
}
