//! Plot capture facade for optional visualization output.
//!
//! No crate in this stack rasterizes a chart to PNG, and rendering is
//! an optional step here, so a strategy's plotting calls are
//! captured as a structural record — series of named x/y pairs — rather
//! than an image. A caller that wants a picture can render this JSON
//! client-side.

use std::sync::{Arc, Mutex};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PlotSeries {
    pub name: String,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PlotRecord {
    pub series: Vec<PlotSeries>,
}

/// Shared sink a sandboxed run's host-registered `plot(...)` function
/// writes into; handed to the caller once the run completes.
#[derive(Clone, Default)]
pub struct PlotCapture(Arc<Mutex<PlotRecord>>);

impl PlotCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, name: String, x: Vec<f64>, y: Vec<f64>) {
        let mut guard = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.series.push(PlotSeries { name, x, y });
    }

    pub fn into_record(self) -> PlotRecord {
        Arc::try_unwrap(self.0)
            .map(|m| m.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner))
            .unwrap_or_default()
    }
}

/// Shared sink a sandboxed run's host-registered `print`/`debug` write
/// into, standing in for redirecting process stdout to a
/// per-execution string buffer.
#[derive(Clone, Default)]
pub struct PrintCapture(Arc<Mutex<String>>);

impl PrintCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&self, line: &str) {
        let mut guard = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.push_str(line);
        guard.push('\n');
    }

    pub fn into_buffer(self) -> String {
        Arc::try_unwrap(self.0)
            .map(|m| m.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_capture_joins_lines_in_order() {
        let capture = PrintCapture::new();
        capture.push_line("hello");
        capture.push_line("world");
        assert_eq!(capture.into_buffer(), "hello\nworld\n");
    }

    #[test]
    fn captures_series_in_call_order() {
        let capture = PlotCapture::new();
        capture.push("equity".to_string(), vec![0.0, 1.0], vec![100.0, 101.0]);
        capture.push("drawdown".to_string(), vec![0.0, 1.0], vec![0.0, -0.5]);

        let record = capture.into_record();
        assert_eq!(record.series.len(), 2);
        assert_eq!(record.series[0].name, "equity");
        assert_eq!(record.series[1].name, "drawdown");
    }
}
