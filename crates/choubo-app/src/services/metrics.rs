//! Structured metric emission: one JSON line per event on the process's
//! standard log stream. No acknowledgment, no backpressure.

use std::io::Write;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

/// OCR-job latency above which the `slo_breach` label is set (p95 target).
pub const OCR_JOB_LATENCY_P95_MS: i64 = 120_000;

pub const OCR_JOB_LATENCY_MS: &str = "ocr_job_latency_ms";
pub const OCR_JOB_SUCCESS: &str = "ocr_job_success";
pub const OCR_JOB_FAILURE: &str = "ocr_job_failure";
pub const OCR_RETRY_COUNT: &str = "ocr_retry_count";
pub const CLASSIFICATION_METHOD: &str = "classification_method";
pub const DUPLICATE_CHECK_COUNT: &str = "duplicate_check_count";
pub const INVOICE_VALIDATE_SUCCESS: &str = "invoice_validate_success";
pub const JOURNAL_SUGGEST_SUCCESS: &str = "journal_suggest_success";
pub const JOURNAL_SUGGEST_FAILURE: &str = "journal_suggest_failure";
pub const JOURNAL_SUGGEST_LATENCY_MS: &str = "journal_suggest_latency_ms";
pub const JOURNAL_SUGGEST_CONFIDENCE: &str = "journal_suggest_confidence";
pub const JOURNAL_CONFIRM_COUNT: &str = "journal_confirm_count";
pub const JOURNAL_OVERRIDE_COUNT: &str = "journal_override_count";

#[derive(Debug, Serialize)]
struct MetricEvent<'a> {
    metric: &'a str,
    value: f64,
    labels: Value,
    timestamp: String,
}

/// Writes measurement events to stdout. Cheap to clone; carries no state.
#[derive(Debug, Clone, Default)]
pub struct MetricsEmitter;

impl MetricsEmitter {
    pub fn new() -> Self {
        Self
    }

    /// Emit a generic metric. Serialization failures are swallowed: the sink
    /// offers no acknowledgment and a lost metric must never fail a job.
    pub fn emit(&self, metric: &str, value: f64, labels: Value) {
        if let Some(line) = render_metric_line(metric, value, labels) {
            let stdout = std::io::stdout();
            let mut guard = stdout.lock();
            let _ = writeln!(guard, "{line}");
        }
    }

    /// Emit an OCR job latency metric with automatic SLO-breach detection.
    pub fn emit_latency(&self, latency_ms: i64, mut labels: Value) {
        if let Some(map) = labels.as_object_mut() {
            map.insert(
                "slo_breach".to_string(),
                Value::Bool(latency_ms > OCR_JOB_LATENCY_P95_MS),
            );
        }
        self.emit(OCR_JOB_LATENCY_MS, latency_ms as f64, labels);
    }
}

fn render_metric_line(metric: &str, value: f64, labels: Value) -> Option<String> {
    let event = MetricEvent {
        metric,
        value,
        labels,
        timestamp: Utc::now().to_rfc3339(),
    };
    serde_json::to_string(&event).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metric_line_is_single_json_object() {
        let line = render_metric_line(OCR_JOB_SUCCESS, 1.0, json!({"documentId": "d1"}))
            .expect("renders");
        let parsed: Value = serde_json::from_str(&line).expect("valid json");
        assert_eq!(parsed["metric"], OCR_JOB_SUCCESS);
        assert_eq!(parsed["value"], 1.0);
        assert_eq!(parsed["labels"]["documentId"], "d1");
        assert!(parsed["timestamp"].is_string());
        assert!(!line.contains('\n'));
    }

    #[test]
    fn latency_labels_carry_slo_breach_flag() {
        let mut labels = json!({"documentId": "d1"});
        let breach = OCR_JOB_LATENCY_P95_MS + 1;
        if let Some(map) = labels.as_object_mut() {
            map.insert("slo_breach".to_string(), Value::Bool(breach > OCR_JOB_LATENCY_P95_MS));
        }
        assert_eq!(labels["slo_breach"], true);
    }
}
