//! Document type classification: cheap rules first, one model call as the
//! fallback. Classification never fails the surrounding parse job; every
//! path degrades to `other` with zero confidence.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::services::llm_client::{LlmClient, extract_json_object};
use crate::services::structuring::StructuredExtraction;

const RECEIPT_KEYWORDS: [&str; 4] = ["領収書", "領収証", "RECEIPT", "レシート"];
const KEYWORD_SCAN_CHARS: usize = 500;
const RAW_TEXT_EXCERPT_CHARS: usize = 4_000;
const INVOICE_MODEL_THRESHOLD: f64 = 0.8;
const RECEIPT_KEYWORD_THRESHOLD: f64 = 0.6;

const DOCUMENT_TYPES: [&str; 5] = ["invoice", "receipt", "quotation", "contract", "other"];

const CLASSIFY_SYSTEM_PROMPT: &str = "あなたは会計書類の分類を行うアシスタントです。\
書類のテキストを読み、種別を判定してください。\
必ず次のJSONのみを返してください: \
{\"document_type\": \"invoice|receipt|quotation|contract|other\", \
\"confidence\": 0.0〜1.0, \"reasoning\": \"判定理由\"}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub document_type: String,
    pub confidence: f64,
    /// `"rule"` when a heuristic decided, `"llm"` when the model did.
    pub method: String,
    /// Which heuristic fired, the model's own explanation, or the failure
    /// that forced the degraded verdict.
    #[serde(default)]
    pub reasoning: String,
}

impl ClassificationResult {
    fn rule(document_type: &str, confidence: f64, reasoning: String) -> Self {
        Self {
            document_type: document_type.to_string(),
            confidence,
            method: "rule".to_string(),
            reasoning,
        }
    }

    fn llm(document_type: &str, confidence: f64, reasoning: String) -> Self {
        Self {
            document_type: document_type.to_string(),
            confidence,
            method: "llm".to_string(),
            reasoning,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LlmVerdict {
    #[serde(default)]
    document_type: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

fn has_receipt_keyword(text: &str) -> bool {
    let head: String = text.chars().take(KEYWORD_SCAN_CHARS).collect();
    let upper = head.to_uppercase();
    RECEIPT_KEYWORDS.iter().any(|kw| upper.contains(kw))
}

fn coerce_document_type(candidate: &str) -> &str {
    let lowered = candidate.trim().to_lowercase();
    DOCUMENT_TYPES
        .iter()
        .copied()
        .find(|t| *t == lowered)
        .unwrap_or("other")
}

fn llm_user_message(structured: &StructuredExtraction, file_name: &str) -> String {
    let mut message = format!("ファイル名: {file_name}\n");
    if let Some(vendor) = &structured.vendor_name {
        message.push_str(&format!("取引先: {vendor}\n"));
    }
    if let Some(date) = &structured.document_date {
        message.push_str(&format!("日付: {date}\n"));
    }
    if let Some(total) = structured.total_amount {
        message.push_str(&format!("合計金額: {total}\n"));
    }
    message.push_str("\n本文:\n");
    message.extend(structured.raw_text.chars().take(RAW_TEXT_EXCERPT_CHARS));
    message
}

async fn classify_with_llm(
    llm: &Arc<dyn LlmClient>,
    structured: &StructuredExtraction,
    file_name: &str,
) -> Result<ClassificationResult, String> {
    let message = llm_user_message(structured, file_name);
    let response = llm
        .complete(CLASSIFY_SYSTEM_PROMPT, &message)
        .await
        .map_err(|err| format!("llm call failed: {err}"))?;

    let object = extract_json_object(&response)
        .ok_or_else(|| "llm response contained no JSON object".to_string())?;
    let verdict: LlmVerdict = serde_json::from_str(object)
        .map_err(|err| format!("llm response was not valid JSON: {err}"))?;
    Ok(ClassificationResult::llm(
        coerce_document_type(&verdict.document_type),
        verdict.confidence.clamp(0.0, 1.0),
        verdict.reasoning,
    ))
}

/// Classify one document. `model_id` is the analysis model that produced the
/// extraction; `file_name` is the original upload name.
pub async fn classify(
    llm: &Arc<dyn LlmClient>,
    structured: &StructuredExtraction,
    model_id: &str,
    file_name: &str,
) -> ClassificationResult {
    if model_id == "prebuilt-invoice" && structured.confidence >= INVOICE_MODEL_THRESHOLD {
        return ClassificationResult::rule(
            "invoice",
            structured.confidence,
            format!(
                "invoice model confidence {} >= {INVOICE_MODEL_THRESHOLD}",
                structured.confidence
            ),
        );
    }

    let lowered_name = file_name.to_lowercase();
    if lowered_name.ends_with(".csv") || lowered_name.ends_with(".xlsx") {
        return ClassificationResult::rule(
            "other",
            0.5,
            "spreadsheet file extension, not an OCR document".to_string(),
        );
    }

    if structured.confidence >= RECEIPT_KEYWORD_THRESHOLD
        && has_receipt_keyword(&structured.raw_text)
    {
        return ClassificationResult::rule(
            "receipt",
            (structured.confidence + 0.1).min(1.0),
            format!("receipt keyword in first {KEYWORD_SCAN_CHARS} chars of raw text"),
        );
    }

    // One model call, no retries. Any failure degrades rather than erroring.
    classify_with_llm(llm, structured, file_name)
        .await
        .unwrap_or_else(|cause| {
            warn!(%cause, "llm classification degraded to other");
            ClassificationResult::llm("other", 0.0, cause)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm_client::LlmError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedLlm {
        responses: Mutex<Vec<Result<String, LlmError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Result<String, LlmError>>) -> Arc<dyn LlmClient> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _system: &str, user: &str) -> Result<String, LlmError> {
            self.calls.lock().expect("lock").push(user.to_string());
            self.responses
                .lock()
                .expect("lock")
                .pop()
                .unwrap_or(Err(LlmError::EmptyResponse))
        }

        fn model_name(&self) -> String {
            "scripted".to_string()
        }
    }

    fn extraction(raw_text: &str, confidence: f64) -> StructuredExtraction {
        StructuredExtraction {
            raw_text: raw_text.to_string(),
            confidence,
            ..StructuredExtraction::default()
        }
    }

    #[tokio::test]
    async fn confident_invoice_model_wins_without_llm() {
        let llm = ScriptedLlm::new(vec![]);
        let result = classify(
            &llm,
            &extraction("請求書", 0.95),
            "prebuilt-invoice",
            "invoice.pdf",
        )
        .await;
        assert_eq!(result.document_type, "invoice");
        assert_eq!(result.method, "rule");
        assert_eq!(result.confidence, 0.95);
    }

    #[tokio::test]
    async fn spreadsheet_extensions_classify_as_other() {
        let llm = ScriptedLlm::new(vec![]);
        let result = classify(&llm, &extraction("", 0.9), "prebuilt-read", "売上.XLSX").await;
        assert_eq!(result.document_type, "other");
        assert_eq!(result.confidence, 0.5);
        assert_eq!(result.method, "rule");
    }

    #[tokio::test]
    async fn receipt_keyword_in_head_boosts_confidence() {
        let llm = ScriptedLlm::new(vec![]);
        let result = classify(
            &llm,
            &extraction("領収書 合計 ¥1,100", 0.7),
            "prebuilt-read",
            "scan.pdf",
        )
        .await;
        assert_eq!(result.document_type, "receipt");
        assert_eq!(result.method, "rule");
        assert!((result.confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn keyword_past_scan_window_is_ignored() {
        let mut text = "あ".repeat(KEYWORD_SCAN_CHARS);
        text.push_str("領収書");
        let llm = ScriptedLlm::new(vec![Ok(
            "{\"document_type\": \"contract\", \"confidence\": 0.7}".to_string(),
        )]);
        let result = classify(&llm, &extraction(&text, 0.9), "prebuilt-read", "doc.pdf").await;
        assert_eq!(result.document_type, "contract");
        assert_eq!(result.method, "llm");
    }

    #[tokio::test]
    async fn llm_verdict_outside_closed_set_coerces_to_other() {
        let llm = ScriptedLlm::new(vec![Ok(
            "{\"document_type\": \"tax_return\", \"confidence\": 0.88}".to_string(),
        )]);
        let result = classify(&llm, &extraction("何かの書類", 0.4), "prebuilt-read", "doc.pdf")
            .await;
        assert_eq!(result.document_type, "other");
        assert_eq!(result.method, "llm");
        assert!((result.confidence - 0.88).abs() < 1e-9);
    }

    #[test]
    fn llm_message_carries_filename_and_summary() {
        let structured = StructuredExtraction {
            vendor_name: Some("A商事株式会社".to_string()),
            total_amount: Some(11_000.0),
            raw_text: "お見積りの内容は以下の通りです".to_string(),
            ..StructuredExtraction::default()
        };
        let message = llm_user_message(&structured, "見積書_2025.pdf");
        assert!(message.contains("見積書_2025.pdf"));
        assert!(message.contains("A商事株式会社"));
        assert!(message.contains("11000"));
        assert!(message.contains("お見積りの内容"));
    }

    #[tokio::test]
    async fn llm_failure_degrades_instead_of_erroring() {
        let llm = ScriptedLlm::new(vec![Err(LlmError::EmptyResponse)]);
        let result =
            classify(&llm, &extraction("不明な書類", 0.3), "prebuilt-read", "doc.pdf").await;
        assert_eq!(result.document_type, "other");
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.method, "llm");
        assert!(result.reasoning.contains("llm call failed"));
    }

    #[tokio::test]
    async fn rule_verdicts_carry_their_reasoning() {
        let llm = ScriptedLlm::new(vec![]);
        let result = classify(
            &llm,
            &extraction("請求書", 0.95),
            "prebuilt-invoice",
            "invoice.pdf",
        )
        .await;
        assert!(result.reasoning.contains("invoice model confidence"));
    }
}
