//! Core data model for the document-processing pipeline.
//!
//! Every record is tenant-scoped. Lifecycle columns (`status`) are the sole
//! concurrency-control mechanism: transitions are conditional updates scoped
//! by the expected prior status, so a writer racing against stale state is a
//! no-op instead of a corruption.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::services::classifier::ClassificationResult;
use crate::services::duplicate_check::DuplicateSuspect;
use crate::services::structuring::StructuredExtraction;

/// Lifecycle state of an uploaded document.
///
/// `uploaded → queued → processing → extracted | error`; `verified` is set by
/// the (out-of-scope) human verification flow and participates only in
/// duplicate matching.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Queued,
    Processing,
    Extracted,
    Verified,
    Error,
}

/// One uploaded file. Created on upload; mutated only by the parse job
/// (status and OCR summary fields) and explicit retry/enqueue actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub tenant_id: String,
    pub file_name: String,
    pub storage_bucket: String,
    pub file_key: String,
    pub content_hash: String,
    pub mime_type: String,
    pub status: DocumentStatus,
    pub document_type: Option<String>,
    pub document_date: Option<NaiveDate>,
    pub amount: Option<f64>,
    pub tax_amount: Option<f64>,
    pub registration_number: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Document {
    pub fn new_uploaded(
        tenant_id: &str,
        file_name: &str,
        storage_bucket: &str,
        file_key: &str,
        content_hash: &str,
        mime_type: &str,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            file_name: file_name.to_string(),
            storage_bucket: storage_bucket.to_string(),
            file_key: file_key.to_string(),
            content_hash: content_hash.to_string(),
            mime_type: mime_type.to_string(),
            status: DocumentStatus::Uploaded,
            document_type: None,
            document_date: None,
            amount: None,
            tax_amount: None,
            registration_number: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }
}

/// Milliseconds since the Unix epoch; monotonic enough for record ordering.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// OCR summary fields copied onto the document once extraction succeeds.
#[derive(Debug, Clone, Default)]
pub struct DocumentSummary {
    pub document_type: Option<String>,
    pub document_date: Option<NaiveDate>,
    pub amount: Option<f64>,
    pub tax_amount: Option<f64>,
    pub registration_number: Option<String>,
}

/// Full structured payload persisted per parse attempt. The structured record
/// is enriched with the classification verdict and, when found, the
/// duplicate-suspect list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionPayload {
    pub structured: StructuredExtraction,
    pub classification: ClassificationResult,
    #[serde(default)]
    pub duplicate_suspects: Vec<DuplicateSuspect>,
}

/// One structured-OCR snapshot per parse attempt. Append-only; readers always
/// take the most recent row by creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub id: String,
    pub tenant_id: String,
    pub document_id: String,
    pub payload: ExtractionPayload,
    pub model_provider: String,
    pub model_name: String,
    pub model_version: String,
    pub confidence: f64,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSeverity {
    Ng,
    NeedsReview,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    NeedsReview,
    Ng,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReason {
    pub field: String,
    pub severity: CheckSeverity,
    pub message: String,
}

/// One invoice-compliance verdict per validation run. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceCheck {
    pub id: String,
    pub tenant_id: String,
    pub document_id: String,
    pub status: CheckStatus,
    pub reasons: Vec<CheckReason>,
    pub created_at_ms: i64,
}

/// One debit/credit line of a proposed or confirmed journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateLine {
    pub account_code: String,
    pub account_name: String,
    #[serde(default)]
    pub debit: f64,
    #[serde(default)]
    pub credit: f64,
    #[serde(default)]
    pub tax_code: Option<String>,
    #[serde(default)]
    pub memo: String,
}

/// One of up to three alternative balanced line-sets proposed for a draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalCandidate {
    pub lines: Vec<CandidateLine>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Suggested,
    NeedsReview,
    Confirmed,
    Error,
}

/// The AI-proposed journal entry for a document, awaiting human action.
/// Transitions to `confirmed` at most once, enforced by a status-scoped
/// conditional update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalDraft {
    pub id: String,
    pub tenant_id: String,
    pub document_id: String,
    pub status: DraftStatus,
    pub candidates: Vec<JournalCandidate>,
    pub confidence: Option<f64>,
    pub ai_reason: Option<String>,
    pub model_version: String,
    pub selected_index: Option<usize>,
    pub confirmed_by: Option<String>,
    pub confirmed_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Confirmed, immutable ledger record. Lines live in their own table keyed by
/// entry id and line number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub tenant_id: String,
    pub entry_date: NaiveDate,
    pub description: String,
    pub source_document_id: String,
    pub journal_draft_id: String,
    pub total_amount: f64,
    pub tax_amount: f64,
    pub confirmed_by: String,
    pub confirmed_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalLine {
    pub tenant_id: String,
    pub journal_entry_id: String,
    pub line_no: u32,
    pub account_code: String,
    pub account_name: String,
    pub debit: f64,
    pub credit: f64,
    pub tax_code: Option<String>,
    pub memo: String,
}

/// Chart-of-accounts entry. Referenced, never mutated, by suggestion and
/// confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub tenant_id: String,
    pub code: String,
    pub name: String,
    pub category: String,
    pub is_active: bool,
}

pub const DEFAULT_AUTO_CONFIRM_HIGH: f64 = 0.90;
pub const DEFAULT_AUTO_CONFIRM_MID: f64 = 0.70;

/// Per-tenant confidence thresholds controlling draft status classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantSettings {
    pub tenant_id: String,
    pub auto_confirm_high: f64,
    pub auto_confirm_mid: f64,
}

impl TenantSettings {
    pub fn defaults_for(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            auto_confirm_high: DEFAULT_AUTO_CONFIRM_HIGH,
            auto_confirm_mid: DEFAULT_AUTO_CONFIRM_MID,
        }
    }
}

/// The human's final choice/edits paired against the AI proposal; consumed as
/// few-shot context by future suggestion runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCorrection {
    pub selected_index: usize,
    pub override_applied: bool,
    pub override_reason: Option<String>,
    pub final_lines: Vec<CandidateLine>,
    pub final_description: String,
    /// Vendor of the source document, captured so later suggestions can pull
    /// vendor-specific history.
    pub vendor_name: Option<String>,
}

/// Append-only record pairing an AI proposal with the human correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub id: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub entity_type: String,
    pub entity_id: String,
    pub ai_output: Vec<JournalCandidate>,
    pub user_correction: UserCorrection,
    pub created_at_ms: i64,
}

/// Balance check shared by suggestion validation and confirmation:
/// `|sum(debit) − sum(credit)| ≤ 0.01`.
pub fn line_totals(lines: &[CandidateLine]) -> (f64, f64) {
    let total_debit = lines.iter().map(|l| l.debit).sum();
    let total_credit = lines.iter().map(|l| l.credit).sum();
    (total_debit, total_credit)
}

pub const BALANCE_TOLERANCE: f64 = 0.01;

pub fn lines_balance(lines: &[CandidateLine]) -> bool {
    let (debit, credit) = line_totals(lines);
    (debit - credit).abs() <= BALANCE_TOLERANCE
}

/// Clamp a provider-reported confidence into [0, 1].
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}
