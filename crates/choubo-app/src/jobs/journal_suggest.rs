//! Light pipeline stage: propose journal entries for an extracted document.
//!
//! The model receives the structured extraction, the invoice-check verdict,
//! the tenant's chart of accounts, and recent human corrections for the same
//! vendor as few-shot context. Candidates must balance before a draft is
//! persisted; account codes are only hard-checked at confirmation. The draft
//! status depends on the tenant's confidence thresholds.

use std::fmt::Write as _;

use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::jobs::JobError;
use crate::model::{
    Account, CandidateLine, DraftStatus, ExtractionRecord, FeedbackEvent, InvoiceCheck,
    JournalCandidate, JournalDraft, clamp_confidence, line_totals, lines_balance, now_ms,
};
use crate::queue::QueueJob;
use crate::services::llm_client::{LlmClient, extract_json_object};
use crate::services::metrics::{
    JOURNAL_SUGGEST_CONFIDENCE, JOURNAL_SUGGEST_FAILURE, JOURNAL_SUGGEST_LATENCY_MS,
    JOURNAL_SUGGEST_SUCCESS,
};

const MAX_CANDIDATES: usize = 3;
const VENDOR_FEEDBACK_SHOTS: usize = 10;
const TENANT_FEEDBACK_SHOTS: usize = 5;
const MAX_PROMPT_CHARS: usize = 8_000;
const LOW_CONFIDENCE_PREFIX: &str = "[低信頼度]";

const SUGGEST_SYSTEM_PROMPT: &str = "あなたは日本の会計基準に精通した経理アシスタントです。\
書類の内容と勘定科目表をもとに、複式簿記の仕訳案を最大3件提案してください。\
各仕訳は貸借が一致していなければなりません。\
必ず次の形式のJSONのみを返してください: \
{\"candidates\": [{\"lines\": [{\"account_code\": \"...\", \"account_name\": \"...\", \
\"debit\": 0, \"credit\": 0, \"tax_code\": \"TAX10\", \"memo\": \"\"}], \
\"description\": \"...\", \"reasoning\": \"...\", \"confidence\": 0.0}], \
\"overall_confidence\": 0.0}";

pub async fn run(ctx: &AppContext, job: &QueueJob) -> Result<(), JobError> {
    let tenant_id = &job.tenant_id;
    let document_id = &job.document_id;
    let started_ms = now_ms();

    // Re-delivery guard: one live draft per document.
    if let Some(existing) = ctx.store.latest_draft_for_document(tenant_id, document_id)? {
        if existing.status != DraftStatus::Error {
            info!(document_id, draft_id = %existing.id, "suggestion skipped: draft already exists");
            return Ok(());
        }
    }

    match suggest(ctx, tenant_id, document_id).await {
        Ok(draft) => {
            ctx.metrics.emit(
                JOURNAL_SUGGEST_LATENCY_MS,
                (now_ms() - started_ms) as f64,
                json!({"tenant_id": tenant_id, "document_id": document_id}),
            );
            ctx.metrics.emit(
                JOURNAL_SUGGEST_SUCCESS,
                1.0,
                json!({"tenant_id": tenant_id, "document_id": document_id}),
            );
            if let Some(confidence) = draft.confidence {
                ctx.metrics.emit(
                    JOURNAL_SUGGEST_CONFIDENCE,
                    confidence,
                    json!({"tenant_id": tenant_id, "document_id": document_id}),
                );
            }
            Ok(())
        }
        Err(err) => {
            ctx.metrics.emit(
                JOURNAL_SUGGEST_FAILURE,
                1.0,
                json!({
                    "tenant_id": tenant_id,
                    "document_id": document_id,
                    "error": err.to_string(),
                }),
            );
            // Leave an error draft so the failure is visible next to the
            // document; a later attempt replaces it.
            let now = now_ms();
            let error_draft = JournalDraft {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant_id.to_string(),
                document_id: document_id.to_string(),
                status: DraftStatus::Error,
                candidates: Vec::new(),
                confidence: None,
                ai_reason: Some(err.to_string()),
                model_version: ctx.llm.model_name(),
                selected_index: None,
                confirmed_by: None,
                confirmed_at_ms: None,
                created_at_ms: now,
                updated_at_ms: now,
            };
            if let Err(store_err) = ctx.store.put_draft(&error_draft) {
                warn!(error = %store_err, document_id, "failed to record error draft");
            }
            Err(err)
        }
    }
}

async fn suggest(
    ctx: &AppContext,
    tenant_id: &str,
    document_id: &str,
) -> Result<JournalDraft, JobError> {
    let extraction = ctx
        .store
        .latest_extraction(tenant_id, document_id)?
        .ok_or_else(|| JobError::MissingExtraction(document_id.to_string()))?;

    let accounts = ctx.store.list_active_accounts(tenant_id)?;
    if accounts.is_empty() {
        return Err(JobError::Invalid(format!(
            "tenant `{tenant_id}` has no active accounts to suggest against"
        )));
    }

    // Prefer corrections for the same vendor; fall back to recent
    // tenant-wide ones when the vendor is new or unknown.
    let mut feedback = match extraction.payload.structured.vendor_name.as_deref() {
        Some(vendor) => {
            ctx.store
                .recent_feedback_for_vendor(tenant_id, vendor, VENDOR_FEEDBACK_SHOTS)?
        }
        None => Vec::new(),
    };
    if feedback.is_empty() {
        feedback = ctx.store.recent_feedback(tenant_id, TENANT_FEEDBACK_SHOTS)?;
    }

    let check = ctx.store.latest_invoice_check(tenant_id, document_id)?;
    let prompt = build_user_prompt(&extraction, check.as_ref(), &accounts, &feedback);
    let response = ctx.llm.complete(SUGGEST_SYSTEM_PROMPT, &prompt).await?;
    let (candidates, overall_confidence) = parse_candidates(&response, &accounts)?;

    let settings = ctx.store.tenant_settings(tenant_id)?;
    let (status, ai_reason) = classify_draft(
        overall_confidence,
        settings.auto_confirm_high,
        settings.auto_confirm_mid,
        candidates[0].reasoning.clone(),
    );

    let now = now_ms();
    let draft = JournalDraft {
        id: Uuid::new_v4().to_string(),
        tenant_id: tenant_id.to_string(),
        document_id: document_id.to_string(),
        status,
        candidates,
        confidence: Some(overall_confidence),
        ai_reason: Some(ai_reason),
        model_version: ctx.llm.model_name(),
        selected_index: None,
        confirmed_by: None,
        confirmed_at_ms: None,
        created_at_ms: now,
        updated_at_ms: now,
    };
    ctx.store.put_draft(&draft)?;
    info!(
        document_id,
        draft_id = %draft.id,
        status = draft.status.as_ref(),
        confidence = overall_confidence,
        "journal draft stored"
    );
    Ok(draft)
}

fn build_user_prompt(
    extraction: &ExtractionRecord,
    check: Option<&InvoiceCheck>,
    accounts: &[Account],
    feedback: &[FeedbackEvent],
) -> String {
    let structured = &extraction.payload.structured;
    let mut prompt = String::new();

    let _ = writeln!(prompt, "## 書類情報");
    let _ = writeln!(
        prompt,
        "種別: {}",
        extraction.payload.classification.document_type
    );
    if let Some(vendor) = &structured.vendor_name {
        let _ = writeln!(prompt, "取引先: {vendor}");
    }
    if let Some(date) = &structured.document_date {
        let _ = writeln!(prompt, "日付: {date}");
    }
    if let Some(total) = structured.total_amount {
        let _ = writeln!(prompt, "合計金額: {total}");
    }
    if let Some(tax) = structured.tax_amount {
        let _ = writeln!(prompt, "消費税額: {tax}");
    }
    for item in &structured.line_items {
        let _ = writeln!(prompt, "明細: {} {}", item.description, item.amount);
    }

    if let Some(check) = check {
        let _ = writeln!(prompt, "\n## インボイスチェック結果: {}", check.status.as_ref());
        for reason in &check.reasons {
            let _ = writeln!(prompt, "- {}", reason.message);
        }
    }

    let _ = writeln!(prompt, "\n## 勘定科目表");
    for account in accounts {
        let _ = writeln!(
            prompt,
            "{} {} ({})",
            account.code, account.name, account.category
        );
    }

    if !feedback.is_empty() {
        let _ = writeln!(prompt, "\n## この取引先の過去の仕訳(人間による確定済み)");
        for event in feedback {
            for line in &event.user_correction.final_lines {
                let _ = writeln!(
                    prompt,
                    "{} {} 借方{} 貸方{}",
                    line.account_code, line.account_name, line.debit, line.credit
                );
            }
            let _ = writeln!(prompt, "摘要: {}", event.user_correction.final_description);
        }
    }

    if let Some((idx, _)) = prompt.char_indices().nth(MAX_PROMPT_CHARS) {
        prompt.truncate(idx);
    }
    prompt
}

#[derive(Debug, Deserialize)]
struct SuggestionResponse {
    #[serde(default)]
    candidates: Vec<JournalCandidate>,
    #[serde(default)]
    overall_confidence: Option<f64>,
}

/// Parse the model's candidates and validate each one. An unbalanced
/// candidate fails the whole attempt; unknown account codes are only
/// warned about here, the hard check happens at confirmation.
fn parse_candidates(
    response: &str,
    accounts: &[Account],
) -> Result<(Vec<JournalCandidate>, f64), JobError> {
    let object = extract_json_object(response).ok_or_else(|| {
        JobError::Invalid("journal suggestion response contained no JSON object".to_string())
    })?;
    let parsed: SuggestionResponse = serde_json::from_str(object).map_err(|err| {
        JobError::Invalid(format!("journal suggestion response was not valid JSON: {err}"))
    })?;
    if parsed.candidates.is_empty() {
        return Err(JobError::Invalid(
            "journal suggestion returned no candidates".to_string(),
        ));
    }

    let mut candidates: Vec<JournalCandidate> =
        parsed.candidates.into_iter().take(MAX_CANDIDATES).collect();
    for (index, candidate) in candidates.iter_mut().enumerate() {
        let (total_debit, total_credit) = line_totals(&candidate.lines);
        if !lines_balance(&candidate.lines) {
            return Err(JobError::Invalid(format!(
                "candidate {index}: debit({total_debit}) != credit({total_credit})"
            )));
        }
        for line in &candidate.lines {
            if !accounts.iter().any(|a| a.code == line.account_code) {
                warn!(
                    candidate = index,
                    account_code = %line.account_code,
                    "candidate references an unknown account code"
                );
            }
        }
        candidate.confidence = clamp_confidence(candidate.confidence);
    }

    let overall = clamp_confidence(
        parsed
            .overall_confidence
            .unwrap_or(candidates[0].confidence),
    );
    Ok((candidates, overall))
}

/// Map overall confidence to a draft status using the tenant thresholds.
fn classify_draft(
    confidence: f64,
    high: f64,
    mid: f64,
    reasoning: String,
) -> (DraftStatus, String) {
    if confidence >= high {
        (DraftStatus::Suggested, reasoning)
    } else if confidence >= mid {
        (DraftStatus::NeedsReview, reasoning)
    } else {
        (
            DraftStatus::NeedsReview,
            format!("{LOW_CONFIDENCE_PREFIX} {reasoning}"),
        )
    }
}

/// Vendor carried on the extraction, used when recording confirmation
/// feedback.
pub fn extraction_vendor(
    store: &crate::store::LedgerStore,
    tenant_id: &str,
    document_id: &str,
) -> Option<String> {
    store
        .latest_extraction(tenant_id, document_id)
        .ok()
        .flatten()
        .and_then(|record| record.payload.structured.vendor_name)
}
