//! Synchronous actions invoked from the CLI (and, in front of it, whatever
//! transport a deployment puts there): document ingestion, queueing, retry,
//! and journal confirmation.

use chrono::NaiveDate;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::AppError;
use crate::jobs::journal_suggest::extraction_vendor;
use crate::model::{
    CandidateLine, Document, DocumentStatus, FeedbackEvent, JournalDraft, JournalEntry,
    JournalLine, UserCorrection, line_totals, lines_balance, now_ms,
};
use crate::queue::{JobKind, QueueJob};
use crate::services::metrics::{JOURNAL_CONFIRM_COUNT, JOURNAL_OVERRIDE_COUNT};

pub const DOCUMENTS_BUCKET: &str = "documents";

/// Store an uploaded file and register its document record. With
/// `auto_parse` the document is queued for parsing immediately.
pub async fn ingest_document(
    ctx: &AppContext,
    tenant_id: &str,
    file_name: &str,
    mime_type: &str,
    bytes: &[u8],
    auto_parse: bool,
) -> Result<Document, AppError> {
    if tenant_id.is_empty() {
        return Err(AppError::InvalidInput("tenant id must not be empty".to_string()));
    }
    if bytes.is_empty() {
        return Err(AppError::InvalidInput(format!(
            "uploaded file `{file_name}` is empty"
        )));
    }

    let content_hash = blake3::hash(bytes).to_hex().to_string();
    let file_key = format!("{tenant_id}/{}_{file_name}", Uuid::new_v4());
    ctx.blobs
        .upload(DOCUMENTS_BUCKET, &file_key, bytes)
        .await?;

    let document = Document::new_uploaded(
        tenant_id,
        file_name,
        DOCUMENTS_BUCKET,
        &file_key,
        &content_hash,
        mime_type,
    );
    ctx.store.put_document(&document)?;
    info!(document_id = %document.id, file_name, "document ingested");

    if auto_parse {
        enqueue_parse(ctx, tenant_id, &document.id)?;
        return Ok(ctx
            .store
            .get_document(tenant_id, &document.id)?
            .unwrap_or(document));
    }
    Ok(document)
}

/// Queue an uploaded document for parsing. Only `uploaded` documents are
/// eligible; anything else is a conflict.
pub fn enqueue_parse(ctx: &AppContext, tenant_id: &str, document_id: &str) -> Result<QueueJob, AppError> {
    transition_and_enqueue(ctx, tenant_id, document_id, DocumentStatus::Uploaded)
}

/// Re-queue a document that previously failed. Only `error` documents are
/// eligible: retrying a healthy document would double-process it.
pub fn retry_document(ctx: &AppContext, tenant_id: &str, document_id: &str) -> Result<QueueJob, AppError> {
    transition_and_enqueue(ctx, tenant_id, document_id, DocumentStatus::Error)
}

fn transition_and_enqueue(
    ctx: &AppContext,
    tenant_id: &str,
    document_id: &str,
    expected: DocumentStatus,
) -> Result<QueueJob, AppError> {
    let document = ctx
        .store
        .get_document(tenant_id, document_id)?
        .ok_or_else(|| AppError::NotFound {
            entity: "document",
            id: document_id.to_string(),
        })?;

    if ctx
        .store
        .transition_document(tenant_id, document_id, &[expected], DocumentStatus::Queued)?
        .is_none()
    {
        return Err(AppError::Conflict(format!(
            "document `{document_id}` is `{}`, expected `{}`",
            document.status.as_ref(),
            expected.as_ref()
        )));
    }

    match ctx
        .queue
        .enqueue(JobKind::DocumentParse, tenant_id, document_id)
    {
        Ok(job) => Ok(job),
        Err(err) => {
            // Undo the status flip so the document stays actionable.
            if let Err(rollback) = ctx.store.transition_document(
                tenant_id,
                document_id,
                &[DocumentStatus::Queued],
                expected,
            ) {
                warn!(document_id, error = %rollback, "failed to roll back queued status");
            }
            Err(err.into())
        }
    }
}

/// Parameters of a confirmation request. `final_lines` overrides the
/// selected candidate's lines; overrides must balance.
#[derive(Debug, Clone, Default)]
pub struct ConfirmRequest {
    pub selected_index: usize,
    pub final_lines: Option<Vec<CandidateLine>>,
    pub final_description: Option<String>,
    pub override_reason: Option<String>,
}

/// Confirm a journal draft into an immutable journal entry. Exactly one
/// confirmation wins; concurrent calls on the same draft get a conflict.
pub fn confirm_draft(
    ctx: &AppContext,
    tenant_id: &str,
    draft_id: &str,
    user_id: &str,
    request: ConfirmRequest,
) -> Result<JournalEntry, AppError> {
    let draft = ctx
        .store
        .get_draft(tenant_id, draft_id)?
        .ok_or_else(|| AppError::NotFound {
            entity: "journal draft",
            id: draft_id.to_string(),
        })?;

    let candidate = draft
        .candidates
        .get(request.selected_index)
        .ok_or_else(|| {
            AppError::InvalidInput(format!(
                "selected index {} out of range ({} candidates)",
                request.selected_index,
                draft.candidates.len()
            ))
        })?;

    let override_applied = request.final_lines.is_some();
    let final_lines = request
        .final_lines
        .clone()
        .unwrap_or_else(|| candidate.lines.clone());
    if !lines_balance(&final_lines) {
        return Err(AppError::InvalidInput(
            "journal lines do not balance".to_string(),
        ));
    }

    // Entries are immutable; every code must resolve to an active account
    // before the draft is allowed to win.
    let active_codes: Vec<String> = ctx
        .store
        .list_active_accounts(tenant_id)?
        .into_iter()
        .map(|account| account.code)
        .collect();
    let invalid_codes: Vec<&str> = final_lines
        .iter()
        .map(|line| line.account_code.as_str())
        .filter(|code| !active_codes.iter().any(|c| c == code))
        .collect();
    if !invalid_codes.is_empty() {
        return Err(AppError::InvalidInput(format!(
            "invalid account codes: {}",
            invalid_codes.join(", ")
        )));
    }

    let final_description = request
        .final_description
        .clone()
        .unwrap_or_else(|| candidate.description.clone());

    // Single-winner gate. Everything after this point must either complete
    // or compensate.
    let confirmed = ctx
        .store
        .confirm_draft(tenant_id, draft_id, request.selected_index, user_id)?
        .ok_or_else(|| {
            AppError::Conflict(format!(
                "journal draft `{draft_id}` is already confirmed or closed"
            ))
        })?;

    match write_entry(ctx, tenant_id, &confirmed, &final_lines, &final_description) {
        Ok(entry) => {
            record_confirmation_side_effects(
                ctx,
                tenant_id,
                &confirmed,
                &entry,
                &final_lines,
                &final_description,
                user_id,
                override_applied,
                request.override_reason,
            );
            Ok(entry)
        }
        Err(err) => {
            // Put the draft back the way we found it so the confirmation can
            // be retried.
            if let Err(rollback) = ctx.store.put_draft(&draft) {
                warn!(draft_id, error = %rollback, "failed to roll back draft confirmation");
            }
            Err(err)
        }
    }
}

fn write_entry(
    ctx: &AppContext,
    tenant_id: &str,
    draft: &JournalDraft,
    final_lines: &[CandidateLine],
    description: &str,
) -> Result<JournalEntry, AppError> {
    let document = ctx.store.get_document(tenant_id, &draft.document_id)?;
    let entry_date = document
        .as_ref()
        .and_then(|d| d.document_date)
        .unwrap_or_else(today);
    let tax_amount = line_tax_amount(final_lines);
    let (total_debit, _) = line_totals(final_lines);

    let entry = JournalEntry {
        id: Uuid::new_v4().to_string(),
        tenant_id: tenant_id.to_string(),
        entry_date,
        description: description.to_string(),
        source_document_id: draft.document_id.clone(),
        journal_draft_id: draft.id.clone(),
        total_amount: total_debit,
        tax_amount,
        confirmed_by: draft.confirmed_by.clone().unwrap_or_default(),
        confirmed_at_ms: draft.confirmed_at_ms.unwrap_or_else(now_ms),
    };
    let lines: Vec<JournalLine> = final_lines
        .iter()
        .enumerate()
        .map(|(idx, line)| JournalLine {
            tenant_id: tenant_id.to_string(),
            journal_entry_id: entry.id.clone(),
            line_no: (idx + 1) as u32,
            account_code: line.account_code.clone(),
            account_name: line.account_name.clone(),
            debit: line.debit,
            credit: line.credit,
            tax_code: line.tax_code.clone(),
            memo: line.memo.clone(),
        })
        .collect();

    if let Err(err) = ctx.store.insert_journal_entry(&entry, &lines) {
        // Leave no partial entry behind.
        if let Err(cleanup) = ctx.store.delete_journal_entry(tenant_id, &entry.id) {
            warn!(entry_id = %entry.id, error = %cleanup, "failed to clean up partial entry");
        }
        return Err(err.into());
    }
    Ok(entry)
}

/// Post-confirmation bookkeeping: document status, metrics, and the learning
/// feedback event. All best-effort; the entry already exists.
#[allow(clippy::too_many_arguments)]
fn record_confirmation_side_effects(
    ctx: &AppContext,
    tenant_id: &str,
    draft: &JournalDraft,
    entry: &JournalEntry,
    final_lines: &[CandidateLine],
    final_description: &str,
    user_id: &str,
    override_applied: bool,
    override_reason: Option<String>,
) {
    if let Err(err) = ctx.store.transition_document(
        tenant_id,
        &draft.document_id,
        &[DocumentStatus::Extracted],
        DocumentStatus::Verified,
    ) {
        warn!(document_id = %draft.document_id, error = %err, "failed to mark document verified");
    }

    ctx.metrics.emit(
        JOURNAL_CONFIRM_COUNT,
        1.0,
        json!({"tenant_id": tenant_id, "draft_id": draft.id, "entry_id": entry.id}),
    );
    if override_applied {
        ctx.metrics.emit(
            JOURNAL_OVERRIDE_COUNT,
            1.0,
            json!({"tenant_id": tenant_id, "draft_id": draft.id}),
        );
    }

    let vendor_name = extraction_vendor(&ctx.store, tenant_id, &draft.document_id);
    let feedback = FeedbackEvent {
        id: Uuid::new_v4().to_string(),
        tenant_id: tenant_id.to_string(),
        user_id: Some(user_id.to_string()),
        entity_type: "journal_draft".to_string(),
        entity_id: draft.id.clone(),
        ai_output: draft.candidates.clone(),
        user_correction: UserCorrection {
            selected_index: draft.selected_index.unwrap_or_default(),
            override_applied,
            override_reason,
            final_lines: final_lines.to_vec(),
            final_description: final_description.to_string(),
            vendor_name,
        },
        created_at_ms: now_ms(),
    };
    if let Err(err) = ctx.store.append_feedback(&feedback) {
        warn!(draft_id = %draft.id, error = %err, "failed to record confirmation feedback");
    }
}

fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

/// Consumption tax across tax-coded lines: the line amount times the rate
/// its tax code names, rounded to two decimals.
fn line_tax_amount(lines: &[CandidateLine]) -> f64 {
    let tax: f64 = lines
        .iter()
        .map(|line| {
            let amount = if line.debit > 0.0 { line.debit } else { line.credit };
            match line.tax_code.as_deref() {
                Some("TAX10") => amount * 0.10,
                Some("TAX8") => amount * 0.08,
                _ => 0.0,
            }
        })
        .sum();
    (tax * 100.0).round() / 100.0
}
