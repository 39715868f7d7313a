//! Heavy pipeline stage: OCR the uploaded file, structure and classify the
//! result, flag suspected duplicates, and persist the extraction snapshot.

use chrono::NaiveDate;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::jobs::JobError;
use crate::model::{
    DocumentStatus, DocumentSummary, ExtractionPayload, ExtractionRecord, clamp_confidence, now_ms,
};
use crate::queue::{JobKind, QueueJob};
use crate::services::di_client::{DiAnalyzeResult, DiModel};
use crate::services::duplicate_check::{DuplicateSuspect, find_duplicates};
use crate::services::metrics::{
    CLASSIFICATION_METHOD, DUPLICATE_CHECK_COUNT, OCR_JOB_FAILURE, OCR_JOB_SUCCESS,
    OCR_RETRY_COUNT,
};
use crate::services::structuring::StructuredExtraction;
use crate::services::{classifier, structuring};

/// Below this invoice-model confidence the job re-analyzes once with the
/// general read model.
const ESCALATION_THRESHOLD: f64 = 0.5;

const MODEL_PROVIDER: &str = "azure-di";
const MODEL_API_VERSION: &str = "2024-11-30";

pub async fn run(ctx: &AppContext, job: &QueueJob) -> Result<(), JobError> {
    let tenant_id = &job.tenant_id;
    let document_id = &job.document_id;
    let started_ms = now_ms();

    // Claim guard: only a queued document may enter processing. Anything
    // else means a concurrent or repeated delivery; skip without error.
    let Some(document) = ctx.store.transition_document(
        tenant_id,
        document_id,
        &[DocumentStatus::Queued],
        DocumentStatus::Processing,
    )?
    else {
        info!(document_id, "parse skipped: document not in queued state");
        return Ok(());
    };

    if job.attempt_count > 0 {
        ctx.metrics.emit(
            OCR_RETRY_COUNT,
            job.attempt_count as f64,
            json!({"tenant_id": tenant_id, "document_id": document_id}),
        );
    }

    match parse_document(ctx, job, &document).await {
        Ok(()) => {
            ctx.metrics.emit_latency(
                now_ms() - started_ms,
                json!({"tenant_id": tenant_id, "document_id": document_id}),
            );
            ctx.metrics.emit(
                OCR_JOB_SUCCESS,
                1.0,
                json!({"tenant_id": tenant_id, "document_id": document_id}),
            );
            Ok(())
        }
        Err(err) => {
            ctx.metrics.emit(
                OCR_JOB_FAILURE,
                1.0,
                json!({
                    "tenant_id": tenant_id,
                    "document_id": document_id,
                    "error": err.to_string(),
                }),
            );
            // While attempts remain, put the document back in `queued` so
            // the retry can claim it. The last attempt parks it in `error`;
            // from there only the explicit retry action re-enqueues.
            let exhausted = job.attempt_count + 1 >= job.max_attempts;
            let next = if exhausted {
                DocumentStatus::Error
            } else {
                DocumentStatus::Queued
            };
            if let Err(store_err) = ctx.store.transition_document(
                tenant_id,
                document_id,
                &[DocumentStatus::Processing],
                next,
            ) {
                warn!(document_id, error = %store_err, "failed to roll back document status");
            }
            Err(err)
        }
    }
}

async fn parse_document(
    ctx: &AppContext,
    job: &QueueJob,
    document: &crate::model::Document,
) -> Result<(), JobError> {
    let tenant_id = &job.tenant_id;
    let document_id = &job.document_id;

    let bytes = ctx
        .blobs
        .download(&document.storage_bucket, &document.file_key)
        .await?;

    let analysis = analyze_with_escalation(ctx, &bytes, &document.mime_type).await?;
    let structured = structuring::structure(&analysis);

    let classification = classifier::classify(
        &ctx.llm,
        &structured,
        &analysis.model_id,
        &document.file_name,
    )
    .await;
    ctx.metrics.emit(
        CLASSIFICATION_METHOD,
        1.0,
        json!({
            "tenant_id": tenant_id,
            "document_id": document_id,
            "method": classification.method,
            "document_type": classification.document_type,
        }),
    );

    let document_date = structured
        .document_date
        .as_deref()
        .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok());
    let duplicate_suspects =
        check_duplicates(ctx, tenant_id, document_id, document_date, &structured);
    ctx.metrics.emit(
        DUPLICATE_CHECK_COUNT,
        duplicate_suspects.len() as f64,
        json!({"tenant_id": tenant_id, "document_id": document_id}),
    );

    let confidence = clamp_confidence(structured.confidence);
    let record = ExtractionRecord {
        id: Uuid::new_v4().to_string(),
        tenant_id: tenant_id.clone(),
        document_id: document_id.clone(),
        payload: ExtractionPayload {
            structured: structured.clone(),
            classification: classification.clone(),
            duplicate_suspects,
        },
        model_provider: MODEL_PROVIDER.to_string(),
        model_name: analysis.model_id.clone(),
        model_version: MODEL_API_VERSION.to_string(),
        confidence,
        created_at_ms: now_ms(),
    };
    ctx.store.append_extraction(&record)?;

    let summary = DocumentSummary {
        document_type: Some(classification.document_type.clone()),
        document_date,
        amount: structured.total_amount,
        tax_amount: structured.tax_amount,
        registration_number: structured.vendor_registration_number.clone(),
    };
    if ctx
        .store
        .complete_extraction(tenant_id, document_id, &summary)?
        .is_none()
    {
        // Someone moved the document out of `processing` underneath us. The
        // snapshot is still persisted; treat the run as done.
        warn!(document_id, "extraction summary dropped: document left processing state");
        return Ok(());
    }

    // Validation runs next; a queue hiccup here must not undo the parse.
    if let Err(err) = ctx
        .queue
        .enqueue(JobKind::InvoiceValidate, tenant_id, document_id)
    {
        warn!(document_id, error = %err, "failed to enqueue invoice validation");
    }

    info!(
        document_id,
        document_type = %classification.document_type,
        confidence,
        "document parsed"
    );
    Ok(())
}

/// Analyze with the invoice model; on low confidence, fall back once to the
/// general read model and keep that result.
async fn analyze_with_escalation(
    ctx: &AppContext,
    bytes: &[u8],
    mime_type: &str,
) -> Result<DiAnalyzeResult, JobError> {
    let invoice = ctx
        .di
        .analyze(bytes, mime_type, DiModel::PrebuiltInvoice)
        .await?;
    if invoice.confidence >= ESCALATION_THRESHOLD {
        return Ok(invoice);
    }
    info!(
        confidence = invoice.confidence,
        "low invoice-model confidence, escalating to read model"
    );
    Ok(ctx.di.analyze(bytes, mime_type, DiModel::PrebuiltRead).await?)
}

/// Duplicate lookup is best-effort: a store error here downgrades to an
/// empty suspect list rather than failing the parse.
fn check_duplicates(
    ctx: &AppContext,
    tenant_id: &str,
    document_id: &str,
    document_date: Option<NaiveDate>,
    structured: &StructuredExtraction,
) -> Vec<DuplicateSuspect> {
    match ctx.store.list_documents(tenant_id) {
        Ok(candidates) => find_duplicates(
            document_id,
            document_date,
            structured.total_amount,
            &candidates,
        ),
        Err(err) => {
            warn!(document_id, error = %err, "duplicate check failed, continuing without it");
            Vec::new()
        }
    }
}
