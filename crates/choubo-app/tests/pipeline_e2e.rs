//! Full pipeline run against mock provider clients: ingest, parse, validate,
//! suggest, confirm.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use choubo_app::actions::{self, ConfirmRequest};
use choubo_app::config::{AppConfig, QueueTuning, StorageConfig};
use choubo_app::context::AppContext;
use choubo_app::error::AppError;
use choubo_app::model::{Account, CandidateLine, DocumentStatus, DraftStatus};
use choubo_app::paths::AppPaths;
use choubo_app::queue::{JobQueueStore, JobStatus, QueueName};
use choubo_app::services::blob_store::FsBlobStore;
use choubo_app::services::di_client::{
    DiAnalyzeResult, DiCurrency, DiError, DiField, DiModel, DocumentAnalysisClient,
};
use choubo_app::services::llm_client::{LlmClient, LlmError};
use choubo_app::services::metrics::MetricsEmitter;
use choubo_app::store::LedgerStore;
use choubo_app::worker;

const TENANT: &str = "tenant-e2e";

struct MockDiClient {
    results: Mutex<Vec<Result<DiAnalyzeResult, DiError>>>,
    calls: Mutex<Vec<DiModel>>,
}

impl MockDiClient {
    fn scripted(results: Vec<Result<DiAnalyzeResult, DiError>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results),
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DocumentAnalysisClient for MockDiClient {
    async fn analyze(
        &self,
        _file_bytes: &[u8],
        _content_type: &str,
        model: DiModel,
    ) -> Result<DiAnalyzeResult, DiError> {
        self.calls.lock().expect("lock").push(model);
        self.results
            .lock()
            .expect("lock")
            .pop()
            .unwrap_or(Err(DiError::PollTimeout { attempts: 0 }))
    }
}

struct MockLlmClient {
    responses: Mutex<Vec<Result<String, LlmError>>>,
}

impl MockLlmClient {
    fn scripted(responses: Vec<Result<String, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
        })
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
        self.responses
            .lock()
            .expect("lock")
            .pop()
            .unwrap_or(Err(LlmError::EmptyResponse))
    }

    fn model_name(&self) -> String {
        "mock-llm".to_string()
    }
}

fn test_context(
    temp: &TempDir,
    di: Arc<dyn DocumentAnalysisClient>,
    llm: Arc<dyn LlmClient>,
) -> AppContext {
    let paths = AppPaths::new(temp.path()).expect("paths");
    let store = Arc::new(LedgerStore::open(&paths).expect("ledger store"));
    let queue = Arc::new(JobQueueStore::open(&paths).expect("queue store"));
    let blobs = Arc::new(FsBlobStore::new(paths.clone()));
    AppContext {
        config: AppConfig {
            storage: StorageConfig {
                path: temp.path().to_path_buf(),
            },
            queue: QueueTuning {
                heavy_concurrency: 2,
                light_concurrency: 4,
                heavy_rate_per_sec: 15,
                poll_interval_ms: 50,
            },
        },
        paths,
        store,
        queue,
        blobs,
        di,
        llm,
        metrics: MetricsEmitter::default(),
    }
}

fn seed_accounts(ctx: &AppContext) {
    for (code, name, category) in [
        ("5100", "仕入高", "expense"),
        ("2100", "買掛金", "liability"),
        ("1100", "現金", "asset"),
    ] {
        ctx.store
            .upsert_account(&Account {
                tenant_id: TENANT.to_string(),
                code: code.to_string(),
                name: name.to_string(),
                category: category.to_string(),
                is_active: true,
            })
            .expect("seed account");
    }
}

fn string_field(value: &str) -> DiField {
    DiField {
        value_string: Some(value.to_string()),
        content: Some(value.to_string()),
        confidence: 0.95,
        ..DiField::default()
    }
}

fn currency_field(amount: f64) -> DiField {
    DiField {
        value_currency: Some(DiCurrency {
            amount,
            currency_code: Some("JPY".to_string()),
        }),
        confidence: 0.95,
        ..DiField::default()
    }
}

fn invoice_analysis() -> DiAnalyzeResult {
    let mut fields = HashMap::new();
    fields.insert("VendorName".to_string(), string_field("A商事株式会社"));
    fields.insert("VendorTaxId".to_string(), string_field("T1234567890123"));
    fields.insert(
        "InvoiceDate".to_string(),
        DiField {
            value_date: Some("2025-01-15".to_string()),
            confidence: 0.95,
            ..DiField::default()
        },
    );
    fields.insert("SubTotal".to_string(), currency_field(10_000.0));
    fields.insert("TotalTax".to_string(), currency_field(1_000.0));
    fields.insert("InvoiceTotal".to_string(), currency_field(11_000.0));

    let mut tax_detail = HashMap::new();
    tax_detail.insert("Rate".to_string(), DiField {
        value_number: Some(10.0),
        ..DiField::default()
    });
    tax_detail.insert("NetAmount".to_string(), currency_field(10_000.0));
    tax_detail.insert("Amount".to_string(), currency_field(1_000.0));
    fields.insert("TaxDetails".to_string(), DiField {
        value_array: vec![DiField {
            value_object: tax_detail,
            ..DiField::default()
        }],
        ..DiField::default()
    });

    let mut item = HashMap::new();
    item.insert("Description".to_string(), string_field("事務用品一式"));
    item.insert("Amount".to_string(), currency_field(10_000.0));

    DiAnalyzeResult {
        model_id: "prebuilt-invoice".to_string(),
        content: "請求書 A商事株式会社 T1234567890123 合計 ¥11,000".to_string(),
        fields,
        items: vec![item],
        confidence: 0.95,
    }
}

fn suggestion_json(confidence: f64) -> String {
    format!(
        "{{\"candidates\": [{{\"lines\": [\
         {{\"account_code\": \"5100\", \"account_name\": \"仕入高\", \"debit\": 11000, \"credit\": 0}},\
         {{\"account_code\": \"2100\", \"account_name\": \"買掛金\", \"debit\": 0, \"credit\": 11000}}],\
         \"description\": \"A商事 仕入\", \"reasoning\": \"請求書の内容から仕入と判断\", \
         \"confidence\": {confidence}}}]}}"
    )
}

async fn drain(ctx: &AppContext, queue: QueueName) {
    while worker::run_due_jobs(ctx, queue, 16).await.expect("drain") > 0 {}
}

#[tokio::test]
async fn full_pipeline_ingest_to_confirmed_entry() {
    let temp = TempDir::new().expect("tempdir");
    let di = MockDiClient::scripted(vec![Ok(invoice_analysis())]);
    let llm = MockLlmClient::scripted(vec![Ok(suggestion_json(0.92))]);
    let ctx = test_context(&temp, di.clone(), llm);
    seed_accounts(&ctx);

    let document = actions::ingest_document(
        &ctx,
        TENANT,
        "invoice-2025-01.pdf",
        "application/pdf",
        b"%PDF-1.7 fake invoice",
        true,
    )
    .await
    .expect("ingest");
    assert_eq!(document.status, DocumentStatus::Queued);

    // Heavy stage: parse.
    drain(&ctx, QueueName::Heavy).await;
    assert_eq!(di.calls.lock().expect("lock").as_slice(), &[
        DiModel::PrebuiltInvoice
    ]);

    let parsed = ctx
        .store
        .get_document(TENANT, &document.id)
        .expect("read")
        .expect("present");
    assert_eq!(parsed.status, DocumentStatus::Extracted);
    assert_eq!(parsed.document_type.as_deref(), Some("invoice"));
    assert_eq!(parsed.amount, Some(11_000.0));
    assert_eq!(parsed.registration_number.as_deref(), Some("T1234567890123"));

    let extraction = ctx
        .store
        .latest_extraction(TENANT, &document.id)
        .expect("read")
        .expect("present");
    assert_eq!(extraction.payload.classification.method, "rule");
    assert_eq!(
        extraction.payload.structured.vendor_name.as_deref(),
        Some("A商事株式会社")
    );

    // Light stage: validation, then the suggestion it chains.
    drain(&ctx, QueueName::Light).await;

    let check = ctx
        .store
        .latest_invoice_check(TENANT, &document.id)
        .expect("read")
        .expect("present");
    assert_eq!(check.status.as_ref(), "ok");
    assert!(check.reasons.is_empty());

    let draft = ctx
        .store
        .latest_draft_for_document(TENANT, &document.id)
        .expect("read")
        .expect("present");
    assert_eq!(draft.status, DraftStatus::Suggested);
    assert_eq!(draft.candidates.len(), 1);
    assert!((draft.confidence.expect("confidence") - 0.92).abs() < 1e-9);

    // Confirmation.
    let entry = actions::confirm_draft(
        &ctx,
        TENANT,
        &draft.id,
        "user-1",
        ConfirmRequest::default(),
    )
    .expect("confirm");
    assert_eq!(entry.total_amount, 11_000.0);
    assert_eq!(entry.source_document_id, document.id);
    assert_eq!(entry.entry_date.to_string(), "2025-01-15");

    let lines = ctx
        .store
        .list_journal_lines(TENANT, &entry.id)
        .expect("read");
    assert_eq!(lines.len(), 2);
    let debit: f64 = lines.iter().map(|l| l.debit).sum();
    let credit: f64 = lines.iter().map(|l| l.credit).sum();
    assert!((debit - credit).abs() <= 0.01);

    let verified = ctx
        .store
        .get_document(TENANT, &document.id)
        .expect("read")
        .expect("present");
    assert_eq!(verified.status, DocumentStatus::Verified);

    let feedback = ctx
        .store
        .recent_feedback_for_vendor(TENANT, "A商事株式会社", 5)
        .expect("read");
    assert_eq!(feedback.len(), 1);
    assert!(!feedback[0].user_correction.override_applied);

    // Everything settled: no jobs left pending or failed.
    for queue in [QueueName::Heavy, QueueName::Light] {
        let counts = ctx.queue.counts(queue).expect("counts");
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.active, 0);
        assert_eq!(counts.failed, 0);
    }
}

#[tokio::test]
async fn second_document_with_same_amount_and_date_is_flagged_as_duplicate() {
    let temp = TempDir::new().expect("tempdir");
    let di = MockDiClient::scripted(vec![Ok(invoice_analysis()), Ok(invoice_analysis())]);
    let llm = MockLlmClient::scripted(vec![
        Ok(suggestion_json(0.92)),
        Ok(suggestion_json(0.92)),
    ]);
    let ctx = test_context(&temp, di, llm);
    seed_accounts(&ctx);

    let first = actions::ingest_document(
        &ctx,
        TENANT,
        "original.pdf",
        "application/pdf",
        b"original bytes",
        true,
    )
    .await
    .expect("ingest");
    drain(&ctx, QueueName::Heavy).await;

    let second = actions::ingest_document(
        &ctx,
        TENANT,
        "resubmitted.pdf",
        "application/pdf",
        b"resubmitted bytes",
        true,
    )
    .await
    .expect("ingest");
    drain(&ctx, QueueName::Heavy).await;

    let extraction = ctx
        .store
        .latest_extraction(TENANT, &second.id)
        .expect("read")
        .expect("present");
    let suspects = &extraction.payload.duplicate_suspects;
    assert_eq!(suspects.len(), 1);
    assert_eq!(suspects[0].document_id, first.id);
    assert_eq!(suspects[0].match_reason, "date_amount");

    // The first document saw no earlier sibling.
    let first_extraction = ctx
        .store
        .latest_extraction(TENANT, &first.id)
        .expect("read")
        .expect("present");
    assert!(first_extraction.payload.duplicate_suspects.is_empty());
}

#[tokio::test]
async fn failed_parse_retries_then_dead_letters_and_manual_retry_requeues() {
    let temp = TempDir::new().expect("tempdir");
    // Every analysis attempt fails.
    let di = MockDiClient::scripted(vec![]);
    let llm = MockLlmClient::scripted(vec![]);
    let ctx = test_context(&temp, di, llm);

    let document = actions::ingest_document(
        &ctx,
        TENANT,
        "broken.pdf",
        "application/pdf",
        b"unreadable",
        true,
    )
    .await
    .expect("ingest");

    // Walk through all five attempts. Backoff gates claims by timestamp, so
    // run the pending job directly instead of waiting it out.
    for attempt in 1..=5u32 {
        let pending = ctx
            .queue
            .list_by_status(JobStatus::Pending, 1)
            .expect("list");
        assert_eq!(pending.len(), 1, "attempt {attempt} should find the job pending");
        worker::execute_job(&ctx, &pending[0]).await;
    }

    let counts = ctx.queue.counts(QueueName::Heavy).expect("counts");
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.pending, 0);

    let errored = ctx
        .store
        .get_document(TENANT, &document.id)
        .expect("read")
        .expect("present");
    assert_eq!(errored.status, DocumentStatus::Error);

    // Manual retry flips the document back to queued with a fresh job.
    let job = actions::retry_document(&ctx, TENANT, &document.id).expect("retry");
    assert_eq!(job.attempt_count, 0);
    let requeued = ctx
        .store
        .get_document(TENANT, &document.id)
        .expect("read")
        .expect("present");
    assert_eq!(requeued.status, DocumentStatus::Queued);

    // Retrying a queued document is a conflict.
    let err = actions::retry_document(&ctx, TENANT, &document.id).expect_err("conflict");
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn ng_verdict_does_not_chain_journal_suggestion() {
    let temp = TempDir::new().expect("tempdir");
    let mut analysis = invoice_analysis();
    analysis.fields.remove("VendorName");
    let di = MockDiClient::scripted(vec![Ok(analysis)]);
    let llm = MockLlmClient::scripted(vec![Ok(suggestion_json(0.92))]);
    let ctx = test_context(&temp, di, llm);
    seed_accounts(&ctx);

    let document = actions::ingest_document(
        &ctx,
        TENANT,
        "no-vendor.pdf",
        "application/pdf",
        b"no vendor bytes",
        true,
    )
    .await
    .expect("ingest");
    drain(&ctx, QueueName::Heavy).await;
    drain(&ctx, QueueName::Light).await;

    let check = ctx
        .store
        .latest_invoice_check(TENANT, &document.id)
        .expect("read")
        .expect("present");
    assert_eq!(check.status.as_ref(), "ng");
    assert!(check.reasons.iter().any(|r| r.field == "vendor_name"));

    // Terminal branch: validation completed but no suggestion job followed.
    assert!(ctx
        .store
        .latest_draft_for_document(TENANT, &document.id)
        .expect("read")
        .is_none());
    let counts = ctx.queue.counts(QueueName::Light).expect("counts");
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.pending, 0);
}

#[tokio::test]
async fn unbalanced_candidate_fails_the_suggestion_job() {
    let temp = TempDir::new().expect("tempdir");
    let di = MockDiClient::scripted(vec![Ok(invoice_analysis())]);
    // One unbalanced candidate next to a balanced one: the attempt must fail,
    // not silently keep the survivor.
    let unbalanced = "{\"candidates\": [\
        {\"lines\": [\
         {\"account_code\": \"5100\", \"account_name\": \"仕入高\", \"debit\": 11000, \"credit\": 0},\
         {\"account_code\": \"2100\", \"account_name\": \"買掛金\", \"debit\": 0, \"credit\": 9000}],\
         \"description\": \"仕入\", \"reasoning\": \"\", \"confidence\": 0.9},\
        {\"lines\": [\
         {\"account_code\": \"5100\", \"account_name\": \"仕入高\", \"debit\": 11000, \"credit\": 0},\
         {\"account_code\": \"2100\", \"account_name\": \"買掛金\", \"debit\": 0, \"credit\": 11000}],\
         \"description\": \"仕入\", \"reasoning\": \"\", \"confidence\": 0.8}]}";
    let llm = MockLlmClient::scripted(vec![Ok(unbalanced.to_string())]);
    let ctx = test_context(&temp, di, llm);
    seed_accounts(&ctx);

    let document = actions::ingest_document(
        &ctx,
        TENANT,
        "unbalanced.pdf",
        "application/pdf",
        b"unbalanced bytes",
        true,
    )
    .await
    .expect("ingest");
    drain(&ctx, QueueName::Heavy).await;
    drain(&ctx, QueueName::Light).await;

    let draft = ctx
        .store
        .latest_draft_for_document(TENANT, &document.id)
        .expect("read")
        .expect("error draft recorded");
    assert_eq!(draft.status, DraftStatus::Error);
    assert!(draft.candidates.is_empty());
    assert!(draft.ai_reason.expect("reason").contains("debit"));

    // The suggestion job is awaiting its backoff retry.
    let counts = ctx.queue.counts(QueueName::Light).expect("counts");
    assert_eq!(counts.pending, 1);
}

#[tokio::test]
async fn confirmation_rejects_unknown_account_codes() {
    let temp = TempDir::new().expect("tempdir");
    let di = MockDiClient::scripted(vec![Ok(invoice_analysis())]);
    let llm = MockLlmClient::scripted(vec![Ok(suggestion_json(0.92))]);
    let ctx = test_context(&temp, di, llm);
    seed_accounts(&ctx);

    let document = actions::ingest_document(
        &ctx,
        TENANT,
        "override.pdf",
        "application/pdf",
        b"override bytes",
        true,
    )
    .await
    .expect("ingest");
    drain(&ctx, QueueName::Heavy).await;
    drain(&ctx, QueueName::Light).await;

    let draft = ctx
        .store
        .latest_draft_for_document(TENANT, &document.id)
        .expect("read")
        .expect("present");

    let bogus_line = |code: &str, debit: f64, credit: f64| CandidateLine {
        account_code: code.to_string(),
        account_name: "架空科目".to_string(),
        debit,
        credit,
        tax_code: None,
        memo: String::new(),
    };
    let err = actions::confirm_draft(
        &ctx,
        TENANT,
        &draft.id,
        "user-1",
        ConfirmRequest {
            selected_index: 0,
            final_lines: Some(vec![
                bogus_line("9999", 11_000.0, 0.0),
                bogus_line("8888", 0.0, 11_000.0),
            ]),
            ..ConfirmRequest::default()
        },
    )
    .expect_err("unknown codes");
    match err {
        AppError::InvalidInput(message) => {
            assert!(message.contains("9999"));
            assert!(message.contains("8888"));
        }
        other => panic!("expected InvalidInput, got {other}"),
    }

    // The rejection happened before the single-winner gate: the draft is
    // still open and a clean confirmation goes through.
    let entry = actions::confirm_draft(
        &ctx,
        TENANT,
        &draft.id,
        "user-1",
        ConfirmRequest::default(),
    )
    .expect("confirm");
    assert_eq!(entry.total_amount, 11_000.0);
}

#[tokio::test]
async fn concurrent_confirmations_have_exactly_one_winner() {
    let temp = TempDir::new().expect("tempdir");
    let di = MockDiClient::scripted(vec![Ok(invoice_analysis())]);
    let llm = MockLlmClient::scripted(vec![Ok(suggestion_json(0.92))]);
    let ctx = test_context(&temp, di, llm);
    seed_accounts(&ctx);

    let document = actions::ingest_document(
        &ctx,
        TENANT,
        "race.pdf",
        "application/pdf",
        b"race bytes",
        true,
    )
    .await
    .expect("ingest");
    drain(&ctx, QueueName::Heavy).await;
    drain(&ctx, QueueName::Light).await;

    let draft = ctx
        .store
        .latest_draft_for_document(TENANT, &document.id)
        .expect("read")
        .expect("present");

    let mut handles = Vec::new();
    for user in ["user-1", "user-2"] {
        let ctx = ctx.clone();
        let draft_id = draft.id.clone();
        handles.push(std::thread::spawn(move || {
            actions::confirm_draft(&ctx, TENANT, &draft_id, user, ConfirmRequest::default())
        }));
    }
    let outcomes: Vec<Result<_, AppError>> =
        handles.into_iter().map(|h| h.join().expect("join")).collect();

    let wins = outcomes.iter().filter(|o| o.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|o| matches!(o, Err(AppError::Conflict(_))))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 1);

    let confirmed = ctx
        .store
        .get_draft(TENANT, &draft.id)
        .expect("read")
        .expect("present");
    assert_eq!(confirmed.status, DraftStatus::Confirmed);
}
