//! LMDB-backed persistence for the accounting ledger: documents,
//! extraction snapshots, invoice checks, journal drafts, confirmed entries,
//! chart of accounts, tenant settings, and learning feedback.
//!
//! Every key is tenant-prefixed (`{tenant}/...`) so one environment serves
//! all tenants while scans stay tenant-scoped. Status transitions go through
//! conditional read-check-write inside a single write transaction; a caller
//! holding a stale view loses the race and gets `None` back instead of
//! clobbering newer state.

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::model::{
    Account, Document, DocumentStatus, DocumentSummary, DraftStatus, ExtractionRecord,
    FeedbackEvent, InvoiceCheck, JournalDraft, JournalEntry, JournalLine, TenantSettings, now_ms,
};
use crate::paths::{AppPaths, PathError};

const LEDGER_ENV_MAP_SIZE_BYTES: usize = 1 << 30; // 1 GiB

#[derive(Debug, Error)]
pub enum LedgerStoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("document `{0}` not found")]
    DocumentNotFound(String),
    #[error("journal draft `{0}` not found")]
    DraftNotFound(String),
    #[error("account `{0}` not found or inactive")]
    AccountNotFound(String),
}

#[derive(Debug)]
pub struct LedgerStore {
    env: Env,
    documents: Database<Str, Bytes>,
    extractions: Database<Str, Bytes>,
    invoice_checks: Database<Str, Bytes>,
    drafts: Database<Str, Bytes>,
    entries: Database<Str, Bytes>,
    lines: Database<Str, Bytes>,
    accounts: Database<Str, Bytes>,
    settings: Database<Str, Bytes>,
    feedback: Database<Str, Bytes>,
}

fn open_named(env: &Env, name: &str) -> Result<Database<Str, Bytes>, LedgerStoreError> {
    let rtxn = env.read_txn()?;
    let opened = env.open_database::<Str, Bytes>(&rtxn, Some(name))?;
    drop(rtxn);
    match opened {
        Some(existing) => Ok(existing),
        None => {
            let mut wtxn = env.write_txn()?;
            let db = env.create_database::<Str, Bytes>(&mut wtxn, Some(name))?;
            wtxn.commit()?;
            Ok(db)
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, LedgerStoreError> {
    Ok(encode_to_vec(value, config::standard())?)
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, LedgerStoreError> {
    let (value, _) = decode_from_slice::<T, _>(raw, config::standard())?;
    Ok(value)
}

fn get_decoded<T: DeserializeOwned>(
    db: &Database<Str, Bytes>,
    txn: &RoTxn,
    key: &str,
) -> Result<Option<T>, LedgerStoreError> {
    match db.get(txn, key)? {
        Some(raw) => Ok(Some(decode(raw)?)),
        None => Ok(None),
    }
}

fn put_encoded<T: Serialize>(
    db: &Database<Str, Bytes>,
    txn: &mut RwTxn,
    key: &str,
    value: &T,
) -> Result<(), LedgerStoreError> {
    let encoded = encode(value)?;
    db.put(txn, key, encoded.as_slice())?;
    Ok(())
}

fn document_key(tenant_id: &str, document_id: &str) -> String {
    format!("{tenant_id}/{document_id}")
}

/// Append-only keys sort by creation time so the newest row for a document
/// is the last one under its prefix.
fn timeline_key(tenant_id: &str, document_id: &str, created_at_ms: i64, id: &str) -> String {
    format!("{tenant_id}/{document_id}/{created_at_ms:020}/{id}")
}

fn line_key(tenant_id: &str, entry_id: &str, line_no: u32) -> String {
    format!("{tenant_id}/{entry_id}/{line_no:04}")
}

impl LedgerStore {
    pub fn open(paths: &AppPaths) -> Result<Self, LedgerStoreError> {
        let path = paths.ledger_lmdb_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(16);
        options.map_size(LEDGER_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };
        Ok(Self {
            documents: open_named(&env, "documents")?,
            extractions: open_named(&env, "extractions")?,
            invoice_checks: open_named(&env, "invoice_checks")?,
            drafts: open_named(&env, "drafts")?,
            entries: open_named(&env, "entries")?,
            lines: open_named(&env, "lines")?,
            accounts: open_named(&env, "accounts")?,
            settings: open_named(&env, "settings")?,
            feedback: open_named(&env, "feedback")?,
            env,
        })
    }

    // --- documents -------------------------------------------------------

    pub fn put_document(&self, document: &Document) -> Result<(), LedgerStoreError> {
        debug_assert!(!document.id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        put_encoded(
            &self.documents,
            &mut wtxn,
            &document_key(&document.tenant_id, &document.id),
            document,
        )?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_document(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Option<Document>, LedgerStoreError> {
        let rtxn = self.env.read_txn()?;
        get_decoded(&self.documents, &rtxn, &document_key(tenant_id, document_id))
    }

    pub fn list_documents(&self, tenant_id: &str) -> Result<Vec<Document>, LedgerStoreError> {
        let prefix = format!("{tenant_id}/");
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.documents.prefix_iter(&rtxn, &prefix)? {
            let (_, raw) = entry?;
            out.push(decode::<Document>(raw)?);
        }
        Ok(out)
    }

    /// Conditional status transition. Returns the updated document when the
    /// current status matched one of `expected`, `None` when another writer
    /// got there first, and an error when the document does not exist.
    pub fn transition_document(
        &self,
        tenant_id: &str,
        document_id: &str,
        expected: &[DocumentStatus],
        next: DocumentStatus,
    ) -> Result<Option<Document>, LedgerStoreError> {
        let key = document_key(tenant_id, document_id);
        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .documents
            .get(&wtxn, &key)?
            .ok_or_else(|| LedgerStoreError::DocumentNotFound(document_id.to_string()))?;
        let mut document: Document = decode(raw)?;
        if !expected.contains(&document.status) {
            debug!(
                document_id,
                status = document.status.as_ref(),
                requested = next.as_ref(),
                "status guard rejected transition"
            );
            return Ok(None);
        }
        document.status = next;
        document.updated_at_ms = now_ms();
        put_encoded(&self.documents, &mut wtxn, &key, &document)?;
        wtxn.commit()?;
        Ok(Some(document))
    }

    /// Move a `processing` document to `extracted` and copy the OCR summary
    /// onto it in the same transaction. Guard miss returns `None`.
    pub fn complete_extraction(
        &self,
        tenant_id: &str,
        document_id: &str,
        summary: &DocumentSummary,
    ) -> Result<Option<Document>, LedgerStoreError> {
        let key = document_key(tenant_id, document_id);
        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .documents
            .get(&wtxn, &key)?
            .ok_or_else(|| LedgerStoreError::DocumentNotFound(document_id.to_string()))?;
        let mut document: Document = decode(raw)?;
        if document.status != DocumentStatus::Processing {
            return Ok(None);
        }
        document.status = DocumentStatus::Extracted;
        document.document_type = summary.document_type.clone();
        document.document_date = summary.document_date;
        document.amount = summary.amount;
        document.tax_amount = summary.tax_amount;
        document.registration_number = summary.registration_number.clone();
        document.updated_at_ms = now_ms();
        put_encoded(&self.documents, &mut wtxn, &key, &document)?;
        wtxn.commit()?;
        Ok(Some(document))
    }

    // --- extraction snapshots (append-only) ------------------------------

    pub fn append_extraction(&self, record: &ExtractionRecord) -> Result<(), LedgerStoreError> {
        let key = timeline_key(
            &record.tenant_id,
            &record.document_id,
            record.created_at_ms,
            &record.id,
        );
        let mut wtxn = self.env.write_txn()?;
        put_encoded(&self.extractions, &mut wtxn, &key, record)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn latest_extraction(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Option<ExtractionRecord>, LedgerStoreError> {
        let prefix = format!("{tenant_id}/{document_id}/");
        let rtxn = self.env.read_txn()?;
        let mut latest = None;
        for entry in self.extractions.prefix_iter(&rtxn, &prefix)? {
            let (_, raw) = entry?;
            latest = Some(decode::<ExtractionRecord>(raw)?);
        }
        Ok(latest)
    }

    // --- invoice checks (append-only) ------------------------------------

    pub fn append_invoice_check(&self, check: &InvoiceCheck) -> Result<(), LedgerStoreError> {
        let key = timeline_key(
            &check.tenant_id,
            &check.document_id,
            check.created_at_ms,
            &check.id,
        );
        let mut wtxn = self.env.write_txn()?;
        put_encoded(&self.invoice_checks, &mut wtxn, &key, check)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn latest_invoice_check(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Option<InvoiceCheck>, LedgerStoreError> {
        let prefix = format!("{tenant_id}/{document_id}/");
        let rtxn = self.env.read_txn()?;
        let mut latest = None;
        for entry in self.invoice_checks.prefix_iter(&rtxn, &prefix)? {
            let (_, raw) = entry?;
            latest = Some(decode::<InvoiceCheck>(raw)?);
        }
        Ok(latest)
    }

    // --- journal drafts --------------------------------------------------

    pub fn put_draft(&self, draft: &JournalDraft) -> Result<(), LedgerStoreError> {
        let mut wtxn = self.env.write_txn()?;
        put_encoded(
            &self.drafts,
            &mut wtxn,
            &document_key(&draft.tenant_id, &draft.id),
            draft,
        )?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_draft(
        &self,
        tenant_id: &str,
        draft_id: &str,
    ) -> Result<Option<JournalDraft>, LedgerStoreError> {
        let rtxn = self.env.read_txn()?;
        get_decoded(&self.drafts, &rtxn, &document_key(tenant_id, draft_id))
    }

    pub fn latest_draft_for_document(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Option<JournalDraft>, LedgerStoreError> {
        let prefix = format!("{tenant_id}/");
        let rtxn = self.env.read_txn()?;
        let mut latest: Option<JournalDraft> = None;
        for entry in self.drafts.prefix_iter(&rtxn, &prefix)? {
            let (_, raw) = entry?;
            let draft: JournalDraft = decode(raw)?;
            if draft.document_id != document_id {
                continue;
            }
            if latest
                .as_ref()
                .is_none_or(|best| draft.created_at_ms >= best.created_at_ms)
            {
                latest = Some(draft);
            }
        }
        Ok(latest)
    }

    /// Confirm a draft at most once. The guard accepts `suggested` and
    /// `needs_review`; a draft already confirmed (or errored) loses the race
    /// and returns `None`.
    pub fn confirm_draft(
        &self,
        tenant_id: &str,
        draft_id: &str,
        selected_index: usize,
        confirmed_by: &str,
    ) -> Result<Option<JournalDraft>, LedgerStoreError> {
        let key = document_key(tenant_id, draft_id);
        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .drafts
            .get(&wtxn, &key)?
            .ok_or_else(|| LedgerStoreError::DraftNotFound(draft_id.to_string()))?;
        let mut draft: JournalDraft = decode(raw)?;
        if !matches!(
            draft.status,
            DraftStatus::Suggested | DraftStatus::NeedsReview
        ) {
            return Ok(None);
        }
        let now = now_ms();
        draft.status = DraftStatus::Confirmed;
        draft.selected_index = Some(selected_index);
        draft.confirmed_by = Some(confirmed_by.to_string());
        draft.confirmed_at_ms = Some(now);
        draft.updated_at_ms = now;
        put_encoded(&self.drafts, &mut wtxn, &key, &draft)?;
        wtxn.commit()?;
        Ok(Some(draft))
    }

    // --- journal entries -------------------------------------------------

    /// Write the confirmed entry and its lines atomically.
    pub fn insert_journal_entry(
        &self,
        entry: &JournalEntry,
        lines: &[JournalLine],
    ) -> Result<(), LedgerStoreError> {
        let mut wtxn = self.env.write_txn()?;
        put_encoded(
            &self.entries,
            &mut wtxn,
            &document_key(&entry.tenant_id, &entry.id),
            entry,
        )?;
        for line in lines {
            put_encoded(
                &self.lines,
                &mut wtxn,
                &line_key(&line.tenant_id, &line.journal_entry_id, line.line_no),
                line,
            )?;
        }
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_journal_entry(
        &self,
        tenant_id: &str,
        entry_id: &str,
    ) -> Result<Option<JournalEntry>, LedgerStoreError> {
        let rtxn = self.env.read_txn()?;
        get_decoded(&self.entries, &rtxn, &document_key(tenant_id, entry_id))
    }

    pub fn list_journal_lines(
        &self,
        tenant_id: &str,
        entry_id: &str,
    ) -> Result<Vec<JournalLine>, LedgerStoreError> {
        let prefix = format!("{tenant_id}/{entry_id}/");
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.lines.prefix_iter(&rtxn, &prefix)? {
            let (_, raw) = entry?;
            out.push(decode::<JournalLine>(raw)?);
        }
        Ok(out)
    }

    /// Remove an entry and its lines; compensation path for a failed
    /// confirmation.
    pub fn delete_journal_entry(
        &self,
        tenant_id: &str,
        entry_id: &str,
    ) -> Result<(), LedgerStoreError> {
        let prefix = format!("{tenant_id}/{entry_id}/");
        let mut wtxn = self.env.write_txn()?;
        self.entries
            .delete(&mut wtxn, &document_key(tenant_id, entry_id))?;
        let keys: Vec<String> = {
            let mut keys = Vec::new();
            for entry in self.lines.prefix_iter(&wtxn, &prefix)? {
                let (key, _) = entry?;
                keys.push(key.to_string());
            }
            keys
        };
        for key in keys {
            self.lines.delete(&mut wtxn, &key)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    // --- chart of accounts -----------------------------------------------

    pub fn upsert_account(&self, account: &Account) -> Result<(), LedgerStoreError> {
        let mut wtxn = self.env.write_txn()?;
        put_encoded(
            &self.accounts,
            &mut wtxn,
            &document_key(&account.tenant_id, &account.code),
            account,
        )?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_account(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Option<Account>, LedgerStoreError> {
        let rtxn = self.env.read_txn()?;
        get_decoded(&self.accounts, &rtxn, &document_key(tenant_id, code))
    }

    pub fn list_active_accounts(&self, tenant_id: &str) -> Result<Vec<Account>, LedgerStoreError> {
        let prefix = format!("{tenant_id}/");
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.accounts.prefix_iter(&rtxn, &prefix)? {
            let (_, raw) = entry?;
            let account: Account = decode(raw)?;
            if account.is_active {
                out.push(account);
            }
        }
        Ok(out)
    }

    // --- tenant settings -------------------------------------------------

    /// Thresholds for the tenant, falling back to the built-in defaults when
    /// the tenant has never customized them.
    pub fn tenant_settings(&self, tenant_id: &str) -> Result<TenantSettings, LedgerStoreError> {
        let rtxn = self.env.read_txn()?;
        let stored = get_decoded::<TenantSettings>(&self.settings, &rtxn, tenant_id)?;
        Ok(stored.unwrap_or_else(|| TenantSettings::defaults_for(tenant_id)))
    }

    pub fn put_tenant_settings(&self, settings: &TenantSettings) -> Result<(), LedgerStoreError> {
        let mut wtxn = self.env.write_txn()?;
        put_encoded(&self.settings, &mut wtxn, &settings.tenant_id, settings)?;
        wtxn.commit()?;
        Ok(())
    }

    // --- feedback (append-only) ------------------------------------------

    pub fn append_feedback(&self, event: &FeedbackEvent) -> Result<(), LedgerStoreError> {
        let key = format!("{}/{:020}/{}", event.tenant_id, event.created_at_ms, event.id);
        let mut wtxn = self.env.write_txn()?;
        put_encoded(&self.feedback, &mut wtxn, &key, event)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Most recent corrections for a vendor, newest first, capped at `limit`.
    pub fn recent_feedback_for_vendor(
        &self,
        tenant_id: &str,
        vendor_name: &str,
        limit: usize,
    ) -> Result<Vec<FeedbackEvent>, LedgerStoreError> {
        let prefix = format!("{tenant_id}/");
        let rtxn = self.env.read_txn()?;
        let mut matched = Vec::new();
        for entry in self.feedback.prefix_iter(&rtxn, &prefix)? {
            let (_, raw) = entry?;
            let event: FeedbackEvent = decode(raw)?;
            if event
                .user_correction
                .vendor_name
                .as_deref()
                .is_some_and(|v| v == vendor_name)
            {
                matched.push(event);
            }
        }
        matched.reverse();
        matched.truncate(limit);
        Ok(matched)
    }

    /// Most recent corrections across the whole tenant, newest first.
    pub fn recent_feedback(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<FeedbackEvent>, LedgerStoreError> {
        let prefix = format!("{tenant_id}/");
        let rtxn = self.env.read_txn()?;
        let mut events = Vec::new();
        for entry in self.feedback.prefix_iter(&rtxn, &prefix)? {
            let (_, raw) = entry?;
            events.push(decode::<FeedbackEvent>(raw)?);
        }
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CandidateLine, JournalCandidate, UserCorrection};
    use tempfile::TempDir;

    fn open_store() -> (TempDir, LedgerStore) {
        let dir = TempDir::new().expect("tempdir");
        let paths = AppPaths::new(dir.path()).expect("paths");
        let store = LedgerStore::open(&paths).expect("open store");
        (dir, store)
    }

    fn uploaded_doc(tenant: &str) -> Document {
        Document::new_uploaded(
            tenant,
            "invoice.pdf",
            "documents",
            &format!("{tenant}/invoice.pdf"),
            "hash",
            "application/pdf",
        )
    }

    fn draft_for(tenant: &str, document_id: &str, status: DraftStatus) -> JournalDraft {
        let now = now_ms();
        JournalDraft {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant.to_string(),
            document_id: document_id.to_string(),
            status,
            candidates: vec![JournalCandidate {
                lines: vec![
                    CandidateLine {
                        account_code: "5100".to_string(),
                        account_name: "仕入高".to_string(),
                        debit: 11_000.0,
                        credit: 0.0,
                        tax_code: None,
                        memo: String::new(),
                    },
                    CandidateLine {
                        account_code: "2100".to_string(),
                        account_name: "買掛金".to_string(),
                        debit: 0.0,
                        credit: 11_000.0,
                        tax_code: None,
                        memo: String::new(),
                    },
                ],
                description: "仕入".to_string(),
                reasoning: String::new(),
                confidence: 0.9,
            }],
            confidence: Some(0.9),
            ai_reason: None,
            model_version: "test".to_string(),
            selected_index: None,
            confirmed_by: None,
            confirmed_at_ms: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    #[test]
    fn transition_guard_rejects_stale_writers() {
        let (_dir, store) = open_store();
        let doc = uploaded_doc("tenant-a");
        store.put_document(&doc).expect("put");

        let queued = store
            .transition_document(
                "tenant-a",
                &doc.id,
                &[DocumentStatus::Uploaded],
                DocumentStatus::Queued,
            )
            .expect("transition");
        assert_eq!(queued.expect("guard matched").status, DocumentStatus::Queued);

        // Second writer still expecting `uploaded` loses.
        let stale = store
            .transition_document(
                "tenant-a",
                &doc.id,
                &[DocumentStatus::Uploaded],
                DocumentStatus::Queued,
            )
            .expect("transition");
        assert!(stale.is_none());

        let err = store
            .transition_document(
                "tenant-a",
                "no-such-doc",
                &[DocumentStatus::Uploaded],
                DocumentStatus::Queued,
            )
            .expect_err("missing document");
        assert!(matches!(err, LedgerStoreError::DocumentNotFound(_)));
    }

    #[test]
    fn complete_extraction_requires_processing_status() {
        let (_dir, store) = open_store();
        let doc = uploaded_doc("tenant-a");
        store.put_document(&doc).expect("put");

        let summary = DocumentSummary {
            document_type: Some("invoice".to_string()),
            amount: Some(11_000.0),
            ..DocumentSummary::default()
        };
        // Not yet processing: guard miss.
        assert!(
            store
                .complete_extraction("tenant-a", &doc.id, &summary)
                .expect("call")
                .is_none()
        );

        store
            .transition_document(
                "tenant-a",
                &doc.id,
                &[DocumentStatus::Uploaded],
                DocumentStatus::Processing,
            )
            .expect("transition");
        let updated = store
            .complete_extraction("tenant-a", &doc.id, &summary)
            .expect("call")
            .expect("guard matched");
        assert_eq!(updated.status, DocumentStatus::Extracted);
        assert_eq!(updated.amount, Some(11_000.0));
        assert_eq!(updated.document_type.as_deref(), Some("invoice"));
    }

    #[test]
    fn latest_extraction_returns_newest_snapshot() {
        let (_dir, store) = open_store();
        let payload = crate::model::ExtractionPayload {
            structured: Default::default(),
            classification: crate::services::ClassificationResult {
                document_type: "invoice".to_string(),
                confidence: 0.9,
                method: "rule".to_string(),
                reasoning: String::new(),
            },
            duplicate_suspects: Vec::new(),
        };
        for (i, created) in [1_000_i64, 2_000, 3_000].iter().enumerate() {
            store
                .append_extraction(&ExtractionRecord {
                    id: format!("ex-{i}"),
                    tenant_id: "tenant-a".to_string(),
                    document_id: "doc-1".to_string(),
                    payload: payload.clone(),
                    model_provider: "azure-di".to_string(),
                    model_name: "prebuilt-invoice".to_string(),
                    model_version: "2024-11-30".to_string(),
                    confidence: 0.5 + i as f64 * 0.1,
                    created_at_ms: *created,
                })
                .expect("append");
        }
        let latest = store
            .latest_extraction("tenant-a", "doc-1")
            .expect("read")
            .expect("present");
        assert_eq!(latest.id, "ex-2");
        assert!(
            store
                .latest_extraction("tenant-a", "doc-other")
                .expect("read")
                .is_none()
        );
    }

    #[test]
    fn confirm_draft_has_a_single_winner() {
        let (_dir, store) = open_store();
        let draft = draft_for("tenant-a", "doc-1", DraftStatus::Suggested);
        store.put_draft(&draft).expect("put");

        let won = store
            .confirm_draft("tenant-a", &draft.id, 0, "user-1")
            .expect("call")
            .expect("first confirm wins");
        assert_eq!(won.status, DraftStatus::Confirmed);
        assert_eq!(won.selected_index, Some(0));
        assert_eq!(won.confirmed_by.as_deref(), Some("user-1"));

        let lost = store
            .confirm_draft("tenant-a", &draft.id, 1, "user-2")
            .expect("call");
        assert!(lost.is_none());

        // Persisted state keeps the winner's selection.
        let stored = store
            .get_draft("tenant-a", &draft.id)
            .expect("read")
            .expect("present");
        assert_eq!(stored.confirmed_by.as_deref(), Some("user-1"));
    }

    #[test]
    fn journal_entry_and_lines_delete_together() {
        let (_dir, store) = open_store();
        let entry = JournalEntry {
            id: "entry-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            entry_date: chrono::NaiveDate::from_ymd_opt(2025, 1, 15).expect("date"),
            description: "仕入".to_string(),
            source_document_id: "doc-1".to_string(),
            journal_draft_id: "draft-1".to_string(),
            total_amount: 11_000.0,
            tax_amount: 1_000.0,
            confirmed_by: "user-1".to_string(),
            confirmed_at_ms: now_ms(),
        };
        let lines = vec![
            JournalLine {
                tenant_id: "tenant-a".to_string(),
                journal_entry_id: "entry-1".to_string(),
                line_no: 1,
                account_code: "5100".to_string(),
                account_name: "仕入高".to_string(),
                debit: 11_000.0,
                credit: 0.0,
                tax_code: None,
                memo: String::new(),
            },
            JournalLine {
                tenant_id: "tenant-a".to_string(),
                journal_entry_id: "entry-1".to_string(),
                line_no: 2,
                account_code: "2100".to_string(),
                account_name: "買掛金".to_string(),
                debit: 0.0,
                credit: 11_000.0,
                tax_code: None,
                memo: String::new(),
            },
        ];
        store.insert_journal_entry(&entry, &lines).expect("insert");
        assert_eq!(
            store
                .list_journal_lines("tenant-a", "entry-1")
                .expect("read")
                .len(),
            2
        );

        store
            .delete_journal_entry("tenant-a", "entry-1")
            .expect("delete");
        assert!(
            store
                .get_journal_entry("tenant-a", "entry-1")
                .expect("read")
                .is_none()
        );
        assert!(
            store
                .list_journal_lines("tenant-a", "entry-1")
                .expect("read")
                .is_empty()
        );
    }

    #[test]
    fn tenant_settings_fall_back_to_defaults() {
        let (_dir, store) = open_store();
        let defaults = store.tenant_settings("tenant-a").expect("read");
        assert_eq!(defaults.auto_confirm_high, 0.90);
        assert_eq!(defaults.auto_confirm_mid, 0.70);

        store
            .put_tenant_settings(&TenantSettings {
                tenant_id: "tenant-a".to_string(),
                auto_confirm_high: 0.95,
                auto_confirm_mid: 0.80,
            })
            .expect("write");
        let stored = store.tenant_settings("tenant-a").expect("read");
        assert_eq!(stored.auto_confirm_high, 0.95);
    }

    #[test]
    fn feedback_filters_by_vendor_newest_first() {
        let (_dir, store) = open_store();
        for (i, vendor) in ["A商事", "B物産", "A商事"].iter().enumerate() {
            store
                .append_feedback(&FeedbackEvent {
                    id: format!("fb-{i}"),
                    tenant_id: "tenant-a".to_string(),
                    user_id: Some("user-1".to_string()),
                    entity_type: "journal_draft".to_string(),
                    entity_id: format!("draft-{i}"),
                    ai_output: Vec::new(),
                    user_correction: UserCorrection {
                        selected_index: 0,
                        override_applied: false,
                        override_reason: None,
                        final_lines: Vec::new(),
                        final_description: String::new(),
                        vendor_name: Some(vendor.to_string()),
                    },
                    created_at_ms: 1_000 + i as i64,
                })
                .expect("append");
        }
        let recent = store
            .recent_feedback_for_vendor("tenant-a", "A商事", 5)
            .expect("read");
        let ids: Vec<&str> = recent.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["fb-2", "fb-0"]);

        let capped = store
            .recent_feedback_for_vendor("tenant-a", "A商事", 1)
            .expect("read");
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, "fb-2");
    }
}
