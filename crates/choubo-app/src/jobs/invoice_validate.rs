//! Light pipeline stage: check the latest extraction against the Japan
//! qualified-invoice requirements and record a compliance verdict.
//!
//! Hard requirements (missing means `ng`): vendor name, issue date, and
//! total amount. Soft checks (`needs_review`): registration number, line
//! item descriptions, per-rate tax breakdown, and tax amount. An `ng`
//! verdict is terminal; journal suggestion only follows `ok` and
//! `needs_review`.

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::jobs::JobError;
use crate::model::{CheckReason, CheckSeverity, CheckStatus, InvoiceCheck, now_ms};
use crate::queue::{JobKind, QueueJob};
use crate::services::metrics::INVOICE_VALIDATE_SUCCESS;
use crate::services::structuring::{StructuredExtraction, is_valid_registration_number};

pub async fn run(ctx: &AppContext, job: &QueueJob) -> Result<(), JobError> {
    let tenant_id = &job.tenant_id;
    let document_id = &job.document_id;

    let extraction = ctx
        .store
        .latest_extraction(tenant_id, document_id)?
        .ok_or_else(|| JobError::MissingExtraction(document_id.clone()))?;

    let reasons = evaluate(&extraction.payload.structured);
    let status = aggregate_status(&reasons);

    let check = InvoiceCheck {
        id: Uuid::new_v4().to_string(),
        tenant_id: tenant_id.clone(),
        document_id: document_id.clone(),
        status,
        reasons,
        created_at_ms: now_ms(),
    };
    ctx.store.append_invoice_check(&check)?;
    ctx.metrics.emit(
        INVOICE_VALIDATE_SUCCESS,
        1.0,
        json!({
            "tenant_id": tenant_id,
            "document_id": document_id,
            "status": status.as_ref(),
        }),
    );
    info!(document_id, status = status.as_ref(), "invoice check recorded");

    // Journal suggestion follows for ledger-relevant documents, but an `ng`
    // verdict is terminal: it needs a human before any entry is proposed.
    let document_type = extraction.payload.classification.document_type.as_str();
    let verdict_allows_chain = matches!(status, CheckStatus::Ok | CheckStatus::NeedsReview);
    if verdict_allows_chain && matches!(document_type, "invoice" | "receipt") {
        if let Err(err) = ctx
            .queue
            .enqueue(JobKind::JournalSuggest, tenant_id, document_id)
        {
            warn!(document_id, error = %err, "failed to enqueue journal suggestion");
        }
    } else if !verdict_allows_chain {
        info!(document_id, "skipping journal suggestion: invoice check is ng");
    }
    Ok(())
}

fn ng(field: &str, message: &str) -> CheckReason {
    CheckReason {
        field: field.to_string(),
        severity: CheckSeverity::Ng,
        message: message.to_string(),
    }
}

fn review(field: &str, message: &str) -> CheckReason {
    CheckReason {
        field: field.to_string(),
        severity: CheckSeverity::NeedsReview,
        message: message.to_string(),
    }
}

pub fn evaluate(structured: &StructuredExtraction) -> Vec<CheckReason> {
    let mut reasons = Vec::new();

    if structured
        .vendor_name
        .as_deref()
        .is_none_or(|v| v.trim().is_empty())
    {
        reasons.push(ng("vendor_name", "発行者名称が未記載です"));
    }

    match structured.vendor_registration_number.as_deref() {
        None => reasons.push(review(
            "vendor_registration_number",
            "登録番号が未記載です",
        )),
        Some(value) if !is_valid_registration_number(value) => reasons.push(review(
            "vendor_registration_number",
            "登録番号の形式が不正です (T+13桁)",
        )),
        Some(_) => {}
    }

    if structured.document_date.is_none() {
        reasons.push(ng("document_date", "取引年月日が未記載です"));
    }

    let all_descriptions_blank = structured
        .line_items
        .iter()
        .all(|item| item.description.trim().is_empty());
    if structured.line_items.is_empty() || all_descriptions_blank {
        reasons.push(review("line_items", "取引内容（明細）が未記載です"));
    }

    if structured.tax_details.is_empty() {
        reasons.push(review("tax_details", "税率区分別対価が未記載です"));
    }

    if structured.tax_amount.is_none() {
        reasons.push(review("tax_amount", "消費税額が未記載です"));
    }

    if structured.total_amount.is_none() {
        reasons.push(ng("total_amount", "合計金額が未記載です"));
    }

    reasons
}

pub fn aggregate_status(reasons: &[CheckReason]) -> CheckStatus {
    if reasons.iter().any(|r| r.severity == CheckSeverity::Ng) {
        CheckStatus::Ng
    } else if reasons
        .iter()
        .any(|r| r.severity == CheckSeverity::NeedsReview)
    {
        CheckStatus::NeedsReview
    } else {
        CheckStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::structuring::{LineItem, TaxDetail};

    fn compliant() -> StructuredExtraction {
        StructuredExtraction {
            vendor_name: Some("A商事株式会社".to_string()),
            vendor_registration_number: Some("T1234567890123".to_string()),
            document_date: Some("2025-01-15".to_string()),
            subtotal: Some(10_000.0),
            tax_amount: Some(1_000.0),
            total_amount: Some(11_000.0),
            tax_details: vec![TaxDetail {
                rate: Some(10.0),
                taxable_amount: Some(10_000.0),
                tax_amount: Some(1_000.0),
            }],
            line_items: vec![LineItem {
                description: "事務用品".to_string(),
                quantity: Some(1.0),
                unit_price: Some(10_000.0),
                amount: 10_000.0,
                tax_rate: Some(10.0),
            }],
            ..StructuredExtraction::default()
        }
    }

    #[test]
    fn compliant_invoice_passes() {
        let reasons = evaluate(&compliant());
        assert!(reasons.is_empty());
        assert_eq!(aggregate_status(&reasons), CheckStatus::Ok);
    }

    #[test]
    fn missing_vendor_name_is_ng() {
        let mut structured = compliant();
        structured.vendor_name = None;
        let reasons = evaluate(&structured);
        assert_eq!(aggregate_status(&reasons), CheckStatus::Ng);
        assert_eq!(reasons[0].field, "vendor_name");
        assert_eq!(reasons[0].severity, CheckSeverity::Ng);
    }

    #[test]
    fn blank_vendor_name_is_ng() {
        let mut structured = compliant();
        structured.vendor_name = Some("   ".to_string());
        assert_eq!(aggregate_status(&evaluate(&structured)), CheckStatus::Ng);
    }

    #[test]
    fn missing_registration_number_needs_review() {
        let mut structured = compliant();
        structured.vendor_registration_number = None;
        let reasons = evaluate(&structured);
        assert_eq!(aggregate_status(&reasons), CheckStatus::NeedsReview);
        assert_eq!(reasons[0].field, "vendor_registration_number");
        assert_eq!(reasons[0].severity, CheckSeverity::NeedsReview);
    }

    #[test]
    fn malformed_registration_number_needs_review() {
        let mut structured = compliant();
        structured.vendor_registration_number = Some("T123".to_string());
        let reasons = evaluate(&structured);
        assert_eq!(aggregate_status(&reasons), CheckStatus::NeedsReview);
        assert_eq!(reasons[0].severity, CheckSeverity::NeedsReview);
    }

    #[test]
    fn missing_date_is_ng() {
        let mut structured = compliant();
        structured.document_date = None;
        assert_eq!(aggregate_status(&evaluate(&structured)), CheckStatus::Ng);
    }

    #[test]
    fn empty_line_items_need_review() {
        let mut structured = compliant();
        structured.line_items.clear();
        let reasons = evaluate(&structured);
        assert_eq!(aggregate_status(&reasons), CheckStatus::NeedsReview);
        assert_eq!(reasons[0].field, "line_items");
    }

    #[test]
    fn blank_line_descriptions_need_review() {
        let mut structured = compliant();
        structured.line_items[0].description = "  ".to_string();
        let reasons = evaluate(&structured);
        assert!(reasons.iter().any(|r| r.field == "line_items"));
    }

    #[test]
    fn missing_tax_breakdown_needs_review() {
        let mut structured = compliant();
        structured.tax_details.clear();
        let reasons = evaluate(&structured);
        assert_eq!(aggregate_status(&reasons), CheckStatus::NeedsReview);
        assert_eq!(reasons[0].field, "tax_details");
    }

    #[test]
    fn missing_tax_amount_needs_review() {
        let mut structured = compliant();
        structured.tax_amount = None;
        let reasons = evaluate(&structured);
        assert_eq!(aggregate_status(&reasons), CheckStatus::NeedsReview);
        assert_eq!(reasons[0].field, "tax_amount");
    }

    #[test]
    fn missing_total_is_ng() {
        let mut structured = compliant();
        structured.total_amount = None;
        let reasons = evaluate(&structured);
        assert_eq!(aggregate_status(&reasons), CheckStatus::Ng);
        assert_eq!(reasons[0].field, "total_amount");
    }

    #[test]
    fn ng_outranks_needs_review() {
        let mut structured = compliant();
        structured.vendor_name = None;
        structured.tax_details.clear();
        assert_eq!(aggregate_status(&evaluate(&structured)), CheckStatus::Ng);
    }
}
