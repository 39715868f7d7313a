//! Heuristic duplicate detection over already-processed documents of the
//! same tenant: identical amount, document date within three days.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::model::{Document, DocumentStatus};

const DATE_WINDOW_DAYS: u64 = 3;
const MAX_SUSPECTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateSuspect {
    pub document_id: String,
    pub file_name: String,
    pub document_date: Option<NaiveDate>,
    pub amount: Option<f64>,
    pub match_reason: String,
}

fn within_window(a: NaiveDate, b: NaiveDate) -> bool {
    let low = a.checked_sub_days(Days::new(DATE_WINDOW_DAYS));
    let high = a.checked_add_days(Days::new(DATE_WINDOW_DAYS));
    match (low, high) {
        (Some(low), Some(high)) => b >= low && b <= high,
        _ => false,
    }
}

/// Scan `candidates` for suspected duplicates of the target document.
/// Returns empty when the target has no date or no amount: without both
/// there is nothing meaningful to match on.
pub fn find_duplicates(
    target_id: &str,
    target_date: Option<NaiveDate>,
    target_amount: Option<f64>,
    candidates: &[Document],
) -> Vec<DuplicateSuspect> {
    let (Some(date), Some(amount)) = (target_date, target_amount) else {
        return Vec::new();
    };

    candidates
        .iter()
        .filter(|doc| doc.id != target_id)
        .filter(|doc| {
            matches!(
                doc.status,
                DocumentStatus::Extracted | DocumentStatus::Verified
            )
        })
        .filter(|doc| doc.amount == Some(amount))
        .filter(|doc| doc.document_date.is_some_and(|d| within_window(date, d)))
        .take(MAX_SUSPECTS)
        .map(|doc| DuplicateSuspect {
            document_id: doc.id.clone(),
            file_name: doc.file_name.clone(),
            document_date: doc.document_date,
            amount: doc.amount,
            match_reason: "date_amount".to_string(),
        })
        .collect()
}
