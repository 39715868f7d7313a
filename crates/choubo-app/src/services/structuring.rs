//! Pure mapping from raw analysis output to the normalized extraction record.
//!
//! Performs no I/O and cannot fail: any input, including empty OCR output,
//! produces a best-effort record with nulls for whatever could not be read.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::services::di_client::{DiAnalyzeResult, DiField};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxDetail {
    pub rate: Option<f64>,
    pub taxable_amount: Option<f64>,
    pub tax_amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
    pub amount: f64,
    pub tax_rate: Option<f64>,
}

/// Normalized structured extraction, one per parse attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredExtraction {
    pub vendor_name: Option<String>,
    pub vendor_address: Option<String>,
    pub vendor_registration_number: Option<String>,
    pub customer_name: Option<String>,
    pub document_date: Option<String>,
    pub due_date: Option<String>,
    pub invoice_number: Option<String>,
    pub subtotal: Option<f64>,
    pub tax_amount: Option<f64>,
    pub total_amount: Option<f64>,
    #[serde(default)]
    pub tax_details: Vec<TaxDetail>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    pub raw_text: String,
    pub confidence: f64,
}

fn get_string(field: Option<&DiField>) -> Option<String> {
    let field = field?;
    field
        .value_string
        .clone()
        .or_else(|| field.content.clone())
        .filter(|s| !s.is_empty())
}

fn get_number(field: Option<&DiField>) -> Option<f64> {
    let field = field?;
    if let Some(currency) = &field.value_currency {
        return Some(currency.amount);
    }
    if let Some(number) = field.value_number {
        return Some(number);
    }
    parse_loose_number(field.content.as_deref()?)
}

fn get_date(field: Option<&DiField>) -> Option<String> {
    let field = field?;
    if let Some(date) = &field.value_date {
        return Some(date.clone());
    }
    normalize_date_string(field.content.as_deref()?)
}

/// Strip everything but digits, sign, and decimal point before parsing.
/// Unparseable values yield `None`, never NaN.
pub fn parse_loose_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    let value: f64 = cleaned.parse().ok()?;
    if value.is_finite() { Some(value) } else { None }
}

fn reiwa_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"令和\s*(\d+)\s*年\s*(\d+)\s*月\s*(\d+)\s*日").expect("valid regex")
    })
}

fn western_kanji_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d{4})\s*年\s*(\d{1,2})\s*月\s*(\d{1,2})\s*日").expect("valid regex")
    })
}

fn slash_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{4})[/\-](\d{1,2})[/\-](\d{1,2})").expect("valid regex"))
}

/// Normalize the date shapes seen on Japanese documents to `YYYY-MM-DD`:
/// Reiwa-era dates (offset +2018), `YYYY年M月D日`, and `YYYY/M/D` or
/// `YYYY-M-D`. Unrecognized shapes yield `None`.
pub fn normalize_date_string(raw: &str) -> Option<String> {
    if let Some(caps) = reiwa_regex().captures(raw) {
        let era_year: i32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let day: u32 = caps[3].parse().ok()?;
        return Some(format!("{}-{month:02}-{day:02}", 2018 + era_year));
    }

    if let Some(caps) = western_kanji_regex().captures(raw) {
        let month: u32 = caps[2].parse().ok()?;
        let day: u32 = caps[3].parse().ok()?;
        return Some(format!("{}-{month:02}-{day:02}", &caps[1]));
    }

    if let Some(caps) = slash_regex().captures(raw) {
        let month: u32 = caps[2].parse().ok()?;
        let day: u32 = caps[3].parse().ok()?;
        return Some(format!("{}-{month:02}-{day:02}", &caps[1]));
    }

    None
}

fn registration_number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"T\d{13}").expect("valid regex"))
}

/// Scan free text for a Japan invoice registration number (`T` + 13 digits).
pub fn extract_registration_number(text: &str) -> Option<String> {
    registration_number_regex()
        .find(text)
        .map(|m| m.as_str().to_string())
}

/// Matches a complete, well-formed registration number.
pub fn is_valid_registration_number(value: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^T\d{13}$").expect("valid regex"))
        .is_match(value)
}

fn structure_tax_details(field: Option<&DiField>) -> Vec<TaxDetail> {
    let Some(field) = field else {
        return Vec::new();
    };
    field
        .value_array
        .iter()
        .map(|entry| {
            let obj = &entry.value_object;
            TaxDetail {
                rate: get_number(obj.get("Rate")),
                taxable_amount: get_number(obj.get("NetAmount")),
                tax_amount: get_number(obj.get("Amount")),
            }
        })
        .collect()
}

/// Convert an analysis result into the normalized extraction record.
pub fn structure(result: &DiAnalyzeResult) -> StructuredExtraction {
    let fields = &result.fields;

    let line_items = result
        .items
        .iter()
        .map(|item| LineItem {
            description: get_string(item.get("Description")).unwrap_or_default(),
            quantity: get_number(item.get("Quantity")),
            unit_price: get_number(item.get("UnitPrice")),
            amount: get_number(item.get("Amount")).unwrap_or(0.0),
            tax_rate: get_number(item.get("Tax")),
        })
        .collect();

    StructuredExtraction {
        vendor_name: get_string(fields.get("VendorName")),
        vendor_address: get_string(fields.get("VendorAddress"))
            .or_else(|| get_string(fields.get("VendorAddressRecipient"))),
        vendor_registration_number: get_string(fields.get("VendorTaxId"))
            .or_else(|| extract_registration_number(&result.content)),
        customer_name: get_string(fields.get("CustomerName")),
        document_date: get_date(fields.get("InvoiceDate")),
        due_date: get_date(fields.get("DueDate")),
        invoice_number: get_string(fields.get("InvoiceId")),
        subtotal: get_number(fields.get("SubTotal")),
        tax_amount: get_number(fields.get("TotalTax")),
        total_amount: get_number(fields.get("InvoiceTotal")),
        tax_details: structure_tax_details(fields.get("TaxDetails")),
        line_items,
        raw_text: result.content.clone(),
        confidence: result.confidence,
    }
}
