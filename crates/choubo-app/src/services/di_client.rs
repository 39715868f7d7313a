//! Document-analysis (OCR) provider client.
//!
//! Submits a document for analysis, polls the returned operation handle, and
//! maps the provider's loosely-typed field tree into a generic field/array
//! structure. Transport-level 429/5xx responses are retried with exponential
//! backoff, deferring to the provider's `Retry-After` header when present;
//! everything else propagates to the caller so the outer queue's retry policy
//! can take over.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const API_VERSION: &str = "2024-11-30";
const POLL_INTERVAL: Duration = Duration::from_millis(2_500);
const MAX_POLL_ATTEMPTS: usize = 100;
const MAX_TRANSPORT_RETRIES: usize = 5;
const BACKOFF_MS: [u64; 5] = [2_000, 4_000, 8_000, 16_000, 32_000];

/// Analysis models offered by the provider. `PrebuiltInvoice` is the
/// invoice-specialized model; `PrebuiltRead` is generic OCR used as the
/// one-shot escalation when invoice confidence is low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiModel {
    PrebuiltInvoice,
    PrebuiltRead,
}

impl DiModel {
    pub fn as_str(self) -> &'static str {
        match self {
            DiModel::PrebuiltInvoice => "prebuilt-invoice",
            DiModel::PrebuiltRead => "prebuilt-read",
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DiCurrency {
    pub amount: f64,
    pub currency_code: Option<String>,
}

/// One provider field, decoded best-effort: every representation the provider
/// may use (typed value, free-text content, nested arrays/objects) is carried
/// as an optional member with a default.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DiField {
    pub content: Option<String>,
    pub confidence: f64,
    pub value_string: Option<String>,
    pub value_number: Option<f64>,
    pub value_date: Option<String>,
    pub value_currency: Option<DiCurrency>,
    pub value_array: Vec<DiField>,
    pub value_object: HashMap<String, DiField>,
}

/// Normalized output of one analysis run.
#[derive(Debug, Clone, Default)]
pub struct DiAnalyzeResult {
    /// Provider-reported model version string.
    pub model_id: String,
    /// Full OCR text.
    pub content: String,
    pub fields: HashMap<String, DiField>,
    /// Line items lifted out of the `Items` field for convenience.
    pub items: Vec<HashMap<String, DiField>>,
    /// Confidence of the first detected document object; 0 when the model
    /// detected none (e.g. generic OCR).
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum DiError {
    #[error("missing AZURE_DI_ENDPOINT or AZURE_DI_KEY environment variable")]
    MissingConfig,
    #[error("document analysis request failed ({status}): {body}")]
    Http { status: u16, body: String },
    #[error("analysis response missing operation-location header")]
    MissingOperationLocation,
    #[error("analysis polling timed out after {attempts} attempts")]
    PollTimeout { attempts: usize },
    #[error("provider reported analysis failure: {0}")]
    AnalysisFailed(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait DocumentAnalysisClient: Send + Sync {
    async fn analyze(
        &self,
        file_bytes: &[u8],
        content_type: &str,
        model: DiModel,
    ) -> Result<DiAnalyzeResult, DiError>;
}

/// HTTP client for the Azure Document Intelligence REST protocol.
pub struct AzureDiClient {
    http: reqwest::Client,
    endpoint: String,
    key: String,
}

impl AzureDiClient {
    pub fn from_env() -> Result<Self, DiError> {
        let endpoint = std::env::var("AZURE_DI_ENDPOINT").map_err(|_| DiError::MissingConfig)?;
        let key = std::env::var("AZURE_DI_KEY").map_err(|_| DiError::MissingConfig)?;
        if endpoint.trim().is_empty() || key.trim().is_empty() {
            return Err(DiError::MissingConfig);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key,
        })
    }

    async fn send_with_retry<F>(&self, mut make_request: F) -> Result<reqwest::Response, DiError>
    where
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let response = make_request().send().await?;
            let status = response.status();
            let retryable = status.as_u16() == 429 || status.is_server_error();
            if retryable && attempt < MAX_TRANSPORT_RETRIES {
                let computed = BACKOFF_MS[attempt.min(BACKOFF_MS.len() - 1)];
                let wait_ms = retry_after_ms(response.headers()).unwrap_or(computed);
                debug!(status = status.as_u16(), attempt, wait_ms, "retrying provider call");
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                continue;
            }
            return Ok(response);
        }
    }
}

#[async_trait]
impl DocumentAnalysisClient for AzureDiClient {
    async fn analyze(
        &self,
        file_bytes: &[u8],
        content_type: &str,
        model: DiModel,
    ) -> Result<DiAnalyzeResult, DiError> {
        let analyze_url = format!(
            "{}/documentintelligence/documentModels/{}:analyze?api-version={API_VERSION}",
            self.endpoint,
            model.as_str(),
        );

        let body = file_bytes.to_vec();
        let submit = self
            .send_with_retry(|| {
                self.http
                    .post(&analyze_url)
                    .header("Ocp-Apim-Subscription-Key", &self.key)
                    .header("Content-Type", content_type)
                    .body(body.clone())
            })
            .await?;

        if !submit.status().is_success() {
            let status = submit.status().as_u16();
            let body = submit.text().await.unwrap_or_default();
            return Err(DiError::Http { status, body });
        }

        let operation_url = submit
            .headers()
            .get("operation-location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or(DiError::MissingOperationLocation)?;

        for _ in 0..MAX_POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;

            let response = self
                .send_with_retry(|| {
                    self.http
                        .get(&operation_url)
                        .header("Ocp-Apim-Subscription-Key", &self.key)
                })
                .await?;

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(DiError::Http { status, body });
            }

            let retry_after = retry_after_ms(response.headers());
            let poll: PollResponse = response.json().await?;

            match poll.status.as_str() {
                "succeeded" => {
                    if let Some(raw) = poll.analyze_result {
                        return Ok(parse_analyze_result(raw, model));
                    }
                    return Err(DiError::AnalysisFailed(
                        "succeeded without analyzeResult".to_string(),
                    ));
                }
                "failed" => {
                    let detail = poll
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no error detail".to_string());
                    return Err(DiError::AnalysisFailed(detail));
                }
                _ => {
                    // Still running; the provider may ask us to slow down.
                    if let Some(wait_ms) = retry_after {
                        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    }
                }
            }
        }

        Err(DiError::PollTimeout {
            attempts: MAX_POLL_ATTEMPTS,
        })
    }
}

fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get("retry-after")?.to_str().ok()?;
    let seconds: u64 = raw.trim().parse().ok()?;
    if seconds == 0 { None } else { Some(seconds * 1_000) }
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    status: String,
    #[serde(rename = "analyzeResult")]
    analyze_result: Option<RawAnalyzeResult>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawAnalyzeResult {
    #[serde(rename = "modelId", default)]
    model_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    documents: Vec<RawDocument>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    fields: HashMap<String, RawField>,
    #[serde(default)]
    confidence: f64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawField {
    content: Option<String>,
    confidence: Option<f64>,
    value_string: Option<String>,
    value_number: Option<f64>,
    value_date: Option<String>,
    value_currency: Option<RawCurrency>,
    value_array: Vec<RawField>,
    value_object: HashMap<String, RawField>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawCurrency {
    amount: Option<f64>,
    currency_code: Option<String>,
}

fn convert_field(raw: RawField) -> DiField {
    DiField {
        content: raw.content,
        confidence: raw.confidence.unwrap_or(0.0),
        value_string: raw.value_string,
        value_number: raw.value_number,
        value_date: raw.value_date,
        value_currency: raw.value_currency.and_then(|c| {
            c.amount.map(|amount| DiCurrency {
                amount,
                currency_code: c.currency_code,
            })
        }),
        value_array: raw.value_array.into_iter().map(convert_field).collect(),
        value_object: raw
            .value_object
            .into_iter()
            .map(|(k, v)| (k, convert_field(v)))
            .collect(),
    }
}

pub(crate) fn parse_analyze_result(raw: RawAnalyzeResult, model: DiModel) -> DiAnalyzeResult {
    let mut documents = raw.documents.into_iter();
    let Some(doc) = documents.next() else {
        // Generic-OCR models detect no document objects; the caller sees
        // confidence 0 and may escalate or proceed on raw text alone.
        return DiAnalyzeResult {
            model_id: if raw.model_id.is_empty() {
                model.as_str().to_string()
            } else {
                raw.model_id
            },
            content: raw.content,
            fields: HashMap::new(),
            items: Vec::new(),
            confidence: 0.0,
        };
    };

    let fields: HashMap<String, DiField> = doc
        .fields
        .into_iter()
        .map(|(k, v)| (k, convert_field(v)))
        .collect();

    let items = fields
        .get("Items")
        .map(|items| {
            items
                .value_array
                .iter()
                .map(|entry| entry.value_object.clone())
                .collect()
        })
        .unwrap_or_default();

    DiAnalyzeResult {
        model_id: if raw.model_id.is_empty() {
            model.as_str().to_string()
        } else {
            raw.model_id
        },
        content: raw.content,
        fields,
        items,
        confidence: doc.confidence,
    }
}
