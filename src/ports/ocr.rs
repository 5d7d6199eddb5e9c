//! OCR provider port.

use crate::error::{AppError, AppResult};
use crate::ports::OCR_TIMEOUT;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrField {
    pub value: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrLineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_price: String,
}

/// Extraction result. Field keys the pipeline understands: `vendor`, `date`
/// (ISO), `amount`, `tax`, `currency`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OcrExtraction {
    pub fields: HashMap<String, OcrField>,
    pub line_items: Vec<OcrLineItem>,
    pub raw_text: String,
}

#[async_trait]
pub trait OcrProvider: Send + Sync {
    async fn extract(&self, bytes: &[u8], filename: Option<&str>) -> AppResult<OcrExtraction>;
}

/// HTTP adapter posting raw bytes to a hosted OCR service.
#[derive(Clone)]
pub struct HttpOcr {
    http: reqwest::Client,
    base_url: String,
}

impl HttpOcr {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }
}

#[async_trait]
impl OcrProvider for HttpOcr {
    async fn extract(&self, bytes: &[u8], filename: Option<&str>) -> AppResult<OcrExtraction> {
        let mut req = self
            .http
            .post(format!("{}/v1/extract", self.base_url))
            .timeout(OCR_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec());
        if let Some(name) = filename {
            req = req.query(&[("filename", name)]);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::ProviderTransient("timeout: ocr".to_string())
            } else {
                AppError::ProviderTransient(format!("ocr request: {e}"))
            }
        })?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(AppError::ProviderTransient(format!(
                "ocr {}: {}",
                status.as_u16(),
                snippet
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| AppError::ProviderTransient(format!("ocr json parse: {e}")))
    }
}

/// Deterministic fake: serves a fixed extraction, optionally failing the
/// first N calls with a transient error (retry-path tests).
pub struct FakeOcr {
    result: OcrExtraction,
    failures_remaining: Mutex<u32>,
    calls: Mutex<u32>,
}

impl FakeOcr {
    pub fn with_result(result: OcrExtraction) -> Self {
        Self {
            result,
            failures_remaining: Mutex::new(0),
            calls: Mutex::new(0),
        }
    }

    pub fn failing_first(result: OcrExtraction, failures: u32) -> Self {
        Self {
            result,
            failures_remaining: Mutex::new(failures),
            calls: Mutex::new(0),
        }
    }

    /// A plausible coffee-shop receipt, for wiring tests.
    pub fn sample() -> OcrExtraction {
        let mut fields = HashMap::new();
        fields.insert(
            "vendor".to_string(),
            OcrField {
                value: "Joe's Coffee".to_string(),
                confidence: 0.93,
            },
        );
        fields.insert(
            "date".to_string(),
            OcrField {
                value: "2026-01-10".to_string(),
                confidence: 0.97,
            },
        );
        fields.insert(
            "amount".to_string(),
            OcrField {
                value: "23.45".to_string(),
                confidence: 0.99,
            },
        );
        fields.insert(
            "currency".to_string(),
            OcrField {
                value: "USD".to_string(),
                confidence: 0.99,
            },
        );
        OcrExtraction {
            fields,
            line_items: vec![OcrLineItem {
                description: "Latte".to_string(),
                quantity: 2.0,
                unit_price: "5.50".to_string(),
            }],
            raw_text: "JOE'S COFFEE\n2026-01-10\nTOTAL 23.45".to_string(),
        }
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl OcrProvider for FakeOcr {
    async fn extract(&self, _bytes: &[u8], _filename: Option<&str>) -> AppResult<OcrExtraction> {
        *self.calls.lock() += 1;
        let mut remaining = self.failures_remaining.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(AppError::ProviderTransient("fake ocr failure".to_string()));
        }
        Ok(self.result.clone())
    }
}
