//! PDF scraping through the Mistral OCR service.
//!
//! Sends the document URL to the OCR endpoint and stitches the returned
//! per-page markdown into a single text prefixed with a URL header.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::fmt::Write as _;

const OCR_API: &str = "https://api.mistral.ai/v1/ocr";

/// Seam over the document scraping service.
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Extract a PDF's contents as markdown text.
    async fn scrape_pdf(&self, url: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct OcrPage {
    #[serde(default)]
    index: i64,
    #[serde(default)]
    markdown: String,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    pages: Vec<OcrPage>,
}

/// Scraper backed by the Mistral OCR API.
pub struct MistralOcr {
    http: reqwest::Client,
    api_key: String,
}

impl MistralOcr {
    pub fn new(api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl Scraper for MistralOcr {
    async fn scrape_pdf(&self, url: &str) -> Result<String> {
        if self.api_key.is_empty() {
            bail!("MISTRAL_API_KEY is not set");
        }

        let url = url.replacen("http://", "https://", 1);

        let body = json!({
            "model": "mistral-ocr-latest",
            "document": {
                "type": "document_url",
                "document_url": url,
            },
            "include_image_base64": true,
        });

        let resp = self
            .http
            .post(OCR_API)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .with_context(|| "ocr request failed")?;

        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("ocr API request failed with status {}: {}", status, body_text);
        }

        let ocr: OcrResponse =
            serde_json::from_str(&body_text).with_context(|| "failed to parse ocr response")?;

        Ok(render_pages(&url, &ocr))
    }
}

fn render_pages(url: &str, ocr: &OcrResponse) -> String {
    let mut out = String::new();
    out.push_str("-----\n");
    let _ = writeln!(out, "# URL: {url}");
    out.push_str("-----\n\n");
    for page in &ocr.pages {
        let _ = writeln!(out, "- Page {} -", page.index);
        out.push_str(&page.markdown);
        out.push_str("\n\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_pages_concatenates_markdown() {
        let ocr = OcrResponse {
            pages: vec![
                OcrPage {
                    index: 0,
                    markdown: "First page.".to_string(),
                },
                OcrPage {
                    index: 1,
                    markdown: "Second page.".to_string(),
                },
            ],
        };
        let out = render_pages("https://arxiv.org/pdf/1234", &ocr);
        assert!(out.starts_with("-----\n# URL: https://arxiv.org/pdf/1234\n-----\n\n"));
        assert!(out.contains("- Page 0 -\nFirst page."));
        assert!(out.contains("- Page 1 -\nSecond page."));
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_any_request() {
        let scraper = MistralOcr::new("");
        let err = scraper.scrape_pdf("http://example.com/x.pdf").await;
        assert!(err.unwrap_err().to_string().contains("MISTRAL_API_KEY"));
    }
}
