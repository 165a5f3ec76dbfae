//! arXiv Atom feed adapter.
//!
//! Issues a single query against the arXiv export API and renders the
//! entries into a plain-text block the research engine can parse:
//!
//! ```text
//! # Title: <title>
//! ## Summary: <abstract>
//! ## Published: <date>
//! ## PDF Link: <first application/pdf link>
//! ```
//!
//! When the feed yields no entries the adapter returns the sentinel
//! `No results found for query: <q>` instead of an empty string.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Write as _;

const ARXIV_API: &str = "https://export.arxiv.org/api/query";

/// Seam over the academic search feed.
#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// Search the feed and return the formatted result text.
    async fn search(&self, query: &str, max_results: i32) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(default, rename = "entry")]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    published: String,
    #[serde(default, rename = "link")]
    links: Vec<AtomLink>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(default, rename = "@href")]
    href: String,
    #[serde(default, rename = "@type")]
    mime_type: String,
}

/// HTTP client for the arXiv export API.
#[derive(Clone, Default)]
pub struct ArxivClient {
    http: reqwest::Client,
}

impl ArxivClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SourceFeed for ArxivClient {
    async fn search(&self, query: &str, max_results: i32) -> Result<String> {
        let max_results = if max_results <= 0 { 5 } else { max_results };

        let resp = self
            .http
            .get(ARXIV_API)
            .query(&[
                ("search_query", query),
                ("max_results", &max_results.to_string()),
                ("start", "0"),
            ])
            .send()
            .await
            .with_context(|| "arxiv request failed")?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("arxiv API returned status {}: {}", status, body);
        }

        format_feed(&body, query)
    }
}

/// Parse an Atom feed body and render the entry block format.
fn format_feed(xml: &str, query: &str) -> Result<String> {
    let feed: AtomFeed =
        quick_xml::de::from_str(xml).with_context(|| "failed to parse arxiv feed")?;

    let mut out = String::new();
    for entry in &feed.entries {
        let _ = writeln!(out, "# Title: {}", entry.title.trim());
        let _ = writeln!(out, "## Summary: {}", entry.summary.trim());
        let _ = writeln!(out, "## Published: {}", entry.published.trim());
        if let Some(link) = entry
            .links
            .iter()
            .find(|l| l.mime_type == "application/pdf")
        {
            let _ = writeln!(out, "## PDF Link: {}", link.href);
        }
        out.push('\n');
    }

    if out.is_empty() {
        out = format!("No results found for query: {query}");
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>ArXiv Query Results</title>
  <entry>
    <title>Low-Rank Adaptation of Large Language Models</title>
    <summary>We propose LoRA, which freezes the pretrained weights.</summary>
    <published>2021-06-17T17:37:18Z</published>
    <link href="http://arxiv.org/abs/2106.09685v2" rel="alternate" type="text/html"/>
    <link href="http://arxiv.org/pdf/2106.09685v2" rel="related" type="application/pdf"/>
  </entry>
  <entry>
    <title>QLoRA: Efficient Finetuning</title>
    <summary>4-bit quantized finetuning.</summary>
    <published>2023-05-23T17:50:33Z</published>
    <link href="http://arxiv.org/abs/2305.14314v1" rel="alternate" type="text/html"/>
  </entry>
</feed>"#;

    #[test]
    fn test_format_feed_renders_entries() {
        let out = format_feed(SAMPLE_FEED, "lora").unwrap();
        assert!(out.contains("# Title: Low-Rank Adaptation of Large Language Models"));
        assert!(out.contains("## Summary: We propose LoRA, which freezes the pretrained weights."));
        assert!(out.contains("## PDF Link: http://arxiv.org/pdf/2106.09685v2"));
    }

    #[test]
    fn test_entry_without_pdf_link_omits_line() {
        let out = format_feed(SAMPLE_FEED, "lora").unwrap();
        let qlora_block = out.split("# Title: ").nth(2).unwrap();
        assert!(qlora_block.starts_with("QLoRA"));
        assert!(!qlora_block.contains("## PDF Link:"));
    }

    #[test]
    fn test_empty_feed_returns_sentinel() {
        let empty = r#"<?xml version="1.0"?><feed xmlns="http://www.w3.org/2005/Atom"></feed>"#;
        let out = format_feed(empty, "quantum frogs").unwrap();
        assert_eq!(out, "No results found for query: quantum frogs");
    }

    #[test]
    fn test_malformed_xml_is_an_error() {
        assert!(format_feed("<feed><entry>", "q").is_err());
    }
}
