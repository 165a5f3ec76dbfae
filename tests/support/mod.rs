//! Shared scripted fakes for driving the orchestrator and chat runtime
//! without any network or database.
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use research_helper::arxiv::SourceFeed;
use research_helper::embedding::Embedder;
use research_helper::jobs::{LogLevel, ResearchLog};
use research_helper::llm::{DeltaStream, GenerateRequest, LanguageModel, ModelDelta};
use research_helper::models::{Document, ScoredDocument};
use research_helper::scraper::Scraper;
use research_helper::vectorstore::{DocumentStore, StoreError};

/// One scripted model reply, consumed in order.
pub enum Reply {
    /// `generate` returns this text; `stream` yields it as one chunk.
    Text(String),
    /// The call fails with this message.
    Err(String),
    /// `stream` yields exactly these deltas.
    Deltas(Vec<ModelDelta>),
}

/// A language model that replays a fixed script.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
        })
    }

    fn pop(&self) -> Option<Reply> {
        self.replies.lock().unwrap().pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, _req: GenerateRequest) -> Result<String> {
        match self.pop() {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Err(message)) => bail!(message),
            Some(Reply::Deltas(deltas)) => Ok(deltas
                .into_iter()
                .filter_map(|d| match d {
                    ModelDelta::Text(t) => Some(t),
                    ModelDelta::ToolCall { .. } => None,
                })
                .collect()),
            None => bail!("model script exhausted"),
        }
    }

    async fn stream(&self, _req: GenerateRequest) -> Result<DeltaStream> {
        match self.pop() {
            Some(Reply::Deltas(deltas)) => Ok(Box::pin(futures::stream::iter(
                deltas.into_iter().map(Ok),
            ))),
            Some(Reply::Text(text)) => Ok(Box::pin(futures::stream::iter(vec![Ok(
                ModelDelta::Text(text),
            )]))),
            Some(Reply::Err(message)) => bail!(message),
            None => bail!("model script exhausted"),
        }
    }
}

/// Log sink that captures every record for assertions.
#[derive(Default)]
pub struct MemoryLog {
    pub entries: Mutex<Vec<(LogLevel, String, Value)>>,
}

impl MemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, level: LogLevel, needle: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, m, _)| *l == level && m.contains(needle))
            .count()
    }
}

#[async_trait]
impl ResearchLog for MemoryLog {
    async fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        self.entries
            .lock()
            .unwrap()
            .push((level, message.to_string(), metadata));
    }
}

/// Source feed with canned responses per query; unknown queries return
/// the empty-result sentinel.
pub struct StubFeed {
    responses: HashMap<String, String>,
}

impl StubFeed {
    pub fn new(responses: Vec<(&str, String)>) -> Arc<Self> {
        Arc::new(Self {
            responses: responses
                .into_iter()
                .map(|(q, r)| (q.to_string(), r))
                .collect(),
        })
    }
}

#[async_trait]
impl SourceFeed for StubFeed {
    async fn search(&self, query: &str, _max_results: i32) -> Result<String> {
        Ok(self
            .responses
            .get(query)
            .cloned()
            .unwrap_or_else(|| format!("No results found for query: {query}")))
    }
}

/// Render one feed entry in the adapter's output format.
pub fn feed_entry(title: &str, summary: &str, pdf_url: &str) -> String {
    let mut out = format!("# Title: {title}\n## Summary: {summary}\n## Published: 2024-01-01\n");
    if !pdf_url.is_empty() {
        out.push_str(&format!("## PDF Link: {pdf_url}\n"));
    }
    out.push('\n');
    out
}

/// Scraper that fails for listed URLs and echoes text for the rest.
pub struct StubScraper {
    fail: HashSet<String>,
}

impl StubScraper {
    pub fn failing_for(urls: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fail: urls.iter().map(|u| u.to_string()).collect(),
        })
    }
}

#[async_trait]
impl Scraper for StubScraper {
    async fn scrape_pdf(&self, url: &str) -> Result<String> {
        if self.fail.contains(url) {
            bail!("ocr service unavailable for {url}");
        }
        Ok(format!("Full scraped text for {url}."))
    }
}

/// Embedder returning a constant small vector.
pub struct StubEmbedder;

impl StubEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed_text(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![0.1, 0.2, 0.3])
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
    }
}

/// Document store that records inserts and serves canned documents.
#[derive(Default)]
pub struct RecordingStore {
    pub added: Mutex<Vec<Document>>,
    pub ensure_calls: Mutex<u32>,
    pub canned: Vec<Document>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_documents(canned: Vec<Document>) -> Arc<Self> {
        Arc::new(Self {
            canned,
            ..Self::default()
        })
    }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn ensure_collection(&self, _dims: u32) -> Result<(), StoreError> {
        *self.ensure_calls.lock().unwrap() += 1;
        Ok(())
    }

    async fn add_documents(&self, docs: Vec<Document>) -> Result<(), StoreError> {
        self.added.lock().unwrap().extend(docs);
        Ok(())
    }

    async fn similarity_search(
        &self,
        _query: &[f32],
        top_k: i64,
        source_filter: Option<&str>,
    ) -> Result<Vec<ScoredDocument>, StoreError> {
        Ok(self
            .canned
            .iter()
            .filter(|d| match source_filter {
                Some(src) => {
                    d.metadata.get("source").and_then(|v| v.as_str()) == Some(src)
                }
                None => true,
            })
            .take(top_k as usize)
            .map(|d| ScoredDocument {
                document: d.clone(),
                score: 0.92,
            })
            .collect())
    }

    async fn get_by_source(&self, source: &str) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .canned
            .iter()
            .filter(|d| d.metadata.get("source").and_then(|v| v.as_str()) == Some(source))
            .cloned()
            .collect())
    }

    async fn get_by_metadata(
        &self,
        _filter: &Map<String, Value>,
    ) -> Result<Vec<Document>, StoreError> {
        Ok(self.canned.clone())
    }

    async fn update_metadata(
        &self,
        id: Uuid,
        _patch: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        Err(StoreError::NotFound(id))
    }
}
