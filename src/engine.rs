//! The research orchestrator.
//!
//! Drives the model through a fixed five-phase loop until it declares the
//! investigation complete or the iteration cap is reached:
//!
//! ```text
//! ┌─► Plan ──► Source ──► Filter ──► Acquire/Index ──► Reflect ──┐
//! │                                                              │
//! └────────────────────── CONTINUE ◄────────────────────────────┘
//!                              │ STOP / cap
//!                              ▼
//!                        report synthesis
//! ```
//!
//! Every collaborator sits behind a trait ([`LanguageModel`], [`Embedder`],
//! [`SourceFeed`], [`Scraper`], [`DocumentStore`], [`ResearchLog`]), so the
//! loop can be driven end-to-end by scripted fakes in tests.
//!
//! # Concurrency
//!
//! Sourcing runs one task per query (at most three) collecting into a
//! mutex-guarded local list. Acquisition fans out under a counting
//! semaphore of three permits; the shared [`ResearchState`] is mutated only
//! under its mutex, and each URL is claimed exactly once per run before
//! any network work starts.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::postgres::PgPool;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::arxiv::{ArxivClient, SourceFeed};
use crate::config::Config;
use crate::embedding::{Embedder, GeminiEmbedder, EMBEDDING_DIM};
use crate::jobs::{LogLevel, ResearchLog};
use crate::llm::{Content, GenerateRequest, GeminiClient, LanguageModel};
use crate::models::{Document, ResearchState, SearchResult};
use crate::scraper::{MistralOcr, Scraper};
use crate::splitter::RecursiveCharacterSplitter;
use crate::vectorstore::{DocumentStore, PgVectorStore};

/// Number of concurrent scrape/embed pipelines during acquisition.
const ACQUIRE_CONCURRENCY: usize = 3;

/// Per-source excerpt length in Unicode scalar values.
const EXCERPT_CODE_POINTS: usize = 500;

/// Hook receiving defensive copies of the research state at phase boundaries.
pub type StateHook = Arc<dyn Fn(ResearchState) + Send + Sync>;

/// Static settings for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub collection: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_iterations: u32,
}

impl EngineConfig {
    pub fn new(collection: &str, chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            collection: collection.to_string(),
            chunk_size,
            chunk_overlap,
            max_iterations: 5,
        }
    }
}

/// Injected collaborators; production wiring lives in [`ResearchEngine::new`].
pub struct EngineDeps {
    pub llm: Arc<dyn LanguageModel>,
    pub embedder: Arc<dyn Embedder>,
    pub feed: Arc<dyn SourceFeed>,
    pub scraper: Arc<dyn Scraper>,
    pub store: Arc<dyn DocumentStore>,
    pub log: Arc<dyn ResearchLog>,
}

/// The Plan/Source/Filter/Acquire/Reflect orchestrator.
pub struct ResearchEngine {
    config: EngineConfig,
    llm: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    feed: Arc<dyn SourceFeed>,
    scraper: Arc<dyn Scraper>,
    store: Arc<dyn DocumentStore>,
    log: Arc<dyn ResearchLog>,
    state: Arc<Mutex<ResearchState>>,
    on_state_update: Option<StateHook>,
}

impl ResearchEngine {
    /// Wire up the production collaborators from configuration.
    pub fn new(
        config: &Config,
        collection: &str,
        pool: PgPool,
        log: Arc<dyn ResearchLog>,
    ) -> Result<Self> {
        let llm = GeminiClient::new(&config.google_api_key, &config.reasoning_model)
            .with_context(|| "failed to init LLM")?;
        let embedder = GeminiEmbedder::new(&config.google_api_key, &config.embedding_model)
            .with_context(|| "failed to init embedder")?;
        let store = PgVectorStore::new(pool, collection)?;

        Ok(Self::with_deps(
            EngineConfig::new(collection, config.chunk_size, config.chunk_overlap),
            EngineDeps {
                llm: Arc::new(llm),
                embedder: Arc::new(embedder),
                feed: Arc::new(ArxivClient::new()),
                scraper: Arc::new(MistralOcr::new(&config.mistral_api_key)),
                store: Arc::new(store),
                log,
            },
        ))
    }

    /// Construct from explicit collaborators. This is the seam tests use.
    pub fn with_deps(config: EngineConfig, deps: EngineDeps) -> Self {
        let mut state = ResearchState::new(&config.collection);
        state.max_iterations = config.max_iterations;

        Self {
            config,
            llm: deps.llm,
            embedder: deps.embedder,
            feed: deps.feed,
            scraper: deps.scraper,
            store: deps.store,
            log: deps.log,
            state: Arc::new(Mutex::new(state)),
            on_state_update: None,
        }
    }

    /// Register a hook invoked with a state copy at iteration entry and
    /// after acquisition completes.
    pub fn set_on_state_update(&mut self, hook: StateHook) {
        self.on_state_update = Some(hook);
    }

    /// A copy of the current research state.
    pub fn state_snapshot(&self) -> ResearchState {
        self.state.lock().expect("state mutex poisoned").clone()
    }

    fn notify_state(&self) {
        if let Some(hook) = &self.on_state_update {
            hook(self.state_snapshot());
        }
    }

    async fn info(&self, message: &str, metadata: Value) {
        self.log.log(LogLevel::Info, message, metadata).await;
    }

    async fn warn(&self, message: &str, metadata: Value) {
        self.log.log(LogLevel::Warn, message, metadata).await;
    }

    /// Run the full research loop for `topic` and return the final report.
    pub async fn run(&self, topic: &str) -> Result<String> {
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            state.topic = topic.to_string();
        }
        self.info("Starting research loop", json!({ "topic": topic }))
            .await;
        self.notify_state();

        loop {
            let (iteration, max_iterations) = {
                let mut state = self.state.lock().expect("state mutex poisoned");
                if state.iteration >= state.max_iterations {
                    break;
                }
                state.iteration += 1;
                (state.iteration, state.max_iterations)
            };
            self.info(
                "Starting iteration",
                json!({ "iteration": iteration, "max": max_iterations }),
            )
            .await;
            self.notify_state();

            // 1. Plan
            let queries = self.plan_phase().await.with_context(|| "planning failed")?;
            if queries.is_empty() {
                self.warn("No queries generated. Research might be stuck.", json!({}))
                    .await;
                break;
            }

            // 2. Source
            let search_results = self.source_phase(queries).await;

            // 3. Filter
            let relevant = self
                .filter_phase(&search_results)
                .await
                .with_context(|| "filtering failed")?;
            if relevant.is_empty() {
                // Reflection may still redirect the search, so keep going.
                self.info("No relevant items found in this iteration.", json!({}))
                    .await;
            }

            // 4. Acquire & Index
            let summaries = self
                .acquire_and_index_phase(relevant)
                .await
                .with_context(|| "acquire/index failed")?;
            self.notify_state();

            // 5. Reflect
            let (should_continue, focus) = self
                .reflect_phase(&summaries)
                .await
                .with_context(|| "reflection failed")?;
            if !should_continue {
                self.info("Research complete!", json!({})).await;
                break;
            }
            if !focus.is_empty() {
                // Logged only; the next plan prompt is intentionally not
                // steered by the reflection output.
                self.info("Adjusting focus", json!({ "focus": focus })).await;
            }
        }

        self.generate_report().await
    }

    /// Generate content with validation and bounded retry: up to three
    /// attempts with linear backoff, treating non-conforming output the
    /// same as a transport failure.
    async fn generate_with_retry<T, F>(&self, req: GenerateRequest, validate: F) -> Result<T>
    where
        F: Fn(&str) -> Result<T>,
    {
        const MAX_RETRIES: u32 = 3;
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                self.warn(
                    "Retrying LLM generation",
                    json!({
                        "attempt": attempt + 1,
                        "last_error": last_err.as_ref().map(|e| e.to_string()),
                    }),
                )
                .await;
                tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
            }

            match self.llm.generate(req.clone()).await {
                Err(e) => {
                    last_err = Some(e.context("llm generation failed"));
                }
                Ok(content) => match validate(&content) {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        last_err = Some(e.context("validation failed"));
                    }
                },
            }
        }

        Err(anyhow!(
            "operation failed after {MAX_RETRIES} retries: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    async fn plan_phase(&self) -> Result<Vec<String>> {
        self.info("Starting planning phase", json!({})).await;

        let (topic, iteration, fact_count) = {
            let state = self.state.lock().expect("state mutex poisoned");
            (
                state.topic.clone(),
                state.iteration,
                state.accumulated_facts.len(),
            )
        };

        let req = GenerateRequest {
            system: Some(
                "You are a research planner.\n\
                 Generate 3 specific search queries to gather information about the topic."
                    .to_string(),
            ),
            contents: vec![Content::user_text(format!(
                "Topic: {topic}\nCurrent Iteration: {iteration}\nAccumulated Facts: {fact_count}"
            ))],
            response_schema: Some(json!({
                "type": "object",
                "properties": {
                    "queries": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "List of 3 specific search queries"
                    }
                },
                "required": ["queries"]
            })),
            tools: vec![],
        };

        #[derive(Deserialize)]
        struct QueryResponse {
            queries: Vec<String>,
        }

        let response: QueryResponse = self
            .generate_with_retry(req, |content| {
                let parsed: QueryResponse = serde_json::from_str(content)
                    .with_context(|| format!("json parse error (content: {content})"))?;
                if parsed.queries.is_empty() {
                    return Err(anyhow!("empty queries list"));
                }
                Ok(parsed)
            })
            .await?;

        self.info("Generated queries", json!({ "queries": response.queries }))
            .await;
        Ok(response.queries)
    }

    async fn source_phase(&self, queries: Vec<String>) -> Vec<SearchResult> {
        self.info("Starting sourcing phase", json!({})).await;

        let collected: Arc<Mutex<Vec<SearchResult>>> = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = JoinSet::new();

        for query in queries {
            let feed = Arc::clone(&self.feed);
            let log = Arc::clone(&self.log);
            let collected = Arc::clone(&collected);

            tasks.spawn(async move {
                match feed.search(&query, 2).await {
                    Ok(text) => {
                        let parsed = parse_search_output(&text);
                        log.log(
                            LogLevel::Info,
                            "Feed search successful",
                            json!({ "query": query, "count": parsed.len() }),
                        )
                        .await;
                        collected
                            .lock()
                            .expect("results mutex poisoned")
                            .extend(parsed);
                    }
                    Err(e) => {
                        log.log(
                            LogLevel::Error,
                            "Feed search failed",
                            json!({ "query": query, "error": e.to_string() }),
                        )
                        .await;
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        // First occurrence of each title wins.
        let all = collected.lock().expect("results mutex poisoned");
        let mut seen = std::collections::HashSet::new();
        all.iter()
            .filter(|r| seen.insert(r.title.clone()))
            .cloned()
            .collect()
    }

    async fn filter_phase(&self, results: &[SearchResult]) -> Result<Vec<SearchResult>> {
        self.info("Starting filtering phase", json!({})).await;

        if results.is_empty() {
            return Ok(Vec::new());
        }

        let topic = {
            let state = self.state.lock().expect("state mutex poisoned");
            state.topic.clone()
        };

        let mut papers = String::new();
        for (i, r) in results.iter().enumerate() {
            papers.push_str(&format!(
                "ID: {i}\nTitle: {}\nSummary: {}\n\n",
                r.title, r.snippet
            ));
        }

        let req = GenerateRequest {
            system: Some(
                "You are a research filter.\n\
                 Evaluate the relevance of the following papers to the research topic.\n\
                 Score each paper from 0-10 (10 being most relevant).\n\
                 Return a JSON object mapping ID to score."
                    .to_string(),
            ),
            contents: vec![Content::user_text(format!(
                "Topic: {topic}\n\nPapers:\n{papers}"
            ))],
            response_schema: Some(json!({
                "type": "object",
                "properties": {
                    "scores": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": { "type": "integer" },
                                "score": { "type": "integer" }
                            },
                            "required": ["id", "score"]
                        }
                    }
                },
                "required": ["scores"]
            })),
            tools: vec![],
        };

        #[derive(Deserialize)]
        struct ScoreItem {
            id: i64,
            score: i64,
        }
        #[derive(Deserialize)]
        struct FilterResponse {
            scores: Vec<ScoreItem>,
        }

        let response: FilterResponse = self
            .generate_with_retry(req, |content| {
                serde_json::from_str(content).with_context(|| "json parse error")
            })
            .await
            .with_context(|| "llm filtering failed")?;

        let mut relevant = Vec::new();
        for item in response.scores {
            let in_range = item.id >= 0 && (item.id as usize) < results.len();
            if item.score >= 7 && in_range {
                let paper = results[item.id as usize].clone();
                self.info(
                    "Keeping paper",
                    json!({ "title": paper.title, "score": item.score }),
                )
                .await;
                relevant.push(paper);
            }
        }

        self.info(
            "Filtering complete",
            json!({ "total": results.len(), "relevant": relevant.len() }),
        )
        .await;
        Ok(relevant)
    }

    async fn acquire_and_index_phase(&self, items: Vec<SearchResult>) -> Result<Vec<String>> {
        self.info("Starting acquire and index phase", json!({})).await;

        self.store
            .ensure_collection(EMBEDDING_DIM)
            .await
            .map_err(|e| {
                anyhow!(e).context("failed to ensure collection for indexing")
            })?;

        let semaphore = Arc::new(Semaphore::new(ACQUIRE_CONCURRENCY));
        let summaries: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = JoinSet::new();

        for item in items {
            let semaphore = Arc::clone(&semaphore);
            let state = Arc::clone(&self.state);
            let summaries = Arc::clone(&summaries);
            let scraper = Arc::clone(&self.scraper);
            let embedder = Arc::clone(&self.embedder);
            let store = Arc::clone(&self.store);
            let log = Arc::clone(&self.log);
            let splitter = RecursiveCharacterSplitter::new(
                self.config.chunk_size,
                self.config.chunk_overlap,
            );

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };

                // Claim the URL; whoever claims it does all the work.
                {
                    let mut st = state.lock().expect("state mutex poisoned");
                    if st.processed_urls.get(&item.url).copied().unwrap_or(false) {
                        return;
                    }
                    st.processed_urls.insert(item.url.clone(), true);
                }

                log.log(
                    LogLevel::Info,
                    "Scraping source",
                    json!({ "title": item.title, "url": item.url }),
                )
                .await;

                let mut full_text = String::new();
                if !item.url.is_empty() {
                    match scraper.scrape_pdf(&item.url).await {
                        Ok(text) => full_text = text,
                        Err(e) => {
                            log.log(
                                LogLevel::Warn,
                                "Failed to scrape, using summary",
                                json!({ "url": item.url, "error": e.to_string() }),
                            )
                            .await;
                            full_text = item.snippet.clone();
                        }
                    }
                }
                if full_text.is_empty() {
                    full_text = item.snippet.clone();
                }

                // Index into the vector store. Failures here are logged and
                // the source is still recorded below.
                let chunks = splitter.split_text(&full_text);
                if !chunks.is_empty() {
                    match embedder.embed_texts(&chunks).await {
                        Err(e) => {
                            log.log(
                                LogLevel::Error,
                                "Failed to generate embeddings",
                                json!({ "title": item.title, "error": e.to_string() }),
                            )
                            .await;
                        }
                        Ok(vectors) => {
                            let docs: Vec<Document> = chunks
                                .into_iter()
                                .zip(vectors)
                                .map(|(chunk, embedding)| {
                                    let mut metadata = serde_json::Map::new();
                                    metadata.insert("source".to_string(), json!(item.url));
                                    metadata.insert("title".to_string(), json!(item.title));
                                    Document {
                                        id: String::new(),
                                        content: chunk,
                                        metadata,
                                        embedding: Some(embedding),
                                    }
                                })
                                .collect();

                            if let Err(e) = store.add_documents(docs).await {
                                log.log(
                                    LogLevel::Error,
                                    "Failed to add documents to vector store",
                                    json!({ "title": item.title, "error": e.to_string() }),
                                )
                                .await;
                            }
                        }
                    }
                }

                // Short-term memory for the reflection phase. Truncation is
                // by code point so multi-byte text is never torn.
                let excerpt: String = full_text.chars().take(EXCERPT_CODE_POINTS).collect();
                let summary = format!(
                    "Source: {}\nSummary: {}\nExcerpts: {}...",
                    item.title, item.snippet, excerpt
                );

                {
                    let mut st = state.lock().expect("state mutex poisoned");
                    st.accumulated_facts.push(summary.clone());
                    st.indexed_items.push(item.clone());
                }
                summaries
                    .lock()
                    .expect("summaries mutex poisoned")
                    .push(summary);
            });
        }
        while tasks.join_next().await.is_some() {}

        let collected = summaries.lock().expect("summaries mutex poisoned").clone();
        Ok(collected)
    }

    async fn reflect_phase(&self, summaries: &[String]) -> Result<(bool, String)> {
        self.info("Starting reflection phase", json!({})).await;

        let (topic, iteration, max_iterations) = {
            let state = self.state.lock().expect("state mutex poisoned");
            (state.topic.clone(), state.iteration, state.max_iterations)
        };

        if iteration >= max_iterations {
            return Ok((false, String::new()));
        }

        let req = GenerateRequest {
            system: Some(
                "You are a research manager.\n\
                 Review the gathered facts and decide if sufficient information has been \
                 gathered to answer the original research topic comprehensively.\n\
                 If yes, output \"STOP\".\n\
                 If no, output \"CONTINUE\" and a brief focus area for the next iteration."
                    .to_string(),
            ),
            contents: vec![Content::user_text(format!(
                "Topic: {topic}\n\nRecent Findings:\n{}\n\nTotal Iterations: {iteration}/{max_iterations}",
                summaries.join("\n\n")
            ))],
            response_schema: None,
            tools: vec![],
        };

        let content = self.llm.generate(req).await?;
        if content.to_uppercase().contains("STOP") {
            return Ok((false, String::new()));
        }
        Ok((true, content))
    }

    async fn generate_report(&self) -> Result<String> {
        self.info("Compiling final report", json!({})).await;

        let (topic, facts) = {
            let state = self.state.lock().expect("state mutex poisoned");
            (state.topic.clone(), state.accumulated_facts.join("\n\n"))
        };

        let req = GenerateRequest {
            contents: vec![Content::user_text(format!(
                "Write a comprehensive research report on \"{topic}\".\n\
                 Use the following gathered facts and summaries:\n\n{facts}\n\n\
                 Format as Markdown with Introduction, Key Findings, Methodology/Discussion, \
                 and Conclusion."
            ))],
            ..Default::default()
        };

        let report = self.llm.generate(req).await?;
        self.info("Final report generated", json!({ "length": report.len() }))
            .await;
        Ok(report)
    }
}

static SUMMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)## Summary: (.*?)(?:\n##|$)").expect("valid pattern"));
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"## PDF Link: (.*)").expect("valid pattern"));

/// Parse the feed adapter's formatted output into search results.
///
/// The empty-result sentinel contains no `# Title:` block and therefore
/// parses to an empty list.
pub fn parse_search_output(content: &str) -> Vec<SearchResult> {
    let mut results = Vec::new();

    if content.starts_with("No results found for query:") {
        return results;
    }

    for part in content.split("# Title: ") {
        if part.trim().is_empty() {
            continue;
        }

        let title = part.lines().next().unwrap_or_default().trim().to_string();
        if title.is_empty() {
            continue;
        }

        let snippet = SUMMARY_RE
            .captures(part)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        let url = LINK_RE
            .captures(part)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();

        results.push(SearchResult {
            title,
            url,
            snippet,
        });
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_output_full_entry() {
        let text = "# Title: LoRA\n## Summary: Freezes pretrained weights\nacross lines.\n## Published: 2021\n## PDF Link: http://arxiv.org/pdf/2106.09685\n\n";
        let results = parse_search_output(text);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "LoRA");
        assert_eq!(
            results[0].snippet,
            "Freezes pretrained weights\nacross lines."
        );
        assert_eq!(results[0].url, "http://arxiv.org/pdf/2106.09685");
    }

    #[test]
    fn test_parse_search_output_missing_link() {
        let text = "# Title: QLoRA\n## Summary: Quantized finetuning\n## Published: 2023\n\n";
        let results = parse_search_output(text);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].url, "");
    }

    #[test]
    fn test_parse_search_output_sentinel_is_empty() {
        let results = parse_search_output("No results found for query: quantum frogs");
        assert!(results.is_empty());
    }

    #[test]
    fn test_parse_search_output_multiple_entries() {
        let text = "# Title: A\n## Summary: first\n## PDF Link: http://x/a\n\n# Title: B\n## Summary: second\n\n";
        let results = parse_search_output(text);
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].title, "B");
        assert_eq!(results[1].snippet, "second");
    }
}
