//! Retrieval tools exposed to the chat agent and the MCP surface.
//!
//! Each tool carries a JSON input schema (served verbatim over `tools/list`
//! and handed to the model as a function declaration) and executes against
//! the vector store:
//!
//! | Tool | Purpose |
//! |------|---------|
//! | `search_content` | Semantic kNN search, optional source filter |
//! | `find_content_by_source` | Every chunk ingested from one source URL |
//! | `find_content_by_metadata` | Boolean metadata filter (`$and`/`$or`/`$not`) |

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::embedding::Embedder;
use crate::llm::ToolDeclaration;
use crate::models::Document;
use crate::vectorstore::DocumentStore;

/// A tool the chat agent can discover and call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool identifier as exposed to the model.
    fn name(&self) -> &str;

    /// One-line description shown to the model.
    fn description(&self) -> &str;

    /// JSON schema of the tool's arguments.
    fn parameters_schema(&self) -> Value;

    /// Run the tool. The returned string is the tool result payload.
    async fn execute(&self, args: Value) -> Result<String>;
}

/// The set of tools bound to one agent run.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Build the standard retrieval toolset over one collection.
    pub fn new(store: Arc<dyn DocumentStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            tools: vec![
                Arc::new(SearchContentTool {
                    store: Arc::clone(&store),
                    embedder,
                }),
                Arc::new(FindBySourceTool {
                    store: Arc::clone(&store),
                }),
                Arc::new(FindByMetadataTool { store }),
            ],
        }
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    /// Function declarations for binding the toolset to a model request.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.tools
            .iter()
            .map(|t| ToolDeclaration {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }
}

// ── search_content ──────────────────────────────────────────────────────

struct SearchContentTool {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<dyn Embedder>,
}

#[derive(Deserialize)]
struct SearchContentArgs {
    query: String,
    #[serde(default, rename = "topK")]
    top_k: i64,
    #[serde(default)]
    source: Option<String>,
}

#[async_trait]
impl Tool for SearchContentTool {
    fn name(&self) -> &str {
        "search_content"
    }

    fn description(&self) -> &str {
        "Search for content in the research database using semantic search."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query."
                },
                "topK": {
                    "type": "number",
                    "description": "The number of top results to return.",
                    "default": 5
                },
                "source": {
                    "type": "string",
                    "description": "The source to filter results by."
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String> {
        let args: SearchContentArgs =
            serde_json::from_value(args).with_context(|| "invalid search_content arguments")?;
        // Absent and explicit-zero both mean the advertised default.
        let top_k = if args.top_k == 0 { 5 } else { args.top_k };

        tracing::info!(query = %args.query, top_k, source = ?args.source, "search content");

        let query_embedding = self
            .embedder
            .embed_text(&args.query)
            .await
            .with_context(|| "failed to generate query embedding")?;

        let results = self
            .store
            .similarity_search(&query_embedding, top_k, args.source.as_deref())
            .await
            .map_err(|e| anyhow!(e).context("failed to search"))?;

        let formatted: Vec<String> = results
            .iter()
            .map(|r| format_search_hit(&r.document))
            .collect();
        Ok(formatted.join("\n\n"))
    }
}

// ── find_content_by_source ──────────────────────────────────────────────

struct FindBySourceTool {
    store: Arc<dyn DocumentStore>,
}

#[derive(Deserialize)]
struct FindSourceArgs {
    source: String,
}

#[async_trait]
impl Tool for FindBySourceTool {
    fn name(&self) -> &str {
        "find_content_by_source"
    }

    fn description(&self) -> &str {
        "Find all content associated with a specific source URL."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "source": {
                    "type": "string",
                    "description": "The source to find content for."
                }
            },
            "required": ["source"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String> {
        let args: FindSourceArgs = serde_json::from_value(args)
            .with_context(|| "invalid find_content_by_source arguments")?;

        let results = self
            .store
            .get_by_source(&args.source)
            .await
            .map_err(|e| anyhow!(e).context("failed to find content"))?;

        let contents: Vec<&str> = results.iter().map(|d| d.content.as_str()).collect();
        Ok(contents.join("\n\n"))
    }
}

// ── find_content_by_metadata ────────────────────────────────────────────

struct FindByMetadataTool {
    store: Arc<dyn DocumentStore>,
}

#[derive(Deserialize)]
struct FindMetadataArgs {
    filter: Map<String, Value>,
}

#[async_trait]
impl Tool for FindByMetadataTool {
    fn name(&self) -> &str {
        "find_content_by_metadata"
    }

    fn description(&self) -> &str {
        "Find content using complex logical filters on metadata."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filter": {
                    "type": "object",
                    "description": "JSON filter object with logical operators ($and, $or, $not)"
                }
            },
            "required": ["filter"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String> {
        let args: FindMetadataArgs = serde_json::from_value(args)
            .with_context(|| "invalid find_content_by_metadata arguments")?;

        let results = self
            .store
            .get_by_metadata(&args.filter)
            .await
            .map_err(|e| anyhow!(e).context("failed to find content"))?;

        let formatted: Vec<String> = results.iter().map(format_metadata_hit).collect();
        Ok(formatted.join("\n\n"))
    }
}

// ── formatting ──────────────────────────────────────────────────────────

/// `[Source]: <src>` / `[Content]: <text>` plus one line per extra
/// metadata key.
fn format_search_hit(doc: &Document) -> String {
    let source = doc
        .metadata
        .get("source")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");

    let mut out = format!("[Source]: {source}\n[Content]: {}", doc.content);
    for (key, value) in &doc.metadata {
        if key == "source" {
            continue;
        }
        out.push_str(&format!("\n[{key}]: {}", display_value(value)));
    }
    out
}

/// `[Content]: <text>` plus every metadata key, `source` included.
fn format_metadata_hit(doc: &Document) -> String {
    let mut out = format!("[Content]: {}", doc.content);
    for (key, value) in &doc.metadata {
        out.push_str(&format!("\n[{key}]: {}", display_value(value)));
    }
    out
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
