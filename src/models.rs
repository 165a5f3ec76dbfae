//! Core data models shared across the research and retrieval pipeline.
//!
//! The data lifecycle is:
//!
//! ```text
//! plan() → queries → source() → SearchResult → filter()
//!                                     ↓
//!                        acquire: scrape → split → embed → Document
//!                                     ↓
//!                              ResearchState (facts, indexed items)
//! ```
//!
//! [`ResearchState`] doubles as the orchestrator's in-memory working set
//! and the snapshot persisted on the job row, so it derives `Serialize`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single candidate source produced by the sourcing phase.
///
/// Uniqueness within one sourcing round is by `title`; the `url` may be
/// empty when the feed entry carried no PDF link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Progress of one research run.
///
/// Mutated only under the engine's state mutex during concurrent
/// acquisition; snapshots handed to observers are deep copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchState {
    pub topic: String,
    pub collection_name: String,
    /// URL → claimed flag. A URL enters this map exactly once per run,
    /// at the moment a task claims it for acquisition.
    pub processed_urls: HashMap<String, bool>,
    /// Per-source summary strings, in completion order.
    pub accumulated_facts: Vec<String>,
    /// Sources that completed acquisition, for the final report.
    pub indexed_items: Vec<SearchResult>,
    pub iteration: u32,
    pub max_iterations: u32,
}

impl ResearchState {
    pub fn new(collection_name: &str) -> Self {
        Self {
            topic: String::new(),
            collection_name: collection_name.to_string(),
            processed_urls: HashMap::new(),
            accumulated_facts: Vec::new(),
            indexed_items: Vec::new(),
            iteration: 0,
            max_iterations: 5,
        }
    }
}

/// A document stored in a vector collection.
///
/// The metadata keys `source` and `title` are reserved by convention:
/// `source` drives the by-source lookups and search filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Present on write paths; read paths leave it empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A similarity search hit: the document plus `1 − cosine_distance`.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f64,
}
