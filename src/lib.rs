//! Research Helper: an autonomous research agent with a retrieval store.
//!
//! Given a free-text topic, the [`engine::ResearchEngine`] drives a
//! language model through a Plan → Source → Filter → Acquire/Index →
//! Reflect loop, persisting every acquired document into a
//! pgvector-backed collection, and finally synthesizes a Markdown report.
//! The [`chat`] runtime answers retrieval-grounded questions over the
//! same collection through a streaming, tool-calling agent.
//!
//! # Modules
//!
//! - **config**: environment-driven settings
//! - **db**: connection pool and schema management
//! - **models**: shared value types (search results, research state, documents)
//! - **vectorstore**: per-collection tables, kNN search, metadata filter compiler
//! - **llm** / **embedding**: Gemini clients behind trait seams
//! - **arxiv** / **scraper**: source feed and OCR adapters
//! - **splitter**: recursive-character chunking
//! - **jobs**: durable job records and structured per-job logs
//! - **engine**: the research loop orchestrator
//! - **tools** / **chat**: retrieval toolset and the streaming chat agent
//! - **server** / **mcp**: HTTP surface and the JSON-RPC tool bridge

pub mod arxiv;
pub mod chat;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod jobs;
pub mod llm;
pub mod mcp;
pub mod models;
pub mod scraper;
pub mod server;
pub mod splitter;
pub mod tools;
pub mod vectorstore;
