//! Chat runtime: conversations, messages, and the streaming agent.
//!
//! `send_message` is the heart of this module. It persists the user
//! message, hydrates a fresh in-memory session from the conversation's
//! prior history, then runs a tool-calling agent loop against the model,
//! yielding incremental [`StreamEvent`]s over a bounded channel:
//!
//! ```text
//! content     → a chunk of assistant text
//! tool_call   → the agent invoked a tool {id, name, args}
//! tool_result → the tool finished {id, name, response}
//! error       → a mid-stream failure
//! done        → terminal marker after persistence
//! ```
//!
//! The consumer owns cancellation: when the receiving end is dropped, the
//! producer's next send fails and the run is abandoned; partial content
//! is never persisted. The assistant message is written only after the
//! stream completes naturally.

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::postgres::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::GeminiEmbedder;
use crate::llm::{Content, GenerateRequest, GeminiClient, LanguageModel, ModelDelta, Part};
use crate::tools::ToolRegistry;
use crate::vectorstore::PgVectorStore;

/// Session identity constants: one fixed app and user, one session per
/// conversation.
const APP_NAME: &str = "research-helper";
const USER_ID: &str = "user";
const AGENT_AUTHOR: &str = "research_helper";
const USER_AUTHOR: &str = "user";

const AGENT_INSTRUCTION: &str = "You are a helpful research assistant. Use the available tools \
    to search for information and answer the user's questions based on the retrieved content. \
    ALWAYS use search_content tool first. The answer format should be grouped by source, with a \
    unordered list of content pieces supporting the question. the format would be: \
    # Source: <source>, \n\n - <content>\n - <content>\n - <content>....";

/// A chat conversation row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted chat message. `role` is `"user"` or `"model"`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A single event in the chat stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            event_type: "content".to_string(),
            payload: Value::String(text.into()),
        }
    }

    pub fn tool_call(id: &str, name: &str, args: &Value) -> Self {
        Self {
            event_type: "tool_call".to_string(),
            payload: json!({ "id": id, "name": name, "args": args }),
        }
    }

    pub fn tool_result(id: &str, name: &str, response: &Value) -> Self {
        Self {
            event_type: "tool_result".to_string(),
            payload: json!({ "id": id, "name": name, "response": response }),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event_type: "error".to_string(),
            payload: Value::String(message.into()),
        }
    }

    pub fn done() -> Self {
        Self {
            event_type: "done".to_string(),
            payload: Value::String("done".to_string()),
        }
    }
}

/// Conversation and streaming-message service.
#[derive(Clone)]
pub struct ChatService {
    pool: PgPool,
    llm: Arc<dyn LanguageModel>,
    fast_llm: Arc<dyn LanguageModel>,
    tools: ToolRegistry,
}

impl ChatService {
    /// Wire the production service: reasoning + fast models and the
    /// retrieval toolset over the configured collection.
    pub fn new(pool: PgPool, config: &Config) -> Result<Self> {
        let llm = GeminiClient::new(&config.google_api_key, &config.reasoning_model)
            .with_context(|| "failed to create chat model")?;
        let fast_llm = GeminiClient::new(&config.google_api_key, &config.fast_model)
            .with_context(|| "failed to create title model")?;
        let embedder = GeminiEmbedder::new(&config.google_api_key, &config.embedding_model)
            .with_context(|| "failed to create embedder")?;
        let store = PgVectorStore::new(pool.clone(), &config.collection_name)?;

        Ok(Self {
            pool,
            llm: Arc::new(llm),
            fast_llm: Arc::new(fast_llm),
            tools: ToolRegistry::new(Arc::new(store), Arc::new(embedder)),
        })
    }

    /// The toolset bound to this service, shared with the MCP surface.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub async fn create_conversation(&self) -> Result<Conversation, sqlx::Error> {
        sqlx::query_as::<_, Conversation>(
            "INSERT INTO conversations DEFAULT VALUES RETURNING id, title, created_at, updated_at",
        )
        .fetch_one(&self.pool)
        .await
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, sqlx::Error> {
        sqlx::query_as::<_, Conversation>(
            "SELECT id, title, created_at, updated_at FROM conversations ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// All messages of a conversation in creation order.
    pub async fn get_history(&self, conversation_id: Uuid) -> Result<Vec<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            "SELECT id, conversation_id, role, content, created_at FROM messages \
             WHERE conversation_id = $1 ORDER BY created_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Persist the user message and start a streaming agent run.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        content: String,
    ) -> Result<ReceiverStream<StreamEvent>> {
        // 1. Save the user message. Failing here fails the request.
        let user_msg_id: Uuid = sqlx::query_scalar(
            "INSERT INTO messages (conversation_id, role, content) VALUES ($1, 'user', $2) \
             RETURNING id",
        )
        .bind(conversation_id)
        .bind(&content)
        .fetch_one(&self.pool)
        .await
        .with_context(|| "failed to save user message")?;

        // 2. Hydrate a fresh session from history, excluding the message
        //    we just saved.
        let history = self
            .get_history(conversation_id)
            .await
            .with_context(|| "failed to fetch history")?;
        let mut contents = hydrate_session(&history, user_msg_id);
        contents.push(Content::user_text(content.clone()));

        let (tx, rx) = mpsc::channel::<StreamEvent>(32);
        let llm = Arc::clone(&self.llm);
        let fast_llm = Arc::clone(&self.fast_llm);
        let tools = self.tools.clone();
        let pool = self.pool.clone();
        let history_len = history.len();

        tokio::spawn(async move {
            tracing::info!(
                app = APP_NAME,
                user = USER_ID,
                session = %conversation_id,
                "starting agent run"
            );

            let outcome = run_agent(llm, &tools, contents, &tx).await;

            let final_response = match outcome {
                Err(e) => {
                    tracing::error!(error = %e, "agent run failed");
                    let _ = tx.send(StreamEvent::error(e.to_string())).await;
                    return;
                }
                // Consumer went away; abandon without persisting.
                Ok(None) => return,
                Ok(Some(text)) => text,
            };

            tracing::info!("agent run completed");

            // Persist the assistant reply only after natural completion.
            let saved = sqlx::query(
                "INSERT INTO messages (conversation_id, role, content) VALUES ($1, 'model', $2)",
            )
            .bind(conversation_id)
            .bind(&final_response)
            .execute(&pool)
            .await;

            match saved {
                Err(e) => tracing::error!(error = %e, "failed to save model message"),
                Ok(_) => {
                    let _ = sqlx::query(
                        "UPDATE conversations SET updated_at = NOW() WHERE id = $1",
                    )
                    .bind(conversation_id)
                    .execute(&pool)
                    .await;
                }
            }

            let _ = tx.send(StreamEvent::done()).await;

            // First exchange: derive a title in the background.
            if history_len <= 2 {
                tokio::spawn(generate_title(
                    pool,
                    fast_llm,
                    conversation_id,
                    content,
                    final_response,
                ));
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}

/// Map persisted messages into session turns, excluding `exclude`.
///
/// Role `"model"` replays as the agent author, everything else as the
/// user author.
fn hydrate_session(history: &[Message], exclude: Uuid) -> Vec<Content> {
    history
        .iter()
        .filter(|m| m.id != exclude)
        .map(|m| {
            let (role, author) = if m.role == "model" {
                ("model", AGENT_AUTHOR)
            } else {
                ("user", USER_AUTHOR)
            };
            tracing::debug!(author, "hydrating session event");
            Content {
                role: role.to_string(),
                parts: vec![Part::Text(m.content.clone())],
            }
        })
        .collect()
}

/// Drive the tool-calling loop until the model stops requesting tools.
///
/// Returns `Ok(None)` when the event consumer disappears mid-run, and the
/// concatenated assistant text otherwise. Tool failures are surfaced as
/// `error` events and echoed back to the model without ending the run.
pub async fn run_agent(
    llm: Arc<dyn LanguageModel>,
    tools: &ToolRegistry,
    mut contents: Vec<Content>,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<Option<String>> {
    let mut final_response = String::new();

    loop {
        let req = GenerateRequest {
            system: Some(AGENT_INSTRUCTION.to_string()),
            contents: contents.clone(),
            response_schema: None,
            tools: tools.declarations(),
        };

        let mut stream = llm.stream(req).await?;
        let mut turn_text = String::new();
        let mut calls: Vec<(String, String, Value)> = Vec::new();

        while let Some(delta) = stream.next().await {
            match delta? {
                ModelDelta::Text(text) => {
                    final_response.push_str(&text);
                    turn_text.push_str(&text);
                    if tx.send(StreamEvent::content(text)).await.is_err() {
                        return Ok(None);
                    }
                }
                ModelDelta::ToolCall { name, args } => {
                    let call_id = Uuid::new_v4().to_string();
                    tracing::info!(tool = %name, "agent tool call");
                    if tx
                        .send(StreamEvent::tool_call(&call_id, &name, &args))
                        .await
                        .is_err()
                    {
                        return Ok(None);
                    }
                    calls.push((call_id, name, args));
                }
            }
        }

        if calls.is_empty() {
            break;
        }

        // Record the model's turn, then feed every tool result back.
        let mut model_parts = Vec::new();
        if !turn_text.is_empty() {
            model_parts.push(Part::Text(turn_text));
        }
        for (_, name, args) in &calls {
            model_parts.push(Part::FunctionCall {
                name: name.clone(),
                args: args.clone(),
            });
        }
        contents.push(Content {
            role: "model".to_string(),
            parts: model_parts,
        });

        let mut response_parts = Vec::new();
        for (call_id, name, args) in calls {
            let result = match tools.find(&name) {
                Some(tool) => tool.execute(args).await,
                None => Err(anyhow::anyhow!("unknown tool: {name}")),
            };

            match result {
                Ok(text) => {
                    let response = json!({ "result": text });
                    tracing::info!(tool = %name, "agent tool result");
                    if tx
                        .send(StreamEvent::tool_result(&call_id, &name, &response))
                        .await
                        .is_err()
                    {
                        return Ok(None);
                    }
                    response_parts.push(Part::FunctionResponse {
                        name: name.clone(),
                        response,
                    });
                }
                Err(e) => {
                    tracing::warn!(tool = %name, error = %e, "tool execution failed");
                    if tx.send(StreamEvent::error(e.to_string())).await.is_err() {
                        return Ok(None);
                    }
                    response_parts.push(Part::FunctionResponse {
                        name: name.clone(),
                        response: json!({ "error": e.to_string() }),
                    });
                }
            }
        }
        contents.push(Content {
            role: "user".to_string(),
            parts: response_parts,
        });
    }

    Ok(Some(final_response))
}

/// Generate a short conversation title from the first exchange.
///
/// Runs detached from the request under a hard 10-second timeout; any
/// failure leaves the placeholder title in place.
async fn generate_title(
    pool: PgPool,
    fast_llm: Arc<dyn LanguageModel>,
    conversation_id: Uuid,
    user_msg: String,
    model_msg: String,
) {
    let req = GenerateRequest {
        contents: vec![Content::user_text(format!(
            "Generate a short, concise title (max 5 words) for this chat conversation:\n\
             User: {user_msg}\nModel: {model_msg}"
        ))],
        response_schema: Some(json!({
            "type": "object",
            "properties": { "title": { "type": "string" } },
            "required": ["title"]
        })),
        ..Default::default()
    };

    let generated = tokio::time::timeout(Duration::from_secs(10), fast_llm.generate(req)).await;

    let content = match generated {
        Err(_) => {
            tracing::warn!("title generation timed out");
            return;
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "title generation failed");
            return;
        }
        Ok(Ok(content)) => content,
    };

    #[derive(serde::Deserialize)]
    struct TitleResponse {
        title: String,
    }

    let parsed: TitleResponse = match serde_json::from_str(&content) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, raw = %content, "failed to parse title response");
            return;
        }
    };

    if parsed.title.is_empty() {
        return;
    }

    if let Err(e) = sqlx::query("UPDATE conversations SET title = $2 WHERE id = $1")
        .bind(conversation_id)
        .bind(&parsed.title)
        .execute(&pool)
        .await
    {
        tracing::error!(error = %e, "failed to update conversation title");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_event_wire_shapes() {
        let event = StreamEvent::content("hello");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({ "type": "content", "payload": "hello" }));

        let event = StreamEvent::done();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({ "type": "done", "payload": "done" }));

        let event = StreamEvent::tool_call("c1", "search_content", &json!({"query": "q"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["payload"]["name"], "search_content");
        assert_eq!(value["payload"]["args"]["query"], "q");
    }

    #[test]
    fn test_hydrate_session_maps_roles_and_excludes_current() {
        let conversation_id = Uuid::new_v4();
        let current = Uuid::new_v4();
        let mk = |id: Uuid, role: &str, content: &str| Message {
            id,
            conversation_id,
            role: role.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let history = vec![
            mk(Uuid::new_v4(), "user", "first question"),
            mk(Uuid::new_v4(), "model", "first answer"),
            mk(current, "user", "second question"),
        ];

        let contents = hydrate_session(&history, current);
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0].role, "user");
        assert_eq!(contents[1].role, "model");
        assert!(
            matches!(&contents[1].parts[0], Part::Text(t) if t == "first answer")
        );
    }
}
