//! Language model abstraction and the Gemini implementation.
//!
//! [`LanguageModel`] is the seam between the orchestrator / chat runtime
//! and the model provider: a single-shot [`generate`](LanguageModel::generate)
//! (optionally schema-constrained JSON output) and an incremental
//! [`stream`](LanguageModel::stream) that yields text chunks and tool calls
//! as the model produces them.
//!
//! [`GeminiClient`] talks to the Generative Language REST API directly:
//! `models/{model}:generateContent` for one-shot calls and
//! `models/{model}:streamGenerateContent?alt=sse` for streaming. Retry
//! policy is deliberately *not* implemented here; callers own it.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// One piece of a conversation turn.
#[derive(Debug, Clone)]
pub enum Part {
    Text(String),
    FunctionCall { name: String, args: Value },
    FunctionResponse { name: String, response: Value },
}

/// A conversation turn with a role of `"user"` or `"model"`.
#[derive(Debug, Clone)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: "model".to_string(),
            parts: vec![Part::Text(text.into())],
        }
    }
}

/// A tool the model may call, with its JSON input schema.
#[derive(Debug, Clone)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A fully assembled generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub system: Option<String>,
    pub contents: Vec<Content>,
    /// When set, the model is put in JSON-output mode constrained by this schema.
    pub response_schema: Option<Value>,
    pub tools: Vec<ToolDeclaration>,
}

/// An incremental piece of model output.
#[derive(Debug, Clone)]
pub enum ModelDelta {
    Text(String),
    ToolCall { name: String, args: Value },
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<ModelDelta>> + Send>>;

/// Seam over the model provider. Implemented by [`GeminiClient`] in
/// production and by scripted fakes in tests.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run one generation to completion and return the concatenated text.
    async fn generate(&self, req: GenerateRequest) -> Result<String>;

    /// Run one generation incrementally.
    async fn stream(&self, req: GenerateRequest) -> Result<DeltaStream>;
}

/// Client for the Gemini REST API.
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: &str, model: &str) -> Result<Self> {
        if api_key.is_empty() {
            bail!("GOOGLE_API_KEY is not set");
        }
        Ok(Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    fn build_body(req: &GenerateRequest) -> Value {
        let contents: Vec<Value> = req.contents.iter().map(content_to_json).collect();
        let mut body = json!({ "contents": contents });

        if let Some(system) = &req.system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        if let Some(schema) = &req.response_schema {
            body["generationConfig"] = json!({
                "responseMimeType": "application/json",
                "responseSchema": schema,
            });
        }
        if !req.tools.is_empty() {
            let declarations: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }

        body
    }
}

fn content_to_json(content: &Content) -> Value {
    let parts: Vec<Value> = content
        .parts
        .iter()
        .map(|part| match part {
            Part::Text(text) => json!({ "text": text }),
            Part::FunctionCall { name, args } => {
                json!({ "functionCall": { "name": name, "args": args } })
            }
            Part::FunctionResponse { name, response } => {
                json!({ "functionResponse": { "name": name, "response": response } })
            }
        })
        .collect();

    json!({ "role": content.role, "parts": parts })
}

/// Extract the deltas carried by one `GenerateContentResponse` payload.
fn extract_deltas(payload: &Value) -> Vec<ModelDelta> {
    let mut deltas = Vec::new();

    let parts = payload
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array());

    if let Some(parts) = parts {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                if !text.is_empty() {
                    deltas.push(ModelDelta::Text(text.to_string()));
                }
            }
            if let Some(call) = part.get("functionCall") {
                let name = call
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string();
                let args = call.get("args").cloned().unwrap_or(Value::Null);
                deltas.push(ModelDelta::ToolCall { name, args });
            }
        }
    }

    deltas
}

/// Parse one SSE line; returns the JSON payload of a `data:` frame.
fn parse_sse_line(line: &str) -> Option<Value> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    serde_json::from_str(data).ok()
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn generate(&self, req: GenerateRequest) -> Result<String> {
        let url = format!(
            "{API_BASE}/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let body = Self::build_body(&req);

        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .with_context(|| "llm request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("Gemini API error {}: {}", status, body_text);
        }

        let payload: Value = resp.json().await?;
        let mut out = String::new();
        for delta in extract_deltas(&payload) {
            if let ModelDelta::Text(text) = delta {
                out.push_str(&text);
            }
        }

        if out.is_empty() {
            bail!("llm returned no candidates");
        }
        Ok(out)
    }

    async fn stream(&self, req: GenerateRequest) -> Result<DeltaStream> {
        let url = format!(
            "{API_BASE}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.model, self.api_key
        );
        let body = Self::build_body(&req);

        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .with_context(|| "llm stream request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("Gemini API error {}: {}", status, body_text);
        }

        let (tx, rx) = mpsc::channel::<Result<ModelDelta>>(32);

        // The reader task ends as soon as the receiver is dropped, which
        // also drops the HTTP response and releases the connection.
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);

                    if let Some(payload) = parse_sse_line(&line) {
                        for delta in extract_deltas(&payload) {
                            if tx.send(Ok(delta)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_body_json_mode() {
        let req = GenerateRequest {
            system: Some("You are a planner.".to_string()),
            contents: vec![Content::user_text("Topic: lasers")],
            response_schema: Some(json!({"type": "object"})),
            tools: vec![],
        };
        let body = GeminiClient::build_body(&req);
        assert_eq!(
            body.pointer("/generationConfig/responseMimeType").unwrap(),
            "application/json"
        );
        assert_eq!(
            body.pointer("/systemInstruction/parts/0/text").unwrap(),
            "You are a planner."
        );
        assert_eq!(body.pointer("/contents/0/role").unwrap(), "user");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_build_body_tool_declarations() {
        let req = GenerateRequest {
            contents: vec![Content::user_text("hi")],
            tools: vec![ToolDeclaration {
                name: "search_content".to_string(),
                description: "Semantic search.".to_string(),
                parameters: json!({"type": "object"}),
            }],
            ..Default::default()
        };
        let body = GeminiClient::build_body(&req);
        assert_eq!(
            body.pointer("/tools/0/functionDeclarations/0/name").unwrap(),
            "search_content"
        );
    }

    #[test]
    fn test_function_turns_serialize() {
        let content = Content {
            role: "model".to_string(),
            parts: vec![Part::FunctionCall {
                name: "search_content".to_string(),
                args: json!({"query": "q"}),
            }],
        };
        let value = content_to_json(&content);
        assert_eq!(
            value.pointer("/parts/0/functionCall/name").unwrap(),
            "search_content"
        );
    }

    #[test]
    fn test_extract_text_and_tool_deltas() {
        let payload = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "hello"},
                        {"functionCall": {"name": "search_content", "args": {"query": "x"}}}
                    ]
                }
            }]
        });
        let deltas = extract_deltas(&payload);
        assert_eq!(deltas.len(), 2);
        assert!(matches!(&deltas[0], ModelDelta::Text(t) if t == "hello"));
        assert!(
            matches!(&deltas[1], ModelDelta::ToolCall { name, .. } if name == "search_content")
        );
    }

    #[test]
    fn test_parse_sse_line() {
        assert!(parse_sse_line(": comment").is_none());
        assert!(parse_sse_line("data:").is_none());
        assert!(parse_sse_line("data: [DONE]").is_none());
        let value = parse_sse_line(r#"data: {"candidates": []}"#).unwrap();
        assert!(value.get("candidates").is_some());
    }
}
