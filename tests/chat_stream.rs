//! Streaming agent scenarios: event ordering, tool dispatch, cancellation.

mod support;

use serde_json::json;
use tokio::sync::mpsc;

use research_helper::chat::{run_agent, StreamEvent};
use research_helper::llm::{Content, ModelDelta};
use research_helper::models::Document;
use research_helper::tools::ToolRegistry;
use support::{RecordingStore, Reply, ScriptedModel, StubEmbedder};

fn doc(content: &str, source: &str) -> Document {
    let mut metadata = serde_json::Map::new();
    metadata.insert("source".to_string(), json!(source));
    metadata.insert("title".to_string(), json!("A Paper"));
    Document {
        id: String::new(),
        content: content.to_string(),
        metadata,
        embedding: None,
    }
}

fn registry_with(docs: Vec<Document>) -> ToolRegistry {
    ToolRegistry::new(RecordingStore::with_documents(docs), StubEmbedder::new())
}

async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_tool_call_then_content_event_order() {
    // Turn 1: the model calls search_content. Turn 2: it answers in two
    // chunks. Expected event order: tool_call, tool_result, content,
    // content. The service appends done after persistence.
    let llm = ScriptedModel::new(vec![
        Reply::Deltas(vec![ModelDelta::ToolCall {
            name: "search_content".to_string(),
            args: json!({"query": "hi"}),
        }]),
        Reply::Deltas(vec![
            ModelDelta::Text("Hello ".to_string()),
            ModelDelta::Text("there".to_string()),
        ]),
    ]);

    let tools = registry_with(vec![doc("Indexed fact.", "http://x/a.pdf")]);
    let (tx, rx) = mpsc::channel(32);

    let contents = vec![Content::user_text("hi")];
    let outcome = run_agent(llm.clone(), &tools, contents, &tx).await.unwrap();
    drop(tx);

    assert_eq!(outcome.as_deref(), Some("Hello there"));
    assert_eq!(llm.remaining(), 0);

    let events = drain(rx).await;
    let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(kinds, vec!["tool_call", "tool_result", "content", "content"]);

    // The tool_call payload carries id, name, and args; the result echoes
    // the same id.
    assert_eq!(events[0].payload["name"], "search_content");
    assert_eq!(events[0].payload["args"]["query"], "hi");
    assert_eq!(events[1].payload["id"], events[0].payload["id"]);
    assert!(events[1].payload["response"]["result"]
        .as_str()
        .unwrap()
        .contains("Indexed fact."));

    assert_eq!(events[2].payload, json!("Hello "));
    assert_eq!(events[3].payload, json!("there"));
}

#[tokio::test]
async fn test_plain_answer_without_tools() {
    let llm = ScriptedModel::new(vec![Reply::Deltas(vec![ModelDelta::Text(
        "Just an answer.".to_string(),
    )])]);

    let tools = registry_with(vec![]);
    let (tx, rx) = mpsc::channel(32);

    let outcome = run_agent(llm, &tools, vec![Content::user_text("hi")], &tx)
        .await
        .unwrap();
    drop(tx);

    assert_eq!(outcome.as_deref(), Some("Just an answer."));
    let events = drain(rx).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "content");
}

#[tokio::test]
async fn test_tool_failure_surfaces_error_and_run_continues() {
    // An unknown tool produces an error event; the loop feeds the error
    // back to the model and the run still completes.
    let llm = ScriptedModel::new(vec![
        Reply::Deltas(vec![ModelDelta::ToolCall {
            name: "not_a_tool".to_string(),
            args: json!({}),
        }]),
        Reply::Deltas(vec![ModelDelta::Text("Recovered.".to_string())]),
    ]);

    let tools = registry_with(vec![]);
    let (tx, rx) = mpsc::channel(32);

    let outcome = run_agent(llm, &tools, vec![Content::user_text("hi")], &tx)
        .await
        .unwrap();
    drop(tx);

    assert_eq!(outcome.as_deref(), Some("Recovered."));
    let events = drain(rx).await;
    let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(kinds, vec!["tool_call", "error", "content"]);
    assert!(events[1].payload.as_str().unwrap().contains("not_a_tool"));
}

#[tokio::test]
async fn test_dropped_consumer_abandons_run() {
    // Two content chunks scripted, but the consumer disappears after the
    // channel fills. run_agent must report the abandonment so nothing is
    // persisted.
    let llm = ScriptedModel::new(vec![Reply::Deltas(vec![
        ModelDelta::Text("first".to_string()),
        ModelDelta::Text("second".to_string()),
    ])]);

    let tools = registry_with(vec![]);
    let (tx, rx) = mpsc::channel(1);
    drop(rx);

    let outcome = run_agent(llm, &tools, vec![Content::user_text("hi")], &tx)
        .await
        .unwrap();
    assert!(outcome.is_none());
}

#[tokio::test]
async fn test_model_error_propagates() {
    let llm = ScriptedModel::new(vec![Reply::Err("model unreachable".to_string())]);
    let tools = registry_with(vec![]);
    let (tx, _rx) = mpsc::channel(32);

    let err = run_agent(llm, &tools, vec![Content::user_text("hi")], &tx)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("model unreachable"));
}
