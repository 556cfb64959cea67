//! Canonicalization: request inputs → ordered Block IR.
//!
//! Timestamps are assigned strictly monotonically in input order. Must-keep
//! defaults: every system and developer block plus the single most recent
//! user block. Constraint blocks are produced later, by the heuristics.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::block::{Block, BlockKind};
use crate::tokenizer::BoundCounter;

/// One chat message as the caller sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A tool schema; becomes one `Tool` block per schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub examples: Vec<Value>,
}

/// A retrieved document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocInput {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Output of an earlier tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool: String,
    pub content: String,
    /// Marks the output as log text, enabling log trimming.
    #[serde(default)]
    pub is_log: bool,
}

/// The full optimization request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
    #[serde(default)]
    pub docs: Vec<DocInput>,
    #[serde(default)]
    pub tool_outputs: Vec<ToolOutput>,
    pub target_model: String,
    pub tenant_id: String,
    #[serde(default)]
    pub budget_override: Option<usize>,
}

impl OptimizeRequest {
    pub fn new(messages: Vec<ChatMessage>, target_model: impl Into<String>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            docs: Vec::new(),
            tool_outputs: Vec::new(),
            target_model: target_model.into(),
            tenant_id: "default".to_string(),
            budget_override: None,
        }
    }
}

/// Convert all request inputs into a single ordered block list.
pub fn canonicalize(request: &OptimizeRequest, tokens: &BoundCounter) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut ts: i64 = 0;
    let mut next_ts = || {
        let t = ts;
        ts += 1;
        t
    };

    let last_user_index = request
        .messages
        .iter()
        .rposition(|m| m.role == "user");

    for (i, msg) in request.messages.iter().enumerate() {
        let (kind, must_keep, priority) = match msg.role.as_str() {
            "system" => (BlockKind::System, true, 1.0),
            "developer" => (BlockKind::Developer, true, 1.0),
            "user" => {
                let latest = last_user_index == Some(i);
                (BlockKind::User, latest, if latest { 0.9 } else { 0.7 })
            }
            "assistant" => (BlockKind::Assistant, false, 0.5),
            // Unknown roles are carried as low-priority assistant content
            // rather than dropped.
            _ => (BlockKind::Assistant, false, 0.3),
        };

        let count = tokens.count(&msg.content);
        blocks.push(
            Block::new(kind, msg.content.clone(), count, next_ts(), msg.role.clone())
                .must_keep(must_keep)
                .priority(priority),
        );
    }

    for schema in &request.tools {
        let content = schema_body(schema);
        let count = tokens.count(&content);
        blocks.push(
            Block::new(BlockKind::Tool, content, count, next_ts(), "tool-schema")
                .priority(0.8),
        );
    }

    for doc in &request.docs {
        // Blank docs waste tokens on nothing; skip them outright.
        if doc.content.trim().is_empty() {
            continue;
        }
        let count = tokens.count(&doc.content);
        blocks.push(
            Block::new(
                BlockKind::Doc,
                doc.content.clone(),
                count,
                next_ts(),
                format!("retrieved:{}", doc.id),
            )
            .priority(0.6),
        );
    }

    for output in &request.tool_outputs {
        let source = if output.is_log {
            format!("tool-output:{}:log", output.tool)
        } else {
            format!("tool-output:{}", output.tool)
        };
        let count = tokens.count(&output.content);
        blocks.push(
            Block::new(BlockKind::Tool, output.content.clone(), count, next_ts(), source)
                .priority(0.7),
        );
    }

    blocks
}

/// Serialize a tool schema into the block body. Descriptions and examples
/// are carried here and stripped later by schema minimization.
fn schema_body(schema: &ToolSchema) -> String {
    let mut body = serde_json::Map::new();
    body.insert("name".into(), Value::String(schema.name.clone()));
    if let Some(desc) = &schema.description {
        body.insert("description".into(), Value::String(desc.clone()));
    }
    body.insert("parameters".into(), schema.parameters.clone());
    body.insert(
        "required".into(),
        Value::Array(schema.required.iter().cloned().map(Value::String).collect()),
    );
    if !schema.examples.is_empty() {
        body.insert("examples".into(), Value::Array(schema.examples.clone()));
    }
    serde_json::to_string(&Value::Object(body)).unwrap_or_else(|_| schema.name.clone())
}

/// Project the final block list back into chat messages for forwarding.
/// Constraint blocks ride along as system messages so downstream providers
/// see them.
pub fn blocks_to_messages(blocks: &[Block]) -> Vec<ChatMessage> {
    blocks
        .iter()
        .filter_map(|b| {
            let role = match b.kind {
                BlockKind::System | BlockKind::Constraint => "system",
                BlockKind::Developer => "developer",
                BlockKind::User => "user",
                BlockKind::Assistant => "assistant",
                BlockKind::Tool | BlockKind::Doc => return None,
            };
            Some(ChatMessage::new(role, b.content.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::TokenCounter;
    use std::sync::Arc;

    struct WordCounter;
    impl TokenCounter for WordCounter {
        fn count(&self, text: &str, _model: &str) -> usize {
            text.split_whitespace().count()
        }
    }

    fn counter() -> BoundCounter {
        BoundCounter::new(Arc::new(WordCounter), "gpt-4")
    }

    #[test]
    fn only_latest_user_is_must_keep() {
        let request = OptimizeRequest::new(
            vec![
                ChatMessage::new("system", "Be terse."),
                ChatMessage::new("user", "first question"),
                ChatMessage::new("assistant", "first answer"),
                ChatMessage::new("user", "second question"),
            ],
            "gpt-4",
        );
        let blocks = canonicalize(&request, &counter());
        assert_eq!(blocks.len(), 4);
        assert!(blocks[0].must_keep);
        assert!(!blocks[1].must_keep);
        assert!(!blocks[2].must_keep);
        assert!(blocks[3].must_keep);
    }

    #[test]
    fn timestamps_are_strictly_monotonic() {
        let mut request = OptimizeRequest::new(
            vec![
                ChatMessage::new("system", "s"),
                ChatMessage::new("user", "u"),
            ],
            "gpt-4",
        );
        request.docs = vec![
            DocInput {
                id: "d1".into(),
                content: "doc one".into(),
                metadata: Value::Null,
            },
            DocInput {
                id: "d2".into(),
                content: "doc two".into(),
                metadata: Value::Null,
            },
        ];
        let blocks = canonicalize(&request, &counter());
        let stamps: Vec<i64> = blocks.iter().map(|b| b.timestamp).collect();
        for window in stamps.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn blank_docs_are_skipped() {
        let mut request = OptimizeRequest::new(vec![ChatMessage::new("user", "q")], "gpt-4");
        request.docs = vec![DocInput {
            id: "empty".into(),
            content: "   \n".into(),
            metadata: Value::Null,
        }];
        let blocks = canonicalize(&request, &counter());
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn tool_outputs_carry_log_tag() {
        let mut request = OptimizeRequest::new(vec![ChatMessage::new("user", "q")], "gpt-4");
        request.tool_outputs = vec![ToolOutput {
            tool: "build".into(),
            content: "ok".into(),
            is_log: true,
        }];
        let blocks = canonicalize(&request, &counter());
        assert_eq!(blocks[1].source, "tool-output:build:log");
    }

    #[test]
    fn messages_projection_keeps_chat_roles_only() {
        let mut request = OptimizeRequest::new(
            vec![
                ChatMessage::new("system", "s"),
                ChatMessage::new("user", "u"),
            ],
            "gpt-4",
        );
        request.docs = vec![DocInput {
            id: "d".into(),
            content: "doc".into(),
            metadata: Value::Null,
        }];
        let blocks = canonicalize(&request, &counter());
        let messages = blocks_to_messages(&blocks);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
    }
}
