//! Request and response translation between the Messages API and Cloud Code.
//!
//! Inbound requests follow the Anthropic Messages shape. They are rewritten
//! into the Cloud Code envelope `{project, model, request, userAgent,
//! requestId}` whose `request` is a Gemini `generateContent` body. Single
//! payload responses are translated back into one Messages API object; the
//! incremental path lives in `stream.rs`.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

use crate::config::ModelMappingEntry;
use crate::error::ApiError;

/// Model used when the request does not name one.
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";

/// JSON Schema keywords Gemini function declarations reject.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "additionalProperties"];

/// Inbound `POST /v1/messages` body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagesRequest {
    #[serde(default = "default_model")]
    pub model: String,
    pub messages: Vec<Message>,
    /// Any truthy JSON value turns streaming on.
    #[serde(default, deserialize_with = "truthy")]
    pub stream: bool,
    #[serde(default)]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub tools: Option<Vec<Tool>>,
    #[serde(default)]
    pub thinking: Option<ThinkingConfig>,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

/// JavaScript-style truthiness: non-zero numbers, non-empty strings, arrays
/// and objects are true.
fn truthy<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => false,
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    })
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageSource {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemBlock {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub budget_tokens: Option<u32>,
}

impl MessagesRequest {
    /// Parse and validate a request body.
    pub fn from_slice(body: &[u8]) -> Result<Self, ApiError> {
        let request: MessagesRequest = serde_json::from_slice(body)
            .map_err(|e| ApiError::validation(format!("invalid request body: {e}")))?;
        if request.messages.is_empty() {
            return Err(ApiError::validation("messages must not be empty"));
        }
        if let Some(bad) = request
            .messages
            .iter()
            .find(|m| m.role != "user" && m.role != "assistant")
        {
            return Err(ApiError::validation(format!(
                "unsupported message role: {}",
                bad.role
            )));
        }
        Ok(request)
    }
}

/// Upstream model for an inbound model name. Unmapped names pass through.
pub fn resolve_model(mapping: &HashMap<String, ModelMappingEntry>, requested: &str) -> String {
    mapping
        .get(requested)
        .and_then(|entry| entry.mapping.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| requested.to_string())
}

/// Cloud Code envelope for one generation call.
pub fn build_upstream_request(request: &MessagesRequest, model: &str, project: &str) -> Value {
    let mut inner = Map::new();
    inner.insert("contents".into(), Value::Array(build_contents(&request.messages)));

    if let Some(system) = system_instruction(request.system.as_ref()) {
        inner.insert("systemInstruction".into(), system);
    }

    inner.insert("generationConfig".into(), generation_config(request));

    if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                let mut declaration = json!({
                    "name": tool.name,
                    "parameters": clean_schema(tool.input_schema.clone()),
                });
                if let Some(description) = &tool.description {
                    declaration["description"] = Value::String(description.clone());
                }
                declaration
            })
            .collect();
        inner.insert(
            "tools".into(),
            json!([{ "functionDeclarations": declarations }]),
        );
    }

    json!({
        "project": project,
        "model": model,
        "request": Value::Object(inner),
        "userAgent": cloudcode::REQUEST_USER_AGENT,
        "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
    })
}

fn build_contents(messages: &[Message]) -> Vec<Value> {
    // tool_result blocks only carry the call id; Gemini wants the function name
    let mut tool_names: HashMap<String, String> = HashMap::new();
    let mut contents = Vec::with_capacity(messages.len());

    for message in messages {
        let role = if message.role == "assistant" { "model" } else { "user" };
        let parts: Vec<Value> = match &message.content {
            MessageContent::Text(text) => vec![json!({ "text": text })],
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| block_to_part(block, &mut tool_names))
                .collect(),
        };
        if parts.is_empty() {
            continue;
        }
        contents.push(json!({ "role": role, "parts": parts }));
    }
    contents
}

fn block_to_part(block: &ContentBlock, tool_names: &mut HashMap<String, String>) -> Option<Value> {
    match block {
        ContentBlock::Text { text } => Some(json!({ "text": text })),
        ContentBlock::Image { source } => Some(json!({
            "inlineData": {
                "mimeType": source.media_type.as_deref().unwrap_or("image/png"),
                "data": source.data.as_deref().unwrap_or_default(),
            }
        })),
        ContentBlock::ToolUse { id, name, input } => {
            tool_names.insert(id.clone(), name.clone());
            let args = if input.is_null() { json!({}) } else { input.clone() };
            Some(json!({ "functionCall": { "id": id, "name": name, "args": args } }))
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let name = tool_names
                .get(tool_use_id)
                .cloned()
                .unwrap_or_else(|| tool_use_id.clone());
            let key = if is_error.unwrap_or(false) { "error" } else { "result" };
            Some(json!({
                "functionResponse": {
                    "id": tool_use_id,
                    "name": name,
                    "response": { key: tool_result_text(content) },
                }
            }))
        }
        ContentBlock::Thinking {
            thinking,
            signature,
        } => {
            let mut part = json!({ "text": thinking, "thought": true });
            if let Some(signature) = signature.as_ref().filter(|s| !s.is_empty()) {
                part["thoughtSignature"] = Value::String(signature.clone());
            }
            Some(part)
        }
        ContentBlock::Unsupported => None,
    }
}

/// Flatten tool_result content (string or text blocks) into one string.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn system_instruction(system: Option<&SystemPrompt>) -> Option<Value> {
    let text = match system? {
        SystemPrompt::Text(text) => text.clone(),
        SystemPrompt::Blocks(blocks) => blocks
            .iter()
            .map(|b| b.text.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
    };
    if text.is_empty() {
        return None;
    }
    Some(json!({ "role": "user", "parts": [{ "text": text }] }))
}

fn generation_config(request: &MessagesRequest) -> Value {
    let mut config = Map::new();
    if let Some(max_tokens) = request.max_tokens {
        config.insert("maxOutputTokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        config.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        config.insert("topP".into(), json!(top_p));
    }
    if let Some(top_k) = request.top_k {
        config.insert("topK".into(), json!(top_k));
    }
    if let Some(stop) = request.stop_sequences.as_ref().filter(|s| !s.is_empty()) {
        config.insert("stopSequences".into(), json!(stop));
    }
    if let Some(thinking) = request.thinking.as_ref().filter(|t| t.kind == "enabled") {
        let mut thinking_config = json!({ "includeThoughts": true });
        if let Some(budget) = thinking.budget_tokens {
            thinking_config["thinkingBudget"] = json!(budget);
        }
        config.insert("thinkingConfig".into(), thinking_config);
    }
    Value::Object(config)
}

/// Strip schema keywords Gemini rejects, recursively.
fn clean_schema(schema: Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k, clean_schema(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(clean_schema).collect()),
        Value::Null => json!({ "type": "object", "properties": {} }),
        other => other,
    }
}

/// Token counts reported on responses and `message_delta` events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl Usage {
    /// Read Gemini `usageMetadata`; absent fields count as zero.
    pub fn from_metadata(metadata: &Value) -> Self {
        let count = |key: &str| metadata.get(key).and_then(Value::as_u64).unwrap_or(0);
        let cached = count("cachedContentTokenCount");
        Self {
            input_tokens: count("promptTokenCount").saturating_sub(cached),
            output_tokens: count("candidatesTokenCount") + count("thoughtsTokenCount"),
            cache_read_input_tokens: cached,
        }
    }
}

/// Map a Gemini finish reason to a Messages API stop reason.
pub fn stop_reason(finish_reason: Option<&str>, saw_tool_use: bool) -> &'static str {
    if saw_tool_use {
        return "tool_use";
    }
    match finish_reason {
        Some("MAX_TOKENS") => "max_tokens",
        _ => "end_turn",
    }
}

/// Fresh `msg_` identifier.
pub fn message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().as_simple())
}

/// Fresh `toolu_` identifier for calls the upstream left unnamed.
pub fn tool_use_id() -> String {
    format!("toolu_{}", uuid::Uuid::new_v4().as_simple())
}

/// Translate a single-payload Gemini response into a Messages API object.
pub fn translate_response(response: &Value, model: &str) -> Value {
    let candidate = response
        .get("candidates")
        .and_then(|c| c.get(0))
        .cloned()
        .unwrap_or(Value::Null);
    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut content = Vec::new();
    let mut saw_tool_use = false;
    for part in &parts {
        if let Some(call) = part.get("functionCall") {
            saw_tool_use = true;
            content.push(json!({
                "type": "tool_use",
                "id": call.get("id").and_then(Value::as_str).map(str::to_string).unwrap_or_else(tool_use_id),
                "name": call.get("name").and_then(Value::as_str).unwrap_or_default(),
                "input": call.get("args").cloned().unwrap_or_else(|| json!({})),
            }));
        } else if part.get("thought").and_then(Value::as_bool) == Some(true) {
            content.push(json!({
                "type": "thinking",
                "thinking": part.get("text").and_then(Value::as_str).unwrap_or_default(),
                "signature": part.get("thoughtSignature").and_then(Value::as_str).unwrap_or_default(),
            }));
        } else if let Some(text) = part.get("text").and_then(Value::as_str) {
            if !text.is_empty() {
                content.push(json!({ "type": "text", "text": text }));
            }
        }
    }

    let finish_reason = candidate.get("finishReason").and_then(Value::as_str);
    let usage = Usage::from_metadata(response.get("usageMetadata").unwrap_or(&Value::Null));

    json!({
        "id": message_id(),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason(finish_reason, saw_tool_use),
        "stop_sequence": null,
        "usage": usage,
    })
}
