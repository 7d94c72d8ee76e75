//! [`LlmRequest`] → Gemini `generateContent` request body.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Map, Value};

use serena_core::messages::{Content, Part, Role};
use serena_core::provider::{LlmRequest, Modality};
use serena_core::tools::ToolDefinition;

/// Build the JSON body for a streaming or unary call.
pub fn build_request_body(request: &LlmRequest) -> Value {
    let mut body = Map::new();

    if let Some(system) = request.system_instruction.as_deref().filter(|s| !s.is_empty()) {
        body.insert(
            "systemInstruction".into(),
            json!({ "parts": [{ "text": system }] }),
        );
    }

    body.insert(
        "contents".into(),
        Value::Array(request.contents.iter().map(convert_content).collect()),
    );

    if !request.tools.is_empty() {
        body.insert(
            "tools".into(),
            json!([{ "functionDeclarations": convert_tools(&request.tools) }]),
        );
    }

    let config = &request.config;
    let mut generation = Map::new();
    if let Some(t) = config.temperature {
        generation.insert("temperature".into(), json!(t));
    }
    if let Some(mime) = &config.response_mime_type {
        generation.insert("responseMimeType".into(), json!(mime));
    }
    if !config.response_modalities.is_empty() {
        let modalities: Vec<&str> = config
            .response_modalities
            .iter()
            .map(|m| match m {
                Modality::Text => "TEXT",
                Modality::Audio => "AUDIO",
            })
            .collect();
        generation.insert("responseModalities".into(), json!(modalities));
    }
    if let Some(voice) = &config.voice_name {
        generation.insert(
            "speechConfig".into(),
            json!({ "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } } }),
        );
    }
    if !generation.is_empty() {
        body.insert("generationConfig".into(), Value::Object(generation));
    }

    Value::Object(body)
}

fn convert_content(content: &Content) -> Value {
    // Gemini only knows `user` and `model` turns.
    let role = match content.role {
        Role::Model => "model",
        Role::User | Role::System => "user",
    };
    let parts: Vec<Value> = content.parts.iter().map(convert_part).collect();
    json!({ "role": role, "parts": parts })
}

fn convert_part(part: &Part) -> Value {
    match part {
        Part::Text { text } => json!({ "text": text }),
        Part::InlineData { blob } => json!({
            "inlineData": {
                "mimeType": blob.mime_type,
                "data": STANDARD.encode(&blob.data),
            }
        }),
        Part::FunctionCall { name, args } => json!({
            "functionCall": { "name": name, "args": args }
        }),
        Part::FunctionResponse { name, response } => json!({
            "functionResponse": { "name": name, "response": response }
        }),
    }
}

/// Tool definitions → `functionDeclarations`.
pub fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "parameters": sanitize_schema(&t.parameters_schema),
            })
        })
        .collect()
}

/// Strip JSON-schema keys the Gemini API rejects.
pub fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| k.as_str() != "additionalProperties" && k.as_str() != "$schema")
                .map(|(k, v)| (k.clone(), sanitize_schema(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}
