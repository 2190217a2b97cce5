//! `{{field}}` template substitution.
//!
//! REST body trees are rewritten recursively: a string leaf containing both
//! `{{` and `}}` is replaced by the message value for the enclosed field
//! name, preserving its JSON type. GraphQL operations are flat strings; each
//! `{{key}}` occurrence is replaced by the value's JSON text, so strings
//! come out quoted and numbers and booleans keep their natural form.

use serde_json::Value;
use thiserror::Error;

use konsume_common::MessageData;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RenderError {
    #[error("field {0} not found in message")]
    FieldNotFound(String),

    #[error("unsupported type for field {0}")]
    UnsupportedType(String),

    #[error("failed to serialize body: {0}")]
    Serialize(String),
}

/// Render a REST body template against a parsed message, returning the JSON
/// body bytes.
pub fn render_rest(template: &MessageData, message: &MessageData) -> Result<Vec<u8>, RenderError> {
    let rendered = render_map(template, message)?;
    serde_json::to_vec(&Value::Object(rendered)).map_err(|e| RenderError::Serialize(e.to_string()))
}

fn render_map(template: &MessageData, message: &MessageData) -> Result<MessageData, RenderError> {
    let mut out = MessageData::new();
    for (key, value) in template {
        out.insert(key.clone(), render_value(value, message)?);
    }
    Ok(out)
}

fn render_value(value: &Value, message: &MessageData) -> Result<Value, RenderError> {
    match value {
        Value::String(s) if s.contains("{{") && s.contains("}}") => {
            // The field name is the leaf with every brace stripped; a key
            // like `a.b` is a single flat key, there is no path descent.
            let field = s.trim_matches(|c| c == '{' || c == '}');
            message
                .get(field)
                .cloned()
                .ok_or_else(|| RenderError::FieldNotFound(field.to_string()))
        }
        Value::Object(map) => Ok(Value::Object(render_map(map, message)?)),
        other => Ok(other.clone()),
    }
}

/// Pull the operation string out of a GraphQL route body (`query` wins over
/// `mutation` when both are present).
pub fn graphql_operation(body: &MessageData) -> Option<&str> {
    body.get("query")
        .and_then(Value::as_str)
        .or_else(|| body.get("mutation").and_then(Value::as_str))
}

/// Substitute `{{key}}` placeholders in a GraphQL operation string.
///
/// Only keys present in the message are substituted; placeholders for
/// absent keys are left untouched. Values other than strings, numbers and
/// booleans are unsupported.
pub fn render_graphql(operation: &str, message: &MessageData) -> Result<String, RenderError> {
    let mut rendered = operation.to_string();
    for (key, value) in message {
        let placeholder = format!("{{{{{key}}}}}");
        if !rendered.contains(&placeholder) {
            continue;
        }
        let replacement = match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => serde_json::to_string(value)
                .map_err(|e| RenderError::Serialize(e.to_string()))?,
            _ => return Err(RenderError::UnsupportedType(key.clone())),
        };
        rendered = rendered.replace(&placeholder, &replacement);
    }
    Ok(rendered)
}
