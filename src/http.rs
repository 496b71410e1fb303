//! Pure request-side helpers: path templating, envelope building, and the
//! status/body half of error mapping. Nothing here performs I/O.

use reqwest::StatusCode;
use serde_json::{Map, Value};

use crate::errors::{DifyApiError, Result};

pub(crate) const USER_FIELD: &str = "user";
pub(crate) const RESPONSE_MODE_FIELD: &str = "response_mode";

/// Resolves `:name` placeholders in a route template.
///
/// Every placeholder must have a matching value; a template with an
/// unresolved token never reaches the transport.
pub(crate) fn resolve_path(template: &str, params: &[(&str, &str)]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(idx) = rest.find(':') {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx + 1..];
        let token_len = tail
            .chars()
            .take_while(|c| c.is_ascii_alphabetic() || *c == '_')
            .count();
        if token_len == 0 {
            out.push(':');
            rest = tail;
            continue;
        }
        let token = &tail[..token_len];
        let value = params
            .iter()
            .find(|(key, _)| *key == token)
            .map(|(_, value)| *value)
            .ok_or_else(|| DifyApiError::message(format!("missing path parameter :{token}")))?;
        out.push_str(value);
        rest = &tail[token_len..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Builds the outgoing request envelope: the payload fields plus the caller
/// identity, and a response mode when one was requested.
pub(crate) fn complete_envelope(
    payload: Map<String, Value>,
    user: &str,
    streaming: Option<bool>,
) -> Map<String, Value> {
    let mut envelope = payload;
    envelope.insert(USER_FIELD.to_string(), Value::String(user.to_string()));
    if let Some(streaming) = streaming {
        let mode = if streaming { "streaming" } else { "blocking" };
        envelope.insert(
            RESPONSE_MODE_FIELD.to_string(),
            Value::String(mode.to_string()),
        );
    }
    envelope
}

/// Flattens an envelope into query pairs for GET requests. Strings pass
/// through verbatim, every other value keeps its JSON rendering.
pub(crate) fn query_pairs(envelope: &Map<String, Value>) -> Vec<(String, String)> {
    envelope
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), rendered)
        })
        .collect()
}

/// Maps a non-success status and its body text into the typed error.
///
/// The body is expected to be the server's `{code, message, ...}` object;
/// remaining fields ride along as extra context. A body that does not decode
/// as a JSON object yields the bare-status form.
pub(crate) fn error_from_parts(status: StatusCode, body: &str) -> DifyApiError {
    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(body) else {
        return DifyApiError::message(format!("request failed: {}", status.as_u16()));
    };

    let mut code = 0;
    let mut message = String::from("unknown error");
    let mut extra = Vec::with_capacity(fields.len());
    for (key, value) in fields {
        match key.as_str() {
            "code" => match value.as_i64() {
                Some(n) => code = n,
                // non-numeric codes are preserved as context
                None => extra.push((key, value)),
            },
            "message" => match value {
                Value::String(text) => message = text,
                other => extra.push((key, other)),
            },
            _ => extra.push((key, value)),
        }
    }

    DifyApiError {
        code,
        message,
        extra,
    }
}
