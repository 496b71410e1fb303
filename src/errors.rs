use serde_json::Value;
use thiserror::Error;

/// Convenience alias for fallible SDK results.
pub type Result<T, E = DifyApiError> = std::result::Result<T, E>;

/// The one error kind surfaced by this crate.
///
/// The server reports failures as a JSON object with `code` and `message`
/// fields; everything else in that object rides along in `extra`. Failures
/// the SDK detects itself (transport errors, malformed bodies, unresolved
/// path parameters) use the same shape with `code` 0. Callers discriminate
/// by code and message, not by type.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", render(.code, .message, .extra))]
pub struct DifyApiError {
    /// Numeric error code, 0 when the server did not supply one.
    pub code: i64,
    pub message: String,
    /// Remaining fields of the server's error body, as ordered pairs.
    pub extra: Vec<(String, Value)>,
}

impl DifyApiError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            extra: Vec::new(),
        }
    }

    /// Error with no server-supplied code.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(0, message)
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.push((key.into(), value));
        self
    }

    /// Looks up an extra context field by key.
    pub fn context(&self, key: &str) -> Option<&Value> {
        self.extra
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }
}

impl From<reqwest::Error> for DifyApiError {
    fn from(err: reqwest::Error) -> Self {
        Self::message(format!("request failed: {err}"))
    }
}

fn render(code: &i64, message: &str, extra: &[(String, Value)]) -> String {
    let mut out = if *code != 0 {
        format!("{message} (code {code})")
    } else {
        message.to_string()
    };
    if !extra.is_empty() {
        let fields: Vec<String> = extra.iter().map(|(k, v)| format!("{k}={v}")).collect();
        out.push_str(" -> {");
        out.push_str(&fields.join(", "));
        out.push('}');
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn display_without_code_is_just_the_message() {
        let err = DifyApiError::message("load data from stream failed");
        assert_eq!(err.to_string(), "load data from stream failed");
    }

    #[test]
    fn display_includes_code_and_extra_context() {
        let err = DifyApiError::new(1002, "workflow not published")
            .with_extra("status", json!(400))
            .with_extra("params", json!("workflow_id"));
        assert_eq!(
            err.to_string(),
            "workflow not published (code 1002) -> {status=400, params=\"workflow_id\"}"
        );
    }

    #[test]
    fn context_lookup_finds_fields_by_key() {
        let err = DifyApiError::message("boom").with_extra("detail", json!({"node": "start"}));
        assert_eq!(err.context("detail"), Some(&json!({"node": "start"})));
        assert_eq!(err.context("missing"), None);
    }
}
