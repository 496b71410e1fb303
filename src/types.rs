use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::errors::{DifyApiError, Result};
use crate::sse::ServerEvent;

/// Remote lifecycle of a workflow run. `Running` is the only non-terminal
/// state; the others are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Succeeded => "succeeded",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Validated record of one workflow run, returned by both the run-status
/// endpoint and the terminal event of a streamed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunResult {
    pub id: String,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    #[serde(default, deserialize_with = "map_or_json_string")]
    pub inputs: Map<String, Value>,
    #[serde(default, deserialize_with = "map_or_json_string")]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub total_steps: u64,
    pub total_tokens: u64,
    pub created_at: i64,
    pub finished_at: Option<i64>,
    pub elapsed_time: f64,
}

/// Terminal-event envelope of a streamed run: the run identifiers plus the
/// full run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunResponse {
    pub task_id: String,
    pub workflow_run_id: String,
    pub data: WorkflowRunResult,
}

/// Identifiers handed back by an asynchronous run start, before the run
/// completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub task_id: String,
    pub workflow_run_id: String,
}

impl RunHandle {
    pub(crate) fn from_event(event: &ServerEvent) -> Result<Self> {
        let task_id = event.payload.get("task_id").and_then(Value::as_str);
        let workflow_run_id = event.payload.get("workflow_run_id").and_then(Value::as_str);
        match (task_id, workflow_run_id) {
            (Some(task_id), Some(workflow_run_id)) => Ok(Self {
                task_id: task_id.to_string(),
                workflow_run_id: workflow_run_id.to_string(),
            }),
            _ => Err(DifyApiError::message("run event carries no run identifiers")),
        }
    }
}

/// Workflow input payload: either a raw JSON map or a typed record
/// serialized up front. Both normalize to the same `{"inputs": ...}` wire
/// shape.
#[derive(Debug, Clone, PartialEq)]
pub enum RunInputs {
    Values(Map<String, Value>),
    Record(Value),
}

impl RunInputs {
    /// Serializes a typed input record.
    pub fn record<T: Serialize>(record: &T) -> Result<Self> {
        let value = serde_json::to_value(record).map_err(|err| {
            DifyApiError::message(format!("input record does not serialize: {err}"))
        })?;
        Ok(RunInputs::Record(value))
    }

    pub(crate) fn into_envelope(self) -> Map<String, Value> {
        let inputs = match self {
            RunInputs::Values(values) => Value::Object(values),
            RunInputs::Record(value) => value,
        };
        let mut payload = Map::new();
        payload.insert("inputs".to_string(), inputs);
        payload
    }
}

impl From<Map<String, Value>> for RunInputs {
    fn from(values: Map<String, Value>) -> Self {
        RunInputs::Values(values)
    }
}

/// File category accepted by workflow file inputs, with an escape hatch for
/// values this crate does not know about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FileKind {
    Document,
    Image,
    Audio,
    Video,
    Custom,
    Other(String),
}

impl FileKind {
    pub fn as_str(&self) -> &str {
        match self {
            FileKind::Document => "document",
            FileKind::Image => "image",
            FileKind::Audio => "audio",
            FileKind::Video => "video",
            FileKind::Custom => "custom",
            FileKind::Other(other) => other.as_str(),
        }
    }
}

impl From<&str> for FileKind {
    fn from(value: &str) -> Self {
        FileKind::from(value.to_string())
    }
}

impl From<String> for FileKind {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "document" => FileKind::Document,
            "image" => FileKind::Image,
            "audio" => FileKind::Audio,
            "video" => FileKind::Video,
            "custom" => FileKind::Custom,
            _ => FileKind::Other(value.trim().to_string()),
        }
    }
}

impl From<FileKind> for String {
    fn from(value: FileKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a file input reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    RemoteUrl,
    LocalFile,
}

/// Reference to a file passed as a workflow input.
///
/// A remote-URL input needs `url`, a local-file input needs
/// `upload_file_id`; the constructors keep the two from mixing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInput {
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub transfer_method: TransferMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_file_id: Option<String>,
}

impl FileInput {
    /// File fetched by the server from a URL.
    pub fn remote(kind: FileKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            transfer_method: TransferMethod::RemoteUrl,
            url: Some(url.into()),
            upload_file_id: None,
        }
    }

    /// Previously uploaded file, referenced by its id.
    pub fn uploaded(kind: FileKind, upload_file_id: impl Into<String>) -> Self {
        Self {
            kind,
            transfer_method: TransferMethod::LocalFile,
            url: None,
            upload_file_id: Some(upload_file_id.into()),
        }
    }
}

/// Stored-file record returned by the upload endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub created_by: String,
    pub created_at: i64,
}

/// The server sometimes delivers `inputs`/`outputs` as JSON-encoded strings
/// rather than objects; both forms decode to the same map.
fn map_or_json_string<'de, D>(deserializer: D) -> std::result::Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(map),
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(D::Error::custom(
                "expected a JSON object or an object-encoded string",
            )),
        },
        _ => Err(D::Error::custom(
            "expected a JSON object or an object-encoded string",
        )),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn full_record(status: &str) -> Value {
        json!({
            "id": "run-1",
            "workflow_id": "wf-1",
            "status": status,
            "inputs": {"q": "hi"},
            "outputs": {"answer": "ok"},
            "error": null,
            "total_steps": 3,
            "total_tokens": 120,
            "created_at": 1_720_000_000,
            "finished_at": 1_720_000_009,
            "elapsed_time": 8.5
        })
    }

    #[test]
    fn status_round_trips_each_wire_value() {
        for (text, status) in [
            ("running", WorkflowStatus::Running),
            ("succeeded", WorkflowStatus::Succeeded),
            ("failed", WorkflowStatus::Failed),
            ("stopped", WorkflowStatus::Stopped),
        ] {
            let decoded: WorkflowStatus = serde_json::from_value(json!(text)).unwrap();
            assert_eq!(decoded, status);
            assert_eq!(serde_json::to_value(status).unwrap(), json!(text));
        }
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
    }

    #[test]
    fn run_result_decodes_a_full_record() {
        let result: WorkflowRunResult = serde_json::from_value(full_record("succeeded")).unwrap();
        assert_eq!(result.status, WorkflowStatus::Succeeded);
        assert_eq!(result.outputs.get("answer"), Some(&json!("ok")));
        assert_eq!(result.total_steps, 3);
        assert_eq!(result.finished_at, Some(1_720_000_009));
    }

    #[test]
    fn run_result_accepts_string_encoded_inputs_and_outputs() {
        let mut record = full_record("succeeded");
        record["inputs"] = json!("{\"q\":\"hi\"}");
        record["outputs"] = json!("{\"answer\":\"ok\"}");
        let result: WorkflowRunResult = serde_json::from_value(record).unwrap();
        assert_eq!(result.inputs.get("q"), Some(&json!("hi")));
        assert_eq!(result.outputs.get("answer"), Some(&json!("ok")));
    }

    #[test]
    fn run_result_rejects_a_missing_total_steps() {
        let mut record = full_record("running");
        record.as_object_mut().unwrap().remove("total_steps");
        let err = serde_json::from_value::<WorkflowRunResult>(record).unwrap_err();
        assert!(err.to_string().contains("total_steps"));
    }

    #[test]
    fn run_result_rejects_an_unknown_status() {
        let record = full_record("paused");
        assert!(serde_json::from_value::<WorkflowRunResult>(record).is_err());
    }

    #[test]
    fn run_handle_reads_identifiers_from_the_first_event() {
        let event = ServerEvent {
            event: String::new(),
            payload: json!({"task_id": "t1", "workflow_run_id": "r1"}),
        };
        let handle = RunHandle::from_event(&event).unwrap();
        assert_eq!(handle.task_id, "t1");
        assert_eq!(handle.workflow_run_id, "r1");
    }

    #[test]
    fn run_handle_requires_both_identifiers() {
        let event = ServerEvent {
            event: "workflow_started".to_string(),
            payload: json!({"task_id": "t1"}),
        };
        let err = RunHandle::from_event(&event).unwrap_err();
        assert!(err.message.contains("run identifiers"));
    }

    #[test]
    fn run_inputs_wrap_both_variants_under_the_inputs_key() {
        let mut values = Map::new();
        values.insert("q".to_string(), json!("hi"));
        let from_map = RunInputs::from(values).into_envelope();
        assert_eq!(from_map.get("inputs"), Some(&json!({"q": "hi"})));

        #[derive(Serialize)]
        struct Prompt {
            q: &'static str,
        }
        let from_record = RunInputs::record(&Prompt { q: "hi" })
            .unwrap()
            .into_envelope();
        assert_eq!(from_map, from_record);
    }

    #[test]
    fn file_inputs_serialize_the_wire_field_names() {
        let file = FileInput::remote(FileKind::Image, "https://example.com/cat.png");
        let value = serde_json::to_value(&file).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "image",
                "transfer_method": "remote_url",
                "url": "https://example.com/cat.png"
            })
        );

        let uploaded = FileInput::uploaded(FileKind::Document, "file-1");
        let value = serde_json::to_value(&uploaded).unwrap();
        assert_eq!(value["transfer_method"], json!("local_file"));
        assert_eq!(value["upload_file_id"], json!("file-1"));
    }

    #[test]
    fn file_kind_keeps_unknown_values() {
        let kind = FileKind::from("blueprint");
        assert_eq!(kind, FileKind::Other("blueprint".to_string()));
        assert_eq!(String::from(kind), "blueprint");
        assert_eq!(FileKind::from("IMAGE"), FileKind::Image);
    }
}
