//! Rust SDK for the Dify workflow-execution API.
//!
//! Workflows run remotely; this crate only talks to them. Each operation
//! issues exactly one HTTP call, either buffered (one JSON response) or
//! streaming (a server-sent-event sequence consumed up to its terminal
//! event), and every failure surfaces as a single typed error,
//! [`DifyApiError`].
//!
//! ```no_run
//! use dify_workflow::{Client, Config};
//! use serde_json::{Map, Value};
//!
//! # async fn run() -> dify_workflow::Result<()> {
//! let client = Client::new(Config {
//!     api_key: Some("app-xxxx".into()),
//!     ..Default::default()
//! })?;
//!
//! let mut inputs = Map::new();
//! inputs.insert("query".to_string(), Value::String("hello".into()));
//! let result = client.workflows().sync_run("user-1", inputs).await?;
//! println!("{:?}", result.outputs);
//! # Ok(())
//! # }
//! ```

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.dify.ai/v1";

/// Default connection timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Default request timeout for buffered calls (60 seconds). Streaming calls
/// are bounded only by the transport's own configuration.
pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Event tags that end a streamed workflow run. The empty tag is terminal:
/// the server omits the tag on bare acknowledgements.
pub const TERMINAL_EVENTS: [&str; 3] = ["workflow_finished", "workflow_failed", ""];

mod client;
mod errors;
mod http;
mod sse;
mod types;

pub use client::{Client, Config, FilesClient, WorkflowsClient};
pub use errors::{DifyApiError, Result};
pub use sse::{EventStream, ServerEvent};
pub use types::{
    FileInput, FileKind, RunHandle, RunInputs, TransferMethod, UploadedFile, WorkflowRunResponse,
    WorkflowRunResult, WorkflowStatus,
};
