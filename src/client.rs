use std::{sync::Arc, time::Duration};

use reqwest::{header::ACCEPT, multipart, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::{
    errors::{DifyApiError, Result},
    http::{complete_envelope, error_from_parts, query_pairs, resolve_path},
    sse::EventStream,
    types::{RunHandle, RunInputs, UploadedFile, WorkflowRunResponse, WorkflowRunResult},
    DEFAULT_BASE_URL, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};

const RUN_PATH: &str = "workflows/run";
const RESULT_PATH: &str = "workflows/run/:workflow_run_id";
const STOP_PATH: &str = "workflows/run/:task_id/stop";
const UPLOAD_PATH: &str = "files/upload";

/// Client configuration. Unset fields fall back to crate defaults.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub base_url: Option<String>,
    /// Application API key, sent as a bearer token. Required.
    pub api_key: Option<String>,
    /// Display name attached to request/response logs.
    pub app_name: Option<String>,
    /// Bring-your-own transport; a fresh one is built otherwise.
    pub http_client: Option<reqwest::Client>,
    /// Override the connect timeout (defaults to 5s).
    pub connect_timeout: Option<Duration>,
    /// Override the per-request timeout for buffered calls (defaults to
    /// 60s). Streaming calls are not bounded by it.
    pub timeout: Option<Duration>,
}

impl Config {
    /// Reads `DIFY_API_URL`, `DIFY_API_KEY` and `DIFY_APP_NAME` from the
    /// environment; unset variables stay `None`.
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("DIFY_API_URL").ok(),
            api_key: std::env::var("DIFY_API_KEY").ok(),
            app_name: std::env::var("DIFY_APP_NAME").ok(),
            ..Default::default()
        }
    }
}

/// Handle to the Dify API. Cheap to clone; all state is immutable after
/// construction and shared behind an `Arc`.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    base_url: String,
    api_key: String,
    app_name: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl Client {
    pub fn new(cfg: Config) -> Result<Self> {
        let base_url = cfg
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        reqwest::Url::parse(&base_url)
            .map_err(|err| DifyApiError::message(format!("invalid base url: {err}")))?;

        let api_key = cfg
            .api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| DifyApiError::message("api key is required"))?;

        let connect_timeout = cfg.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let request_timeout = cfg.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let http = match cfg.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .build()
                .map_err(|err| {
                    DifyApiError::message(format!("failed to build http client: {err}"))
                })?,
        };

        Ok(Self {
            inner: Arc::new(ClientInner {
                base_url,
                api_key,
                app_name: cfg.app_name.unwrap_or_default(),
                http,
                request_timeout,
            }),
        })
    }

    /// Base API URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Display name attached to request/response logs.
    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    /// Workflow run operations.
    pub fn workflows(&self) -> WorkflowsClient {
        WorkflowsClient {
            inner: self.inner.clone(),
        }
    }

    /// File upload operations.
    pub fn files(&self) -> FilesClient {
        FilesClient {
            inner: self.inner.clone(),
        }
    }

    /// Low-level escape hatch: one buffered call against an arbitrary route
    /// template, error-mapped and JSON-decoded but not validated against
    /// any schema.
    pub async fn request_json(
        &self,
        method: Method,
        path: &str,
        path_params: &[(&str, &str)],
        payload: Map<String, Value>,
        user: &str,
    ) -> Result<Value> {
        let response = self
            .inner
            .dispatch(method, path, path_params, payload, user, None)
            .await?;
        self.inner.execute_json(response).await
    }
}

impl ClientInner {
    fn url_for(&self, path: &str) -> Result<reqwest::Url> {
        reqwest::Url::parse(&format!("{}/{}", self.base_url, path))
            .map_err(|err| DifyApiError::message(format!("invalid request path: {err}")))
    }

    fn builder(&self, method: Method, url: reqwest::Url) -> reqwest::RequestBuilder {
        self.http.request(method, url).bearer_auth(&self.api_key)
    }

    /// Issues exactly one HTTP call and returns the raw response. Status
    /// and body are the parsers' business, not the dispatcher's.
    async fn dispatch(
        &self,
        method: Method,
        path: &str,
        path_params: &[(&str, &str)],
        payload: Map<String, Value>,
        user: &str,
        streaming: Option<bool>,
    ) -> Result<Response> {
        let path = resolve_path(path, path_params)?;
        let url = self.url_for(&path)?;
        let envelope = complete_envelope(payload, user, streaming);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            app = %self.app_name,
            method = %method,
            path = %path,
            params = ?envelope,
            streaming = ?streaming,
            "dispatching request"
        );

        let mut builder = if method == Method::GET {
            self.builder(method, url).query(&query_pairs(&envelope))
        } else {
            self.builder(method, url).json(&envelope)
        };
        builder = if streaming == Some(true) {
            builder.header(ACCEPT, "text/event-stream")
        } else {
            // buffered calls get the request timeout; streams are bounded
            // only by the transport's own configuration
            builder
                .header(ACCEPT, "application/json")
                .timeout(self.request_timeout)
        };

        let response = builder.send().await?;
        Ok(response)
    }

    /// The error-mapping gate: success passes the response through
    /// untouched, anything else becomes the typed error built from the
    /// server's body.
    async fn ensure_success(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            #[cfg(feature = "tracing")]
            tracing::debug!(app = %self.app_name, status = status.as_u16(), "request succeeded");
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let err = error_from_parts(status, &body);
        #[cfg(feature = "tracing")]
        tracing::warn!(app = %self.app_name, status = status.as_u16(), error = %err, "request failed");
        Err(err)
    }

    async fn execute_json(&self, response: Response) -> Result<Value> {
        let response = self.ensure_success(response).await?;
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|_| DifyApiError::message("response body is not valid JSON"))
    }

    async fn open_stream(&self, response: Response) -> Result<EventStream> {
        let response = self.ensure_success(response).await?;
        Ok(EventStream::new(response))
    }
}

fn validated<T: DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|err| DifyApiError::message(format!("invalid {what}: {err}")))
}

/// Workflow run operations: start runs (blocking on completion or not),
/// poll results, request stops.
#[derive(Clone)]
pub struct WorkflowsClient {
    inner: Arc<ClientInner>,
}

impl WorkflowsClient {
    /// Opens a streaming run and hands back the raw event stream.
    ///
    /// Most callers want [`sync_run`](Self::sync_run) or
    /// [`async_run`](Self::async_run); this is the building block for
    /// consumers that care about intermediate events.
    pub async fn run_stream(
        &self,
        user: &str,
        inputs: impl Into<RunInputs>,
    ) -> Result<EventStream> {
        let payload = inputs.into().into_envelope();
        let response = self
            .inner
            .dispatch(Method::POST, RUN_PATH, &[], payload, user, Some(true))
            .await?;
        self.inner.open_stream(response).await
    }

    /// Runs a workflow and blocks until its terminal event, returning the
    /// validated run record.
    pub async fn sync_run(
        &self,
        user: &str,
        inputs: impl Into<RunInputs>,
    ) -> Result<WorkflowRunResult> {
        let stream = self.run_stream(user, inputs).await?;
        let event = stream.terminal_event().await?;
        let parsed: WorkflowRunResponse = validated(event.payload, "workflow run response")?;
        Ok(parsed.data)
    }

    /// Starts a workflow run and returns as soon as the server acknowledges
    /// it, without waiting for completion.
    pub async fn async_run(
        &self,
        user: &str,
        inputs: impl Into<RunInputs>,
    ) -> Result<RunHandle> {
        let mut stream = self.run_stream(user, inputs).await?;
        match stream.next_event().await? {
            Some(event) => RunHandle::from_event(&event),
            None => Err(DifyApiError::message("run produced no events")),
        }
    }

    /// Fetches the current state of a run by its id.
    pub async fn get_work_result(
        &self,
        user: &str,
        workflow_run_id: &str,
    ) -> Result<WorkflowRunResult> {
        let response = self
            .inner
            .dispatch(
                Method::GET,
                RESULT_PATH,
                &[("workflow_run_id", workflow_run_id)],
                Map::new(),
                user,
                None,
            )
            .await?;
        let value = self.inner.execute_json(response).await?;
        validated(value, "workflow run result")
    }

    /// Requests that a running workflow stop. Success is the absence of an
    /// error; the acknowledgement body carries nothing the caller needs.
    pub async fn stop_work(&self, user: &str, task_id: &str) -> Result<()> {
        let response = self
            .inner
            .dispatch(
                Method::POST,
                STOP_PATH,
                &[("task_id", task_id)],
                Map::new(),
                user,
                None,
            )
            .await?;
        self.inner.execute_json(response).await?;
        Ok(())
    }
}

/// File upload operations.
#[derive(Clone)]
pub struct FilesClient {
    inner: Arc<ClientInner>,
}

impl FilesClient {
    /// Uploads a file for later use as a workflow input, returning the
    /// stored-file record.
    pub async fn upload(
        &self,
        user: &str,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadedFile> {
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(|err| DifyApiError::message(format!("invalid mime type: {err}")))?;
        let form = multipart::Form::new()
            .text("user", user.to_string())
            .part("file", part);

        let url = self.inner.url_for(UPLOAD_PATH)?;
        #[cfg(feature = "tracing")]
        tracing::debug!(
            app = %self.inner.app_name,
            path = UPLOAD_PATH,
            file = file_name,
            "dispatching upload"
        );
        let response = self
            .inner
            .builder(Method::POST, url)
            .timeout(self.inner.request_timeout)
            .multipart(form)
            .send()
            .await?;
        let value = self.inner.execute_json(response).await?;
        validated(value, "uploaded file")
    }
}
