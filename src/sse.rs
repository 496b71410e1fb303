//! Server-sent-event scanning for streamed workflow runs.
//!
//! The stream is consumed strictly one event at a time: chunks are buffered
//! only until they contain a complete `data:` block, and decoding happens
//! when an event is handed out, never ahead of it. A caller that stops at a
//! terminal event therefore never touches anything the server sent after it.

use std::collections::VecDeque;
use std::pin::Pin;

use futures_core::Stream;
use futures_util::StreamExt;
use serde_json::{Map, Value};

use crate::errors::{DifyApiError, Result};
use crate::TERMINAL_EVENTS;

type Chunks = Pin<Box<dyn Stream<Item = std::result::Result<String, reqwest::Error>> + Send>>;

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    /// The event-type tag, taken from the payload's `event` field. Empty
    /// when the server sent none.
    pub event: String,
    /// The full decoded `data:` JSON object.
    pub payload: Value,
}

impl ServerEvent {
    /// Whether this event ends the run.
    pub fn is_terminal(&self) -> bool {
        TERMINAL_EVENTS.contains(&self.event.as_str())
    }

    /// Declared outputs of a finished run, nested under `data.outputs`.
    ///
    /// A terminal event without them is a malformed stream, not a panic.
    pub fn outputs(&self) -> Result<Map<String, Value>> {
        match self.payload.get("data").and_then(|data| data.get("outputs")) {
            Some(Value::Object(outputs)) => Ok(outputs.clone()),
            _ => Err(DifyApiError::message("terminal event carries no outputs")),
        }
    }
}

/// Incremental reader over a streaming response body.
pub struct EventStream {
    body: Chunks,
    buffer: String,
    pending: VecDeque<String>,
    done: bool,
}

impl EventStream {
    pub(crate) fn new(response: reqwest::Response) -> Self {
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()));
        Self {
            body: Box::pin(body),
            buffer: String::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    #[cfg(test)]
    fn from_chunks(chunks: Vec<&str>) -> Self {
        let owned: Vec<std::result::Result<String, reqwest::Error>> =
            chunks.into_iter().map(|c| Ok(c.to_string())).collect();
        Self {
            body: Box::pin(futures_util::stream::iter(owned)),
            buffer: String::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// The next decoded event, or `None` once the stream is exhausted.
    pub async fn next_event(&mut self) -> Result<Option<ServerEvent>> {
        loop {
            if let Some(data) = self.pending.pop_front() {
                return decode_event(&data).map(Some);
            }
            if self.done {
                return Ok(None);
            }
            match self.body.next().await {
                Some(Ok(chunk)) => {
                    self.buffer.push_str(&chunk);
                    let (blocks, remainder) = scan_events(&self.buffer, false);
                    self.buffer = remainder;
                    self.pending.extend(blocks);
                }
                Some(Err(err)) => {
                    self.done = true;
                    return Err(err.into());
                }
                None => {
                    self.done = true;
                    let (blocks, _) = scan_events(&self.buffer, true);
                    self.buffer.clear();
                    self.pending.extend(blocks);
                }
            }
        }
    }

    /// Consumes events until the first terminal one and returns it,
    /// abandoning the rest of the stream.
    ///
    /// A stream that ends without a terminal event fails, carrying the last
    /// event seen for diagnostics.
    pub async fn terminal_event(mut self) -> Result<ServerEvent> {
        let mut last: Option<ServerEvent> = None;
        while let Some(event) = self.next_event().await? {
            if event.is_terminal() {
                return Ok(event);
            }
            last = Some(event);
        }
        let seen = last
            .map(|event| event.payload.to_string())
            .unwrap_or_else(|| "{}".to_string());
        Err(DifyApiError::message(format!("run failed: {seen}")))
    }
}

fn decode_event(data: &str) -> Result<ServerEvent> {
    let payload: Value = serde_json::from_str(data)
        .map_err(|_| DifyApiError::message("load data from stream failed"))?;
    let event = payload
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(ServerEvent { event, payload })
}

/// Splits complete `data:` blocks out of a buffer, returning the raw data
/// payloads and the unconsumed remainder. `flush` treats the remainder as a
/// final block (stream end).
fn scan_events(buffer: &str, flush: bool) -> (Vec<String>, String) {
    let mut blocks = Vec::new();
    let mut rest = buffer;
    while let Some((idx, len)) = find_separator(rest) {
        if let Some(data) = parse_block(&rest[..idx]) {
            blocks.push(data);
        }
        rest = &rest[idx + len..];
    }
    let mut remainder = rest.to_string();
    if flush {
        if let Some(data) = parse_block(&remainder) {
            blocks.push(data);
        }
        remainder.clear();
    }
    (blocks, remainder)
}

/// Earliest blank-line separator, LF or CRLF flavored.
fn find_separator(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|idx| (idx, 2));
    let crlf = buffer.find("\r\n\r\n").map(|idx| (idx, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (found, None) | (None, found) => found,
    }
}

fn parse_block(block: &str) -> Option<String> {
    let mut data_lines: Vec<&str> = Vec::new();
    for line in block.split('\n') {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim());
        }
        // `event:`/`id:` fields and `:` comments carry nothing the wire
        // contract uses; the tag rides inside the data payload
    }
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn scans_multiple_events_from_one_buffer() {
        let raw = "data: {\"event\":\"ping\"}\n\ndata: {\"event\":\"workflow_finished\"}\n\n";
        let (blocks, remainder) = scan_events(raw, false);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], "{\"event\":\"ping\"}");
        assert_eq!(remainder, "");
    }

    #[test]
    fn keeps_incomplete_trailing_blocks_in_the_remainder() {
        let raw = "data: {\"event\":\"ping\"}\n\ndata: {\"ev";
        let (blocks, remainder) = scan_events(raw, false);
        assert_eq!(blocks.len(), 1);
        assert_eq!(remainder, "data: {\"ev");
    }

    #[test]
    fn flush_drains_the_remainder_as_a_final_block() {
        let raw = "data: {\"event\":\"workflow_finished\"}";
        let (blocks, remainder) = scan_events(raw, true);
        assert_eq!(blocks.len(), 1);
        assert_eq!(remainder, "");
    }

    #[test]
    fn handles_crlf_line_endings_and_comments() {
        let raw = ": keep-alive\r\ndata: {\"event\":\"ping\"}\r\n\r\n";
        let (blocks, remainder) = scan_events(raw, false);
        assert_eq!(blocks, vec!["{\"event\":\"ping\"}".to_string()]);
        assert_eq!(remainder, "");
    }

    #[test]
    fn joins_multi_line_data_fields() {
        let raw = "data: {\"a\":\ndata: 1}\n\n";
        let (blocks, _) = scan_events(raw, false);
        assert_eq!(blocks, vec!["{\"a\":\n1}".to_string()]);
    }

    #[test]
    fn decode_reads_the_event_tag_from_the_payload() {
        let event = decode_event("{\"event\":\"workflow_failed\",\"data\":{}}").unwrap();
        assert_eq!(event.event, "workflow_failed");
        assert!(event.is_terminal());
    }

    #[test]
    fn decode_treats_a_missing_tag_as_empty() {
        let event = decode_event("{\"task_id\":\"t1\"}").unwrap();
        assert_eq!(event.event, "");
        assert!(event.is_terminal());
    }

    #[test]
    fn decode_rejects_non_json_payloads() {
        let err = decode_event("not json").unwrap_err();
        assert_eq!(err.message, "load data from stream failed");
    }

    #[test]
    fn outputs_come_from_under_the_data_key() {
        let event = decode_event(
            "{\"event\":\"workflow_finished\",\"data\":{\"outputs\":{\"x\":1}}}",
        )
        .unwrap();
        assert_eq!(event.outputs().unwrap(), json!({"x": 1}).as_object().unwrap().clone());
    }

    #[test]
    fn outputs_missing_from_a_terminal_event_are_a_typed_error() {
        let event = decode_event("{\"event\":\"workflow_finished\",\"data\":{}}").unwrap();
        let err = event.outputs().unwrap_err();
        assert!(err.message.contains("no outputs"));
    }

    #[tokio::test]
    async fn terminal_event_stops_before_decoding_later_blocks() {
        // the third block is not valid JSON; reaching it would error
        let stream = EventStream::from_chunks(vec![
            "data: {\"event\":\"ping\"}\n\n",
            "data: {\"event\":\"workflow_finished\",\"data\":{\"outputs\":{\"x\":1}}}\n\ndata: poison\n\n",
        ]);
        let event = stream.terminal_event().await.unwrap();
        assert_eq!(event.event, "workflow_finished");
        assert_eq!(event.outputs().unwrap().get("x"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn exhausted_streams_fail_with_the_last_event_seen() {
        let stream = EventStream::from_chunks(vec!["data: {\"event\":\"ping\"}\n\n"]);
        let err = stream.terminal_event().await.unwrap_err();
        assert!(err.message.starts_with("run failed:"), "got: {}", err.message);
        assert!(err.message.contains("ping"));
    }

    #[tokio::test]
    async fn empty_streams_fail_with_an_empty_last_event() {
        let stream = EventStream::from_chunks(vec![]);
        let err = stream.terminal_event().await.unwrap_err();
        assert_eq!(err.message, "run failed: {}");
    }

    #[tokio::test]
    async fn events_split_across_chunks_reassemble() {
        let mut stream = EventStream::from_chunks(vec![
            "data: {\"event\":\"workflow_",
            "finished\",\"data\":{\"outputs\":{}}}\n\n",
        ]);
        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.event, "workflow_finished");
        assert_eq!(stream.next_event().await.unwrap(), None);
    }
}
