//! The core SSE fold: turns one streaming HTTP response body into a
//! [`StreamOutcome`], emitting lifecycle [`Event`]s as it goes (C2).
//!
//! This module knows nothing about how the request was built or how the
//! HTTP call was made — [`crate::openai_client::OpenAiCompatibleClient`]
//! owns that. Keeping the fold separate means it can be unit-tested against
//! a synthetic byte stream instead of a live HTTP connection.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::{Stream, StreamExt as _};

use crate::{
    error::ErrorKind,
    events::Event,
    model::{ToolCall, Usage},
    prelude::*,
};

/// How often throttled `Streaming` events are emitted.
pub const STREAMING_THROTTLE_INTERVAL: Duration = Duration::from_millis(200);
/// Longest gap allowed between SSE chunks before the stream is considered
/// stalled.
pub const STREAM_STALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Rough characters-per-token ratio used when a provider doesn't report
/// usage directly.
pub const CHARS_PER_TOKEN_ESTIMATE: u64 = 3;
/// Fraction of `ocr_tokens` empirically observed as typical completion
/// length, used only to estimate an ETA for the progress display.
pub const OCR_TOKEN_OUTPUT_FACTOR: f64 = 0.73;
/// ETA fallback when neither an `ocr_tokens` hint nor `max_tokens` is set.
pub const DEFAULT_TOKENS_ETA: u64 = 1200;
/// Malformed SSE chunks tolerated before the stream is judged corrupted.
pub const MAX_PARSE_ERRORS: u32 = 10;

/// The fully assembled result of one streaming call, before cost/usage
/// finalization (which needs the `CostCalculator` port and so lives in
/// [`crate::openai_client`]).
#[derive(Debug, Default)]
pub struct StreamOutcome {
    /// Accumulated assistant content.
    pub content: String,
    /// Usage reported directly by the provider, if any chunk carried it.
    pub usage: Option<Usage>,
    /// Tool calls accumulated across chunks, by ascending index.
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Reasoning detail blocks from the final chunk that carried them.
    pub reasoning_details: Option<Vec<Value>>,
    /// Time from stream start to the first content token.
    pub ttft: Option<Duration>,
}

#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

/// Estimate the total output tokens expected, for the streaming ETA. Never
/// consulted by retry/routing logic — display only.
fn estimated_total_tokens(ocr_tokens_hint: Option<u64>, max_tokens: Option<u32>) -> u64 {
    if let Some(ocr_tokens) = ocr_tokens_hint {
        (ocr_tokens as f64 * OCR_TOKEN_OUTPUT_FACTOR) as u64
    } else if let Some(max_tokens) = max_tokens {
        max_tokens as u64
    } else {
        DEFAULT_TOKENS_ETA
    }
}

fn usage_from_chunk(chunk: &Value) -> Option<Usage> {
    let usage = chunk.get("usage")?;
    let prompt_tokens = usage.get("prompt_tokens")?.as_u64()?;
    let completion_tokens = usage.get("completion_tokens")?.as_u64()?;
    let reasoning_tokens = usage
        .get("completion_tokens_details")
        .and_then(|d| d.get("reasoning_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(Usage {
        prompt_tokens,
        completion_tokens,
        reasoning_tokens,
    })
}

fn content_delta(chunk: &Value) -> Option<&str> {
    chunk
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
}

fn reasoning_details_from_chunk(chunk: &Value) -> Option<Vec<Value>> {
    let details = chunk.get("choices")?.get(0)?.get("delta")?.get("reasoning_details")?;
    details.as_array().cloned()
}

fn merge_tool_call_deltas(accum: &mut BTreeMap<usize, ToolCallBuilder>, chunk: &Value) {
    let Some(deltas) = chunk
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("tool_calls"))
        .and_then(Value::as_array)
    else {
        return;
    };
    for delta in deltas {
        let index = delta.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
        let entry = accum.entry(index).or_default();
        if let Some(id) = delta.get("id").and_then(Value::as_str) {
            entry.id = id.to_owned();
        }
        if let Some(function) = delta.get("function") {
            if let Some(name) = function.get("name").and_then(Value::as_str) {
                entry.name.push_str(name);
            }
            if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                entry.arguments.push_str(args);
            }
        }
    }
}

/// Parse one SSE line. Returns `None` for lines that carry no data (blank
/// lines, event/id fields, anything not prefixed `data: `).
enum SseLine {
    Done,
    Chunk(Value),
    Malformed,
}

fn parse_sse_line(line: &str) -> Option<SseLine> {
    let line = line.trim_end_matches('\r');
    let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseLine::Done);
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) => Some(SseLine::Chunk(value)),
        Err(_) => Some(SseLine::Malformed),
    }
}

/// Fold a streaming HTTP body into a [`StreamOutcome`], emitting lifecycle
/// events as chunks arrive.
///
/// `ocr_tokens_hint` and `max_tokens` feed only the display ETA (§4.2); they
/// never influence retry classification.
pub async fn fold_sse_stream<S>(
    request_id: &str,
    mut byte_stream: S,
    ocr_tokens_hint: Option<u64>,
    max_tokens: Option<u32>,
    on_event: &(dyn Fn(Event) + Send + Sync),
) -> Result<StreamOutcome, ErrorKind>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    let started_at = Instant::now();
    let mut buffer = String::new();
    let mut content = String::new();
    let mut usage: Option<Usage> = None;
    let mut tool_call_accum: BTreeMap<usize, ToolCallBuilder> = BTreeMap::new();
    let mut reasoning_details: Option<Vec<Value>> = None;
    let mut first_token_at: Option<Instant> = None;
    let mut ttft: Option<Duration> = None;
    let mut last_emit_at = started_at;
    let mut parse_errors: u32 = 0;
    let estimated_total = estimated_total_tokens(ocr_tokens_hint, max_tokens);

    'outer: loop {
        let next = tokio::time::timeout(STREAM_STALL_TIMEOUT, byte_stream.next()).await;
        let chunk_bytes = match next {
            Ok(Some(Ok(bytes))) => bytes,
            Ok(Some(Err(err))) => {
                warn!(request_id, %err, "stream transport error");
                return Err(ErrorKind::Timeout);
            }
            Ok(None) => break,
            Err(_elapsed) => {
                warn!(request_id, "stream stalled for {:?}", STREAM_STALL_TIMEOUT);
                return Err(ErrorKind::Timeout);
            }
        };

        buffer.push_str(&String::from_utf8_lossy(&chunk_bytes));
        while let Some(newline_pos) = buffer.find('\n') {
            let line = buffer[..newline_pos].to_owned();
            buffer.drain(..=newline_pos);

            match parse_sse_line(&line) {
                None => continue,
                Some(SseLine::Done) => break 'outer,
                Some(SseLine::Malformed) => {
                    parse_errors += 1;
                    if parse_errors > MAX_PARSE_ERRORS {
                        warn!(request_id, parse_errors, "too many malformed SSE chunks");
                        return Err(ErrorKind::JsonParse);
                    }
                    continue;
                }
                Some(SseLine::Chunk(value)) => {
                    if let Some(u) = usage_from_chunk(&value) {
                        usage = Some(u);
                    }
                    merge_tool_call_deltas(&mut tool_call_accum, &value);
                    if let Some(details) = reasoning_details_from_chunk(&value) {
                        reasoning_details = Some(details);
                    }
                    if let Some(delta) = content_delta(&value) {
                        if !delta.is_empty() {
                            if first_token_at.is_none() {
                                let elapsed = started_at.elapsed();
                                first_token_at = Some(Instant::now());
                                ttft = Some(elapsed);
                                on_event(Event::FirstToken {
                                    request_id: request_id.to_owned(),
                                    ttft: elapsed,
                                });
                            }
                            content.push_str(delta);

                            let now = Instant::now();
                            if now.duration_since(last_emit_at) >= STREAMING_THROTTLE_INTERVAL {
                                last_emit_at = now;
                                emit_streaming_progress(request_id, &content, estimated_total, started_at.elapsed(), on_event);
                            }
                        }
                    }
                }
            }
        }
    }

    if !content.is_empty() {
        emit_final_streaming_event(request_id, &content, started_at.elapsed(), on_event);
    }

    let tool_calls = if tool_call_accum.is_empty() {
        None
    } else {
        Some(
            tool_call_accum
                .into_values()
                .map(|b| ToolCall {
                    id: b.id,
                    name: b.name,
                    arguments: b.arguments,
                })
                .collect(),
        )
    };

    Ok(StreamOutcome {
        content,
        usage,
        tool_calls,
        reasoning_details,
        ttft,
    })
}

/// Tokens/second observed so far, and the ETA in seconds to reach
/// `estimated_total` at that rate. Returns `(0.0, 0.0)` for a near-zero
/// elapsed time, since the rate isn't meaningful yet.
fn rate_and_eta(tokens_estimate: u64, estimated_total: u64, elapsed: Duration) -> (f64, f64) {
    let elapsed_secs = elapsed.as_secs_f64();
    if elapsed_secs <= 0.0 {
        return (0.0, 0.0);
    }
    let tokens_per_second = tokens_estimate as f64 / elapsed_secs;
    if tokens_per_second <= 0.0 {
        return (0.0, 0.0);
    }
    let remaining = estimated_total.saturating_sub(tokens_estimate) as f64;
    (tokens_per_second, remaining / tokens_per_second)
}

fn emit_streaming_progress(request_id: &str, content: &str, estimated_total: u64, elapsed: Duration, on_event: &(dyn Fn(Event) + Send + Sync)) {
    let tokens_estimate = content.len() as u64 / CHARS_PER_TOKEN_ESTIMATE;
    let (tokens_per_second, tokens_eta) = rate_and_eta(tokens_estimate, estimated_total, elapsed);
    on_event(Event::Streaming {
        request_id: request_id.to_owned(),
        chars_received: content.len(),
        tokens_estimate,
        tokens_per_second,
        tokens_eta,
    });
}

fn emit_final_streaming_event(request_id: &str, content: &str, elapsed: Duration, on_event: &(dyn Fn(Event) + Send + Sync)) {
    let tokens_estimate = content.len() as u64 / CHARS_PER_TOKEN_ESTIMATE;
    let elapsed_secs = elapsed.as_secs_f64();
    let tokens_per_second = if elapsed_secs > 0.0 { tokens_estimate as f64 / elapsed_secs } else { 0.0 };
    on_event(Event::Streaming {
        request_id: request_id.to_owned(),
        chars_received: content.len(),
        tokens_estimate,
        tokens_per_second,
        tokens_eta: 0.0,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn sse(lines: &[&str]) -> impl Stream<Item = reqwest::Result<Bytes>> + Unpin {
        let body = lines.join("\n") + "\n";
        stream::iter(vec![Ok(Bytes::from(body))])
    }

    #[tokio::test]
    async fn parses_content_deltas_and_done() {
        let events = std::sync::Mutex::new(Vec::new());
        let on_event = |e: Event| events.lock().unwrap().push(e);
        let body = sse(&[
            r#"data: {"choices":[{"delta":{"content":"hel"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"data: {"usage":{"prompt_tokens":10,"completion_tokens":2}}"#,
            "data: [DONE]",
        ]);
        let outcome = fold_sse_stream("req-1", body, None, None, &on_event).await.unwrap();
        assert_eq!(outcome.content, "hello");
        let usage = outcome.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 2);
        assert!(events.lock().unwrap().iter().any(|e| matches!(e, Event::FirstToken { .. })));
    }

    #[tokio::test]
    async fn accumulates_tool_call_argument_fragments() {
        let on_event = |_: Event| {};
        let body = sse(&[
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"write_result","arguments":""}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"a\":1}"}}]}}]}"#,
            "data: [DONE]",
        ]);
        let outcome = fold_sse_stream("req-2", body, None, None, &on_event).await.unwrap();
        let calls = outcome.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "write_result");
        assert_eq!(calls[0].arguments, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn too_many_malformed_chunks_is_json_parse_error() {
        let on_event = |_: Event| {};
        let mut lines: Vec<String> = (0..=MAX_PARSE_ERRORS).map(|_| "data: not json".to_owned()).collect();
        lines.push("data: [DONE]".to_owned());
        let body_str = lines.join("\n") + "\n";
        let body = stream::iter(vec![Ok::<_, reqwest::Error>(Bytes::from(body_str))]);
        let err = fold_sse_stream("req-3", body, None, None, &on_event).await.unwrap_err();
        assert_eq!(err, ErrorKind::JsonParse);
    }

    #[tokio::test]
    async fn stall_produces_timeout() {
        let on_event = |_: Event| {};
        let body = stream::pending::<reqwest::Result<Bytes>>();
        let fut = fold_sse_stream("req-4", body, None, None, &on_event);
        let result = tokio::time::timeout(Duration::from_millis(50), fut).await;
        // The fold itself waits the full 30s stall window internally; here we
        // just confirm it doesn't resolve early on a stream that never yields.
        assert!(result.is_err());
    }
}
