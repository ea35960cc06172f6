//! Streaming LLM client for OpenAI-compatible chat-completion endpoints.
//!
//! One call issues one streaming request, incrementally delivering
//! *thinking* and *content* text to the caller as the chunks arrive.
//! Reasoning reaches us two ways and both are handled:
//!
//! - native `reasoning_content` / `thinking` delta fields, forwarded as-is;
//! - inline `<think>…</think>` spans inside the content stream, rerouted by
//!   a small tag demultiplexer that tolerates tags split across chunk
//!   boundaries.
//!
//! All chat calls in the process share one rate-limit slot so outbound
//! requests are spaced at least three seconds apart, and every exchange is
//! appended to a JSONL log file.

use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures of a single chat call.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The endpoint answered with a non-2xx status.
    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// The request or the streamed body failed at the transport level.
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl LlmError {
    /// Network-class errors earn the mover a clock refund: connection or
    /// timeout failures, or anything whose message smells like one.
    pub fn is_network_error(&self) -> bool {
        if let LlmError::Transport(e) = self
            && (e.is_connect() || e.is_timeout())
        {
            return true;
        }
        let msg = self.to_string().to_lowercase();
        ["fetch", "econnrefused", "network", "enotfound", "timeout"]
            .iter()
            .any(|needle| msg.contains(needle))
    }
}

// ---------------------------------------------------------------------------
// Stream chunk classification
// ---------------------------------------------------------------------------

/// What a streamed text fragment is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Model reasoning, shown but never parsed for a move.
    Thinking,
    /// Answer text.
    Content,
}

/// Chunk callback used by [`ChatBackend::chat`]. The callback is invoked
/// from the request task as fragments arrive; it must not block.
pub type ChunkSink<'a> = &'a mut (dyn FnMut(StreamKind, &str) + Send);

/// The seam between the game orchestrator and the chat transport, so game
/// logic can be driven by a scripted backend in tests.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Issues one chat call and returns the final (trimmed) content text.
    async fn chat(
        &self,
        system: &str,
        user: &str,
        on_chunk: ChunkSink<'_>,
    ) -> Result<String, LlmError>;
}

// ---------------------------------------------------------------------------
// Process-wide rate limit
// ---------------------------------------------------------------------------

/// Minimum spacing between any two chat requests leaving this process.
const RATE_INTERVAL: Duration = Duration::from_millis(3000);

/// The next instant a request may depart. Callers reserve a slot under the
/// lock, then sleep outside it, so concurrent callers serialize in
/// reservation order with at least [`RATE_INTERVAL`] between slots.
static NEXT_SLOT: Lazy<tokio::sync::Mutex<Option<Instant>>> =
    Lazy::new(|| tokio::sync::Mutex::new(None));

/// Waits until this caller's reserved departure slot arrives.
pub async fn acquire_rate_slot() {
    let slot = {
        let mut next = NEXT_SLOT.lock().await;
        let now = Instant::now();
        let slot = match *next {
            Some(at) if at > now => at,
            _ => now,
        };
        *next = Some(slot + RATE_INTERVAL);
        slot
    };
    tokio::time::sleep_until(slot).await;
}

// ---------------------------------------------------------------------------
// <think> tag demultiplexer
// ---------------------------------------------------------------------------

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Splits a content stream into content and `<think>…</think>` reasoning.
///
/// A two-state machine (`outside` / `inside`) over the incoming text.
/// Because a tag may be split across chunk boundaries, the longest trailing
/// fragment that is a strict prefix of the next expected tag is withheld
/// until more text arrives; the withheld buffer is therefore never longer
/// than the tag minus one byte. No input is rejected and no byte is lost:
/// whatever is still withheld at end of stream is flushed with the current
/// classification.
#[derive(Debug, Default)]
pub struct ThinkTagParser {
    inside: bool,
    pending: String,
}

impl ThinkTagParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_kind(&self) -> StreamKind {
        if self.inside {
            StreamKind::Thinking
        } else {
            StreamKind::Content
        }
    }

    fn expected_tag(&self) -> &'static str {
        if self.inside { THINK_CLOSE } else { THINK_OPEN }
    }

    /// Feeds one chunk of content text, returning the classified fragments
    /// that became unambiguous.
    pub fn push(&mut self, text: &str) -> Vec<(StreamKind, String)> {
        let mut working = std::mem::take(&mut self.pending);
        working.push_str(text);

        let mut out = Vec::new();
        loop {
            let tag = self.expected_tag();
            match find_ignore_case(&working, tag) {
                Some(at) => {
                    if at > 0 {
                        out.push((self.current_kind(), working[..at].to_string()));
                    }
                    working.drain(..at + tag.len());
                    self.inside = !self.inside;
                }
                None => {
                    let withheld = trailing_tag_prefix(&working, tag);
                    let emit = working.len() - withheld;
                    if emit > 0 {
                        out.push((self.current_kind(), working[..emit].to_string()));
                    }
                    self.pending = working.split_off(emit);
                    break;
                }
            }
        }
        out
    }

    /// Flushes any withheld bytes at end of stream.
    pub fn finish(&mut self) -> Option<(StreamKind, String)> {
        let rest = std::mem::take(&mut self.pending);
        if rest.is_empty() {
            None
        } else {
            Some((self.current_kind(), rest))
        }
    }
}

/// Byte offset of the first ASCII-case-insensitive occurrence of `needle`.
fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if h.len() < n.len() {
        return None;
    }
    (0..=h.len() - n.len()).find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}

/// Length of the longest trailing fragment of `s` that is a strict prefix
/// of `tag` (ASCII case-insensitive).
fn trailing_tag_prefix(s: &str, tag: &str) -> usize {
    let max = (tag.len() - 1).min(s.len());
    for len in (1..=max).rev() {
        let start = s.len() - len;
        if s.is_char_boundary(start) && s[start..].eq_ignore_ascii_case(&tag[..len]) {
            return len;
        }
    }
    0
}

// ---------------------------------------------------------------------------
// Streamed response shape
// ---------------------------------------------------------------------------

/// One `data:` payload of the completion stream.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

/// The delta fields we care about. Providers disagree on where reasoning
/// lives, so both spellings are accepted and treated identically.
#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

/// Parses one line of the response body. Returns `None` for blank lines,
/// non-`data:` lines, the `[DONE]` terminator, and malformed JSON — all of
/// which are skipped silently.
fn parse_data_line(line: &str) -> Option<StreamDelta> {
    let payload = line.strip_prefix("data: ")?.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    let chunk: StreamChunk = serde_json::from_str(payload).ok()?;
    chunk.choices.into_iter().next().map(|c| c.delta)
}

/// Everything collected from one successful stream.
struct StreamOutcome {
    content: String,
    thinking: String,
    raw_chunk_count: usize,
    raw_first_chunk: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A configured handle to one OpenAI-compatible chat endpoint.
pub struct LlmClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    log_path: PathBuf,
}

impl LlmClient {
    /// Creates a client for the given endpoint, credential, and model.
    /// No request timeout is set: slow models are paid for on the chess
    /// clock, not killed mid-stream.
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            log_path: log_path.into(),
        }
    }

    async fn stream_completion(
        &self,
        body: &serde_json::Value,
        on_chunk: ChunkSink<'_>,
    ) -> Result<StreamOutcome, LlmError> {
        let response = self
            .http
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let mut outcome = StreamOutcome {
            content: String::new(),
            thinking: String::new(),
            raw_chunk_count: 0,
            raw_first_chunk: None,
        };
        let mut demux = ThinkTagParser::new();
        let mut deliver = |kind: StreamKind, text: &str, outcome: &mut StreamOutcome| {
            match kind {
                StreamKind::Thinking => outcome.thinking.push_str(text),
                StreamKind::Content => outcome.content.push_str(text),
            }
            on_chunk(kind, text);
        };

        let mut stream = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        while let Some(bytes) = stream.next().await {
            buf.extend_from_slice(&bytes?);
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches(['\n', '\r']);
                let Some(delta) = parse_data_line(line) else {
                    continue;
                };
                outcome.raw_chunk_count += 1;
                if outcome.raw_first_chunk.is_none() {
                    outcome.raw_first_chunk = Some(line.to_string());
                }
                for text in [&delta.reasoning_content, &delta.thinking]
                    .into_iter()
                    .flatten()
                {
                    deliver(StreamKind::Thinking, text, &mut outcome);
                }
                if let Some(content) = &delta.content {
                    for (kind, text) in demux.push(content) {
                        deliver(kind, &text, &mut outcome);
                    }
                }
            }
        }
        if let Some((kind, text)) = demux.finish() {
            deliver(kind, &text, &mut outcome);
        }

        Ok(outcome)
    }

    /// Appends one JSONL record of the exchange to the log file. Logging
    /// failures are reported but never fail the chat.
    fn log_exchange(
        &self,
        messages: &serde_json::Value,
        outcome: Result<&StreamOutcome, &LlmError>,
    ) {
        let mut record = json!({
            "timestamp": unix_millis(),
            "model": self.model,
            "endpoint": self.api_url,
            "messages": messages,
        });
        match outcome {
            Ok(stream) => {
                record["response"] = json!({
                    "content": stream.content,
                    "thinking": stream.thinking,
                    "rawChunkCount": stream.raw_chunk_count,
                    "rawFirstChunk": stream.raw_first_chunk,
                });
            }
            Err(LlmError::Upstream { status, body }) => {
                record["error"] = json!({ "status": status, "body": body });
            }
            Err(err) => {
                record["error"] = json!({ "status": 0, "body": err.to_string() });
            }
        }
        if let Err(e) = append_jsonl(&self.log_path, &record) {
            log::warn!("failed to append LLM exchange log: {}", e);
        }
    }
}

#[async_trait]
impl ChatBackend for LlmClient {
    async fn chat(
        &self,
        system: &str,
        user: &str,
        on_chunk: ChunkSink<'_>,
    ) -> Result<String, LlmError> {
        acquire_rate_slot().await;

        let messages = json!([
            { "role": "system", "content": system },
            { "role": "user", "content": user },
        ]);
        let body = json!({
            "model": self.model,
            "messages": &messages,
            "temperature": 0.3,
            "max_tokens": 4096,
            "stream": true,
        });

        match self.stream_completion(&body, on_chunk).await {
            Ok(outcome) => {
                self.log_exchange(&messages, Ok(&outcome));
                Ok(outcome.content.trim().to_string())
            }
            Err(err) => {
                self.log_exchange(&messages, Err(&err));
                Err(err)
            }
        }
    }
}

fn unix_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn append_jsonl(path: &PathBuf, record: &serde_json::Value) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", record)
}
