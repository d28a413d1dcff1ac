//! Streaming chat client over newline-delimited JSON.
//!
//! The request asks for a streamed completion; each response line is a JSON
//! fragment carrying an incremental `content_delta` (or an Ollama-style
//! `message.content`), and a final fragment with `done: true` reports the
//! token count and generation duration used for the tokens/sec figure.

use super::{build_agent, truncate_for_log, ChatService, ServiceError};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Span};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(120);
const TAGS_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefixes that mark a sentinel reply produced by a failed request.
pub const ERROR_PREFIXES: [&str; 2] = ["[ERROR]", "[HTTP"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Completion text plus timing. Failed requests carry sentinel text.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub text: String,
    pub time_to_first_token: Option<Duration>,
    pub total: Duration,
    pub eval_count: u64,
    pub tokens_per_sec: f64,
    pub error: Option<ServiceError>,
}

impl ChatReply {
    pub fn failed(error: ServiceError, total: Duration) -> Self {
        let text = match &error {
            ServiceError::Status(code) => format!("[HTTP {code}]"),
            other => format!("[ERROR] {other}"),
        };
        Self {
            text,
            time_to_first_token: None,
            total,
            eval_count: 0,
            tokens_per_sec: 0.0,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
            || ERROR_PREFIXES
                .iter()
                .any(|prefix| self.text.starts_with(prefix))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    num_predict: u32,
}

#[derive(Debug, Deserialize, Default)]
struct StreamFragment {
    content_delta: Option<String>,
    message: Option<FragmentMessage>,
    #[serde(default)]
    done: bool,
    eval_count: Option<u64>,
    eval_duration: Option<u64>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FragmentMessage {
    #[serde(default)]
    content: String,
}

/// Accumulated stream contents before timing is attached.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StreamOutcome {
    pub(crate) text: String,
    pub(crate) first_token_at: Option<Duration>,
    pub(crate) eval_count: u64,
    pub(crate) tokens_per_sec: f64,
}

/// Read fragments until the terminal one. `started` anchors time-to-first-token.
pub(crate) fn accumulate_stream<R: BufRead>(
    reader: R,
    started: Instant,
) -> Result<StreamOutcome, ServiceError> {
    let mut outcome = StreamOutcome {
        text: String::new(),
        first_token_at: None,
        eval_count: 0,
        tokens_per_sec: 0.0,
    };
    let mut finished = false;
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fragment: StreamFragment = serde_json::from_str(line)
            .map_err(|err| ServiceError::MalformedBody(format!("{err}: {line}")))?;
        if let Some(message) = fragment.error {
            return Err(ServiceError::MalformedBody(format!("server error: {message}")));
        }
        let delta = fragment
            .content_delta
            .or_else(|| fragment.message.map(|message| message.content))
            .unwrap_or_default();
        if !delta.is_empty() {
            if outcome.first_token_at.is_none() {
                outcome.first_token_at = Some(started.elapsed());
            }
            outcome.text.push_str(&delta);
        }
        if fragment.done {
            outcome.eval_count = fragment.eval_count.unwrap_or(0);
            let eval_ns = fragment.eval_duration.unwrap_or(0);
            if eval_ns > 0 {
                outcome.tokens_per_sec = outcome.eval_count as f64 / (eval_ns as f64 / 1e9);
            }
            finished = true;
            break;
        }
    }
    if !finished && outcome.text.is_empty() {
        return Err(ServiceError::MalformedBody(
            "stream ended without a completion fragment".to_string(),
        ));
    }
    if !finished {
        warn!("chat stream ended without a done fragment; keeping partial text");
    }
    outcome.text = outcome.text.trim().to_string();
    Ok(outcome)
}

pub struct ChatClient {
    base_url: String,
    model: String,
    num_predict: u32,
    agent: ureq::Agent,
    tags_agent: ureq::Agent,
    span: Span,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, num_predict: u32) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let model = model.into();
        let span = info_span!("chat_client", url = %base_url, model = %model);
        Self {
            agent: build_agent(CONNECT_TIMEOUT, READ_TIMEOUT),
            tags_agent: build_agent(TAGS_TIMEOUT, TAGS_TIMEOUT),
            base_url,
            model,
            num_predict,
            span,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn stream_chat(
        &self,
        messages: &[ChatMessage],
        started: Instant,
    ) -> Result<StreamOutcome, ServiceError> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
            options: ChatOptions {
                num_predict: self.num_predict,
            },
        };
        let body = serde_json::to_string(&request)
            .map_err(|err| ServiceError::Io(format!("encode request: {err}")))?;
        let response = self
            .agent
            .post(&format!("{}/chat", self.base_url))
            .set("Content-Type", "application/json; charset=UTF-8")
            .send_string(&body)?;
        accumulate_stream(BufReader::new(response.into_reader()), started)
    }
}

impl ChatService for ChatClient {
    fn chat(&self, messages: &[ChatMessage]) -> ChatReply {
        let _entered = self.span.enter();
        let started = Instant::now();
        debug!(messages = messages.len(), "chat request");
        match self.stream_chat(messages, started) {
            Ok(outcome) => {
                let total = started.elapsed();
                info!(
                    ttft_ms = outcome.first_token_at.map(|d| d.as_millis() as u64),
                    total_ms = total.as_millis() as u64,
                    tokens = outcome.eval_count,
                    tps = outcome.tokens_per_sec,
                    reply = %truncate_for_log(&outcome.text, 50),
                    "chat reply"
                );
                ChatReply {
                    text: outcome.text,
                    time_to_first_token: outcome.first_token_at,
                    total,
                    eval_count: outcome.eval_count,
                    tokens_per_sec: outcome.tokens_per_sec,
                    error: None,
                }
            }
            Err(err) => {
                warn!(error = %err, "chat request failed");
                ChatReply::failed(err, started.elapsed())
            }
        }
    }

    fn is_alive(&self) -> bool {
        let _entered = self.span.enter();
        match self
            .tags_agent
            .get(&format!("{}/tags", self.base_url))
            .call()
        {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %ServiceError::from(err), "tags probe failed");
                false
            }
        }
    }
}
