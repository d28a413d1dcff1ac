//! Blocking HTTP clients for the remote speech, chat, and face-attribute services.
//!
//! Every client normalizes transport and protocol failures into a "not ok"
//! result value carrying a [`ServiceError`], so the engine never unwinds on a
//! network problem. The traits here are the seams the engine depends on.

pub mod chat;
pub mod face;
pub mod multipart;
pub mod speech;

pub use chat::{ChatClient, ChatMessage, ChatReply, ChatRole};
pub use face::{FaceAttributes, FaceClient};
pub use speech::{SpeechClient, Transcript};

use std::io;
use std::path::Path;
use std::time::Duration;

/// Uniform failure taxonomy for the remote services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    ConnectionRefused(String),
    Timeout,
    Status(u16),
    MalformedBody(String),
    Io(String),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionRefused(msg) => write!(f, "connection failed: {msg}"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Status(code) => write!(f, "HTTP {code}"),
            Self::MalformedBody(msg) => write!(f, "malformed response: {msg}"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<io::Error> for ServiceError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<ureq::Error> for ServiceError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, _) => Self::Status(code),
            ureq::Error::Transport(transport) => {
                let io_kind = std::error::Error::source(&transport)
                    .and_then(|source| source.downcast_ref::<io::Error>())
                    .map(io::Error::kind);
                match (transport.kind(), io_kind) {
                    (_, Some(io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)) => {
                        Self::Timeout
                    }
                    (ureq::ErrorKind::ConnectionFailed | ureq::ErrorKind::Dns, _) => {
                        Self::ConnectionRefused(transport.to_string())
                    }
                    (_, _) if transport.to_string().contains("timed out") => Self::Timeout,
                    (_, _) => Self::Io(transport.to_string()),
                }
            }
        }
    }
}

/// Speech-to-text over the network.
pub trait Transcriber {
    fn transcribe(&self, wav_path: &Path, translate: bool) -> Transcript;
    fn is_alive(&self) -> bool;
}

/// Chat completion over the network.
pub trait ChatService {
    fn chat(&self, messages: &[ChatMessage]) -> ChatReply;
    fn is_alive(&self) -> bool;

    fn chat_single(&self, system_prompt: &str, user_message: &str) -> ChatReply {
        self.chat(&[
            ChatMessage::system(system_prompt),
            ChatMessage::user(user_message),
        ])
    }

    fn chat_with_history(&self, system_prompt: &str, history: &[ChatMessage]) -> ChatReply {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend_from_slice(history);
        self.chat(&messages)
    }
}

/// Face-attribute inference over the network.
pub trait FaceAnalyzer {
    fn analyze(&self, jpeg: &[u8]) -> FaceAttributes;
}

pub(crate) fn build_agent(connect: Duration, read: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(connect)
        .timeout_read(read)
        .timeout_write(read)
        .build()
}

pub(crate) fn truncate_for_log(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
pub(crate) mod test_support {
    //! One-shot HTTP stubs bound to an ephemeral port.

    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    pub(crate) struct CapturedRequest {
        pub(crate) head: String,
        pub(crate) body: Vec<u8>,
    }

    pub(crate) fn http_response(status: &str, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// Serve `response` to exactly one request and hand back what was received.
    pub(crate) fn spawn_stub(response: String) -> (String, JoinHandle<CapturedRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
            let mut head = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).expect("read header") == 0 {
                    break;
                }
                if let Some(value) = line
                    .to_ascii_lowercase()
                    .strip_prefix("content-length:")
                    .map(str::trim)
                    .map(str::to_string)
                {
                    content_length = value.parse().unwrap_or(0);
                }
                let end = line == "\r\n";
                head.push_str(&line);
                if end {
                    break;
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).expect("read body");
            stream.write_all(response.as_bytes()).expect("write response");
            stream.flush().expect("flush");
            CapturedRequest { head, body }
        });
        (format!("http://{addr}"), handle)
    }

    /// A base URL whose port has nothing listening.
    pub(crate) fn closed_port_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        format!("http://{addr}")
    }
}
