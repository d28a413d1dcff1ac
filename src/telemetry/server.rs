//! Minimal HTTP/1.1 status endpoint over `std::net`.
//!
//! One accept thread polls a nonblocking listener so `stop()` is prompt; every
//! accepted connection gets its own short-lived thread and is closed after a
//! single response.

use super::Telemetry;
use anyhow::{Context, Result};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Span};

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_REQUEST_LINE: u64 = 512;
const MAX_HEADER_BYTES: u64 = 4096;
const STOP_JOIN_BUDGET: Duration = Duration::from_secs(2);

const NOT_FOUND_BODY: &str = r#"{"error":"Not found. Use /status or /health"}"#;
const HEALTH_BODY: &str = r#"{"ok":true}"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Response {
    pub(crate) status: &'static str,
    pub(crate) body: String,
}

impl Response {
    fn to_bytes(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json; charset=UTF-8\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
            self.status,
            self.body.len(),
            self.body
        )
        .into_bytes()
    }
}

/// Route a raw request line such as `GET /status HTTP/1.1`.
pub(crate) fn route(request_line: &str, telemetry: &Telemetry) -> Response {
    let target = request_line.split_whitespace().nth(1).unwrap_or("");
    let path = target.split('?').next().unwrap_or("");
    match path {
        "/status" => Response {
            status: "200 OK",
            body: telemetry.status_json(),
        },
        "/health" => Response {
            status: "200 OK",
            body: HEALTH_BODY.to_string(),
        },
        _ => Response {
            status: "404 Not Found",
            body: NOT_FOUND_BODY.to_string(),
        },
    }
}

pub struct TelemetryServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    span: Span,
}

impl TelemetryServer {
    /// Bind `0.0.0.0:port` (0 picks an ephemeral port) and start accepting.
    pub fn start(telemetry: Telemetry, port: u16) -> Result<Self> {
        Self::start_with_span(telemetry, port, info_span!("telemetry_server", port))
    }

    pub fn start_with_span(telemetry: Telemetry, port: u16, span: Span) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .with_context(|| format!("failed to bind status server on port {port}"))?;
        listener
            .set_nonblocking(true)
            .context("failed to set status listener nonblocking")?;
        let local_addr = listener
            .local_addr()
            .context("failed to read status listener address")?;

        let running = Arc::new(AtomicBool::new(true));
        let accept_running = Arc::clone(&running);
        let accept_span = span.clone();
        let accept_thread = thread::Builder::new()
            .name("telemetry-accept".into())
            .spawn(move || {
                let _entered = accept_span.enter();
                accept_loop(&listener, &telemetry, &accept_running, &accept_span);
            })
            .context("failed to spawn status server thread")?;

        {
            let _entered = span.enter();
            info!(addr = %local_addr, "status server listening");
        }
        Ok(Self {
            local_addr,
            running,
            accept_thread: Some(accept_thread),
            span,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting; in-flight client threads finish on their own.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.accept_thread.take() else {
            return;
        };
        let _entered = self.span.enter();
        let deadline = Instant::now() + STOP_JOIN_BUDGET;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                warn!("status accept thread panicked");
            }
            info!("status server stopped");
        } else {
            warn!("status accept thread did not stop in time");
        }
    }
}

impl Drop for TelemetryServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: &TcpListener, telemetry: &Telemetry, running: &AtomicBool, span: &Span) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let telemetry = telemetry.clone();
                let span = span.clone();
                let spawned = thread::Builder::new()
                    .name("telemetry-client".into())
                    .spawn(move || {
                        let _entered = span.enter();
                        if let Err(err) = handle_client(stream, &telemetry) {
                            debug!(%peer, error = %err, "status client error");
                        }
                    });
                if let Err(err) = spawned {
                    warn!(error = %err, "failed to spawn status client thread");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(err) => {
                warn!(error = %err, "status accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handle_client(stream: TcpStream, telemetry: &Telemetry) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT))?;
    stream.set_write_timeout(Some(CLIENT_READ_TIMEOUT))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    (&mut reader)
        .take(MAX_REQUEST_LINE)
        .read_line(&mut request_line)?;
    drain_headers(&mut reader)?;

    let response = route(request_line.trim_end(), telemetry);
    debug!(request = %request_line.trim_end(), status = response.status, "status request");
    let mut stream = stream;
    stream.write_all(&response.to_bytes())?;
    stream.flush()
}

fn drain_headers<R: BufRead>(reader: &mut R) -> io::Result<()> {
    let mut limited = reader.take(MAX_HEADER_BYTES);
    let mut line = String::new();
    loop {
        line.clear();
        if limited.read_line(&mut line)? == 0 || line == "\r\n" || line == "\n" {
            return Ok(());
        }
    }
}
