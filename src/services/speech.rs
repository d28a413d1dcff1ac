//! Transcription client: uploads a WAV take and returns text, translation, and language.

use super::multipart::MultipartBody;
use super::{build_agent, truncate_for_log, ServiceError, Transcriber};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Span};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(120);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Normalized transcription result; `ok == false` covers every failure mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transcript {
    pub ok: bool,
    /// Original-language text.
    pub text: String,
    /// English translation, or the original text when none was returned.
    pub text_en: String,
    pub language: String,
    pub processing_ms: u64,
    pub error: Option<ServiceError>,
}

impl Transcript {
    pub fn failed(error: ServiceError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn heard(&self) -> bool {
        self.ok && !self.text_en.trim().is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    ok: bool,
    text: Option<String>,
    text_en: Option<String>,
    #[serde(default)]
    language: String,
    #[serde(default)]
    processing_ms: u64,
}

pub(crate) fn parse_transcribe_body(body: &str) -> Result<Transcript, ServiceError> {
    let parsed: TranscribeResponse = serde_json::from_str(body)
        .map_err(|err| ServiceError::MalformedBody(err.to_string()))?;
    let text = parsed
        .text
        .ok_or_else(|| ServiceError::MalformedBody("missing field `text`".to_string()))?;
    let text_en = parsed.text_en.unwrap_or_else(|| text.clone());
    Ok(Transcript {
        ok: parsed.ok,
        text,
        text_en,
        language: parsed.language,
        processing_ms: parsed.processing_ms,
        error: None,
    })
}

pub struct SpeechClient {
    base_url: String,
    agent: ureq::Agent,
    health_agent: ureq::Agent,
    span: Span,
}

impl SpeechClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let span = info_span!("speech_client", url = %base_url);
        Self {
            agent: build_agent(CONNECT_TIMEOUT, READ_TIMEOUT),
            health_agent: build_agent(CONNECT_TIMEOUT, HEALTH_TIMEOUT),
            base_url,
            span,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn post_audio(&self, wav_path: &Path, translate: bool) -> Result<Transcript, ServiceError> {
        let bytes = fs::read(wav_path)
            .map_err(|err| ServiceError::Io(format!("{}: {err}", wav_path.display())))?;
        if bytes.is_empty() {
            return Err(ServiceError::Io(format!("{} is empty", wav_path.display())));
        }
        let filename = wav_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("audio.wav");
        let mut form = MultipartBody::new("Sota").file("audio", filename, "audio/wav", &bytes);
        if translate {
            form = form.text("translate", "true");
        }
        let (content_type, body) = form.finish();
        debug!(kb = bytes.len() / 1024, translate, "uploading audio");

        let response = self
            .agent
            .post(&format!("{}/transcribe", self.base_url))
            .set("Content-Type", &content_type)
            .send_bytes(&body)?;
        let text = response.into_string()?;
        parse_transcribe_body(&text)
    }
}

impl Transcriber for SpeechClient {
    fn transcribe(&self, wav_path: &Path, translate: bool) -> Transcript {
        let _entered = self.span.enter();
        let started = Instant::now();
        match self.post_audio(wav_path, translate) {
            Ok(transcript) => {
                info!(
                    lang = %transcript.language,
                    text = %truncate_for_log(&transcript.text, 50),
                    text_en = %truncate_for_log(&transcript.text_en, 50),
                    server_ms = transcript.processing_ms,
                    total_ms = started.elapsed().as_millis() as u64,
                    "transcribed"
                );
                transcript
            }
            Err(err) => {
                warn!(error = %err, elapsed_ms = started.elapsed().as_millis() as u64, "transcription failed");
                Transcript::failed(err)
            }
        }
    }

    fn is_alive(&self) -> bool {
        let _entered = self.span.enter();
        match self
            .health_agent
            .get(&format!("{}/health", self.base_url))
            .call()
        {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %ServiceError::from(err), "health probe failed");
                false
            }
        }
    }
}
