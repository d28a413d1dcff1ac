//! Face-attribute client: uploads one JPEG frame, returns the dominant label.

use super::multipart::MultipartBody;
use super::{build_agent, FaceAnalyzer, ServiceError};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn, Span};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FaceAttributes {
    pub ok: bool,
    pub label: String,
    /// 0-100.
    pub confidence: u8,
    pub processing_ms: u64,
    pub error: Option<ServiceError>,
}

impl FaceAttributes {
    pub fn failed(error: ServiceError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn accepted(&self, min_confidence: u8) -> bool {
        self.ok && !self.label.is_empty() && self.confidence >= min_confidence
    }
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    ok: bool,
    #[serde(alias = "dominant_race")]
    dominant_label: Option<String>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    processing_ms: u64,
}

pub(crate) fn parse_analyze_body(body: &str) -> Result<FaceAttributes, ServiceError> {
    let parsed: AnalyzeResponse = serde_json::from_str(body)
        .map_err(|err| ServiceError::MalformedBody(err.to_string()))?;
    let label = match (parsed.ok, parsed.dominant_label) {
        (_, Some(label)) => label,
        (false, None) => String::new(),
        (true, None) => {
            return Err(ServiceError::MalformedBody(
                "missing field `dominant_label`".to_string(),
            ))
        }
    };
    Ok(FaceAttributes {
        ok: parsed.ok,
        label,
        confidence: parsed.confidence.round().clamp(0.0, 100.0) as u8,
        processing_ms: parsed.processing_ms,
        error: None,
    })
}

pub struct FaceClient {
    base_url: String,
    agent: ureq::Agent,
    span: Span,
}

impl FaceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let span = info_span!("face_client", url = %base_url);
        Self {
            agent: build_agent(CONNECT_TIMEOUT, READ_TIMEOUT),
            base_url,
            span,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn post_image(&self, jpeg: &[u8]) -> Result<FaceAttributes, ServiceError> {
        let (content_type, body) = MultipartBody::new("Face")
            .file("image", "face.jpg", "image/jpeg", jpeg)
            .finish();
        let response = self
            .agent
            .post(&format!("{}/analyze_face", self.base_url))
            .set("Content-Type", &content_type)
            .send_bytes(&body)?;
        parse_analyze_body(&response.into_string()?)
    }
}

impl FaceAnalyzer for FaceClient {
    fn analyze(&self, jpeg: &[u8]) -> FaceAttributes {
        let _entered = self.span.enter();
        if jpeg.is_empty() {
            return FaceAttributes::failed(ServiceError::Io("empty image".to_string()));
        }
        let started = Instant::now();
        match self.post_image(jpeg) {
            Ok(attributes) => {
                info!(
                    label = %attributes.label,
                    confidence = attributes.confidence,
                    server_ms = attributes.processing_ms,
                    total_ms = started.elapsed().as_millis() as u64,
                    "face attributes"
                );
                attributes
            }
            Err(err) => {
                warn!(error = %err, "face analysis failed");
                FaceAttributes::failed(err)
            }
        }
    }
}
