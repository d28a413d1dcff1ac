//! One listen: record a take, gate its quality, transcribe, filter artifacts.

use crate::audio::{AudioSource, RecordError, VadListener, VadRecorder, VadUpdate};
use crate::services::{truncate_for_log, Transcriber};
use crate::telemetry::Telemetry;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Span};

use super::phrases::is_hallucination;

/// Takes quieter than this peak and with fewer speech chunks are not sent.
pub const MIN_PEAK_LEVEL: u32 = 250;
pub const MIN_SPEECH_CHUNKS: u32 = 2;
pub const MIN_WAV_BYTES: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Heard,
    Silent,
    LowQuality,
    Hallucination,
    ServiceFailed,
    DeviceFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heard {
    pub outcome: Outcome,
    pub text: String,
    pub text_en: String,
    pub language: String,
}

impl Heard {
    pub fn nothing(outcome: Outcome) -> Self {
        Self {
            outcome,
            text: String::new(),
            text_en: String::new(),
            language: String::new(),
        }
    }

    pub fn speech(text: &str, text_en: &str, language: &str) -> Self {
        Self {
            outcome: Outcome::Heard,
            text: text.to_string(),
            text_en: text_en.to_string(),
            language: language.to_string(),
        }
    }

    pub fn ok(&self) -> bool {
        self.outcome == Outcome::Heard && !self.text_en.trim().is_empty()
    }
}

/// Capture one utterance and return what was understood.
pub trait Listen {
    fn listen(&mut self, max: Duration) -> Heard;
}

pub struct SpeechListener<S: AudioSource, T: Transcriber> {
    recorder: VadRecorder<S>,
    transcriber: T,
    translate: bool,
    span: Span,
}

impl<S: AudioSource, T: Transcriber> SpeechListener<S, T> {
    pub fn new(recorder: VadRecorder<S>, transcriber: T) -> Self {
        Self {
            recorder,
            transcriber,
            translate: true,
            span: info_span!("listener"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Ask the service for an English translation alongside the original text.
    pub fn with_translation(mut self, translate: bool) -> Self {
        self.translate = translate;
        self
    }

    pub fn set_vad_listener(&mut self, listener: VadListener) {
        self.recorder.set_listener(listener);
    }
}

impl<S: AudioSource, T: Transcriber> Listen for SpeechListener<S, T> {
    fn listen(&mut self, max: Duration) -> Heard {
        let _entered = self.span.enter();
        let recording = match self.recorder.record(max) {
            Ok(recording) => recording,
            Err(RecordError::DeviceUnavailable(reason)) => {
                warn!(%reason, "no microphone");
                return Heard::nothing(Outcome::DeviceFailed);
            }
            Err(err) => {
                warn!(error = %err, "recording failed");
                return Heard::nothing(Outcome::DeviceFailed);
            }
        };

        let wav_bytes = fs::metadata(&recording.path)
            .map(|meta| meta.len())
            .unwrap_or(0);
        if wav_bytes < MIN_WAV_BYTES {
            info!(wav_bytes, "take too short to transcribe");
            return Heard::nothing(Outcome::LowQuality);
        }
        if recording.peak_level < MIN_PEAK_LEVEL && recording.speech_chunks < MIN_SPEECH_CHUNKS {
            info!(
                peak = recording.peak_level,
                speech_chunks = recording.speech_chunks,
                "skipping low-quality take"
            );
            return Heard::nothing(Outcome::LowQuality);
        }

        let transcript = self.transcriber.transcribe(&recording.path, self.translate);
        if !transcript.ok {
            return Heard::nothing(Outcome::ServiceFailed);
        }
        if transcript.text_en.trim().is_empty() {
            info!("nothing recognized");
            return Heard::nothing(Outcome::Silent);
        }
        if is_hallucination(&transcript.text_en)
            || (transcript.text != transcript.text_en && is_hallucination(&transcript.text))
        {
            info!(text = %truncate_for_log(&transcript.text_en, 50), "filtered transcription artifact");
            return Heard::nothing(Outcome::Hallucination);
        }

        info!(
            lang = %transcript.language,
            text = %truncate_for_log(&transcript.text, 50),
            "heard"
        );
        debug!(text = %transcript.text, text_en = %transcript.text_en, "full transcript");
        Heard::speech(&transcript.text, &transcript.text_en, &transcript.language)
    }
}

/// Mirror recorder progress into the telemetry snapshot.
pub fn telemetry_vad_listener(telemetry: Telemetry) -> VadListener {
    Arc::new(move |update: VadUpdate| {
        telemetry.update("vadLevel", update.level);
        telemetry.update("vadWorking", update.vad_working);
        telemetry.update("isRecording", update.is_recording);
        telemetry.update("recordingDurationMs", update.elapsed_ms);
        telemetry.update("isSpeech", update.is_speech);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::VadPolicy;
    use crate::services::{ServiceError, Transcript};
    use serde_json::Value;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::path::Path;

    struct ScriptedMic {
        levels: VecDeque<i16>,
        broken: bool,
    }

    impl ScriptedMic {
        fn speaking(chunks: usize) -> Self {
            Self {
                levels: std::iter::repeat(2_000).take(chunks).collect(),
                broken: false,
            }
        }
    }

    impl AudioSource for ScriptedMic {
        fn start(&mut self) -> Result<(), RecordError> {
            if self.broken {
                return Err(RecordError::DeviceUnavailable("no card".to_string()));
            }
            Ok(())
        }

        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn read_chunk(&mut self, want: usize, _: Duration) -> Result<Vec<i16>, RecordError> {
            let level = self.levels.pop_front().unwrap_or(0);
            Ok((0..want)
                .map(|n| if n % 2 == 0 { level } else { -level })
                .collect())
        }

        fn stop(&mut self) {}
    }

    struct Canned {
        reply: Transcript,
        calls: Cell<u32>,
    }

    impl Canned {
        fn saying(text: &str, text_en: &str) -> Self {
            Self {
                reply: Transcript {
                    ok: true,
                    text: text.to_string(),
                    text_en: text_en.to_string(),
                    language: "en".to_string(),
                    processing_ms: 10,
                    error: None,
                },
                calls: Cell::new(0),
            }
        }
    }

    impl Transcriber for &Canned {
        fn transcribe(&self, wav_path: &Path, translate: bool) -> Transcript {
            assert!(wav_path.exists());
            assert!(translate);
            self.calls.set(self.calls.get() + 1);
            self.reply.clone()
        }

        fn is_alive(&self) -> bool {
            true
        }
    }

    fn listener<'a>(
        dir: &tempfile::TempDir,
        mic: ScriptedMic,
        canned: &'a Canned,
    ) -> SpeechListener<ScriptedMic, &'a Canned> {
        let recorder = VadRecorder::new(mic, VadPolicy::default(), dir.path().join("take.wav"));
        SpeechListener::new(recorder, canned)
    }

    #[test]
    fn clear_speech_is_heard() {
        let dir = tempfile::tempdir().expect("temp dir");
        let canned = Canned::saying("I'm from Canada", "I'm from Canada");
        let heard = listener(&dir, ScriptedMic::speaking(10), &canned).listen(Duration::from_secs(15));
        assert!(heard.ok());
        assert_eq!(heard.text_en, "I'm from Canada");
        assert_eq!(canned.calls.get(), 1);
    }

    #[test]
    fn quiet_take_skips_transcription() {
        let dir = tempfile::tempdir().expect("temp dir");
        let canned = Canned::saying("never", "never");
        let heard = listener(&dir, ScriptedMic::speaking(0), &canned).listen(Duration::from_secs(2));
        assert_eq!(heard.outcome, Outcome::LowQuality);
        assert_eq!(canned.calls.get(), 0);
    }

    #[test]
    fn subtitle_artifacts_are_filtered() {
        let dir = tempfile::tempdir().expect("temp dir");
        let canned = Canned::saying("ご視聴ありがとうございました", "Thank you for watching");
        let heard = listener(&dir, ScriptedMic::speaking(8), &canned).listen(Duration::from_secs(15));
        assert_eq!(heard.outcome, Outcome::Hallucination);
        assert!(!heard.ok());
    }

    #[test]
    fn empty_transcription_is_silence() {
        let dir = tempfile::tempdir().expect("temp dir");
        let canned = Canned::saying("", "");
        let heard = listener(&dir, ScriptedMic::speaking(8), &canned).listen(Duration::from_secs(15));
        assert_eq!(heard.outcome, Outcome::Silent);
    }

    #[test]
    fn service_failure_is_reported() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut canned = Canned::saying("", "");
        canned.reply = Transcript::failed(ServiceError::Timeout);
        let heard = listener(&dir, ScriptedMic::speaking(8), &canned).listen(Duration::from_secs(15));
        assert_eq!(heard.outcome, Outcome::ServiceFailed);
    }

    #[test]
    fn broken_microphone_reports_device_failure_to_telemetry() {
        let dir = tempfile::tempdir().expect("temp dir");
        let canned = Canned::saying("x", "x");
        let telemetry = Telemetry::new();
        let mic = ScriptedMic {
            levels: VecDeque::new(),
            broken: true,
        };
        let mut listener = listener(&dir, mic, &canned);
        listener.set_vad_listener(telemetry_vad_listener(telemetry.clone()));
        let heard = listener.listen(Duration::from_secs(1));
        assert_eq!(heard.outcome, Outcome::DeviceFailed);
        assert_eq!(telemetry.get("vadLevel"), Some(Value::from(-1)));
        assert_eq!(telemetry.get("vadWorking"), Some(Value::from(false)));
    }

    #[test]
    fn telemetry_sees_recording_finish() {
        let dir = tempfile::tempdir().expect("temp dir");
        let canned = Canned::saying("Hello there", "Hello there");
        let telemetry = Telemetry::new();
        let mut listener = listener(&dir, ScriptedMic::speaking(6), &canned);
        listener.set_vad_listener(telemetry_vad_listener(telemetry.clone()));
        assert!(listener.listen(Duration::from_secs(15)).ok());
        assert_eq!(telemetry.get("isRecording"), Some(Value::from(false)));
        assert_eq!(telemetry.get("vadWorking"), Some(Value::from(true)));
        let duration = telemetry
            .get("recordingDurationMs")
            .and_then(|value| value.as_u64())
            .unwrap_or(0);
        assert!(duration >= 600);
    }
}
