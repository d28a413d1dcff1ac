//! Microphone recorder that polls audio in ~100ms chunks and stops on VAD silence.
//!
//! The recorder owns the audio device for the duration of one take. Sources are
//! abstracted behind [`AudioSource`] so tests can drive the VAD loop with
//! synthetic loudness streams instead of a real microphone.

use super::level::{downmix_i16_to_mono, downmix_to_mono, float_sample_to_i16};
use super::vad::{CaptureMetrics, CaptureState, StopReason, VadPolicy};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    DeviceUnavailable(String),
    Write(String),
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceUnavailable(msg) => write!(f, "audio device unavailable: {msg}"),
            Self::Write(msg) => write!(f, "failed to write recording: {msg}"),
        }
    }
}

impl std::error::Error for RecordError {}

/// A stream of mono 16-bit samples.
pub trait AudioSource {
    /// Open the device and begin buffering samples.
    fn start(&mut self) -> Result<(), RecordError>;
    /// Effective sample rate; valid after `start`.
    fn sample_rate(&self) -> u32;
    /// Wait up to `timeout` for `want` samples and return what arrived.
    fn read_chunk(&mut self, want: usize, timeout: Duration) -> Result<Vec<i16>, RecordError>;
    /// Release the device.
    fn stop(&mut self);
}

/// Live level report delivered once per poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadUpdate {
    /// RMS level of the last chunk, or -1 when the device failed.
    pub level: i32,
    pub vad_working: bool,
    pub is_recording: bool,
    pub elapsed_ms: u64,
    pub is_speech: bool,
}

impl VadUpdate {
    fn device_failed() -> Self {
        Self {
            level: -1,
            vad_working: false,
            is_recording: false,
            elapsed_ms: 0,
            is_speech: false,
        }
    }
}

pub type VadListener = Arc<dyn Fn(VadUpdate) + Send + Sync>;

/// One finished take written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub path: PathBuf,
    pub duration: Duration,
    pub peak_level: u32,
    pub speech_chunks: u32,
    pub stop_reason: StopReason,
    pub metrics: CaptureMetrics,
}

pub struct VadRecorder<S: AudioSource> {
    source: S,
    policy: VadPolicy,
    wav_path: PathBuf,
    listener: Option<VadListener>,
    span: Span,
}

impl<S: AudioSource> VadRecorder<S> {
    pub fn new(source: S, policy: VadPolicy, wav_path: impl Into<PathBuf>) -> Self {
        let wav_path = wav_path.into();
        let span = info_span!("vad_recorder", wav = %wav_path.display());
        Self {
            source,
            policy,
            wav_path,
            listener: None,
            span,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn set_listener(&mut self, listener: VadListener) {
        self.listener = Some(listener);
    }

    pub fn policy(&self) -> &VadPolicy {
        &self.policy
    }

    fn notify(&self, update: VadUpdate) {
        if let Some(listener) = &self.listener {
            listener(update);
        }
    }

    /// Record one utterance capped at `max_duration`, then write it as WAV.
    pub fn record(&mut self, max_duration: Duration) -> Result<Recording, RecordError> {
        let _entered = self.span.clone().entered();
        let max_ms = u64::try_from(max_duration.as_millis()).unwrap_or(u64::MAX);

        if let Err(err) = self.source.start() {
            warn!(error = %err, "microphone unavailable");
            self.notify(VadUpdate::device_failed());
            return Err(err);
        }

        let mut policy = self.policy.clone().with_max_duration_ms(max_ms);
        policy.sample_rate = self.source.sample_rate();
        let want = policy.chunk_samples();
        let poll = Duration::from_millis(policy.poll_ms);
        let mut state = CaptureState::new(&policy);
        let mut samples: Vec<i16> = Vec::with_capacity(want * 16);
        let mut stop_reason = StopReason::MaxDuration;
        let started = Instant::now();

        info!(max_ms, threshold = policy.threshold, "recording");
        while !state.reached_cap() {
            let remaining = max_duration.saturating_sub(started.elapsed());
            let wait = (poll * 2).min(remaining).max(Duration::from_millis(1));
            let chunk = match self.source.read_chunk(want, wait) {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.source.stop();
                    warn!(error = %err, "audio stream failed mid-take");
                    self.notify(VadUpdate::device_failed());
                    return Err(err);
                }
            };
            // A stalled device still advances the clock so the cap holds.
            let chunk_ms = if chunk.is_empty() {
                policy.poll_ms
            } else {
                (chunk.len() as u64 * 1000) / u64::from(policy.sample_rate.max(1))
            };
            let (verdict, stop) = state.on_chunk(&chunk, chunk_ms);
            samples.extend_from_slice(&chunk);
            self.notify(VadUpdate {
                level: i32::try_from(verdict.level).unwrap_or(i32::MAX),
                vad_working: true,
                is_recording: true,
                elapsed_ms: state.metrics().total_ms,
                is_speech: verdict.is_speech,
            });
            if let Some(reason) = stop {
                stop_reason = reason;
                break;
            }
            // Slow reads must not stretch the take past the wall-clock cap.
            if started.elapsed() >= max_duration {
                break;
            }
        }
        self.source.stop();

        let metrics = state.metrics();
        self.notify(VadUpdate {
            level: 0,
            vad_working: true,
            is_recording: false,
            elapsed_ms: metrics.total_ms,
            is_speech: false,
        });

        write_wav(&self.wav_path, &samples, policy.sample_rate)?;
        info!(
            stop = stop_reason.describe(),
            audio_ms = metrics.total_ms,
            wall_ms = started.elapsed().as_millis() as u64,
            peak = metrics.peak_level,
            speech_chunks = metrics.speech_chunks,
            "recording complete"
        );
        Ok(Recording {
            path: self.wav_path.clone(),
            duration: Duration::from_millis(metrics.total_ms),
            peak_level: metrics.peak_level,
            speech_chunks: metrics.speech_chunks,
            stop_reason,
            metrics,
        })
    }
}

fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<(), RecordError> {
    let result = write_wav_inner(path, samples, sample_rate);
    if result.is_err() {
        let _ = fs::remove_file(path);
    }
    result
}

fn write_wav_inner(path: &Path, samples: &[i16], sample_rate: u32) -> Result<(), RecordError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let write_err = |err: hound::Error| RecordError::Write(format!("{}: {err}", path.display()));
    let mut writer = hound::WavWriter::create(path, spec).map_err(write_err)?;
    for sample in samples {
        writer.write_sample(*sample).map_err(write_err)?;
    }
    writer.finalize().map_err(write_err)
}

// ---------------------------------------------------------------------------
// cpal microphone adapter
// ---------------------------------------------------------------------------

const TEST_DEVICES_ENV: &str = "SOTA_INTERACT_TEST_DEVICES";

/// Names of available input devices (overridable through env for smoke tests).
pub fn list_input_devices() -> Vec<String> {
    if let Ok(raw) = env::var(TEST_DEVICES_ENV) {
        return raw
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
    }
    use cpal::traits::{DeviceTrait, HostTrait};
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => devices.filter_map(|device| device.name().ok()).collect(),
        Err(err) => {
            warn!(error = %err, "failed to enumerate input devices");
            Vec::new()
        }
    }
}

/// Default-host microphone opened fresh for each take.
pub struct CpalSource {
    device_pattern: Option<String>,
    requested_rate: u32,
    actual_rate: u32,
    stream: Option<cpal::Stream>,
    rx: Option<Receiver<Vec<i16>>>,
    pending: Vec<i16>,
}

impl CpalSource {
    pub fn new(device_pattern: Option<String>, sample_rate: u32) -> Self {
        Self {
            device_pattern,
            requested_rate: sample_rate,
            actual_rate: sample_rate,
            stream: None,
            rx: None,
            pending: Vec::new(),
        }
    }

    fn resolve_device(&self) -> Result<cpal::Device, RecordError> {
        use cpal::traits::{DeviceTrait, HostTrait};
        let host = cpal::default_host();
        let by_pattern = self.device_pattern.as_ref().and_then(|pattern| {
            let pattern = pattern.to_lowercase();
            host.input_devices().ok()?.find(|device| {
                device
                    .name()
                    .map(|name| name.to_lowercase().contains(&pattern))
                    .unwrap_or(false)
            })
        });
        by_pattern
            .or_else(|| host.default_input_device())
            .ok_or_else(|| RecordError::DeviceUnavailable("no input device found".to_string()))
    }
}

/// One advertised input configuration, reduced to what format selection needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InputRange {
    pub channels: u16,
    pub min_rate: u32,
    pub max_rate: u32,
    pub format: cpal::SampleFormat,
}

impl From<&cpal::SupportedStreamConfigRange> for InputRange {
    fn from(range: &cpal::SupportedStreamConfigRange) -> Self {
        Self {
            channels: range.channels(),
            min_rate: range.min_sample_rate().0,
            max_rate: range.max_sample_rate().0,
            format: range.sample_format(),
        }
    }
}

/// Index of the range to open at `rate`: f32 first, then i16. Other formats are skipped.
pub(crate) fn pick_input_range(ranges: &[InputRange], rate: u32) -> Option<usize> {
    let covers = |range: &InputRange| {
        range.channels >= 1 && range.min_rate <= rate && rate <= range.max_rate
    };
    [cpal::SampleFormat::F32, cpal::SampleFormat::I16]
        .into_iter()
        .find_map(|format| {
            ranges
                .iter()
                .position(|range| range.format == format && covers(range))
        })
}

impl AudioSource for CpalSource {
    fn start(&mut self) -> Result<(), RecordError> {
        use cpal::traits::{DeviceTrait, StreamTrait};
        let device = self.resolve_device()?;
        let unavailable = |msg: String| RecordError::DeviceUnavailable(msg);

        let ranges: Vec<cpal::SupportedStreamConfigRange> = device
            .supported_input_configs()
            .map_err(|err| unavailable(err.to_string()))?
            .collect();
        let offered: Vec<InputRange> = ranges.iter().map(InputRange::from).collect();
        let supported = match pick_input_range(&offered, self.requested_rate) {
            Some(index) => ranges[index]
                .clone()
                .with_sample_rate(cpal::SampleRate(self.requested_rate)),
            None => device
                .default_input_config()
                .map_err(|err| unavailable(err.to_string()))?,
        };
        let format = supported.sample_format();
        let config = supported.config();
        self.actual_rate = config.sample_rate.0;
        let channels = config.channels;

        let (tx, rx) = crossbeam_channel::unbounded::<Vec<i16>>();
        let on_error = |err: cpal::StreamError| warn!(error = %err, "audio capture error");
        let stream = match format {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = downmix_to_mono(data, channels);
                    let _ = tx.send(mono.into_iter().map(float_sample_to_i16).collect());
                },
                on_error,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let _ = tx.send(downmix_i16_to_mono(data, channels));
                },
                on_error,
                None,
            ),
            other => {
                return Err(unavailable(format!(
                    "unsupported sample format {other:?} (need f32 or i16)"
                )))
            }
        }
        .map_err(|err| unavailable(err.to_string()))?;
        stream.play().map_err(|err| unavailable(err.to_string()))?;
        debug!(rate = self.actual_rate, channels, ?format, "microphone stream started");

        self.pending.clear();
        self.stream = Some(stream);
        self.rx = Some(rx);
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.actual_rate
    }

    fn read_chunk(&mut self, want: usize, timeout: Duration) -> Result<Vec<i16>, RecordError> {
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| RecordError::DeviceUnavailable("stream not started".to_string()))?;
        let deadline = Instant::now() + timeout;
        while self.pending.len() < want {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(samples) => self.pending.extend(samples),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RecordError::DeviceUnavailable("stream closed".to_string()));
                }
            }
        }
        let take = want.min(self.pending.len());
        Ok(self.pending.drain(..take).collect())
    }

    fn stop(&mut self) {
        self.stream = None;
        self.rx = None;
        self.pending.clear();
    }
}
