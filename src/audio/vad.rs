//! Energy-gated capture policy that decides when an utterance is over.
//!
//! Each poll chunk is classified by RMS loudness against a fixed threshold.
//! Capture ends early only after enough speech has been heard and the trailing
//! silence has lasted the hold window; the absolute cap always wins.

use super::level::rms_i16;

/// Thresholds and timing for one recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VadPolicy {
    pub sample_rate: u32,
    /// RMS level (raw i16 scale) at or above which a chunk counts as speech.
    pub threshold: u32,
    pub silence_hold_ms: u64,
    pub min_speech_ms: u64,
    pub max_duration_ms: u64,
    pub poll_ms: u64,
}

impl Default for VadPolicy {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            threshold: 150,
            silence_hold_ms: 2_500,
            min_speech_ms: 500,
            max_duration_ms: 15_000,
            poll_ms: 100,
        }
    }
}

impl VadPolicy {
    pub fn with_max_duration_ms(mut self, max_duration_ms: u64) -> Self {
        self.max_duration_ms = max_duration_ms;
        self
    }

    pub fn chunk_samples(&self) -> usize {
        ((u64::from(self.sample_rate) * self.poll_ms) / 1000).max(1) as usize
    }
}

/// Why a recording ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Sustained silence after speech; carries the silence tail length.
    VadSilence { tail_ms: u64 },
    MaxDuration,
}

impl StopReason {
    pub fn label(&self) -> &'static str {
        match self {
            StopReason::VadSilence { .. } => "vad_silence",
            StopReason::MaxDuration => "max_duration",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            StopReason::VadSilence { .. } => "VAD early-stop",
            StopReason::MaxDuration => "Full duration",
        }
    }
}

/// Per-chunk classification, forwarded to live listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkVerdict {
    pub level: u32,
    pub is_speech: bool,
}

/// Counters collected over one recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureMetrics {
    pub total_ms: u64,
    pub speech_ms: u64,
    pub silence_tail_ms: u64,
    pub peak_level: u32,
    pub speech_chunks: u32,
    pub chunks: u32,
}

/// Hysteresis state machine driven one chunk at a time.
pub(crate) struct CaptureState<'a> {
    policy: &'a VadPolicy,
    metrics: CaptureMetrics,
}

impl<'a> CaptureState<'a> {
    pub(crate) fn new(policy: &'a VadPolicy) -> Self {
        Self {
            policy,
            metrics: CaptureMetrics::default(),
        }
    }

    pub(crate) fn reached_cap(&self) -> bool {
        self.metrics.total_ms >= self.policy.max_duration_ms
    }

    /// Classify one chunk lasting `chunk_ms` and report whether capture should stop.
    pub(crate) fn on_chunk(
        &mut self,
        samples: &[i16],
        chunk_ms: u64,
    ) -> (ChunkVerdict, Option<StopReason>) {
        let level = rms_i16(samples);
        let is_speech = !samples.is_empty() && level >= self.policy.threshold;
        let m = &mut self.metrics;
        m.chunks = m.chunks.saturating_add(1);
        m.peak_level = m.peak_level.max(level);
        if is_speech {
            m.speech_chunks = m.speech_chunks.saturating_add(1);
            m.speech_ms = m.speech_ms.saturating_add(chunk_ms);
            m.silence_tail_ms = 0;
        } else {
            m.silence_tail_ms = m.silence_tail_ms.saturating_add(chunk_ms);
        }
        m.total_ms = m.total_ms.saturating_add(chunk_ms);

        let verdict = ChunkVerdict { level, is_speech };
        if m.total_ms >= self.policy.max_duration_ms {
            return (verdict, Some(StopReason::MaxDuration));
        }
        // Silence only ends a take once the speaker has actually started.
        if m.speech_ms >= self.policy.min_speech_ms
            && m.silence_tail_ms >= self.policy.silence_hold_ms
        {
            return (
                verdict,
                Some(StopReason::VadSilence {
                    tail_ms: m.silence_tail_ms,
                }),
            );
        }
        (verdict, None)
    }

    pub(crate) fn metrics(&self) -> CaptureMetrics {
        self.metrics
    }
}
