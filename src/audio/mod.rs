//! Audio capture: loudness metering, the VAD stop policy, and the WAV recorder.

pub mod level;
pub mod recorder;
pub mod vad;

pub use recorder::{
    list_input_devices, AudioSource, CpalSource, RecordError, Recording, VadListener,
    VadRecorder, VadUpdate,
};
pub use vad::{CaptureMetrics, StopReason, VadPolicy};

#[cfg(test)]
pub(crate) fn test_env_lock() -> &'static std::sync::Mutex<()> {
    static LOCK: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
    LOCK.get_or_init(|| std::sync::Mutex::new(()))
}
