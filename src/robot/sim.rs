//! File-driven robot stand-in.
//!
//! Presence is the existence of a file. Its first line, when non-empty, is the
//! name of a recognized person; an optional second line holds `age,gender`.
//! Poses and indicator changes are only logged; speech is logged and paced.

use super::{
    Actuator, ActuatorError, Cue, Demographics, Detection, Identity, JointTarget, PresenceSensor, Rgb,
    SensorError, SpeechSynthesizer,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, info_span, Span};

const DEFAULT_WORD_PAUSE: Duration = Duration::from_millis(200);

pub struct SimPresence {
    path: PathBuf,
    span: Span,
}

pub struct SimActuator {
    poses: AtomicUsize,
    indicators: AtomicUsize,
    span: Span,
}

pub struct SimVoice {
    word_pause: Duration,
    spoken: Vec<String>,
    cues: Vec<Cue>,
    span: Span,
}

/// Acquire all three simulated collaborators; fails when the presence
/// file's directory cannot be created.
pub fn connect(presence_file: &Path) -> Result<(SimPresence, SimActuator, SimVoice), SensorError> {
    if let Some(parent) = presence_file
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
    {
        fs::create_dir_all(parent)
            .map_err(|err| SensorError(format!("{}: {err}", parent.display())))?;
    }
    Ok((
        SimPresence::new(presence_file),
        SimActuator::new(),
        SimVoice::new(),
    ))
}

impl SimPresence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let span = info_span!("sim_presence", path = %path.display());
        Self { path, span }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub(crate) fn parse_presence(contents: &str) -> Detection {
    let mut lines = contents.lines().map(str::trim);
    let name = lines.next().unwrap_or("");
    let identity = Identity {
        known: !name.is_empty(),
        name: name.to_string(),
    };
    let demographics = lines.next().and_then(|line| {
        let (age, gender) = line.split_once(',')?;
        Some(Demographics {
            age: age.trim().parse().ok()?,
            gender: gender.trim().to_lowercase(),
        })
    });
    Detection {
        present: true,
        identity: Some(identity),
        demographics,
    }
}

impl PresenceSensor for SimPresence {
    fn poll_detection(&mut self) -> Result<Detection, SensorError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(parse_presence(&contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Detection::absent()),
            Err(err) => Err(SensorError(format!("{}: {err}", self.path.display()))),
        }
    }

    fn register_identity(&mut self, name: &str) -> Result<(), SensorError> {
        let _entered = self.span.enter();
        let existing = fs::read_to_string(&self.path)
            .map_err(|err| SensorError(format!("nobody to register: {err}")))?;
        let mut contents = name.trim().to_string();
        if let Some(rest) = existing.lines().nth(1) {
            contents.push('\n');
            contents.push_str(rest);
        }
        contents.push('\n');
        fs::write(&self.path, contents)
            .map_err(|err| SensorError(format!("{}: {err}", self.path.display())))?;
        info!(name, "identity registered");
        Ok(())
    }
}

impl Default for SimActuator {
    fn default() -> Self {
        Self::new()
    }
}

impl SimActuator {
    pub fn new() -> Self {
        Self {
            poses: AtomicUsize::new(0),
            indicators: AtomicUsize::new(0),
            span: info_span!("sim_actuator"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn poses_played(&self) -> usize {
        self.poses.load(Ordering::Relaxed)
    }

    pub fn indicator_changes(&self) -> usize {
        self.indicators.load(Ordering::Relaxed)
    }
}

impl Actuator for SimActuator {
    fn play_pose(&self, targets: &[JointTarget], duration: Duration) -> Result<(), ActuatorError> {
        if targets.is_empty() {
            return Err(ActuatorError("empty pose".to_string()));
        }
        self.poses.fetch_add(1, Ordering::Relaxed);
        let _entered = self.span.enter();
        debug!(
            joints = targets.len(),
            duration_ms = duration.as_millis() as u64,
            "pose"
        );
        Ok(())
    }

    fn set_indicator(&self, color: Rgb, brightness: u8) -> Result<(), ActuatorError> {
        self.indicators.fetch_add(1, Ordering::Relaxed);
        let _entered = self.span.enter();
        debug!(r = color.r, g = color.g, b = color.b, brightness, "indicator");
        Ok(())
    }
}

impl Default for SimVoice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimVoice {
    pub fn new() -> Self {
        Self {
            word_pause: DEFAULT_WORD_PAUSE,
            spoken: Vec::new(),
            cues: Vec::new(),
            span: info_span!("sim_voice"),
        }
    }

    /// Playback time per word; zero makes `speak` return immediately.
    pub fn with_word_pause(mut self, word_pause: Duration) -> Self {
        self.word_pause = word_pause;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn spoken(&self) -> &[String] {
        &self.spoken
    }

    pub fn cues(&self) -> &[Cue] {
        &self.cues
    }
}

impl SpeechSynthesizer for SimVoice {
    fn speak(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        let _entered = self.span.enter();
        info!(text, "speaking");
        let words = text.split_whitespace().count().max(1) as u32;
        if !self.word_pause.is_zero() {
            thread::sleep(self.word_pause * words);
        }
        self.spoken.push(text.to_string());
        true
    }

    fn play_cue(&mut self, cue: Cue) {
        let _entered = self.span.enter();
        debug!(?cue, sound = cue.file_name(), "cue");
        self.cues.push(cue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_means_nobody_present() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut sensor = SimPresence::new(dir.path().join("presence"));
        let detection = sensor.poll_detection().expect("poll");
        assert!(!detection.present);
    }

    #[test]
    fn presence_file_lines_map_to_detection() {
        let detection = parse_presence("Alice\n34, Female\n");
        assert!(detection.present);
        assert_eq!(detection.known_name(), Some("Alice"));
        assert_eq!(
            detection.demographics,
            Some(Demographics {
                age: 34,
                gender: "female".to_string()
            })
        );

        let stranger = parse_presence("");
        assert!(stranger.present);
        assert_eq!(stranger.known_name(), None);
        assert!(stranger.demographics.is_none());
        assert!(parse_presence("\nnot-a-pair").demographics.is_none());
    }

    #[test]
    fn register_writes_name_and_keeps_demographics() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("presence");
        fs::write(&path, "\n28,male\n").expect("seed");
        let mut sensor = SimPresence::new(&path);
        sensor.register_identity("Ken").expect("register");
        let detection = sensor.poll_detection().expect("poll");
        assert_eq!(detection.known_name(), Some("Ken"));
        assert_eq!(detection.demographics.map(|d| d.age), Some(28));
    }

    #[test]
    fn register_fails_when_person_left() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut sensor = SimPresence::new(dir.path().join("presence"));
        assert!(sensor.register_identity("Ken").is_err());
    }

    #[test]
    fn connect_creates_presence_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("presence");
        let (sensor, actuator, _voice) = connect(&path).expect("connect");
        assert!(path.parent().is_some_and(Path::is_dir));
        assert_eq!(sensor.path(), path.as_path());
        assert_eq!(actuator.poses_played(), 0);
    }

    #[test]
    fn voice_records_non_empty_lines() {
        let mut voice = SimVoice::new().with_word_pause(Duration::ZERO);
        assert!(voice.speak("Hello there"));
        assert!(!voice.speak("   "));
        assert_eq!(voice.spoken(), ["Hello there".to_string()]);
    }

    #[test]
    fn voice_keeps_cues_apart_from_speech() {
        let mut voice = SimVoice::new().with_word_pause(Duration::ZERO);
        voice.play_cue(Cue::Listening);
        voice.play_cue(Cue::Error);
        assert!(voice.spoken().is_empty());
        assert_eq!(voice.cues(), [Cue::Listening, Cue::Error]);
    }

    #[test]
    fn actuator_counts_commands_and_rejects_empty_pose() {
        let actuator = SimActuator::new();
        actuator
            .play_pose(&super::super::neutral_pose(), Duration::from_millis(500))
            .expect("pose");
        assert!(actuator.play_pose(&[], Duration::ZERO).is_err());
        actuator.set_indicator(Rgb::GREEN, 255).expect("indicator");
        assert_eq!(actuator.poses_played(), 1);
        assert_eq!(actuator.indicator_changes(), 1);
    }
}
