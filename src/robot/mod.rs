//! Contracts for the robot's sensing and actuation primitives.
//!
//! The engine depends only on these traits. Hardware adapters live outside
//! this crate; [`sim`] provides a file-driven stand-in for bench runs.

pub mod sim;

use std::time::Duration;

pub type ServoId = u8;

pub const HEAD_Y: ServoId = 1;
pub const HEAD_P: ServoId = 2;
pub const HEAD_R: ServoId = 3;
pub const BODY_Y: ServoId = 4;
pub const L_SHOULDER_P: ServoId = 5;
pub const R_SHOULDER_P: ServoId = 6;
pub const L_ELBOW_P: ServoId = 7;
pub const R_ELBOW_P: ServoId = 8;

pub const ALL_SERVOS: [ServoId; 8] = [
    HEAD_Y,
    HEAD_P,
    HEAD_R,
    BODY_Y,
    L_SHOULDER_P,
    R_SHOULDER_P,
    L_ELBOW_P,
    R_ELBOW_P,
];

pub const NEUTRAL_DURATION: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JointTarget {
    pub servo: ServoId,
    pub position: i16,
}

impl JointTarget {
    pub const fn new(servo: ServoId, position: i16) -> Self {
        Self { servo, position }
    }
}

/// Every servo at zero.
pub fn neutral_pose() -> Vec<JointTarget> {
    ALL_SERVOS
        .iter()
        .map(|&servo| JointTarget::new(servo, 0))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);
    pub const ORANGE: Rgb = Rgb::new(255, 165, 0);
    pub const GOLDENROD: Rgb = Rgb::new(218, 165, 32);
    pub const GREEN: Rgb = Rgb::new(0, 255, 0);
    pub const CYAN: Rgb = Rgb::new(0, 255, 255);
    pub const OCEAN: Rgb = Rgb::new(0, 100, 200);
    pub const YELLOW: Rgb = Rgb::new(255, 255, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub known: bool,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Demographics {
    pub age: i32,
    pub gender: String,
}

/// One presence poll.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Detection {
    pub present: bool,
    pub identity: Option<Identity>,
    pub demographics: Option<Demographics>,
}

impl Detection {
    pub fn absent() -> Self {
        Self::default()
    }

    /// Name of a recognized person, if any.
    pub fn known_name(&self) -> Option<&str> {
        self.identity
            .as_ref()
            .filter(|identity| identity.known)
            .map(|identity| identity.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorError(pub String);

impl std::fmt::Display for SensorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "presence sensor error: {}", self.0)
    }
}

impl std::error::Error for SensorError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorError(pub String);

impl std::fmt::Display for ActuatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "actuator error: {}", self.0)
    }
}

impl std::error::Error for ActuatorError {}

/// Face detection and recognition.
pub trait PresenceSensor: Send {
    fn poll_detection(&mut self) -> Result<Detection, SensorError>;

    fn register_identity(&mut self, name: &str) -> Result<(), SensorError>;

    /// Still JPEG of the current face, for sensors that can expose one.
    fn capture_frame(&mut self) -> Option<Vec<u8>> {
        None
    }
}

/// Servo and indicator output. Shared by the two render workers, so `&self`.
pub trait Actuator: Send + Sync {
    fn play_pose(&self, targets: &[JointTarget], duration: Duration) -> Result<(), ActuatorError>;

    fn set_indicator(&self, color: Rgb, brightness: u8) -> Result<(), ActuatorError>;
}

/// Short non-verbal sounds marking state entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cue {
    FaceDetected,
    Listening,
    Thinking,
    Closing,
    Error,
}

impl Cue {
    /// Sound file name a speaker-backed voice would play.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::FaceDetected => "face_ok.wav",
            Self::Listening => "cursor10.wav",
            Self::Thinking => "ok.wav",
            Self::Closing => "end_test.wav",
            Self::Error => "error.wav",
        }
    }
}

pub trait SpeechSynthesizer: Send {
    /// Blocks until playback ends; `false` when nothing was spoken.
    fn speak(&mut self, text: &str) -> bool;

    /// Start a cue without waiting for it. Voices without a speaker ignore it.
    fn play_cue(&mut self, _cue: Cue) {}
}
