//! Engine configuration so CLI flags, env vars, and an optional tuning file resolve one way.
//!
//! Precedence, highest first: command line, environment, `--config` TOML file,
//! built-in defaults. The TOML file only covers numeric tuning knobs; service
//! endpoints and experiment metadata stay on the command line.

use crate::logging::LogLevel;
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use serde::Deserialize;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SPEECH_PORT: u16 = 5050;
pub const DEFAULT_CHAT_PORT: u16 = 11434;
pub const DEFAULT_STATUS_PORT: u16 = 5051;
pub const DEFAULT_CHAT_MODEL: &str = "llama3.2:3b";
pub const DEFAULT_NUM_PREDICT: u32 = 80;
pub const PROFILE_FILE_NAME: &str = "user_profiles.json";

#[derive(Debug, Parser, Clone)]
#[command(
    name = "sota-interact",
    about = "Social robot interaction engine",
    author,
    version
)]
pub struct EngineConfig {
    /// Host running the transcription/face service and the chat service
    #[arg(env = "SOTA_SERVICE_HOST")]
    pub host: Option<String>,

    /// Transcription and face-attribute service port
    #[arg(long = "speech-port", default_value_t = DEFAULT_SPEECH_PORT, value_parser = clap::value_parser!(u16).range(1..))]
    pub speech_port: u16,

    /// Chat completion service port
    #[arg(long = "chat-port", default_value_t = DEFAULT_CHAT_PORT, value_parser = clap::value_parser!(u16).range(1..))]
    pub chat_port: u16,

    /// Full base URL for the transcription service (overrides host/port)
    #[arg(long = "speech-url", env = "SOTA_SPEECH_URL")]
    pub speech_url: Option<String>,

    /// Full base URL for the chat service (defaults to http://HOST:PORT/api)
    #[arg(long = "chat-url", env = "SOTA_CHAT_URL")]
    pub chat_url: Option<String>,

    /// Full base URL for the face-attribute service (defaults to the speech URL)
    #[arg(long = "face-url", env = "SOTA_FACE_URL")]
    pub face_url: Option<String>,

    /// Chat model identifier
    #[arg(long = "model", default_value = DEFAULT_CHAT_MODEL)]
    pub model: String,

    /// Token budget per chat reply
    #[arg(long = "num-predict", default_value_t = DEFAULT_NUM_PREDICT)]
    pub num_predict: u32,

    /// Telemetry server port (0 picks an ephemeral port)
    #[arg(long = "status-port", default_value_t = DEFAULT_STATUS_PORT)]
    pub status_port: u16,

    /// Turn cap per encounter (0 disables the cap)
    #[arg(long = "max-turns", default_value_t = 8)]
    pub max_turns: u32,

    /// Silent listens tolerated before the encounter closes
    #[arg(long = "max-silence-retries", default_value_t = 2)]
    pub max_silence_retries: u32,

    /// Absolute recording cap per utterance (ms)
    #[arg(long = "listen-max-ms", default_value_t = 15_000, value_parser = clap::value_parser!(u64).range(500..))]
    pub listen_max_ms: u64,

    /// Delay after closing before presence polling resumes (ms)
    #[arg(long = "cooldown-ms", default_value_t = 3_000)]
    pub cooldown_ms: u64,

    /// Presence poll interval while idle (ms)
    #[arg(long = "face-poll-ms", default_value_t = 300, value_parser = clap::value_parser!(u64).range(10..))]
    pub face_poll_ms: u64,

    /// Consecutive positive detections required to leave idle
    #[arg(long = "detect-threshold", default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    pub detect_threshold: u32,

    /// Conversation history entries kept for the chat prompt
    #[arg(long = "history-limit", default_value_t = 6, value_parser = clap::value_parser!(u64).range(2..))]
    pub history_limit: u64,

    /// Presence queries after each reply before deciding the person left
    #[arg(long = "presence-checks", default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    pub presence_checks: u32,

    /// Pause between presence re-checks (ms)
    #[arg(long = "presence-check-ms", default_value_t = 200)]
    pub presence_check_ms: u64,

    /// Minimum face-attribute confidence (0-100) before an origin guess is used
    #[arg(long = "face-confidence-min", default_value_t = 40, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub face_confidence_min: u8,

    /// Treat every face as a stranger (controlled-experiment mode)
    #[arg(long = "no-memory", default_value_t = false)]
    pub no_memory: bool,

    /// Experiment participant id, copied into telemetry
    #[arg(long = "participant-id", default_value = "")]
    pub participant_id: String,

    /// Experiment group label, copied into telemetry
    #[arg(long = "group", default_value = "")]
    pub group: String,

    /// Experiment session label, copied into telemetry
    #[arg(long = "session", default_value = "")]
    pub session: String,

    /// Directory holding the user profile file
    #[arg(long = "data-dir", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Recorder WAV output path
    #[arg(long = "wav-path")]
    pub wav_path: Option<PathBuf>,

    /// Audio input device name (substring match; system default when omitted)
    #[arg(long = "input-device")]
    pub input_device: Option<String>,

    /// Print available audio input devices and exit
    #[arg(long = "list-input-devices", default_value_t = false)]
    pub list_input_devices: bool,

    /// Presence file watched by the simulated robot adapter
    #[arg(long = "presence-file")]
    pub presence_file: Option<PathBuf>,

    /// TOML tuning file
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Maximum log level
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Write JSON log lines to the trace file instead of stderr
    #[arg(long = "log-json", default_value_t = false)]
    pub log_json: bool,
}

/// Numeric knobs accepted from a `--config` TOML file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TuningFile {
    pub max_turns: Option<u32>,
    pub max_silence_retries: Option<u32>,
    pub listen_max_ms: Option<u64>,
    pub cooldown_ms: Option<u64>,
    pub face_poll_ms: Option<u64>,
    pub detect_threshold: Option<u32>,
    pub history_limit: Option<u64>,
    pub presence_checks: Option<u32>,
    pub presence_check_ms: Option<u64>,
    pub face_confidence_min: Option<u8>,
    pub num_predict: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "config IO error: {msg}"),
            Self::Parse(msg) => write!(f, "config parse error: {msg}"),
            Self::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl TuningFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))
    }
}

/// Timing and policy values consumed by the interaction engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub max_turns: Option<u32>,
    pub max_silence_retries: u32,
    pub listen_max: Duration,
    pub cooldown: Duration,
    pub face_poll: Duration,
    pub detect_threshold: u32,
    pub history_limit: usize,
    pub presence_checks: u32,
    pub presence_check_interval: Duration,
    pub face_confidence_min: u8,
    pub no_memory: bool,
    pub loop_pause: Duration,
    pub after_speech_pause: Duration,
    pub closing_pause: Duration,
    pub registration_retry_pause: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_turns: Some(8),
            max_silence_retries: 2,
            listen_max: Duration::from_millis(15_000),
            cooldown: Duration::from_millis(3_000),
            face_poll: Duration::from_millis(300),
            detect_threshold: 3,
            history_limit: 6,
            presence_checks: 3,
            presence_check_interval: Duration::from_millis(200),
            face_confidence_min: 40,
            no_memory: false,
            loop_pause: Duration::from_millis(50),
            after_speech_pause: Duration::from_millis(300),
            closing_pause: Duration::from_millis(1_000),
            registration_retry_pause: Duration::from_millis(500),
        }
    }
}

fn set_on_command_line(matches: &ArgMatches, id: &str) -> bool {
    matches!(
        matches.value_source(id),
        Some(ValueSource::CommandLine | ValueSource::EnvVariable)
    )
}

macro_rules! apply_tuned {
    ($config:ident, $tuning:ident, $matches:ident, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $tuning.$field {
                if !set_on_command_line($matches, stringify!($field)) {
                    $config.$field = value;
                }
            }
        )+
    };
}

impl EngineConfig {
    /// Parse the process arguments, exiting with clap's usage output on bad flags.
    pub fn load() -> Result<Self, ConfigError> {
        let matches = Self::command().get_matches();
        Self::from_matches(&matches)
    }

    /// Parse an explicit argument list without exiting the process.
    pub fn try_load_from<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command()
            .try_get_matches_from(args)
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        Self::from_matches(&matches)
    }

    fn from_matches(matches: &ArgMatches) -> Result<Self, ConfigError> {
        let mut config =
            Self::from_arg_matches(matches).map_err(|err| ConfigError::Parse(err.to_string()))?;
        if let Some(path) = config.config.clone() {
            let tuning = TuningFile::load(&path)?;
            config.apply_tuning(&tuning, matches);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn apply_tuning(&mut self, tuning: &TuningFile, matches: &ArgMatches) {
        apply_tuned!(
            self,
            tuning,
            matches,
            max_turns,
            max_silence_retries,
            listen_max_ms,
            cooldown_ms,
            face_poll_ms,
            detect_threshold,
            history_limit,
            presence_checks,
            presence_check_ms,
            face_confidence_min,
            num_predict,
        );
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.list_input_devices {
            return Ok(());
        }
        if self.host.is_none() && (self.speech_url.is_none() || self.chat_url.is_none()) {
            return Err(ConfigError::Invalid(
                "a service HOST is required unless --speech-url and --chat-url are both given"
                    .to_string(),
            ));
        }
        if self.history_limit < 2 {
            return Err(ConfigError::Invalid("history-limit must be at least 2".to_string()));
        }
        if self.detect_threshold == 0 || self.presence_checks == 0 {
            return Err(ConfigError::Invalid(
                "detect-threshold and presence-checks must be at least 1".to_string(),
            ));
        }
        if self.face_confidence_min > 100 {
            return Err(ConfigError::Invalid(
                "face-confidence-min must be between 0 and 100".to_string(),
            ));
        }
        Ok(())
    }

    fn host_or_loopback(&self) -> &str {
        self.host.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn speech_base_url(&self) -> String {
        match &self.speech_url {
            Some(url) => trim_base(url),
            None => format!("http://{}:{}", self.host_or_loopback(), self.speech_port),
        }
    }

    pub fn chat_base_url(&self) -> String {
        match &self.chat_url {
            Some(url) => trim_base(url),
            None => format!("http://{}:{}/api", self.host_or_loopback(), self.chat_port),
        }
    }

    pub fn face_base_url(&self) -> String {
        match &self.face_url {
            Some(url) => trim_base(url),
            None => self.speech_base_url(),
        }
    }

    pub fn profile_path(&self) -> PathBuf {
        self.data_dir.join(PROFILE_FILE_NAME)
    }

    pub fn wav_path(&self) -> PathBuf {
        self.wav_path
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("sota_input.wav"))
    }

    pub fn presence_file(&self) -> PathBuf {
        self.presence_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("presence"))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_turns: (self.max_turns > 0).then_some(self.max_turns),
            max_silence_retries: self.max_silence_retries,
            listen_max: Duration::from_millis(self.listen_max_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
            face_poll: Duration::from_millis(self.face_poll_ms),
            detect_threshold: self.detect_threshold,
            history_limit: usize::try_from(self.history_limit).unwrap_or(usize::MAX),
            presence_checks: self.presence_checks,
            presence_check_interval: Duration::from_millis(self.presence_check_ms),
            face_confidence_min: self.face_confidence_min,
            no_memory: self.no_memory,
            ..EngineSettings::default()
        }
    }
}

fn trim_base(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_deployment_values() {
        let cfg = EngineConfig::try_load_from(["sota-interact", "10.0.0.5"]).expect("parse");
        assert_eq!(cfg.speech_base_url(), "http://10.0.0.5:5050");
        assert_eq!(cfg.chat_base_url(), "http://10.0.0.5:11434/api");
        assert_eq!(cfg.face_base_url(), cfg.speech_base_url());
        assert_eq!(cfg.model, DEFAULT_CHAT_MODEL);
        assert_eq!(cfg.num_predict, 80);
        assert_eq!(cfg.status_port, 5051);

        let settings = cfg.engine_settings();
        assert_eq!(settings, EngineSettings::default());
    }

    #[test]
    fn url_overrides_drop_trailing_slash() {
        let cfg = EngineConfig::try_load_from([
            "sota-interact",
            "--speech-url",
            "http://stt.local:9000/",
            "--chat-url",
            "http://llm.local/v1/",
            "--face-url",
            "http://face.local",
        ])
        .expect("parse");
        assert_eq!(cfg.speech_base_url(), "http://stt.local:9000");
        assert_eq!(cfg.chat_base_url(), "http://llm.local/v1");
        assert_eq!(cfg.face_base_url(), "http://face.local");
    }

    #[test]
    fn missing_host_is_rejected() {
        let err = EngineConfig::try_load_from(["sota-interact"]).expect_err("host required");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn list_input_devices_does_not_need_host() {
        let cfg = EngineConfig::try_load_from(["sota-interact", "--list-input-devices"])
            .expect("parse");
        assert!(cfg.list_input_devices);
    }

    #[test]
    fn zero_max_turns_disables_cap() {
        let cfg = EngineConfig::try_load_from(["sota-interact", "h", "--max-turns", "0"])
            .expect("parse");
        assert_eq!(cfg.engine_settings().max_turns, None);
    }

    #[test]
    fn out_of_range_values_fail_parse() {
        assert!(EngineConfig::try_load_from(["sota-interact", "h", "--history-limit", "1"]).is_err());
        assert!(
            EngineConfig::try_load_from(["sota-interact", "h", "--face-confidence-min", "101"])
                .is_err()
        );
        assert!(
            EngineConfig::try_load_from(["sota-interact", "h", "--detect-threshold", "0"]).is_err()
        );
    }

    #[test]
    fn tuning_file_rejects_unknown_keys() {
        let err = TuningFile::parse("max_turns = 3\nbogus = 1\n").expect_err("unknown key");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn tuning_file_fills_unset_flags_only() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "max_turns = 3\ncooldown_ms = 100\nhistory_limit = 10").expect("write");
        let path = file.path().to_string_lossy().to_string();

        let cfg = EngineConfig::try_load_from([
            "sota-interact",
            "h",
            "--config",
            path.as_str(),
            "--max-turns",
            "5",
        ])
        .expect("parse");
        assert_eq!(cfg.max_turns, 5, "command line wins over the file");
        assert_eq!(cfg.cooldown_ms, 100);
        assert_eq!(cfg.history_limit, 10);
    }

    #[test]
    fn missing_tuning_file_reports_io_error() {
        let err = EngineConfig::try_load_from([
            "sota-interact",
            "h",
            "--config",
            "/nonexistent/sota/tuning.toml",
        ])
        .expect_err("missing file");
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
