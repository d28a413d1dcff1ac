//! Live engine observables shared between the state loop and the status server.
//!
//! The snapshot is a flat key to JSON value map behind one mutex. Each
//! `update` is atomic for its key; readers get no cross-key consistency.

pub mod server;

pub use server::TelemetryServer;

use crate::lock_or_recover;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_TURNS: u64 = 8;

/// Keys rewritten whenever an encounter ends.
const SESSION_RESET: [(&str, SessionDefault); 10] = [
    ("turn", SessionDefault::Zero),
    ("silenceRetries", SessionDefault::Zero),
    ("lastUserText", SessionDefault::Empty),
    ("lastUserTextEn", SessionDefault::Empty),
    ("lastDetectedLang", SessionDefault::English),
    ("userName", SessionDefault::Empty),
    ("userOrigin", SessionDefault::Empty),
    ("userInteractions", SessionDefault::Zero),
    ("userSocialLevel", SessionDefault::Empty),
    ("detectedLanguage", SessionDefault::Empty),
];

#[derive(Clone, Copy)]
enum SessionDefault {
    Zero,
    Empty,
    English,
}

impl SessionDefault {
    fn value(self) -> Value {
        match self {
            Self::Zero => Value::from(0),
            Self::Empty => Value::from(""),
            Self::English => Value::from("en"),
        }
    }
}

/// Cloneable handle to the shared snapshot.
#[derive(Clone)]
pub struct Telemetry {
    entries: Arc<Mutex<BTreeMap<String, Value>>>,
    started: Instant,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        let defaults: [(&str, Value); 14] = [
            ("state", "init".into()),
            ("turn", 0.into()),
            ("maxTurns", DEFAULT_MAX_TURNS.into()),
            ("silenceRetries", 0.into()),
            ("lastDetectedLang", "en".into()),
            ("vadWorking", false.into()),
            ("vadLevel", (-1).into()),
            ("isRecording", false.into()),
            ("recordingDurationMs", 0.into()),
            ("lastUserText", "".into()),
            ("lastUserTextEn", "".into()),
            ("lastRobotText", "".into()),
            ("speechAlive", false.into()),
            ("chatAlive", false.into()),
        ];
        let entries = defaults
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        Self {
            entries: Arc::new(Mutex::new(entries)),
            started: Instant::now(),
        }
    }

    pub fn update(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        lock_or_recover(&self.entries, "telemetry").insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        lock_or_recover(&self.entries, "telemetry").get(key).cloned()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn reset_session(&self) {
        let mut entries = lock_or_recover(&self.entries, "telemetry");
        for (key, default) in SESSION_RESET {
            entries.insert(key.to_string(), default.value());
        }
    }

    /// Snapshot plus `uptime` in milliseconds, as one JSON object.
    pub fn status_json(&self) -> String {
        let mut body = Map::new();
        body.insert(
            "uptime".to_string(),
            Value::from(self.uptime().as_millis() as u64),
        );
        {
            let entries = lock_or_recover(&self.entries, "telemetry");
            for (key, value) in entries.iter() {
                if key != "uptime" {
                    body.insert(key.clone(), value.clone());
                }
            }
        }
        Value::Object(body).to_string()
    }
}
