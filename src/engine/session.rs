//! Per-encounter state, discarded when the engine returns to idle.

use crate::profile::UserProfile;
use crate::services::ChatMessage;
use std::collections::VecDeque;

pub const DEFAULT_LANGUAGE: &str = "en";

/// Last accepted transcription, kept until Thinking consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Utterance {
    pub text: String,
    pub text_en: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSession {
    pub profile: Option<UserProfile>,
    pub is_new_user: bool,
    pub turn: u32,
    pub silence_retries: u32,
    pub last_language: String,
    pub last_heard: Option<Utterance>,
    pub pending_reply: Option<String>,
    transcript: VecDeque<ChatMessage>,
    history_limit: usize,
}

impl EngineSession {
    pub fn new(history_limit: usize) -> Self {
        Self {
            profile: None,
            is_new_user: false,
            turn: 0,
            silence_retries: 0,
            last_language: DEFAULT_LANGUAGE.to_string(),
            last_heard: None,
            pending_reply: None,
            transcript: VecDeque::new(),
            history_limit: history_limit.max(1),
        }
    }

    /// Append and drop the oldest entries beyond the limit.
    pub fn push_message(&mut self, message: ChatMessage) {
        self.transcript.push_back(message);
        while self.transcript.len() > self.history_limit {
            self.transcript.pop_front();
        }
    }

    pub fn transcript(&self) -> Vec<ChatMessage> {
        self.transcript.iter().cloned().collect()
    }

    pub fn transcript_len(&self) -> usize {
        self.transcript.len()
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Start a fresh conversation within the same encounter.
    pub fn begin_conversation(&mut self) {
        self.turn = 0;
        self.silence_retries = 0;
        self.transcript.clear();
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.history_limit);
    }
}
