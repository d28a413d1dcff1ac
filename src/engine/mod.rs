//! Encounter state machine: notice a face, greet, converse, remember, say goodbye.
//!
//! The engine runs on one foreground thread and performs every blocking call
//! (capture, HTTP, speech) in sequence. It publishes its phase to the
//! expression workers through a [`PhaseCell`] and its observables through
//! [`Telemetry`]. A failing or panicking handler never escapes [`step`]: the
//! engine logs it, resets the session and goes back to idle.
//!
//! [`step`]: InteractionEngine::step

pub mod listener;
pub mod phrases;
pub mod session;

use crate::config::EngineSettings;
use crate::expression::{Phase, PhaseCell};
use crate::profile::{relationship_description, OriginSource, UserProfile, UserStore};
use crate::robot::{Cue, PresenceSensor, SpeechSynthesizer};
use crate::services::{ChatMessage, ChatReply, ChatService, FaceAnalyzer};
use crate::telemetry::Telemetry;
use anyhow::{anyhow, Context, Result};
use listener::{Heard, Listen};
use phrases::PromptContext;
use session::{EngineSession, Utterance};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Span};

const REPROMPT_PAUSE: Duration = Duration::from_millis(200);

/// Everything the engine talks to besides storage and telemetry.
pub struct Collaborators {
    pub sensor: Box<dyn PresenceSensor>,
    pub voice: Box<dyn SpeechSynthesizer>,
    pub listener: Box<dyn Listen>,
    pub chat: Box<dyn ChatService>,
    /// Optional face-attribute inference used to seed an origin guess.
    pub face: Option<Box<dyn FaceAnalyzer>>,
}

pub struct InteractionEngine {
    settings: EngineSettings,
    parts: Collaborators,
    store: UserStore,
    telemetry: Telemetry,
    phase: PhaseCell,
    state: Phase,
    session: EngineSession,
    consecutive_detections: u32,
    span: Span,
}

impl InteractionEngine {
    pub fn new(
        settings: EngineSettings,
        parts: Collaborators,
        store: UserStore,
        telemetry: Telemetry,
        phase: PhaseCell,
    ) -> Self {
        let session = EngineSession::new(settings.history_limit);
        Self {
            settings,
            parts,
            store,
            telemetry,
            phase,
            state: Phase::Idle,
            session,
            consecutive_detections: 0,
            span: info_span!("engine"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn state(&self) -> Phase {
        self.state
    }

    pub fn session(&self) -> &EngineSession {
        &self.session
    }

    pub fn store(&self) -> &UserStore {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Step until `running` clears.
    pub fn run(&mut self, running: &AtomicBool) {
        self.enter(Phase::Idle);
        {
            let _entered = self.span.enter();
            info!("waiting for a face");
        }
        while running.load(Ordering::SeqCst) {
            self.step();
            pause(self.settings.loop_pause);
        }
        let _entered = self.span.enter();
        info!("engine loop stopped");
    }

    /// Run exactly one state handler and move to the state it picks.
    pub fn step(&mut self) -> Phase {
        let span = self.span.clone();
        let _entered = span.enter();
        let current = self.state;
        self.phase.set(current);

        let outcome = catch_unwind(AssertUnwindSafe(|| self.dispatch(current)));
        let next = match outcome {
            Ok(Ok(next)) => next,
            Ok(Err(err)) => {
                error!(state = %current, error = %format!("{err:#}"), "state handler failed");
                self.fail_cue();
                self.reset_session();
                Phase::Idle
            }
            Err(payload) => {
                error!(
                    state = %current,
                    panic = %panic_payload_to_string(payload.as_ref()),
                    "state handler panicked"
                );
                self.fail_cue();
                self.reset_session();
                Phase::Idle
            }
        };
        self.enter(next);
        next
    }

    /// Forget the current encounter. Calling it twice changes nothing further.
    pub fn reset_session(&mut self) {
        self.session.reset();
        self.consecutive_detections = 0;
        self.telemetry.reset_session();
    }

    fn fail_cue(&mut self) {
        let voice = &mut self.parts.voice;
        if catch_unwind(AssertUnwindSafe(|| voice.play_cue(Cue::Error))).is_err() {
            warn!("error cue panicked");
        }
    }

    fn dispatch(&mut self, state: Phase) -> Result<Phase> {
        match state {
            Phase::Idle => self.handle_idle(),
            Phase::Recognizing => self.handle_recognizing(),
            Phase::Greeting => self.handle_greeting(),
            Phase::Registering => self.handle_registering(),
            Phase::Listening => self.handle_listening(),
            Phase::Thinking => self.handle_thinking(),
            Phase::Responding => self.handle_responding(),
            Phase::Closing => self.handle_closing(),
        }
    }

    fn enter(&mut self, next: Phase) {
        if next != self.state {
            debug!(from = %self.state, to = %next, "transition");
        }
        self.state = next;
        self.phase.set(next);
        self.telemetry.update("state", next.label());
    }

    fn handle_idle(&mut self) -> Result<Phase> {
        let present = match self.parts.sensor.poll_detection() {
            Ok(detection) => detection.present,
            Err(err) => {
                debug!(error = %err, "presence poll failed");
                false
            }
        };
        if present {
            self.consecutive_detections += 1;
        } else {
            self.consecutive_detections = 0;
        }
        if self.consecutive_detections >= self.settings.detect_threshold {
            info!(consecutive = self.consecutive_detections, "face detected");
            self.consecutive_detections = 0;
            return Ok(Phase::Recognizing);
        }
        pause(self.settings.face_poll);
        Ok(Phase::Idle)
    }

    fn handle_recognizing(&mut self) -> Result<Phase> {
        self.parts.voice.play_cue(Cue::FaceDetected);
        let detection = self
            .parts
            .sensor
            .poll_detection()
            .context("identity lookup failed")?;
        let (age, gender) = detection
            .demographics
            .as_ref()
            .map(|demo| (demo.age, demo.gender.clone()))
            .unwrap_or((0, "unknown".to_string()));

        let known = detection.known_name().map(str::to_string);
        match known {
            Some(name) if !self.settings.no_memory => {
                let profile = match self.store.find_by_name(&name) {
                    Some(stored) => {
                        info!(name = %name, relationship = %relationship_description(stored), "recognized");
                        stored.clone()
                    }
                    None => {
                        warn!(name = %name, "known face has no stored profile; creating one");
                        let mut created = UserProfile::new(self.store.generate_id(), name.as_str());
                        created.estimated_age = age;
                        created.gender = gender;
                        if let Err(err) = self.store.add(created.clone()) {
                            warn!(error = %err, "profile not persisted");
                        }
                        created
                    }
                };
                self.session.profile = Some(profile);
                self.session.is_new_user = false;
            }
            known => {
                if let Some(name) = known {
                    info!(name = %name, "memory disabled; treating known face as a stranger");
                } else {
                    info!(age, gender = %gender, "new face");
                }
                let mut profile = UserProfile::new(self.store.generate_id(), "");
                profile.estimated_age = age;
                profile.gender = gender;
                self.seed_origin_from_face(&mut profile);
                self.session.profile = Some(profile);
                self.session.is_new_user = true;
            }
        }
        self.publish_user();
        Ok(Phase::Greeting)
    }

    fn seed_origin_from_face(&mut self, profile: &mut UserProfile) {
        let Some(face) = self.parts.face.as_ref() else {
            return;
        };
        let Some(frame) = self.parts.sensor.capture_frame().filter(|frame| !frame.is_empty()) else {
            debug!("no face frame available");
            return;
        };
        let attributes = face.analyze(&frame);
        if !attributes.accepted(self.settings.face_confidence_min) {
            info!(
                ok = attributes.ok,
                confidence = attributes.confidence,
                "face attributes below confidence gate"
            );
            return;
        }
        match phrases::face_label_to_origin(&attributes.label) {
            Some(origin) => {
                if profile.offer_origin(origin, OriginSource::FaceAttribute) {
                    profile.cultural_context = format!(
                        "Face attributes: {} ({}%)",
                        attributes.label, attributes.confidence
                    );
                    info!(origin, label = %attributes.label, "origin guessed from face");
                }
            }
            None => debug!(label = %attributes.label, "no origin for face label"),
        }
    }

    fn handle_greeting(&mut self) -> Result<Phase> {
        self.session.begin_conversation();
        self.telemetry.update("turn", 0);
        self.telemetry.update("silenceRetries", 0);

        let line = phrases::greeting(self.session.profile.as_ref(), self.session.is_new_user);
        self.say(&line);
        pause(self.settings.after_speech_pause);

        Ok(if self.session.is_new_user {
            Phase::Registering
        } else {
            Phase::Listening
        })
    }

    fn handle_registering(&mut self) -> Result<Phase> {
        let mut profile = self
            .session
            .profile
            .take()
            .ok_or_else(|| anyhow!("registering without a profile"))?;

        self.say(phrases::ASK_NAME);
        let mut name = self.listen_for_name();
        if name.is_none() {
            self.say(phrases::ASK_NAME_AGAIN);
            name = self.listen_for_name();
        }
        let name = name.unwrap_or_else(|| {
            info!("no name heard; using the default");
            phrases::DEFAULT_NAME.to_string()
        });
        info!(name = %name, "registering");
        profile.name = name.clone();
        self.telemetry.update("userName", name.as_str());
        self.register_identity(&name);

        self.say(&phrases::ask_origin(&name));
        let answer = self.parts.listener.listen(self.settings.listen_max);
        if answer.ok() {
            info!(lang = %answer.language, answer = %answer.text_en, "origin answer");
            if !answer.language.is_empty() {
                profile.detected_language = answer.language.clone();
                profile.set_preferred_language(&answer.language);
                self.session.last_language = answer.language.clone();
            }
            let accepted = match phrases::extract_origin(&answer.text_en) {
                Some(origin) => profile.offer_origin(&origin, OriginSource::SpokenAnswer),
                None => phrases::language_to_country(&answer.language).is_some_and(|country| {
                    profile.offer_origin(country, OriginSource::LanguageInference)
                }),
            };
            if accepted {
                let line = phrases::acknowledge_origin(&profile.origin);
                self.say(&line);
            }
        } else if let Some(country) = phrases::language_to_country(&self.session.last_language) {
            if profile.offer_origin(country, OriginSource::LanguageInference) {
                info!(origin = country, "origin inferred from language");
            }
        }

        profile.record_interaction();
        if let Err(err) = self.store.add(profile.clone()) {
            warn!(error = %err, "new profile kept in memory only");
        }
        info!(relationship = %relationship_description(&profile), "profile saved");
        self.session.profile = Some(profile);
        self.publish_user();
        Ok(Phase::Listening)
    }

    fn listen_for_name(&mut self) -> Option<String> {
        let heard = self.parts.listener.listen(self.settings.listen_max);
        if !heard.ok() {
            return None;
        }
        let name = phrases::extract_name(&heard.text_en);
        debug!(answer = %heard.text_en, name = ?name, "name answer");
        name
    }

    fn register_identity(&mut self, name: &str) {
        match self.parts.sensor.register_identity(name) {
            Ok(()) => info!(name, "face registered"),
            Err(err) => {
                warn!(name, error = %err, "face registration failed; retrying");
                pause(self.settings.registration_retry_pause);
                match self.parts.sensor.register_identity(name) {
                    Ok(()) => info!(name, "face registered on retry"),
                    Err(err) => warn!(name, error = %err, "face registration failed on retry"),
                }
            }
        }
    }

    fn handle_listening(&mut self) -> Result<Phase> {
        self.parts.voice.play_cue(Cue::Listening);
        let turn = self.session.turn + 1;
        self.telemetry.update("turn", turn);
        match self.settings.max_turns {
            Some(max) => info!(turn, max, "listening"),
            None => info!(turn, "listening"),
        }

        let heard = self.parts.listener.listen(self.settings.listen_max);
        if !heard.ok() {
            return Ok(self.on_silence(&heard));
        }

        self.session.silence_retries = 0;
        self.telemetry.update("silenceRetries", 0);
        if !heard.language.is_empty() {
            self.session.last_language = heard.language.clone();
            if let Some(profile) = self.session.profile.as_mut() {
                profile.detected_language = heard.language.clone();
                profile.set_preferred_language(&heard.language);
            }
        }
        self.telemetry.update("lastUserText", heard.text.as_str());
        self.telemetry.update("lastUserTextEn", heard.text_en.as_str());
        self.telemetry
            .update("lastDetectedLang", self.session.last_language.as_str());

        self.session
            .push_message(ChatMessage::user(heard.text_en.as_str()));
        self.session.last_heard = Some(Utterance {
            text: heard.text.clone(),
            text_en: heard.text_en.clone(),
            language: heard.language.clone(),
        });

        if phrases::is_goodbye(&heard.text_en, &heard.text) {
            info!("goodbye heard");
            return Ok(Phase::Closing);
        }
        Ok(Phase::Thinking)
    }

    fn on_silence(&mut self, heard: &Heard) -> Phase {
        self.session.silence_retries += 1;
        let retries = self.session.silence_retries;
        self.telemetry.update("silenceRetries", retries);
        info!(
            outcome = ?heard.outcome,
            retries,
            max = self.settings.max_silence_retries,
            "nothing usable heard"
        );
        if retries >= self.settings.max_silence_retries {
            info!("silence limit reached");
            return Phase::Closing;
        }
        self.phase.set(Phase::Responding);
        self.say(phrases::SILENCE_REPROMPT);
        pause(REPROMPT_PAUSE);
        Phase::Listening
    }

    fn handle_thinking(&mut self) -> Result<Phase> {
        let Some(heard) = self.session.last_heard.take() else {
            return Ok(Phase::Listening);
        };
        self.parts.voice.play_cue(Cue::Thinking);
        let system = phrases::system_prompt(PromptContext {
            profile: self.session.profile.as_ref(),
            no_memory: self.settings.no_memory,
            language: &self.session.last_language,
        });
        let reply = if self.session.transcript_len() > 1 {
            let history = self.session.transcript();
            self.parts.chat.chat_with_history(&system, &history)
        } else {
            self.parts.chat.chat_single(&system, &heard.text_en)
        };
        self.publish_chat_timing(&reply);

        let text = if reply.is_error() || reply.text.trim().is_empty() {
            warn!(reply = %reply.text, "chat failed; apologizing");
            phrases::APOLOGY.to_string()
        } else {
            info!(total_ms = reply.total.as_millis() as u64, "reply ready");
            reply.text.trim().to_string()
        };
        self.session
            .push_message(ChatMessage::assistant(text.as_str()));
        self.session.pending_reply = Some(text);
        Ok(Phase::Responding)
    }

    fn publish_chat_timing(&self, reply: &ChatReply) {
        if let Some(ttft) = reply.time_to_first_token {
            self.telemetry
                .update("lastTtftMs", ttft.as_millis() as u64);
        }
        self.telemetry
            .update("lastTokensPerSec", reply.tokens_per_sec);
    }

    fn handle_responding(&mut self) -> Result<Phase> {
        if let Some(reply) = self.session.pending_reply.take() {
            self.say(&reply);
        }
        pause(self.settings.after_speech_pause);

        self.session.turn += 1;
        let turn = self.session.turn;
        self.telemetry.update("turn", turn);

        if self.settings.max_turns.is_some_and(|max| turn >= max) {
            info!(turn, "turn limit reached");
            return Ok(Phase::Closing);
        }
        if !self.still_present() {
            info!("person left");
            return Ok(Phase::Closing);
        }
        Ok(Phase::Listening)
    }

    fn still_present(&mut self) -> bool {
        let checks = self.settings.presence_checks.max(1);
        for attempt in 0..checks {
            match self.parts.sensor.poll_detection() {
                Ok(detection) if detection.present => return true,
                Ok(_) => {}
                Err(err) => debug!(error = %err, "presence re-check failed"),
            }
            if attempt + 1 < checks {
                pause(self.settings.presence_check_interval);
            }
        }
        false
    }

    fn handle_closing(&mut self) -> Result<Phase> {
        self.parts.voice.play_cue(Cue::Closing);
        if self.session.transcript_len() >= 2 {
            if let Some(mut profile) = self.session.profile.take() {
                self.summarize_into(&mut profile);
                profile.record_interaction();
                if let Err(err) = self.store.update(profile.clone()) {
                    warn!(error = %err, "profile update kept in memory only");
                }
                info!(relationship = %relationship_description(&profile), "profile updated");
                self.session.profile = Some(profile);
            }
        }

        let name = self
            .session
            .profile
            .as_ref()
            .map(|profile| profile.name.as_str());
        let line = phrases::closing_line(name, &self.session.last_language);
        self.say(&line);
        pause(self.settings.closing_pause);

        self.phase.set(Phase::Idle);
        self.reset_session();
        info!(cooldown_ms = self.settings.cooldown.as_millis() as u64, "cooldown");
        pause(self.settings.cooldown);
        Ok(Phase::Idle)
    }

    fn summarize_into(&mut self, profile: &mut UserProfile) {
        let prompt = phrases::summary_prompt(&self.session.transcript());
        let reply = self
            .parts
            .chat
            .chat_single(phrases::SUMMARY_SYSTEM_PROMPT, &prompt);
        if reply.is_error() || reply.text.trim().is_empty() {
            warn!(reply = %reply.text, "no memory summary this time");
            return;
        }
        profile.append_summary(&reply.text);
        debug!(summary = %profile.short_memory_summary, "memory summary");
    }

    fn say(&mut self, text: &str) {
        self.telemetry.update("lastRobotText", text);
        if !self.parts.voice.speak(text) {
            warn!(text, "speech synthesis failed");
        }
    }

    fn publish_user(&self) {
        let Some(profile) = self.session.profile.as_ref() else {
            return;
        };
        self.telemetry.update("userName", profile.name.as_str());
        self.telemetry.update("userOrigin", profile.origin.as_str());
        self.telemetry
            .update("userInteractions", profile.interaction_count());
        self.telemetry
            .update("userSocialLevel", profile.closeness().label());
        self.telemetry
            .update("detectedLanguage", profile.detected_language.as_str());
    }
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::listener::Outcome;
    use super::*;
    use crate::robot::{Demographics, Detection, Identity, SensorError};
    use crate::services::{FaceAttributes, ServiceError};
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Script {
        detections: Arc<Mutex<VecDeque<Result<Detection, SensorError>>>>,
        registered: Arc<Mutex<Vec<String>>>,
        spoken: Arc<Mutex<Vec<String>>>,
        heard: Arc<Mutex<VecDeque<Heard>>>,
        replies: Arc<Mutex<VecDeque<ChatReply>>>,
        chats: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
        cues: Arc<Mutex<Vec<Cue>>>,
    }

    impl Script {
        fn detect(&self, detection: Detection) {
            self.detections.lock().expect("detections").push_back(Ok(detection));
        }

        fn hear(&self, text: &str, language: &str) {
            self.heard
                .lock()
                .expect("heard")
                .push_back(Heard::speech(text, text, language));
        }

        fn hear_nothing(&self) {
            self.heard
                .lock()
                .expect("heard")
                .push_back(Heard::nothing(Outcome::Silent));
        }

        fn reply(&self, text: &str) {
            self.replies.lock().expect("replies").push_back(ChatReply {
                text: text.to_string(),
                time_to_first_token: Some(Duration::from_millis(120)),
                total: Duration::from_millis(400),
                eval_count: 4,
                tokens_per_sec: 8.0,
                error: None,
            });
        }

        fn spoken(&self) -> Vec<String> {
            self.spoken.lock().expect("spoken").clone()
        }

        fn cues(&self) -> Vec<Cue> {
            self.cues.lock().expect("cues").clone()
        }
    }

    struct Sensor(Script);

    impl PresenceSensor for Sensor {
        fn poll_detection(&mut self) -> Result<Detection, SensorError> {
            self.0
                .detections
                .lock()
                .expect("detections")
                .pop_front()
                .unwrap_or_else(|| Ok(Detection::absent()))
        }

        fn register_identity(&mut self, name: &str) -> Result<(), SensorError> {
            self.0.registered.lock().expect("registered").push(name.to_string());
            Ok(())
        }

        fn capture_frame(&mut self) -> Option<Vec<u8>> {
            Some(vec![0xFF, 0xD8, 0xFF])
        }
    }

    struct Voice(Script);

    impl SpeechSynthesizer for Voice {
        fn speak(&mut self, text: &str) -> bool {
            self.0.spoken.lock().expect("spoken").push(text.to_string());
            true
        }

        fn play_cue(&mut self, cue: Cue) {
            self.0.cues.lock().expect("cues").push(cue);
        }
    }

    struct Ears(Script);

    impl Listen for Ears {
        fn listen(&mut self, _: Duration) -> Heard {
            self.0
                .heard
                .lock()
                .expect("heard")
                .pop_front()
                .unwrap_or_else(|| Heard::nothing(Outcome::Silent))
        }
    }

    struct Chat(Script);

    impl ChatService for Chat {
        fn chat(&self, messages: &[ChatMessage]) -> ChatReply {
            self.0.chats.lock().expect("chats").push(messages.to_vec());
            self.0
                .replies
                .lock()
                .expect("replies")
                .pop_front()
                .unwrap_or_else(|| ChatReply::failed(ServiceError::Timeout, Duration::ZERO))
        }

        fn is_alive(&self) -> bool {
            true
        }
    }

    struct Face(FaceAttributes);

    impl FaceAnalyzer for Face {
        fn analyze(&self, _: &[u8]) -> FaceAttributes {
            self.0.clone()
        }
    }

    fn fast_settings() -> EngineSettings {
        EngineSettings {
            detect_threshold: 2,
            face_poll: Duration::ZERO,
            cooldown: Duration::ZERO,
            presence_check_interval: Duration::ZERO,
            after_speech_pause: Duration::ZERO,
            closing_pause: Duration::ZERO,
            registration_retry_pause: Duration::ZERO,
            loop_pause: Duration::ZERO,
            ..EngineSettings::default()
        }
    }

    fn engine(
        script: &Script,
        settings: EngineSettings,
        dir: &tempfile::TempDir,
    ) -> (InteractionEngine, Telemetry) {
        let telemetry = Telemetry::new();
        let parts = Collaborators {
            sensor: Box::new(Sensor(script.clone())),
            voice: Box::new(Voice(script.clone())),
            listener: Box::new(Ears(script.clone())),
            chat: Box::new(Chat(script.clone())),
            face: None,
        };
        let store = UserStore::open(dir.path().join("user_profiles.json"));
        let engine = InteractionEngine::new(settings, parts, store, telemetry.clone(), PhaseCell::default());
        (engine, telemetry)
    }

    fn present() -> Detection {
        Detection {
            present: true,
            identity: None,
            demographics: Some(Demographics {
                age: 30,
                gender: "female".to_string(),
            }),
        }
    }

    fn known(name: &str) -> Detection {
        Detection {
            present: true,
            identity: Some(Identity {
                known: true,
                name: name.to_string(),
            }),
            demographics: None,
        }
    }

    #[test]
    fn idle_debounces_detections() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        script.detect(present());
        script.detect(Detection::absent());
        script.detect(present());
        script.detect(present());
        let (mut engine, telemetry) = engine(&script, fast_settings(), &dir);

        assert_eq!(engine.step(), Phase::Idle);
        assert_eq!(engine.step(), Phase::Idle);
        assert_eq!(engine.step(), Phase::Idle);
        assert_eq!(engine.step(), Phase::Recognizing);
        assert_eq!(telemetry.get("state"), Some(Value::from("Recognizing")));
    }

    #[test]
    fn stranger_is_registered_with_spoken_origin() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        script.detect(present());
        script.detect(present());
        script.detect(present());
        script.hear("My name is Alice.", "en");
        script.hear("I'm from Canada.", "en");
        let (mut engine, telemetry) = engine(&script, fast_settings(), &dir);

        engine.step();
        engine.step();
        assert_eq!(engine.step(), Phase::Greeting);
        assert!(engine.session().is_new_user);
        assert_eq!(engine.step(), Phase::Registering);
        assert_eq!(engine.step(), Phase::Listening);

        let profile = engine.store().find_by_name("alice").expect("stored");
        assert_eq!(profile.origin, "Canada");
        assert_eq!(profile.interaction_count(), 1);
        assert_eq!(profile.gender, "female");
        assert_eq!(*script.registered.lock().expect("registered"), ["Alice"]);
        assert_eq!(
            script.spoken(),
            [
                "Hello! I'm Sota, a friendly robot. Nice to meet you!",
                "What's your name?",
                "Nice to meet you, Alice! Where are you from?",
                "Oh, Canada! That's wonderful!",
            ]
        );
        assert_eq!(telemetry.get("userSocialLevel"), Some(Value::from("acquaintance")));
    }

    #[test]
    fn unheard_name_falls_back_after_one_retry() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        script.hear_nothing();
        script.hear_nothing();
        script.hear("私は日本から来ました", "ja");
        let (mut engine, _) = engine(&script, fast_settings(), &dir);
        engine.session.profile = Some(UserProfile::new("user_1_0", ""));
        engine.session.is_new_user = true;
        engine.state = Phase::Registering;

        assert_eq!(engine.step(), Phase::Listening);
        let profile = engine.session().profile.clone().expect("profile");
        assert_eq!(profile.name, "Friend");
        assert_eq!(profile.preferred_language, "ja");
        assert!(!profile.origin.is_empty());
        assert!(script.spoken().contains(&phrases::ASK_NAME_AGAIN.to_string()));
        assert_eq!(engine.session().last_language, "ja");
    }

    #[test]
    fn confident_face_attributes_seed_origin() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        script.detect(present());
        let (mut engine, telemetry) = engine(&script, fast_settings(), &dir);
        engine.parts.face = Some(Box::new(Face(FaceAttributes {
            ok: true,
            label: "asian".to_string(),
            confidence: 87,
            processing_ms: 40,
            error: None,
        })));
        engine.state = Phase::Recognizing;

        assert_eq!(engine.step(), Phase::Greeting);
        let profile = engine.session().profile.clone().expect("profile");
        assert_eq!(profile.origin, "Asia");
        assert_eq!(profile.cultural_context, "Face attributes: asian (87%)");
        assert_eq!(profile.origin_source(), Some(OriginSource::FaceAttribute));
        assert_eq!(telemetry.get("userOrigin"), Some(Value::from("Asia")));

        engine.step();
        assert_eq!(
            script.spoken().last().map(String::as_str),
            Some("Hello! I'm Sota, a friendly robot. Nice to meet you! Are you from Asia?")
        );
    }

    #[test]
    fn weak_face_attributes_are_ignored() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        script.detect(present());
        let (mut engine, _) = engine(&script, fast_settings(), &dir);
        engine.parts.face = Some(Box::new(Face(FaceAttributes {
            ok: true,
            label: "asian".to_string(),
            confidence: 12,
            processing_ms: 40,
            error: None,
        })));
        engine.state = Phase::Recognizing;
        engine.step();
        assert_eq!(engine.session().profile.as_ref().map(|p| p.origin.as_str()), Some(""));
    }

    #[test]
    fn known_face_without_profile_gets_one() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        script.detect(known("Bob"));
        let (mut engine, _) = engine(&script, fast_settings(), &dir);
        engine.state = Phase::Recognizing;

        assert_eq!(engine.step(), Phase::Greeting);
        assert!(!engine.session().is_new_user);
        assert!(engine.store().find_by_name("Bob").is_some());
        assert_eq!(engine.step(), Phase::Listening);
        assert_eq!(
            script.spoken(),
            ["Hello Bob! I remember you! Welcome back! How are you?"]
        );
    }

    #[test]
    fn no_memory_treats_known_faces_as_strangers() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        script.detect(known("Bob"));
        let settings = EngineSettings {
            no_memory: true,
            ..fast_settings()
        };
        let (mut engine, _) = engine(&script, settings, &dir);
        engine.state = Phase::Recognizing;

        assert_eq!(engine.step(), Phase::Greeting);
        assert!(engine.session().is_new_user);
        assert_eq!(engine.step(), Phase::Registering);
    }

    #[test]
    fn silence_reprompts_then_closes_without_thinking() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        let (mut engine, telemetry) = engine(&script, fast_settings(), &dir);
        engine.state = Phase::Listening;

        assert_eq!(engine.step(), Phase::Listening);
        assert_eq!(telemetry.get("silenceRetries"), Some(Value::from(1)));
        assert_eq!(engine.step(), Phase::Closing);
        assert_eq!(script.spoken(), [phrases::SILENCE_REPROMPT]);
        assert!(script.chats.lock().expect("chats").is_empty());
    }

    #[test]
    fn goodbye_goes_straight_to_closing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        script.hear("Okay, bye!", "en");
        let (mut engine, _) = engine(&script, fast_settings(), &dir);
        engine.state = Phase::Listening;

        assert_eq!(engine.step(), Phase::Closing);
        assert_eq!(engine.session().transcript_len(), 1);
    }

    #[test]
    fn chat_failure_substitutes_apology() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        script.hear("Tell me a joke", "en");
        let (mut engine, _) = engine(&script, fast_settings(), &dir);
        engine.state = Phase::Listening;

        assert_eq!(engine.step(), Phase::Thinking);
        assert_eq!(engine.step(), Phase::Responding);
        assert_eq!(engine.session().pending_reply.as_deref(), Some(phrases::APOLOGY));
        let chats = script.chats.lock().expect("chats").clone();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].len(), 2, "single-turn request: system plus user");
    }

    #[test]
    fn responding_closes_when_the_person_left() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        let (mut engine, telemetry) = engine(&script, fast_settings(), &dir);
        engine.state = Phase::Responding;
        engine.session.pending_reply = Some("Nice!".to_string());

        assert_eq!(engine.step(), Phase::Closing);
        assert_eq!(script.spoken(), ["Nice!"]);
        assert_eq!(telemetry.get("turn"), Some(Value::from(1)));
        assert_eq!(telemetry.get("lastRobotText"), Some(Value::from("Nice!")));
    }

    #[test]
    fn responding_continues_while_present_and_under_cap() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        script.detect(Detection::absent());
        script.detect(present());
        let (mut engine, _) = engine(&script, fast_settings(), &dir);
        engine.state = Phase::Responding;
        assert_eq!(engine.step(), Phase::Listening);
    }

    #[test]
    fn turn_cap_forces_closing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        script.detect(present());
        let settings = EngineSettings {
            max_turns: Some(1),
            ..fast_settings()
        };
        let (mut engine, _) = engine(&script, settings, &dir);
        engine.state = Phase::Responding;
        assert_eq!(engine.step(), Phase::Closing);
    }

    #[test]
    fn closing_summarizes_and_counts_the_encounter() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        script.reply("They talked about hockey.");
        let (mut engine, telemetry) = engine(&script, fast_settings(), &dir);
        let mut profile = crate::profile::profile_with_count("Alice", 1);
        profile.user_id = "user_1_0".to_string();
        engine.store.add(profile.clone()).expect("seed store");
        engine.session.profile = Some(profile);
        engine.session.push_message(ChatMessage::user("I like hockey"));
        engine.session.push_message(ChatMessage::assistant("Me too!"));
        engine.state = Phase::Closing;

        assert_eq!(engine.step(), Phase::Idle);
        let stored = UserStore::open(dir.path().join("user_profiles.json"));
        let alice = stored.get("user_1_0").expect("persisted");
        assert_eq!(alice.interaction_count(), 2);
        assert_eq!(alice.short_memory_summary, "They talked about hockey.");
        assert_eq!(
            script.spoken(),
            ["It was great talking to you, Alice! See you next time!"]
        );
        assert_eq!(engine.session(), &EngineSession::new(engine.settings().history_limit));
        assert_eq!(telemetry.get("userName"), Some(Value::from("")));
    }

    #[test]
    fn closing_without_exchange_leaves_count_alone() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        let (mut engine, _) = engine(&script, fast_settings(), &dir);
        let mut profile = crate::profile::profile_with_count("Kenji", 3);
        profile.user_id = "user_2_0".to_string();
        engine.store.add(profile.clone()).expect("seed store");
        engine.session.profile = Some(profile);
        engine.session.last_language = "ja".to_string();
        engine.state = Phase::Closing;

        assert_eq!(engine.step(), Phase::Idle);
        assert_eq!(
            engine.store().get("user_2_0").map(UserProfile::interaction_count),
            Some(3)
        );
        assert_eq!(script.spoken(), ["Kenjiさん、楽しかったよ！またね！"]);
        assert!(script.chats.lock().expect("chats").is_empty());
    }

    #[test]
    fn handler_errors_reset_to_idle() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        script
            .detections
            .lock()
            .expect("detections")
            .push_back(Err(SensorError("camera gone".to_string())));
        let (mut engine, telemetry) = engine(&script, fast_settings(), &dir);
        engine.session.turn = 4;
        engine.state = Phase::Recognizing;

        assert_eq!(engine.step(), Phase::Idle);
        assert_eq!(engine.session().turn, 0);
        assert_eq!(telemetry.get("state"), Some(Value::from("Idle")));
        assert_eq!(script.cues(), [Cue::FaceDetected, Cue::Error]);
    }

    #[test]
    fn handler_panics_reset_to_idle() {
        struct Exploding;

        impl Listen for Exploding {
            fn listen(&mut self, _: Duration) -> Heard {
                panic!("audio driver crashed");
            }
        }

        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        let (mut engine, _) = engine(&script, fast_settings(), &dir);
        engine.parts.listener = Box::new(Exploding);
        engine.session.profile = Some(UserProfile::new("user_3_0", "Mia"));
        engine.state = Phase::Listening;

        assert_eq!(engine.step(), Phase::Idle);
        assert!(engine.session().profile.is_none());
    }

    #[test]
    fn cues_mark_each_stage_of_a_visit() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        script.detect(present());
        script.detect(present());
        script.detect(known("Bob"));
        script.hear("Tell me a joke", "en");
        script.reply("Why did the robot cross the road?");
        let (mut engine, _) = engine(&script, fast_settings(), &dir);

        let mut visited = Vec::new();
        for _ in 0..8 {
            visited.push(engine.step());
        }
        assert_eq!(
            visited,
            [
                Phase::Idle,
                Phase::Recognizing,
                Phase::Greeting,
                Phase::Listening,
                Phase::Thinking,
                Phase::Responding,
                Phase::Closing,
                Phase::Idle,
            ]
        );
        assert_eq!(
            script.cues(),
            [Cue::FaceDetected, Cue::Listening, Cue::Thinking, Cue::Closing]
        );
    }

    #[test]
    fn reset_session_is_idempotent() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        let (mut engine, telemetry) = engine(&script, fast_settings(), &dir);
        engine.session.profile = Some(UserProfile::new("user_4_0", "Ana"));
        engine.session.pending_reply = Some("hi".to_string());
        engine.session.last_heard = Some(Utterance::default());
        telemetry.update("userName", "Ana");

        engine.reset_session();
        let once = engine.session().clone();
        let snapshot = telemetry.status_json();
        engine.reset_session();
        assert_eq!(engine.session(), &once);
        assert!(once.pending_reply.is_none() && once.last_heard.is_none());
        let strip_uptime = |json: &str| {
            let mut value: Value = serde_json::from_str(json).expect("json");
            value.as_object_mut().expect("object").remove("uptime");
            value
        };
        assert_eq!(strip_uptime(&telemetry.status_json()), strip_uptime(&snapshot));
    }

    #[test]
    fn run_returns_once_the_flag_clears() {
        let dir = tempfile::tempdir().expect("temp dir");
        let script = Script::default();
        let (mut engine, _) = engine(&script, fast_settings(), &dir);
        let running = AtomicBool::new(false);
        engine.run(&running);
        assert_eq!(engine.state(), Phase::Idle);
    }
}
