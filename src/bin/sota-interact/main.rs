//! Robot entrypoint so telemetry, expression, and the engine loop start and stop as one unit.
//!
//! # Startup order
//!
//! 1. Logging and signal handlers
//! 2. Telemetry server (so failures are observable)
//! 3. Robot collaborators; the process exits if they are unavailable
//! 4. User store and service probes
//! 5. Expression workers, then the engine loop on this thread

use anyhow::{anyhow, Context, Result};
use sota_interact::audio::{list_input_devices, CpalSource, VadPolicy, VadRecorder};
use sota_interact::config::EngineConfig;
use sota_interact::engine::listener::{telemetry_vad_listener, SpeechListener};
use sota_interact::engine::{Collaborators, InteractionEngine};
use sota_interact::expression::ExpressionRenderer;
use sota_interact::logging::{init_tracing, LoggingOptions};
use sota_interact::process_signal::{install_shutdown_handlers, running_flag};
use sota_interact::profile::UserStore;
use sota_interact::robot::sim;
use sota_interact::services::{ChatClient, ChatService, FaceClient, SpeechClient, Transcriber};
use sota_interact::telemetry::{Telemetry, TelemetryServer};
use std::sync::Arc;
use tracing::{error, info, warn};

const CAPTURE_SAMPLE_RATE: u32 = 16_000;

fn main() -> Result<()> {
    let config = EngineConfig::load()?;
    if config.list_input_devices {
        print_input_devices();
        return Ok(());
    }

    init_tracing(&LoggingOptions {
        level: config.log_level,
        json: config.log_json,
    });
    if let Err(err) = install_shutdown_handlers() {
        warn!(error = %err, "signal handlers unavailable; stop with SIGKILL");
    }
    info!(version = env!("CARGO_PKG_VERSION"), "sota-interact starting");

    let telemetry = Telemetry::new();
    let mut status_server = TelemetryServer::start(telemetry.clone(), config.status_port)
        .context("telemetry server failed to start")?;

    let presence_file = config.presence_file();
    let (presence, actuator, voice) = match sim::connect(&presence_file) {
        Ok(parts) => parts,
        Err(err) => {
            error!(error = %err, "robot collaborators unavailable");
            telemetry.update("state", "error");
            status_server.stop();
            return Err(anyhow!(err).context("robot collaborators unavailable"));
        }
    };
    info!(presence = %presence_file.display(), "robot connected");

    let store = UserStore::open(config.profile_path());
    info!(profiles = store.len(), "user store ready");

    let speech = SpeechClient::new(config.speech_base_url());
    let chat = ChatClient::new(config.chat_base_url(), config.model.clone(), config.num_predict);
    let face = FaceClient::new(config.face_base_url());
    let speech_alive = speech.is_alive();
    let chat_alive = chat.is_alive();
    if !speech_alive {
        warn!(url = %config.speech_base_url(), "transcription service not responding");
    }
    if !chat_alive {
        warn!(url = %config.chat_base_url(), "chat service not responding");
    }
    telemetry.update("speechAlive", speech_alive);
    telemetry.update("chatAlive", chat_alive);
    telemetry.update("maxTurns", config.max_turns);
    telemetry.update("noMemory", config.no_memory);
    telemetry.update("participantId", config.participant_id.as_str());
    telemetry.update("group", config.group.as_str());
    telemetry.update("session", config.session.as_str());

    let mut renderer = ExpressionRenderer::new(Arc::new(actuator));
    if let Err(err) = renderer.start() {
        telemetry.update("state", "error");
        status_server.stop();
        return Err(err);
    }

    let recorder = VadRecorder::new(
        CpalSource::new(config.input_device.clone(), CAPTURE_SAMPLE_RATE),
        VadPolicy::default(),
        config.wav_path(),
    );
    let mut listener = SpeechListener::new(recorder, speech);
    listener.set_vad_listener(telemetry_vad_listener(telemetry.clone()));

    let parts = Collaborators {
        sensor: Box::new(presence),
        voice: Box::new(voice),
        listener: Box::new(listener),
        chat: Box::new(chat),
        face: Some(Box::new(face)),
    };
    let mut engine = InteractionEngine::new(
        config.engine_settings(),
        parts,
        store,
        telemetry.clone(),
        renderer.phase_cell(),
    );
    engine.run(running_flag());

    info!("shutting down");
    telemetry.update("state", "shutdown");
    renderer.stop();
    status_server.stop();
    info!("shutdown complete");
    Ok(())
}

fn print_input_devices() {
    let devices = list_input_devices();
    if devices.is_empty() {
        println!("No audio input devices detected.");
        return;
    }
    println!("Available audio input devices:");
    for name in devices {
        println!("  - {name}");
    }
}
