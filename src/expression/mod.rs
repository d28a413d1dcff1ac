//! Background gesture and indicator rendering driven by the engine's phase.
//!
//! Two workers share one [`PhaseCell`]: the motion loop plays a randomized
//! pattern for the current phase, the indicator loop updates the lights. Both
//! swallow actuator errors and run until [`ExpressionRenderer::stop`].

pub mod patterns;

use crate::robot::{neutral_pose, Actuator, NEUTRAL_DURATION};
use anyhow::{Context, Result};
use patterns::{motion_for, IndicatorPattern, MotionStep};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Span};

const STOP_JOIN_BUDGET: Duration = Duration::from_secs(2);
const SLEEP_SLICE: Duration = Duration::from_millis(50);
const MOTION_ERROR_PAUSE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Recognizing,
    Greeting,
    Registering,
    Listening,
    Thinking,
    Responding,
    Closing,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Idle,
        Phase::Recognizing,
        Phase::Greeting,
        Phase::Registering,
        Phase::Listening,
        Phase::Thinking,
        Phase::Responding,
        Phase::Closing,
    ];

    /// Telemetry `state` value.
    pub fn label(self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::Recognizing => "Recognizing",
            Phase::Greeting => "Greeting",
            Phase::Registering => "Registering",
            Phase::Listening => "Listening",
            Phase::Thinking => "Thinking",
            Phase::Responding => "Responding",
            Phase::Closing => "Closing",
        }
    }

    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(raw: u8) -> Self {
        Phase::ALL
            .get(usize::from(raw))
            .copied()
            .unwrap_or(Phase::Idle)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Single shared "current phase" value; written by the engine, read by workers.
#[derive(Debug, Clone)]
pub struct PhaseCell(Arc<AtomicU8>);

impl Default for PhaseCell {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(Phase::Idle.to_u8())))
    }
}

impl PhaseCell {
    pub fn get(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, phase: Phase) {
        self.0.store(phase.to_u8(), Ordering::Release);
    }
}

/// Indicator failure streak: log sparsely, back off harder when it persists.
#[derive(Debug, Default)]
pub(crate) struct ErrorBackoff {
    streak: u32,
}

impl ErrorBackoff {
    /// Returns whether to log this error and how long to pause.
    pub(crate) fn on_error(&mut self) -> (bool, Duration) {
        self.streak = self.streak.saturating_add(1);
        let log = self.streak == 1 || self.streak % 100 == 0;
        let pause = if self.streak > 20 {
            Duration::from_millis(1500)
        } else {
            Duration::from_millis(400)
        };
        (log, pause)
    }

    pub(crate) fn on_success(&mut self) {
        self.streak = 0;
    }

    pub(crate) fn streak(&self) -> u32 {
        self.streak
    }
}

/// Sleep in short slices so a cleared flag ends the wait early.
fn pause_while(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

pub struct ExpressionRenderer {
    actuator: Arc<dyn Actuator>,
    phase: PhaseCell,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    span: Span,
}

impl ExpressionRenderer {
    pub fn new(actuator: Arc<dyn Actuator>) -> Self {
        Self {
            actuator,
            phase: PhaseCell::default(),
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            span: info_span!("expression"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Handle the engine writes its phase through.
    pub fn phase_cell(&self) -> PhaseCell {
        self.phase.clone()
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.set(phase);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let motion = {
            let actuator = Arc::clone(&self.actuator);
            let phase = self.phase.clone();
            let running = Arc::clone(&self.running);
            let span = self.span.clone();
            thread::Builder::new()
                .name("expression-motion".into())
                .spawn(move || {
                    let _entered = span.enter();
                    motion_loop(actuator.as_ref(), &phase, &running);
                })
                .context("failed to spawn motion worker")?
        };
        self.workers.push(motion);

        let indicator = {
            let actuator = Arc::clone(&self.actuator);
            let phase = self.phase.clone();
            let running = Arc::clone(&self.running);
            let span = self.span.clone();
            thread::Builder::new()
                .name("expression-indicator".into())
                .spawn(move || {
                    let _entered = span.enter();
                    indicator_loop(actuator.as_ref(), &phase, &running);
                })
                .context("failed to spawn indicator worker")?
        };
        self.workers.push(indicator);

        let _entered = self.span.enter();
        info!("motion and indicator workers started");
        Ok(())
    }

    /// Stop both workers (2 s budget each), then return to the neutral pose.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _entered = self.span.enter();
        for handle in self.workers.drain(..) {
            let deadline = Instant::now() + STOP_JOIN_BUDGET;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if !handle.is_finished() {
                warn!("expression worker did not stop in time");
                continue;
            }
            if handle.join().is_err() {
                warn!("expression worker panicked");
            }
        }
        if let Err(err) = self.actuator.play_pose(&neutral_pose(), NEUTRAL_DURATION) {
            warn!(error = %err, "neutral pose failed");
        }
        info!("expression stopped");
    }
}

impl Drop for ExpressionRenderer {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop();
        }
    }
}

fn motion_loop(actuator: &dyn Actuator, phase: &PhaseCell, running: &AtomicBool) {
    let mut rng = rand::thread_rng();
    while running.load(Ordering::SeqCst) {
        let current = phase.get();
        for step in motion_for(current, &mut rng) {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            if let MotionStep::Pose { targets, duration } = &step {
                if let Err(err) = actuator.play_pose(targets, *duration) {
                    debug!(error = %err, phase = %current, "pose failed");
                    pause_while(running, MOTION_ERROR_PAUSE);
                    break;
                }
            }
            pause_while(running, step.occupancy());
        }
    }
}

fn indicator_loop(actuator: &dyn Actuator, phase: &PhaseCell, running: &AtomicBool) {
    let mut pattern = IndicatorPattern::default();
    let mut backoff = ErrorBackoff::default();
    while running.load(Ordering::SeqCst) {
        let step = pattern.next(phase.get());
        match actuator.set_indicator(step.color, step.brightness) {
            Ok(()) => {
                backoff.on_success();
                pause_while(running, step.hold);
            }
            Err(err) => {
                let (log, pause) = backoff.on_error();
                if log {
                    warn!(error = %err, streak = backoff.streak(), "indicator update failed");
                }
                pause_while(running, pause);
            }
        }
    }
}
