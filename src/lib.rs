//! Shared sota-interact library exports so the binary and tests drive one engine.

pub mod audio;
pub mod config;
pub mod engine;
pub mod expression;
mod lock;
pub mod logging;
pub mod process_signal;
pub mod profile;
pub mod robot;
pub mod services;
pub mod telemetry;

pub(crate) use lock::lock_or_recover;
pub use engine::{Collaborators, InteractionEngine};
pub use expression::{ExpressionRenderer, Phase, PhaseCell};
pub use telemetry::{Telemetry, TelemetryServer};
