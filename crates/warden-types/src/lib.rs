//! Core types shared across all warden crates.
//!
//! Defines the canonical run report schema, typed web steps and their
//! outcomes, control-state derivation, environment-driven configuration,
//! and error types used by the guardrail layer, session registry, web
//! execution engine, and CLI.

pub mod config;
pub mod control;
pub mod error;
pub mod outcome;
pub mod report;
pub mod step;

pub use config::{BridgeConfig, NoiseMode};
pub use control::{derive_control_color, ControlColor, ControlFlags};
pub use error::WardenError;
pub use outcome::{StepOutcome, StepStatus};
pub use report::{RunReport, RunResult, REPORT_KEYS};
pub use step::{StepKind, WebStep};
