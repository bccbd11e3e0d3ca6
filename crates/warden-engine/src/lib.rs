//! The web execution engine and its supporting pieces.
//!
//! `steps` turns task text into a frozen plan; `executor` drives the
//! browser through it with evidence, retries, a watchdog, and teaching
//! handoff; `operator` wraps the narrative-executor subprocess used by the
//! shell and gui modes.

pub mod deadline;
pub mod executor;
pub mod findings;
pub mod operator;
pub mod steps;
pub mod watchdog;

pub use deadline::Deadline;
pub use executor::{run_web_task, WebRunOptions};
pub use operator::{build_operator_prompt, run_operator_agent, OperatorOutcome};
pub use steps::{extract_task_url, parse_plan, stable_selectors_for_target, ParseError};
pub use watchdog::{StuckReason, WatchdogState};
