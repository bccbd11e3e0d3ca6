//! Persistent browser sessions and their control agents.
//!
//! A session outlives individual runs: it owns a browser process with a
//! remote-debugging endpoint and a loopback HTTP control agent that mediates
//! overlay state and external actions. The registry on disk is the single
//! source of truth; every update is a whole-file atomic rewrite under an
//! advisory lock per session id.

pub mod agent;
pub mod record;
pub mod registry;

pub use agent::{run_control_agent, AgentRuntime, ObservedEvent};
pub use record::{SessionRecord, SessionState};
pub use registry::SessionRegistry;
