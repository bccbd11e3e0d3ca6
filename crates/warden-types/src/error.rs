//! Error types shared across the warden runtime.

/// Errors surfaced across crate boundaries.
///
/// One variant per failure domain; `exit_code` gives the process exit
/// status the CLI reports for fatal cases.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Task text could not be turned into a plan.
    #[error("task parse failed: {0}")]
    Parse(String),

    /// A guardrail policy rejected an action, task, or evidence path.
    #[error("guardrail blocked: {0}")]
    Guardrail(String),

    /// Browser or session failed to start or attach.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// A selector/text target could not be found.
    #[error("target not found: {0}")]
    Target(String),

    /// A step or run deadline elapsed.
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// Focus could not be returned to the main frame.
    #[error("iframe focus stuck: {0}")]
    IframeFocus(String),

    /// Required evidence missing or could not be written.
    #[error("evidence error: {0}")]
    Evidence(String),

    /// Session registry or control agent failure.
    #[error("session error: {0}")]
    Session(String),

    /// Executor output could not be normalised into a report.
    #[error("report error: {0}")]
    Report(String),

    /// CLI arguments inconsistent with the requested mode.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WardenError {
    /// Process exit code for a run that dies with this error.
    /// 0 ok, 2 guardrail, 3 timeout, 4 bootstrap, 5 invalid-args; everything
    /// else is a generic failure (1).
    pub fn exit_code(&self) -> i32 {
        match self {
            WardenError::Guardrail(_) => 2,
            WardenError::Timeout(_) => 3,
            WardenError::Bootstrap(_) | WardenError::Session(_) => 4,
            WardenError::InvalidArgs(_) | WardenError::Parse(_) => 5,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(WardenError::Guardrail("x".into()).exit_code(), 2);
        assert_eq!(WardenError::Timeout("x".into()).exit_code(), 3);
        assert_eq!(WardenError::Bootstrap("x".into()).exit_code(), 4);
        assert_eq!(WardenError::Session("x".into()).exit_code(), 4);
        assert_eq!(WardenError::InvalidArgs("x".into()).exit_code(), 5);
        assert_eq!(WardenError::Parse("x".into()).exit_code(), 5);
        assert_eq!(WardenError::Evidence("x".into()).exit_code(), 1);
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            WardenError::Guardrail("rm -rf".into()).to_string(),
            "guardrail blocked: rm -rf"
        );
        assert_eq!(
            WardenError::Timeout("step 2".into()).to_string(),
            "deadline exceeded: step 2"
        );
    }
}
