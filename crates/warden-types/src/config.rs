//! Environment-driven bridge configuration.
//!
//! All tunables come from `BRIDGE_*` / `OI_BRIDGE_*` environment variables
//! with documented defaults and clamps. The config is resolved once at run
//! start and threaded through the engine; nothing reads the environment
//! mid-run.

use std::time::Duration;

/// Observer noise filter for control-agent events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseMode {
    /// Drop uncontrolled click/mousemove/scroll events; they do not count as
    /// useful progress while the user holds control.
    #[default]
    Minimal,
    /// Keep everything; scroll and mousemove count as useful progress.
    Debug,
}

impl NoiseMode {
    pub fn from_env_value(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("debug") {
            Self::Debug
        } else {
            Self::Minimal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Debug => "debug",
        }
    }
}

/// Resolved timeouts and toggles for one run.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Operator-agent subprocess budget (`OI_BRIDGE_TIMEOUT_SECONDS`).
    pub operator_timeout: Duration,
    /// Per-primitive interactive budget, clamp 1-60 s
    /// (`BRIDGE_WEB_INTERACTIVE_TIMEOUT_SECONDS`).
    pub interactive_timeout: Duration,
    /// Wait-step budget, clamp 1-60 s (`BRIDGE_WEB_WAIT_TIMEOUT_SECONDS`).
    pub wait_timeout: Duration,
    /// Hard per-step ceiling (`BRIDGE_WEB_STEP_HARD_TIMEOUT_SECONDS`).
    pub step_hard_timeout: Duration,
    /// Hard per-run ceiling (`BRIDGE_WEB_RUN_HARD_TIMEOUT_SECONDS`).
    pub run_hard_timeout: Duration,
    /// Stuck window for interactive steps with no useful observer events.
    pub stuck_interactive: Duration,
    /// Stuck window for an unchanged step signature.
    pub stuck_step: Duration,
    /// Stuck window for iframe-held focus.
    pub stuck_iframe: Duration,
    /// Manual-learning window, clamp 4-180 s
    /// (`BRIDGE_LEARNING_WINDOW_SECONDS`).
    pub learning_window: Duration,
    pub noise_mode: NoiseMode,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            operator_timeout: Duration::from_secs(300),
            interactive_timeout: Duration::from_secs(8),
            wait_timeout: Duration::from_secs(12),
            step_hard_timeout: Duration::from_secs(20),
            run_hard_timeout: Duration::from_secs(120),
            stuck_interactive: Duration::from_secs(12),
            stuck_step: Duration::from_secs(20),
            stuck_iframe: Duration::from_secs(8),
            learning_window: Duration::from_secs(25),
            noise_mode: NoiseMode::Minimal,
        }
    }
}

impl BridgeConfig {
    /// Resolve the configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            operator_timeout: env_secs("OI_BRIDGE_TIMEOUT_SECONDS", defaults.operator_timeout, 1.0, 3600.0),
            interactive_timeout: env_secs(
                "BRIDGE_WEB_INTERACTIVE_TIMEOUT_SECONDS",
                defaults.interactive_timeout,
                1.0,
                60.0,
            ),
            wait_timeout: env_secs("BRIDGE_WEB_WAIT_TIMEOUT_SECONDS", defaults.wait_timeout, 1.0, 60.0),
            step_hard_timeout: env_secs(
                "BRIDGE_WEB_STEP_HARD_TIMEOUT_SECONDS",
                defaults.step_hard_timeout,
                0.1,
                600.0,
            ),
            run_hard_timeout: env_secs(
                "BRIDGE_WEB_RUN_HARD_TIMEOUT_SECONDS",
                defaults.run_hard_timeout,
                0.1,
                3600.0,
            ),
            stuck_interactive: env_secs(
                "BRIDGE_WEB_STUCK_INTERACTIVE_SECONDS",
                defaults.stuck_interactive,
                0.1,
                600.0,
            ),
            stuck_step: env_secs("BRIDGE_WEB_STUCK_STEP_SECONDS", defaults.stuck_step, 0.1, 600.0),
            stuck_iframe: env_secs("BRIDGE_WEB_STUCK_IFRAME_SECONDS", defaults.stuck_iframe, 0.1, 600.0),
            learning_window: env_secs(
                "BRIDGE_LEARNING_WINDOW_SECONDS",
                defaults.learning_window,
                4.0,
                180.0,
            ),
            noise_mode: std::env::var("BRIDGE_OBSERVER_NOISE_MODE")
                .map(|raw| NoiseMode::from_env_value(&raw))
                .unwrap_or_default(),
        }
    }
}

fn env_secs(name: &str, default: Duration, min: f64, max: f64) -> Duration {
    let raw = match std::env::var(name) {
        Ok(value) => value,
        Err(_) => return default,
    };
    match raw.trim().parse::<f64>() {
        Ok(secs) if secs.is_finite() => Duration::from_secs_f64(secs.clamp(min, max)),
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.interactive_timeout, Duration::from_secs(8));
        assert_eq!(cfg.step_hard_timeout, Duration::from_secs(20));
        assert_eq!(cfg.run_hard_timeout, Duration::from_secs(120));
        assert_eq!(cfg.learning_window, Duration::from_secs(25));
        assert_eq!(cfg.noise_mode, NoiseMode::Minimal);
    }

    #[test]
    fn noise_mode_parsing() {
        assert_eq!(NoiseMode::from_env_value("debug"), NoiseMode::Debug);
        assert_eq!(NoiseMode::from_env_value(" DEBUG "), NoiseMode::Debug);
        assert_eq!(NoiseMode::from_env_value("minimal"), NoiseMode::Minimal);
        assert_eq!(NoiseMode::from_env_value("garbage"), NoiseMode::Minimal);
    }

    #[test]
    fn env_secs_clamps_and_rejects_garbage() {
        // Direct helper test; avoids mutating the process environment.
        assert_eq!(
            env_secs("WARDEN_TEST_UNSET_VAR", Duration::from_secs(8), 1.0, 60.0),
            Duration::from_secs(8)
        );
    }
}
