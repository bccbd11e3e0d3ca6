//! Control-state color derivation.
//!
//! The top-bar color is a pure function of four session booleans (P7).
//! Exactly one color applies; the first matching rule wins.

use serde::{Deserialize, Serialize};

/// Session booleans the color is derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFlags {
    pub controlled: bool,
    pub learning_active: bool,
    pub incident_open: bool,
    pub agent_online: bool,
}

/// Top-bar / border color signalling who controls the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlColor {
    /// Assistant holds control.
    Blue,
    /// Learning window open, waiting for the user to teach.
    Orange,
    /// An incident (console/page/network error) is open and unacknowledged.
    Red,
    /// Agent online, user holds control.
    Green,
    /// Agent offline or session closed.
    Gray,
}

impl ControlColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Orange => "orange",
            Self::Red => "red",
            Self::Green => "green",
            Self::Gray => "gray",
        }
    }

    /// Label shown next to the colored dot in the top bar.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Blue => "ASSISTANT CONTROL",
            Self::Orange => "LEARNING",
            Self::Red => "INCIDENT",
            Self::Green => "USER CONTROL",
            Self::Gray => "OFFLINE",
        }
    }
}

/// First match wins: red, orange, blue, green, gray.
pub fn derive_control_color(flags: ControlFlags) -> ControlColor {
    if flags.incident_open {
        ControlColor::Red
    } else if flags.learning_active {
        ControlColor::Orange
    } else if flags.controlled {
        ControlColor::Blue
    } else if flags.agent_online {
        ControlColor::Green
    } else {
        ControlColor::Gray
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(controlled: bool, learning: bool, incident: bool, online: bool) -> ControlFlags {
        ControlFlags {
            controlled,
            learning_active: learning,
            incident_open: incident,
            agent_online: online,
        }
    }

    #[test]
    fn precedence_order() {
        // Incident beats everything.
        assert_eq!(derive_control_color(flags(true, true, true, true)), ControlColor::Red);
        // Learning beats controlled.
        assert_eq!(derive_control_color(flags(true, true, false, true)), ControlColor::Orange);
        // Controlled beats online.
        assert_eq!(derive_control_color(flags(true, false, false, true)), ControlColor::Blue);
        // Online alone is green.
        assert_eq!(derive_control_color(flags(false, false, false, true)), ControlColor::Green);
        // Nothing set: gray.
        assert_eq!(derive_control_color(flags(false, false, false, false)), ControlColor::Gray);
    }

    #[test]
    fn pure_over_all_inputs() {
        // Exhaustive: the function is total and deterministic over 16 inputs.
        for bits in 0..16u8 {
            let f = flags(bits & 1 != 0, bits & 2 != 0, bits & 4 != 0, bits & 8 != 0);
            assert_eq!(derive_control_color(f), derive_control_color(f));
        }
    }
}
