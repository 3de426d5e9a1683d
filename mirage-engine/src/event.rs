//! Backend state and notifications

use serde::{Deserialize, Serialize};

use crate::exitnode::ExitNodeStatus;
use crate::netmap::NetworkMap;
use crate::prefs::Prefs;

/// Backend connection state
///
/// Ordered: `NoState < NeedsLogin < Stopped < Starting < Running`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum State {
    #[default]
    NoState,
    NeedsLogin,
    Stopped,
    Starting,
    Running,
}

impl State {
    /// Above `Stopped`
    pub fn is_active(&self) -> bool {
        *self > State::Stopped
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            State::NoState => "No state",
            State::NeedsLogin => "Needs login",
            State::Stopped => "Stopped",
            State::Starting => "Starting...",
            State::Running => "Running",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// One message sent to control-socket sessions
///
/// Every field is optional; only what changed is present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Notify {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefs: Option<Prefs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netmap: Option<NetworkMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browse_to_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_nodes: Option<ExitNodeStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Notify {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Notify::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_bands() {
        assert!(State::NoState < State::NeedsLogin);
        assert!(State::NeedsLogin < State::Stopped);
        assert!(!State::Stopped.is_active());
        assert!(!State::NeedsLogin.is_active());
        assert!(State::Starting.is_active());
        assert!(State::Running.is_active());
    }

    #[test]
    fn test_notify_omits_absent_fields() {
        let n = Notify {
            state: Some(State::Running),
            ..Default::default()
        };
        assert_eq!(serde_json::to_string(&n).unwrap(), r#"{"state":"Running"}"#);

        let err = Notify::error("unknown command \"bogus\"");
        let back: Notify = serde_json::from_str(&serde_json::to_string(&err).unwrap()).unwrap();
        assert_eq!(back, err);
        assert!(Notify::default().is_empty());
    }
}
