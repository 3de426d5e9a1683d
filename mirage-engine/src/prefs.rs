//! Node preferences and masked edits

use serde::{Deserialize, Serialize};

/// Control server used when none is configured
pub const DEFAULT_CONTROL_URL: &str = "https://controlplane.tailscale.com";

/// User preferences for the node
///
/// Only [`Prefs::apply`] mutates a live record; every applied edit bumps
/// `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prefs {
    pub version: u64,
    pub want_running: bool,
    /// Use the DNS settings pushed in the network map
    pub corp_dns: bool,
    /// Accept subnet routes advertised by peers
    pub route_all: bool,
    /// Reject all incoming connections
    pub shields_up: bool,
    /// Stable id of the selected exit node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_node_id: Option<String>,
    pub exit_node_allow_lan_access: bool,
    pub control_url: String,
    pub hostname: String,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            version: 0,
            want_running: false,
            corp_dns: true,
            route_all: true,
            shields_up: false,
            exit_node_id: None,
            exit_node_allow_lan_access: false,
            control_url: DEFAULT_CONTROL_URL.to_string(),
            hostname: String::new(),
        }
    }
}

impl Prefs {
    /// Apply the fields present in `edit`.
    ///
    /// Returns false, leaving the record untouched, when the edit is empty.
    pub fn apply(&mut self, edit: &PrefsEdit) -> bool {
        if edit.is_empty() {
            return false;
        }

        if let Some(v) = edit.want_running {
            self.want_running = v;
        }
        if let Some(v) = edit.corp_dns {
            self.corp_dns = v;
        }
        if let Some(v) = edit.route_all {
            self.route_all = v;
        }
        if let Some(v) = edit.shields_up {
            self.shields_up = v;
        }
        if let Some(ref id) = edit.exit_node_id {
            let id = id.trim();
            self.exit_node_id = (!id.is_empty()).then(|| id.to_string());
        }
        if let Some(v) = edit.exit_node_allow_lan_access {
            self.exit_node_allow_lan_access = v;
        }
        if let Some(ref url) = edit.control_url {
            self.control_url = url.clone();
        }
        if let Some(ref name) = edit.hostname {
            self.hostname = name.clone();
        }

        self.version += 1;
        true
    }

    pub fn has_exit_node(&self) -> bool {
        self.exit_node_id.is_some()
    }
}

/// A partial update to [`Prefs`]; absent fields are left unchanged
///
/// An empty `exit_node_id` clears the exit node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefsEdit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub want_running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corp_dns: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_all: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shields_up: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_node_allow_lan_access: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl PrefsEdit {
    pub fn want_running(v: bool) -> Self {
        Self {
            want_running: Some(v),
            ..Default::default()
        }
    }

    /// Select (or with an empty id, clear) the exit node, allowing LAN access
    pub fn exit_node(id: impl Into<String>) -> Self {
        Self {
            exit_node_id: Some(id.into()),
            exit_node_allow_lan_access: Some(true),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &PrefsEdit::default()
    }
}
