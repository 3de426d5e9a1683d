//! Exit-node posture
//!
//! [`select`] derives which peers can serve as an exit node and whether the
//! configured one is usable. It is a pure function of its inputs.

use serde::{Deserialize, Serialize};

use crate::netmap::NetworkMap;
use crate::prefs::Prefs;

/// Display name for a configured exit node missing from the network map
pub const UNKNOWN_DEVICE: &str = "Unknown device";

/// State of the configured exit node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitStatus {
    /// No exit node selected
    #[default]
    None,
    /// Selected, but missing or not advertising a default route
    Offline,
    /// Selected and able to route
    Online,
}

/// An exit-node candidate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPeer {
    pub id: String,
    pub label: String,
    /// Advertises a default route
    pub online: bool,
}

/// Derived exit-node posture
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitNodeStatus {
    pub status: ExitStatus,
    /// The configured exit node, resolved against the network map
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitPeer>,
    /// Candidates, sorted by label
    pub exits: Vec<ExitPeer>,
}

/// Compute the exit-node posture for `prefs` against `netmap`
pub fn select(prefs: &Prefs, netmap: Option<&NetworkMap>) -> ExitNodeStatus {
    let exit_id = prefs.exit_node_id.as_deref();
    let mut out = ExitNodeStatus {
        status: if exit_id.is_some() {
            ExitStatus::Offline
        } else {
            ExitStatus::None
        },
        ..Default::default()
    };

    let mut seen = exit_id.is_none();
    for peer in netmap.map(|nm| nm.peers.as_slice()).unwrap_or_default() {
        let can_route = peer.advertises_default_route();
        let mine = exit_id == Some(peer.id.as_str());
        seen |= mine;

        let candidate = ExitPeer {
            id: peer.id.clone(),
            label: peer.name.clone(),
            online: can_route,
        };
        if mine {
            out.exit = Some(candidate.clone());
            if can_route {
                out.status = ExitStatus::Online;
            }
        }
        // A selected peer stays listed even when it cannot route
        if can_route || mine {
            out.exits.push(candidate);
        }
    }

    out.exits
        .sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.id.cmp(&b.id)));

    if !seen {
        let placeholder = ExitPeer {
            id: exit_id.unwrap_or_default().to_string(),
            label: UNKNOWN_DEVICE.to_string(),
            online: false,
        };
        out.exits.insert(0, placeholder.clone());
        out.exit = Some(placeholder);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netmap::Peer;

    fn peer(id: &str, name: &str, ips: &[&str]) -> Peer {
        Peer {
            id: id.into(),
            name: name.into(),
            allowed_ips: ips.iter().map(|s| s.parse().unwrap()).collect(),
        }
    }

    fn prefs_with_exit(id: Option<&str>) -> Prefs {
        Prefs {
            exit_node_id: id.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_exit_node_lists_routers() {
        let nm = NetworkMap {
            peers: vec![
                peer("nb", "b", &["0.0.0.0/0"]),
                peer("na", "a", &[]),
            ],
            ..Default::default()
        };
        let st = select(&prefs_with_exit(None), Some(&nm));

        assert_eq!(st.status, ExitStatus::None);
        assert_eq!(st.exit, None);
        assert_eq!(st.exits.len(), 1);
        assert_eq!(st.exits[0].label, "b");
    }

    #[test]
    fn test_selected_exit_online_over_ipv6() {
        let nm = NetworkMap {
            peers: vec![peer("peer1", "gateway", &["::/0"])],
            ..Default::default()
        };
        let st = select(&prefs_with_exit(Some("peer1")), Some(&nm));

        assert_eq!(st.status, ExitStatus::Online);
        let exit = st.exit.unwrap();
        assert_eq!(exit.id, "peer1");
        assert!(exit.online);
    }

    #[test]
    fn test_missing_exit_gets_placeholder() {
        let nm = NetworkMap {
            peers: vec![peer("other", "zed", &["0.0.0.0/0"])],
            ..Default::default()
        };
        let st = select(&prefs_with_exit(Some("missing")), Some(&nm));

        assert_eq!(st.status, ExitStatus::Offline);
        assert_eq!(st.exits[0].label, UNKNOWN_DEVICE);
        assert_eq!(st.exits[0].id, "missing");
        assert_eq!(st.exits[1].label, "zed");
        assert_eq!(st.exit.as_ref().map(|e| e.online), Some(false));
    }

    #[test]
    fn test_selected_but_unroutable_stays_listed() {
        let nm = NetworkMap {
            peers: vec![
                peer("p1", "laptop", &["100.64.0.5/32"]),
                peer("p2", "exit", &["0.0.0.0/0", "::/0"]),
            ],
            ..Default::default()
        };
        let st = select(&prefs_with_exit(Some("p1")), Some(&nm));

        assert_eq!(st.status, ExitStatus::Offline);
        let labels: Vec<_> = st.exits.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["exit", "laptop"]);
    }

    #[test]
    fn test_sort_is_case_sensitive_ordinal() {
        let nm = NetworkMap {
            peers: vec![
                peer("1", "alpha", &["0.0.0.0/0"]),
                peer("2", "Zulu", &["0.0.0.0/0"]),
                peer("3", "Bravo", &["::/0"]),
            ],
            ..Default::default()
        };
        let st = select(&Prefs::default(), Some(&nm));
        let labels: Vec<_> = st.exits.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["Bravo", "Zulu", "alpha"]);
    }

    #[test]
    fn test_select_is_deterministic() {
        let nm = NetworkMap {
            peers: vec![
                peer("x", "same", &["0.0.0.0/0"]),
                peer("a", "same", &["0.0.0.0/0"]),
                peer("m", "mid", &["::/0"]),
            ],
            ..Default::default()
        };
        let prefs = prefs_with_exit(Some("m"));
        let first = serde_json::to_vec(&select(&prefs, Some(&nm))).unwrap();
        for _ in 0..10 {
            assert_eq!(serde_json::to_vec(&select(&prefs, Some(&nm))).unwrap(), first);
        }
    }

    #[test]
    fn test_no_netmap() {
        let st = select(&prefs_with_exit(Some("x")), None);
        assert_eq!(st.status, ExitStatus::Offline);
        assert_eq!(st.exits.len(), 1);
        assert_eq!(st.exits[0].label, UNKNOWN_DEVICE);

        let st = select(&Prefs::default(), None);
        assert_eq!(st, ExitNodeStatus::default());
    }
}
