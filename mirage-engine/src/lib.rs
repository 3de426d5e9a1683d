//! Mirage Engine
//!
//! The control core of the mirage node agent: it assembles a transport
//! engine from OS primitives, keeps the single authoritative backend, and
//! serves its state to local clients over the control socket.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      mirage-cli                             │
//! │        daemon entry point, control socket commands          │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     mirage-engine                           │
//! │  Coordinator ──► assemble() ──► EngineBundle (+ Watchdog)   │
//! │       │                               │                     │
//! │       ▼                               ▼                     │
//! │  ControlServer ◄── NotifyBus ◄──── Backend ──► StateStore   │
//! │   (sessions)                      (prefs, state, netmap,    │
//! │                                    exit-node posture)       │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  mirage-tun                      mirage-packet              │
//! │  - TUN / userspace device        - IP header parsing        │
//! │  - Router, netns decorator       - TSMP rejection notices   │
//! │  - resolv.conf DNS                                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod assembler;
pub mod backend;
pub mod bus;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod event;
pub mod exitnode;
pub mod lifecycle;
pub mod mock;
pub mod netmap;
pub mod netmon;
pub mod prefs;
pub mod store;
pub mod userspace;
pub mod watchdog;

pub use assembler::{assemble, AssembleOptions};
pub use backend::{Backend, ControlPlane, OfflineControl};
pub use bus::{NotifyBus, SessionId, Subscription};
pub use config::{Config, DaemonConfig, InitialPrefs, WatchdogSettings, DEFAULT_SOCKET_PATH};
pub use control::{Command, ControlClient, ControlConnection, ControlServer};
pub use engine::{Engine, EngineBundle, EngineConfig, EngineSettings, Primitives};
pub use error::{CandidateError, Error, Result};
pub use event::{Notify, State};
pub use exitnode::{ExitNodeStatus, ExitPeer, ExitStatus};
pub use lifecycle::{parse_parent_death_fd, Coordinator, DaemonOptions, Phase, PARENT_DEATH_FD_ENV};
pub use netmap::{NetworkMap, Peer};
pub use netmon::{LinkChange, NetMon};
pub use prefs::{Prefs, PrefsEdit};
pub use store::{open_store, FileStore, MemStore, StateStore};
pub use userspace::{OsPrimitives, UserspaceEngine};
pub use watchdog::{Watchdog, WatchdogConfig};
