//! Configuration for the mirage daemon

use std::path::{Path, PathBuf};
use std::time::Duration;

use mirage_tun::TunSpec;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::prefs::PrefsEdit;

/// Default control socket path
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/mirage/mirage.sock";

/// Default state directory
pub const DEFAULT_STATE_DIR: &str = "/var/lib/mirage";

/// State file name inside the state directory
pub const STATE_FILE_NAME: &str = "mirage.state";

/// Listen port used when neither the config nor `PORT` sets one
pub const DEFAULT_PORT: u16 = 41641;

/// Main configuration structure
///
/// # Example Configuration
///
/// ```toml
/// [daemon]
/// tun = "mirage0,userspace-networking"
/// port = 41641
/// socket = "/var/run/mirage/mirage.sock"
/// statedir = "/var/lib/mirage"
///
/// [watchdog]
/// interval_secs = 5
/// max_stall_secs = 45
///
/// [prefs]
/// hostname = "build-box"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub watchdog: WatchdogSettings,

    /// Initial preferences applied on first start
    #[serde(default)]
    pub prefs: InitialPrefs,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.daemon.validate()?;
        self.watchdog.validate()?;
        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        format!(
            r#"# mirage node agent configuration

[daemon]
# Ordered tunnel candidates, tried until one works:
#   NAME                  kernel TUN device
#   userspace-networking  no OS device
#   tap:NAME[:BRIDGE]     layer-2 TAP device
tun = "mirage0"

# UDP listen port (default: $PORT, else {port}; 0 picks one)
# port = {port}

# Control socket path
socket = "{socket}"

# State location: a file path, or "mem:" for memory only.
# Defaults to <statedir>/{state_file}.
# state = "mem:"
statedir = "{statedir}"

# Network namespace to configure routes in (optional)
# netns = "vpn"

# Tunnel MTU
mtu = 1280

# Control socket limits
max_sessions = 8
session_queue = 64

[watchdog]
# Seconds between liveness probes
interval_secs = 5
# A probe or reconfiguration slower than this counts as a stall
max_stall_secs = 45

[prefs]
# Applied when no saved preferences exist
# control_url = "https://controlplane.tailscale.com"
# hostname = "my-node"
"#,
            port = DEFAULT_PORT,
            socket = DEFAULT_SOCKET_PATH,
            state_file = STATE_FILE_NAME,
            statedir = DEFAULT_STATE_DIR,
        )
    }
}

/// `[daemon]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Comma-separated tunnel candidates
    #[serde(default = "default_tun")]
    pub tun: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    /// Explicit state location; overrides `statedir`
    #[serde(default)]
    pub state: Option<String>,

    #[serde(default = "default_statedir")]
    pub statedir: PathBuf,

    #[serde(default)]
    pub netns: Option<String>,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default = "default_session_queue")]
    pub session_queue: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tun: default_tun(),
            port: default_port(),
            socket: default_socket(),
            state: None,
            statedir: default_statedir(),
            netns: None,
            mtu: default_mtu(),
            max_sessions: default_max_sessions(),
            session_queue: default_session_queue(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon section
    pub fn validate(&self) -> Result<()> {
        self.tun_specs()?;

        if self.mtu < 576 {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum 576)",
                self.mtu
            )));
        }
        if self.max_sessions == 0 {
            return Err(Error::Config("max_sessions must be at least 1".into()));
        }
        if self.session_queue == 0 {
            return Err(Error::Config("session_queue must be at least 1".into()));
        }
        if matches!(self.state.as_deref(), Some("")) {
            return Err(Error::Config("state must not be empty".into()));
        }
        Ok(())
    }

    /// Parsed tunnel candidates, in order
    pub fn tun_specs(&self) -> Result<Vec<TunSpec>> {
        TunSpec::parse_list(&self.tun).map_err(|e| Error::Config(e.to_string()))
    }

    /// `state` if set, else `<statedir>/mirage.state`
    pub fn state_path(&self) -> String {
        match self.state {
            Some(ref state) => state.clone(),
            None => self.statedir.join(STATE_FILE_NAME).display().to_string(),
        }
    }
}

/// `[watchdog]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogSettings {
    #[serde(default = "default_watchdog_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_max_stall")]
    pub max_stall_secs: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_watchdog_interval(),
            max_stall_secs: default_max_stall(),
        }
    }
}

impl WatchdogSettings {
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(Error::Config("watchdog interval must be positive".into()));
        }
        if self.max_stall_secs == 0 {
            return Err(Error::Config("watchdog max_stall must be positive".into()));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_stall(&self) -> Duration {
        Duration::from_secs(self.max_stall_secs)
    }
}

/// `[prefs]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialPrefs {
    #[serde(default)]
    pub control_url: Option<String>,

    #[serde(default)]
    pub hostname: Option<String>,
}

impl InitialPrefs {
    pub fn to_edit(&self) -> PrefsEdit {
        PrefsEdit {
            control_url: self.control_url.clone(),
            hostname: self.hostname.clone(),
            ..Default::default()
        }
    }
}

/// Parse a `PORT` value, falling back to [`DEFAULT_PORT`]
pub fn port_from_env(value: Option<&str>) -> u16 {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

fn default_tun() -> String {
    "mirage0".to_string()
}

fn default_port() -> u16 {
    port_from_env(std::env::var("PORT").ok().as_deref())
}

fn default_socket() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_statedir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_mtu() -> u16 {
    mirage_tun::DEFAULT_MTU
}

fn default_max_sessions() -> usize {
    8
}

fn default_session_queue() -> usize {
    64
}

fn default_watchdog_interval() -> u64 {
    5
}

fn default_max_stall() -> u64 {
    45
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[daemon]
tun = "mirage0, userspace-networking"
port = 5000
socket = "/tmp/mirage.sock"
state = "mem:"
netns = "vpn"
max_sessions = 2
session_queue = 4

[watchdog]
interval_secs = 1
max_stall_secs = 3

[prefs]
hostname = "edge-1"
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.daemon.port, 5000);
        assert_eq!(config.daemon.tun_specs().unwrap().len(), 2);
        assert_eq!(config.daemon.state_path(), "mem:");
        assert_eq!(config.daemon.netns.as_deref(), Some("vpn"));
        assert_eq!(config.watchdog.max_stall(), Duration::from_secs(3));
        assert_eq!(config.prefs.to_edit().hostname.as_deref(), Some("edge-1"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.daemon.tun, "mirage0");
        assert_eq!(config.daemon.max_sessions, 8);
        assert_eq!(config.daemon.session_queue, 64);
        assert_eq!(config.daemon.state_path(), "/var/lib/mirage/mirage.state");
        assert!(config.prefs.to_edit().is_empty());
    }

    #[test]
    fn test_empty_tun_list_fails() {
        let result = Config::from_toml("[daemon]\ntun = \" , \"\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_limits_fail() {
        assert!(Config::from_toml("[daemon]\nmax_sessions = 0\n").is_err());
        assert!(Config::from_toml("[daemon]\nsession_queue = 0\n").is_err());
        assert!(Config::from_toml("[watchdog]\ninterval_secs = 0\n").is_err());
    }

    #[test]
    fn test_port_from_env() {
        assert_eq!(port_from_env(Some("7000")), 7000);
        assert_eq!(port_from_env(Some("bogus")), DEFAULT_PORT);
        assert_eq!(port_from_env(None), DEFAULT_PORT);
    }

    #[test]
    fn test_sample_parses() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        assert_eq!(config.daemon.socket, PathBuf::from(DEFAULT_SOCKET_PATH));
    }
}
