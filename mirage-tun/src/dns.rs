//! Resolver configuration
//!
//! [`ResolvConf`] manages `/etc/resolv.conf` directly: the original file is
//! saved on first use and put back on close.

use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default resolver configuration path
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

const BACKUP_SUFFIX: &str = ".mirage-backup";
const HEADER: &str = "# Generated by mirage. Do not edit.";

/// Resolver settings pushed by the network map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    pub nameservers: Vec<IpAddr>,
    #[serde(default)]
    pub search_domains: Vec<String>,
}

impl DnsConfig {
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty() && self.search_domains.is_empty()
    }

    /// Render as resolv.conf text
    pub fn render(&self) -> String {
        let mut out = String::from(HEADER);
        out.push('\n');
        for ns in &self.nameservers {
            out.push_str(&format!("nameserver {}\n", ns));
        }
        if !self.search_domains.is_empty() {
            out.push_str(&format!("search {}\n", self.search_domains.join(" ")));
        }
        out
    }
}

/// DNS configurator capability
pub trait DnsConfigurator: Send + Sync {
    /// Apply `config`; an empty config restores the system settings
    fn set(&self, config: &DnsConfig) -> Result<()>;

    /// Undo everything this configurator changed
    fn close(&self) -> Result<()>;
}

/// Configurator that only remembers the last config
#[derive(Debug, Default)]
pub struct NoopDns {
    current: Mutex<Option<DnsConfig>>,
}

impl NoopDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<DnsConfig> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DnsConfigurator for NoopDns {
    fn set(&self, config: &DnsConfig) -> Result<()> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

/// Direct `resolv.conf` manager
#[derive(Debug)]
pub struct ResolvConf {
    path: PathBuf,
    backup: PathBuf,
    iface: String,
    active: Mutex<bool>,
}

impl ResolvConf {
    /// Manage the system resolv.conf on behalf of `iface`
    pub fn new(iface: impl Into<String>) -> Self {
        Self::with_path(iface, RESOLV_CONF)
    }

    pub fn with_path(iface: impl Into<String>, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            backup: backup_path(&path),
            path,
            iface: iface.into(),
            active: Mutex::new(false),
        }
    }

    /// Restore a backup left behind by a crashed run
    pub fn cleanup(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let backup = backup_path(path);
        if backup.exists() {
            fs::rename(&backup, path)?;
            log::info!("Restored {} from backup", path.display());
        }
        Ok(())
    }

    fn write_atomic(&self, contents: &str) -> Result<()> {
        let tmp = self.path.with_extension("mirage-tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(contents.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn restore(&self, active: &mut bool) -> Result<()> {
        if !*active {
            return Ok(());
        }
        if self.backup.exists() {
            fs::rename(&self.backup, &self.path)?;
        } else {
            fs::remove_file(&self.path)?;
        }
        *active = false;
        log::info!("Restored {} (interface {})", self.path.display(), self.iface);
        Ok(())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

impl DnsConfigurator for ResolvConf {
    fn set(&self, config: &DnsConfig) -> Result<()> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);

        if config.is_empty() {
            return self.restore(&mut active);
        }

        if !*active && self.path.exists() && !self.backup.exists() {
            fs::copy(&self.path, &self.backup)
                .map_err(|e| Error::Dns(format!("backup of {}: {}", self.path.display(), e)))?;
        }

        self.write_atomic(&config.render())
            .map_err(|e| Error::Dns(format!("writing {}: {}", self.path.display(), e)))?;
        *active = true;

        log::info!(
            "DNS for {}: nameservers {:?}, search {:?}",
            self.iface,
            config.nameservers,
            config.search_domains
        );
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        self.restore(&mut active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DnsConfig {
        DnsConfig {
            nameservers: vec!["100.100.100.100".parse().unwrap()],
            search_domains: vec!["example.ts.net".into()],
        }
    }

    #[test]
    fn test_render() {
        let text = sample().render();
        assert!(text.contains("nameserver 100.100.100.100\n"));
        assert!(text.contains("search example.ts.net\n"));
    }

    #[test]
    fn test_set_and_close_restores_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        fs::write(&path, "nameserver 1.1.1.1\n").unwrap();

        let dns = ResolvConf::with_path("mirage0", &path);
        dns.set(&sample()).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("100.100.100.100"));

        // A second set keeps the first backup
        dns.set(&sample()).unwrap();

        dns.close().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "nameserver 1.1.1.1\n");
        assert!(!backup_path(&path).exists());
    }

    #[test]
    fn test_empty_config_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        fs::write(&path, "nameserver 9.9.9.9\n").unwrap();

        let dns = ResolvConf::with_path("mirage0", &path);
        dns.set(&sample()).unwrap();
        dns.set(&DnsConfig::default()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "nameserver 9.9.9.9\n");
    }

    #[test]
    fn test_cleanup_restores_stale_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        fs::write(&path, "stale\n").unwrap();
        fs::write(backup_path(&path), "nameserver 8.8.8.8\n").unwrap();

        ResolvConf::cleanup(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "nameserver 8.8.8.8\n");
    }

    #[test]
    fn test_close_without_set_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        fs::write(&path, "keep\n").unwrap();
        ResolvConf::with_path("mirage0", &path).close().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "keep\n");
    }
}
