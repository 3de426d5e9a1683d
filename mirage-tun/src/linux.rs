//! Linux router, namespace switching and interface helpers
//!
//! Addresses and routes are applied with the `ip` command. Interface flags use
//! a plain `SIOCSIFFLAGS` ioctl.

use std::collections::BTreeSet;
use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};

use ipnet::IpNet;

use crate::error::{Error, Result};
use crate::router::{NamespaceSwitch, Router, RouterConfig};

/// Directory where `ip netns` keeps named namespaces
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Get the interface index for a given interface name
pub fn get_interface_index(name: &str) -> Result<u32> {
    let c_name =
        CString::new(name).map_err(|_| Error::InvalidSpec("invalid interface name".into()))?;

    // SAFETY: if_nametoindex is safe to call with a valid C string
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };

    if index == 0 {
        return Err(Error::DeviceNotFound(name.to_string()));
    }

    Ok(index)
}

/// Set interface flags (up/down, etc.)
pub fn set_interface_flags(name: &str, flags: i32) -> Result<()> {
    use std::mem;

    let c_name =
        CString::new(name).map_err(|_| Error::InvalidSpec("invalid interface name".into()))?;

    let socket = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if socket < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };

    let name_bytes = c_name.as_bytes_with_nul();
    let copy_len = name_bytes.len().min(libc::IFNAMSIZ);
    unsafe {
        #[allow(clippy::unnecessary_cast)]
        std::ptr::copy_nonoverlapping(
            name_bytes.as_ptr(),
            // c_char is i8 on x86_64 and u8 on aarch64
            ifr.ifr_name.as_mut_ptr() as *mut u8,
            copy_len,
        );
    }

    ifr.ifr_ifru.ifru_flags = flags as i16;

    let result = unsafe { libc::ioctl(socket, libc::SIOCSIFFLAGS as _, &ifr) };

    unsafe { libc::close(socket) };

    if result < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    Ok(())
}

/// Bring an interface up
pub fn bring_interface_up(name: &str) -> Result<()> {
    set_interface_flags(name, libc::IFF_UP | libc::IFF_RUNNING)
}

/// Check if the TUN kernel module is loaded
pub fn is_tun_available() -> bool {
    Path::new("/dev/net/tun").exists()
}

fn run_ip(args: &[String]) -> Result<()> {
    log::debug!("ip {}", args.join(" "));

    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| Error::Route(format!("failed to run ip: {}", e)))?;

    if !output.status.success() {
        return Err(Error::Route(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Applied {
    addrs: BTreeSet<IpNet>,
    routes: BTreeSet<IpNet>,
}

/// Build the `ip` invocations that move `applied` to `desired`.
///
/// Removals come first so a prefix that changes owner never collides.
fn plan(
    iface: &str,
    applied_addrs: &BTreeSet<IpNet>,
    applied_routes: &BTreeSet<IpNet>,
    desired: &RouterConfig,
) -> Vec<Vec<String>> {
    let want_addrs = desired.addr_set();
    let want_routes = desired.route_set();
    let mut cmds = Vec::new();

    let cmd = |parts: &[&str], net: &IpNet| -> Vec<String> {
        let mut v: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
        v.push(net.to_string());
        v.push("dev".into());
        v.push(iface.to_string());
        v
    };

    for r in applied_routes.difference(&want_routes) {
        cmds.push(cmd(&["route", "del"], r));
    }
    for a in applied_addrs.difference(&want_addrs) {
        cmds.push(cmd(&["addr", "del"], a));
    }
    for a in want_addrs.difference(applied_addrs) {
        cmds.push(cmd(&["addr", "add"], a));
    }
    for r in want_routes.difference(applied_routes) {
        cmds.push(cmd(&["route", "replace"], r));
    }
    cmds
}

/// Router for a kernel interface
#[derive(Debug)]
pub struct OsRouter {
    iface: String,
    applied: Mutex<Applied>,
}

impl OsRouter {
    pub fn new(iface: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
            applied: Mutex::new(Applied::default()),
        }
    }

    /// Remove routes and addresses left on `iface` by a previous run
    pub fn cleanup(iface: &str) -> Result<()> {
        if get_interface_index(iface).is_err() {
            log::debug!("Interface {} not present, nothing to clean up", iface);
            return Ok(());
        }
        run_ip(&["route".into(), "flush".into(), "dev".into(), iface.into()])?;
        run_ip(&["addr".into(), "flush".into(), "dev".into(), iface.into()])?;
        log::info!("Cleaned up routes and addresses on {}", iface);
        Ok(())
    }
}

impl Router for OsRouter {
    fn up(&self) -> Result<()> {
        bring_interface_up(&self.iface)?;
        log::info!("Interface {} is up", self.iface);
        Ok(())
    }

    fn set(&self, config: &RouterConfig) -> Result<()> {
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);

        for args in plan(&self.iface, &applied.addrs, &applied.routes, config) {
            run_ip(&args)?;
            let net = args[2].parse::<IpNet>().ok();
            // Track progress so a mid-way failure still leaves an accurate record
            if let Some(net) = net {
                match (args[0].as_str(), args[1].as_str()) {
                    ("route", "del") => {
                        applied.routes.remove(&net);
                    }
                    ("route", _) => {
                        applied.routes.insert(net);
                    }
                    ("addr", "del") => {
                        applied.addrs.remove(&net);
                    }
                    _ => {
                        applied.addrs.insert(net);
                    }
                }
            }
        }

        log::debug!(
            "Router {}: {} addresses, {} routes",
            self.iface,
            applied.addrs.len(),
            applied.routes.len()
        );
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        let mut first_err = None;

        for r in std::mem::take(&mut applied.routes) {
            let args = vec![
                "route".to_string(),
                "del".into(),
                r.to_string(),
                "dev".into(),
                self.iface.clone(),
            ];
            if let Err(e) = run_ip(&args) {
                log::warn!("Failed to remove route {}: {}", r, e);
                first_err.get_or_insert(e);
            }
        }
        applied.addrs.clear();

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// `setns(2)`-based namespace switch
#[derive(Debug)]
pub struct LinuxNetns {
    original: File,
    run_dir: PathBuf,
}

impl LinuxNetns {
    /// Remember the current namespace so it can be restored later
    pub fn new() -> Result<Self> {
        let original = File::open("/proc/thread-self/ns/net")
            .or_else(|_| File::open("/proc/self/ns/net"))
            .map_err(|e| Error::Namespace(format!("cannot open current namespace: {}", e)))?;
        Ok(Self {
            original,
            run_dir: PathBuf::from(NETNS_RUN_DIR),
        })
    }

    fn setns(file: &File, what: &str) -> Result<()> {
        // SAFETY: the fd is valid for the lifetime of `file`
        let rc = unsafe { libc::setns(file.as_raw_fd(), libc::CLONE_NEWNET) };
        if rc < 0 {
            return Err(Error::Namespace(format!(
                "setns({}) failed: {}",
                what,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl NamespaceSwitch for LinuxNetns {
    fn enter(&self, ns: &str) -> Result<()> {
        let path = self.run_dir.join(ns);
        let target = File::open(&path)
            .map_err(|e| Error::Namespace(format!("{}: {}", path.display(), e)))?;
        Self::setns(&target, ns)
    }

    fn restore(&self) -> Result<()> {
        Self::setns(&self.original, "original")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(nets: &[&str]) -> BTreeSet<IpNet> {
        nets.iter().map(|n| n.parse().unwrap()).collect()
    }

    #[test]
    fn test_tun_available() {
        let _ = is_tun_available();
    }

    #[test]
    fn test_plan_from_empty() {
        let desired = RouterConfig {
            local_addrs: vec!["100.64.0.1/32".parse().unwrap()],
            routes: vec!["100.64.0.0/10".parse().unwrap()],
        };
        let cmds = plan("mirage0", &BTreeSet::new(), &BTreeSet::new(), &desired);
        assert_eq!(
            cmds,
            vec![
                vec!["addr", "add", "100.64.0.1/32", "dev", "mirage0"],
                vec!["route", "replace", "100.64.0.0/10", "dev", "mirage0"],
            ]
        );
    }

    #[test]
    fn test_plan_is_a_diff() {
        let desired = RouterConfig {
            local_addrs: vec!["100.64.0.1/32".parse().unwrap()],
            routes: vec!["0.0.0.0/0".parse().unwrap()],
        };
        let cmds = plan(
            "mirage0",
            &set(&["100.64.0.1/32"]),
            &set(&["10.0.0.0/8", "0.0.0.0/0"]),
            &desired,
        );
        assert_eq!(cmds, vec![vec!["route", "del", "10.0.0.0/8", "dev", "mirage0"]]);
    }

    #[test]
    fn test_plan_unchanged_is_empty() {
        let desired = RouterConfig {
            local_addrs: vec!["100.64.0.1/32".parse().unwrap()],
            routes: vec![],
        };
        assert!(plan("m", &set(&["100.64.0.1/32"]), &BTreeSet::new(), &desired).is_empty());
    }
}
