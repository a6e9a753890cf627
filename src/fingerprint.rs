//! Machine identifiers licenses are bound to.
//!
//! Verification only needs an opaque, stable string; [`FingerprintSource`]
//! is the seam. [`HostFingerprint`] is the implementation used by the
//! command line tool.

use std::env;

use sha2::{Digest, Sha256};
use sysinfo::{CpuRefreshKind, Networks, RefreshKind, System};
use tracing::debug;

use crate::error::{LicenseError, LicenseResult};

/// Interface name prefixes that never belong to a physical NIC.
const VIRTUAL_INTERFACE_PREFIXES: [&str; 5] = ["lo", "veth", "docker", "br-", "v-"];

/// Supplies the identifier of the machine we are running on.
pub trait FingerprintSource {
    fn current_machine_id(&self) -> LicenseResult<String>;
}

/// A fixed identifier, for callers that obtain it elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticFingerprint(pub String);

impl FingerprintSource for StaticFingerprint {
    fn current_machine_id(&self) -> LicenseResult<String> {
        if self.0.is_empty() {
            return Err(LicenseError::InvalidInput("machine id cannot be empty".into()));
        }
        Ok(self.0.clone())
    }
}

/// Hex SHA-256 over the host's stable identifiers.
///
/// The components are the OS host id (`/etc/machine-id` on Linux,
/// `IOPlatformUUID` on macOS, `MachineGuid` on Windows), the OS name and
/// family, the CPU model and the MAC address of the first physical network
/// interface. Empty ones are dropped and the rest sorted before hashing so
/// that the result does not depend on collection order.
///
/// The host id is required. In container mode, a host without one falls
/// back to hashing the hostname alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostFingerprint {
    pub container: bool,
}

impl HostFingerprint {
    pub fn new(container: bool) -> Self {
        Self { container }
    }
}

impl FingerprintSource for HostFingerprint {
    fn current_machine_id(&self) -> LicenseResult<String> {
        match host_id() {
            Some(host_id) => Ok(hash_components(vec![
                host_id,
                env::consts::OS.to_string(),
                env::consts::FAMILY.to_string(),
                cpu_model().unwrap_or_default(),
                physical_mac().unwrap_or_default(),
            ])),
            None if self.container => {
                debug!("no OS host id, using hostname for container fingerprint");
                container_id(&hostname())
            }
            None => Err(LicenseError::InvalidInput(
                "cannot determine machine id for this host".into(),
            )),
        }
    }
}

fn hash_components(mut components: Vec<String>) -> String {
    components.retain(|c| !c.is_empty());
    components.sort();
    hex::encode(Sha256::digest(components.join("|").as_bytes()))
}

fn container_id(host: &str) -> LicenseResult<String> {
    if host.is_empty() {
        return Err(LicenseError::InvalidInput(
            "cannot determine hostname for container fingerprint".into(),
        ));
    }
    Ok(hex::encode(Sha256::digest(host.as_bytes())))
}

fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}

fn cpu_model() -> Option<String> {
    let refresh = RefreshKind::nothing().with_cpu(CpuRefreshKind::everything());
    let sys = System::new_with_specifics(refresh);
    sys.cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .filter(|brand| !brand.is_empty())
}

fn physical_mac() -> Option<String> {
    let networks = Networks::new_with_refreshed_list();
    let mut candidates: Vec<(&String, String)> = networks
        .iter()
        .filter(|(name, _)| is_physical_interface(name.as_str()))
        .map(|(name, data)| (name, data.mac_address()))
        .filter(|(_, mac)| !mac.is_unspecified())
        .map(|(name, mac)| (name, mac.to_string()))
        .collect();
    candidates.sort();
    candidates.into_iter().next().map(|(_, mac)| mac)
}

fn is_physical_interface(name: &str) -> bool {
    !name.is_empty()
        && !VIRTUAL_INTERFACE_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

fn host_id() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        ["/etc/machine-id", "/var/lib/dbus/machine-id"]
            .iter()
            .filter_map(|path| std::fs::read_to_string(path).ok())
            .map(|s| s.trim().to_string())
            .find(|s| !s.is_empty())
    }

    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("ioreg")
            .args(["-rd1", "-c", "IOPlatformExpertDevice"])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|output| parse_ioreg_uuid(&output))
    }

    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("reg")
            .args([
                "query",
                r"HKLM\SOFTWARE\Microsoft\Cryptography",
                "/v",
                "MachineGuid",
            ])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|output| parse_machine_guid(&output))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        None
    }
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_ioreg_uuid(output: &str) -> Option<String> {
    output
        .lines()
        .find(|l| l.contains("\"IOPlatformUUID\""))
        .and_then(|l| l.split('"').nth(3))
        .map(str::to_string)
        .filter(|id| !id.is_empty())
}

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn parse_machine_guid(output: &str) -> Option<String> {
    output
        .lines()
        .find(|l| l.trim_start().starts_with("MachineGuid"))
        .and_then(|l| l.split_whitespace().nth(2))
        .map(str::to_string)
}
