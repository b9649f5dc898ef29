use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Index;

/// Parsed output of one nmap run, keyed by host address.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    pub command_line: String,
    pub stats: ScanStats,
    pub hosts: BTreeMap<String, HostResult>,
}

impl ScanResult {
    /// Look up a host by address, or by the name it was given on the command line.
    pub fn host(&self, host: &str) -> Option<&HostResult> {
        self.hosts.get(host).or_else(|| {
            self.hosts
                .values()
                .find(|h| h.hostnames.iter().any(|n| n.kind == "user" && n.name == host))
        })
    }

    /// Scanned host keys in sorted order.
    pub fn all_hosts(&self) -> Vec<&str> {
        self.hosts.keys().map(String::as_str).collect()
    }

    pub fn has_host(&self, host: &str) -> bool {
        self.host(host).is_some()
    }
}

/// Panics if `host` was not part of the run; use [`ScanResult::host`] to probe.
impl Index<&str> for ScanResult {
    type Output = HostResult;

    fn index(&self, host: &str) -> &HostResult {
        match self.host(host) {
            Some(h) => h,
            None => panic!("host {host} not present in scan result"),
        }
    }
}

/// Run statistics from the `<runstats>` block.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ScanStats {
    pub timestr: String,
    pub elapsed: String,
    pub up_hosts: u32,
    pub down_hosts: u32,
    pub total_hosts: u32,
}

/// Findings for a single host.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HostResult {
    /// Address type (`ipv4`, `ipv6`, `mac`) to address.
    pub addresses: BTreeMap<String, String>,
    pub hostnames: Vec<Hostname>,
    pub state: String,
    pub reason: String,
    pub ports: Vec<PortEntry>,
    pub os_matches: Vec<OsMatch>,
    /// Host-level (`<hostscript>`) script id to output.
    pub host_scripts: BTreeMap<String, String>,
}

impl HostResult {
    pub fn open_ports(&self) -> impl Iterator<Item = &PortEntry> {
        self.ports.iter().filter(|p| p.state == "open")
    }

    pub fn tcp(&self, port: u16) -> Option<&PortEntry> {
        self.port_for("tcp", port)
    }

    pub fn udp(&self, port: u16) -> Option<&PortEntry> {
        self.port_for("udp", port)
    }

    fn port_for(&self, protocol: &str, port: u16) -> Option<&PortEntry> {
        self.ports
            .iter()
            .find(|p| p.protocol == protocol && p.port == port)
    }

    pub fn is_up(&self) -> bool {
        self.state == "up"
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Hostname {
    pub name: String,
    pub kind: String,
}

/// One `<port>` element.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PortEntry {
    pub protocol: String,
    pub port: u16,
    pub state: String,
    pub reason: String,
    pub service: Option<ServiceInfo>,
    /// Script id to output.
    pub scripts: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub product: String,
    pub version: String,
    pub extra_info: String,
    pub cpe: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OsMatch {
    pub name: String,
    pub accuracy: u8,
}
