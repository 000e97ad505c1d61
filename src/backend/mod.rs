//! Hardware backend abstraction.
//!
//! The engine keeps no host state of its own. Every DHCP exchange and HTTP
//! request consults a [`BackendReader`] for the hardware record keyed by MAC
//! or IP. Implementations must be safe for concurrent reads.

pub mod file;
pub mod mem;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use macaddr::MacAddr6;
use serde::Deserialize;
use thiserror::Error;

pub use file::FileBackend;
pub use mem::MemoryBackend;

/// Errors returned by backend lookups.
///
/// `NotFound` is distinguished from transient failures: callers drop or
/// synthesize on the former and surface the latter.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("no hardware record for {0}")]
    NotFound(String),

    #[error("failed to read record at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed hardware record: {0}")]
    Malformed(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

fn default_lease_secs() -> u32 {
    86400
}

/// One classless static route (option 121).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StaticRoute {
    pub destination: Ipv4Net,
    pub gateway: Ipv4Addr,
}

/// DHCP addressing data for one host.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DhcpRecord {
    /// Reserved address handed out in reservation mode.
    pub ip: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub default_gateway: Option<Ipv4Addr>,
    pub name_servers: Vec<Ipv4Addr>,
    pub ntp_servers: Vec<Ipv4Addr>,
    pub hostname: Option<String>,
    pub domain_name: Option<String>,
    pub broadcast_address: Option<Ipv4Addr>,
    pub lease_time_secs: u32,
    pub domain_search: Vec<String>,
    pub static_routes: Vec<StaticRoute>,
    /// Option 66 override. Setting this (or `bootfile_name`) opts the host
    /// out of all computed netboot behavior.
    pub tftp_server_name: Option<String>,
    /// Option 67 override.
    pub bootfile_name: Option<String>,
    pub vlan_id: Option<u16>,
}

impl Default for DhcpRecord {
    fn default() -> Self {
        Self {
            ip: None,
            subnet_mask: None,
            default_gateway: None,
            name_servers: Vec::new(),
            ntp_servers: Vec::new(),
            hostname: None,
            domain_name: None,
            broadcast_address: None,
            lease_time_secs: default_lease_secs(),
            domain_search: Vec::new(),
            static_routes: Vec::new(),
            tftp_server_name: None,
            bootfile_name: None,
            vlan_id: None,
        }
    }
}

/// Netboot data for one host.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetbootRecord {
    pub allow_netboot: bool,
    /// Per-host iPXE script URL, replacing the engine's own script endpoint.
    pub ipxe_script_url: Option<String>,
    /// Per-host iPXE binary name, replacing the architecture-derived choice.
    pub ipxe_binary: Option<String>,
    /// Per-host base URL for the installer kernel and initrd.
    pub osie_url: Option<String>,
    /// Per-host upstream ISO URL.
    pub iso_url: Option<String>,
    /// Facility string, also used to derive console kernel arguments.
    pub facility: Option<String>,
    /// PXELINUX configuration template served over TFTP when present.
    pub pxelinux_template: Option<String>,
}

/// A host as the backend knows it. Read-only to the engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HardwareRecord {
    pub dhcp: DhcpRecord,
    pub netboot: NetbootRecord,
}

impl HardwareRecord {
    /// Whether the operator opted this host out of computed netboot options
    /// by pinning option 66/67 directly.
    pub fn has_dhcp_only_override(&self) -> bool {
        self.dhcp
            .tftp_server_name
            .as_deref()
            .is_some_and(|s| !s.is_empty())
            || self
                .dhcp
                .bootfile_name
                .as_deref()
                .is_some_and(|s| !s.is_empty())
    }
}

/// Read-only source of hardware records.
///
/// Both methods must be safe for concurrent calls; the engine issues them
/// from many tasks at once and trusts the context deadline it runs under.
#[async_trait]
pub trait BackendReader: Send + Sync {
    async fn get_by_mac(&self, mac: MacAddr6) -> Result<HardwareRecord, BackendError>;
    async fn get_by_ip(&self, ip: IpAddr) -> Result<HardwareRecord, BackendError>;
}
