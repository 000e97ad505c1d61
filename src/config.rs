//! Configuration for the provisioning engine.
//!
//! One flat key=value file (see `bootforge.conf` in the repo root for a
//! commented example) with defaults for everything, so a bare `bootforge`
//! starts a working lab setup.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::dhcp::{MacFormat, Mode};

/// Placeholder token expected inside upstream ISO images unless overridden.
pub const DEFAULT_ISO_MAGIC: &str = "464vn90e7rbj08xbwdjejmdf4it17c5zfzjyfhthbh19eij201hjgit021bmpdb9ctrc87x2ymc8e7icu4ffi15x1hah9iyaiz38ckyap8hwx2vt5rm44q4nf6sfi";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config parse error in {path:?} at line {line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct DhcpConfig {
    pub enabled: bool,
    pub mode: Mode,
    pub bind_addr: SocketAddrV4,
    pub bind_interface: Option<String>,
    /// This server's reachable address: option 54, default `siaddr`, and the
    /// fallback when URLs carry hostnames.
    pub ip_for_packet: Ipv4Addr,
    pub syslog_ip: Option<Ipv4Addr>,
    /// TFTP endpoint advertised to clients.
    pub tftp_addr: SocketAddrV4,
    pub http_binary_url: Url,
    pub http_script_url: Url,
    pub inject_mac_into_script_path: bool,
    pub inject_mac_into_binary_path: MacFormat,
    pub enable_netboot_options: bool,
    pub custom_user_class: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TftpConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddrV4,
    pub block_size: usize,
    pub timeout: Duration,
    pub asset_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind_addr: SocketAddr,
    pub retries: u32,
    pub retry_delay: u32,
    pub osie_url: Url,
    pub extra_kernel_args: Vec<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct IsoConfig {
    pub upstream_url: Option<Url>,
    pub magic_string: String,
    pub static_ipam: bool,
}

#[derive(Debug, Clone)]
pub struct SyslogConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct TinkConfig {
    pub grpc_addr: String,
    pub use_tls: bool,
    pub insecure_tls: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of per-host JSON records for the file backend.
    pub backend_dir: PathBuf,
    /// Script fragment patched into the embedded iPXE binaries.
    pub ipxe_patch: String,
    pub dhcp: DhcpConfig,
    pub tftp: TftpConfig,
    pub http: HttpConfig,
    pub iso: IsoConfig,
    pub syslog: SyslogConfig,
    pub tink: TinkConfig,
}

impl Default for Config {
    fn default() -> Self {
        let localhost = Ipv4Addr::new(127, 0, 0, 1);
        Self {
            backend_dir: PathBuf::from("/var/lib/bootforge/hardware"),
            ipxe_patch: String::new(),
            dhcp: DhcpConfig {
                enabled: true,
                mode: Mode::Reservation,
                bind_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 67),
                bind_interface: None,
                ip_for_packet: localhost,
                syslog_ip: Some(localhost),
                tftp_addr: SocketAddrV4::new(localhost, 69),
                http_binary_url: Url::parse("http://127.0.0.1:8181/ipxe")
                    .expect("default URL is valid"),
                http_script_url: Url::parse("http://127.0.0.1:8181")
                    .expect("default URL is valid"),
                inject_mac_into_script_path: true,
                inject_mac_into_binary_path: MacFormat::Empty,
                enable_netboot_options: true,
                custom_user_class: None,
            },
            tftp: TftpConfig {
                enabled: true,
                bind_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 69),
                block_size: 1468,
                timeout: Duration::from_secs(10),
                asset_dir: None,
            },
            http: HttpConfig {
                bind_addr: "0.0.0.0:8181".parse().expect("default addr is valid"),
                retries: 0,
                retry_delay: 2,
                osie_url: Url::parse("http://127.0.0.1:8787").expect("default URL is valid"),
                extra_kernel_args: Vec::new(),
                tls_cert: None,
                tls_key: None,
            },
            iso: IsoConfig {
                upstream_url: None,
                magic_string: DEFAULT_ISO_MAGIC.to_string(),
                static_ipam: false,
            },
            syslog: SyslogConfig {
                enabled: true,
                bind_addr: "0.0.0.0:514".parse().expect("default addr is valid"),
            },
            tink: TinkConfig {
                grpc_addr: "127.0.0.1:42113".to_string(),
                use_tls: false,
                insecure_tls: false,
            },
        }
    }
}

impl Config {
    /// Load configuration from file. A missing file is the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("config file not found at {path:?}, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = parse_key_value(line).ok_or_else(|| ConfigError::Parse {
                path: path.to_path_buf(),
                line: line_num + 1,
                message: format!("invalid line format: {line}"),
            })?;

            let err = |message: String| ConfigError::Parse {
                path: path.to_path_buf(),
                line: line_num + 1,
                message,
            };

            match key {
                "backend_dir" => config.backend_dir = PathBuf::from(value),
                "ipxe_patch" => config.ipxe_patch = value.to_string(),

                "dhcp_enabled" => config.dhcp.enabled = parse_bool(value).map_err(err)?,
                "dhcp_mode" => config.dhcp.mode = Mode::from_str(value).map_err(err)?,
                "dhcp_bind_addr" => {
                    config.dhcp.bind_addr = value
                        .parse()
                        .map_err(|_| err(format!("invalid socket address: {value}")))?
                }
                "dhcp_bind_interface" => {
                    config.dhcp.bind_interface = Some(value.to_string()).filter(|s| !s.is_empty())
                }
                "dhcp_ip_for_packet" => {
                    config.dhcp.ip_for_packet = value
                        .parse()
                        .map_err(|_| err(format!("invalid IPv4 address: {value}")))?
                }
                "dhcp_syslog_ip" => {
                    config.dhcp.syslog_ip = Some(
                        value
                            .parse()
                            .map_err(|_| err(format!("invalid IPv4 address: {value}")))?,
                    )
                }
                "dhcp_tftp_addr" => {
                    config.dhcp.tftp_addr = value
                        .parse()
                        .map_err(|_| err(format!("invalid socket address: {value}")))?
                }
                "dhcp_http_binary_url" => {
                    config.dhcp.http_binary_url =
                        Url::parse(value).map_err(|e| err(format!("invalid URL: {e}")))?
                }
                "dhcp_http_script_url" => {
                    config.dhcp.http_script_url =
                        Url::parse(value).map_err(|e| err(format!("invalid URL: {e}")))?
                }
                "dhcp_inject_mac_into_script_path" => {
                    config.dhcp.inject_mac_into_script_path = parse_bool(value).map_err(err)?
                }
                "dhcp_inject_mac_into_binary_path" => {
                    config.dhcp.inject_mac_into_binary_path =
                        MacFormat::from_str(value).map_err(err)?
                }
                "dhcp_enable_netboot_options" => {
                    config.dhcp.enable_netboot_options = parse_bool(value).map_err(err)?
                }
                "dhcp_custom_user_class" => {
                    config.dhcp.custom_user_class =
                        Some(value.to_string()).filter(|s| !s.is_empty())
                }

                "tftp_enabled" => config.tftp.enabled = parse_bool(value).map_err(err)?,
                "tftp_bind_addr" => {
                    config.tftp.bind_addr = value
                        .parse()
                        .map_err(|_| err(format!("invalid socket address: {value}")))?
                }
                "tftp_block_size" => {
                    config.tftp.block_size = value
                        .parse()
                        .map_err(|_| err(format!("invalid block size: {value}")))?
                }
                "tftp_timeout_secs" => {
                    let secs: u64 = value
                        .parse()
                        .map_err(|_| err(format!("invalid timeout: {value}")))?;
                    config.tftp.timeout = Duration::from_secs(secs);
                }
                "tftp_asset_dir" => {
                    config.tftp.asset_dir = Some(PathBuf::from(value)).filter(|p| !p.as_os_str().is_empty())
                }

                "http_bind_addr" => {
                    config.http.bind_addr = value
                        .parse()
                        .map_err(|_| err(format!("invalid socket address: {value}")))?
                }
                "http_retries" => {
                    config.http.retries = value
                        .parse()
                        .map_err(|_| err(format!("invalid retry count: {value}")))?
                }
                "http_retry_delay" => {
                    config.http.retry_delay = value
                        .parse()
                        .map_err(|_| err(format!("invalid retry delay: {value}")))?
                }
                "http_osie_url" => {
                    config.http.osie_url =
                        Url::parse(value).map_err(|e| err(format!("invalid URL: {e}")))?
                }
                "http_extra_kernel_args" => {
                    config.http.extra_kernel_args =
                        value.split_whitespace().map(String::from).collect()
                }
                "http_tls_cert" => config.http.tls_cert = Some(PathBuf::from(value)),
                "http_tls_key" => config.http.tls_key = Some(PathBuf::from(value)),

                "iso_upstream_url" => {
                    config.iso.upstream_url =
                        Some(Url::parse(value).map_err(|e| err(format!("invalid URL: {e}")))?)
                }
                "iso_magic_string" => config.iso.magic_string = value.to_string(),
                "iso_static_ipam" => config.iso.static_ipam = parse_bool(value).map_err(err)?,

                "syslog_enabled" => config.syslog.enabled = parse_bool(value).map_err(err)?,
                "syslog_bind_addr" => {
                    config.syslog.bind_addr = value
                        .parse()
                        .map_err(|_| err(format!("invalid socket address: {value}")))?
                }

                "tink_grpc_addr" => config.tink.grpc_addr = value.to_string(),
                "tink_use_tls" => config.tink.use_tls = parse_bool(value).map_err(err)?,
                "tink_insecure_tls" => config.tink.insecure_tls = parse_bool(value).map_err(err)?,

                _ => {
                    tracing::warn!("unknown config key '{key}' at line {}", line_num + 1);
                }
            }
        }

        Ok(config)
    }
}

/// Parse a key=value line.
fn parse_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => Err(format!("invalid boolean: {other}")),
    }
}
