//! DHCP reply construction.
//!
//! One handler, three personalities: a reservation server that answers with
//! real addressing data, a proxyDHCP server that only supplies boot options,
//! and an auto-proxy variant that answers any netboot-eligible client even
//! without a hardware record.
//!
//! The handler is stateless. A client's chainload stage is read out of
//! option 77 on every packet, and the boot file resolver advances it by
//! handing back a different boot file each time.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::sync::Arc;

use dhcproto::v4::{Decodable, Decoder, DhcpOption, Message, MessageType, Opcode, OptionCode};
use hickory_proto::rr::Name;
use url::Url;

use crate::backend::{BackendReader, DhcpRecord, HardwareRecord, NetbootRecord};
use crate::error::DhcpError;

use super::bootfile::{self, BootParams, MacFormat};
use super::classify::{classify, Arch, ArchMap, ClientInfo};

/// DHCP handler personality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Reservation,
    Proxy,
    AutoProxy,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reservation" => Ok(Self::Reservation),
            "proxy" => Ok(Self::Proxy),
            "auto-proxy" | "autoproxy" => Ok(Self::AutoProxy),
            other => Err(format!("unknown DHCP mode: {other}")),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reservation => write!(f, "reservation"),
            Self::Proxy => write!(f, "proxy"),
            Self::AutoProxy => write!(f, "auto-proxy"),
        }
    }
}

/// One received datagram plus its transport metadata.
#[derive(Debug, Clone)]
pub struct Packet {
    pub peer: SocketAddr,
    pub payload: Vec<u8>,
    /// Interface the datagram arrived on, for logging.
    pub interface: Option<String>,
}

/// A reply ready to be written by the server loop.
#[derive(Debug)]
pub struct Reply {
    pub message: Message,
    pub dest: SocketAddr,
}

pub struct DhcpHandler {
    pub mode: Mode,
    pub backend: Arc<dyn BackendReader>,
    /// This server's address: server identifier (option 54) and the default
    /// `siaddr` before boot file resolution picks its own.
    pub ip_addr: Ipv4Addr,
    /// Advertised as option 7 in reservation replies.
    pub syslog_ip: Option<Ipv4Addr>,
    pub tftp_addr: SocketAddrV4,
    pub http_binary_url: Url,
    /// Base URL of the iPXE script endpoint; `auto.ipxe` (and optionally the
    /// MAC) is appended per client.
    pub script_base_url: Url,
    pub inject_mac_into_script: bool,
    pub mac_format: MacFormat,
    /// `siaddr` fallback when a URL host is not a literal IP.
    pub public_ip: Ipv4Addr,
    pub custom_user_class: Option<String>,
    /// Kill switch for all computed netboot options.
    pub enable_netboot: bool,
    pub arch_map: ArchMap,
}

impl DhcpHandler {
    /// Handle one datagram: decode, classify, consult the backend, build the
    /// reply. Packets that should not be answered come back as
    /// [`DhcpError::Ignore`].
    pub async fn handle(&self, pkt: &Packet) -> Result<Reply, DhcpError> {
        let msg = Message::decode(&mut Decoder::new(&pkt.payload))
            .map_err(|e| DhcpError::Parse(e.to_string()))?;

        if msg.opcode() != Opcode::BootRequest {
            return Err(DhcpError::ignore("not a BOOTREQUEST"));
        }

        let reply_type = match msg.opts().msg_type() {
            Some(MessageType::Discover) => MessageType::Offer,
            Some(MessageType::Request) => MessageType::Ack,
            Some(other) => {
                return Err(DhcpError::Ignore(format!(
                    "unhandled message type {other:?}"
                )))
            }
            None => return Err(DhcpError::Parse("option 53 missing".to_string())),
        };

        let client = classify(&msg, &self.arch_map);

        if self.mode != Mode::Reservation {
            if let Some(reason) = &client.not_netboot_reason {
                return Err(DhcpError::Ignore(format!("not a netboot client: {reason}")));
            }
        }

        let record = match self.backend.get_by_mac(client.mac).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() && self.mode == Mode::AutoProxy => {
                tracing::debug!(mac = %client.mac, "no record, synthesizing for auto-proxy");
                synthesized_record()
            }
            Err(e) => return Err(e.into()),
        };

        if self.mode != Mode::Reservation && !record.netboot.allow_netboot {
            return Err(DhcpError::ignore("netboot not allowed for host"));
        }

        let reply = self.build_reply(&msg, reply_type, &client, &record)?;
        Ok(Reply {
            dest: reply_dest(&msg, pkt.peer),
            message: reply,
        })
    }

    fn build_reply(
        &self,
        req: &Message,
        reply_type: MessageType,
        client: &ClientInfo,
        record: &HardwareRecord,
    ) -> Result<Message, DhcpError> {
        let mut reply = Message::default();
        reply
            .set_opcode(Opcode::BootReply)
            .set_htype(req.htype())
            .set_xid(req.xid())
            .set_flags(req.flags())
            .set_giaddr(req.giaddr())
            .set_chaddr(req.chaddr())
            .set_siaddr(self.ip_addr);

        reply.opts_mut().insert(DhcpOption::MessageType(reply_type));
        reply
            .opts_mut()
            .insert(DhcpOption::ServerIdentifier(self.ip_addr));

        if self.mode == Mode::Reservation {
            let ip = record
                .dhcp
                .ip
                .ok_or_else(|| DhcpError::ignore("no address reservation for host"))?;
            reply.set_yiaddr(ip);
            self.set_ip_level_opts(&mut reply, req, &record.dhcp);
        }

        if record.has_dhcp_only_override() {
            // The operator pinned option 66/67 directly: no option 43, no
            // computed boot file.
            if let Some(name) = non_empty(&record.dhcp.bootfile_name) {
                reply.set_fname_str(name);
                reply
                    .opts_mut()
                    .insert(DhcpOption::BootfileName(name.as_bytes().to_vec()));
            }
            if let Some(server) = non_empty(&record.dhcp.tftp_server_name) {
                reply
                    .opts_mut()
                    .insert(DhcpOption::TFTPServerName(server.as_bytes().to_vec()));
            }
            return Ok(reply);
        }

        let netboot_wanted = self.enable_netboot
            && record.netboot.allow_netboot
            && client.not_netboot_reason.is_none();
        if netboot_wanted {
            self.set_netboot_opts(&mut reply, client, &record.netboot);
        }

        Ok(reply)
    }

    /// Addressing options for reservation replies. Option 55 is respected
    /// for the optional set; subnet mask, lease time and server identifier
    /// always go out.
    fn set_ip_level_opts(&self, reply: &mut Message, req: &Message, dhcp: &DhcpRecord) {
        let prl: Option<Vec<OptionCode>> = match req.opts().get(OptionCode::ParameterRequestList) {
            Some(DhcpOption::ParameterRequestList(list)) => Some(list.clone()),
            _ => None,
        };
        let wanted = |code: OptionCode| prl.as_ref().is_none_or(|l| l.contains(&code));

        let opts = reply.opts_mut();

        if let Some(mask) = dhcp.subnet_mask {
            opts.insert(DhcpOption::SubnetMask(mask));
        }
        opts.insert(DhcpOption::AddressLeaseTime(dhcp.lease_time_secs));

        if let Some(gw) = dhcp.default_gateway {
            if wanted(OptionCode::Router) {
                opts.insert(DhcpOption::Router(vec![gw]));
            }
        }
        if !dhcp.name_servers.is_empty() && wanted(OptionCode::DomainNameServer) {
            opts.insert(DhcpOption::DomainNameServer(dhcp.name_servers.clone()));
        }
        if let Some(ip) = self.syslog_ip {
            if wanted(OptionCode::LogServer) {
                opts.insert(DhcpOption::LogServer(vec![ip]));
            }
        }
        if let Some(hostname) = non_empty(&dhcp.hostname) {
            if wanted(OptionCode::Hostname) {
                opts.insert(DhcpOption::Hostname(hostname.to_string()));
            }
        }
        if let Some(domain) = non_empty(&dhcp.domain_name) {
            if wanted(OptionCode::DomainName) {
                opts.insert(DhcpOption::DomainName(domain.to_string()));
            }
        }
        if let Some(bcast) = dhcp.broadcast_address {
            if wanted(OptionCode::BroadcastAddr) {
                opts.insert(DhcpOption::BroadcastAddr(bcast));
            }
        }
        if !dhcp.ntp_servers.is_empty() && wanted(OptionCode::NtpServers) {
            opts.insert(DhcpOption::NtpServers(dhcp.ntp_servers.clone()));
        }
        if !dhcp.domain_search.is_empty() && wanted(OptionCode::DomainSearch) {
            let names: Vec<Name> = dhcp
                .domain_search
                .iter()
                .filter_map(|s| match Name::from_str(s) {
                    Ok(name) => Some(name),
                    Err(e) => {
                        tracing::warn!("invalid domain search entry {s:?}: {e}");
                        None
                    }
                })
                .collect();
            if !names.is_empty() {
                opts.insert(DhcpOption::DomainSearch(names));
            }
        }
        if !dhcp.static_routes.is_empty() && wanted(OptionCode::ClasslessStaticRoute) {
            let routes = dhcp
                .static_routes
                .iter()
                .map(|r| (r.destination, r.gateway))
                .collect();
            opts.insert(DhcpOption::ClasslessStaticRoute(routes));
        }
    }

    /// The netboot block: computed boot file and `siaddr`, option 43, the
    /// option 60 echo and the option 97 mirror.
    fn set_netboot_opts(&self, reply: &mut Message, client: &ClientInfo, netboot: &NetbootRecord) {
        let mut client = client.clone();
        if let Some(binary) = non_empty(&netboot.ipxe_binary) {
            client.ipxe_binary = binary.to_string();
        }

        if client.ipxe_binary.is_empty() {
            tracing::debug!(mac = %client.mac, arch = %client.arch, "no iPXE binary for architecture");
            return;
        }

        let script_url = self.script_url_for(&client, netboot);
        let params = BootParams {
            tftp_addr: self.tftp_addr,
            http_binary_url: &self.http_binary_url,
            ipxe_script_url: script_url.as_ref(),
            custom_user_class: self.custom_user_class.as_deref(),
            mac_format: self.mac_format,
            public_ip: self.public_ip,
        };
        let (bootfile, next_server) = bootfile::resolve(&client, &params);

        reply.set_siaddr(next_server);
        reply.set_fname_str(bootfile);

        if let Some(client_type) = client.client_type {
            reply.opts_mut().insert(DhcpOption::ClassIdentifier(
                client_type.to_string().into_bytes(),
            ));
        }
        if let Some(machine_id) = &client.machine_id {
            reply
                .opts_mut()
                .insert(DhcpOption::ClientMachineIdentifier(machine_id.clone()));
        }
        reply.opts_mut().insert(DhcpOption::VendorExtensions(
            vendor_opts(client.arch == Arch::RaspberryPi),
        ));
    }

    /// The iPXE script URL for one client: per-host override when the record
    /// has one, otherwise the engine's own script endpoint.
    fn script_url_for(&self, client: &ClientInfo, netboot: &NetbootRecord) -> Option<Url> {
        if let Some(override_url) = non_empty(&netboot.ipxe_script_url) {
            match Url::parse(override_url) {
                Ok(u) => return Some(u),
                Err(e) => {
                    tracing::warn!(mac = %client.mac, "bad ipxe_script_url override: {e}");
                }
            }
        }

        let mut url = self.script_base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            if self.inject_mac_into_script {
                segments.push(&client.mac.to_string().to_lowercase());
            }
            segments.push("auto.ipxe");
        }
        Some(url)
    }
}

/// The record handed to clients that auto-proxy mode answers without any
/// backend entry.
fn synthesized_record() -> HardwareRecord {
    HardwareRecord {
        netboot: NetbootRecord {
            allow_netboot: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !s.is_empty())
}

/// Option 43 payload. Sub-option 6 (discovery control) is always 0x08: skip
/// broadcast discovery and go straight to the boot server. Raspberry Pi
/// firmware additionally wants sub-options 9 and 10 before it will chain.
fn vendor_opts(raspberry_pi: bool) -> Vec<u8> {
    let mut opts = vec![6, 1, 8];
    if raspberry_pi {
        let boot = b"Raspberry Pi Boot";
        opts.push(9);
        opts.push((boot.len() + 3) as u8);
        opts.extend_from_slice(&[0x00, 0x00, boot.len() as u8]);
        opts.extend_from_slice(boot);

        let pxe = b"PXE";
        opts.push(10);
        opts.push((pxe.len() + 3) as u8);
        opts.extend_from_slice(&[0x00, 0x00, pxe.len() as u8]);
        opts.extend_from_slice(pxe);
    }
    opts.push(255);
    opts
}

/// Where the reply goes: through the relay when `giaddr` is set, otherwise
/// back to the peer, falling back to broadcast when the peer has no address
/// yet.
fn reply_dest(req: &Message, peer: SocketAddr) -> SocketAddr {
    let giaddr = req.giaddr();
    if !giaddr.is_unspecified() {
        return SocketAddr::V4(SocketAddrV4::new(giaddr, 67));
    }
    match peer {
        SocketAddr::V4(p) if !p.ip().is_unspecified() => peer,
        _ => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, 68)),
    }
}
