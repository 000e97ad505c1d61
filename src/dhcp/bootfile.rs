//! Next-stage boot file resolution.
//!
//! Given a classified client, decide what goes into the BOOTP `file` field
//! and `siaddr`. The clause order is load-bearing: the Tinkerbell user class
//! is the loop-breaker that stops a chainloaded iPXE from fetching iPXE
//! again, so it must win over everything else.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use macaddr::MacAddr6;
use url::Url;

use super::classify::{ClientInfo, ClientType};

/// Spelled-out user class our own iPXE build reports (set at iPXE build
/// time). Seeing it means the client is already running our build.
pub const TINKERBELL_USER_CLASS: &str = "Tinkerbell";

/// Bootfile handed out when no clause produces anything useful.
pub const NO_SCRIPT_DEFINED: &str = "/no-ipxe-script-defined";

/// How a MAC is rendered when embedded as a URL path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MacFormat {
    Colon,
    Dot,
    Dash,
    /// Hex digits with no separator.
    None,
    /// Omit the path segment entirely.
    #[default]
    Empty,
}

impl MacFormat {
    /// Render the MAC for a URL path, or `None` when the segment is omitted.
    pub fn render(&self, mac: MacAddr6) -> Option<String> {
        let hex: String = mac
            .as_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        match self {
            Self::Colon => Some(join_pairs(&hex, ":")),
            Self::Dash => Some(join_pairs(&hex, "-")),
            Self::Dot => Some(
                [&hex[0..4], &hex[4..8], &hex[8..12]].join("."),
            ),
            Self::None => Some(hex),
            Self::Empty => Option::None,
        }
    }
}

fn join_pairs(hex: &str, sep: &str) -> String {
    hex.as_bytes()
        .chunks(2)
        .map(|c| std::str::from_utf8(c).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(sep)
}

impl FromStr for MacFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "colon" => Ok(Self::Colon),
            "dot" => Ok(Self::Dot),
            "dash" => Ok(Self::Dash),
            "none" => Ok(Self::None),
            "empty" => Ok(Self::Empty),
            other => Err(format!("unknown MAC format: {other}")),
        }
    }
}

/// Server-side inputs to the resolution.
#[derive(Debug, Clone)]
pub struct BootParams<'a> {
    /// TFTP endpoint clients fetch binaries from.
    pub tftp_addr: SocketAddrV4,
    /// HTTP base URL for iPXE binaries.
    pub http_binary_url: &'a Url,
    /// Fully resolved per-host iPXE script URL, when one exists.
    pub ipxe_script_url: Option<&'a Url>,
    /// Deployment-specific user class treated like `Tinkerbell`.
    pub custom_user_class: Option<&'a str>,
    pub mac_format: MacFormat,
    /// Public IP used as `siaddr` when a URL host is not a literal address.
    pub public_ip: Ipv4Addr,
}

/// Compute the BOOTP `file` and `siaddr` for one client.
///
/// The clauses are ordered and mutually exclusive:
/// 1. already-chainloaded client (`Tinkerbell` or custom class) gets the
///    script URL;
/// 2. HTTPBoot firmware gets the HTTP binary URL;
/// 3. stock iPXE gets an absolute `tftp://` URL;
/// 4. first-boot firmware gets the bare binary name for plain TFTP.
pub fn resolve(client: &ClientInfo, params: &BootParams<'_>) -> (String, Ipv4Addr) {
    let user_class = client.user_class.as_deref();
    let is_ours = user_class == Some(TINKERBELL_USER_CLASS)
        || params
            .custom_user_class
            .is_some_and(|c| !c.is_empty() && user_class == Some(c));

    if is_ours {
        return match params.ipxe_script_url {
            Some(u) => (u.to_string(), url_ipv4(u).unwrap_or(params.public_ip)),
            Option::None => (NO_SCRIPT_DEFINED.to_string(), params.public_ip),
        };
    }

    if client.client_type == Some(ClientType::Http) {
        let mut url = params.http_binary_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            if let Some(mac) = params.mac_format.render(client.mac) {
                segments.push(&mac);
            }
            segments.push(&client.ipxe_binary);
        }
        let next = url_ipv4(params.http_binary_url).unwrap_or(params.public_ip);
        return (url.to_string(), next);
    }

    if user_class == Some("iPXE") {
        let mac_segment = params
            .mac_format
            .render(client.mac)
            .map(|m| format!("{m}/"))
            .unwrap_or_default();
        let bootfile = format!(
            "tftp://{}:{}/{}{}",
            params.tftp_addr.ip(),
            params.tftp_addr.port(),
            mac_segment,
            client.ipxe_binary
        );
        return (bootfile, *params.tftp_addr.ip());
    }

    (client.ipxe_binary.clone(), *params.tftp_addr.ip())
}

fn url_ipv4(url: &Url) -> Option<Ipv4Addr> {
    url.host_str().and_then(|h| h.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp::classify::{Arch, ClientInfo};

    fn client(user_class: Option<&str>, client_type: Option<ClientType>) -> ClientInfo {
        ClientInfo {
            mac: MacAddr6::new(0x01, 0x02, 0x03, 0x04, 0x05, 0x06),
            arch: Arch::X86Bios,
            user_class: user_class.map(String::from),
            client_type,
            not_netboot_reason: Option::None,
            machine_id: Option::None,
            ipxe_binary: "undionly.kpxe".to_string(),
        }
    }

    fn params<'a>(binary_url: &'a Url, script_url: Option<&'a Url>) -> BootParams<'a> {
        BootParams {
            tftp_addr: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 69),
            http_binary_url: binary_url,
            ipxe_script_url: script_url,
            custom_user_class: Option::None,
            mac_format: MacFormat::Empty,
            public_ip: Ipv4Addr::new(192, 0, 2, 1),
        }
    }

    #[test]
    fn tinkerbell_class_gets_the_script_url() {
        let binary_url = Url::parse("http://localhost:8181/ipxe").unwrap();
        let script_url = Url::parse("http://localhost:8181/auto.ipxe").unwrap();
        let c = client(Some("Tinkerbell"), Some(ClientType::Pxe));

        let (bootfile, next) = resolve(&c, &params(&binary_url, Some(&script_url)));
        assert_eq!(bootfile, "http://localhost:8181/auto.ipxe");
        assert_eq!(next, Ipv4Addr::new(127, 0, 0, 1));
    }

    #[test]
    fn custom_user_class_behaves_like_tinkerbell() {
        let binary_url = Url::parse("http://localhost:8181/ipxe").unwrap();
        let script_url = Url::parse("http://localhost:8181/auto.ipxe").unwrap();
        let c = client(Some("acme-boot"), Some(ClientType::Pxe));

        let mut p = params(&binary_url, Some(&script_url));
        p.custom_user_class = Some("acme-boot");
        let (bootfile, _) = resolve(&c, &p);
        assert_eq!(bootfile, "http://localhost:8181/auto.ipxe");
    }

    #[test]
    fn missing_script_url_yields_sentinel() {
        let binary_url = Url::parse("http://localhost:8181/ipxe").unwrap();
        let c = client(Some("Tinkerbell"), Some(ClientType::Pxe));

        let (bootfile, next) = resolve(&c, &params(&binary_url, Option::None));
        assert_eq!(bootfile, NO_SCRIPT_DEFINED);
        assert_eq!(next, Ipv4Addr::new(192, 0, 2, 1));
    }

    #[test]
    fn http_client_gets_http_url_with_mac_segment() {
        let binary_url = Url::parse("http://localhost:8181/ipxe").unwrap();
        let mut c = client(Option::None, Some(ClientType::Http));
        c.ipxe_binary = "ipxe.efi".to_string();

        let mut p = params(&binary_url, Option::None);
        p.mac_format = MacFormat::Colon;
        let (bootfile, _) = resolve(&c, &p);
        assert_eq!(bootfile, "http://localhost:8181/ipxe/01:02:03:04:05:06/ipxe.efi");
    }

    #[test]
    fn http_client_without_mac_segment_has_no_double_slash() {
        let binary_url = Url::parse("http://localhost:8181/ipxe").unwrap();
        let mut c = client(Option::None, Some(ClientType::Http));
        c.ipxe_binary = "ipxe.efi".to_string();

        let (bootfile, _) = resolve(&c, &params(&binary_url, Option::None));
        assert_eq!(bootfile, "http://localhost:8181/ipxe/ipxe.efi");
    }

    #[test]
    fn http_next_server_falls_back_to_public_ip_for_hostnames() {
        let binary_url = Url::parse("http://boot.example.com/ipxe").unwrap();
        let c = client(Option::None, Some(ClientType::Http));

        let (_, next) = resolve(&c, &params(&binary_url, Option::None));
        assert_eq!(next, Ipv4Addr::new(192, 0, 2, 1));
    }

    #[test]
    fn http_next_server_uses_literal_url_host() {
        let binary_url = Url::parse("http://10.1.2.3:8181/ipxe").unwrap();
        let c = client(Option::None, Some(ClientType::Http));

        let (_, next) = resolve(&c, &params(&binary_url, Option::None));
        assert_eq!(next, Ipv4Addr::new(10, 1, 2, 3));
    }

    #[test]
    fn ipxe_user_class_gets_tftp_url() {
        let binary_url = Url::parse("http://localhost:8181/ipxe").unwrap();
        let c = client(Some("iPXE"), Some(ClientType::Pxe));

        let (bootfile, next) = resolve(&c, &params(&binary_url, Option::None));
        assert_eq!(bootfile, "tftp://127.0.0.1:69/undionly.kpxe");
        assert_eq!(next, Ipv4Addr::new(127, 0, 0, 1));
    }

    #[test]
    fn ipxe_user_class_tftp_url_with_colon_mac() {
        let binary_url = Url::parse("http://localhost:8181/ipxe").unwrap();
        let c = client(Some("iPXE"), Some(ClientType::Pxe));

        let mut p = params(&binary_url, Option::None);
        p.mac_format = MacFormat::Colon;
        let (bootfile, _) = resolve(&c, &p);
        assert_eq!(bootfile, "tftp://127.0.0.1:69/01:02:03:04:05:06/undionly.kpxe");
    }

    #[test]
    fn first_boot_gets_bare_binary_name() {
        let binary_url = Url::parse("http://localhost:8181/ipxe").unwrap();
        let c = client(Option::None, Some(ClientType::Pxe));

        let (bootfile, next) = resolve(&c, &params(&binary_url, Option::None));
        assert_eq!(bootfile, "undionly.kpxe");
        assert_eq!(next, Ipv4Addr::new(127, 0, 0, 1));
    }

    #[test]
    fn tinkerbell_wins_over_http_client() {
        // Clause ordering: a chainloaded client that also happens to be an
        // HTTPBoot firmware must still get the script URL.
        let binary_url = Url::parse("http://localhost:8181/ipxe").unwrap();
        let script_url = Url::parse("http://localhost:8181/auto.ipxe").unwrap();
        let c = client(Some("Tinkerbell"), Some(ClientType::Http));

        let (bootfile, _) = resolve(&c, &params(&binary_url, Some(&script_url)));
        assert_eq!(bootfile, "http://localhost:8181/auto.ipxe");
    }

    #[test]
    fn http_client_wins_over_ipxe_class() {
        let binary_url = Url::parse("http://localhost:8181/ipxe").unwrap();
        let mut c = client(Some("iPXE"), Some(ClientType::Http));
        c.ipxe_binary = "ipxe.efi".to_string();

        let (bootfile, _) = resolve(&c, &params(&binary_url, Option::None));
        assert!(bootfile.starts_with("http://"));
    }

    #[test]
    fn mac_formats_render_as_expected() {
        let mac = MacAddr6::new(0x01, 0xa2, 0x03, 0xb4, 0x05, 0xc6);
        assert_eq!(MacFormat::Colon.render(mac).unwrap(), "01:a2:03:b4:05:c6");
        assert_eq!(MacFormat::Dash.render(mac).unwrap(), "01-a2-03-b4-05-c6");
        assert_eq!(MacFormat::Dot.render(mac).unwrap(), "01a2.03b4.05c6");
        assert_eq!(MacFormat::None.render(mac).unwrap(), "01a203b405c6");
        assert_eq!(MacFormat::Empty.render(mac), Option::None);
    }
}
