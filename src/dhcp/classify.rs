//! DHCPv4 client classification.
//!
//! [`classify`] is a pure read of one decoded packet: no I/O, never fails.
//! Unknown or missing fields come back empty, and a client with an unknown
//! architecture gets an empty `ipxe_binary`.

use std::collections::HashMap;
use std::fmt;

use dhcproto::v4::{DhcpOption, Message, MessageType, OptionCode};
use macaddr::MacAddr6;

/// Processor architecture codes from DHCP option 93 (RFC 4578 and the IANA
/// extensions for UEFI HTTP boot). Code 41 is what Raspberry Pi firmware
/// reports when it netboots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86Bios,          // 0
    NecPc98,          // 1
    EfiItanium,       // 2
    DecAlpha,         // 3
    ArcX86,           // 4
    IntelLeanClient,  // 5
    EfiIa32,          // 6
    EfiBc,            // 7
    EfiXscale,        // 8
    EfiX8664,         // 9
    EfiArm32,         // 10
    EfiArm64,         // 11
    EfiX86Http,       // 15
    EfiX8664Http,     // 16
    EfiArm32Http,     // 18
    EfiArm64Http,     // 19
    RaspberryPi,      // 41
    Unknown(u16),
}

impl Arch {
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => Self::X86Bios,
            1 => Self::NecPc98,
            2 => Self::EfiItanium,
            3 => Self::DecAlpha,
            4 => Self::ArcX86,
            5 => Self::IntelLeanClient,
            6 => Self::EfiIa32,
            7 => Self::EfiBc,
            8 => Self::EfiXscale,
            9 => Self::EfiX8664,
            10 => Self::EfiArm32,
            11 => Self::EfiArm64,
            15 => Self::EfiX86Http,
            16 => Self::EfiX8664Http,
            18 => Self::EfiArm32Http,
            19 => Self::EfiArm64Http,
            41 => Self::RaspberryPi,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::X86Bios => 0,
            Self::NecPc98 => 1,
            Self::EfiItanium => 2,
            Self::DecAlpha => 3,
            Self::ArcX86 => 4,
            Self::IntelLeanClient => 5,
            Self::EfiIa32 => 6,
            Self::EfiBc => 7,
            Self::EfiXscale => 8,
            Self::EfiX8664 => 9,
            Self::EfiArm32 => 10,
            Self::EfiArm64 => 11,
            Self::EfiX86Http => 15,
            Self::EfiX8664Http => 16,
            Self::EfiArm32Http => 18,
            Self::EfiArm64Http => 19,
            Self::RaspberryPi => 41,
            Self::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown({code})"),
            other => write!(f, "{}", other.code()),
        }
    }
}

/// Mapping from client architecture to the iPXE binary it should chainload.
/// Individual codes can be remapped per deployment.
#[derive(Debug, Clone, Default)]
pub struct ArchMap {
    overrides: HashMap<u16, String>,
}

impl ArchMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, code: u16, binary: impl Into<String>) -> Self {
        self.overrides.insert(code, binary.into());
        self
    }

    /// The binary for an architecture; empty for unknown codes.
    pub fn binary(&self, arch: Arch) -> &str {
        if let Some(name) = self.overrides.get(&arch.code()) {
            return name;
        }
        match arch {
            Arch::X86Bios
            | Arch::NecPc98
            | Arch::EfiItanium
            | Arch::DecAlpha
            | Arch::ArcX86
            | Arch::IntelLeanClient => "undionly.kpxe",
            Arch::EfiIa32 | Arch::EfiBc | Arch::EfiX8664 | Arch::EfiX86Http | Arch::EfiX8664Http => {
                "ipxe.efi"
            }
            Arch::EfiXscale | Arch::EfiArm32 | Arch::EfiArm32Http => "snp.efi",
            Arch::EfiArm64 | Arch::EfiArm64Http | Arch::RaspberryPi => "snp-arm64.efi",
            Arch::Unknown(_) => "",
        }
    }
}

/// Client type taken from the option 60 vendor class prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    Pxe,
    Http,
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pxe => write!(f, "PXEClient"),
            Self::Http => write!(f, "HTTPClient"),
        }
    }
}

/// Everything the engine reads out of one client packet.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub mac: MacAddr6,
    pub arch: Arch,
    /// Option 77. iPXE sets `iPXE`; our own chainloaded build sets
    /// `Tinkerbell` (or the deployment's custom class).
    pub user_class: Option<String>,
    pub client_type: Option<ClientType>,
    /// `None` when the packet passes all netboot eligibility checks,
    /// otherwise the joined reasons it failed.
    pub not_netboot_reason: Option<String>,
    /// Raw option 97, mirrored back in replies.
    pub machine_id: Option<Vec<u8>>,
    /// Architecture-derived binary; empty iff the architecture is unknown.
    pub ipxe_binary: String,
}

impl ClientInfo {
    pub fn is_netboot_client(&self) -> bool {
        self.not_netboot_reason.is_none()
    }
}

/// Raspberry Pi OUI prefixes. Firmware on these boards misreports option 93
/// (a Pi 5 claims Intel x86PC), so the MAC decides the architecture.
const RASPBERRY_PI_OUIS: [[u8; 3]; 5] = [
    [0x28, 0xcd, 0xc1],
    [0xb8, 0x27, 0xeb],
    [0xd8, 0x3a, 0xdd],
    [0xdc, 0xa6, 0x32],
    [0xe4, 0x5f, 0x01],
];

fn is_raspberry_pi(mac: MacAddr6) -> bool {
    let bytes = mac.as_bytes();
    RASPBERRY_PI_OUIS.iter().any(|oui| bytes.starts_with(oui))
}

/// Classify one decoded DHCPv4 packet.
pub fn classify(msg: &Message, arch_map: &ArchMap) -> ClientInfo {
    let chaddr = msg.chaddr();
    let mac = if chaddr.len() >= 6 {
        MacAddr6::new(
            chaddr[0], chaddr[1], chaddr[2], chaddr[3], chaddr[4], chaddr[5],
        )
    } else {
        MacAddr6::nil()
    };

    let opts = msg.opts();

    let reported_arch = match opts.get(OptionCode::ClientSystemArchitecture) {
        Some(DhcpOption::ClientSystemArchitecture(a)) => Some(u16::from(*a)),
        _ => None,
    };

    let arch = if is_raspberry_pi(mac) {
        Arch::RaspberryPi
    } else {
        Arch::from_code(reported_arch.unwrap_or(u16::MAX))
    };

    let user_class = match opts.get(OptionCode::UserClass) {
        Some(DhcpOption::UserClass(bytes)) => {
            Some(String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string())
        }
        _ => None,
    };

    let vendor_class = match opts.get(OptionCode::ClassIdentifier) {
        Some(DhcpOption::ClassIdentifier(bytes)) => Some(String::from_utf8_lossy(bytes).to_string()),
        _ => None,
    };
    let client_type = vendor_class.as_deref().and_then(|vc| {
        if vc.starts_with("PXEClient") {
            Some(ClientType::Pxe)
        } else if vc.starts_with("HTTPClient") {
            Some(ClientType::Http)
        } else {
            None
        }
    });

    let machine_id = match opts.get(OptionCode::ClientMachineIdentifier) {
        Some(DhcpOption::ClientMachineIdentifier(bytes)) => Some(bytes.clone()),
        _ => None,
    };

    let not_netboot_reason = netboot_ineligible_reason(
        opts.msg_type(),
        client_type,
        reported_arch.is_some(),
        opts.get(OptionCode::ClientNetworkInterface).is_some(),
        machine_id.as_deref(),
    );

    let ipxe_binary = arch_map.binary(arch).to_string();

    ClientInfo {
        mac,
        arch,
        user_class,
        client_type,
        not_netboot_reason,
        machine_id,
        ipxe_binary,
    }
}

/// The five netboot eligibility checks. Returns `None` when all pass,
/// otherwise every failed check joined into one reason string.
fn netboot_ineligible_reason(
    msg_type: Option<MessageType>,
    client_type: Option<ClientType>,
    has_arch: bool,
    has_ndi: bool,
    machine_id: Option<&[u8]>,
) -> Option<String> {
    let mut reasons = Vec::new();

    match msg_type {
        Some(MessageType::Discover) | Some(MessageType::Request) => {}
        _ => reasons.push("message type is not DISCOVER or REQUEST".to_string()),
    }
    if client_type.is_none() {
        reasons.push("option 60 is not set to PXEClient or HTTPClient".to_string());
    }
    if !has_arch {
        reasons.push("option 93 is not set".to_string());
    }
    if !has_ndi {
        reasons.push("option 94 is not set".to_string());
    }
    match machine_id {
        None => {}
        Some(id) if id.is_empty() => {}
        Some(id) if id.len() == 17 && id[0] == 0 => {}
        Some(id) => reasons.push(format!(
            "option 97 is {} bytes and does not begin with 0x00",
            id.len()
        )),
    }

    if reasons.is_empty() {
        None
    } else {
        Some(reasons.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp::testutil::TestPacket;

    #[test]
    fn bios_pxe_client_maps_to_undionly() {
        let msg = TestPacket::discover([0x01, 0x02, 0x03, 0x04, 0x05, 0x06])
            .vendor_class("PXEClient:Arch:00000:UNDI:002001")
            .arch(0)
            .ndi()
            .build();

        let info = classify(&msg, &ArchMap::new());
        assert_eq!(info.arch, Arch::X86Bios);
        assert_eq!(info.ipxe_binary, "undionly.kpxe");
        assert_eq!(info.client_type, Some(ClientType::Pxe));
        assert!(info.is_netboot_client(), "{:?}", info.not_netboot_reason);
    }

    #[test]
    fn http_client_maps_to_ipxe_efi() {
        let msg = TestPacket::discover([0x01, 0x02, 0x03, 0x04, 0x05, 0x06])
            .vendor_class("HTTPClient:Arch:00016:UNDI:003001")
            .arch(16)
            .ndi()
            .build();

        let info = classify(&msg, &ArchMap::new());
        assert_eq!(info.arch, Arch::EfiX8664Http);
        assert_eq!(info.ipxe_binary, "ipxe.efi");
        assert_eq!(info.client_type, Some(ClientType::Http));
    }

    #[test]
    fn raspberry_pi_oui_overrides_reported_arch() {
        // A Pi 5 reporting Intel x86PC still gets the arm64 binary.
        let msg = TestPacket::discover([0xdc, 0xa6, 0x32, 0x01, 0x02, 0x03])
            .vendor_class("PXEClient:Arch:00000:UNDI:002001")
            .arch(0)
            .ndi()
            .build();

        let info = classify(&msg, &ArchMap::new());
        assert_eq!(info.arch, Arch::RaspberryPi);
        assert_eq!(info.arch.code(), 41);
        assert_eq!(info.ipxe_binary, "snp-arm64.efi");
    }

    #[test]
    fn arch_41_is_raspberry_pi() {
        let msg = TestPacket::discover([0x00, 0x11, 0x22, 0x33, 0x44, 0x55])
            .vendor_class("PXEClient:Arch:00041:UNDI:002001")
            .arch(41)
            .ndi()
            .build();

        let info = classify(&msg, &ArchMap::new());
        assert_eq!(info.arch, Arch::RaspberryPi);
        assert_eq!(info.ipxe_binary, "snp-arm64.efi");
    }

    #[test]
    fn unknown_arch_has_empty_binary() {
        let msg = TestPacket::discover([0x00, 0x11, 0x22, 0x33, 0x44, 0x55])
            .vendor_class("PXEClient:Arch:09999")
            .arch(9999)
            .ndi()
            .build();

        let info = classify(&msg, &ArchMap::new());
        assert!(matches!(info.arch, Arch::Unknown(9999)));
        assert!(info.ipxe_binary.is_empty());
    }

    #[test]
    fn missing_options_fail_eligibility_with_reasons() {
        let msg = TestPacket::discover([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]).build();

        let info = classify(&msg, &ArchMap::new());
        let reason = info.not_netboot_reason.expect("should be ineligible");
        assert!(reason.contains("option 60"));
        assert!(reason.contains("option 93"));
        assert!(reason.contains("option 94"));
    }

    #[test]
    fn release_is_not_a_netboot_message() {
        let msg = TestPacket::release([0x00, 0x11, 0x22, 0x33, 0x44, 0x55])
            .vendor_class("PXEClient:Arch:00000")
            .arch(0)
            .ndi()
            .build();

        let info = classify(&msg, &ArchMap::new());
        let reason = info.not_netboot_reason.expect("should be ineligible");
        assert!(reason.contains("message type"));
    }

    #[test]
    fn option_97_must_lead_with_zero() {
        let mut guid = vec![0u8; 17];
        guid[0] = 1;
        let msg = TestPacket::discover([0x00, 0x11, 0x22, 0x33, 0x44, 0x55])
            .vendor_class("PXEClient:Arch:00000")
            .arch(0)
            .ndi()
            .machine_id(guid)
            .build();

        let info = classify(&msg, &ArchMap::new());
        assert!(info.not_netboot_reason.unwrap().contains("option 97"));
    }

    #[test]
    fn option_97_with_leading_zero_is_fine() {
        let msg = TestPacket::discover([0x00, 0x11, 0x22, 0x33, 0x44, 0x55])
            .vendor_class("PXEClient:Arch:00000")
            .arch(0)
            .ndi()
            .machine_id(vec![0u8; 17])
            .build();

        let info = classify(&msg, &ArchMap::new());
        assert!(info.is_netboot_client());
        assert_eq!(info.machine_id.unwrap().len(), 17);
    }

    #[test]
    fn user_class_is_extracted() {
        let msg = TestPacket::request([0x00, 0x11, 0x22, 0x33, 0x44, 0x55])
            .vendor_class("PXEClient:Arch:00000")
            .arch(0)
            .ndi()
            .user_class("iPXE")
            .build();

        let info = classify(&msg, &ArchMap::new());
        assert_eq!(info.user_class.as_deref(), Some("iPXE"));
    }

    #[test]
    fn classify_is_deterministic() {
        let msg = TestPacket::discover([0x01, 0x02, 0x03, 0x04, 0x05, 0x06])
            .vendor_class("PXEClient:Arch:00007")
            .arch(7)
            .ndi()
            .build();

        let map = ArchMap::new();
        let a = classify(&msg, &map);
        let b = classify(&msg, &map);
        assert_eq!(a.mac, b.mac);
        assert_eq!(a.arch, b.arch);
        assert_eq!(a.ipxe_binary, b.ipxe_binary);
        assert_eq!(a.not_netboot_reason, b.not_netboot_reason);
    }

    #[test]
    fn arch_map_override_wins() {
        let map = ArchMap::new().with_override(0, "custom.kpxe");
        assert_eq!(map.binary(Arch::X86Bios), "custom.kpxe");
        assert_eq!(map.binary(Arch::EfiBc), "ipxe.efi");
    }
}
