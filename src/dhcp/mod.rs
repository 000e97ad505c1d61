//! DHCP side of the engine: classification, boot file resolution, reply
//! construction and the UDP server loop.

pub mod bootfile;
pub mod classify;
pub mod handler;
pub mod server;

pub use bootfile::MacFormat;
pub use classify::{classify, Arch, ArchMap, ClientInfo, ClientType};
pub use handler::{DhcpHandler, Mode, Packet, Reply};
pub use server::DhcpServer;
