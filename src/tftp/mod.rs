//! Read-only TFTP server for iPXE binaries and PXELINUX configs.

pub mod server;

pub use server::TftpServer;
