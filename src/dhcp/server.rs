//! DHCP server loop.
//!
//! Owns one UDP socket bound to port 67. A single receive loop hands each
//! datagram to a bounded worker task so a slow backend never blocks the
//! socket. Replies are written back through the same socket, which is bound
//! to the serving interface so the kernel emits them where the broadcast
//! came in.

use std::net::SocketAddrV4;
use std::sync::Arc;

use anyhow::{Context, Result};
use dhcproto::v4::{Encodable, Encoder};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DhcpError;
use crate::metrics::Metrics;

use super::handler::{DhcpHandler, Packet};

/// Upper bound on concurrently handled datagrams.
const MAX_INFLIGHT: usize = 64;

/// Largest datagram we care to read; DHCP messages fit well within this.
const RECV_BUF: usize = 4096;

pub struct DhcpServer {
    handler: Arc<DhcpHandler>,
    bind_addr: SocketAddrV4,
    /// Interface to bind the socket to (`SO_BINDTODEVICE`).
    bind_interface: Option<String>,
    metrics: Arc<Metrics>,
}

impl DhcpServer {
    pub fn new(
        handler: DhcpHandler,
        bind_addr: SocketAddrV4,
        bind_interface: Option<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            bind_addr,
            bind_interface,
            metrics,
        }
    }

    /// Run until the token is cancelled. Cancellation is a clean return, not
    /// an error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let socket = Arc::new(self.create_socket()?);
        info!("DHCP server listening on {}", self.bind_addr);

        let limiter = Arc::new(Semaphore::new(MAX_INFLIGHT));
        let mut buf = [0u8; RECV_BUF];

        loop {
            let (len, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("DHCP server stopped");
                    return Ok(());
                }
                res = socket.recv_from(&mut buf) => match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("DHCP receive error: {e}");
                        continue;
                    }
                },
            };

            let permit = match limiter.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    warn!("DHCP worker pool saturated, dropping packet from {peer}");
                    self.metrics.dhcp_packets.with_label_values(&["dropped"]).inc();
                    continue;
                }
            };

            let pkt = Packet {
                peer,
                payload: buf[..len].to_vec(),
                interface: self.bind_interface.clone(),
            };
            let handler = Arc::clone(&self.handler);
            let metrics = Arc::clone(&self.metrics);
            let socket = Arc::clone(&socket);

            tokio::spawn(async move {
                let _permit = permit;
                let mode = handler.mode.to_string();
                let timer = metrics
                    .dhcp_duration
                    .with_label_values(&[mode.as_str()])
                    .start_timer();
                let outcome = handler.handle(&pkt).await;
                timer.observe_duration();
                match outcome {
                    Ok(reply) => {
                        let mut out = Vec::new();
                        if let Err(e) = reply.message.encode(&mut Encoder::new(&mut out)) {
                            error!("failed to encode DHCP reply: {e}");
                            metrics.dhcp_packets.with_label_values(&["error"]).inc();
                            return;
                        }
                        match socket.send_to(&out, reply.dest).await {
                            Ok(_) => {
                                debug!(peer = %pkt.peer, dest = %reply.dest, "DHCP reply sent");
                                metrics.dhcp_packets.with_label_values(&["replied"]).inc();
                            }
                            Err(e) => {
                                error!("failed to send DHCP reply to {}: {e}", reply.dest);
                                metrics.dhcp_packets.with_label_values(&["error"]).inc();
                            }
                        }
                    }
                    Err(DhcpError::Ignore(reason)) => {
                        debug!(peer = %pkt.peer, "ignoring packet: {reason}");
                        metrics.dhcp_packets.with_label_values(&["ignored"]).inc();
                    }
                    Err(DhcpError::Parse(reason)) => {
                        debug!(peer = %pkt.peer, "unparseable packet: {reason}");
                        metrics
                            .dhcp_packets
                            .with_label_values(&["parse_error"])
                            .inc();
                    }
                    Err(DhcpError::Backend(e)) if e.is_not_found() => {
                        debug!(peer = %pkt.peer, "{e}");
                        metrics.dhcp_packets.with_label_values(&["not_found"]).inc();
                    }
                    Err(DhcpError::Backend(e)) => {
                        error!(peer = %pkt.peer, "backend lookup failed: {e}");
                        metrics.dhcp_packets.with_label_values(&["error"]).inc();
                    }
                }
            });
        }
    }

    /// A broadcast-capable, reuse-addr UDP socket, optionally pinned to one
    /// interface, handed over to tokio in nonblocking mode.
    fn create_socket(&self) -> Result<UdpSocket> {
        use socket2::{Domain, Protocol, Socket, Type};

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("failed to create DHCP socket")?;

        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;

        #[cfg(target_os = "linux")]
        if let Some(iface) = &self.bind_interface {
            socket
                .bind_device(Some(iface.as_bytes()))
                .with_context(|| format!("failed to bind DHCP socket to {iface}"))?;
        }

        socket
            .bind(&self.bind_addr.into())
            .with_context(|| format!("failed to bind DHCP socket to {}", self.bind_addr))?;
        socket.set_nonblocking(true)?;

        UdpSocket::from_std(socket.into()).context("failed to register DHCP socket with tokio")
    }
}
