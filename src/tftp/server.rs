//! TFTP server implementation.
//!
//! RFC 1350 reads with RFC 2347/2348/2349 option negotiation, in single-port
//! mode: every packet of every transfer flows through the listening socket.
//! Many firmware TFTP stacks cannot follow a transfer to an ephemeral port,
//! so the usual server-chosen-TID scheme is off the table. Writes are always
//! denied.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use macaddr::MacAddr6;
use minijinja::context;
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendReader;
use crate::binary::{canonical_name, Binaries};
use crate::metrics::Metrics;
use crate::template;

const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERROR: u16 = 5;
const OPCODE_OACK: u16 = 6;

const ERROR_FILE_NOT_FOUND: u16 = 1;
const ERROR_ACCESS_VIOLATION: u16 = 2;

const DEFAULT_BLOCK_SIZE: usize = 512;
const MAX_BLOCK_SIZE: usize = 65464;
const MAX_RETRIES: u32 = 5;

/// ACK/ERROR events routed from the receive loop to a transfer task.
#[derive(Debug)]
enum PeerEvent {
    Ack(u16),
    Error(u16, String),
}

type TransferMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<PeerEvent>>>>;

/// What a read request resolves to.
enum Content {
    Mem(Vec<u8>),
    File(tokio::fs::File, u64),
}

impl Content {
    fn size(&self) -> u64 {
        match self {
            Self::Mem(bytes) => bytes.len() as u64,
            Self::File(_, len) => *len,
        }
    }
}

pub struct TftpServer {
    pub bind_addr: SocketAddrV4,
    pub binaries: Arc<Binaries>,
    pub backend: Arc<dyn BackendReader>,
    /// On-disk fallback for files that are neither embedded binaries nor
    /// backend templates.
    pub asset_dir: Option<PathBuf>,
    /// Ceiling for negotiated block sizes.
    pub block_size: usize,
    /// Per-block retransmit timeout.
    pub timeout: Duration,
    pub metrics: Arc<Metrics>,
}

impl TftpServer {
    /// Run until cancelled. Cancellation is a clean return.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let socket = Arc::new(
            UdpSocket::bind(self.bind_addr)
                .await
                .with_context(|| format!("failed to bind TFTP socket to {}", self.bind_addr))?,
        );
        info!("TFTP server listening on {}", self.bind_addr);

        let server = Arc::new(self);
        let transfers: TransferMap = Arc::new(Mutex::new(HashMap::new()));
        let mut buf = [0u8; 65536];

        loop {
            let (len, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("TFTP server stopped");
                    return Ok(());
                }
                res = socket.recv_from(&mut buf) => match res {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("TFTP receive error: {e}");
                        continue;
                    }
                },
            };
            if len < 4 {
                continue;
            }

            let opcode = u16::from_be_bytes([buf[0], buf[1]]);
            match opcode {
                OPCODE_RRQ => {
                    server
                        .clone()
                        .start_transfer(&buf[2..len], peer, Arc::clone(&socket), Arc::clone(&transfers));
                }
                OPCODE_WRQ => {
                    warn!("TFTP write request from {peer} denied");
                    server.metrics.tftp_transfers.with_label_values(&["denied"]).inc();
                    send_error(&socket, peer, ERROR_ACCESS_VIOLATION, "writes not supported").await;
                }
                OPCODE_ACK if len >= 4 => {
                    let block = u16::from_be_bytes([buf[2], buf[3]]);
                    route_event(&transfers, peer, PeerEvent::Ack(block));
                }
                OPCODE_ERROR if len >= 4 => {
                    let code = u16::from_be_bytes([buf[2], buf[3]]);
                    let msg = String::from_utf8_lossy(&buf[4..len])
                        .trim_end_matches('\0')
                        .to_string();
                    route_event(&transfers, peer, PeerEvent::Error(code, msg));
                }
                _ => {
                    debug!("TFTP: unexpected opcode {opcode} from {peer}");
                }
            }
        }
    }

    /// Parse a read request and spawn its transfer task.
    fn start_transfer(
        self: Arc<Self>,
        request: &[u8],
        peer: SocketAddr,
        socket: Arc<UdpSocket>,
        transfers: TransferMap,
    ) {
        let Some((filename, options)) = parse_rrq(request) else {
            return;
        };

        let rx = {
            let mut map = transfers.lock().unwrap_or_else(|e| e.into_inner());
            if map.contains_key(&peer) {
                // Retransmitted RRQ while the transfer is live; the block
                // timeout handles the resend.
                debug!("TFTP: duplicate RRQ from {peer}, transfer in progress");
                return;
            }
            let (tx, rx) = mpsc::channel(8);
            map.insert(peer, tx);
            rx
        };

        tokio::spawn(async move {
            let outcome = self.transfer(&filename, options, peer, &socket, rx).await;
            transfers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&peer);
            match outcome {
                Ok(()) => {
                    self.metrics.tftp_transfers.with_label_values(&["completed"]).inc();
                }
                Err(e) => {
                    debug!("TFTP transfer to {peer} failed: {e}");
                    self.metrics.tftp_transfers.with_label_values(&["error"]).inc();
                }
            }
        });
    }

    async fn transfer(
        &self,
        filename: &str,
        options: HashMap<String, String>,
        peer: SocketAddr,
        socket: &UdpSocket,
        mut events: mpsc::Receiver<PeerEvent>,
    ) -> Result<()> {
        let mut content = match self.resolve(filename, peer).await {
            Some(c) => c,
            None => {
                info!("TFTP: {peer} requested {filename}: not found");
                self.metrics.tftp_transfers.with_label_values(&["not_found"]).inc();
                send_error(socket, peer, ERROR_FILE_NOT_FOUND, "file not found").await;
                return Ok(());
            }
        };

        info!(
            "TFTP: {peer} requesting {filename} ({} bytes)",
            content.size()
        );

        let mut block_size = DEFAULT_BLOCK_SIZE;
        let mut timeout = self.timeout;
        let mut oack: Vec<u8> = Vec::new();

        if let Some(requested) = options.get("blksize").and_then(|v| v.parse::<usize>().ok()) {
            block_size = requested.clamp(8, MAX_BLOCK_SIZE).min(self.block_size);
            oack.extend_from_slice(b"blksize\0");
            oack.extend_from_slice(block_size.to_string().as_bytes());
            oack.push(0);
        }
        if let Some(requested) = options.get("timeout").and_then(|v| v.parse::<u64>().ok()) {
            if (1..=255).contains(&requested) {
                timeout = Duration::from_secs(requested);
                oack.extend_from_slice(b"timeout\0");
                oack.extend_from_slice(requested.to_string().as_bytes());
                oack.push(0);
            }
        }
        if options.contains_key("tsize") {
            oack.extend_from_slice(b"tsize\0");
            oack.extend_from_slice(content.size().to_string().as_bytes());
            oack.push(0);
        }

        if !oack.is_empty() {
            let mut pkt = OPCODE_OACK.to_be_bytes().to_vec();
            pkt.extend_from_slice(&oack);
            send_with_retry(socket, peer, &pkt, 0, &mut events, timeout).await?;
        }

        let mut block_num: u16 = 1;
        let mut buf = vec![0u8; block_size];
        loop {
            let n = read_block(&mut content, &mut buf).await?;

            let mut pkt = Vec::with_capacity(4 + n);
            pkt.extend_from_slice(&OPCODE_DATA.to_be_bytes());
            pkt.extend_from_slice(&block_num.to_be_bytes());
            pkt.extend_from_slice(&buf[..n]);
            send_with_retry(socket, peer, &pkt, block_num, &mut events, timeout).await?;

            if n < block_size {
                debug!("TFTP: transfer of {filename} to {peer} complete");
                return Ok(());
            }
            block_num = block_num.wrapping_add(1);
        }
    }

    /// Resolution order: embedded binary, PXELINUX template (by the URL's
    /// MAC when it carries one, then by peer IP), asset directory, not
    /// found.
    async fn resolve(&self, filename: &str, peer: SocketAddr) -> Option<Content> {
        let path = filename.trim_start_matches('/');
        let name = canonical_name(path);

        if let Some(image) = self.binaries.get(name) {
            return Some(Content::Mem(image));
        }

        let mac = pxelinux_mac(path);
        if let Some(mac) = mac {
            match self.backend.get_by_mac(mac).await {
                Ok(record) => {
                    if let Some(tmpl) = record.netboot.pxelinux_template.as_deref() {
                        return self.render_pxelinux(tmpl, Some(mac), &record);
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("TFTP: backend lookup for {mac} failed: {e}"),
            }
        }

        // a MAC record without a template still falls through to peer IP
        match self.backend.get_by_ip(peer.ip()).await {
            Ok(record) => {
                if let Some(tmpl) = record.netboot.pxelinux_template.as_deref() {
                    return self.render_pxelinux(tmpl, mac, &record);
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("TFTP: backend lookup for {} failed: {e}", peer.ip()),
        }

        if let Some(dir) = &self.asset_dir {
            if let Some(resolved) = resolve_asset(dir, path) {
                if let Ok(file) = tokio::fs::File::open(&resolved).await {
                    if let Ok(meta) = file.metadata().await {
                        if meta.is_file() {
                            return Some(Content::File(file, meta.len()));
                        }
                    }
                }
            }
        }

        None
    }

    fn render_pxelinux(
        &self,
        source: &str,
        mac: Option<MacAddr6>,
        record: &crate::backend::HardwareRecord,
    ) -> Option<Content> {
        let ctx = context! {
            mac => mac.map(|m| m.to_string().to_lowercase()),
            hostname => record.dhcp.hostname,
            facility => record.netboot.facility,
            ip => record.dhcp.ip.map(|ip| ip.to_string()),
        };
        match template::render(source, ctx) {
            Ok(rendered) => Some(Content::Mem(rendered.into_bytes())),
            Err(e) => {
                warn!("TFTP: PXELINUX template failed to render: {e}");
                None
            }
        }
    }
}

/// `filename\0mode\0[opt\0value\0]*`
fn parse_rrq(request: &[u8]) -> Option<(String, HashMap<String, String>)> {
    let parts: Vec<&[u8]> = request.split(|&b| b == 0).collect();
    let filename = std::str::from_utf8(*parts.first()?).ok()?.to_string();
    if filename.is_empty() {
        return None;
    }

    let mut options = HashMap::new();
    let mut i = 2;
    while i + 1 < parts.len() {
        if let (Ok(name), Ok(value)) = (
            std::str::from_utf8(parts[i]),
            std::str::from_utf8(parts[i + 1]),
        ) {
            if !name.is_empty() && !value.is_empty() {
                options.insert(name.to_lowercase(), value.to_string());
            }
        }
        i += 2;
    }
    Some((filename, options))
}

/// MAC out of a `pxelinux.cfg/01-aa-bb-cc-dd-ee-ff` request, if that is
/// what this is.
fn pxelinux_mac(path: &str) -> Option<MacAddr6> {
    let rest = path.strip_prefix("pxelinux.cfg/01-")?;
    rest.parse().ok()
}

/// Fill `buf` from the content, short only at the end.
async fn read_block(content: &mut Content, buf: &mut [u8]) -> Result<usize> {
    match content {
        Content::Mem(bytes) => {
            let n = buf.len().min(bytes.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            bytes.drain(..n);
            Ok(n)
        }
        Content::File(file, _) => {
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            Ok(filled)
        }
    }
}

/// Send one packet and wait for the matching ACK, retransmitting up to
/// [`MAX_RETRIES`] times.
async fn send_with_retry(
    socket: &UdpSocket,
    peer: SocketAddr,
    packet: &[u8],
    expect_block: u16,
    events: &mut mpsc::Receiver<PeerEvent>,
    timeout: Duration,
) -> Result<()> {
    let mut retries = 0;
    loop {
        socket.send_to(packet, peer).await?;

        loop {
            match tokio::time::timeout(timeout, events.recv()).await {
                Ok(Some(PeerEvent::Ack(block))) if block == expect_block => return Ok(()),
                Ok(Some(PeerEvent::Ack(_))) => continue, // stale ACK
                Ok(Some(PeerEvent::Error(code, msg))) => {
                    return Err(anyhow!("client error {code}: {msg}"));
                }
                Ok(None) => return Err(anyhow!("transfer channel closed")),
                Err(_) => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(anyhow!("timeout after {MAX_RETRIES} retries"));
                    }
                    debug!("TFTP: retry {retries} for block {expect_block}");
                    break;
                }
            }
        }
    }
}

fn route_event(transfers: &TransferMap, peer: SocketAddr, event: PeerEvent) {
    let tx = {
        let map = transfers.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&peer).cloned()
    };
    if let Some(tx) = tx {
        let _ = tx.try_send(event);
    }
}

async fn send_error(socket: &UdpSocket, peer: SocketAddr, code: u16, message: &str) {
    let mut pkt = Vec::with_capacity(5 + message.len());
    pkt.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
    pkt.extend_from_slice(&code.to_be_bytes());
    pkt.extend_from_slice(message.as_bytes());
    pkt.push(0);
    let _ = socket.send_to(&pkt, peer).await;
}

/// Resolve a requested path inside the asset dir, refusing anything that
/// escapes it.
fn resolve_asset(dir: &Path, path: &str) -> Option<PathBuf> {
    let clean = path.trim_start_matches('/');
    if clean.is_empty() || clean.split('/').any(|seg| seg == "..") {
        return None;
    }
    let candidate = dir.join(clean);
    let canonical = candidate.canonicalize().ok()?;
    let root = dir.canonicalize().ok()?;
    canonical.starts_with(&root).then_some(canonical)
}
