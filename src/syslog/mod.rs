//! UDP syslog receiver.
//!
//! Booting images log their progress over RFC 3164 syslog; this sink turns
//! those datagrams into structured log records so boot failures can be read
//! off the server's own output. The receive loop never blocks on parsing: it
//! drops into a bounded queue and a small worker pool drains it.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

/// How many datagrams may wait for a parser before new ones are dropped.
const QUEUE_DEPTH: usize = 1024;

/// Parser tasks draining the queue.
const WORKERS: usize = 4;

const FACILITIES: [&str; 24] = [
    "kern", "user", "mail", "daemon", "auth", "syslog", "lpr", "news", "uucp", "cron", "authpriv",
    "ftp", "ntp", "audit", "alert", "clock", "local0", "local1", "local2", "local3", "local4",
    "local5", "local6", "local7",
];

const SEVERITIES: [&str; 8] = [
    "EMERG", "ALERT", "CRIT", "ERR", "WARNING", "NOTICE", "INFO", "DEBUG",
];

/// One parsed datagram.
#[derive(Debug, PartialEq, Eq)]
pub struct SyslogMessage {
    pub facility: u8,
    pub severity: u8,
    pub host: Option<String>,
    pub tag: Option<String>,
    pub msg: String,
}

impl SyslogMessage {
    pub fn facility_name(&self) -> &'static str {
        FACILITIES
            .get(self.facility as usize)
            .copied()
            .unwrap_or("unknown")
    }

    pub fn severity_name(&self) -> &'static str {
        SEVERITIES
            .get(self.severity as usize)
            .copied()
            .unwrap_or("unknown")
    }
}

pub struct SyslogServer {
    pub bind_addr: SocketAddr,
    pub metrics: Arc<Metrics>,
}

impl SyslogServer {
    /// Run until cancelled. Cancellation is a clean return.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .with_context(|| format!("failed to bind syslog socket to {}", self.bind_addr))?;
        info!("syslog receiver listening on {}", self.bind_addr);

        let (tx, rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(QUEUE_DEPTH);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..WORKERS {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let item = rx.lock().await.recv().await;
                    match item {
                        Some((data, peer)) => log_datagram(&data, peer),
                        None => return,
                    }
                }
            });
        }

        let mut buf = [0u8; 8192];
        loop {
            let (len, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("syslog receiver stopped");
                    return Ok(());
                }
                res = socket.recv_from(&mut buf) => match res {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("syslog receive error: {e}");
                        continue;
                    }
                },
            };

            // non-blocking hand-off; a slow parser costs messages, not the
            // socket
            if tx.try_send((buf[..len].to_vec(), peer)).is_err() {
                self.metrics.syslog_dropped.inc();
            }
        }
    }
}

fn log_datagram(data: &[u8], peer: SocketAddr) {
    let Some(parsed) = parse(data) else {
        debug!("unparseable syslog datagram from {peer}");
        return;
    };

    // JSON bodies (HookOS services log structured) replace the raw text
    let json: Option<serde_json::Value> = serde_json::from_str(parsed.msg.trim()).ok();

    match (parsed.severity_name(), json) {
        ("DEBUG", Some(json)) => debug!(
            host = %peer.ip(),
            facility = parsed.facility_name(),
            severity = parsed.severity_name(),
            tag = parsed.tag.as_deref().unwrap_or(""),
            msg = %json,
        ),
        ("DEBUG", None) => debug!(
            host = %peer.ip(),
            facility = parsed.facility_name(),
            severity = parsed.severity_name(),
            tag = parsed.tag.as_deref().unwrap_or(""),
            msg = %parsed.msg,
        ),
        (_, Some(json)) => info!(
            host = %peer.ip(),
            facility = parsed.facility_name(),
            severity = parsed.severity_name(),
            tag = parsed.tag.as_deref().unwrap_or(""),
            msg = %json,
        ),
        (_, None) => info!(
            host = %peer.ip(),
            facility = parsed.facility_name(),
            severity = parsed.severity_name(),
            tag = parsed.tag.as_deref().unwrap_or(""),
            msg = %parsed.msg,
        ),
    }
}

/// RFC-3164-ish parse: `<PRI>` then an optional `MMM dd hh:mm:ss` timestamp,
/// an optional host token, and an optional `tag:` before the body. Real
/// boot-time senders are sloppy, so every part after the priority is
/// best-effort.
pub fn parse(data: &[u8]) -> Option<SyslogMessage> {
    let text = std::str::from_utf8(data).ok()?;
    let rest = text.strip_prefix('<')?;
    let (pri, mut rest) = rest.split_once('>')?;
    let pri: u16 = pri.parse().ok()?;
    if pri > 191 {
        return None;
    }
    let facility = (pri / 8) as u8;
    let severity = (pri % 8) as u8;

    // timestamp: "Jan  2 15:04:05 "
    if rest.len() >= 16 && rest.as_bytes().get(3) == Some(&b' ') && looks_like_timestamp(rest) {
        rest = &rest[16..];
    }

    let mut host = None;
    let mut tag = None;
    let mut msg = rest.trim().to_string();

    // "host tag: msg" or "tag: msg"
    if let Some((head, body)) = msg.clone().split_once(": ") {
        if !head.contains(' ') {
            tag = Some(head.to_string());
            msg = body.to_string();
        } else if let Some((h, t)) = head.rsplit_once(' ') {
            if !h.is_empty() && !t.is_empty() && !t.contains(' ') {
                host = Some(h.to_string());
                tag = Some(t.to_string());
                msg = body.to_string();
            }
        }
    }

    Some(SyslogMessage {
        facility,
        severity,
        host,
        tag,
        msg,
    })
}

fn looks_like_timestamp(s: &str) -> bool {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    MONTHS.iter().any(|m| s.starts_with(m))
        && s.as_bytes().get(6) == Some(&b' ')
        && s.as_bytes().get(9) == Some(&b':')
}
