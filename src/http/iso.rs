//! ISO patching reverse proxy.
//!
//! `GET /iso/{mac}/{name}.iso[?sourceISO=<url>]` streams an upstream ISO to
//! the client, rewriting the magic placeholder token baked into the image's
//! kernel command line with this host's parameters. The replacement is
//! space-padded to the token's exact length so the on-disk geometry of the
//! image never changes, and the scan carries `len(magic)-1` bytes between
//! buffers so a token straddling a read boundary is still found. Memory use
//! is constant no matter how large the image is.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use macaddr::MacAddr6;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use url::Url;

use crate::backend::HardwareRecord;
use crate::error::AppError;
use crate::metrics::Metrics;

use super::script;
use super::AppState;

/// Channel depth between the upstream reader and the response body. Two
/// in-flight chunks keep the pipe busy without buffering the image.
const CHANNEL_CAPACITY: usize = 2;

pub struct IsoProxyConfig {
    /// Deployment-wide upstream; hardware records and the `sourceISO` query
    /// parameter take precedence, in that order (query first).
    pub upstream_url: Option<Url>,
    /// The placeholder token baked into the upstream image.
    pub magic: String,
    /// Also bake static addressing (`ipam=`) from the hardware record into
    /// the command line.
    pub static_ipam: bool,
    pub client: reqwest::Client,
}

#[derive(Debug, Deserialize, Default)]
pub struct IsoQuery {
    #[serde(rename = "sourceISO")]
    pub source_iso: Option<String>,
}

pub async fn handle_iso(
    State(state): State<AppState>,
    Path((mac, name)): Path<(String, String)>,
    Query(query): Query<IsoQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if !name.ends_with(".iso") {
        return Err(AppError::BadRequest(format!("{name} is not an ISO path")));
    }
    let mac: MacAddr6 = mac.parse().map_err(|_| AppError::InvalidMac(mac.clone()))?;

    let record = state.backend.get_by_mac(mac).await?;

    let source = query
        .source_iso
        .as_deref()
        .map(Url::parse)
        .transpose()
        .map_err(|e| AppError::BadRequest(format!("bad sourceISO: {e}")))?
        .or_else(|| {
            record
                .netboot
                .iso_url
                .as_deref()
                .filter(|s| !s.is_empty())
                .and_then(|s| match Url::parse(s) {
                    Ok(u) => Some(u),
                    Err(e) => {
                        tracing::warn!(%mac, "bad iso_url in hardware record: {e}");
                        None
                    }
                })
        })
        .or_else(|| state.iso.upstream_url.clone())
        .ok_or_else(|| AppError::BadRequest("no upstream ISO URL".to_string()))?;

    if !matches!(source.scheme(), "http" | "https") {
        return Err(AppError::BadRequest(format!(
            "unsupported upstream scheme {}",
            source.scheme()
        )));
    }

    let replacement = build_replacement(&state, &record, &mac)?;

    // Range requests pass through untouched; ISO mounters live on 206s.
    let mut upstream = state.iso.client.get(source.clone());
    if let Some(range) = headers.get(header::RANGE) {
        upstream = upstream.header(header::RANGE, range);
    }
    let upstream = upstream.send().await?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    tracing::info!(%mac, %source, %status, "proxying ISO");

    let mut response_headers = HeaderMap::new();
    for name in [
        header::CONTENT_TYPE,
        header::CONTENT_LENGTH,
        header::CONTENT_RANGE,
        header::ACCEPT_RANGES,
    ] {
        if let Some(value) = upstream.headers().get(&name) {
            response_headers.insert(name, value.clone());
        }
    }

    // Upstream failures propagate as-is, unpatched.
    let patcher = if status.is_success() {
        Some(StreamPatcher::new(
            state.iso.magic.as_bytes(),
            &replacement,
        ))
    } else {
        None
    };

    let body = stream_body(upstream, patcher, Arc::clone(&state.metrics));
    Ok((status, response_headers, body).into_response())
}

/// The per-host command line destined for the magic region.
fn build_replacement(
    state: &AppState,
    record: &HardwareRecord,
    mac: &MacAddr6,
) -> Result<Vec<u8>, AppError> {
    let worker_id = mac.to_string().to_lowercase();
    let mut cmdline = script::cmdline_for(&state.script, record, &worker_id);
    if state.iso.static_ipam {
        if let Some(ipam) = ipam_arg(record, mac) {
            cmdline.push(' ');
            cmdline.push_str(&ipam);
        }
    }

    let magic_len = state.iso.magic.len();
    if cmdline.len() > magic_len {
        return Err(AppError::BadRequest(format!(
            "command line is {} bytes, the patch region holds {magic_len}",
            cmdline.len()
        )));
    }
    let mut replacement = cmdline.into_bytes();
    replacement.resize(magic_len, b' ');
    Ok(replacement)
}

/// `ipam=<mac>:<vlan>:<ip>:<netmask>:<gateway>:<hostname>:<dns>:<search>:<ntp>`,
/// the static addressing argument HookOS understands.
fn ipam_arg(record: &HardwareRecord, mac: &MacAddr6) -> Option<String> {
    let dhcp = &record.dhcp;
    let ip = dhcp.ip?;
    let fields = [
        mac.to_string().to_lowercase().replace(':', "-"),
        dhcp.vlan_id.map(|v| v.to_string()).unwrap_or_default(),
        ip.to_string(),
        dhcp.subnet_mask.map(|m| m.to_string()).unwrap_or_default(),
        dhcp.default_gateway
            .map(|g| g.to_string())
            .unwrap_or_default(),
        dhcp.hostname.clone().unwrap_or_default(),
        dhcp.name_servers
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(","),
        dhcp.domain_search.join(","),
        dhcp.ntp_servers
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(","),
    ];
    Some(format!("ipam={}", fields.join(":")))
}

fn stream_body(
    upstream: reqwest::Response,
    patcher: Option<StreamPatcher>,
    metrics: Arc<Metrics>,
) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut patcher = patcher;
        let mut stream = upstream.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    metrics.iso_bytes.inc_by(bytes.len() as u64);
                    let out = match patcher.as_mut() {
                        Some(p) => p.process(&bytes),
                        None => bytes,
                    };
                    if !out.is_empty() && tx.send(Ok(out)).await.is_err() {
                        return; // client went away
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(std::io::Error::other(e))).await;
                    return;
                }
            }
        }
        if let Some(mut p) = patcher.take() {
            let tail = p.finish();
            if !tail.is_empty() {
                let _ = tx.send(Ok(tail)).await;
            }
            if p.patched() {
                metrics.iso_patched.inc();
            }
        }
    });

    Body::from_stream(ReceiverStream::new(rx))
}

/// Single-pass scan-and-replace over a byte stream.
///
/// Holds back the last `magic.len() - 1` bytes of each buffer until the next
/// one arrives, so a token split across reads is still matched. Output
/// length always equals input length.
pub struct StreamPatcher {
    magic: Vec<u8>,
    replacement: Vec<u8>,
    carry: BytesMut,
    patched: bool,
}

impl StreamPatcher {
    pub fn new(magic: &[u8], replacement: &[u8]) -> Self {
        debug_assert_eq!(magic.len(), replacement.len());
        Self {
            magic: magic.to_vec(),
            replacement: replacement.to_vec(),
            carry: BytesMut::new(),
            patched: false,
        }
    }

    pub fn patched(&self) -> bool {
        self.patched
    }

    /// Feed one buffer, get the releasable prefix back.
    pub fn process(&mut self, chunk: &[u8]) -> Bytes {
        if self.magic.is_empty() || (self.patched && self.carry.is_empty()) {
            return Bytes::copy_from_slice(chunk);
        }

        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(chunk);

        if !self.patched {
            if let Some(at) = find(&buf, &self.magic) {
                buf[at..at + self.magic.len()].copy_from_slice(&self.replacement);
                self.patched = true;
                return buf.freeze();
            }
        } else {
            return buf.freeze();
        }

        let hold = self.magic.len().saturating_sub(1).min(buf.len());
        let release = buf.len() - hold;
        self.carry = buf.split_off(release);
        buf.freeze()
    }

    /// Flush whatever is still held back.
    pub fn finish(&mut self) -> Bytes {
        std::mem::take(&mut self.carry).freeze()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_patcher(magic: &str, replacement: &str, chunks: &[&[u8]]) -> Vec<u8> {
        let mut padded = replacement.as_bytes().to_vec();
        padded.resize(magic.len(), b' ');
        let mut patcher = StreamPatcher::new(magic.as_bytes(), &padded);

        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(&patcher.process(chunk));
        }
        out.extend_from_slice(&patcher.finish());
        out
    }

    #[test]
    fn patches_magic_inside_one_chunk() {
        let out = run_patcher("MAGICMAGIC", "cmdline", &[b"aaaMAGICMAGICbbb"]);
        assert_eq!(out, b"aaacmdline   bbb");
        assert_eq!(out.len(), b"aaaMAGICMAGICbbb".len());
    }

    #[test]
    fn patches_magic_straddling_chunks() {
        let out = run_patcher("MAGICMAGIC", "cmdline", &[b"aaaMAGIC", b"MAGICbbb"]);
        assert_eq!(out, b"aaacmdline   bbb");
    }

    #[test]
    fn patches_magic_split_across_three_chunks() {
        let out = run_patcher("MAGICMAGIC", "x", &[b"aaMA", b"GICM", b"AGICbb"]);
        assert_eq!(out, b"aax         bb");
    }

    #[test]
    fn stream_without_magic_is_unchanged() {
        let input: Vec<u8> = (0..=255u8).cycle().take(100_000).collect();
        let chunks: Vec<&[u8]> = input.chunks(32 * 1024).collect();
        let out = run_patcher("MAGICMAGIC", "x", &chunks);
        assert_eq!(out, input);
    }

    #[test]
    fn magic_at_the_very_end_is_patched() {
        let out = run_patcher("MAGICMAGIC", "end", &[b"dataMAGIC", b"MAGIC"]);
        assert_eq!(out, b"dataend       ");
    }

    #[test]
    fn replacement_is_space_padded_to_magic_length() {
        let out = run_patcher("0123456789", "ab", &[b"x0123456789y"]);
        assert_eq!(out, b"xab        y");
    }

    #[test]
    fn output_length_matches_input_for_odd_chunk_sizes() {
        let magic = "464vn90e7rbj08xbwdjejmdf4it17c5zfzjyfhthbh19eij201hjgit021bmpdb9ctrc87x2ymc8e7icu4ffi15x1hah9iyaiz38ckyap8hwx2vt5rm44q4nf6sfi";
        let mut input = vec![b'.'; 200_000];
        input[131_072..131_072 + magic.len()].copy_from_slice(magic.as_bytes());

        let chunks: Vec<&[u8]> = input.chunks(7919).collect();
        let out = run_patcher(magic, "console=ttyS0 worker_id=x", &chunks);
        assert_eq!(out.len(), input.len());
        assert!(find(&out, b"console=ttyS0 worker_id=x").is_some());
        assert!(find(&out, magic.as_bytes()).is_none());
    }

    #[test]
    fn ipam_arg_joins_record_fields() {
        let mut record = HardwareRecord::default();
        record.dhcp.ip = Some("10.0.0.7".parse().unwrap());
        record.dhcp.subnet_mask = Some("255.255.255.0".parse().unwrap());
        record.dhcp.default_gateway = Some("10.0.0.1".parse().unwrap());
        record.dhcp.hostname = Some("node01".to_string());
        record.dhcp.name_servers = vec!["8.8.8.8".parse().unwrap()];
        let mac = MacAddr6::new(0x01, 0x02, 0x03, 0x04, 0x05, 0x06);

        let ipam = ipam_arg(&record, &mac).unwrap();
        assert_eq!(
            ipam,
            "ipam=01-02-03-04-05-06::10.0.0.7:255.255.255.0:10.0.0.1:node01:8.8.8.8::"
        );
    }

    #[test]
    fn ipam_arg_requires_an_ip() {
        let record = HardwareRecord::default();
        let mac = MacAddr6::new(0, 0, 0, 0, 0, 1);
        assert!(ipam_arg(&record, &mac).is_none());
    }

    mod handler {
        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use macaddr::MacAddr6;
        use tower::ServiceExt;

        use crate::backend::{HardwareRecord, MemoryBackend};
        use crate::http::create_router;
        use crate::http::testutil::state_with_backend;

        #[tokio::test]
        async fn non_iso_path_is_400() {
            let app = create_router(state_with_backend(MemoryBackend::new()));
            let resp = app
                .oneshot(
                    Request::builder()
                        .uri("/iso/01:02:03:04:05:06/hook.img")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn bad_mac_is_400() {
            let app = create_router(state_with_backend(MemoryBackend::new()));
            let resp = app
                .oneshot(
                    Request::builder()
                        .uri("/iso/zz:zz/hook.iso")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn unknown_mac_is_404() {
            let app = create_router(state_with_backend(MemoryBackend::new()));
            let resp = app
                .oneshot(
                    Request::builder()
                        .uri("/iso/01:02:03:04:05:06/hook.iso")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        }

        #[tokio::test]
        async fn non_http_source_is_400() {
            let mut backend = MemoryBackend::new();
            let mut record = HardwareRecord::default();
            record.netboot.allow_netboot = true;
            backend.insert(MacAddr6::new(1, 2, 3, 4, 5, 6), record);
            let app = create_router(state_with_backend(backend));

            let resp = app
                .oneshot(
                    Request::builder()
                        .uri("/iso/01:02:03:04:05:06/hook.iso?sourceISO=ftp://x/hook.iso")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn missing_upstream_is_400() {
            let mut backend = MemoryBackend::new();
            let mut record = HardwareRecord::default();
            record.netboot.allow_netboot = true;
            backend.insert(MacAddr6::new(1, 2, 3, 4, 5, 6), record);
            let app = create_router(state_with_backend(backend));

            let resp = app
                .oneshot(
                    Request::builder()
                        .uri("/iso/01:02:03:04:05:06/hook.iso")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }
    }
}
