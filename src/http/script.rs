//! iPXE script endpoint.
//!
//! `GET /` resolves the caller by source IP; `GET /{mac}/auto.ipxe` by the
//! MAC in the path. Both render the same boot script: kernel, initrd and a
//! per-host command line assembled from the hardware record. Deployments in
//! auto-proxy mode can switch to a fixed script that needs no backend at
//! all.

use std::net::{Ipv4Addr, SocketAddr};

use axum::extract::{ConnectInfo, Path, State};
use axum::response::{IntoResponse, Response};
use macaddr::MacAddr6;
use minijinja::context;
use url::Url;

use crate::backend::HardwareRecord;
use crate::error::AppError;
use crate::template;

use super::AppState;

/// Consoles handed to the kernel when the facility string does not carry
/// its own `console=` settings.
const DEFAULT_CONSOLES: &str =
    "console=ttyAMA0 console=ttyS0 console=tty0 console=tty1 console=ttyS1,115200";

pub const AUTO_IPXE_TEMPLATE: &str = r#"#!ipxe

echo Loading the installer environment...

set arch ${buildarch}
iseq ${arch} i386 && set arch x86_64 ||
iseq ${arch} arm32 && set arch armv7l ||
iseq ${arch} arm64 && set arch aarch64 ||

set download-url {{ download_url }}
{% if retries > 0 -%}
set retries:int32 {{ retries }}
set retry_delay:int32 {{ retry_delay }}

set idx:int32 0
:retry_kernel
kernel ${download-url}/vmlinuz-${arch} {{ cmdline }} && goto download_initrd || iseq ${idx} ${retries} && goto kernel-error || inc idx && echo retrying in ${retry_delay} seconds && sleep ${retry_delay} && goto retry_kernel

:download_initrd
set idx:int32 0
:retry_initrd
initrd ${download-url}/initramfs-${arch} && goto boot || iseq ${idx} ${retries} && goto initrd-error || inc idx && echo retrying in ${retry_delay} seconds && sleep ${retry_delay} && goto retry_initrd

:boot
boot

:kernel-error
echo failed to load the kernel
imgfree
exit

:initrd-error
echo failed to load the initrd
imgfree
exit
{%- else -%}
kernel ${download-url}/vmlinuz-${arch} {{ cmdline }}
initrd ${download-url}/initramfs-${arch}
boot
{%- endif %}
"#;

pub struct ScriptConfig {
    /// Default base URL for the installer kernel and initrd; hardware
    /// records can override it per host.
    pub osie_url: Url,
    pub retries: u32,
    /// Seconds between retry attempts.
    pub retry_delay: u32,
    pub extra_kernel_args: Vec<String>,
    pub syslog_host: Option<Ipv4Addr>,
    pub tink_grpc_authority: String,
    pub tink_use_tls: bool,
    pub tink_insecure_tls: bool,
    /// Serve a fixed script with no backend lookup, for auto-proxy
    /// deployments where hosts are not registered.
    pub static_script: bool,
}

pub async fn handle_root(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Response, AppError> {
    if state.script.static_script {
        return render_static(&state);
    }

    let record = state.backend.get_by_ip(peer.ip()).await?;
    if !record.netboot.allow_netboot {
        return Err(AppError::NotFound(format!("{} (netboot disabled)", peer.ip())));
    }

    // worker identity falls back to the requesting IP when the path has no
    // MAC to offer
    let worker_id = peer.ip().to_string();
    render(&state, &record, &worker_id)
}

pub async fn handle_auto_ipxe(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Response, AppError> {
    let mac: MacAddr6 = mac
        .parse()
        .map_err(|_| AppError::InvalidMac(mac.clone()))?;

    if state.script.static_script {
        return render_static(&state);
    }

    let record = state.backend.get_by_mac(mac).await?;
    if !record.netboot.allow_netboot {
        return Err(AppError::NotFound(format!("{mac} (netboot disabled)")));
    }

    let worker_id = mac.to_string().to_lowercase();
    render(&state, &record, &worker_id)
}

fn render(state: &AppState, record: &HardwareRecord, worker_id: &str) -> Result<Response, AppError> {
    let cfg = &state.script;
    let download_url = record
        .netboot
        .osie_url
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or(cfg.osie_url.as_str())
        .trim_end_matches('/')
        .to_string();

    let cmdline = cmdline_for(cfg, record, worker_id);
    respond(state, &download_url, &cmdline)
}

/// The fixed script used when no backend is available: identity comes from
/// iPXE's own `${mac}` variable instead of a hardware record.
fn render_static(state: &AppState) -> Result<Response, AppError> {
    let cfg = &state.script;
    let record = HardwareRecord::default();
    let cmdline = cmdline_for(cfg, &record, "${mac}");
    let download_url = cfg.osie_url.as_str().trim_end_matches('/').to_string();
    respond(state, &download_url, &cmdline)
}

fn respond(state: &AppState, download_url: &str, cmdline: &str) -> Result<Response, AppError> {
    let cfg = &state.script;
    let script = template::render(
        AUTO_IPXE_TEMPLATE,
        context! {
            download_url => download_url,
            retries => cfg.retries,
            retry_delay => cfg.retry_delay,
            cmdline => cmdline,
        },
    )?;

    state
        .metrics
        .http_requests
        .with_label_values(&["script", "200"])
        .inc();
    Ok((
        [("content-type", "text/plain; charset=utf-8")],
        script,
    )
        .into_response())
}

/// Assemble the kernel command line for one host. Also used by the ISO
/// patcher, which must bake the same parameters into the image.
pub fn cmdline_for(cfg: &ScriptConfig, record: &HardwareRecord, worker_id: &str) -> String {
    let mut parts: Vec<String> = Vec::new();

    let facility = record.netboot.facility.as_deref().unwrap_or_default();
    if facility.contains("console=") {
        parts.push(facility.to_string());
    } else {
        parts.push(DEFAULT_CONSOLES.to_string());
    }

    if let Some(ip) = cfg.syslog_host {
        parts.push(format!("syslog_host={ip}"));
    }
    parts.push(format!("grpc_authority={}", cfg.tink_grpc_authority));
    parts.push(format!("tinkerbell_tls={}", cfg.tink_use_tls));
    parts.push(format!("tinkerbell_insecure_tls={}", cfg.tink_insecure_tls));
    parts.push(format!("worker_id={worker_id}"));
    parts.push(format!("hw_addr={worker_id}"));
    if let Some(vlan) = record.dhcp.vlan_id {
        parts.push(format!("vlan_id={vlan}"));
    }
    if !facility.is_empty() && !facility.contains("console=") {
        parts.push(format!("facility={facility}"));
    }
    parts.extend(cfg.extra_kernel_args.iter().cloned());

    parts.join(" ")
}
