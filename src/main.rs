//! Bootforge daemon.
//!
//! Starts every enabled listener under one cancellation token: the first to
//! fail with a real error tears the rest down, Ctrl-C does the same
//! gracefully.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bootforge::backend::FileBackend;
use bootforge::binary::Binaries;
use bootforge::config::Config;
use bootforge::dhcp::{DhcpHandler, DhcpServer, Mode};
use bootforge::http::{
    create_router, mux, AppState, HttpServer, IsoProxyConfig, ScriptConfig,
};
use bootforge::metrics::Metrics;
use bootforge::syslog::SyslogServer;
use bootforge::tftp::TftpServer;

/// Bare-metal network boot provisioning service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/bootforge.conf")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("bootforge=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let metrics = Arc::new(Metrics::new());
    let backend = Arc::new(FileBackend::new(&config.backend_dir));
    let binaries = Arc::new(
        Binaries::new(config.ipxe_patch.clone().into_bytes())
            .context("iPXE patch does not fit the reserved region")?,
    );

    let token = CancellationToken::new();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    if config.dhcp.enabled {
        let handler = DhcpHandler {
            mode: config.dhcp.mode,
            backend: backend.clone(),
            ip_addr: config.dhcp.ip_for_packet,
            syslog_ip: config.dhcp.syslog_ip,
            tftp_addr: config.dhcp.tftp_addr,
            http_binary_url: config.dhcp.http_binary_url.clone(),
            script_base_url: config.dhcp.http_script_url.clone(),
            inject_mac_into_script: config.dhcp.inject_mac_into_script_path,
            mac_format: config.dhcp.inject_mac_into_binary_path,
            public_ip: config.dhcp.ip_for_packet,
            custom_user_class: config.dhcp.custom_user_class.clone(),
            enable_netboot: config.dhcp.enable_netboot_options,
            arch_map: Default::default(),
        };
        let server = DhcpServer::new(
            handler,
            config.dhcp.bind_addr,
            config.dhcp.bind_interface.clone(),
            metrics.clone(),
        );
        tasks.spawn(server.run(token.clone()));
    }

    if config.tftp.enabled {
        let server = TftpServer {
            bind_addr: config.tftp.bind_addr,
            binaries: binaries.clone(),
            backend: backend.clone(),
            asset_dir: config.tftp.asset_dir.clone(),
            block_size: config.tftp.block_size,
            timeout: config.tftp.timeout,
            metrics: metrics.clone(),
        };
        tasks.spawn(server.run(token.clone()));
    }

    {
        let state = AppState {
            backend: backend.clone(),
            binaries: binaries.clone(),
            script: Arc::new(ScriptConfig {
                osie_url: config.http.osie_url.clone(),
                retries: config.http.retries,
                retry_delay: config.http.retry_delay,
                extra_kernel_args: config.http.extra_kernel_args.clone(),
                syslog_host: config.dhcp.syslog_ip,
                tink_grpc_authority: config.tink.grpc_addr.clone(),
                tink_use_tls: config.tink.use_tls,
                tink_insecure_tls: config.tink.insecure_tls,
                static_script: config.dhcp.mode == Mode::AutoProxy,
            }),
            iso: Arc::new(IsoProxyConfig {
                upstream_url: config.iso.upstream_url.clone(),
                magic: config.iso.magic_string.clone(),
                static_ipam: config.iso.static_ipam,
                client: reqwest::Client::builder()
                    .redirect(reqwest::redirect::Policy::limited(10))
                    .build()
                    .context("failed to build upstream HTTP client")?,
            }),
            metrics: metrics.clone(),
            started: Instant::now(),
        };

        let tls = match (&config.http.tls_cert, &config.http.tls_key) {
            (Some(cert), Some(key)) => Some(mux::load_tls(cert, key)?),
            (None, None) => None,
            _ => anyhow::bail!("http_tls_cert and http_tls_key must both be set"),
        };
        let server = HttpServer {
            bind_addr: config.http.bind_addr,
            router: create_router(state),
            tls,
        };
        tasks.spawn(server.run(token.clone()));
    }

    if config.syslog.enabled {
        let server = SyslogServer {
            bind_addr: config.syslog.bind_addr,
            metrics: metrics.clone(),
        };
        tasks.spawn(server.run(token.clone()));
    }

    // Ctrl-C starts the graceful teardown
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt, shutting down");
                token.cancel();
            }
        });
    }

    // First task to fail with a real error cancels the rest.
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("listener failed: {e:#}");
                if first_error.is_none() {
                    first_error = Some(e);
                }
                token.cancel();
            }
            Err(e) => {
                error!("listener panicked: {e}");
                if first_error.is_none() {
                    first_error = Some(anyhow::anyhow!("listener panicked: {e}"));
                }
                token.cancel();
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
