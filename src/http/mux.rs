//! Protocol-detecting HTTP(S) listener.
//!
//! One TCP port serves both plain HTTP and HTTPS. A TLS ClientHello always
//! starts with 0x16 and an HTTP request line never does, so the first byte
//! of each connection decides which way it goes. The byte is observed with
//! `MSG_PEEK`, so the stream reaches the HTTP parser (or the TLS handshake)
//! intact. A silent peer is cut off by the peek deadline instead of pinning
//! a task forever, and established connections carry read/write and idle
//! deadlines so a trickling client cannot either.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::connect_info::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Sleep;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{debug, info, warn};

const PEEK_TIMEOUT: Duration = Duration::from_secs(5);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(20);
/// Budget for one stalled read or write on an active exchange.
const RW_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for a keep-alive connection with no request in flight.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// First byte of every TLS record of type handshake.
const TLS_HANDSHAKE_BYTE: u8 = 0x16;

pub struct HttpServer {
    pub bind_addr: SocketAddr,
    pub router: Router,
    /// When set, connections leading with 0x16 are unwrapped as TLS.
    pub tls: Option<TlsAcceptor>,
}

/// Load a PEM certificate chain and key into a TLS acceptor.
pub fn load_tls(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert_path)
            .with_context(|| format!("failed to open {}", cert_path.display()))?,
    ))
    .collect::<std::result::Result<Vec<_>, _>>()
    .context("failed to parse certificate chain")?;

    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key_path)
            .with_context(|| format!("failed to open {}", key_path.display()))?,
    ))
    .context("failed to parse private key")?
    .context("no private key found")?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate/key pair")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

impl HttpServer {
    /// Accept until cancelled, then give in-flight connections a short grace
    /// period. Bind failures are fatal; per-connection failures are not.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener to {}", self.bind_addr))?;
        info!(
            "HTTP server listening on {}{}",
            self.bind_addr,
            if self.tls.is_some() { " (TLS enabled)" } else { "" }
        );

        let tracker = TaskTracker::new();

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = listener.accept() => match res {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("accept error: {e}");
                        continue;
                    }
                },
            };

            let router = self.router.clone();
            let tls = self.tls.clone();
            let conn_shutdown = shutdown.child_token();
            tracker.spawn(async move {
                if let Err(e) = serve_connection(stream, peer, router, tls, conn_shutdown).await {
                    debug!("connection from {peer} ended: {e}");
                }
            });
        }

        tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait())
            .await
            .is_err()
        {
            warn!("HTTP connections still open after grace period");
        }
        info!("HTTP server stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut first = [0u8; 1];
    let peeked = tokio::time::timeout(PEEK_TIMEOUT, stream.peek(&mut first))
        .await
        .context("peek deadline exceeded")??;
    if peeked == 0 {
        return Ok(()); // closed before sending anything
    }

    match (first[0], tls) {
        (TLS_HANDSHAKE_BYTE, Some(acceptor)) => {
            let tls_stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                .await
                .context("TLS handshake deadline exceeded")?
                .context("TLS handshake failed")?;
            serve_io(tls_stream, peer, router, shutdown).await
        }
        (TLS_HANDSHAKE_BYTE, None) => {
            debug!("TLS bytes from {peer} but TLS is not configured, treating as HTTP");
            serve_io(stream, peer, router, shutdown).await
        }
        (_, _) => serve_io(stream, peer, router, shutdown).await,
    }
}

/// Hand one connection to hyper. The request context derives from the
/// server's token, so shutdown reaches in-flight requests.
async fn serve_io<I>(
    io: I,
    peer: SocketAddr,
    router: Router,
    shutdown: CancellationToken,
) -> Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TimedIo::new(io, RW_TIMEOUT, IDLE_TIMEOUT);
    let service = hyper::service::service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(ConnectInfo(peer));
        router.clone().oneshot(req)
    });

    let mut builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);

    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            res.map_err(|e| anyhow::anyhow!("{e}"))
        }
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            match tokio::time::timeout(SHUTDOWN_GRACE, conn).await {
                Ok(res) => res.map_err(|e| anyhow::anyhow!("{e}")),
                Err(_) => Err(anyhow::anyhow!("connection did not drain in time")),
            }
        }
    }
}

/// A stream with inactivity deadlines.
///
/// A stalled read or write errors with `TimedOut` after the read/write
/// budget. Reads that follow a completed write get the longer idle budget
/// instead: that is the keep-alive gap between requests, not a stall.
/// Deadlines arm when an operation first returns pending and clear on any
/// progress, so long transfers that keep moving are never cut off.
struct TimedIo<I> {
    inner: I,
    rw_timeout: Duration,
    idle_timeout: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
    /// Whether the most recent progress was a read (mid-request) rather
    /// than a write or nothing yet (between requests).
    last_was_read: bool,
}

impl<I> TimedIo<I> {
    fn new(inner: I, rw_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            inner,
            rw_timeout,
            idle_timeout,
            read_deadline: None,
            write_deadline: None,
            last_was_read: false,
        }
    }
}

impl<I: AsyncRead + Unpin> AsyncRead for TimedIo<I> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(res) => {
                if buf.filled().len() > before {
                    this.last_was_read = true;
                }
                this.read_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                let budget = if this.last_was_read {
                    this.rw_timeout
                } else {
                    this.idle_timeout
                };
                let deadline = this
                    .read_deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(budget)));
                match deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "read timed out",
                    ))),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl<I: AsyncWrite + Unpin> TimedIo<I> {
    fn poll_write_deadline(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        let rw = self.rw_timeout;
        let deadline = self
            .write_deadline
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(rw)));
        match deadline.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write timed out",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<I: AsyncWrite + Unpin> AsyncWrite for TimedIo<I> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(res) => {
                if matches!(res, Ok(n) if n > 0) {
                    this.last_was_read = false;
                }
                this.write_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => this.poll_write_deadline(cx).map(|res| res.map(|()| 0)),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(res) => {
                this.write_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => this.poll_write_deadline(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
