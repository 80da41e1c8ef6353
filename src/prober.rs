//! Target prober: one health check against one route's backend
//!
//! A probe walks DNS resolution, TCP connect, optional TLS and an HTTP/1.1
//! GET under a single deadline. The first failing phase decides the
//! [`FailureKind`]. Every network step is a future owned by the probe, so
//! hitting the deadline drops the socket instead of leaving work behind.

use crate::health::{FailureKind, ProbeOutcome};
use crate::route::{Protocol, Route};
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONNECTION, HOST, USER_AGENT};
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// User agent sent with probe requests
pub const PROBE_USER_AGENT: &str = concat!("routewatch-probe/", env!("CARGO_PKG_VERSION"));

/// Response bytes read after the status line before the probe stops reading
const MAX_DRAIN_BYTES: usize = 64 * 1024;

/// Issues a single health check against a route's target.
///
/// Implementations must never fail: every problem is reported as a
/// [`ProbeOutcome`] carrying a [`FailureKind`].
pub trait Prober: Send + Sync + 'static {
    fn probe(&self, route: &Route) -> impl Future<Output = ProbeOutcome> + Send;
}

/// Everything a probe needs, checked before any network call
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// `host:port` as sent in the Host header
    pub authority: String,
    /// Origin-form request target
    pub path: Uri,
    pub timeout: Duration,
}

impl ProbeTarget {
    /// Build a probe target, or describe why the route cannot be probed
    pub fn from_route(route: &Route) -> Result<Self, String> {
        let host = route.target_ip.trim();
        if host.is_empty() {
            return Err("invalid target: empty host".to_string());
        }
        if route.target_port == 0 {
            return Err("invalid target: port 0".to_string());
        }
        if route.timeout_seconds == 0 {
            return Err("invalid target: timeout must be positive".to_string());
        }

        let raw_path = if route.target_path.is_empty() {
            "/"
        } else {
            route.target_path.as_str()
        };
        if !raw_path.starts_with('/') {
            return Err(format!(
                "invalid target: path '{}' must start with '/'",
                raw_path
            ));
        }
        let path: Uri = raw_path
            .parse()
            .map_err(|e| format!("invalid target: path '{}': {}", raw_path, e))?;

        let authority = route.authority();
        let full = format!("{}://{}{}", route.protocol, authority, raw_path);
        full.parse::<Uri>()
            .map_err(|e| format!("invalid target: URL '{}': {}", full, e))?;

        Ok(Self {
            protocol: route.protocol,
            host: host.to_string(),
            port: route.target_port,
            authority,
            path,
            timeout: route.timeout(),
        })
    }

    pub fn url(&self) -> String {
        format!("{}://{}{}", self.protocol, self.authority, self.path)
    }
}

/// Prober speaking HTTP/1.1 over plain TCP or rustls
#[derive(Clone)]
pub struct HttpProber {
    tls: TlsConnector,
}

impl HttpProber {
    pub fn new(tls: TlsConnector) -> Self {
        Self { tls }
    }

    async fn run(
        &self,
        target: &ProbeTarget,
        server_name: Option<ServerName<'static>>,
        started: Instant,
    ) -> ProbeOutcome {
        let Some(deadline) = started.checked_add(target.timeout) else {
            return ProbeOutcome::failure(
                FailureKind::Misconfig,
                format!("invalid target: timeout {}s is too large", target.timeout.as_secs()),
                elapsed_ms(started),
            );
        };
        let elapsed = || elapsed_ms(started);
        let timed_out = |phase: &str| {
            ProbeOutcome::failure(
                FailureKind::Timeout,
                format!("timeout after {}s ({})", target.timeout.as_secs(), phase),
                elapsed_ms(started),
            )
        };

        let addrs: Vec<SocketAddr> =
            match timeout_at(deadline, lookup_host((target.host.as_str(), target.port))).await {
                Err(_) => return timed_out("dns"),
                Ok(Err(e)) => {
                    return ProbeOutcome::failure(
                        FailureKind::OfflineDns,
                        format!("DNS error: {}", e),
                        elapsed(),
                    )
                }
                Ok(Ok(addrs)) => addrs.collect(),
            };
        if addrs.is_empty() {
            return ProbeOutcome::failure(
                FailureKind::OfflineDns,
                format!("DNS error: no addresses for {}", target.host),
                elapsed(),
            );
        }

        let stream = match connect_before(deadline, connect_any(&addrs)).await {
            Err(detail) => return ProbeOutcome::failure(FailureKind::OfflineConn, detail, elapsed()),
            Ok(stream) => stream,
        };
        let _ = stream.set_nodelay(true);

        let exchange = match server_name {
            None => timeout_at(deadline, exchange(stream, target)).await,
            Some(name) => {
                let tls = self.tls.clone();
                timeout_at(deadline, async move {
                    let stream = tls
                        .connect(name, stream)
                        .await
                        .map_err(|e| format!("TLS handshake failed: {}", e))?;
                    exchange(stream, target).await
                })
                .await
            }
        };

        match exchange {
            Err(_) => timed_out("response"),
            Ok(Err(detail)) => ProbeOutcome::failure(FailureKind::ErrorExc, detail, elapsed()),
            Ok(Ok(status)) => ProbeOutcome::from_status(status, elapsed()),
        }
    }
}

impl Prober for HttpProber {
    async fn probe(&self, route: &Route) -> ProbeOutcome {
        let started = Instant::now();

        let target = match ProbeTarget::from_route(route) {
            Ok(target) => target,
            Err(detail) => {
                return ProbeOutcome::failure(FailureKind::Misconfig, detail, elapsed_ms(started))
            }
        };

        let server_name = match target.protocol {
            Protocol::Http => None,
            Protocol::Https => match ServerName::try_from(target.host.clone()) {
                Ok(name) => Some(name),
                Err(e) => {
                    return ProbeOutcome::failure(
                        FailureKind::Misconfig,
                        format!("invalid target: TLS server name '{}': {}", target.host, e),
                        elapsed_ms(started),
                    )
                }
            },
        };

        let outcome = self.run(&target, server_name, started).await;
        debug!(
            route_id = %route.id,
            url = %target.url(),
            success = outcome.success,
            http_status = ?outcome.http_status,
            duration_ms = outcome.duration_ms,
            detail = %outcome.detail,
            "Probe finished"
        );
        outcome
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn connect_any(addrs: &[SocketAddr]) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses")))
}

/// Run the TCP connect step. A connect still pending at the deadline is an
/// unreachable backend, not a slow one.
async fn connect_before<F, T>(deadline: Instant, connect: F) -> Result<T, String>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout_at(deadline, connect).await {
        Err(_) => Err("TCP connect failed: timed out".to_string()),
        Ok(Err(e)) => Err(format!("TCP connect failed: {}", e)),
        Ok(Ok(stream)) => Ok(stream),
    }
}

/// Send one GET over an established stream and return the status code
async fn exchange<S>(stream: S, target: &ProbeTarget) -> Result<u16, String>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(|e| format!("HTTP handshake failed: {}", e))?;

    let _driver = AbortOnDrop(tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Probe connection closed with error");
        }
    }));

    let request = Request::builder()
        .method(Method::GET)
        .uri(target.path.clone())
        .header(HOST, target.authority.as_str())
        .header(USER_AGENT, PROBE_USER_AGENT)
        .header(CONNECTION, "close")
        .body(Empty::<Bytes>::new())
        .map_err(|e| format!("invalid request: {}", e))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| format!("HTTP request failed: {}", e))?;

    let status = response.status().as_u16();
    drain(response.into_body()).await;
    Ok(status)
}

async fn drain(mut body: Incoming) {
    let mut read = 0usize;
    while read < MAX_DRAIN_BYTES {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    read += data.len();
                }
            }
            Some(Err(e)) => {
                debug!(error = %e, "Probe response body ended early");
                break;
            }
            None => break,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
