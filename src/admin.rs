//! REST API over the route registry and health monitor

use crate::error::{json_error_response, registry_error_response, ApiErrorCode, RegistryError};
use crate::prober::Prober;
use crate::registry::Registry;
use crate::route::{RouteSpec, RouteUpdate};
use crate::scheduler::HealthMonitor;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the service
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest request body accepted
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Helper to create a JSON response
fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(bytes)))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            json_error_response(ApiErrorCode::InternalError, "Internal server error")
        }
    }
}

/// Admin API server for route management
pub struct AdminServer<P: Prober> {
    bind_addr: SocketAddr,
    monitor: Arc<HealthMonitor<P>>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Option<Arc<String>>,
}

impl<P: Prober> AdminServer<P> {
    pub fn new(
        bind_addr: SocketAddr,
        monitor: Arc<HealthMonitor<P>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            monitor,
            shutdown_rx,
            auth_token: None,
        }
    }

    /// Require `Authorization: Bearer <token>` on every /api request
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(Arc::new(token.into()));
        self
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth_token.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, auth = self.auth_enabled(), "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let monitor = Arc::clone(&self.monitor);
                            let auth_token = self.auth_token.clone();

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, monitor, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S, P>(
    stream: S,
    monitor: Arc<HealthMonitor<P>>,
    auth_token: Option<Arc<String>>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    P: Prober,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let monitor = Arc::clone(&monitor);
        let token = auth_token.clone();
        async move { handle_admin_request(req, monitor, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: Option<&str>) -> bool {
    let Some(expected) = expected_token else {
        return true;
    };
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected))
        .unwrap_or(false)
}

/// Read and deserialize a JSON request body.
///
/// Syntax errors map to INVALID_JSON; well-formed bodies with missing or
/// mistyped fields map to VALIDATION_ERROR.
async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, Response<Full<Bytes>>> {
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| {
            json_error_response(
                ApiErrorCode::InvalidJson,
                format!("Failed to read request body: {}", e),
            )
        })?
        .to_bytes();

    serde_json::from_slice(&body).map_err(|e| {
        if e.is_data() {
            json_error_response(ApiErrorCode::ValidationError, e.to_string())
        } else {
            json_error_response(
                ApiErrorCode::InvalidJson,
                "Request body must be a JSON object",
            )
        }
    })
}

/// Run a registry mutation on the blocking pool.
///
/// Mutations write the routes file and fsync it while holding the registry's
/// write lock, which must not stall an async worker.
async fn mutate<T, F>(registry: &Arc<Registry>, f: F) -> Result<T, RegistryError>
where
    F: FnOnce(&Registry) -> Result<T, RegistryError> + Send + 'static,
    T: Send + 'static,
{
    let registry = Arc::clone(registry);
    match tokio::task::spawn_blocking(move || f(&registry)).await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Registry mutation task failed");
            Err(RegistryError::Internal(e.to_string()))
        }
    }
}

/// Join and percent-decode the tail of a route-status request into a route path
fn route_status_path(segments: &[&str]) -> String {
    let joined = segments.join("/");
    let decoded = urlencoding::decode(&joined)
        .map(|s| s.into_owned())
        .unwrap_or(joined);
    if decoded.starts_with('/') {
        decoded
    } else {
        format!("/{}", decoded)
    }
}

async fn handle_admin_request<P: Prober>(
    req: Request<Incoming>,
    monitor: Arc<HealthMonitor<P>>,
    auth_token: Option<Arc<String>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let registry = monitor.registry();

    debug!(%method, %path, "Admin API request");

    let response = match (&method, segments.as_slice()) {
        // Health check for the service itself (no auth required)
        (&Method::GET, ["health"]) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "status": "healthy",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "routes_count": registry.len(),
            }),
        ),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, ["version"]) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        // Data-plane lookup: GET /api/route-status/{path} (no auth required)
        (&Method::GET, ["api", "route-status", rest @ ..]) if !rest.is_empty() => {
            let route_path = route_status_path(rest);
            let view = registry
                .get_by_path(&route_path)
                .and_then(|route| registry.view(&route.id).ok());
            match view {
                Some(view) => json_response(
                    StatusCode::OK,
                    &serde_json::json!({
                        "path": route_path,
                        "enabled": view.route.enabled,
                        "name": view.route.name,
                        "status": view.health.state,
                    }),
                ),
                None => json_response(
                    StatusCode::NOT_FOUND,
                    &serde_json::json!({
                        "path": route_path,
                        "enabled": false,
                        "error": "Route not found",
                    }),
                ),
            }
        }

        (_, ["api", ..]) if !check_auth(&req, auth_token.as_deref().map(String::as_str)) => {
            warn!(%method, %path, "Unauthorized admin API request");
            json_error_response(ApiErrorCode::Unauthorized, "Unauthorized")
        }

        (&Method::GET, ["api", "routes"]) => json_response(StatusCode::OK, &registry.snapshot()),

        (&Method::POST, ["api", "routes"]) => match read_json::<RouteSpec>(req).await {
            Err(response) => response,
            Ok(spec) => match mutate(registry, move |r| {
                r.create(spec).and_then(|route| r.view(&route.id))
            })
            .await
            {
                Ok(view) => json_response(StatusCode::CREATED, &view),
                Err(e) => registry_error_response(&e),
            },
        },

        (&Method::GET, ["api", "routes", "stats"]) => {
            json_response(StatusCode::OK, &registry.stats())
        }

        (&Method::GET, ["api", "routes", id]) => match registry.view(id) {
            Ok(view) => json_response(StatusCode::OK, &view),
            Err(e) => registry_error_response(&e),
        },

        (&Method::PUT, ["api", "routes", id]) => {
            let id = id.to_string();
            match registry.get(&id) {
                Err(e) => registry_error_response(&e),
                Ok(current) => match read_json::<RouteUpdate>(req).await {
                    Err(response) => response,
                    Ok(update) => match mutate(registry, move |r| {
                        r.update(&id, update.apply_to(&current))
                            .and_then(|route| r.view(&route.id))
                    })
                    .await
                    {
                        Ok(view) => json_response(
                            StatusCode::OK,
                            &serde_json::json!({ "success": true, "route": view }),
                        ),
                        Err(e) => registry_error_response(&e),
                    },
                },
            }
        }

        (&Method::DELETE, ["api", "routes", id]) => {
            let id = id.to_string();
            match mutate(registry, move |r| r.delete(&id)).await {
                Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "success": true })),
                Err(e) => registry_error_response(&e),
            }
        }

        (&Method::POST, ["api", "routes", id, "toggle"]) => {
            let id = id.to_string();
            match mutate(registry, move |r| r.toggle(&id)).await {
                Ok(enabled) => json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "success": true, "enabled": enabled }),
                ),
                Err(e) => registry_error_response(&e),
            }
        }

        (&Method::POST, ["api", "routes", id, "test"]) => match monitor.test_now(id).await {
            Ok(report) => json_response(StatusCode::OK, &report),
            Err(e) => registry_error_response(&e),
        },

        (_, ["health"] | ["version"])
        | (_, ["api", "routes"])
        | (_, ["api", "routes", _])
        | (_, ["api", "routes", _, "toggle" | "test"])
        | (_, ["api", "route-status", _, ..]) => {
            json_error_response(ApiErrorCode::MethodNotAllowed, "Method not allowed")
        }

        // 404 for everything else
        _ => json_error_response(ApiErrorCode::NotFound, "Not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(auth: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/api/routes");
        if let Some(value) = auth {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_check_auth() {
        assert!(check_auth(&request(None), None));
        assert!(!check_auth(&request(None), Some("secret")));
        assert!(check_auth(&request(Some("Bearer secret")), Some("secret")));
        assert!(check_auth(&request(Some("secret")), Some("secret")));
        assert!(!check_auth(&request(Some("Bearer wrong")), Some("secret")));
    }

    #[tokio::test]
    async fn test_mutations_run_off_the_async_worker() {
        use crate::route::{RouteSpec, TargetPolicy};

        let registry = Arc::new(Registry::new(TargetPolicy::default()));
        let caller = std::thread::current().id();

        let (route, thread) = mutate(&registry, |r| {
            let route = r.create(RouteSpec::new("/media", "Media", "192.168.1.20", 8096))?;
            Ok((route, std::thread::current().id()))
        })
        .await
        .unwrap();

        assert_ne!(thread, caller);
        assert_eq!(registry.get(&route.id).unwrap().path, "/media");

        let err = mutate(&registry, |r| r.delete("missing")).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_route_status_path() {
        assert_eq!(route_status_path(&["media"]), "/media");
        assert_eq!(route_status_path(&["apps", "wiki"]), "/apps/wiki");
        assert_eq!(route_status_path(&["%2Fmedia"]), "/media");
    }
}
