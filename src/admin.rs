//! Local admin HTTP API
//!
//! `GET /health` and `GET /version` are open. `GET /servers`,
//! `GET /servers/<name>` and `POST /servers/<name>/spindown` require the
//! admin bearer token.

use crate::controller::{ServerRegistry, ServerStatus};
use crate::error::{json_error_response, AdminErrorCode};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// How long a status query may wait on a controller that is mid spin-up
const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Admin API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    registry: Arc<ServerRegistry>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<ServerRegistry>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API listening");
        self.serve(listener).await;
        Ok(())
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(self, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, registry, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    registry: Arc<ServerRegistry>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let registry = Arc::clone(&registry);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, registry, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(headers: &HeaderMap, expected_token: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

fn status_json(status: &ServerStatus) -> serde_json::Value {
    serde_json::json!({
        "name": status.name,
        "ports": status.ports,
        "idle_timeout_secs": status.idle_timeout.as_secs(),
        "idle_for_secs": status.idle_for.as_secs(),
        "active_sessions": status.active_sessions,
        "provisioned": status.provisioned,
    })
}

async fn list_servers(registry: &ServerRegistry) -> Response<Full<Bytes>> {
    let mut servers = Vec::with_capacity(registry.len());
    for name in registry.names() {
        let Some(handle) = registry.get(&name) else {
            continue;
        };
        let entry = match tokio::time::timeout(STATUS_TIMEOUT, handle.status()).await {
            Ok(Some(status)) => status_json(&status),
            Ok(None) => serde_json::json!({ "name": name, "state": "stopped" }),
            Err(_) => serde_json::json!({ "name": name, "state": "busy" }),
        };
        servers.push(entry);
    }

    let body = serde_json::json!({
        "count": servers.len(),
        "servers": servers,
    });
    json_response(StatusCode::OK, body.to_string())
}

async fn server_status(registry: &ServerRegistry, name: &str) -> Response<Full<Bytes>> {
    let Some(handle) = registry.get(name) else {
        return json_error_response(AdminErrorCode::UnknownServer, format!("no server named {}", name));
    };
    match tokio::time::timeout(STATUS_TIMEOUT, handle.status()).await {
        Ok(Some(status)) => json_response(StatusCode::OK, status_json(&status).to_string()),
        Ok(None) => json_error_response(AdminErrorCode::ServerStopped, format!("{} has stopped", name)),
        Err(_) => json_error_response(
            AdminErrorCode::ServerBusy,
            format!("{} did not answer within {:?}", name, STATUS_TIMEOUT),
        ),
    }
}

fn request_spindown(registry: &ServerRegistry, name: &str) -> Response<Full<Bytes>> {
    match registry.get(name) {
        None => json_error_response(AdminErrorCode::UnknownServer, format!("no server named {}", name)),
        Some(handle) if handle.request_spindown() => {
            info!(server = name, "Spin-down requested via admin API");
            json_response(
                StatusCode::ACCEPTED,
                serde_json::json!({ "server": name, "spindown": "queued" }).to_string(),
            )
        }
        Some(_) => json_error_response(AdminErrorCode::ServerStopped, format!("{} has stopped", name)),
    }
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    registry: Arc<ServerRegistry>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.method(), req.uri().path(), req.headers(), &registry, &auth_token).await)
}

async fn route(
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    registry: &ServerRegistry,
    auth_token: &str,
) -> Response<Full<Bytes>> {
    debug!(%method, %path, "Admin API request");

    let open = matches!((method, path), (&Method::GET, "/health") | (&Method::GET, "/version"));
    if !open && path.starts_with("/servers") && !check_auth(headers, auth_token) {
        warn!(path, "Unauthorized admin API request");
        return json_error_response(AdminErrorCode::Unauthorized, "missing or invalid token");
    }

    match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/servers") => list_servers(registry).await,

        (&Method::GET, path) if path.starts_with("/servers/") => {
            let name = &path["/servers/".len()..];
            if name.is_empty() || name.contains('/') {
                json_error_response(AdminErrorCode::NotFound, "not found")
            } else {
                server_status(registry, name).await
            }
        }

        (&Method::POST, path) if path.starts_with("/servers/") && path.ends_with("/spindown") => {
            let name = path
                .strip_prefix("/servers/")
                .and_then(|rest| rest.strip_suffix("/spindown"))
                .unwrap_or("");
            if name.is_empty() || name.contains('/') {
                json_error_response(AdminErrorCode::NotFound, "not found")
            } else {
                request_spindown(registry, name)
            }
        }

        _ => json_error_response(AdminErrorCode::NotFound, "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::LifecycleBackend;
    use crate::controller::{ControllerSettings, ServerManager};
    use crate::error::ComputeError;
    use crate::forward::Forwarder;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use hyper::header::HeaderValue;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingBackend(AtomicU32);

    #[async_trait]
    impl LifecycleBackend for CountingBackend {
        async fn spinup(&self, _name: &str) -> Result<IpAddr, ComputeError> {
            Ok("127.0.0.1".parse().unwrap())
        }

        async fn spindown(&self, _name: &str) -> Result<(), ComputeError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Spin-down never finishes, so the controller stops answering
    struct StuckBackend;

    #[async_trait]
    impl LifecycleBackend for StuckBackend {
        async fn spinup(&self, _name: &str) -> Result<IpAddr, ComputeError> {
            Ok("127.0.0.1".parse().unwrap())
        }

        async fn spindown(&self, _name: &str) -> Result<(), ComputeError> {
            std::future::pending().await
        }
    }

    fn registry(backend: Arc<dyn LifecycleBackend>) -> ServerRegistry {
        let mut registry = ServerRegistry::new();
        registry.insert(ServerManager::spawn(
            "alpha",
            vec![9000, 9001],
            backend,
            Forwarder::Proxy,
            ControllerSettings {
                idle_timeout: Duration::from_secs(120),
                check_interval: Duration::from_secs(60),
                pulse_interval: Duration::from_secs(60),
            },
        ));
        registry
    }

    fn authorized() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sekrit"));
        headers
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_check_auth() {
        let mut headers = HeaderMap::new();
        assert!(!check_auth(&headers, "sekrit"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("sekrit"));
        assert!(check_auth(&headers, "sekrit"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sekrit"));
        assert!(check_auth(&headers, "sekrit"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert!(!check_auth(&headers, "sekrit"));
    }

    #[tokio::test]
    async fn test_open_endpoints() {
        let registry = registry(Arc::new(CountingBackend(AtomicU32::new(0))));
        let headers = HeaderMap::new();

        let health = route(&Method::GET, "/health", &headers, &registry, "sekrit").await;
        assert_eq!(health.status(), StatusCode::OK);

        let version = route(&Method::GET, "/version", &headers, &registry, "sekrit").await;
        assert_eq!(version.status(), StatusCode::OK);
        let json = body_json(version).await;
        assert_eq!(json["name"], "dospin");
    }

    #[tokio::test]
    async fn test_servers_requires_auth() {
        let registry = registry(Arc::new(CountingBackend(AtomicU32::new(0))));

        let response = route(&Method::GET, "/servers", &HeaderMap::new(), &registry, "sekrit").await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get("X-Dospin-Error").unwrap(), "UNAUTHORIZED");

        let response = route(
            &Method::POST,
            "/servers/alpha/spindown",
            &HeaderMap::new(),
            &registry,
            "sekrit",
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_list_servers() {
        let registry = registry(Arc::new(CountingBackend(AtomicU32::new(0))));

        let response = route(&Method::GET, "/servers", &authorized(), &registry, "sekrit").await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["count"], 1);
        assert_eq!(json["servers"][0]["name"], "alpha");
        assert_eq!(json["servers"][0]["ports"], serde_json::json!([9000, 9001]));
        assert_eq!(json["servers"][0]["idle_timeout_secs"], 120);
        assert_eq!(json["servers"][0]["provisioned"], true);
    }

    #[tokio::test]
    async fn test_single_server_status() {
        let registry = registry(Arc::new(CountingBackend(AtomicU32::new(0))));

        let response = route(&Method::GET, "/servers/alpha", &authorized(), &registry, "sekrit").await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["name"], "alpha");
        assert_eq!(json["active_sessions"], 0);

        let response = route(&Method::GET, "/servers/gamma", &authorized(), &registry, "sekrit").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get("X-Dospin-Error").unwrap(), "UNKNOWN_SERVER");

        let response = route(&Method::GET, "/servers/alpha", &HeaderMap::new(), &registry, "sekrit").await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_server_status() {
        let registry = registry(Arc::new(StuckBackend));
        assert!(registry.get("alpha").unwrap().request_spindown());

        let response = route(&Method::GET, "/servers/alpha", &authorized(), &registry, "sekrit").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("X-Dospin-Error").unwrap(), "SERVER_BUSY");

        let response = route(&Method::GET, "/servers", &authorized(), &registry, "sekrit").await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["servers"][0]["state"], "busy");
    }

    #[tokio::test]
    async fn test_spindown_endpoint() {
        let backend = Arc::new(CountingBackend(AtomicU32::new(0)));
        let registry = registry(backend.clone());

        let response = route(
            &Method::POST,
            "/servers/alpha/spindown",
            &authorized(),
            &registry,
            "sekrit",
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        // Status is answered after the queued spin-down
        let status = registry.get("alpha").unwrap().status().await.unwrap();
        assert!(!status.provisioned);
        assert_eq!(backend.0.load(Ordering::SeqCst), 1);

        let response = route(
            &Method::POST,
            "/servers/gamma/spindown",
            &authorized(),
            &registry,
            "sekrit",
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get("X-Dospin-Error").unwrap(), "UNKNOWN_SERVER");
    }

    #[tokio::test]
    async fn test_stopped_server() {
        let registry = registry(Arc::new(CountingBackend(AtomicU32::new(0))));
        registry.stop_all().await;

        let response = route(
            &Method::POST,
            "/servers/alpha/spindown",
            &authorized(),
            &registry,
            "sekrit",
        )
        .await;
        assert_eq!(response.status(), StatusCode::GONE);

        let response = route(&Method::GET, "/servers/alpha", &authorized(), &registry, "sekrit").await;
        assert_eq!(response.status(), StatusCode::GONE);

        let response = route(&Method::GET, "/servers", &authorized(), &registry, "sekrit").await;
        let json = body_json(response).await;
        assert_eq!(json["servers"][0]["state"], "stopped");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let registry = registry(Arc::new(CountingBackend(AtomicU32::new(0))));
        let response = route(&Method::GET, "/nope", &HeaderMap::new(), &registry, "sekrit").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serves_over_http() {
        let registry = Arc::new(registry(Arc::new(CountingBackend(AtomicU32::new(0)))));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = AdminServer::new(addr, registry, shutdown_rx, "sekrit".to_string());
        assert_eq!(server.auth_token(), "sekrit");
        let task = tokio::spawn(server.serve(listener));

        let resp = reqwest::Client::new()
            .get(format!("http://{}/servers", addr))
            .bearer_auth("sekrit")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let json: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(json["count"], 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
