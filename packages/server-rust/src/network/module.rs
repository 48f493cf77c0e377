//! Network module with deferred startup lifecycle.
//!
//! `new()` builds shared state, `start()` binds the TCP listener, and
//! `serve()` accepts connections until the shutdown future resolves.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::{NetworkConfig, TlsConfig};
use super::connection::ConnectionRegistry;
use super::handlers::{front_end, AppState};
use super::middleware::{build_http_layers, cors_guard, CorsPolicy};
use super::shutdown::ShutdownController;
use crate::service::ServiceRegistry;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Manages the HTTP and socket server lifecycle.
///
/// 1. `new()` -- allocates shared state (routes, connections, shutdown)
/// 2. `start()` -- binds TCP listener to the configured address
/// 3. `serve()` -- accepts connections until shutdown is signalled
pub struct NetworkModule {
    state: AppState,
    listener: Option<TcpListener>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    ///
    /// # Errors
    ///
    /// Returns an error if the static file configuration is invalid.
    pub fn new(config: NetworkConfig, services: ServiceRegistry) -> anyhow::Result<Self> {
        Ok(Self {
            state: AppState::new(config, services)?,
            listener: None,
        })
    }

    #[must_use]
    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.state.connections)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    /// Assembles the axum router around the front end.
    pub fn build_router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which differs from the configured
    /// port when port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let config = &self.state.config;
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!(
            host = %config.host,
            port,
            routes = self.state.services.len(),
            "TCP listener bound"
        );

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until `shutdown` resolves, then closes every
    /// socket connection and waits for in-flight work.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called, TLS certificates cannot
    /// be loaded, or the server hits a fatal I/O error.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let state = self.state;
        let router = build_router(state.clone());

        let controller = Arc::clone(&state.shutdown);
        let signal = async move {
            shutdown.await;
            controller.trigger_shutdown();
        };

        state.shutdown.set_ready();

        if let Some(tls) = &state.config.tls {
            serve_tls(listener, router, tls, signal).await?;
        } else {
            serve_plain(listener, router, signal).await?;
        }

        drain_connections(&state.connections, &state.shutdown).await;
        Ok(())
    }
}

/// Builds the router: one fallback front end, origin checks inside, the
/// HTTP layers outside.
pub fn build_router(state: AppState) -> Router {
    let cors = Arc::new(CorsPolicy::new(&state.config.cors_origins));
    let layers = build_http_layers(&state.config);

    Router::new()
        .fallback(front_end)
        .layer(axum::middleware::from_fn_with_state(cors, cors_guard))
        .layer(layers)
        .with_state(state)
}

async fn serve_plain(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("Serving plain HTTP connections");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Serves TLS connections using `axum-server` with rustls, reusing the
/// pre-bound listener.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!("Serving TLS connections on {}", addr);

    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

/// Asks every open socket connection to close, then waits for in-flight
/// work to finish.
async fn drain_connections(connections: &ConnectionRegistry, shutdown: &ShutdownController) {
    shutdown.trigger_shutdown();

    let handles = connections.drain_all();
    if !handles.is_empty() {
        info!("Draining {} connections", handles.len());
        for handle in &handles {
            if !handle.request_close("server shutting down") {
                warn!(id = handle.id.0, "close request not delivered");
            }
        }
    }

    if shutdown.wait_for_drain(DRAIN_TIMEOUT).await {
        info!("All connections drained");
    } else {
        warn!("Drain timeout expired with in-flight work remaining");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::{header, Method, StatusCode};
    use rpcweb_core::ProtocolKind;
    use tower::ServiceExt;

    use super::*;
    use crate::network::handlers::test_support::{add_call, calc_state, read_sum};
    use crate::network::StaticFilesConfig;

    fn request(method: Method, uri: &str, body: Vec<u8>) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body))
            .unwrap()
    }

    fn router(calls: &Arc<AtomicUsize>) -> Router {
        let (state, _) = calc_state(Arc::clone(calls), ProtocolKind::Binary);
        build_router(state)
    }

    #[test]
    fn new_creates_module_without_binding() {
        let module = NetworkModule::new(NetworkConfig::default(), ServiceRegistry::default()).unwrap();
        assert!(module.listener.is_none());
        assert!(Arc::ptr_eq(&module.connections(), &module.connections()));
        assert!(Arc::ptr_eq(
            &module.shutdown_controller(),
            &module.shutdown_controller()
        ));
    }

    #[test]
    fn invalid_static_header_fails_construction() {
        let mut files = StaticFilesConfig::new("/tmp");
        files.headers.push(("\n".into(), "x".into()));
        let config = NetworkConfig {
            static_files: Some(files),
            ..NetworkConfig::default()
        };
        assert!(NetworkModule::new(config, ServiceRegistry::default()).is_err());
    }

    #[tokio::test]
    async fn post_to_registered_route_dispatches_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let response = router(&calls)
            .oneshot(request(
                Method::POST,
                "/calc",
                add_call(ProtocolKind::Binary, 1, 19, 23),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(read_sum(ProtocolKind::Binary, &body), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn post_to_unknown_route_is_not_found() {
        let calls = Arc::new(AtomicUsize::new(0));
        let response = router(&calls)
            .oneshot(request(
                Method::POST,
                "/nope",
                add_call(ProtocolKind::Binary, 1, 1, 1),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn get_without_static_files_is_not_found() {
        let calls = Arc::new(AtomicUsize::new(0));
        let response = router(&calls)
            .oneshot(request(Method::GET, "/calc", Vec::new()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_serves_static_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hello").unwrap();
        let config = NetworkConfig {
            static_files: Some(StaticFilesConfig::new(dir.path())),
            ..NetworkConfig::default()
        };
        let module = NetworkModule::new(config, ServiceRegistry::default()).unwrap();

        let response = module
            .build_router()
            .oneshot(request(Method::GET, "/hello.txt", Vec::new()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn options_is_no_content_and_other_methods_fail() {
        let calls = Arc::new(AtomicUsize::new(0));
        let response = router(&calls)
            .oneshot(request(Method::OPTIONS, "/calc", Vec::new()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router(&calls)
            .oneshot(request(Method::PUT, "/calc", Vec::new()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn cors_applies_to_front_end() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (mut state, _) = calc_state(Arc::clone(&calls), ProtocolKind::Binary);
        state.config = Arc::new(NetworkConfig {
            cors_origins: vec!["http://app.test".to_string()],
            ..NetworkConfig::default()
        });
        let app = build_router(state);

        let preflight = Request::builder()
            .method(Method::OPTIONS)
            .uri("/calc")
            .header(header::ORIGIN, "http://app.test")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(preflight).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://app.test"
        );

        let rejected = Request::builder()
            .method(Method::POST)
            .uri("/calc")
            .header(header::ORIGIN, "http://other.test")
            .body(Body::from(add_call(ProtocolKind::Binary, 1, 1, 1)))
            .unwrap();
        let response = app.oneshot(rejected).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn draining_server_refuses_requests() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (state, _) = calc_state(Arc::clone(&calls), ProtocolKind::Binary);
        state.shutdown.trigger_shutdown();

        let response = build_router(state)
            .oneshot(request(
                Method::POST,
                "/calc",
                add_call(ProtocolKind::Binary, 1, 1, 1),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let config = NetworkConfig {
            host: "127.0.0.1".to_string(),
            ..NetworkConfig::default()
        };
        let mut module = NetworkModule::new(config, ServiceRegistry::default()).unwrap();
        let port = module.start().await.unwrap();
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let module = NetworkModule::new(NetworkConfig::default(), ServiceRegistry::default()).unwrap();
        let err = module.serve(std::future::pending::<()>()).await.unwrap_err();
        assert!(err.to_string().contains("start() must be called"));
    }
}
