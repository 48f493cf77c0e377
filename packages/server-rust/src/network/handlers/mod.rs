//! HTTP and socket handlers for the rpcweb server.
//!
//! Every request reaches [`front_end`], which routes by method:
//! upgrade requests to [`upgrade`], POST to the route's processor via
//! [`rpc`], GET/HEAD to [`static_files`], OPTIONS to an empty 204.

pub mod rpc;
pub mod static_files;
pub mod upgrade;

#[cfg(test)]
pub(crate) mod test_support;

pub use rpc::handle_post;
pub use static_files::StaticFiles;
pub use upgrade::{accept_key, handle_upgrade, is_upgrade_request, serve_connection};

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::{ConnectionRegistry, NetworkConfig, ShutdownController};
use crate::service::ServiceRegistry;

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Route table built at startup.
    pub services: Arc<ServiceRegistry>,
    /// Registry of all open socket connections.
    pub connections: Arc<ConnectionRegistry>,
    /// Graceful shutdown controller with phase and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Network configuration (bind address, TLS, per-connection settings).
    pub config: Arc<NetworkConfig>,
    /// Static file tree for GET requests, if configured.
    pub static_files: Option<StaticFiles>,
}

impl AppState {
    /// Creates state with fresh connection and shutdown tracking.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured static header is not a valid HTTP header.
    pub fn new(config: NetworkConfig, services: ServiceRegistry) -> anyhow::Result<Self> {
        let static_files = config.static_files.as_ref().map(StaticFiles::new).transpose()?;
        Ok(Self {
            services: Arc::new(services),
            connections: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
            config: Arc::new(config),
            static_files,
        })
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// Routes every request by method and path.
pub async fn front_end(State(state): State<AppState>, request: Request) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }
    if is_upgrade_request(request.headers()) {
        return handle_upgrade(state, request).await;
    }

    let method = request.method().clone();
    match method {
        Method::POST => {
            let Some(record) = state.services.get(request.uri().path()) else {
                debug!(route = request.uri().path(), "POST to unknown route");
                return not_found();
            };
            handle_post(&state, &record, request.into_body()).await
        }
        Method::GET | Method::HEAD => match &state.static_files {
            Some(files) => files.serve(request).await,
            None => not_found(),
        },
        Method::OPTIONS => StatusCode::NO_CONTENT.into_response(),
        other => {
            debug!(method = %other, "unsupported method");
            (StatusCode::INTERNAL_SERVER_ERROR, "Unsupported method").into_response()
        }
    }
}
