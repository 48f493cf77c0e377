//! HTTP middleware stack for the rpcweb server.
//!
//! Middleware ordering follows the outer-to-inner convention: the first
//! layer listed is the outermost (processes the request first on the way
//! in, and the response last on the way out).

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use super::config::NetworkConfig;

/// The composed Tower layer type produced by [`build_http_layers`].
type HttpLayers = tower::layer::util::Stack<
    PropagateRequestIdLayer,
    tower::layer::util::Stack<
        TimeoutLayer,
        tower::layer::util::Stack<
            CompressionLayer,
            tower::layer::util::Stack<
                TraceLayer<
                    tower_http::classify::SharedClassifier<
                        tower_http::classify::ServerErrorsAsFailures,
                    >,
                >,
                tower::layer::util::Stack<
                    SetRequestIdLayer<MakeRequestUuid>,
                    tower::layer::util::Identity,
                >,
            >,
        >,
    >,
>;

/// Builds the HTTP-level Tower middleware stack.
///
/// **Outermost to innermost:**
/// 1. `SetRequestId` -- assigns an `X-Request-Id` to every incoming request
/// 2. `Tracing` -- request/response spans
/// 3. `Compression` -- gzip for static files and large replies
/// 4. `Timeout` -- caps request processing time
/// 5. `PropagateRequestId` -- copies `X-Request-Id` onto the response
///
/// Origin checks run inside this stack via [`cors_guard`].
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let x_request_id = HeaderName::from_static("x-request-id");

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}

// ---------------------------------------------------------------------------
// CORS
// ---------------------------------------------------------------------------

/// Origins allowed to make cross-origin requests.
#[derive(Debug, Clone, Default)]
pub struct CorsPolicy {
    any: bool,
    origins: HashSet<String>,
}

impl CorsPolicy {
    /// `"*"` allows every origin; an empty list turns origin checks off.
    #[must_use]
    pub fn new(origins: &[String]) -> Self {
        Self {
            any: origins.iter().any(|o| o == "*"),
            origins: origins.iter().filter(|o| *o != "*").cloned().collect(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.any || !self.origins.is_empty()
    }

    #[must_use]
    pub fn allows(&self, origin: &str) -> bool {
        self.any || self.origins.contains(origin)
    }
}

/// Rejects requests from disallowed origins with 403 and adds the CORS
/// response headers for allowed ones. Requests without an `Origin` header,
/// or with origin checks off, pass through untouched.
pub async fn cors_guard(
    State(policy): State<Arc<CorsPolicy>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .filter(|_| policy.is_enabled())
        .cloned();
    let Some(origin) = origin else {
        return next.run(request).await;
    };

    let text = origin.to_str().unwrap_or_default();
    if !policy.allows(text) {
        debug!(origin = text, "origin rejected");
        return (StatusCode::FORBIDDEN, format!("Origin {text} not allowed")).into_response();
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type, accept"),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("60"));
    response
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    use super::*;

    fn app(origins: &[&str]) -> Router {
        let origins: Vec<String> = origins.iter().map(ToString::to_string).collect();
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                Arc::new(CorsPolicy::new(&origins)),
                cors_guard,
            ))
    }

    fn request(origin: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/");
        if let Some(origin) = origin {
            builder = builder.header(header::ORIGIN, origin);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn build_http_layers_with_custom_timeout() {
        let config = NetworkConfig {
            request_timeout: Duration::from_secs(5),
            ..NetworkConfig::default()
        };
        let _layers = build_http_layers(&config);
    }

    #[test]
    fn policy_matching() {
        let off = CorsPolicy::new(&[]);
        assert!(!off.is_enabled());

        let any = CorsPolicy::new(&["*".to_string()]);
        assert!(any.is_enabled());
        assert!(any.allows("http://anything.test"));

        let list = CorsPolicy::new(&["http://a.test".to_string()]);
        assert!(list.allows("http://a.test"));
        assert!(!list.allows("http://b.test"));
    }

    #[tokio::test]
    async fn allowed_origin_gets_headers() {
        let response = app(&["http://a.test"])
            .oneshot(request(Some("http://a.test")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://a.test");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "GET, POST, OPTIONS");
        assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "60");
    }

    #[tokio::test]
    async fn disallowed_origin_is_forbidden() {
        let response = app(&["http://a.test"])
            .oneshot(request(Some("http://evil.test")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"Origin http://evil.test not allowed");
    }

    #[tokio::test]
    async fn no_origin_or_no_policy_passes_through() {
        let response = app(&["http://a.test"]).oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());

        let response = app(&[]).oneshot(request(Some("http://evil.test"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }
}
