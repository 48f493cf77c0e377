//! Static file serving for GET and HEAD requests.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use axum::response::Response;
use tower::ServiceExt;
use tower_http::services::ServeDir;

use crate::network::StaticFilesConfig;

/// A directory served over HTTP, plus headers added to every hit.
#[derive(Clone)]
pub struct StaticFiles {
    dir: ServeDir,
    headers: Arc<Vec<(HeaderName, HeaderValue)>>,
}

impl StaticFiles {
    /// Directories resolve to their `index.html`.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured header name or value is invalid.
    pub fn new(config: &StaticFilesConfig) -> anyhow::Result<Self> {
        let headers = config
            .headers
            .iter()
            .map(|(name, value)| {
                Ok((
                    HeaderName::try_from(name.as_str())?,
                    HeaderValue::try_from(value.as_str())?,
                ))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            dir: ServeDir::new(&config.root),
            headers: Arc::new(headers),
        })
    }

    /// Serves the file at the request path; missing files get 404.
    pub async fn serve(&self, request: Request) -> Response {
        let response = match self.dir.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };
        let mut response = response.map(Body::new);
        if response.status().is_success() {
            let headers = response.headers_mut();
            for (name, value) in self.headers.iter() {
                headers.insert(name.clone(), value.clone());
            }
        }
        response
    }
}
