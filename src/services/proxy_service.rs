use std::{sync::Arc, time::Duration};

use axum::{
    body::{Body, to_bytes},
    extract::Request,
    http::{HeaderMap, HeaderName, header},
    response::Response,
};
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

/// Largest request body forwarded to the engine.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Connection-scoped headers that never cross the proxy.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Failures of the engine passthrough.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Building the HTTP client failed.
    #[error("failed to build proxy client")]
    ClientBuilder {
        /// Builder failure.
        #[source]
        source: reqwest::Error,
    },
    /// The incoming body could not be buffered.
    #[error("failed to read request body")]
    ReadBody {
        /// Body stream failure.
        #[source]
        source: axum::Error,
    },
    /// The engine could not be reached or its answer was cut.
    #[error("failed to reach the game engine")]
    Upstream {
        /// Transport failure.
        #[source]
        source: reqwest::Error,
    },
}

/// Forwards requests the lobby does not handle itself to the game engine.
#[derive(Clone)]
pub struct EngineProxy {
    client: Client,
    base_url: Arc<str>,
}

impl EngineProxy {
    /// Proxy rooted at `base_url`; `timeout` bounds each forwarded request.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProxyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ProxyError::ClientBuilder { source })?;
        Ok(Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
        })
    }

    /// Replay `request` against the engine and relay its answer.
    pub async fn forward(&self, request: Request) -> Result<Response, ProxyError> {
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|path| path.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base_url, path);
        let body = to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|source| ProxyError::ReadBody { source })?;

        debug!(method = %parts.method, url = %url, "forwarding request to engine");
        let upstream = self
            .client
            .request(parts.method, url)
            .headers(without_hop_by_hop(parts.headers))
            .body(body)
            .send()
            .await
            .map_err(|source| ProxyError::Upstream { source })?;

        let status = upstream.status();
        let headers = without_hop_by_hop(upstream.headers().clone());
        let bytes = upstream
            .bytes()
            .await
            .map_err(|source| ProxyError::Upstream { source })?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn without_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::CONTENT_LENGTH);
    headers
}
