//! Reverse proxy for the HTTP services behind the gateway.

use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use metrics::counter;
use tracing::{debug, warn};

use crate::errors::{GatewayError, Result};
use crate::metrics::PROXY_REQUESTS_TOTAL;

/// Headers that describe a single hop and are never forwarded.
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Forwards requests to upstream base URLs with a shared client.
#[derive(Clone, Debug)]
pub struct ProxyClient {
    http: reqwest::Client,
}

impl ProxyClient {
    /// Build a client whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Client(e.to_string()))?;
        Ok(Self { http })
    }

    /// Forward `req` to `base` + its path and query, streaming both bodies.
    ///
    /// Upstream failures (connect, timeout) become `503 Service Unavailable`.
    pub async fn forward(&self, service: &'static str, base: &str, req: Request) -> Response {
        match self.try_forward(base, req).await {
            Ok(resp) => {
                counter!(
                    PROXY_REQUESTS_TOTAL,
                    "service" => service,
                    "status" => resp.status().as_u16().to_string()
                )
                .increment(1);
                resp
            }
            Err(e) => {
                warn!(service, error = %e, "proxy request failed");
                counter!(PROXY_REQUESTS_TOTAL, "service" => service, "status" => "503")
                    .increment(1);
                (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response()
            }
        }
    }

    async fn try_forward(&self, base: &str, req: Request) -> Result<Response> {
        let path = req
            .uri()
            .path_and_query()
            .map_or("/", axum::http::uri::PathAndQuery::as_str);
        let url = format!("{}{path}", base.trim_end_matches('/'));
        let (parts, body) = req.into_parts();
        debug!(method = %parts.method, %url, "proxying");

        let upstream = self
            .http
            .request(parts.method, &url)
            .headers(forwardable(&parts.headers))
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await?;

        let status = upstream.status();
        let headers = forwardable(upstream.headers());
        let mut resp = Response::new(Body::from_stream(upstream.bytes_stream()));
        *resp.status_mut() = status;
        *resp.headers_mut() = headers;
        Ok(resp)
    }
}

/// Copy of `headers` without hop-by-hop entries.
fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !HOP_BY_HOP.contains(name) {
            let _ = out.append(name.clone(), value.clone());
        }
    }
    out
}
