//! # Local Forwarder
//!
//! Replays relayed requests against the local service and converts the
//! outcome back into an [`HttpResponse`]. Local failures never escape:
//! [`forward`] turns them into a `502` with a plain-text diagnostic.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use tracing::{debug, warn};
use tunnel_protocol::{
    canonical_header_name, is_hop_by_hop, strip_hop_by_hop, Headers, HttpRequest, HttpResponse,
};

use crate::error::LocalCallError;

/// Where relayed requests end up.
#[async_trait]
pub trait LocalTarget: Send + Sync + 'static {
    async fn call(&self, request: HttpRequest) -> Result<HttpResponse, LocalCallError>;
}

/// Forwards to a fixed `http://host:port` base URL.
pub struct HttpForwarder {
    client: reqwest::Client,
    base: String,
}

impl HttpForwarder {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LocalTarget for HttpForwarder {
    async fn call(&self, request: HttpRequest) -> Result<HttpResponse, LocalCallError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| LocalCallError::InvalidMethod(request.method.clone()))?;
        let url = format!("{}{}", self.base, request.path);

        let response = self
            .client
            .request(method, url)
            .headers(outbound_headers(&request.headers))
            .body(request.body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = inbound_headers(response.headers());
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Run one relayed request, mapping any failure to a synthetic 502.
pub async fn forward(target: &dyn LocalTarget, request: HttpRequest) -> HttpResponse {
    let method = request.method.clone();
    let path = request.path.clone();
    match target.call(request).await {
        Ok(response) => {
            debug!(%method, %path, status = response.status, "local call complete");
            response
        }
        Err(e) => {
            warn!(%method, %path, error = %e, "local call failed");
            HttpResponse::text(502, format!("Bad Gateway: {e}"))
        }
    }
}

/// Headers for the local call: hop-by-hop fields and `Host` are dropped,
/// every value of a repeated header is kept.
fn outbound_headers(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(header = %name, "skipping invalid header name");
            continue;
        };
        for value in values {
            match HeaderValue::from_bytes(value.as_bytes()) {
                Ok(value) => {
                    map.append(name.clone(), value);
                }
                Err(_) => warn!(header = %name, "skipping invalid header value"),
            }
        }
    }
    map
}

fn inbound_headers(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        out.entry(canonical_header_name(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    strip_hop_by_hop(&mut out);
    out
}
