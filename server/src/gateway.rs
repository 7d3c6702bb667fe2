//! # Public Gateway
//!
//! Turns public HTTP requests into relayed tunnel requests and the agent's
//! answers back into HTTP responses.
//!
//! Public URLs follow `/<share-prefix>/<tunnel-id>/<path>`; the agent sees
//! the request as `/<path>` with the original query string. Request bodies
//! are read completely before relaying, so their size is bounded by
//! `--max-body-bytes` rather than streamed.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};
use tunnel_protocol::{
    canonical_header_name, is_hop_by_hop, strip_hop_by_hop, Headers, HttpRequest, HttpResponse,
};

use crate::error::GatewayError;
use crate::state::AppState;

/// Fallback handler: every path that is not `/ws` or an API route.
pub async fn handle_public_request(State(state): State<AppState>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    match relay(&state, request).await {
        Ok(response) => {
            debug!(%method, %path, status = response.status().as_u16(), "relayed public request");
            response
        }
        Err(e) => {
            debug!(%method, %path, error = %e, "public request failed");
            e.into_response()
        }
    }
}

async fn relay(state: &AppState, request: Request) -> Result<Response, GatewayError> {
    let (parts, body) = request.into_parts();
    let (tunnel_id, forward_path) = parse_public_path(
        state.registry.share_prefix(),
        parts.uri.path(),
        parts.uri.query(),
    )?;

    let session = state
        .registry
        .lookup(&tunnel_id)
        .ok_or(GatewayError::TunnelNotActive)?;

    // Also fails when the client hangs up mid-body; nobody reads the 413 then.
    let body = axum::body::to_bytes(body, state.config.max_body_bytes)
        .await
        .map_err(|_| GatewayError::BodyTooLarge)?;

    let response = session
        .send_request(HttpRequest {
            method: parts.method.to_string(),
            path: forward_path,
            headers: collect_headers(&parts.headers),
            body: body.to_vec(),
        })
        .await?;

    build_response(response)
}

/// Split a public path into the tunnel id and the path to forward.
///
/// `/share/abc/foo` with query `x=1` → `("abc", "/foo?x=1")`;
/// `/share/abc` → `("abc", "/")`.
pub fn parse_public_path(
    prefix: &str,
    path: &str,
    query: Option<&str>,
) -> Result<(String, String), GatewayError> {
    let rest = path
        .strip_prefix('/')
        .and_then(|p| p.strip_prefix(prefix))
        .and_then(|p| p.strip_prefix('/'))
        .ok_or(GatewayError::MalformedPublicPath)?;

    let (tunnel_id, remainder) = rest.split_once('/').unwrap_or((rest, ""));
    if tunnel_id.is_empty() {
        return Err(GatewayError::MalformedPublicPath);
    }

    let mut forward_path = format!("/{remainder}");
    if let Some(query) = query {
        forward_path.push('?');
        forward_path.push_str(query);
    }
    Ok((tunnel_id.to_string(), forward_path))
}

/// Copy request headers into envelope form, keeping every value in order
/// and dropping hop-by-hop headers.
pub fn collect_headers(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        out.entry(canonical_header_name(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    strip_hop_by_hop(&mut out);
    out
}

/// Build the public response from the agent's answer. Hop-by-hop headers
/// are dropped; all other headers are copied with every value.
pub fn build_response(relayed: HttpResponse) -> Result<Response, GatewayError> {
    let status = StatusCode::from_u16(relayed.status).map_err(|_| {
        GatewayError::InvalidUpstreamResponse(format!("status code {}", relayed.status))
    })?;

    let mut response = Response::new(Body::from(relayed.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, values) in relayed.headers {
        if is_hop_by_hop(&name) {
            continue;
        }
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(header = %name, "dropping invalid response header name");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(&value) {
                Ok(value) => {
                    headers.append(header_name.clone(), value);
                }
                Err(_) => warn!(header = %name, "dropping invalid response header value"),
            }
        }
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::provisioner::StaticEndpoint;
    use crate::registry::SessionRegistry;
    use crate::session::SessionSettings;
    use futures::channel::mpsc::unbounded;
    use futures::StreamExt;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use tunnel_protocol::Envelope;

    fn test_state(settings: SessionSettings, config: Config) -> AppState {
        let registry = SessionRegistry::new(
            Arc::new(StaticEndpoint::new("https://x.example")),
            "share",
            settings,
        );
        AppState::new(Arc::new(registry), Arc::new(config))
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_parse_public_path() {
        assert_eq!(
            parse_public_path("share", "/share/abc/foo", Some("x=1")).unwrap(),
            ("abc".to_string(), "/foo?x=1".to_string())
        );
        assert_eq!(
            parse_public_path("share", "/share/abc", None).unwrap(),
            ("abc".to_string(), "/".to_string())
        );
        assert_eq!(
            parse_public_path("share", "/share/abc/", None).unwrap(),
            ("abc".to_string(), "/".to_string())
        );
        assert_eq!(
            parse_public_path("share", "/share/abc/a/b/c", None).unwrap(),
            ("abc".to_string(), "/a/b/c".to_string())
        );
    }

    #[test]
    fn test_parse_malformed_paths() {
        for path in ["/", "/share", "/share/", "/share//foo", "/sharex/abc", "/other/abc"] {
            assert!(
                matches!(
                    parse_public_path("share", path, None),
                    Err(GatewayError::MalformedPublicPath)
                ),
                "{path} should be rejected"
            );
        }
    }

    #[test]
    fn test_collect_headers_keeps_duplicates() {
        let mut headers = HeaderMap::new();
        headers.append("x-a", HeaderValue::from_static("1"));
        headers.append("x-a", HeaderValue::from_static("2"));
        headers.append("connection", HeaderValue::from_static("keep-alive"));
        headers.append("content-length", HeaderValue::from_static("0"));
        headers.append("accept", HeaderValue::from_static("*/*"));

        let collected = collect_headers(&headers);
        assert_eq!(collected.len(), 2);
        assert_eq!(collected["X-A"], vec!["1", "2"]);
        assert_eq!(collected["Accept"], vec!["*/*"]);
    }

    #[test]
    fn test_build_response_strips_hop_by_hop() {
        let mut headers = Headers::new();
        headers.insert("Set-Cookie".into(), vec!["a=1".into(), "b=2".into()]);
        headers.insert("Transfer-Encoding".into(), vec!["chunked".into()]);
        headers.insert("Content-Length".into(), vec!["999".into()]);
        let response = build_response(HttpResponse {
            status: 201,
            headers,
            body: b"done".to_vec(),
        })
        .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let cookies: Vec<_> = response.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert!(response.headers().get("transfer-encoding").is_none());
        assert!(response.headers().get("content-length").is_none());
    }

    #[test]
    fn test_build_response_rejects_bad_status() {
        let result = build_response(HttpResponse {
            status: 1000,
            ..Default::default()
        });
        assert!(matches!(result, Err(GatewayError::InvalidUpstreamResponse(_))));
    }

    #[tokio::test]
    async fn test_malformed_path_is_bad_request() {
        let state = test_state(SessionSettings::default(), Config::default());
        let response = crate::router(state)
            .oneshot(axum::http::Request::builder().uri("/nowhere").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_tunnel_is_unavailable() {
        let state = test_state(SessionSettings::default(), Config::default());
        let registry = Arc::clone(&state.registry);
        let response = crate::router(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/share/missing/foo")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let config = Config {
            max_body_bytes: 4,
            ..Default::default()
        };
        let state = test_state(SessionSettings::default(), config);
        let session = state.registry.register("abc").unwrap();
        let response = crate::router(state)
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/share/abc/upload")
                    .body(Body::from("too many bytes"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_relay_scenario() {
        let state = test_state(SessionSettings::default(), Config::default());
        let session = state.registry.register("abc").unwrap();

        let (to_agent, mut from_session) = unbounded::<String>();
        let (to_session, from_agent) = unbounded::<String>();
        tokio::spawn(Arc::clone(&session).run(to_agent, from_agent.map(Ok::<String, Infallible>)));

        let agent = tokio::spawn(async move {
            let ack = Envelope::decode(&from_session.next().await.unwrap()).unwrap();
            assert_eq!(
                ack,
                Envelope::RegisterAck {
                    tunnel_id: "abc".into(),
                    public_url: "https://x.example/share/abc".into(),
                }
            );

            let request = Envelope::decode(&from_session.next().await.unwrap()).unwrap();
            let Envelope::Request {
                correlation_id,
                method,
                path,
                headers,
                body,
            } = request
            else {
                panic!("expected request, got {request:?}");
            };
            assert_eq!(method, "GET");
            assert_eq!(path, "/foo?x=1");
            assert_eq!(headers["X-A"], vec!["1", "2"]);
            assert!(body.is_empty());

            let mut reply_headers = Headers::new();
            reply_headers.insert("X-A".into(), vec!["1".into()]);
            reply_headers.insert("Connection".into(), vec!["close".into()]);
            to_session
                .unbounded_send(
                    Envelope::response(
                        correlation_id,
                        HttpResponse {
                            status: 200,
                            headers: reply_headers,
                            body: b"hi".to_vec(),
                        },
                    )
                    .encode()
                    .unwrap(),
                )
                .unwrap();
            to_session
        });

        let response = crate::router(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/share/abc/foo?x=1")
                    .header("X-A", "1")
                    .header("X-A", "2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let _keep_open = agent.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let values: Vec<_> = response.headers().get_all("x-a").iter().collect();
        assert_eq!(values, vec!["1"]);
        assert!(response.headers().get("connection").is_none());
        assert_eq!(body_text(response).await, "hi");
    }

    #[tokio::test]
    async fn test_silent_agent_times_out() {
        let settings = SessionSettings {
            request_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let state = test_state(settings, Config::default());
        let session = state.registry.register("abc").unwrap();

        let (to_agent, _from_session) = unbounded::<String>();
        let (_to_session, from_agent) = unbounded::<String>();
        tokio::spawn(Arc::clone(&session).run(to_agent, from_agent.map(Ok::<String, Infallible>)));

        let response = crate::router(state)
            .oneshot(axum::http::Request::builder().uri("/share/abc/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_session_closed_mid_flight_is_bad_gateway() {
        let state = test_state(SessionSettings::default(), Config::default());
        let session = state.registry.register("abc").unwrap();

        let (to_agent, mut from_session) = unbounded::<String>();
        let (_to_session, from_agent) = unbounded::<String>();
        tokio::spawn(Arc::clone(&session).run(to_agent, from_agent.map(Ok::<String, Infallible>)));

        let closer = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                // Ack, then the relayed request.
                from_session.next().await.unwrap();
                from_session.next().await.unwrap();
                session.close();
            })
        };

        let response = crate::router(state)
            .oneshot(axum::http::Request::builder().uri("/share/abc/x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        closer.await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
