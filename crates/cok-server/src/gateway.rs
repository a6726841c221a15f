//! Public HTTP gateway.
//!
//! Every inbound request walks the same ladder: health paths first, then
//! host-suffix matching and subdomain extraction, validation, per-IP rate
//! limiting, size caps, and finally correlation and dispatch toward the
//! owning tunnel. Errors map to plain-text HTTP responses; rate-limit and
//! capacity refusals carry a `Retry-After` header.
//!
//! The correlation slot is registered before the frame is queued on the
//! tunnel link, so the client's response can never beat its slot.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cok_core::ServerError;
use cok_protocol::{
    HttpRequest, Message, MAX_BODY_BYTES, MAX_HEADER_BYTES, MAX_HEADER_COUNT,
    MAX_HEADER_VALUE_BYTES, MAX_PATH_BYTES,
};

use crate::health;
use crate::registry::SendError;
use crate::shutdown::Shutdown;
use crate::state::ServerState;

/// Accept public HTTP connections until shutdown.
pub async fn run_gateway(listener: TcpListener, state: Arc<ServerState>, shutdown: Shutdown) {
    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        "gateway listener started");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "gateway accept failed");
                    continue;
                }
            },
            _ = shutdown.wait() => break,
        };

        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let state = state.clone();
                let shutdown = shutdown.clone();
                async move { handle_request(state, shutdown, peer, req).await }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!(%peer, error = %err, "gateway connection error");
            }
        });
    }

    info!("gateway listener stopped");
}

/// Handle one public HTTP request end to end.
pub async fn handle_request(
    state: Arc<ServerState>,
    shutdown: Shutdown,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();

    if state
        .config
        .health_check_paths
        .iter()
        .any(|p| p == &path)
    {
        return Ok(health::respond(&state, &shutdown, &path));
    }

    let host = match host_of(&req) {
        Some(host) => host,
        None => {
            state.metrics.record_failed();
            return Ok(text_response(StatusCode::BAD_REQUEST, "Missing Host header"));
        }
    };

    if !host_allowed(&state, &host) {
        state.metrics.record_failed();
        return Ok(text_response(StatusCode::NOT_FOUND, "Unknown host"));
    }

    let label = match extract_subdomain(&host, &state.config.base_domain) {
        Some(label) => label.to_string(),
        None => {
            state.metrics.record_failed();
            return Ok(text_response(StatusCode::NOT_FOUND, "Unknown host"));
        }
    };

    let subdomain = match state.validator.validate(&label) {
        Ok(subdomain) => subdomain,
        Err(err) => {
            state.metrics.record_failed();
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                &format!("Invalid subdomain: {}", err),
            ));
        }
    };

    // Per-IP token bucket; refusals advertise when to come back.
    let ip = peer.ip().to_string();
    if !state.http_limiter.try_consume(&ip) {
        state.metrics.record_rate_limited();
        let retry_after = state
            .http_limiter
            .retry_after(&ip)
            .map(|d| d.as_secs_f64())
            .unwrap_or(1.0);
        let mut response = text_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
        if let Ok(value) = format!("{:.3}", retry_after).parse() {
            response.headers_mut().insert("retry-after", value);
        }
        return Ok(response);
    }

    // Reject above the critical pending watermark rather than queueing
    // more work behind a struggling tunnel pool.
    if state.correlator.pending_count() >= state.config.pending_critical {
        state.metrics.record_failed();
        return Ok(text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Gateway is overloaded",
        ));
    }

    if let Err(response) = check_request_shape(&req) {
        state.metrics.record_failed();
        return Ok(response);
    }

    let tunnel = match state.registry.lookup(&subdomain) {
        Some(tunnel) => tunnel,
        None => {
            state.metrics.record_failed();
            return Ok(text_response(
                StatusCode::NOT_FOUND,
                &format!("Tunnel not found: {}", subdomain),
            ));
        }
    };

    let method = req.method().to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or(path);
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect();

    // Body is capped; overflow is a 413 before anything reaches the tunnel.
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(_) => {
            state.metrics.record_failed();
            return Ok(text_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
            ));
        }
    };

    let message = HttpRequest {
        request_id: Uuid::new_v4(),
        method,
        path: path_and_query,
        headers,
        body,
        remote_address: peer.to_string(),
    };
    let request_id = message.request_id;

    // Track first, then dispatch.
    let tracked = match state.correlator.track(request_id, tunnel.id) {
        Ok(tracked) => tracked,
        Err(err) => {
            state.metrics.record_failed();
            warn!(%request_id, error = %err, "failed to track request");
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
            ));
        }
    };

    if let Err(err) = state.registry.send(tunnel.id, &Message::HttpRequest(message)) {
        state.correlator.cancel(request_id);
        state.metrics.record_failed();
        debug!(%request_id, subdomain, error = %err, "dispatch failed");
        let response = match err {
            SendError::TunnelNotFound { .. } => text_response(
                StatusCode::NOT_FOUND,
                &format!("Tunnel not found: {}", subdomain),
            ),
            SendError::LinkBusy => {
                text_response(StatusCode::BAD_GATEWAY, "Tunnel is not keeping up")
            }
            SendError::LinkClosed => {
                text_response(StatusCode::SERVICE_UNAVAILABLE, "Tunnel disconnected")
            }
            SendError::Encode(_) => {
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
            }
        };
        return Ok(response);
    }
    state.metrics.record_forwarded();

    match state.correlator.await_response(tracked).await {
        Ok(reply) => Ok(relay_response(reply)),
        Err(err) => {
            let response = match &err {
                ServerError::RequestTimeout | ServerError::GatewayTimeout => {
                    state.metrics.record_timeout();
                    text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway timeout")
                }
                ServerError::ServiceUnavailable { .. } => {
                    state.metrics.record_failed();
                    text_response(StatusCode::SERVICE_UNAVAILABLE, "Tunnel disconnected")
                }
                other => {
                    state.metrics.record_failed();
                    text_response(
                        StatusCode::from_u16(other.http_status())
                            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                        "Internal error",
                    )
                }
            };
            debug!(%request_id, subdomain, error = %err, "request failed");
            Ok(response)
        }
    }
}

/// Host of the request with any port stripped; IPv6 literals have no
/// subdomain and yield `None`.
fn host_of(req: &Request<Incoming>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .or_else(|| req.uri().authority().map(|a| a.to_string()))?;

    if raw.starts_with('[') {
        return None;
    }
    let host = raw.split(':').next().unwrap_or(&raw);
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// When an allow list is configured, a host must be on it or sit under the
/// base domain.
fn host_allowed(state: &ServerState, host: &str) -> bool {
    if state.config.allowed_hosts.is_empty() {
        return true;
    }
    state
        .config
        .allowed_hosts
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(host))
        || host.ends_with(&format!(".{}", state.config.base_domain))
}

/// The single label in front of the base domain, if the host has exactly
/// that shape.
fn extract_subdomain<'a>(host: &'a str, base_domain: &str) -> Option<&'a str> {
    let suffix = format!(".{}", base_domain);
    let label = host.strip_suffix(&suffix)?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(label)
}

/// Enforce the fixed header and path caps.
fn check_request_shape<B>(req: &Request<B>) -> Result<(), Response<Full<Bytes>>> {
    let path_len = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().len())
        .unwrap_or(0);
    if path_len > MAX_PATH_BYTES {
        return Err(text_response(StatusCode::BAD_REQUEST, "Path too long"));
    }

    let headers = req.headers();
    if headers.len() > MAX_HEADER_COUNT {
        return Err(text_response(StatusCode::BAD_REQUEST, "Too many headers"));
    }

    let mut total = 0usize;
    for (name, value) in headers.iter() {
        if value.as_bytes().len() > MAX_HEADER_VALUE_BYTES {
            return Err(text_response(
                StatusCode::BAD_REQUEST,
                "Header value too large",
            ));
        }
        total += name.as_str().len() + value.as_bytes().len();
    }
    if total > MAX_HEADER_BYTES {
        return Err(text_response(StatusCode::BAD_REQUEST, "Headers too large"));
    }

    Ok(())
}

/// Build the public response from the tunnel's reply.
fn relay_response(reply: cok_protocol::HttpResponse) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(reply.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);

    for (name, value) in &reply.headers {
        // Framing is ours now; connection-level headers from the client's
        // origin would corrupt it.
        let lowered = name.to_ascii_lowercase();
        if matches!(
            lowered.as_str(),
            "connection" | "transfer-encoding" | "content-length" | "keep-alive"
        ) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder
        .body(Full::from(Bytes::from(reply.body)))
        .unwrap_or_else(|_| text_response(StatusCode::BAD_GATEWAY, "Invalid tunnel response"))
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::from(Bytes::from(body.to_string())))
        .expect("static response always builds")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomain_extraction() {
        assert_eq!(extract_subdomain("my-app.localhost", "localhost"), Some("my-app"));
        assert_eq!(
            extract_subdomain("my-app.tunnel.example", "tunnel.example"),
            Some("my-app")
        );
        // Exactly the base domain: no label.
        assert_eq!(extract_subdomain("localhost", "localhost"), None);
        // Wrong suffix.
        assert_eq!(extract_subdomain("my-app.other.host", "localhost"), None);
        // Nested labels are not tunnels.
        assert_eq!(extract_subdomain("a.b.localhost", "localhost"), None);
        // Empty label.
        assert_eq!(extract_subdomain(".localhost", "localhost"), None);
    }

    fn request_with_headers(count: usize) -> Request<()> {
        let mut builder = Request::builder().uri("http://my-app.localhost/");
        for i in 0..count {
            builder = builder.header(format!("x-h-{}", i), "v");
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn header_count_boundary() {
        // Exactly 100 headers pass; 101 are refused.
        assert!(check_request_shape(&request_with_headers(MAX_HEADER_COUNT)).is_ok());
        let refused = check_request_shape(&request_with_headers(MAX_HEADER_COUNT + 1))
            .unwrap_err();
        assert_eq!(refused.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn oversized_header_value_refused() {
        let req = Request::builder()
            .uri("http://my-app.localhost/")
            .header("x-big", "v".repeat(MAX_HEADER_VALUE_BYTES + 1))
            .body(())
            .unwrap();
        let refused = check_request_shape(&req).unwrap_err();
        assert_eq!(refused.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn oversized_path_refused() {
        let long_path = format!("/{}", "p".repeat(MAX_PATH_BYTES + 1));
        let req = Request::builder()
            .uri(format!("http://my-app.localhost{}", long_path))
            .body(())
            .unwrap();
        let refused = check_request_shape(&req).unwrap_err();
        assert_eq!(refused.status(), StatusCode::BAD_REQUEST);

        let ok_path = format!("/{}", "p".repeat(MAX_PATH_BYTES - 1));
        let req = Request::builder()
            .uri(format!("http://my-app.localhost{}", ok_path))
            .body(())
            .unwrap();
        assert!(check_request_shape(&req).is_ok());
    }

    #[test]
    fn aggregate_header_size_refused() {
        // 10 headers of ~1.7 KiB each stay under the per-value cap but
        // blow the 16 KiB aggregate.
        let mut builder = Request::builder().uri("http://my-app.localhost/");
        for i in 0..10 {
            builder = builder.header(format!("x-h-{}", i), "v".repeat(1700));
        }
        let req = builder.body(()).unwrap();
        let refused = check_request_shape(&req).unwrap_err();
        assert_eq!(refused.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn relay_strips_connection_headers() {
        let reply = cok_protocol::HttpResponse {
            request_id: Uuid::new_v4(),
            status_code: 200,
            headers: vec![
                ("content-type".to_string(), "text/html".to_string()),
                ("Transfer-Encoding".to_string(), "chunked".to_string()),
                ("Connection".to_string(), "close".to_string()),
                ("content-length".to_string(), "999".to_string()),
            ],
            body: b"ok".to_vec(),
        };
        let response = relay_response(reply);
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("content-type"));
        assert!(!response.headers().contains_key("transfer-encoding"));
        assert!(!response.headers().contains_key("connection"));
        assert!(!response.headers().contains_key("content-length"));
    }

    #[test]
    fn relay_tolerates_unknown_status() {
        let reply = cok_protocol::HttpResponse {
            request_id: Uuid::new_v4(),
            status_code: 99,
            headers: vec![],
            body: vec![],
        };
        let response = relay_response(reply);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn text_response_sets_content_type() {
        let response = text_response(StatusCode::NOT_FOUND, "Tunnel not found: nope");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
