//! Loopback forwarder: turns tunnelled requests into local HTTP calls.
//!
//! The circuit breaker is consulted before every call. An open breaker
//! short-circuits to a synthetic 503 without touching the origin; transport
//! failures produce a synthetic 502 and feed the breaker. Whatever happens,
//! the tunnel always gets *some* `HttpResponse` back for the request id.

use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use cok_core::{CircuitBreaker, CircuitBreakerConfig, ClientError};
use cok_protocol::{HttpRequest, HttpResponse};

/// Hop-by-hop headers that must not be replayed toward the origin.
const SKIPPED_REQUEST_HEADERS: &[&str] =
    &["host", "connection", "content-length", "transfer-encoding", "keep-alive"];

/// Forwards tunnelled requests to one local origin.
pub struct Forwarder {
    client: reqwest::Client,
    base_url: String,
    host: String,
    port: u16,
    breaker: CircuitBreaker,
}

impl Forwarder {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        breaker_config: CircuitBreakerConfig,
    ) -> Result<Self, ClientError> {
        let host = host.into();
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| ClientError::ConnectionFailed {
                message: err.to_string(),
            })?;
        Ok(Forwarder {
            base_url: format!("http://{}:{}", host, port),
            client,
            host,
            port,
            breaker: CircuitBreaker::new(breaker_config),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Where this forwarder points.
    pub fn origin(&self) -> (&str, u16) {
        (&self.host, self.port)
    }

    /// Forward one request. Always yields a response for the request id;
    /// failures are synthesized as 502/503.
    pub async fn forward(&self, request: HttpRequest) -> HttpResponse {
        let request_id = request.request_id;

        if !self.breaker.can_attempt() {
            debug!(%request_id, "circuit open, refusing without an attempt");
            self.breaker.record_failure();
            return synthetic(request_id, 503, "Service Unavailable");
        }

        let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                warn!(%request_id, method = %request.method, "unforwardable method");
                return synthetic(request_id, 502, "Bad Gateway");
            }
        };

        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.client.request(method, &url);
        for (name, value) in &request.headers {
            if SKIPPED_REQUEST_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        match builder.send().await {
            Ok(response) => {
                self.breaker.record_success();
                let status = response.status().as_u16();
                let headers: Vec<(String, String)> = response
                    .headers()
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.as_str().to_string(),
                            String::from_utf8_lossy(value.as_bytes()).to_string(),
                        )
                    })
                    .collect();
                let body = response
                    .bytes()
                    .await
                    .map(|bytes| bytes.to_vec())
                    .unwrap_or_default();
                debug!(%request_id, status, bytes = body.len(), "origin answered");
                HttpResponse {
                    request_id,
                    status_code: status,
                    headers,
                    body,
                }
            }
            Err(err) => {
                self.breaker.record_failure();
                warn!(%request_id, origin = %self.base_url, error = %err,
                    "origin unreachable");
                synthetic(request_id, 502, "Bad Gateway")
            }
        }
    }
}

fn synthetic(request_id: Uuid, status: u16, reason: &str) -> HttpResponse {
    HttpResponse {
        request_id,
        status_code: status,
        headers: vec![(
            "content-type".to_string(),
            "text/plain; charset=utf-8".to_string(),
        )],
        body: reason.as_bytes().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal origin: answers every request with 200 "pong".
    async fn spawn_origin() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut seen = Vec::new();
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) => return,
                            Ok(n) => {
                                seen.extend_from_slice(&buf[..n]);
                                if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\ncontent-type: text/plain\r\nconnection: close\r\n\r\npong",
                        )
                        .await;
                });
            }
        });
        port
    }

    fn request(path: &str) -> HttpRequest {
        HttpRequest {
            request_id: Uuid::new_v4(),
            method: "GET".to_string(),
            path: path.to_string(),
            headers: vec![("accept".to_string(), "*/*".to_string())],
            body: vec![],
            remote_address: "203.0.113.9:1".to_string(),
        }
    }

    #[tokio::test]
    async fn forwards_to_origin() {
        let port = spawn_origin().await;
        let forwarder =
            Forwarder::new("127.0.0.1", port, CircuitBreakerConfig::default()).unwrap();

        let req = request("/ping");
        let id = req.request_id;
        let response = forwarder.forward(req).await;
        assert_eq!(response.request_id, id);
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, b"pong");
    }

    #[tokio::test]
    async fn unreachable_origin_synthesizes_502_and_counts_failure() {
        // Nothing listens on this port.
        let forwarder =
            Forwarder::new("127.0.0.1", 1, CircuitBreakerConfig::default()).unwrap();

        let response = forwarder.forward(request("/x")).await;
        assert_eq!(response.status_code, 502);
        assert_eq!(response.body, b"Bad Gateway");
        assert_eq!(forwarder.breaker().failure_count(), 1);
    }

    #[tokio::test]
    async fn open_breaker_synthesizes_503_without_attempting() {
        let forwarder = Forwarder::new(
            "127.0.0.1",
            1,
            CircuitBreakerConfig {
                failure_threshold: 2,
                open_timeout: Duration::from_secs(60),
            },
        )
        .unwrap();

        // Trip the breaker with two real failures.
        assert_eq!(forwarder.forward(request("/a")).await.status_code, 502);
        assert_eq!(forwarder.forward(request("/b")).await.status_code, 502);
        assert_eq!(
            forwarder.breaker().state(),
            cok_core::BreakerState::Open
        );

        // Now refusals are immediate 503s.
        let response = forwarder.forward(request("/c")).await;
        assert_eq!(response.status_code, 503);
        assert_eq!(response.body, b"Service Unavailable");
    }

    #[tokio::test]
    async fn success_closes_breaker_again() {
        let port = spawn_origin().await;
        let forwarder =
            Forwarder::new("127.0.0.1", port, CircuitBreakerConfig::default()).unwrap();

        forwarder.breaker().record_failure();
        forwarder.breaker().record_failure();
        let response = forwarder.forward(request("/ping")).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(forwarder.breaker().failure_count(), 0);
    }
}
