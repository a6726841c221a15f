//! Control-channel listener and per-connection protocol handling.
//!
//! Each accepted TCP connection must open with a `ConnectRequest` frame.
//! After a successful handshake the connection splits into two tasks: this
//! one keeps reading frames (responses, pings, disconnects) while a writer
//! task drains the tunnel's link queue. The link is the only writer after
//! the handshake, so outbound frames are serialized per connection.
//!
//! Any fatal decode error closes the connection; the client is expected to
//! reconnect and re-handshake.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use cok_core::ServerError;
use cok_protocol::{
    ConnectResponse, Disconnect, DisconnectReason, ErrorMessage, Frame, FrameDecoder, FrameFlags,
    Message, Pong,
};

use crate::registry::{Tunnel, TunnelLink, TunnelLinkRx};
use crate::shutdown::Shutdown;
use crate::state::{now_ms, ServerState};

/// Read chunk size for control sockets.
const READ_CHUNK: usize = 64 * 1024;

/// Accept control connections until shutdown.
pub async fn run_control_listener(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: Shutdown,
) {
    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        "control listener started");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "control accept failed");
                    continue;
                }
            },
            _ = shutdown.wait() => break,
        };

        let ip = peer.ip().to_string();
        if !state.conn_limiter.try_consume(&ip) {
            debug!(%peer, "control connection rate limited");
            let retry_after = state
                .conn_limiter
                .retry_after(&ip)
                .map(|d| format!("{:.0}", d.as_secs_f64().ceil()))
                .unwrap_or_else(|| "60".to_string());
            tokio::spawn(reject_rate_limited(stream, retry_after));
            continue;
        }

        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer, state, shutdown).await {
                debug!(%peer, error = %err, "control connection ended with error");
            }
        });
    }

    info!("control listener stopped");
}

/// Tell an over-eager client to back off, then hang up.
async fn reject_rate_limited<S>(mut stream: S, retry_after: String)
where
    S: AsyncWrite + Unpin,
{
    let message = Message::Error(ErrorMessage {
        code: 429,
        message: "connection rate limit exceeded".to_string(),
        metadata: [("retry_after".to_string(), retry_after)].into_iter().collect(),
    });
    let _ = write_message(&mut stream, &message).await;
    let _ = stream.shutdown().await;
}

/// Run one control connection to completion.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    state: Arc<ServerState>,
    shutdown: Shutdown,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let decoder = FrameDecoder::new();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    // Handshake: the first frame must be a ConnectRequest, within the
    // handshake timeout.
    let first = tokio::time::timeout(
        state.config.handshake_timeout,
        read_frame(&mut read_half, &decoder, &mut buf),
    )
    .await;

    let frame = match first {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(err)) => {
            warn!(%peer, error = %err, "handshake failed to decode");
            return Ok(());
        }
        Err(_) => {
            debug!(%peer, "handshake timed out");
            return Ok(());
        }
    };
    state.metrics.record_frame_in(frame.payload.len());

    let request = match Message::from_frame(&frame) {
        Ok(Message::ConnectRequest(request)) => request,
        Ok(other) => {
            warn!(%peer, message_type = %other.message_type(), "first frame was not a connect request");
            return Ok(());
        }
        Err(err) => {
            warn!(%peer, error = %err, "connect request failed to decode");
            return Ok(());
        }
    };

    // Resolve the subdomain and authenticate the key against it.
    let subdomain = match authenticate(&state, &request.api_key, request.requested_subdomain.as_deref()) {
        Ok(subdomain) => subdomain,
        Err(rejection) => {
            info!(%peer, code = rejection.code, reason = %rejection.message, "handshake rejected");
            let _ = write_message(&mut write_half, &Message::Error(rejection)).await;
            let _ = write_half.shutdown().await;
            return Ok(());
        }
    };

    let (link, link_rx) = TunnelLink::channel();
    let tunnel = match state.registry.register(&subdomain, &request.api_key, link.clone()) {
        Ok(tunnel) => tunnel,
        Err(err) => {
            info!(%peer, subdomain, error = %err, "registration rejected");
            let rejection = ErrorMessage {
                code: err.http_status(),
                message: err.to_string(),
                metadata: [("subdomain".to_string(), subdomain.clone())]
                    .into_iter()
                    .collect(),
            };
            let _ = write_message(&mut write_half, &Message::Error(rejection)).await;
            let _ = write_half.shutdown().await;
            return Ok(());
        }
    };
    state.metrics.record_tunnel_registered();
    info!(%peer, subdomain, tunnel_id = %tunnel.id,
        client_version = %request.client_version, "tunnel registered");

    let response = Message::ConnectResponse(ConnectResponse {
        tunnel_id: tunnel.id,
        subdomain: subdomain.clone(),
        public_url: state.public_url(&subdomain),
        expires_at_ms: now_ms() + state.config.tunnel_ttl.as_millis() as u64,
    });
    match write_message(&mut write_half, &response).await {
        Ok(written) => state.metrics.record_frame_out(written),
        Err(err) => {
            warn!(%peer, error = %err, "failed to send connect response");
            cleanup(&state, &tunnel, DisconnectReason::ProtocolError);
            return Ok(());
        }
    }

    // Writer task: sole owner of the write half from here on.
    let close_watch = link_rx.close.clone();
    let writer = tokio::spawn(run_writer(write_half, link_rx, state.clone()));

    // Read loop.
    let reason = read_loop(
        &mut read_half,
        &decoder,
        &mut buf,
        &state,
        &tunnel,
        close_watch,
        &shutdown,
    )
    .await;

    cleanup(&state, &tunnel, reason);
    let _ = writer.await;
    info!(%peer, subdomain, tunnel_id = %tunnel.id, reason = %reason, "tunnel closed");
    Ok(())
}

/// Handshake rejection sent as an Error frame before closing.
fn authenticate(
    state: &ServerState,
    api_key: &str,
    requested: Option<&str>,
) -> Result<String, ErrorMessage> {
    match requested {
        Some(requested) => {
            let subdomain = state.validator.validate(requested).map_err(|err| ErrorMessage {
                code: 400,
                message: err.to_string(),
                metadata: [("subdomain".to_string(), requested.to_string())]
                    .into_iter()
                    .collect(),
            })?;
            match state.auth.validate_api_key(api_key, &subdomain) {
                Some(_) => Ok(subdomain),
                None => Err(auth_failed()),
            }
        }
        None => {
            // No preference: the key must be a registered one so the bound
            // subdomain can be used.
            let record = state.auth.lookup_registered(api_key).ok_or_else(auth_failed)?;
            state
                .validator
                .validate(&record.subdomain)
                .map_err(|err| ErrorMessage {
                    code: 400,
                    message: err.to_string(),
                    metadata: Default::default(),
                })
        }
    }
}

fn auth_failed() -> ErrorMessage {
    ErrorMessage {
        code: 401,
        message: "authentication failed".to_string(),
        metadata: Default::default(),
    }
}

/// Read frames and dispatch them until the connection ends.
async fn read_loop<R>(
    read_half: &mut R,
    decoder: &FrameDecoder,
    buf: &mut BytesMut,
    state: &Arc<ServerState>,
    tunnel: &Tunnel,
    mut close_watch: tokio::sync::watch::Receiver<Option<DisconnectReason>>,
    shutdown: &Shutdown,
) -> DisconnectReason
where
    R: AsyncRead + Unpin,
{
    loop {
        // Drain every complete frame already buffered.
        loop {
            let frame = match decoder.decode(buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    warn!(tunnel_id = %tunnel.id, error = %err, "fatal decode error");
                    return DisconnectReason::ProtocolError;
                }
            };
            state.metrics.record_frame_in(frame.payload.len());
            if let Some(reason) = dispatch_frame(state, tunnel, &frame) {
                return reason;
            }
        }

        tokio::select! {
            read = read_half.read_buf(buf) => match read {
                Ok(0) => return DisconnectReason::Unknown,
                Ok(_) => {}
                Err(err) => {
                    debug!(tunnel_id = %tunnel.id, error = %err, "control read failed");
                    return DisconnectReason::Unknown;
                }
            },
            _ = close_watch.changed() => {
                let reason = close_watch.borrow().unwrap_or(DisconnectReason::ServerShutdown);
                return reason;
            }
            _ = shutdown.wait() => return DisconnectReason::ServerShutdown,
        }
    }
}

/// Handle one inbound frame. Returns a reason when the connection should
/// end.
fn dispatch_frame(
    state: &Arc<ServerState>,
    tunnel: &Tunnel,
    frame: &Frame,
) -> Option<DisconnectReason> {
    if frame.flags.contains(FrameFlags::REQUIRES_ACK) {
        // Advisory only: no ack message exists in the protocol.
        debug!(tunnel_id = %tunnel.id, message_type = %frame.message_type, "peer requested ack");
    }

    let message = match Message::from_frame(frame) {
        Ok(message) => message,
        Err(err) => {
            warn!(tunnel_id = %tunnel.id, error = %err, "payload failed to decode");
            return Some(DisconnectReason::ProtocolError);
        }
    };

    match message {
        Message::HttpResponse(response) => {
            let request_id = response.request_id;
            if state.correlator.complete(request_id, response) {
                state.metrics.record_relayed();
            } else {
                debug!(tunnel_id = %tunnel.id, %request_id, "late or unknown response dropped");
            }
            None
        }
        Message::Ping(ping) => {
            let pong = Message::Pong(Pong {
                ping_timestamp_ms: ping.timestamp_ms,
                pong_timestamp_ms: now_ms(),
            });
            match Frame::new(pong.message_type(), pong.encode()).encode() {
                Ok(bytes) => {
                    if let Err(err) = tunnel.link.send(bytes) {
                        debug!(tunnel_id = %tunnel.id, error = %err, "pong not queued");
                    }
                }
                Err(err) => warn!(error = %err, "failed to encode pong"),
            }
            None
        }
        Message::Disconnect(disconnect) => {
            debug!(tunnel_id = %tunnel.id, reason = %disconnect.reason, "peer disconnected");
            Some(disconnect.reason)
        }
        Message::Error(error) => {
            warn!(tunnel_id = %tunnel.id, code = error.code, message = %error.message,
                "error frame from client");
            None
        }
        Message::Pong(_) => {
            // The server does not ping; tolerate and ignore.
            None
        }
        other => {
            debug!(tunnel_id = %tunnel.id, message_type = %other.message_type(),
                "ignoring unexpected frame");
            None
        }
    }
}

/// Drain the link queue onto the socket; on close, send a Disconnect frame
/// and finish.
async fn run_writer<W>(mut write_half: W, mut link_rx: TunnelLinkRx, state: Arc<ServerState>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = link_rx.close.changed() => {
                let reason = link_rx.close.borrow().unwrap_or(DisconnectReason::Unknown);
                let goodbye = Message::Disconnect(Disconnect {
                    reason,
                    message: None,
                });
                let _ = write_message(&mut write_half, &goodbye).await;
                break;
            }
            frame = link_rx.frames.recv() => match frame {
                Some(bytes) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                    let _ = write_half.flush().await;
                    state.metrics.record_frame_out(bytes.len());
                }
                None => break,
            },
        }
    }
    let _ = write_half.shutdown().await;
}

fn cleanup(state: &Arc<ServerState>, tunnel: &Tunnel, reason: DisconnectReason) {
    if state.registry.unregister(tunnel.id).is_some() {
        state.metrics.record_tunnel_unregistered();
    }
    let failed = state.correlator.fail_tunnel(
        tunnel.id,
        ServerError::ServiceUnavailable { retry_after: None },
    );
    if failed > 0 {
        debug!(tunnel_id = %tunnel.id, failed, "failed in-flight requests for closed tunnel");
    }
    tunnel.link.close(reason);
}

/// Read until one frame decodes or the stream ends.
async fn read_frame<R>(
    read_half: &mut R,
    decoder: &FrameDecoder,
    buf: &mut BytesMut,
) -> Result<Option<Frame>, cok_protocol::ProtocolError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = decoder.decode(buf)? {
            return Ok(Some(frame));
        }
        match read_half.read_buf(buf).await {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(_) => return Ok(None),
        }
    }
}

/// Encode and write a message as one frame. Returns the bytes written.
async fn write_message<W>(write_half: &mut W, message: &Message) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let frame = Frame::new(message.message_type(), message.encode());
    let bytes = frame
        .encode()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))?;
    write_half.write_all(&bytes).await?;
    write_half.flush().await?;
    Ok(bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use cok_protocol::ConnectRequest;

    fn test_state() -> Arc<ServerState> {
        let config = ServerConfig::from_lookup(|var| match var {
            "API_KEY_SECRET" => Some("test-secret-key-minimum-32-characters".to_string()),
            _ => None,
        })
        .unwrap();
        ServerState::new(config)
    }

    fn peer() -> SocketAddr {
        "203.0.113.9:55120".parse().unwrap()
    }

    async fn send_message<S: AsyncWrite + Unpin>(stream: &mut S, message: &Message) {
        write_message(stream, message).await.unwrap();
    }

    async fn recv_message<S: AsyncRead + Unpin>(stream: &mut S) -> Message {
        let decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        let frame = read_frame(stream, &decoder, &mut buf)
            .await
            .unwrap()
            .expect("stream closed before a frame arrived");
        Message::from_frame(&frame).unwrap()
    }

    fn connect_request(state: &ServerState, subdomain: &str) -> Message {
        Message::ConnectRequest(ConnectRequest {
            api_key: state.auth.derive_key(subdomain),
            requested_subdomain: Some(subdomain.to_string()),
            client_version: "0.1.0".to_string(),
            capabilities: vec!["http/1.1".to_string()],
        })
    }

    #[tokio::test]
    async fn handshake_grants_tunnel() {
        let state = test_state();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let shutdown = Shutdown::new();
        let task = tokio::spawn(handle_connection(server, peer(), state.clone(), shutdown.clone()));

        let (mut read, mut write) = tokio::io::split(client);
        send_message(&mut write, &connect_request(&state, "test-client")).await;

        match recv_message(&mut read).await {
            Message::ConnectResponse(response) => {
                assert_eq!(response.subdomain, "test-client");
                assert_eq!(response.public_url, "https://test-client.localhost");
                assert!(response.expires_at_ms > now_ms());
            }
            other => panic!("expected connect response, got {:?}", other),
        }
        assert_eq!(state.registry.count(), 1);

        drop(write);
        drop(read);
        let _ = task.await;
        assert_eq!(state.registry.count(), 0);
    }

    #[tokio::test]
    async fn bad_key_rejected_with_401() {
        let state = test_state();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let shutdown = Shutdown::new();
        tokio::spawn(handle_connection(server, peer(), state.clone(), shutdown));

        let (mut read, mut write) = tokio::io::split(client);
        let request = Message::ConnectRequest(ConnectRequest {
            api_key: "f".repeat(64),
            requested_subdomain: Some("test-client".to_string()),
            client_version: "0.1.0".to_string(),
            capabilities: vec![],
        });
        send_message(&mut write, &request).await;

        match recv_message(&mut read).await {
            Message::Error(error) => assert_eq!(error.code, 401),
            other => panic!("expected error frame, got {:?}", other),
        }
        assert_eq!(state.registry.count(), 0);
    }

    #[tokio::test]
    async fn invalid_subdomain_rejected_with_400() {
        let state = test_state();
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_connection(server, peer(), state.clone(), Shutdown::new()));

        let (mut read, mut write) = tokio::io::split(client);
        let request = Message::ConnectRequest(ConnectRequest {
            api_key: state.auth.derive_key("-bad-"),
            requested_subdomain: Some("-bad-".to_string()),
            client_version: "0.1.0".to_string(),
            capabilities: vec![],
        });
        send_message(&mut write, &request).await;

        match recv_message(&mut read).await {
            Message::Error(error) => assert_eq!(error.code, 400),
            other => panic!("expected error frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn duplicate_subdomain_rejected_with_409() {
        let state = test_state();
        let shutdown = Shutdown::new();

        let (client_a, server_a) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_connection(server_a, peer(), state.clone(), shutdown.clone()));
        let (mut read_a, mut write_a) = tokio::io::split(client_a);
        send_message(&mut write_a, &connect_request(&state, "test-client")).await;
        assert!(matches!(
            recv_message(&mut read_a).await,
            Message::ConnectResponse(_)
        ));

        let (client_b, server_b) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_connection(server_b, peer(), state.clone(), shutdown));
        let (mut read_b, mut write_b) = tokio::io::split(client_b);
        send_message(&mut write_b, &connect_request(&state, "test-client")).await;
        match recv_message(&mut read_b).await {
            Message::Error(error) => assert_eq!(error.code, 409),
            other => panic!("expected error frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn ping_answered_with_pong() {
        let state = test_state();
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_connection(server, peer(), state.clone(), Shutdown::new()));

        let (mut read, mut write) = tokio::io::split(client);
        send_message(&mut write, &connect_request(&state, "test-client")).await;
        assert!(matches!(
            recv_message(&mut read).await,
            Message::ConnectResponse(_)
        ));

        send_message(
            &mut write,
            &Message::Ping(cok_protocol::Ping { timestamp_ms: 777 }),
        )
        .await;
        match recv_message(&mut read).await {
            Message::Pong(pong) => {
                assert_eq!(pong.ping_timestamp_ms, 777);
                assert!(pong.pong_timestamp_ms >= 777);
            }
            other => panic!("expected pong, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn registered_key_without_requested_subdomain() {
        let state = test_state();
        let key = state.auth.create_api_key("minted-app", None);

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_connection(server, peer(), state.clone(), Shutdown::new()));
        let (mut read, mut write) = tokio::io::split(client);

        let request = Message::ConnectRequest(ConnectRequest {
            api_key: key,
            requested_subdomain: None,
            client_version: "0.1.0".to_string(),
            capabilities: vec!["http/1.1".to_string()],
        });
        send_message(&mut write, &request).await;

        match recv_message(&mut read).await {
            Message::ConnectResponse(response) => {
                assert_eq!(response.subdomain, "minted-app")
            }
            other => panic!("expected connect response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn first_frame_must_be_connect_request() {
        let state = test_state();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(handle_connection(server, peer(), state.clone(), Shutdown::new()));

        let (read, mut write) = tokio::io::split(client);
        send_message(
            &mut write,
            &Message::Ping(cok_protocol::Ping { timestamp_ms: 1 }),
        )
        .await;

        // Connection ends without a tunnel.
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("handler did not exit");
        assert_eq!(state.registry.count(), 0);
        drop(read);
    }
}
