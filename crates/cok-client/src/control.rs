//! Persistent control connection to the gateway.
//!
//! One session = dial, handshake, then a select loop that dispatches
//! inbound frames, emits a ping on an interval, and writes whatever the
//! forwarder tasks produce. When a session ends unexpectedly the client
//! sleeps an exponentially growing delay and reconnects; an explicit
//! `disconnect()` sends a goodbye frame and stops the loop for good.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use cok_core::ClientError;
use cok_protocol::{
    ConnectRequest, Disconnect, DisconnectReason, Frame, FrameDecoder, FrameFlags, Message, Ping,
};

use crate::forward::Forwarder;

/// Connection lifecycle as observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::Disconnected => write!(f, "disconnected"),
            ClientState::Connecting => write!(f, "connecting"),
            ClientState::Connected => write!(f, "connected"),
            ClientState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Client tuning.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway control endpoint, `host:port`.
    pub server_addr: String,
    /// Bearer key for the handshake.
    pub api_key: String,
    /// Subdomain to request; `None` lets the server pick from the key's
    /// registration.
    pub requested_subdomain: Option<String>,
    /// Keep-alive probe interval.
    pub ping_interval: Duration,
    /// First reconnect delay; doubles each failed attempt.
    pub reconnect_base: Duration,
    /// Reconnect delay ceiling.
    pub reconnect_cap: Duration,
    /// Reconnect attempt limit; `-1` means unlimited.
    pub max_reconnect_attempts: i32,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>, api_key: impl Into<String>) -> Self {
        ClientConfig {
            server_addr: server_addr.into(),
            api_key: api_key.into(),
            requested_subdomain: None,
            ping_interval: Duration::from_secs(30),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(60),
            max_reconnect_attempts: -1,
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based).
pub fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let factor = 1u64 << exponent;
    base.checked_mul(factor as u32).unwrap_or(cap).min(cap)
}

/// How one session ended.
enum SessionEnd {
    /// User asked for disconnection.
    UserRequested,
    /// Connection dropped or errored; reconnect applies.
    Lost,
    /// The server refused us in a way a retry will not fix.
    Fatal(ClientError),
}

/// Persistent control-channel client.
pub struct ControlChannelClient {
    config: ClientConfig,
    forwarder: Arc<Forwarder>,
    state_tx: watch::Sender<ClientState>,
    stop_tx: watch::Sender<bool>,
}

impl ControlChannelClient {
    pub fn new(config: ClientConfig, forwarder: Forwarder) -> Self {
        let (state_tx, _) = watch::channel(ClientState::Disconnected);
        let (stop_tx, _) = watch::channel(false);
        ControlChannelClient {
            config,
            forwarder: Arc::new(forwarder),
            state_tx,
            stop_tx,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn state_watch(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    /// Stop the client. The active session (if any) sends a goodbye frame
    /// and no reconnection is attempted.
    pub fn disconnect(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Run until explicitly disconnected or a fatal handshake error.
    pub async fn run(&self) -> Result<(), ClientError> {
        let mut attempts: u32 = 0;
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            if *stop_rx.borrow() {
                self.set_state(ClientState::Disconnected);
                return Ok(());
            }

            self.set_state(ClientState::Connecting);
            match self.run_session(&mut stop_rx).await {
                SessionEnd::UserRequested => {
                    self.set_state(ClientState::Disconnected);
                    info!("disconnected");
                    return Ok(());
                }
                SessionEnd::Fatal(err) => {
                    self.set_state(ClientState::Disconnected);
                    error!(error = %err, "giving up on control connection");
                    return Err(err);
                }
                SessionEnd::Lost => {
                    // A session that reached Connected resets the backoff.
                    if self.state() == ClientState::Connected {
                        attempts = 0;
                    }
                    attempts += 1;
                    if self.config.max_reconnect_attempts >= 0
                        && attempts > self.config.max_reconnect_attempts as u32
                    {
                        self.set_state(ClientState::Disconnected);
                        return Err(ClientError::ConnectionFailed {
                            message: format!(
                                "gave up after {} reconnect attempts",
                                attempts - 1
                            ),
                        });
                    }

                    let delay = reconnect_delay(
                        attempts,
                        self.config.reconnect_base,
                        self.config.reconnect_cap,
                    );
                    self.set_state(ClientState::Reconnecting);
                    info!(attempt = attempts, delay_ms = delay.as_millis() as u64,
                        "reconnecting after delay");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop_rx.changed() => {
                            self.set_state(ClientState::Disconnected);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn set_state(&self, state: ClientState) {
        self.state_tx.send_replace(state);
    }

    /// One dial/handshake/dispatch cycle.
    async fn run_session(&self, stop_rx: &mut watch::Receiver<bool>) -> SessionEnd {
        let stream = match TcpStream::connect(&self.config.server_addr).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(addr = %self.config.server_addr,
                    error = %cok_core::NetworkError::from_io(&err), "dial failed");
                return SessionEnd::Lost;
            }
        };
        let (mut read_half, mut write_half) = stream.into_split();
        let decoder = FrameDecoder::new();
        let mut buf = BytesMut::with_capacity(64 * 1024);

        // Handshake.
        let hello = Message::ConnectRequest(ConnectRequest {
            api_key: self.config.api_key.clone(),
            requested_subdomain: self.config.requested_subdomain.clone(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: vec!["http/1.1".to_string()],
        });
        if write_frames(&mut write_half, &hello).await.is_err() {
            return SessionEnd::Lost;
        }

        let response = match read_one_frame(&mut read_half, &decoder, &mut buf).await {
            Some(frame) => frame,
            None => return SessionEnd::Lost,
        };
        match Message::from_frame(&response) {
            Ok(Message::ConnectResponse(granted)) => {
                info!(
                    subdomain = %granted.subdomain,
                    public_url = %granted.public_url,
                    tunnel_id = %granted.tunnel_id,
                    "tunnel established"
                );
            }
            Ok(Message::Error(rejection)) => {
                warn!(code = rejection.code, message = %rejection.message,
                    "handshake rejected");
                let err = match rejection.code {
                    401 => ClientError::AuthenticationFailed,
                    _ => ClientError::ConnectionFailed {
                        message: rejection.message,
                    },
                };
                return SessionEnd::Fatal(err);
            }
            Ok(other) => {
                warn!(message_type = %other.message_type(), "unexpected handshake reply");
                return SessionEnd::Lost;
            }
            Err(err) => {
                warn!(error = %err, "handshake reply failed to decode");
                return SessionEnd::Lost;
            }
        }
        self.set_state(ClientState::Connected);

        // Forwarder tasks push encoded response frames here; this loop is
        // the connection's only writer.
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(64);
        let mut ping_timer = tokio::time::interval(self.config.ping_interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.tick().await;
        let mut last_ping_at: Option<Instant> = None;

        loop {
            // Drain complete frames before waiting for more input.
            loop {
                let frame = match decoder.decode(&mut buf) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "fatal decode error, dropping connection");
                        return SessionEnd::Lost;
                    }
                };
                match self.dispatch(frame, &outbound_tx, &mut last_ping_at) {
                    Ok(()) => {}
                    Err(end) => return end,
                }
            }

            tokio::select! {
                read = read_half.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        info!("server closed the control connection");
                        return SessionEnd::Lost;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %cok_core::NetworkError::from_io(&err),
                            "control read failed");
                        return SessionEnd::Lost;
                    }
                },
                Some(bytes) = outbound_rx.recv() => {
                    if write_half.write_all(&bytes).await.is_err()
                        || write_half.flush().await.is_err()
                    {
                        return SessionEnd::Lost;
                    }
                }
                _ = ping_timer.tick() => {
                    last_ping_at = Some(Instant::now());
                    let ping = Message::Ping(Ping { timestamp_ms: now_ms() });
                    if write_frames(&mut write_half, &ping).await.is_err() {
                        return SessionEnd::Lost;
                    }
                }
                _ = stop_rx.changed() => {
                    let goodbye = Message::Disconnect(Disconnect {
                        reason: DisconnectReason::ClientShutdown,
                        message: None,
                    });
                    let _ = write_frames(&mut write_half, &goodbye).await;
                    let _ = write_half.shutdown().await;
                    return SessionEnd::UserRequested;
                }
            }
        }
    }

    /// Handle one inbound frame during a session.
    fn dispatch(
        &self,
        frame: Frame,
        outbound_tx: &mpsc::Sender<Vec<u8>>,
        last_ping_at: &mut Option<Instant>,
    ) -> Result<(), SessionEnd> {
        if frame.flags.contains(FrameFlags::REQUIRES_ACK) {
            debug!(message_type = %frame.message_type, "server requested ack");
        }

        let message = match Message::from_frame(&frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "payload failed to decode, dropping connection");
                return Err(SessionEnd::Lost);
            }
        };

        match message {
            Message::HttpRequest(request) => {
                debug!(request_id = %request.request_id, method = %request.method,
                    path = %request.path, "request received");
                let forwarder = self.forwarder.clone();
                let outbound = outbound_tx.clone();
                tokio::spawn(async move {
                    let response = forwarder.forward(request).await;
                    let message = Message::HttpResponse(response);
                    match Frame::new(message.message_type(), message.encode()).encode() {
                        Ok(bytes) => {
                            if outbound.send(bytes).await.is_err() {
                                debug!("session ended before response could be sent");
                            }
                        }
                        Err(err) => warn!(error = %err, "response too large to frame"),
                    }
                });
                Ok(())
            }
            Message::Pong(pong) => {
                if let Some(sent) = last_ping_at.take() {
                    debug!(rtt_ms = sent.elapsed().as_millis() as u64,
                        server_time_ms = pong.pong_timestamp_ms, "pong received");
                }
                Ok(())
            }
            Message::Disconnect(disconnect) => {
                info!(reason = %disconnect.reason, "server sent disconnect");
                Err(SessionEnd::Lost)
            }
            Message::Error(error) => {
                warn!(code = error.code, message = %error.message, "error frame from server");
                Ok(())
            }
            other => {
                debug!(message_type = %other.message_type(), "ignoring unexpected frame");
                Ok(())
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn write_frames<W>(write_half: &mut W, message: &Message) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let frame = Frame::new(message.message_type(), message.encode());
    let bytes = frame
        .encode()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))?;
    write_half.write_all(&bytes).await?;
    write_half.flush().await
}

async fn read_one_frame<R>(
    read_half: &mut R,
    decoder: &FrameDecoder,
    buf: &mut BytesMut,
) -> Option<Frame>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match decoder.decode(buf) {
            Ok(Some(frame)) => return Some(frame),
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "decode failed while waiting for handshake reply");
                return None;
            }
        }
        match read_half.read_buf(buf).await {
            Ok(0) => return None,
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}
