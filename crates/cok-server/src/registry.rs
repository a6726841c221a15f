//! Tunnel registry: subdomain → live control connection.
//!
//! The registry exclusively owns tunnel entries; callers get immutable
//! snapshots. Outbound writes go through a [`TunnelLink`], a bounded queue
//! drained by the connection's single writer task, so frame writes are
//! serialized per connection and a saturated connection fails dispatch
//! immediately instead of blocking the gateway.
//!
//! All map mutations happen inside short lock scopes with no awaits held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use cok_core::ServerError;
use cok_protocol::{DisconnectReason, Message, ProtocolError};

/// Outbound frames queued per connection before dispatch fails fast.
pub const LINK_QUEUE_DEPTH: usize = 64;

/// Write/close handle for one control connection.
///
/// Cloning is cheap; all clones feed the same writer task.
#[derive(Clone, Debug)]
pub struct TunnelLink {
    frames: mpsc::Sender<Vec<u8>>,
    close: Arc<watch::Sender<Option<DisconnectReason>>>,
}

/// Receiving side handed to the connection's writer task.
pub struct TunnelLinkRx {
    /// Encoded frames to write, in order.
    pub frames: mpsc::Receiver<Vec<u8>>,
    /// Becomes `Some(reason)` when the registry wants the connection gone.
    pub close: watch::Receiver<Option<DisconnectReason>>,
}

/// Why a link write was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSendError {
    /// The writer queue is full (slow or stalled connection).
    Busy,
    /// The connection is gone.
    Closed,
}

impl std::fmt::Display for LinkSendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkSendError::Busy => write!(f, "link write queue is full"),
            LinkSendError::Closed => write!(f, "link is closed"),
        }
    }
}

impl std::error::Error for LinkSendError {}

impl TunnelLink {
    /// Create a link and its receiving half.
    pub fn channel() -> (TunnelLink, TunnelLinkRx) {
        Self::with_depth(LINK_QUEUE_DEPTH)
    }

    pub fn with_depth(depth: usize) -> (TunnelLink, TunnelLinkRx) {
        let (frames_tx, frames_rx) = mpsc::channel(depth);
        let (close_tx, close_rx) = watch::channel(None);
        (
            TunnelLink {
                frames: frames_tx,
                close: Arc::new(close_tx),
            },
            TunnelLinkRx {
                frames: frames_rx,
                close: close_rx,
            },
        )
    }

    /// Queue encoded frame bytes for the writer task. Never blocks.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), LinkSendError> {
        if self.is_closed() {
            return Err(LinkSendError::Closed);
        }
        self.frames.try_send(bytes).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => LinkSendError::Busy,
            mpsc::error::TrySendError::Closed(_) => LinkSendError::Closed,
        })
    }

    /// Ask the connection to disconnect with `reason`. Idempotent; the
    /// first reason wins.
    pub fn close(&self, reason: DisconnectReason) {
        self.close.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Whether the connection has been asked to close or its writer task
    /// is gone.
    pub fn is_closed(&self) -> bool {
        self.close.borrow().is_some() || self.frames.is_closed()
    }
}

/// Immutable view of a live tunnel.
#[derive(Clone, Debug)]
pub struct Tunnel {
    /// Server-minted identity, never reused.
    pub id: Uuid,
    /// Normalized subdomain owning the tunnel.
    pub subdomain: String,
    /// Bearer key presented at handshake, kept for log correlation.
    pub api_key: String,
    /// When the tunnel registered.
    pub connected_at: Instant,
    /// Write/close handle for the owning connection.
    pub link: TunnelLink,
}

/// Why a dispatch toward a tunnel failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No tunnel with that id is registered.
    TunnelNotFound { id: Uuid },
    /// The connection's write queue is saturated.
    LinkBusy,
    /// The connection is gone but the registry entry has not been reaped
    /// yet.
    LinkClosed,
    /// The message could not be framed.
    Encode(ProtocolError),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::TunnelNotFound { id } => write!(f, "tunnel {} not found", id),
            SendError::LinkBusy => write!(f, "tunnel link is saturated"),
            SendError::LinkClosed => write!(f, "tunnel link is closed"),
            SendError::Encode(err) => write!(f, "failed to encode frame: {}", err),
        }
    }
}

impl std::error::Error for SendError {}

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<Uuid, Tunnel>,
    by_subdomain: HashMap<String, Uuid>,
}

/// Owner of all live tunnels.
pub struct TunnelRegistry {
    max_tunnels: usize,
    inner: Mutex<RegistryInner>,
}

impl TunnelRegistry {
    pub fn new(max_tunnels: usize) -> Self {
        TunnelRegistry {
            max_tunnels,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Register a tunnel for `subdomain`. Capacity is checked before
    /// uniqueness so a full gateway reports 503 rather than leaking which
    /// subdomains exist.
    pub fn register(
        &self,
        subdomain: &str,
        api_key: &str,
        link: TunnelLink,
    ) -> Result<Tunnel, ServerError> {
        let mut inner = self.inner.lock();
        if inner.by_id.len() >= self.max_tunnels {
            return Err(ServerError::ServiceUnavailable { retry_after: None });
        }
        if inner.by_subdomain.contains_key(subdomain) {
            return Err(ServerError::SubdomainTaken {
                subdomain: subdomain.to_string(),
            });
        }

        let tunnel = Tunnel {
            id: Uuid::new_v4(),
            subdomain: subdomain.to_string(),
            api_key: api_key.to_string(),
            connected_at: Instant::now(),
            link,
        };
        inner.by_subdomain.insert(subdomain.to_string(), tunnel.id);
        inner.by_id.insert(tunnel.id, tunnel.clone());
        Ok(tunnel)
    }

    /// Remove a tunnel. Idempotent; returns the removed snapshot so the
    /// caller can fail its pending requests and close its link.
    pub fn unregister(&self, id: Uuid) -> Option<Tunnel> {
        let mut inner = self.inner.lock();
        let tunnel = inner.by_id.remove(&id)?;
        inner.by_subdomain.remove(&tunnel.subdomain);
        Some(tunnel)
    }

    /// Snapshot of the tunnel owning `subdomain`.
    pub fn lookup(&self, subdomain: &str) -> Option<Tunnel> {
        let inner = self.inner.lock();
        let id = inner.by_subdomain.get(subdomain)?;
        inner.by_id.get(id).cloned()
    }

    /// Snapshot by id.
    pub fn get(&self, id: Uuid) -> Option<Tunnel> {
        self.inner.lock().by_id.get(&id).cloned()
    }

    /// Number of live tunnels.
    pub fn count(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    /// Fraction of capacity in use.
    pub fn utilization(&self) -> f64 {
        if self.max_tunnels == 0 {
            return 1.0;
        }
        self.count() as f64 / self.max_tunnels as f64
    }

    /// Encode `message` and queue it on the tunnel's connection.
    pub fn send(&self, id: Uuid, message: &Message) -> Result<(), SendError> {
        let link = {
            let inner = self.inner.lock();
            match inner.by_id.get(&id) {
                Some(tunnel) => tunnel.link.clone(),
                None => return Err(SendError::TunnelNotFound { id }),
            }
        };

        let payload = message.encode();
        let frame = cok_protocol::Frame::new(message.message_type(), payload);
        let bytes = frame.encode().map_err(SendError::Encode)?;
        link.send(bytes).map_err(|err| match err {
            LinkSendError::Busy => SendError::LinkBusy,
            LinkSendError::Closed => SendError::LinkClosed,
        })
    }

    /// Close every link and empty the registry. Returns the snapshots so
    /// the caller can fail their pending requests.
    pub fn disconnect_all(&self, reason: DisconnectReason) -> Vec<Tunnel> {
        let tunnels: Vec<Tunnel> = {
            let mut inner = self.inner.lock();
            inner.by_subdomain.clear();
            inner.by_id.drain().map(|(_, tunnel)| tunnel).collect()
        };
        for tunnel in &tunnels {
            tunnel.link.close(reason);
        }
        tunnels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cok_protocol::{FrameDecoder, HttpRequest, MessageType};

    fn registry(max: usize) -> TunnelRegistry {
        TunnelRegistry::new(max)
    }

    fn link() -> (TunnelLink, TunnelLinkRx) {
        TunnelLink::channel()
    }

    #[test]
    fn register_and_lookup() {
        let reg = registry(10);
        let (l, _rx) = link();
        let tunnel = reg.register("my-app", "key", l).unwrap();

        let found = reg.lookup("my-app").unwrap();
        assert_eq!(found.id, tunnel.id);
        assert_eq!(found.subdomain, "my-app");
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn duplicate_subdomain_rejected() {
        let reg = registry(10);
        let (a, _arx) = link();
        let (b, _brx) = link();
        reg.register("my-app", "key", a).unwrap();

        let err = reg.register("my-app", "other", b).unwrap_err();
        assert_eq!(
            err,
            ServerError::SubdomainTaken {
                subdomain: "my-app".to_string()
            }
        );
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn capacity_enforced() {
        let reg = registry(2);
        let (a, _arx) = link();
        let (b, _brx) = link();
        let (c, _crx) = link();
        reg.register("one-app", "k", a).unwrap();
        reg.register("two-app", "k", b).unwrap();

        let err = reg.register("three-app", "k", c).unwrap_err();
        assert_eq!(err, ServerError::ServiceUnavailable { retry_after: None });
    }

    #[test]
    fn unregister_frees_subdomain_and_is_idempotent() {
        let reg = registry(10);
        let (a, _arx) = link();
        let tunnel = reg.register("my-app", "k", a).unwrap();

        assert!(reg.unregister(tunnel.id).is_some());
        assert!(reg.unregister(tunnel.id).is_none());
        assert!(reg.lookup("my-app").is_none());
        assert_eq!(reg.count(), 0);

        // Subdomain is registerable again; the id is fresh.
        let (b, _brx) = link();
        let again = reg.register("my-app", "k", b).unwrap();
        assert_ne!(again.id, tunnel.id);
    }

    #[test]
    fn ids_are_unique_across_tunnels() {
        let reg = registry(10);
        let (a, _arx) = link();
        let (b, _brx) = link();
        let t1 = reg.register("one-app", "k", a).unwrap();
        let t2 = reg.register("two-app", "k", b).unwrap();
        assert_ne!(t1.id, t2.id);
    }

    #[tokio::test]
    async fn send_queues_an_encoded_frame() {
        let reg = registry(10);
        let (l, mut rx) = link();
        let tunnel = reg.register("my-app", "k", l).unwrap();

        let msg = Message::HttpRequest(HttpRequest {
            request_id: Uuid::new_v4(),
            method: "GET".to_string(),
            path: "/ping".to_string(),
            headers: vec![],
            body: vec![],
            remote_address: "203.0.113.9:1".to_string(),
        });
        reg.send(tunnel.id, &msg).unwrap();

        let bytes = rx.frames.recv().await.unwrap();
        let mut buf = bytes::BytesMut::from(&bytes[..]);
        let frame = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.message_type, MessageType::HttpRequest);
        assert_eq!(Message::from_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn send_to_unknown_tunnel_fails() {
        let reg = registry(10);
        let id = Uuid::new_v4();
        let msg = Message::Ping(cok_protocol::Ping { timestamp_ms: 1 });
        assert_eq!(
            reg.send(id, &msg).unwrap_err(),
            SendError::TunnelNotFound { id }
        );
    }

    #[test]
    fn saturated_link_fails_fast() {
        let reg = registry(10);
        let (l, _rx) = TunnelLink::with_depth(1);
        let tunnel = reg.register("my-app", "k", l).unwrap();

        let msg = Message::Ping(cok_protocol::Ping { timestamp_ms: 1 });
        reg.send(tunnel.id, &msg).unwrap();
        // Queue depth 1 and nobody draining: the next send is refused.
        assert_eq!(reg.send(tunnel.id, &msg).unwrap_err(), SendError::LinkBusy);
    }

    #[test]
    fn send_after_close_fails() {
        let reg = registry(10);
        let (l, _rx) = link();
        let tunnel = reg.register("my-app", "k", l).unwrap();
        tunnel.link.close(DisconnectReason::ServerShutdown);

        let msg = Message::Ping(cok_protocol::Ping { timestamp_ms: 1 });
        assert_eq!(
            reg.send(tunnel.id, &msg).unwrap_err(),
            SendError::LinkClosed
        );
    }

    #[test]
    fn close_is_idempotent_first_reason_wins() {
        let (l, rx) = link();
        l.close(DisconnectReason::ServerShutdown);
        l.close(DisconnectReason::Timeout);
        assert_eq!(
            *rx.close.borrow(),
            Some(DisconnectReason::ServerShutdown)
        );
    }

    #[test]
    fn disconnect_all_closes_links_and_empties() {
        let reg = registry(10);
        let (a, arx) = link();
        let (b, brx) = link();
        reg.register("one-app", "k", a).unwrap();
        reg.register("two-app", "k", b).unwrap();

        let dropped = reg.disconnect_all(DisconnectReason::ServerShutdown);
        assert_eq!(dropped.len(), 2);
        assert_eq!(reg.count(), 0);
        assert_eq!(
            *arx.close.borrow(),
            Some(DisconnectReason::ServerShutdown)
        );
        assert_eq!(
            *brx.close.borrow(),
            Some(DisconnectReason::ServerShutdown)
        );
    }

    #[test]
    fn racing_registrations_yield_exactly_one_winner() {
        let reg = std::sync::Arc::new(registry(10));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            handles.push(std::thread::spawn(move || {
                let (l, rx) = link();
                let won = reg.register("contested", "k", l).is_ok();
                // Keep the link receiver alive past the register call.
                drop(rx);
                won
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn racing_distinct_registrations_all_succeed() {
        let reg = std::sync::Arc::new(registry(10));
        let mut handles = Vec::new();
        for i in 0..4 {
            let reg = reg.clone();
            handles.push(std::thread::spawn(move || {
                let (l, _rx) = link();
                reg.register(&format!("app-{}", i), "k", l).is_ok()
            }));
        }
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(reg.count(), 4);
    }

    #[test]
    fn utilization_reflects_count() {
        let reg = registry(4);
        assert_eq!(reg.utilization(), 0.0);
        let (a, _arx) = link();
        reg.register("one-app", "k", a).unwrap();
        assert_eq!(reg.utilization(), 0.25);
    }
}
