//! Request/response correlation.
//!
//! Every forwarded HTTP request gets a one-shot slot keyed by its request
//! id. The slot is registered *before* the frame is written to the tunnel,
//! so a response can never arrive ahead of its slot. A slot resolves at most
//! once: on response, on timeout, when its tunnel disconnects, or when the
//! gateway abandons the wait. Late deliveries find no slot and are dropped.
//!
//! Slots are indexed by tunnel id so a disconnect can fail exactly the
//! requests that were in flight on that tunnel.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use cok_core::ServerError;
use cok_protocol::HttpResponse;

/// Default wait for a tunnel's response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a request could not be tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackError {
    /// A slot for this request id already exists.
    AlreadyTracked { id: Uuid },
}

impl std::fmt::Display for TrackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackError::AlreadyTracked { id } => {
                write!(f, "request {} is already tracked", id)
            }
        }
    }
}

impl std::error::Error for TrackError {}

struct PendingSlot {
    tunnel_id: Uuid,
    created_at: Instant,
    tx: oneshot::Sender<Result<HttpResponse, ServerError>>,
}

/// Handle the gateway holds while awaiting a tunnel's reply.
#[derive(Debug)]
pub struct TrackedRequest {
    /// Request id the slot is keyed by.
    pub request_id: Uuid,
    rx: oneshot::Receiver<Result<HttpResponse, ServerError>>,
}

#[derive(Default)]
struct CorrelatorInner {
    pending: HashMap<Uuid, PendingSlot>,
    by_tunnel: HashMap<Uuid, HashSet<Uuid>>,
}

/// Owner of all pending request slots.
pub struct RequestCorrelator {
    timeout: Duration,
    inner: Mutex<CorrelatorInner>,
}

impl RequestCorrelator {
    pub fn new(timeout: Duration) -> Self {
        RequestCorrelator {
            timeout,
            inner: Mutex::new(CorrelatorInner::default()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a slot for `request_id` bound to `tunnel_id`.
    ///
    /// Must be called before the request frame is written so the response
    /// cannot race the slot.
    pub fn track(&self, request_id: Uuid, tunnel_id: Uuid) -> Result<TrackedRequest, TrackError> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();

        // Reap slots whose waiter vanished without resolving (the gateway
        // task was cancelled mid-await).
        self.reap_abandoned(&mut inner);

        if inner.pending.contains_key(&request_id) {
            return Err(TrackError::AlreadyTracked { id: request_id });
        }
        inner.pending.insert(
            request_id,
            PendingSlot {
                tunnel_id,
                created_at: Instant::now(),
                tx,
            },
        );
        inner
            .by_tunnel
            .entry(tunnel_id)
            .or_default()
            .insert(request_id);

        Ok(TrackedRequest { request_id, rx })
    }

    /// Await the slot's resolution, up to the configured timeout.
    ///
    /// On timeout the slot is removed first, then `RequestTimeout` is
    /// returned; a response landing after that finds nothing and is
    /// dropped.
    pub async fn await_response(
        &self,
        tracked: TrackedRequest,
    ) -> Result<HttpResponse, ServerError> {
        let request_id = tracked.request_id;
        match tokio::time::timeout(self.timeout, tracked.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Sender dropped without resolving; treat as internal.
                self.remove(request_id);
                Err(ServerError::Internal {
                    message: "pending slot dropped without resolution".to_string(),
                })
            }
            Err(_) => {
                self.remove(request_id);
                Err(ServerError::RequestTimeout)
            }
        }
    }

    /// Deliver a response. Returns whether a slot existed; duplicates and
    /// late arrivals return `false` and are otherwise ignored.
    pub fn complete(&self, request_id: Uuid, response: HttpResponse) -> bool {
        match self.take(request_id) {
            Some(slot) => {
                // The waiter may have gone away; that is still "handled".
                let _ = slot.tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Fail a single pending request.
    pub fn fail(&self, request_id: Uuid, error: ServerError) -> bool {
        match self.take(request_id) {
            Some(slot) => {
                let _ = slot.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Abandon a slot without resolving it (dispatch failed after track).
    pub fn cancel(&self, request_id: Uuid) {
        self.remove(request_id);
    }

    /// Fail every request in flight on `tunnel_id`. Returns how many were
    /// failed.
    pub fn fail_tunnel(&self, tunnel_id: Uuid, error: ServerError) -> usize {
        let slots = {
            let mut inner = self.inner.lock();
            let ids = match inner.by_tunnel.remove(&tunnel_id) {
                Some(ids) => ids,
                None => return 0,
            };
            ids.into_iter()
                .filter_map(|id| inner.pending.remove(&id))
                .collect::<Vec<_>>()
        };
        let count = slots.len();
        for slot in slots {
            let _ = slot.tx.send(Err(error.clone()));
        }
        count
    }

    /// Fail everything, e.g. at shutdown. Returns how many were failed.
    pub fn fail_all(&self, error: ServerError) -> usize {
        let slots = {
            let mut inner = self.inner.lock();
            inner.by_tunnel.clear();
            inner
                .pending
                .drain()
                .map(|(_, slot)| slot)
                .collect::<Vec<_>>()
        };
        let count = slots.len();
        for slot in slots {
            let _ = slot.tx.send(Err(error.clone()));
        }
        count
    }

    /// Requests currently in flight.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    fn take(&self, request_id: Uuid) -> Option<PendingSlot> {
        let mut inner = self.inner.lock();
        let slot = inner.pending.remove(&request_id)?;
        if let Some(ids) = inner.by_tunnel.get_mut(&slot.tunnel_id) {
            ids.remove(&request_id);
            if ids.is_empty() {
                inner.by_tunnel.remove(&slot.tunnel_id);
            }
        }
        Some(slot)
    }

    fn remove(&self, request_id: Uuid) {
        let _ = self.take(request_id);
    }

    /// Drop slots whose receiver is gone and that are older than the
    /// timeout; nothing can resolve them usefully anymore.
    fn reap_abandoned(&self, inner: &mut CorrelatorInner) {
        let cutoff = self.timeout;
        let abandoned: Vec<Uuid> = inner
            .pending
            .iter()
            .filter(|(_, slot)| slot.tx.is_closed() && slot.created_at.elapsed() > cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in abandoned {
            if let Some(slot) = inner.pending.remove(&id) {
                if let Some(ids) = inner.by_tunnel.get_mut(&slot.tunnel_id) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        inner.by_tunnel.remove(&slot.tunnel_id);
                    }
                }
            }
        }
    }
}
