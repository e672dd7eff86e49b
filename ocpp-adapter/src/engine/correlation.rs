//! Pending-call table
//!
//! Every outbound request owns one entry from registration until it is
//! resolved by a response, a request error, its deadline or the loss of its
//! connection. Removing the entry from the map is the single point that
//! decides which of those wins; the loser's `resolve` returns `false`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::ocpp::{CallError, CallResult, RequestId};

#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("Request id {0} is already in flight")]
    DuplicateRequestId(RequestId),
}

/// How a pending call ended
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Response(CallResult),
    RequestError(CallError),
    /// A reply carrying our id that could not be read
    Malformed(String),
    Timeout,
    ConnectionClosed,
}

struct PendingCall {
    token: u64,
    action: String,
    connection_id: String,
    issued_at: DateTime<Utc>,
    deadline: Instant,
    slot: oneshot::Sender<Resolution>,
}

/// Request id -> pending call
#[derive(Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<RequestId, PendingCall>>,
    next_token: AtomicU64,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call sent over `connection_id`; fails if the id is in flight
    pub fn register(
        self: &Arc<Self>,
        request_id: RequestId,
        action: &str,
        connection_id: &str,
        timeout: Duration,
    ) -> Result<PendingHandle, CorrelationError> {
        let (slot, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let issued_at = Utc::now();
        let deadline = Instant::now() + timeout;

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&request_id) {
                return Err(CorrelationError::DuplicateRequestId(request_id));
            }
            pending.insert(
                request_id.clone(),
                PendingCall {
                    token,
                    action: action.to_string(),
                    connection_id: connection_id.to_string(),
                    issued_at,
                    deadline,
                    slot,
                },
            );
        }

        Ok(PendingHandle {
            table: self.clone(),
            request_id,
            token,
            issued_at,
            deadline,
            timeout,
            rx,
            done: false,
        })
    }

    /// Complete a pending call. `false` if the id is unknown or already resolved.
    pub fn resolve(&self, request_id: &RequestId, resolution: Resolution) -> bool {
        let call = self.pending.lock().remove(request_id);
        self.complete(request_id, call, resolution)
    }

    /// Like `resolve`, but only for the registration `token` belongs to
    fn resolve_own(&self, request_id: &RequestId, token: u64, resolution: Resolution) -> bool {
        let call = {
            let mut pending = self.pending.lock();
            match pending.get(request_id) {
                Some(call) if call.token == token => pending.remove(request_id),
                _ => None,
            }
        };
        self.complete(request_id, call, resolution)
    }

    fn complete(&self, request_id: &RequestId, call: Option<PendingCall>, resolution: Resolution) -> bool {
        match call {
            Some(call) => {
                debug!(
                    "Resolved {} ({}) after {}ms",
                    request_id,
                    call.action,
                    (Utc::now() - call.issued_at).num_milliseconds()
                );
                let _ = call.slot.send(resolution);
                true
            }
            None => false,
        }
    }

    /// Resolve every call past its deadline with `Timeout`
    pub fn expire_timeouts(&self) -> Vec<RequestId> {
        let now = Instant::now();
        let expired: Vec<(RequestId, PendingCall)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|call| (id, call)))
                .collect()
        };

        expired
            .into_iter()
            .map(|(id, call)| {
                debug!("Expired {} ({})", id, call.action);
                let _ = call.slot.send(Resolution::Timeout);
                id
            })
            .collect()
    }

    /// Resolve every call sent over a connection that went away
    pub fn fail_connection(&self, connection_id: &str) -> usize {
        let failed: Vec<PendingCall> = {
            let mut pending = self.pending.lock();
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, call)| call.connection_id == connection_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = failed.len();
        for call in failed {
            let _ = call.slot.send(Resolution::ConnectionClosed);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.pending.lock().contains_key(request_id)
    }

    /// Drop an abandoned entry, but only the registration `token` belongs to
    fn cancel(&self, request_id: &RequestId, token: u64) {
        let mut pending = self.pending.lock();
        if pending.get(request_id).map_or(false, |call| call.token == token) {
            pending.remove(request_id);
        }
    }
}

/// Caller side of one pending call
pub struct PendingHandle {
    table: Arc<CorrelationTable>,
    request_id: RequestId,
    token: u64,
    issued_at: DateTime<Utc>,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<Resolution>,
    done: bool,
}

impl PendingHandle {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for the call's single resolution
    pub async fn wait(mut self) -> Resolution {
        let resolution = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Resolution::ConnectionClosed,
            Err(_) => {
                // Race our own timeout against a concurrent resolve; whoever
                // removes the entry fills the slot. A reused id is not ours.
                self.table
                    .resolve_own(&self.request_id, self.token, Resolution::Timeout);
                (&mut self.rx).await.unwrap_or(Resolution::Timeout)
            }
        };
        self.done = true;
        resolution
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        if !self.done {
            self.table.cancel(&self.request_id, self.token);
        }
    }
}
