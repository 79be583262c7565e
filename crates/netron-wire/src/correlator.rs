//! Request/response correlation with per-request timeouts.
//!
//! Every outgoing request that expects an answer registers a one-shot
//! handler under its packet id. Exactly one of three things then happens to
//! the handler: the matching response resolves it, the timeout fires, or the
//! connection goes away and [`ResponseCorrelator::reject_all`] fails it.

use crate::value::Value;
use netron_types::{NetronError, NetronResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receives the outcome of one request.
pub type ResponseHandler = oneshot::Sender<NetronResult<Value>>;

struct Pending {
    handler: ResponseHandler,
    seq: u64,
    timer: JoinHandle<()>,
}

/// Matches responses to outstanding requests by packet id.
pub struct ResponseCorrelator {
    next_id: AtomicU32,
    seq: AtomicU64,
    timeout: Duration,
    pending: Arc<Mutex<HashMap<u32, Pending>>>,
}

impl ResponseCorrelator {
    /// Create a correlator whose handlers expire after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU32::new(1),
            seq: AtomicU64::new(0),
            timeout,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Allocate the next packet id. Wraps around on overflow.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `handler` for the response to packet `id`.
    ///
    /// Must be called from within a tokio runtime: the timeout runs as a
    /// spawned task.
    pub fn register(&self, id: u32, handler: ResponseHandler) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let timeout = self.timeout;
        // The timer can only look the entry up once this lock is released,
        // so it always finds the entry it was spawned for.
        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let pending = Arc::clone(&self.pending);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let mut map = pending.lock().unwrap_or_else(|e| e.into_inner());
                match map.get(&id) {
                    Some(entry) if entry.seq == seq => map.remove(&id),
                    _ => None,
                }
            };
            if let Some(entry) = expired {
                debug!(id, "netron: response timed out");
                let _ = entry.handler.send(Err(NetronError::Timeout(format!(
                    "Response timeout {}ms exceeded",
                    timeout.as_millis()
                ))));
            }
        });
        let replaced = map.insert(
            id,
            Pending {
                handler,
                seq,
                timer,
            },
        );
        drop(map);

        if let Some(old) = replaced {
            warn!(id, "netron: packet id reused while a request was pending");
            old.timer.abort();
            let _ = old.handler.send(Err(NetronError::Timeout(
                "Response slot reused before an answer arrived".to_string(),
            )));
        }
    }

    /// Deliver the outcome for packet `id`.
    ///
    /// Returns `false` when nothing was waiting for it (unknown id, already
    /// timed out); such responses are dropped.
    pub fn resolve(&self, id: u32, outcome: NetronResult<Value>) -> bool {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                let _ = entry.handler.send(outcome);
                true
            }
            None => {
                debug!(id, "netron: dropping response with no pending request");
                false
            }
        }
    }

    /// Forget the handler for packet `id` without calling it.
    pub fn remove(&self, id: u32) {
        if let Some(entry) = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
        {
            entry.timer.abort();
        }
    }

    /// Fail every pending handler with the error produced by `make_err`.
    pub fn reject_all(&self, make_err: impl Fn() -> NetronError) {
        let drained: Vec<Pending> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in drained {
            entry.timer.abort();
            let _ = entry.handler.send(Err(make_err()));
        }
    }

    /// Number of requests still waiting for a response.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
