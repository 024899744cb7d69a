//! Notification hub: live connections plus store-and-forward buffering.
//!
//! The connection registry and the pending-message buffer share a single
//! mutex so a payload can never be buffered and then immediately dropped
//! by a registration race. The lock is a std mutex and is never held
//! across an await: delivery goes through per-connection channels, and the
//! socket I/O happens in each connection's forwarding task.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Write half of a live client connection.
///
/// A send fails exactly when the connection's forwarding task has exited,
/// which is the hub's signal that the socket is dead.
pub struct ClientHandle {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

impl ClientHandle {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Identity of this connection, used to scope `unregister` so a stale
    /// read loop cannot evict a newer connection for the same session.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn deliver(&self, payload: String) -> Result<(), ()> {
        self.tx.send(payload).map_err(|_| ())
    }
}

/// Outcome of a [`NotificationHub::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to a live connection.
    Delivered,
    /// No live connection; appended to the session's buffer.
    Buffered,
    /// The live connection was dead; it was removed and the payload
    /// discarded (fire-and-forget at this layer).
    Dropped,
}

#[derive(Default)]
struct HubState {
    clients: HashMap<String, ClientHandle>,
    pending: HashMap<String, VecDeque<String>>,
}

/// Session-keyed delivery hub with store-and-forward buffering.
#[derive(Default)]
pub struct NotificationHub {
    state: Mutex<HubState>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a connection for `session_id`, replacing any previous one,
    /// and drains buffered payloads in enqueue order.
    ///
    /// If a buffered payload fails to deliver mid-drain the connection is
    /// treated as unusable for this attempt: the drain stops, the handle
    /// is not installed, and the remaining payloads stay buffered.
    ///
    /// Returns the number of buffered payloads delivered.
    pub fn register(&self, session_id: &str, handle: ClientHandle) -> usize {
        let mut state = self.state.lock().expect("lock poisoned");

        let mut queued = state.pending.remove(session_id).unwrap_or_default();
        let mut delivered = 0;

        while let Some(payload) = queued.pop_front() {
            if handle.deliver(payload).is_err() {
                warn!(
                    session_id,
                    delivered,
                    remaining = queued.len(),
                    "Connection died mid-drain, keeping remaining payloads buffered"
                );
                if !queued.is_empty() {
                    state.pending.insert(session_id.to_string(), queued);
                }
                return delivered;
            }
            delivered += 1;
        }

        state.clients.insert(session_id.to_string(), handle);
        info!(session_id, delivered, "Client connected");
        delivered
    }

    /// Removes the connection installed under `connection_id`, leaving
    /// buffered payloads untouched. A stale `connection_id` is a no-op.
    pub fn unregister(&self, session_id: &str, connection_id: u64) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state
            .clients
            .get(session_id)
            .is_some_and(|handle| handle.id() == connection_id)
        {
            state.clients.remove(session_id);
            info!(session_id, "Client disconnected");
        }
    }

    /// Delivers `payload` to `session_id` immediately if a live connection
    /// exists, otherwise buffers it.
    pub fn send(&self, session_id: &str, payload: String) -> SendOutcome {
        let mut state = self.state.lock().expect("lock poisoned");

        if let Some(handle) = state.clients.get(session_id) {
            if handle.deliver(payload).is_ok() {
                debug!(session_id, "Payload delivered");
                return SendOutcome::Delivered;
            }
            // Dead connection: drop it, and the payload with it.
            state.clients.remove(session_id);
            warn!(session_id, "Dead connection removed, payload discarded");
            return SendOutcome::Dropped;
        }

        state
            .pending
            .entry(session_id.to_string())
            .or_default()
            .push_back(payload);
        debug!(session_id, "No live connection, payload buffered");
        SendOutcome::Buffered
    }

    /// Number of payloads buffered for a session, for introspection.
    pub fn pending_len(&self, session_id: &str) -> usize {
        let state = self.state.lock().expect("lock poisoned");
        state.pending.get(session_id).map_or(0, VecDeque::len)
    }

    /// Whether a live connection is installed for a session.
    pub fn is_connected(&self, session_id: &str) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state.clients.contains_key(session_id)
    }
}
