//! Broadcaster
//!
//! Per-client outbound event queues. Events broadcast to a single client
//! are delivered in production order; chunk events are best-effort and get
//! dropped for a client whose queue of unconsumed chunks has grown past the
//! budget, while terminal events always enqueue. The server never blocks on
//! a slow client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use appforge_core::events::AgentEvent;
use tokio::sync::mpsc;
use tracing::debug;

/// Unconsumed chunk events tolerated per client before further chunks drop.
const MAX_PENDING_CHUNKS: usize = 256;

struct ClientHandle {
    sender: mpsc::UnboundedSender<AgentEvent>,
    pending_chunks: Arc<AtomicUsize>,
}

/// Receiving side of one client's outbound queue.
pub struct ClientReceiver {
    rx: mpsc::UnboundedReceiver<AgentEvent>,
    pending_chunks: Arc<AtomicUsize>,
}

impl ClientReceiver {
    /// Next event in production order; `None` after disconnect.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        let event = self.rx.recv().await;
        if let Some(event) = &event {
            if event.is_chunk() {
                self.pending_chunks.fetch_sub(1, Ordering::SeqCst);
            }
        }
        event
    }

    /// Non-blocking variant used by transports that poll.
    pub fn try_recv(&mut self) -> Option<AgentEvent> {
        let event = self.rx.try_recv().ok();
        if let Some(event) = &event {
            if event.is_chunk() {
                self.pending_chunks.fetch_sub(1, Ordering::SeqCst);
            }
        }
        event
    }
}

/// Fan-out hub for connected clients.
#[derive(Default)]
pub struct Broadcaster {
    clients: Mutex<HashMap<String, ClientHandle>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client and return its receiver.
    pub fn connect(&self, client_id: impl Into<String>) -> ClientReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending_chunks = Arc::new(AtomicUsize::new(0));
        let client_id = client_id.into();
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                client_id.clone(),
                ClientHandle {
                    sender: tx,
                    pending_chunks: Arc::clone(&pending_chunks),
                },
            );
        debug!(%client_id, "client connected");
        ClientReceiver { rx, pending_chunks }
    }

    pub fn disconnect(&self, client_id: &str) {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(client_id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Send one event to every connected client. Clients whose receiver is
    /// gone are pruned.
    pub fn broadcast(&self, event: &AgentEvent) {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let mut dead = Vec::new();
        for (client_id, handle) in clients.iter() {
            if !Self::deliver(handle, event) {
                dead.push(client_id.clone());
            }
        }
        for client_id in dead {
            clients.remove(&client_id);
        }
    }

    /// Send one event to a single client (used for `agent_connected`).
    pub fn send_to(&self, client_id: &str, event: &AgentEvent) {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let alive = clients
            .get(client_id)
            .map(|handle| Self::deliver(handle, event))
            .unwrap_or(true);
        if !alive {
            clients.remove(client_id);
        }
    }

    fn deliver(handle: &ClientHandle, event: &AgentEvent) -> bool {
        if event.is_chunk() {
            if handle.pending_chunks.load(Ordering::SeqCst) >= MAX_PENDING_CHUNKS {
                // Slow client: this chunk drops, the terminating event for
                // the same path still arrives.
                return true;
            }
            handle.pending_chunks.fetch_add(1, Ordering::SeqCst);
        }
        handle.sender.send(event.clone()).is_ok()
    }
}
