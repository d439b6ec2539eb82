//! Shared relay state: live connections, their asserted names, and the avatar
//! cache.
//!
//! All three maps live behind one lock, and every transition (including the
//! broadcast it triggers) happens while that lock is held. Broadcasting only
//! enqueues onto per-connection queues with `try_send`, so the lock is never
//! held across socket I/O.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use tokio::sync::{
    Mutex, Semaphore,
    mpsc::{self, error::TrySendError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::message::Message;

pub type ConnectionId = u64;

/// Default number of lines a connection may have queued before it is evicted.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Upper bound for the configured outbound capacity.
pub const MAX_OUTBOUND_CAPACITY: usize = 1 << 20;

/// A cached avatar, keyed in the registry by display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avatar {
    pub filename: String,
    /// Base64 exactly as the client sent it.
    pub data: String,
}

/// Where a connection is in its lifecycle, as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered, no message has named it yet.
    Connected,
    Named(String),
    /// Removed from the registry; terminal.
    Closed,
}

/// Handed to the task that owns a freshly admitted connection.
pub struct Admission {
    pub id: ConnectionId,
    /// Lines to write to the peer, starting with the avatar snapshot.
    pub outbound: mpsc::Receiver<Bytes>,
    /// Cancelled when the peer stops draining its queue.
    pub evicted: CancellationToken,
}

struct Peer {
    outbound: mpsc::Sender<Bytes>,
    evict: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Peer>,
    names: HashMap<ConnectionId, String>,
    avatars: HashMap<String, Avatar>,
}

pub struct Registry {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
    outbound_capacity: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_CAPACITY)
    }
}

impl Registry {
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            next_id: AtomicU64::new(1),
            outbound_capacity: outbound_capacity.clamp(1, MAX_OUTBOUND_CAPACITY),
        }
    }

    /// Registers a new connection and queues the avatar snapshot for it.
    ///
    /// The snapshot is queued under the same lock that inserts the
    /// connection, so it reaches the peer before any broadcast does.
    pub async fn admit(&self) -> Admission {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;

        let capacity = self
            .outbound_capacity
            .saturating_add(state.avatars.len())
            .min(Semaphore::MAX_PERMITS);
        let (tx, rx) = mpsc::channel(capacity);
        for (author, avatar) in &state.avatars {
            let line = Message::Avatar {
                author: author.clone(),
                filename: avatar.filename.clone(),
                data: avatar.data.clone(),
            }
            .to_line();
            // Capacity covers the whole snapshot.
            if tx.try_send(line).is_err() {
                warn!(id, "avatar snapshot did not fit the outbound queue");
                break;
            }
        }

        let evict = CancellationToken::new();
        state.connections.insert(
            id,
            Peer {
                outbound: tx,
                evict: evict.clone(),
            },
        );
        debug!(id, avatars = state.avatars.len(), "connection admitted");

        Admission {
            id,
            outbound: rx,
            evicted: evict,
        }
    }

    /// Applies the registry side of `message` sent by `from`, then broadcasts
    /// it to every other connection. Returns the number of peers it was
    /// queued for.
    pub async fn relay(&self, from: ConnectionId, message: &Message) -> usize {
        let mut state = self.state.lock().await;

        match message {
            Message::Text { author, .. } => {
                state.names.insert(from, author.clone());
            }
            Message::Avatar {
                author,
                filename,
                data,
            } => {
                state.names.insert(from, author.clone());
                state.avatars.insert(
                    author.clone(),
                    Avatar {
                        filename: filename.clone(),
                        data: data.clone(),
                    },
                );
            }
            Message::Rename { old, new } => {
                state.names.insert(from, new.clone());
                if let Some(avatar) = state.avatars.remove(old) {
                    state.avatars.insert(new.clone(), avatar);
                }
            }
            Message::Opaque(_) => {}
        }

        state.broadcast(&message.to_line(), Some(from))
    }

    /// Removes a closed connection. If it had a name, the remaining
    /// connections are told it left and the name is returned.
    pub async fn depart(&self, id: ConnectionId) -> Option<String> {
        let mut state = self.state.lock().await;
        state.connections.remove(&id);

        let name = state.names.remove(&id)?;
        state.broadcast(&Message::system(format!("{name} left")).to_line(), None);
        Some(name)
    }

    pub async fn state_of(&self, id: ConnectionId) -> ConnectionState {
        let state = self.state.lock().await;
        if !state.connections.contains_key(&id) {
            return ConnectionState::Closed;
        }
        match state.names.get(&id) {
            Some(name) => ConnectionState::Named(name.clone()),
            None => ConnectionState::Connected,
        }
    }

    pub async fn avatar(&self, name: &str) -> Option<Avatar> {
        self.state.lock().await.avatars.get(name).cloned()
    }

    /// Names currently holding a cached avatar, sorted.
    pub async fn avatar_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.avatars.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }
}

impl RegistryState {
    fn broadcast(&self, line: &Bytes, exclude: Option<ConnectionId>) -> usize {
        let mut delivered = 0;
        for (id, peer) in &self.connections {
            if Some(*id) == exclude {
                continue;
            }
            match peer.outbound.try_send(line.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    // Its own task notices the token and cleans up.
                    if !peer.evict.is_cancelled() {
                        warn!(id, "outbound queue full, evicting connection");
                        peer.evict.cancel();
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(id, "skipping connection that is shutting down");
                }
            }
        }
        delivered
    }
}
