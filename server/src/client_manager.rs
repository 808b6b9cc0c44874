//! Registry of live connections.
//!
//! Tracks every accepted socket from the moment it is admitted until it is
//! deregistered: assigned id, peer address, last activity, the player name
//! once CONNECT arrives, the outbound queue feeding its writer task and the
//! kick signal that ends the connection task. Capacity is enforced here.

use log::info;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;

/// Encoded frames waiting to be written to one connection.
///
/// The receiving end is owned by the connection's writer task, so a peer
/// that stops reading only fills its own queue.
pub type Outbox = mpsc::Sender<Arc<[u8]>>;

/// What a sender needs to reach one connection.
#[derive(Clone)]
pub struct ClientHandle {
    /// Connection id, which is also the player id
    pub id: u32,
    /// Queue drained by the connection's writer task
    pub outbox: Outbox,
    /// Wakes the connection task so it shuts down
    pub kick: Arc<Notify>,
}

impl ClientHandle {
    /// Queues an encoded frame without waiting.
    ///
    /// Fails when the queue is full (the peer is not keeping up) or when
    /// the writer task has already gone away.
    pub fn try_send(&self, bytes: Arc<[u8]>) -> Result<(), TrySendError<Arc<[u8]>>> {
        self.outbox.try_send(bytes)
    }
}

/// Represents one admitted connection
///
/// Each client maintains:
/// - Connection metadata (id, address, last activity)
/// - The player name, once the client has joined
/// - The outbound queue and kick signal handed out to senders
pub struct Client {
    /// Unique client identifier assigned by the server
    pub id: u32,
    /// Peer address, kept for logging
    pub addr: SocketAddr,
    /// Last time any frame arrived from this client
    pub last_seen: Instant,
    /// Set once the client has sent CONNECT
    pub name: Option<String>,
    /// Sending side of the connection's outbound queue
    outbox: Outbox,
    /// Shared with the connection task and its writer task
    kick: Arc<Notify>,
}

impl Client {
    /// Creates a new client with the given id and address
    ///
    /// The client starts out active as of `now`, without a name, and with
    /// a fresh kick signal.
    pub fn new(id: u32, addr: SocketAddr, outbox: Outbox, now: Instant) -> Self {
        Self {
            id,
            addr,
            last_seen: now,
            name: None,
            outbox,
            kick: Arc::new(Notify::new()),
        }
    }

    /// Cheap clone of everything a sender needs.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            id: self.id,
            outbox: self.outbox.clone(),
            kick: self.kick.clone(),
        }
    }

    /// Checks if the client has been silent for longer than `timeout`
    ///
    /// Any received frame counts as activity, heartbeats included.
    pub fn is_idle(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// Manages all admitted connections
///
/// The ClientManager enforces the server capacity, hands out connection ids
/// and answers the questions the server core asks about its connections:
/// who is idle, who has joined, and who should receive a broadcast.
pub struct ClientManager {
    /// Admitted clients indexed by their id, iterated in id order
    clients: BTreeMap<u32, Client>,
    /// Next id to assign
    next_client_id: u32,
    /// Maximum number of concurrent connections allowed
    max_clients: usize,
}

impl ClientManager {
    /// Creates a new client manager with the given capacity limit
    ///
    /// Ids start at 1 and are never reused.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: BTreeMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Attempts to admit a new connection
    ///
    /// Returns `None` when the server is full. No id is consumed in that
    /// case.
    pub fn try_register(
        &mut self,
        addr: SocketAddr,
        outbox: Outbox,
        now: Instant,
    ) -> Option<ClientHandle> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let client = Client::new(client_id, addr, outbox, now);
        let handle = client.handle();
        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, client);
        Some(handle)
    }

    /// Removes a client, returning it if it was still registered
    pub fn remove_client(&mut self, client_id: u32) -> Option<Client> {
        let client = self.clients.remove(&client_id)?;
        info!("Client {} disconnected", client.id);
        Some(client)
    }

    pub fn contains(&self, client_id: u32) -> bool {
        self.clients.contains_key(&client_id)
    }

    /// Records activity. Returns false for unknown ids.
    pub fn touch(&mut self, client_id: u32, now: Instant) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Remembers the name a client joined with
    pub fn set_name(&mut self, client_id: u32, name: &str) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.name = Some(name.to_string());
        }
    }

    /// True once the client has sent CONNECT
    pub fn has_joined(&self, client_id: u32) -> bool {
        self.clients
            .get(&client_id)
            .map_or(false, |client| client.name.is_some())
    }

    /// Ids of clients silent for longer than `timeout`.
    pub fn idle_clients(&self, timeout: Duration, now: Instant) -> Vec<u32> {
        self.clients
            .values()
            .filter(|client| client.is_idle(timeout, now))
            .map(|client| client.id)
            .collect()
    }

    /// Handles of every registered client, in id order
    pub fn handles(&self) -> Vec<ClientHandle> {
        self.clients.values().map(Client::handle).collect()
    }

    /// Number of registered clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
