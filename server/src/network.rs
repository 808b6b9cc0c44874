//! Server core: TCP accept loop, world tick and connection maintenance.

use crate::client_manager::{ClientHandle, ClientManager};
use crate::config::ServerConfig;
use crate::connection;
use crate::error::{Result, ServerError};
use crate::game::{Notice, NoticeKind, World};
use log::{debug, error, info, warn};
use shared::protocol::{ErrorCode, ProtocolError, ServerPacket, SERVER_SENDER_ID};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// State shared by every server task.
pub(crate) struct ServerState {
    pub config: ServerConfig,
    pub clients: RwLock<ClientManager>,
    pub world: Mutex<World>,
}

/// Encodes a packet once so it can be queued for any number of connections.
fn encode_packet(packet: &ServerPacket) -> std::result::Result<Arc<[u8]>, ProtocolError> {
    Ok(packet.to_frame()?.encode()?.into())
}

impl ServerState {
    /// Admits or rejects a freshly accepted socket.
    async fn admit(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }
        let (read_half, mut write_half) = stream.into_split();
        let (outbox, queue) = mpsc::channel(self.config.outbound_queue.max(1));

        let handle = {
            let mut clients = self.clients.write().await;
            let Some(handle) = clients.try_register(addr, outbox, Instant::now()) else {
                drop(clients);
                warn!("Rejecting connection from {}: server full", addr);
                self.reject(&mut write_half, addr).await;
                return;
            };

            // Queued before the registry lock is released, so no broadcast
            // can overtake the welcome.
            let welcome = ServerPacket::Welcome {
                player_id: handle.id,
            };
            match encode_packet(&welcome) {
                Ok(bytes) => {
                    if handle.try_send(bytes).is_err() {
                        warn!("Failed to welcome client {}", handle.id);
                    }
                }
                Err(e) => error!("Failed to encode welcome: {}", e),
            }
            handle
        };

        tokio::spawn(connection::write_loop(
            handle.id,
            write_half,
            queue,
            handle.kick.clone(),
            self.config.write_timeout,
        ));
        tokio::spawn(connection::run(self.clone(), handle, read_half));
        self.broadcast_player_list().await;
    }

    /// Tells a connection the server is full and closes it.
    async fn reject<W>(&self, writer: &mut W, addr: SocketAddr)
    where
        W: AsyncWrite + Unpin,
    {
        let packet = ServerPacket::Error {
            code: ErrorCode::ServerFull,
            message: "Server is full".to_string(),
        };
        let notify = async {
            let bytes =
                encode_packet(&packet).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            writer.write_all(&bytes).await?;
            writer.shutdown().await
        };
        match timeout(self.config.write_timeout, notify).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Could not notify {} about capacity: {}", addr, e),
            Err(_) => debug!("Timed out notifying {} about capacity", addr),
        }
    }

    /// Queues one packet for one connection. A connection that cannot take
    /// it is kicked.
    pub fn send_to(&self, handle: &ClientHandle, packet: &ServerPacket) {
        let bytes = match encode_packet(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode packet for client {}: {}", handle.id, e);
                return;
            }
        };
        if let Err(e) = handle.try_send(bytes) {
            debug!("Dropping client {}: {}", handle.id, e);
            handle.kick.notify_one();
        }
    }

    pub fn send_error(&self, handle: &ClientHandle, code: ErrorCode, message: &str) {
        let packet = ServerPacket::Error {
            code,
            message: message.to_string(),
        };
        self.send_to(handle, &packet);
    }

    /// Queues `packet` for every connection without waiting on any of them.
    /// Connections whose queue is full or closed are dropped from the
    /// registry and kicked afterwards.
    pub async fn broadcast(&self, packet: &ServerPacket) {
        let bytes = match encode_packet(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode broadcast: {}", e);
                return;
            }
        };

        let handles = self.clients.read().await.handles();
        let mut failed = Vec::new();
        for handle in handles {
            match handle.try_send(bytes.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Client {} is not keeping up, dropping it", handle.id);
                    failed.push(handle);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Writer for client {} is gone", handle.id);
                    failed.push(handle);
                }
            }
        }

        if !failed.is_empty() {
            let mut clients = self.clients.write().await;
            for handle in failed {
                clients.remove_client(handle.id);
                handle.kick.notify_one();
            }
        }
    }

    pub async fn broadcast_notices(&self, notices: Vec<Notice>) {
        for notice in notices {
            let packet = match notice.kind {
                NoticeKind::Chat => ServerPacket::Chat {
                    player_id: SERVER_SENDER_ID,
                    text: notice.text,
                },
                NoticeKind::LevelUpdate => ServerPacket::LevelUpdate {
                    player_id: SERVER_SENDER_ID,
                    text: notice.text,
                },
            };
            self.broadcast(&packet).await;
        }
    }

    pub async fn broadcast_player_list(&self) {
        let roster = self.world.lock().await.roster();
        self.broadcast(&ServerPacket::PlayerList(roster)).await;
    }

    /// Forgets a connection and its player, then tells everyone else.
    pub async fn deregister(&self, client_id: u32) {
        self.clients.write().await.remove_client(client_id);

        let (removed, notices) = {
            let mut world = self.world.lock().await;
            let removed = world.remove_player(client_id, Instant::now());
            (removed, world.take_notices())
        };
        if removed.is_some() {
            self.broadcast_notices(notices).await;
            self.broadcast_player_list().await;
        }
    }

    async fn tick(&self) {
        let (snapshot, notices) = {
            let mut world = self.world.lock().await;
            if let Err(e) = world.tick(Instant::now()) {
                error!("World tick failed: {}", e);
            }
            (world.snapshot(), world.take_notices())
        };

        self.broadcast_notices(notices).await;
        if !self.clients.read().await.is_empty() {
            self.broadcast(&ServerPacket::GameState(Box::new(snapshot)))
                .await;
        }
    }

    /// Kicks idle connections and heartbeats the rest.
    async fn maintain(&self) {
        let idle: Vec<ClientHandle> = {
            let mut clients = self.clients.write().await;
            clients
                .idle_clients(self.config.idle_timeout, Instant::now())
                .into_iter()
                .filter_map(|id| clients.remove_client(id))
                .map(|client| client.handle())
                .collect()
        };
        for handle in idle {
            info!("Kicking idle client {}", handle.id);
            handle.kick.notify_one();
        }

        self.broadcast(&ServerPacket::Heartbeat).await;
    }

    async fn kick_all(&self) {
        for handle in self.clients.read().await.handles() {
            handle.kick.notify_one();
        }
    }
}

/// The authoritative dungeon server.
pub struct Server {
    config: ServerConfig,
    state: Option<Arc<ServerState>>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: None,
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    /// Loads the first level, binds the listener and spawns the server tasks.
    /// Returns the bound address, which matters when port 0 was requested.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.shutdown.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let world = World::new(self.config.world.clone())?;
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        let addr = listener.local_addr()?;
        info!("Server listening on {}", addr);

        let state = Arc::new(ServerState {
            clients: RwLock::new(ClientManager::new(self.config.max_players)),
            world: Mutex::new(world),
            config: self.config.clone(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.tasks.push(tokio::spawn(accept_loop(
            state.clone(),
            listener,
            shutdown_rx.clone(),
        )));
        self.tasks
            .push(tokio::spawn(tick_loop(state.clone(), shutdown_rx.clone())));
        self.tasks
            .push(tokio::spawn(maintenance_loop(state.clone(), shutdown_rx)));

        self.state = Some(state);
        self.shutdown = Some(shutdown_tx);
        info!("Server started successfully");
        Ok(addr)
    }

    /// Stops accepting, halts the tick and maintenance tasks and kicks
    /// every connection.
    pub async fn stop(&mut self) -> Result<()> {
        let shutdown = self.shutdown.take().ok_or(ServerError::NotRunning)?;
        let _ = shutdown.send(true);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Server task ended abnormally: {}", e);
            }
        }
        if let Some(state) = self.state.take() {
            state.kick_all().await;
        }

        info!("Server shutting down");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Number of registered connections.
    pub async fn client_count(&self) -> usize {
        match &self.state {
            Some(state) => state.clients.read().await.len(),
            None => 0,
        }
    }
}

async fn accept_loop(
    state: Arc<ServerState>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => state.admit(stream, addr).await,
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
        }
    }
    debug!("Accept loop stopped");
}

async fn tick_loop(state: Arc<ServerState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(state.config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => state.tick().await,
        }
    }
    debug!("Tick loop stopped");
}

async fn maintenance_loop(state: Arc<ServerState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(state.config.maintenance_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => state.maintain().await,
        }
    }
    debug!("Maintenance loop stopped");
}
