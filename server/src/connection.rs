//! Per-connection task: decodes client frames and applies them to the world.

use crate::client_manager::ClientHandle;
use crate::network::ServerState;
use log::{debug, info, warn};
use shared::protocol::{ClientPacket, ErrorCode, Frame, FrameReader, ProtocolError, ServerPacket};
use shared::{CharacterType, Direction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::{error::Elapsed, timeout};

enum Event {
    Kicked,
    Read(Result<Result<Option<Frame>, ProtocolError>, Elapsed>),
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

struct Connection {
    state: Arc<ServerState>,
    handle: ClientHandle,
    joined: bool,
}

/// Serves one client until it disconnects, fails or is kicked, then
/// deregisters it.
pub(crate) async fn run<R>(state: Arc<ServerState>, handle: ClientHandle, reader: R)
where
    R: AsyncRead + Unpin,
{
    let id = handle.id;
    let read_timeout = state.config.read_timeout;
    let mut frames = FrameReader::with_resync_limit(reader, state.config.resync_limit);
    let kick = handle.kick.clone();
    let mut conn = Connection {
        state,
        handle,
        joined: false,
    };

    loop {
        let event = tokio::select! {
            _ = kick.notified() => Event::Kicked,
            read = timeout(read_timeout, frames.read_frame()) => Event::Read(read),
        };

        let frame = match event {
            Event::Kicked => {
                info!("Client {} kicked", id);
                break;
            }
            Event::Read(Err(_)) => {
                debug!("Read timeout for client {}", id);
                continue;
            }
            Event::Read(Ok(Ok(Some(frame)))) => frame,
            Event::Read(Ok(Ok(None))) => {
                info!("Client {} closed the connection", id);
                break;
            }
            Event::Read(Ok(Err(e))) if e.is_framing() => {
                warn!("Framing error from client {}: {}", id, e);
                conn.error(ErrorCode::InvalidMessage, &e.to_string());
                break;
            }
            Event::Read(Ok(Err(e))) => {
                info!("Connection to client {} lost: {}", id, e);
                break;
            }
        };

        conn.state.clients.write().await.touch(id, Instant::now());
        if conn.dispatch(frame).await == Flow::Close {
            break;
        }
    }

    // Dropping the last handle lets the writer flush what is queued and
    // close the socket.
    conn.state.deregister(id).await;
}

/// Drains one connection's outbound queue into its socket.
///
/// Runs until every sender is gone or a write fails or exceeds `limit`. A
/// failed write kicks the connection task. The socket is shut down on exit.
pub(crate) async fn write_loop<W>(
    id: u32,
    mut writer: W,
    mut queue: mpsc::Receiver<Arc<[u8]>>,
    kick: Arc<Notify>,
    limit: Duration,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = queue.recv().await {
        let write = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        match timeout(limit, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                info!("Write to client {} failed: {}", id, e);
                kick.notify_one();
                break;
            }
            Err(_) => {
                warn!("Write to client {} timed out", id);
                kick.notify_one();
                break;
            }
        }
    }

    queue.close();
    if let Ok(Err(e)) = timeout(limit, writer.shutdown()).await {
        debug!("Error closing socket of client {}: {}", id, e);
    }
}

impl Connection {
    fn id(&self) -> u32 {
        self.handle.id
    }

    fn error(&self, code: ErrorCode, message: &str) {
        self.state.send_error(&self.handle, code, message);
    }

    async fn dispatch(&mut self, frame: Frame) -> Flow {
        let packet = match ClientPacket::from_frame(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Malformed {:?} from client {}: {}", frame.kind, self.id(), e);
                self.error(ErrorCode::InvalidMessage, &e.to_string());
                return Flow::Continue;
            }
        };

        match packet {
            ClientPacket::Heartbeat => {}
            ClientPacket::Disconnect => {
                info!("Client {} disconnected", self.id());
                return Flow::Close;
            }
            ClientPacket::Connect { name, character } => self.join(&name, &character).await,
            _ if !self.joined => {
                self.error(ErrorCode::InvalidMessage, "CONNECT must come first");
            }
            ClientPacket::Move {
                player_id,
                direction,
            } => self.move_player(player_id, direction).await,
            ClientPacket::Chat { text, .. } => {
                self.state
                    .broadcast(&ServerPacket::Chat {
                        player_id: self.id(),
                        text,
                    })
                    .await;
            }
            ClientPacket::Action { text, .. } => self.action(text).await,
        }
        Flow::Continue
    }

    async fn join(&mut self, name: &str, character: &str) {
        let id = self.id();
        let name = match name.trim() {
            "" => format!("Player{}", id),
            trimmed => trimmed.to_string(),
        };
        let character = CharacterType::from_name(character);

        let notices = {
            let mut world = self.state.world.lock().await;
            world.add_player(id, &name, character);
            world.take_notices()
        };
        self.state.clients.write().await.set_name(id, &name);
        self.joined = true;
        info!("Client {} joined as {} ({})", id, name, character.name());

        self.state.broadcast_notices(notices).await;
        self.state.broadcast_player_list().await;
    }

    async fn move_player(&self, player_id: u32, direction: Direction) {
        if player_id != self.id() {
            warn!(
                "Client {} tried to move player {}",
                self.id(),
                player_id
            );
            self.error(
                ErrorCode::InvalidPlayerId,
                &format!("player {} is not yours", player_id),
            );
            return;
        }

        let (outcome, notices) = {
            let mut world = self.state.world.lock().await;
            let outcome = world.move_player(player_id, direction, Instant::now());
            (outcome, world.take_notices())
        };
        debug!("Client {} move {:?}: {:?}", player_id, direction, outcome);
        self.state.broadcast_notices(notices).await;
    }

    async fn action(&self, text: String) {
        let (hits, notices) = {
            let mut world = self.state.world.lock().await;
            let hits = world.perform_action(self.id(), &text);
            (hits, world.take_notices())
        };
        debug!("Client {} action {:?} hit {} enemies", self.id(), text, hits);

        self.state
            .broadcast(&ServerPacket::Action {
                player_id: self.id(),
                text,
            })
            .await;
        self.state.broadcast_notices(notices).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_manager::ClientManager;
    use crate::config::{ServerConfig, WorldConfig};
    use crate::game::World;
    use shared::protocol::{write_frame, MessageType};
    use std::path::PathBuf;
    use tokio::io::{duplex, DuplexStream};
    use tokio::sync::{Mutex, RwLock};

    fn test_state() -> Arc<ServerState> {
        let config = ServerConfig {
            world: WorldConfig {
                levels_dir: PathBuf::from("/nonexistent/dungeon-levels"),
                seed: Some(3),
                ..WorldConfig::default()
            },
            ..ServerConfig::default()
        };
        let world = World::new(config.world.clone()).unwrap();
        Arc::new(ServerState {
            clients: RwLock::new(ClientManager::new(config.max_players)),
            world: Mutex::new(world),
            config,
        })
    }

    /// Registers a connection the way admission does and spawns its
    /// writer. Returns the handle and the peer's reading end.
    async fn register(state: &ServerState, port: u16) -> (ClientHandle, DuplexStream) {
        let (server_out, client_in) = duplex(64 * 1024);
        let (outbox, queue) = mpsc::channel(state.config.outbound_queue);
        let addr = format!("127.0.0.1:{}", port).parse().unwrap();
        let handle = state
            .clients
            .write()
            .await
            .try_register(addr, outbox, Instant::now())
            .unwrap();
        tokio::spawn(write_loop(
            handle.id,
            server_out,
            queue,
            handle.kick.clone(),
            state.config.write_timeout,
        ));
        (handle, client_in)
    }

    async fn send(stream: &mut DuplexStream, packet: ClientPacket) {
        write_frame(stream, &packet.to_frame()).await.unwrap();
    }

    async fn expect(frames: &mut FrameReader<DuplexStream>, kind: MessageType) -> ServerPacket {
        loop {
            let frame = frames.read_frame().await.unwrap().expect("stream closed");
            if frame.kind == kind {
                return ServerPacket::from_frame(&frame).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let state = test_state();
        let (handle, client_in) = register(&state, 7000).await;
        let (mut client_out, server_in) = duplex(64 * 1024);
        let id = handle.id;
        let task = tokio::spawn(run(state.clone(), handle, server_in));
        let mut frames = FrameReader::new(client_in);

        send(
            &mut client_out,
            ClientPacket::Move {
                player_id: id,
                direction: Direction::Right,
            },
        )
        .await;
        match expect(&mut frames, MessageType::Error).await {
            ServerPacket::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidMessage),
            other => panic!("unexpected {:?}", other),
        }

        send(
            &mut client_out,
            ClientPacket::Connect {
                name: "ana".to_string(),
                character: "rogue".to_string(),
            },
        )
        .await;
        match expect(&mut frames, MessageType::PlayerList).await {
            ServerPacket::PlayerList(list) => assert_eq!(list, format!("{}:ana:rogue", id)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(state.clients.read().await.has_joined(id));

        send(
            &mut client_out,
            ClientPacket::Move {
                player_id: id + 1,
                direction: Direction::Right,
            },
        )
        .await;
        match expect(&mut frames, MessageType::Error).await {
            ServerPacket::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidPlayerId),
            other => panic!("unexpected {:?}", other),
        }

        send(
            &mut client_out,
            ClientPacket::Chat {
                player_id: 42,
                text: "hello".to_string(),
            },
        )
        .await;
        match expect(&mut frames, MessageType::Chat).await {
            ServerPacket::Chat { player_id, text } => {
                assert_eq!(player_id, id);
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected {:?}", other),
        }

        send(&mut client_out, ClientPacket::Disconnect).await;
        task.await.unwrap();
        assert!(state.clients.read().await.is_empty());
        assert_eq!(state.world.lock().await.player_count(), 0);
    }

    #[tokio::test]
    async fn test_framing_error_closes_connection() {
        let state = test_state();
        let (handle, client_in) = register(&state, 7001).await;
        let (mut client_out, server_in) = duplex(4096);
        let task = tokio::spawn(run(state.clone(), handle, server_in));

        client_out.write_all(&[0xAA; 64]).await.unwrap();

        let mut frames = FrameReader::new(client_in);
        let frame = frames.read_frame().await.unwrap().unwrap();
        match ServerPacket::from_frame(&frame).unwrap() {
            ServerPacket::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidMessage),
            other => panic!("unexpected {:?}", other),
        }
        assert!(frames.read_frame().await.unwrap().is_none());
        task.await.unwrap();
        assert!(state.clients.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_kicks_connection() {
        let (socket, peer) = duplex(64);
        drop(peer);
        let (outbox, queue) = mpsc::channel(4);
        let kick = Arc::new(Notify::new());
        let writer = tokio::spawn(write_loop(
            1,
            socket,
            queue,
            kick.clone(),
            Duration::from_secs(1),
        ));

        outbox.try_send(Arc::from(&b"lost"[..])).unwrap();
        timeout(Duration::from_secs(1), kick.notified())
            .await
            .expect("connection was not kicked");
        writer.await.unwrap();
        assert!(outbox.is_closed());
    }

    #[tokio::test]
    async fn test_writer_flushes_queue_before_closing() {
        let (socket, peer) = duplex(4096);
        let (outbox, queue) = mpsc::channel(4);
        let writer = tokio::spawn(write_loop(
            1,
            socket,
            queue,
            Arc::new(Notify::new()),
            Duration::from_secs(1),
        ));

        for packet in [ServerPacket::Heartbeat, ServerPacket::Welcome { player_id: 1 }] {
            let bytes = packet.to_frame().unwrap().encode().unwrap();
            outbox.try_send(bytes.into()).unwrap();
        }
        drop(outbox);
        writer.await.unwrap();

        let mut frames = FrameReader::new(peer);
        assert_eq!(
            frames.read_frame().await.unwrap().unwrap().kind,
            MessageType::Heartbeat
        );
        assert_eq!(
            frames.read_frame().await.unwrap().unwrap().kind,
            MessageType::Connect
        );
        assert!(frames.read_frame().await.unwrap().is_none());
    }
}
