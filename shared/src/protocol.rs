//! Length-prefixed binary framing shared by the server and its clients.
//!
//! Every frame on the wire is laid out as
//!
//! ```text
//! +--------+--------+----------------+-----------------+
//! | magic  |  type  | payload length |     payload     |
//! | 2 byte | 1 byte | 4 byte (BE)    | 0..=10 MiB      |
//! +--------+--------+----------------+-----------------+
//! ```
//!
//! [`FrameReader`] buffers internally, so a `read_frame` future can be dropped
//! (for example by a read timeout) without losing bytes of a partially
//! received frame. [`ClientPacket`] and [`ServerPacket`] give typed views of
//! the per-type payload encodings.

use crate::{Direction, WorldSnapshot};
use log::debug;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: [u8; 2] = *b"DG";
pub const HEADER_LEN: usize = 7;
pub const MAX_PAYLOAD_LEN: usize = 10 * 1024 * 1024;
/// Bytes the reader may skip while hunting for the next magic header.
pub const DEFAULT_RESYNC_LIMIT: usize = 16;
/// Sender id used for announcements that originate from the server itself.
pub const SERVER_SENDER_ID: u32 = 0;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Connect,
    Disconnect,
    PlayerMove,
    GameState,
    Chat,
    Action,
    LevelUpdate,
    PlayerList,
    Heartbeat,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        MessageType::Connect,
        MessageType::Disconnect,
        MessageType::PlayerMove,
        MessageType::GameState,
        MessageType::Chat,
        MessageType::Action,
        MessageType::LevelUpdate,
        MessageType::PlayerList,
        MessageType::Heartbeat,
        MessageType::Error,
    ];

    pub fn code(self) -> u8 {
        match self {
            MessageType::Connect => 1,
            MessageType::Disconnect => 2,
            MessageType::PlayerMove => 3,
            MessageType::GameState => 4,
            MessageType::Chat => 5,
            MessageType::Action => 6,
            MessageType::LevelUpdate => 7,
            MessageType::PlayerList => 8,
            MessageType::Heartbeat => 9,
            MessageType::Error => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<MessageType> {
        MessageType::ALL.into_iter().find(|t| t.code() == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidMessage,
    ServerFull,
    InvalidPlayerId,
}

impl ErrorCode {
    pub fn code(self) -> u8 {
        match self {
            ErrorCode::InvalidMessage => 1,
            ErrorCode::ServerFull => 2,
            ErrorCode::InvalidPlayerId => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<ErrorCode> {
        match code {
            1 => Some(ErrorCode::InvalidMessage),
            2 => Some(ErrorCode::ServerFull),
            3 => Some(ErrorCode::InvalidPlayerId),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic header {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    #[error("stream ended mid-frame with {0} bytes buffered")]
    Truncated(usize),

    #[error("malformed {kind:?} payload: {reason}")]
    MalformedPayload { kind: MessageType, reason: String },

    #[error("snapshot encoding failed: {0}")]
    Snapshot(#[from] bincode::Error),
}

impl ProtocolError {
    /// Errors caused by the byte stream itself rather than the socket.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::BadMagic(_)
                | ProtocolError::UnknownType(_)
                | ProtocolError::PayloadTooLarge(_)
                | ProtocolError::Truncated(_)
        )
    }

    fn malformed(kind: MessageType, reason: impl Into<String>) -> Self {
        ProtocolError::MalformedPayload {
            kind,
            reason: reason.into(),
        }
    }
}

/// One message: a type plus its still-encoded payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl Frame {
    pub fn new(kind: MessageType, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn empty(kind: MessageType) -> Self {
        Self::new(kind, Vec::new())
    }

    /// Header, type, length and payload in one contiguous buffer.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge(self.payload.len()));
        }
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&MAGIC);
        out.push(self.kind.code());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// Writes a frame with a single `write_all`.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Incremental frame decoder over any async byte stream.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    resync_limit: usize,
    skipped: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_resync_limit(inner, DEFAULT_RESYNC_LIMIT)
    }

    /// A limit of 1 gives the classic "skip one byte and retry" behaviour.
    pub fn with_resync_limit(inner: R, resync_limit: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            resync_limit,
            skipped: 0,
        }
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    /// Cancel-safe: the only await point is a single `read` into a scratch
    /// buffer, and bytes are appended to the internal buffer only after it
    /// completes.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(Some(frame));
            }

            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(ProtocolError::Truncated(self.buf.len()))
                };
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn take_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        self.resync()?;
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let code = self.buf[2];
        let kind = MessageType::from_code(code).ok_or(ProtocolError::UnknownType(code))?;
        let len = u32::from_be_bytes([self.buf[3], self.buf[4], self.buf[5], self.buf[6]]) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge(len));
        }
        if self.buf.len() < HEADER_LEN + len {
            self.buf.reserve(HEADER_LEN + len - self.buf.len());
            return Ok(None);
        }

        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        self.skipped = 0;
        Ok(Some(Frame::new(kind, payload)))
    }

    fn resync(&mut self) -> Result<(), ProtocolError> {
        while self.buf.len() >= MAGIC.len() && self.buf[..MAGIC.len()] != MAGIC {
            if self.skipped >= self.resync_limit {
                return Err(ProtocolError::BadMagic([self.buf[0], self.buf[1]]));
            }
            debug!("Skipping byte {:#04x} while resynchronizing", self.buf[0]);
            self.buf.remove(0);
            self.skipped += 1;
        }
        Ok(())
    }
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    Connect { name: String, character: String },
    Disconnect,
    Move { player_id: u32, direction: Direction },
    Chat { player_id: u32, text: String },
    Action { player_id: u32, text: String },
    Heartbeat,
}

impl ClientPacket {
    pub fn to_frame(&self) -> Frame {
        match self {
            ClientPacket::Connect { name, character } => Frame::new(
                MessageType::Connect,
                format!("{}|{}", name, character).into_bytes(),
            ),
            ClientPacket::Disconnect => Frame::empty(MessageType::Disconnect),
            ClientPacket::Move {
                player_id,
                direction,
            } => {
                let mut payload = player_id.to_be_bytes().to_vec();
                payload.push(direction.code());
                Frame::new(MessageType::PlayerMove, payload)
            }
            ClientPacket::Chat { player_id, text } => {
                Frame::new(MessageType::Chat, join_id_text(*player_id, text))
            }
            ClientPacket::Action { player_id, text } => {
                Frame::new(MessageType::Action, join_id_text(*player_id, text))
            }
            ClientPacket::Heartbeat => Frame::empty(MessageType::Heartbeat),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<ClientPacket, ProtocolError> {
        let kind = frame.kind;
        match kind {
            MessageType::Connect => {
                let text = utf8(kind, &frame.payload)?;
                let (name, character) = text.split_once('|').unwrap_or((text, ""));
                Ok(ClientPacket::Connect {
                    name: name.to_string(),
                    character: character.to_string(),
                })
            }
            MessageType::Disconnect => Ok(ClientPacket::Disconnect),
            MessageType::PlayerMove => {
                if frame.payload.len() != 5 {
                    return Err(ProtocolError::malformed(
                        kind,
                        format!("expected 5 bytes, got {}", frame.payload.len()),
                    ));
                }
                let p = &frame.payload;
                let player_id = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);
                let direction = Direction::from_code(p[4]).ok_or_else(|| {
                    ProtocolError::malformed(kind, format!("unknown direction {}", p[4]))
                })?;
                Ok(ClientPacket::Move {
                    player_id,
                    direction,
                })
            }
            MessageType::Chat => {
                let (player_id, text) = split_id_text(kind, &frame.payload)?;
                Ok(ClientPacket::Chat { player_id, text })
            }
            MessageType::Action => {
                let (player_id, text) = split_id_text(kind, &frame.payload)?;
                Ok(ClientPacket::Action { player_id, text })
            }
            MessageType::Heartbeat => Ok(ClientPacket::Heartbeat),
            other => Err(ProtocolError::malformed(other, "not a client message")),
        }
    }
}

/// Messages the server sends to clients.
#[derive(Debug, Clone)]
pub enum ServerPacket {
    /// CONNECT acknowledgement carrying the assigned player id.
    Welcome { player_id: u32 },
    GameState(Box<WorldSnapshot>),
    Chat { player_id: u32, text: String },
    Action { player_id: u32, text: String },
    LevelUpdate { player_id: u32, text: String },
    PlayerList(String),
    Heartbeat,
    Error { code: ErrorCode, message: String },
}

impl ServerPacket {
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let frame = match self {
            ServerPacket::Welcome { player_id } => {
                Frame::new(MessageType::Connect, player_id.to_string().into_bytes())
            }
            ServerPacket::GameState(snapshot) => {
                Frame::new(MessageType::GameState, snapshot.to_bytes()?)
            }
            ServerPacket::Chat { player_id, text } => {
                Frame::new(MessageType::Chat, join_id_text(*player_id, text))
            }
            ServerPacket::Action { player_id, text } => {
                Frame::new(MessageType::Action, join_id_text(*player_id, text))
            }
            ServerPacket::LevelUpdate { player_id, text } => {
                Frame::new(MessageType::LevelUpdate, join_id_text(*player_id, text))
            }
            ServerPacket::PlayerList(list) => {
                Frame::new(MessageType::PlayerList, list.clone().into_bytes())
            }
            ServerPacket::Heartbeat => Frame::empty(MessageType::Heartbeat),
            ServerPacket::Error { code, message } => {
                let mut payload = vec![code.code()];
                payload.extend_from_slice(message.as_bytes());
                Frame::new(MessageType::Error, payload)
            }
        };
        Ok(frame)
    }

    pub fn from_frame(frame: &Frame) -> Result<ServerPacket, ProtocolError> {
        let kind = frame.kind;
        match kind {
            MessageType::Connect => {
                let text = utf8(kind, &frame.payload)?;
                let player_id = text
                    .trim()
                    .parse()
                    .map_err(|_| ProtocolError::malformed(kind, "player id is not a number"))?;
                Ok(ServerPacket::Welcome { player_id })
            }
            MessageType::GameState => Ok(ServerPacket::GameState(Box::new(
                WorldSnapshot::from_bytes(&frame.payload)?,
            ))),
            MessageType::Chat => {
                let (player_id, text) = split_id_text(kind, &frame.payload)?;
                Ok(ServerPacket::Chat { player_id, text })
            }
            MessageType::Action => {
                let (player_id, text) = split_id_text(kind, &frame.payload)?;
                Ok(ServerPacket::Action { player_id, text })
            }
            MessageType::LevelUpdate => {
                let (player_id, text) = split_id_text(kind, &frame.payload)?;
                Ok(ServerPacket::LevelUpdate { player_id, text })
            }
            MessageType::PlayerList => Ok(ServerPacket::PlayerList(
                utf8(kind, &frame.payload)?.to_string(),
            )),
            MessageType::Heartbeat => Ok(ServerPacket::Heartbeat),
            MessageType::Error => {
                let (&first, rest) = frame
                    .payload
                    .split_first()
                    .ok_or_else(|| ProtocolError::malformed(kind, "missing error code"))?;
                let code = ErrorCode::from_code(first).ok_or_else(|| {
                    ProtocolError::malformed(kind, format!("unknown error code {}", first))
                })?;
                Ok(ServerPacket::Error {
                    code,
                    message: utf8(kind, rest)?.to_string(),
                })
            }
            other => Err(ProtocolError::malformed(other, "not a server message")),
        }
    }
}

fn utf8(kind: MessageType, bytes: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(bytes).map_err(|e| ProtocolError::malformed(kind, e.to_string()))
}

fn join_id_text(player_id: u32, text: &str) -> Vec<u8> {
    format!("{}|{}", player_id, text).into_bytes()
}

fn split_id_text(kind: MessageType, bytes: &[u8]) -> Result<(u32, String), ProtocolError> {
    let text = utf8(kind, bytes)?;
    let (id, rest) = text
        .split_once('|')
        .ok_or_else(|| ProtocolError::malformed(kind, "missing '|' separator"))?;
    let id = id
        .trim()
        .parse()
        .map_err(|_| ProtocolError::malformed(kind, format!("bad player id {:?}", id)))?;
    Ok((id, rest.to_string()))
}
