//! Wire protocol shared by the lobby server and the clients.
//!
//! Every message is a fixed 8-byte header followed by a typed body:
//!
//! ```text
//! magic[2] = "BP" | type: u8 | reserved: u8 = 0 | body_length: u32 (BE)
//! ```
//!
//! Control messages travel over the TCP channel between a client and the
//! server; gameplay messages travel as UDP datagrams directly between the
//! two clients of a live match. `MSG_ENDGAME` is the one gameplay-range
//! code delivered over the control channel. All multi-byte integers are
//! big-endian; string fields occupy a fixed capacity, null-terminated and
//! null-padded.

use std::io;
use std::net::{IpAddr, Ipv4Addr};

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default TCP port of the lobby server.
pub const DEFAULT_PORT: u16 = 6683;

pub const HEADER_LEN: usize = 8;
pub const MAGIC: [u8; 2] = *b"BP";

/// Maximum username length in characters; the wire field reserves one
/// extra byte for the terminating zero.
pub const MAX_USERNAME_LENGTH: usize = 20;
pub const MAX_USERNAME_SIZE: usize = MAX_USERNAME_LENGTH + 1;

/// Size of one player record in an `ANS_WHO` body.
pub const WHO_PLAYER_SIZE: usize = 2 * MAX_USERNAME_SIZE + 1;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 2]),
    #[error("unknown message type 0x{0:02X}")]
    UnknownType(u8),
    #[error("bad body length {len} for {ty}")]
    BadLength { ty: MsgType, len: u32 },
    #[error("bad field value in {0} body")]
    BadValue(MsgType),
    #[error("frame shorter than its declared length")]
    ShortRead,
    #[error("peer answered with ANS_BADREQ")]
    BadRequest,
    #[error("connection closed by peer")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtoError {
    /// True for frames that failed validation, as opposed to transport
    /// conditions. The server answers these with `ANS_BADREQ` before
    /// closing the connection.
    pub fn is_bad_frame(&self) -> bool {
        matches!(
            self,
            ProtoError::BadMagic(_)
                | ProtoError::UnknownType(_)
                | ProtoError::BadLength { .. }
                | ProtoError::BadValue(_)
                | ProtoError::ShortRead
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    ReqLogin   = 0x00,
    ReqWho     = 0x02,
    ReqPlay    = 0x04,
    ReqPlayAns = 0x05,
    MsgReady   = 0x87,
    MsgShot    = 0x88,
    MsgResult  = 0x89,
    MsgEndgame = 0xAA,
    AnsLogin   = 0xF1,
    AnsWho     = 0xF3,
    AnsPlay    = 0xF6,
    AnsBadReq  = 0xFF,
}

impl MsgType {
    pub fn name(self) -> &'static str {
        match self {
            MsgType::ReqLogin   => "REQ_LOGIN",
            MsgType::ReqWho     => "REQ_WHO",
            MsgType::ReqPlay    => "REQ_PLAY",
            MsgType::ReqPlayAns => "REQ_PLAY_ANS",
            MsgType::MsgReady   => "MSG_READY",
            MsgType::MsgShot    => "MSG_SHOT",
            MsgType::MsgResult  => "MSG_RESULT",
            MsgType::MsgEndgame => "MSG_ENDGAME",
            MsgType::AnsLogin   => "ANS_LOGIN",
            MsgType::AnsWho     => "ANS_WHO",
            MsgType::AnsPlay    => "ANS_PLAY",
            MsgType::AnsBadReq  => "ANS_BADREQ",
        }
    }

    /// Gameplay messages are the ones exchanged peer-to-peer over UDP.
    /// `MSG_ENDGAME` sits in the gameplay code range but goes to the
    /// server over the control channel.
    pub fn is_gameplay(self) -> bool {
        matches!(self, MsgType::MsgReady | MsgType::MsgShot | MsgType::MsgResult)
    }

    fn valid_body_len(self, len: u32) -> bool {
        match self {
            MsgType::ReqLogin => len == (MAX_USERNAME_SIZE + 2) as u32,
            MsgType::ReqWho | MsgType::MsgReady | MsgType::AnsBadReq => len == 0,
            MsgType::ReqPlay => len == MAX_USERNAME_SIZE as u32,
            MsgType::ReqPlayAns
            | MsgType::AnsLogin
            | MsgType::MsgResult
            | MsgType::MsgEndgame => len == 1,
            // 1-byte response + IPv4 or IPv6 address + 2-byte port.
            MsgType::AnsPlay => len == 7 || len == 19,
            MsgType::MsgShot => len == 8,
            MsgType::AnsWho => len % WHO_PLAYER_SIZE as u32 == 0,
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for MsgType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, ProtoError> {
        Ok(match value {
            0x00 => MsgType::ReqLogin,
            0x02 => MsgType::ReqWho,
            0x04 => MsgType::ReqPlay,
            0x05 => MsgType::ReqPlayAns,
            0x87 => MsgType::MsgReady,
            0x88 => MsgType::MsgShot,
            0x89 => MsgType::MsgResult,
            0xAA => MsgType::MsgEndgame,
            0xF1 => MsgType::AnsLogin,
            0xF3 => MsgType::AnsWho,
            0xF6 => MsgType::AnsPlay,
            0xFF => MsgType::AnsBadReq,
            other => return Err(ProtoError::UnknownType(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoginResponse {
    Ok          = 0,
    InvalidName = 1,
    NameInUse   = 2,
}

impl TryFrom<u8> for LoginResponse {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, ProtoError> {
        Ok(match value {
            0 => LoginResponse::Ok,
            1 => LoginResponse::InvalidName,
            2 => LoginResponse::NameInUse,
            _ => return Err(ProtoError::BadValue(MsgType::AnsLogin)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlayerStatus {
    Idle          = 0,
    AwaitingReply = 1,
    InGame        = 2,
}

impl TryFrom<u8> for PlayerStatus {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, ProtoError> {
        Ok(match value {
            0 => PlayerStatus::Idle,
            1 => PlayerStatus::AwaitingReply,
            2 => PlayerStatus::InGame,
            _ => return Err(ProtoError::BadValue(MsgType::AnsWho)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlayResponse {
    Decline         = 0,
    Accept          = 1,
    Timedout        = 2,
    InvalidOpponent = 3,
    OpponentInGame  = 4,
}

impl TryFrom<u8> for PlayResponse {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, ProtoError> {
        Ok(match value {
            0 => PlayResponse::Decline,
            1 => PlayResponse::Accept,
            2 => PlayResponse::Timedout,
            3 => PlayResponse::InvalidOpponent,
            4 => PlayResponse::OpponentInGame,
            _ => return Err(ProtoError::BadValue(MsgType::AnsPlay)),
        })
    }
}

/// One entry of an `ANS_WHO` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoPlayer {
    pub username: String,
    pub status: PlayerStatus,
    /// Zero-filled on the wire when `status` is [`PlayerStatus::Idle`].
    pub opponent: String,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ReqLogin { username: String, udp_port: u16 },
    AnsLogin(LoginResponse),
    ReqWho,
    AnsWho(Vec<WhoPlayer>),
    ReqPlay { opponent: String },
    ReqPlayAns { accept: bool },
    AnsPlay { response: PlayResponse, addr: IpAddr, udp_port: u16 },
    Ready,
    Shot { row: u32, col: u32 },
    Result { hit: bool },
    Endgame { disconnected: bool },
    BadReq,
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::ReqLogin { .. }   => MsgType::ReqLogin,
            Message::AnsLogin(_)       => MsgType::AnsLogin,
            Message::ReqWho            => MsgType::ReqWho,
            Message::AnsWho(_)         => MsgType::AnsWho,
            Message::ReqPlay { .. }    => MsgType::ReqPlay,
            Message::ReqPlayAns { .. } => MsgType::ReqPlayAns,
            Message::AnsPlay { .. }    => MsgType::AnsPlay,
            Message::Ready             => MsgType::MsgReady,
            Message::Shot { .. }       => MsgType::MsgShot,
            Message::Result { .. }     => MsgType::MsgResult,
            Message::Endgame { .. }    => MsgType::MsgEndgame,
            Message::BadReq            => MsgType::AnsBadReq,
        }
    }

    /// Answer for an `ANS_PLAY` that carries no peer address (everything
    /// except an accept).
    pub fn play_answer(response: PlayResponse) -> Message {
        Message::AnsPlay {
            response,
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port: 0,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Message::ReqLogin { .. } => MAX_USERNAME_SIZE + 2,
            Message::AnsLogin(_)
            | Message::ReqPlayAns { .. }
            | Message::Result { .. }
            | Message::Endgame { .. } => 1,
            Message::ReqWho | Message::Ready | Message::BadReq => 0,
            Message::AnsWho(players) => players.len() * WHO_PLAYER_SIZE,
            Message::ReqPlay { .. } => MAX_USERNAME_SIZE,
            Message::AnsPlay { addr, .. } => match addr {
                IpAddr::V4(_) => 7,
                IpAddr::V6(_) => 19,
            },
            Message::Shot { .. } => 8,
        }
    }

    /// Serialize into a complete frame (header included). Magic and the
    /// reserved byte are filled in here; callers never see them.
    pub fn encode(&self) -> BytesMut {
        let body_len = self.body_len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        buf.put_slice(&MAGIC);
        buf.put_u8(self.msg_type() as u8);
        buf.put_u8(0x00);
        buf.put_u32(body_len as u32);

        match self {
            Message::ReqLogin { username, udp_port } => {
                put_name(&mut buf, username);
                buf.put_u16(*udp_port);
            }
            Message::AnsLogin(response) => buf.put_u8(*response as u8),
            Message::ReqWho | Message::Ready | Message::BadReq => {}
            Message::AnsWho(players) => {
                for p in players {
                    put_name(&mut buf, &p.username);
                    buf.put_u8(p.status as u8);
                    put_name(&mut buf, &p.opponent);
                }
            }
            Message::ReqPlay { opponent } => put_name(&mut buf, opponent),
            Message::ReqPlayAns { accept } => buf.put_u8(*accept as u8),
            Message::AnsPlay { response, addr, udp_port } => {
                buf.put_u8(*response as u8);
                match addr {
                    IpAddr::V4(v4) => buf.put_slice(&v4.octets()),
                    IpAddr::V6(v6) => buf.put_slice(&v6.octets()),
                }
                buf.put_u16(*udp_port);
            }
            Message::Shot { row, col } => {
                buf.put_u32(*row);
                buf.put_u32(*col);
            }
            Message::Result { hit } => buf.put_u8(*hit as u8),
            Message::Endgame { disconnected } => buf.put_u8(*disconnected as u8),
        }

        buf
    }

    /// Parse a complete frame (as received in a datagram).
    pub fn decode(frame: &[u8]) -> Result<Message, ProtoError> {
        if frame.len() < HEADER_LEN {
            return Err(ProtoError::ShortRead);
        }
        let mut head = [0u8; HEADER_LEN];
        head.copy_from_slice(&frame[..HEADER_LEN]);
        let header = Header::parse(&head)?;
        let body = &frame[HEADER_LEN..];
        if body.len() < header.body_len as usize {
            return Err(ProtoError::ShortRead);
        }
        if body.len() > header.body_len as usize {
            return Err(ProtoError::BadLength { ty: header.ty, len: header.body_len });
        }
        Message::decode_body(header.ty, body)
    }

    fn decode_body(ty: MsgType, mut body: &[u8]) -> Result<Message, ProtoError> {
        Ok(match ty {
            MsgType::ReqLogin => {
                let username = get_name(&mut body);
                let udp_port = body.get_u16();
                Message::ReqLogin { username, udp_port }
            }
            MsgType::AnsLogin => Message::AnsLogin(LoginResponse::try_from(body.get_u8())?),
            MsgType::ReqWho => Message::ReqWho,
            MsgType::AnsWho => {
                let mut players = Vec::with_capacity(body.len() / WHO_PLAYER_SIZE);
                while body.has_remaining() {
                    let username = get_name(&mut body);
                    let status = PlayerStatus::try_from(body.get_u8())?;
                    let opponent = get_name(&mut body);
                    players.push(WhoPlayer { username, status, opponent });
                }
                Message::AnsWho(players)
            }
            MsgType::ReqPlay => Message::ReqPlay { opponent: get_name(&mut body) },
            MsgType::ReqPlayAns => Message::ReqPlayAns { accept: body.get_u8() != 0 },
            MsgType::AnsPlay => {
                let response = PlayResponse::try_from(body.get_u8())?;
                let addr = match body.remaining() {
                    6 => {
                        let mut octets = [0u8; 4];
                        body.copy_to_slice(&mut octets);
                        IpAddr::from(octets)
                    }
                    _ => {
                        let mut octets = [0u8; 16];
                        body.copy_to_slice(&mut octets);
                        IpAddr::from(octets)
                    }
                };
                let udp_port = body.get_u16();
                Message::AnsPlay { response, addr, udp_port }
            }
            MsgType::MsgReady => Message::Ready,
            MsgType::MsgShot => Message::Shot { row: body.get_u32(), col: body.get_u32() },
            MsgType::MsgResult => Message::Result { hit: body.get_u8() != 0 },
            MsgType::MsgEndgame => Message::Endgame { disconnected: body.get_u8() != 0 },
            MsgType::AnsBadReq => Message::BadReq,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub ty: MsgType,
    pub body_len: u32,
}

impl Header {
    pub fn parse(raw: &[u8; HEADER_LEN]) -> Result<Header, ProtoError> {
        if raw[..2] != MAGIC {
            return Err(ProtoError::BadMagic([raw[0], raw[1]]));
        }
        let ty = MsgType::try_from(raw[2])?;
        let body_len = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if !ty.valid_body_len(body_len) {
            return Err(ProtoError::BadLength { ty, len: body_len });
        }
        Ok(Header { ty, body_len })
    }
}

/// Write a string into its fixed-capacity field: truncated to the
/// capacity minus the terminating zero, then null-padded.
fn put_name(buf: &mut BytesMut, name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(MAX_USERNAME_LENGTH);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, MAX_USERNAME_SIZE - n);
}

fn get_name(buf: &mut &[u8]) -> String {
    let mut raw = [0u8; MAX_USERNAME_SIZE];
    buf.copy_to_slice(&mut raw);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(MAX_USERNAME_SIZE);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn eof_to_closed(e: io::Error) -> ProtoError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ProtoError::Closed
    } else {
        ProtoError::Io(e)
    }
}

/// Read one framed message from a stream.
///
/// A stream that closes cleanly between frames yields
/// [`ProtoError::Closed`]; a received `ANS_BADREQ` is surfaced as
/// [`ProtoError::BadRequest`] so the caller tears the connection down.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_LEN];
    reader.read_exact(&mut head).await.map_err(eof_to_closed)?;
    let header = Header::parse(&head)?;

    let mut body = vec![0u8; header.body_len as usize];
    reader.read_exact(&mut body).await.map_err(eof_to_closed)?;

    let msg = Message::decode_body(header.ty, &body)?;
    if matches!(msg, Message::BadReq) {
        return Err(ProtoError::BadRequest);
    }
    Ok(msg)
}

/// Write one framed message to a stream.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&msg.encode()).await?;
    Ok(())
}
