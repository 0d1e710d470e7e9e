//! The lobby engine: a single dispatch task owns all server state, fed
//! by per-connection reader tasks and an expiry tick.
//!
//! Each accepted connection gets a stable [`ConnId`], a reader task that
//! turns frames into events, and a writer task draining the client's
//! outbox. Every event is fully processed before the next one, so state
//! mutations happen strictly in dispatch order and no locking is needed.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::logger::Logger;
use crate::proto::{
    self, Message, PlayResponse, PlayerStatus, ProtoError, WhoPlayer,
};
use crate::registry::{ConnId, LoginError, Registry};
use crate::signal::shutdown_signal;

/// How long an invitation may sit unanswered.
pub const PLAY_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Wake-up period of the dispatch loop, for timer granularity only.
pub const TICK_INTERVAL: Duration = Duration::from_secs(3);

/// Retry period while the listen address is occupied.
pub const BIND_INUSE_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub play_request_timeout: Duration,
    pub tick_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            play_request_timeout: PLAY_REQUEST_TIMEOUT,
            tick_interval: TICK_INTERVAL,
        }
    }
}

enum ConnEvent {
    Frame { conn: ConnId, msg: Message },
    Closed { conn: ConnId, error: Option<ProtoError> },
}

/// Bind the listener, retrying while the address is in use.
pub async fn bind_with_retry(addr: SocketAddr, log: &Logger) -> io::Result<TcpListener> {
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                log.warn(format_args!(
                    "{addr} is in use (retry in {} seconds...)",
                    BIND_INUSE_RETRY.as_secs()
                ));
                tokio::time::sleep(BIND_INUSE_RETRY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Accept and dispatch until a termination signal arrives.
pub async fn run(listener: TcpListener, cfg: ServerConfig, log: Arc<Logger>) -> io::Result<()> {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut lobby = Lobby::new(cfg.clone(), Arc::clone(&log));
    let mut tick = tokio::time::interval(cfg.tick_interval);
    let mut next_conn: u64 = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let conn = ConnId(next_conn);
                    next_conn += 1;
                    register_connection(&mut lobby, conn, stream, addr, events_tx.clone());
                }
                Err(e) => {
                    // Transient accept failures only cost the one
                    // connection; the loop keeps serving.
                    log.warn(format_args!("accept error: {e}"));
                }
            },
            Some(event) = events.recv() => lobby.handle(event),
            _ = tick.tick() => lobby.expire_requests(Instant::now()),
            _ = shutdown_signal() => {
                log.info("Termination signal received, shutting down");
                return Ok(());
            }
        }
    }
}

fn register_connection(
    lobby: &mut Lobby,
    conn: ConnId,
    stream: TcpStream,
    addr: SocketAddr,
    events: UnboundedSender<ConnEvent>,
) {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    lobby.on_connect(conn, addr, out_tx);
    tokio::spawn(writer_task(write_half, out_rx));
    tokio::spawn(reader_task(conn, read_half, events));
}

async fn reader_task(
    conn: ConnId,
    mut read_half: OwnedReadHalf,
    events: UnboundedSender<ConnEvent>,
) {
    loop {
        match proto::read_message(&mut read_half).await {
            Ok(msg) => {
                if events.send(ConnEvent::Frame { conn, msg }).is_err() {
                    return;
                }
            }
            Err(e) => {
                let error = (!matches!(e, ProtoError::Closed)).then_some(e);
                let _ = events.send(ConnEvent::Closed { conn, error });
                return;
            }
        }
    }
}

/// Drains the client's outbox; ends when the lobby drops the sender
/// (eviction) or the peer stops reading.
async fn writer_task(mut write_half: OwnedWriteHalf, mut outbox: UnboundedReceiver<Message>) {
    use tokio::io::AsyncWriteExt;

    while let Some(msg) = outbox.recv().await {
        if proto::write_message(&mut write_half, &msg).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// All lobby state plus one handler per control message.
pub struct Lobby {
    registry: Registry,
    cfg: ServerConfig,
    log: Arc<Logger>,
}

impl Lobby {
    pub fn new(cfg: ServerConfig, log: Arc<Logger>) -> Lobby {
        Lobby { registry: Registry::new(), cfg, log }
    }

    fn handle(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Frame { conn, msg } => self.on_frame(conn, msg),
            ConnEvent::Closed { conn, error } => self.on_closed(conn, error),
        }
    }

    pub fn on_connect(&mut self, conn: ConnId, addr: SocketAddr, outbox: UnboundedSender<Message>) {
        self.log.info(format_args!("Incoming connection from {addr} ({conn})"));
        self.registry.add(conn, addr.ip(), outbox);
    }

    fn on_frame(&mut self, conn: ConnId, msg: Message) {
        self.log
            .verbose(format_args!("Received {} from {}", msg.msg_type(), self.describe(conn)));

        let logged_in = self
            .registry
            .by_conn(conn)
            .is_some_and(|record| record.logged_in());

        match msg {
            Message::ReqLogin { username, udp_port } => self.do_login(conn, &username, udp_port),
            // Anything else requires a completed login first.
            _ if !logged_in => self.bad_request(conn),
            Message::ReqWho => self.send_player_list(conn),
            Message::ReqPlay { opponent } => self.play_request(conn, &opponent),
            Message::ReqPlayAns { accept } => self.play_answer(conn, accept),
            Message::Endgame { disconnected } => self.terminate_match(conn, disconnected),
            _ => self.bad_request(conn),
        }
    }

    fn on_closed(&mut self, conn: ConnId, error: Option<ProtoError>) {
        // Nothing to do if a bad request already evicted this client.
        let Some(record) = self.registry.by_conn(conn) else { return };

        if record.logged_in() {
            self.log.info(format_args!(
                "Player {} has closed the connection ({conn})",
                record.username
            ));
        } else {
            self.log.info(format_args!("The remote host on {conn} has closed the connection"));
        }

        match error {
            Some(e) if e.is_bad_frame() => {
                self.log.warn(format_args!("{conn} sent an invalid frame: {e}"));
                self.registry.send(conn, Message::BadReq);
            }
            Some(e) => self.log.warn(format_args!("transport error on {conn}: {e}")),
            None => {}
        }

        self.evict(conn);
    }

    /// Tear down a client: peer notification, match deletion, record
    /// removal. Dropping the outbox ends the writer task.
    fn evict(&mut self, conn: ConnId) {
        self.terminate_match(conn, true);
        self.registry.remove(conn);
    }

    /// Invalid or out-of-place request: answer `ANS_BADREQ`, then close.
    fn bad_request(&mut self, conn: ConnId) {
        self.log.warn(format_args!("Bad request from {}", self.describe(conn)));
        self.registry.send(conn, Message::BadReq);
        self.evict(conn);
    }

    fn do_login(&mut self, conn: ConnId, username: &str, udp_port: u16) {
        let response = match self.registry.login(conn, username, udp_port) {
            Ok(()) => {
                self.log
                    .info(format_args!("{conn} is now logged in as: {username}"));
                proto::LoginResponse::Ok
            }
            Err(LoginError::InvalidName) => {
                self.log
                    .info(format_args!("{conn} sent an invalid username: {username}"));
                proto::LoginResponse::InvalidName
            }
            Err(LoginError::NameInUse) => {
                self.log
                    .info(format_args!("{conn} sent a username already in use: {username}"));
                proto::LoginResponse::NameInUse
            }
        };
        self.registry.send(conn, Message::AnsLogin(response));
    }

    fn send_player_list(&mut self, conn: ConnId) {
        let players: Vec<WhoPlayer> = self
            .registry
            .iter_logged()
            .filter(|record| record.conn != conn)
            .map(|record| {
                let (status, opponent) = match self.registry.match_of(record.conn) {
                    None => (PlayerStatus::Idle, String::new()),
                    Some(m) => {
                        let status = if m.awaiting_reply {
                            PlayerStatus::AwaitingReply
                        } else {
                            PlayerStatus::InGame
                        };
                        let opponent = self
                            .registry
                            .by_conn(m.other(record.conn))
                            .map(|peer| peer.username.clone())
                            .unwrap_or_default();
                        (status, opponent)
                    }
                };
                WhoPlayer { username: record.username.clone(), status, opponent }
            })
            .collect();

        self.registry.send(conn, Message::AnsWho(players));
    }

    fn play_request(&mut self, conn: ConnId, opponent: &str) {
        // A client that already has a match may not open another one.
        if self.registry.match_of(conn).is_some() {
            self.bad_request(conn);
            return;
        }

        let requester_name = match self.registry.by_conn(conn) {
            Some(record) => record.username.clone(),
            None => return,
        };

        let invitee = match self.registry.by_name(opponent) {
            None => {
                self.registry
                    .send(conn, Message::play_answer(PlayResponse::InvalidOpponent));
                return;
            }
            Some(record) if record.conn == conn => {
                self.registry
                    .send(conn, Message::play_answer(PlayResponse::InvalidOpponent));
                return;
            }
            Some(record) if record.match_id.is_some() => {
                self.registry
                    .send(conn, Message::play_answer(PlayResponse::OpponentInGame));
                return;
            }
            Some(record) => record.conn,
        };

        self.registry.add_match(conn, invitee, Instant::now());
        self.log.info(format_args!("{requester_name} invited {opponent} to play"));
        self.registry
            .send(invitee, Message::ReqPlay { opponent: requester_name });
    }

    fn play_answer(&mut self, conn: ConnId, accept: bool) {
        // Only the invitee of a pending match gets a say.
        let Some(m) = self.registry.match_of(conn) else { return };
        if conn == m.player1 || !m.awaiting_reply {
            return;
        }
        let m = m.clone();

        if accept {
            self.forward_peer_endpoints(&m);
            self.registry.set_live(m.id);
            self.log.info(format_args!("Match accepted between {}", self.match_names(&m)));
        } else {
            self.registry.send(m.player1, Message::play_answer(PlayResponse::Decline));
            self.registry.send(m.player2, Message::play_answer(PlayResponse::Decline));
            self.log.info(format_args!("Match declined between {}", self.match_names(&m)));
            self.registry.delete_match(m.id);
        }
    }

    /// On accept each player learns the other's UDP endpoint.
    fn forward_peer_endpoints(&mut self, m: &crate::registry::MatchRecord) {
        for (target, source) in [(m.player1, m.player2), (m.player2, m.player1)] {
            let Some(peer) = self.registry.by_conn(source) else { continue };
            let answer = Message::AnsPlay {
                response: PlayResponse::Accept,
                addr: peer.addr,
                udp_port: peer.udp_port,
            };
            self.registry.send(target, answer);
        }
    }

    /// End-of-game from a client, or eviction (`disconnected` true).
    /// Without a match this is a no-op, which makes a duplicate
    /// `MSG_ENDGAME` harmless.
    fn terminate_match(&mut self, conn: ConnId, disconnected: bool) {
        let Some(m) = self.registry.match_of(conn) else { return };
        let m = m.clone();
        let peer = m.other(conn);

        if m.awaiting_reply {
            // The pending invitation resolves as a decline for whoever
            // is still around.
            self.registry.send(peer, Message::play_answer(PlayResponse::Decline));
        } else {
            self.registry.send(peer, Message::Endgame { disconnected });
        }

        self.log.info(format_args!("Match ended between {}", self.match_names(&m)));
        self.registry.delete_match(m.id);
    }

    /// Time out stale invitations; both parties hear about it.
    pub fn expire_requests(&mut self, now: Instant) {
        for m in self
            .registry
            .take_expired(now, self.cfg.play_request_timeout)
        {
            self.log.info(format_args!("Play request expired between {}", self.match_names(&m)));
            self.registry.send(m.player1, Message::play_answer(PlayResponse::Timedout));
            self.registry.send(m.player2, Message::play_answer(PlayResponse::Timedout));
        }
    }

    fn describe(&self, conn: ConnId) -> String {
        match self.registry.by_conn(conn) {
            Some(record) if record.logged_in() => format!("{} ({conn})", record.username),
            _ => conn.to_string(),
        }
    }

    fn match_names(&self, m: &crate::registry::MatchRecord) -> String {
        let name = |conn| {
            self.registry
                .by_conn(conn)
                .map(|record| record.username.clone())
                .unwrap_or_else(|| conn.to_string())
        };
        format!("{} and {}", name(m.player1), name(m.player2))
    }
}
