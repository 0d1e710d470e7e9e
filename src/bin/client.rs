use clap::{ArgAction, Parser};
use std::fmt;
use std::io::{self, Write as _};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use battlegrid::board::Coord;
use battlegrid::command::{self, Verb};
use battlegrid::game::{FireError, Game, GameError, Phase, PlaceError, Placement};
use battlegrid::logger::Logger;
use battlegrid::proto::{self, DEFAULT_PORT, Message, PlayResponse, ProtoError};
use battlegrid::registry::valid_username;
use battlegrid::render;
use battlegrid::signal;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name    = "client",
    version,
    about   = "Battlegrid — interactive player client",
    long_about = "Connects to a lobby server, logs in, and plays Battleship\n\
                  against other connected players.\n\
                  Lobby commands:   !help  !who  !connect <name>  !quit\n\
                  In-game commands: !help  !shot <cell>  !show  !disconnect"
)]
struct Args {
    /// Server address to connect to
    #[arg(default_value = "127.0.0.1")]
    address: String,

    /// Server port
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Increase output verbosity (-v verbose, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

// ── CONSTANTS ─────────────────────────────────────────────────────────────────

/// Inactivity budget while a match is running.
const IN_GAME_TIMEOUT: Duration = Duration::from_secs(60);

/// Reactor wake-up period, for timer granularity only.
const TICK_INTERVAL: Duration = Duration::from_secs(3);

const MIN_UDP_PORT: u16 = 1024;

// ── CLIENT EVENTS (operational logging to stderr) ─────────────────────────────

enum ClientEvent<'a> {
    Connecting  { addr: &'a str },
    Connected   { addr: SocketAddr },
    Received    { what: &'a str },
    UdpIgnored  { src: SocketAddr },
    Disconnected,
}

impl fmt::Display for ClientEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::Connecting { addr }  => write!(f, "Connecting to {addr}…"),
            ClientEvent::Connected  { addr }  => write!(f, "Connected to {addr}"),
            ClientEvent::Received   { what }  => write!(f, "← {what}"),
            ClientEvent::UdpIgnored { src }   =>
                write!(f, "Dropping datagram from unexpected source {src}"),
            ClientEvent::Disconnected         => write!(f, "Connection closed by server"),
        }
    }
}

// ── REACTOR STATE ─────────────────────────────────────────────────────────────

/// What the player's next typed line means.
enum Mode {
    /// Lines are commands (or ship placements, in the setup phase).
    Command,
    /// An invitation question is on screen; the next line answers it.
    ConfirmInvite { inviter: String },
}

/// Remembered answer to an invitation, so the eventual `ANS_PLAY` can be
/// narrated correctly.
struct InviteAnswer {
    inviter: String,
    accepted: bool,
}

/// One multiplexed input of the reactor.
enum Input {
    Line(Option<String>),
    Server(Option<Result<Message, ProtoError>>),
    Udp(io::Result<(usize, SocketAddr)>),
    Tick,
    Signal,
}

struct Client {
    log: Logger,
    my_name: String,
    writer: OwnedWriteHalf,
    udp: UdpSocket,
    game: Game,
    mode: Mode,
    /// Opponent we invited with `!connect`, until the server answers.
    pending_invite_to: Option<String>,
    /// Our reply to an incoming invitation, until the server answers.
    invite_answer: Option<InviteAnswer>,
    last_activity: Instant,
    prompt_pending: bool,
    quit: bool,
    failed: bool,
}

impl Client {
    /// Prompt policy: `> ` in the lobby, `# ` on the player's turn, the
    /// placement and invitation questions in their sub-modes, silence
    /// everywhere else. Rewritten after every asynchronous print.
    fn print_prompt(&mut self) {
        if !self.prompt_pending {
            return;
        }
        match (&self.mode, self.game.phase()) {
            (Mode::ConfirmInvite { inviter }, _) => {
                print!("\n{inviter} invited you to play a match. Accept? [Y/n] ");
            }
            (Mode::Command, Phase::Setup) => {
                print!("Ship {}: ", self.game.ships_placed() + 1);
            }
            (Mode::Command, Phase::Disconnected)
                if self.pending_invite_to.is_none() && self.invite_answer.is_none() =>
            {
                print!("\n> ");
            }
            (Mode::Command, Phase::MyTurn) => {
                print!("\n# ");
            }
            _ => return,
        }
        io::stdout().flush().ok();
        self.prompt_pending = false;
    }

    async fn send_server(&mut self, msg: Message) {
        if proto::write_message(&mut self.writer, &msg).await.is_err() {
            println!("\nThe server has closed the connection.");
            self.quit = true;
            self.failed = true;
        }
    }

    async fn send_peer(&mut self, msg: Message) {
        let Some(peer) = self.game.peer() else { return };
        if let Err(e) = self.udp.send_to(&msg.encode(), peer).await {
            self.log.warn(format_args!("failed to send {} to {peer}: {e}", msg.msg_type()));
        }
    }

    /// Drop the match after a protocol violation on the peer channel and
    /// let the server tell the opponent.
    async fn abort_match(&mut self) {
        self.send_server(Message::Endgame { disconnected: true }).await;
        self.game.abort();
    }

    // ── stdin ─────────────────────────────────────────────────────────────

    async fn on_line(&mut self, line: Option<String>) {
        let Some(line) = line else {
            println!("\nInput closed.");
            if self.game.in_game() {
                self.send_server(Message::Endgame { disconnected: true }).await;
            }
            self.quit = true;
            return;
        };

        self.last_activity = Instant::now();
        self.prompt_pending = true;

        if let Mode::ConfirmInvite { inviter } = &self.mode {
            let inviter = inviter.clone();
            self.on_invite_answer(&inviter, line.trim()).await;
            return;
        }

        match self.game.phase() {
            Phase::Setup => self.on_placement_line(line.trim()).await,
            // A sent or half-answered invitation is pending: typed input
            // is drained until the server resolves it.
            Phase::Disconnected
                if self.pending_invite_to.is_some() || self.invite_answer.is_some() =>
            {
                self.prompt_pending = false;
            }
            Phase::Disconnected => self.on_lobby_command(line.trim()).await,
            Phase::MyTurn => self.on_game_command(line.trim()).await,
            // Not this player's turn: typed input is drained silently.
            Phase::Waiting | Phase::WaitResult | Phase::OpponentTurn => {
                self.prompt_pending = false;
            }
        }
    }

    async fn on_invite_answer(&mut self, inviter: &str, answer: &str) {
        let accepted = match answer {
            "" | "y" | "Y" => true,
            "n" | "N" => false,
            _ => {
                render::print_error("Invalid answer.");
                return;
            }
        };
        self.send_server(Message::ReqPlayAns { accept: accepted }).await;
        self.invite_answer = Some(InviteAnswer { inviter: inviter.to_string(), accepted });
        self.mode = Mode::Command;
    }

    async fn on_placement_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        let coord = match Coord::parse(line) {
            Ok(coord) => coord,
            Err(e) => {
                render::print_error(e);
                return;
            }
        };
        match self.game.place_ship(coord) {
            Ok(Placement::Placed { .. }) => {}
            Ok(Placement::ReadyToPlay) => {
                self.send_peer(Message::Ready).await;
                println!("Waiting for {}...", self.game.opponent());
            }
            Err(PlaceError::Occupied) => {
                render::print_error("You have already placed a ship here.");
            }
            Err(PlaceError::WrongPhase) => {}
        }
    }

    async fn on_lobby_command(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        let (verb, arg) = match command::parse(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                render::print_error(format_args!("{e}\n"));
                return;
            }
        };
        match verb {
            Verb::Help => render::help_idle(),
            Verb::Who => self.send_server(Message::ReqWho).await,
            Verb::Connect => match arg {
                Some(name) if valid_username(name) => {
                    let name = name.to_string();
                    self.send_server(Message::ReqPlay { opponent: name.clone() }).await;
                    println!("Waiting for response from {name}...");
                    self.pending_invite_to = Some(name);
                }
                _ => render::print_error(
                    "!connect requires a valid opponent name as argument.\n",
                ),
            },
            Verb::Quit => {
                println!("Disconnecting... Bye!");
                self.quit = true;
            }
            Verb::Disconnect | Verb::Show | Verb::Shot => {
                render::print_error(format_args!("Invalid command {}.\n", first_word(line)));
            }
        }
    }

    async fn on_game_command(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        let (verb, arg) = match command::parse(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                render::print_error(format_args!("{e}\n"));
                return;
            }
        };
        match verb {
            Verb::Help => render::help_in_game(),
            Verb::Show => render::show_boards(
                &self.my_name,
                self.game.my_board(),
                self.game.opponent(),
                self.game.shadow_board(),
            ),
            Verb::Shot => {
                let Some(square) = arg else {
                    render::print_error(
                        "!shot requires a valid game table square as argument.\n",
                    );
                    return;
                };
                match Coord::parse(square) {
                    Ok(coord) => self.fire(coord).await,
                    Err(e) => render::print_error(e),
                }
            }
            Verb::Disconnect => {
                self.send_server(Message::Endgame { disconnected: true }).await;
                println!("Successfully disconnected from the game.\n");
                self.game.abort();
            }
            Verb::Who | Verb::Connect | Verb::Quit => {
                render::print_error(format_args!("Invalid command {}.\n", first_word(line)));
            }
        }
    }

    async fn fire(&mut self, coord: Coord) {
        match self.game.fire(coord) {
            Ok(()) => {
                self.send_peer(Message::Shot { row: coord.row, col: coord.col }).await;
            }
            Err(FireError::AlreadyFired) => {
                render::print_error("You have already fired here.");
            }
            Err(FireError::NotMyTurn) => {}
        }
    }

    // ── control channel ───────────────────────────────────────────────────

    async fn on_server(&mut self, msg: Option<Result<Message, ProtoError>>) {
        self.prompt_pending = true;
        let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(ProtoError::Closed)) | None => {
                self.log.info(ClientEvent::Disconnected);
                println!("\nThe server has closed the connection.");
                self.quit = true;
                return;
            }
            Some(Err(e)) => {
                render::print_error(format_args!("Lost the server: {e}"));
                self.quit = true;
                self.failed = true;
                return;
            }
        };

        self.log.trace(ClientEvent::Received { what: msg.msg_type().name() });

        match msg {
            Message::ReqPlay { opponent } => {
                // Invitations only make sense while idle in the lobby.
                if self.game.in_game() || !matches!(self.mode, Mode::Command) {
                    return;
                }
                self.mode = Mode::ConfirmInvite { inviter: opponent };
            }
            Message::AnsPlay { response, addr, udp_port } => {
                self.on_play_answer(response, addr, udp_port).await;
            }
            Message::AnsWho(players) => render::print_player_list(&players),
            Message::Endgame { disconnected } => {
                let opponent = self.game.opponent().to_string();
                if self.game.endgame() {
                    if disconnected {
                        println!("\n{opponent} has disconnected!\n");
                    } else {
                        println!("\nYou have sunk all {opponent}'s ships! YOU WON!\n");
                    }
                }
            }
            other => {
                render::print_error(format_args!(
                    "Received an invalid message from server ({}).",
                    other.msg_type()
                ));
                self.quit = true;
                self.failed = true;
            }
        }
    }

    async fn on_play_answer(&mut self, response: PlayResponse, addr: IpAddr, udp_port: u16) {
        let invited = self.pending_invite_to.take();
        let answered = self.invite_answer.take();

        match response {
            PlayResponse::Accept => {
                let (opponent, initiator) = match (invited, answered) {
                    (Some(name), _) => {
                        println!("{name} accepted the invite to play!");
                        (name, true)
                    }
                    (None, Some(answer)) if answer.accepted => {
                        println!("You are now playing with {}!", answer.inviter);
                        (answer.inviter, false)
                    }
                    _ => return,
                };
                self.game.start(&opponent, SocketAddr::new(addr, udp_port), initiator);
                self.last_activity = Instant::now();
                println!(
                    "\nPlace your ships one per line:\n({} ships available; format: row letter followed by column number)",
                    self.game.ship_count()
                );
            }
            PlayResponse::Decline => {
                if let Some(name) = invited {
                    println!("{name} declined the invite to play.\n");
                } else if let Some(answer) = answered {
                    if answer.accepted {
                        println!("The opponent has closed the connection.\n");
                    } else {
                        println!("You refused the game!\n");
                    }
                } else if matches!(self.mode, Mode::ConfirmInvite { .. }) {
                    // The inviter withdrew while the question was up.
                    self.mode = Mode::Command;
                    println!("\nThe opponent has closed the connection.\n");
                }
            }
            PlayResponse::Timedout => {
                if let Some(name) = invited {
                    println!("{name} is currently AFK. Request timed out.\n");
                } else if matches!(self.mode, Mode::ConfirmInvite { .. }) {
                    self.mode = Mode::Command;
                    println!("\nRequest timed out.\n");
                } else {
                    println!("Request timed out.\n");
                }
            }
            PlayResponse::InvalidOpponent => {
                if let Some(name) = invited {
                    println!("Player {name} not found.\n");
                }
            }
            PlayResponse::OpponentInGame => {
                if let Some(name) = invited {
                    println!("{name} is currently playing with another player.\n");
                }
            }
        }
    }

    // ── peer channel ──────────────────────────────────────────────────────

    async fn on_datagram(&mut self, datagram: &[u8], src: SocketAddr) {
        if !self.game.in_game() {
            // Stale datagram from a finished match.
            return;
        }
        // Gameplay datagrams must come from the declared peer endpoint.
        if self.game.peer() != Some(src) {
            self.log.warn(ClientEvent::UdpIgnored { src });
            return;
        }

        let msg = match Message::decode(datagram) {
            Ok(msg) => msg,
            Err(_) => {
                render::print_error("Received an invalid message from opponent.");
                self.abort_match().await;
                return;
            }
        };

        self.log.trace(ClientEvent::Received { what: msg.msg_type().name() });
        self.last_activity = Instant::now();
        self.prompt_pending = true;
        let opponent = self.game.opponent().to_string();

        match msg {
            Message::Ready => match self.game.peer_ready() {
                Ok(Phase::MyTurn) => {
                    println!("\n{opponent} is ready!");
                    render::help_in_game();
                    println!("\nIt's your turn!");
                }
                Ok(_) => {
                    println!("\n{opponent} is ready!");
                    render::help_in_game();
                    println!("\nIt's {opponent}'s turn.");
                }
                Err(_) => self.peer_protocol_error().await,
            },
            Message::Shot { row, col } => match self.game.incoming_shot(row, col) {
                Ok(outcome) => {
                    println!(
                        "\n{opponent} fires {}. {}",
                        outcome.coord,
                        if outcome.hit { "Hit. :-(" } else { "Miss! :-)" }
                    );
                    if outcome.lost {
                        self.send_server(Message::Endgame { disconnected: false }).await;
                        println!("Oh no, all your ships have been sunk! YOU LOST!\n");
                    } else {
                        self.send_peer(Message::Result { hit: outcome.hit }).await;
                        println!("It's your turn!");
                    }
                }
                Err(GameError::ShotOutOfRange) => {
                    render::print_error("Received a malformed message.");
                    self.abort_match().await;
                }
                Err(GameError::WrongPhase) => self.peer_protocol_error().await,
            },
            Message::Result { hit } => match self.game.shot_result(hit) {
                Ok(_) => {
                    println!(
                        "\n{opponent} says: {}",
                        if hit { "hit! :-)" } else { "miss. :-(" }
                    );
                    println!("It's {opponent}'s turn.");
                }
                Err(_) => self.peer_protocol_error().await,
            },
            _ => self.peer_protocol_error().await,
        }
    }

    async fn peer_protocol_error(&mut self) {
        render::print_error("Received an invalid message from opponent.");
        self.abort_match().await;
    }

    // ── timers ────────────────────────────────────────────────────────────

    async fn on_tick(&mut self) {
        if self.game.in_game() && self.last_activity.elapsed() >= IN_GAME_TIMEOUT {
            self.send_server(Message::Endgame { disconnected: true }).await;
            println!("\nDisconnected for inactivity.\n");
            self.game.abort();
            self.mode = Mode::Command;
            self.prompt_pending = true;
        }
    }
}

fn first_word(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

// ── LOGIN PHASE ───────────────────────────────────────────────────────────────

/// Prompt for a username until a valid one is typed. `None` on stdin EOF.
async fn ask_username(stdin: &mut Lines<BufReader<Stdin>>) -> Option<String> {
    loop {
        print!("Insert your username: ");
        io::stdout().flush().ok();
        let line = stdin.next_line().await.ok().flatten()?;
        let name = line.trim();
        if valid_username(name) {
            return Some(name.to_string());
        }
        render::print_error(
            "Invalid username. Username must be 3 to 20 characters drawn from letters, digits and underscore.",
        );
    }
}

/// Prompt for a UDP port and bind the game socket on it, in the address
/// family of the server. `None` on stdin EOF.
async fn ask_udp_port(
    stdin: &mut Lines<BufReader<Stdin>>,
    server_addr: SocketAddr,
) -> Option<(u16, UdpSocket)> {
    loop {
        print!("Insert your UDP port (number in range {MIN_UDP_PORT}-65535): ");
        io::stdout().flush().ok();
        let line = stdin.next_line().await.ok().flatten()?;
        let port: u16 = match line.trim().parse() {
            Ok(port) if port >= MIN_UDP_PORT => port,
            _ => {
                render::print_error(format_args!(
                    "Invalid port. Port must be an integer value in the range {MIN_UDP_PORT}-65535."
                ));
                continue;
            }
        };
        let bind_addr: SocketAddr = match server_addr.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        };
        match UdpSocket::bind(bind_addr).await {
            Ok(socket) => return Some((port, socket)),
            Err(_) => render::print_error("Can not open this port."),
        }
    }
}

/// Username and port prompts, then the login exchange; repeated until the
/// server accepts. `None` means the process should exit cleanly (EOF).
async fn login(
    stdin: &mut Lines<BufReader<Stdin>>,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    server_addr: SocketAddr,
) -> Result<Option<(String, UdpSocket)>, ProtoError> {
    loop {
        let Some(username) = ask_username(stdin).await else { return Ok(None) };
        let Some((udp_port, udp)) = ask_udp_port(stdin, server_addr).await else {
            return Ok(None);
        };

        let request = Message::ReqLogin { username: username.clone(), udp_port };
        proto::write_message(writer, &request).await?;

        match proto::read_message(reader).await? {
            Message::AnsLogin(proto::LoginResponse::Ok) => {
                println!("Successfully logged-in as {username}.");
                return Ok(Some((username, udp)));
            }
            Message::AnsLogin(proto::LoginResponse::InvalidName) => {
                render::print_error(
                    "Invalid username. Username must be 3 to 20 characters drawn from letters, digits and underscore.",
                );
            }
            Message::AnsLogin(proto::LoginResponse::NameInUse) => {
                render::print_error(
                    "This username is already in use by another player. Please choose another username.",
                );
            }
            _ => {
                render::print_error("Invalid response from server.");
                return Err(ProtoError::BadRequest);
            }
        }
        // The bound UDP socket is dropped and re-opened on the next try.
    }
}

// ── MAIN ──────────────────────────────────────────────────────────────────────

async fn resolve(address: &str, port: u16) -> Option<SocketAddr> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((address, port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log  = Logger::new(args.verbose);

    log.info(ClientEvent::Connecting { addr: &args.address });

    let Some(server_addr) = resolve(&args.address, args.port).await else {
        eprintln!("Invalid address: {}", args.address);
        std::process::exit(1);
    };

    let stream = match TcpStream::connect(server_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Could not connect to server {server_addr}: {e}");
            std::process::exit(1);
        }
    };
    log.info(ClientEvent::Connected { addr: server_addr });

    let (mut reader, mut writer) = stream.into_split();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let (my_name, udp) = match login(&mut stdin, &mut reader, &mut writer, server_addr).await {
        Ok(Some(outcome)) => outcome,
        Ok(None) => {
            println!("Exiting...");
            return;
        }
        Err(e) => {
            eprintln!("Login failed: {e}");
            std::process::exit(1);
        }
    };

    // From here on the control channel is read by a dedicated task, so
    // the reactor can race it against stdin and the game socket.
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let result = proto::read_message(&mut reader).await;
            let failed = result.is_err();
            if server_tx.send(result).is_err() || failed {
                return;
            }
        }
    });

    let mut client = Client {
        log,
        my_name,
        writer,
        udp,
        game: Game::new(),
        mode: Mode::Command,
        pending_invite_to: None,
        invite_answer: None,
        last_activity: Instant::now(),
        prompt_pending: true,
        quit: false,
        failed: false,
    };

    render::help_idle();
    run(&mut client, &mut stdin, server_rx).await;

    println!("Exiting...");
    if client.failed {
        std::process::exit(1);
    }
}

async fn run(
    client: &mut Client,
    stdin: &mut Lines<BufReader<Stdin>>,
    mut server_rx: UnboundedReceiver<Result<Message, ProtoError>>,
) {
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    let mut buf = [0u8; 2048];

    while !client.quit {
        client.print_prompt();

        let input = tokio::select! {
            line = stdin.next_line() => Input::Line(line.unwrap_or(None)),
            msg = server_rx.recv() => Input::Server(msg),
            received = client.udp.recv_from(&mut buf) => Input::Udp(received),
            _ = tick.tick() => Input::Tick,
            _ = signal::shutdown_signal() => Input::Signal,
        };

        match input {
            Input::Line(line) => client.on_line(line).await,
            Input::Server(msg) => client.on_server(msg).await,
            Input::Udp(Ok((len, src))) => client.on_datagram(&buf[..len], src).await,
            Input::Udp(Err(e)) => {
                client.log.warn(format_args!("game socket error: {e}"));
            }
            Input::Tick => client.on_tick().await,
            Input::Signal => {
                println!();
                client.quit = true;
            }
        }
    }
}
