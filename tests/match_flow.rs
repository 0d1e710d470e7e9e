//! Full match: invitation, acceptance with endpoint exchange, the UDP
//! shot/result dialogue driven through the client state machine, and the
//! end-of-game notification forwarded by the server. A two-ship fleet
//! keeps the exchange short.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

use battlegrid::board::Coord;
use battlegrid::game::{Game, Phase, Placement};
use battlegrid::logger::Logger;
use battlegrid::proto::{self, LoginResponse, Message, PlayResponse, PlayerStatus};
use battlegrid::server::{self, ServerConfig};

const RECV_BUDGET: Duration = Duration::from_secs(5);

/// One test-side player: control connection, game socket, state machine.
struct Player {
    stream: TcpStream,
    udp: UdpSocket,
    game: Game,
}

impl Player {
    async fn join(server: SocketAddr, name: &str) -> Player {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_port = udp.local_addr().unwrap().port();

        let mut stream = TcpStream::connect(server).await.unwrap();
        let login = Message::ReqLogin { username: name.into(), udp_port };
        proto::write_message(&mut stream, &login).await.unwrap();
        let answer = proto::read_message(&mut stream).await.unwrap();
        assert_eq!(answer, Message::AnsLogin(LoginResponse::Ok));

        Player { stream, udp, game: Game::with_ship_count(2) }
    }

    async fn send(&mut self, msg: Message) {
        proto::write_message(&mut self.stream, &msg).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        timeout(RECV_BUDGET, proto::read_message(&mut self.stream))
            .await
            .expect("no answer from server")
            .expect("protocol error")
    }

    /// Expect a `PLAY_ACCEPT` and return the announced peer endpoint.
    async fn recv_accept(&mut self) -> SocketAddr {
        match self.recv().await {
            Message::AnsPlay { response: PlayResponse::Accept, addr, udp_port } => {
                SocketAddr::new(addr, udp_port)
            }
            other => panic!("unexpected answer {other:?}"),
        }
    }

    async fn send_peer(&mut self, msg: Message) {
        let peer = self.game.peer().unwrap();
        self.udp.send_to(&msg.encode(), peer).await.unwrap();
    }

    async fn recv_peer(&mut self) -> Message {
        let mut buf = [0u8; 2048];
        let (len, src) = timeout(RECV_BUDGET, self.udp.recv_from(&mut buf))
            .await
            .expect("no datagram from peer")
            .unwrap();
        assert_eq!(Some(src), self.game.peer(), "datagram from unexpected source");
        Message::decode(&buf[..len]).unwrap()
    }

    /// Place the two-ship fleet at A1 and B2 and announce readiness.
    async fn place_fleet(&mut self) {
        assert_eq!(
            self.game.place_ship(Coord::parse("A1").unwrap()),
            Ok(Placement::Placed { remaining: 1 })
        );
        assert_eq!(
            self.game.place_ship(Coord::parse("B2").unwrap()),
            Ok(Placement::ReadyToPlay)
        );
        self.send_peer(Message::Ready).await;
    }

    /// Fire and return the announced result.
    async fn fire(&mut self, square: &str) -> bool {
        let coord = Coord::parse(square).unwrap();
        self.game.fire(coord).unwrap();
        self.send_peer(Message::Shot { row: coord.row, col: coord.col }).await;
        match self.recv_peer().await {
            Message::Result { hit } => {
                self.game.shot_result(hit).unwrap();
                hit
            }
            other => panic!("unexpected peer message {other:?}"),
        }
    }

    /// Receive a shot, apply it, and answer unless the fleet just sank.
    async fn take_fire(&mut self) -> bool {
        match self.recv_peer().await {
            Message::Shot { row, col } => {
                let outcome = self.game.incoming_shot(row, col).unwrap();
                if outcome.lost {
                    self.send(Message::Endgame { disconnected: false }).await;
                } else {
                    self.send_peer(Message::Result { hit: outcome.hit }).await;
                }
                outcome.lost
            }
            other => panic!("unexpected peer message {other:?}"),
        }
    }
}

async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::run(listener, ServerConfig::default(), Arc::new(Logger::new(0))));
    addr
}

#[tokio::test]
async fn invitee_shoots_first_and_wins() {
    let server = start_server().await;

    let mut alice = Player::join(server, "alice").await;
    let mut bob = Player::join(server, "bob").await;

    // Invitation round trip.
    alice.send(Message::ReqPlay { opponent: "bob".into() }).await;
    assert_eq!(bob.recv().await, Message::ReqPlay { opponent: "alice".into() });
    bob.send(Message::ReqPlayAns { accept: true }).await;

    // Each side learns the other's declared game endpoint.
    let alice_peer = alice.recv_accept().await;
    let bob_peer = bob.recv_accept().await;
    assert_eq!(alice_peer.port(), bob.udp.local_addr().unwrap().port());
    assert_eq!(bob_peer.port(), alice.udp.local_addr().unwrap().port());

    alice.game.start("bob", alice_peer, true);
    bob.game.start("alice", bob_peer, false);

    // Ship placement, then the ready handshake.
    alice.place_fleet().await;
    bob.place_fleet().await;
    match alice.recv_peer().await {
        Message::Ready => assert_eq!(alice.game.peer_ready(), Ok(Phase::OpponentTurn)),
        other => panic!("unexpected peer message {other:?}"),
    }
    match bob.recv_peer().await {
        Message::Ready => assert_eq!(bob.game.peer_ready(), Ok(Phase::MyTurn)),
        other => panic!("unexpected peer message {other:?}"),
    }

    // The invitee opens and hits the first ship.
    let (hit, lost) = tokio::join!(bob.fire("A1"), alice.take_fire());
    assert!(hit);
    assert!(!lost);

    // The inviter answers with a miss.
    let (hit, lost) = tokio::join!(alice.fire("F6"), bob.take_fire());
    assert!(!hit);
    assert!(!lost);

    // The second hit sinks the fleet: the loser reports to the server
    // instead of answering the peer.
    bob.game.fire(Coord::parse("B2").unwrap()).unwrap();
    bob.send_peer(Message::Shot { row: 1, col: 1 }).await;
    let lost = alice.take_fire().await;
    assert!(lost);
    assert_eq!(alice.game.phase(), Phase::Disconnected);

    // The server forwards the end of game to the winner.
    assert_eq!(bob.recv().await, Message::Endgame { disconnected: false });
    assert!(bob.game.endgame());

    // The match is gone: both players are idle in the lobby again.
    alice.send(Message::ReqWho).await;
    match alice.recv().await {
        Message::AnsWho(players) => {
            assert_eq!(players.len(), 1);
            assert_eq!(players[0].username, "bob");
            assert_eq!(players[0].status, PlayerStatus::Idle);
            assert!(players[0].opponent.is_empty());
        }
        other => panic!("unexpected answer {other:?}"),
    }
}
