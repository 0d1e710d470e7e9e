//! Client-side game state machine.
//!
//! The machine is pure: every input — a placed ship, a peer datagram, a
//! server notification, a local command — returns a typed outcome, and
//! the client binary maps outcomes to prints and sends. The phases
//! mirror the life of a match:
//!
//! ```text
//! Disconnected → Setup → Waiting → (MyTurn ⇄ WaitResult ⇄ OpponentTurn) → Disconnected
//! ```
//!
//! The invitee moves first: when both sides have announced readiness,
//! the player that issued the invitation waits for the opening shot.

use std::net::SocketAddr;

use thiserror::Error;

use crate::board::{Board, Cell, Coord, SHIP_COUNT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not in a match; lobby commands are available.
    Disconnected,
    /// Placing ships.
    Setup,
    /// Ships placed, waiting for the opponent's ready announcement.
    Waiting,
    MyTurn,
    /// Shot sent, waiting for the opponent to announce the result.
    WaitResult,
    OpponentTurn,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GameError {
    /// The peer sent a message that is not valid in the current phase;
    /// the match is aborted and the server notified.
    #[error("message not valid in the current game phase")]
    WrongPhase,
    /// The peer shot outside the grid; same treatment.
    #[error("shot coordinates outside the grid")]
    ShotOutOfRange,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FireError {
    #[error("You have already fired here.")]
    AlreadyFired,
    #[error("it is not this player's turn")]
    NotMyTurn,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Placement {
    /// Ship accepted, more to place.
    Placed { remaining: usize },
    /// Last ship accepted; the caller announces readiness to the peer.
    ReadyToPlay,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlaceError {
    #[error("You have already placed a ship here.")]
    Occupied,
    #[error("not in the ship placement phase")]
    WrongPhase,
}

/// What an incoming shot did to the own board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotOutcome {
    pub coord: Coord,
    pub hit: bool,
    /// True when the shot sank the last own ship; the machine is already
    /// back in [`Phase::Disconnected`] and the caller reports the loss.
    pub lost: bool,
}

pub struct Game {
    phase: Phase,
    opponent: String,
    peer: Option<SocketAddr>,
    /// True for the player that issued the invitation.
    initiator: bool,
    my_board: Board,
    shadow: Board,
    ship_count: usize,
    placed: usize,
    fired: Option<Coord>,
}

impl Game {
    pub fn new() -> Game {
        Game::with_ship_count(SHIP_COUNT)
    }

    /// Tests shrink the fleet to keep scenarios short.
    pub fn with_ship_count(ship_count: usize) -> Game {
        Game {
            phase: Phase::Disconnected,
            opponent: String::new(),
            peer: None,
            initiator: false,
            my_board: Board::new(),
            shadow: Board::new(),
            ship_count,
            placed: 0,
            fired: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn in_game(&self) -> bool {
        self.phase != Phase::Disconnected
    }

    pub fn opponent(&self) -> &str {
        &self.opponent
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn my_board(&self) -> &Board {
        &self.my_board
    }

    pub fn shadow_board(&self) -> &Board {
        &self.shadow
    }

    pub fn ship_count(&self) -> usize {
        self.ship_count
    }

    pub fn ships_placed(&self) -> usize {
        self.placed
    }

    /// Begin a match: fresh boards, ship placement next.
    pub fn start(&mut self, opponent: &str, peer: SocketAddr, initiator: bool) {
        self.phase = Phase::Setup;
        self.opponent = opponent.to_string();
        self.peer = Some(peer);
        self.initiator = initiator;
        self.my_board = Board::new();
        self.shadow = Board::new();
        self.placed = 0;
        self.fired = None;
    }

    pub fn place_ship(&mut self, coord: Coord) -> Result<Placement, PlaceError> {
        if self.phase != Phase::Setup {
            return Err(PlaceError::WrongPhase);
        }
        if !self.my_board.place_ship(coord) {
            return Err(PlaceError::Occupied);
        }
        self.placed += 1;
        if self.placed == self.ship_count {
            self.phase = Phase::Waiting;
            Ok(Placement::ReadyToPlay)
        } else {
            Ok(Placement::Placed { remaining: self.ship_count - self.placed })
        }
    }

    /// Peer announced readiness. The invitee opens the match.
    pub fn peer_ready(&mut self) -> Result<Phase, GameError> {
        if self.phase != Phase::Waiting {
            return Err(GameError::WrongPhase);
        }
        self.phase = if self.initiator { Phase::OpponentTurn } else { Phase::MyTurn };
        Ok(self.phase)
    }

    /// Fire at a shadow-board cell. The caller sends the shot datagram
    /// on success.
    pub fn fire(&mut self, coord: Coord) -> Result<(), FireError> {
        if self.phase != Phase::MyTurn {
            return Err(FireError::NotMyTurn);
        }
        if self.shadow.get(coord) != Cell::Water {
            return Err(FireError::AlreadyFired);
        }
        self.fired = Some(coord);
        self.phase = Phase::WaitResult;
        Ok(())
    }

    /// Peer announced the result of the last own shot.
    pub fn shot_result(&mut self, hit: bool) -> Result<Coord, GameError> {
        if self.phase != Phase::WaitResult {
            return Err(GameError::WrongPhase);
        }
        let coord = self.fired.take().ok_or(GameError::WrongPhase)?;
        self.shadow.record_shot_result(coord, hit);
        self.phase = Phase::OpponentTurn;
        Ok(coord)
    }

    /// Peer fired at the own board. On a loss the caller notifies the
    /// server; otherwise it answers the peer with the result.
    pub fn incoming_shot(&mut self, row: u32, col: u32) -> Result<ShotOutcome, GameError> {
        if self.phase != Phase::OpponentTurn {
            return Err(GameError::WrongPhase);
        }
        let coord = Coord::new(row, col).ok_or(GameError::ShotOutOfRange)?;
        let hit = self.my_board.incoming_shot(coord);
        if hit && self.my_board.ships_afloat() == 0 {
            self.phase = Phase::Disconnected;
            Ok(ShotOutcome { coord, hit, lost: true })
        } else {
            self.phase = Phase::MyTurn;
            Ok(ShotOutcome { coord, hit, lost: false })
        }
    }

    /// End-of-game notification from the server. Returns false when there
    /// is no match to end (the notification is then ignored).
    pub fn endgame(&mut self) -> bool {
        if self.phase == Phase::Disconnected {
            return false;
        }
        self.phase = Phase::Disconnected;
        true
    }

    /// Drop the match locally (wrong-state peer message, inactivity,
    /// manual disconnect). The caller notifies the server.
    pub fn abort(&mut self) {
        self.phase = Phase::Disconnected;
    }
}

impl Default for Game {
    fn default() -> Game {
        Game::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{GRID_COLS, GRID_ROWS};

    fn peer() -> SocketAddr {
        "127.0.0.1:9002".parse().unwrap()
    }

    fn coord(row: u32, col: u32) -> Coord {
        Coord::new(row, col).unwrap()
    }

    /// Build a game in the waiting phase with two ships at A1 and B2.
    fn placed_game(initiator: bool) -> Game {
        let mut game = Game::with_ship_count(2);
        game.start("bob", peer(), initiator);
        assert_eq!(
            game.place_ship(coord(0, 0)),
            Ok(Placement::Placed { remaining: 1 })
        );
        assert_eq!(game.place_ship(coord(1, 1)), Ok(Placement::ReadyToPlay));
        assert_eq!(game.phase(), Phase::Waiting);
        game
    }

    #[test]
    fn invitee_moves_first() {
        let mut invitee = placed_game(false);
        assert_eq!(invitee.peer_ready(), Ok(Phase::MyTurn));

        let mut inviter = placed_game(true);
        assert_eq!(inviter.peer_ready(), Ok(Phase::OpponentTurn));
    }

    #[test]
    fn duplicate_ship_placement_is_rejected() {
        let mut game = Game::with_ship_count(2);
        game.start("bob", peer(), false);
        game.place_ship(coord(0, 0)).unwrap();
        assert_eq!(game.place_ship(coord(0, 0)), Err(PlaceError::Occupied));
        // Still one ship to go.
        assert_eq!(game.phase(), Phase::Setup);
        assert_eq!(game.my_board().ship_or_sunk(), 1);
    }

    #[test]
    fn own_fleet_population_is_stable() {
        let mut game = placed_game(true);
        game.peer_ready().unwrap();
        game.incoming_shot(0, 0).unwrap();
        game.fire(coord(3, 3)).unwrap();
        game.shot_result(false).unwrap();
        game.incoming_shot(5, 5).unwrap();
        assert_eq!(game.my_board().ship_or_sunk(), 2);
    }

    #[test]
    fn full_exchange_until_loss() {
        // The invitee fires first and sinks both ships in a row.
        let mut loser = placed_game(true);
        loser.peer_ready().unwrap();

        let first = loser.incoming_shot(0, 0).unwrap();
        assert!(first.hit);
        assert!(!first.lost);
        assert_eq!(loser.phase(), Phase::MyTurn);

        // The loser answers with a miss of their own.
        loser.fire(coord(4, 4)).unwrap();
        assert_eq!(loser.phase(), Phase::WaitResult);
        assert_eq!(loser.shot_result(false), Ok(coord(4, 4)));
        assert_eq!(loser.shadow_board().get(coord(4, 4)), Cell::Miss);

        let last = loser.incoming_shot(1, 1).unwrap();
        assert!(last.hit);
        assert!(last.lost);
        assert_eq!(loser.phase(), Phase::Disconnected);
    }

    #[test]
    fn hit_marks_shadow_as_sunk() {
        let mut game = placed_game(false);
        game.peer_ready().unwrap();
        game.fire(coord(2, 2)).unwrap();
        game.shot_result(true).unwrap();
        assert_eq!(game.shadow_board().get(coord(2, 2)), Cell::Sunk);
        assert_eq!(game.phase(), Phase::OpponentTurn);
    }

    #[test]
    fn refiring_on_a_revealed_cell_is_rejected() {
        let mut game = placed_game(false);
        game.peer_ready().unwrap();
        game.fire(coord(2, 2)).unwrap();
        game.shot_result(false).unwrap();
        game.incoming_shot(0, 0).unwrap();

        assert_eq!(game.fire(coord(2, 2)), Err(FireError::AlreadyFired));
        // The rejection leaves the turn with the player.
        assert_eq!(game.phase(), Phase::MyTurn);
    }

    #[test]
    fn out_of_range_shot_is_an_error() {
        let mut game = placed_game(true);
        game.peer_ready().unwrap();
        assert_eq!(game.incoming_shot(GRID_ROWS, 0), Err(GameError::ShotOutOfRange));
        assert_eq!(game.incoming_shot(0, GRID_COLS), Err(GameError::ShotOutOfRange));
        // The last in-range cells are fine.
        assert!(game.incoming_shot(GRID_ROWS - 1, GRID_COLS - 1).is_ok());
    }

    #[test]
    fn wrong_phase_messages_are_errors() {
        let mut game = placed_game(false);
        // Shot before either side is ready.
        assert_eq!(game.incoming_shot(0, 0), Err(GameError::WrongPhase));
        assert_eq!(game.shot_result(true), Err(GameError::WrongPhase));
        game.peer_ready().unwrap();
        // Ready twice.
        assert_eq!(game.peer_ready(), Err(GameError::WrongPhase));
        // A result without an outstanding shot.
        assert_eq!(game.shot_result(false), Err(GameError::WrongPhase));
    }

    #[test]
    fn firing_out_of_turn_is_rejected() {
        let mut game = placed_game(true);
        game.peer_ready().unwrap();
        assert_eq!(game.fire(coord(0, 0)), Err(FireError::NotMyTurn));
    }

    #[test]
    fn endgame_is_ignored_once_disconnected() {
        let mut game = placed_game(false);
        game.peer_ready().unwrap();
        assert!(game.endgame());
        assert!(!game.endgame());
        assert_eq!(game.phase(), Phase::Disconnected);
    }

    #[test]
    fn endgame_during_setup_ends_the_match() {
        let mut game = Game::with_ship_count(2);
        game.start("bob", peer(), false);
        assert!(game.endgame());
        assert_eq!(game.phase(), Phase::Disconnected);
    }
}
