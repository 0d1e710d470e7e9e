//! Server-side bookkeeping: the set of connected clients with its two
//! lookup views, and the table of pending/live matches.
//!
//! Clients are owned by a map keyed by the stable connection id minted
//! at accept time; a second view maps lowercased usernames to ids, which
//! gives both case-insensitive uniqueness and the deterministic ordering
//! the player list is rendered in. Matches are owned by their own table
//! and clients hold weak id back-references, so neither side owns the
//! other.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::proto::{MAX_USERNAME_LENGTH, Message};

pub const MIN_USERNAME_LENGTH: usize = 3;

/// Usernames are 3 to 20 characters from `[A-Za-z0-9_]`.
pub fn valid_username(name: &str) -> bool {
    (MIN_USERNAME_LENGTH..=MAX_USERNAME_LENGTH).contains(&name.len())
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Stable id of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchId(u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoginError {
    #[error("invalid username")]
    InvalidName,
    #[error("username already in use")]
    NameInUse,
}

#[derive(Debug)]
pub struct ClientRecord {
    pub conn: ConnId,
    /// Peer address of the control connection; the UDP game channel of
    /// this client is reachable at `addr:udp_port`.
    pub addr: IpAddr,
    /// Empty until the client logs in.
    pub username: String,
    pub udp_port: u16,
    pub match_id: Option<MatchId>,
    outbox: UnboundedSender<Message>,
}

impl ClientRecord {
    pub fn logged_in(&self) -> bool {
        !self.username.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct MatchRecord {
    pub id: MatchId,
    /// The inviter.
    pub player1: ConnId,
    /// The invitee.
    pub player2: ConnId,
    pub awaiting_reply: bool,
    pub created_at: Instant,
}

impl MatchRecord {
    pub fn other(&self, conn: ConnId) -> ConnId {
        if conn == self.player1 { self.player2 } else { self.player1 }
    }
}

#[derive(Default)]
pub struct Registry {
    clients: HashMap<ConnId, ClientRecord>,
    /// Lowercased username → connection, iterated in sorted order.
    by_name: BTreeMap<String, ConnId>,
    matches: HashMap<MatchId, MatchRecord>,
    next_match: u64,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn add(&mut self, conn: ConnId, addr: IpAddr, outbox: UnboundedSender<Message>) {
        self.clients.insert(
            conn,
            ClientRecord {
                conn,
                addr,
                username: String::new(),
                udp_port: 0,
                match_id: None,
                outbox,
            },
        );
    }

    /// Log a connection in under `name`. Uniqueness is case-insensitive.
    pub fn login(&mut self, conn: ConnId, name: &str, udp_port: u16) -> Result<(), LoginError> {
        if !valid_username(name) {
            return Err(LoginError::InvalidName);
        }
        let key = name.to_ascii_lowercase();
        if self.by_name.contains_key(&key) {
            return Err(LoginError::NameInUse);
        }
        let record = self
            .clients
            .get_mut(&conn)
            .expect("login on a connection that was never added");
        if record.logged_in() {
            // A second login would orphan the old name-index entry.
            return Err(LoginError::InvalidName);
        }
        record.username = name.to_string();
        record.udp_port = udp_port;
        self.by_name.insert(key, conn);
        Ok(())
    }

    /// Drop a connection from both views. The caller must have
    /// terminated any match first.
    pub fn remove(&mut self, conn: ConnId) -> Option<ClientRecord> {
        let record = self.clients.remove(&conn)?;
        debug_assert!(record.match_id.is_none(), "removing a client still in a match");
        if record.logged_in() {
            self.by_name.remove(&record.username.to_ascii_lowercase());
        }
        Some(record)
    }

    pub fn by_conn(&self, conn: ConnId) -> Option<&ClientRecord> {
        self.clients.get(&conn)
    }

    pub fn by_name(&self, name: &str) -> Option<&ClientRecord> {
        let conn = self.by_name.get(&name.to_ascii_lowercase())?;
        self.clients.get(conn)
    }

    /// Logged-in clients in case-insensitive username order.
    pub fn iter_logged(&self) -> impl Iterator<Item = &ClientRecord> {
        self.by_name.values().filter_map(|conn| self.clients.get(conn))
    }

    pub fn count_logged(&self) -> usize {
        self.by_name.len()
    }

    /// Queue a message on the connection's writer. A full or gone peer
    /// is not an error here; the reader side reports the disconnect.
    pub fn send(&self, conn: ConnId, msg: Message) {
        if let Some(record) = self.clients.get(&conn) {
            let _ = record.outbox.send(msg);
        }
    }

    pub fn add_match(&mut self, inviter: ConnId, invitee: ConnId, now: Instant) -> MatchId {
        let id = MatchId(self.next_match);
        self.next_match += 1;
        self.matches.insert(
            id,
            MatchRecord {
                id,
                player1: inviter,
                player2: invitee,
                awaiting_reply: true,
                created_at: now,
            },
        );
        for conn in [inviter, invitee] {
            if let Some(record) = self.clients.get_mut(&conn) {
                record.match_id = Some(id);
            }
        }
        id
    }

    pub fn match_of(&self, conn: ConnId) -> Option<&MatchRecord> {
        let id = self.clients.get(&conn)?.match_id?;
        self.matches.get(&id)
    }

    /// Flip an awaiting-reply match to live.
    pub fn set_live(&mut self, id: MatchId) {
        if let Some(m) = self.matches.get_mut(&id) {
            m.awaiting_reply = false;
        }
    }

    /// Delete a match, clearing the back-reference in both players.
    pub fn delete_match(&mut self, id: MatchId) -> Option<MatchRecord> {
        let m = self.matches.remove(&id)?;
        for conn in [m.player1, m.player2] {
            if let Some(record) = self.clients.get_mut(&conn) {
                record.match_id = None;
            }
        }
        Some(m)
    }

    /// Remove and return every awaiting-reply match whose request has
    /// aged past `timeout`.
    pub fn take_expired(&mut self, now: Instant, timeout: Duration) -> Vec<MatchRecord> {
        let expired: Vec<MatchId> = self
            .matches
            .values()
            .filter(|m| m.awaiting_reply && now.duration_since(m.created_at) >= timeout)
            .map(|m| m.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.delete_match(id))
            .collect()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn with_client(reg: &mut Registry, id: u64) -> (ConnId, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ConnId(id);
        reg.add(conn, IpAddr::V4(Ipv4Addr::LOCALHOST), tx);
        (conn, rx)
    }

    #[test]
    fn username_validity_boundaries() {
        assert!(valid_username("abc"));
        assert!(valid_username(&"a".repeat(MAX_USERNAME_LENGTH)));
        assert!(valid_username("user_01"));
        assert!(!valid_username("ab"));
        assert!(!valid_username(&"a".repeat(MAX_USERNAME_LENGTH + 1)));
        assert!(!valid_username("has space"));
        assert!(!valid_username("dash-ed"));
        assert!(!valid_username(""));
    }

    #[test]
    fn name_index_tracks_login_state() {
        let mut reg = Registry::new();
        let (conn, _rx) = with_client(&mut reg, 1);

        assert!(!reg.by_conn(conn).unwrap().logged_in());
        assert_eq!(reg.count_logged(), 0);

        reg.login(conn, "alice", 9001).unwrap();
        assert!(reg.by_conn(conn).unwrap().logged_in());
        assert_eq!(reg.count_logged(), 1);
        assert_eq!(reg.by_name("alice").unwrap().conn, conn);

        reg.remove(conn);
        assert_eq!(reg.count_logged(), 0);
        assert!(reg.by_name("alice").is_none());
        assert!(reg.by_conn(conn).is_none());
    }

    #[test]
    fn duplicate_names_rejected_case_insensitively() {
        let mut reg = Registry::new();
        let (a, _rxa) = with_client(&mut reg, 1);
        let (b, _rxb) = with_client(&mut reg, 2);

        reg.login(a, "Bob", 9001).unwrap();
        assert_eq!(reg.login(b, "bob", 9002), Err(LoginError::NameInUse));
        assert_eq!(reg.login(b, "BOB", 9002), Err(LoginError::NameInUse));
        reg.login(b, "bob2", 9002).unwrap();
        assert_eq!(reg.by_name("BOB").unwrap().conn, a);
    }

    #[test]
    fn relogin_is_rejected() {
        let mut reg = Registry::new();
        let (conn, _rx) = with_client(&mut reg, 1);
        reg.login(conn, "alice", 9001).unwrap();
        assert_eq!(reg.login(conn, "alice2", 9001), Err(LoginError::InvalidName));
        assert_eq!(reg.count_logged(), 1);
        assert_eq!(reg.by_name("alice").unwrap().conn, conn);
        assert!(reg.by_name("alice2").is_none());
    }

    #[test]
    fn invalid_names_rejected_at_login() {
        let mut reg = Registry::new();
        let (conn, _rx) = with_client(&mut reg, 1);
        assert_eq!(reg.login(conn, "ab", 9001), Err(LoginError::InvalidName));
        assert_eq!(reg.login(conn, "no way", 9001), Err(LoginError::InvalidName));
        assert!(!reg.by_conn(conn).unwrap().logged_in());
    }

    #[test]
    fn logged_iteration_is_sorted_case_insensitively() {
        let mut reg = Registry::new();
        let (a, _rxa) = with_client(&mut reg, 1);
        let (b, _rxb) = with_client(&mut reg, 2);
        let (c, _rxc) = with_client(&mut reg, 3);
        reg.login(a, "Zoe", 1).unwrap();
        reg.login(b, "adam", 2).unwrap();
        reg.login(c, "Mallory", 3).unwrap();

        let names: Vec<&str> = reg.iter_logged().map(|r| r.username.as_str()).collect();
        assert_eq!(names, ["adam", "Mallory", "Zoe"]);
    }

    #[test]
    fn match_back_references_are_consistent() {
        let mut reg = Registry::new();
        let (a, _rxa) = with_client(&mut reg, 1);
        let (b, _rxb) = with_client(&mut reg, 2);
        reg.login(a, "alice", 1).unwrap();
        reg.login(b, "bob", 2).unwrap();

        let id = reg.add_match(a, b, Instant::now());
        let m = reg.match_of(a).unwrap();
        assert_eq!(m.id, id);
        assert_eq!(m.player1, a);
        assert_eq!(m.player2, b);
        assert!(m.awaiting_reply);
        assert_eq!(reg.match_of(b).unwrap().id, id);
        assert_eq!(m.other(a), b);
        assert_eq!(m.other(b), a);

        reg.set_live(id);
        assert!(!reg.match_of(a).unwrap().awaiting_reply);

        reg.delete_match(id);
        assert!(reg.match_of(a).is_none());
        assert!(reg.match_of(b).is_none());
        // Deleting again is a no-op.
        assert!(reg.delete_match(id).is_none());
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let mut reg = Registry::new();
        let (a, _rxa) = with_client(&mut reg, 1);
        let (b, _rxb) = with_client(&mut reg, 2);
        reg.login(a, "alice", 1).unwrap();
        reg.login(b, "bob", 2).unwrap();

        let t0 = Instant::now();
        let timeout = Duration::from_secs(60);
        reg.add_match(a, b, t0);

        assert!(reg.take_expired(t0 + Duration::from_secs(59), timeout).is_empty());
        let expired = reg.take_expired(t0 + timeout, timeout);
        assert_eq!(expired.len(), 1);
        assert!(reg.match_of(a).is_none());
    }

    #[test]
    fn live_matches_never_expire() {
        let mut reg = Registry::new();
        let (a, _rxa) = with_client(&mut reg, 1);
        let (b, _rxb) = with_client(&mut reg, 2);
        reg.login(a, "alice", 1).unwrap();
        reg.login(b, "bob", 2).unwrap();

        let t0 = Instant::now();
        let id = reg.add_match(a, b, t0);
        reg.set_live(id);
        assert!(reg.take_expired(t0 + Duration::from_secs(3600), Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn send_reaches_the_outbox() {
        let mut reg = Registry::new();
        let (conn, mut rx) = with_client(&mut reg, 1);
        reg.send(conn, Message::ReqWho);
        assert_eq!(rx.try_recv().unwrap(), Message::ReqWho);
        // Sending to an unknown connection is ignored.
        reg.send(ConnId(99), Message::ReqWho);
    }
}
