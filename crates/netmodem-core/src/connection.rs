//! Connections and listeners
//!
//! The session owns one [`ConnectionTable`]. Connection and listener ids
//! share one number space so `ATH<id>` can name either.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

use crate::ports::{Listener, Socket};
use crate::protocol::PetsciiEncoder;
use crate::transform::TransformSet;

/// Per-connection behaviour selected by dial/listen modifiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnFlags {
    /// `e`: echo stream-mode input back to the terminal
    pub echo: bool,
    /// `x`: software flow control toward the terminal
    pub xon_xoff: bool,
    /// `p`: translate PETSCII
    pub petscii: bool,
    /// `r`: expand CR to CR LF on the way out
    pub crlf: bool,
    /// `t`: telnet negotiation
    pub telnet: bool,
    /// `s`: TLS
    pub secure: bool,
}

impl ConnFlags {
    /// Collect flags from a modifier string such as `",ep"`; unknown
    /// characters are ignored
    pub fn from_modifiers(modifiers: &str) -> Self {
        let mut flags = Self::default();
        for c in modifiers.chars() {
            match c.to_ascii_lowercase() {
                'e' => flags.echo = true,
                'x' => flags.xon_xoff = true,
                'p' => flags.petscii = true,
                'r' => flags.crlf = true,
                't' => flags.telnet = true,
                's' => flags.secure = true,
                _ => {}
            }
        }
        flags
    }

    /// The modifier letters that reproduce these flags
    pub fn to_modifiers(&self) -> String {
        let mut s = String::new();
        for (set, c) in [
            (self.echo, 'e'),
            (self.xon_xoff, 'x'),
            (self.petscii, 'p'),
            (self.crlf, 'r'),
            (self.telnet, 't'),
            (self.secure, 's'),
        ] {
            if set {
                s.push(c);
            }
        }
        s
    }
}

/// How a connection came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Accepted on the listener with this id
    Accepted { listener: u32 },
    /// Opened by `ATD` or `ATC`
    Dialed,
}

/// One network connection
pub struct Connection {
    /// Channel id used in packet headers
    pub id: u32,
    /// Remote host as dialed, or the caller's address
    pub host: String,
    /// Remote port
    pub port: u16,
    socket: Box<dyn Socket>,
    /// Modifiers given when the connection was made
    pub flags: ConnFlags,
    /// Masks, delimiters and substitution for this connection
    pub transforms: TransformSet,
    /// Payload of the last packet sent, or the delimiter packet being built
    pub last_packet: Vec<u8>,
    /// `last_packet` holds a delimiter packet still waiting for its boundary
    pub pending_partial: bool,
    /// Dialed or accepted
    pub origin: Origin,
    /// Incoming call has been answered
    pub answered: bool,
    /// Cleared once the NO CARRIER notice for this connection has gone out
    pub was_connected: bool,
    /// Ring half-cycles left before auto-answer; 0 once answered
    pub half_rings: i32,
    /// Clock time of the next RING
    pub next_ring_ms: u64,
    /// ASCII to PETSCII state for stream output
    pub petscii: PetsciiEncoder,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("flags", &self.flags)
            .field("origin", &self.origin)
            .field("answered", &self.answered)
            .finish()
    }
}

impl Connection {
    pub fn new(id: u32, host: &str, port: u16, socket: Box<dyn Socket>, flags: ConnFlags, origin: Origin) -> Self {
        Self {
            id,
            host: host.to_string(),
            port,
            socket,
            flags,
            transforms: TransformSet::default(),
            last_packet: Vec::new(),
            pending_partial: false,
            origin,
            answered: true,
            was_connected: true,
            half_rings: 0,
            next_ring_ms: 0,
            petscii: PetsciiEncoder::default(),
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self.origin, Origin::Accepted { .. })
    }

    pub fn is_connected(&mut self) -> bool {
        self.socket.is_connected()
    }

    pub fn available(&mut self) -> usize {
        self.socket.available()
    }

    /// Read at most `max` bytes
    pub fn read_up_to(&mut self, max: usize) -> Vec<u8> {
        let mut buf = vec![0u8; max];
        let n = self.socket.read(&mut buf);
        buf.truncate(n);
        buf
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        let mut b = [0u8; 1];
        (self.socket.read(&mut b) == 1).then_some(b[0])
    }

    pub fn write(&mut self, data: &[u8]) -> usize {
        self.socket.write(data)
    }

    pub fn close(&mut self) {
        self.socket.close();
    }

    /// Forget the retained packet
    pub fn clear_last_packet(&mut self) {
        self.last_packet.clear();
        self.pending_partial = false;
    }
}

/// A listening port and the settings its callers inherit
pub struct ListenerEntry {
    /// Listener id, shared with the connection id space
    pub id: u32,
    /// Local port being listened on
    pub port: u16,
    /// Modifiers copied to each accepted caller
    pub flags: ConnFlags,
    /// Transforms copied to each accepted caller
    pub transforms: TransformSet,
    handle: Box<dyn Listener>,
}

impl fmt::Debug for ListenerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("flags", &self.flags)
            .finish()
    }
}

impl ListenerEntry {
    /// Wrap a bound listener
    pub fn new(id: u32, handle: Box<dyn Listener>, flags: ConnFlags) -> Self {
        Self {
            id,
            port: handle.port(),
            flags,
            transforms: TransformSet::default(),
            handle,
        }
    }

    /// Next waiting caller, if any
    pub fn accept(&mut self) -> Option<crate::ports::Accepted> {
        self.handle.accept()
    }
}

/// Every live connection and listener, ordered by id
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: BTreeMap<u32, Connection>,
    listeners: BTreeMap<u32, ListenerEntry>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// One more than the highest live id, or 1 when nothing is alive
    pub fn next_id(&self) -> u32 {
        let conn_max = self.connections.keys().next_back().copied().unwrap_or(0);
        let listen_max = self.listeners.keys().next_back().copied().unwrap_or(0);
        conn_max.max(listen_max) + 1
    }

    pub fn insert(&mut self, conn: Connection) {
        info!("connection {} to {} opened", conn.id, conn.address());
        self.connections.insert(conn.id, conn);
    }

    pub fn insert_listener(&mut self, listener: ListenerEntry) {
        info!("listener {} on port {} opened", listener.id, listener.port);
        self.listeners.insert(listener.id, listener);
    }

    pub fn get(&self, id: u32) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.connections.contains_key(&id)
    }

    /// Close and drop a connection
    pub fn remove(&mut self, id: u32) -> bool {
        match self.connections.remove(&id) {
            Some(mut conn) => {
                conn.close();
                info!("connection {} closed", id);
                true
            }
            None => false,
        }
    }

    pub fn remove_listener(&mut self, id: u32) -> bool {
        let removed = self.listeners.remove(&id).is_some();
        if removed {
            info!("listener {} closed", id);
        }
        removed
    }

    pub fn clear_connections(&mut self) {
        let ids: Vec<u32> = self.connections.keys().copied().collect();
        for id in ids {
            self.remove(id);
        }
    }

    pub fn clear_listeners(&mut self) {
        let ids: Vec<u32> = self.listeners.keys().copied().collect();
        for id in ids {
            self.remove_listener(id);
        }
    }

    pub fn ids(&self) -> Vec<u32> {
        self.connections.keys().copied().collect()
    }

    pub fn listener_ids(&self) -> Vec<u32> {
        self.listeners.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    pub fn listeners(&self) -> impl Iterator<Item = &ListenerEntry> {
        self.listeners.values()
    }

    pub fn listener_mut(&mut self, id: u32) -> Option<&mut ListenerEntry> {
        self.listeners.get_mut(&id)
    }

    pub fn listener_on(&self, port: u16) -> Option<&ListenerEntry> {
        self.listeners.values().find(|l| l.port == port)
    }

    pub fn any_connected(&mut self) -> bool {
        self.connections.values_mut().any(|c| c.is_connected())
    }

    /// A live connection to the same remote endpoint
    pub fn find_remote(&mut self, host: &str, port: u16) -> Option<u32> {
        self.connections
            .values_mut()
            .find_map(|c| (c.host == host && c.port == port && c.is_connected()).then_some(c.id))
    }

    /// Ids in scheduling order: those after `cursor`, then the rest.
    ///
    /// A cursor naming no live connection starts from the head.
    pub fn scan_order(&self, cursor: Option<u32>) -> Vec<u32> {
        match cursor.filter(|id| self.connections.contains_key(id)) {
            Some(cursor) => {
                let mut order: Vec<u32> = self.connections.range(cursor + 1..).map(|(&id, _)| id).collect();
                order.extend(self.connections.range(..=cursor).map(|(&id, _)| id));
                order
            }
            None => self.ids(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::memory::{MemoryListener, MemorySocket};
    use pretty_assertions::assert_eq;

    fn conn(id: u32) -> Connection {
        Connection::new(id, "host", 23, Box::new(MemorySocket::new()), ConnFlags::default(), Origin::Dialed)
    }

    #[test]
    fn test_modifier_flags() {
        let flags = ConnFlags::from_modifiers(",EpX");
        assert!(flags.echo && flags.petscii && flags.xon_xoff);
        assert!(!flags.secure);
        assert_eq!(flags.to_modifiers(), "exp");
    }

    #[test]
    fn test_next_id_spans_listeners() {
        let mut table = ConnectionTable::new();
        assert_eq!(table.next_id(), 1);
        table.insert(conn(1));
        table.insert_listener(ListenerEntry::new(2, Box::new(MemoryListener::new(6400)), ConnFlags::default()));
        assert_eq!(table.next_id(), 3);
        table.remove_listener(2);
        table.remove(1);
        assert_eq!(table.next_id(), 1);
    }

    #[test]
    fn test_scan_order_rotates() {
        let mut table = ConnectionTable::new();
        for id in [1, 2, 4] {
            table.insert(conn(id));
        }
        assert_eq!(table.scan_order(Some(2)), vec![4, 1, 2]);
        assert_eq!(table.scan_order(Some(4)), vec![1, 2, 4]);
        // stale cursor
        assert_eq!(table.scan_order(Some(3)), vec![1, 2, 4]);
        assert_eq!(table.scan_order(None), vec![1, 2, 4]);
    }

    #[test]
    fn test_remove_closes_socket() {
        let socket = MemorySocket::new();
        let mut table = ConnectionTable::new();
        table.insert(Connection::new(
            1,
            "h",
            23,
            Box::new(socket.clone()),
            ConnFlags::default(),
            Origin::Dialed,
        ));
        assert!(table.remove(1));
        assert!(!socket.connected());
        assert!(!table.remove(1));
    }
}
