//! Incoming calls
//!
//! Listeners are polled once per loop. A new caller becomes a connection
//! that inherits its listener's flags and transforms and starts ringing;
//! S0 decides how many rings pass before it is answered.

use tracing::{debug, info};

use crate::connection::{Connection, Origin};
use crate::modem::Session;
use crate::ports::Signal;
use crate::protocol::RING_INTERVAL_MS;

impl Session {
    /// Ring half-cycles for a new caller under the current S0
    fn half_rings(&self) -> i32 {
        let rings = self.settings.rings.clamp(0, 255) as i32;
        if rings > 0 {
            (rings - 1) * 2
        } else {
            10
        }
    }

    /// Poll every listener once.
    ///
    /// With `busy` set the session is streaming: callers get the busy
    /// message and are hung up on.
    pub(crate) fn accept_new_connections(&mut self, busy: bool) {
        for lid in self.table.listener_ids() {
            let Some(listener) = self.table.listener_mut(lid) else {
                continue;
            };
            let Some(mut accepted) = listener.accept() else {
                continue;
            };
            let flags = listener.flags;
            let mut transforms = listener.transforms.clone();
            transforms.substitution.reset();

            if busy {
                info!("busy: refusing {}:{}", accepted.host, accepted.port);
                let msg = self.settings.busy_msg.clone();
                if !msg.is_empty() {
                    accepted.socket.write(msg.as_bytes());
                }
                accepted.socket.close();
                continue;
            }
            if self.table.find_remote(&accepted.host, accepted.port).is_some() {
                debug!("already connected to {}:{}", accepted.host, accepted.port);
                accepted.socket.close();
                continue;
            }

            let half_rings = self.half_rings();
            let id = self.table.next_id();
            let mut conn = Connection::new(
                id,
                &accepted.host,
                accepted.port,
                accepted.socket,
                flags,
                Origin::Accepted { listener: lid },
            );
            conn.transforms = transforms;
            conn.half_rings = half_rings;
            conn.answered = half_rings == 0;
            conn.next_ring_ms = self.clock.now_ms() + RING_INTERVAL_MS;
            info!("incoming call {} from {}", id, conn.address());
            self.table.insert(conn);

            self.serial.set_signal(Signal::Ri, true);
            self.ring_line();
            self.last_server_client_id = id;
            if half_rings == 0 {
                if self.settings.auto_stream > 0 {
                    self.connection_notice(self.serial.baud());
                    self.answer_call();
                    break;
                }
                self.connection_notice(id);
            }
        }
    }

    /// Advance ring timers of unanswered callers
    pub(crate) fn service_rings(&mut self) {
        let now = self.clock.now_ms();
        for id in self.table.ids() {
            let Some(conn) = self.table.get_mut(id) else {
                continue;
            };
            if conn.answered || now <= conn.next_ring_ms || !conn.is_connected() {
                continue;
            }
            conn.next_ring_ms = now + RING_INTERVAL_MS;
            conn.half_rings -= 1;
            let left = conn.half_rings;
            if left <= 0 {
                conn.half_rings = 0;
                self.serial.set_signal(Signal::Ri, false);
                if self.settings.rings > 0 {
                    if let Some(conn) = self.table.get_mut(id) {
                        conn.answered = true;
                    }
                    self.ring_line();
                    if self.settings.auto_stream > 0 {
                        self.connection_notice(self.serial.baud());
                        self.answer_call();
                        break;
                    }
                    self.connection_notice(id);
                } else {
                    info!("caller {} gave up", id);
                    self.remove_connection(id);
                }
            } else if left % 2 == 0 {
                self.serial.set_signal(Signal::Ri, true);
                self.ring_line();
            } else {
                self.serial.set_signal(Signal::Ri, false);
            }
        }
        if !self.table.any_connected() {
            self.serial.set_signal(Signal::Ri, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnFlags;
    use crate::modem::{Collaborators, Mode};
    use crate::ports::memory::*;
    use crate::transform::TransformSet;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    struct Rig {
        session: Session,
        serial: MemorySerial,
        network: MemoryNetwork,
        clock: ManualClock,
    }

    fn rig() -> Rig {
        let serial = MemorySerial::new();
        let network = MemoryNetwork::new();
        let clock = ManualClock::new();
        let ports = Collaborators {
            network: Box::new(network.clone()),
            platform: Box::new(MemoryPlatform::new()),
            time: Box::new(MemoryTimeService::default()),
            printer: Box::new(MemoryPrinter::new()),
            fetcher: Box::new(MemoryWebFetcher::new()),
            store: Box::new(MemoryConfigStore::new()),
            phonebook: Box::new(MemoryPhoneBook::new()),
        };
        let mut session = Session::new(Box::new(serial.clone()), Rc::new(clock.clone()), ports);
        session.listen(6400, ConnFlags::default(), TransformSet::default()).unwrap();
        Rig {
            session,
            serial,
            network,
            clock,
        }
    }

    #[test]
    fn test_one_ring_answers_at_once() {
        let mut r = rig();
        r.network.listener(6400).unwrap().ring("10.0.0.9");
        r.session.accept_new_connections(false);
        assert_eq!(r.serial.take_text(), "\r\nRING\r\n\r\nCONNECT 2\r\n");
        assert!(r.session.connection(2).unwrap().answered);
        assert_eq!(r.serial.signal(Signal::Ri), Some(true));
    }

    #[test]
    fn test_rings_then_answers() {
        let mut r = rig();
        r.session.settings.rings = 2;
        r.network.listener(6400).unwrap().ring("10.0.0.9");
        r.session.accept_new_connections(false);
        assert_eq!(r.serial.take_text(), "\r\nRING\r\n");
        r.clock.advance(RING_INTERVAL_MS + 1);
        r.session.service_rings();
        assert_eq!(r.serial.take_text(), "");
        assert_eq!(r.serial.signal(Signal::Ri), Some(false));
        r.clock.advance(RING_INTERVAL_MS + 1);
        r.session.service_rings();
        assert_eq!(r.serial.take_text(), "\r\nRING\r\n\r\nCONNECT 2\r\n");
    }

    #[test]
    fn test_unanswered_caller_dropped() {
        let mut r = rig();
        r.session.settings.rings = 0;
        let caller = r.network.listener(6400).unwrap().ring("10.0.0.9");
        r.session.accept_new_connections(false);
        for _ in 0..10 {
            r.clock.advance(RING_INTERVAL_MS + 1);
            r.session.service_rings();
        }
        assert!(r.session.connection(2).is_none());
        assert!(!caller.connected());
    }

    #[test]
    fn test_auto_stream_answers() {
        let mut r = rig();
        r.session.settings.auto_stream = 1;
        r.network.listener(6400).unwrap().ring("10.0.0.9");
        r.session.accept_new_connections(false);
        assert_eq!(r.session.mode(), Mode::Stream(2));
        assert_eq!(r.session.current(), Some(2));
        assert!(r.serial.take_text().contains("CONNECT 1200"));
    }

    #[test]
    fn test_busy_caller_gets_message() {
        let mut r = rig();
        r.session.settings.busy_msg = "BUSY".to_string();
        let caller = r.network.listener(6400).unwrap().ring("10.0.0.9");
        r.session.accept_new_connections(true);
        assert_eq!(caller.take_written(), b"BUSY".to_vec());
        assert!(!caller.connected());
        assert!(r.session.connection_ids().is_empty());
    }
}
