//! Packet scheduler
//!
//! In command mode every connection's incoming data reaches the terminal as
//! framed packets. The scheduler visits connections round-robin starting
//! after the one it served last, so a busy connection cannot starve the
//! others, and sends at most one packet per pass.

use tracing::{debug, trace};

use crate::connection::Connection;
use crate::flow::FlowControlMode;
use crate::log::Direction;
use crate::modem::Session;
use crate::protocol::{crc8, header, BodyEncoder, ModemError, BODY_HEADROOM, DUMP_STALL_TIMEOUT_MS};
use crate::serial::CTRL_C;
use crate::command::ResultCode;
use crate::transform::ByteSet;

/// Result of filling a delimiter packet
enum Fill {
    /// Full, or ends on a delimiter
    Complete,
    /// Waiting for more data
    Partial,
}

fn ends_on_delimiter(buf: &[u8], own: &ByteSet, global: &ByteSet) -> bool {
    buf.last().is_some_and(|&b| own.contains(b) || global.contains(b))
}

/// Grow the connection's packet byte by byte up to a delimiter or `size`
fn fill_delimited(conn: &mut Connection, global: &ByteSet, size: usize, available: usize) -> Fill {
    let finished = |c: &Connection| {
        c.last_packet.len() >= size || ends_on_delimiter(&c.last_packet, &c.transforms.delimiters, global)
    };
    if finished(conn) {
        conn.last_packet.clear();
    }
    let mut budget = available.min(size);
    while budget > 0 && !finished(conn) {
        match conn.read_byte() {
            Some(b) => conn.last_packet.push(b),
            None => break,
        }
        budget -= 1;
    }
    if finished(conn) {
        Fill::Complete
    } else {
        Fill::Partial
    }
}

impl Session {
    /// Write a packet header in the current encoding
    pub(crate) fn write_header(&mut self, channel: u32, len: usize, crc: u8) {
        let bytes = header(self.settings.binary_type, channel, len, crc, &self.settings.eol);
        self.serial.write_raw(&bytes);
    }

    /// Offer one packet from the next connection with data
    pub fn send_next_packet(&mut self) {
        let size = self.settings.packet_size;
        if self.serial.available_for_write() < size {
            return;
        }
        let mode = self.flow.mode();
        for id in self.table.scan_order(self.cursor) {
            let cts = self.serial.cts();
            if !self.flow.may_transmit(cts) {
                break;
            }
            let Some(conn) = self.table.get_mut(id) else {
                continue;
            };

            let available = conn.available();
            if available > 0 {
                let delimited = !conn.transforms.delimiters.is_empty() || !self.global.delimiters.is_empty();
                if delimited {
                    if let Fill::Partial = fill_delimited(conn, &self.global.delimiters, size, available) {
                        conn.pending_partial = true;
                        trace!("connection {} holds {} bytes for a delimiter", id, conn.last_packet.len());
                        self.cursor = Some(id);
                        match mode {
                            FlowControlMode::Manual => {
                                self.write_header(0, 0, 0);
                                self.flow.close_packet_gate();
                            }
                            FlowControlMode::AutoOff => self.flow.close_packet_gate(),
                            _ => {}
                        }
                        return;
                    }
                } else {
                    conn.last_packet = conn.read_up_to(available.min(size));
                }
                conn.pending_partial = false;
                let data = conn.last_packet.clone();
                self.log.traffic(Direction::SocketIn, &data);
                self.cursor = Some(id);
                self.last_packet_id = id;
                self.resend_last_packet(Some(id));
                self.flow.after_packet();
                return;
            }

            if !conn.is_connected() {
                if conn.was_connected {
                    conn.was_connected = false;
                    let answered = conn.answered;
                    debug!("connection {} lost carrier", id);
                    if !self.settings.suppress_responses {
                        self.no_carrier_notice(id, answered, None);
                        if mode == FlowControlMode::Manual {
                            return;
                        }
                    }
                }
                let accepted = self.table.get(id).is_some_and(|c| c.is_accepted());
                if accepted {
                    self.remove_connection(id);
                    self.cursor = None;
                    break;
                }
            }
        }

        if mode == FlowControlMode::Manual && self.flow.packet_xon() {
            self.flow.close_packet_gate();
            for conn in self.table.connections_mut() {
                if !conn.pending_partial {
                    conn.last_packet.clear();
                }
            }
            self.write_header(0, 0, 0);
        }
    }

    /// Frame and send a connection's retained packet again.
    ///
    /// The stored payload is raw; masks, substitution and PETSCII encoding
    /// run on every send so the checksum always covers the bytes framed.
    pub(crate) fn resend_last_packet(&mut self, id: Option<u32>) {
        let conn = match id {
            Some(id) => self.table.get_mut(id),
            None => None,
        };
        let Some(conn) = conn else {
            self.write_header(0, 0, 0);
            return;
        };
        let id = conn.id;
        if conn.last_packet.is_empty() {
            self.write_header(id, 0, 0);
            return;
        }
        let mut payload = conn.last_packet.clone();
        self.global.masks.mask_out(&mut payload);
        conn.transforms.masks.mask_out(&mut payload);
        let payload = self.global.substitution.apply(&payload);
        let mut payload = conn.transforms.substitution.apply(&payload);
        if conn.flags.petscii {
            payload = conn.petscii.encode_all(&payload);
        }
        let crc = crc8(&payload);
        self.write_header(id, payload.len(), crc);
        self.write_body(&payload);
    }

    /// Packet body; once a header is out the body always follows
    fn write_body(&mut self, payload: &[u8]) {
        let eol = self.settings.eol;
        let mut encoder = BodyEncoder::new(self.settings.binary_type);
        let mut out = Vec::new();
        for &b in payload {
            out.clear();
            encoder.push(b, &eol, &mut out);
            self.serial.write_raw(&out);
            if let Err(e) = self.serial.wait_headroom(BODY_HEADROOM, &mut self.flow, DUMP_STALL_TIMEOUT_MS) {
                debug!("packet body continues after wait: {}", e);
            }
        }
        out.clear();
        encoder.finish(&eol, &mut out);
        self.serial.write_raw(&out);
    }

    /// Send a document through the global transforms, framed as one channel
    /// 0 packet or as plain text.
    ///
    /// Control-C ends the dump early with OK; a terminal that stops taking
    /// bytes for too long ends it with ERROR.
    pub(crate) fn dump_content(&mut self, data: &[u8], framed: bool) -> ResultCode {
        let eol = self.settings.eol;
        if framed {
            let mut preview = self.global.substitution.clone();
            let mut transformed = Vec::with_capacity(data.len());
            for &b in data {
                if !self.global.masks.contains(b) {
                    transformed.extend(preview.apply(&[b]));
                }
            }
            self.write_header(0, transformed.len(), crc8(&transformed));
        }
        let mut encoder = BodyEncoder::new(self.settings.binary_type);
        let mut out = Vec::new();
        let mut result = ResultCode::Ok;
        for &b in data {
            if self.global.masks.contains(b) {
                continue;
            }
            out.clear();
            for c in self.global.substitution.apply(&[b]) {
                if framed {
                    encoder.push(c, &eol, &mut out);
                } else {
                    out.push(c);
                }
            }
            if framed {
                self.serial.write_raw(&out);
            } else {
                self.serial.print(&out);
            }
            match self.serial.wait_headroom(BODY_HEADROOM, &mut self.flow, DUMP_STALL_TIMEOUT_MS) {
                Ok(()) => {}
                Err(ModemError::Aborted) => {
                    debug!("dump aborted with control-{}", (CTRL_C + b'@') as char);
                    break;
                }
                Err(e) => {
                    debug!("dump stalled: {}", e);
                    result = ResultCode::Error;
                    break;
                }
            }
        }
        if framed {
            out.clear();
            encoder.finish(&eol, &mut out);
            self.serial.write_raw(&out);
        }
        self.global.substitution.reset();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnFlags, Origin};
    use crate::modem::Collaborators;
    use crate::ports::memory::*;
    use crate::transform::Program;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    fn session() -> (Session, MemorySerial) {
        let serial = MemorySerial::new();
        let ports = Collaborators {
            network: Box::new(MemoryNetwork::new()),
            platform: Box::new(MemoryPlatform::new()),
            time: Box::new(MemoryTimeService::default()),
            printer: Box::new(MemoryPrinter::new()),
            fetcher: Box::new(MemoryWebFetcher::new()),
            store: Box::new(MemoryConfigStore::new()),
            phonebook: Box::new(MemoryPhoneBook::new()),
        };
        let s = Session::new(Box::new(serial.clone()), Rc::new(ManualClock::new()), ports);
        (s, serial)
    }

    fn add(s: &mut Session, id: u32) -> MemorySocket {
        let socket = MemorySocket::new();
        let conn = Connection::new(id, "peer", 23, Box::new(socket.clone()), ConnFlags::default(), Origin::Dialed);
        s.table.insert(conn);
        socket
    }

    #[test]
    fn test_packet_framing() {
        let (mut s, serial) = session();
        let sock = add(&mut s, 1);
        sock.push(b"hi");
        s.send_next_packet();
        let expected = format!("[ 1 2 {} ]\r\nhi", crc8(b"hi"));
        assert_eq!(serial.take_text(), expected);
        assert_eq!(s.last_packet_id, 1);
    }

    #[test]
    fn test_round_robin() {
        let (mut s, serial) = session();
        let a = add(&mut s, 1);
        let b = add(&mut s, 2);
        a.push(b"aaaa");
        b.push(b"bbbb");
        s.settings.packet_size = 2;
        s.send_next_packet();
        s.send_next_packet();
        s.send_next_packet();
        let text = serial.take_text();
        let order: Vec<&str> = text.split("[ ").skip(1).map(|p| &p[..1]).collect();
        assert_eq!(order, vec!["1", "2", "1"]);
    }

    #[test]
    fn test_delimiter_holds_partial() {
        let (mut s, serial) = session();
        let sock = add(&mut s, 1);
        s.global.delimiters = ByteSet::from_bytes(b"\r");
        sock.push(b"abc");
        s.send_next_packet();
        assert_eq!(serial.take_text(), "");
        sock.push(b"d\rxy");
        s.send_next_packet();
        let expected = format!("[ 1 5 {} ]\r\nabcd\r", crc8(b"abcd\r"));
        assert_eq!(serial.take_text(), expected);
    }

    #[test]
    fn test_resend_applies_transforms() {
        let (mut s, serial) = session();
        let _sock = add(&mut s, 1);
        s.global.masks = ByteSet::from_bytes(b"x");
        s.table.get_mut(1).unwrap().last_packet = b"axb".to_vec();
        s.resend_last_packet(Some(1));
        let expected = format!("[ 1 2 {} ]\r\nab", crc8(b"ab"));
        assert_eq!(serial.take_text(), expected);
    }

    #[test]
    fn test_resend_unknown_is_empty_header() {
        let (mut s, serial) = session();
        s.resend_last_packet(Some(9));
        assert_eq!(serial.take_text(), "[ 0 0 0 ]\r\n");
    }

    #[test]
    fn test_manual_sends_one_packet_per_xon() {
        let (mut s, serial) = session();
        let sock = add(&mut s, 1);
        s.set_flow_mode(FlowControlMode::Manual);
        sock.push(b"abcdef");
        s.settings.packet_size = 3;
        s.send_next_packet();
        assert_eq!(serial.take_text(), "");
        assert!(s.flow.on_xon());
        s.send_next_packet();
        assert!(serial.take_text().ends_with("abc"));
        s.send_next_packet();
        assert_eq!(serial.take_text(), "");
    }

    #[test]
    fn test_manual_empty_lap_sends_empty_header() {
        let (mut s, serial) = session();
        let _sock = add(&mut s, 1);
        s.set_flow_mode(FlowControlMode::Manual);
        s.flow.on_xon();
        s.send_next_packet();
        assert_eq!(serial.take_text(), "[ 0 0 0 ]\r\n");
        assert!(!s.flow.packet_xon());
    }

    #[test]
    fn test_dump_framed_uses_substitution() {
        let (mut s, serial) = session();
        s.global.substitution.set_program(Program::parse(b"41r4200").unwrap());
        let result = s.dump_content(b"AA", true);
        assert_eq!(result, ResultCode::Ok);
        let expected = format!("[ 0 2 {} ]\r\nBB", crc8(b"BB"));
        assert_eq!(serial.take_text(), expected);
    }
}
