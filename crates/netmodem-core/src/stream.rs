//! Stream mode
//!
//! The terminal talks straight to one connection. Only the `+++` escape,
//! the connection's modifier translations and the global transforms sit in
//! between.

use tracing::{debug, info, warn};

use crate::escape::{StreamEscape, StreamPoll};
use crate::flow::{FlowControlMode, XOFF, XON};
use crate::command::ResultCode;
use crate::log::Direction;
use crate::modem::{Mode, Session};
use crate::protocol::petscii_to_ascii;

impl Session {
    /// Join the terminal to connection `id`
    pub(crate) fn enter_stream(&mut self, id: u32) {
        info!("streaming connection {}", id);
        self.mode = Mode::Stream(id);
        self.stream_escape = StreamEscape::new(self.clock.now_ms());
        let temp = self.settings.temp_baud;
        if temp > 0 && temp != self.serial.baud() {
            self.saved_baud = Some(self.serial.baud());
            if let Err(e) = self.serial.set_baud(temp) {
                warn!("cannot switch to stream baud {}: {}", temp, e);
                self.saved_baud = None;
            }
        }
    }

    /// Back to command mode; the connection stays open
    pub(crate) fn leave_stream(&mut self) {
        if let Mode::Stream(id) = self.mode {
            debug!("leaving stream on connection {}", id);
        }
        self.mode = Mode::Command;
        if let Some(baud) = self.saved_baud.take() {
            if let Err(e) = self.serial.set_baud(baud) {
                warn!("cannot restore baud {}: {}", baud, e);
            }
        }
        self.line.clear();
    }

    /// One pass of stream mode for connection `id`
    pub(crate) fn stream_step(&mut self, id: u32) {
        if !self.table.contains(id) {
            self.leave_stream();
            return;
        }
        let now = self.clock.now_ms();
        let esc = self.settings.escape_char;

        let mut outbound = Vec::new();
        while let Some(c) = self.serial.read_byte() {
            if self.flow.mode() == FlowControlMode::Normal && (c == XON || c == XOFF) {
                if c == XON {
                    self.flow.on_xon();
                } else {
                    self.flow.on_xoff();
                }
                continue;
            }
            outbound.extend(self.stream_escape.feed(c, esc, now));
        }
        match self.stream_escape.poll(esc, now) {
            StreamPoll::Escape => {
                info!("escape from connection {}", id);
                self.send_outbound(id, outbound);
                self.leave_stream();
                self.respond(ResultCode::Ok);
                return;
            }
            StreamPoll::Flush(held) => outbound.extend(held),
            StreamPoll::Nothing => {}
        }
        self.send_outbound(id, outbound);
        self.receive_inbound(id);

        let Some(conn) = self.table.get_mut(id) else {
            self.leave_stream();
            return;
        };
        if !conn.is_connected() && conn.available() == 0 {
            conn.was_connected = false;
            let accepted = conn.is_accepted();
            info!("connection {} closed by peer", id);
            self.leave_stream();
            self.respond(ResultCode::NoCarrier);
            if accepted {
                self.remove_connection(id);
            }
            return;
        }
        self.accept_new_connections(true);
    }

    /// Terminal bytes to the connection
    fn send_outbound(&mut self, id: u32, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.log.traffic(Direction::SerialIn, &data);
        let Some(conn) = self.table.get_mut(id) else {
            return;
        };
        let flags = conn.flags;
        if flags.echo {
            self.serial.write_raw(&data);
        }
        let mut out = Vec::with_capacity(data.len());
        for &b in &data {
            let b = if flags.petscii { petscii_to_ascii(b) } else { b };
            out.push(b);
            if flags.crlf && b == b'\r' {
                out.push(b'\n');
            }
        }
        if let Some(conn) = self.table.get_mut(id) {
            let written = conn.write(&out);
            if written < out.len() {
                debug!("connection {} took {} of {} bytes", id, written, out.len());
            }
        }
        self.log.traffic(Direction::SocketOut, &out);
    }

    /// Connection bytes to the terminal, as much as the line will take
    fn receive_inbound(&mut self, id: u32) {
        let cts = self.serial.cts();
        if !self.flow.line_clear(cts) {
            return;
        }
        let room = self.serial.available_for_write();
        let Some(conn) = self.table.get_mut(id) else {
            return;
        };
        let available = conn.available();
        if room == 0 || available == 0 {
            return;
        }
        let raw = conn.read_up_to(available.min(room));
        self.log.traffic(Direction::SocketIn, &raw);
        let mut data = raw;
        self.global.masks.mask_out(&mut data);
        conn.transforms.masks.mask_out(&mut data);
        let data = self.global.substitution.apply(&data);
        let mut data = conn.transforms.substitution.apply(&data);
        if conn.flags.petscii {
            data = conn.petscii.encode_all(&data);
        }
        self.serial.write_raw(&data);
        self.log.traffic(Direction::SerialOut, &data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnFlags, Connection, Origin};
    use crate::modem::Collaborators;
    use crate::ports::memory::*;
    use crate::protocol::GUARD_TIME_MS;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    fn streaming(flags: ConnFlags) -> (Session, MemorySerial, MemorySocket, ManualClock) {
        let serial = MemorySerial::new();
        let clock = ManualClock::new();
        let ports = Collaborators {
            network: Box::new(MemoryNetwork::new()),
            platform: Box::new(MemoryPlatform::new()),
            time: Box::new(MemoryTimeService::default()),
            printer: Box::new(MemoryPrinter::new()),
            fetcher: Box::new(MemoryWebFetcher::new()),
            store: Box::new(MemoryConfigStore::new()),
            phonebook: Box::new(MemoryPhoneBook::new()),
        };
        let mut s = Session::new(Box::new(serial.clone()), Rc::new(clock.clone()), ports);
        let socket = MemorySocket::new();
        s.table.insert(Connection::new(1, "bbs", 23, Box::new(socket.clone()), flags, Origin::Dialed));
        s.current = Some(1);
        s.enter_stream(1);
        (s, serial, socket, clock)
    }

    #[test]
    fn test_bytes_flow_both_ways() {
        let (mut s, serial, socket, _) = streaming(ConnFlags::default());
        serial.push_input(b"hello");
        socket.push(b"welcome");
        s.step();
        assert_eq!(socket.take_written(), b"hello".to_vec());
        assert_eq!(serial.take_text(), "welcome");
    }

    #[test]
    fn test_crlf_and_echo_modifiers() {
        let flags = ConnFlags::from_modifiers("er");
        let (mut s, serial, socket, _) = streaming(flags);
        serial.push_input(b"hi\r");
        s.step();
        assert_eq!(socket.take_written(), b"hi\r\n".to_vec());
        assert_eq!(serial.take_text(), "hi\r");
    }

    #[test]
    fn test_escape_returns_to_command_mode() {
        let (mut s, serial, socket, clock) = streaming(ConnFlags::default());
        clock.advance(GUARD_TIME_MS + 1);
        serial.push_input(b"+++");
        s.step();
        assert_eq!(s.mode(), Mode::Stream(1));
        clock.advance(GUARD_TIME_MS + 1);
        s.step();
        assert_eq!(s.mode(), Mode::Command);
        assert_eq!(s.current(), Some(1));
        assert_eq!(serial.take_text(), "\r\nOK\r\n");
        assert!(socket.take_written().is_empty());
        assert!(socket.connected());
    }

    #[test]
    fn test_remote_close_reports_no_carrier() {
        let (mut s, serial, socket, _) = streaming(ConnFlags::default());
        socket.hang_up();
        s.step();
        assert_eq!(s.mode(), Mode::Command);
        assert_eq!(serial.take_text(), "\r\nNO CARRIER\r\n");
    }

    #[test]
    fn test_stream_baud_restored() {
        let (mut s, serial, _socket, clock) = streaming(ConnFlags::default());
        s.leave_stream();
        s.settings.temp_baud = 9600;
        s.enter_stream(1);
        assert_eq!(serial.baud(), 9600);
        clock.advance(GUARD_TIME_MS + 1);
        s.leave_stream();
        assert_eq!(serial.baud(), 1200);
    }
}
