//! Directive handlers
//!
//! One method per command letter. Every handler returns a [`ResultCode`];
//! errors from collaborators are logged and become `Error` here so nothing
//! escapes the interpreter.

use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use super::parser::{is_numeric, numeric_value};
use super::{Directive, ResultCode};
use crate::config::{ModemSettings, UartFormat, CONFIG_RECORD, LISTENERS_RECORD};
use crate::connection::{ConnFlags, Connection, Origin};
use crate::flow::FlowControlMode;
use crate::log::Direction;
use crate::modem::Session;
use crate::ports::{PhoneEntry, Signal, StaticIps};
use crate::protocol::{
    ascii_to_petscii, crc8, petscii_to_ascii, BinaryType, EolStyle, ModemError, DEFAULT_TELNET_PORT, MAX_COMMAND_SIZE,
};
use crate::serial::PinMode;
use crate::transform::{ByteSet, Program, TransformSet};

/// How long `ATT<n>` waits for each of its bytes
const TRANSMIT_TIMEOUT_MS: u64 = 1000;

/// Longest busy message `&S42` accepts
const MAX_BUSY_MSG: usize = 250;

/// Longest phonebook number
const MAX_PHONE_DIGITS: usize = 9;

/// `&H` argument that drops the cached help text
const HELP_FLUSH: i64 = 6502;

/// `&F` argument that also wipes storage
const FACTORY_FORMAT: i64 = 86;

/// Split `host[:port]`, defaulting to the telnet port
fn split_address(text: &str) -> Option<(String, u16)> {
    let (host, port) = match text.split_once(':') {
        Some((host, port)) => (host.trim(), port.trim().parse().ok()?),
        None => (text.trim(), DEFAULT_TELNET_PORT),
    };
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Modifier strings name the same flags, in any order
fn same_modifiers(a: &str, b: &str) -> bool {
    ConnFlags::from_modifiers(a) == ConnFlags::from_modifiers(b)
}

/// Split `pw[,ip,dns,gw,subnet]`; the addresses only count when all four
/// parse
fn split_statics(rest: &str) -> (String, Option<StaticIps>) {
    let parts: Vec<&str> = rest.split(',').collect();
    if parts.len() >= 5 {
        let tail = &parts[parts.len() - 4..];
        if tail.iter().all(|p| p.trim().parse::<Ipv4Addr>().is_ok()) {
            let statics = StaticIps {
                ip: tail[0].trim().to_string(),
                dns: tail[1].trim().to_string(),
                gateway: tail[2].trim().to_string(),
                subnet: tail[3].trim().to_string(),
            };
            return (parts[..parts.len() - 4].join(","), Some(statics));
        }
    }
    (rest.to_string(), None)
}

impl Session {
    pub(super) fn dispatch(&mut self, d: &Directive) -> ResultCode {
        match d.letter {
            b'z' => self.do_reset(),
            b'n' if d.numeric && d.value == 0 => {
                info!("closing all listeners");
                self.table.clear_listeners();
                ResultCode::Ok
            }
            b'n' | b'a' => self.do_answer(d),
            b'e' => self.numeric_setting(d, |s, v| s.echo = v > 0),
            b'v' => self.numeric_setting(d, |s, v| s.numeric_responses = v == 0),
            b'q' => self.numeric_setting(d, |s, v| s.suppress_responses = v > 0),
            b'x' => self.numeric_setting(d, |s, v| s.long_responses = v > 0),
            b'f' => self.do_flow(d),
            b'r' => self.do_eol(d),
            b'b' => self.do_baud(d),
            b't' => self.do_transmit(d),
            b'h' => self.do_hangup(d),
            b'd' => self.do_dial(d),
            b'o' => self.do_resume(d),
            b'p' => self.do_phonebook(d),
            b'c' => self.do_connect(d),
            b'i' => self.do_info(d),
            b'l' => self.do_last_packet(d),
            b'w' => self.do_wifi(d),
            b'm' | b'y' => d.numeric.into(),
            b's' => self.do_register(d),
            b'+' => self.do_secondary_mode(d),
            b'$' => self.do_variable(d),
            b'&' => self.do_extended(d),
            _ => ResultCode::Error,
        }
    }

    fn numeric_setting(&mut self, d: &Directive, apply: impl FnOnce(&mut ModemSettings, i64)) -> ResultCode {
        if !d.numeric {
            return ResultCode::Error;
        }
        apply(&mut self.settings, d.value);
        ResultCode::Ok
    }

    /// Connected connection named by `current`
    fn current_connected(&mut self) -> Option<u32> {
        let id = self.current?;
        self.table.get_mut(id)?.is_connected().then_some(id)
    }

    /// Give the line's staged transforms to connection `id`
    fn assign_staged(&mut self, id: u32) {
        if let Some(conn) = self.table.get_mut(id) {
            self.staged.assign_into(&mut conn.transforms);
        }
    }

    // Z, A, N

    fn do_reset(&mut self) -> ResultCode {
        info!("reset");
        self.drop_all_connections();
        self.table.clear_listeners();
        self.staged = Default::default();
        self.crc_pending = None;
        self.load_config();
        self.line.clear();
        if self.settings.preserve_listeners {
            self.restore_listeners();
        }
        ResultCode::Ok
    }

    fn do_answer(&mut self, d: &Directive) -> ResultCode {
        if d.value <= 0 {
            return self.answer_call();
        }
        let Ok(port) = u16::try_from(d.value) else {
            return ResultCode::Error;
        };
        if self.table.listener_on(port).is_some() {
            return ResultCode::Ok;
        }
        let flags = ConnFlags::from_modifiers(&d.modifiers);
        let mut transforms = TransformSet::default();
        self.staged.assign_into(&mut transforms);
        match self.listen(port, flags, transforms) {
            Ok(id) => {
                info!("listener {} on port {}", id, port);
                ResultCode::Ok
            }
            Err(e) => {
                warn!("cannot listen: {}", e);
                ResultCode::Error
            }
        }
    }

    /// Pick up the most recent inbound call and stream it
    pub(crate) fn answer_call(&mut self) -> ResultCode {
        let id = self.last_server_client_id;
        let ringing = id != 0 && self.table.get_mut(id).is_some_and(|c| c.is_connected());
        if !ringing {
            return ResultCode::Ok;
        }
        self.current = Some(id);
        self.last_server_client_id = 0;
        let mut was_answered = true;
        if let Some(conn) = self.table.get_mut(id) {
            was_answered = conn.answered;
            conn.answered = true;
            conn.half_rings = 0;
        }
        self.serial.set_signal(Signal::Ri, false);
        self.enter_stream(id);
        if !was_answered {
            self.connection_notice(id);
            return ResultCode::Ignore;
        }
        ResultCode::Ok
    }

    // F, R, B

    fn do_flow(&mut self, d: &Directive) -> ResultCode {
        match FlowControlMode::from_code(d.value).filter(|_| d.numeric) {
            Some(mode) => {
                self.set_flow_mode(mode);
                ResultCode::Ok
            }
            None => ResultCode::Error,
        }
    }

    fn do_eol(&mut self, d: &Directive) -> ResultCode {
        match EolStyle::from_code(d.value).filter(|_| d.numeric) {
            Some(style) => {
                self.settings.eol.style = style;
                ResultCode::Ok
            }
            None => ResultCode::Error,
        }
    }

    fn do_baud(&mut self, d: &Directive) -> ResultCode {
        if d.numeric && d.value > 0 {
            return match u32::try_from(d.value) {
                Ok(baud) => self.change_baud(baud, None),
                Err(_) => ResultCode::Error,
            };
        }
        self.baud_with_format(&d.arg_str())
    }

    /// `baud,DPS` such as `9600,8N1`
    fn baud_with_format(&mut self, text: &str) -> ResultCode {
        let Some((baud, format)) = text.split_once(',') else {
            return ResultCode::Error;
        };
        let Ok(baud) = baud.trim().parse::<u32>() else {
            return ResultCode::Error;
        };
        if !(128..=115_200).contains(&baud) {
            return ResultCode::Error;
        }
        match format.parse::<UartFormat>() {
            Ok(format) => self.change_baud(baud, Some(format)),
            Err(()) => ResultCode::Error,
        }
    }

    fn change_baud(&mut self, baud: u32, format: Option<UartFormat>) -> ResultCode {
        self.serial.flush();
        if let Err(e) = self.serial.set_baud(baud) {
            warn!("cannot set baud {}: {}", baud, e);
            return ResultCode::Error;
        }
        self.settings.baud = baud;
        if let Some(format) = format {
            let (data, parity, stop) = format.to_serial();
            if let Err(e) = self.serial.set_format(data, parity, stop) {
                warn!("cannot set format {}: {}", format, e);
                return ResultCode::Error;
            }
            self.settings.uart = format;
        }
        debug!("serial now {} {}", self.settings.baud, self.settings.uart);
        ResultCode::Ok
    }

    // T

    /// Read `count` raw bytes typed after the command line
    fn read_serial_bytes(&mut self, count: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(count.min(MAX_COMMAND_SIZE));
        let mut last = self.clock.now_ms();
        while out.len() < count {
            if let Some(b) = self.serial.read_byte() {
                out.push(b);
                last = self.clock.now_ms();
                continue;
            }
            if self.clock.now_ms().saturating_sub(last) >= TRANSMIT_TIMEOUT_MS {
                break;
            }
            self.clock.sleep_ms(1);
        }
        out
    }

    fn do_transmit(&mut self, d: &Directive) -> ResultCode {
        let expected = self.crc_pending.take();
        if d.arg.is_empty() {
            return ResultCode::Error;
        }
        match self.transmit(d, expected) {
            Ok(result) => result,
            Err(e) => {
                debug!("transmit failed: {}", e);
                ResultCode::Error
            }
        }
    }

    fn transmit(&mut self, d: &Directive, expected: Option<u8>) -> Result<ResultCode, ModemError> {
        let id = self.current_connected().ok_or(ModemError::NotConnected)?;
        let raw_count = if d.numeric && d.value > 0 { usize::try_from(d.value).ok() } else { None };
        let mut data = match raw_count {
            Some(count) => {
                let bytes = self.read_serial_bytes(count);
                self.log.traffic(Direction::SerialIn, &bytes);
                if bytes.len() != count {
                    debug!("transmit wanted {} bytes, got {}", count, bytes.len());
                    return Err(ModemError::Timeout);
                }
                bytes
            }
            None => d.arg.clone(),
        };
        let crc = crc8(&data);
        if let Some(expected) = expected.filter(|e| *e != crc) {
            return Err(ModemError::CrcMismatch { expected, actual: crc });
        }
        let conn = self.table.get_mut(id).ok_or(ModemError::NotConnected)?;
        if conn.flags.petscii || d.has_modifier('p') {
            for b in data.iter_mut() {
                *b = petscii_to_ascii(*b);
            }
        }
        if raw_count.is_none() {
            data.extend_from_slice(b"\r\n");
        }
        conn.write(&data);
        self.log.traffic(Direction::SocketOut, &data);
        if d.has_modifier('+') {
            self.println(&crc.to_string());
            return Ok(ResultCode::IgnoreSpecial);
        }
        Ok(ResultCode::Ok)
    }

    // H, D, O, C

    fn do_hangup(&mut self, d: &Directive) -> ResultCode {
        if d.arg.is_empty() {
            self.drop_all_connections();
            return ResultCode::Ok;
        }
        if d.numeric && d.value == 0 {
            return match self.current {
                Some(id) => self.remove_connection(id).into(),
                None => ResultCode::Error,
            };
        }
        let Ok(id) = u32::try_from(d.value) else {
            return ResultCode::Error;
        };
        if id == 0 {
            return ResultCode::Error;
        }
        if self.remove_connection(id) || self.table.remove_listener(id) {
            info!("hung up {}", id);
            return ResultCode::Ok;
        }
        ResultCode::Error
    }

    /// Dial `host[:port]` and make it current; the line's staged transforms
    /// go to the new connection
    fn open_connection(&mut self, address: &str, modifiers: &str) -> Option<u32> {
        let (host, port) = split_address(address)?;
        let flags = ConnFlags::from_modifiers(modifiers);
        let socket = match self.ports.network.connect(&host, port, flags) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("dial {}:{} failed: {}", host, port, e);
                return None;
            }
        };
        let id = self.table.next_id();
        let mut conn = Connection::new(id, &host, port, socket, flags, Origin::Dialed);
        self.staged.assign_into(&mut conn.transforms);
        info!("connection {} to {}", id, conn.address());
        self.table.insert(conn);
        self.current = Some(id);
        Some(id)
    }

    fn do_dial(&mut self, d: &Directive) -> ResultCode {
        if d.arg.is_empty() {
            return match self.current_connected() {
                Some(id) => {
                    self.enter_stream(id);
                    ResultCode::Ok
                }
                None => ResultCode::Error,
            };
        }
        if d.numeric && d.value >= 0 {
            return self.dial_number(d.value);
        }
        self.dial_address(&d.arg_str(), &d.modifiers)
    }

    /// Phonebook entry, else an existing connection id
    fn dial_number(&mut self, number: i64) -> ResultCode {
        let entry = u64::try_from(number).ok().and_then(|n| self.ports.phonebook.find(n));
        if let Some(entry) = entry {
            debug!("phonebook {} -> {}", entry.number, entry.address);
            return self.dial_address(&entry.address, &entry.modifiers);
        }
        let Ok(id) = u32::try_from(number) else {
            return ResultCode::Error;
        };
        if self.table.get_mut(id).is_some_and(|c| c.is_connected()) {
            self.current = Some(id);
            self.assign_staged(id);
            self.enter_stream(id);
            return ResultCode::Connect;
        }
        ResultCode::Error
    }

    fn dial_address(&mut self, address: &str, modifiers: &str) -> ResultCode {
        match self.open_connection(address, modifiers) {
            Some(id) => {
                self.enter_stream(id);
                ResultCode::Connect
            }
            None => ResultCode::NoAnswer,
        }
    }

    fn do_resume(&mut self, d: &Directive) -> ResultCode {
        if d.arg.is_empty() || (d.numeric && d.value == 0) {
            return match self.current_connected() {
                Some(id) => {
                    self.enter_stream(id);
                    ResultCode::Ok
                }
                None => ResultCode::Error,
            };
        }
        if d.numeric {
            return self.dial_number(d.value);
        }
        ResultCode::Error
    }

    /// `CONNECTED` / `NO CARRIER` line for a connection, marking live ones
    /// answered
    fn status_line(&mut self, id: u32) -> Option<String> {
        let conn = self.table.get_mut(id)?;
        if conn.is_connected() {
            conn.answered = true;
            Some(format!("CONNECTED {} {}", id, conn.address()))
        } else if conn.answered {
            Some(format!("NO CARRIER {} {}", id, conn.address()))
        } else {
            None
        }
    }

    fn do_connect(&mut self, d: &Directive) -> ResultCode {
        if d.arg.is_empty() {
            if !d.modifiers.is_empty() {
                return ResultCode::Error;
            }
            let Some(id) = self.current.filter(|id| self.table.contains(*id)) else {
                return ResultCode::Error;
            };
            if let Some(line) = self.status_line(id) {
                self.println(&line);
            }
            return ResultCode::Ignore;
        }
        if d.numeric && d.value >= 0 {
            if d.value == 1 && self.table.is_empty() && !self.ports.platform.wifi_connected() {
                if self.settings.ssid.is_empty() {
                    return ResultCode::Error;
                }
                return self.connect_saved_wifi().into();
            }
            if !d.modifiers.is_empty() {
                return ResultCode::Error;
            }
            if d.value == 0 {
                self.list_connections();
                return ResultCode::Ok;
            }
            return match u32::try_from(d.value) {
                Ok(id) if self.table.contains(id) => {
                    self.current = Some(id);
                    self.assign_staged(id);
                    ResultCode::Ok
                }
                _ => ResultCode::Error,
            };
        }
        match self.open_connection(&d.arg_str(), &d.modifiers) {
            Some(_) => ResultCode::Connect,
            None => ResultCode::NoAnswer,
        }
    }

    fn list_connections(&mut self) {
        let mut lines: Vec<String> = Vec::new();
        for id in self.table.ids() {
            if let Some(line) = self.status_line(id) {
                lines.push(line);
            }
        }
        lines.extend(self.table.listeners().map(|l| format!("LISTENING {} *:{}", l.id, l.port)));
        for line in lines {
            self.println(&line);
        }
    }

    // P

    fn do_phonebook(&mut self, d: &Directive) -> ResultCode {
        if d.arg.is_empty() || d.numeric || d.arg == b"?" {
            for entry in self.ports.phonebook.entries() {
                if d.numeric && d.value != 0 && u64::try_from(d.value) != Ok(entry.number) {
                    continue;
                }
                if !d.modifiers.is_empty() && !same_modifiers(&d.modifiers, &entry.modifiers) {
                    continue;
                }
                let mut line = format!("{:<10} {:<4} {}", entry.number, entry.modifiers, entry.address);
                if !d.numeric {
                    line.push_str(&format!(" ({})", entry.notes));
                }
                self.println(&line);
            }
            return ResultCode::Ok;
        }

        let text = d.arg_str();
        let Some((number, rest)) = text.split_once('=') else {
            return ResultCode::Error;
        };
        if number.is_empty() || number.len() > MAX_PHONE_DIGITS || !number.bytes().all(|b| b.is_ascii_digit()) {
            return ResultCode::Error;
        }
        let Ok(number) = number.parse::<u64>() else {
            return ResultCode::Error;
        };
        if rest.eq_ignore_ascii_case("delete") {
            return self.ports.phonebook.remove(number).into();
        }
        let (address, notes) = rest.split_once(',').unwrap_or((rest, ""));
        match address.split_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => return ResultCode::Error,
        }
        self.ports.phonebook.put(PhoneEntry {
            number,
            address: address.to_string(),
            modifiers: d.modifiers.replace(',', ""),
            notes: notes.to_string(),
        });
        ResultCode::Ok
    }

    // I

    /// The `ATI1`/`ATI5` settings line
    fn settings_summary(&self, all: bool) -> String {
        let s = &self.settings;
        let mut out = format!("ATB{}", s.baud);
        out.push_str(if s.echo { "E1" } else { "E0" });
        if !s.suppress_responses || all {
            out.push_str(if s.suppress_responses { "Q1" } else { "Q0" });
            out.push_str(if s.numeric_responses { "V0" } else { "V1" });
            out.push_str(if s.long_responses { "X1" } else { "X0" });
        } else {
            out.push_str("Q1");
        }
        out.push_str(&format!("F{}R{}", self.flow.mode().code(), s.eol.style.code()));
        if !self.global.delimiters.is_empty() {
            out.push_str(&Self::byte_set_text("&D", &self.global.delimiters));
        } else if all {
            out.push_str("&D");
        }
        if !self.global.masks.is_empty() {
            out.push_str(&Self::byte_set_text("&M", &self.global.masks));
        } else if all {
            out.push_str("&M");
        }
        out.push_str(&format!("S0={}", s.rings));
        if s.escape_char != b'+' || all {
            out.push_str(&format!("S2={}", s.escape_char));
        }
        if s.eol.cr != b'\r' || all {
            out.push_str(&format!("S3={}", s.eol.cr));
        }
        if s.eol.lf != b'\n' || all {
            out.push_str(&format!("S4={}", s.eol.lf));
        }
        if s.backspace != 8 || all {
            out.push_str(&format!("S5={}", s.backspace));
        }
        out.push_str(&format!("S40={}", s.packet_size));
        if s.auto_stream > 0 || all {
            out.push_str(if s.auto_stream > 0 { "S41=1" } else { "S41=0" });
        }
        for l in self.table.listeners() {
            out.push_str(&format!("A{}", l.port));
        }
        if s.temp_baud > 0 || all {
            out.push_str(&format!("S43={}", s.temp_baud));
        }
        if s.serial_delay_ms > 0 || all {
            out.push_str(&format!("S44={}", s.serial_delay_ms));
        }
        if s.binary_type != BinaryType::Normal || all {
            out.push_str(&format!("S45={}", s.binary_type.code()));
        }
        if s.preserve_listeners || all {
            out.push_str(if s.preserve_listeners { "S60=1" } else { "S60=0" });
        }
        if s.petscii || all {
            out.push_str(if s.petscii { "&P1" } else { "&P0" });
        }
        if self.log.is_open() || all {
            out.push_str(match (self.log.is_open(), self.log.is_debug()) {
                (true, false) => "&O1",
                (true, true) => "&O88",
                _ => "&O0",
            });
        }
        out
    }

    fn do_info(&mut self, d: &Directive) -> ResultCode {
        let lines: Vec<String> = match d.value {
            0 => {
                self.show_banner();
                return ResultCode::Ok;
            }
            1 | 5 => vec![self.settings_summary(d.value == 5)],
            2 => vec![self.ports.platform.local_ip()],
            3 => vec![self.settings.ssid.clone()],
            4 => vec![crate::VERSION.to_string()],
            6 => vec![self.ports.platform.mac_address()],
            7 => vec![self.ports.time.current_time()],
            8 => vec![crate::BUILD.to_string()],
            9 => {
                let mut lines = vec![self.settings.ssid.clone()];
                if let Some(ips) = &self.settings.static_ips {
                    lines.extend([ips.ip.clone(), ips.dns.clone(), ips.gateway.clone(), ips.subnet.clone()]);
                }
                lines
            }
            10 => vec![self.ports.printer.last_spec()],
            11 => vec![self.ports.platform.free_memory().to_string()],
            _ => return ResultCode::Error,
        };
        for line in lines {
            self.println(&line);
        }
        ResultCode::Ok
    }

    // L

    fn do_last_packet(&mut self, d: &Directive) -> ResultCode {
        if !d.numeric {
            return ResultCode::Error;
        }
        let target = if d.value == 0 { i64::from(self.last_packet_id) } else { d.value };
        let id = if target <= 0 { self.current } else { u32::try_from(target).ok() };
        match id.filter(|id| self.table.contains(*id)) {
            Some(id) => {
                self.resend_last_packet(Some(id));
                ResultCode::Ignore
            }
            None => ResultCode::Error,
        }
    }

    // W

    fn do_wifi(&mut self, d: &Directive) -> ResultCode {
        if d.arg.is_empty() || d.value > 0 {
            let translate = d.has_modifier('p') && !self.settings.petscii;
            let mut found = self.ports.platform.scan();
            if d.value > 0 {
                found.truncate(usize::try_from(d.value).unwrap_or(usize::MAX));
            }
            let eol = self.settings.eol.bytes();
            for ap in found {
                let mut line: Vec<u8> = if translate {
                    ap.ssid.bytes().map(ascii_to_petscii).collect()
                } else {
                    ap.ssid.into_bytes()
                };
                let suffix = format!(" ({}){}", ap.rssi, if ap.open { " " } else { "*" });
                line.extend_from_slice(suffix.as_bytes());
                self.serial.print(&line);
                self.serial.print(&eol);
            }
            return ResultCode::Ok;
        }

        let text = d.arg_str();
        let (ssid, rest) = text.split_once(',').unwrap_or((text.as_str(), ""));
        let (password, statics) = split_statics(rest);
        if !self.ports.platform.connect_wifi(ssid, &password, statics.as_ref()) {
            warn!("cannot join {}", ssid);
            return ResultCode::Error;
        }
        info!("joined {}", ssid);
        self.settings.ssid = ssid.to_string();
        self.settings.password = password;
        self.settings.static_ips = statics;
        ResultCode::Ok
    }

    // S

    fn do_register(&mut self, d: &Directive) -> ResultCode {
        let text = d.arg_str();
        if text.len() < 3 {
            return ResultCode::Error;
        }
        let Some((key, value)) = text.split_once('=') else {
            return ResultCode::Error;
        };
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) || value.is_empty() || !is_numeric(value.as_bytes())
        {
            return ResultCode::Error;
        }
        let Ok(register) = key.parse::<u32>() else {
            return ResultCode::Error;
        };
        let v = numeric_value(value.as_bytes());
        debug!("S{}={}", register, v);
        match self.set_register(register, v) {
            Some(()) => ResultCode::Ok,
            None => ResultCode::Error,
        }
    }

    /// Store one S-register; `None` rejects the value
    fn set_register(&mut self, register: u32, v: i64) -> Option<()> {
        let byte_in = |hi: i64| (0..=hi).contains(&v).then_some(v as u8);
        let s = &mut self.settings;
        match register {
            0 => s.rings = i64::from(byte_in(255)?),
            2 => s.escape_char = byte_in(255)?,
            3 => s.eol.cr = byte_in(127)?,
            4 => s.eol.lf = byte_in(127)?,
            5 => s.backspace = byte_in(32)?,
            40 => s.packet_size = usize::try_from(v).ok().filter(|n| *n >= 1)?,
            41 => s.auto_stream = i64::from(v > 0),
            42 => self.crc_pending = Some(byte_in(255)?),
            43 => s.temp_baud = u32::try_from(v).unwrap_or(0),
            44 => {
                s.serial_delay_ms = u64::try_from(v).unwrap_or(0);
                self.serial.delay_ms = s.serial_delay_ms;
            }
            45 => s.binary_type = BinaryType::from_code(v)?,
            46 | 48 | 50 | 52 | 54 | 56 => {
                let mode = PinMode::from_code(v)?;
                let pins = &mut s.pins;
                match register {
                    46 => pins.dcd = mode,
                    48 => pins.cts = mode,
                    50 => pins.rts = mode,
                    52 => pins.ri = mode,
                    54 => pins.dtr = mode,
                    _ => pins.dsr = mode,
                }
                self.serial.pins = s.pins.clone();
            }
            47 | 49 | 51 | 53 | 55 | 57 => {
                s.pins.pins[((register - 47) / 2) as usize] = v;
                self.serial.pins = s.pins.clone();
            }
            60 => {
                if v < 0 {
                    return None;
                }
                s.preserve_listeners = v != 0;
                if v != 0 {
                    if let Err(e) = self.save_listeners() {
                        warn!("cannot save listeners: {}", e);
                        return None;
                    }
                } else {
                    self.ports.store.remove(LISTENERS_RECORD);
                }
            }
            61 => {
                let secs = u64::try_from(v).ok().filter(|n| *n > 0)?;
                s.print_timeout_ms = secs * 1000;
                self.ports.printer.set_timeout_ms(secs * 1000);
            }
            _ => {}
        }
        Some(())
    }

    // +, $

    fn do_secondary_mode(&mut self, d: &Directive) -> ResultCode {
        let lower = d.arg_str().to_ascii_lowercase();
        if lower.starts_with("print") {
            let spec = &d.arg[5..];
            return self.ports.printer.print(spec, self.settings.petscii).into();
        }
        debug!("secondary mode {} unavailable", lower);
        ResultCode::Error
    }

    fn do_variable(&mut self, d: &Directive) -> ResultCode {
        let text = d.arg_str();
        let Some((var, value)) = text.split_once('=') else {
            return ResultCode::Error;
        };
        let var = var.trim().to_ascii_lowercase();
        let value = value.trim();
        if var.is_empty() || (value.is_empty() && var != "pass") {
            return ResultCode::Error;
        }
        match var.as_str() {
            "ssid" => self.settings.ssid = value.to_string(),
            "pass" => self.settings.password = value.to_string(),
            "mdns" => {
                self.settings.hostname = value.to_string();
                self.ports.platform.set_hostname(value);
            }
            "sb" => {
                return match value.parse::<u32>() {
                    Ok(baud) if baud > 0 => self.change_baud(baud, None),
                    _ => self.baud_with_format(value),
                };
            }
            _ => return ResultCode::Error,
        }
        ResultCode::Ok
    }

    // &

    fn do_extended(&mut self, d: &Directive) -> ResultCode {
        let Some(sub) = d.sub else {
            return ResultCode::Error;
        };
        match sub {
            b'k' => match FlowControlMode::from_preset(d.value).filter(|_| d.numeric) {
                Some(mode) => {
                    self.set_flow_mode(mode);
                    ResultCode::Ok
                }
                None => ResultCode::Error,
            },
            b'l' => {
                self.load_config();
                self.connect_saved_wifi();
                ResultCode::Ok
            }
            b'w' => match self.save_config() {
                Ok(()) => ResultCode::Ok,
                Err(e) => {
                    warn!("cannot save configuration: {}", e);
                    ResultCode::Error
                }
            },
            b'f' => self.do_factory_reset(d),
            b'm' => match self.stage_byte_set(d, self.staged.masks.clone()) {
                Some(set) => {
                    self.staged.masks = Some(set);
                    ResultCode::Ok
                }
                None => ResultCode::Error,
            },
            b'd' => match self.stage_byte_set(d, self.staged.delimiters.clone()) {
                Some(set) => {
                    self.staged.delimiters = Some(set);
                    ResultCode::Ok
                }
                None => ResultCode::Error,
            },
            b'y' => self.do_substitution(d),
            b'o' => self.do_traffic_log(d),
            b'h' => self.do_help(d),
            b'g' => self.do_web_get(d),
            b's' => self.do_string_register(d),
            b'p' => {
                self.settings.petscii = d.value > 0;
                self.serial.petscii = self.settings.petscii;
                ResultCode::Ok
            }
            b't' => self.do_clock(d),
            b'u' => {
                self.println(&format!("Local firmware version {}.", crate::VERSION));
                ResultCode::Ok
            }
            _ => ResultCode::Error,
        }
    }

    fn do_factory_reset(&mut self, d: &Directive) -> ResultCode {
        if d.value == FACTORY_FORMAT {
            self.load_config();
            self.ports.time.reset();
            let formatted = self.ports.store.format();
            let saved = self.save_config().is_ok();
            return (formatted && saved).into();
        }
        info!("factory reset");
        self.ports.store.remove(CONFIG_RECORD);
        self.ports.store.remove(LISTENERS_RECORD);
        self.ports.phonebook.clear();
        if self.ports.platform.wifi_connected() {
            self.ports.platform.disconnect_wifi();
        }
        self.ports.time.reset();
        let result = self.do_reset();
        self.show_banner();
        result
    }

    /// `&M`/`&D`: a number appends one byte to what this line staged so
    /// far, anything else replaces the set
    fn stage_byte_set(&self, d: &Directive, staged: Option<ByteSet>) -> Option<ByteSet> {
        if d.numeric && d.value > 0 {
            let mut set = staged.unwrap_or_default();
            set.insert(u8::try_from(d.value).ok()?);
            return Some(set);
        }
        Some(ByteSet::from_bytes(&d.arg))
    }

    fn do_substitution(&mut self, d: &Directive) -> ResultCode {
        if d.numeric && (d.value > 0 || d.arg.first() == Some(&b'0')) {
            let n = usize::try_from(d.value).unwrap_or(0);
            self.global.substitution.reset();
            self.global.substitution.advance(n);
            if let Some(conn) = self.current.and_then(|id| self.table.get_mut(id)) {
                conn.transforms.substitution.reset();
                conn.transforms.substitution.advance(n);
            }
            return ResultCode::Ok;
        }
        match Program::parse(&d.arg) {
            Ok(program) => {
                self.staged.program = Some(program);
                ResultCode::Ok
            }
            Err(e) => {
                debug!("substitution program rejected: {}", e);
                ResultCode::Error
            }
        }
    }

    fn do_traffic_log(&mut self, d: &Directive) -> ResultCode {
        if d.value == 0 {
            let lines: Vec<String> = self.log.lines().cloned().collect();
            self.log.close();
            for line in lines {
                self.println(&line);
                if self.serial.drain(&mut self.flow) {
                    debug!("log dump aborted");
                    break;
                }
            }
            let eol = self.settings.eol.bytes();
            self.serial.print(&eol);
            return ResultCode::Ok;
        }
        if self.log.is_open() {
            return ResultCode::Error;
        }
        match d.value {
            86 => self.log.delete().into(),
            87 => {
                self.log.delete();
                ResultCode::Ok
            }
            88 => {
                self.log.start(true);
                ResultCode::Ok
            }
            _ => {
                self.log.start(false);
                ResultCode::Ok
            }
        }
    }

    fn help_text(&mut self) -> Option<Vec<u8>> {
        if let Some(text) = &self.help_cache {
            return Some(text.clone());
        }
        match self.ports.fetcher.fetch(&self.help_url) {
            Ok(text) => {
                self.help_cache = Some(text.clone());
                Some(text)
            }
            Err(e) => {
                warn!("help unavailable: {}", e);
                None
            }
        }
    }

    fn do_help(&mut self, d: &Directive) -> ResultCode {
        if d.value == HELP_FLUSH {
            self.help_cache = None;
            return ResultCode::Ok;
        }
        let saved_delay = self.serial.delay_ms;
        self.serial.delay_ms = u64::try_from(d.value).unwrap_or(0);
        self.println("Control-C to Abort.");
        let result = match self.help_text() {
            Some(text) => self.dump_content(&text, false),
            None => ResultCode::Error,
        };
        self.serial.delay_ms = saved_delay;
        if result.is_error() && !self.ports.platform.wifi_connected() {
            self.println("Not Connected.");
            self.println("Use ATW to list access points.");
            self.println("ATW\"[SSI],[PASSWORD]\" to connect.");
        }
        result
    }

    fn do_web_get(&mut self, d: &Directive) -> ResultCode {
        let url = d.arg_str();
        if url.is_empty() {
            return ResultCode::Error;
        }
        match self.ports.fetcher.fetch(&url) {
            Ok(body) => self.dump_content(&body, true),
            Err(e) => {
                warn!("fetch {} failed: {}", url, e);
                let eol = self.settings.eol.bytes();
                self.serial.print(&eol);
                ResultCode::Error
            }
        }
    }

    fn do_string_register(&mut self, d: &Directive) -> ResultCode {
        let text = d.arg_str();
        if text.len() < 3 {
            return ResultCode::Error;
        }
        let Some((key, value)) = text.split_once('=') else {
            return ResultCode::Error;
        };
        if value.is_empty() || key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
            return ResultCode::Error;
        }
        match key.parse::<u32>() {
            Ok(40) => {
                self.settings.hostname = value.to_string();
                self.ports.platform.set_hostname(value);
            }
            Ok(41) => self.settings.term_type = value.to_string(),
            Ok(42) if value.len() <= MAX_BUSY_MSG => {
                self.settings.busy_msg = value.replace("\\n", "\n").replace("\\r", "\r");
            }
            _ => return ResultCode::Error,
        }
        ResultCode::Ok
    }

    fn do_clock(&mut self, d: &Directive) -> ResultCode {
        if d.arg.is_empty() {
            let now = self.ports.time.current_time();
            self.println(&now);
            return ResultCode::IgnoreSpecial;
        }
        let text = d.arg_str();
        let time = &mut self.ports.time;
        if text.eq_ignore_ascii_case("disabled") {
            time.set_disabled(true);
            return ResultCode::Ok;
        }
        time.set_disabled(false);
        let mut parts = text.splitn(3, ',');
        let zone = parts.next().unwrap_or_default();
        if !zone.is_empty() && !time.set_time_zone(zone) {
            return ResultCode::Error;
        }
        if let Some(format) = parts.next().filter(|f| !f.is_empty()) {
            time.set_format(format);
        }
        if let Some(host) = parts.next().filter(|h| !h.is_empty()) {
            time.set_ntp_host(host);
        }
        ResultCode::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_address() {
        assert_eq!(split_address("bbs.example.com"), Some(("bbs.example.com".to_string(), 23)));
        assert_eq!(split_address("host:6400"), Some(("host".to_string(), 6400)));
        assert_eq!(split_address("host:port"), None);
        assert_eq!(split_address(":23"), None);
    }

    #[test]
    fn test_split_statics() {
        let (pw, ips) = split_statics("secret,10.0.0.2,10.0.0.1,10.0.0.1,255.255.255.0");
        assert_eq!(pw, "secret");
        assert_eq!(ips.unwrap().subnet, "255.255.255.0");

        let (pw, ips) = split_statics("a,b,c");
        assert_eq!(pw, "a,b,c");
        assert!(ips.is_none());
    }

    #[test]
    fn test_modifier_comparison_ignores_order() {
        assert!(same_modifiers(",ep", "pe"));
        assert!(!same_modifiers("e", "ep"));
    }
}
