//! The modem session
//!
//! [`Session`] owns every piece of engine state: settings, the connection
//! table, session pointers, flow control and the collaborators. The
//! interpreter, scheduler, ring and stream code are `impl Session` blocks in
//! their own modules; nothing is shared or global.
//!
//! The host drives the session by calling [`Session::step`] in a loop. Each
//! step reads pending serial input, runs the escape check, services
//! listeners and rings, and offers the scheduler one packet.

use std::rc::Rc;
use tracing::{debug, info, warn};

use crate::command::{CommandLine, Feed, ResultCode};
use crate::config::{
    listeners_from_json, listeners_to_json, ModemSettings, SavedListener, CONFIG_RECORD, LISTENERS_RECORD,
};
use crate::connection::{ConnFlags, Connection, ConnectionTable, ListenerEntry};
use crate::escape::{EscapeDetector, StreamEscape};
use crate::flow::{FlowControlMode, FlowController};
use crate::log::{Direction, TrafficLog};
use crate::ports::{
    Clock, ConfigStore, Network, PhoneBook, Platform, Printer, SerialLine, Signal, TimeService, WebFetcher,
};
use crate::protocol::ModemError;
use crate::serial::ModemSerial;
use crate::transform::{ByteSet, Program, StagedTransforms, TransformSet};

/// Where `AT&H` fetches its help text unless the host says otherwise
pub const DEFAULT_HELP_URL: &str = "http://localhost/netmodem-help.txt";

/// Everything outside the engine
pub struct Collaborators {
    pub network: Box<dyn Network>,
    pub platform: Box<dyn Platform>,
    pub time: Box<dyn TimeService>,
    pub printer: Box<dyn Printer>,
    pub fetcher: Box<dyn WebFetcher>,
    pub store: Box<dyn ConfigStore>,
    pub phonebook: Box<dyn PhoneBook>,
}

/// Where serial input goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Typed lines are AT commands and connection data arrives framed
    Command,
    /// Serial and the connection with this id are joined byte for byte
    Stream(u32),
}

/// The serial protocol engine
pub struct Session {
    pub(crate) serial: ModemSerial,
    pub(crate) clock: Rc<dyn Clock>,
    pub(crate) ports: Collaborators,
    pub(crate) settings: ModemSettings,
    pub(crate) flow: FlowController,
    pub(crate) table: ConnectionTable,
    pub(crate) global: TransformSet,
    pub(crate) staged: StagedTransforms,
    pub(crate) current: Option<u32>,
    /// Last connection the scheduler served
    pub(crate) cursor: Option<u32>,
    pub(crate) last_packet_id: u32,
    pub(crate) last_server_client_id: u32,
    pub(crate) line: CommandLine,
    pub(crate) escape: EscapeDetector,
    pub(crate) stream_escape: StreamEscape,
    pub(crate) mode: Mode,
    pub(crate) previous_command: Vec<u8>,
    /// S42 checksum waiting for a `T` directive
    pub(crate) crc_pending: Option<u8>,
    pub(crate) log: TrafficLog,
    pub(crate) help_url: String,
    pub(crate) help_cache: Option<Vec<u8>>,
    /// Baud to restore when leaving stream mode
    pub(crate) saved_baud: Option<u32>,
    dcd: Option<bool>,
}

impl Session {
    pub fn new(line: Box<dyn SerialLine>, clock: Rc<dyn Clock>, ports: Collaborators) -> Self {
        let settings = ModemSettings::default();
        let now = clock.now_ms();
        Self {
            serial: ModemSerial::new(line, clock.clone()),
            clock,
            ports,
            flow: FlowController::new(settings.flow),
            settings,
            table: ConnectionTable::new(),
            global: TransformSet::default(),
            staged: StagedTransforms::default(),
            current: None,
            cursor: None,
            last_packet_id: 0,
            last_server_client_id: 0,
            line: CommandLine::new(),
            escape: EscapeDetector::new(now),
            stream_escape: StreamEscape::new(now),
            mode: Mode::Command,
            previous_command: Vec::new(),
            crc_pending: None,
            log: TrafficLog::new(),
            help_url: DEFAULT_HELP_URL.to_string(),
            help_cache: None,
            saved_baud: None,
            dcd: None,
        }
    }

    /// Point `AT&H` at another help document
    pub fn set_help_url(&mut self, url: &str) {
        self.help_url = url.to_string();
        self.help_cache = None;
    }

    /// Load the saved configuration and greet the terminal
    pub fn boot(&mut self) {
        self.load_config();
        self.connect_saved_wifi();
        self.show_banner();
    }

    /// One pass of the cooperative loop
    pub fn step(&mut self) {
        match self.mode {
            Mode::Command => {
                self.serial_incoming();
                self.check_plus_escape();
                self.accept_new_connections(false);
                self.service_rings();
                let cts = self.serial.cts();
                if self.flow.may_transmit(cts) {
                    self.send_next_packet();
                }
            }
            Mode::Stream(id) => self.stream_step(id),
        }
        self.update_carrier();
        self.serial.flush();
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn current(&self) -> Option<u32> {
        self.current
    }

    pub fn settings(&self) -> &ModemSettings {
        &self.settings
    }

    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    pub fn global_transforms(&self) -> &TransformSet {
        &self.global
    }

    pub fn connection(&self, id: u32) -> Option<&Connection> {
        self.table.get(id)
    }

    pub fn connection_ids(&self) -> Vec<u32> {
        self.table.ids()
    }

    pub fn listener_ports(&self) -> Vec<u16> {
        self.table.listeners().map(|l| l.port).collect()
    }

    pub fn last_packet_id(&self) -> u32 {
        self.last_packet_id
    }

    pub fn traffic_log(&self) -> &TrafficLog {
        &self.log
    }

    /// Read serial input in command mode, running a line once it completes
    fn serial_incoming(&mut self) {
        let now = self.clock.now_ms();
        let eol = self.settings.eol;
        let mut any = false;
        let mut complete = false;
        while let Some(c) = self.serial.read_byte() {
            any = true;
            self.log.traffic(Direction::SerialIn, &[c]);
            if c != 0 && c != self.settings.escape_char && !eol.is_terminator(c) {
                self.escape.note_activity(now);
            }
            match self.line.feed(c, &eol, self.settings.backspace) {
                Feed::EndOfLine => {
                    if self.settings.echo {
                        self.serial.write_raw(&eol.bytes());
                    }
                    complete = true;
                    break;
                }
                Feed::Xon => {
                    if self.flow.on_xon() {
                        self.send_next_packet();
                    }
                }
                Feed::Xoff => self.flow.on_xoff(),
                Feed::Edit => {
                    if self.settings.echo {
                        self.serial.write_raw(&[c]);
                    }
                }
                Feed::Cut => {
                    if self.settings.echo {
                        self.serial.write_raw(&[c]);
                    }
                    complete = true;
                    break;
                }
                Feed::Ignored => {}
            }
        }
        if any {
            let token = self.escape_token();
            self.escape.clear_progress(self.line.as_bytes(), &token, now);
        }
        if complete && !self.line.is_empty() {
            let line = self.line.take(self.settings.petscii);
            self.execute_line(&line);
        }
    }

    pub(crate) fn escape_token(&self) -> [u8; 3] {
        [self.settings.escape_char; 3]
    }

    /// Drive DCD from "any connection up"; drop RI with the last connection
    fn update_carrier(&mut self) {
        let any = self.table.any_connected();
        if self.dcd != Some(any) {
            self.dcd = Some(any);
            self.serial.set_signal(Signal::Dcd, any);
            if !any {
                self.serial.set_signal(Signal::Ri, false);
            }
        }
    }

    // Responses

    /// Text line wrapped in terminators, the way every response goes out
    pub(crate) fn print_line(&mut self, text: &str) {
        let eol = self.settings.eol.bytes();
        self.serial.print(&eol);
        self.serial.print_str(text);
        self.serial.print(&eol);
    }

    /// Text followed by a terminator
    pub(crate) fn println(&mut self, text: &str) {
        self.serial.print_str(text);
        let eol = self.settings.eol.bytes();
        self.serial.print(&eol);
    }

    fn verbose_or_numeric(&mut self, text: (&str, &str)) {
        let out = if self.settings.numeric_responses { text.1 } else { text.0 };
        self.print_line(out);
    }

    /// Terminal response for a finished line
    pub(crate) fn respond(&mut self, code: ResultCode) {
        debug!("response: {:?}", code);
        if code == ResultCode::Connect {
            let id = self.current.unwrap_or(self.serial.baud());
            self.connection_notice(id);
            return;
        }
        if self.settings.suppress_responses {
            return;
        }
        if let Some(text) = code.text() {
            self.log.note(&format!("Response: {}", text.0));
            self.verbose_or_numeric(text);
        }
    }

    /// `CONNECT <id>`, or the numeric code for the line speed
    pub(crate) fn connection_notice(&mut self, id: u32) {
        let text = if self.settings.numeric_responses {
            if self.settings.long_responses {
                crate::command::connect_code(self.serial.baud()).to_string()
            } else {
                "1".to_string()
            }
        } else if self.settings.long_responses {
            format!("CONNECT {}", id)
        } else {
            "CONNECT".to_string()
        };
        self.print_line(&text);
    }

    pub(crate) fn ring_line(&mut self) {
        self.verbose_or_numeric(crate::command::RING);
    }

    /// Unsolicited carrier loss; `address` adds `host:port` to the verbose form
    pub(crate) fn no_carrier_notice(&mut self, id: u32, answered: bool, address: Option<String>) {
        if self.settings.suppress_responses {
            return;
        }
        if self.settings.numeric_responses {
            self.print_line("3");
        } else if answered {
            let text = match address {
                Some(addr) => format!("NO CARRIER {} {}", id, addr),
                None => format!("NO CARRIER {}", id),
            };
            self.print_line(&text);
        }
    }

    pub(crate) fn show_banner(&mut self) {
        let eol = self.settings.eol.bytes();
        self.serial.print(&eol);
        self.println(&format!("NetModem Firmware v{}", crate::VERSION));
        let describe = self.ports.platform.describe();
        self.println(&describe);
        let status = if self.settings.ssid.is_empty() {
            "INITIALIZED".to_string()
        } else if self.ports.platform.wifi_connected() {
            format!("CONNECTED TO {} ({})", self.settings.ssid, self.ports.platform.local_ip())
        } else {
            format!("ERROR ON {}", self.settings.ssid)
        };
        self.println(&status);
        self.println("READY.");
    }

    // Connections

    /// Drop a connection, clearing any pointer that named it
    pub(crate) fn remove_connection(&mut self, id: u32) -> bool {
        let removed = self.table.remove(id);
        if removed {
            if self.current == Some(id) {
                self.current = None;
            }
            if self.cursor == Some(id) {
                self.cursor = None;
            }
            if self.mode == Mode::Stream(id) {
                self.leave_stream();
            }
        }
        removed
    }

    pub(crate) fn drop_all_connections(&mut self) {
        for id in self.table.ids() {
            self.remove_connection(id);
        }
        self.current = None;
        self.cursor = None;
    }

    /// Open a listener with the given flags and transforms
    pub(crate) fn listen(&mut self, port: u16, flags: ConnFlags, transforms: TransformSet) -> Result<u32, ModemError> {
        let handle = self.ports.network.listen(port)?;
        let id = self.table.next_id();
        let mut entry = ListenerEntry::new(id, handle, flags);
        entry.transforms = transforms;
        self.table.insert_listener(entry);
        Ok(id)
    }

    // Settings and persistence

    /// Switch flow discipline; Manual also forgets every retained packet
    pub(crate) fn set_flow_mode(&mut self, mode: FlowControlMode) {
        self.settings.flow = mode;
        self.flow.set_mode(mode);
        if mode == FlowControlMode::Manual {
            for conn in self.table.connections_mut() {
                conn.clear_last_packet();
            }
        }
    }

    /// Push settings into the serial line, globals and collaborators
    pub(crate) fn apply_settings(&mut self) {
        let s = self.settings.clone();
        self.serial.petscii = s.petscii;
        self.serial.delay_ms = s.serial_delay_ms;
        self.serial.pins = s.pins.clone();
        if let Err(e) = self.serial.set_baud(s.baud) {
            warn!("cannot set baud {}: {}", s.baud, e);
        }
        let (data, parity, stop) = s.uart.to_serial();
        if let Err(e) = self.serial.set_format(data, parity, stop) {
            warn!("cannot set format {}: {}", s.uart, e);
        }
        self.set_flow_mode(s.flow);

        self.global.delimiters = s.delimiters.clone();
        self.global.masks = s.masks.clone();
        match Program::parse(s.program.as_bytes()) {
            Ok(program) => self.global.substitution.set_program(program),
            Err(e) => {
                warn!("saved substitution program ignored: {}", e);
                self.global.substitution.set_program(Program::default());
            }
        }

        let time = &mut self.ports.time;
        if s.time_disabled {
            time.set_disabled(true);
        } else {
            time.set_disabled(false);
            if !s.time_zone.is_empty() && !time.set_time_zone(&s.time_zone) {
                warn!("unknown time zone {}", s.time_zone);
            }
            if !s.time_format.is_empty() {
                time.set_format(&s.time_format);
            }
            if !s.time_host.is_empty() {
                time.set_ntp_host(&s.time_host);
            }
        }
        self.ports.printer.set_last_spec(&s.print_spec);
        self.ports.printer.set_timeout_ms(s.print_timeout_ms);
        if !s.hostname.is_empty() {
            self.ports.platform.set_hostname(&s.hostname);
        }
    }

    /// Defaults overlaid with the saved record
    pub(crate) fn load_config(&mut self) {
        let mut settings = ModemSettings::default();
        if let Some(record) = self.ports.store.load(CONFIG_RECORD) {
            if let Err(e) = settings.overlay_record(&record) {
                warn!("saved configuration ignored: {}", e);
            }
        }
        self.settings = settings;
        self.apply_settings();
        debug!("configuration loaded");
    }

    pub(crate) fn connect_saved_wifi(&mut self) -> bool {
        if self.settings.ssid.is_empty() {
            return false;
        }
        let (ssid, password) = (self.settings.ssid.clone(), self.settings.password.clone());
        let statics = self.settings.static_ips.clone();
        let ok = self.ports.platform.connect_wifi(&ssid, &password, statics.as_ref());
        if ok {
            info!("joined {}", ssid);
        } else {
            warn!("cannot join {}", ssid);
        }
        ok
    }

    /// Pull live state back into the settings and write the record
    pub(crate) fn save_config(&mut self) -> Result<(), ModemError> {
        self.settings.delimiters = self.global.delimiters.clone();
        self.settings.masks = self.global.masks.clone();
        self.settings.program = self.global.substitution.program().to_text();
        let time = &self.ports.time;
        self.settings.time_disabled = time.is_disabled();
        self.settings.time_zone = time.time_zone();
        self.settings.time_format = time.format();
        self.settings.time_host = time.ntp_host();
        self.settings.print_spec = self.ports.printer.last_spec();
        self.settings.print_timeout_ms = self.ports.printer.timeout_ms();
        let record = self.settings.to_record();
        self.ports.store.save(CONFIG_RECORD, &record)?;
        info!("configuration saved");
        Ok(())
    }

    /// Write the listener list for `S60=1`
    pub(crate) fn save_listeners(&mut self) -> Result<(), ModemError> {
        let saved: Vec<SavedListener> = self
            .table
            .listeners()
            .map(|l| SavedListener {
                port: l.port,
                flags: l.flags,
                delimiters: l.transforms.delimiters.clone(),
                masks: l.transforms.masks.clone(),
                program: l.transforms.substitution.program().to_text(),
            })
            .collect();
        let json = listeners_to_json(&saved)?;
        self.ports.store.save(LISTENERS_RECORD, &json)
    }

    /// Re-open the listeners written by [`Self::save_listeners`]
    pub(crate) fn restore_listeners(&mut self) {
        let Some(json) = self.ports.store.load(LISTENERS_RECORD) else {
            return;
        };
        let saved = match listeners_from_json(&json) {
            Ok(saved) => saved,
            Err(e) => {
                warn!("saved listeners ignored: {}", e);
                return;
            }
        };
        for l in saved {
            let mut transforms = TransformSet {
                delimiters: l.delimiters,
                masks: l.masks,
                ..Default::default()
            };
            match Program::parse(l.program.as_bytes()) {
                Ok(p) => transforms.substitution.set_program(p),
                Err(e) => warn!("listener {} program ignored: {}", l.port, e),
            }
            if let Err(e) = self.listen(l.port, l.flags, transforms) {
                warn!("cannot restore listener: {}", e);
            }
        }
    }

    /// Global byte sets as `&D`/`&M` settings text
    pub(crate) fn byte_set_text(prefix: &str, set: &ByteSet) -> String {
        set.as_slice().iter().map(|b| format!("{}{}", prefix, b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::memory::*;
    use pretty_assertions::assert_eq;

    fn session() -> (Session, MemorySerial, MemoryConfigStore) {
        let serial = MemorySerial::new();
        let store = MemoryConfigStore::new();
        let ports = Collaborators {
            network: Box::new(MemoryNetwork::new()),
            platform: Box::new(MemoryPlatform::new()),
            time: Box::new(MemoryTimeService::default()),
            printer: Box::new(MemoryPrinter::new()),
            fetcher: Box::new(MemoryWebFetcher::new()),
            store: Box::new(store.clone()),
            phonebook: Box::new(MemoryPhoneBook::new()),
        };
        let s = Session::new(Box::new(serial.clone()), Rc::new(ManualClock::new()), ports);
        (s, serial, store)
    }

    #[test]
    fn test_banner() {
        let (mut s, serial, _) = session();
        s.boot();
        let text = serial.take_text();
        assert!(text.contains("INITIALIZED"));
        assert!(text.ends_with("READY.\r\n"));
    }

    #[test]
    fn test_echo_and_response() {
        let (mut s, serial, _) = session();
        serial.push_input(b"ATE0\r");
        s.step();
        assert_eq!(serial.take_text(), "ATE0\r\n\r\nOK\r\n");
        serial.push_input(b"AT\r");
        s.step();
        assert_eq!(serial.take_text(), "\r\nOK\r\n");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (mut s, _, store) = session();
        s.settings.rings = 4;
        s.global.delimiters = ByteSet::from_bytes(b"\r");
        s.save_config().unwrap();
        assert!(store.get(CONFIG_RECORD).is_some());
        s.settings = ModemSettings::default();
        s.load_config();
        assert_eq!(s.settings.rings, 4);
        assert!(s.global.delimiters.contains(b'\r'));
    }

    #[test]
    fn test_quiet_suppresses_but_connect_does_not() {
        let (mut s, serial, _) = session();
        s.settings.suppress_responses = true;
        s.respond(ResultCode::Ok);
        assert_eq!(serial.take_text(), "");
        s.current = Some(3);
        s.respond(ResultCode::Connect);
        assert_eq!(serial.take_text(), "\r\nCONNECT 3\r\n");
    }
}
