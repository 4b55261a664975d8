//! In-memory collaborators
//!
//! Every handle is a cheap clone sharing state with the copy given to the
//! engine, so a test can keep one end and inspect or feed it while the
//! session owns the other.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use super::{
    AccessPoint, Accepted, Clock, ConfigStore, DataBits, Listener, Network, Parity, PhoneBook, PhoneEntry, Platform,
    Printer, SerialLine, Signal, Socket, StaticIps, StopBits, TimeService, WebFetcher,
};
use crate::connection::ConnFlags;
use crate::protocol::ModemError;

#[derive(Debug)]
struct SerialState {
    input: VecDeque<u8>,
    output: Vec<u8>,
    room: usize,
    cts: bool,
    baud: u32,
    format: Option<(DataBits, Parity, StopBits)>,
    signals: HashMap<Signal, bool>,
}

/// Serial line backed by two byte queues
#[derive(Debug, Clone)]
pub struct MemorySerial {
    state: Rc<RefCell<SerialState>>,
}

impl Default for MemorySerial {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySerial {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SerialState {
                input: VecDeque::new(),
                output: Vec::new(),
                room: 4096,
                cts: true,
                baud: 0,
                format: None,
                signals: HashMap::new(),
            })),
        }
    }

    /// Bytes typed by the terminal
    pub fn push_input(&self, data: &[u8]) {
        self.state.borrow_mut().input.extend(data.iter().copied());
    }

    pub fn pending_input(&self) -> usize {
        self.state.borrow().input.len()
    }

    /// Everything written so far, clearing the buffer
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().output)
    }

    /// Drained output as lossy text
    pub fn take_text(&self) -> String {
        String::from_utf8_lossy(&self.take_output()).into_owned()
    }

    /// Reported transmit headroom
    pub fn set_room(&self, room: usize) {
        self.state.borrow_mut().room = room;
    }

    pub fn set_cts(&self, cts: bool) {
        self.state.borrow_mut().cts = cts;
    }

    pub fn baud(&self) -> u32 {
        self.state.borrow().baud
    }

    pub fn format(&self) -> Option<(DataBits, Parity, StopBits)> {
        self.state.borrow().format
    }

    /// Last level driven on a signal, if it was ever driven
    pub fn signal(&self, signal: Signal) -> Option<bool> {
        self.state.borrow().signals.get(&signal).copied()
    }
}

impl SerialLine for MemorySerial {
    fn read_byte(&mut self) -> Option<u8> {
        self.state.borrow_mut().input.pop_front()
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ModemError> {
        self.state.borrow_mut().output.extend_from_slice(data);
        Ok(())
    }

    fn available_for_write(&self) -> usize {
        self.state.borrow().room
    }

    fn flush(&mut self) -> Result<(), ModemError> {
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), ModemError> {
        self.state.borrow_mut().baud = baud;
        Ok(())
    }

    fn set_format(&mut self, data_bits: DataBits, parity: Parity, stop_bits: StopBits) -> Result<(), ModemError> {
        self.state.borrow_mut().format = Some((data_bits, parity, stop_bits));
        Ok(())
    }

    fn set_signal(&mut self, signal: Signal, high: bool) {
        self.state.borrow_mut().signals.insert(signal, high);
    }

    fn cts(&mut self) -> bool {
        self.state.borrow().cts
    }
}

#[derive(Debug, Default)]
struct SocketState {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    connected: bool,
}

/// A socket whose remote end is the test
#[derive(Debug, Clone)]
pub struct MemorySocket {
    state: Rc<RefCell<SocketState>>,
}

impl Default for MemorySocket {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySocket {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SocketState {
                connected: true,
                ..Default::default()
            })),
        }
    }

    /// Data sent by the remote host
    pub fn push(&self, data: &[u8]) {
        self.state.borrow_mut().inbound.extend(data.iter().copied());
    }

    /// Everything the engine wrote to the remote host, clearing it
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().outbound)
    }

    /// Remote side closes the connection
    pub fn hang_up(&self) {
        self.state.borrow_mut().connected = false;
    }

    pub fn connected(&self) -> bool {
        self.state.borrow().connected
    }
}

impl Socket for MemorySocket {
    fn available(&mut self) -> usize {
        self.state.borrow().inbound.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut state = self.state.borrow_mut();
        let n = buf.len().min(state.inbound.len());
        for (slot, b) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = b;
        }
        n
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            return 0;
        }
        state.outbound.extend_from_slice(data);
        data.len()
    }

    fn is_connected(&mut self) -> bool {
        self.state.borrow().connected
    }

    fn close(&mut self) {
        self.state.borrow_mut().connected = false;
    }
}

/// A listening port the test can ring
#[derive(Clone)]
pub struct MemoryListener {
    port: u16,
    waiting: Rc<RefCell<VecDeque<Accepted>>>,
    callers: Rc<Cell<u16>>,
}

impl MemoryListener {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            waiting: Rc::new(RefCell::new(VecDeque::new())),
            callers: Rc::new(Cell::new(0)),
        }
    }

    /// Queue an inbound call from `host`, returning the caller's end.
    ///
    /// Callers get remote ports 40001, 40002 and so on.
    pub fn ring(&self, host: &str) -> MemorySocket {
        let socket = MemorySocket::new();
        self.callers.set(self.callers.get() + 1);
        self.waiting.borrow_mut().push_back(Accepted {
            socket: Box::new(socket.clone()),
            host: host.to_string(),
            port: 40000 + self.callers.get(),
        });
        socket
    }
}

impl Listener for MemoryListener {
    fn port(&self) -> u16 {
        self.port
    }

    fn accept(&mut self) -> Option<Accepted> {
        self.waiting.borrow_mut().pop_front()
    }
}

#[derive(Default)]
struct NetworkState {
    reachable: HashMap<(String, u16), MemorySocket>,
    dialed: Vec<(String, u16, ConnFlags)>,
    listeners: HashMap<u16, MemoryListener>,
    blocked_ports: Vec<u16>,
}

/// Network where the test decides which hosts answer
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `host:port` answer; the returned socket is the remote end
    pub fn expect_connect(&self, host: &str, port: u16) -> MemorySocket {
        let socket = MemorySocket::new();
        self.state
            .borrow_mut()
            .reachable
            .insert((host.to_string(), port), socket.clone());
        socket
    }

    /// Make binding `port` fail
    pub fn block_port(&self, port: u16) {
        self.state.borrow_mut().blocked_ports.push(port);
    }

    /// Listener bound on `port`, if the engine opened one
    pub fn listener(&self, port: u16) -> Option<MemoryListener> {
        self.state.borrow().listeners.get(&port).cloned()
    }

    /// Every dial attempt, successful or not
    pub fn dialed(&self) -> Vec<(String, u16, ConnFlags)> {
        self.state.borrow().dialed.clone()
    }
}

impl Network for MemoryNetwork {
    fn connect(&mut self, host: &str, port: u16, flags: ConnFlags) -> Result<Box<dyn Socket>, ModemError> {
        let mut state = self.state.borrow_mut();
        state.dialed.push((host.to_string(), port, flags));
        match state.reachable.remove(&(host.to_string(), port)) {
            Some(socket) => Ok(Box::new(socket)),
            None => Err(ModemError::ConnectionFailed(format!("{}:{} unreachable", host, port))),
        }
    }

    fn listen(&mut self, port: u16) -> Result<Box<dyn Listener>, ModemError> {
        let mut state = self.state.borrow_mut();
        if state.blocked_ports.contains(&port) {
            return Err(ModemError::ListenFailed {
                port,
                reason: "address in use".to_string(),
            });
        }
        let listener = MemoryListener::new(port);
        state.listeners.insert(port, listener.clone());
        Ok(Box::new(listener))
    }
}

/// Clock that only moves when told to, or when the engine sleeps
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms.max(1));
    }
}

/// Record storage in a map
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    records: Rc<RefCell<BTreeMap<String, String>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.records.borrow().get(name).cloned()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self, name: &str) -> Option<String> {
        self.get(name)
    }

    fn save(&mut self, name: &str, contents: &str) -> Result<(), ModemError> {
        self.records.borrow_mut().insert(name.to_string(), contents.to_string());
        Ok(())
    }

    fn remove(&mut self, name: &str) -> bool {
        self.records.borrow_mut().remove(name).is_some()
    }

    fn format(&mut self) -> bool {
        self.records.borrow_mut().clear();
        true
    }
}

/// Phone book kept in number order
#[derive(Debug, Clone, Default)]
pub struct MemoryPhoneBook {
    entries: Rc<RefCell<BTreeMap<u64, PhoneEntry>>>,
}

impl MemoryPhoneBook {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PhoneBook for MemoryPhoneBook {
    fn entries(&self) -> Vec<PhoneEntry> {
        self.entries.borrow().values().cloned().collect()
    }

    fn find(&self, number: u64) -> Option<PhoneEntry> {
        self.entries.borrow().get(&number).cloned()
    }

    fn put(&mut self, entry: PhoneEntry) {
        self.entries.borrow_mut().insert(entry.number, entry);
    }

    fn remove(&mut self, number: u64) -> bool {
        self.entries.borrow_mut().remove(&number).is_some()
    }

    fn clear(&mut self) {
        self.entries.borrow_mut().clear();
    }
}

#[derive(Debug, Default)]
struct PlatformState {
    connected: bool,
    ssid: String,
    hostname: String,
    networks: Vec<AccessPoint>,
    passwords: HashMap<String, String>,
}

/// WiFi that joins whichever networks the test registers
#[derive(Debug, Clone, Default)]
pub struct MemoryPlatform {
    state: Rc<RefCell<PlatformState>>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a visible network; `password` of `None` means open
    pub fn add_network(&self, ssid: &str, password: Option<&str>, rssi: i32) {
        let mut state = self.state.borrow_mut();
        state.networks.push(AccessPoint {
            ssid: ssid.to_string(),
            rssi,
            open: password.is_none(),
        });
        state
            .passwords
            .insert(ssid.to_string(), password.unwrap_or_default().to_string());
    }

    pub fn joined(&self) -> Option<String> {
        let state = self.state.borrow();
        state.connected.then(|| state.ssid.clone())
    }

    pub fn hostname(&self) -> String {
        self.state.borrow().hostname.clone()
    }
}

impl Platform for MemoryPlatform {
    fn wifi_connected(&self) -> bool {
        self.state.borrow().connected
    }

    fn connect_wifi(&mut self, ssid: &str, password: &str, _statics: Option<&StaticIps>) -> bool {
        let mut state = self.state.borrow_mut();
        let ok = state.passwords.get(ssid).map_or(false, |pw| pw == password);
        state.connected = ok;
        state.ssid = if ok { ssid.to_string() } else { String::new() };
        ok
    }

    fn disconnect_wifi(&mut self) {
        let mut state = self.state.borrow_mut();
        state.connected = false;
        state.ssid.clear();
    }

    fn scan(&mut self) -> Vec<AccessPoint> {
        self.state.borrow().networks.clone()
    }

    fn local_ip(&self) -> String {
        if self.wifi_connected() {
            "192.168.1.50".to_string()
        } else {
            "0.0.0.0".to_string()
        }
    }

    fn mac_address(&self) -> String {
        "02:00:00:00:00:01".to_string()
    }

    fn free_memory(&self) -> u64 {
        65536
    }

    fn describe(&self) -> String {
        "host=memory".to_string()
    }

    fn set_hostname(&mut self, hostname: &str) {
        self.state.borrow_mut().hostname = hostname.to_string();
    }
}

const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DEFAULT_NTP_HOST: &str = "pool.ntp.org";

/// Time service over `chrono`, UTC only
#[derive(Debug, Clone)]
pub struct MemoryTimeService {
    zone: String,
    format: String,
    ntp_host: String,
    disabled: bool,
}

impl Default for MemoryTimeService {
    fn default() -> Self {
        Self {
            zone: "UTC".to_string(),
            format: DEFAULT_TIME_FORMAT.to_string(),
            ntp_host: DEFAULT_NTP_HOST.to_string(),
            disabled: false,
        }
    }
}

impl TimeService for MemoryTimeService {
    fn current_time(&self) -> String {
        if self.disabled {
            return String::new();
        }
        chrono::Utc::now().format(&self.format).to_string()
    }

    fn set_time_zone(&mut self, zone: &str) -> bool {
        let zone = zone.trim().to_ascii_uppercase();
        if zone == "UTC" || zone == "GMT" {
            self.zone = zone;
            true
        } else {
            false
        }
    }

    fn time_zone(&self) -> String {
        self.zone.clone()
    }

    fn set_format(&mut self, format: &str) {
        self.format = format.to_string();
    }

    fn format(&self) -> String {
        self.format.clone()
    }

    fn set_ntp_host(&mut self, host: &str) {
        self.ntp_host = host.to_string();
    }

    fn ntp_host(&self) -> String {
        self.ntp_host.clone()
    }

    fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }

    fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Default)]
struct PrinterState {
    jobs: Vec<String>,
    last_spec: String,
    timeout_ms: u64,
}

/// Printer that records job specs
#[derive(Debug, Clone)]
pub struct MemoryPrinter {
    state: Rc<RefCell<PrinterState>>,
}

impl Default for MemoryPrinter {
    fn default() -> Self {
        Self {
            state: Rc::new(RefCell::new(PrinterState {
                timeout_ms: 5000,
                ..Default::default()
            })),
        }
    }
}

impl MemoryPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<String> {
        self.state.borrow().jobs.clone()
    }
}

impl Printer for MemoryPrinter {
    fn postscript(&mut self, preamble: &str) -> bool {
        self.state.borrow_mut().jobs.push(preamble.to_string());
        true
    }

    fn print(&mut self, spec: &[u8], _petscii: bool) -> bool {
        let spec = String::from_utf8_lossy(spec);
        let target = spec.trim().trim_start_matches(':').to_string();
        if target.is_empty() {
            return false;
        }
        let mut state = self.state.borrow_mut();
        state.jobs.push(target.clone());
        state.last_spec = target;
        true
    }

    fn last_spec(&self) -> String {
        self.state.borrow().last_spec.clone()
    }

    fn set_last_spec(&mut self, spec: &str) {
        self.state.borrow_mut().last_spec = spec.to_string();
    }

    fn timeout_ms(&self) -> u64 {
        self.state.borrow().timeout_ms
    }

    fn set_timeout_ms(&mut self, ms: u64) {
        self.state.borrow_mut().timeout_ms = ms;
    }
}

/// Canned HTTP responses keyed by URL
#[derive(Debug, Clone, Default)]
pub struct MemoryWebFetcher {
    pages: Rc<RefCell<HashMap<String, Vec<u8>>>>,
    fetches: Rc<Cell<usize>>,
}

impl MemoryWebFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, body: &[u8]) {
        self.pages.borrow_mut().insert(url.to_string(), body.to_vec());
    }

    /// Number of fetches attempted
    pub fn fetches(&self) -> usize {
        self.fetches.get()
    }
}

impl WebFetcher for MemoryWebFetcher {
    fn fetch(&mut self, url: &str) -> Result<Vec<u8>, ModemError> {
        self.fetches.set(self.fetches.get() + 1);
        self.pages
            .borrow()
            .get(url)
            .cloned()
            .ok_or_else(|| ModemError::FetchFailed(format!("{}: not found", url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_read_drains_in_order() {
        let remote = MemorySocket::new();
        let mut local: Box<dyn Socket> = Box::new(remote.clone());
        remote.push(b"hello");
        let mut buf = [0u8; 3];
        assert_eq!(local.read(&mut buf), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(local.available(), 2);
    }

    #[test]
    fn test_closed_socket_refuses_writes() {
        let remote = MemorySocket::new();
        let mut local = remote.clone();
        remote.hang_up();
        assert_eq!(local.write(b"x"), 0);
        assert!(!local.is_connected());
    }

    #[test]
    fn test_network_connect_only_expected_hosts() {
        let mut net = MemoryNetwork::new();
        net.expect_connect("bbs.example.com", 23);
        assert!(net.connect("other", 23, ConnFlags::default()).is_err());
        assert!(net.connect("bbs.example.com", 23, ConnFlags::default()).is_ok());
        assert_eq!(net.dialed().len(), 2);
    }

    #[test]
    fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new();
        clock.sleep_ms(10);
        assert_eq!(clock.now_ms(), 10);
    }
}
