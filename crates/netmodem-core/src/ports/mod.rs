//! Collaborator interfaces
//!
//! The engine decides what goes out and when; everything that touches real
//! hardware or the network sits behind one of these traits. `memory` has
//! in-process implementations for tests and demos, `serial_port` and `tcp`
//! wrap the real thing.

pub mod memory;
pub mod serial_port;
pub mod tcp;

use serde::{Deserialize, Serialize};
pub use serialport::{DataBits, Parity, StopBits};

use crate::connection::ConnFlags;
use crate::protocol::ModemError;

/// Modem control lines driven by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Data carrier detect
    Dcd,
    /// Request to send
    Rts,
    /// Ring indicator
    Ri,
    /// Data set ready
    Dsr,
}

/// Byte-level access to the terminal's serial line
pub trait SerialLine {
    /// Next received byte, if any
    fn read_byte(&mut self) -> Option<u8>;

    /// Queue bytes for transmission
    fn write(&mut self, data: &[u8]) -> Result<(), ModemError>;

    /// Free space in the transmit buffer
    fn available_for_write(&self) -> usize;

    /// Push queued output to the wire
    fn flush(&mut self) -> Result<(), ModemError>;

    fn set_baud(&mut self, baud: u32) -> Result<(), ModemError>;

    fn set_format(&mut self, data_bits: DataBits, parity: Parity, stop_bits: StopBits) -> Result<(), ModemError>;

    /// Drive an output line to a physical level
    fn set_signal(&mut self, signal: Signal, high: bool);

    /// Physical level of the CTS input
    fn cts(&mut self) -> bool;
}

/// One TCP (or similar) stream
pub trait Socket {
    /// Bytes that can be read without blocking
    fn available(&mut self) -> usize;

    /// Read up to `buf.len()` bytes, returning how many were read
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Write bytes, returning how many were accepted
    fn write(&mut self, data: &[u8]) -> usize;

    fn is_connected(&mut self) -> bool;

    fn close(&mut self);
}

/// A connection handed out by a [`Listener`]
pub struct Accepted {
    pub socket: Box<dyn Socket>,
    /// Remote address
    pub host: String,
    /// Remote port
    pub port: u16,
}

/// A bound server socket
pub trait Listener {
    fn port(&self) -> u16;

    /// Take the next waiting caller, if any
    fn accept(&mut self) -> Option<Accepted>;
}

/// Outbound connections and listening sockets
pub trait Network {
    fn connect(&mut self, host: &str, port: u16, flags: ConnFlags) -> Result<Box<dyn Socket>, ModemError>;

    fn listen(&mut self, port: u16) -> Result<Box<dyn Listener>, ModemError>;
}

/// Static address assignment, all four or nothing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticIps {
    pub ip: String,
    pub dns: String,
    pub gateway: String,
    pub subnet: String,
}

/// A WiFi scan result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    pub rssi: i32,
    pub open: bool,
}

/// WiFi and host facts
pub trait Platform {
    fn wifi_connected(&self) -> bool;

    fn connect_wifi(&mut self, ssid: &str, password: &str, statics: Option<&StaticIps>) -> bool;

    fn disconnect_wifi(&mut self);

    fn scan(&mut self) -> Vec<AccessPoint>;

    fn local_ip(&self) -> String;

    fn mac_address(&self) -> String;

    fn free_memory(&self) -> u64;

    /// One-line description of the host, shown in the banner
    fn describe(&self) -> String;

    fn set_hostname(&mut self, hostname: &str);
}

/// Wall clock and time-zone settings (`&T`, `ATI7`)
pub trait TimeService {
    fn current_time(&self) -> String;

    /// Set the zone; false if the name is not recognised
    fn set_time_zone(&mut self, zone: &str) -> bool;

    fn time_zone(&self) -> String;

    fn set_format(&mut self, format: &str);

    fn format(&self) -> String;

    fn set_ntp_host(&mut self, host: &str);

    fn ntp_host(&self) -> String;

    fn set_disabled(&mut self, disabled: bool);

    fn is_disabled(&self) -> bool;

    /// Back to factory zone, format and host
    fn reset(&mut self);
}

/// Printer emulation
pub trait Printer {
    /// Start a PostScript job with the given preamble
    fn postscript(&mut self, preamble: &str) -> bool;

    /// Start a print job from an `AT+PRINT` spec
    fn print(&mut self, spec: &[u8], petscii: bool) -> bool;

    fn last_spec(&self) -> String;

    fn set_last_spec(&mut self, spec: &str);

    fn timeout_ms(&self) -> u64;

    fn set_timeout_ms(&mut self, ms: u64);
}

/// HTTP(S) retrieval for `&G` and the help text
pub trait WebFetcher {
    fn fetch(&mut self, url: &str) -> Result<Vec<u8>, ModemError>;
}

/// Named text records on persistent storage
pub trait ConfigStore {
    fn load(&self, name: &str) -> Option<String>;

    fn save(&mut self, name: &str, contents: &str) -> Result<(), ModemError>;

    /// Delete a record, returning whether it existed
    fn remove(&mut self, name: &str) -> bool;

    /// Wipe everything
    fn format(&mut self) -> bool;
}

/// A stored dial entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneEntry {
    pub number: u64,
    /// `host:port`
    pub address: String,
    pub modifiers: String,
    pub notes: String,
}

pub trait PhoneBook {
    /// All entries in number order
    fn entries(&self) -> Vec<PhoneEntry>;

    fn find(&self, number: u64) -> Option<PhoneEntry>;

    fn put(&mut self, entry: PhoneEntry);

    fn remove(&mut self, number: u64) -> bool;

    fn clear(&mut self);
}

/// Time source and the cooperative suspension point
pub trait Clock {
    /// Milliseconds since an arbitrary epoch
    fn now_ms(&self) -> u64;

    /// Give up the processor for roughly `ms` milliseconds
    fn sleep_ms(&self, ms: u64);
}

/// [`Clock`] backed by the OS
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: std::time::Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
}
