//! Traffic log (`AT&O`)
//!
//! A bounded in-memory record of serial and socket traffic and executed
//! commands, dumped back to the terminal on request. Every entry is also
//! emitted as a `trace!` event.

use std::collections::VecDeque;
use tracing::trace;

/// Oldest entries are dropped beyond this many lines
pub const LOG_CAPACITY: usize = 2048;

/// Where a logged byte run travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SerialIn,
    SerialOut,
    SocketIn,
    SocketOut,
}

impl Direction {
    fn tag(&self) -> &'static str {
        match self {
            Self::SerialIn => "SER-IN",
            Self::SerialOut => "SER-OUT",
            Self::SocketIn => "SOC-IN",
            Self::SocketOut => "SOC-OUT",
        }
    }
}

#[derive(Debug, Default)]
pub struct TrafficLog {
    open: bool,
    debug: bool,
    lines: VecDeque<String>,
    /// Something was logged since the last delete
    exists: bool,
}

impl TrafficLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Start a fresh log, discarding the previous one
    pub fn start(&mut self, debug: bool) {
        self.lines.clear();
        self.open = true;
        self.debug = debug;
        self.exists = true;
    }

    /// Stop recording, keeping what was recorded
    pub fn close(&mut self) {
        self.open = false;
        self.debug = false;
    }

    /// Drop the recorded log; false if there was none
    pub fn delete(&mut self) -> bool {
        let existed = self.exists;
        self.lines.clear();
        self.exists = false;
        existed
    }

    fn push(&mut self, line: String) {
        trace!("traffic: {}", line);
        if self.lines.len() >= LOG_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Record a byte run as hex
    pub fn traffic(&mut self, direction: Direction, data: &[u8]) {
        if !self.open || data.is_empty() {
            return;
        }
        let hex: Vec<String> = data.iter().map(|b| format!("{:02X}", b)).collect();
        self.push(format!("{}: {}", direction.tag(), hex.join(" ")));
    }

    /// Record a free-form event
    pub fn note(&mut self, text: &str) {
        if self.open {
            self.push(text.to_string());
        }
    }

    /// Debug-only event (`AT&O88`)
    pub fn debug(&mut self, text: &str) {
        if self.open && self.debug {
            self.push(text.to_string());
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &String> {
        self.lines.iter()
    }
}
