//! Terminal-side serial output
//!
//! Wraps the [`SerialLine`] with the things every writer needs: PETSCII
//! output translation, the S44 inter-byte delay, logical-to-physical
//! signal polarity, and headroom waits that keep reading XON/XOFF while they
//! spin.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::warn;

use crate::flow::{FlowController, XOFF, XON};
use crate::ports::{Clock, DataBits, Parity, SerialLine, Signal, StopBits};
use crate::protocol::{ascii_to_petscii, ModemError, DEFAULT_BAUD_RATE};

/// Control-C, aborts long transfers
pub const CTRL_C: u8 = 3;

/// How a logical modem signal maps to a line level (S46..S56)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinMode {
    /// Active high
    #[default]
    Normal,
    /// Active low
    Inverted,
    AlwaysHigh,
    AlwaysLow,
}

impl PinMode {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Normal),
            1 => Some(Self::Inverted),
            2 => Some(Self::AlwaysHigh),
            3 => Some(Self::AlwaysLow),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Inverted => 1,
            Self::AlwaysHigh => 2,
            Self::AlwaysLow => 3,
        }
    }

    /// Line level for a logical state
    pub fn level(&self, active: bool) -> bool {
        match self {
            Self::Normal => active,
            Self::Inverted => !active,
            Self::AlwaysHigh => true,
            Self::AlwaysLow => false,
        }
    }
}

/// Polarity and pin assignment of the six modem lines
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinConfig {
    pub dcd: PinMode,
    pub cts: PinMode,
    pub rts: PinMode,
    pub ri: PinMode,
    pub dtr: PinMode,
    pub dsr: PinMode,
    /// Pin numbers in S47..S57 order: DCD, CTS, RTS, RI, DTR, DSR
    pub pins: [i64; 6],
}

impl PinConfig {
    fn mode(&self, signal: Signal) -> PinMode {
        match signal {
            Signal::Dcd => self.dcd,
            Signal::Rts => self.rts,
            Signal::Ri => self.ri,
            Signal::Dsr => self.dsr,
        }
    }
}

/// The serial line as the engine writes to it
pub struct ModemSerial {
    line: Box<dyn SerialLine>,
    clock: Rc<dyn Clock>,
    /// Ordinary input read while draining for flow-control bytes
    pending: VecDeque<u8>,
    /// Translate printed text to PETSCII
    pub petscii: bool,
    /// Pause after every byte, in milliseconds (S44)
    pub delay_ms: u64,
    pub pins: PinConfig,
    baud: u32,
}

impl ModemSerial {
    pub fn new(line: Box<dyn SerialLine>, clock: Rc<dyn Clock>) -> Self {
        Self {
            line,
            clock,
            pending: VecDeque::new(),
            petscii: false,
            delay_ms: 0,
            pins: PinConfig::default(),
            baud: DEFAULT_BAUD_RATE,
        }
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        self.pending.pop_front().or_else(|| self.line.read_byte())
    }

    /// Write bytes untranslated
    pub fn write_raw(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.delay_ms == 0 {
            if let Err(e) = self.line.write(data) {
                warn!("serial write failed: {}", e);
            }
            return;
        }
        for b in data {
            if let Err(e) = self.line.write(std::slice::from_ref(b)) {
                warn!("serial write failed: {}", e);
                return;
            }
            self.clock.sleep_ms(self.delay_ms);
        }
    }

    /// Write text, translated to PETSCII in PETSCII mode
    pub fn print(&mut self, data: &[u8]) {
        if self.petscii {
            let translated: Vec<u8> = data.iter().map(|&b| ascii_to_petscii(b)).collect();
            self.write_raw(&translated);
        } else {
            self.write_raw(data);
        }
    }

    pub fn print_str(&mut self, text: &str) {
        self.print(text.as_bytes());
    }

    pub fn available_for_write(&self) -> usize {
        self.line.available_for_write()
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.line.flush() {
            warn!("serial flush failed: {}", e);
        }
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn set_baud(&mut self, baud: u32) -> Result<(), ModemError> {
        self.line.set_baud(baud)?;
        self.baud = baud;
        Ok(())
    }

    pub fn set_format(&mut self, data_bits: DataBits, parity: Parity, stop_bits: StopBits) -> Result<(), ModemError> {
        self.line.set_format(data_bits, parity, stop_bits)
    }

    /// Drive a modem line to its logical state
    pub fn set_signal(&mut self, signal: Signal, active: bool) {
        let level = self.pins.mode(signal).level(active);
        self.line.set_signal(signal, level);
    }

    /// Logical state of CTS
    pub fn cts(&mut self) -> bool {
        let level = self.line.cts();
        level == self.pins.cts.level(true)
    }

    /// Consume pending input, acting on flow-control bytes.
    ///
    /// Returns true if the terminal sent Control-C. Other bytes are kept for
    /// [`Self::read_byte`].
    pub fn drain(&mut self, flow: &mut FlowController) -> bool {
        let mut abort = false;
        while let Some(b) = self.line.read_byte() {
            match b {
                XON => {
                    flow.on_xon();
                }
                XOFF => flow.on_xoff(),
                CTRL_C => abort = true,
                _ => self.pending.push_back(b),
            }
        }
        abort
    }

    /// Wait until `needed` bytes fit and the line is clear to send.
    ///
    /// Gives up with [`ModemError::Timeout`] after `timeout_ms` without
    /// room, or [`ModemError::Aborted`] on Control-C.
    pub fn wait_headroom(&mut self, needed: usize, flow: &mut FlowController, timeout_ms: u64) -> Result<(), ModemError> {
        let start = self.clock.now_ms();
        loop {
            if self.drain(flow) {
                return Err(ModemError::Aborted);
            }
            let cts = self.cts();
            if self.available_for_write() >= needed && flow.line_clear(cts) {
                return Ok(());
            }
            if self.clock.now_ms().saturating_sub(start) >= timeout_ms {
                return Err(ModemError::Timeout);
            }
            self.flush();
            self.clock.sleep_ms(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowControlMode;
    use crate::ports::memory::{ManualClock, MemorySerial};
    use pretty_assertions::assert_eq;

    fn serial() -> (ModemSerial, MemorySerial, ManualClock) {
        let line = MemorySerial::new();
        let clock = ManualClock::new();
        (
            ModemSerial::new(Box::new(line.clone()), Rc::new(clock.clone())),
            line,
            clock,
        )
    }

    #[test]
    fn test_print_petscii() {
        let (mut s, line, _) = serial();
        s.petscii = true;
        s.print_str("Ok");
        assert_eq!(line.take_output(), vec![0xCF, 0x4B]);
    }

    #[test]
    fn test_delay_per_byte() {
        let (mut s, line, clock) = serial();
        s.delay_ms = 10;
        s.write_raw(b"abc");
        assert_eq!(clock.now_ms(), 30);
        assert_eq!(line.take_output(), b"abc".to_vec());
    }

    #[test]
    fn test_drain_keeps_ordinary_input() {
        let (mut s, line, _) = serial();
        let mut flow = FlowController::new(FlowControlMode::Normal);
        line.push_input(&[b'a', XOFF, b'b']);
        assert!(!s.drain(&mut flow));
        assert!(!flow.xon());
        assert_eq!(s.read_byte(), Some(b'a'));
        assert_eq!(s.read_byte(), Some(b'b'));
        assert_eq!(s.read_byte(), None);
    }

    #[test]
    fn test_wait_headroom_times_out() {
        let (mut s, line, _) = serial();
        line.set_room(2);
        let mut flow = FlowController::default();
        assert!(matches!(s.wait_headroom(5, &mut flow, 100), Err(ModemError::Timeout)));
    }

    #[test]
    fn test_wait_headroom_aborts_on_ctrl_c() {
        let (mut s, line, _) = serial();
        line.set_room(0);
        line.push_input(&[CTRL_C]);
        let mut flow = FlowController::default();
        assert!(matches!(s.wait_headroom(5, &mut flow, 100), Err(ModemError::Aborted)));
    }

    #[test]
    fn test_inverted_dcd() {
        let (mut s, line, _) = serial();
        s.pins.dcd = PinMode::Inverted;
        s.set_signal(Signal::Dcd, true);
        assert_eq!(line.signal(Signal::Dcd), Some(false));
    }
}
