//! Serial port handling
//!
//! [`SerialLine`] over a real port opened with the `serialport` crate.

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

use super::{SerialLine, Signal};
use crate::protocol::{ModemError, DEFAULT_BAUD_RATE};

/// Size of the transmit window reported to the engine.
///
/// The OS driver buffers far more than a UART FIFO; reporting a bounded
/// window keeps packet pacing close to the hardware the engine expects.
pub const TX_WINDOW: usize = 256;

fn serial_err(e: impl std::fmt::Display) -> ModemError {
    ModemError::SerialError(e.to_string())
}

/// Open a serial port for the terminal side
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, ModemError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

    // Short timeout keeps single-byte reads responsive
    serialport::new(name, baud)
        .timeout(Duration::from_millis(1))
        .open()
        .map_err(serial_err)
}

/// Configure 8N1 without driver flow control and raise the modem outputs
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ModemError> {
    port.set_data_bits(DataBits::Eight).map_err(serial_err)?;
    port.set_parity(Parity::None).map_err(serial_err)?;
    port.set_stop_bits(StopBits::One).map_err(serial_err)?;
    // Flow control is decided per packet by the engine
    port.set_flow_control(FlowControl::None).map_err(serial_err)?;

    if let Err(e) = port.write_request_to_send(true) {
        warn!("configure_port: failed to set RTS: {} (continuing)", e);
    }
    if let Err(e) = port.clear(ClearBuffer::All) {
        debug!("configure_port: clear buffers failed: {}", e);
    }
    Ok(())
}

/// A terminal connected to a host serial port
pub struct SerialPortLine {
    port: Box<dyn SerialPort>,
}

impl SerialPortLine {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }

    /// Open and configure `name`
    pub fn open(name: &str, baud_rate: Option<u32>) -> Result<Self, ModemError> {
        let mut port = open_port(name, baud_rate)?;
        configure_port(port.as_mut())?;
        Ok(Self::new(port))
    }
}

impl SerialLine for SerialPortLine {
    fn read_byte(&mut self) -> Option<u8> {
        match self.port.bytes_to_read() {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Some(buf[0]),
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => None,
            Err(e) => {
                warn!("serial read failed: {}", e);
                None
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ModemError> {
        self.port.write_all(data)?;
        Ok(())
    }

    fn available_for_write(&self) -> usize {
        let queued = self.port.bytes_to_write().unwrap_or(0) as usize;
        TX_WINDOW.saturating_sub(queued)
    }

    fn flush(&mut self) -> Result<(), ModemError> {
        self.port.flush()?;
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), ModemError> {
        self.port.set_baud_rate(baud).map_err(serial_err)
    }

    fn set_format(&mut self, data_bits: DataBits, parity: Parity, stop_bits: StopBits) -> Result<(), ModemError> {
        self.port.set_data_bits(data_bits).map_err(serial_err)?;
        self.port.set_parity(parity).map_err(serial_err)?;
        self.port.set_stop_bits(stop_bits).map_err(serial_err)
    }

    fn set_signal(&mut self, signal: Signal, high: bool) {
        // A host port can only drive RTS (and DTR, which stands in for DCD here)
        let result = match signal {
            Signal::Rts => self.port.write_request_to_send(high),
            Signal::Dcd => self.port.write_data_terminal_ready(high),
            Signal::Ri | Signal::Dsr => return,
        };
        if let Err(e) = result {
            debug!("set_signal {:?}: {}", signal, e);
        }
    }

    fn cts(&mut self) -> bool {
        self.port.read_clear_to_send().unwrap_or(true)
    }
}
