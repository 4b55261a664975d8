//! Flow control
//!
//! Tracks the active discipline and the two transmit-enable flags that gate
//! packet output. Nothing here blocks; the scheduler polls
//! [`FlowController::may_transmit`] and yields when it is false.

use serde::{Deserialize, Serialize};

/// XON byte (DC1)
pub const XON: u8 = 17;
/// XOFF byte (DC3)
pub const XOFF: u8 = 19;

/// Flow-control discipline, numbered as `ATF` takes it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControlMode {
    /// Hardware handshake on the CTS line
    RtsCts,
    /// Software XON/XOFF
    Normal,
    /// One packet, then wait for XON
    AutoOff,
    /// Every packet must be requested with XON
    Manual,
    #[default]
    Disabled,
}

impl FlowControlMode {
    /// Map an `ATF` argument (or saved record value) to a mode
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::RtsCts),
            1 => Some(Self::Normal),
            2 => Some(Self::AutoOff),
            3 => Some(Self::Manual),
            4 => Some(Self::Disabled),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::RtsCts => 0,
            Self::Normal => 1,
            Self::AutoOff => 2,
            Self::Manual => 3,
            Self::Disabled => 4,
        }
    }

    /// `&K` presets
    pub fn from_preset(code: i64) -> Option<Self> {
        match code {
            0..=2 => Some(Self::Disabled),
            3 | 6 => Some(Self::RtsCts),
            4 | 5 => Some(Self::Normal),
            _ => None,
        }
    }

    /// True for the disciplines that count packets
    pub fn is_packet_gated(&self) -> bool {
        matches!(self, Self::AutoOff | Self::Manual)
    }
}

/// Transmit gate for the serial line
#[derive(Debug, Clone)]
pub struct FlowController {
    mode: FlowControlMode,
    xon: bool,
    packet_xon: bool,
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new(FlowControlMode::default())
    }
}

impl FlowController {
    pub fn new(mode: FlowControlMode) -> Self {
        let mut flow = Self {
            mode,
            xon: true,
            packet_xon: true,
        };
        flow.set_mode(mode);
        flow
    }

    pub fn mode(&self) -> FlowControlMode {
        self.mode
    }

    /// Switch discipline and re-open the gate.
    ///
    /// Manual starts closed; the caller is responsible for dropping every
    /// connection's retained packet so the next acknowledgement reads fresh
    /// data.
    pub fn set_mode(&mut self, mode: FlowControlMode) {
        self.mode = mode;
        self.xon = true;
        self.packet_xon = mode != FlowControlMode::Manual;
    }

    /// Re-open both flags without changing discipline
    pub fn reopen(&mut self) {
        self.set_mode(self.mode);
    }

    pub fn on_xoff(&mut self) {
        match self.mode {
            FlowControlMode::Normal => self.xon = false,
            FlowControlMode::AutoOff | FlowControlMode::Manual => self.packet_xon = false,
            _ => {}
        }
    }

    /// Handle an incoming XON.
    ///
    /// Returns true under Manual, where the XON is also the request for the
    /// next packet.
    pub fn on_xon(&mut self) -> bool {
        match self.mode {
            FlowControlMode::Normal => self.xon = true,
            FlowControlMode::AutoOff | FlowControlMode::Manual => self.packet_xon = true,
            _ => {}
        }
        self.mode == FlowControlMode::Manual
    }

    /// Explicit acknowledgement of the last packet
    pub fn acknowledge(&mut self) {
        self.packet_xon = true;
    }

    /// Close the gate after a packet under the packet-counting disciplines
    pub fn after_packet(&mut self) {
        if self.mode.is_packet_gated() {
            self.packet_xon = false;
        }
    }

    /// Whether the line itself may carry output; ignores packet gating
    pub fn line_clear(&self, cts: bool) -> bool {
        match self.mode {
            FlowControlMode::RtsCts => cts,
            FlowControlMode::Normal => self.xon,
            _ => true,
        }
    }

    /// Whether a packet may be sent now
    pub fn may_transmit(&self, cts: bool) -> bool {
        self.line_clear(cts) && self.packet_xon
    }

    pub fn packet_xon(&self) -> bool {
        self.packet_xon
    }

    /// Force the packet flag closed
    pub fn close_packet_gate(&mut self) {
        self.packet_xon = false;
    }

    pub fn xon(&self) -> bool {
        self.xon
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_starts_closed() {
        let flow = FlowController::new(FlowControlMode::Manual);
        assert!(!flow.may_transmit(true));
    }

    #[test]
    fn test_manual_one_packet_per_ack() {
        let mut flow = FlowController::new(FlowControlMode::Manual);
        assert!(flow.on_xon());
        assert!(flow.may_transmit(true));
        flow.after_packet();
        assert!(!flow.may_transmit(true));
        flow.acknowledge();
        assert!(flow.may_transmit(true));
    }

    #[test]
    fn test_normal_xon_xoff() {
        let mut flow = FlowController::new(FlowControlMode::Normal);
        assert!(flow.may_transmit(false));
        flow.on_xoff();
        assert!(!flow.may_transmit(true));
        assert!(!flow.on_xon());
        assert!(flow.may_transmit(true));
        flow.after_packet();
        assert!(flow.may_transmit(true));
    }

    #[test]
    fn test_auto_off_closes_after_packet() {
        let mut flow = FlowController::new(FlowControlMode::AutoOff);
        assert!(flow.may_transmit(true));
        flow.after_packet();
        assert!(!flow.may_transmit(true));
        flow.on_xon();
        assert!(flow.may_transmit(true));
    }

    #[test]
    fn test_rts_cts_follows_line() {
        let flow = FlowController::new(FlowControlMode::RtsCts);
        assert!(flow.may_transmit(true));
        assert!(!flow.may_transmit(false));
    }

    #[test]
    fn test_disabled_ignores_signals() {
        let mut flow = FlowController::new(FlowControlMode::Disabled);
        flow.on_xoff();
        flow.after_packet();
        assert!(flow.may_transmit(false));
    }

    #[test]
    fn test_presets() {
        assert_eq!(FlowControlMode::from_preset(0), Some(FlowControlMode::Disabled));
        assert_eq!(FlowControlMode::from_preset(6), Some(FlowControlMode::RtsCts));
        assert_eq!(FlowControlMode::from_preset(5), Some(FlowControlMode::Normal));
        assert_eq!(FlowControlMode::from_preset(7), None);
    }
}
