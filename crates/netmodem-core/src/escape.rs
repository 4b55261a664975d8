//! `+++` guard-time escape
//!
//! Command mode watches the typed line for exactly three escape characters
//! preceded and followed by a second of silence, and then lets go of the
//! current connection. Stream mode does the same on the raw byte stream,
//! holding candidate pluses back until it knows whether they were data.

use tracing::info;

use crate::modem::{Mode, Session};
use crate::protocol::GUARD_TIME_MS;

/// Command-mode escape state
#[derive(Debug, Clone)]
pub struct EscapeDetector {
    /// When the last byte other than the escape character arrived
    last_non_plus_ms: u64,
    /// Fire time once three escape characters are typed after silence
    expires: Option<u64>,
}

impl EscapeDetector {
    pub fn new(now: u64) -> Self {
        Self {
            last_non_plus_ms: now,
            expires: None,
        }
    }

    pub fn note_activity(&mut self, now: u64) {
        self.last_non_plus_ms = now;
    }

    /// Re-evaluate after input: arm if the line is exactly the token and the
    /// guard before it was quiet, otherwise disarm
    pub fn clear_progress(&mut self, line: &[u8], token: &[u8], now: u64) {
        self.expires = None;
        if line == token && now.saturating_sub(self.last_non_plus_ms) > GUARD_TIME_MS {
            self.expires = Some(now + GUARD_TIME_MS);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.expires.is_some()
    }

    /// True once the trailing guard has passed with the token still typed
    pub fn fired(&mut self, line: &[u8], token: &[u8], now: u64) -> bool {
        match self.expires {
            Some(at) if now > at => {
                self.expires = None;
                line == token
            }
            _ => false,
        }
    }
}

/// What the stream-mode filter decided after the guard time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPoll {
    Nothing,
    /// Held escape characters turned out to be data
    Flush(Vec<u8>),
    /// Three escape characters framed by silence: back to command mode
    Escape,
}

/// Stream-mode escape filter
#[derive(Debug, Clone)]
pub struct StreamEscape {
    held: usize,
    last_input_ms: u64,
}

impl StreamEscape {
    pub fn new(now: u64) -> Self {
        Self {
            held: 0,
            last_input_ms: now,
        }
    }

    /// Filter one byte; returns what should go to the connection now
    pub fn feed(&mut self, byte: u8, escape_char: u8, now: u64) -> Vec<u8> {
        let quiet = now.saturating_sub(self.last_input_ms) >= GUARD_TIME_MS;
        self.last_input_ms = now;
        if byte != escape_char {
            let mut out = vec![escape_char; self.held];
            self.held = 0;
            out.push(byte);
            return out;
        }
        if self.held == 0 && !quiet {
            return vec![byte];
        }
        self.held += 1;
        if self.held > 3 {
            let out = vec![escape_char; self.held];
            self.held = 0;
            return out;
        }
        Vec::new()
    }

    pub fn poll(&mut self, escape_char: u8, now: u64) -> StreamPoll {
        if self.held == 0 || now.saturating_sub(self.last_input_ms) < GUARD_TIME_MS {
            return StreamPoll::Nothing;
        }
        let held = std::mem::take(&mut self.held);
        if held == 3 {
            StreamPoll::Escape
        } else {
            StreamPoll::Flush(vec![escape_char; held])
        }
    }
}

impl Session {
    /// Fire a pending command-mode escape: release the current connection
    pub(crate) fn check_plus_escape(&mut self) {
        if self.mode != Mode::Command {
            return;
        }
        let now = self.clock.now_ms();
        let token = self.escape_token();
        if !self.escape.fired(self.line.as_bytes(), &token, now) {
            return;
        }
        if let Some(id) = self.current.take() {
            info!("escape releases connection {}", id);
            if let Some(conn) = self.table.get(id) {
                let (answered, address) = (conn.answered, conn.address());
                self.no_carrier_notice(id, answered, Some(address));
            }
        }
        self.line.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TOKEN: &[u8] = b"+++";

    #[test]
    fn test_arms_only_after_quiet() {
        let mut e = EscapeDetector::new(0);
        e.clear_progress(TOKEN, TOKEN, 500);
        assert!(!e.is_armed());
        e.clear_progress(TOKEN, TOKEN, 1500);
        assert!(e.is_armed());
    }

    #[test]
    fn test_fires_after_trailing_guard() {
        let mut e = EscapeDetector::new(0);
        e.clear_progress(TOKEN, TOKEN, 2000);
        assert!(!e.fired(TOKEN, TOKEN, 2500));
        assert!(e.fired(TOKEN, TOKEN, 3001));
        assert!(!e.is_armed());
    }

    #[test]
    fn test_more_typing_disarms() {
        let mut e = EscapeDetector::new(0);
        e.clear_progress(TOKEN, TOKEN, 2000);
        e.clear_progress(b"+++a", TOKEN, 2100);
        assert!(!e.fired(b"+++a", TOKEN, 5000));
    }

    #[test]
    fn test_stream_escape_sequence() {
        let mut s = StreamEscape::new(0);
        assert_eq!(s.feed(b'+', b'+', 1500), Vec::<u8>::new());
        assert_eq!(s.feed(b'+', b'+', 1600), Vec::<u8>::new());
        assert_eq!(s.feed(b'+', b'+', 1700), Vec::<u8>::new());
        assert_eq!(s.poll(b'+', 2000), StreamPoll::Nothing);
        assert_eq!(s.poll(b'+', 2701), StreamPoll::Escape);
    }

    #[test]
    fn test_plus_inside_data_passes_through() {
        let mut s = StreamEscape::new(0);
        assert_eq!(s.feed(b'a', b'+', 1500), b"a".to_vec());
        assert_eq!(s.feed(b'+', b'+', 1510), b"+".to_vec());
    }

    #[test]
    fn test_held_pluses_flush_on_data() {
        let mut s = StreamEscape::new(0);
        s.feed(b'+', b'+', 2000);
        s.feed(b'+', b'+', 2001);
        assert_eq!(s.feed(b'x', b'+', 2002), b"++x".to_vec());
    }

    #[test]
    fn test_fourth_plus_flushes() {
        let mut s = StreamEscape::new(0);
        for t in 0..3 {
            s.feed(b'+', b'+', 2000 + t);
        }
        assert_eq!(s.feed(b'+', b'+', 2003), b"++++".to_vec());
    }

    #[test]
    fn test_short_run_flushes_after_guard() {
        let mut s = StreamEscape::new(0);
        s.feed(b'+', b'+', 2000);
        assert_eq!(s.poll(b'+', 3000), StreamPoll::Flush(b"+".to_vec()));
    }
}
