//! Pending command buffer
//!
//! Collects typed bytes until a terminator, handling backspace and the
//! in-band flow-control bytes. Echo and flow actions are left to the caller;
//! [`CommandLine::feed`] only says what the byte meant.

use crate::flow::{XOFF, XON};
use crate::protocol::{petscii_to_ascii, LineEnding, MAX_COMMAND_SIZE};

/// What a fed byte turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// CR or LF: the line is complete
    EndOfLine,
    Xon,
    Xoff,
    /// Stored or used for editing; echo it
    Edit,
    /// Stored and the buffer must be processed now (full, or `A/`)
    Cut,
    /// NUL, dropped
    Ignored,
}

/// The line being typed in command mode
#[derive(Debug, Clone, Default)]
pub struct CommandLine {
    buf: Vec<u8>,
}

impl CommandLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify and apply one input byte
    pub fn feed(&mut self, byte: u8, eol: &LineEnding, backspace: u8) -> Feed {
        if eol.is_terminator(byte) {
            return Feed::EndOfLine;
        }
        match byte {
            0 => Feed::Ignored,
            XOFF => Feed::Xoff,
            XON => Feed::Xon,
            b if b == backspace || (backspace == 8 && (b == 20 || b == 127)) => {
                self.buf.pop();
                Feed::Edit
            }
            b => {
                self.buf.push(b);
                let repeat = self.buf.len() == 2 && self.buf[1] == b'/' && self.buf[0].eq_ignore_ascii_case(&b'a');
                if self.buf.len() >= MAX_COMMAND_SIZE || repeat {
                    Feed::Cut
                } else {
                    Feed::Edit
                }
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Take the finished line: PETSCII decoded when asked, then trimmed
    pub fn take(&mut self, petscii: bool) -> Vec<u8> {
        let mut line = std::mem::take(&mut self.buf);
        if petscii {
            for b in line.iter_mut() {
                *b = petscii_to_ascii(*b);
            }
        }
        line.trim_ascii().to_vec()
    }
}
