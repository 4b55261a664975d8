//! AT command interpreter
//!
//! A completed line is split into directives by [`Parser`] and each one runs
//! against the [`Session`](crate::modem::Session) in order. The first
//! directive to fail stops the line; one response goes out at the end.

mod handlers;
mod line;
mod parser;
mod response;

pub use line::{CommandLine, Feed};
pub use parser::{find_at, is_numeric, numeric_value, Directive, Parser};
pub use response::{connect_code, ResultCode, RING};

use tracing::debug;

use crate::modem::Session;

/// Print-job preambles typed as whole lines
const POSTSCRIPT_LINES: [(&[u8], &str); 2] = [(b"%!PS", "%!PS\n"), (b"\x04grestoreall", "%!PS\ngrestoreall\n")];

impl Session {
    /// Run one command line and send its response
    pub fn execute_line(&mut self, line: &[u8]) -> ResultCode {
        let line = if line.len() == 2 && line[0].eq_ignore_ascii_case(&b'a') && line[1] == b'/' {
            self.previous_command.clone()
        } else {
            line.to_vec()
        };
        let text = String::from_utf8_lossy(&line).into_owned();
        debug!("command: {}", text);
        self.log.note(&format!("Command: {}", text));

        for (literal, preamble) in POSTSCRIPT_LINES {
            if line == literal {
                let result = ResultCode::from(self.ports.printer.postscript(preamble));
                self.respond(result);
                return result;
            }
        }

        let Some(parser) = Parser::new(&line) else {
            return ResultCode::Ignore;
        };
        self.crc_pending = None;
        let mut result = ResultCode::Ok;
        for directive in parser {
            result = self.dispatch(&directive);
            if result.is_error() {
                debug!("directive {} failed", directive.letter as char);
                break;
            }
        }

        let mut staged = std::mem::take(&mut self.staged);
        staged.commit_into(&mut self.global);
        if result != ResultCode::IgnoreSpecial {
            self.previous_command = line;
        }
        if self.crc_pending.take().is_some() {
            result = ResultCode::Error;
        }
        self.respond(result);
        result
    }
}
