//! # NetModem Core Library
//!
//! Serial protocol engine for a WiFi-to-serial modem.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - A Hayes-style AT command interpreter with multi-connection extensions
//! - Packet framing (normal, hex, decimal) with CRC-8 checksums
//! - Round-robin multiplexing of TCP connections onto one serial line
//! - Software, hardware and manual (XON-per-packet) flow control
//! - Per-connection byte masks, delimiters and substitution programs
//! - Incoming call handling with ring counting and auto-answer
//! - Transparent stream mode with the `+++` guard-time escape
//!
//! ## Example
//!
//! ```rust,ignore
//! use netmodem_core::prelude::*;
//!
//! let mut session = Session::new(Box::new(line), Rc::new(SystemClock::default()), ports);
//! session.boot();
//! loop {
//!     session.step();
//! }
//! ```

pub mod command;
pub mod config;
pub mod connection;
mod escape;
pub mod flow;
pub mod log;
pub mod modem;
pub mod ports;
pub mod protocol;
mod ring;
mod scheduler;
pub mod serial;
mod stream;
pub mod transform;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::command::ResultCode;
    pub use crate::config::ModemSettings;
    pub use crate::connection::ConnFlags;
    pub use crate::flow::FlowControlMode;
    pub use crate::modem::{Collaborators, Mode, Session, DEFAULT_HELP_URL};
    pub use crate::ports::{
        Clock, ConfigStore, Network, PhoneBook, Platform, Printer, SerialLine, Socket, SystemClock, TimeService,
        WebFetcher,
    };
    pub use crate::protocol::{BinaryType, ModemError};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build identifier reported by `ATI8`
pub const BUILD: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));
