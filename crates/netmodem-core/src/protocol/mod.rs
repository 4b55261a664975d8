//! Serial wire protocol
//!
//! Packet headers, payload encodings and the CRC8 the terminal software
//! uses to validate what it receives, plus line endings and PETSCII.

mod eol;
mod error;
pub mod packet;
pub mod petscii;

pub use eol::{EolStyle, LineEnding};
pub use error::{ConfigError, HeaderError, ModemError, ProgramError};
pub use packet::{crc8, encode_body, header, parse_header, BinaryType, BodyEncoder, PacketHeader};
pub use petscii::{ascii_to_petscii, petscii_to_ascii, PetsciiEncoder};

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 1200;

/// Default packet payload size (S40)
pub const DEFAULT_PACKET_SIZE: usize = 127;

/// Longest command line before it is cut and executed
pub const MAX_COMMAND_SIZE: usize = 256;

/// Default TCP port when a dial string has none
pub const DEFAULT_TELNET_PORT: u16 = 23;

/// Guard interval around the `+++` escape sequence, in milliseconds
pub const GUARD_TIME_MS: u64 = 1000;

/// Interval between ring half-cycles, in milliseconds
pub const RING_INTERVAL_MS: u64 = 3000;

/// Give up a content dump after this long without progress, in milliseconds
pub const DUMP_STALL_TIMEOUT_MS: u64 = 10_000;

/// Minimum output headroom kept while writing packet bodies
pub const BODY_HEADROOM: usize = 5;
