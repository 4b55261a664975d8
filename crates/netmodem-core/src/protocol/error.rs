//! Protocol errors

use thiserror::Error;

/// Errors raised inside the engine before they are folded into a result code
#[derive(Error, Debug)]
pub enum ModemError {
    #[error("Serial line error: {0}")]
    SerialError(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("No current connection")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Cannot listen on port {port}: {reason}")]
    ListenFailed { port: u16, reason: String },

    #[error("CRC mismatch: expected {expected}, got {actual}")]
    CrcMismatch { expected: u8, actual: u8 },

    #[error("Invalid substitution program: {0}")]
    Program(#[from] ProgramError),

    #[error("Invalid packet header: {0}")]
    Header(#[from] HeaderError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Transfer aborted by terminal")]
    Aborted,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors decoding a substitution program
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProgramError {
    #[error("program length {0} is not a multiple of the rule width")]
    BadLength(usize),

    #[error("rule {rule}: bad match byte")]
    BadMatch { rule: usize },

    #[error("rule {rule}: unknown action '{action}'")]
    BadAction { rule: usize, action: char },

    #[error("rule {rule}: bad replacement byte")]
    BadReplacement { rule: usize },

    #[error("rule {rule}: bad next-rule index")]
    BadNext { rule: usize },
}

/// Errors parsing a framed packet header
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header is not enclosed in brackets")]
    Unbracketed,

    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("bad number '{0}'")]
    BadNumber(String),

    #[error("field value {0} out of range")]
    OutOfRange(u64),

    #[error("missing end-of-line terminator")]
    Unterminated,
}

/// Errors loading or applying the saved configuration record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("field {field} is not valid hex")]
    BadHex { field: usize },

    #[error("field {field} has invalid value '{value}'")]
    InvalidValue { field: usize, value: String },

    #[error("storage error: {0}")]
    Storage(String),
}
