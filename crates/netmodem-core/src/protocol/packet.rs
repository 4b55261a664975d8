//! Packet framing
//!
//! Every block of connection data sent to the terminal is preceded by a
//! text header naming the channel (connection id), the payload length and a
//! CRC8 of the payload. Four encodings exist, selected by S45:
//!
//! - `0` normal: `[ 3 40 171 ]`
//! - `1` hex: `[ 03 28 AB ]`, payload as hex digit pairs
//! - `2` decimal: every number on its own line, payload one byte per line
//! - `3` normal without checksum: `[ 3 40 ]`
//!
//! Every header ends with the configured line terminator.

use serde::{Deserialize, Serialize};

use super::{HeaderError, LineEnding};

/// Payload bytes per output row in hex mode
pub const HEX_ROW_BYTES: usize = 39;

/// On-wire encoding of headers and payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryType {
    Normal,
    Hex,
    Dec,
    NormalNoChk,
}

impl BinaryType {
    /// Map an S45 value to a binary type
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Normal),
            1 => Some(Self::Hex),
            2 => Some(Self::Dec),
            3 => Some(Self::NormalNoChk),
            _ => None,
        }
    }

    /// The S45 value of this binary type
    pub fn code(&self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Hex => 1,
            Self::Dec => 2,
            Self::NormalNoChk => 3,
        }
    }

    /// Whether the header carries a checksum field
    pub fn has_checksum(&self) -> bool {
        !matches!(self, Self::NormalNoChk)
    }
}

/// CRC8 as computed by the legacy modem ROM.
///
/// Polynomial 0x8C applied to the low bit first, initial value 0.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        let mut extract = byte;
        for _ in 0..8 {
            let sum = (crc ^ extract) & 0x01;
            crc >>= 1;
            if sum != 0 {
                crc ^= 0x8C;
            }
            extract >>= 1;
        }
    }
    crc
}

/// Format a packet header
pub fn header(bin_type: BinaryType, channel: u32, len: usize, crc: u8, eol: &LineEnding) -> Vec<u8> {
    let eol = eol.bytes();
    let mut out = Vec::with_capacity(24);
    match bin_type {
        BinaryType::Normal => {
            out.extend_from_slice(format!("[ {} {} {} ]", channel, len, crc).as_bytes());
        }
        BinaryType::Hex => {
            out.extend_from_slice(format!("[ {:02X} {:02X} {:02X} ]", channel, len, crc).as_bytes());
        }
        BinaryType::Dec => {
            out.push(b'[');
            for value in [channel as usize, len, crc as usize] {
                out.extend_from_slice(&eol);
                out.extend_from_slice(value.to_string().as_bytes());
            }
            out.extend_from_slice(&eol);
            out.push(b']');
        }
        BinaryType::NormalNoChk => {
            out.extend_from_slice(format!("[ {} {} ]", channel, len).as_bytes());
        }
    }
    out.extend_from_slice(&eol);
    out
}

/// A decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Connection id (0 for "no connection")
    pub channel: u32,
    /// Payload length in bytes
    pub len: usize,
    /// Checksum, absent for [`BinaryType::NormalNoChk`]
    pub crc: Option<u8>,
}

/// Parse a header produced by [`header`]
pub fn parse_header(data: &[u8], bin_type: BinaryType, eol: &LineEnding) -> Result<PacketHeader, HeaderError> {
    let eol_bytes = eol.bytes();
    let body = data
        .strip_suffix(eol_bytes.as_slice())
        .ok_or(HeaderError::Unterminated)?;
    let inner = body
        .strip_prefix(b"[")
        .and_then(|b| b.strip_suffix(b"]"))
        .ok_or(HeaderError::Unbracketed)?;

    let fields: Vec<&[u8]> = inner
        .split(|b| *b == b' ' || eol.is_terminator(*b))
        .filter(|f| !f.is_empty())
        .collect();

    let expected = if bin_type.has_checksum() { 3 } else { 2 };
    if fields.len() != expected {
        return Err(HeaderError::FieldCount {
            expected,
            found: fields.len(),
        });
    }

    let radix = if bin_type == BinaryType::Hex { 16 } else { 10 };
    let number = |field: &[u8]| -> Result<u64, HeaderError> {
        let text = String::from_utf8_lossy(field);
        u64::from_str_radix(&text, radix).map_err(|_| HeaderError::BadNumber(text.into_owned()))
    };

    let channel = number(fields[0])?;
    let channel = u32::try_from(channel).map_err(|_| HeaderError::OutOfRange(channel))?;
    let len = number(fields[1])?;
    let len = usize::try_from(len).map_err(|_| HeaderError::OutOfRange(len))?;
    let crc = if expected == 3 {
        let value = number(fields[2])?;
        Some(u8::try_from(value).map_err(|_| HeaderError::OutOfRange(value))?)
    } else {
        None
    };

    Ok(PacketHeader { channel, len, crc })
}

/// Incremental payload encoder.
///
/// Hex rows wrap every [`HEX_ROW_BYTES`] bytes, so the encoder keeps the
/// column across calls; callers feed one byte at a time while they wait for
/// serial headroom.
#[derive(Debug, Clone)]
pub struct BodyEncoder {
    bin_type: BinaryType,
    column: usize,
}

impl BodyEncoder {
    /// Create an encoder for the given binary type
    pub fn new(bin_type: BinaryType) -> Self {
        Self { bin_type, column: 0 }
    }

    /// Encode one payload byte into `out`
    pub fn push(&mut self, byte: u8, eol: &LineEnding, out: &mut Vec<u8>) {
        match self.bin_type {
            BinaryType::Normal | BinaryType::NormalNoChk => out.push(byte),
            BinaryType::Hex => {
                out.extend_from_slice(format!("{:02X}", byte).as_bytes());
                self.column += 1;
                if self.column >= HEX_ROW_BYTES {
                    out.extend_from_slice(&eol.bytes());
                    self.column = 0;
                }
            }
            BinaryType::Dec => {
                out.extend_from_slice(byte.to_string().as_bytes());
                out.extend_from_slice(&eol.bytes());
            }
        }
    }

    /// Close a partially filled hex row
    pub fn finish(&mut self, eol: &LineEnding, out: &mut Vec<u8>) {
        if self.column > 0 {
            out.extend_from_slice(&eol.bytes());
            self.column = 0;
        }
    }
}

/// Encode a whole payload
pub fn encode_body(bin_type: BinaryType, payload: &[u8], eol: &LineEnding) -> Vec<u8> {
    let mut encoder = BodyEncoder::new(bin_type);
    let mut out = Vec::with_capacity(payload.len() * 2);
    for &b in payload {
        encoder.push(b, eol, &mut out);
    }
    encoder.finish(eol, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_crc8_empty_is_zero() {
        assert_eq!(crc8(&[]), 0x00);
    }

    #[test]
    fn test_crc8_reference_values() {
        // Standard check value of the 0x8C (reflected 0x31) CRC8
        assert_eq!(crc8(b"123456789"), 0xA1);
        assert_eq!(crc8(&[0x01]), 0x5E);
    }

    #[test]
    fn test_header_normal() {
        let eol = LineEnding::default();
        assert_eq!(header(BinaryType::Normal, 3, 40, 171, &eol), b"[ 3 40 171 ]\r\n".to_vec());
    }

    #[test]
    fn test_header_hex() {
        let eol = LineEnding::default();
        assert_eq!(header(BinaryType::Hex, 3, 40, 171, &eol), b"[ 03 28 AB ]\r\n".to_vec());
    }

    #[test]
    fn test_header_dec() {
        let eol = LineEnding::default();
        assert_eq!(
            header(BinaryType::Dec, 1, 2, 3, &eol),
            b"[\r\n1\r\n2\r\n3\r\n]\r\n".to_vec()
        );
    }

    #[test]
    fn test_header_without_checksum() {
        let eol = LineEnding::default();
        assert_eq!(header(BinaryType::NormalNoChk, 7, 12, 99, &eol), b"[ 7 12 ]\r\n".to_vec());
    }

    #[test]
    fn test_parse_header_roundtrip_all_types() {
        let eol = LineEnding::default();
        for code in 0..4 {
            let bin_type = BinaryType::from_code(code).unwrap();
            let framed = header(bin_type, 12, 127, 0xE3, &eol);
            let parsed = parse_header(&framed, bin_type, &eol).unwrap();
            assert_eq!(parsed.channel, 12);
            assert_eq!(parsed.len, 127);
            let expected_crc = if bin_type.has_checksum() { Some(0xE3) } else { None };
            assert_eq!(parsed.crc, expected_crc);
        }
    }

    #[test]
    fn test_parse_header_rejects_garbage() {
        let eol = LineEnding::default();
        assert_eq!(
            parse_header(b"[ 1 2 3 ]", BinaryType::Normal, &eol),
            Err(HeaderError::Unterminated)
        );
        assert_eq!(
            parse_header(b"1 2 3\r\n", BinaryType::Normal, &eol),
            Err(HeaderError::Unbracketed)
        );
        assert_eq!(
            parse_header(b"[ 1 2 ]\r\n", BinaryType::Normal, &eol),
            Err(HeaderError::FieldCount { expected: 3, found: 2 })
        );
    }

    #[test]
    fn test_parse_header_rejects_oversized_fields() {
        let eol = LineEnding::default();
        assert_eq!(
            parse_header(b"[ 4294967296 2 3 ]\r\n", BinaryType::Normal, &eol),
            Err(HeaderError::OutOfRange(4_294_967_296))
        );
        assert_eq!(
            parse_header(b"[ 1 2 256 ]\r\n", BinaryType::Normal, &eol),
            Err(HeaderError::OutOfRange(256))
        );
        assert_eq!(
            parse_header(b"[ FFFFFFFF 10 FF ]\r\n", BinaryType::Hex, &eol),
            Ok(PacketHeader {
                channel: u32::MAX,
                len: 16,
                crc: Some(0xFF)
            })
        );
    }

    #[test]
    fn test_hex_body_wraps_rows() {
        let eol = LineEnding::default();
        let payload = vec![0xABu8; HEX_ROW_BYTES + 1];
        let body = encode_body(BinaryType::Hex, &payload, &eol);
        let expected_len = (HEX_ROW_BYTES + 1) * 2 + 2 * 2;
        assert_eq!(body.len(), expected_len);
        assert_eq!(&body[HEX_ROW_BYTES * 2..HEX_ROW_BYTES * 2 + 2], b"\r\n");
    }

    #[test]
    fn test_dec_body_one_byte_per_line() {
        let eol = LineEnding::default();
        assert_eq!(encode_body(BinaryType::Dec, &[65, 0], &eol), b"65\r\n0\r\n".to_vec());
    }

    #[test]
    fn test_raw_body_passthrough() {
        let eol = LineEnding::default();
        assert_eq!(encode_body(BinaryType::Normal, b"hi\r\n", &eol), b"hi\r\n".to_vec());
    }
}
