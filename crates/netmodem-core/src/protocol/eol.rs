//! End-of-line handling
//!
//! The terminal picks one of four line terminators (`ATR0`..`ATR3`), and the
//! carriage-return / line-feed byte values themselves can be remapped through
//! S3 and S4.

use serde::{Deserialize, Serialize};

/// Which terminator sequence is emitted after every response line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EolStyle {
    /// CR only (`ATR0`)
    Cr,
    /// CR LF (`ATR1`, default)
    CrLf,
    /// LF CR (`ATR2`)
    LfCr,
    /// LF only (`ATR3`)
    Lf,
}

impl EolStyle {
    /// Map an `ATR` argument to a style
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Cr),
            1 => Some(Self::CrLf),
            2 => Some(Self::LfCr),
            3 => Some(Self::Lf),
            _ => None,
        }
    }

    /// The `ATR` argument selecting this style
    pub fn code(&self) -> u8 {
        match self {
            Self::Cr => 0,
            Self::CrLf => 1,
            Self::LfCr => 2,
            Self::Lf => 3,
        }
    }
}

/// Line terminator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEnding {
    /// Selected sequence
    pub style: EolStyle,
    /// Byte used as carriage return (S3)
    pub cr: u8,
    /// Byte used as line feed (S4)
    pub lf: u8,
}

impl Default for LineEnding {
    fn default() -> Self {
        Self {
            style: EolStyle::CrLf,
            cr: b'\r',
            lf: b'\n',
        }
    }
}

impl LineEnding {
    /// Terminator bytes
    pub fn bytes(&self) -> Vec<u8> {
        match self.style {
            EolStyle::Cr => vec![self.cr],
            EolStyle::CrLf => vec![self.cr, self.lf],
            EolStyle::LfCr => vec![self.lf, self.cr],
            EolStyle::Lf => vec![self.lf],
        }
    }

    /// True if `byte` is one of the configured terminator bytes
    pub fn is_terminator(&self, byte: u8) -> bool {
        byte == self.cr || byte == self.lf
    }

    /// Serialized form used in the saved configuration record
    pub fn to_record(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }

    /// Recover a line ending from its saved form, keeping remapped bytes
    pub fn from_record(record: &str) -> Option<Self> {
        let b = record.as_bytes();
        let (style, cr, lf) = match b.len() {
            1 if b[0] == b'\n' => (EolStyle::Lf, b'\r', b[0]),
            1 => (EolStyle::Cr, b[0], b'\n'),
            2 if b[0] == b'\n' => (EolStyle::LfCr, b[1], b[0]),
            2 => (EolStyle::CrLf, b[0], b[1]),
            _ => return None,
        };
        Some(Self { style, cr, lf })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_crlf() {
        assert_eq!(LineEnding::default().bytes(), b"\r\n".to_vec());
    }

    #[test]
    fn test_remapped_bytes() {
        let eol = LineEnding {
            style: EolStyle::LfCr,
            cr: b'!',
            lf: b'?',
        };
        assert_eq!(eol.bytes(), b"?!".to_vec());
        assert!(eol.is_terminator(b'!'));
        assert!(!eol.is_terminator(b'\r'));
    }

    #[test]
    fn test_record_roundtrip() {
        for code in 0..4 {
            let eol = LineEnding {
                style: EolStyle::from_code(code).unwrap(),
                ..Default::default()
            };
            assert_eq!(LineEnding::from_record(&eol.to_record()), Some(eol));
        }
        assert_eq!(LineEnding::from_record(""), None);
    }
}
