//! PETSCII translation
//!
//! The target machines use PETSCII, where the lowercase/uppercase letter
//! blocks sit at different code points than in ASCII.

/// ASCII byte to PETSCII
pub fn ascii_to_petscii(c: u8) -> u8 {
    match c {
        b'a'..=b'z' => c - 0x20,
        b'A'..=b'Z' => c + 0x80,
        0x08 | 0x7F => 0x14,
        _ => c,
    }
}

/// PETSCII byte to ASCII
pub fn petscii_to_ascii(c: u8) -> u8 {
    match c {
        0x41..=0x5A => c + 0x20,
        0x61..=0x7A => c - 0x20,
        0xC1..=0xDA => c - 0x80,
        0x14 => 0x08,
        _ => c,
    }
}

/// Stateful ASCII to PETSCII conversion for network streams.
///
/// PETSCII terminals end lines with a bare CR, so the LF of a CR LF pair is
/// dropped and a lone LF becomes CR.
#[derive(Debug, Clone, Default)]
pub struct PetsciiEncoder {
    last_cr: bool,
}

impl PetsciiEncoder {
    /// Convert one byte; `None` means the byte is dropped
    pub fn encode(&mut self, c: u8) -> Option<u8> {
        let was_cr = self.last_cr;
        self.last_cr = c == b'\r';
        match c {
            b'\n' if was_cr => None,
            b'\n' => Some(b'\r'),
            _ => Some(ascii_to_petscii(c)),
        }
    }

    /// Convert a buffer
    pub fn encode_all(&mut self, data: &[u8]) -> Vec<u8> {
        data.iter().filter_map(|&c| self.encode(c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letter_case_swap() {
        assert_eq!(ascii_to_petscii(b'a'), 0x41);
        assert_eq!(ascii_to_petscii(b'A'), 0xC1);
        assert_eq!(petscii_to_ascii(0x41), b'a');
        assert_eq!(petscii_to_ascii(0xC1), b'A');
    }

    #[test]
    fn test_roundtrip_printable_ascii() {
        for c in 0x20u8..0x7F {
            assert_eq!(petscii_to_ascii(ascii_to_petscii(c)), c, "byte {c:#04x}");
        }
    }

    #[test]
    fn test_encoder_line_endings() {
        let mut enc = PetsciiEncoder::default();
        assert_eq!(enc.encode_all(b"ok\r\nno\n"), vec![0x4F, 0x4B, b'\r', 0x4E, 0x4F, b'\r']);
    }
}
