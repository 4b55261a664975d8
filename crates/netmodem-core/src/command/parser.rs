//! AT line tokenizer
//!
//! Splits everything after the `AT` prefix into [`Directive`]s. The parser
//! is lazy so a directive that fails stops the line before anything after it
//! is even looked at.

/// Letters whose argument may be preceded by connection modifiers
const MODIFIER_COMMANDS: &[u8] = b"dcpatw";

/// Characters allowed in a modifier string
const MODIFIERS: &[u8] = b",exprts+";

/// One command letter with its argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// Lowercased command letter (`&`, `%`, `+` and `$` included)
    pub letter: u8,
    /// Lowercased sub-command letter of `&` and `%`
    pub sub: Option<u8>,
    /// Lowercased modifiers, for `d c p a t w`
    pub modifiers: String,
    /// Raw argument bytes, quotes removed
    pub arg: Vec<u8>,
    /// Argument is all digits with at most a leading `-`
    pub numeric: bool,
    /// Numeric value; 0 when not numeric or empty
    pub value: i64,
}

impl Directive {
    pub fn arg_str(&self) -> String {
        String::from_utf8_lossy(&self.arg).into_owned()
    }

    pub fn has_modifier(&self, m: char) -> bool {
        self.modifiers.contains(m)
    }
}

/// Position of the first case-insensitive `AT`, if any
pub fn find_at(line: &[u8]) -> Option<usize> {
    line.windows(2)
        .position(|w| w[0].eq_ignore_ascii_case(&b'a') && w[1].eq_ignore_ascii_case(&b't'))
}

fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Digits with an optional single leading minus; empty counts as numeric
pub fn is_numeric(arg: &[u8]) -> bool {
    let digits = arg.strip_prefix(b"-").unwrap_or(arg);
    if arg.len() == 1 && arg[0] == b'-' {
        return false;
    }
    digits.iter().all(u8::is_ascii_digit)
}

/// Saturating decimal parse of a numeric argument
pub fn numeric_value(arg: &[u8]) -> i64 {
    let (negative, digits) = match arg.strip_prefix(b"-") {
        Some(rest) => (true, rest),
        None => (false, arg),
    };
    let magnitude = digits
        .iter()
        .fold(0i64, |acc, &d| acc.saturating_mul(10).saturating_add(i64::from(d - b'0')));
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

/// Iterator over the directives of one command line
pub struct Parser<'a> {
    line: &'a [u8],
    index: usize,
}

impl<'a> Parser<'a> {
    /// Parser positioned after the `AT` prefix, or `None` if the line has none
    pub fn new(line: &'a [u8]) -> Option<Self> {
        find_at(line).map(|at| Self { line, index: at + 2 })
    }

    fn skip_blanks(&mut self) {
        while self.index < self.line.len() && is_blank(self.line[self.index]) {
            self.index += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.line.get(self.index).copied()
    }

    /// Read a quoted string starting at the opening quote
    fn quoted(&mut self) -> Vec<u8> {
        self.index += 1;
        let start = self.index;
        while self.index < self.line.len() {
            let b = self.line[self.index];
            if b == b'"' && self.line[self.index - 1] != b'\\' {
                break;
            }
            self.index += 1;
        }
        let arg = self.line[start..self.index].to_vec();
        if self.index < self.line.len() {
            self.index += 1;
        }
        arg
    }

    fn rest(&mut self) -> Vec<u8> {
        let arg = self.line[self.index..].to_vec();
        self.index = self.line.len();
        arg
    }
}

impl Iterator for Parser<'_> {
    type Item = Directive;

    fn next(&mut self) -> Option<Directive> {
        self.skip_blanks();
        let letter = self.peek()?.to_ascii_lowercase();
        self.index += 1;

        let mut sub = None;
        let mut modifiers = String::new();
        let mut quoted = false;
        let arg;

        if letter == b'+' || letter == b'$' {
            arg = self.rest();
        } else {
            if letter == b'&' || letter == b'%' {
                if let Some(s) = self.peek() {
                    sub = Some(s.to_ascii_lowercase());
                    self.index += 1;
                }
            }
            self.skip_blanks();
            match self.peek() {
                None => arg = Vec::new(),
                Some(b'"') => {
                    quoted = true;
                    arg = self.quoted();
                }
                Some(_) if sub.is_none() && MODIFIER_COMMANDS.contains(&letter) => {
                    while let Some(b) = self.peek() {
                        let lower = b.to_ascii_lowercase();
                        if !MODIFIERS.contains(&lower) {
                            break;
                        }
                        modifiers.push(lower as char);
                        self.index += 1;
                    }
                    self.skip_blanks();
                    if self.peek() == Some(b'"') {
                        quoted = true;
                        arg = self.quoted();
                    } else {
                        arg = self.rest();
                    }
                }
                Some(_) => {
                    let start = self.index;
                    while let Some(b) = self.peek() {
                        if b.is_ascii_alphabetic() || b == b'&' || b == b'%' || b == b' ' {
                            break;
                        }
                        self.index += 1;
                    }
                    arg = self.line[start..self.index].to_vec();
                }
            }
        }

        let numeric = !quoted && is_numeric(&arg);
        let value = if numeric { numeric_value(&arg) } else { 0 };
        Some(Directive {
            letter,
            sub,
            modifiers,
            arg,
            numeric,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(line: &str) -> Vec<Directive> {
        Parser::new(line.as_bytes()).map(|p| p.collect()).unwrap_or_default()
    }

    #[test]
    fn test_prefix_ignored_before_at() {
        let d = parse("xxATE0");
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].letter, b'e');
        assert!(d[0].numeric);
        assert_eq!(d[0].value, 0);
        assert!(Parser::new(b"hello").is_none());
    }

    #[test]
    fn test_several_directives() {
        let d = parse("at e1 v0 x1 s0=2");
        let letters: Vec<u8> = d.iter().map(|x| x.letter).collect();
        assert_eq!(letters, b"evxs".to_vec());
        assert_eq!(d[3].arg, b"0=2".to_vec());
        assert!(!d[3].numeric);
    }

    #[test]
    fn test_ampersand_sub_command() {
        let d = parse("AT&K3&Y\"0d-d-00\"");
        assert_eq!(d[0].letter, b'&');
        assert_eq!(d[0].sub, Some(b'k'));
        assert_eq!(d[0].value, 3);
        assert_eq!(d[1].sub, Some(b'y'));
        assert_eq!(d[1].arg, b"0d-d-00".to_vec());
        assert!(!d[1].numeric);
    }

    #[test]
    fn test_dial_modifiers_and_rest_of_line() {
        let d = parse("ATD,EP host.example.com:23");
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].modifiers, ",ep");
        assert_eq!(d[0].arg_str(), "host.example.com:23");
        assert!(d[0].has_modifier('p'));
    }

    #[test]
    fn test_quoted_keeps_escaped_quote() {
        let d = parse(r#"ATT"say \"hi\""E0"#);
        assert_eq!(d[0].arg_str(), r#"say \"hi\""#);
        assert_eq!(d[1].letter, b'e');
    }

    #[test]
    fn test_plus_takes_rest() {
        let d = parse("AT+PRINT:x E0");
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].arg_str(), "PRINT:x E0");
    }

    #[test]
    fn test_negative_numbers() {
        let d = parse("ATL-1");
        assert!(d[0].numeric);
        assert_eq!(d[0].value, -1);
        assert!(!is_numeric(b"-"));
        assert!(!is_numeric(b"1-2"));
        assert_eq!(numeric_value(b"99999999999999999999999"), i64::MAX);
    }
}
