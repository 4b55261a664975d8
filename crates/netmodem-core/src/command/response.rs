//! Result codes and their terminal text

/// Outcome of one directive, or of a whole line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    Error,
    Connect,
    NoAnswer,
    NoCarrier,
    /// No response at all
    Ignore,
    /// No response, and the line is not kept for `A/`
    IgnoreSpecial,
}

impl ResultCode {
    /// Verbose and numeric forms, for the codes sent as a plain line
    pub fn text(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Ok => Some(("OK", "0")),
            Self::Error => Some(("ERROR", "4")),
            Self::NoAnswer => Some(("NO ANSWER", "8")),
            Self::NoCarrier => Some(("NO CARRIER", "3")),
            Self::Connect | Self::Ignore | Self::IgnoreSpecial => None,
        }
    }

    pub fn is_error(&self) -> bool {
        *self == Self::Error
    }
}

impl From<bool> for ResultCode {
    fn from(ok: bool) -> Self {
        if ok {
            Self::Ok
        } else {
            Self::Error
        }
    }
}

/// `RING` line
pub const RING: (&str, &str) = ("RING", "2");

/// Numeric connect code for a line speed
pub fn connect_code(baud: u32) -> &'static str {
    match baud {
        0..=1199 => "1",
        1200..=2399 => "5",
        2400..=4799 => "10",
        4800..=7199 => "11",
        7200..=9599 => "24",
        9600..=11999 => "12",
        12000..=14399 => "25",
        14400..=19199 => "13",
        _ => "28",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_codes() {
        assert_eq!(connect_code(300), "1");
        assert_eq!(connect_code(1200), "5");
        assert_eq!(connect_code(9600), "12");
        assert_eq!(connect_code(115200), "28");
    }

    #[test]
    fn test_silent_codes() {
        assert_eq!(ResultCode::Ignore.text(), None);
        assert_eq!(ResultCode::Error.text(), Some(("ERROR", "4")));
    }
}
