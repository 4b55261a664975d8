//! Modem settings and their saved form
//!
//! Settings are persisted through the [`ConfigStore`](crate::ports::ConfigStore)
//! as one comma-separated record under [`CONFIG_RECORD`]. The first 38
//! fields keep the layout older firmware wrote; four extension fields carry
//! the global transform settings and packet size. Listeners preserved with
//! `S60=1` go to [`LISTENERS_RECORD`] as JSON.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::connection::ConnFlags;
use crate::flow::FlowControlMode;
use crate::ports::{DataBits, Parity, StaticIps, StopBits};
use crate::protocol::{BinaryType, ConfigError, LineEnding, DEFAULT_BAUD_RATE, DEFAULT_PACKET_SIZE};
use crate::serial::{PinConfig, PinMode};
use crate::transform::ByteSet;

/// Store name of the settings record
pub const CONFIG_RECORD: &str = "config";

/// Store name of the preserved listener list
pub const LISTENERS_RECORD: &str = "listeners";

/// Fields written by older firmware
pub const LEGACY_FIELDS: usize = 38;

/// Fields written now
pub const RECORD_FIELDS: usize = 42;

/// Time zone field value meaning "clock disabled"
pub const CLOCK_DISABLED: &str = "999";

mod field {
    pub const SSID: usize = 0;
    pub const PASSWORD: usize = 1;
    pub const BAUD: usize = 2;
    pub const EOL: usize = 3;
    pub const FLOW: usize = 4;
    pub const ECHO: usize = 5;
    pub const SUPPRESS: usize = 6;
    pub const NUMERIC: usize = 7;
    pub const LONG: usize = 8;
    pub const PETSCII: usize = 9;
    pub const DCD_MODE: usize = 10;
    pub const UART: usize = 11;
    pub const CTS_MODE: usize = 12;
    pub const RTS_MODE: usize = 13;
    pub const DCD_PIN: usize = 14;
    pub const CTS_PIN: usize = 15;
    pub const RTS_PIN: usize = 16;
    pub const RINGS: usize = 17;
    pub const STREAM: usize = 18;
    pub const LISTEN: usize = 19;
    pub const RI_MODE: usize = 20;
    pub const DTR_MODE: usize = 21;
    pub const DSR_MODE: usize = 22;
    pub const RI_PIN: usize = 23;
    pub const DTR_PIN: usize = 24;
    pub const DSR_PIN: usize = 25;
    pub const TIME_ZONE: usize = 26;
    pub const TIME_FORMAT: usize = 27;
    pub const TIME_HOST: usize = 28;
    pub const HOSTNAME: usize = 29;
    pub const PRINT_DELAY: usize = 30;
    pub const PRINT_SPEC: usize = 31;
    pub const TERM_TYPE: usize = 32;
    pub const STATIC_IP: usize = 33;
    pub const STATIC_DNS: usize = 34;
    pub const STATIC_GW: usize = 35;
    pub const STATIC_SN: usize = 36;
    pub const BUSY_MSG: usize = 37;
    pub const DELIMITERS: usize = 38;
    pub const MASKS: usize = 39;
    pub const PROGRAM: usize = 40;
    pub const PACKET_SIZE: usize = 41;

    /// Fields stored as hex pairs
    pub const HEX: [usize; 11] = [
        SSID,
        PASSWORD,
        TIME_FORMAT,
        TIME_HOST,
        HOSTNAME,
        PRINT_SPEC,
        TERM_TYPE,
        BUSY_MSG,
        DELIMITERS,
        MASKS,
        PROGRAM,
    ];
}

/// Serial frame format, written as `8N1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartFormat {
    pub data_bits: u8,
    /// `N`, `O`, `E` or `M`
    pub parity: char,
    pub stop_bits: u8,
}

impl Default for UartFormat {
    fn default() -> Self {
        Self {
            data_bits: 8,
            parity: 'N',
            stop_bits: 1,
        }
    }
}

impl UartFormat {
    /// Build from `ATB` parts; `None` if any is out of range
    pub fn new(data_bits: u8, parity: char, stop_bits: u8) -> Option<Self> {
        let parity = parity.to_ascii_uppercase();
        let valid = (5..=8).contains(&data_bits) && matches!(parity, 'N' | 'O' | 'E' | 'M') && matches!(stop_bits, 1 | 2);
        valid.then_some(Self {
            data_bits,
            parity,
            stop_bits,
        })
    }

    /// The format as `serialport` takes it; mark parity has no equivalent
    /// and runs without parity
    pub fn to_serial(&self) -> (DataBits, Parity, StopBits) {
        let data = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let parity = match self.parity {
            'O' => Parity::Odd,
            'E' => Parity::Even,
            _ => Parity::None,
        };
        let stop = if self.stop_bits == 2 { StopBits::Two } else { StopBits::One };
        (data, parity, stop)
    }
}

impl fmt::Display for UartFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.data_bits, self.parity, self.stop_bits)
    }
}

impl FromStr for UartFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let b = s.trim().as_bytes();
        if b.len() != 3 || !b[0].is_ascii_digit() || !b[2].is_ascii_digit() {
            return Err(());
        }
        Self::new(b[0] - b'0', b[1] as char, b[2] - b'0').ok_or(())
    }
}

/// Everything `AT&W` saves and `ATZ` restores, plus the session-only
/// registers `ATZ` resets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModemSettings {
    /// WiFi network name
    pub ssid: String,

    /// WiFi password
    pub password: String,

    /// Serial baud rate
    pub baud: u32,

    /// Serial frame format
    pub uart: UartFormat,

    /// Response line terminator
    pub eol: LineEnding,

    /// Flow-control discipline
    pub flow: FlowControlMode,

    /// Echo command input (`E`)
    pub echo: bool,

    /// Suppress result codes (`Q`)
    pub suppress_responses: bool,

    /// Numeric result codes (`V0`)
    pub numeric_responses: bool,

    /// Extended result codes (`X`)
    pub long_responses: bool,

    /// PETSCII terminal (`&P`)
    pub petscii: bool,

    /// Signal polarity and pin numbers
    pub pins: PinConfig,

    /// Rings before auto-answer (S0); 0 leaves calls for `ATA`
    pub rings: i64,

    /// Auto-stream answered calls (S41)
    pub auto_stream: i64,

    /// Keep listeners across `ATZ` (S60)
    pub preserve_listeners: bool,

    /// Clock zone; empty leaves the service default
    pub time_zone: String,
    pub time_disabled: bool,
    pub time_format: String,
    pub time_host: String,

    /// Network host name (`&S40`)
    pub hostname: String,

    /// Printer timeout in milliseconds
    pub print_timeout_ms: u64,

    /// Last `AT+PRINT` spec
    pub print_spec: String,

    /// Terminal type reported to telnet peers (`&S41`)
    pub term_type: String,

    /// Static addressing, when configured
    pub static_ips: Option<StaticIps>,

    /// Sent to callers who ring while a connection is streaming (`&S42`)
    pub busy_msg: String,

    /// Global delimiter set (`&D`)
    pub delimiters: ByteSet,

    /// Global mask-out set (`&M`)
    pub masks: ByteSet,

    /// Global substitution program text (`&Y`)
    pub program: String,

    /// Packet payload size (S40)
    pub packet_size: usize,

    /// Escape character (S2)
    #[serde(skip, default = "default_escape_char")]
    pub escape_char: u8,

    /// Backspace character (S5)
    #[serde(skip, default = "default_backspace")]
    pub backspace: u8,

    /// Baud while streaming (S43), 0 when unused
    #[serde(skip)]
    pub temp_baud: u32,

    /// Inter-byte serial delay in milliseconds (S44)
    #[serde(skip)]
    pub serial_delay_ms: u64,

    /// Packet encoding (S45)
    #[serde(skip, default = "default_binary_type")]
    pub binary_type: BinaryType,
}

fn default_escape_char() -> u8 {
    b'+'
}

fn default_backspace() -> u8 {
    8
}

fn default_binary_type() -> BinaryType {
    BinaryType::Normal
}

impl Default for ModemSettings {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            baud: DEFAULT_BAUD_RATE,
            uart: UartFormat::default(),
            eol: LineEnding::default(),
            flow: FlowControlMode::default(),
            echo: true,
            suppress_responses: false,
            numeric_responses: false,
            long_responses: true,
            petscii: false,
            pins: PinConfig::default(),
            rings: 1,
            auto_stream: 0,
            preserve_listeners: false,
            time_zone: String::new(),
            time_disabled: false,
            time_format: String::new(),
            time_host: String::new(),
            hostname: String::new(),
            print_timeout_ms: 5000,
            print_spec: String::new(),
            term_type: String::new(),
            static_ips: None,
            busy_msg: String::new(),
            delimiters: ByteSet::default(),
            masks: ByteSet::default(),
            program: String::new(),
            packet_size: DEFAULT_PACKET_SIZE,
            escape_char: default_escape_char(),
            backspace: default_backspace(),
            temp_baud: 0,
            serial_delay_ms: 0,
            binary_type: default_binary_type(),
        }
    }
}

/// Uppercase hex pairs
pub fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Decode hex pairs, either case
pub fn from_hex(text: &str) -> Option<Vec<u8>> {
    let b = text.as_bytes();
    if b.len() % 2 != 0 {
        return None;
    }
    b.chunks(2)
        .map(|pair| std::str::from_utf8(pair).ok().and_then(|s| u8::from_str_radix(s, 16).ok()))
        .collect()
}

fn parse_num<T: FromStr>(fields: &[String], idx: usize) -> Result<T, ConfigError> {
    fields[idx].trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: idx,
        value: fields[idx].clone(),
    })
}

fn parse_flag(fields: &[String], idx: usize) -> Result<bool, ConfigError> {
    Ok(parse_num::<i64>(fields, idx)? != 0)
}

fn parse_pin_mode(fields: &[String], idx: usize) -> Result<PinMode, ConfigError> {
    let code: i64 = parse_num(fields, idx)?;
    PinMode::from_code(code).ok_or_else(|| ConfigError::InvalidValue {
        field: idx,
        value: fields[idx].clone(),
    })
}

fn bool_field(b: bool) -> String {
    u8::from(b).to_string()
}

impl ModemSettings {
    /// The saved-record form of these settings
    pub fn to_record(&self) -> String {
        let hex = |s: &str| to_hex(s.as_bytes());
        let statics = self.static_ips.clone().unwrap_or(StaticIps {
            ip: String::new(),
            dns: String::new(),
            gateway: String::new(),
            subnet: String::new(),
        });
        let fields: [String; RECORD_FIELDS] = [
            hex(&self.ssid),
            hex(&self.password),
            self.baud.to_string(),
            self.eol.to_record(),
            self.flow.code().to_string(),
            bool_field(self.echo),
            bool_field(self.suppress_responses),
            bool_field(self.numeric_responses),
            bool_field(self.long_responses),
            bool_field(self.petscii),
            self.pins.dcd.code().to_string(),
            self.uart.to_string(),
            self.pins.cts.code().to_string(),
            self.pins.rts.code().to_string(),
            self.pins.pins[0].to_string(),
            self.pins.pins[1].to_string(),
            self.pins.pins[2].to_string(),
            self.rings.to_string(),
            self.auto_stream.to_string(),
            bool_field(self.preserve_listeners),
            self.pins.ri.code().to_string(),
            self.pins.dtr.code().to_string(),
            self.pins.dsr.code().to_string(),
            self.pins.pins[3].to_string(),
            self.pins.pins[4].to_string(),
            self.pins.pins[5].to_string(),
            if self.time_disabled {
                CLOCK_DISABLED.to_string()
            } else {
                self.time_zone.clone()
            },
            hex(&self.time_format),
            hex(&self.time_host),
            hex(&self.hostname),
            self.print_timeout_ms.to_string(),
            hex(&self.print_spec),
            hex(&self.term_type),
            statics.ip,
            statics.dns,
            statics.gateway,
            statics.subnet,
            hex(&self.busy_msg),
            to_hex(self.delimiters.as_slice()),
            to_hex(self.masks.as_slice()),
            hex(&self.program),
            self.packet_size.to_string(),
        ];
        fields.join(",")
    }

    /// Defaults overlaid with every non-empty field of `record`
    pub fn from_record(record: &str) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        settings.overlay_record(record)?;
        Ok(settings)
    }

    /// Overlay the non-empty fields of `record`.
    ///
    /// Short records (older firmware) leave the missing fields alone. A
    /// malformed field fails the whole overlay and changes nothing.
    pub fn overlay_record(&mut self, record: &str) -> Result<(), ConfigError> {
        let mut fields: Vec<String> = record.trim_end_matches(['\r', '\n']).split(',').map(str::to_string).collect();
        fields.resize(RECORD_FIELDS, String::new());
        for idx in field::HEX {
            let decoded = from_hex(&fields[idx]).ok_or(ConfigError::BadHex { field: idx })?;
            fields[idx] = String::from_utf8_lossy(&decoded).into_owned();
        }
        // Byte sets may hold arbitrary values, decode them again untouched
        let delimiters = from_hex(&record_field(record, field::DELIMITERS)).unwrap_or_default();
        let masks = from_hex(&record_field(record, field::MASKS)).unwrap_or_default();

        let mut next = self.clone();
        let set = |idx: usize| !fields[idx].is_empty();

        if set(field::SSID) {
            next.ssid = fields[field::SSID].clone();
        }
        if set(field::PASSWORD) {
            next.password = fields[field::PASSWORD].clone();
        }
        if set(field::BAUD) {
            let baud: u32 = parse_num(&fields, field::BAUD)?;
            next.baud = if baud == 0 { DEFAULT_BAUD_RATE } else { baud };
        }
        if set(field::EOL) {
            next.eol = LineEnding::from_record(&fields[field::EOL]).ok_or_else(|| ConfigError::InvalidValue {
                field: field::EOL,
                value: fields[field::EOL].clone(),
            })?;
        }
        if set(field::FLOW) {
            let code: i64 = parse_num(&fields, field::FLOW)?;
            next.flow = FlowControlMode::from_code(code).unwrap_or(FlowControlMode::Disabled);
        }
        if set(field::ECHO) {
            next.echo = parse_flag(&fields, field::ECHO)?;
        }
        if set(field::SUPPRESS) {
            next.suppress_responses = parse_flag(&fields, field::SUPPRESS)?;
        }
        if set(field::NUMERIC) {
            next.numeric_responses = parse_flag(&fields, field::NUMERIC)?;
        }
        if set(field::LONG) {
            next.long_responses = parse_flag(&fields, field::LONG)?;
        }
        if set(field::PETSCII) {
            next.petscii = parse_flag(&fields, field::PETSCII)?;
        }
        if set(field::UART) {
            next.uart = fields[field::UART].parse().map_err(|_| ConfigError::InvalidValue {
                field: field::UART,
                value: fields[field::UART].clone(),
            })?;
        }
        for (idx, slot) in [
            (field::DCD_MODE, &mut next.pins.dcd),
            (field::CTS_MODE, &mut next.pins.cts),
            (field::RTS_MODE, &mut next.pins.rts),
            (field::RI_MODE, &mut next.pins.ri),
            (field::DTR_MODE, &mut next.pins.dtr),
            (field::DSR_MODE, &mut next.pins.dsr),
        ] {
            if set(idx) {
                *slot = parse_pin_mode(&fields, idx)?;
            }
        }
        for (n, idx) in [
            field::DCD_PIN,
            field::CTS_PIN,
            field::RTS_PIN,
            field::RI_PIN,
            field::DTR_PIN,
            field::DSR_PIN,
        ]
        .into_iter()
        .enumerate()
        {
            if set(idx) {
                next.pins.pins[n] = parse_num(&fields, idx)?;
            }
        }
        if set(field::RINGS) {
            next.rings = parse_num(&fields, field::RINGS)?;
        }
        if set(field::STREAM) {
            next.auto_stream = parse_num(&fields, field::STREAM)?;
        }
        if set(field::LISTEN) {
            next.preserve_listeners = parse_flag(&fields, field::LISTEN)?;
        }
        if set(field::TIME_ZONE) {
            if fields[field::TIME_ZONE] == CLOCK_DISABLED {
                next.time_disabled = true;
            } else {
                next.time_disabled = false;
                next.time_zone = fields[field::TIME_ZONE].clone();
            }
        }
        if set(field::TIME_FORMAT) {
            next.time_format = fields[field::TIME_FORMAT].clone();
        }
        if set(field::TIME_HOST) {
            next.time_host = fields[field::TIME_HOST].clone();
        }
        if set(field::HOSTNAME) {
            next.hostname = fields[field::HOSTNAME].clone();
        }
        if set(field::PRINT_DELAY) {
            next.print_timeout_ms = parse_num(&fields, field::PRINT_DELAY)?;
        }
        if set(field::PRINT_SPEC) {
            next.print_spec = fields[field::PRINT_SPEC].clone();
        }
        if set(field::TERM_TYPE) {
            next.term_type = fields[field::TERM_TYPE].clone();
        }
        let statics = [
            field::STATIC_IP,
            field::STATIC_DNS,
            field::STATIC_GW,
            field::STATIC_SN,
        ];
        if statics.iter().all(|&idx| set(idx)) {
            next.static_ips = Some(StaticIps {
                ip: fields[field::STATIC_IP].clone(),
                dns: fields[field::STATIC_DNS].clone(),
                gateway: fields[field::STATIC_GW].clone(),
                subnet: fields[field::STATIC_SN].clone(),
            });
        }
        if set(field::BUSY_MSG) {
            next.busy_msg = fields[field::BUSY_MSG].clone();
        }
        if !delimiters.is_empty() {
            next.delimiters = ByteSet::from_bytes(&delimiters);
        }
        if !masks.is_empty() {
            next.masks = ByteSet::from_bytes(&masks);
        }
        if set(field::PROGRAM) {
            next.program = fields[field::PROGRAM].clone();
        }
        if set(field::PACKET_SIZE) {
            let size: usize = parse_num(&fields, field::PACKET_SIZE)?;
            if size > 0 {
                next.packet_size = size;
            }
        }

        *self = next;
        Ok(())
    }
}

fn record_field(record: &str, idx: usize) -> String {
    record
        .trim_end_matches(['\r', '\n'])
        .split(',')
        .nth(idx)
        .unwrap_or_default()
        .to_string()
}

/// A listener kept across `ATZ` with `S60=1`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedListener {
    pub port: u16,
    pub flags: ConnFlags,
    #[serde(default)]
    pub delimiters: ByteSet,
    #[serde(default)]
    pub masks: ByteSet,
    /// Substitution program text
    #[serde(default)]
    pub program: String,
}

pub fn listeners_to_json(listeners: &[SavedListener]) -> Result<String, ConfigError> {
    serde_json::to_string_pretty(listeners).map_err(|e| ConfigError::Storage(e.to_string()))
}

pub fn listeners_from_json(json: &str) -> Result<Vec<SavedListener>, ConfigError> {
    serde_json::from_str(json).map_err(|e| ConfigError::Storage(e.to_string()))
}
