//! McLennan PM-series / SCL stepper controller protocol definitions
//!
//! Protocol Overview:
//! - Format: ASCII command/response over RS-232
//! - Commands: `{axis}{COMMAND}{integer}` e.g. `3MA6400` (axis 3, move absolute, 6400 steps)
//! - Replies are prefixed with the axis address (`03:` on PM600/PM1000,
//!   `03#` on PM341, nothing on PM304, `3` on SCL drives)
//! - PM1000 echoes every command line before replying
//!
//! This module is pure: framing and parsing only, no I/O.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

/// Command mnemonics understood by the controllers (sent upper-cased).
pub mod mnemonic {
    /// Move absolute
    pub const MOVE_ABSOLUTE: &str = "ma";
    /// Move relative
    pub const MOVE_RELATIVE: &str = "mr";
    /// SCL feed to position
    pub const FEED_TO_POSITION: &str = "fp";
    /// SCL feed to length
    pub const FEED_TO_LENGTH: &str = "fl";
    /// Output commanded position
    pub const OUTPUT_COMMAND: &str = "oc";
    /// Output actual position
    pub const OUTPUT_ACTUAL: &str = "oa";
    /// SCL immediate encoder position
    pub const IMMEDIATE_ENCODER: &str = "ie";
    /// Stop
    pub const STOP: &str = "st";
    /// Reset after abort
    pub const RESET: &str = "rs";
    /// Define commanded position
    pub const COMMAND_POSITION: &str = "cp";
    /// Define actual position
    pub const ACTUAL_POSITION: &str = "ap";
    /// Lower soft limit
    pub const LOWER_LIMIT: &str = "ll";
    /// Upper soft limit
    pub const UPPER_LIMIT: &str = "ul";
    /// Allow soft limits
    pub const ALLOW_LIMITS: &str = "al";
    /// Inhibit soft limits
    pub const INHIBIT_LIMITS: &str = "il";
    /// Set slew velocity
    pub const SLEW_VELOCITY: &str = "sv";
    /// SCL velocity
    pub const VELOCITY: &str = "ve";
    /// SCL encoder resolution
    pub const ENCODER_RESOLUTION: &str = "er";
    /// Query all parameters
    pub const QUERY_ALL: &str = "qa";
    /// Query all hidden parameters
    pub const QUERY_ALL_HIDDEN: &str = "__qa";
    /// Output status register
    pub const OUTPUT_STATUS: &str = "os";
    /// Output write-port state
    pub const OUTPUT_WRITE_PORT: &str = "ow";
    /// Encoder pulse output modulus
    pub const PULSE_MODULUS: &str = "__emom";
    /// Encoder pulse output offset
    pub const PULSE_OFFSET: &str = "__emoo";
    /// Encoder pulse output minimum on-time
    pub const PULSE_ON_TIME: &str = "__emot";
    /// Encoder pulse output port number
    pub const PULSE_PORT: &str = "__emop";
}

/// Soft-limit registers are widened to this many steps when limits cannot be disabled.
pub const UNBOUNDED_LIMIT_STEPS: i64 = 9_999_999;

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Byte-level serial settings. Must match the physical unit exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialParams {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (7 or 8)
    pub data_bits: u8,
    /// Parity
    pub parity: Parity,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
}

/// Controller protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerVariant {
    /// McLennan PM1000: echoes commands, `NN:` reply prefix
    #[default]
    Pm1000,
    /// McLennan PM600: `NN:` reply prefix, limits cannot be inhibited
    Pm600,
    /// McLennan PM341: `NN#` reply prefix
    Pm341,
    /// McLennan PM304: no reply prefix, `CP=`/`AP=` position replies
    Pm304,
    /// Applied Motion SCL drive: `N` reply prefix, `%` acknowledgement, CR line end
    Scl,
}

impl fmt::Display for ControllerVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerVariant::Pm1000 => "PM1000",
            ControllerVariant::Pm600 => "PM600",
            ControllerVariant::Pm341 => "PM341",
            ControllerVariant::Pm304 => "PM304",
            ControllerVariant::Scl => "SCL",
        };
        f.write_str(name)
    }
}

impl ControllerVariant {
    /// Prefix expected at the start of every reply from axis `id`.
    pub fn reply_prefix(self, id: u8) -> String {
        match self {
            ControllerVariant::Pm304 => String::new(),
            ControllerVariant::Scl => id.to_string(),
            ControllerVariant::Pm341 => format!("{id:02}#"),
            ControllerVariant::Pm1000 | ControllerVariant::Pm600 => format!("{id:02}:"),
        }
    }

    /// Line terminator appended to commands.
    pub fn terminator(self) -> &'static str {
        match self {
            ControllerVariant::Scl => "\r",
            _ => "\r\n",
        }
    }

    /// Whether the controller echoes each command line before replying.
    pub fn echoes(self) -> bool {
        self == ControllerVariant::Pm1000
    }

    /// Acknowledgement line for a successful command on axis `id`.
    pub fn ok_marker(self, id: u8) -> String {
        let marker = if self == ControllerVariant::Scl { "%" } else { "OK" };
        format!("{}{marker}", self.reply_prefix(id))
    }

    /// Whether soft limits can be switched off with `IL`.
    ///
    /// PM600 and PM1000 cannot; their limits are widened instead.
    pub fn can_inhibit_limits(self) -> bool {
        !matches!(self, ControllerVariant::Pm600 | ControllerVariant::Pm1000)
    }

    /// Whether `QA` reports are available for limits and speed.
    pub fn has_query_all(self) -> bool {
        self != ControllerVariant::Scl
    }

    /// Factory serial settings.
    pub fn default_serial(self) -> SerialParams {
        match self {
            ControllerVariant::Scl => SerialParams {
                baud_rate: 9600,
                data_bits: 8,
                parity: Parity::None,
                stop_bits: 1,
            },
            _ => SerialParams {
                baud_rate: 38400,
                data_bits: 7,
                parity: Parity::Even,
                stop_bits: 1,
            },
        }
    }

    /// Position query mnemonic.
    pub fn position_command(self, commanded: bool) -> &'static str {
        match (self, commanded) {
            (ControllerVariant::Scl, _) => mnemonic::IMMEDIATE_ENCODER,
            (_, true) => mnemonic::OUTPUT_COMMAND,
            (_, false) => mnemonic::OUTPUT_ACTUAL,
        }
    }

    /// Move mnemonic.
    pub fn move_command(self, relative: bool) -> &'static str {
        match (self, relative) {
            (ControllerVariant::Scl, true) => mnemonic::FEED_TO_LENGTH,
            (ControllerVariant::Scl, false) => mnemonic::FEED_TO_POSITION,
            (_, true) => mnemonic::MOVE_RELATIVE,
            (_, false) => mnemonic::MOVE_ABSOLUTE,
        }
    }

    /// Extract the step count from a position reply.
    ///
    /// Returns `None` when the reply does not carry the expected prefix or
    /// the value is not an integer.
    pub fn parse_position(self, id: u8, commanded: bool, reply: &str) -> Option<i64> {
        let body = match self {
            ControllerVariant::Pm304 => {
                reply.strip_prefix(if commanded { "CP=" } else { "AP=" })?
            }
            ControllerVariant::Scl => {
                let rest = reply.strip_prefix(&self.reply_prefix(id))?;
                rest.split_once('=').map_or(rest, |(_, value)| value)
            }
            _ => reply.strip_prefix(&self.reply_prefix(id))?,
        };
        body.trim().parse().ok()
    }

    /// Offset of the hard-limit flag in the `OS` status reply.
    pub fn hard_limit_index(self, id: u8) -> usize {
        self.reply_prefix(id).len() + 2
    }
}

/// Command parameter.
///
/// Floats are rounded to the nearest integer step count; the controllers
/// only accept integers.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Parameter {
    /// No parameter
    #[default]
    None,
    /// Integer value
    Int(i64),
    /// Value to be rounded before sending
    Float(f64),
}

impl From<i64> for Parameter {
    fn from(value: i64) -> Self {
        Parameter::Int(value)
    }
}

impl From<u32> for Parameter {
    fn from(value: u32) -> Self {
        Parameter::Int(i64::from(value))
    }
}

impl From<u8> for Parameter {
    fn from(value: u8) -> Self {
        Parameter::Int(i64::from(value))
    }
}

impl From<f64> for Parameter {
    fn from(value: f64) -> Self {
        Parameter::Float(value)
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parameter::None => Ok(()),
            Parameter::Int(v) => write!(f, "{v}"),
            Parameter::Float(v) => write!(f, "{}", v.round() as i64),
        }
    }
}

/// Encode a command line (without terminator).
pub fn encode(axis_id: u8, command: &str, parameter: Parameter) -> String {
    format!("{axis_id}{}{parameter}", command.to_uppercase())
}

/// A value from a query-all report.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportValue {
    /// Integer (binary for the port registers)
    Int(i64),
    /// Enabled/Disabled, On/Off
    Bool(bool),
    /// Anything else, lower-cased
    Text(String),
}

/// Parsed `QA` / `__QA` report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryReport {
    values: HashMap<String, ReportValue>,
}

/// Runs of two or more spaces between report fragments.
#[allow(clippy::expect_used)]
static PAIR_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" {2,}").expect("Invalid pair separator regex"));

/// Names differ between controller firmware; map them onto one vocabulary.
fn canonical_name(name: &str) -> &str {
    match name {
        "actual pos" => "actual position",
        "command pos" => "command position",
        "autoexec" => "auto execute",
        "fast jog" => "fast jog speed",
        "lower limit" => "lower soft limit",
        "upper limit" => "upper soft limit",
        "settling" | "settle time" => "settling time",
        "tracking" => "tracking window",
        other => other,
    }
}

/// Split a report line into `name value` fragments.
///
/// Fragments are separated by two or more spaces, except where the run of
/// spaces is followed by `=`, `-` or a digit (aligned values, not a new name).
fn split_pairs(line: &str) -> Vec<&str> {
    let mut fragments = Vec::new();
    let mut start = 0;
    for m in PAIR_SEPARATOR.find_iter(line) {
        let next = line[m.end()..].chars().next();
        let continues_value = matches!(next, Some(c) if c == '=' || c == '-' || c.is_ascii_digit());
        if !continues_value {
            fragments.push(&line[start..m.start()]);
            start = m.end();
        }
    }
    fragments.push(&line[start..]);
    fragments
}

fn is_separator(c: char) -> bool {
    c == ':' || c == '='
}

fn parse_value(name: &str, raw: &str) -> ReportValue {
    let radix = if matches!(name, "read port" | "last write") { 2 } else { 10 };
    if let Ok(v) = i64::from_str_radix(raw, radix) {
        return ReportValue::Int(v);
    }
    match raw.to_lowercase().as_str() {
        "enabled" | "on" => ReportValue::Bool(true),
        "disabled" | "off" => ReportValue::Bool(false),
        other => ReportValue::Text(other.to_string()),
    }
}

impl QueryReport {
    /// Parse the lines of a query-all reply. The first line is a banner and is skipped.
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut values = HashMap::new();
        for line in lines.iter().skip(1) {
            for fragment in split_pairs(line.as_ref().trim()) {
                let (name, value) = match fragment.split_once(is_separator) {
                    Some((name, rest)) => {
                        // a second separator ends the value
                        let value = rest.split(is_separator).next().unwrap_or(rest);
                        (name, value)
                    }
                    None => match fragment.rsplit_once(' ') {
                        Some(pair) => pair,
                        None => continue,
                    },
                };
                let name = name.trim().to_lowercase();
                let name = canonical_name(&name).to_string();
                let value = parse_value(&name, value.trim());
                values.insert(name, value);
            }
        }
        Self { values }
    }

    /// Raw value by canonical name.
    pub fn get(&self, name: &str) -> Option<&ReportValue> {
        self.values.get(name)
    }

    /// Integer value by canonical name.
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name)? {
            ReportValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean value by canonical name.
    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.values.get(name)? {
            ReportValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Number of parsed entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when nothing could be parsed.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
