//! Fixed-width text framing for the RAPID motion server
//!
//! Every frame sent to the controller has the same length:
//!
//! ```text
//! <op><sp><field><sp><field><sp>...****************#
//! |<------------- FRAME_PAYLOAD_LEN ------------->|^ TERMINATOR
//! ```
//!
//! Fields carry an explicit sign and are zero padded to their declared width, so the
//! controller can parse them positionally. Replies use the same padding and terminator.

use crate::{AbbError, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Payload length every frame is padded to
pub const FRAME_PAYLOAD_LEN: usize = 66;
/// Total encoded frame length (payload + terminator)
pub const FRAME_LEN: usize = FRAME_PAYLOAD_LEN + 1;
pub const FILLER: u8 = b'*';
pub const TERMINATOR: u8 = b'#';

/// Two-character command code understood by the controller
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Opcode(String);

impl Opcode {
    pub fn new(code: &str) -> Result<Self> {
        if code.len() == 2 && code.bytes().all(|b| b.is_ascii_alphanumeric()) {
            Ok(Self(code.to_string()))
        } else {
            Err(AbbError::InvalidOpcode(format!(
                "expected two ASCII alphanumerics, got '{}'",
                code
            )))
        }
    }

    /// Opcodes of the built-in command set
    pub(crate) fn from_static(code: &'static str) -> Self {
        debug_assert!(code.len() == 2 && code.bytes().all(|b| b.is_ascii_alphanumeric()));
        Self(code.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rendered width (sign included) and decimal precision of one field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub width: usize,
    pub precision: usize,
}

impl FieldSpec {
    pub const fn new(width: usize, precision: usize) -> Self {
        Self { width, precision }
    }

    /// Render `value` as `+0ddd.ppp`, failing if it does not fit
    pub fn render(&self, value: f64) -> Result<String> {
        if !value.is_finite() {
            return Err(AbbError::EncodingOverflow(format!("non-finite field value {}", value)));
        }
        let rendered = format!("{:+0w$.p$}", value, w = self.width, p = self.precision);
        if rendered.len() > self.width {
            return Err(AbbError::EncodingOverflow(format!(
                "{} needs {} characters, field width is {}",
                rendered,
                rendered.len(),
                self.width
            )));
        }
        Ok(rendered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Field {
    pub value: f64,
    pub spec: FieldSpec,
}

/// A command ready for the channel. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    opcode: Opcode,
    fields: Vec<Field>,
    expects_reply: bool,
    priority: bool,
}

impl Command {
    /// New command with no fields that waits for a reply at normal priority
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            fields: Vec::new(),
            expects_reply: true,
            priority: false,
        }
    }

    pub fn field(mut self, value: f64, spec: FieldSpec) -> Self {
        self.fields.push(Field { value, spec });
        self
    }

    pub fn fields<I>(mut self, values: I, spec: FieldSpec) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        self.fields.extend(values.into_iter().map(|value| Field { value, spec }));
        self
    }

    pub fn expect_reply(mut self, expects_reply: bool) -> Self {
        self.expects_reply = expects_reply;
        self
    }

    pub fn prioritized(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    pub fn opcode(&self) -> &Opcode {
        &self.opcode
    }

    pub fn field_list(&self) -> &[Field] {
        &self.fields
    }

    pub fn expects_reply(&self) -> bool {
        self.expects_reply
    }

    pub fn priority(&self) -> bool {
        self.priority
    }

    pub fn encode(&self) -> Result<Frame> {
        let mut payload = String::with_capacity(FRAME_LEN);
        payload.push_str(self.opcode.as_str());
        payload.push(' ');
        for field in &self.fields {
            payload.push_str(&field.spec.render(field.value)?);
            payload.push(' ');
        }
        Frame::from_payload(payload)
    }
}

/// Encode an opcode and parallel value/spec lists into a frame
pub fn encode(opcode: &str, values: &[f64], specs: &[FieldSpec]) -> Result<Frame> {
    if values.len() != specs.len() {
        return Err(AbbError::EncodingOverflow(format!(
            "{} values but {} field specs",
            values.len(),
            specs.len()
        )));
    }
    values
        .iter()
        .zip(specs)
        .fold(Command::new(Opcode::new(opcode)?), |cmd, (&v, &s)| cmd.field(v, s))
        .encode()
}

/// One padded, terminated frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(String);

impl Frame {
    fn from_payload(mut payload: String) -> Result<Self> {
        if payload.len() > FRAME_PAYLOAD_LEN {
            return Err(AbbError::EncodingOverflow(format!(
                "payload is {} bytes, frame allows {}",
                payload.len(),
                FRAME_PAYLOAD_LEN
            )));
        }
        while payload.len() < FRAME_PAYLOAD_LEN {
            payload.push(FILLER as char);
        }
        payload.push(TERMINATOR as char);
        Ok(Self(payload))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Acknowledgement read back from the motion server
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Full frame as received, terminator included
    pub raw: String,
    /// Echoed opcode, when the reply carries one
    pub opcode: Option<String>,
    /// Status flag following the opcode (1 = ok on the stock server)
    pub status: Option<i32>,
    /// Remaining whitespace-separated tokens
    pub tokens: Vec<String>,
}

fn reply_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\s*(\w{1,2})\s+(-?\d+)\b").expect("valid reply regex"))
}

impl Reply {
    pub fn parse(raw: &[u8]) -> Self {
        let raw = String::from_utf8_lossy(raw).to_string();
        let body = raw
            .trim_end_matches(TERMINATOR as char)
            .trim_end_matches(FILLER as char);

        let (opcode, status, rest) = match reply_pattern().captures(body) {
            Some(caps) => {
                let end = caps.get(0).map(|m| m.end()).unwrap_or(0);
                (
                    caps.get(1).map(|m| m.as_str().to_string()),
                    caps.get(2).and_then(|m| m.as_str().parse::<i32>().ok()),
                    &body[end..],
                )
            }
            None => (None, None, body),
        };

        Self {
            opcode,
            status,
            tokens: rest.split_whitespace().map(str::to_string).collect(),
            raw,
        }
    }

    /// Payload with padding and terminator removed
    pub fn payload(&self) -> &str {
        self.raw
            .trim_end_matches(TERMINATOR as char)
            .trim_end_matches(FILLER as char)
            .trim_end()
    }

    pub fn is_ok(&self) -> bool {
        self.status == Some(1)
    }
}
