//! Result channels
//!
//! A worker hands its result back through exactly one of three transports:
//! its exit code, a fixed-width pipe, or a return slot shared with the
//! coordinator. Each transport has a producer side (the worker publishes)
//! and a consumer side (the coordinator collects once the worker terminated).

pub mod exit_code;
pub mod pipe;
pub mod slot;

pub use exit_code::{ExitCodeConsumer, ExitCodeProducer};
pub use pipe::{PipeConsumer, PipeProducer};
pub use slot::{ReturnSlot, SlotProducer};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::core::config::FanOutMode;
use crate::task::TaskOutput;

/// Worker side of a channel. Called at most once per worker.
pub trait Producer {
    fn publish(&mut self, output: TaskOutput) -> Result<(), ChannelViolation>;
}

/// Coordinator side of a channel.
///
/// `Ok(None)` means the worker terminated without a usable result and is
/// recorded as lost.
#[async_trait]
pub trait Consumer: Send {
    type Source: Send;

    async fn collect(&mut self, source: Self::Source)
        -> Result<Option<ResultValue>, ChannelViolation>;
}

/// Breaches of a channel's contract
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelViolation {
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("short write: expected {expected} bytes, wrote {actual}")]
    ShortWrite { expected: usize, actual: usize },

    #[error("{channel} channel cannot carry {output}")]
    Unsupported {
        channel: &'static str,
        output: String,
    },

    #[error("result already published")]
    AlreadyPublished,

    #[error("channel io failed: {0}")]
    Io(String),
}

/// Value recovered from a terminated worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultValue {
    /// Exit status, already reduced to 8 bits
    NarrowCode(u8),
    /// Fixed-width value read from a pipe
    Payload(Payload),
    /// Value left in a thread's return slot
    Returned(Value),
}

impl ResultValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::NarrowCode(code) => Some(i64::from(*code)),
            Self::Payload(Payload::I32(v)) => Some(i64::from(*v)),
            Self::Payload(Payload::I64(v)) => Some(*v),
            Self::Payload(_) => None,
            Self::Returned(value) => value.as_i64(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::NarrowCode(code) => Some(f64::from(*code)),
            Self::Payload(payload) => Some(payload.as_f64()),
            Self::Returned(value) => value.as_f64(),
        }
    }
}

impl fmt::Display for ResultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NarrowCode(code) => write!(f, "exit code {}", code),
            Self::Payload(payload) => write!(f, "payload {}", payload),
            Self::Returned(value) => write!(f, "returned {}", value),
        }
    }
}

/// Binary type carried by the pipe channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    F32,
    F64,
    I32,
    I64,
}

impl PayloadKind {
    /// Bytes per payload on the wire
    pub const fn width(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::I64 => "i64",
        };
        f.write_str(name)
    }
}

impl FromStr for PayloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "f32" => Ok(Self::F32),
            "f64" => Ok(Self::F64),
            "i32" => Ok(Self::I32),
            "i64" => Ok(Self::I64),
            other => Err(format!("unknown payload kind `{}` (expected f32, f64, i32 or i64)", other)),
        }
    }
}

/// Fixed-width binary value, encoded in native byte order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    F32(f32),
    F64(f64),
    I32(i32),
    I64(i64),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::F32(_) => PayloadKind::F32,
            Self::F64(_) => PayloadKind::F64,
            Self::I32(_) => PayloadKind::I32,
            Self::I64(_) => PayloadKind::I64,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::F32(v) => f64::from(v),
            Self::F64(v) => v,
            Self::I32(v) => f64::from(v),
            Self::I64(v) => v as f64,
        }
    }

    /// Convert a task output into a payload of the given kind.
    ///
    /// Integers narrow to `i32` only when they fit. Floats never become
    /// integers.
    pub fn from_output(kind: PayloadKind, output: &TaskOutput) -> Result<Self, ChannelViolation> {
        let unsupported = || ChannelViolation::Unsupported {
            channel: "pipe",
            output: format!("{:?} as {}", output, kind),
        };

        match output {
            TaskOutput::Int(v) => Self::from_int(kind, *v).ok_or_else(unsupported),
            TaskOutput::Float(v) => Self::from_float(kind, *v).ok_or_else(unsupported),
            TaskOutput::Json(value) => {
                if let Some(v) = value.as_i64() {
                    Self::from_int(kind, v).ok_or_else(unsupported)
                } else if let Some(v) = value.as_f64() {
                    Self::from_float(kind, v).ok_or_else(unsupported)
                } else {
                    Err(unsupported())
                }
            }
        }
    }

    fn from_int(kind: PayloadKind, v: i64) -> Option<Self> {
        match kind {
            PayloadKind::F32 => Some(Self::F32(v as f32)),
            PayloadKind::F64 => Some(Self::F64(v as f64)),
            PayloadKind::I32 => i32::try_from(v).ok().map(Self::I32),
            PayloadKind::I64 => Some(Self::I64(v)),
        }
    }

    fn from_float(kind: PayloadKind, v: f64) -> Option<Self> {
        match kind {
            PayloadKind::F32 => Some(Self::F32(v as f32)),
            PayloadKind::F64 => Some(Self::F64(v)),
            PayloadKind::I32 | PayloadKind::I64 => None,
        }
    }

    pub fn to_ne_bytes(&self) -> Vec<u8> {
        match self {
            Self::F32(v) => v.to_ne_bytes().to_vec(),
            Self::F64(v) => v.to_ne_bytes().to_vec(),
            Self::I32(v) => v.to_ne_bytes().to_vec(),
            Self::I64(v) => v.to_ne_bytes().to_vec(),
        }
    }

    /// Decode exactly `kind.width()` leading bytes.
    pub fn from_ne_bytes(kind: PayloadKind, bytes: &[u8]) -> Result<Self, ChannelViolation> {
        let width = kind.width();
        if bytes.len() < width {
            return Err(ChannelViolation::ShortRead {
                expected: width,
                actual: bytes.len(),
            });
        }

        let payload = match kind {
            PayloadKind::F32 => Self::F32(f32::from_ne_bytes(fixed(bytes))),
            PayloadKind::F64 => Self::F64(f64::from_ne_bytes(fixed(bytes))),
            PayloadKind::I32 => Self::I32(i32::from_ne_bytes(fixed(bytes))),
            PayloadKind::I64 => Self::I64(i64::from_ne_bytes(fixed(bytes))),
        };
        Ok(payload)
    }
}

// Caller has checked the length.
fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32(v) => write!(f, "{}f32", v),
            Self::F64(v) => write!(f, "{}f64", v),
            Self::I32(v) => write!(f, "{}i32", v),
            Self::I64(v) => write!(f, "{}i64", v),
        }
    }
}

/// Which transport a batch uses to recover results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChannelKind {
    ExitCode,
    Pipe(PayloadKind),
    Return,
}

impl ChannelKind {
    /// Whether workers spawned in `mode` can use this channel
    pub fn supports(self, mode: FanOutMode) -> bool {
        match (self, mode) {
            (Self::ExitCode | Self::Pipe(_), FanOutMode::Process) => true,
            (Self::Return, FanOutMode::Thread) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExitCode => f.write_str("exit-code"),
            Self::Pipe(kind) => write!(f, "pipe:{}", kind),
            Self::Return => f.write_str("return"),
        }
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exit-code" | "exit_code" => Ok(Self::ExitCode),
            "return" => Ok(Self::Return),
            "pipe" => Ok(Self::Pipe(PayloadKind::F32)),
            other => match other.strip_prefix("pipe:") {
                Some(kind) => Ok(Self::Pipe(kind.parse()?)),
                None => Err(format!(
                    "unknown channel `{}` (expected exit-code, return or pipe:<kind>)",
                    other
                )),
            },
        }
    }
}

impl TryFrom<String> for ChannelKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelKind> for String {
    fn from(kind: ChannelKind) -> Self {
        kind.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_kind_parse_and_display() {
        for text in ["exit-code", "return", "pipe:f32", "pipe:f64", "pipe:i32", "pipe:i64"] {
            let kind: ChannelKind = text.parse().unwrap();
            assert_eq!(kind.to_string(), text);
        }
        assert_eq!("pipe".parse::<ChannelKind>().unwrap(), ChannelKind::Pipe(PayloadKind::F32));
        assert!("pipe:u8".parse::<ChannelKind>().is_err());
        assert!("socket".parse::<ChannelKind>().is_err());
    }

    #[test]
    fn test_channel_support_matrix() {
        assert!(ChannelKind::ExitCode.supports(FanOutMode::Process));
        assert!(ChannelKind::Pipe(PayloadKind::F64).supports(FanOutMode::Process));
        assert!(ChannelKind::Return.supports(FanOutMode::Thread));
        assert!(!ChannelKind::Return.supports(FanOutMode::Process));
        assert!(!ChannelKind::ExitCode.supports(FanOutMode::Thread));
    }

    #[test]
    fn test_payload_widths() {
        assert_eq!(PayloadKind::F32.width(), 4);
        assert_eq!(PayloadKind::I32.width(), 4);
        assert_eq!(PayloadKind::F64.width(), 8);
        assert_eq!(PayloadKind::I64.width(), 8);
        assert_eq!(Payload::F32(1.5).to_ne_bytes().len(), 4);
    }

    #[test]
    fn test_payload_from_output() {
        assert_eq!(
            Payload::from_output(PayloadKind::F32, &TaskOutput::Float(2.5)).unwrap(),
            Payload::F32(2.5)
        );
        assert_eq!(
            Payload::from_output(PayloadKind::I64, &TaskOutput::Int(-7)).unwrap(),
            Payload::I64(-7)
        );
        assert!(Payload::from_output(PayloadKind::I32, &TaskOutput::Int(i64::MAX)).is_err());
        assert!(Payload::from_output(PayloadKind::I64, &TaskOutput::Float(1.5)).is_err());
        assert!(Payload::from_output(PayloadKind::F64, &TaskOutput::Json(Value::Null)).is_err());
    }

    #[test]
    fn test_short_buffer_is_a_violation() {
        let err = Payload::from_ne_bytes(PayloadKind::F64, &[0u8; 3]).unwrap_err();
        assert_eq!(err, ChannelViolation::ShortRead { expected: 8, actual: 3 });
    }

    #[test]
    fn test_result_value_numeric_views() {
        assert_eq!(ResultValue::NarrowCode(200).as_i64(), Some(200));
        assert_eq!(ResultValue::Payload(Payload::F32(0.5)).as_f64(), Some(0.5));
        assert_eq!(ResultValue::Payload(Payload::F32(0.5)).as_i64(), None);
        assert_eq!(ResultValue::Returned(Value::from(9)).as_i64(), Some(9));
    }
}
