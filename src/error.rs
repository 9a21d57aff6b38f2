//! Error types for ABB driver operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AbbError>;

#[derive(Error, Debug)]
pub enum AbbError {
    #[error("Motion connection failed ({endpoint}): {reason}")]
    MotionConnect { endpoint: String, reason: String },

    #[error("Telemetry connection failed ({endpoint}): {reason}")]
    TelemetryConnect { endpoint: String, reason: String },

    #[error("Encoding overflow: {0}")]
    EncodingOverflow(String),

    #[error("Invalid opcode: {0}")]
    InvalidOpcode(String),

    #[error("Unknown zone '{key}', expected one of: {accepted}")]
    UnknownZone { key: String, accepted: String },

    #[error("Malformed pose: {0}")]
    MalformedPose(String),

    #[error("Malformed telemetry record: {0}")]
    MalformedTelemetryRecord(String),

    #[error("Command channel closed")]
    ChannelClosed,

    #[error("No reply to opcode {opcode} within {timeout_ms} ms")]
    ProtocolTimeout { opcode: String, timeout_ms: u128 },

    #[error("Unknown unit: {0}")]
    Unit(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl AbbError {
    /// True for either per-channel connect failure
    pub fn is_connect_error(&self) -> bool {
        matches!(self, AbbError::MotionConnect { .. } | AbbError::TelemetryConnect { .. })
    }
}
