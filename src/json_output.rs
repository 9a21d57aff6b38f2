//! JSON Output for Driver Events
//!
//! Provides structured JSON lines for command status, telemetry records and errors
//! that can be consumed by external tools and monitoring systems.

use crate::telemetry::TelemetryRecord;
use serde::{Deserialize, Serialize};

/// Get current timestamp as f64 seconds since UNIX epoch with consistent precision
pub fn current_timestamp() -> f64 {
    let micros = chrono::Utc::now().timestamp_micros();
    micros as f64 / 1_000_000.0
}

/// Command execution status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Sent,
    Acknowledged,
    Failed,
}

/// Command status event output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStatusEvent {
    /// Timestamp when event occurred
    pub timestamp: f64,
    /// Event type for JSON parsing
    #[serde(rename = "type")]
    pub event_type: String,
    /// Two-character opcode of the command
    pub opcode: String,
    /// Current status of the command
    pub status: CommandStatus,
    /// Human-readable message
    pub message: String,
    /// Reply payload (acknowledged commands only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

/// Telemetry record event output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub record: TelemetryRecord,
}

/// Error event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Timestamp when error occurred
    pub timestamp: f64,
    /// Event type for JSON parsing
    #[serde(rename = "type")]
    pub event_type: String,
    /// Associated opcode if applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opcode: Option<String>,
    /// Error message
    pub error: String,
}

impl CommandStatusEvent {
    pub fn new(opcode: &str, status: CommandStatus, message: &str, reply: Option<String>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "command_status".to_string(),
            opcode: opcode.to_string(),
            status,
            message: message.to_string(),
            reply,
        }
    }

    pub fn sent(opcode: &str) -> Self {
        Self::new(opcode, CommandStatus::Sent, "Command sent to motion server", None)
    }

    pub fn acknowledged(opcode: &str, reply: &str) -> Self {
        Self::new(
            opcode,
            CommandStatus::Acknowledged,
            "Command acknowledged",
            Some(reply.to_string()),
        )
    }

    pub fn failed(opcode: &str, error: &str) -> Self {
        Self::new(opcode, CommandStatus::Failed, error, None)
    }
}

impl TelemetryEvent {
    pub fn new(record: TelemetryRecord) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "telemetry".to_string(),
            record,
        }
    }
}

impl ErrorEvent {
    pub fn new(error: &str, opcode: Option<String>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "error".to_string(),
            opcode,
            error: error.to_string(),
        }
    }
}

/// Output helpers that print JSON lines to stdout
pub mod output {
    use super::*;

    fn emit<T: Serialize>(event: &T) {
        match serde_json::to_string(event) {
            Ok(json) => println!("{}", json),
            Err(e) => tracing::error!("Failed to serialize event: {}", e),
        }
    }

    pub fn command_sent(opcode: &str) {
        emit(&CommandStatusEvent::sent(opcode));
    }

    pub fn command_acknowledged(opcode: &str, reply: &str) {
        emit(&CommandStatusEvent::acknowledged(opcode, reply));
    }

    pub fn command_failed(opcode: &str, error: &str) {
        emit(&CommandStatusEvent::failed(opcode, error));
    }

    pub fn telemetry(record: &TelemetryRecord) {
        emit(&TelemetryEvent::new(record.clone()));
    }

    pub fn error(error: &str, opcode: Option<String>) {
        emit(&ErrorEvent::new(error, opcode));
    }
}
