//! Configuration loading for the ABB driver

use crate::{
    channel::{ChannelOptions, QueueOrder},
    commands::{self, ZoneSetting, DEFAULT_SPEED},
    pose::{Pose, PoseInput},
    units::{AngularUnit, LinearUnit},
    AbbError, Result,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Default motion (command) port of the RAPID server
pub const DEFAULT_MOTION_PORT: u16 = 5000;
/// Default logger (telemetry) port of the RAPID server
pub const DEFAULT_TELEMETRY_PORT: u16 = 5001;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverConfig {
    pub robot: RobotConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub units: UnitConfig,
    #[serde(default)]
    pub defaults: MotionDefaults,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RobotConfig {
    pub host: String,
    #[serde(default)]
    pub ports: PortConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortConfig {
    pub motion: u16,
    pub telemetry: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    pub connect_secs: f64,
    pub reply_secs: f64,
    pub prime_secs: f64,
    pub close_secs: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    pub inter_command_delay_ms: u64,
    #[serde(default)]
    pub queue_order: QueueOrder,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UnitConfig {
    pub linear: LinearUnit,
    pub angular: AngularUnit,
}

/// Settings pushed to the controller right after connecting
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotionDefaults {
    pub tool: PoseInput,
    pub workobject: PoseInput,
    pub speed: [f64; 4],
    pub zone: ZoneSetting,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// Discriminator of legacy pose+buffer records, if the logger sends them
    pub pose_discriminator: Option<String>,
}

/// Resolved timeouts handed to the connection manager
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timeouts {
    pub connect: Duration,
    pub reply: Duration,
    pub prime: Duration,
    pub close: Duration,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            motion: DEFAULT_MOTION_PORT,
            telemetry: DEFAULT_TELEMETRY_PORT,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 2.5,
            reply_secs: 5.0,
            prime_secs: 5.0,
            close_secs: 5.0,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            inter_command_delay_ms: 40,
            queue_order: QueueOrder::Fifo,
        }
    }
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            linear: LinearUnit::Millimeters,
            angular: AngularUnit::Degrees,
        }
    }
}

impl Default for MotionDefaults {
    fn default() -> Self {
        Self {
            tool: Pose::IDENTITY.into(),
            workobject: Pose::IDENTITY.into(),
            speed: DEFAULT_SPEED,
            zone: ZoneSetting::default(),
        }
    }
}

impl DriverConfig {
    /// Config for `host` with every other setting at its default
    pub fn for_host(host: &str) -> Self {
        Self {
            robot: RobotConfig {
                host: host.to_string(),
                ports: PortConfig::default(),
            },
            timeouts: TimeoutConfig::default(),
            dispatch: DispatchConfig::default(),
            units: UnitConfig::default(),
            defaults: MotionDefaults::default(),
            telemetry: TelemetryConfig::default(),
        }
    }

    pub fn load_from_path(config_path: &str) -> Result<Self> {
        let contents = fs::read_to_string(config_path)
            .map_err(|e| AbbError::Config(format!("Failed to read {}: {}", config_path, e)))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: DriverConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail later on the wire
    pub fn validate(&self) -> Result<()> {
        if self.robot.host.trim().is_empty() {
            return Err(AbbError::Config("robot.host is empty".to_string()));
        }
        let t = &self.timeouts;
        for (name, secs) in [
            ("connect_secs", t.connect_secs),
            ("reply_secs", t.reply_secs),
            ("prime_secs", t.prime_secs),
            ("close_secs", t.close_secs),
        ] {
            if !(secs.is_finite() && secs > 0.0) {
                return Err(AbbError::Config(format!("timeouts.{} must be positive, got {}", name, secs)));
            }
        }
        Pose::normalize(&self.defaults.tool)?;
        Pose::normalize(&self.defaults.workobject)?;
        commands::set_zone(&self.defaults.zone)?.encode()?;
        Ok(())
    }

    pub fn motion_endpoint(&self) -> String {
        format!("{}:{}", self.robot.host, self.robot.ports.motion)
    }

    pub fn telemetry_endpoint(&self) -> String {
        format!("{}:{}", self.robot.host, self.robot.ports.telemetry)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs_f64(self.timeouts.connect_secs),
            reply: Duration::from_secs_f64(self.timeouts.reply_secs),
            prime: Duration::from_secs_f64(self.timeouts.prime_secs),
            close: Duration::from_secs_f64(self.timeouts.close_secs),
        }
    }

    pub fn channel_options(&self) -> ChannelOptions {
        let timeouts = self.timeouts();
        ChannelOptions {
            reply_timeout: timeouts.reply,
            close_timeout: timeouts.close,
            inter_command_delay: Duration::from_millis(self.dispatch.inter_command_delay_ms),
            queue_order: self.dispatch.queue_order,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        DriverConfig::for_host("localhost").timeouts()
    }
}
