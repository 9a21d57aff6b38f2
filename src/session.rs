//! Session with one RAPID server: command channel + telemetry reader
//!
//! Bootstrap sequence:
//! 1. Connect the motion and telemetry sockets concurrently (bounded per endpoint)
//! 2. Prime the telemetry reader with one read
//! 3. Start the dispatcher and the continuous telemetry loop
//!
//! No retry is attempted; a failed connect leaves nothing running.

use crate::{
    channel::{ChannelOptions, ChannelStats, CommandChannel, CommandTicket},
    commands::{self, ZoneSetting},
    config::{DriverConfig, Timeouts},
    net::connect_with_timeout,
    pose::{Pose, PoseInput},
    protocol::{Command, Reply},
    telemetry::{PoseStatusParser, TelemetryHandle, TelemetryObserver, TelemetryParser, TelemetryReader},
    units::CoordinateTransform,
    AbbError, Result,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Lifecycle of a channel or of the session as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// `host:port` of each server socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub motion: String,
    pub telemetry: String,
}

impl Endpoints {
    pub fn new(host: &str, motion_port: u16, telemetry_port: u16) -> Self {
        Self {
            motion: format!("{}:{}", host, motion_port),
            telemetry: format!("{}:{}", host, telemetry_port),
        }
    }
}

/// Establishes sessions and reports bootstrap progress
pub struct ConnectionManager {
    endpoints: Endpoints,
    timeouts: Timeouts,
    channel_options: ChannelOptions,
    pose_discriminator: Option<String>,
    state: watch::Sender<SessionState>,
}

impl ConnectionManager {
    pub fn new(endpoints: Endpoints, timeouts: Timeouts) -> Self {
        let channel_options = ChannelOptions {
            reply_timeout: timeouts.reply,
            close_timeout: timeouts.close,
            ..ChannelOptions::default()
        };
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            endpoints,
            timeouts,
            channel_options,
            pose_discriminator: None,
            state,
        }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        let endpoints = Endpoints {
            motion: config.motion_endpoint(),
            telemetry: config.telemetry_endpoint(),
        };
        let mut manager = Self::new(endpoints, config.timeouts());
        manager.channel_options = config.channel_options();
        manager.pose_discriminator = config.telemetry.pose_discriminator.clone();
        manager
    }

    pub fn with_channel_options(mut self, options: ChannelOptions) -> Self {
        self.channel_options = options;
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn parser(&self) -> TelemetryParser {
        let parser = TelemetryParser::default();
        match &self.pose_discriminator {
            Some(disc) => parser.with_parser(disc, Box::new(PoseStatusParser)),
            None => parser,
        }
    }

    /// Open both sockets, prime telemetry and start both loops
    pub async fn connect(&self, observer: Arc<dyn TelemetryObserver>) -> Result<Session> {
        self.state.send_replace(SessionState::Connecting);
        info!(
            "Attempting to connect to robot motion server at {} and logger at {}",
            self.endpoints.motion, self.endpoints.telemetry
        );

        let parser = Arc::new(self.parser());
        let motion = async {
            connect_with_timeout(&self.endpoints.motion, self.timeouts.connect)
                .await
                .map_err(|e| AbbError::MotionConnect {
                    endpoint: self.endpoints.motion.clone(),
                    reason: e.to_string(),
                })
        };
        let telemetry = async {
            let telemetry_err = |reason: String| AbbError::TelemetryConnect {
                endpoint: self.endpoints.telemetry.clone(),
                reason,
            };
            let stream = connect_with_timeout(&self.endpoints.telemetry, self.timeouts.connect)
                .await
                .map_err(|e| telemetry_err(e.to_string()))?;
            let mut reader = TelemetryReader::new(stream, parser, observer);
            reader
                .prime(self.timeouts.prime)
                .await
                .map_err(|e| telemetry_err(format!("priming read failed: {}", e)))?;
            Ok::<_, AbbError>(reader)
        };

        let (motion, telemetry) = tokio::join!(motion, telemetry);
        let (motion, reader) = match (motion, telemetry) {
            (Ok(motion), Ok(reader)) => (motion, reader),
            (Err(e), _) | (_, Err(e)) => {
                error!("Connection failed: {}", e);
                self.state.send_replace(SessionState::Disconnected);
                return Err(e);
            }
        };

        let channel = CommandChannel::start(motion, self.channel_options.clone());
        let telemetry = reader.spawn();
        self.state.send_replace(SessionState::Connected);
        info!("Connected to robot motion server at {}", self.endpoints.motion);

        Ok(Session {
            channel,
            telemetry,
            transform: CoordinateTransform::default(),
        })
    }
}

/// Live connection to one controller
pub struct Session {
    channel: CommandChannel,
    telemetry: TelemetryHandle,
    transform: CoordinateTransform,
}

impl Session {
    /// Connect with default channel options
    pub async fn connect(
        endpoints: Endpoints,
        timeouts: Timeouts,
        observer: Arc<dyn TelemetryObserver>,
    ) -> Result<Self> {
        ConnectionManager::new(endpoints, timeouts).connect(observer).await
    }

    pub async fn connect_with_config(
        config: &DriverConfig,
        observer: Arc<dyn TelemetryObserver>,
    ) -> Result<Self> {
        ConnectionManager::from_config(config).connect(observer).await
    }

    /// Push units, tool, workobject, speed and zone from the config
    pub async fn apply_defaults(&mut self, config: &DriverConfig) -> Result<()> {
        self.transform = CoordinateTransform::new(config.units.linear, config.units.angular);
        info!("Units: {} / {}", config.units.linear, config.units.angular);
        self.set_tool(config.defaults.tool.clone()).await?;
        self.set_workobject(config.defaults.workobject.clone()).await?;
        self.set_speed(config.defaults.speed).await?;
        self.set_zone(&config.defaults.zone).await?;
        Ok(())
    }

    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    pub fn channel_state(&self) -> SessionState {
        self.channel.state()
    }

    pub fn telemetry_state(&self) -> SessionState {
        self.telemetry.state()
    }

    /// Combined state: connected only while both sides are
    pub fn state(&self) -> SessionState {
        match (self.channel_state(), self.telemetry_state()) {
            (SessionState::Connected, SessionState::Connected) => SessionState::Connected,
            (SessionState::Closed, SessionState::Closed) => SessionState::Closed,
            _ => SessionState::Closing,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub async fn stats(&self) -> ChannelStats {
        self.channel.stats().await
    }

    pub fn transform(&self) -> &CoordinateTransform {
        &self.transform
    }

    /// Local only: affects poses encoded from now on
    pub fn set_units(&mut self, linear: &str, angular: &str) -> Result<()> {
        self.transform.set_units(linear, angular)
    }

    pub async fn submit(&self, command: Command) -> Result<Option<Reply>> {
        self.channel.submit(command).await
    }

    pub async fn enqueue(&self, command: Command) -> Result<CommandTicket> {
        self.channel.enqueue(command).await
    }

    pub async fn set_tool(&self, tool: impl Into<PoseInput>) -> Result<Option<Reply>> {
        let tool = Pose::normalize(&tool.into())?;
        self.submit(commands::set_tool(&self.transform, &tool)).await
    }

    pub async fn set_workobject(&self, work_object: impl Into<PoseInput>) -> Result<Option<Reply>> {
        let work_object = Pose::normalize(&work_object.into())?;
        self.submit(commands::set_workobject(&self.transform, &work_object)).await
    }

    pub async fn set_speed(&self, speed: [f64; 4]) -> Result<Option<Reply>> {
        self.submit(commands::set_speed(speed)).await
    }

    pub async fn set_zone(&self, zone: &ZoneSetting) -> Result<Option<Reply>> {
        self.submit(commands::set_zone(zone)?).await
    }

    /// Append a target to the controller's motion buffer
    pub async fn buffer_add(&self, pose: impl Into<PoseInput>) -> Result<()> {
        let pose = Pose::normalize(&pose.into())?;
        self.submit(commands::buffer_add(&self.transform, &pose)).await?;
        Ok(())
    }

    pub async fn clear_buffer(&self) -> Result<Option<Reply>> {
        self.submit(commands::clear_buffer()).await
    }

    pub async fn pause(&self) -> Result<Option<Reply>> {
        self.submit(commands::pause()).await
    }

    pub async fn resume(&self) -> Result<Option<Reply>> {
        self.submit(commands::resume()).await
    }

    pub async fn calculate_workobject(&self, code: u8, pose: impl Into<PoseInput>) -> Result<Option<Reply>> {
        let pose = Pose::normalize(&pose.into())?;
        self.submit(commands::calculate_workobject(code, &self.transform, &pose)?)
            .await
    }

    /// Disconnect the command channel, then stop the telemetry loop
    pub async fn close(&mut self) -> Result<()> {
        let channel_result = self.channel.close().await;
        let delivered = self.telemetry.stop().await?;
        info!("Session closed ({} telemetry records delivered)", delivered);
        channel_result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.channel.abort();
    }
}
