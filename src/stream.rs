//! Command Streaming for the ABB motion server
//!
//! Reads newline-delimited commands from stdin, sends each one through the session
//! and prints its status as a JSON line. Commands run one at a time, in input order.

use crate::{
    commands::ZoneSetting,
    json_output,
    pose::PoseInput,
    protocol::Reply,
    session::Session,
};
use anyhow::{anyhow, bail, Context, Result};
use std::str::FromStr;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

/// One line of stream input
#[derive(Debug, Clone, PartialEq)]
pub enum StreamCommand {
    Move(PoseInput),
    Tool(PoseInput),
    Workobject(PoseInput),
    Speed([f64; 4]),
    Zone(ZoneSetting),
    Units { linear: String, angular: String },
    Clear,
    Pause,
    Resume,
    Quit,
}

impl StreamCommand {
    /// Parse one input line. Blank lines and `#` comments yield `None`.
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        line.parse().map(Some)
    }

    /// Opcode the command is sent with; `None` for local-only commands
    pub fn opcode(&self) -> Option<&'static str> {
        match self {
            StreamCommand::Move(_) => Some("30"),
            StreamCommand::Tool(_) => Some("06"),
            StreamCommand::Workobject(_) => Some("07"),
            StreamCommand::Speed(_) => Some("08"),
            StreamCommand::Zone(_) => Some("09"),
            StreamCommand::Clear => Some("31"),
            StreamCommand::Pause => Some("90"),
            StreamCommand::Resume => Some("91"),
            StreamCommand::Units { .. } | StreamCommand::Quit => None,
        }
    }
}

fn parse_numbers(verb: &str, args: &[&str]) -> Result<Vec<f64>> {
    args.iter()
        .map(|arg| {
            arg.parse::<f64>()
                .with_context(|| format!("{}: '{}' is not a number", verb, arg))
        })
        .collect()
}

fn parse_exact<const N: usize>(verb: &str, args: &[&str]) -> Result<[f64; N]> {
    let values = parse_numbers(verb, args)?;
    values
        .try_into()
        .map_err(|v: Vec<f64>| anyhow!("{} takes {} values, got {}", verb, N, v.len()))
}

impl FromStr for StreamCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().ok_or_else(|| anyhow!("empty command"))?;
        let args: Vec<&str> = parts.collect();

        let no_args = |command: StreamCommand| {
            if args.is_empty() {
                Ok(command)
            } else {
                Err(anyhow!("{} takes no arguments", verb))
            }
        };

        match verb.to_ascii_lowercase().as_str() {
            "move" => Ok(StreamCommand::Move(parse_exact::<7>(verb, &args)?.into())),
            "tool" => Ok(StreamCommand::Tool(parse_exact::<7>(verb, &args)?.into())),
            "workobject" => Ok(StreamCommand::Workobject(parse_exact::<7>(verb, &args)?.into())),
            "speed" => Ok(StreamCommand::Speed(parse_exact::<4>(verb, &args)?)),
            "zone" => match args.as_slice() {
                ["point"] => Ok(StreamCommand::Zone(ZoneSetting::point_motion())),
                [key] => Ok(StreamCommand::Zone(ZoneSetting::Named(key.to_lowercase()))),
                _ => Ok(StreamCommand::Zone(ZoneSetting::Manual(parse_exact::<3>(verb, &args)?))),
            },
            "units" => match args.as_slice() {
                [linear, angular] => Ok(StreamCommand::Units {
                    linear: linear.to_string(),
                    angular: angular.to_string(),
                }),
                _ => bail!("units takes <linear> <angular>"),
            },
            "clear" => no_args(StreamCommand::Clear),
            "pause" => no_args(StreamCommand::Pause),
            "resume" => no_args(StreamCommand::Resume),
            "quit" | "exit" => no_args(StreamCommand::Quit),
            other => bail!("unknown command '{}'", other),
        }
    }
}

/// Command streaming processor that reads lines and executes them on a session
pub struct CommandStream {
    session: Session,
    command_count: u64,
}

impl CommandStream {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            command_count: 0,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Commands executed so far
    pub fn command_count(&self) -> u64 {
        self.command_count
    }

    /// Main loop over stdin. Returns on `quit`, end of input, Ctrl+C or SIGTERM.
    pub async fn run(&mut self) -> Result<()> {
        info!("Command streaming active - enter move/tool/workobject/speed/zone/units/clear/pause/resume/quit");
        info!("Use Ctrl+C to disconnect");
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        tokio::select! {
            result = self.run_with(BufReader::new(io::stdin())) => result,
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                Ok(())
            }
        }
    }

    /// Process lines from any buffered reader until `quit` or end of input
    pub async fn run_with<R>(&mut self, reader: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await.context("Failed to read command input")? {
            let command = match StreamCommand::parse_line(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Rejected input '{}': {}", line.trim(), e);
                    json_output::output::error(&e.to_string(), None);
                    continue;
                }
            };
            if command == StreamCommand::Quit {
                info!("Quit requested");
                break;
            }
            if !self.session.is_ready() {
                error!("Session is no longer connected ({})", self.session.state());
                json_output::output::error("session is not connected", command.opcode().map(String::from));
                break;
            }
            self.execute(command).await;
        }
        info!("End of input after {} commands", self.command_count);
        Ok(())
    }

    /// Run one command and report its outcome. Failures are reported, never returned.
    async fn execute(&mut self, command: StreamCommand) {
        self.command_count += 1;
        let opcode = command.opcode().unwrap_or("--");
        if command.opcode().is_some() {
            json_output::output::command_sent(opcode);
        }

        let result: crate::Result<Option<Reply>> = match command {
            StreamCommand::Move(pose) => self.session.buffer_add(pose).await.map(|_| None),
            StreamCommand::Tool(pose) => self.session.set_tool(pose).await,
            StreamCommand::Workobject(pose) => self.session.set_workobject(pose).await,
            StreamCommand::Speed(speed) => self.session.set_speed(speed).await,
            StreamCommand::Zone(zone) => self.session.set_zone(&zone).await,
            StreamCommand::Units { linear, angular } => {
                self.session.set_units(&linear, &angular).map(|_| None)
            }
            StreamCommand::Clear => self.session.clear_buffer().await,
            StreamCommand::Pause => self.session.pause().await,
            StreamCommand::Resume => self.session.resume().await,
            StreamCommand::Quit => Ok(None),
        };

        match result {
            Ok(Some(reply)) => json_output::output::command_acknowledged(opcode, reply.payload()),
            Ok(None) => {}
            Err(e) => {
                error!("Command {} failed: {}", opcode, e);
                json_output::output::command_failed(opcode, &e.to_string());
            }
        }
    }

    /// Disconnect and release both sockets
    pub async fn shutdown(mut self) -> Result<()> {
        self.session.close().await.context("Failed to close session")
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
