//! Telemetry stream from the RAPID logger
//!
//! The logger socket carries whitespace-delimited status lines. Token 1 of each line
//! selects a record parser; parsed records go to a [`TelemetryObserver`] registered
//! with the session. A bad line is logged and dropped, it never ends the stream.
//! Lines may span several receives; only newline-terminated lines are parsed until the
//! controller closes the socket.

use crate::{
    json_output,
    net::SocketGuard,
    pose::Pose,
    session::SessionState,
    AbbError, Result,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receive buffer size for one telemetry read
const RECV_BUFFER_SIZE: usize = 4096;

/// Discriminator of the remaining-buffer record sent by the stock logger
pub const BUFFER_STATUS_DISCRIMINATOR: &str = "0";

/// One parsed status line. Not retained after the observer returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub discriminator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pose: Option<Pose>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_remaining: Option<u32>,
}

impl TelemetryRecord {
    pub fn buffer_status(discriminator: &str, remaining: u32) -> Self {
        Self {
            discriminator: discriminator.to_string(),
            pose: None,
            buffer_remaining: Some(remaining),
        }
    }
}

/// Parses the tokens of one line whose discriminator it was registered under
pub trait RecordParser: Send + Sync {
    /// `tokens[1]` is the discriminator; fields start at `tokens[2]`
    fn parse(&self, tokens: &[&str]) -> Result<TelemetryRecord>;
}

/// `<header> 0 <remaining>`
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferStatusParser;

impl RecordParser for BufferStatusParser {
    fn parse(&self, tokens: &[&str]) -> Result<TelemetryRecord> {
        if tokens.len() < 3 {
            return Err(AbbError::MalformedTelemetryRecord(format!(
                "buffer status needs 3 tokens, got {}",
                tokens.len()
            )));
        }
        let remaining = parse_field::<u32>(tokens[2], "remaining buffer")?;
        Ok(TelemetryRecord::buffer_status(tokens[1], remaining))
    }
}

/// `<header> <disc> x y z q0 q1 q2 q3 <remaining>` (legacy logger layout)
#[derive(Debug, Clone, Copy, Default)]
pub struct PoseStatusParser;

impl RecordParser for PoseStatusParser {
    fn parse(&self, tokens: &[&str]) -> Result<TelemetryRecord> {
        if tokens.len() < 10 {
            return Err(AbbError::MalformedTelemetryRecord(format!(
                "pose status needs 10 tokens, got {}",
                tokens.len()
            )));
        }
        let values = tokens[2..9]
            .iter()
            .map(|t| parse_field::<f64>(t, "pose component"))
            .collect::<Result<Vec<_>>>()?;
        let pose = Pose::from_flat(&values)
            .map_err(|e| AbbError::MalformedTelemetryRecord(e.to_string()))?;
        let remaining = parse_field::<u32>(tokens[9], "remaining buffer")?;

        Ok(TelemetryRecord {
            discriminator: tokens[1].to_string(),
            pose: Some(pose),
            buffer_remaining: Some(remaining),
        })
    }
}

fn parse_field<T: std::str::FromStr>(token: &str, what: &str) -> Result<T> {
    token
        .parse::<T>()
        .map_err(|_| AbbError::MalformedTelemetryRecord(format!("{} '{}' is not numeric", what, token)))
}

/// Numeric discriminators compare by value, so `00` and `0` select the same parser
fn discriminator_key(token: &str) -> String {
    token
        .parse::<i64>()
        .map(|n| n.to_string())
        .unwrap_or_else(|_| token.to_string())
}

/// Discriminator → parser registry
pub struct TelemetryParser {
    parsers: HashMap<String, Box<dyn RecordParser>>,
}

impl TelemetryParser {
    /// Registry with no parsers
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Add a parser, returning the one previously registered for that discriminator
    pub fn register(
        &mut self,
        discriminator: &str,
        parser: Box<dyn RecordParser>,
    ) -> Option<Box<dyn RecordParser>> {
        self.parsers.insert(discriminator_key(discriminator), parser)
    }

    pub fn with_parser(mut self, discriminator: &str, parser: Box<dyn RecordParser>) -> Self {
        self.register(discriminator, parser);
        self
    }

    /// Parse one line. Blank lines yield `Ok(None)`.
    pub fn parse_line(&self, line: &str) -> Result<Option<TelemetryRecord>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(None);
        }
        if tokens.len() < 2 {
            return Err(AbbError::MalformedTelemetryRecord(format!(
                "missing discriminator in '{}'",
                line.trim()
            )));
        }
        let parser = self.parsers.get(&discriminator_key(tokens[1])).ok_or_else(|| {
            AbbError::MalformedTelemetryRecord(format!("unknown record type '{}'", tokens[1]))
        })?;
        parser.parse(&tokens).map(Some)
    }
}

impl Default for TelemetryParser {
    fn default() -> Self {
        Self::empty().with_parser(BUFFER_STATUS_DISCRIMINATOR, Box::new(BufferStatusParser))
    }
}

/// Receives every parsed telemetry record.
///
/// Called inline on the reader task: a slow observer delays later records but never
/// the command channel.
#[async_trait]
pub trait TelemetryObserver: Send + Sync {
    async fn on_record(&self, record: &TelemetryRecord) -> anyhow::Result<()>;
}

/// Discards all records
#[derive(Debug, Clone, Default)]
pub struct NoOpObserver;

#[async_trait]
impl TelemetryObserver for NoOpObserver {
    async fn on_record(&self, _record: &TelemetryRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs each record through `tracing`
#[derive(Debug, Clone, Default)]
pub struct LoggingObserver;

#[async_trait]
impl TelemetryObserver for LoggingObserver {
    async fn on_record(&self, record: &TelemetryRecord) -> anyhow::Result<()> {
        info!(
            "Telemetry [{}] buffer={:?} pose={:?}",
            record.discriminator, record.buffer_remaining, record.pose
        );
        Ok(())
    }
}

/// Prints each record to stdout as a JSON line
#[derive(Debug, Clone, Default)]
pub struct ConsoleObserver;

#[async_trait]
impl TelemetryObserver for ConsoleObserver {
    async fn on_record(&self, record: &TelemetryRecord) -> anyhow::Result<()> {
        json_output::output::telemetry(record);
        Ok(())
    }
}

/// Publishes the latest record on a watch channel
pub struct WatchObserver {
    sender: watch::Sender<Option<TelemetryRecord>>,
}

impl WatchObserver {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TelemetryRecord>> {
        self.sender.subscribe()
    }
}

impl Default for WatchObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetryObserver for WatchObserver {
    async fn on_record(&self, record: &TelemetryRecord) -> anyhow::Result<()> {
        self.sender.send_replace(Some(record.clone()));
        Ok(())
    }
}

/// Adapts a plain closure
pub struct FnObserver<F>(pub F);

#[async_trait]
impl<F> TelemetryObserver for FnObserver<F>
where
    F: Fn(&TelemetryRecord) + Send + Sync,
{
    async fn on_record(&self, record: &TelemetryRecord) -> anyhow::Result<()> {
        (self.0)(record);
        Ok(())
    }
}

/// Telemetry socket before the continuous loop starts
pub struct TelemetryReader {
    socket: SocketGuard,
    parser: Arc<TelemetryParser>,
    observer: Arc<dyn TelemetryObserver>,
    buffer: Vec<u8>,
    /// Bytes after the last newline, completed by a later receive
    partial: Vec<u8>,
    delivered: u64,
}

impl TelemetryReader {
    pub fn new(
        stream: TcpStream,
        parser: Arc<TelemetryParser>,
        observer: Arc<dyn TelemetryObserver>,
    ) -> Self {
        Self {
            socket: SocketGuard::new(stream, "telemetry"),
            parser,
            observer,
            buffer: vec![0u8; RECV_BUFFER_SIZE],
            partial: Vec::new(),
            delivered: 0,
        }
    }

    /// One bounded read, parsed and delivered like any other. Returns records delivered.
    ///
    /// A record still missing its newline is kept for the continuous loop.
    pub async fn prime(&mut self, limit: Duration) -> Result<usize> {
        let received = tokio::time::timeout(limit, self.receive())
            .await
            .map_err(|_| {
                AbbError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no telemetry within {:?}", limit),
                ))
            })??;
        if received {
            Ok(self.dispatch_complete_lines().await)
        } else {
            Err(AbbError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "telemetry closed during priming read",
            )))
        }
    }

    /// Read one chunk into the line buffer; `false` on orderly close
    async fn receive(&mut self) -> Result<bool> {
        let n = self.socket.stream().read(&mut self.buffer).await?;
        self.partial.extend_from_slice(&self.buffer[..n]);
        Ok(n > 0)
    }

    /// Deliver every newline-terminated line received so far
    async fn dispatch_complete_lines(&mut self) -> usize {
        let Some(end) = self.partial.iter().rposition(|&b| b == b'\n') else {
            if self.partial.len() > RECV_BUFFER_SIZE {
                warn!(
                    "Dropping {} telemetry bytes without a line break",
                    self.partial.len()
                );
                self.partial.clear();
            }
            return 0;
        };
        let complete: Vec<u8> = self.partial.drain(..=end).collect();
        self.dispatch(&String::from_utf8_lossy(&complete)).await
    }

    /// Deliver an unterminated last record once the controller has closed the stream
    async fn dispatch_remainder(&mut self) -> usize {
        if self.partial.is_empty() {
            return 0;
        }
        let rest = std::mem::take(&mut self.partial);
        self.dispatch(&String::from_utf8_lossy(&rest)).await
    }

    /// Parse each line of a chunk and hand records to the observer
    async fn dispatch(&mut self, chunk: &str) -> usize {
        let mut count = 0;
        for line in chunk.lines() {
            match self.parser.parse_line(line) {
                Ok(Some(record)) => {
                    debug!("Telemetry record: {:?}", record);
                    if let Err(e) = self.observer.on_record(&record).await {
                        warn!("Telemetry observer failed: {}", e);
                    }
                    count += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("Dropping telemetry line '{}': {}", line.trim(), e),
            }
        }
        self.delivered += count as u64;
        count
    }

    /// Start the continuous receive loop on its own task
    pub fn spawn(self) -> TelemetryHandle {
        let (state_tx, state_rx) = watch::channel(SessionState::Connected);
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(self.run(state_tx, Arc::clone(&shutdown)));

        TelemetryHandle {
            state: state_rx,
            shutdown,
            task: Some(task),
        }
    }

    async fn run(mut self, state: watch::Sender<SessionState>, shutdown: Arc<Notify>) -> u64 {
        info!("Telemetry loop started");
        loop {
            let received = tokio::select! {
                _ = shutdown.notified() => {
                    state.send_replace(SessionState::Closing);
                    info!("Telemetry loop stopping on request");
                    break;
                }
                received = self.receive() => received,
            };

            match received {
                Ok(true) => {
                    self.dispatch_complete_lines().await;
                }
                Ok(false) => {
                    info!("Telemetry socket closed by controller");
                    self.dispatch_remainder().await;
                    break;
                }
                Err(e) => {
                    warn!("Telemetry receive failed: {}", e);
                    break;
                }
            }
        }

        let delivered = self.delivered;
        // Dropping self releases the socket guard
        drop(self);
        state.send_replace(SessionState::Closed);
        info!("Telemetry loop ended after {} records", delivered);
        delivered
    }
}

/// Running telemetry loop
pub struct TelemetryHandle {
    state: watch::Receiver<SessionState>,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<u64>>,
}

impl TelemetryHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch lifecycle changes of the reader
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Interrupt the receive loop and wait for the socket to be released.
    /// Returns the number of records delivered.
    pub async fn stop(&mut self) -> Result<u64> {
        let Some(task) = self.task.take() else {
            return Ok(0);
        };
        self.shutdown.notify_one();
        Ok(task.await?)
    }
}

impl Drop for TelemetryHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_buffer_status_line() {
        let parser = TelemetryParser::default();
        let record = parser.parse_line("# 0 17").unwrap().unwrap();
        assert_eq!(record.discriminator, "0");
        assert_eq!(record.buffer_remaining, Some(17));
        assert!(record.pose.is_none());

        let record = parser.parse_line("# 00 3 trailing").unwrap().unwrap();
        assert_eq!(record.buffer_remaining, Some(3));
    }

    #[test]
    fn test_malformed_lines() {
        let parser = TelemetryParser::default();
        assert!(parser.parse_line("   ").unwrap().is_none());
        for line in ["#", "# 0", "# 0 many", "# 7 12", "# 0 -4"] {
            let result = parser.parse_line(line);
            assert!(
                matches!(result, Err(AbbError::MalformedTelemetryRecord(_))),
                "accepted '{}'",
                line
            );
        }
    }

    #[test]
    fn test_registered_pose_parser() {
        let parser = TelemetryParser::default().with_parser("1", Box::new(PoseStatusParser));
        let record = parser
            .parse_line("# 1 100.0 0 250.5 1 0 0 0 42")
            .unwrap()
            .unwrap();
        let pose = record.pose.unwrap();
        assert_eq!(pose.position, [100.0, 0.0, 250.5]);
        assert_eq!(pose.orientation, [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(record.buffer_remaining, Some(42));

        // existing parsers untouched
        assert_eq!(parser.parse_line("# 0 5").unwrap().unwrap().buffer_remaining, Some(5));
        assert!(parser.parse_line("# 1 1 2 3").is_err());
    }

    async fn reader_pair(
        observer: Arc<dyn TelemetryObserver>,
    ) -> (TelemetryReader, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let reader = TelemetryReader::new(client.unwrap(), Arc::new(TelemetryParser::default()), observer);
        (reader, server.unwrap().0)
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_stop_loop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer = Arc::new(FnObserver(move |r: &TelemetryRecord| {
            sink.lock().unwrap().push(r.buffer_remaining);
        }));

        let (mut reader, mut controller) = reader_pair(observer).await;
        controller.write_all(b"# 0 9\n").await.unwrap();
        assert_eq!(reader.prime(Duration::from_secs(2)).await.unwrap(), 1);

        let mut handle = reader.spawn();
        controller.write_all(b"# 0 not-a-number\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.write_all(b"# 0 8\n").await.unwrap();

        for _ in 0..100 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![Some(9), Some(8)]);
        assert_eq!(handle.state(), SessionState::Connected);

        assert_eq!(handle.stop().await.unwrap(), 2);
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_controller_close_ends_loop() {
        let observer = Arc::new(WatchObserver::new());
        let mut latest = observer.subscribe();
        let (reader, mut controller) = reader_pair(observer).await;
        let handle = reader.spawn();
        let mut state = handle.state_receiver();

        controller.write_all(b"# 0 1\n# 0 2\n").await.unwrap();
        latest.changed().await.unwrap();
        drop(controller);

        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == SessionState::Closed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.borrow().as_ref().unwrap().discriminator, "0");
    }

    fn recording_observer() -> (Arc<dyn TelemetryObserver>, Arc<Mutex<Vec<Option<u32>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: Arc<dyn TelemetryObserver> = Arc::new(FnObserver(move |r: &TelemetryRecord| {
            sink.lock().unwrap().push(r.buffer_remaining);
        }));
        (observer, seen)
    }

    async fn wait_for_records(seen: &Mutex<Vec<Option<u32>>>, count: usize) {
        for _ in 0..100 {
            if seen.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_record_split_across_segments_is_reassembled() {
        let (observer, seen) = recording_observer();
        let (mut reader, mut controller) = reader_pair(observer).await;

        controller.write_all(b"# 0 4\n# 0 1").await.unwrap();
        assert_eq!(reader.prime(Duration::from_secs(2)).await.unwrap(), 1);

        let mut handle = reader.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.write_all(b"7\n# 0").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.write_all(b" 3\n").await.unwrap();

        wait_for_records(&seen, 3).await;
        assert_eq!(*seen.lock().unwrap(), vec![Some(4), Some(17), Some(3)]);
        assert_eq!(handle.stop().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unterminated_last_record_delivered_on_close() {
        let (observer, seen) = recording_observer();
        let (reader, mut controller) = reader_pair(observer).await;
        let handle = reader.spawn();
        let mut state = handle.state_receiver();

        controller.write_all(b"# 0 5").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());
        drop(controller);

        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == SessionState::Closed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Some(5)]);
    }

    #[tokio::test]
    async fn test_prime_times_out_on_silent_controller() {
        let (mut reader, _controller) = reader_pair(Arc::new(NoOpObserver)).await;
        let err = reader.prime(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, AbbError::Io(ref e) if e.kind() == std::io::ErrorKind::TimedOut));
    }
}
