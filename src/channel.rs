//! Serialized command channel to the RAPID motion server
//!
//! Commands are queued in two classes and written by a single dispatcher task, so at
//! most one frame is ever in flight on the socket. The priority queue is always drained
//! before the normal queue.

use crate::{
    commands,
    net::SocketGuard,
    protocol::{Command, Frame, Reply, TERMINATOR},
    session::SessionState,
    AbbError, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Order in which entries are taken from within one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOrder {
    /// Oldest first
    #[default]
    Fifo,
    /// Newest first ("most recent command wins")
    Lifo,
}

/// Timing and ordering knobs for a channel
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Upper bound on waiting for one reply frame
    pub reply_timeout: Duration,
    /// Upper bound on draining the queues during `close()`
    pub close_timeout: Duration,
    /// Pause after each dispatched frame
    pub inter_command_delay: Duration,
    pub queue_order: QueueOrder,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(5),
            inter_command_delay: Duration::from_millis(40),
            queue_order: QueueOrder::Fifo,
        }
    }
}

type Completion = oneshot::Sender<Result<Option<Reply>>>;

struct QueueEntry {
    seq: u64,
    command: Command,
    frame: Frame,
    completion: Completion,
    /// Disconnect frame; nothing is dispatched after it
    terminal: bool,
}

enum Next {
    Entry(QueueEntry),
    Idle,
    Finished,
}

struct DispatchQueues {
    priority: VecDeque<QueueEntry>,
    normal: VecDeque<QueueEntry>,
    order: QueueOrder,
    next_seq: u64,
    accepting: bool,
}

impl DispatchQueues {
    fn new(order: QueueOrder) -> Self {
        Self {
            priority: VecDeque::new(),
            normal: VecDeque::new(),
            order,
            next_seq: 0,
            accepting: true,
        }
    }

    fn push(&mut self, command: Command, frame: Frame, completion: Completion, terminal: bool) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = QueueEntry {
            seq,
            command,
            frame,
            completion,
            terminal,
        };
        let queue = if entry.command.priority() {
            &mut self.priority
        } else {
            &mut self.normal
        };
        match (self.order, terminal) {
            // keep a terminal entry behind everything already queued
            (QueueOrder::Lifo, true) => queue.push_front(entry),
            _ => queue.push_back(entry),
        }
        seq
    }

    fn pop_next(&mut self) -> Next {
        let queue = if !self.priority.is_empty() {
            &mut self.priority
        } else {
            &mut self.normal
        };
        let entry = match self.order {
            QueueOrder::Fifo => queue.pop_front(),
            QueueOrder::Lifo => queue.pop_back(),
        };
        match entry {
            Some(entry) => Next::Entry(entry),
            None if self.accepting => Next::Idle,
            None => Next::Finished,
        }
    }

    /// Fail every queued entry with `ChannelClosed`
    fn reject_all(&mut self) -> usize {
        self.accepting = false;
        let mut rejected = 0;
        for entry in self.priority.drain(..).chain(self.normal.drain(..)) {
            warn!("Rejecting queued command {} (#{})", entry.command.opcode(), entry.seq);
            let _ = entry.completion.send(Err(AbbError::ChannelClosed));
            rejected += 1;
        }
        rejected
    }
}

struct Inner {
    queues: Mutex<DispatchQueues>,
    wakeup: Notify,
    in_flight: AtomicBool,
    dispatched: AtomicU64,
    state: watch::Sender<SessionState>,
    task: Mutex<Option<JoinHandle<()>>>,
    options: ChannelOptions,
}

/// Snapshot of channel activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    pub priority_queued: usize,
    pub normal_queued: usize,
    pub dispatched: u64,
    pub in_flight: bool,
    pub state: SessionState,
}

/// Resolves once a queued command was written and, if it expects one, replied to
pub struct CommandTicket {
    seq: u64,
    receiver: oneshot::Receiver<Result<Option<Reply>>>,
}

impl CommandTicket {
    /// Enqueue order of the command
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub async fn wait(self) -> Result<Option<Reply>> {
        self.receiver.await.unwrap_or(Err(AbbError::ChannelClosed))
    }
}

/// Handle to the command socket. Cheap to clone; all clones share one dispatcher.
#[derive(Clone)]
pub struct CommandChannel {
    inner: Arc<Inner>,
}

impl CommandChannel {
    /// Take ownership of a connected socket and start the dispatcher task
    pub fn start(stream: TcpStream, options: ChannelOptions) -> Self {
        let (state, _) = watch::channel(SessionState::Connected);
        let inner = Arc::new(Inner {
            queues: Mutex::new(DispatchQueues::new(options.queue_order)),
            wakeup: Notify::new(),
            in_flight: AtomicBool::new(false),
            dispatched: AtomicU64::new(0),
            state,
            task: Mutex::new(None),
            options,
        });

        let task = tokio::spawn(dispatch_loop(
            Arc::clone(&inner),
            SocketGuard::new(stream, "motion"),
        ));
        if let Ok(mut slot) = inner.task.try_lock() {
            *slot = Some(task);
        }

        Self { inner }
    }

    /// Queue a command and wait for it to complete
    pub async fn submit(&self, command: Command) -> Result<Option<Reply>> {
        self.enqueue(command).await?.wait().await
    }

    /// Queue a command without waiting. Encoding errors surface here, before any write.
    pub async fn enqueue(&self, command: Command) -> Result<CommandTicket> {
        let frame = command.encode()?;
        let (completion, receiver) = oneshot::channel();
        let seq = {
            let mut queues = self.inner.queues.lock().await;
            if !queues.accepting {
                return Err(AbbError::ChannelClosed);
            }
            queues.push(command, frame, completion, false)
        };
        self.inner.wakeup.notify_one();
        Ok(CommandTicket { seq, receiver })
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle changes of the channel
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub async fn stats(&self) -> ChannelStats {
        let queues = self.inner.queues.lock().await;
        ChannelStats {
            priority_queued: queues.priority.len(),
            normal_queued: queues.normal.len(),
            dispatched: self.inner.dispatched.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            state: self.state(),
        }
    }

    /// Send the disconnect command, drain what is queued within the close timeout,
    /// reject the rest and release the socket.
    pub async fn close(&self) -> Result<()> {
        let disconnect = commands::disconnect().encode()?;
        {
            let mut queues = self.inner.queues.lock().await;
            if queues.accepting {
                queues.accepting = false;
                let (completion, _) = oneshot::channel();
                queues.push(commands::disconnect(), disconnect, completion, true);
            }
        }
        self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Connected {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });
        self.inner.wakeup.notify_one();

        let task = self.inner.task.lock().await.take();
        if let Some(mut task) = task {
            match timeout(self.inner.options.close_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Command dispatcher ended abnormally: {}", e),
                Err(_) => {
                    warn!(
                        "Command queue not drained within {:?}, aborting dispatcher",
                        self.inner.options.close_timeout
                    );
                    task.abort();
                    let _ = task.await;
                }
            }
        }

        let rejected = self.inner.queues.lock().await.reject_all();
        if rejected > 0 {
            warn!("{} queued commands rejected on close", rejected);
        }
        self.inner.state.send_replace(SessionState::Closed);
        info!("Disconnected from ABB robot");
        Ok(())
    }

    /// Stop the dispatcher without sending the disconnect frame. Queued and in-flight
    /// commands fail with `ChannelClosed`, as does every later submit.
    pub fn abort(&self) {
        if let Ok(mut slot) = self.inner.task.try_lock() {
            if let Some(task) = slot.take() {
                warn!("Aborting command dispatcher");
                task.abort();
            }
        }

        match self.inner.queues.try_lock() {
            Ok(mut queues) => {
                queues.reject_all();
            }
            Err(_) => {
                // a submitter holds the lock briefly; reject once it is released
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        let inner = Arc::clone(&self.inner);
                        runtime.spawn(async move {
                            inner.queues.lock().await.reject_all();
                        });
                    }
                    Err(_) => error!("No runtime to reject queued commands on abort"),
                }
            }
        }
        self.inner.state.send_replace(SessionState::Closed);
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut socket: SocketGuard) {
    let mut pending = Vec::new();

    loop {
        let next = inner.queues.lock().await.pop_next();
        let entry = match next {
            Next::Entry(entry) => entry,
            Next::Idle => {
                inner.wakeup.notified().await;
                continue;
            }
            Next::Finished => break,
        };

        if inner.in_flight.swap(true, Ordering::AcqRel) {
            error!("Dispatcher re-entered while a frame was in flight");
        }
        let result = transmit(&mut socket, &mut pending, &entry, &inner.options).await;
        inner.in_flight.store(false, Ordering::Release);
        inner.dispatched.fetch_add(1, Ordering::Relaxed);

        let fatal = match &result {
            Err(AbbError::ProtocolTimeout { .. }) | Err(AbbError::Io(_)) => true,
            _ => entry.terminal,
        };
        if let Err(e) = &result {
            error!("Command {} failed: {}", entry.command.opcode(), e);
        }
        let _ = entry.completion.send(result);

        if fatal {
            inner.state.send_replace(SessionState::Closing);
            inner.queues.lock().await.reject_all();
            break;
        }
        if !inner.options.inter_command_delay.is_zero() {
            sleep(inner.options.inter_command_delay).await;
        }
    }

    drop(socket);
    inner.state.send_replace(SessionState::Closed);
    debug!("Command dispatcher stopped");
}

async fn transmit(
    socket: &mut SocketGuard,
    pending: &mut Vec<u8>,
    entry: &QueueEntry,
    options: &ChannelOptions,
) -> Result<Option<Reply>> {
    let stream = socket.stream();
    debug!("#{} sending: {}", entry.seq, entry.frame);
    stream.write_all(entry.frame.as_bytes()).await?;

    if !entry.command.expects_reply() {
        return Ok(None);
    }

    let reply = timeout(options.reply_timeout, read_reply(stream, pending))
        .await
        .map_err(|_| AbbError::ProtocolTimeout {
            opcode: entry.command.opcode().to_string(),
            timeout_ms: options.reply_timeout.as_millis(),
        })??;
    debug!("#{} received: {}", entry.seq, reply.raw);
    Ok(Some(reply))
}

/// Read up to and including the next terminator byte
async fn read_reply(stream: &mut TcpStream, pending: &mut Vec<u8>) -> Result<Reply> {
    let mut buffer = [0u8; 1024];
    loop {
        if let Some(end) = pending.iter().position(|&b| b == TERMINATOR) {
            let frame: Vec<u8> = pending.drain(..=end).collect();
            return Ok(Reply::parse(&frame));
        }
        let n = stream.read(&mut buffer).await?;
        if n == 0 {
            return Err(AbbError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "motion server closed the connection",
            )));
        }
        pending.extend_from_slice(&buffer[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FieldSpec, Opcode, FRAME_LEN};
    use tokio::net::TcpListener;

    fn test_options() -> ChannelOptions {
        ChannelOptions {
            reply_timeout: Duration::from_millis(500),
            close_timeout: Duration::from_millis(500),
            inter_command_delay: Duration::ZERO,
            queue_order: QueueOrder::Fifo,
        }
    }

    async fn channel_pair(options: ChannelOptions) -> (CommandChannel, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (CommandChannel::start(client.unwrap(), options), server.unwrap().0)
    }

    async fn read_frame(controller: &mut TcpStream) -> String {
        let mut buf = [0u8; FRAME_LEN];
        controller.read_exact(&mut buf).await.unwrap();
        String::from_utf8(buf.to_vec()).unwrap()
    }

    async fn ack(controller: &mut TcpStream, opcode: &str) {
        let reply = format!("{} 1 {}#", opcode, "*".repeat(10));
        controller.write_all(reply.as_bytes()).await.unwrap();
    }

    fn cmd(opcode: &str) -> Command {
        Command::new(Opcode::new(opcode).unwrap()).expect_reply(false)
    }

    #[tokio::test]
    async fn test_submit_returns_reply() {
        let (channel, mut controller) = channel_pair(test_options()).await;
        let submit = tokio::spawn({
            let channel = channel.clone();
            async move { channel.submit(commands::pause()).await }
        });

        let frame = read_frame(&mut controller).await;
        assert!(frame.starts_with("90 "));
        ack(&mut controller, "90").await;

        let reply = submit.await.unwrap().unwrap().unwrap();
        assert_eq!(reply.opcode.as_deref(), Some("90"));
        assert!(reply.is_ok());
        assert_eq!(channel.stats().await.dispatched, 1);
    }

    #[tokio::test]
    async fn test_priority_then_normal_fifo() {
        let (channel, mut controller) = channel_pair(test_options()).await;

        // hold the dispatcher on a reply so everything below queues up
        let blocker = channel
            .enqueue(Command::new(Opcode::new("B0").unwrap()))
            .await
            .unwrap();
        assert!(read_frame(&mut controller).await.starts_with("B0"));

        let mut tickets = Vec::new();
        for op in ["N1", "N2", "N3"] {
            tickets.push(channel.enqueue(cmd(op)).await.unwrap());
        }
        for op in ["P1", "P2"] {
            tickets.push(channel.enqueue(cmd(op).prioritized(true)).await.unwrap());
        }
        let stats = channel.stats().await;
        assert_eq!((stats.priority_queued, stats.normal_queued), (2, 3));
        assert!(stats.in_flight);

        ack(&mut controller, "B0").await;
        blocker.wait().await.unwrap();

        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(read_frame(&mut controller).await[..2].to_string());
        }
        assert_eq!(order, vec!["P1", "P2", "N1", "N2", "N3"]);
        for ticket in tickets {
            assert!(ticket.wait().await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_lifo_policy_reverses_within_class() {
        let options = ChannelOptions {
            queue_order: QueueOrder::Lifo,
            ..test_options()
        };
        let (channel, mut controller) = channel_pair(options).await;
        let blocker = channel
            .enqueue(Command::new(Opcode::new("B0").unwrap()))
            .await
            .unwrap();
        read_frame(&mut controller).await;

        for op in ["N1", "N2"] {
            channel.enqueue(cmd(op)).await.unwrap();
        }
        channel.enqueue(cmd("P1").prioritized(true)).await.unwrap();
        ack(&mut controller, "B0").await;
        blocker.wait().await.unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(read_frame(&mut controller).await[..2].to_string());
        }
        assert_eq!(order, vec!["P1", "N2", "N1"]);
    }

    #[tokio::test]
    async fn test_concurrent_submitters_never_interleave() {
        let (channel, mut controller) = channel_pair(test_options()).await;
        let mut producers = Vec::new();
        for i in 0..8 {
            let channel = channel.clone();
            producers.push(tokio::spawn(async move {
                let command = cmd("30").fields([i as f64; 7], FieldSpec::new(8, 1));
                channel.submit(command).await
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            let frame = read_frame(&mut controller).await;
            assert!(frame.starts_with("30 ") && frame.ends_with('#'), "torn frame {}", frame);
            seen.push(frame);
        }
        for producer in producers {
            producer.await.unwrap().unwrap();
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 8);
    }

    #[tokio::test]
    async fn test_encoding_error_fails_before_write() {
        let (channel, mut controller) = channel_pair(test_options()).await;
        let oversized = cmd("08").field(1_000_000.0, FieldSpec::new(8, 1));
        assert!(matches!(
            channel.submit(oversized).await,
            Err(AbbError::EncodingOverflow(_))
        ));

        // channel still usable and nothing was written for the bad command
        channel.submit(cmd("31")).await.unwrap();
        assert!(read_frame(&mut controller).await.starts_with("31 "));
        assert_eq!(channel.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_reply_timeout_closes_channel() {
        let options = ChannelOptions {
            reply_timeout: Duration::from_millis(50),
            ..test_options()
        };
        let (channel, mut controller) = channel_pair(options).await;
        let mut state = channel.state_receiver();

        let waiting = channel.enqueue(commands::clear_buffer()).await.unwrap();
        let queued = channel.enqueue(cmd("91")).await.unwrap();
        read_frame(&mut controller).await;

        assert!(matches!(waiting.wait().await, Err(AbbError::ProtocolTimeout { .. })));
        assert!(matches!(queued.wait().await, Err(AbbError::ChannelClosed)));
        state.wait_for(|s| *s == SessionState::Closed).await.unwrap();
        assert!(matches!(channel.submit(cmd("90")).await, Err(AbbError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_close_drains_queue_then_disconnects() {
        let (channel, mut controller) = channel_pair(test_options()).await;
        let blocker = channel
            .enqueue(Command::new(Opcode::new("B0").unwrap()))
            .await
            .unwrap();
        read_frame(&mut controller).await;
        let first = channel.enqueue(cmd("N1")).await.unwrap();
        let second = channel.enqueue(cmd("N2")).await.unwrap();

        let closing = tokio::spawn({
            let channel = channel.clone();
            async move { channel.close().await }
        });
        ack(&mut controller, "B0").await;

        assert!(read_frame(&mut controller).await.starts_with("N1"));
        assert!(read_frame(&mut controller).await.starts_with("N2"));
        assert!(read_frame(&mut controller).await.starts_with("99"));

        closing.await.unwrap().unwrap();
        blocker.wait().await.unwrap();
        first.wait().await.unwrap();
        second.wait().await.unwrap();
        assert_eq!(channel.state(), SessionState::Closed);
        assert!(matches!(channel.submit(cmd("90")).await, Err(AbbError::ChannelClosed)));

        // socket is shut down after the disconnect frame
        let mut rest = Vec::new();
        controller.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_abort_rejects_in_flight_queued_and_later_commands() {
        let (channel, mut controller) = channel_pair(test_options()).await;
        let blocker = channel
            .enqueue(Command::new(Opcode::new("B0").unwrap()))
            .await
            .unwrap();
        read_frame(&mut controller).await;
        let queued = channel.enqueue(cmd("N1")).await.unwrap();

        channel.abort();

        let bounded = Duration::from_secs(2);
        let blocker = timeout(bounded, blocker.wait()).await.expect("blocker resolved");
        assert!(matches!(blocker, Err(AbbError::ChannelClosed)));
        let queued = timeout(bounded, queued.wait()).await.expect("queued ticket resolved");
        assert!(matches!(queued, Err(AbbError::ChannelClosed)));
        let later = timeout(bounded, channel.submit(cmd("90"))).await.expect("submit resolved");
        assert!(matches!(later, Err(AbbError::ChannelClosed)));
        assert_eq!(channel.state(), SessionState::Closed);

        // aborting twice or closing afterwards is harmless
        channel.abort();
        channel.close().await.unwrap();
        assert_eq!(channel.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_reply_split_across_reads() {
        let (channel, mut controller) = channel_pair(test_options()).await;
        let ticket = channel.enqueue(commands::clear_buffer()).await.unwrap();
        read_frame(&mut controller).await;

        controller.write_all(b"31 1 **").await.unwrap();
        controller.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.write_all(b"*****#").await.unwrap();

        let reply = ticket.wait().await.unwrap().unwrap();
        assert_eq!(reply.opcode.as_deref(), Some("31"));
        assert!(reply.is_ok());
        assert_eq!(reply.raw, "31 1 *******#");
    }

    #[tokio::test]
    async fn test_two_replies_in_one_read_go_to_their_own_commands() {
        let (channel, mut controller) = channel_pair(test_options()).await;
        let first = channel
            .enqueue(Command::new(Opcode::new("A1").unwrap()))
            .await
            .unwrap();
        let second = channel
            .enqueue(Command::new(Opcode::new("A2").unwrap()))
            .await
            .unwrap();

        assert!(read_frame(&mut controller).await.starts_with("A1 "));
        controller.write_all(b"A1 1 ***#A2 0 ***#").await.unwrap();

        let first = first.wait().await.unwrap().unwrap();
        assert_eq!(first.opcode.as_deref(), Some("A1"));
        assert!(first.is_ok());

        // A2's reply was already buffered, yet A2 is still written before it resolves
        assert!(read_frame(&mut controller).await.starts_with("A2 "));
        let second = second.wait().await.unwrap().unwrap();
        assert_eq!(second.opcode.as_deref(), Some("A2"));
        assert_eq!(second.status, Some(0));
        assert_eq!(channel.stats().await.dispatched, 2);
    }

    #[tokio::test]
    async fn test_close_rejects_queue_when_drain_times_out() {
        let options = ChannelOptions {
            reply_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_millis(100),
            ..test_options()
        };
        let (channel, mut controller) = channel_pair(options).await;
        let blocker = channel
            .enqueue(Command::new(Opcode::new("B0").unwrap()))
            .await
            .unwrap();
        read_frame(&mut controller).await;
        let queued = channel.enqueue(cmd("N1")).await.unwrap();

        channel.close().await.unwrap();
        assert!(matches!(queued.wait().await, Err(AbbError::ChannelClosed)));
        assert!(matches!(blocker.wait().await, Err(AbbError::ChannelClosed)));
        assert_eq!(channel.state(), SessionState::Closed);
    }
}
