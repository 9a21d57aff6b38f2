//! Socket helpers shared by the command channel and the telemetry reader

use std::io;
use std::net::Shutdown;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Connect with an upper bound on the handshake
pub(crate) async fn connect_with_timeout(endpoint: &str, limit: Duration) -> io::Result<TcpStream> {
    match timeout(limit, TcpStream::connect(endpoint)).await {
        Ok(result) => {
            let stream = result?;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect timed out after {:?}", limit),
        )),
    }
}

/// Owns a socket and shuts it down in both directions when dropped.
///
/// Dropping happens on every exit path of the owning task, including task abort and
/// panics, so the peer always sees the connection end.
pub(crate) struct SocketGuard {
    stream: Option<TcpStream>,
    label: &'static str,
}

impl SocketGuard {
    pub(crate) fn new(stream: TcpStream, label: &'static str) -> Self {
        Self {
            stream: Some(stream),
            label,
        }
    }

    pub(crate) fn stream(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("socket is held until the guard drops")
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            match stream.into_std() {
                Ok(std_stream) => {
                    if let Err(e) = std_stream.shutdown(Shutdown::Both) {
                        debug!("{} socket shutdown: {}", self.label, e);
                    }
                }
                Err(e) => debug!("{} socket release: {}", self.label, e),
            }
            debug!("{} socket closed", self.label);
        }
    }
}
