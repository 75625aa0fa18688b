//! Probe client: one connect/acknowledge round trip and its classification.
//!
//! Wire protocol: the client connects and sends nothing, the responder writes
//! exactly [`ACK_PAYLOAD`] and closes. A short or absent read within the
//! timeout counts as a timeout.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Fixed 8-byte acknowledgment written by the responder.
pub const ACK_PAYLOAD: &[u8; 8] = b"-hellow-";

/// Result of one probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Timeout,
    ConnectionRefused,
    OtherIoError,
}

impl ProbeOutcome {
    pub fn is_success(self) -> bool {
        self == ProbeOutcome::Success
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProbeOutcome::Success => "success",
            ProbeOutcome::Timeout => "timeout",
            ProbeOutcome::ConnectionRefused => "connection_refused",
            ProbeOutcome::OtherIoError => "other_io_error",
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connect to `host:port` and wait for the acknowledgment.
///
/// Connect and read share a single `probe_timeout` deadline. The stream is
/// dropped before returning on every path.
pub async fn probe_once(host: &str, port: u16, probe_timeout: Duration) -> ProbeOutcome {
    match timeout(probe_timeout, exchange(host, port)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!(
                host,
                port,
                timeout_ms = probe_timeout.as_millis() as u64,
                "probe timed out"
            );
            ProbeOutcome::Timeout
        }
    }
}

async fn exchange(host: &str, port: u16) -> ProbeOutcome {
    let mut stream = match TcpStream::connect((host, port)).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(host, port, error = %e, "probe connect failed");
            return classify_io_error(&e);
        }
    };

    let mut buf = [0u8; ACK_PAYLOAD.len()];
    match stream.read_exact(&mut buf).await {
        Ok(_) if &buf == ACK_PAYLOAD => ProbeOutcome::Success,
        Ok(_) => {
            debug!(
                host,
                port,
                received = ?String::from_utf8_lossy(&buf),
                "unexpected acknowledgment"
            );
            ProbeOutcome::OtherIoError
        }
        Err(e) => {
            debug!(host, port, error = %e, "probe read failed");
            classify_io_error(&e)
        }
    }
}

/// Map an I/O error from connect or read onto a probe outcome.
///
/// `UnexpectedEof` is the short-read case: the peer closed before the full
/// payload arrived.
pub fn classify_io_error(err: &io::Error) -> ProbeOutcome {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => ProbeOutcome::ConnectionRefused,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::UnexpectedEof => {
            ProbeOutcome::Timeout
        }
        _ => ProbeOutcome::OtherIoError,
    }
}
