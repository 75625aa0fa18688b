//! Liveness responder: answers every connection with the probe acknowledgment.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::WatchdogError;
use crate::probe::client::ACK_PAYLOAD;

/// Pause after a failed accept so persistent errors (EMFILE) do not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Bind the responder socket with `SO_REUSEADDR` so a quick restart of the
/// watchdog does not trip over a socket left in TIME_WAIT.
///
/// Must be called from within a tokio runtime.
pub fn bind(addr: SocketAddr) -> Result<TcpListener, WatchdogError> {
    let bind_err = |source| WatchdogError::Bind { addr, source };

    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(128).map_err(bind_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(bind_err)
}

/// Serve acknowledgments until shutdown is signalled.
///
/// The listener is owned by this task and dropped when it returns, which
/// closes the port exactly once.
pub async fn run(
    listener: TcpListener,
    write_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    match listener.local_addr() {
        Ok(addr) => info!(addr = %addr, "responder listening"),
        Err(e) => warn!(error = %e, "responder listening on unknown address"),
    }

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        if !pause_after_accept_error(&mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                };

                debug!(peer = %peer_addr, "probe connection");
                if let Err(e) = acknowledge(stream, write_timeout).await {
                    warn!(peer = %peer_addr, error = %e, "failed to acknowledge probe");
                }
            }
            _ = shutdown.changed() => {
                debug!("responder received shutdown signal");
                break;
            }
        }
    }

    drop(listener);
    info!("responder stopped");
}

/// Sleep for [`ACCEPT_ERROR_BACKOFF`]. Returns false if shutdown arrived
/// in the meantime.
async fn pause_after_accept_error(shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
        _ = shutdown.changed() => false,
    }
}

/// Write the acknowledgment and close. No partial-write retry: the payload
/// is 8 bytes and any failure discards the connection.
async fn acknowledge(mut stream: TcpStream, write_timeout: Duration) -> std::io::Result<()> {
    let write = async {
        stream.write_all(ACK_PAYLOAD).await?;
        stream.shutdown().await
    };

    match timeout(write_timeout, write).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "acknowledgment write timed out",
        )),
    }
}
