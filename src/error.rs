use std::net::SocketAddr;
use std::process::ExitStatus;

/// Errors raised outside the per-cycle probe classification.
///
/// Only `Bind` and `InvalidConfig` are fatal; the restart variants are
/// logged by the prober and the loop carries on.
#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("failed to bind responder on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn restart of {service}: {source}")]
    RestartSpawn {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("restart of {service} already in progress")]
    RestartInFlight { service: String },

    #[error("restart of {service} exited with {status}")]
    RestartExit { service: String, status: ExitStatus },
}
