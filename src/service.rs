//! Service manager integration: restarting and inspecting the tunnel unit.
//!
//! The prober only needs [`ServiceControl::restart`]; the `restart` and
//! `status` subcommands use the CLI wrappers at the bottom.

use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::error::WatchdogError;

const SYSTEMCTL: &str = "systemctl";

/// Upper bound on how long a restart child may run before it is killed.
const RESTART_WAIT_LIMIT: Duration = Duration::from_secs(120);

/// Capability to restart the service that provides the tunnel.
pub trait ServiceControl: Send + Sync {
    /// Issue a restart and return without waiting for it to finish.
    fn restart(&self, name: &str) -> Result<(), WatchdogError>;
}

/// `systemctl restart <unit>`, optionally through `sudo -n`.
///
/// At most one restart child runs at a time.
pub struct Systemctl {
    program: OsString,
    use_sudo: bool,
    in_flight: Arc<Semaphore>,
}

impl Systemctl {
    pub fn new(restart_sudo: bool) -> Self {
        Self {
            program: SYSTEMCTL.into(),
            use_sudo: restart_sudo && !is_root(),
            in_flight: Arc::new(Semaphore::new(1)),
        }
    }

    #[cfg(test)]
    fn with_program(program: &str) -> Self {
        Self {
            program: program.into(),
            use_sudo: false,
            in_flight: Arc::new(Semaphore::new(1)),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(&self.program);
            cmd
        } else {
            Command::new(&self.program)
        };
        cmd.args(args);
        cmd
    }

    /// Restart and wait for the service manager's verdict.
    pub async fn restart_and_wait(&self, name: &str) -> Result<(), WatchdogError> {
        let status = self
            .command(&["restart", name])
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| WatchdogError::RestartSpawn {
                service: name.to_string(),
                source,
            })?;

        if !status.success() {
            return Err(WatchdogError::RestartExit {
                service: name.to_string(),
                status,
            });
        }
        Ok(())
    }
}

impl ServiceControl for Systemctl {
    fn restart(&self, name: &str) -> Result<(), WatchdogError> {
        let permit = Arc::clone(&self.in_flight)
            .try_acquire_owned()
            .map_err(|_| WatchdogError::RestartInFlight {
                service: name.to_string(),
            })?;

        let mut child = self
            .command(&["restart", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| WatchdogError::RestartSpawn {
                service: name.to_string(),
                source,
            })?;

        info!(service = %name, sudo = self.use_sudo, "restart issued");

        let service = name.to_string();
        tokio::spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(RESTART_WAIT_LIMIT, child.wait()).await {
                Ok(Ok(status)) if status.success() => {
                    info!(service = %service, "restart completed");
                }
                Ok(Ok(status)) => {
                    let err = WatchdogError::RestartExit { service, status };
                    error!(error = %err, "restart failed");
                }
                Ok(Err(e)) => {
                    warn!(service = %service, error = %e, "failed to wait for restart");
                }
                Err(_) => {
                    warn!(
                        service = %service,
                        limit_secs = RESTART_WAIT_LIMIT.as_secs(),
                        "restart still running, killing it"
                    );
                    let _ = child.kill().await;
                }
            }
        });

        Ok(())
    }
}

pub(crate) fn is_root() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

// ── CLI subcommands (systemd wrappers) ──────────────────────────────────────

/// `tunnel-watchdog restart` -- restart the tunnel service once.
pub async fn cmd_restart(name: &str, restart_sudo: bool) -> anyhow::Result<()> {
    eprintln!("  > systemctl restart {}", name);
    Systemctl::new(restart_sudo).restart_and_wait(name).await?;
    eprintln!("  Service {} restarted.", name);
    Ok(())
}

/// `tunnel-watchdog status` -- show the tunnel service status.
pub fn cmd_status(name: &str) -> anyhow::Result<()> {
    let status = std::process::Command::new(SYSTEMCTL)
        .args(["status", name])
        .status()?;
    // systemctl status returns non-zero when inactive; pass it through
    std::process::exit(status.code().unwrap_or(1));
}
