use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::WatchdogError;

/// Tunnel liveness watchdog.
///
/// Answers probes on a local port, probes the same port through the
/// tunnel's far end, and restarts the tunnel service when the probe fails
/// while the internet is still reachable.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Service manager unit that provides the tunnel
    #[arg(long, env = "TUNNEL_WATCHDOG_SERVICE_NAME", default_value = "ssh_tunnels")]
    pub service_name: String,

    /// Local address the responder binds to
    #[arg(long, env = "TUNNEL_WATCHDOG_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Port used by both the responder and the prober
    #[arg(long, env = "TUNNEL_WATCHDOG_PROBE_PORT", default_value_t = 20080)]
    pub probe_port: u16,

    /// Far-side host of the tunnel that forwards back to the responder
    #[arg(
        long,
        env = "TUNNEL_WATCHDOG_REMOTE_PROBE_HOST",
        default_value = "127.0.0.1"
    )]
    pub remote_probe_host: String,

    /// Seconds between probes while the tunnel is healthy
    #[arg(long, env = "TUNNEL_WATCHDOG_PING_INTERVAL", default_value_t = 120)]
    pub ping_interval_secs: u64,

    /// Seconds before re-probing after a failed probe
    #[arg(long, env = "TUNNEL_WATCHDOG_RETRY_DELAY", default_value_t = 10)]
    pub retry_delay_secs: u64,

    /// Connect and read timeout for one probe, in seconds
    #[arg(long, env = "TUNNEL_WATCHDOG_PROBE_TIMEOUT", default_value_t = 10)]
    pub probe_timeout_secs: u64,

    /// URL fetched to decide whether the internet is reachable
    #[arg(
        long,
        env = "TUNNEL_WATCHDOG_REACHABILITY_URL",
        default_value = "http://connectivitycheck.gstatic.com/generate_204"
    )]
    pub reachability_url: String,

    /// Reachability request timeout in seconds
    #[arg(long, env = "TUNNEL_WATCHDOG_REACHABILITY_TIMEOUT", default_value_t = 5)]
    pub reachability_timeout_secs: u64,

    /// Prefix the restart command with `sudo -n` when not running as root
    #[arg(long, env = "TUNNEL_WATCHDOG_RESTART_SUDO", default_value_t = false)]
    pub restart_sudo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TUNNEL_WATCHDOG_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "TUNNEL_WATCHDOG_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Also append logs to this file
    #[arg(long, env = "TUNNEL_WATCHDOG_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_secs(self.reachability_timeout_secs)
    }

    /// Reject values that would make a loop spin or a wait unbounded.
    pub fn validate(&self) -> Result<(), WatchdogError> {
        if self.service_name.trim().is_empty() {
            return Err(WatchdogError::InvalidConfig(
                "service_name must not be empty".into(),
            ));
        }
        if self.bind_address.parse::<IpAddr>().is_err() {
            return Err(WatchdogError::InvalidConfig(format!(
                "bind_address is not an IP address: {}",
                self.bind_address
            )));
        }
        if self.remote_probe_host.trim().is_empty() {
            return Err(WatchdogError::InvalidConfig(
                "remote_probe_host must not be empty".into(),
            ));
        }

        for (name, value) in [
            ("ping_interval_secs", self.ping_interval_secs),
            ("retry_delay_secs", self.retry_delay_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("reachability_timeout_secs", self.reachability_timeout_secs),
        ] {
            if value == 0 {
                return Err(WatchdogError::InvalidConfig(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        let parsed = url::Url::parse(&self.reachability_url).map_err(|e| {
            WatchdogError::InvalidConfig(format!(
                "reachability_url {:?} is invalid: {}",
                self.reachability_url, e
            ))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(WatchdogError::InvalidConfig(format!(
                "reachability_url must be an absolute http(s) URL: {}",
                self.reachability_url
            )));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TOML config file support
// ---------------------------------------------------------------------------

/// Optional TOML config file. Only populated values are injected.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_probe_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reachability_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reachability_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_sudo: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_json: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl ConfigFile {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Environment variable assignments for every populated field.
    pub fn env_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();

        macro_rules! push {
            ($env:expr, $val:expr) => {
                if let Some(ref v) = $val {
                    pairs.push(($env, v.to_string()));
                }
            };
        }

        push!("TUNNEL_WATCHDOG_SERVICE_NAME", self.service_name);
        push!("TUNNEL_WATCHDOG_BIND_ADDRESS", self.bind_address);
        push!("TUNNEL_WATCHDOG_PROBE_PORT", self.probe_port);
        push!("TUNNEL_WATCHDOG_REMOTE_PROBE_HOST", self.remote_probe_host);
        push!("TUNNEL_WATCHDOG_PING_INTERVAL", self.ping_interval_secs);
        push!("TUNNEL_WATCHDOG_RETRY_DELAY", self.retry_delay_secs);
        push!("TUNNEL_WATCHDOG_PROBE_TIMEOUT", self.probe_timeout_secs);
        push!("TUNNEL_WATCHDOG_REACHABILITY_URL", self.reachability_url);
        push!(
            "TUNNEL_WATCHDOG_REACHABILITY_TIMEOUT",
            self.reachability_timeout_secs
        );
        push!("TUNNEL_WATCHDOG_RESTART_SUDO", self.restart_sudo);
        push!("TUNNEL_WATCHDOG_LOG_LEVEL", self.log_level);
        push!("TUNNEL_WATCHDOG_LOG_JSON", self.log_json);

        if let Some(ref path) = self.log_file {
            pairs.push(("TUNNEL_WATCHDOG_LOG_FILE", path.display().to_string()));
        }

        pairs
    }

    /// Inject values as environment variables so clap picks them up.
    ///
    /// Only sets variables that are **not** already present in the
    /// environment, preserving the precedence: CLI > env > config file.
    pub fn inject_env(&self) {
        for (key, value) in self.env_pairs() {
            if std::env::var_os(key).is_none() {
                std::env::set_var(key, value);
            }
        }
    }
}
