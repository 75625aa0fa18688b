//! Independent internet reachability check.
//!
//! Used to tell "tunnel down" apart from "network down" before restarting
//! anything. The URL must not route through the tunnel.

use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use tracing::debug;

/// Capability to test general internet connectivity.
pub trait Reachability: Send + Sync {
    /// Any transport failure means `false`; nothing is propagated or cached.
    fn is_reachable(&self, url: &str, timeout: Duration) -> impl Future<Output = bool> + Send;
}

/// Reachability over a single HTTP GET.
///
/// Any HTTP response counts as reachable, whatever its status: the goal is
/// proving packets flow, not that the endpoint is healthy.
pub struct HttpReachability {
    http: Client,
}

impl HttpReachability {
    pub fn new() -> anyhow::Result<Self> {
        // Every check opens a fresh direct connection: no pooled sockets,
        // no system proxy.
        let http = Client::builder()
            .pool_max_idle_per_host(0)
            .no_proxy()
            .user_agent(concat!("tunnel-watchdog/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }
}

impl Reachability for HttpReachability {
    async fn is_reachable(&self, url: &str, timeout: Duration) -> bool {
        match self.http.get(url).timeout(timeout).send().await {
            Ok(resp) => {
                debug!(url, status = %resp.status(), "reachability check answered");
                true
            }
            Err(e) => {
                debug!(
                    url,
                    error = %e,
                    timeout_ms = timeout.as_millis() as u64,
                    "reachability check failed"
                );
                false
            }
        }
    }
}
