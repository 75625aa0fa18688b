//! Periodic liveness prober.
//!
//! Each cycle runs one probe through the tunnel. A failed probe triggers a
//! reachability check and, when the internet is reachable, a restart of the
//! tunnel service. Failed cycles are re-checked after the shorter retry
//! delay instead of the full ping interval.

pub mod client;

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::reachability::Reachability;
use crate::service::ServiceControl;

pub use client::ProbeOutcome;

/// Timing and targets for the prober, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub service_name: String,
    pub remote_host: String,
    pub port: u16,
    pub ping_interval: Duration,
    pub retry_delay: Duration,
    pub probe_timeout: Duration,
    pub reachability_url: String,
    pub reachability_timeout: Duration,
}

impl ProbeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            service_name: config.service_name.clone(),
            remote_host: config.remote_probe_host.clone(),
            port: config.probe_port,
            ping_interval: config.ping_interval(),
            retry_delay: config.retry_delay(),
            probe_timeout: config.probe_timeout(),
            reachability_url: config.reachability_url.clone(),
            reachability_timeout: config.reachability_timeout(),
        }
    }
}

/// What the failure branch did in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    /// Probe succeeded, nothing to do.
    NotNeeded,
    /// Restart issued (not verified; the next probe tells).
    Restarted,
    /// Restart could not be issued.
    RestartFailed,
    /// Internet unreachable, restart skipped.
    SkippedUnreachable,
    /// Shutdown arrived while the cycle was in flight.
    SkippedShutdown,
}

/// Observable result of one prober cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: ProbeOutcome,
    pub remediation: Remediation,
    pub next_delay: Duration,
}

pub struct Prober<R, S> {
    settings: ProbeSettings,
    reachability: R,
    service: S,
}

impl<R, S> Prober<R, S>
where
    R: Reachability,
    S: ServiceControl,
{
    pub fn new(settings: ProbeSettings, reachability: R, service: S) -> Self {
        Self {
            settings,
            reachability,
            service,
        }
    }

    /// Run one probe and its remediation branch.
    ///
    /// No reachability check or restart is started once `shutdown` reads
    /// true, and a reachability check in flight is abandoned when it flips.
    pub async fn cycle(&self, shutdown: &watch::Receiver<bool>) -> CycleReport {
        let s = &self.settings;
        let outcome = client::probe_once(&s.remote_host, s.port, s.probe_timeout).await;

        if outcome.is_success() {
            info!(target_host = %s.remote_host, port = s.port, "ping ok");
            return CycleReport {
                outcome,
                remediation: Remediation::NotNeeded,
                next_delay: s.ping_interval,
            };
        }

        if *shutdown.borrow() {
            return skipped_for_shutdown(outcome);
        }

        warn!(
            target_host = %s.remote_host,
            port = s.port,
            outcome = %outcome,
            "ping failed"
        );

        let check = self
            .reachability
            .is_reachable(&s.reachability_url, s.reachability_timeout);
        // a dropped sender resolves `wait_for` too and counts as shutdown
        let mut stop = shutdown.clone();
        let reachable = tokio::select! {
            reachable = check => reachable,
            _ = stop.wait_for(|stop| *stop) => return skipped_for_shutdown(outcome),
        };

        let remediation = if !reachable {
            error!(
                url = %s.reachability_url,
                "internet unreachable, ambient network outage, not restarting"
            );
            Remediation::SkippedUnreachable
        } else if *shutdown.borrow() {
            return skipped_for_shutdown(outcome);
        } else {
            warn!(service = %s.service_name, "internet reachable, restarting tunnel service");
            match self.service.restart(&s.service_name) {
                Ok(()) => Remediation::Restarted,
                Err(e) => {
                    error!(service = %s.service_name, error = %e, "restart invocation failed");
                    Remediation::RestartFailed
                }
            }
        };

        CycleReport {
            outcome,
            remediation,
            next_delay: s.retry_delay,
        }
    }

    /// Probe until shutdown is signalled. Returns the number of cycles run.
    ///
    /// An in-flight probe finishes (it is bounded by the probe timeout)
    /// before shutdown is observed; remediation after it is skipped and the
    /// sleep between cycles is cut short.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> u64 {
        info!(
            target_host = %self.settings.remote_host,
            port = self.settings.port,
            interval_secs = self.settings.ping_interval.as_secs_f64(),
            retry_secs = self.settings.retry_delay.as_secs_f64(),
            "prober starting"
        );

        let mut cycles = 0u64;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.cycle(&shutdown).await;
            cycles += 1;
            debug!(
                outcome = %report.outcome,
                remediation = ?report.remediation,
                next_delay_ms = report.next_delay.as_millis() as u64,
                "cycle finished"
            );

            if report.remediation == Remediation::SkippedShutdown {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(report.next_delay) => {}
                _ = shutdown.changed() => {
                    debug!("prober received shutdown signal");
                    break;
                }
            }
        }

        info!(cycles, "prober stopped");
        cycles
    }
}

fn skipped_for_shutdown(outcome: ProbeOutcome) -> CycleReport {
    info!(outcome = %outcome, "shutdown requested, skipping remediation");
    CycleReport {
        outcome,
        remediation: Remediation::SkippedShutdown,
        next_delay: Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use crate::error::WatchdogError;

    struct FakeReachability {
        reachable: bool,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl Reachability for FakeReachability {
        async fn is_reachable(&self, _url: &str, _timeout: Duration) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.reachable
        }
    }

    struct FakeService {
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    impl ServiceControl for FakeService {
        fn restart(&self, name: &str) -> Result<(), WatchdogError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(WatchdogError::RestartInFlight {
                    service: name.to_string(),
                });
            }
            Ok(())
        }
    }

    struct Harness {
        prober: Prober<FakeReachability, FakeService>,
        reach_calls: Arc<AtomicUsize>,
        restart_calls: Arc<AtomicUsize>,
        running: watch::Receiver<bool>,
        _keep_running: watch::Sender<bool>,
    }

    fn settings(port: u16) -> ProbeSettings {
        ProbeSettings {
            service_name: "ssh_tunnels".to_string(),
            remote_host: "127.0.0.1".to_string(),
            port,
            ping_interval: Duration::from_secs(2),
            retry_delay: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(300),
            reachability_url: "http://connectivity.invalid/".to_string(),
            reachability_timeout: Duration::from_millis(300),
        }
    }

    fn harness(settings: ProbeSettings, reachable: bool, restart_fails: bool) -> Harness {
        let reach_calls = Arc::new(AtomicUsize::new(0));
        let restart_calls = Arc::new(AtomicUsize::new(0));
        let prober = Prober::new(
            settings,
            FakeReachability {
                reachable,
                delay: Duration::ZERO,
                calls: Arc::clone(&reach_calls),
            },
            FakeService {
                fail: restart_fails,
                calls: Arc::clone(&restart_calls),
            },
        );
        let (_keep_running, running) = watch::channel(false);
        Harness {
            prober,
            reach_calls,
            restart_calls,
            running,
            _keep_running,
        }
    }

    /// Acknowledging server that counts the probes it answered.
    async fn counting_responder() -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let answered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&answered);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                if stream.write_all(client::ACK_PAYLOAD).await.is_ok() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        (port, answered)
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Peer that accepts and never writes.
    async fn silent_peer() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        port
    }

    #[tokio::test]
    async fn test_success_never_restarts() {
        let (port, _) = counting_responder().await;
        let h = harness(settings(port), true, false);

        for _ in 0..5 {
            let report = h.prober.cycle(&h.running).await;
            assert_eq!(report.outcome, ProbeOutcome::Success);
            assert_eq!(report.remediation, Remediation::NotNeeded);
            assert_eq!(report.next_delay, Duration::from_secs(2));
        }
        assert_eq!(h.reach_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.restart_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_with_internet_restarts_once_per_cycle() {
        let h = harness(settings(closed_port().await), true, false);

        let report = h.prober.cycle(&h.running).await;
        assert_eq!(report.outcome, ProbeOutcome::ConnectionRefused);
        assert_eq!(report.remediation, Remediation::Restarted);
        assert_eq!(report.next_delay, Duration::from_millis(500));
        assert_eq!(h.restart_calls.load(Ordering::SeqCst), 1);

        h.prober.cycle(&h.running).await;
        assert_eq!(h.restart_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_without_internet_skips_restart() {
        let h = harness(settings(closed_port().await), false, false);

        for _ in 0..3 {
            let report = h.prober.cycle(&h.running).await;
            assert_eq!(report.outcome, ProbeOutcome::ConnectionRefused);
            assert_eq!(report.remediation, Remediation::SkippedUnreachable);
            assert_eq!(report.next_delay, Duration::from_millis(500));
        }
        assert_eq!(h.reach_calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.restart_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restart_error_is_absorbed() {
        let h = harness(settings(closed_port().await), true, true);

        let report = h.prober.cycle(&h.running).await;
        assert_eq!(report.remediation, Remediation::RestartFailed);
        assert_eq!(report.next_delay, Duration::from_millis(500));
        assert_eq!(h.restart_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_silent_peer_takes_failure_branch() {
        let h = harness(settings(silent_peer().await), true, false);
        let report = h.prober.cycle(&h.running).await;
        assert_eq!(report.outcome, ProbeOutcome::Timeout);
        assert_eq!(report.remediation, Remediation::Restarted);
    }

    #[tokio::test]
    async fn test_run_probes_on_ping_interval() {
        let (port, answered) = counting_responder().await;
        let mut s = settings(port);
        s.ping_interval = Duration::from_millis(100);
        let h = harness(s, true, false);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(h.prober.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(550)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("prober did not stop")
            .unwrap();

        let probes = answered.load(Ordering::SeqCst);
        assert!((3..=7).contains(&probes), "unexpected probe count {}", probes);
        assert_eq!(h.restart_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_uses_retry_delay_after_failure() {
        let mut s = settings(closed_port().await);
        s.ping_interval = Duration::from_secs(30);
        s.retry_delay = Duration::from_millis(50);
        let h = harness(s, true, false);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(h.prober.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(400)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("prober did not stop")
            .unwrap();

        // a 30s ping interval would allow exactly one restart
        assert!(h.restart_calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_cuts_ping_interval_short() {
        let (port, answered) = counting_responder().await;
        let mut s = settings(port);
        s.ping_interval = Duration::from_secs(60);
        let h = harness(s, true, false);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(h.prober.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("prober waited out the ping interval")
            .unwrap();
        assert_eq!(answered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_prober() {
        let h = harness(settings(closed_port().await), false, false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(2), h.prober.run(shutdown_rx))
            .await
            .expect("prober outlived its shutdown sender");
    }

    #[tokio::test]
    async fn test_shutdown_during_ping_skips_restart() {
        let mut s = settings(silent_peer().await);
        s.probe_timeout = Duration::from_secs(1);
        let h = harness(s, true, false);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(h.prober.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        let cycles = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("watchdog loop outlived the in-flight ping")
            .unwrap();

        assert_eq!(cycles, 1);
        assert_eq!(h.reach_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.restart_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_reachability_check() {
        let reach_calls = Arc::new(AtomicUsize::new(0));
        let restart_calls = Arc::new(AtomicUsize::new(0));
        let subject = Prober::new(
            settings(closed_port().await),
            FakeReachability {
                reachable: true,
                delay: Duration::from_secs(5),
                calls: Arc::clone(&reach_calls),
            },
            FakeService {
                fail: false,
                calls: Arc::clone(&restart_calls),
            },
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { subject.cycle(&shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reachability check outlived shutdown")
            .unwrap();

        assert_eq!(report.outcome, ProbeOutcome::ConnectionRefused);
        assert_eq!(report.remediation, Remediation::SkippedShutdown);
        assert_eq!(reach_calls.load(Ordering::SeqCst), 1);
        assert_eq!(restart_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_real_responder_keeps_cycles_healthy() {
        let listener = crate::responder::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut s = settings(addr.port());
        s.ping_interval = Duration::from_millis(100);
        let h = harness(s, true, false);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let responder = tokio::spawn(crate::responder::run(
            listener,
            Duration::from_secs(1),
            shutdown_rx.clone(),
        ));
        let cycle_loop = tokio::spawn(h.prober.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(550)).await;
        shutdown_tx.send(true).unwrap();

        let cycles = tokio::time::timeout(Duration::from_secs(2), cycle_loop)
            .await
            .expect("cycle loop did not stop")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), responder)
            .await
            .expect("responder did not stop")
            .unwrap();

        // every cycle succeeded: a failed one would have checked reachability
        assert!(cycles >= 3, "only {} cycles ran", cycles);
        assert_eq!(h.reach_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.restart_calls.load(Ordering::SeqCst), 0);

        let rebound = crate::responder::bind(addr).unwrap();
        assert_eq!(rebound.local_addr().unwrap(), addr);
    }
}
