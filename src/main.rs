mod app;
mod config;
mod error;
mod probe;
mod reachability;
mod responder;
mod service;

use clap::{CommandFactory, FromArgMatches};

use config::Config;
use reachability::{HttpReachability, Reachability};

/// Default config file name.
const DEFAULT_CONFIG: &str = "tunnel-watchdog.toml";

/// Build the full clap command: Config args + maintenance subcommands.
fn build_command() -> clap::Command {
    Config::command()
        .subcommand(
            clap::Command::new("probe")
                .about("Run one probe through the tunnel and report the outcome"),
        )
        .subcommand(clap::Command::new("restart").about("Restart the tunnel service now"))
        .subcommand(clap::Command::new("status").about("Show the tunnel service status"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config file as env-var defaults (before clap parsing)
    let config_file_path =
        std::env::var("TUNNEL_WATCHDOG_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let config_path = std::path::Path::new(&config_file_path);
    if config_path.exists() {
        match config::ConfigFile::load(config_path) {
            Ok(file_cfg) => file_cfg.inject_env(),
            Err(e) => eprintln!(
                "  WARNING: ignoring config file {}: {}",
                config_path.display(),
                e
            ),
        }
    }

    let matches = build_command().get_matches();
    let config = Config::from_arg_matches(&matches)?;

    match matches.subcommand() {
        Some(("probe", _)) => cmd_probe(&config).await,
        Some(("restart", _)) => {
            service::cmd_restart(&config.service_name, config.restart_sudo).await
        }
        Some(("status", _)) => service::cmd_status(&config.service_name),
        Some(_) => unreachable!(),
        None => app::run(config).await,
    }
}

/// `tunnel-watchdog probe` -- one probe, no remediation.
async fn cmd_probe(config: &Config) -> anyhow::Result<()> {
    config.validate()?;

    let outcome = probe::client::probe_once(
        &config.remote_probe_host,
        config.probe_port,
        config.probe_timeout(),
    )
    .await;
    println!(
        "probe {}:{} -> {}",
        config.remote_probe_host, config.probe_port, outcome
    );

    if outcome.is_success() {
        return Ok(());
    }

    let reachable = HttpReachability::new()?
        .is_reachable(&config.reachability_url, config.reachability_timeout())
        .await;
    println!(
        "internet {} ({})",
        if reachable { "reachable" } else { "UNREACHABLE" },
        config.reachability_url
    );
    anyhow::bail!("probe failed: {}", outcome)
}
