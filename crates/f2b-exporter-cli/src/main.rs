#![deny(unsafe_code)]

//! fail2ban-exporter: Prometheus exporter for fail2ban jail counters.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use f2b_exporter_config::AppConfig;
use f2b_exporter_core::{Exporter, Jail, StatusClient};

/// Expose fail2ban jail counters as Prometheus metrics.
#[derive(Parser)]
#[command(name = "fail2ban-exporter", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "fail2ban-exporter.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to the fail2ban server socket.
    #[arg(long = "f2b.socket-path", global = true)]
    socket_path: Option<String>,

    /// Address on which to expose metrics and web interface.
    #[arg(long = "web.listen-address", global = true)]
    listen_address: Option<String>,

    /// Path under which to expose metrics.
    #[arg(long = "web.telemetry-path", global = true)]
    telemetry_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Serve metrics over HTTP (the default).
    Serve,

    /// Poll fail2ban once and print every jail's counters.
    Jails {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli).await?;

    let level = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
    if !cli.config.exists() {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => cmd_serve(config).await?,
        Commands::Jails { json } => cmd_jails(&config, json).await?,
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
    }

    Ok(())
}

async fn cmd_serve(config: AppConfig) -> Result<()> {
    let exporter = Exporter::new(config)?;
    exporter.run().await?;
    Ok(())
}

async fn cmd_jails(config: &AppConfig, json: bool) -> Result<()> {
    let jails = fetch_jails(config).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&jails)?);
    } else {
        print!("{}", render_table(&jails));
    }
    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str = toml::to_string_pretty(config).context("failed to serialize config")?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// One poll of every jail, closing the session afterwards.
async fn fetch_jails(config: &AppConfig) -> Result<Vec<Jail>> {
    let client = StatusClient::from_config(config);
    let jails = client.get_all_jails().await;
    client.close().await;
    jails.with_context(|| format!("failed to query fail2ban at {}", config.socket.path))
}

fn render_table(jails: &[Jail]) -> String {
    let headers = ["JAIL", "FAILED", "TOTAL FAILED", "BANNED", "TOTAL BANNED"];
    let width = jails
        .iter()
        .map(|j| j.name.len())
        .chain([headers[0].len()])
        .max()
        .unwrap_or(0);

    let mut out = format!(
        "{:<width$}  {:>6}  {:>12}  {:>6}  {:>12}\n",
        headers[0], headers[1], headers[2], headers[3], headers[4]
    );
    for jail in jails {
        let _ = writeln!(
            out,
            "{:<width$}  {:>6}  {:>12}  {:>6}  {:>12}",
            jail.name,
            jail.currently_failed,
            jail.total_failed,
            jail.currently_banned,
            jail.total_banned
        );
    }
    out
}

/// Load the config file (defaults when it does not exist), then apply
/// command-line overrides and validate the result.
async fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = if cli.config.exists() {
        AppConfig::load(&cli.config)
            .await
            .with_context(|| format!("failed to load {}", cli.config.display()))?
    } else {
        AppConfig::default()
    };
    apply_overrides(cli, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(cli: &Cli, config: &mut AppConfig) {
    if let Some(path) = &cli.socket_path {
        config.socket.path = path.clone();
    }
    if let Some(addr) = &cli.listen_address {
        config.web.listen_address = addr.clone();
    }
    if let Some(path) = &cli.telemetry_path {
        config.web.telemetry_path = path.clone();
    }
}
