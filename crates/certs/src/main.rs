//! Hearth certificate daemon - Main entry point
//!
//! Obtains a TLS certificate for the configured domain and keeps it renewed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use hearth_certs::{AcmeHttpClient, CertificateManager, MaterialStore, RenewalScheduler};
use hearth_config::{Config, LogFormat};

/// Hearth - Automated ACME certificate manager
#[derive(Parser, Debug)]
#[command(name = "hearth-certd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "HEARTH_CONFIG", default_value = "hearth.kdl")]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Log output format, overriding the configuration file
    #[arg(long = "log-format", value_enum)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstrap the certificate, then renew it until stopped (default)
    Run,
    /// Bootstrap the certificate once and exit
    Issue,
    /// Validate configuration and report the stored certificate
    Check,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    init_logging(&config, cli.verbose, cli.log_format.map(LogFormat::from));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Issue => issue(config).await,
        Commands::Check => check(&config),
    }
}

fn init_logging(config: &Config, verbose: bool, format: Option<LogFormat>) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match format.unwrap_or(config.logging.format) {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

fn build_manager(config: &Config) -> Result<CertificateManager> {
    let acme = AcmeHttpClient::new(&config.acme.directory_url)
        .with_contact_email(config.acme.contact_email.clone());

    CertificateManager::from_config(&config.acme, Arc::new(acme))
        .context("Failed to open certificate storage")
}

/// Bootstrap, then renew on schedule until SIGINT or SIGTERM
async fn run(config: Config) -> Result<()> {
    let mut manager = build_manager(&config)?;

    if let Err(e) = manager.bootstrap().await {
        match manager.active_certificate() {
            Some(cert) => warn!(
                error = %e,
                expires = %cert.not_after(),
                "Bootstrap failed, continuing with the stored certificate"
            ),
            None => return Err(e).context("Certificate bootstrap failed"),
        }
    }

    let handle = RenewalScheduler::new(manager)
        .with_interval(config.acme.renew_interval())
        .spawn();

    info!(domain = %config.acme.domain, "Hearth certificate manager started");

    wait_for_shutdown().await?;
    info!("Received shutdown signal, stopping renewal scheduler");

    if let Some(manager) = handle.shutdown().await {
        info!(state = %manager.state(), "Certificate manager stopped");
    }
    Ok(())
}

/// Bootstrap once and exit
async fn issue(config: Config) -> Result<()> {
    let mut manager = build_manager(&config)?;
    let cert = manager
        .bootstrap()
        .await
        .context("Certificate bootstrap failed")?;

    println!(
        "hearth: certificate for {} valid until {} written to {}",
        config.acme.domain,
        cert.not_after(),
        manager.store().certificate_path().display()
    );
    Ok(())
}

/// Report on the configuration and the stored certificate
fn check(config: &Config) -> Result<()> {
    let store = MaterialStore::new(
        &config.acme.storage_dir,
        config.acme.account_key_path(),
        &config.acme.domain,
    )
    .context("Failed to open certificate storage")?;

    println!("hearth: configuration is valid");
    println!("  domain:      {}", config.acme.domain);
    println!("  directory:   {}", config.acme.directory_url);
    println!("  validation:  {}", config.acme.validation_address);
    println!(
        "  account key: {} ({})",
        store.account_key_path().display(),
        if store.account_key_path().exists() {
            "present"
        } else {
            "missing"
        }
    );

    match store.load_certificate() {
        Some(cert) => {
            let remaining = cert.not_after() - Utc::now();
            println!(
                "  certificate: {} (serial {}, expires {}, {} days left)",
                store.certificate_path().display(),
                cert.serial(),
                cert.not_after(),
                remaining.num_days()
            );
        }
        None => println!("  certificate: none"),
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
