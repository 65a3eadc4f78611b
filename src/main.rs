use clap::Parser;
use pia_port_forward::automation::{AutomationRunner, SystemLauncher};
use pia_port_forward::config::{Config, ConfigError, Overrides};
use pia_port_forward::credentials::{CredentialsError, load_credentials};
use pia_port_forward::daemon::{DaemonError, Orchestrator, OrchestratorSettings, run_daemon};
use pia_port_forward::pia::{
    AuthError, CertificateError, PiaTokenSource, PinnedLeaseConnector, TokenCache,
    resolve_ca_cert_path,
};
use pia_port_forward::platform::SystemProbe;
use pia_port_forward::vpn::TunnelLocator;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "pia-port-forward")]
#[command(about = "Keep a PIA forwarded port alive over an OpenVPN tunnel")]
#[command(version)]
struct Cli {
    /// File the forwarded port is written to
    #[arg(value_name = "OUTPUT_FILE")]
    output_file: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, env = "PIA_CONFIG")]
    config: Option<PathBuf>,

    /// File containing the PIA username and password, one per line
    #[arg(long, env = "PIA_CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// OpenVPN client configuration of the active connection
    #[arg(long, env = "PIA_OPENVPN_CONFIG")]
    openvpn_config: Option<PathBuf>,

    /// PIA CA certificate (relative paths also searched in /etc/openvpn/client)
    #[arg(long, env = "PIA_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// PIA token endpoint
    #[arg(long, env = "PIA_TOKEN_URL")]
    token_url: Option<String>,

    /// How often the port is re-bound (e.g. 15m, 900s)
    #[arg(long, env = "PIA_REFRESH_INTERVAL", value_parser = humantime::parse_duration)]
    refresh_interval: Option<Duration>,

    /// Wait between VPN detection attempts (e.g. 60s, 1m)
    #[arg(long, env = "PIA_VPN_RETRY_INTERVAL", value_parser = humantime::parse_duration)]
    vpn_retry_interval: Option<Duration>,

    /// Program to run as `<program> <port> <output-file>` when the port changes
    #[arg(long, env = "PIA_ON_PORT_CHANGE")]
    on_port_change: Option<PathBuf>,

    /// Wait for the port change program to finish
    #[arg(long, env = "PIA_SYNC_SCRIPT")]
    sync_script: bool,

    /// Time limit for a synchronous port change program (e.g. 30s, 1m)
    #[arg(long, env = "PIA_SCRIPT_TIMEOUT", value_parser = humantime::parse_duration)]
    script_timeout: Option<Duration>,

    /// Enable debug logging
    #[arg(long, env = "PIA_DEBUG")]
    debug: bool,
}

impl Cli {
    fn overrides(self) -> Overrides {
        Overrides {
            credentials_file: self.credentials,
            output_file: self.output_file,
            openvpn_config: self.openvpn_config,
            ca_cert: self.ca_cert,
            token_url: self.token_url,
            refresh_interval: self.refresh_interval,
            vpn_retry_interval: self.vpn_retry_interval,
            on_port_change: self.on_port_change,
            sync_script: self.sync_script,
            script_timeout: self.script_timeout,
            debug: self.debug,
        }
    }
}

#[derive(Error, Debug)]
enum StartupError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to load credentials: {0}")]
    Credentials(#[from] CredentialsError),
    #[error("Failed to create authentication client: {0}")]
    Auth(#[from] AuthError),
    #[error("{0}")]
    Certificate(#[from] CertificateError),
    #[error("Failed to install signal handler: {0}")]
    Signal(#[from] std::io::Error),
    #[error("{0}")]
    Daemon(#[from] DaemonError),
}

fn build_config(cli: Cli) -> Result<Config, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply(cli.overrides());
    Ok(config)
}

fn init_logging(debug: bool) -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG overrides the default level
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(debug)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Cancel `cancel` on SIGINT, SIGTERM or SIGHUP
fn spawn_signal_handler(cancel: CancellationToken) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received interrupt signal"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sighup.recv() => info!("Received SIGHUP"),
            }
            info!("Shutting down...");
            cancel.cancel();
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received interrupt signal, shutting down...");
        cancel.cancel();
    });

    Ok(())
}

async fn run(config: Config) -> Result<(), StartupError> {
    let (credentials_file, output_file) = config.validate()?;

    info!("Starting PIA port forwarding service");
    info!("Credentials file: {}", credentials_file.display());
    info!("Output file: {}", output_file.display());
    info!("OpenVPN config file: {}", config.openvpn_config.display());
    info!(
        "Refresh interval: {}",
        humantime::format_duration(config.refresh_interval)
    );
    info!(
        "VPN retry interval: {}",
        humantime::format_duration(config.vpn_retry_interval)
    );

    let automation = config.automation_spec();
    if let Some(spec) = &automation {
        info!("Port change script: {}", spec.command_path.display());
        info!("Script execution mode: {}", spec.mode());
        info!("Script timeout: {}", humantime::format_duration(spec.timeout));
    }

    let credentials = load_credentials(&credentials_file)?;
    let tokens = TokenCache::new(PiaTokenSource::new(
        config.token_url.clone(),
        credentials.username,
        credentials.password,
    )?);

    let ca_cert = resolve_ca_cert_path(&config.ca_cert)?;
    info!("Using CA certificate: {}", ca_cert.display());
    let connector = PinnedLeaseConnector::from_ca_file(&ca_cert)?;

    let mut orchestrator = Orchestrator::new(
        tokens,
        TunnelLocator::new(SystemProbe::new()),
        connector,
        OrchestratorSettings {
            openvpn_config: config.openvpn_config.clone(),
            output_file,
            refresh_interval: config.refresh_interval,
            vpn_retry_interval: config.vpn_retry_interval,
        },
    );
    if let Some(spec) = automation {
        orchestrator =
            orchestrator.with_automation(AutomationRunner::new(spec, Arc::new(SystemLauncher::new())));
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    run_daemon(orchestrator, cancel).await?;
    info!("Port forwarding stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let debug_flag = cli.debug;

    let config = match build_config(cli) {
        Ok(config) => config,
        Err(e) => {
            init_logging(debug_flag)?;
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    init_logging(config.debug)?;

    if let Err(e) = run(config).await {
        error!("{}", e);
        std::process::exit(1);
    }

    Ok(())
}
