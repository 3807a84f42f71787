use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

use seastar::config::{AppConfig, Cli};
use seastar::server::{Server, ShutdownFlag, install_fault_hook, watch_signals};

const SPLASH: &str = r"
      .
     /_\        seastar
 ___/   \___    multi-client TCP server
 \         /
  >   *   <     one arm per client
 /___   ___\
     \ /
      '
";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_cli(Cli::parse())?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level)
        .with_ansi(config.colors)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    install_fault_hook();

    if config.splash {
        println!("{SPLASH}");
        println!("version {}\n", env!("CARGO_PKG_VERSION"));
    }

    info!(
        port = config.port,
        shutdown_timeout_secs = config.shutdown_timeout.as_secs(),
        cycle_ms = config.registry.timing.period.as_millis(),
        slices = config.registry.timing.slices,
        id_policy = ?config.registry.id_policy,
        log_level = %config.log_level,
        "configuration loaded"
    );

    let shutdown = ShutdownFlag::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let server = match Server::bind(
        config.port,
        config.registry,
        shutdown.clone(),
        config.shutdown_timeout,
    ) {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, "server setup failed");
            return Err(err.into());
        }
    };

    server.serve().await?;
    Ok(())
}
