//! The someipyd daemon binary: load configuration, install logging,
//! run the daemon until SIGINT/SIGTERM.
//!
//! Exit code 0 on clean shutdown, 1 on fatal startup error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use someipyd::{Config, Daemon};

#[derive(Parser, Debug)]
#[command(name = "someipyd", version, about = "SOME/IP and SOME/IP-SD daemon")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(&config.log_level);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &config.log_path {
        Some(path) => {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    builder
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file))
                        .init();
                }
                Err(e) => {
                    builder.init();
                    tracing::warn!("Cannot open log file {}: {}; logging to stdout", path.display(), e);
                }
            }
        }
        None => builder.init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("someipyd: {}", e.message);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    init_logging(&config);
    tracing::info!(
        "Starting someipyd: sd={}:{} interface={} uds={}",
        config.sd_address,
        config.sd_port,
        config.interface,
        config.uds_path.display()
    );

    let daemon = match Daemon::new(config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("Signal received, shutting down");
        shutdown.shutdown();
    });

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Daemon failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
