//! Server mode: bind a port and log every payload that arrives, until the
//! process is torn down.

use burstwire::{Config, LogHandler, ServerListener};
use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "burstwire-server")]
#[command(about = "Accept TCP connections and log received messages", long_about = None)]
struct CliArgs {
    /// Port to listen on
    port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return;
        }
        Err(_) => {
            eprintln!("usage: burstwire-server <port>");
            std::process::exit(1);
        }
    };

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let level = args.log_level.unwrap_or_else(|| config.log_level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        port = args.port,
        io_workers = config.io_workers,
        dispatch_workers = config.dispatch_workers,
        "starting burstwire server"
    );

    // A taken port is fatal to startup.
    let server = match ServerListener::bind(&config, "0.0.0.0", args.port, Arc::new(LogHandler)) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "server startup failed");
            std::process::exit(1);
        }
    };

    server.run();
}
