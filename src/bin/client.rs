//! Client-batch mode: run a fixed-size batch of one-shot sessions against a
//! server, each sending a distinct "My message <i>" payload, and exit once
//! every session has completed. Per-session failures are logged, never fatal
//! to the batch.

use burstwire::{BatchCoordinator, Config, Dispatcher, Endpoint, IoDriver, LogHandler};
use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "burstwire-client")]
#[command(about = "Send a batch of one-shot messages to a burstwire server", long_about = None)]
struct CliArgs {
    /// Server host
    host: String,

    /// Server port
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
            eprintln!("usage: burstwire-client <host> <port>");
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

    let endpoint = Endpoint::new(args.host, args.port);
    info!(
        endpoint = %endpoint,
        batch_size = config.batch_size,
        batch_workers = config.batch_workers,
        "starting burstwire client batch"
    );

    // Inbound traffic on client connections (the server never sends any,
    // but the transport still listens) goes through the same dispatcher.
    let dispatcher = Dispatcher::new(
        config.dispatch_workers,
        config.dispatch_queue_capacity,
        config.overflow,
        Arc::new(LogHandler),
    );

    let driver = match IoDriver::start(config.buffer_size, config.io_timeout, dispatcher.handle())
    {
        Ok(driver) => driver,
        Err(e) => {
            error!(error = %e, "I/O driver startup failed");
            std::process::exit(1);
        }
    };

    let coordinator =
        BatchCoordinator::new(driver.handle(), config.batch_workers, config.batch_timeout);
    let outcome = coordinator.run_batch(&endpoint, config.batch_size, |i| {
        format!("My message {}", i + 1)
    });

    driver.shutdown();
    dispatcher.shutdown();

    match outcome {
        Ok(report) => {
            info!(
                total = report.total,
                succeeded = report.succeeded(),
                failed = report.failed,
                "batch finished"
            );
        }
        Err(e) => {
            // Only the batch-level wait can fail; individual sessions never
            // abort the run.
            error!(error = %e, "batch did not complete");
            std::process::exit(1);
        }
    }
}
