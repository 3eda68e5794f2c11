//! Busbridge binary.
//!
//! Speaks the JSON-lines protocol on stdin/stdout and bridges it to the
//! session (`user`) and system buses. Logs go to stderr.

use std::sync::Arc;

use anyhow::Context;
use busbridge_core::bus::dbus::DbusProvider;
use busbridge_core::{frontend, Args, BridgeConfig, BridgeService, EventHub};
use clap::Parser;
use tokio::io::BufReader;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = BridgeConfig::load(&args).context("loading configuration")?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .parse_lossy(config.log_directives()),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!(
        default_bus = %config.default_bus,
        default_event = %config.default_event,
        "Busbridge starting up"
    );

    let hub = Arc::new(EventHub::new());
    let service = BridgeService::start(config, Box::new(DbusProvider), hub.clone())
        .context("starting bridge service")?;

    let (subscriber, events) = hub.connect();
    let client = service.client(subscriber);
    let served = frontend::serve(
        client,
        events,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await;

    hub.disconnect(subscriber);
    service.shutdown();
    served.context("serving requests")?;
    info!("Busbridge shut down");
    Ok(())
}
