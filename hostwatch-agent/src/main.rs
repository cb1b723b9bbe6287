//! Hostwatch Agent - host telemetry over AMQP
//!
//! - Samples host metrics and network identity every collection interval
//! - Publishes JSON envelopes to a durable queue
//! - Accepts operator commands (`update_asn`) on a second queue

use anyhow::{Context, Result};
use hostwatch_agent::broker::amqp::AmqpBroker;
use hostwatch_agent::identity::lookup::HttpLookupProvider;
use hostwatch_agent::metrics::SystemCollector;
use hostwatch_agent::{Agent, AgentConfig};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Ignoring unreadable .env file: {e}");
        }
    }

    let config = AgentConfig::load()
        .await
        .context("Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hostwatch_agent={}", config.general.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Hostwatch Agent starting...");

    for problem in config.validate() {
        error!("Configuration problem: {}", problem);
    }

    let lookup = HttpLookupProvider::new(&config.network_info)
        .context("Failed to build lookup HTTP client")?;
    let broker = AmqpBroker::new(&config.broker);
    let collector = SystemCollector::new(config.metrics.clone(), config.port_check.clone());
    info!(
        "Broker {}:{} vhost {}, data queue {}, command queue {}",
        config.broker.host,
        config.broker.port,
        config.broker.vhost,
        config.broker.data_queue,
        config.broker.command_queue
    );

    let agent = Agent::new(config, Arc::new(lookup), Arc::new(broker), Arc::new(collector));
    let running = agent.start();
    info!("Status:\n{}", running.status());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    let final_status = running.shutdown().await;
    info!("Final status:\n{}", final_status);
    Ok(())
}
