//! Agent wiring: shared state, the two long-running tasks, bounded shutdown

use crate::broker::{Broker, BrokerChannel};
use crate::commands::CommandIntake;
use crate::config::AgentConfig;
use crate::health::HealthTracker;
use crate::identity::lookup::LookupProvider;
use crate::identity::{IdentityCache, RefreshSteps};
use crate::metrics::MetricCollector;
use crate::orchestrator::Orchestrator;
use crate::shutdown::Shutdown;
use crate::status::StatusReport;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Upper bound for each task to notice the cleared running flag
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Built but not yet running
pub struct Agent {
    config: AgentConfig,
    hostname: String,
    health: HealthTracker,
    identity: Arc<IdentityCache>,
    broker: Arc<dyn Broker>,
    collector: Arc<dyn MetricCollector>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        lookup: Arc<dyn LookupProvider>,
        broker: Arc<dyn Broker>,
        collector: Arc<dyn MetricCollector>,
    ) -> Self {
        let hostname = config.hostname();
        let steps = RefreshSteps::from(&config.network_info);
        info!("Initializing hostwatch agent v{} on {}", env!("CARGO_PKG_VERSION"), hostname);

        Self {
            config,
            hostname,
            health: HealthTracker::new(),
            identity: Arc::new(IdentityCache::new(lookup, steps)),
            broker,
            collector,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn status(&self) -> StatusReport {
        StatusReport::capture(&self.hostname, &self.health, &self.identity)
    }

    /// Spawn the collection loop and the command intake loop
    pub fn start(self) -> RunningAgent {
        let shutdown = Shutdown::new();
        let broker_config = &self.config.broker;

        // both channels report into the same health tracker
        let orchestrator = Orchestrator::new(
            self.hostname.clone(),
            broker_config.data_queue.clone(),
            self.config.general.collection_interval(),
            self.identity.clone(),
            self.collector.clone(),
            BrokerChannel::new(self.broker.clone(), self.health.clone()),
        );
        let intake = CommandIntake::new(
            BrokerChannel::new(self.broker.clone(), self.health.clone()),
            broker_config.command_queue.clone(),
            self.identity.clone(),
        );

        let collection = {
            let signal = shutdown.signal();
            tokio::spawn(async move { orchestrator.run(signal).await })
        };
        let commands = tokio::spawn(intake.run(shutdown.signal()));
        info!("Agent started");

        RunningAgent {
            agent: self,
            shutdown,
            collection,
            commands,
        }
    }
}

pub struct RunningAgent {
    agent: Agent,
    shutdown: Shutdown,
    collection: JoinHandle<()>,
    commands: JoinHandle<()>,
}

impl RunningAgent {
    pub fn status(&self) -> StatusReport {
        self.agent.status()
    }

    /// Clear the running flag, wait up to [`JOIN_TIMEOUT`] per task, mark
    /// the connection disconnected. Returns the final status.
    pub async fn shutdown(self) -> StatusReport {
        info!("Shutting down agent...");
        self.shutdown.trigger();

        join_bounded("command intake", self.commands).await;
        join_bounded("collection", self.collection).await;

        self.agent.health.mark_disconnected();
        info!("Agent stopped");
        self.agent.status()
    }
}

async fn join_bounded(name: &str, mut handle: JoinHandle<()>) {
    match tokio::time::timeout(JOIN_TIMEOUT, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("The {} task ended abnormally: {}", name, e),
        Err(_) => {
            warn!(
                "The {} task did not stop within {}s, aborting it",
                name,
                JOIN_TIMEOUT.as_secs()
            );
            handle.abort();
        }
    }
}
