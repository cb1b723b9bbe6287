//! Collection/publish loop
//!
//! Each tick: refresh identity (cache-aware), collect metrics, build a
//! [`TelemetryEnvelope`], publish it to the data queue. A failed publish
//! is logged and the next scheduled tick is the retry. Tick starts are
//! at least one interval apart; a slow tick eats into the wait instead
//! of pushing the schedule back.

use crate::broker::BrokerChannel;
use crate::error::TickError;
use crate::identity::{IdentityCache, IdentitySnapshot};
use crate::metrics::MetricCollector;
use crate::shutdown::ShutdownSignal;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One published telemetry message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    pub hostname: String,
    pub metrics: Map<String, Value>,
    pub identity: IdentitySnapshot,
}

impl TelemetryEnvelope {
    pub fn new(hostname: String, metrics: Map<String, Value>, identity: IdentitySnapshot) -> Self {
        let now = Utc::now();
        Self {
            timestamp: now.timestamp_micros() as f64 / 1_000_000.0,
            hostname,
            metrics,
            identity,
        }
    }

    /// `metrics.<category>.percent`, 0 when absent
    fn percent(&self, category: &str) -> f64 {
        self.metrics
            .get(category)
            .and_then(|c| c.get("percent"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }
}

pub struct Orchestrator {
    hostname: String,
    data_queue: String,
    interval: Duration,
    identity: Arc<IdentityCache>,
    collector: Arc<dyn MetricCollector>,
    channel: BrokerChannel,
}

impl Orchestrator {
    pub fn new(
        hostname: String,
        data_queue: String,
        interval: Duration,
        identity: Arc<IdentityCache>,
        collector: Arc<dyn MetricCollector>,
        channel: BrokerChannel,
    ) -> Self {
        Self {
            hostname,
            data_queue,
            interval,
            identity,
            collector,
            channel,
        }
    }

    /// Build the envelope for this instant
    pub async fn sample(&self) -> TelemetryEnvelope {
        let identity = self.identity.refresh(false).await.into_snapshot();
        let metrics = self.collector.collect().await;
        TelemetryEnvelope::new(self.hostname.clone(), metrics, identity)
    }

    pub async fn tick(&self) -> Result<(), TickError> {
        let envelope = self.sample().await;
        let payload = serde_json::to_vec(&envelope)?;

        match self.channel.publish(&self.data_queue, &payload).await {
            Ok(()) => {
                info!(
                    "Telemetry published: CPU {}%, memory {}%",
                    envelope.percent("cpu"),
                    envelope.percent("memory")
                );
                Ok(())
            }
            Err(e) => {
                warn!("Failed to publish telemetry: {}", e);
                Err(e.into())
            }
        }
    }

    /// Tick until the running flag is cleared
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        info!(
            "Collecting every {}s into queue {}",
            self.interval.as_secs(),
            self.data_queue
        );

        while shutdown.is_running() {
            let started = Instant::now();
            if let Err(e) = self.tick().await {
                debug!("Tick ended without delivery: {}", e);
            }
            if !shutdown.sleep_until(started + self.interval).await {
                break;
            }
        }
        info!("Collection loop stopped");
    }
}
