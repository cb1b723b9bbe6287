//! Broker channel: publish telemetry, consume commands
//!
//! Publishing opens a fresh connection per message (declare the queue
//! durable, publish persistent JSON, close). Consuming keeps one
//! long-lived connection with prefetch 1, acknowledging each message
//! after its handler succeeds and rejecting it without requeue otherwise.
//!
//! Every connection attempt drives the shared [`HealthTracker`]. Errors
//! are returned as [`DeliveryError`] and never panic the caller.

pub mod amqp;

use crate::error::DeliveryError;
use crate::health::HealthTracker;
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// One command message as delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
}

/// Handler verdict for a consumed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove from the queue
    Ack,
    /// Drop without requeue
    Reject,
}

/// Opens connections to the broker
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, DeliveryError>;
}

/// One open connection (with its channel)
#[async_trait]
pub trait BrokerSession: Send {
    async fn declare_durable(&mut self, queue: &str) -> Result<(), DeliveryError>;

    /// Publish with persistent delivery mode and the given content type
    async fn publish_persistent(
        &mut self,
        queue: &str,
        payload: &[u8],
        content_type: &str,
    ) -> Result<(), DeliveryError>;

    async fn set_prefetch(&mut self, count: u16) -> Result<(), DeliveryError>;

    async fn start_consuming(&mut self, queue: &str) -> Result<(), DeliveryError>;

    /// Next message; `None` when the broker ends the consumer
    async fn next_delivery(&mut self) -> Option<Result<Delivery, DeliveryError>>;

    async fn ack(&mut self, tag: u64) -> Result<(), DeliveryError>;

    async fn reject(&mut self, tag: u64) -> Result<(), DeliveryError>;

    async fn close(self: Box<Self>) -> Result<(), DeliveryError>;
}

#[derive(Clone)]
pub struct BrokerChannel {
    broker: Arc<dyn Broker>,
    health: HealthTracker,
}

impl BrokerChannel {
    pub fn new(broker: Arc<dyn Broker>, health: HealthTracker) -> Self {
        Self { broker, health }
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// Deliver one persistent JSON message to `queue`
    pub async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), DeliveryError> {
        let attempt = self.health.begin_attempt();
        let mut session = match self.broker.connect().await {
            Ok(session) => session,
            Err(e) => {
                attempt.failed(e.to_string());
                return Err(e);
            }
        };
        let link = attempt.established();

        let sent = async {
            session.declare_durable(queue).await?;
            session
                .publish_persistent(queue, payload, JSON_CONTENT_TYPE)
                .await
        }
        .await;

        match sent {
            Ok(()) => {
                if let Err(e) = session.close().await {
                    // the message is already confirmed
                    debug!("Closing publish connection failed: {}", e);
                }
                self.health.record_publish(Utc::now());
                Ok(())
            }
            Err(e) => {
                link.failed(e.to_string());
                let _ = session.close().await;
                Err(e)
            }
        }
    }

    /// Consume `queue` until shutdown (`Ok`) or failure, one message at a time
    pub async fn consume<H>(
        &self,
        queue: &str,
        shutdown: &mut ShutdownSignal,
        mut handler: H,
    ) -> Result<(), DeliveryError>
    where
        H: FnMut(&Delivery) -> Disposition + Send,
    {
        let attempt = self.health.begin_attempt();
        let mut session = match self.broker.connect().await {
            Ok(session) => session,
            Err(e) => {
                attempt.failed(e.to_string());
                return Err(e);
            }
        };
        let link = attempt.established();

        let setup = async {
            session.declare_durable(queue).await?;
            session.set_prefetch(1).await?;
            session.start_consuming(queue).await
        }
        .await;
        if let Err(e) = setup {
            link.failed(e.to_string());
            let _ = session.close().await;
            return Err(e);
        }
        info!("Listening for commands on queue {}", queue);

        let failure = loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                next = session.next_delivery() => Some(next),
            };
            let Some(next) = next else {
                if let Err(e) = session.close().await {
                    debug!("Closing consumer connection failed: {}", e);
                }
                return Ok(());
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => break e,
                None => break DeliveryError::ConsumerCancelled,
            };

            let settled = match handler(&delivery) {
                Disposition::Ack => session.ack(delivery.tag).await,
                Disposition::Reject => {
                    warn!("Rejecting command message {} without requeue", delivery.tag);
                    session.reject(delivery.tag).await
                }
            };
            if let Err(e) = settled {
                break e;
            }
        };

        link.failed(failure.to_string());
        let _ = session.close().await;
        Err(failure)
    }
}
