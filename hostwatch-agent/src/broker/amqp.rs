//! AMQP 0-9-1 transport (RabbitMQ) built on lapin

use super::{Broker, BrokerSession, Delivery};
use crate::config::BrokerConfig;
use crate::error::DeliveryError;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::time::Duration;
use tracing::debug;

/// AMQP delivery mode flag for messages that survive a broker restart
const PERSISTENT_DELIVERY: u8 = 2;

pub struct AmqpBroker {
    uri: String,
    /// Upper bound for the handshake and for a publish confirm
    blocked_timeout: Duration,
    consumer_tag: String,
}

impl AmqpBroker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            uri: config.amqp_uri(),
            blocked_timeout: config.blocked_connection_timeout(),
            consumer_tag: format!("hostwatch-{}", uuid::Uuid::new_v4()),
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, DeliveryError> {
        let connect = Connection::connect(&self.uri, ConnectionProperties::default());
        let connection = tokio::time::timeout(self.blocked_timeout, connect)
            .await
            .map_err(|_| DeliveryError::Timeout {
                operation: "connect",
                after: self.blocked_timeout,
            })?
            .map_err(|e| DeliveryError::Connect(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| DeliveryError::Connect(e.to_string()))?;

        Ok(Box::new(AmqpSession {
            connection,
            channel,
            consumer: None,
            consumer_tag: self.consumer_tag.clone(),
            blocked_timeout: self.blocked_timeout,
            confirms: false,
        }))
    }
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
    consumer: Option<Consumer>,
    consumer_tag: String,
    blocked_timeout: Duration,
    confirms: bool,
}

fn protocol(err: lapin::Error) -> DeliveryError {
    DeliveryError::Protocol(err.to_string())
}

/// Survives a broker restart: durable, not exclusive, not auto-deleted
fn durable_declare_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        exclusive: false,
        auto_delete: false,
        ..QueueDeclareOptions::default()
    }
}

fn persistent_properties(content_type: &str) -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(PERSISTENT_DELIVERY)
        .with_content_type(content_type.into())
}

/// Drop a single message; never requeue
fn reject_options() -> BasicNackOptions {
    BasicNackOptions {
        multiple: false,
        requeue: false,
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_durable(&mut self, queue: &str) -> Result<(), DeliveryError> {
        self.channel
            .queue_declare(queue, durable_declare_options(), FieldTable::default())
            .await
            .map_err(protocol)?;
        Ok(())
    }

    async fn publish_persistent(
        &mut self,
        queue: &str,
        payload: &[u8],
        content_type: &str,
    ) -> Result<(), DeliveryError> {
        if !self.confirms {
            self.channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(protocol)?;
            self.confirms = true;
        }

        let properties = persistent_properties(content_type);

        let publish = async {
            self.channel
                .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
                .await?
                .await
        };
        let confirmation = tokio::time::timeout(self.blocked_timeout, publish)
            .await
            .map_err(|_| DeliveryError::Timeout {
                operation: "publish",
                after: self.blocked_timeout,
            })?
            .map_err(protocol)?;

        if confirmation.is_nack() {
            return Err(DeliveryError::Protocol(format!(
                "broker refused message for queue {queue}"
            )));
        }
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<(), DeliveryError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(protocol)
    }

    async fn start_consuming(&mut self, queue: &str) -> Result<(), DeliveryError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(protocol)?;
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, DeliveryError>> {
        let consumer = self.consumer.as_mut()?;
        let next = consumer.next().await?;
        Some(
            next.map(|delivery| Delivery {
                tag: delivery.delivery_tag,
                body: delivery.data,
            })
            .map_err(protocol),
        )
    }

    async fn ack(&mut self, tag: u64) -> Result<(), DeliveryError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(protocol)
    }

    async fn reject(&mut self, tag: u64) -> Result<(), DeliveryError> {
        self.channel
            .basic_nack(tag, reject_options())
            .await
            .map_err(protocol)
    }

    async fn close(self: Box<Self>) -> Result<(), DeliveryError> {
        debug!("Closing AMQP connection");
        self.connection.close(200, "OK").await.map_err(protocol)
    }
}
