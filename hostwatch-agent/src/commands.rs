//! Operator commands received on the command queue
//!
//! Wire format: one JSON object per message. `{"action": "update_asn"}`
//! forces an ASN re-lookup on the next identity refresh; any other object
//! is acknowledged and ignored. Bodies that are not JSON objects are
//! rejected without requeue.

use crate::broker::{BrokerChannel, Delivery, Disposition};
use crate::error::{CommandDecodeError, DeliveryError};
use crate::identity::IdentityCache;
use crate::shutdown::ShutdownSignal;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Backoff when the broker cannot be reached at all
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Backoff when an established consumer is interrupted
pub const STREAM_RETRY_DELAY: Duration = Duration::from_secs(10);

const UPDATE_ASN: &str = "update_asn";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Force an ASN re-lookup on the next refresh
    UpdateAsn,
    /// Accepted, no state change
    Unknown { action: Option<String> },
}

impl Command {
    pub fn decode(body: &[u8]) -> Result<Self, CommandDecodeError> {
        let value: Value = serde_json::from_slice(body)?;
        let Value::Object(fields) = value else {
            return Err(CommandDecodeError::NotAnObject);
        };

        // the dashboard backend names the field `command_type`
        let action = fields
            .get("action")
            .or_else(|| fields.get("command_type"))
            .and_then(Value::as_str);

        Ok(match action {
            Some(UPDATE_ASN) => Command::UpdateAsn,
            other => Command::Unknown {
                action: other.map(str::to_owned),
            },
        })
    }
}

/// Consumes the command queue for the agent's lifetime
pub struct CommandIntake {
    channel: BrokerChannel,
    queue: String,
    identity: Arc<IdentityCache>,
}

impl CommandIntake {
    pub fn new(channel: BrokerChannel, queue: impl Into<String>, identity: Arc<IdentityCache>) -> Self {
        Self {
            channel,
            queue: queue.into(),
            identity,
        }
    }

    /// Decode and apply one message
    pub fn handle(&self, delivery: &Delivery) -> Disposition {
        match Command::decode(&delivery.body) {
            Ok(command) => {
                info!("Command received: {:?}", command);
                self.apply(command);
                Disposition::Ack
            }
            Err(e) => {
                error!("Failed to process command: {}", e);
                Disposition::Reject
            }
        }
    }

    fn apply(&self, command: Command) {
        match command {
            Command::UpdateAsn => {
                info!("ASN refresh requested by operator");
                self.identity.request_asn_refresh();
            }
            Command::Unknown { action } => {
                info!("Ignoring unrecognized command action {:?}", action);
            }
        }
    }

    /// Reconnect-and-consume until the running flag is cleared
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        while shutdown.is_running() {
            let result = self
                .channel
                .consume(&self.queue, &mut shutdown, |delivery| self.handle(delivery))
                .await;

            let delay = match result {
                Ok(()) => break,
                Err(e) => Self::retry_delay(&e),
            };
            if delay == CONNECT_RETRY_DELAY {
                warn!(
                    "Could not connect to the broker to listen for commands. Retrying in {} seconds.",
                    delay.as_secs()
                );
            } else {
                error!("Command consumer interrupted. Retrying in {} seconds.", delay.as_secs());
            }

            if !shutdown.sleep(delay).await {
                break;
            }
        }
        info!("Command intake stopped");
    }

    fn retry_delay(err: &DeliveryError) -> Duration {
        if err.is_connect_failure() {
            CONNECT_RETRY_DELAY
        } else {
            STREAM_RETRY_DELAY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{ConnectionStatus, HealthTracker};
    use crate::identity::{AsnRecord, RefreshSteps};
    use crate::shutdown::Shutdown;
    use crate::testing::{MockBroker, ScriptedLookup};

    fn identity() -> Arc<IdentityCache> {
        let lookup = Arc::new(ScriptedLookup::new(
            "10.0.0.5",
            "1.2.3.4",
            AsnRecord {
                asn_code: "AS1".into(),
                organization: "Org".into(),
                country: "BR".into(),
                region: "SP".into(),
                city: "Campinas".into(),
            },
        ));
        Arc::new(IdentityCache::new(lookup, RefreshSteps::default()))
    }

    fn intake(broker: &Arc<MockBroker>, identity: &Arc<IdentityCache>) -> CommandIntake {
        let channel = BrokerChannel::new(broker.clone(), HealthTracker::new());
        CommandIntake::new(channel, "agent_commands", identity.clone())
    }

    fn delivery(body: &[u8]) -> Delivery {
        Delivery {
            tag: 1,
            body: body.to_vec(),
        }
    }

    #[test]
    fn test_decode_update_asn() {
        assert_eq!(
            Command::decode(br#"{"action": "update_asn"}"#).unwrap(),
            Command::UpdateAsn
        );
        assert_eq!(
            Command::decode(br#"{"action": "update_asn", "force": true}"#).unwrap(),
            Command::UpdateAsn
        );
    }

    #[test]
    fn test_decode_backend_command_type_alias() {
        let body = br#"{"agent_id": "a1", "command_type": "update_asn", "command_data": {"force": true}}"#;
        assert_eq!(Command::decode(body).unwrap(), Command::UpdateAsn);
    }

    #[test]
    fn test_decode_unknown_objects() {
        assert_eq!(
            Command::decode(br#"{"action": "reboot"}"#).unwrap(),
            Command::Unknown {
                action: Some("reboot".into())
            }
        );
        assert_eq!(
            Command::decode(b"{}").unwrap(),
            Command::Unknown { action: None }
        );
        assert_eq!(
            Command::decode(br#"{"action": 7}"#).unwrap(),
            Command::Unknown { action: None }
        );
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        assert!(matches!(
            Command::decode(b"not json"),
            Err(CommandDecodeError::Malformed(_))
        ));
        assert!(matches!(
            Command::decode(b"[1, 2]"),
            Err(CommandDecodeError::NotAnObject)
        ));
        assert!(matches!(
            Command::decode(br#""update_asn""#),
            Err(CommandDecodeError::NotAnObject)
        ));
    }

    #[test]
    fn test_update_asn_sets_pending_flag_and_acks() {
        let broker = Arc::new(MockBroker::new());
        let identity = identity();
        let intake = intake(&broker, &identity);

        assert_eq!(
            intake.handle(&delivery(br#"{"action":"update_asn"}"#)),
            Disposition::Ack
        );
        assert!(identity.asn_refresh_pending());
    }

    #[test]
    fn test_unknown_action_acks_without_state_change() {
        let broker = Arc::new(MockBroker::new());
        let identity = identity();
        let intake = intake(&broker, &identity);

        assert_eq!(
            intake.handle(&delivery(br#"{"action":"restart"}"#)),
            Disposition::Ack
        );
        assert!(!identity.asn_refresh_pending());
    }

    #[test]
    fn test_malformed_body_rejected_without_state_change() {
        let broker = Arc::new(MockBroker::new());
        let identity = identity();
        let intake = intake(&broker, &identity);

        assert_eq!(intake.handle(&delivery(b"not json")), Disposition::Reject);
        assert!(!identity.asn_refresh_pending());
    }

    #[tokio::test]
    async fn test_run_consumes_until_shutdown() {
        let broker = Arc::new(MockBroker::new());
        broker.push_command(br#"{"action":"update_asn"}"#.to_vec());
        broker.push_command(b"not json".to_vec());
        let identity = identity();
        let intake = intake(&broker, &identity);
        let shutdown = Shutdown::new();

        let task = tokio::spawn(intake.run(shutdown.signal()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(broker.acked(), vec![1]);
        assert_eq!(broker.rejected(), vec![2]);
        assert!(identity.asn_refresh_pending());
        assert_eq!(broker.prefetch(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_broker_retries_after_thirty_seconds() {
        let broker = Arc::new(MockBroker::new());
        broker.fail_next_connects(1, "connection refused");
        let identity = identity();
        let intake = intake(&broker, &identity);
        let health = intake.channel.health().clone();
        let shutdown = Shutdown::new();

        let task = tokio::spawn(intake.run(shutdown.signal()));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(broker.connect_attempts(), 1);
        assert!(matches!(health.status(), ConnectionStatus::Error(_)));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(health.status(), ConnectionStatus::Connected);

        shutdown.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_stream_retries_after_ten_seconds() {
        let broker = Arc::new(MockBroker::new());
        broker.fail_stream("connection reset");
        let identity = identity();
        let intake = intake(&broker, &identity);
        let shutdown = Shutdown::new();

        let task = tokio::spawn(intake.run(shutdown.signal()));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(broker.connect_attempts(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(broker.connect_attempts(), 2);

        shutdown.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_resumes_after_stream_recovers() {
        let broker = Arc::new(MockBroker::new());
        broker.fail_stream("connection reset");
        let identity = identity();
        let intake = intake(&broker, &identity);
        let health = intake.channel.health().clone();
        let shutdown = Shutdown::new();

        let task = tokio::spawn(intake.run(shutdown.signal()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(matches!(health.status(), ConnectionStatus::Error(_)));
        broker.recover();
        broker.push_command(br#"{"action":"update_asn"}"#.to_vec());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.acked(), vec![1]);
        assert!(identity.asn_refresh_pending());
        assert_eq!(health.status(), ConnectionStatus::Connected);

        shutdown.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let broker = Arc::new(MockBroker::new());
        broker.fail_next_connects(10, "connection refused");
        let identity = identity();
        let intake = intake(&broker, &identity);
        let shutdown = Shutdown::new();

        let task = tokio::spawn(intake.run(shutdown.signal()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broker.connect_attempts(), 1);
    }
}
