//! Error taxonomy for the agent core
//!
//! None of these are fatal to the process: every failure path logs and
//! relies on the next tick or the next reconnect attempt for recovery.

use std::time::Duration;

/// Private/public IP or ASN resolution failed. The identity cache keeps
/// its last value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("lookup request failed: {0}")]
    Request(String),

    #[error("lookup service answered with HTTP {0}")]
    Status(u16),

    #[error("lookup response could not be parsed: {0}")]
    InvalidResponse(String),

    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("local address resolution failed: {0}")]
    Local(String),
}

impl From<reqwest::Error> for LookupError {
    fn from(err: reqwest::Error) -> Self {
        LookupError::Request(err.to_string())
    }
}

/// Broker unreachable, auth failure, or protocol error during
/// publish/consume.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// No connection could be established (refused, DNS, auth, handshake).
    #[error("broker unreachable: {0}")]
    Connect(String),

    /// An established connection failed mid-operation.
    #[error("broker protocol error: {0}")]
    Protocol(String),

    /// The broker stopped delivering to our consumer.
    #[error("consumer cancelled by broker")]
    ConsumerCancelled,

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl DeliveryError {
    /// True when the failure happened before a connection existed.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            DeliveryError::Connect(_)
                | DeliveryError::Timeout {
                    operation: "connect",
                    ..
                }
        )
    }
}

/// One collection tick did not reach the broker. The next tick retries.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("telemetry envelope could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Malformed command body. The message is rejected without requeue.
#[derive(Debug, thiserror::Error)]
pub enum CommandDecodeError {
    #[error("command body is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("command body is JSON but not an object")]
    NotAnObject,
}

/// Unusable broker settings detected at startup. Surfaced to the operator,
/// never aborts the agent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("broker host is empty")]
    EmptyHost,

    #[error("broker port must be non-zero")]
    InvalidPort,

    #[error("broker user is empty")]
    EmptyUser,

    #[error("{0} queue name is empty")]
    EmptyQueue(&'static str),

    #[error("data and command queues must differ (both are '{0}')")]
    SharedQueue(String),

    #[error("collection interval must be at least one second")]
    ZeroInterval,

    #[error("lookup timeout must be at least one second")]
    ZeroLookupTimeout,

    #[error("blocked connection timeout must be at least one second")]
    ZeroBlockedTimeout,

    #[error("ASN service template '{0}' has no {{ip}} placeholder")]
    AsnTemplate(String),
}
