//! In-memory broker and scripted lookups for unit tests
//!
//! Records every session operation so tests can assert on connection
//! lifecycle, and lets tests inject commands and failures.

use crate::broker::{Broker, BrokerSession, Delivery};
use crate::error::{DeliveryError, LookupError};
use crate::identity::lookup::LookupProvider;
use crate::identity::AsnRecord;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Declared(String),
    Published(String),
    Prefetch(u16),
    Consuming(String),
    Acked(u64),
    Rejected(u64),
    Closed,
}

#[derive(Default)]
struct BrokerState {
    events: Vec<SessionEvent>,
    published: Vec<PublishedMessage>,
    commands: VecDeque<Delivery>,
    next_tag: u64,
    connect_attempts: usize,
    connections: usize,
    failing_connects: usize,
    connect_error: String,
    publish_error: Option<String>,
    stream_error: Option<String>,
    end_consumer: bool,
    acked: Vec<u64>,
    rejected: Vec<u64>,
    prefetch: Option<u16>,
}

/// Broker double shared between the code under test and the test body
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    arrivals: Arc<Notify>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Successful connections
    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    /// Every connection attempt, failed or not
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().unwrap().connect_attempts
    }

    pub fn fail_next_connects(&self, count: usize, message: &str) {
        let mut state = self.state.lock().unwrap();
        state.failing_connects = count;
        state.connect_error = message.to_string();
    }

    pub fn fail_publishes(&self, message: &str) {
        self.state.lock().unwrap().publish_error = Some(message.to_string());
    }

    pub fn fail_stream(&self, message: &str) {
        self.state.lock().unwrap().stream_error = Some(message.to_string());
    }

    /// Clear injected publish and stream failures
    pub fn recover(&self) {
        let mut state = self.state.lock().unwrap();
        state.publish_error = None;
        state.stream_error = None;
    }

    /// Queue a command body; delivery tags start at 1
    pub fn push_command(&self, body: Vec<u8>) {
        {
            let mut state = self.state.lock().unwrap();
            state.next_tag += 1;
            let tag = state.next_tag;
            state.commands.push_back(Delivery { tag, body });
        }
        self.arrivals.notify_one();
    }

    /// End the consumer once the queued commands are drained
    pub fn end_consumer_after_queue(&self) {
        self.state.lock().unwrap().end_consumer = true;
        self.arrivals.notify_one();
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn rejected(&self) -> Vec<u64> {
        self.state.lock().unwrap().rejected.clone()
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.state.lock().unwrap().prefetch
    }

    fn record(&self, event: SessionEvent) {
        self.state.lock().unwrap().events.push(event);
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, DeliveryError> {
        {
            let mut state = self.state.lock().unwrap();
            state.connect_attempts += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(DeliveryError::Connect(state.connect_error.clone()));
            }
            state.connections += 1;
            state.events.push(SessionEvent::Connected);
        }
        Ok(Box::new(MockSession {
            broker: self.clone(),
        }))
    }
}

struct MockSession {
    broker: MockBroker,
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn declare_durable(&mut self, queue: &str) -> Result<(), DeliveryError> {
        self.broker.record(SessionEvent::Declared(queue.to_string()));
        Ok(())
    }

    async fn publish_persistent(
        &mut self,
        queue: &str,
        payload: &[u8],
        content_type: &str,
    ) -> Result<(), DeliveryError> {
        let mut state = self.broker.state.lock().unwrap();
        if let Some(message) = &state.publish_error {
            return Err(DeliveryError::Protocol(message.clone()));
        }
        state.events.push(SessionEvent::Published(queue.to_string()));
        state.published.push(PublishedMessage {
            queue: queue.to_string(),
            payload: payload.to_vec(),
            content_type: content_type.to_string(),
        });
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<(), DeliveryError> {
        let mut state = self.broker.state.lock().unwrap();
        state.prefetch = Some(count);
        state.events.push(SessionEvent::Prefetch(count));
        Ok(())
    }

    async fn start_consuming(&mut self, queue: &str) -> Result<(), DeliveryError> {
        self.broker.record(SessionEvent::Consuming(queue.to_string()));
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, DeliveryError>> {
        loop {
            {
                let mut state = self.broker.state.lock().unwrap();
                if let Some(message) = &state.stream_error {
                    return Some(Err(DeliveryError::Protocol(message.clone())));
                }
                if let Some(delivery) = state.commands.pop_front() {
                    return Some(Ok(delivery));
                }
                if state.end_consumer {
                    return None;
                }
            }
            self.broker.arrivals.notified().await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), DeliveryError> {
        let mut state = self.broker.state.lock().unwrap();
        state.acked.push(tag);
        state.events.push(SessionEvent::Acked(tag));
        Ok(())
    }

    async fn reject(&mut self, tag: u64) -> Result<(), DeliveryError> {
        let mut state = self.broker.state.lock().unwrap();
        state.rejected.push(tag);
        state.events.push(SessionEvent::Rejected(tag));
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), DeliveryError> {
        self.broker.record(SessionEvent::Closed);
        Ok(())
    }
}

struct LookupScript {
    private_ip: Result<String, LookupError>,
    public_ip: Result<String, LookupError>,
    asn: Result<AsnRecord, LookupError>,
    hostname_ip: Result<String, LookupError>,
    asn_calls: Vec<String>,
    hostname_calls: usize,
}

/// Lookup provider answering from a mutable script
pub struct ScriptedLookup {
    script: Mutex<LookupScript>,
}

impl ScriptedLookup {
    pub fn new(private_ip: &str, public_ip: &str, asn: AsnRecord) -> Self {
        Self {
            script: Mutex::new(LookupScript {
                private_ip: Ok(private_ip.to_string()),
                public_ip: Ok(public_ip.to_string()),
                asn: Ok(asn),
                hostname_ip: Err(LookupError::Local("hostname not scripted".into())),
                asn_calls: Vec::new(),
                hostname_calls: 0,
            }),
        }
    }

    pub fn set_private_ip(&self, result: Result<String, LookupError>) {
        self.script.lock().unwrap().private_ip = result;
    }

    pub fn set_public_ip(&self, result: Result<String, LookupError>) {
        self.script.lock().unwrap().public_ip = result;
    }

    pub fn set_asn(&self, result: Result<AsnRecord, LookupError>) {
        self.script.lock().unwrap().asn = result;
    }

    pub fn set_hostname_ip(&self, result: Result<String, LookupError>) {
        self.script.lock().unwrap().hostname_ip = result;
    }

    /// IPs passed to `resolve_asn`, in call order
    pub fn asn_calls(&self) -> Vec<String> {
        self.script.lock().unwrap().asn_calls.clone()
    }

    pub fn hostname_calls(&self) -> usize {
        self.script.lock().unwrap().hostname_calls
    }
}

#[async_trait]
impl LookupProvider for ScriptedLookup {
    async fn resolve_private_ip(&self) -> Result<String, LookupError> {
        self.script.lock().unwrap().private_ip.clone()
    }

    async fn resolve_public_ip(&self) -> Result<String, LookupError> {
        self.script.lock().unwrap().public_ip.clone()
    }

    async fn resolve_asn(&self, ip: &str) -> Result<AsnRecord, LookupError> {
        let mut script = self.script.lock().unwrap();
        script.asn_calls.push(ip.to_string());
        script.asn.clone()
    }

    async fn resolve_hostname_ip(&self) -> Result<String, LookupError> {
        let mut script = self.script.lock().unwrap();
        script.hostname_calls += 1;
        script.hostname_ip.clone()
    }
}
