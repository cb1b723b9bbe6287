//! Hostwatch agent core
//!
//! Periodically samples host metrics and network identity (private IP,
//! public IP, ASN), publishes them as JSON to a durable broker queue, and
//! listens on a second queue for operator commands.

pub mod agent;
pub mod broker;
pub mod commands;
pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod metrics;
pub mod orchestrator;
pub mod shutdown;
pub mod status;

#[cfg(test)]
mod testing;

pub use agent::{Agent, RunningAgent};
pub use config::AgentConfig;
