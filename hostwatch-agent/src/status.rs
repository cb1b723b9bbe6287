//! Read-only status view over the shared agent state

use crate::health::{ConnectionStatus, HealthTracker};
use crate::identity::{IdentityCache, IdentitySnapshot};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub hostname: String,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub last_publish: Option<DateTime<Utc>>,
    pub identity: IdentitySnapshot,
}

impl StatusReport {
    pub fn capture(hostname: &str, health: &HealthTracker, identity: &IdentityCache) -> Self {
        Self {
            hostname: hostname.to_string(),
            status: health.status(),
            last_error: health.last_error(),
            last_publish: health.last_publish(),
            identity: identity.snapshot(),
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Hostname: {}", self.hostname)?;
        writeln!(f, "Status: {}", self.status.label())?;
        if let Some(at) = self.last_publish {
            let local = at.with_timezone(&Local);
            writeln!(f, "Last publish: {}", local.format("%d/%m/%Y %H:%M:%S"))?;
        }
        if let Some(ip) = &self.identity.private_ip {
            writeln!(f, "Private IP: {ip}")?;
        }
        if let Some(ip) = &self.identity.public_ip {
            writeln!(f, "Public IP: {ip}")?;
        }
        if let Some(asn) = &self.identity.asn {
            writeln!(f, "ASN: {}", asn.asn_code)?;
            writeln!(f, "Organization: {}", asn.organization)?;
        }
        if let Some(error) = &self.last_error {
            writeln!(f, "Last error: {error}")?;
        }
        Ok(())
    }
}
