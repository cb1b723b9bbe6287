//! Network identity cache
//!
//! Holds the last-known private IP, public IP, and ASN record, and decides
//! when the rate-sensitive ASN lookup has to run again:
//! - the private IP is re-resolved on every refresh (cheap, local)
//! - the public IP is re-resolved on every refresh; if that fails the
//!   refresh stops there and the cached public IP and ASN stay as they were
//! - the ASN lookup runs iff the public IP changed, the caller forced it,
//!   or an operator command left a pending force flag
//!
//! The pending flag is consumed by the attempt, not by its success: a
//! forced refresh whose ASN call fails is not retried on later ticks.

pub mod lookup;

use crate::config::NetworkInfoConfig;
use lookup::LookupProvider;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Organization / network-ownership record for a public IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsnRecord {
    pub asn_code: String,
    pub organization: String,
    pub country: String,
    pub region: String,
    pub city: String,
}

/// Copy of the cached identity handed out to readers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub asn: Option<AsnRecord>,
}

/// Refresh policy shared between the command loop (sets) and the cache
/// (consumes)
#[derive(Debug, Default)]
pub struct RefreshPolicy {
    force_asn_refresh: bool,
}

impl RefreshPolicy {
    pub fn request_asn_refresh(&mut self) {
        self.force_asn_refresh = true;
    }

    pub fn is_pending(&self) -> bool {
        self.force_asn_refresh
    }

    /// Read-and-clear in one step
    fn take(&mut self) -> bool {
        std::mem::take(&mut self.force_asn_refresh)
    }
}

/// Result of [`IdentityCache::refresh`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Public IP resolved; the snapshot reflects this refresh
    Updated(IdentitySnapshot),
    /// Public IP could not be resolved; the snapshot is the prior one
    /// (private IP may still have been refreshed)
    Stale(IdentitySnapshot),
}

impl RefreshOutcome {
    pub fn snapshot(&self) -> &IdentitySnapshot {
        match self {
            RefreshOutcome::Updated(s) | RefreshOutcome::Stale(s) => s,
        }
    }

    pub fn into_snapshot(self) -> IdentitySnapshot {
        match self {
            RefreshOutcome::Updated(s) | RefreshOutcome::Stale(s) => s,
        }
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, RefreshOutcome::Updated(_))
    }
}

/// Which refresh steps run at all
#[derive(Debug, Clone, Copy)]
pub struct RefreshSteps {
    pub private_ip: bool,
    pub public_ip: bool,
    pub asn: bool,
}

impl Default for RefreshSteps {
    fn default() -> Self {
        Self {
            private_ip: true,
            public_ip: true,
            asn: true,
        }
    }
}

impl From<&NetworkInfoConfig> for RefreshSteps {
    fn from(config: &NetworkInfoConfig) -> Self {
        Self {
            private_ip: config.collect_private_ip,
            public_ip: config.collect_public_ip,
            asn: config.collect_asn_info,
        }
    }
}

pub struct IdentityCache {
    provider: Arc<dyn LookupProvider>,
    steps: RefreshSteps,
    cached: RwLock<IdentitySnapshot>,
    policy: Mutex<RefreshPolicy>,
    // one refresh at a time; readers go through `cached`
    refresh_lock: tokio::sync::Mutex<()>,
}

impl IdentityCache {
    pub fn new(provider: Arc<dyn LookupProvider>, steps: RefreshSteps) -> Self {
        Self {
            provider,
            steps,
            cached: RwLock::new(IdentitySnapshot::default()),
            policy: Mutex::new(RefreshPolicy::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Copy-out of the current identity
    pub fn snapshot(&self) -> IdentitySnapshot {
        self.cached.read().clone()
    }

    /// Ask for an ASN re-lookup on the next refresh
    pub fn request_asn_refresh(&self) {
        self.policy.lock().request_asn_refresh();
    }

    pub fn asn_refresh_pending(&self) -> bool {
        self.policy.lock().is_pending()
    }

    pub async fn refresh(&self, force: bool) -> RefreshOutcome {
        let _guard = self.refresh_lock.lock().await;

        if self.steps.private_ip {
            self.refresh_private_ip().await;
        }

        if !self.steps.public_ip {
            return RefreshOutcome::Updated(self.snapshot());
        }

        let public_ip = match self.provider.resolve_public_ip().await {
            Ok(ip) => ip,
            Err(e) => {
                warn!("Could not resolve public IP, keeping cached identity: {}", e);
                return RefreshOutcome::Stale(self.snapshot());
            }
        };

        let ip_changed = {
            let mut cached = self.cached.write();
            let changed = cached.public_ip.as_deref() != Some(public_ip.as_str());
            if changed {
                info!("Public IP updated: {}", public_ip);
                cached.public_ip = Some(public_ip.clone());
            }
            changed
        };

        if self.steps.asn {
            let pending = self.policy.lock().take();
            if ip_changed || force || pending {
                self.refresh_asn(&public_ip).await;
            }
        }

        RefreshOutcome::Updated(self.snapshot())
    }

    async fn refresh_private_ip(&self) {
        let resolved = match self.provider.resolve_private_ip().await {
            Ok(ip) => Some(ip),
            Err(e) => {
                error!("Could not resolve private IP: {}", e);
                if self.cached.read().private_ip.is_some() {
                    // keep the last-known value
                    None
                } else {
                    match self.provider.resolve_hostname_ip().await {
                        Ok(ip) => Some(ip),
                        Err(e) => {
                            warn!("Hostname fallback for private IP failed: {}", e);
                            None
                        }
                    }
                }
            }
        };

        if let Some(ip) = resolved {
            let mut cached = self.cached.write();
            if cached.private_ip.as_deref() != Some(ip.as_str()) {
                info!("Private IP updated: {}", ip);
            }
            cached.private_ip = Some(ip);
        }
    }

    async fn refresh_asn(&self, public_ip: &str) {
        info!("Refreshing ASN information for {}...", public_ip);
        match self.provider.resolve_asn(public_ip).await {
            Ok(record) => {
                info!("ASN updated: {} - {}", record.asn_code, record.organization);
                self.cached.write().asn = Some(record);
            }
            Err(e) => {
                // stale-but-present beats empty
                error!("ASN lookup failed, keeping previous record: {}", e);
            }
        }
    }
}
