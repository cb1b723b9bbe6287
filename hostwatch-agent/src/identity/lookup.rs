//! Lookup provider: private IP, public IP, and ASN/organization resolution
//!
//! Each lookup may fail independently. HTTP lookups carry the configured
//! timeout (5 s by default) and count only HTTP 200 as success.

use super::AsnRecord;
use crate::config::NetworkInfoConfig;
use crate::error::LookupError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

const UNKNOWN: &str = "Unknown";

#[async_trait]
pub trait LookupProvider: Send + Sync {
    /// Address of the interface carrying the default route
    async fn resolve_private_ip(&self) -> Result<String, LookupError>;

    async fn resolve_public_ip(&self) -> Result<String, LookupError>;

    async fn resolve_asn(&self, ip: &str) -> Result<AsnRecord, LookupError>;

    /// Last resort for the private address: resolve the machine hostname
    async fn resolve_hostname_ip(&self) -> Result<String, LookupError> {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let addrs = tokio::net::lookup_host((hostname.as_str(), 0))
            .await
            .map_err(|e| LookupError::Local(format!("{hostname}: {e}")))?;

        let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .map(IpAddr::to_string)
            .ok_or_else(|| LookupError::Local(format!("{hostname} has no address")))
    }
}

/// ipinfo.io-shaped ASN answer
#[derive(Debug, Deserialize)]
struct IpInfoResponse {
    org: Option<String>,
    country: Option<String>,
    region: Option<String>,
    city: Option<String>,
}

/// A blank `org` is rejected so the cached record survives
impl TryFrom<IpInfoResponse> for AsnRecord {
    type Error = LookupError;

    fn try_from(info: IpInfoResponse) -> Result<Self, Self::Error> {
        // "AS15169 Google LLC" -> ("AS15169", "Google LLC")
        let (asn_code, organization) = match info.org.as_deref().map(str::trim) {
            Some("") => {
                return Err(LookupError::InvalidResponse("empty org field".into()));
            }
            Some(org) => {
                let mut parts = org.splitn(2, char::is_whitespace);
                let code = parts.next().unwrap_or_default().to_string();
                let name = parts.next().map(str::trim).unwrap_or_default().to_string();
                (code, name)
            }
            None => (UNKNOWN.to_string(), UNKNOWN.to_string()),
        };

        Ok(AsnRecord {
            asn_code,
            organization,
            country: info.country.unwrap_or_else(|| UNKNOWN.to_string()),
            region: info.region.unwrap_or_else(|| UNKNOWN.to_string()),
            city: info.city.unwrap_or_else(|| UNKNOWN.to_string()),
        })
    }
}

/// HTTP-backed provider for the public lookups, OS-backed for the private one
pub struct HttpLookupProvider {
    http_client: Client,
    public_ip_service: String,
    asn_info_service: String,
    timeout: Duration,
}

impl HttpLookupProvider {
    pub fn new(config: &NetworkInfoConfig) -> Result<Self, LookupError> {
        let http_client = Client::builder()
            .user_agent(concat!("hostwatch-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(config.lookup_timeout())
            .build()?;

        Ok(Self {
            http_client,
            public_ip_service: config.public_ip_service.clone(),
            asn_info_service: config.asn_info_service.clone(),
            timeout: config.lookup_timeout(),
        })
    }

    fn asn_url(&self, ip: &str) -> String {
        self.asn_info_service.replace("{ip}", ip)
    }

    async fn get_ok(&self, url: &str) -> Result<reqwest::Response, LookupError> {
        let request = self.http_client.get(url).send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| LookupError::Timeout(self.timeout))??;

        match response.status() {
            StatusCode::OK => Ok(response),
            status => Err(LookupError::Status(status.as_u16())),
        }
    }
}

#[async_trait]
impl LookupProvider for HttpLookupProvider {
    async fn resolve_private_ip(&self) -> Result<String, LookupError> {
        local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .map_err(|e| LookupError::Local(e.to_string()))
    }

    async fn resolve_public_ip(&self) -> Result<String, LookupError> {
        let response = self.get_ok(&self.public_ip_service).await?;
        let body = response.text().await?;
        let ip = body.trim();
        if ip.is_empty() {
            return Err(LookupError::InvalidResponse("empty public IP body".into()));
        }
        debug!("Public IP service answered {}", ip);
        Ok(ip.to_string())
    }

    async fn resolve_asn(&self, ip: &str) -> Result<AsnRecord, LookupError> {
        let response = self.get_ok(&self.asn_url(ip)).await?;
        let info: IpInfoResponse = response
            .json()
            .await
            .map_err(|e| LookupError::InvalidResponse(e.to_string()))?;
        AsnRecord::try_from(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn provider_for(server: &Server) -> HttpLookupProvider {
        let config = NetworkInfoConfig {
            public_ip_service: format!("{}/ip", server.url()),
            asn_info_service: format!("{}/{{ip}}/json", server.url()),
            ..NetworkInfoConfig::default()
        };
        HttpLookupProvider::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_public_ip_trims_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/ip")
            .with_status(200)
            .with_body("203.0.113.7\n")
            .create_async()
            .await;

        let provider = provider_for(&server);
        assert_eq!(provider.resolve_public_ip().await.unwrap(), "203.0.113.7");
    }

    #[tokio::test]
    async fn test_public_ip_non_200_is_an_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/ip")
            .with_status(503)
            .create_async()
            .await;

        let provider = provider_for(&server);
        assert_eq!(
            provider.resolve_public_ip().await,
            Err(LookupError::Status(503))
        );
    }

    #[tokio::test]
    async fn test_public_ip_empty_body_is_an_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/ip")
            .with_status(200)
            .with_body("  ")
            .create_async()
            .await;

        let provider = provider_for(&server);
        assert!(matches!(
            provider.resolve_public_ip().await,
            Err(LookupError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_asn_lookup_splits_org() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/8.8.8.8/json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "ip": "8.8.8.8",
                    "org": "AS15169 Google LLC",
                    "country": "US",
                    "region": "California",
                    "city": "Mountain View"
                }"#,
            )
            .create_async()
            .await;

        let provider = provider_for(&server);
        let asn = provider.resolve_asn("8.8.8.8").await.unwrap();
        mock.assert_async().await;

        assert_eq!(asn.asn_code, "AS15169");
        assert_eq!(asn.organization, "Google LLC");
        assert_eq!(asn.country, "US");
        assert_eq!(asn.region, "California");
        assert_eq!(asn.city, "Mountain View");
    }

    #[tokio::test]
    async fn test_asn_lookup_missing_fields_become_unknown() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/192.0.2.1/json")
            .with_status(200)
            .with_body(r#"{"ip": "192.0.2.1", "bogon": true}"#)
            .create_async()
            .await;

        let provider = provider_for(&server);
        let asn = provider.resolve_asn("192.0.2.1").await.unwrap();
        assert_eq!(asn.asn_code, "Unknown");
        assert_eq!(asn.organization, "Unknown");
        assert_eq!(asn.city, "Unknown");
    }

    #[tokio::test]
    async fn test_asn_lookup_invalid_json() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/1.2.3.4/json")
            .with_status(200)
            .with_body("<html>rate limited</html>")
            .create_async()
            .await;

        let provider = provider_for(&server);
        assert!(matches!(
            provider.resolve_asn("1.2.3.4").await,
            Err(LookupError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_asn_url_substitutes_ip() {
        let provider = HttpLookupProvider::new(&NetworkInfoConfig::default()).unwrap();
        assert_eq!(provider.asn_url("5.6.7.8"), "https://ipinfo.io/5.6.7.8/json");
    }

    #[test]
    fn test_org_without_name() {
        let record = AsnRecord::try_from(IpInfoResponse {
            org: Some("AS64500".into()),
            country: None,
            region: None,
            city: None,
        })
        .unwrap();
        assert_eq!(record.asn_code, "AS64500");
        assert_eq!(record.organization, "");
    }

    #[tokio::test]
    async fn test_blank_org_is_invalid() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/1.2.3.4/json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"org": "  ", "country": "BR"}"#)
            .create_async()
            .await;

        let provider = provider_for(&server);
        assert!(matches!(
            provider.resolve_asn("1.2.3.4").await,
            Err(LookupError::InvalidResponse(_))
        ));
    }
}
