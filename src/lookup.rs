//! Host address discovery and DNS resolution

use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Address lookups needed for domain-ownership checks and proxy status
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostLookup: Send + Sync {
    /// This host's public address as seen from the internet
    async fn public_address(&self) -> RelayResult<IpAddr>;

    /// Resolve a host name to its addresses
    async fn resolve(&self, host: &str) -> RelayResult<Vec<IpAddr>>;

    /// Public address seen when egressing through the local proxy
    async fn egress_address(&self, proxy_port: u16) -> RelayResult<IpAddr>;
}

/// Lookup backed by IP-echo HTTP endpoints and the system resolver
pub struct SystemLookup {
    endpoints: Vec<String>,
    timeout: Duration,
}

impl SystemLookup {
    /// `endpoints` are tried in order; the first one that answers wins
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Self {
        Self { endpoints, timeout }
    }

    async fn first_echo(&self, client: &reqwest::Client) -> RelayResult<IpAddr> {
        let mut last_error = String::from("no IP-echo endpoints configured");

        for endpoint in &self.endpoints {
            match Self::echo(client, endpoint).await {
                Ok(addr) => {
                    debug!("{} reported address {}", endpoint, addr);
                    return Ok(addr);
                }
                Err(e) => {
                    debug!("IP-echo endpoint {} failed: {}", endpoint, e);
                    last_error = format!("{}: {}", endpoint, e);
                }
            }
        }

        Err(RelayError::Network(format!(
            "could not discover public address ({})",
            last_error
        )))
    }

    async fn echo(client: &reqwest::Client, endpoint: &str) -> RelayResult<IpAddr> {
        let body = client
            .get(endpoint)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_echo_body(&body)
    }
}

/// Extract an address from an IP-echo response body
pub fn parse_echo_body(body: &str) -> RelayResult<IpAddr> {
    let trimmed = body.trim();
    if let Ok(addr) = trimmed.parse::<IpAddr>() {
        return Ok(addr);
    }

    // key=value bodies such as Cloudflare's trace endpoint
    trimmed
        .lines()
        .find_map(|line| line.strip_prefix("ip="))
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
        .ok_or_else(|| RelayError::Parse(format!("no IP address in response: {:?}", trimmed)))
}

#[async_trait]
impl HostLookup for SystemLookup {
    async fn public_address(&self) -> RelayResult<IpAddr> {
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        self.first_echo(&client).await
    }

    async fn resolve(&self, host: &str) -> RelayResult<Vec<IpAddr>> {
        let lookup = tokio::net::lookup_host((host, 443));
        let addrs = tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| RelayError::Network(format!("DNS lookup for {} timed out", host)))?
            .map_err(|e| RelayError::Network(format!("DNS lookup for {} failed: {}", host, e)))?;

        let mut result: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        result.sort();
        result.dedup();
        if result.is_empty() {
            warn!("DNS lookup for {} returned no addresses", host);
        }
        Ok(result)
    }

    async fn egress_address(&self, proxy_port: u16) -> RelayResult<IpAddr> {
        let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{}", proxy_port))?;
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .proxy(proxy)
            .build()?;
        self.first_echo(&client).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_body() {
        assert_eq!(
            parse_echo_body("203.0.113.7\n").unwrap(),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            parse_echo_body("2001:db8::1").unwrap(),
            "2001:db8::1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_parse_trace_body() {
        let body = "fl=29f\nh=www.cloudflare.com\nip=198.51.100.4\nts=1700000000.1\nwarp=on\n";
        assert_eq!(
            parse_echo_body(body).unwrap(),
            "198.51.100.4".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_echo_body("<html>blocked</html>").is_err());
    }

    #[tokio::test]
    async fn test_no_endpoints_is_network_error() {
        let lookup = SystemLookup::new(Vec::new(), Duration::from_millis(100));
        let err = lookup.public_address().await.unwrap_err();
        assert!(matches!(err, RelayError::Network(_)));
    }
}
