//! Command lines for the external ACME issuance client

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Exit code the issuance client uses for "certificate unchanged, not due"
pub const EXIT_SKIPPED: i32 = 2;

/// Domain-validation challenge used for automated issuance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeType {
    /// Standalone HTTP listener on port 80
    Http01,
    /// Standalone TLS-ALPN listener on port 443
    TlsAlpn01,
    /// DNS TXT record through the configured provider hook
    Dns01,
}

impl FromStr for ChallengeType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http-01" | "http" | "standalone" => Ok(ChallengeType::Http01),
            "tls-alpn-01" | "alpn" | "tls" => Ok(ChallengeType::TlsAlpn01),
            "dns-01" | "dns" => Ok(ChallengeType::Dns01),
            other => Err(RelayError::Validation(format!(
                "Unknown challenge type '{}' (expected http-01, tls-alpn-01 or dns-01)",
                other
            ))),
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
            ChallengeType::Dns01 => "dns-01",
        };
        f.write_str(s)
    }
}

/// `--issue` arguments
pub fn issue_args(
    domain: &str,
    email: &str,
    challenge: ChallengeType,
    dns_provider: &str,
) -> Vec<String> {
    let mut args = vec![
        "--issue".to_string(),
        "-d".to_string(),
        domain.to_string(),
        "--keylength".to_string(),
        "2048".to_string(),
        "--server".to_string(),
        "letsencrypt".to_string(),
        "--accountemail".to_string(),
        email.to_string(),
    ];

    match challenge {
        ChallengeType::Http01 => args.push("--standalone".to_string()),
        ChallengeType::TlsAlpn01 => args.push("--alpn".to_string()),
        ChallengeType::Dns01 => {
            args.push("--dns".to_string());
            args.push(dns_provider.to_string());
        }
    }

    args
}

/// `--install-cert` arguments copying the issued pair into the store
pub fn install_args(domain: &str, cert_path: &str, key_path: &str) -> Vec<String> {
    vec![
        "--install-cert".to_string(),
        "-d".to_string(),
        domain.to_string(),
        "--fullchain-file".to_string(),
        cert_path.to_string(),
        "--key-file".to_string(),
        key_path.to_string(),
    ]
}

/// `--renew` arguments
pub fn renew_args(domain: &str) -> Vec<String> {
    vec!["--renew".to_string(), "-d".to_string(), domain.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_parsing() {
        assert_eq!("http-01".parse::<ChallengeType>().unwrap(), ChallengeType::Http01);
        assert_eq!("ALPN".parse::<ChallengeType>().unwrap(), ChallengeType::TlsAlpn01);
        assert_eq!("dns".parse::<ChallengeType>().unwrap(), ChallengeType::Dns01);
        assert!("carrier-pigeon".parse::<ChallengeType>().unwrap_err().is_validation());
    }

    #[test]
    fn test_issue_args_per_challenge() {
        let http = issue_args("a.example.com", "ops@example.com", ChallengeType::Http01, "dns_cf");
        assert_eq!(http.last().map(String::as_str), Some("--standalone"));
        assert!(http.windows(2).any(|w| w[0] == "-d" && w[1] == "a.example.com"));

        let dns = issue_args("a.example.com", "ops@example.com", ChallengeType::Dns01, "dns_cf");
        assert_eq!(&dns[dns.len() - 2..], &["--dns".to_string(), "dns_cf".to_string()]);
    }
}
