//! SNI domain registry
//!
//! Ordered set of domains the relay presents certificates for, with at most
//! one primary. Every mutation is applied to a copy, persisted, then
//! committed, so a failed write leaves the in-memory registry unchanged.

use crate::error::{RelayError, RelayResult};
use crate::fsutil;
use crate::validation::validate_domain;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

/// Snapshot of the registry, also its on-disk JSON form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SniStatus {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    #[serde(default)]
    pub domains: Vec<String>,
}

impl SniStatus {
    fn check(&self) -> RelayResult<()> {
        for (i, domain) in self.domains.iter().enumerate() {
            validate_domain(domain)?;
            if self.domains[..i].contains(domain) {
                return Err(RelayError::Conflict(format!("Domain {} listed twice", domain)));
            }
        }
        match &self.primary {
            Some(primary) if !self.domains.contains(primary) => Err(RelayError::Validation(
                format!("Primary domain {} is not registered", primary),
            )),
            None if !self.domains.is_empty() && self.enabled => Err(RelayError::Validation(
                "SNI is enabled with domains but no primary".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

pub struct SniDomainRegistry {
    path: Option<PathBuf>,
    state: SniStatus,
}

impl SniDomainRegistry {
    /// Registry that is never persisted
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: SniStatus::default(),
        }
    }

    /// Load the registry from `path`, starting empty if the file is absent
    pub async fn load(path: PathBuf) -> RelayResult<Self> {
        let state = match fsutil::read_optional(&path).await? {
            Some(bytes) => {
                let state: SniStatus = serde_json::from_slice(&bytes)?;
                state.check()?;
                debug!("Loaded {} SNI domain(s) from {:?}", state.domains.len(), path);
                state
            }
            None => SniStatus::default(),
        };

        Ok(Self {
            path: Some(path),
            state,
        })
    }

    pub fn status(&self) -> SniStatus {
        self.state.clone()
    }

    pub fn domains(&self) -> &[String] {
        &self.state.domains
    }

    pub fn primary(&self) -> Option<&str> {
        self.state.primary.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled
    }

    pub fn contains(&self, domain: &str) -> bool {
        let domain = normalize(domain);
        self.state.domains.iter().any(|d| *d == domain)
    }

    /// Append `domain`. The first domain added to an empty, disabled
    /// registry enables SNI and becomes primary.
    pub async fn add_domain(&mut self, domain: &str) -> RelayResult<SniStatus> {
        validate_domain(domain)?;
        let domain = normalize(domain);
        let domain = domain.as_str();
        if self.contains(domain) {
            return Err(RelayError::Conflict(format!("Domain {} is already registered", domain)));
        }

        let mut next = self.state.clone();
        let was_empty = next.domains.is_empty();
        next.domains.push(domain.to_string());
        if was_empty && !next.enabled {
            next.enabled = true;
            next.primary = Some(domain.to_string());
        } else if next.primary.is_none() {
            next.primary = Some(domain.to_string());
        }

        self.commit(next).await?;
        info!("Added SNI domain {}", domain);
        Ok(self.status())
    }

    /// Remove `domain`, promoting the first remaining domain if it was primary.
    /// Removing the last domain disables SNI.
    pub async fn remove_domain(&mut self, domain: &str) -> RelayResult<SniStatus> {
        let domain = normalize(domain);
        let domain = domain.as_str();
        let index = self
            .state
            .domains
            .iter()
            .position(|d| d == domain)
            .ok_or_else(|| RelayError::NotFound(format!("Domain {} is not registered", domain)))?;

        let mut next = self.state.clone();
        next.domains.remove(index);
        if next.domains.is_empty() {
            next.enabled = false;
            next.primary = None;
        } else if next.primary.as_deref() == Some(domain) {
            next.primary = next.domains.first().cloned();
        }

        self.commit(next).await?;
        info!("Removed SNI domain {}", domain);
        Ok(self.status())
    }

    pub async fn set_primary(&mut self, domain: &str) -> RelayResult<SniStatus> {
        if !self.contains(domain) {
            return Err(RelayError::NotFound(format!("Domain {} is not registered", domain)));
        }
        let mut next = self.state.clone();
        next.primary = Some(normalize(domain));
        self.commit(next).await?;
        Ok(self.status())
    }

    pub async fn enable(&mut self) -> RelayResult<SniStatus> {
        let mut next = self.state.clone();
        next.enabled = true;
        if next.primary.is_none() {
            next.primary = next.domains.first().cloned();
        }
        self.commit(next).await?;
        Ok(self.status())
    }

    /// Turn SNI off; membership and primary are kept
    pub async fn disable(&mut self) -> RelayResult<SniStatus> {
        let mut next = self.state.clone();
        next.enabled = false;
        self.commit(next).await?;
        Ok(self.status())
    }

    /// Replace the whole registry. `primary` defaults to the first domain.
    pub async fn configure(
        &mut self,
        enabled: bool,
        domains: Vec<String>,
        primary: Option<String>,
    ) -> RelayResult<SniStatus> {
        let domains: Vec<String> = domains.iter().map(|d| normalize(d)).collect();
        let primary = match primary {
            Some(p) if !p.is_empty() => Some(normalize(&p)),
            _ => domains.first().cloned(),
        };
        let next = SniStatus {
            enabled: enabled && !domains.is_empty(),
            primary,
            domains,
        };
        next.check()?;

        self.commit(next).await?;
        info!(
            "SNI configured: enabled={} domains={:?} primary={:?}",
            self.state.enabled, self.state.domains, self.state.primary
        );
        Ok(self.status())
    }

    async fn commit(&mut self, next: SniStatus) -> RelayResult<()> {
        if let Some(path) = &self.path {
            let json = serde_json::to_vec_pretty(&next)?;
            fsutil::write_atomic(path, &json, 0o644).await?;
        }
        self.state = next;
        Ok(())
    }
}

/// DNS names compare case-insensitively; the registry stores lowercase
pub fn normalize(domain: &str) -> String {
    domain.to_ascii_lowercase()
}
