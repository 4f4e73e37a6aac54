//! Per-domain TLS certificate store
//!
//! One `<domain>.crt` / `<domain>.key` pair per domain under the configured
//! directory. Trusted certificates come from the external ACME client; when
//! automated issuance fails for any reason the store falls back to a
//! self-signed certificate so the relay always has something to present.

pub mod acme;
pub mod material;

pub use acme::ChallengeType;

use crate::config::IssuanceSettings;
use crate::error::{RelayError, RelayResult};
use crate::fsutil;
use crate::gateway::{run_checked, ToolGateway};
use crate::lookup::HostLookup;
use crate::validation::{validate_domain, validate_email};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A certificate/key pair installed for one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCertificate {
    pub domain: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub issuer_cn: String,
    pub self_signed: bool,
    /// SHA-256 over the DER encoding, colon separated
    pub fingerprint: String,
}

impl DomainCertificate {
    pub fn is_expired(&self) -> bool {
        self.not_after <= Utc::now()
    }

    /// True if `not_after` falls within `days` of now (already expired counts)
    pub fn expires_within(&self, days: i64) -> bool {
        self.not_after <= Utc::now() + Duration::days(days)
    }
}

/// How an automated issuance request ended
#[derive(Debug, Clone)]
pub enum IssuanceOutcome {
    /// The ACME client issued and installed a trusted certificate
    Issued(DomainCertificate),
    /// Issuance failed and a self-signed certificate was installed instead
    SelfSignedFallback {
        certificate: DomainCertificate,
        reason: String,
    },
}

impl IssuanceOutcome {
    pub fn certificate(&self) -> &DomainCertificate {
        match self {
            IssuanceOutcome::Issued(cert) => cert,
            IssuanceOutcome::SelfSignedFallback { certificate, .. } => certificate,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, IssuanceOutcome::SelfSignedFallback { .. })
    }
}

/// Result of one renewal sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenewalReport {
    pub renewed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct CertificateStore {
    cert_dir: PathBuf,
    acme_binary: String,
    settings: IssuanceSettings,
    gateway: Arc<dyn ToolGateway>,
    lookup: Arc<dyn HostLookup>,
}

impl CertificateStore {
    pub fn new(
        cert_dir: PathBuf,
        acme_binary: String,
        settings: IssuanceSettings,
        gateway: Arc<dyn ToolGateway>,
        lookup: Arc<dyn HostLookup>,
    ) -> Self {
        Self {
            cert_dir,
            acme_binary,
            settings,
            gateway,
            lookup,
        }
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.cert_dir.join(format!("{}.crt", domain))
    }

    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.cert_dir.join(format!("{}.key", domain))
    }

    /// Generate and install a self-signed RSA-2048 certificate for `domain`
    pub async fn generate_self_signed(&self, domain: &str) -> RelayResult<DomainCertificate> {
        validate_domain(domain)?;

        let owned = domain.to_string();
        let days = self.settings.self_signed_validity_days;
        let pair = tokio::task::spawn_blocking(move || material::generate_self_signed(&owned, days))
            .await
            .map_err(|e| RelayError::InvalidState(format!("key generation task failed: {}", e)))??;

        self.write_pair(domain, pair.cert_pem.as_bytes(), pair.key_pem.as_bytes())
            .await?;
        let cert = self.inspect(domain).await?;
        info!("Generated self-signed certificate for {} (expires {})", domain, cert.not_after);
        Ok(cert)
    }

    /// Install externally supplied PEM material for `domain`.
    ///
    /// The files are written first and then re-validated; if the new material
    /// is unusable the previous pair (if any) is restored.
    pub async fn install(
        &self,
        domain: &str,
        cert_pem: &str,
        key_pem: &str,
    ) -> RelayResult<DomainCertificate> {
        validate_domain(domain)?;

        let cert_path = self.cert_path(domain);
        let key_path = self.key_path(domain);
        let previous_cert = fsutil::read_optional(&cert_path).await?;
        let previous_key = fsutil::read_optional(&key_path).await?;

        self.write_pair(domain, cert_pem.as_bytes(), key_pem.as_bytes())
            .await?;

        match self.validate(domain).await {
            Ok(cert) => {
                info!("Installed certificate for {} issued by '{}'", domain, cert.issuer_cn);
                Ok(cert)
            }
            Err(e) => {
                warn!("Installed material for {} is invalid, rolling back: {}", domain, e);
                match (previous_cert, previous_key) {
                    (Some(cert), Some(key)) => {
                        self.write_pair(domain, &cert, &key).await?;
                    }
                    _ => {
                        fsutil::delete_if_exists(&cert_path).await?;
                        fsutil::delete_if_exists(&key_path).await?;
                    }
                }
                Err(e)
            }
        }
    }

    /// Parse the on-disk pair for `domain` without judging expiry
    pub async fn inspect(&self, domain: &str) -> RelayResult<DomainCertificate> {
        validate_domain(domain)?;
        let cert_path = self.cert_path(domain);
        let key_path = self.key_path(domain);

        let cert_pem = fsutil::read_optional(&cert_path)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("No certificate for {}", domain)))?;
        if !key_path.exists() {
            return Err(RelayError::NotFound(format!("No private key for {}", domain)));
        }

        let facts = material::inspect(&cert_pem)?;
        Ok(DomainCertificate {
            domain: domain.to_string(),
            cert_path,
            key_path,
            not_before: facts.not_before,
            not_after: facts.not_after,
            issuer_cn: facts.issuer_cn,
            self_signed: facts.self_signed,
            fingerprint: facts.fingerprint,
        })
    }

    /// Full validation: files exist, parse, key matches, unexpired, and the
    /// certificate names `domain` in its CN or SAN.
    pub async fn validate(&self, domain: &str) -> RelayResult<DomainCertificate> {
        validate_domain(domain)?;
        let cert_path = self.cert_path(domain);
        let key_path = self.key_path(domain);

        let cert_pem = fsutil::read_optional(&cert_path)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("No certificate for {}", domain)))?;
        let key_pem = fsutil::read_optional(&key_path)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("No private key for {}", domain)))?;

        let facts = material::inspect(&cert_pem)?;
        material::check_key_matches(&cert_pem, &key_pem)?;

        if !facts.covers(domain) {
            return Err(RelayError::Certificate(format!(
                "certificate for CN={} SAN={:?} does not cover {}",
                facts.common_name.as_deref().unwrap_or("<none>"),
                facts.alt_names,
                domain
            )));
        }

        if facts.not_after <= Utc::now() {
            return Err(RelayError::CertificateExpired {
                domain: domain.to_string(),
                not_after: facts.not_after.to_rfc3339(),
            });
        }

        Ok(DomainCertificate {
            domain: domain.to_string(),
            cert_path,
            key_path,
            not_before: facts.not_before,
            not_after: facts.not_after,
            issuer_cn: facts.issuer_cn,
            self_signed: facts.self_signed,
            fingerprint: facts.fingerprint,
        })
    }

    /// Boolean form of [`validate`](Self::validate)
    pub async fn is_valid(&self, domain: &str) -> bool {
        match self.validate(domain).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Certificate for {} is not valid: {}", domain, e);
                false
            }
        }
    }

    /// True iff the certificate's `notAfter` falls within `days` of now
    pub async fn expiring_soon(&self, domain: &str, days: i64) -> RelayResult<bool> {
        Ok(self.inspect(domain).await?.expires_within(days))
    }

    /// Obtain a trusted certificate via the ACME client, falling back to a
    /// self-signed one on any failure.
    ///
    /// Input validation errors are still returned; only failures after
    /// validation (ownership check, tool invocation, bad issued material)
    /// trigger the fallback.
    pub async fn automated_issuance(
        &self,
        domain: &str,
        email: &str,
        challenge: ChallengeType,
    ) -> RelayResult<IssuanceOutcome> {
        validate_domain(domain)?;
        validate_email(email)?;

        match self.issue_via_acme(domain, email, challenge).await {
            Ok(cert) => Ok(IssuanceOutcome::Issued(cert)),
            Err(e) => {
                warn!(
                    "Automated issuance for {} failed, falling back to self-signed: {}",
                    domain, e
                );
                let certificate = self.generate_self_signed(domain).await?;
                Ok(IssuanceOutcome::SelfSignedFallback {
                    certificate,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Check that `domain` resolves to this host's public address
    pub async fn verify_ownership(&self, domain: &str) -> RelayResult<()> {
        let resolved = self.lookup.resolve(domain).await?;
        let public = self.lookup.public_address().await?;

        if !resolved.contains(&public) {
            return Err(RelayError::Validation(format!(
                "{} resolves to {:?}, but this host's public address is {}",
                domain, resolved, public
            )));
        }

        debug!("{} resolves to this host ({})", domain, public);
        Ok(())
    }

    async fn issue_via_acme(
        &self,
        domain: &str,
        email: &str,
        challenge: ChallengeType,
    ) -> RelayResult<DomainCertificate> {
        self.verify_ownership(domain).await?;

        info!("Requesting certificate for {} ({} challenge)", domain, challenge);
        let args = acme::issue_args(domain, email, challenge, &self.settings.dns_provider);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.gateway.run(&self.acme_binary, &arg_refs).await?;

        if !output.success() && output.code != Some(acme::EXIT_SKIPPED) {
            return Err(RelayError::ExternalTool {
                tool: format!("{} --issue -d {}", self.acme_binary, domain),
                code: output.code,
                output: crate::validation::sanitize_error_message(&output.combined()),
            });
        }

        self.install_from_acme(domain).await
    }

    async fn install_from_acme(&self, domain: &str) -> RelayResult<DomainCertificate> {
        fsutil::ensure_directory_exists(&self.cert_dir).await?;

        let cert_path = self.cert_path(domain);
        let key_path = self.key_path(domain);
        let args = acme::install_args(
            domain,
            &cert_path.to_string_lossy(),
            &key_path.to_string_lossy(),
        );
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked(self.gateway.as_ref(), &self.acme_binary, &arg_refs).await?;

        self.validate(domain).await
    }

    /// Renew every trusted certificate expiring within the configured window.
    ///
    /// Self-signed certificates are skipped. A failure for one domain is
    /// logged and recorded without stopping the sweep.
    pub async fn auto_renew(&self) -> RenewalReport {
        let mut report = RenewalReport::default();

        let domains = match self.list_domains().await {
            Ok(domains) => domains,
            Err(e) => {
                warn!("Cannot enumerate certificates for renewal: {}", e);
                return report;
            }
        };

        for domain in domains {
            let cert = match self.inspect(&domain).await {
                Ok(cert) => cert,
                Err(e) => {
                    warn!("Skipping renewal of {}: {}", domain, e);
                    report.failed.push((domain, e.to_string()));
                    continue;
                }
            };

            if cert.self_signed || !cert.expires_within(self.settings.renew_within_days) {
                report.skipped.push(domain);
                continue;
            }

            match self.renew(&domain).await {
                Ok(renewed) => {
                    info!("Renewed certificate for {} (now expires {})", domain, renewed.not_after);
                    report.renewed.push(domain);
                }
                Err(e) => {
                    warn!("Renewal of {} failed: {}", domain, e);
                    report.failed.push((domain, e.to_string()));
                }
            }
        }

        report
    }

    async fn renew(&self, domain: &str) -> RelayResult<DomainCertificate> {
        let args = acme::renew_args(domain);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.gateway.run(&self.acme_binary, &arg_refs).await?;

        if !output.success() && output.code != Some(acme::EXIT_SKIPPED) {
            return Err(RelayError::ExternalTool {
                tool: format!("{} --renew -d {}", self.acme_binary, domain),
                code: output.code,
                output: crate::validation::sanitize_error_message(&output.combined()),
            });
        }

        self.install_from_acme(domain).await
    }

    /// Domains with a certificate file in the store, sorted
    pub async fn list_domains(&self) -> RelayResult<Vec<String>> {
        let mut domains = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.cert_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(domains),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(domain) = name.strip_suffix(".crt") {
                if validate_domain(domain).is_ok() {
                    domains.push(domain.to_string());
                }
            }
        }

        domains.sort();
        Ok(domains)
    }

    /// Delete the pair for `domain`
    pub async fn remove(&self, domain: &str) -> RelayResult<()> {
        validate_domain(domain)?;
        let cert_path = self.cert_path(domain);
        if !cert_path.exists() {
            return Err(RelayError::NotFound(format!("No certificate for {}", domain)));
        }
        fsutil::delete_if_exists(&cert_path).await?;
        fsutil::delete_if_exists(&self.key_path(domain)).await?;
        info!("Removed certificate for {}", domain);
        Ok(())
    }

    async fn write_pair(&self, domain: &str, cert_pem: &[u8], key_pem: &[u8]) -> RelayResult<()> {
        fsutil::ensure_directory_exists(&self.cert_dir).await?;
        fsutil::write_atomic(&self.cert_path(domain), cert_pem, 0o644).await?;
        fsutil::write_atomic(&self.key_path(domain), key_pem, 0o600).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ScriptedGateway, ToolOutput};
    use crate::lookup::MockHostLookup;
    use std::net::IpAddr;
    use tempfile::TempDir;

    fn host_at(public: &'static str, resolved: &'static str) -> MockHostLookup {
        let mut lookup = MockHostLookup::new();
        lookup
            .expect_public_address()
            .returning(move || Ok(public.parse::<IpAddr>().unwrap()));
        lookup
            .expect_resolve()
            .returning(move |_| Ok(vec![resolved.parse::<IpAddr>().unwrap()]));
        lookup
    }

    fn store(dir: &TempDir, gateway: Arc<dyn ToolGateway>, lookup: MockHostLookup) -> CertificateStore {
        CertificateStore::new(
            dir.path().join("certs"),
            "acme.sh".to_string(),
            IssuanceSettings::default(),
            gateway,
            Arc::new(lookup),
        )
    }

    #[tokio::test]
    async fn test_generate_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Arc::new(ScriptedGateway::succeeding()), MockHostLookup::new());

        let cert = store.generate_self_signed("a.example.com").await.unwrap();
        assert!(cert.self_signed);
        assert_eq!(cert.issuer_cn, "a.example.com");
        assert!(store.is_valid("a.example.com").await);
        assert!(!store.expiring_soon("a.example.com", 30).await.unwrap());
        assert!(store.expiring_soon("a.example.com", 400).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_certificate_fails_with_expiry_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Arc::new(ScriptedGateway::succeeding()), MockHostLookup::new());

        let now = Utc::now();
        let pair = material::generate_with_window(
            "old.example.com",
            now - Duration::days(400),
            now - Duration::days(35),
        )
        .unwrap();
        store
            .write_pair("old.example.com", pair.cert_pem.as_bytes(), pair.key_pem.as_bytes())
            .await
            .unwrap();

        let err = store.validate("old.example.com").await.unwrap_err();
        assert!(matches!(err, RelayError::CertificateExpired { .. }));
        assert!(!store.is_valid("old.example.com").await);
    }

    #[tokio::test]
    async fn test_validate_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Arc::new(ScriptedGateway::succeeding()), MockHostLookup::new());
        assert!(matches!(
            store.validate("none.example.com").await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lookups_reject_paths_outside_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Arc::new(ScriptedGateway::succeeding()), MockHostLookup::new());
        std::fs::write(dir.path().join("x.crt"), "outside").unwrap();

        for domain in ["../x", "../../x", "a/b.example.com"] {
            assert!(matches!(store.validate(domain).await, Err(RelayError::Validation(_))));
            assert!(matches!(store.inspect(domain).await, Err(RelayError::Validation(_))));
            assert!(matches!(store.remove(domain).await, Err(RelayError::Validation(_))));
        }
        assert!(dir.path().join("x.crt").exists());
    }

    #[tokio::test]
    async fn test_install_rejects_wrong_domain_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Arc::new(ScriptedGateway::succeeding()), MockHostLookup::new());

        let original = store.generate_self_signed("a.example.com").await.unwrap();
        let other = material::generate_self_signed("b.example.com", 30).unwrap();

        let err = store
            .install("a.example.com", &other.cert_pem, &other.key_pem)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not cover a.example.com"));

        let after = store.validate("a.example.com").await.unwrap();
        assert_eq!(after.fingerprint, original.fingerprint);
    }

    #[tokio::test]
    async fn test_install_garbage_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Arc::new(ScriptedGateway::succeeding()), MockHostLookup::new());

        assert!(store.install("c.example.com", "junk", "junk").await.is_err());
        assert!(!store.cert_path("c.example.com").exists());
        assert!(!store.key_path("c.example.com").exists());
    }

    #[tokio::test]
    async fn test_issuance_falls_back_when_dns_points_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(ScriptedGateway::succeeding());
        let store = store(&dir, gateway.clone(), host_at("203.0.113.1", "198.51.100.9"));

        let outcome = store
            .automated_issuance("a.example.com", "ops@example.com", ChallengeType::Http01)
            .await
            .unwrap();

        assert!(outcome.is_fallback());
        assert!(outcome.certificate().self_signed);
        assert_eq!(gateway.count("acme.sh"), 0);
        assert!(store.is_valid("a.example.com").await);
    }

    #[tokio::test]
    async fn test_issuance_falls_back_when_tool_fails() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(ScriptedGateway::new(|_, _| ToolOutput::failed(1, "rate limited")));
        let store = store(&dir, gateway.clone(), host_at("203.0.113.1", "203.0.113.1"));

        let outcome = store
            .automated_issuance("a.example.com", "ops@example.com", ChallengeType::TlsAlpn01)
            .await
            .unwrap();

        match outcome {
            IssuanceOutcome::SelfSignedFallback { reason, .. } => assert!(reason.contains("rate limited")),
            other => panic!("expected fallback, got {:?}", other),
        }
        assert_eq!(gateway.count("acme.sh"), 1);
    }

    #[tokio::test]
    async fn test_issuance_installs_tool_output() {
        let dir = tempfile::tempdir().unwrap();
        let issued = material::generate_self_signed("a.example.com", 90).unwrap();

        // The fake ACME client writes the issued pair where --install-cert asks
        let gateway = Arc::new(ScriptedGateway::new(move |_, args| {
            if args.first().map(String::as_str) == Some("--install-cert") {
                std::fs::write(&args[4], &issued.cert_pem).unwrap();
                std::fs::write(&args[6], &issued.key_pem).unwrap();
            }
            ToolOutput::ok("")
        }));
        let store = store(&dir, gateway.clone(), host_at("203.0.113.1", "203.0.113.1"));

        let outcome = store
            .automated_issuance("a.example.com", "ops@example.com", ChallengeType::Dns01)
            .await
            .unwrap();

        assert!(!outcome.is_fallback());
        let lines = gateway.lines();
        assert!(lines[0].starts_with("acme.sh --issue -d a.example.com"));
        assert!(lines[0].ends_with("--dns dns_cf"));
        assert!(lines[1].starts_with("acme.sh --install-cert -d a.example.com"));
    }

    #[tokio::test]
    async fn test_invalid_email_is_rejected_without_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Arc::new(ScriptedGateway::succeeding()), MockHostLookup::new());

        let err = store
            .automated_issuance("a.example.com", "not-an-email", ChallengeType::Http01)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(!store.cert_path("a.example.com").exists());
    }

    #[tokio::test]
    async fn test_auto_renew_skips_self_signed_and_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(ScriptedGateway::new(|_, args| {
            if args.iter().any(|a| a == "bad.example.com") {
                ToolOutput::failed(1, "challenge failed")
            } else {
                ToolOutput::ok("")
            }
        }));
        let store = store(&dir, gateway.clone(), MockHostLookup::new());

        // Self-signed and expiring: skipped
        let now = Utc::now();
        let pair = material::generate_with_window("self.example.com", now, now + Duration::days(5)).unwrap();
        store
            .write_pair("self.example.com", pair.cert_pem.as_bytes(), pair.key_pem.as_bytes())
            .await
            .unwrap();

        // Trusted (issuer differs) and expiring: renewal fails
        let trusted = signed_by_other_issuer("bad.example.com", 10);
        store
            .write_pair("bad.example.com", trusted.0.as_bytes(), trusted.1.as_bytes())
            .await
            .unwrap();

        // Trusted and far from expiry: skipped
        let fresh = signed_by_other_issuer("fresh.example.com", 80);
        store
            .write_pair("fresh.example.com", fresh.0.as_bytes(), fresh.1.as_bytes())
            .await
            .unwrap();

        let report = store.auto_renew().await;
        assert!(report.renewed.is_empty());
        assert_eq!(
            report.skipped,
            vec!["fresh.example.com".to_string(), "self.example.com".to_string()]
        );
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad.example.com");
        assert!(report.failed[0].1.contains("challenge failed"));
        assert_eq!(gateway.count("acme.sh"), 1);
    }

    /// Leaf certificate signed by a separate CA key, so it is not self-issued
    fn signed_by_other_issuer(domain: &str, days: u32) -> (String, String) {
        use openssl::asn1::Asn1Time;
        use openssl::hash::MessageDigest;
        use openssl::nid::Nid;
        use openssl::pkey::PKey;
        use openssl::rsa::Rsa;
        use openssl::x509::extension::SubjectAlternativeName;
        use openssl::x509::{X509NameBuilder, X509};

        let ca_key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let leaf_key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

        let mut issuer = X509NameBuilder::new().unwrap();
        issuer.append_entry_by_nid(Nid::COMMONNAME, "Test Issuing CA").unwrap();
        let issuer = issuer.build();
        let mut subject = X509NameBuilder::new().unwrap();
        subject.append_entry_by_nid(Nid::COMMONNAME, domain).unwrap();
        let subject = subject.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&subject).unwrap();
        builder.set_issuer_name(&issuer).unwrap();
        builder.set_pubkey(&leaf_key).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(days).unwrap()).unwrap();
        let san = SubjectAlternativeName::new()
            .dns(domain)
            .build(&builder.x509v3_context(None, None))
            .unwrap();
        builder.append_extension(san).unwrap();
        builder.sign(&ca_key, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        (
            String::from_utf8(cert.to_pem().unwrap()).unwrap(),
            String::from_utf8(leaf_key.private_key_to_pem_pkcs8().unwrap()).unwrap(),
        )
    }
}
