//! Certificates and SNI D-Bus interface

use super::{to_json, CERTIFICATES_PATH};
use crate::agent::RelayAgent;
use crate::certs::{ChallengeType, IssuanceOutcome};
use crate::error::RelayResult;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use zbus::object_server::SignalEmitter;
use zbus::{fdo, interface, Connection};

pub struct RelayCertificates {
    agent: Arc<RelayAgent>,
}

impl RelayCertificates {
    pub fn new(agent: Arc<RelayAgent>) -> Self {
        Self { agent }
    }
}

#[interface(name = "org.relayctl.Agent.Certificates")]
impl RelayCertificates {
    /// Replace the SNI configuration; an empty `primary` picks the first domain
    async fn configure_sni(
        &self,
        enabled: bool,
        domains: Vec<String>,
        primary: &str,
    ) -> fdo::Result<String> {
        let primary = (!primary.is_empty()).then(|| primary.to_string());
        let status = self.agent.configure_sni(enabled, domains, primary).await?;
        to_json(&status)
    }

    async fn add_domain(
        &self,
        domain: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<String> {
        info!("D-Bus: adding SNI domain {}", domain);
        let status = self.agent.add_sni_domain(domain).await?;
        Self::domains_changed(&emitter, status.domains.clone()).await?;
        to_json(&status)
    }

    async fn remove_domain(
        &self,
        domain: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<String> {
        info!("D-Bus: removing SNI domain {}", domain);
        let status = self.agent.remove_sni_domain(domain).await?;
        Self::domains_changed(&emitter, status.domains.clone()).await?;
        to_json(&status)
    }

    async fn set_primary_domain(&self, domain: &str) -> fdo::Result<String> {
        to_json(&self.agent.set_primary_domain(domain).await?)
    }

    async fn set_sni_enabled(&self, enabled: bool) -> fdo::Result<String> {
        to_json(&self.agent.set_sni_enabled(enabled).await?)
    }

    async fn get_sni_status(&self) -> fdo::Result<String> {
        to_json(&self.agent.sni_status().await)
    }

    async fn generate_self_signed(
        &self,
        domain: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<String> {
        let cert = self.agent.certificates().generate_self_signed(domain).await?;
        Self::certificate_changed(&emitter, domain, true).await?;
        to_json(&cert)
    }

    async fn install_certificate(
        &self,
        domain: &str,
        cert_pem: &str,
        key_pem: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<String> {
        let cert = self
            .agent
            .certificates()
            .install(domain, cert_pem, key_pem)
            .await?;
        Self::certificate_changed(&emitter, domain, cert.self_signed).await?;
        to_json(&cert)
    }

    /// ACME issuance; falls back to a self-signed certificate and says so
    async fn issue_certificate(
        &self,
        domain: &str,
        email: &str,
        challenge: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<String> {
        let challenge: ChallengeType = challenge.parse()?;
        let outcome = self
            .agent
            .certificates()
            .automated_issuance(domain, email, challenge)
            .await?;
        Self::certificate_changed(&emitter, domain, outcome.is_fallback()).await?;
        let reason = match &outcome {
            IssuanceOutcome::SelfSignedFallback { reason, .. } => Some(reason.clone()),
            IssuanceOutcome::Issued(_) => None,
        };
        to_json(&json!({
            "certificate": outcome.certificate(),
            "fallback": outcome.is_fallback(),
            "reason": reason,
        }))
    }

    /// Never fails for an invalid certificate; the reason is in the result
    async fn validate_certificate(&self, domain: &str) -> fdo::Result<String> {
        let result = match self.agent.certificates().validate(domain).await {
            Ok(cert) => json!({ "domain": domain, "valid": true, "certificate": cert }),
            Err(e) => json!({ "domain": domain, "valid": false, "reason": e.to_string() }),
        };
        to_json(&result)
    }

    async fn list_certificates(&self) -> fdo::Result<Vec<String>> {
        Ok(self.agent.certificates().list_domains().await?)
    }

    async fn renew_certificates(&self) -> fdo::Result<String> {
        to_json(&self.agent.renew_certificates().await)
    }

    #[zbus(signal)]
    async fn certificate_changed(
        signal_emitter: &SignalEmitter<'_>,
        domain: &str,
        self_signed: bool,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn domains_changed(signal_emitter: &SignalEmitter<'_>, domains: Vec<String>) -> zbus::Result<()>;
}

pub mod signals {
    use super::*;

    /// Emit CertificateChanged from outside a method call (scheduled renewal)
    pub async fn emit_certificate_changed(
        conn: &Connection,
        domain: &str,
        self_signed: bool,
    ) -> RelayResult<()> {
        if let Ok(iface_ref) = conn
            .object_server()
            .interface::<_, RelayCertificates>(CERTIFICATES_PATH)
            .await
        {
            RelayCertificates::certificate_changed(iface_ref.signal_emitter(), domain, self_signed)
                .await?;
        }
        Ok(())
    }
}
