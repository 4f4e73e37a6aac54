//! Relay node agent
//!
//! Owns the components and implements the workflows that span more than one
//! of them. Each component gets its own slice of [`AgentConfig`] at
//! construction; nothing here reaches into another component's state.

use crate::certs::{CertificateStore, DomainCertificate, RenewalReport};
use crate::config::AgentConfig;
use crate::descriptor::{load_or_mint_secret, ConfigGenerator, DescriptorInputs};
use crate::error::{RelayError, RelayResult};
use crate::gateway::{SystemGateway, ToolGateway};
use crate::health::{ConnectivityProbe, HealthMonitor, HttpProbe};
use crate::lookup::{HostLookup, SystemLookup};
use crate::obfs::{ModeSettings, ObfuscationMode, ObfuscationModeController, ObfuscationSnapshot, OutboundProxySettings};
use crate::proxy::{ProxyConfig, ProxyLifecycleManager, ProxyStatus};
use crate::routing::TrafficRouter;
use crate::sni::{SniDomainRegistry, SniStatus};
use crate::validation::validate_interface_name;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Steps of [`RelayAgent::activate_outbound_proxy`], in order
pub const ACTIVATION_STEPS: [&str; 6] = [
    "configure",
    "connect",
    "enable-proxy-mode",
    "regenerate-config",
    "apply-routing",
    "enable-masquerade",
];

/// Steps of [`RelayAgent::deactivate_outbound_proxy`], in order
pub const DEACTIVATION_STEPS: [&str; 4] = [
    "remove-routing",
    "disable-proxy-mode",
    "disconnect",
    "regenerate-config",
];

pub struct RelayAgent {
    config: AgentConfig,
    certs: CertificateStore,
    sni: RwLock<SniDomainRegistry>,
    obfuscation: Arc<RwLock<ObfuscationModeController>>,
    generator: RwLock<ConfigGenerator>,
    proxy: Arc<ProxyLifecycleManager>,
    router: TrafficRouter,
    health: HealthMonitor,
}

impl RelayAgent {
    /// Agent backed by real processes, HTTP endpoints and the system resolver
    pub async fn from_config(config: AgentConfig) -> RelayResult<Self> {
        Self::with_gateway(config, Arc::new(SystemGateway::new())).await
    }

    /// Real network lookups and probes, but every process goes through
    /// `gateway`
    pub async fn with_gateway(config: AgentConfig, gateway: Arc<dyn ToolGateway>) -> RelayResult<Self> {
        let lookup = Arc::new(SystemLookup::new(
            config.issuance.ip_echo_endpoints.clone(),
            Duration::from_millis(config.issuance.lookup_timeout_ms),
        ));
        let probe = Arc::new(HttpProbe::new(
            config.health.probe_targets.clone(),
            Duration::from_millis(config.health.probe_timeout_ms),
        ));
        Self::new(config, gateway, lookup, probe).await
    }

    pub async fn new(
        config: AgentConfig,
        gateway: Arc<dyn ToolGateway>,
        lookup: Arc<dyn HostLookup>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> RelayResult<Self> {
        let certs = CertificateStore::new(
            config.paths.cert_dir.clone(),
            config.tools.acme_binary.clone(),
            config.issuance.clone(),
            gateway.clone(),
            lookup.clone(),
        );
        let sni = SniDomainRegistry::load(config.sni_state_path()).await?;
        let obfuscation = Arc::new(RwLock::new(ObfuscationModeController::new()));
        let mut relay = config.relay.clone();
        if relay.auth_password.is_empty() {
            relay.auth_password = load_or_mint_secret(&config.auth_secret_path()).await?;
        }
        let generator = ConfigGenerator::new(relay, config.paths.cert_dir.clone());
        let proxy = Arc::new(ProxyLifecycleManager::new(
            config.tools.clone(),
            config.proxy.clone(),
            gateway.clone(),
            lookup,
            obfuscation.clone(),
        ));
        let router = TrafficRouter::new(&config.tools, gateway);
        let health = HealthMonitor::new(config.health.clone(), proxy.clone(), probe);

        Ok(Self {
            config,
            certs,
            sni: RwLock::new(sni),
            obfuscation,
            generator: RwLock::new(generator),
            proxy,
            router,
            health,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn certificates(&self) -> &CertificateStore {
        &self.certs
    }

    pub fn proxy(&self) -> &ProxyLifecycleManager {
        &self.proxy
    }

    pub fn router(&self) -> &TrafficRouter {
        &self.router
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    // SNI

    pub async fn sni_status(&self) -> SniStatus {
        self.sni.read().await.status()
    }

    /// Register `domain` for SNI, generating a self-signed certificate if it
    /// has no valid one yet.
    pub async fn add_sni_domain(&self, domain: &str) -> RelayResult<SniStatus> {
        let status = self.sni.write().await.add_domain(domain).await?;
        let domain = crate::sni::normalize(domain);
        if !self.certs.is_valid(&domain).await {
            info!("No valid certificate for {}; generating a self-signed one", domain);
            self.certs.generate_self_signed(&domain).await?;
        }
        self.refresh_relay_config().await;
        Ok(status)
    }

    pub async fn remove_sni_domain(&self, domain: &str) -> RelayResult<SniStatus> {
        let status = self.sni.write().await.remove_domain(domain).await?;
        self.refresh_relay_config().await;
        Ok(status)
    }

    pub async fn set_primary_domain(&self, domain: &str) -> RelayResult<SniStatus> {
        let status = self.sni.write().await.set_primary(domain).await?;
        self.refresh_relay_config().await;
        Ok(status)
    }

    pub async fn configure_sni(
        &self,
        enabled: bool,
        domains: Vec<String>,
        primary: Option<String>,
    ) -> RelayResult<SniStatus> {
        let status = self
            .sni
            .write()
            .await
            .configure(enabled, domains, primary)
            .await?;
        for domain in &status.domains {
            if !self.certs.is_valid(domain).await {
                self.certs.generate_self_signed(domain).await?;
            }
        }
        self.refresh_relay_config().await;
        Ok(status)
    }

    pub async fn set_sni_enabled(&self, enabled: bool) -> RelayResult<SniStatus> {
        let status = {
            let mut sni = self.sni.write().await;
            if enabled {
                sni.enable().await?
            } else {
                sni.disable().await?
            }
        };
        self.refresh_relay_config().await;
        Ok(status)
    }

    /// Rewrite the relay configuration after a registry change. The registry
    /// is already persisted, so a descriptor that cannot be rendered yet (no
    /// TLS pair) is logged rather than returned.
    async fn refresh_relay_config(&self) {
        if let Err(e) = self.write_relay_config().await {
            warn!("Relay config not rewritten after SNI change: {}", e);
        }
    }

    // Obfuscation

    pub async fn obfuscation_status(&self) -> ObfuscationSnapshot {
        self.obfuscation.read().await.snapshot()
    }

    /// Activate a mode and rewrite the relay configuration. If the rewrite
    /// fails the previous mode is put back.
    pub async fn enable_mode(&self, settings: ModeSettings) -> RelayResult<ObfuscationSnapshot> {
        let previous = {
            let mut obfs = self.obfuscation.write().await;
            let previous = obfs.snapshot();
            obfs.activate(settings)?;
            previous
        };

        if let Err(e) = self.write_relay_config().await {
            warn!("Relay config rewrite failed, restoring mode {}: {}", previous.mode, e);
            self.obfuscation.write().await.restore(previous);
            return Err(e);
        }
        Ok(self.obfuscation_status().await)
    }

    /// Disable `mode` if active and rewrite the relay configuration
    pub async fn disable_mode(&self, mode: ObfuscationMode) -> RelayResult<bool> {
        let disabled = self.obfuscation.write().await.disable(mode);
        if disabled {
            self.write_relay_config().await?;
        }
        Ok(disabled)
    }

    // Relay configuration

    pub async fn render_descriptor(&self) -> RelayResult<String> {
        let snapshot = self.obfuscation.read().await.snapshot();
        let sni = self.sni.read().await.status();
        let generator = self.generator.read().await;
        generator.render_string(DescriptorInputs {
            obfuscation: &snapshot,
            sni: &sni,
            acl_file: Some(&self.config.paths.acl_path),
        })
    }

    /// Write the ACL for the active mode, then the relay descriptor
    pub async fn write_relay_config(&self) -> RelayResult<()> {
        let snapshot = self.obfuscation.read().await.snapshot();
        let sni = self.sni.read().await.status();
        let acl_path = &self.config.paths.acl_path;

        self.router.generate_acl(snapshot.mode, acl_path).await?;

        let generator = self.generator.read().await;
        generator
            .write(
                &self.config.paths.relay_config_path,
                DescriptorInputs {
                    obfuscation: &snapshot,
                    sni: &sni,
                    acl_file: Some(acl_path),
                },
            )
            .await
    }

    pub async fn set_descriptor_override(&self, descriptor: Option<serde_json::Value>) -> RelayResult<()> {
        self.generator.write().await.set_override(descriptor)
    }

    // Outbound proxy

    /// Bring the outbound proxy up end to end: configure, connect, switch to
    /// proxy mode, regenerate the relay config, then install routing and
    /// masquerading. Stops at the first failing step and reports it.
    pub async fn activate_outbound_proxy(
        &self,
        cfg: ProxyConfig,
        relay_interface: &str,
        force: bool,
    ) -> RelayResult<Vec<&'static str>> {
        let port = cfg.validate()?;
        validate_interface_name(relay_interface)?;
        validate_interface_name(&self.config.proxy.egress_interface)?;

        let mut done = Vec::with_capacity(ACTIVATION_STEPS.len());
        let mut cfg = cfg;
        cfg.enabled = true;

        step(&mut done, ACTIVATION_STEPS[0], self.proxy.configure(cfg, force)).await?;
        step(&mut done, ACTIVATION_STEPS[1], self.proxy.connect()).await?;
        step(&mut done, ACTIVATION_STEPS[2], self.proxy.enable_proxy_mode(port as u32)).await?;
        step(&mut done, ACTIVATION_STEPS[3], async {
            self.obfuscation
                .write()
                .await
                .activate(ModeSettings::OutboundProxy(OutboundProxySettings { proxy_port: port }))?;
            self.write_relay_config().await
        })
        .await?;
        step(&mut done, ACTIVATION_STEPS[4], self.router.setup_routing(port as u32, relay_interface)).await?;
        step(
            &mut done,
            ACTIVATION_STEPS[5],
            self.router.enable_masquerade(&self.config.proxy.egress_interface),
        )
        .await?;

        info!("Outbound proxy active on port {} via {}", port, relay_interface);
        Ok(done)
    }

    /// Inverse of [`activate_outbound_proxy`](Self::activate_outbound_proxy)
    pub async fn deactivate_outbound_proxy(&self) -> RelayResult<Vec<&'static str>> {
        let mut done = Vec::with_capacity(DEACTIVATION_STEPS.len());

        step(&mut done, DEACTIVATION_STEPS[0], self.router.cleanup_routing()).await?;
        step(&mut done, DEACTIVATION_STEPS[1], self.proxy.disable_proxy_mode()).await?;
        step(&mut done, DEACTIVATION_STEPS[2], self.proxy.disconnect()).await?;
        step(&mut done, DEACTIVATION_STEPS[3], async {
            self.obfuscation.write().await.disable(ObfuscationMode::OutboundProxy);
            self.write_relay_config().await
        })
        .await?;

        info!("Outbound proxy deactivated");
        Ok(done)
    }

    /// Proxy status with the latest health sample attached
    pub async fn proxy_status(&self) -> RelayResult<ProxyStatus> {
        let mut status = self.proxy.status().await?;
        status.health = self.health.latest().await;
        Ok(status)
    }

    // Certificates

    pub async fn renew_certificates(&self) -> RenewalReport {
        self.certs.auto_renew().await
    }

    pub async fn certificate_status(&self) -> Vec<RelayResult<DomainCertificate>> {
        let domains = self.sni.read().await.domains().to_vec();
        join_all(domains.iter().map(|domain| self.certs.validate(domain))).await
    }
}

/// Run one workflow step, recording it on success and turning a failure
/// into [`RelayError::PartialApply`].
async fn step<T, F>(done: &mut Vec<&'static str>, name: &'static str, fut: F) -> RelayResult<T>
where
    F: Future<Output = RelayResult<T>>,
{
    match fut.await {
        Ok(value) => {
            done.push(name);
            Ok(value)
        }
        Err(e) => {
            warn!("Step '{}' failed after {} completed step(s): {}", name, done.len(), e);
            Err(RelayError::PartialApply {
                step: name.to_string(),
                completed: done.len(),
                reason: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigPaths;
    use crate::gateway::{ScriptedGateway, ToolOutput};
    use crate::health::{MockConnectivityProbe, ProbeOutcome};
    use crate::lookup::MockHostLookup;
    use crate::obfs::{MasqueradeSettings, SalamanderSettings};
    use crate::proxy::ClientType;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.paths = ConfigPaths {
            cert_dir: dir.path().join("certs"),
            state_dir: dir.path().join("state"),
            acl_path: dir.path().join("acl.txt"),
            relay_config_path: dir.path().join("relay.json"),
        };
        config.relay.auth_password = "relay-pass".to_string();
        config.proxy.restart_grace_ms = 0;
        config
    }

    async fn agent(dir: &TempDir, gateway: Arc<ScriptedGateway>) -> RelayAgent {
        let mut lookup = MockHostLookup::new();
        lookup
            .expect_egress_address()
            .returning(|_| Ok("104.28.0.1".parse().unwrap()));
        let mut probe = MockConnectivityProbe::new();
        probe.expect_probe().returning(|_| {
            Ok(ProbeOutcome {
                target: "https://1.1.1.1".to_string(),
                latency_ms: 30,
            })
        });
        RelayAgent::new(config(dir), gateway, Arc::new(lookup), Arc::new(probe))
            .await
            .unwrap()
    }

    /// Proxy client emulation plus iptables chain emulation
    fn host() -> ScriptedGateway {
        let proxy = crate::proxy::tests::client_handler();
        let iptables = crate::routing::tests::iptables_handler();
        ScriptedGateway::new(move |program, args| {
            if program == "iptables" {
                iptables(program, args)
            } else {
                proxy(program, args)
            }
        })
    }

    fn proxy_config(port: u32) -> ProxyConfig {
        ProxyConfig {
            enabled: true,
            proxy_port: port,
            client_type: ClientType::Local,
            ..ProxyConfig::default()
        }
    }

    #[tokio::test]
    async fn test_activation_runs_every_step() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(&dir, Arc::new(host())).await;
        agent.add_sni_domain("relay.example.com").await.unwrap();

        let done = agent
            .activate_outbound_proxy(proxy_config(1080), "eth1", false)
            .await
            .unwrap();
        assert_eq!(done, ACTIVATION_STEPS.to_vec());

        assert_eq!(agent.obfuscation_status().await.mode, ObfuscationMode::OutboundProxy);
        assert_eq!(agent.router().list_chains().await.unwrap().len(), 3);

        let relay: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("relay.json")).unwrap())
                .unwrap();
        assert_eq!(relay["outbounds"][0]["socks5"]["addr"], "127.0.0.1:1080");
        assert!(std::fs::read_to_string(dir.path().join("acl.txt"))
            .unwrap()
            .ends_with("proxy(all)\n"));

        let status = agent.proxy_status().await.unwrap();
        assert!(status.connected);
        assert_eq!(status.proxy_port, Some(1080));

        let undone = agent.deactivate_outbound_proxy().await.unwrap();
        assert_eq!(undone, DEACTIVATION_STEPS.to_vec());
        assert!(agent.router().list_chains().await.unwrap().is_empty());
        assert_eq!(agent.obfuscation_status().await.mode, ObfuscationMode::None);
    }

    #[tokio::test]
    async fn test_activation_reports_failed_step() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = crate::proxy::tests::client_handler();
        let gateway = ScriptedGateway::new(move |program, args| {
            if program == "iptables" && args.iter().any(|a| a == "MASQUERADE") {
                ToolOutput::failed(1, "iptables: No chain/target/match by that name.")
            } else if program == "iptables" {
                ToolOutput::ok("")
            } else {
                proxy(program, args)
            }
        });
        let agent = agent(&dir, Arc::new(gateway)).await;
        agent.add_sni_domain("relay.example.com").await.unwrap();

        match agent
            .activate_outbound_proxy(proxy_config(1080), "eth1", false)
            .await
            .unwrap_err()
        {
            RelayError::PartialApply { step, completed, .. } => {
                assert_eq!(step, "enable-masquerade");
                assert_eq!(completed, 5);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_activation_validates_before_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(ScriptedGateway::succeeding());
        let agent = agent(&dir, gateway.clone()).await;

        let err = agent
            .activate_outbound_proxy(proxy_config(70000), "eth1", false)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_conflicting_mode_stops_at_configure() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(ScriptedGateway::succeeding());
        let agent = agent(&dir, gateway.clone()).await;
        agent.add_sni_domain("relay.example.com").await.unwrap();
        agent
            .enable_mode(ModeSettings::Masquerade(MasqueradeSettings {
                url: "https://www.example.org".to_string(),
                rewrite_host: true,
            }))
            .await
            .unwrap();

        match agent
            .activate_outbound_proxy(proxy_config(1080), "eth1", false)
            .await
            .unwrap_err()
        {
            RelayError::PartialApply { step, completed, reason } => {
                assert_eq!(step, "configure");
                assert_eq!(completed, 0);
                assert!(reason.contains("masquerade"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(agent.obfuscation_status().await.mode, ObfuscationMode::Masquerade);
    }

    #[tokio::test]
    async fn test_enable_mode_restores_on_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(&dir, Arc::new(ScriptedGateway::succeeding())).await;

        // No SNI domain and no TLS pair: the descriptor cannot be generated
        let err = agent
            .enable_mode(ModeSettings::Salamander(SalamanderSettings {
                password: "long-enough-secret".to_string(),
            }))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(agent.obfuscation_status().await.mode, ObfuscationMode::None);
    }

    #[tokio::test]
    async fn test_add_sni_domain_generates_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(&dir, Arc::new(ScriptedGateway::succeeding())).await;

        let status = agent.add_sni_domain("a.example.com").await.unwrap();
        assert_eq!(status.primary.as_deref(), Some("a.example.com"));
        assert!(agent.certificates().is_valid("a.example.com").await);

        let certs = agent.certificate_status().await;
        assert_eq!(certs.len(), 1);
        assert!(certs[0].as_ref().unwrap().self_signed);

        let rendered = agent.render_descriptor().await.unwrap();
        assert!(rendered.contains("a.example.com.crt"));
    }

    #[tokio::test]
    async fn test_sni_changes_rewrite_relay_config() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(&dir, Arc::new(ScriptedGateway::succeeding())).await;
        let relay = || -> serde_json::Value {
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("relay.json")).unwrap())
                .unwrap()
        };

        agent.add_sni_domain("a.example.com").await.unwrap();
        agent.add_sni_domain("b.example.com").await.unwrap();
        assert_eq!(relay()["sni"]["domains"].as_array().unwrap().len(), 2);
        assert_eq!(relay()["sni"]["default"], "a.example.com");

        agent.set_primary_domain("b.example.com").await.unwrap();
        assert_eq!(relay()["sni"]["default"], "b.example.com");

        agent.remove_sni_domain("b.example.com").await.unwrap();
        let domains = relay()["sni"]["domains"].clone();
        assert_eq!(domains.as_array().unwrap().len(), 1);
        assert_eq!(domains[0]["domain"], "a.example.com");
        assert_eq!(relay()["sni"]["default"], "a.example.com");

        agent.set_sni_enabled(false).await.unwrap();
        assert_eq!(relay()["sni"]["enabled"], false);
    }
}
