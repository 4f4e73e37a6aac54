//! Outbound proxy D-Bus interface
//!
//! Lifecycle calls map one-to-one onto the proxy manager and router;
//! `Activate` and `Deactivate` run the composite workflows and fail with the
//! name of the step that stopped them.

use super::{from_json, to_json, PROXY_PATH};
use crate::agent::RelayAgent;
use crate::error::RelayResult;
use crate::health::HealthSample;
use crate::proxy::ProxyConfig;
use std::sync::Arc;
use tracing::info;
use zbus::object_server::SignalEmitter;
use zbus::{fdo, interface, Connection};

pub struct RelayProxy {
    agent: Arc<RelayAgent>,
}

impl RelayProxy {
    pub fn new(agent: Arc<RelayAgent>) -> Self {
        Self { agent }
    }
}

#[interface(name = "org.relayctl.Agent.Proxy")]
impl RelayProxy {
    async fn install_client(&self) -> fdo::Result<()> {
        Ok(self.agent.proxy().install_client().await?)
    }

    /// `config_json` is a camelCase proxy config, e.g. `{"enabled":true,"proxyPort":40000}`
    async fn configure(&self, config_json: &str, force: bool) -> fdo::Result<()> {
        let cfg: ProxyConfig = from_json("proxy config", config_json)?;
        Ok(self.agent.proxy().configure(cfg, force).await?)
    }

    async fn get_config(&self) -> fdo::Result<String> {
        to_json(&self.agent.proxy().config().await)
    }

    async fn connect(&self) -> fdo::Result<()> {
        Ok(self.agent.proxy().connect().await?)
    }

    async fn disconnect(&self) -> fdo::Result<()> {
        Ok(self.agent.proxy().disconnect().await?)
    }

    async fn restart(&self) -> fdo::Result<()> {
        Ok(self.agent.proxy().restart().await?)
    }

    async fn get_status(&self) -> fdo::Result<String> {
        to_json(&self.agent.proxy_status().await?)
    }

    async fn enable_proxy_mode(&self, port: u32) -> fdo::Result<u16> {
        Ok(self.agent.proxy().enable_proxy_mode(port).await?)
    }

    async fn disable_proxy_mode(&self) -> fdo::Result<()> {
        Ok(self.agent.proxy().disable_proxy_mode().await?)
    }

    /// Redirect relay traffic to the proxy port and masquerade it out of the
    /// configured egress interface
    async fn enable_routing(&self, proxy_port: u32, relay_interface: &str) -> fdo::Result<()> {
        info!("D-Bus: enabling routing via {} to port {}", relay_interface, proxy_port);
        let router = self.agent.router();
        router.setup_routing(proxy_port, relay_interface).await?;
        router
            .enable_masquerade(&self.agent.config().proxy.egress_interface)
            .await?;
        Ok(())
    }

    async fn disable_routing(&self) -> fdo::Result<()> {
        info!("D-Bus: removing routing");
        Ok(self.agent.router().cleanup_routing().await?)
    }

    async fn list_routing_chains(&self) -> fdo::Result<String> {
        to_json(&self.agent.router().list_chains().await?)
    }

    /// Completed step names, in order
    async fn activate(
        &self,
        config_json: &str,
        relay_interface: &str,
        force: bool,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<Vec<String>> {
        let cfg: ProxyConfig = from_json("proxy config", config_json)?;
        info!("D-Bus: activating outbound proxy on {}", relay_interface);
        let done = self
            .agent
            .activate_outbound_proxy(cfg, relay_interface, force)
            .await?;
        Self::activation_changed(&emitter, true).await?;
        Ok(done.into_iter().map(String::from).collect())
    }

    async fn deactivate(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<Vec<String>> {
        info!("D-Bus: deactivating outbound proxy");
        let done = self.agent.deactivate_outbound_proxy().await?;
        Self::activation_changed(&emitter, false).await?;
        Ok(done.into_iter().map(String::from).collect())
    }

    async fn run_health_check(&self) -> fdo::Result<String> {
        to_json(&self.agent.health().run_health_check().await)
    }

    async fn get_health_history(&self, limit: u32) -> fdo::Result<String> {
        to_json(&self.agent.health().history(limit as usize).await)
    }

    #[zbus(property)]
    async fn dropped_notifications(&self) -> u64 {
        self.agent.health().dropped_notifications()
    }

    #[zbus(signal)]
    async fn activation_changed(signal_emitter: &SignalEmitter<'_>, active: bool) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn health_changed(
        signal_emitter: &SignalEmitter<'_>,
        score: u8,
        connected: bool,
        issues: Vec<String>,
    ) -> zbus::Result<()>;
}

pub mod signals {
    use super::*;

    pub async fn emit_health_changed(conn: &Connection, sample: &HealthSample) -> RelayResult<()> {
        if let Ok(iface_ref) = conn
            .object_server()
            .interface::<_, RelayProxy>(PROXY_PATH)
            .await
        {
            RelayProxy::health_changed(
                iface_ref.signal_emitter(),
                sample.health_score,
                sample.connected,
                sample.issues.clone(),
            )
            .await?;
        }
        Ok(())
    }
}
