//! Obfuscation D-Bus interface

use super::{from_json, to_json};
use crate::agent::RelayAgent;
use crate::obfs::{
    MasqueradeSettings, MimicrySettings, ModeSettings, ObfuscationMode, OutboundProxySettings,
    SalamanderSettings,
};
use std::sync::Arc;
use tracing::info;
use zbus::object_server::SignalEmitter;
use zbus::{fdo, interface};

pub struct RelayObfuscation {
    agent: Arc<RelayAgent>,
}

impl RelayObfuscation {
    pub fn new(agent: Arc<RelayAgent>) -> Self {
        Self { agent }
    }

    async fn enable(&self, settings: ModeSettings, emitter: &SignalEmitter<'_>) -> fdo::Result<String> {
        info!("D-Bus: enabling obfuscation mode {}", settings.mode());
        let snapshot = self.agent.enable_mode(settings).await?;
        Self::mode_changed(emitter, &snapshot.mode.to_string()).await?;
        to_json(&snapshot)
    }
}

#[interface(name = "org.relayctl.Agent.Obfuscation")]
impl RelayObfuscation {
    async fn enable_masquerade(
        &self,
        url: &str,
        rewrite_host: bool,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<String> {
        let settings = ModeSettings::Masquerade(MasqueradeSettings {
            url: url.to_string(),
            rewrite_host,
        });
        self.enable(settings, &emitter).await
    }

    async fn enable_salamander(
        &self,
        password: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<String> {
        let settings = ModeSettings::Salamander(SalamanderSettings {
            password: password.to_string(),
        });
        self.enable(settings, &emitter).await
    }

    /// Mark relay egress as leaving through the local proxy; this does not
    /// touch the proxy client or routing (see `Proxy.Activate`)
    async fn enable_outbound_proxy(
        &self,
        proxy_port: u16,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<String> {
        let settings = ModeSettings::OutboundProxy(OutboundProxySettings { proxy_port });
        self.enable(settings, &emitter).await
    }

    async fn enable_tls_mimicry(
        &self,
        server_name: &str,
        fingerprint: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<String> {
        let settings = ModeSettings::TlsMimicry(MimicrySettings {
            server_name: server_name.to_string(),
            fingerprint: fingerprint.to_string(),
        });
        self.enable(settings, &emitter).await
    }

    /// Enable from a JSON document such as `{"mode":"salamander","password":"..."}`
    async fn enable_mode(
        &self,
        settings_json: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<String> {
        let settings: ModeSettings = from_json("mode settings", settings_json)?;
        self.enable(settings, &emitter).await
    }

    /// Returns false when `mode` was not the active one
    async fn disable_mode(
        &self,
        mode: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<bool> {
        let mode: ObfuscationMode = mode.parse()?;
        let disabled = self.agent.disable_mode(mode).await?;
        if disabled {
            Self::mode_changed(&emitter, &ObfuscationMode::None.to_string()).await?;
        }
        Ok(disabled)
    }

    async fn get_status(&self) -> fdo::Result<String> {
        to_json(&self.agent.obfuscation_status().await)
    }

    /// Relay descriptor for the current state, without writing it
    async fn get_descriptor(&self) -> fdo::Result<String> {
        Ok(self.agent.render_descriptor().await?)
    }

    /// Caller-supplied descriptor written instead of the generated one; empty clears it
    async fn set_descriptor_override(&self, descriptor_json: &str) -> fdo::Result<()> {
        let descriptor = if descriptor_json.trim().is_empty() {
            None
        } else {
            Some(from_json::<serde_json::Value>("descriptor", descriptor_json)?)
        };
        self.agent.set_descriptor_override(descriptor).await?;
        Ok(self.agent.write_relay_config().await?)
    }

    #[zbus(signal)]
    async fn mode_changed(signal_emitter: &SignalEmitter<'_>, mode: &str) -> zbus::Result<()>;
}
