//! relayctl D-Bus interface
//!
//! Remote control surface for the relay agent. Structured results are
//! returned as JSON strings so callers do not need to mirror the agent's
//! types as D-Bus signatures.
//!
//! # D-Bus Service
//!
//! - **Service Name**: `org.relayctl.Agent`
//!
//! # Interfaces
//!
//! ## Certificates
//! - **Interface Name**: `org.relayctl.Agent.Certificates`
//! - **Object Path**: `/org/relayctl/Agent/Certificates`
//! - **Purpose**: TLS material and SNI domain registry
//!
//! ## Obfuscation
//! - **Interface Name**: `org.relayctl.Agent.Obfuscation`
//! - **Object Path**: `/org/relayctl/Agent/Obfuscation`
//! - **Purpose**: Obfuscation mode selection and descriptor rendering
//!
//! ## Proxy
//! - **Interface Name**: `org.relayctl.Agent.Proxy`
//! - **Object Path**: `/org/relayctl/Agent/Proxy`
//! - **Purpose**: Outbound proxy lifecycle, egress routing and health
//!
//! ```bash
//! dbus-send --system --print-reply \
//!   --dest=org.relayctl.Agent \
//!   /org/relayctl/Agent/Certificates \
//!   org.relayctl.Agent.Certificates.GetSniStatus
//! ```

pub mod certificates;
pub mod obfuscation;
pub mod proxy;

pub use certificates::RelayCertificates;
pub use obfuscation::RelayObfuscation;
pub use proxy::RelayProxy;

use crate::agent::RelayAgent;
use crate::error::RelayResult;
use crate::health::HealthSample;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use zbus::{fdo, Connection};

pub const RELAY_DBUS_SERVICE: &str = "org.relayctl.Agent";
pub const CERTIFICATES_PATH: &str = "/org/relayctl/Agent/Certificates";
pub const OBFUSCATION_PATH: &str = "/org/relayctl/Agent/Obfuscation";
pub const PROXY_PATH: &str = "/org/relayctl/Agent/Proxy";

pub(crate) fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("Failed to encode result: {}", e)))
}

pub(crate) fn from_json<T: DeserializeOwned>(what: &str, json: &str) -> fdo::Result<T> {
    serde_json::from_str(json).map_err(|e| fdo::Error::InvalidArgs(format!("Invalid {}: {}", what, e)))
}

/// Registered D-Bus objects for one agent
pub struct RelayDbusService {
    connection: Connection,
}

impl RelayDbusService {
    /// Register the three interfaces on the system bus and claim the
    /// well-known name
    pub async fn start(agent: Arc<RelayAgent>) -> RelayResult<Self> {
        let connection = Connection::system().await?;
        Self::serve(connection, agent).await
    }

    /// Register on an existing connection (session bus, tests)
    pub async fn serve(connection: Connection, agent: Arc<RelayAgent>) -> RelayResult<Self> {
        let object_server = connection.object_server();

        object_server
            .at(CERTIFICATES_PATH, RelayCertificates::new(agent.clone()))
            .await?;
        info!("Registered Certificates interface at {}", CERTIFICATES_PATH);

        object_server
            .at(OBFUSCATION_PATH, RelayObfuscation::new(agent.clone()))
            .await?;
        info!("Registered Obfuscation interface at {}", OBFUSCATION_PATH);

        object_server.at(PROXY_PATH, RelayProxy::new(agent)).await?;
        info!("Registered Proxy interface at {}", PROXY_PATH);

        info!("Requesting D-Bus name: {}", RELAY_DBUS_SERVICE);
        if let Err(e) = connection.request_name(RELAY_DBUS_SERVICE).await {
            error!("Failed to request D-Bus name '{}': {}", RELAY_DBUS_SERVICE, e);
            return Err(e.into());
        }

        Ok(Self { connection })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Re-emit every health sample as a `HealthChanged` signal
    pub async fn forward_health(&self, agent: &RelayAgent) {
        let connection = self.connection.clone();
        agent
            .health()
            .subscribe(Arc::new(move |sample: &HealthSample| {
                let connection = connection.clone();
                let sample = sample.clone();
                tokio::spawn(async move {
                    if let Err(e) = proxy::signals::emit_health_changed(&connection, &sample).await {
                        warn!("Failed to emit HealthChanged signal: {}", e);
                    }
                });
            }))
            .await;
        debug!("Health samples forwarded to D-Bus");
    }

    pub async fn stop(&self) -> RelayResult<()> {
        self.connection.release_name(RELAY_DBUS_SERVICE).await?;
        info!("Released D-Bus name {}", RELAY_DBUS_SERVICE);
        Ok(())
    }
}
