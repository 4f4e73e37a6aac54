//! relayctl - Relay Node Control Library
//!
//! Async control plane for a VPN relay node:
//! - TLS certificate storage, ACME issuance and renewal
//! - SNI domain registry
//! - Obfuscation mode selection
//! - Outbound proxy client lifecycle
//! - Proxy health monitoring
//! - Egress routing (iptables) and ACL generation
//! - Relay server descriptor generation
//!
//! Exposed over D-Bus as `org.relayctl.Agent`.

pub mod error;
pub mod config;
pub mod validation;
pub mod fsutil;
pub mod gateway;
pub mod lookup;
pub mod certs;
pub mod sni;
pub mod obfs;
pub mod descriptor;
pub mod proxy;
pub mod health;
pub mod routing;
pub mod agent;
pub mod dbus;

// Re-export commonly used types
pub use error::{RelayError, RelayResult};
pub use config::AgentConfig;
pub use gateway::{ScriptedGateway, SystemGateway, ToolGateway, ToolOutput};
pub use certs::{CertificateStore, ChallengeType, DomainCertificate, IssuanceOutcome, RenewalReport};
pub use sni::{SniDomainRegistry, SniStatus};
pub use obfs::{ModeSettings, ObfuscationMode, ObfuscationModeController, ObfuscationSnapshot};
pub use descriptor::{ConfigGenerator, DescriptorInputs, RelayDescriptor};
pub use proxy::{ClientType, ProxyConfig, ProxyLifecycleManager, ProxyMode, ProxyStatus};
pub use health::{HealthMonitor, HealthReport, HealthSample};
pub use routing::{RoutingStep, TrafficRouter};
pub use agent::{RelayAgent, ACTIVATION_STEPS, DEACTIVATION_STEPS};
pub use dbus::{RelayDbusService, RELAY_DBUS_SERVICE};
