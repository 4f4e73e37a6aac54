//! Outbound proxy client lifecycle
//!
//! Drives an external proxy client (warp-cli) either on the host or inside a
//! container. All interaction goes through the [`ToolGateway`]; state is
//! recovered by parsing the client's `status`, `settings` and
//! `tunnel stats` output rather than being tracked locally.

pub mod parse;

use crate::config::{ProxySettings, ToolSettings};
use crate::error::{RelayError, RelayResult};
use crate::gateway::{run_checked, ToolGateway, ToolOutput};
use crate::health::HealthSample;
use crate::lookup::HostLookup;
use crate::obfs::{ObfuscationMode, ObfuscationModeController};
use crate::validation::{validate_hostname, validate_port, validate_token};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Where the proxy client runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    #[default]
    Local,
    Containerized,
}

impl FromStr for ClientType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ClientType::Local),
            "containerized" | "container" | "docker" => Ok(ClientType::Containerized),
            other => Err(RelayError::Validation(format!(
                "Unknown client type '{}' (expected local or containerized)",
                other
            ))),
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientType::Local => f.write_str("local"),
            ClientType::Containerized => f.write_str("containerized"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProxyMode {
    /// Local SOCKS5/HTTP proxy only; host routing untouched
    #[default]
    ProxyOnly,
    /// All host traffic through the tunnel
    FullTunnel,
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyMode::ProxyOnly => f.write_str("proxyOnly"),
            ProxyMode::FullTunnel => f.write_str("fullTunnel"),
        }
    }
}

impl FromStr for ProxyMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "proxyonly" | "proxy" => Ok(ProxyMode::ProxyOnly),
            "fulltunnel" | "tunnel" | "warp" => Ok(ProxyMode::FullTunnel),
            other => Err(RelayError::Validation(format!("Unknown proxy mode '{}'", other))),
        }
    }
}

/// Requested proxy configuration.
///
/// `proxy_port` is wider than a port so out-of-range requests can be
/// represented and rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub enabled: bool,
    pub proxy_port: u32,
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default)]
    pub client_type: ClientType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default)]
    pub mode: ProxyMode,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            proxy_port: 40000,
            auto_connect: false,
            client_type: ClientType::Local,
            license_key: None,
            organization: None,
            mode: ProxyMode::ProxyOnly,
        }
    }
}

impl ProxyConfig {
    /// Check everything that can be checked without touching the host
    pub fn validate(&self) -> RelayResult<u16> {
        let port = validate_port(self.proxy_port)?;
        if let Some(key) = &self.license_key {
            validate_token("license key", key)?;
        }
        if let Some(org) = &self.organization {
            validate_hostname(org)?;
        }
        Ok(port)
    }
}

/// Client state recovered from `status` and `settings`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    pub installed: bool,
    pub connected: bool,
    pub mode: Option<ProxyMode>,
    pub proxy_port: Option<u16>,
}

/// Full status report, recomputed on every call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub installed: bool,
    pub connected: bool,
    pub mode: Option<ProxyMode>,
    pub proxy_port: Option<u16>,
    pub ip_address: Option<IpAddr>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub health: Option<HealthSample>,
}

pub struct ProxyLifecycleManager {
    tools: ToolSettings,
    settings: ProxySettings,
    gateway: Arc<dyn ToolGateway>,
    lookup: Arc<dyn HostLookup>,
    obfuscation: Arc<RwLock<ObfuscationModeController>>,
    config: RwLock<ProxyConfig>,
}

impl ProxyLifecycleManager {
    pub fn new(
        tools: ToolSettings,
        settings: ProxySettings,
        gateway: Arc<dyn ToolGateway>,
        lookup: Arc<dyn HostLookup>,
        obfuscation: Arc<RwLock<ObfuscationModeController>>,
    ) -> Self {
        Self {
            tools,
            settings,
            gateway,
            lookup,
            obfuscation,
            config: RwLock::new(ProxyConfig::default()),
        }
    }

    pub async fn config(&self) -> ProxyConfig {
        self.config.read().await.clone()
    }

    /// Whether the client binary (or its container) is present
    pub async fn is_installed(&self) -> bool {
        match self.config.read().await.client_type {
            ClientType::Local => self.gateway.is_available(&self.tools.proxy_binary).await,
            ClientType::Containerized => self.container_running().await,
        }
    }

    async fn container_running(&self) -> bool {
        let args = [
            "inspect",
            "-f",
            "{{.State.Running}}",
            self.tools.container_name.as_str(),
        ];
        match self.gateway.run(&self.tools.container_runtime, &args).await {
            Ok(out) => out.success() && out.stdout.trim() == "true",
            Err(_) => false,
        }
    }

    /// Install the client if it is not already present
    pub async fn install_client(&self) -> RelayResult<()> {
        if self.is_installed().await {
            debug!("Proxy client already installed");
            return Ok(());
        }

        let client_type = self.config.read().await.client_type;
        match client_type {
            ClientType::Local => {
                let (program, args) = self.tools.install_command.split_first().ok_or_else(|| {
                    RelayError::Config("No install command configured for the proxy client".to_string())
                })?;
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                info!("Installing proxy client with {}", program);
                run_checked(self.gateway.as_ref(), program, &args).await?;

                if !self.gateway.is_available(&self.tools.proxy_binary).await {
                    return Err(RelayError::ExternalTool {
                        tool: self.tools.proxy_binary.clone(),
                        code: None,
                        output: "not found after installation".to_string(),
                    });
                }
            }
            ClientType::Containerized => {
                let runtime = self.tools.container_runtime.as_str();
                info!("Starting proxy client container {}", self.tools.container_name);
                run_checked(self.gateway.as_ref(), runtime, &["pull", self.tools.container_image.as_str()])
                    .await?;
                // A stopped container with the same name blocks `run`
                let _ = self
                    .gateway
                    .run(runtime, &["rm", "-f", self.tools.container_name.as_str()])
                    .await;
                run_checked(
                    self.gateway.as_ref(),
                    runtime,
                    &[
                        "run",
                        "-d",
                        "--name",
                        self.tools.container_name.as_str(),
                        "--restart",
                        "unless-stopped",
                        "--cap-add",
                        "NET_ADMIN",
                        "--network",
                        "host",
                        self.tools.container_image.as_str(),
                    ],
                )
                .await?;
            }
        }

        info!("Proxy client installed ({})", client_type);
        Ok(())
    }

    /// Validate and apply a configuration.
    ///
    /// Fails with a conflict if another obfuscation mode is active, unless
    /// `force` is set. Salamander obfuscation never blocks; the outbound
    /// proxy replaces it when activated.
    pub async fn configure(&self, cfg: ProxyConfig, force: bool) -> RelayResult<()> {
        cfg.validate()?;

        if let Some(active) = self
            .obfuscation
            .read()
            .await
            .blocking_mode(ObfuscationMode::OutboundProxy)
        {
            if !force {
                return Err(RelayError::Conflict(format!(
                    "obfuscation mode {} is active; disable it or pass force to configure the outbound proxy",
                    active
                )));
            }
            warn!("Configuring outbound proxy over active mode {} (forced)", active);
        }

        *self.config.write().await = cfg.clone();

        if !cfg.enabled {
            info!("Outbound proxy configured as disabled");
            return Ok(());
        }

        if !self.is_installed().await {
            return Err(RelayError::NotFound(format!(
                "proxy client ({}) is not installed",
                cfg.client_type
            )));
        }

        self.register(&cfg).await?;

        if cfg.auto_connect {
            self.connect().await?;
        }

        info!(
            "Outbound proxy configured: port={} client={} mode={}",
            cfg.proxy_port, cfg.client_type, cfg.mode
        );
        Ok(())
    }

    async fn register(&self, cfg: &ProxyConfig) -> RelayResult<()> {
        if let Some(org) = &cfg.organization {
            self.client_checked(&["teams-enroll", org.as_str()]).await?;
            return Ok(());
        }

        let registered = self
            .client(&["registration", "show"])
            .await
            .map(|out| out.success())
            .unwrap_or(false);
        if !registered {
            self.client_checked(&["registration", "new"]).await?;
        }

        if let Some(key) = &cfg.license_key {
            self.client_checked(&["registration", "license", key.as_str()]).await?;
        }
        Ok(())
    }

    pub async fn connect(&self) -> RelayResult<()> {
        self.client_checked(&["connect"]).await?;
        info!("Proxy client connected");
        Ok(())
    }

    pub async fn disconnect(&self) -> RelayResult<()> {
        self.client_checked(&["disconnect"]).await?;
        info!("Proxy client disconnected");
        Ok(())
    }

    /// Disconnect, wait the configured grace period, connect
    pub async fn restart(&self) -> RelayResult<()> {
        self.disconnect().await?;
        tokio::time::sleep(Duration::from_millis(self.settings.restart_grace_ms)).await;
        self.connect().await
    }

    /// Switch the client to local-proxy mode on `port`
    pub async fn enable_proxy_mode(&self, port: u32) -> RelayResult<u16> {
        let port = validate_port(port)?;
        let port_arg = port.to_string();

        self.client_checked(&["mode", "proxy"]).await?;
        self.client_checked(&["proxy", "port", port_arg.as_str()]).await?;

        let mut config = self.config.write().await;
        config.proxy_port = port as u32;
        config.mode = ProxyMode::ProxyOnly;
        info!("Proxy mode enabled on port {}", port);
        Ok(port)
    }

    /// Switch the client back to full-tunnel mode
    pub async fn disable_proxy_mode(&self) -> RelayResult<()> {
        self.client_checked(&["mode", "warp"]).await?;
        self.config.write().await.mode = ProxyMode::FullTunnel;
        info!("Proxy mode disabled");
        Ok(())
    }

    /// Query the client for {installed, connected, mode, proxy_port}
    pub async fn get_status(&self) -> RelayResult<ClientStatus> {
        if !self.is_installed().await {
            return Ok(ClientStatus::default());
        }

        let status = self.client_checked(&["status"]).await?;
        let connected = parse::parse_connected(&status.stdout).unwrap_or(false);

        let (mode, proxy_port) = match self.client(&["settings"]).await {
            Ok(out) if out.success() => parse::parse_mode(&out.stdout),
            Ok(out) => {
                debug!("settings query failed: {}", out.combined());
                (None, None)
            }
            Err(e) => {
                debug!("settings query failed: {}", e);
                (None, None)
            }
        };

        Ok(ClientStatus {
            installed: true,
            connected,
            mode,
            proxy_port,
        })
    }

    pub async fn is_connected(&self) -> bool {
        self.get_status().await.map(|s| s.connected).unwrap_or(false)
    }

    /// [`get_status`](Self::get_status) plus byte counters and egress address.
    ///
    /// Counters and address are best-effort and left at zero/`None` when the
    /// client cannot report them.
    pub async fn status(&self) -> RelayResult<ProxyStatus> {
        let client = self.get_status().await?;
        let mut status = ProxyStatus {
            installed: client.installed,
            connected: client.connected,
            mode: client.mode,
            proxy_port: client.proxy_port,
            ..ProxyStatus::default()
        };

        if !client.connected {
            return Ok(status);
        }

        match self.client(&["tunnel", "stats"]).await {
            Ok(out) if out.success() => {
                let (sent, received) = parse::parse_tunnel_bytes(&out.stdout);
                status.bytes_sent = sent;
                status.bytes_received = received;
            }
            Ok(out) => debug!("tunnel stats unavailable: {}", out.combined()),
            Err(e) => debug!("tunnel stats unavailable: {}", e),
        }

        if let (Some(ProxyMode::ProxyOnly), Some(port)) = (client.mode, client.proxy_port) {
            match self.lookup.egress_address(port).await {
                Ok(addr) => status.ip_address = Some(addr),
                Err(e) => debug!("Egress address lookup failed: {}", e),
            }
        }

        Ok(status)
    }

    /// Run a proxy client subcommand, wrapped for the configured client type
    async fn client(&self, args: &[&str]) -> RelayResult<ToolOutput> {
        let client_type = self.config.read().await.client_type;
        let (program, full) = self.client_command(client_type, args);
        self.gateway.run(program, &full).await
    }

    async fn client_checked(&self, args: &[&str]) -> RelayResult<ToolOutput> {
        let client_type = self.config.read().await.client_type;
        let (program, full) = self.client_command(client_type, args);
        run_checked(self.gateway.as_ref(), program, &full).await
    }

    fn client_command<'a>(&'a self, client_type: ClientType, args: &[&'a str]) -> (&'a str, Vec<&'a str>) {
        let mut full = Vec::with_capacity(args.len() + 4);
        let program = match client_type {
            ClientType::Local => self.tools.proxy_binary.as_str(),
            ClientType::Containerized => {
                full.push("exec");
                full.push(self.tools.container_name.as_str());
                full.push(self.tools.proxy_binary.as_str());
                self.tools.container_runtime.as_str()
            }
        };
        full.push("--accept-tos");
        full.extend_from_slice(args);
        (program, full)
    }
}
