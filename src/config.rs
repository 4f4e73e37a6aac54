//! Configuration management for relayctl
//!
//! The agent configuration is a TOML file split into one section per
//! component. Each component receives only its own section at construction.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::error::{RelayError, RelayResult};

/// Main relayctl configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// File system layout
    #[serde(default)]
    pub paths: ConfigPaths,
    /// Relay listener defaults
    #[serde(default)]
    pub relay: RelaySettings,
    /// External tool locations
    #[serde(default)]
    pub tools: ToolSettings,
    /// Certificate issuance settings
    #[serde(default)]
    pub issuance: IssuanceSettings,
    /// Outbound proxy settings
    #[serde(default)]
    pub proxy: ProxySettings,
    /// Health monitor settings
    #[serde(default)]
    pub health: HealthSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Per-domain certificate and key files
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
    /// Persistent agent state (SNI registry)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Access-control list consumed by the relay
    #[serde(default = "default_acl_path")]
    pub acl_path: PathBuf,
    /// Generated relay configuration descriptor
    #[serde(default = "default_relay_config_path")]
    pub relay_config_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Empty means a minted password kept under the state directory
    #[serde(default)]
    pub auth_password: String,
    #[serde(default = "default_bandwidth")]
    pub bandwidth_up: String,
    #[serde(default = "default_bandwidth")]
    pub bandwidth_down: String,
    /// Fallback TLS pair when SNI is disabled
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    #[serde(default)]
    pub hopping: Option<HoppingSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoppingSettings {
    pub interval_secs: u64,
    pub start_port: u16,
    pub end_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_acme_binary")]
    pub acme_binary: String,
    #[serde(default = "default_proxy_binary")]
    pub proxy_binary: String,
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    #[serde(default = "default_container_name")]
    pub container_name: String,
    #[serde(default = "default_container_image")]
    pub container_image: String,
    #[serde(default = "default_iptables_binary")]
    pub iptables_binary: String,
    #[serde(default = "default_sysctl_binary")]
    pub sysctl_binary: String,
    /// Command used to install the local proxy client
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuanceSettings {
    /// Ordered IP-echo endpoints, first success wins
    #[serde(default = "default_ip_echo_endpoints")]
    pub ip_echo_endpoints: Vec<String>,
    #[serde(default = "default_renew_within_days")]
    pub renew_within_days: i64,
    #[serde(default = "default_self_signed_validity_days")]
    pub self_signed_validity_days: u32,
    /// DNS provider hook name for dns-01 challenges
    #[serde(default = "default_dns_provider")]
    pub dns_provider: String,
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_restart_grace_ms")]
    pub restart_grace_ms: u64,
    #[serde(default = "default_egress_interface")]
    pub egress_interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Ordered reachability targets, first success wins
    #[serde(default = "default_probe_targets")]
    pub probe_targets: Vec<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_dns_check_host")]
    pub dns_check_host: String,
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("/etc/relayctl/certs")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/relayctl")
}

fn default_acl_path() -> PathBuf {
    PathBuf::from("/etc/relayctl/acl.txt")
}

fn default_relay_config_path() -> PathBuf {
    PathBuf::from("/etc/relayctl/relay.json")
}

fn default_listen() -> String {
    ":443".to_string()
}

fn default_bandwidth() -> String {
    "1 gbps".to_string()
}

fn default_acme_binary() -> String {
    "acme.sh".to_string()
}

fn default_proxy_binary() -> String {
    "warp-cli".to_string()
}

fn default_container_runtime() -> String {
    "docker".to_string()
}

fn default_container_name() -> String {
    "relay-proxy".to_string()
}

fn default_container_image() -> String {
    "caomingjun/warp:latest".to_string()
}

fn default_iptables_binary() -> String {
    "iptables".to_string()
}

fn default_sysctl_binary() -> String {
    "sysctl".to_string()
}

fn default_install_command() -> Vec<String> {
    ["apt-get", "install", "-y", "cloudflare-warp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_ip_echo_endpoints() -> Vec<String> {
    vec![
        "https://api.ipify.org".to_string(),
        "https://ifconfig.me/ip".to_string(),
        "https://icanhazip.com".to_string(),
    ]
}

fn default_renew_within_days() -> i64 {
    30
}

fn default_self_signed_validity_days() -> u32 {
    365
}

fn default_dns_provider() -> String {
    "dns_cf".to_string()
}

fn default_lookup_timeout_ms() -> u64 {
    5000
}

fn default_restart_grace_ms() -> u64 {
    2000
}

fn default_egress_interface() -> String {
    "eth0".to_string()
}

fn default_health_interval() -> u64 {
    30
}

fn default_history_capacity() -> usize {
    1000
}

fn default_workers() -> usize {
    4
}

fn default_queue_size() -> usize {
    64
}

fn default_probe_targets() -> Vec<String> {
    vec![
        "https://www.cloudflare.com/cdn-cgi/trace".to_string(),
        "https://www.google.com/generate_204".to_string(),
        "https://1.1.1.1".to_string(),
    ]
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_dns_check_host() -> String {
    "cloudflare.com".to_string()
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            cert_dir: default_cert_dir(),
            state_dir: default_state_dir(),
            acl_path: default_acl_path(),
            relay_config_path: default_relay_config_path(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            auth_password: String::new(),
            bandwidth_up: default_bandwidth(),
            bandwidth_down: default_bandwidth(),
            tls_cert: None,
            tls_key: None,
            hopping: None,
        }
    }
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            acme_binary: default_acme_binary(),
            proxy_binary: default_proxy_binary(),
            container_runtime: default_container_runtime(),
            container_name: default_container_name(),
            container_image: default_container_image(),
            iptables_binary: default_iptables_binary(),
            sysctl_binary: default_sysctl_binary(),
            install_command: default_install_command(),
        }
    }
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        Self {
            ip_echo_endpoints: default_ip_echo_endpoints(),
            renew_within_days: default_renew_within_days(),
            self_signed_validity_days: default_self_signed_validity_days(),
            dns_provider: default_dns_provider(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            restart_grace_ms: default_restart_grace_ms(),
            egress_interface: default_egress_interface(),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            history_capacity: default_history_capacity(),
            workers: default_workers(),
            queue_size: default_queue_size(),
            probe_targets: default_probe_targets(),
            probe_timeout_ms: default_probe_timeout_ms(),
            dns_check_host: default_dns_check_host(),
        }
    }
}

/// Where the binaries look for their configuration unless told otherwise
pub const DEFAULT_CONFIG_PATH: &str = "/etc/relayctl/relayctl.toml";

impl AgentConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> RelayResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RelayError::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from file, or fall back to defaults if it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> RelayResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> RelayResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| RelayError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| RelayError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Ensure all directories exist
    pub fn ensure_directories(&self) -> RelayResult<()> {
        let mut dirs = vec![self.paths.cert_dir.clone(), self.paths.state_dir.clone()];
        for file in [&self.paths.acl_path, &self.paths.relay_config_path] {
            if let Some(parent) = file.parent() {
                dirs.push(parent.to_path_buf());
            }
        }

        for dir in dirs {
            std::fs::create_dir_all(&dir)
                .map_err(|e| RelayError::Config(format!("Failed to create directory {:?}: {}", dir, e)))?;
        }
        Ok(())
    }

    /// Path of the persisted SNI registry
    pub fn sni_state_path(&self) -> PathBuf {
        self.paths.state_dir.join("sni.json")
    }

    /// Path of the minted relay auth password
    pub fn auth_secret_path(&self) -> PathBuf {
        self.paths.state_dir.join("auth_secret")
    }
}
