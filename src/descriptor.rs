//! Relay configuration descriptor generation
//!
//! Composes the relay process's JSON configuration from the relay settings,
//! the active obfuscation mode, the SNI registry and the ACL location. The
//! output is checked for the single-mode invariant before every emission.

use crate::config::{HoppingSettings, RelaySettings};
use crate::error::{RelayError, RelayResult};
use crate::fsutil;
use crate::obfs::{self, ModeSettings, ObfuscationSnapshot};
use crate::sni::SniStatus;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Minimum port-hopping interval, seconds
pub const MIN_HOP_INTERVAL_SECS: u64 = 5;

const MINTED_SECRET_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    pub listen: String,
    pub tls: TlsBlock,
    pub auth: AuthBlock,
    pub bandwidth: BandwidthBlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obfs: Option<ObfsBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masquerade: Option<MasqueradeBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbounds: Option<Vec<OutboundBlock>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimicry: Option<MimicryBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acl: Option<AclBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<SniBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hopping: Option<HoppingBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsBlock {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthBlock {
    pub up: String,
    pub down: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObfsBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub salamander: SalamanderBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalamanderBlock {
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasqueradeBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub proxy: MasqueradeProxy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasqueradeProxy {
    pub url: String,
    pub rewrite_host: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundBlock {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub socks5: Socks5Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Socks5Block {
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MimicryBlock {
    pub server_name: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclBlock {
    pub file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SniBlock {
    pub enabled: bool,
    pub domains: Vec<SniEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SniEntry {
    pub domain: String,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoppingBlock {
    pub interval: String,
    pub start: u16,
    pub end: u16,
}

/// Everything the descriptor is derived from besides the relay settings
#[derive(Debug, Clone, Copy)]
pub struct DescriptorInputs<'a> {
    pub obfuscation: &'a ObfuscationSnapshot,
    pub sni: &'a SniStatus,
    pub acl_file: Option<&'a Path>,
}

pub struct ConfigGenerator {
    relay: RelaySettings,
    cert_dir: PathBuf,
    override_descriptor: Option<Value>,
}

impl ConfigGenerator {
    /// An empty auth password in `relay` is replaced by a freshly minted one
    pub fn new(mut relay: RelaySettings, cert_dir: PathBuf) -> Self {
        if relay.auth_password.is_empty() {
            relay.auth_password = mint_secret();
            info!("Minted relay auth password");
        }
        Self {
            relay,
            cert_dir,
            override_descriptor: None,
        }
    }

    pub fn relay_settings(&self) -> &RelaySettings {
        &self.relay
    }

    /// Replace generation with a caller-supplied descriptor, or clear it
    pub fn set_override(&mut self, descriptor: Option<Value>) -> RelayResult<()> {
        if let Some(value) = &descriptor {
            check_structure(value)?;
        }
        self.override_descriptor = descriptor;
        Ok(())
    }

    pub fn set_hopping(&mut self, hopping: Option<HoppingSettings>) -> RelayResult<()> {
        if let Some(h) = &hopping {
            hopping_block(h)?;
        }
        self.relay.hopping = hopping;
        Ok(())
    }

    /// Build the typed descriptor. Ignores any override.
    pub fn build(&self, inputs: DescriptorInputs<'_>) -> RelayResult<RelayDescriptor> {
        let mut descriptor = RelayDescriptor {
            listen: self.relay.listen.clone(),
            tls: self.tls_block(inputs.sni)?,
            auth: AuthBlock {
                kind: "password".to_string(),
                password: self.relay.auth_password.clone(),
            },
            bandwidth: BandwidthBlock {
                up: self.relay.bandwidth_up.clone(),
                down: self.relay.bandwidth_down.clone(),
            },
            obfs: None,
            masquerade: None,
            outbounds: None,
            mimicry: None,
            acl: inputs.acl_file.map(|file| AclBlock {
                file: file.to_path_buf(),
            }),
            sni: self.sni_block(inputs.sni),
            hopping: self.relay.hopping.as_ref().map(hopping_block).transpose()?,
        };

        match &inputs.obfuscation.settings {
            None => {}
            Some(ModeSettings::Salamander(s)) => {
                descriptor.obfs = Some(ObfsBlock {
                    kind: "salamander".to_string(),
                    salamander: SalamanderBlock {
                        password: s.password.clone(),
                    },
                });
            }
            Some(ModeSettings::Masquerade(m)) => {
                descriptor.masquerade = Some(MasqueradeBlock {
                    kind: "proxy".to_string(),
                    proxy: MasqueradeProxy {
                        url: m.url.clone(),
                        rewrite_host: m.rewrite_host,
                    },
                });
            }
            Some(ModeSettings::OutboundProxy(p)) => {
                descriptor.outbounds = Some(vec![OutboundBlock {
                    name: "proxy".to_string(),
                    kind: "socks5".to_string(),
                    socks5: Socks5Block {
                        addr: format!("127.0.0.1:{}", p.proxy_port),
                    },
                }]);
            }
            Some(ModeSettings::TlsMimicry(m)) => {
                descriptor.mimicry = Some(MimicryBlock {
                    server_name: m.server_name.clone(),
                    fingerprint: m.fingerprint.clone(),
                });
            }
        }

        Ok(descriptor)
    }

    /// The descriptor as JSON: the override if one is set, otherwise generated
    pub fn render(&self, inputs: DescriptorInputs<'_>) -> RelayResult<Value> {
        let value = match &self.override_descriptor {
            Some(value) => {
                debug!("Using override descriptor");
                value.clone()
            }
            None => serde_json::to_value(self.build(inputs)?)?,
        };
        obfs::validate_descriptor(&value)?;
        Ok(value)
    }

    pub fn render_string(&self, inputs: DescriptorInputs<'_>) -> RelayResult<String> {
        Ok(serde_json::to_string_pretty(&self.render(inputs)?)?)
    }

    /// Render and write atomically with mode 0600
    pub async fn write(&self, path: &Path, inputs: DescriptorInputs<'_>) -> RelayResult<()> {
        let mut content = self.render_string(inputs)?;
        content.push('\n');
        fsutil::write_atomic(path, content.as_bytes(), 0o600).await?;
        info!("Wrote relay configuration to {:?}", path);
        Ok(())
    }

    fn tls_block(&self, sni: &SniStatus) -> RelayResult<TlsBlock> {
        if let (Some(cert), Some(key)) = (&self.relay.tls_cert, &self.relay.tls_key) {
            return Ok(TlsBlock {
                cert: cert.clone(),
                key: key.clone(),
            });
        }

        let primary = sni.primary.as_deref().ok_or_else(|| {
            RelayError::Validation(
                "No TLS certificate configured and no primary SNI domain to default to".to_string(),
            )
        })?;
        Ok(TlsBlock {
            cert: self.cert_dir.join(format!("{}.crt", primary)),
            key: self.cert_dir.join(format!("{}.key", primary)),
        })
    }

    fn sni_block(&self, sni: &SniStatus) -> Option<SniBlock> {
        if sni.domains.is_empty() {
            return None;
        }
        Some(SniBlock {
            enabled: sni.enabled,
            domains: sni
                .domains
                .iter()
                .map(|d| SniEntry {
                    domain: d.clone(),
                    cert: self.cert_dir.join(format!("{}.crt", d)),
                    key: self.cert_dir.join(format!("{}.key", d)),
                })
                .collect(),
            default: sni.primary.clone(),
        })
    }
}

fn hopping_block(hopping: &HoppingSettings) -> RelayResult<HoppingBlock> {
    if hopping.interval_secs < MIN_HOP_INTERVAL_SECS {
        return Err(RelayError::Validation(format!(
            "Port hopping interval must be at least {}s",
            MIN_HOP_INTERVAL_SECS
        )));
    }
    if hopping.start_port == 0 || hopping.start_port >= hopping.end_port {
        return Err(RelayError::Validation(format!(
            "Invalid port hopping range {}-{}",
            hopping.start_port, hopping.end_port
        )));
    }
    Ok(HoppingBlock {
        interval: format!("{}s", hopping.interval_secs),
        start: hopping.start_port,
        end: hopping.end_port,
    })
}

/// Minimal shape every descriptor must have before it is accepted
fn check_structure(value: &Value) -> RelayResult<()> {
    let object = value
        .as_object()
        .ok_or_else(|| RelayError::Validation("Descriptor must be a JSON object".to_string()))?;

    match object.get("listen") {
        Some(Value::String(s)) if !s.is_empty() => {}
        _ => {
            return Err(RelayError::Validation(
                "Descriptor is missing a 'listen' address".to_string(),
            ))
        }
    }

    for key in ["tls", "auth"] {
        if !object.get(key).map(Value::is_object).unwrap_or(false) {
            return Err(RelayError::Validation(format!(
                "Descriptor is missing the '{}' block",
                key
            )));
        }
    }

    obfs::validate_descriptor(value)?;
    Ok(())
}

/// Random alphanumeric credential
pub fn mint_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(MINTED_SECRET_LEN)
        .map(char::from)
        .collect()
}

/// The secret stored at `path`, minting and storing one (mode 0600) on
/// first use so the relay password survives restarts.
pub async fn load_or_mint_secret(path: &Path) -> RelayResult<String> {
    if let Some(bytes) = fsutil::read_optional(path).await? {
        let secret = String::from_utf8_lossy(&bytes).trim().to_string();
        if !secret.is_empty() {
            debug!("Loaded relay auth password from {:?}", path);
            return Ok(secret);
        }
    }

    let secret = mint_secret();
    fsutil::write_atomic(path, secret.as_bytes(), 0o600).await?;
    info!("Minted relay auth password, stored in {:?}", path);
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfs::{
        ObfuscationMode, ObfuscationModeController, OutboundProxySettings, SalamanderSettings,
    };
    use serde_json::json;

    fn settings() -> RelaySettings {
        RelaySettings {
            auth_password: "relay-pass".to_string(),
            ..RelaySettings::default()
        }
    }

    fn sni() -> SniStatus {
        SniStatus {
            enabled: true,
            primary: Some("a.example.com".to_string()),
            domains: vec!["a.example.com".to_string(), "b.example.com".to_string()],
        }
    }

    #[test]
    fn test_generation_is_deterministic_and_defaults_tls_to_primary() {
        let generator = ConfigGenerator::new(settings(), PathBuf::from("/etc/relayctl/certs"));
        let snapshot = ObfuscationSnapshot::default();
        let sni = sni();
        let inputs = DescriptorInputs {
            obfuscation: &snapshot,
            sni: &sni,
            acl_file: Some(Path::new("/etc/relayctl/acl.txt")),
        };

        let first = generator.render_string(inputs).unwrap();
        assert_eq!(first, generator.render_string(inputs).unwrap());

        let value = generator.render(inputs).unwrap();
        assert_eq!(value["tls"]["cert"], "/etc/relayctl/certs/a.example.com.crt");
        assert_eq!(value["auth"], json!({"type": "password", "password": "relay-pass"}));
        assert_eq!(value["sni"]["default"], "a.example.com");
        assert_eq!(value["sni"]["domains"][1]["key"], "/etc/relayctl/certs/b.example.com.key");
        assert_eq!(value["acl"]["file"], "/etc/relayctl/acl.txt");
        assert!(value.get("obfs").is_none());
        assert!(value.get("hopping").is_none());
    }

    #[test]
    fn test_only_active_mode_block_emitted() {
        let generator = ConfigGenerator::new(settings(), PathBuf::from("/certs"));
        let mut controller = ObfuscationModeController::new();
        controller
            .activate(ModeSettings::Salamander(SalamanderSettings {
                password: "obfs-password".to_string(),
            }))
            .unwrap();
        controller
            .activate(ModeSettings::OutboundProxy(OutboundProxySettings { proxy_port: 40000 }))
            .unwrap();

        let snapshot = controller.snapshot();
        let sni = sni();
        let value = generator
            .render(DescriptorInputs {
                obfuscation: &snapshot,
                sni: &sni,
                acl_file: None,
            })
            .unwrap();

        assert!(value.get("obfs").is_none());
        assert_eq!(value["outbounds"][0]["socks5"]["addr"], "127.0.0.1:40000");
        assert_eq!(obfs::validate_descriptor(&value).unwrap(), ObfuscationMode::OutboundProxy);
    }

    #[test]
    fn test_hopping_is_independent_and_validated() {
        let mut generator = ConfigGenerator::new(settings(), PathBuf::from("/certs"));
        assert!(generator
            .set_hopping(Some(HoppingSettings {
                interval_secs: 2,
                start_port: 20000,
                end_port: 30000,
            }))
            .unwrap_err()
            .is_validation());
        assert!(generator
            .set_hopping(Some(HoppingSettings {
                interval_secs: 30,
                start_port: 30000,
                end_port: 20000,
            }))
            .is_err());

        generator
            .set_hopping(Some(HoppingSettings {
                interval_secs: 30,
                start_port: 20000,
                end_port: 30000,
            }))
            .unwrap();

        let snapshot = ObfuscationSnapshot::default();
        let sni = sni();
        let value = generator
            .render(DescriptorInputs {
                obfuscation: &snapshot,
                sni: &sni,
                acl_file: None,
            })
            .unwrap();
        assert_eq!(value["hopping"], json!({"interval": "30s", "start": 20000, "end": 30000}));
    }

    #[test]
    fn test_override_structural_check() {
        let mut generator = ConfigGenerator::new(settings(), PathBuf::from("/certs"));

        assert!(generator.set_override(Some(json!(["not", "an", "object"]))).is_err());
        assert!(generator.set_override(Some(json!({"listen": ":443"}))).is_err());

        let conflicting = json!({
            "listen": ":443", "tls": {}, "auth": {},
            "masquerade": {}, "mimicry": {},
        });
        assert!(matches!(
            generator.set_override(Some(conflicting)),
            Err(RelayError::Conflict(_))
        ));

        let custom = json!({"listen": ":8443", "tls": {"cert": "/x", "key": "/y"}, "auth": {"type": "password"}});
        generator.set_override(Some(custom.clone())).unwrap();

        // Override bypasses generation, so an empty SNI registry is fine
        let snapshot = ObfuscationSnapshot::default();
        let sni = SniStatus::default();
        let value = generator
            .render(DescriptorInputs {
                obfuscation: &snapshot,
                sni: &sni,
                acl_file: None,
            })
            .unwrap();
        assert_eq!(value, custom);
    }

    #[test]
    fn test_missing_tls_is_validation_error() {
        let generator = ConfigGenerator::new(settings(), PathBuf::from("/certs"));
        let snapshot = ObfuscationSnapshot::default();
        let sni = SniStatus::default();
        let err = generator
            .build(DescriptorInputs {
                obfuscation: &snapshot,
                sni: &sni,
                acl_file: None,
            })
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_empty_password_is_minted() {
        let generator = ConfigGenerator::new(RelaySettings::default(), PathBuf::from("/certs"));
        let password = &generator.relay_settings().auth_password;
        assert_eq!(password.len(), MINTED_SECRET_LEN);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_minted_secret_is_stored_and_reused() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/auth_secret");

        let first = load_or_mint_secret(&path).await.unwrap();
        assert_eq!(first.len(), MINTED_SECRET_LEN);
        assert_eq!(load_or_mint_secret(&path).await.unwrap(), first);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        std::fs::write(&path, "operator-chosen\n").unwrap();
        assert_eq!(load_or_mint_secret(&path).await.unwrap(), "operator-chosen");
    }

    #[tokio::test]
    async fn test_write_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        let generator = ConfigGenerator::new(settings(), PathBuf::from("/certs"));
        let snapshot = ObfuscationSnapshot::default();
        let sni = sni();

        generator
            .write(
                &path,
                DescriptorInputs {
                    obfuscation: &snapshot,
                    sni: &sni,
                    acl_file: None,
                },
            )
            .await
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["listen"], ":443");
    }
}
