//! Obfuscation mode controller
//!
//! The relay runs with at most one traffic-disguise technique. The active
//! mode and its settings are held as a single value, so activating one mode
//! necessarily drops the settings of whichever mode was active before.

use crate::error::{RelayError, RelayResult};
use crate::validation::{validate_hostname, validate_port, validate_token};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Descriptor keys that carry a mode block
pub const MODE_KEYS: [(&str, ObfuscationMode); 4] = [
    ("obfs", ObfuscationMode::Salamander),
    ("masquerade", ObfuscationMode::Masquerade),
    ("outbounds", ObfuscationMode::OutboundProxy),
    ("mimicry", ObfuscationMode::TlsMimicry),
];

/// Browser fingerprints accepted for TLS mimicry
pub const FINGERPRINTS: [&str; 7] = [
    "chrome", "firefox", "safari", "ios", "android", "edge", "randomized",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObfuscationMode {
    #[default]
    None,
    /// Serve a reverse-proxied website to non-relay clients
    Masquerade,
    /// Salamander packet obfuscation keyed by a shared password
    Salamander,
    /// Relay egress leaves through the local outbound proxy
    OutboundProxy,
    /// TLS ClientHello shaped like a mainstream browser
    TlsMimicry,
}

impl fmt::Display for ObfuscationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObfuscationMode::None => "none",
            ObfuscationMode::Masquerade => "masquerade",
            ObfuscationMode::Salamander => "salamander",
            ObfuscationMode::OutboundProxy => "outbound_proxy",
            ObfuscationMode::TlsMimicry => "tls_mimicry",
        };
        f.write_str(s)
    }
}

impl FromStr for ObfuscationMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "none" | "" => Ok(ObfuscationMode::None),
            "masquerade" => Ok(ObfuscationMode::Masquerade),
            "salamander" | "obfs" => Ok(ObfuscationMode::Salamander),
            "outbound_proxy" | "proxy" | "warp" => Ok(ObfuscationMode::OutboundProxy),
            "tls_mimicry" | "mimicry" | "utls" => Ok(ObfuscationMode::TlsMimicry),
            other => Err(RelayError::Validation(format!("Unknown obfuscation mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasqueradeSettings {
    pub url: String,
    #[serde(default = "default_true")]
    pub rewrite_host: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalamanderSettings {
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundProxySettings {
    pub proxy_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MimicrySettings {
    pub server_name: String,
    pub fingerprint: String,
}

fn default_true() -> bool {
    true
}

/// Settings for one mode; the variant determines the mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ModeSettings {
    Masquerade(MasqueradeSettings),
    Salamander(SalamanderSettings),
    OutboundProxy(OutboundProxySettings),
    TlsMimicry(MimicrySettings),
}

impl ModeSettings {
    pub fn mode(&self) -> ObfuscationMode {
        match self {
            ModeSettings::Masquerade(_) => ObfuscationMode::Masquerade,
            ModeSettings::Salamander(_) => ObfuscationMode::Salamander,
            ModeSettings::OutboundProxy(_) => ObfuscationMode::OutboundProxy,
            ModeSettings::TlsMimicry(_) => ObfuscationMode::TlsMimicry,
        }
    }

    fn validate(&self) -> RelayResult<()> {
        match self {
            ModeSettings::Masquerade(m) => {
                let host = m
                    .url
                    .strip_prefix("https://")
                    .or_else(|| m.url.strip_prefix("http://"))
                    .ok_or_else(|| {
                        RelayError::Validation(format!(
                            "Masquerade URL must be http(s): {}",
                            m.url
                        ))
                    })?;
                let host = host.split(['/', ':']).next().unwrap_or_default();
                validate_hostname(host)
            }
            ModeSettings::Salamander(s) => {
                validate_token("obfuscation password", &s.password)?;
                if s.password.len() < 8 {
                    return Err(RelayError::Validation(
                        "Obfuscation password must be at least 8 characters".to_string(),
                    ));
                }
                Ok(())
            }
            ModeSettings::OutboundProxy(p) => validate_port(p.proxy_port as u32).map(|_| ()),
            ModeSettings::TlsMimicry(m) => {
                validate_hostname(&m.server_name)?;
                if !FINGERPRINTS.contains(&m.fingerprint.as_str()) {
                    return Err(RelayError::Validation(format!(
                        "Unknown TLS fingerprint '{}' (expected one of {})",
                        m.fingerprint,
                        FINGERPRINTS.join(", ")
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Current mode and its settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationSnapshot {
    pub mode: ObfuscationMode,
    pub settings: Option<ModeSettings>,
}

/// Mode change made by [`ObfuscationModeController::activate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTransition {
    pub previous: ObfuscationMode,
    pub current: ObfuscationMode,
}

#[derive(Debug, Default)]
pub struct ObfuscationModeController {
    active: Option<ModeSettings>,
}

impl ObfuscationModeController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> ObfuscationMode {
        self.active
            .as_ref()
            .map(ModeSettings::mode)
            .unwrap_or(ObfuscationMode::None)
    }

    pub fn snapshot(&self) -> ObfuscationSnapshot {
        ObfuscationSnapshot {
            mode: self.mode(),
            settings: self.active.clone(),
        }
    }

    /// Activate a mode, clearing whatever mode was active.
    ///
    /// Settings are validated first; an invalid request leaves the current
    /// mode untouched. Outbound proxy outranks salamander whichever arrives
    /// first: a salamander request while outbound proxy is active is dropped
    /// and the transition reports outbound proxy as current.
    pub fn activate(&mut self, settings: ModeSettings) -> RelayResult<ModeTransition> {
        settings.validate()?;

        let previous = self.mode();
        let current = settings.mode();
        if previous == ObfuscationMode::OutboundProxy && current == ObfuscationMode::Salamander {
            info!("Salamander request ignored; outbound proxy takes precedence");
            return Ok(ModeTransition { previous, current: previous });
        }
        if previous != ObfuscationMode::None && previous != current {
            info!("Obfuscation mode {} replaces {}; clearing its settings", current, previous);
        } else {
            info!("Obfuscation mode {} active", current);
        }

        self.active = Some(settings);
        Ok(ModeTransition { previous, current })
    }

    /// Return to `None` if `mode` is the active one; returns whether it was
    pub fn disable(&mut self, mode: ObfuscationMode) -> bool {
        if mode != ObfuscationMode::None && self.mode() == mode {
            self.active = None;
            info!("Obfuscation mode {} disabled", mode);
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.active = None;
    }

    /// Put back a state taken with [`snapshot`](Self::snapshot)
    pub fn restore(&mut self, snapshot: ObfuscationSnapshot) {
        self.active = snapshot.settings;
    }

    /// The active mode that must be explicitly overridden before `requested`
    /// can be activated, if any.
    ///
    /// Outbound proxy takes precedence over salamander obfuscation, so that
    /// pair never blocks.
    pub fn blocking_mode(&self, requested: ObfuscationMode) -> Option<ObfuscationMode> {
        let active = self.mode();
        match (active, requested) {
            (ObfuscationMode::None, _) => None,
            (a, r) if a == r => None,
            (ObfuscationMode::Salamander, ObfuscationMode::OutboundProxy) => None,
            (a, _) => Some(a),
        }
    }
}

/// Reject a descriptor carrying more than one mode block, naming the pair.
/// Returns the single mode present, or `None`.
pub fn validate_descriptor(descriptor: &serde_json::Value) -> RelayResult<ObfuscationMode> {
    let present: Vec<(&str, ObfuscationMode)> = MODE_KEYS
        .iter()
        .filter(|(key, _)| {
            descriptor
                .get(*key)
                .map(|v| !v.is_null())
                .unwrap_or(false)
        })
        .copied()
        .collect();

    match present.as_slice() {
        [] => Ok(ObfuscationMode::None),
        [(_, mode)] => Ok(*mode),
        [(first, _), (second, _), ..] => Err(RelayError::Conflict(format!(
            "descriptor contains both '{}' and '{}' blocks; only one obfuscation mode may be active",
            first, second
        ))),
    }
}
