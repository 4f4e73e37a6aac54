//! Input validation and sanitization
//!
//! Everything that ends up on an external tool's command line or in a file
//! name passes through here first.

use crate::error::{RelayError, RelayResult};
use std::net::IpAddr;

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Maximum length of a DNS name
const MAX_DOMAIN_LEN: usize = 253;

/// Maximum length of a single DNS label
const MAX_LABEL_LEN: usize = 63;

/// Maximum length for captured tool output carried in errors
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Validate interface name to prevent command injection
///
/// Interface names must be alphanumeric with optional dashes and underscores,
/// and no longer than 15 characters (Linux kernel limit)
pub fn validate_interface_name(name: &str) -> RelayResult<()> {
    if name.is_empty() {
        return Err(RelayError::Validation(
            "Interface name cannot be empty".to_string()
        ));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(RelayError::Validation(
            format!("Interface name too long (max {} characters)", MAX_INTERFACE_NAME_LEN)
        ));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            return Err(RelayError::Validation(
                format!("Invalid interface name '{}': contains invalid character '{}'", name, c)
            ));
        }
    }

    if name.starts_with('-') {
        return Err(RelayError::Validation(
            "Interface name cannot start with dash".to_string()
        ));
    }

    Ok(())
}

/// Validate a TCP/UDP port supplied as a wide integer
pub fn validate_port(port: u32) -> RelayResult<u16> {
    if port == 0 || port > u16::MAX as u32 {
        return Err(RelayError::Validation(
            format!("Port {} out of range (1-65535)", port)
        ));
    }
    Ok(port as u16)
}

/// Validate a fully qualified domain name
///
/// Wildcards are accepted only as the complete leftmost label.
pub fn validate_domain(domain: &str) -> RelayResult<()> {
    if domain.is_empty() {
        return Err(RelayError::Validation("Domain cannot be empty".to_string()));
    }

    if domain.len() > MAX_DOMAIN_LEN {
        return Err(RelayError::Validation(
            format!("Domain too long (max {} characters)", MAX_DOMAIN_LEN)
        ));
    }

    if domain.parse::<IpAddr>().is_ok() {
        return Err(RelayError::Validation(
            format!("'{}' is an IP address, not a domain", domain)
        ));
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(RelayError::Validation(
            format!("Domain '{}' must contain at least one dot", domain)
        ));
    }

    for (i, label) in labels.iter().enumerate() {
        if i == 0 && *label == "*" {
            continue;
        }
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(RelayError::Validation(
                format!("Invalid label '{}' in domain '{}'", label, domain)
            ));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(RelayError::Validation(
                format!("Label '{}' cannot start or end with a dash", label)
            ));
        }
        if let Some(c) = label.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '-') {
            return Err(RelayError::Validation(
                format!("Invalid domain character '{}' in '{}'", c, domain)
            ));
        }
    }

    Ok(())
}

/// Validate an ACME account e-mail address
pub fn validate_email(email: &str) -> RelayResult<()> {
    let (local, host) = email.split_once('@').ok_or_else(|| {
        RelayError::Validation(format!("Invalid e-mail address: {}", email))
    })?;

    if local.is_empty() || local.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(RelayError::Validation(format!("Invalid e-mail address: {}", email)));
    }

    validate_domain(host)
}

/// Validate hostname for probe targets
pub fn validate_hostname(host: &str) -> RelayResult<()> {
    if host.is_empty() {
        return Err(RelayError::Validation(
            "Hostname cannot be empty".to_string()
        ));
    }

    if host.len() > MAX_DOMAIN_LEN {
        return Err(RelayError::Validation(
            "Hostname too long".to_string()
        ));
    }

    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    for c in host.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '.' {
            return Err(RelayError::Validation(
                format!("Invalid hostname character: {}", c)
            ));
        }
    }

    if host.starts_with('-') || host.starts_with('.') ||
       host.ends_with('-') || host.ends_with('.') {
        return Err(RelayError::Validation(
            "Invalid hostname format".to_string()
        ));
    }

    Ok(())
}

/// Validate a secret passed on a command line (license key, obfs password)
pub fn validate_token(name: &str, value: &str) -> RelayResult<()> {
    if value.is_empty() {
        return Err(RelayError::Validation(format!("{} cannot be empty", name)));
    }

    if value.len() > 128 {
        return Err(RelayError::Validation(format!("{} too long", name)));
    }

    if let Some(c) = value.chars().find(|c| !c.is_ascii_graphic() || *c == '\'' || *c == '"') {
        return Err(RelayError::Validation(
            format!("{} contains invalid character {:?}", name, c)
        ));
    }

    Ok(())
}

/// Truncate captured tool output before it is carried in an error
pub fn sanitize_error_message(stderr: &str) -> String {
    let mut sanitized = stderr.trim().to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str("... (truncated)");
    }

    sanitized
}
