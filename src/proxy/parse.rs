//! Parsers for the proxy client's human-readable output

use super::ProxyMode;

/// Connection state from `status` output.
///
/// Looks for a `Status update: <state>` line; anything other than
/// `Connected` (for example `Connecting`, `Disconnected`) is reported as not
/// connected. Returns `None` if no status line is present.
pub fn parse_connected(output: &str) -> Option<bool> {
    output.lines().find_map(|line| {
        let (_, state) = line.split_once("Status update:")?;
        let state = state.split_whitespace().next().unwrap_or_default();
        Some(state.eq_ignore_ascii_case("connected"))
    })
}

/// Mode and proxy port from `settings` output.
///
/// Matches lines like `Mode: WarpProxy on port 40000` and `Mode: Warp`,
/// optionally prefixed by `(user set)` or similar annotations.
pub fn parse_mode(output: &str) -> (Option<ProxyMode>, Option<u16>) {
    for line in output.lines() {
        let Some((_, rest)) = line.split_once("Mode:") else {
            continue;
        };
        let rest = rest.trim();
        let name = rest.split_whitespace().next().unwrap_or_default();

        if name.to_ascii_lowercase().contains("proxy") {
            let port = rest
                .split_once("port")
                .and_then(|(_, p)| p.split_whitespace().next())
                .and_then(|p| p.parse::<u16>().ok());
            return (Some(ProxyMode::ProxyOnly), port);
        }
        if !name.is_empty() {
            return (Some(ProxyMode::FullTunnel), None);
        }
    }
    (None, None)
}

/// Cumulative (sent, received) bytes from `tunnel stats` output.
///
/// Accepts `Sent: 12.5MB; Received: 3kB` on one line or on separate lines.
pub fn parse_tunnel_bytes(output: &str) -> (u64, u64) {
    let mut sent = 0;
    let mut received = 0;

    for segment in output.split(['\n', ';']) {
        let segment = segment.trim();
        if let Some(v) = segment.strip_prefix("Sent:") {
            sent = parse_byte_quantity(v).unwrap_or(sent);
        } else if let Some(v) = segment.strip_prefix("Received:") {
            received = parse_byte_quantity(v).unwrap_or(received);
        }
    }

    (sent, received)
}

/// `12.5MB`, `3 kB`, `512B`, `1.2GiB` to bytes
pub fn parse_byte_quantity(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;

    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "kb" => 1e3,
        "mb" => 1e6,
        "gb" => 1e9,
        "tb" => 1e12,
        "kib" => 1024.0,
        "mib" => 1024.0 * 1024.0,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };

    Some((number * multiplier).round() as u64)
}
