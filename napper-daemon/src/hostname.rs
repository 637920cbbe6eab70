use regex::Regex;
use std::sync::LazyLock;

/// Substrings that mark a hostname as belonging to the supervisor itself,
/// kept as a safety net beside the configured `own_hostname`.
const SELF_MARKERS: &[&str] = &["kamal-napper", "naptime"];

static IPV4_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}").unwrap());

/// Whether a string is a hostname the supervisor is willing to manage.
///
/// Accepts DNS names only: at least one dot, 4-99 characters, no port
/// separator, not `localhost`, and not something that starts with a
/// dotted-quad IPv4 literal.
pub fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || !host.contains('.') {
        return false;
    }
    if host.len() < 4 || host.len() > 99 {
        return false;
    }
    if host == "localhost" || host.contains(':') {
        return false;
    }
    !IPV4_PREFIX.is_match(host)
}

/// Whether a hostname identifies this daemon rather than a managed app.
pub fn is_self_host(host: &str, own_hostname: Option<&str>) -> bool {
    if let Some(own) = own_hostname {
        if host.eq_ignore_ascii_case(own) {
            return true;
        }
    }
    let lowered = host.to_ascii_lowercase();
    SELF_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Valid and not the daemon itself.
pub fn is_managed_hostname(host: &str, own_hostname: Option<&str>) -> bool {
    is_valid_hostname(host) && !is_self_host(host, own_hostname)
}

/// Service label for a host: its first dot-separated component.
pub fn service_for_host(host: &str) -> &str {
    host.split('.').next().unwrap_or(host)
}

/// Reduce a hostname to a filesystem-safe token for stamp-file names.
/// Dots and hyphens survive, so valid hostnames map back from file names.
pub fn sanitize(host: &str) -> String {
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests;
