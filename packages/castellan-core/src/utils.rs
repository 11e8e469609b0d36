//! General utilities shared across the application.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Formats a timestamp as an RFC 7231 HTTP date for `Last-Modified`.
#[must_use]
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Host Environment
// ─────────────────────────────────────────────────────────────────────────────

/// Refuses to run as root.
///
/// The daemon talks to user-session buses and the per-user audio socket;
/// running it as uid 0 would both fail and grant power operations to any
/// local HTTP caller.
pub fn refuse_root() -> Result<(), String> {
    if effective_uid() == 0 {
        return Err("refusing to run as root; start castellan from a user session".to_string());
    }
    Ok(())
}

/// The effective uid of this process.
#[must_use]
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

/// Resolves the user runtime directory: `$XDG_RUNTIME_DIR`, falling back to
/// `/run/user/<uid>`.
#[must_use]
pub fn runtime_dir(override_dir: Option<&str>) -> String {
    if let Some(dir) = override_dir {
        return dir.to_string();
    }
    std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| format!("/run/user/{}", effective_uid()))
}

/// A short human-readable OS description, read once at startup.
///
/// Uses `PRETTY_NAME` from `/etc/os-release` when available.
#[must_use]
pub fn os_description() -> String {
    std::fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|contents| {
            contents.lines().find_map(|line| {
                line.strip_prefix("PRETTY_NAME=")
                    .map(|value| value.trim_matches('"').to_string())
            })
        })
        .unwrap_or_else(|| "Linux".to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Bind Resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves the configured bind target to a socket address.
///
/// `all` binds every interface; any other value is looked up as an
/// interface name and resolved to its first IPv4 address.
pub fn resolve_bind_addr(bind: &str, port: u16) -> Result<SocketAddr, String> {
    if bind == "all" {
        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }

    let interfaces = local_ip_address::list_afinet_netifas()
        .map_err(|e| format!("failed to enumerate network interfaces: {e}"))?;

    interfaces
        .into_iter()
        .find(|(name, ip)| name == bind && matches!(ip, IpAddr::V4(_)))
        .map(|(_, ip)| SocketAddr::new(ip, port))
        .ok_or_else(|| format!("no IPv4 address on interface {bind:?}"))
}

/// Picks the address to advertise over mDNS.
///
/// A wildcard bind has no single address; fall back to the host's primary
/// local IP.
#[must_use]
pub fn advertise_ip(addr: &SocketAddr) -> IpAddr {
    if addr.ip().is_unspecified() {
        local_ip_address::local_ip().unwrap_or_else(|_| addr.ip())
    } else {
        addr.ip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn http_date_is_rfc7231_shaped() {
        let date = http_date(UNIX_EPOCH + Duration::from_secs(784_111_777));
        assert_eq!(date, "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn runtime_dir_override_wins() {
        assert_eq!(runtime_dir(Some("/tmp/rt")), "/tmp/rt");
    }

    #[test]
    fn bind_all_is_unspecified() {
        let addr = resolve_bind_addr("all", 8089).unwrap();
        assert!(addr.ip().is_unspecified());
        assert_eq!(addr.port(), 8089);
    }

    #[test]
    fn unknown_interface_is_an_error() {
        assert!(resolve_bind_addr("definitely-not-an-interface", 8089).is_err());
    }
}
