//! Client IP resolution.
//!
//! Derives the effective client address from proxy headers with a
//! configurable trust depth and canonicalizes IPv6 forms so every component
//! downstream keys on the same string.

use std::collections::HashMap;

use log::debug;

const MOCK_IP_HEADER: &str = "mock-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

const DEFAULT_LOCAL_IP: &str = "127.0.0.1";

pub struct IdentityResolver {
    /// Number of hops from the rightmost X-Forwarded-For entry trusted as
    /// proxies; the (1 + index)-th rightmost value is taken as the client.
    max_trusted_index: usize,
}

impl IdentityResolver {
    pub fn new(max_trusted_index: usize) -> Self {
        Self { max_trusted_index }
    }

    /// Resolve the canonical client IP for one request.
    ///
    /// Sources in order: a synthetic `Mock-IP` header (testing only),
    /// `X-Forwarded-For` honoring the trust depth, `X-Real-IP`, and finally
    /// the transport remote address. Falls back to `127.0.0.1`.
    pub fn resolve(&self, headers: &HashMap<String, String>, remote_addr: Option<&str>) -> String {
        if let Some(mock) = headers.get(MOCK_IP_HEADER) {
            if is_valid_ip(mock) {
                return normalize_ip(mock);
            }
        }

        if let Some(forwarded) = headers.get(X_FORWARDED_FOR) {
            if let Some(ip) = self.pick_forwarded(forwarded) {
                return normalize_ip(&ip);
            }
        }

        if let Some(real_ip) = headers.get(X_REAL_IP) {
            if is_valid_ip(real_ip) {
                return normalize_ip(real_ip);
            }
        }

        if let Some(addr) = remote_addr {
            let host = strip_port(addr);
            if is_valid_ip(&host) {
                return normalize_ip(&host);
            }
        }

        debug!("no resolvable client address, defaulting to {}", DEFAULT_LOCAL_IP);
        DEFAULT_LOCAL_IP.to_string()
    }

    /// Pick the (1 + max_trusted_index)-th rightmost X-Forwarded-For entry.
    /// With fewer entries than trusted hops, the leftmost entry is used.
    fn pick_forwarded(&self, forwarded: &str) -> Option<String> {
        let entries: Vec<&str> = forwarded
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        if entries.is_empty() {
            return None;
        }
        let from_right = self.max_trusted_index.min(entries.len() - 1);
        let candidate = entries[entries.len() - 1 - from_right];
        if is_valid_ip(candidate) {
            Some(candidate.to_string())
        } else {
            None
        }
    }
}

/// Canonicalize an IP string: IPv6 loopback becomes `127.0.0.1` and
/// IPv4-mapped IPv6 collapses to its v4 form.
pub fn normalize_ip(ip: &str) -> String {
    let trimmed = ip.trim();
    if trimmed.is_empty() {
        return DEFAULT_LOCAL_IP.to_string();
    }

    if trimmed == "::1" || trimmed == "0:0:0:0:0:0:0:1" {
        return DEFAULT_LOCAL_IP.to_string();
    }

    if let Some(colon) = trimmed.rfind(':') {
        if trimmed.to_ascii_lowercase().contains("::ffff:") {
            let tail = &trimmed[colon + 1..];
            if is_valid_ipv4(tail) {
                return tail.to_string();
            }
        }
    }

    trimmed.to_string()
}

pub fn is_valid_ip(ip: &str) -> bool {
    let trimmed = ip.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("unknown")
        || trimmed.eq_ignore_ascii_case("null")
    {
        return false;
    }
    is_valid_ipv4(trimmed) || is_valid_ipv6(trimmed)
}

pub fn is_valid_ipv4(ip: &str) -> bool {
    let parts: Vec<&str> = ip.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts
        .iter()
        .all(|part| !part.is_empty() && part.len() <= 3 && part.parse::<u16>().map_or(false, |n| n <= 255))
}

pub fn is_valid_ipv6(ip: &str) -> bool {
    ip.len() >= 2 && ip.contains(':') && ip.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.')
}

pub fn is_local_address(ip: &str) -> bool {
    matches!(ip, "127.0.0.1" | "localhost" | "::1" | "0:0:0:0:0:0:0:1")
}

pub fn is_private_network(ip: &str) -> bool {
    if !is_valid_ipv4(ip) {
        return false;
    }
    let octets: Vec<u16> = ip.split('.').map(|p| p.parse().unwrap_or(0)).collect();
    match (octets[0], octets[1]) {
        (10, _) => true,
        (172, second) => (16..=31).contains(&second),
        (192, 168) => true,
        _ => false,
    }
}

/// Location class used by the status endpoint: local, private or public.
pub fn location_type(ip: &str) -> &'static str {
    if is_local_address(ip) {
        "local"
    } else if is_private_network(ip) {
        "private"
    } else {
        "public"
    }
}

fn strip_port(addr: &str) -> String {
    // Bracketed IPv6 with port, plain host:port, or bare address.
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    match addr.rfind(':') {
        Some(idx) if addr[..idx].contains(':') => addr.to_string(),
        Some(idx) => addr[..idx].to_string(),
        None => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn mock_ip_wins() {
        let resolver = IdentityResolver::new(1);
        let h = headers(&[("mock-ip", "8.8.8.8"), ("x-real-ip", "9.9.9.9")]);
        assert_eq!(resolver.resolve(&h, Some("1.1.1.1:40000")), "8.8.8.8");
    }

    #[test]
    fn forwarded_for_honors_trust_depth() {
        let resolver = IdentityResolver::new(1);
        let h = headers(&[("x-forwarded-for", "203.0.113.7, 70.1.2.3, 10.0.0.1")]);
        // One trusted hop: second value from the right.
        assert_eq!(resolver.resolve(&h, None), "70.1.2.3");

        let deep = IdentityResolver::new(2);
        assert_eq!(deep.resolve(&h, None), "203.0.113.7");

        // Trust depth beyond the list clamps to the leftmost entry.
        let deeper = IdentityResolver::new(9);
        assert_eq!(deeper.resolve(&h, None), "203.0.113.7");
    }

    #[test]
    fn real_ip_and_remote_addr_fallbacks() {
        let resolver = IdentityResolver::new(1);
        assert_eq!(
            resolver.resolve(&headers(&[("x-real-ip", "198.51.100.4")]), None),
            "198.51.100.4"
        );
        assert_eq!(resolver.resolve(&headers(&[]), Some("192.0.2.33:9000")), "192.0.2.33");
        assert_eq!(resolver.resolve(&headers(&[]), None), "127.0.0.1");
    }

    #[test]
    fn ipv6_forms_are_canonicalized() {
        assert_eq!(normalize_ip("::1"), "127.0.0.1");
        assert_eq!(normalize_ip("0:0:0:0:0:0:0:1"), "127.0.0.1");
        assert_eq!(normalize_ip("::ffff:10.2.3.4"), "10.2.3.4");
        assert_eq!(normalize_ip("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn canonical_ip_is_stable_across_sources() {
        let resolver = IdentityResolver::new(1);
        let via_header = resolver.resolve(&headers(&[("x-real-ip", "::ffff:10.2.3.4")]), None);
        let via_remote = resolver.resolve(&headers(&[]), Some("[::ffff:10.2.3.4]:443"));
        assert_eq!(via_header, via_remote);
        assert_eq!(via_header, "10.2.3.4");
    }

    #[test]
    fn validity_checks() {
        assert!(is_valid_ipv4("255.255.255.255"));
        assert!(!is_valid_ipv4("256.1.1.1"));
        assert!(!is_valid_ip("unknown"));
        assert!(is_valid_ipv6("2001:db8::1"));
    }

    #[test]
    fn network_classification() {
        assert_eq!(location_type("127.0.0.1"), "local");
        assert_eq!(location_type("10.1.2.3"), "private");
        assert_eq!(location_type("172.20.0.1"), "private");
        assert_eq!(location_type("192.168.1.1"), "private");
        assert_eq!(location_type("8.8.8.8"), "public");
    }
}
