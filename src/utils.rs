use std::time::{SystemTime, UNIX_EPOCH};

pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Store key for a per-(ip, path) sliding window.
pub fn sliding_window_key(prefix: &str, ip: &str, path: &str) -> String {
    format!("{}:sliding_window:{}:{}", prefix, ip, path)
}

/// Store key for the active-IP observation set of one IP.
pub fn ip_access_key(prefix: &str, ip: &str) -> String {
    format!("{}:ip_access:{}", prefix, ip)
}

/// Prefix shared by every active-IP observation set, used for scans.
pub fn ip_access_scan_prefix(prefix: &str) -> String {
    format!("{}:ip_access:", prefix)
}

pub fn white_list_key(prefix: &str, ip: &str) -> String {
    format!("{}:white_list:{}", prefix, ip)
}

pub fn black_list_key(prefix: &str, ip: &str) -> String {
    format!("{}:black_list:{}", prefix, ip)
}

pub fn captcha_required_key(prefix: &str) -> String {
    format!("{}:captcha_required", prefix)
}

pub fn ip_captcha_key(prefix: &str, ip: &str) -> String {
    format!("{}:ip_captcha:{}", prefix, ip)
}

pub fn audit_records_key(prefix: &str) -> String {
    format!("{}:audit_records", prefix)
}

pub fn health_check_key(prefix: &str) -> String {
    format!("{}:health_check", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats() {
        assert_eq!(
            sliding_window_key("rate_limit", "1.2.3.4", "/a"),
            "rate_limit:sliding_window:1.2.3.4:/a"
        );
        assert_eq!(white_list_key("rate_limit", "5.5.5.5"), "rate_limit:white_list:5.5.5.5");
        assert_eq!(captcha_required_key("rate_limit"), "rate_limit:captcha_required");
    }
}
