use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};

pub fn format_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

/// Returns `true` for loopback, private (RFC 1918 / ULA) and link-local addresses.
pub fn is_internal_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // fc00::/7
                || (first & 0xffc0) == 0xfe80 // fe80::/10
        }
    }
}

/// Population mean and standard deviation. Returns `(0.0, 0.0)` for an empty input.
pub fn mean_and_std_dev<I>(values: I) -> (f64, f64)
where
    I: IntoIterator<Item = f64>,
{
    let values: Vec<f64> = values.into_iter().collect();
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Score in `[0, 100]` for an observation that must reach `threshold`:
/// 50 at the threshold, 100 at twice the threshold or more.
pub fn exceed_score(observed: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 {
        return 100.0;
    }
    (50.0 + 50.0 * (observed - threshold) / threshold).clamp(0.0, 100.0)
}

/// Score in `[0, 100]` for an observation that must stay below `limit`:
/// 100 at zero, 50 just under the limit.
pub fn below_score(observed: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return 0.0;
    }
    (50.0 + 50.0 * (1.0 - observed / limit)).clamp(0.0, 100.0)
}

/// `true` when `ts` falls inside the trailing window `(now - window, now]`.
/// A window reaching past the earliest representable instant has no lower bound.
pub fn within_window(ts: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    ts <= now && now.checked_sub_signed(window).map_or(true, |start| ts > start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_addresses() {
        assert!(is_internal_address(&"192.168.1.5".parse().unwrap()));
        assert!(is_internal_address(&"10.0.0.1".parse().unwrap()));
        assert!(is_internal_address(&"127.0.0.1".parse().unwrap()));
        assert!(is_internal_address(&"169.254.10.1".parse().unwrap()));
        assert!(is_internal_address(&"fe80::1".parse().unwrap()));
        assert!(is_internal_address(&"fd00::1".parse().unwrap()));
        assert!(!is_internal_address(&"203.0.113.9".parse().unwrap()));
        assert!(!is_internal_address(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn std_dev_of_constant_series_is_zero() {
        let (mean, sd) = mean_and_std_dev(vec![64.0; 20]);
        assert_eq!(mean, 64.0);
        assert_eq!(sd, 0.0);
    }

    #[test]
    fn window_near_the_minimum_instant_does_not_overflow() {
        let earliest = DateTime::<Utc>::MIN_UTC;
        assert!(within_window(earliest, earliest, Duration::seconds(1)));
        assert!(!within_window(earliest + Duration::seconds(5), earliest, Duration::seconds(1)));
    }

    #[test]
    fn scores_are_clamped() {
        assert_eq!(exceed_score(100.0, 100.0), 50.0);
        assert_eq!(exceed_score(500.0, 100.0), 100.0);
        assert_eq!(below_score(0.0, 10.0), 100.0);
    }
}
