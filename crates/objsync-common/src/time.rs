//! Clock helpers shared by the storage core.
//!
//! Activation and expiration times are RFC3339 strings without
//! sub-second precision so they can be compared lexicographically in
//! queries; instance ids are nanosecond timestamps.

use chrono::{SecondsFormat, Utc};

/// Current time as an RFC3339 string (`2024-05-01T12:00:00Z`)
#[must_use]
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// An RFC3339 string for a time `secs` seconds from now
#[must_use]
pub fn rfc3339_in(secs: i64) -> String {
    (Utc::now() + chrono::Duration::seconds(secs)).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Current unix time in seconds
#[must_use]
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Current unix time in nanoseconds; saturates far in the future
#[must_use]
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339_ordering() {
        let earlier = now_rfc3339();
        let later = rfc3339_in(3600);
        // lexicographic comparison matches temporal ordering
        assert!(earlier < later);
        assert!(earlier.ends_with('Z'));
    }

    #[test]
    fn test_nanos_resolution() {
        let nanos = now_nanos();
        assert!(nanos > 1_600_000_000_000_000_000);
    }
}
