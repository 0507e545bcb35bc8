//! Formatting helpers for tabular CLI output.

use burrow_common::types::PortMapping;
use chrono::{DateTime, Utc};

/// Formats how long ago `created` was, e.g. `"5 minutes ago"`.
#[must_use]
pub fn format_age(created: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - created).num_seconds().max(0);
    let (value, unit) = match secs {
        0..60 => (secs, "second"),
        60..3600 => (secs / 60, "minute"),
        3600..86_400 => (secs / 3600, "hour"),
        _ => (secs / 86_400, "day"),
    };
    let plural = if value == 1 { "" } else { "s" };
    format!("{value} {unit}{plural} ago")
}

/// Formats port mappings as `8080->80,8443->443`, or `-` if there are none.
#[must_use]
pub fn format_ports(mappings: &[PortMapping]) -> String {
    if mappings.is_empty() {
        return "-".to_string();
    }
    mappings
        .iter()
        .map(|m| format!("{}->{}", m.host, m.container))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn format_age_picks_the_largest_unit() {
        let now = Utc::now();
        assert_eq!(format_age(now, now), "0 seconds ago");
        assert_eq!(format_age(now - TimeDelta::seconds(61), now), "1 minute ago");
        assert_eq!(format_age(now - TimeDelta::hours(5), now), "5 hours ago");
        assert_eq!(format_age(now - TimeDelta::days(2), now), "2 days ago");
    }

    #[test]
    fn format_age_clamps_clock_skew() {
        let now = Utc::now();
        assert_eq!(format_age(now + TimeDelta::seconds(30), now), "0 seconds ago");
    }

    #[test]
    fn format_ports_joins_mappings() {
        let mappings = [
            PortMapping { host: 8080, container: 80 },
            PortMapping { host: 8443, container: 443 },
        ];
        assert_eq!(format_ports(&mappings), "8080->80,8443->443");
        assert_eq!(format_ports(&[]), "-");
    }
}
