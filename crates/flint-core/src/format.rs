//! Formatting utilities

use chrono::{DateTime, Utc};

/// Format a timestamp relative to `now` (e.g., "2m ago", "in 6d")
pub fn relative_time(dt: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = now.signed_duration_since(dt);
    let (secs, future) = if diff.num_seconds() < 0 {
        (-diff.num_seconds(), true)
    } else {
        (diff.num_seconds(), false)
    };

    let amount = if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86_400)
    };

    if future {
        format!("in {}", amount)
    } else {
        format!("{} ago", amount)
    }
}

/// Format a timestamp as YYYY-MM-DD HH:MM
pub fn timestamp(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M").to_string()
}

/// Truncate a string to max length with ellipsis
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}

/// Show only the edges of a secret (tokens, passwords)
pub fn mask_secret(secret: &str) -> String {
    let len = secret.chars().count();
    if len <= 12 {
        return "*".repeat(len);
    }
    let head: String = secret.chars().take(6).collect();
    let tail: String = secret.chars().skip(len - 4).collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_relative_time_past_and_future() {
        let now = Utc::now();
        assert_eq!(relative_time(now - Duration::minutes(2), now), "2m ago");
        assert_eq!(relative_time(now + Duration::days(6), now), "in 6d");
        assert_eq!(relative_time(now - Duration::hours(3), now), "3h ago");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-much-longer-value", 8), "a-mu...");
        assert_eq!(truncate("abcdef", 2), "...");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("abc"), "***");
        assert_eq!(mask_secret("eyJhbGciOiJIUzI1NiJ9.payload"), "eyJhbG...load");
    }
}
