//! Human-readable formatting for sizes and times.

use chrono::{DateTime, Duration, Utc};

const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

/// Format a byte count with 1024-based units, e.g. "48.83 KB".
pub fn human_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Format a duration as its largest whole unit, e.g. "3 hours".
pub fn human_duration(duration: Duration) -> String {
    let seconds = duration.num_seconds().abs();
    let (amount, unit) = if seconds < 60 {
        (seconds, "second")
    } else if seconds < 60 * 60 {
        (seconds / 60, "minute")
    } else if seconds < 60 * 60 * 24 {
        (seconds / (60 * 60), "hour")
    } else {
        (seconds / (60 * 60 * 24), "day")
    };

    if amount == 1 {
        format!("{} {}", amount, unit)
    } else {
        format!("{} {}s", amount, unit)
    }
}

/// Format a timestamp relative to `now`: "in 2 hours" or "5 minutes ago".
pub fn relative_time(time: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = time.signed_duration_since(now);
    if diff.num_seconds() < 0 {
        format!("{} ago", human_duration(diff))
    } else {
        format!("in {}", human_duration(diff))
    }
}

/// Truncate a display string to `max_chars`, marking the cut with "...".
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
