use chrono::{DateTime, Utc};

/// Clock skew between client and server clocks is tolerated up to this many
/// minutes in the future; such timestamps render as "just now" rather than
/// erroring or showing a negative age.
const SKEW_TOLERANCE_MINUTES: i64 = 10;

/// Bucket a creation timestamp into a human-readable relative age.
///
/// Under a minute old (or up to ten minutes in the future) is "just now",
/// under an hour is in minutes, under a day is in hours, anything older
/// falls back to the absolute date.
pub fn format_relative_time(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(created_at);
    let minutes = age.num_minutes();

    if age.num_seconds() < 60 && minutes > -SKEW_TOLERANCE_MINUTES {
        return "just now".to_string();
    }
    if minutes < 0 {
        // Skew beyond tolerance: show the date instead of a nonsense age.
        return created_at.format("%Y-%m-%d").to_string();
    }
    if minutes < 60 {
        return if minutes == 1 {
            "1 minute ago".to_string()
        } else {
            format!("{minutes} minutes ago")
        };
    }
    let hours = age.num_hours();
    if hours < 24 {
        return if hours == 1 {
            "1 hour ago".to_string()
        } else {
            format!("{hours} hours ago")
        };
    }
    created_at.format("%Y-%m-%d").to_string()
}
