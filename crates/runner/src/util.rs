//! Timestamps and error-text truncation.

use chrono::Utc;

/// Persisted error messages are capped at this many characters.
pub const MAX_ERROR_MESSAGE_LENGTH: usize = 16_384;

const ELLIPSIS: &str = "\n... Content omitted for length ...\n";

/// Current UTC time in ISO-8601 with millisecond precision, e.g.
/// `2026-08-01T12:34:56.789Z`.
pub fn now_utc() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Truncate `text` to at most `max_length` characters by dropping its
/// middle, keeping the head and the tail around a marker.
pub fn truncate_text_center(text: &str, max_length: usize) -> String {
    let length = text.chars().count();
    if length <= max_length {
        return text.to_string();
    }

    let ellipsis_length = ELLIPSIS.chars().count();
    if max_length < ellipsis_length + 4 {
        // No room for the marker plus any content.
        return text.chars().take(max_length).collect();
    }

    let available = max_length - ellipsis_length;
    let start_length = available / 2;
    let end_length = available - start_length;

    let start: String = text.chars().take(start_length).collect();
    let end: String = text.chars().skip(length - end_length).collect();
    format!("{}{}{}", start.trim_end(), ELLIPSIS, end.trim_start())
}
