use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// Analytics events.
pub mod analytics;
/// Promotion and experiment catalog records.
pub mod catalog;
/// Game records pushed by the backend.
pub mod game;
/// Push protocol frames.
pub mod ws;

/// Format a timestamp as RFC 3339 for wire payloads.
pub fn format_timestamp(time: OffsetDateTime) -> String {
    time.format(&Rfc3339)
        .unwrap_or_else(|_| "invalid-timestamp".into())
}
