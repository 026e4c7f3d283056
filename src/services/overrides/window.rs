//! Date-window activation of override records.

use time::{
    Date, OffsetDateTime, UtcOffset, format_description::well_known::Rfc3339,
    macros::{format_description, offset},
};
use tracing::warn;

use crate::{dto::catalog::OverrideRecord, error::ResolutionError};

/// Fixed zone override windows are evaluated in.
pub const REFERENCE_OFFSET: UtcOffset = offset!(+1);

/// Inclusive range of calendar days in the reference zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    /// First active day.
    pub start: Date,
    /// Last active day.
    pub end: Date,
}

impl DateWindow {
    /// Parse the bounds of record `id`. Each bound is either `YYYY-MM-DD` or an RFC 3339
    /// timestamp, which is reduced to its calendar day in the reference zone.
    pub fn parse(id: &str, start: Option<&str>, end: Option<&str>) -> Result<Self, ResolutionError> {
        let (Some(start), Some(end)) = (start, end) else {
            return Err(ResolutionError::MissingDateWindow { id: id.to_string() });
        };
        Ok(Self {
            start: parse_day(id, start)?,
            end: parse_day(id, end)?,
        })
    }

    /// True when `now` falls on a day between start and end, both inclusive.
    pub fn contains(&self, now: OffsetDateTime) -> bool {
        let today = now.to_offset(REFERENCE_OFFSET).date();
        self.start <= today && today <= self.end
    }
}

fn parse_day(id: &str, raw: &str) -> Result<Date, ResolutionError> {
    let raw = raw.trim();
    if let Ok(date) = Date::parse(raw, format_description!("[year]-[month]-[day]")) {
        return Ok(date);
    }
    OffsetDateTime::parse(raw, &Rfc3339)
        .map(|instant| instant.to_offset(REFERENCE_OFFSET).date())
        .map_err(|_| ResolutionError::MalformedDate {
            id: id.to_string(),
            value: raw.to_string(),
        })
}

/// Whether `record` applies at `now`. Unpublished records and records with an unusable window
/// never apply; the latter are logged.
pub fn is_active(record: &OverrideRecord, now: OffsetDateTime) -> bool {
    if !record.published {
        return false;
    }
    match DateWindow::parse(
        &record.id,
        record.start_date.as_deref(),
        record.end_date.as_deref(),
    ) {
        Ok(window) => window.contains(now),
        Err(err) => {
            warn!(override_id = %record.id, error = %err, "ignoring override with invalid window");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::{date, datetime};

    use super::*;

    fn record(start: Option<&str>, end: Option<&str>, published: bool) -> OverrideRecord {
        OverrideRecord {
            id: "promo-1".into(),
            group: "g1".into(),
            start_date: start.map(str::to_string),
            end_date: end.map(str::to_string),
            published,
            bindings: Vec::new(),
        }
    }

    #[test]
    fn end_date_is_inclusive_through_the_whole_day() {
        let record = record(Some("2024-01-01"), Some("2024-01-10"), true);

        assert!(is_active(&record, datetime!(2024-01-05 12:00 UTC)));
        assert!(is_active(&record, datetime!(2024-01-10 22:59 UTC)));
        assert!(!is_active(&record, datetime!(2024-01-10 23:00 UTC)));
        assert!(!is_active(&record, datetime!(2024-02-01 12:00 UTC)));
    }

    #[test]
    fn start_is_midnight_in_reference_zone() {
        let record = record(Some("2024-01-01"), Some("2024-01-10"), true);

        assert!(!is_active(&record, datetime!(2023-12-31 22:59 UTC)));
        assert!(is_active(&record, datetime!(2023-12-31 23:00 UTC)));
    }

    #[test]
    fn timestamps_are_reduced_to_reference_days() {
        let window = DateWindow::parse(
            "x",
            Some("2024-01-01T00:30:00Z"),
            Some("2024-01-10T23:30:00Z"),
        )
        .unwrap();

        assert_eq!(window.start, date!(2024 - 01 - 01));
        assert_eq!(window.end, date!(2024 - 01 - 11));
    }

    #[test]
    fn unpublished_or_malformed_records_are_inactive() {
        let now = datetime!(2024-01-05 12:00 UTC);
        assert!(!is_active(&record(Some("2024-01-01"), Some("2024-01-10"), false), now));
        assert!(!is_active(&record(Some("yesterday"), Some("2024-01-10"), true), now));
        assert!(!is_active(&record(None, Some("2024-01-10"), true), now));

        assert_eq!(
            DateWindow::parse("x", Some("01/02/2024"), Some("2024-01-10")),
            Err(ResolutionError::MalformedDate {
                id: "x".into(),
                value: "01/02/2024".into()
            })
        );
        assert_eq!(
            DateWindow::parse("x", Some("2024-01-01"), None),
            Err(ResolutionError::MissingDateWindow { id: "x".into() })
        );
    }
}
