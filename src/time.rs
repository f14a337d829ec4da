use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Catalog timestamp text: RFC 3339, UTC, millisecond precision.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parses `YYYY-MM-DD`, ignoring any time suffix after the date. The first ten
/// characters must be the date itself, matching how the catalog keys rows.
pub fn parse_registered_date(raw: &str) -> Option<NaiveDate> {
    let head = raw.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_round_trip_in_utc() {
        let at = parse_timestamp("2024-03-07T10:15:30.250+02:00").unwrap();
        assert_eq!(format_timestamp(at), "2024-03-07T08:15:30.250Z");
    }

    #[test]
    fn registered_date_ignores_time_suffix() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(parse_registered_date("2024-01-02"), Some(expected));
        assert_eq!(parse_registered_date("2024-01-02 13:45:00"), Some(expected));
        assert_eq!(parse_registered_date("02/01/2024"), None);
        assert_eq!(parse_registered_date(""), None);
        assert_eq!(parse_registered_date(" 2024-01-02"), None);
    }

    #[test]
    fn now_is_reasonable() {
        let ms = now_utc().timestamp_millis();
        assert!(ms > 1_500_000_000_000); // after 2017
        assert!(ms < 4_100_000_000_000); // before year ~2100
    }
}
