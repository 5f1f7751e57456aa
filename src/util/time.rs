use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

use crate::error::{Error, Result};

pub fn format_rfc3339(instant: OffsetDateTime) -> String {
    instant
        .format(&Rfc3339)
        .unwrap_or_else(|_| instant.unix_timestamp().to_string())
}

pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| Error::Fatal(format!("invalid timestamp {value}: {err}")))
}

/// `YYYY-MM-DD-HH-MM-SS` in UTC, the middle field of every archived filename.
pub fn filename_timestamp(instant: OffsetDateTime) -> String {
    let utc = instant.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}-{:02}-{:02}-{:02}",
        utc.year(),
        u8::from(utc.month()),
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second()
    )
}

/// `YYYY/MM` date sub-path the storage tree is keyed on.
pub fn date_subpath(instant: OffsetDateTime) -> String {
    let utc = instant.to_offset(UtcOffset::UTC);
    format!("{:04}/{:02}", utc.year(), u8::from(utc.month()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn rfc3339_roundtrip() {
        let instant = datetime!(2024-01-15 10:30:00 UTC);
        let rendered = format_rfc3339(instant);
        assert_eq!(rendered, "2024-01-15T10:30:00Z");
        assert_eq!(parse_rfc3339(&rendered).unwrap(), instant);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_rfc3339("yesterday").is_err());
    }

    #[test]
    fn filename_timestamp_is_utc() {
        let offset = datetime!(2024-01-15 12:30:00 +02:00);
        assert_eq!(filename_timestamp(offset), "2024-01-15-10-30-00");
    }

    #[test]
    fn date_subpath_pads_month() {
        assert_eq!(date_subpath(datetime!(2024-03-01 00:00:00 UTC)), "2024/03");
    }
}
