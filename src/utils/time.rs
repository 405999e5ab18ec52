use chrono::{DateTime, Duration, NaiveDate, Utc};
use crate::error::AppError;

/// Layout used for day keys embedded in table names
pub const DAY_KEY_FORMAT: &str = "%Y%m%d";

/// Layout used for configured dates and the price reference file
pub const DAY_FORMAT: &str = "%Y-%m-%d";

/// Convert Unix seconds to DateTime<Utc>
pub fn from_unix_timestamp(timestamp: u64) -> Option<DateTime<Utc>> {
    i64::try_from(timestamp)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// UTC calendar day containing the given Unix timestamp
pub fn day_of_timestamp(timestamp: u64) -> Result<NaiveDate, AppError> {
    from_unix_timestamp(timestamp)
        .map(|dt| dt.date_naive())
        .ok_or_else(|| AppError::ValidationError(format!("Timestamp out of range: {}", timestamp)))
}

/// `YYYYMMDD` form of a day, as used in bucket table names
pub fn day_key(day: NaiveDate) -> String {
    day.format(DAY_KEY_FORMAT).to_string()
}

/// Parse a `YYYY-MM-DD` date
pub fn parse_day(value: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(value.trim(), DAY_FORMAT)
        .map_err(|e| AppError::ValidationError(format!("Invalid date '{}': {}", value, e)))
}

/// Every day from `start` to `end`, both inclusive. Empty when `end < start`.
pub fn days_inclusive(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    let count = (end - start).num_days() + 1;
    (0..count.max(0)).map(move |offset| start + Duration::days(offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_of_timestamp_is_utc() {
        // 2023-10-11 23:59:59 UTC and one second later
        assert_eq!(day_of_timestamp(1_697_068_799).unwrap(), NaiveDate::from_ymd_opt(2023, 10, 11).unwrap());
        assert_eq!(day_of_timestamp(1_697_068_800).unwrap(), NaiveDate::from_ymd_opt(2023, 10, 12).unwrap());
        assert_eq!(day_of_timestamp(0).unwrap(), NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
    }

    #[test]
    fn test_day_key() {
        let day = NaiveDate::from_ymd_opt(2020, 4, 24).unwrap();
        assert_eq!(day_key(day), "20200424");
    }

    #[test]
    fn test_parse_day() {
        assert_eq!(parse_day("2021-02-28").unwrap(), NaiveDate::from_ymd_opt(2021, 2, 28).unwrap());
        assert!(parse_day("2021-02-30").is_err());
        assert!(parse_day("20210228").is_err());
    }

    #[test]
    fn test_days_inclusive() {
        let start = NaiveDate::from_ymd_opt(2020, 2, 27).unwrap();
        let end = NaiveDate::from_ymd_opt(2020, 3, 1).unwrap();
        let days: Vec<String> = days_inclusive(start, end).map(day_key).collect();
        assert_eq!(days, vec!["20200227", "20200228", "20200229", "20200301"]);

        assert_eq!(days_inclusive(end, start).count(), 0);
        assert_eq!(days_inclusive(start, start).count(), 1);
    }
}
