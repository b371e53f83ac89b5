use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};

/// Get the last day of a given month.
pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap() - Duration::days(1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap() - Duration::days(1)
    }
}

/// Inclusive [start, end] datetime window covering a whole calendar month.
pub fn month_window(year: i32, month: u32) -> (NaiveDateTime, NaiveDateTime) {
    let start = NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let end = last_day_of_month(year, month).and_hms_opt(23, 59, 59).unwrap();
    (start, end)
}

/// Inclusive [start, end] datetime window covering a single day.
pub fn day_window(day: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    (
        day.and_hms_opt(0, 0, 0).unwrap(),
        day.and_hms_opt(23, 59, 59).unwrap(),
    )
}

/// Format a datetime the way the platform's date parameters expect.
pub fn format_api_datetime(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Number of days in a month.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    last_day_of_month(year, month).day()
}
