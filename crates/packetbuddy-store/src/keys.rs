//! Day and month bucket keys.
//!
//! Aggregates are keyed by `YYYY-MM-DD` and `YYYY-MM` strings so SQLite
//! can compare them lexically. The same helpers are used by the replication
//! engine when it groups samples, so local and remote buckets line up.

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Month};

use crate::error::{Error, Result};

/// `YYYY-MM-DD`.
pub const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Format a day key.
pub fn date_key(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// Format a month key.
pub fn month_key(date: Date) -> String {
    format!("{:04}-{:02}", date.year(), u8::from(date.month()))
}

/// Parse a `YYYY-MM-DD` day key.
pub fn parse_date(key: &str) -> Result<Date> {
    Date::parse(key, DATE_FORMAT).map_err(|e| Error::InvalidDate(format!("{}: {}", key, e)))
}

/// Validate a `YYYY-MM` month key, returning the first day of that month.
pub fn parse_month(key: &str) -> Result<Date> {
    if key.len() != 7 {
        return Err(Error::InvalidDate(format!("{}: expected YYYY-MM", key)));
    }
    parse_date(&format!("{}-01", key))
}

/// The first day of the month `months` months before `date`'s month.
pub fn months_back(date: Date, months: u32) -> Result<Date> {
    let index = date.year() * 12 + i32::from(u8::from(date.month())) - 1 - months as i32;
    let year = index.div_euclid(12);
    let month = Month::try_from((index.rem_euclid(12) + 1) as u8)
        .map_err(|e| Error::InvalidDate(e.to_string()))?;
    Date::from_calendar_date(year, month, 1).map_err(|e| Error::InvalidDate(e.to_string()))
}
