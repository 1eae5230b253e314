// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Helpers for the textual addresses and dates the debugger prints.

use std::convert::TryFrom;

use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime, UtcOffset};

use crate::PointerWidth;

/// Remove the backtick the debugger puts in the middle of 64-bit addresses.
pub fn strip_backticks(text: &str) -> String {
    text.chars().filter(|&c| c != '`').collect()
}

/// Parse a hexadecimal address, with or without a `0x` prefix or backticks.
pub fn parse_hex(text: &str) -> Option<u64> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    let digits = strip_backticks(digits);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(&digits, 16).ok()
}

// Drop the prefix, case and leading zeros so two spellings of one address compare equal.
fn normalize_address(text: &str) -> String {
    let text = text.trim();
    let text = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    text.to_ascii_uppercase().trim_start_matches('0').to_owned()
}

/// Whether two textual addresses denote the same value.
///
/// This is a textual comparison, so it also works for tokens that
/// are not valid hex (which then only match themselves).
pub fn same_address(a: &str, b: &str) -> bool {
    normalize_address(a) == normalize_address(b)
}

/// Whether an address token holds anything other than zeros.
pub fn is_nonzero_address(text: &str) -> bool {
    !normalize_address(text).is_empty()
}

/// Format an address padded to the width of a pointer.
pub fn format_address(address: u64, width: PointerWidth) -> String {
    match width {
        PointerWidth::Bits32 => format!("{address:#010x}"),
        PointerWidth::Bits64 => format!("{address:#018x}"),
    }
}

/// Format a module link timestamp (seconds since the epoch, in hex) as an RFC 3339 UTC date.
pub fn format_timestamp(hex: &str) -> Option<String> {
    let seconds = u32::try_from(parse_hex(hex)?).ok()?;
    OffsetDateTime::from_unix_timestamp(seconds as i64)
        .ok()
        .and_then(|datetime| datetime.format(&Rfc3339).ok())
}

/// Normalize a debugger session time to RFC 3339 in UTC.
///
/// The debugger prints something like `Thu Mar 14 10:22:33.000 2019 (UTC + 1:00)`.
/// Text that doesn't look like that is returned trimmed but otherwise untouched.
pub fn normalize_session_time(text: &str) -> String {
    parse_session_time(text)
        .and_then(|datetime| datetime.format(&Rfc3339).ok())
        .unwrap_or_else(|| text.trim().to_owned())
}

fn parse_session_time(text: &str) -> Option<OffsetDateTime> {
    let (stamp, zone) = match text.split_once('(') {
        Some((stamp, zone)) => (stamp, Some(zone)),
        None => (text, None),
    };
    let mut parts = stamp.split_whitespace();
    let _weekday = parts.next()?;
    let month = month_from_abbreviation(parts.next()?)?;
    let day: u8 = parts.next()?.parse().ok()?;
    let clock = parts.next()?;
    let year: i32 = parts.next()?.parse().ok()?;

    let mut fields = clock.split(':');
    let hour: u8 = fields.next()?.parse().ok()?;
    let minute: u8 = fields.next()?.parse().ok()?;
    let seconds = fields.next()?;
    let (second, millisecond) = seconds.split_once('.').unwrap_or((seconds, "0"));
    let second: u8 = second.parse().ok()?;
    let millisecond: u16 = millisecond.parse().ok()?;

    let offset = match zone {
        Some(zone) => parse_utc_offset(zone)?,
        None => UtcOffset::UTC,
    };
    let local = Date::from_calendar_date(year, month, day)
        .ok()?
        .with_hms_milli(hour, minute, second, millisecond)
        .ok()?;
    Some(local.assume_offset(offset).to_offset(UtcOffset::UTC))
}

// `UTC + 1:00)`, `UTC - 5:30)` or just `UTC)`.
fn parse_utc_offset(zone: &str) -> Option<UtcOffset> {
    let zone = zone.trim().trim_end_matches(')');
    let offset: String = zone
        .trim()
        .strip_prefix("UTC")?
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if offset.is_empty() {
        return Some(UtcOffset::UTC);
    }
    let (sign, offset) = if let Some(offset) = offset.strip_prefix('+') {
        (1, offset)
    } else if let Some(offset) = offset.strip_prefix('-') {
        (-1, offset)
    } else {
        return None;
    };
    let (hours, minutes) = offset.split_once(':').unwrap_or((offset, "0"));
    let hours: i8 = hours.parse().ok()?;
    let minutes: i8 = minutes.parse().ok()?;
    UtcOffset::from_hms(hours.checked_mul(sign)?, minutes.checked_mul(sign)?, 0).ok()
}

fn month_from_abbreviation(name: &str) -> Option<Month> {
    let month = match name {
        "Jan" => Month::January,
        "Feb" => Month::February,
        "Mar" => Month::March,
        "Apr" => Month::April,
        "May" => Month::May,
        "Jun" => Month::June,
        "Jul" => Month::July,
        "Aug" => Month::August,
        "Sep" => Month::September,
        "Oct" => Month::October,
        "Nov" => Month::November,
        "Dec" => Month::December,
        _ => return None,
    };
    Some(month)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("00007ffb`1f6a4fd4"), Some(0x7ffb_1f6a_4fd4));
        assert_eq!(parse_hex("0x77001234"), Some(0x7700_1234));
        assert_eq!(parse_hex("  c0000005 "), Some(0xc000_0005));
        assert_eq!(parse_hex(""), None);
        assert_eq!(parse_hex("0x"), None);
        assert_eq!(parse_hex("+12"), None);
        assert_eq!(parse_hex("ntdll"), None);
    }

    #[test]
    fn test_same_address() {
        assert!(same_address("0x0019F5A8", "0019f5a8"));
        assert!(same_address("19f5a8", "0x0019F5A8"));
        assert!(!same_address("0019f5a8", "0019f5ac"));
        assert!(same_address("00000000", "0x0"));
    }

    #[test]
    fn test_is_nonzero_address() {
        assert!(!is_nonzero_address("00000000"));
        assert!(!is_nonzero_address("0x0000000000000000"));
        assert!(!is_nonzero_address(""));
        assert!(is_nonzero_address("0x0019f5a8"));
    }

    #[test]
    fn test_format_address() {
        assert_eq!(format_address(0x1234, PointerWidth::Bits32), "0x00001234");
        assert_eq!(
            format_address(0x7ffb_1f6a_4fd4, PointerWidth::Bits64),
            "0x00007ffb1f6a4fd4"
        );
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(
            format_timestamp("5C8A1F2B").as_deref(),
            Some("2019-03-14T09:30:19Z")
        );
        assert_eq!(format_timestamp("zzz"), None);
    }

    #[test]
    fn test_normalize_session_time() {
        let normalized = normalize_session_time("Thu Mar 14 10:22:33.000 2019 (UTC + 1:00)");
        assert!(normalized.starts_with("2019-03-14T09:22:33"), "{normalized}");

        let normalized = normalize_session_time("Mon Jan  7 16:01:24.000 2019 (UTC - 5:00)");
        assert!(normalized.starts_with("2019-01-07T21:01:24"), "{normalized}");

        assert_eq!(normalize_session_time("  not a date "), "not a date");
    }

    #[test]
    fn test_normalize_session_time_bad_offset() {
        // Negating the hours would overflow.
        let text = "Thu Mar 14 10:22:33.000 2019 (UTC - -128:00)";
        assert_eq!(normalize_session_time(&format!(" {text} ")), text);

        let text = "Thu Mar 14 10:22:33.000 2019 (UTC + 99:00)";
        assert_eq!(normalize_session_time(text), text);
    }
}
