//! Cell-level normalization shared by uploads, form submissions and rows read
//! back from a backend. Every path into a [`crate::records::Record`] goes
//! through these functions so that natural keys compare on one representation.

use chrono::{NaiveDate, NaiveTime};

use crate::errors::{AppError, AppResult};

pub fn text(value: &str) -> String {
    value.trim().to_string()
}

/// Parses whole numbers written as `21`, `21.0` or `21,0`.
pub fn integer(column: &str, value: &str) -> AppResult<i64> {
    let trimmed = value.trim();
    if let Ok(parsed) = trimmed.parse::<i64>() {
        return Ok(parsed);
    }
    let float = float(column, trimmed)?;
    integral(float).ok_or_else(|| AppError::invalid_field(column, value, "expected a whole number"))
}

/// Parses decimals, accepting a decimal comma when no dot is present.
pub fn float(column: &str, value: &str) -> AppResult<f64> {
    let trimmed = value.trim();
    let candidate = if trimmed.contains(',') && !trimmed.contains('.') {
        trimmed.replace(',', ".")
    } else {
        trimmed.to_string()
    };
    candidate
        .parse::<f64>()
        .ok()
        .filter(|parsed| parsed.is_finite())
        .ok_or_else(|| AppError::invalid_field(column, value, "expected a number"))
}

pub fn optional_float(column: &str, value: &str) -> AppResult<Option<f64>> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    float(column, value).map(Some)
}

/// Returns `Some` when the float holds an exact integer that fits in `i64`.
pub fn integral(value: f64) -> Option<i64> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
        Some(value as i64)
    } else {
        None
    }
}

/// Codes such as plot identifiers arrive either as text (`T1`) or as numbers
/// exported by a spreadsheet (`12.0`); numeric codes keep their integer spelling.
pub fn code(value: &str) -> String {
    let trimmed = value.trim();
    match trimmed.parse::<f64>().ok().and_then(integral) {
        Some(number) if !trimmed.starts_with('0') || trimmed == "0" => number.to_string(),
        _ => trimmed.to_string(),
    }
}

/// Parses `2024-01-05`, `2024-1-5`, `2024/01/05`, `05/01/2024` (day first) and
/// any of those followed by a time component.
pub fn date(column: &str, value: &str) -> AppResult<NaiveDate> {
    let trimmed = value.trim();
    let date_part = trimmed
        .split(|c: char| c == 'T' || c.is_whitespace())
        .next()
        .unwrap_or_default();
    let parts: Vec<&str> = date_part.split(|c| c == '-' || c == '/').collect();
    let invalid = || AppError::invalid_field(column, value, "expected a calendar date");
    if parts.len() != 3 {
        return Err(invalid());
    }

    let numbers = parts
        .iter()
        .map(|part| part.parse::<u32>().map_err(|_| invalid()))
        .collect::<AppResult<Vec<u32>>>()?;
    let (year, month, day) = if parts[0].len() == 4 {
        (numbers[0], numbers[1], numbers[2])
    } else if parts[2].len() == 4 {
        (numbers[2], numbers[1], numbers[0])
    } else {
        return Err(invalid());
    };

    let year = i32::try_from(year).map_err(|_| invalid())?;
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)
}

pub fn optional_time(column: &str, value: &str) -> AppResult<Option<NaiveTime>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .map(Some)
        .map_err(|_| AppError::invalid_field(column, value, "expected HH:MM or HH:MM:SS"))
}

/// Splits a multi-value cell (`"Ana, Pedro"`) into trimmed, non-empty entries.
pub fn list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Header matching is case-insensitive and ignores surrounding whitespace.
pub fn header(value: &str) -> String {
    value.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_accept_spreadsheet_spellings() {
        assert_eq!(integer("sector", "21").unwrap(), 21);
        assert_eq!(integer("sector", " 21.0 ").unwrap(), 21);
        assert_eq!(integer("sector", "21,0").unwrap(), 21);
        assert!(integer("sector", "21.5").is_err());
        assert!(integer("sector", "abc").is_err());
    }

    #[test]
    fn dates_normalize_to_one_calendar_day() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        for input in [
            "2024-01-05",
            "2024-1-5",
            "2024/01/05",
            "05/01/2024",
            "2024-01-05 00:00:00",
            "2024-01-05T13:45:00",
        ] {
            assert_eq!(date("date", input).unwrap(), expected, "{input}");
        }
        assert!(date("date", "2024-13-01").is_err());
        assert!(date("date", "yesterday").is_err());
        assert!(date("date", "").is_err());
    }

    #[test]
    fn codes_drop_spurious_decimals() {
        assert_eq!(code("12.0"), "12");
        assert_eq!(code(" T1 "), "T1");
        assert_eq!(code("012"), "012");
        assert_eq!(code("0"), "0");
    }

    #[test]
    fn floats_accept_decimal_comma() {
        assert_eq!(float("area", "12,5").unwrap(), 12.5);
        assert_eq!(optional_float("area", "  ").unwrap(), None);
        assert!(float("area", "NaN").is_err());
    }

    #[test]
    fn times_and_lists() {
        assert_eq!(
            optional_time("hours", "02:30").unwrap(),
            NaiveTime::from_hms_opt(2, 30, 0)
        );
        assert_eq!(optional_time("hours", "").unwrap(), None);
        assert_eq!(list("Ana, Pedro;  ,Talita"), vec!["Ana", "Pedro", "Talita"]);
    }
}
