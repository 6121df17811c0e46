use chrono::Duration;

/// Lifetime used when a duration string cannot be parsed.
pub const DEFAULT_TOKEN_LIFETIME: &str = "1d";

/// Parse a `<digits><unit>` lifetime where unit is `d`, `h` or `m`.
///
/// Returns `None` for anything else, including signs, whitespace and
/// values that overflow `chrono::Duration`.
pub fn try_parse_duration(s: &str) -> Option<Duration> {
    let unit = s.chars().last()?;
    let digits = &s[..s.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: i64 = digits.parse().ok()?;
    match unit {
        'd' => Duration::try_days(value),
        'h' => Duration::try_hours(value),
        'm' => Duration::try_minutes(value),
        _ => None,
    }
}

/// Parse a lifetime string, falling back to one day.
pub fn parse_duration(s: &str) -> Duration {
    try_parse_duration(s).unwrap_or_else(|| Duration::days(1))
}
