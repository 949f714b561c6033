use crate::error::AppError;
use std::time::Duration;

/// Parse a duration with an optional unit (ms, s, m, h, d). Bare numbers are seconds.
pub fn parse_duration(time_str: &str) -> Result<Duration, AppError> {
    let time_str = time_str.trim();
    if time_str.is_empty() {
        return Err(AppError::ParseError("Invalid format: empty string".to_string()));
    }

    if let Ok(seconds) = time_str.parse::<f64>() {
        return to_duration(seconds, time_str);
    }

    let split_index = time_str
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(time_str.len());

    let numeric_part = &time_str[..split_index];
    let unit_part = time_str[split_index..].trim().to_lowercase();

    let value = numeric_part
        .parse::<f64>()
        .map_err(|_| AppError::ParseError(format!("Invalid number: {time_str}")))?;

    let seconds = match unit_part.as_str() {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        "d" => value * 86400.0,
        unit => return Err(AppError::ParseError(format!("Invalid unit: {unit}"))),
    };
    to_duration(seconds, time_str)
}

fn to_duration(seconds: f64, input: &str) -> Result<Duration, AppError> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| AppError::ParseError(format!("Invalid duration: {input}")))
}

/// Format a unix timestamp in milliseconds as an age relative to `now_millis`
pub fn format_age(then_millis: u64, now_millis: u64) -> String {
    let seconds = now_millis.saturating_sub(then_millis) as f64 / 1000.0;
    if seconds >= 86400.0 {
        format!("{:.1}d ago", seconds / 86400.0)
    } else if seconds >= 3600.0 {
        format!("{:.1}h ago", seconds / 3600.0)
    } else if seconds >= 60.0 {
        format!("{:.1}m ago", seconds / 60.0)
    } else {
        format!("{seconds:.0}s ago")
    }
}
