use crate::error::AppError;

const KIB: u64 = 1024;

/// Binary units, largest first, with the spellings accepted on input
const UNITS: &[(u64, &str, &[&str])] = &[
    (KIB * KIB * KIB * KIB, "TB", &["tb", "t", "tib"]),
    (KIB * KIB * KIB, "GB", &["gb", "g", "gib"]),
    (KIB * KIB, "MB", &["mb", "m", "mib"]),
    (KIB, "KB", &["kb", "k", "kib"]),
    (1, "B", &["b", ""]),
];

/// Parse a size such as `"512"`, `"64KB"` or `"1.5 GiB"` into bytes.
///
/// A bare number is a byte count. Fractions are allowed with a unit and
/// truncate to whole bytes.
pub fn parse_size(input: &str) -> Result<u64, AppError> {
    let normalized = input.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(AppError::ParseError("Invalid format: empty string".to_string()));
    }

    let split = normalized
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(normalized.len());
    let (number, unit) = normalized.split_at(split);
    let unit = unit.trim();

    let multiplier = UNITS
        .iter()
        .find(|(_, _, aliases)| aliases.contains(&unit))
        .map(|(factor, _, _)| *factor)
        .ok_or_else(|| AppError::ParseError(format!("Invalid unit: {unit}")))?;

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| AppError::ParseError(format!("Size out of range: {input}")));
    }

    if unit.is_empty() {
        return Err(AppError::ParseError(format!("Invalid number: {input}")));
    }
    let value = number
        .parse::<f64>()
        .map_err(|_| AppError::ParseError(format!("Invalid number: {input}")))?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(AppError::ParseError(format!("Size out of range: {input}")));
    }
    Ok(bytes as u64)
}

/// Render a byte count with the largest unit that keeps it at or above one.
pub fn format_bytes(bytes: u64) -> String {
    match UNITS.iter().find(|(factor, _, _)| *factor > 1 && bytes >= *factor) {
        Some((factor, label, _)) => format!("{:.2} {label}", bytes as f64 / *factor as f64),
        None => format!("{bytes} B"),
    }
}
