//! Human readable sizes (`10g`, `512M`, `1.5GiB`) as used in disk quota specs.
//!
//! Units are 1024-based and case-insensitive. A bare number is a byte count.

const KILOBYTE: u64 = 1 << 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SizeError {
    #[error("missing numeric value")]
    MissingValue,
    #[error("invalid numeric value `{0}`")]
    InvalidValue(String),
    #[error("unknown unit `{0}`")]
    UnknownUnit(String),
    #[error("size must be positive")]
    NotPositive,
    #[error("size overflows 64 bits")]
    Overflow,
}

fn unit_multiplier(unit: &str) -> Option<u64> {
    let unit = unit.to_ascii_uppercase();
    let unit = unit
        .strip_suffix("IB")
        .or_else(|| unit.strip_suffix('B'))
        .unwrap_or(&unit);

    let shift = match unit {
        "" => 0,
        "K" => 10,
        "M" => 20,
        "G" => 30,
        "T" => 40,
        "P" => 50,
        "E" => 60,
        _ => return None,
    };
    Some(1u64 << shift)
}

/// Parses a human readable size into bytes.
///
/// ```
/// # use creo_runtime::quota::to_bytes;
/// assert_eq!(to_bytes("10g"), Ok(10 * 1024 * 1024 * 1024));
/// assert_eq!(to_bytes("1.5K"), Ok(1536));
/// assert_eq!(to_bytes("4096"), Ok(4096));
/// ```
pub fn to_bytes(size: &str) -> Result<u64, SizeError> {
    let size = size.trim();
    let split = size
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(size.len());
    let (value, unit) = size.split_at(split);
    if value.is_empty() {
        return Err(SizeError::MissingValue);
    }

    let unit = unit.trim();
    let multiplier = unit_multiplier(unit).ok_or_else(|| SizeError::UnknownUnit(unit.to_owned()))?;

    let bytes = if value.contains('.') {
        let value: f64 = value
            .parse()
            .map_err(|_| SizeError::InvalidValue(value.to_owned()))?;
        let bytes = value * multiplier as f64;
        if bytes >= u64::MAX as f64 {
            return Err(SizeError::Overflow);
        }
        bytes as u64
    } else {
        let value: u64 = value
            .parse()
            .map_err(|_| SizeError::InvalidValue(value.to_owned()))?;
        value.checked_mul(multiplier).ok_or(SizeError::Overflow)?
    };

    if bytes == 0 {
        return Err(SizeError::NotPositive);
    }

    Ok(bytes)
}

/// Parses a human readable size into whole kilobytes, the unit quota tools expect.
///
/// Sizes below one kilobyte are rejected: a zero block limit means "unlimited" to
/// `setquota` and `xfs_quota`.
pub fn to_kilobytes(size: &str) -> Result<u64, SizeError> {
    let kb = to_bytes(size)? / KILOBYTE;
    if kb == 0 {
        return Err(SizeError::NotPositive);
    }
    Ok(kb)
}
