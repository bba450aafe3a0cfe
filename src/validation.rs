//! Small reusable predicates shared by configuration checks and content maps.

use std::ops::RangeInclusive;

/// Validates if a given value is within a specified numeric range.
///
/// # Arguments
///
/// * `value` - The value to validate.
/// * `range` - The inclusive range to validate against.
///
/// # Returns
///
/// * `Ok(())` if the value is within the range.
/// * `Err(&'static str)` if the value is outside the range.
pub fn is_in_range<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<(), &'static str> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err("is outside the allowed range")
    }
}

/// Validates if a given string is not empty or whitespace.
pub fn is_not_empty(value: &str) -> Result<(), &'static str> {
    if value.trim().is_empty() {
        Err("cannot be empty")
    } else {
        Ok(())
    }
}

/// Validates that a volume is finite and strictly positive.
pub fn is_positive_volume(volume: f64) -> Result<(), &'static str> {
    if !volume.is_finite() {
        return Err("volume must be a finite number");
    }
    if volume <= 0.0 {
        return Err("volume must be greater than 0");
    }
    Ok(())
}
