//! Validators used by [`crate::config::Settings::validate`].
//!
//! Each helper returns a short static reason; the caller adds the offending key and value.

use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Validates if a given u16 value is a usable listening port.
///
/// By type, the port is already within the 0-65535 range. Port 0 would let the OS pick
/// an ephemeral port, which dashboards cannot discover, so it is rejected.
pub fn is_valid_port(port: u16) -> Result<(), &'static str> {
    if port > 0 {
        Ok(())
    } else {
        Err("Port number must be greater than 0")
    }
}

/// Validates if a given string is a valid IP address to bind to.
pub fn is_valid_ip(ip: &str) -> Result<(), &'static str> {
    ip.parse::<IpAddr>().map(|_| ()).map_err(|_| "Invalid IP address")
}

/// Validates a storage root path.
///
/// The directory does not have to exist yet; it is created at startup.
pub fn is_valid_path(path: &str) -> Result<(), &'static str> {
    if path.trim().is_empty() {
        return Err("File path cannot be empty");
    }
    if path.contains('\0') {
        return Err("File path cannot contain null bytes");
    }
    Ok(())
}

/// Validates if a given value is within a specified numeric range.
pub fn is_in_range<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<(), &'static str> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err("Value is outside the specified range")
    }
}

/// Validates that a count-like setting is at least one.
pub fn is_positive(value: usize) -> Result<(), &'static str> {
    if value >= 1 {
        Ok(())
    } else {
        Err("Value must be at least 1")
    }
}

/// Validates that a configured interval is not zero.
pub fn is_nonzero_duration(value: Duration) -> Result<(), &'static str> {
    if value.is_zero() {
        Err("Interval must be greater than zero")
    } else {
        Ok(())
    }
}

/// Validates a sampling-rate window `min..=max` against the hard ceiling.
pub fn is_valid_rate_bounds(min: u32, max: u32, ceiling: u32) -> Result<(), &'static str> {
    if min == 0 {
        return Err("Minimum rate must be at least 1 Hz");
    }
    if min > max {
        return Err("Minimum rate must not exceed maximum rate");
    }
    if max > ceiling {
        return Err("Maximum rate exceeds the supported ceiling");
    }
    Ok(())
}

/// Validates a string against a closed set of choices.
pub fn is_one_of(value: &str, choices: &[&str]) -> Result<(), &'static str> {
    if choices.contains(&value) {
        Ok(())
    } else {
        Err("Value is not one of the accepted choices")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_zero_rejected() {
        assert!(is_valid_port(0).is_err());
        assert!(is_valid_port(8765).is_ok());
    }

    #[test]
    fn ip_parsing() {
        assert!(is_valid_ip("0.0.0.0").is_ok());
        assert!(is_valid_ip("::1").is_ok());
        assert!(is_valid_ip("localhost").is_err());
    }

    #[test]
    fn rate_bounds() {
        assert!(is_valid_rate_bounds(100, 1000, 10_000).is_ok());
        assert!(is_valid_rate_bounds(0, 1000, 10_000).is_err());
        assert!(is_valid_rate_bounds(500, 100, 10_000).is_err());
        assert!(is_valid_rate_bounds(100, 20_000, 10_000).is_err());
    }

    #[test]
    fn blank_path_rejected() {
        assert!(is_valid_path("   ").is_err());
        assert!(is_valid_path("readings").is_ok());
    }

    #[test]
    fn choices() {
        assert!(is_one_of("json", &["pretty", "json"]).is_ok());
        assert!(is_one_of("xml", &["pretty", "json"]).is_err());
    }
}
