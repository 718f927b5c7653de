// Utility functions used across the codebase
// Centralized to avoid duplication

use crate::constants::hashing::ID_HEX_LEN;
use crate::constants::units::{GIB, KIB, MIB};
use sha2::{Digest, Sha256};

/// Format bytes as human-readable string with appropriate unit
///
/// Automatically selects the best unit (B, KiB, MiB, GiB) based on size.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.0} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Compute the short deterministic id used for assets, events and jobs
///
/// # Arguments
/// * `input` - The material to hash (e.g. an absolute path, or
///   `asset_id:event_type:job_id`)
///
/// # Returns
/// The first 16 hex characters of the SHA-256 digest
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..ID_HEX_LEN].to_string()
}

/// Parse time string in HH:MM:SS.MS or MM:SS or plain-seconds format
///
/// # Arguments
/// * `time_str` - Time string like "00:01:23.45", "01:23" or "83.45"
///
/// # Returns
/// Time in seconds as f64, or 0.0 when unparseable
pub fn parse_time_to_seconds(time_str: &str) -> f64 {
    let parts: Vec<&str> = time_str.split(':').collect();
    match parts.len() {
        3 => {
            let hours: f64 = parts[0].parse().unwrap_or(0.0);
            let minutes: f64 = parts[1].parse().unwrap_or(0.0);
            let seconds: f64 = parts[2].parse().unwrap_or(0.0);
            hours * 3600.0 + minutes * 60.0 + seconds
        }
        2 => {
            let minutes: f64 = parts[0].parse().unwrap_or(0.0);
            let seconds: f64 = parts[1].parse().unwrap_or(0.0);
            minutes * 60.0 + seconds
        }
        _ => time_str.parse().unwrap_or(0.0),
    }
}

/// Parse a frame rate fraction like "30000/1001" into frames per second
pub fn parse_fps(fps_str: &str) -> Option<f64> {
    if let Some((num, den)) = fps_str.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            return None;
        }
        Some(num / den)
    } else {
        fps_str.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1 KiB");
        assert_eq!(format_bytes(1024 * 1024), "1.0 MiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GiB");
    }

    #[test]
    fn test_short_hash_is_stable() {
        let a = short_hash("/rec/clip.mkv");
        let b = short_hash("/rec/clip.mkv");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        // Different input, different id
        assert_ne!(a, short_hash("/rec/clip2.mkv"));
    }

    #[test]
    fn test_parse_time_to_seconds() {
        assert_eq!(parse_time_to_seconds("00:01:23.45"), 83.45);
        assert_eq!(parse_time_to_seconds("01:00:00.00"), 3600.0);
        assert_eq!(parse_time_to_seconds("01:30"), 90.0);
        assert_eq!(parse_time_to_seconds("42.5"), 42.5);
        assert_eq!(parse_time_to_seconds("garbage"), 0.0);
    }

    #[test]
    fn test_parse_fps() {
        assert_eq!(parse_fps("25/1"), Some(25.0));
        assert!((parse_fps("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_fps("60"), Some(60.0));
        assert_eq!(parse_fps("25/0"), None);
        assert_eq!(parse_fps("n/a"), None);
    }
}
