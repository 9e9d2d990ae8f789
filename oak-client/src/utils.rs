//! Shared utility functions.

use chrono::{TimeZone, Utc};

/// Format a Unix timestamp (seconds) as a human-readable string.
pub fn format_timestamp_secs(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "invalid".to_string())
}

/// Read a token argument; `-` means stdin.
pub fn read_token_arg(arg: &str) -> std::io::Result<String> {
    if arg != "-" {
        return Ok(arg.trim().to_string());
    }
    let mut buf = String::new();
    std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf)?;
    Ok(buf.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp_secs(0), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_timestamp_secs(1_700_000_000), "2023-11-14 22:13:20 UTC");
    }

    #[test]
    fn test_token_arg_trimmed() {
        assert_eq!(read_token_arg("  abc-def|ghi\n").unwrap(), "abc-def|ghi");
    }
}
