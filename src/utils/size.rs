//! Human-readable size parsing for --memory / --storage flags.

use anyhow::Result;

use crate::error::Error;

/// Parses `1G`, `512M`, `2GiB`, `1048576` into bytes. Suffixes are
/// binary multiples (K = 1024), case-insensitive, with optional `B`/`iB`.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Invalid("empty size".to_string()).into());
    }

    let digits_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(digits_end);
    let value: f64 = num
        .parse()
        .map_err(|_| Error::Invalid(format!("unparseable size {s:?}")))?;

    let mult: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        other => {
            return Err(Error::Invalid(format!("unknown size suffix {other:?} in {s:?}")).into())
        }
    };
    Ok((value * mult as f64) as u64)
}

/// Formats a byte count with a binary-multiple suffix for display.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        assert_eq!(parse_size("512M").unwrap(), 512 << 20);
        assert_eq!(parse_size("2GiB").unwrap(), 2 << 30);
        assert_eq!(parse_size("10g").unwrap(), 10 << 30);
        assert_eq!(parse_size("1.5K").unwrap(), 1536);
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "abc", "1X", "G1"] {
            let err = parse_size(bad).unwrap_err();
            assert!(
                matches!(err.downcast_ref::<Error>(), Some(Error::Invalid(_))),
                "{bad:?} should be Invalid"
            );
        }
    }

    #[test]
    fn formats_for_display() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(1 << 30), "1.0GiB");
        assert_eq!(format_size(1536 << 10), "1.5MiB");
    }
}
