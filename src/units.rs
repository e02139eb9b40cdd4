//! IEC byte-size parsing for chunk-size parameters ("50M", "1G", "300MiB").

use anyhow::{bail, Result};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Accepts a plain byte count or a number with a K/M/G/T suffix (optionally
/// written as `KB`/`KiB` etc.). Multipliers are binary. Whitespace between
/// number and unit is tolerated.
pub fn parse_bytes(input: &str) -> Result<u64> {
    let input = input.trim();
    if input.is_empty() {
        bail!("empty size");
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);
    if number.is_empty() {
        bail!("invalid size {input:?}");
    }
    let value: f64 = number.parse()?;

    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => KIB,
        "M" | "MB" | "MIB" => MIB,
        "G" | "GB" | "GIB" => GIB,
        "T" | "TB" | "TIB" => 1024 * GIB,
        other => bail!("unknown size unit {other:?}"),
    };

    Ok((value * multiplier as f64) as u64)
}

pub fn chunk_count(total: u64, chunk_size: u64) -> u32 {
    total.div_ceil(chunk_size) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_numbers() {
        assert_eq!(parse_bytes("0").unwrap(), 0);
        assert_eq!(parse_bytes("1048576").unwrap(), MIB);
    }

    #[test]
    fn parses_suffixed_sizes() {
        assert_eq!(parse_bytes("50M").unwrap(), 50 * MIB);
        assert_eq!(parse_bytes("300M").unwrap(), 300 * MIB);
        assert_eq!(parse_bytes("1G").unwrap(), GIB);
        assert_eq!(parse_bytes("2KiB").unwrap(), 2 * KIB);
        assert_eq!(parse_bytes("6 MB").unwrap(), 6 * MIB);
        assert_eq!(parse_bytes("1.5K").unwrap(), 1536);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("M").is_err());
        assert!(parse_bytes("12Q").is_err());
        assert!(parse_bytes("-1M").is_err());
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(13 * MIB, 6 * MIB), 3);
        assert_eq!(chunk_count(12 * MIB, 6 * MIB), 2);
        assert_eq!(chunk_count(1, 6 * MIB), 1);
        assert_eq!(chunk_count(0, 6 * MIB), 0);
    }
}
