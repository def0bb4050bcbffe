//! Shared helpers: hex parsing, address validation, duration parsing and
//! difficulty-to-target conversion.

use std::time::Duration;

use anyhow::{bail, ensure};
use num_bigint::BigUint;

/// 2^256, the numerator of every difficulty-to-target conversion.
///
/// Note this is one more than the largest representable 256-bit value; the
/// division below must therefore run at full precision rather than in a
/// fixed-width integer.
pub fn pow256() -> BigUint {
    BigUint::from(1u8) << 256
}

/// Accepts only `0x`-prefixed 40-digit hex account addresses.
pub fn is_valid_hex_address(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Worker names are limited to `[0-9a-zA-Z-_.]`, at most 192 characters.
pub fn is_valid_worker_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 192
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Parse a hex quantity with or without a `0x` prefix into the low 64 bits.
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

/// Parse an unsigned quantity the way `SetString(s, 0)` does: `0x` prefix
/// means hex, otherwise decimal.
pub fn parse_prefixed_uint(s: &str) -> Option<BigUint> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        BigUint::parse_bytes(hex.as_bytes(), 16)
    } else {
        BigUint::parse_bytes(s.as_bytes(), 10)
    }
}

/// Full 256-bit target for a difficulty, as `0x`-prefixed zero-padded hex.
pub fn get_target_hex(diff: i64) -> String {
    if diff <= 0 {
        return format!("0x{:064x}", 0);
    }
    format!("0x{:064x}", pow256() / BigUint::from(diff as u64))
}

/// Per-job target: the low 8 bytes of the 256-bit target, encoded as
/// little-endian bytes in hex. This is the CryptoNote-family wire convention
/// and must be produced bit-exactly.
pub fn job_target_hex(diff: i64) -> String {
    let word = if diff <= 0 {
        0
    } else {
        (pow256() / BigUint::from(diff as u64))
            .iter_u64_digits()
            .next()
            .unwrap_or(0)
    };
    hex::encode(word.to_le_bytes())
}

/// Parse durations of the form `"90s"`, `"2m"`, `"1h"`, `"500ms"` or
/// compounds such as `"1m30s"`.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    ensure!(!s.is_empty(), "empty duration");

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit_ms: u64 = match c {
            'h' => 3_600_000,
            's' => 1_000,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1
            }
            'm' => 60_000,
            _ => bail!("invalid duration {s:?}"),
        };
        ensure!(!digits.is_empty(), "invalid duration {s:?}");
        let n: u64 = digits.parse()?;
        digits.clear();
        total += Duration::from_millis(n * unit_ms);
    }
    ensure!(digits.is_empty(), "duration {s:?} is missing a unit");
    Ok(total)
}
