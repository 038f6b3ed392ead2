//! Memory size parsing and formatting for worker memory limits.
//!
//! Accepts human-readable sizes such as "2G" or "1536M" on the command line.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Memory size in bytes with parsing and formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemorySize(u64);

impl MemorySize {
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * MIB)
    }

    /// Size in mebibytes (MiB), truncated.
    pub const fn as_mib(&self) -> u64 {
        self.0 / MIB
    }
}

#[derive(Debug, Clone, Error)]
#[error("invalid memory size: {0}")]
pub struct MemoryError(String);

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Bytes per unit suffix; no suffix means MiB.
fn unit_bytes(suffix: &str) -> Option<u64> {
    match suffix.to_ascii_lowercase().as_str() {
        "k" | "kb" | "kib" => Some(KIB),
        "" | "m" | "mb" | "mib" => Some(MIB),
        "g" | "gb" | "gib" => Some(GIB),
        _ => None,
    }
}

impl FromStr for MemorySize {
    type Err = MemoryError;

    /// Parse sizes like "512", "512M", "1.5GiB" or "2048k" (case insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);
        if number.is_empty() {
            return Err(MemoryError(format!("expected a number, got '{}'", s)));
        }

        let amount: f64 = number
            .parse()
            .map_err(|_| MemoryError(format!("'{}' is not a number", number)))?;
        let unit = unit_bytes(suffix.trim())
            .ok_or_else(|| MemoryError(format!("unknown unit '{}'", suffix.trim())))?;

        Ok(Self((amount * unit as f64) as u64))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            bytes if bytes >= GIB && bytes % GIB == 0 => write!(f, "{} GiB", bytes / GIB),
            bytes if bytes >= GIB => write!(f, "{:.1} GiB", bytes as f64 / GIB as f64),
            bytes if bytes >= MIB => write!(f, "{} MiB", bytes / MIB),
            bytes => write!(f, "{} bytes", bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suffixes() {
        assert_eq!("512".parse::<MemorySize>().unwrap().as_mib(), 512);
        assert_eq!("512M".parse::<MemorySize>().unwrap().as_mib(), 512);
        assert_eq!("2g".parse::<MemorySize>().unwrap().as_mib(), 2048);
        assert_eq!("1.5GiB".parse::<MemorySize>().unwrap().as_mib(), 1536);
        assert_eq!("2048k".parse::<MemorySize>().unwrap().as_mib(), 2);
    }

    #[test]
    fn test_parse_errors() {
        assert!("".parse::<MemorySize>().is_err());
        assert!("100b".parse::<MemorySize>().is_err());
        assert!("G".parse::<MemorySize>().is_err());
        assert!("12X".parse::<MemorySize>().is_err());
        assert!("1.2.3G".parse::<MemorySize>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(MemorySize::from_mib(2048).to_string(), "2 GiB");
        assert_eq!(MemorySize::from_mib(1536).to_string(), "1.5 GiB");
        assert_eq!(MemorySize::from_mib(300).to_string(), "300 MiB");
        assert_eq!(MemorySize::from_mib(0).to_string(), "0 bytes");
    }
}
