//! Parsing of memory quantities declared by tasks.

use std::str::FromStr;

/// A storage unit accepted in a task's `memory` runtime value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StorageUnit {
    /// Bytes.
    #[default]
    Bytes,
    /// Kilobytes (10^3 bytes).
    Kilobytes,
    /// Megabytes (10^6 bytes).
    Megabytes,
    /// Gigabytes (10^9 bytes).
    Gigabytes,
    /// Terabytes (10^12 bytes).
    Terabytes,
    /// Kibibytes (2^10 bytes).
    Kibibytes,
    /// Mebibytes (2^20 bytes).
    Mebibytes,
    /// Gibibytes (2^30 bytes).
    Gibibytes,
    /// Tebibytes (2^40 bytes).
    Tebibytes,
}

impl StorageUnit {
    /// The number of bytes in one of this unit.
    pub fn multiplier(&self) -> u64 {
        match self {
            Self::Bytes => 1,
            Self::Kilobytes => 1_000,
            Self::Megabytes => 1_000_000,
            Self::Gigabytes => 1_000_000_000,
            Self::Terabytes => 1_000_000_000_000,
            Self::Kibibytes => bytesize::KIB,
            Self::Mebibytes => bytesize::MIB,
            Self::Gibibytes => bytesize::GIB,
            Self::Tebibytes => bytesize::TIB,
        }
    }
}

impl FromStr for StorageUnit {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "B" => Ok(Self::Bytes),
            "KB" | "K" => Ok(Self::Kilobytes),
            "MB" | "M" => Ok(Self::Megabytes),
            "GB" | "G" => Ok(Self::Gigabytes),
            "TB" | "T" => Ok(Self::Terabytes),
            "KiB" | "Ki" => Ok(Self::Kibibytes),
            "MiB" | "Mi" => Ok(Self::Mebibytes),
            "GiB" | "Gi" => Ok(Self::Gibibytes),
            "TiB" | "Ti" => Ok(Self::Tebibytes),
            _ => Err(()),
        }
    }
}

/// Converts a memory string such as `4 GiB`, `512MB` or `1.5 GiB` to bytes.
///
/// Fractional quantities are rounded up to the next whole byte. Returns `None`
/// for malformed strings, negative quantities, or results that do not fit in
/// an unsigned 64-bit integer.
pub fn convert_unit_string(s: &str) -> Option<u64> {
    let s = s.trim();
    let index = s.find(|c: char| c.is_ascii_alphabetic())?;
    let (quantity, unit) = s.split_at(index);
    let unit: StorageUnit = unit.trim().parse().ok()?;
    let quantity = quantity.trim();

    if let Ok(n) = quantity.parse::<u64>() {
        return n.checked_mul(unit.multiplier());
    }

    let n = quantity.parse::<f64>().ok()?;
    if !n.is_finite() || n < 0.0 {
        return None;
    }

    let bytes = (n * unit.multiplier() as f64).ceil();
    if bytes > u64::MAX as f64 {
        return None;
    }

    Some(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_quantities() {
        assert_eq!(convert_unit_string("4 GiB"), Some(4 * 1024 * 1024 * 1024));
        assert_eq!(convert_unit_string("512MB"), Some(512_000_000));
        assert_eq!(convert_unit_string("1 B"), Some(1));
        assert_eq!(convert_unit_string("  2 Ki "), Some(2048));
    }

    #[test]
    fn fractional_quantities_round_up() {
        assert_eq!(convert_unit_string("1.5 GiB"), Some(1_610_612_736));
        assert_eq!(convert_unit_string("0.0001 KB"), Some(1));
    }

    #[test]
    fn invalid_strings() {
        assert_eq!(convert_unit_string("100"), None);
        assert_eq!(convert_unit_string("100 meows"), None);
        assert_eq!(convert_unit_string("GiB"), None);
        assert_eq!(convert_unit_string("-1 GiB"), None);
        assert_eq!(convert_unit_string("100000000 TiB"), None);
    }
}
