//! Kubernetes resource quantity parsing
//!
//! Converts the string form of a `Quantity` ("100m", "2", "512Mi", "1.5Gi",
//! "1e3") into plain numbers for accounting. Memory is counted in bytes and
//! cpu in millicores; fractional results round up the way the apiserver
//! canonicalizes them.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::{Error, Result};

// Longest suffixes first so "Mi" wins over "M"
const SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

// Absorbs float noise such as 0.1 * 1000 = 100.00000000000001
const ROUNDING_SLACK: f64 = 1e-9;

/// Parse a quantity string into its value in base units
pub fn parse_quantity(raw: &str) -> Result<f64> {
    let qty = raw.trim();
    if qty.is_empty() {
        return Err(Error::validation("empty quantity"));
    }

    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| qty.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((qty, 1.0));

    let value = number
        .parse::<f64>()
        .map_err(|_| Error::validation(format!("invalid quantity '{raw}'")))?;

    if !value.is_finite() || value < 0.0 {
        return Err(Error::validation(format!(
            "quantity '{raw}' must be a finite non-negative number"
        )));
    }

    Ok(value * multiplier)
}

fn round_up(value: f64) -> u64 {
    let rounded = (value - ROUNDING_SLACK).ceil();
    if rounded <= 0.0 {
        0
    } else {
        rounded as u64
    }
}

/// Memory quantity in bytes ("512Mi" -> 536870912)
pub fn memory_bytes(qty: &Quantity) -> Result<u64> {
    parse_quantity(&qty.0).map(round_up)
}

/// CPU quantity in millicores ("100m" -> 100, "2" -> 2000)
pub fn cpu_millis(qty: &Quantity) -> Result<u64> {
    parse_quantity(&qty.0).map(|cores| round_up(cores * 1000.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn cpu_accepts_millicores_and_cores() {
        assert_eq!(cpu_millis(&q("100m")).unwrap(), 100);
        assert_eq!(cpu_millis(&q("2")).unwrap(), 2000);
        assert_eq!(cpu_millis(&q("0.5")).unwrap(), 500);
        assert_eq!(cpu_millis(&q("0.1")).unwrap(), 100);
        assert_eq!(cpu_millis(&q("3800m")).unwrap(), 3800);
    }

    #[test]
    fn cpu_rounds_sub_millicore_up() {
        assert_eq!(cpu_millis(&q("0.0001")).unwrap(), 1);
    }

    #[test]
    fn memory_binary_suffixes() {
        assert_eq!(memory_bytes(&q("1Ki")).unwrap(), 1024);
        assert_eq!(memory_bytes(&q("512Mi")).unwrap(), 512 * 1024 * 1024);
        assert_eq!(memory_bytes(&q("16Gi")).unwrap(), 16 * 1024 * 1024 * 1024);
        assert_eq!(
            memory_bytes(&q("1.5Gi")).unwrap(),
            3 * 1024 * 1024 * 1024 / 2
        );
    }

    #[test]
    fn memory_decimal_suffixes_and_exponent() {
        assert_eq!(memory_bytes(&q("1G")).unwrap(), 1_000_000_000);
        assert_eq!(memory_bytes(&q("128k")).unwrap(), 128_000);
        assert_eq!(memory_bytes(&q("1e3")).unwrap(), 1000);
        assert_eq!(memory_bytes(&q("1000000")).unwrap(), 1_000_000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("lots").is_err());
        assert!(parse_quantity("12Xi").is_err());
        assert!(parse_quantity("-1").is_err());
        assert!(parse_quantity("Mi").is_err());
    }
}
