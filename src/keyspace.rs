use crate::error::{ConfigError, PartitionError};
use num_bigint::BigUint;
use num_integer::Integer;
use num_traits::{One, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 2^256, the exclusive upper bound of every keyspace.
pub fn keyspace_limit() -> BigUint {
    BigUint::one() << 256u32
}

/// Parse a hex number, with or without a `0x` prefix.
pub fn parse_hex(text: &str) -> Result<BigUint, ConfigError> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty() {
        return Err(ConfigError::InvalidHex(text.to_string()));
    }

    BigUint::parse_bytes(digits.as_bytes(), 16).ok_or_else(|| ConfigError::InvalidHex(text.to_string()))
}

/// Serde adapter storing a BigUint as a `0x` hex string.
pub mod hex_biguint {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Half-open interval `[start, end)` of scalars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    #[serde(with = "hex_biguint")]
    pub start: BigUint,
    #[serde(with = "hex_biguint")]
    pub end: BigUint,
}

impl KeyRange {
    /// Build a range, enforcing `start < end <= 2^256`.
    pub fn new(start: BigUint, end: BigUint) -> Result<Self, ConfigError> {
        if start >= end {
            return Err(ConfigError::InvalidRange(format!(
                "start {:#x} must be below end {:#x}",
                start, end
            )));
        }
        if end > keyspace_limit() {
            return Err(ConfigError::InvalidRange(format!(
                "end {:#x} exceeds 2^256",
                end
            )));
        }
        Ok(KeyRange { start, end })
    }

    pub fn from_hex(start: &str, end: &str) -> Result<Self, ConfigError> {
        KeyRange::new(parse_hex(start)?, parse_hex(end)?)
    }

    /// All scalars with exactly `bits` significant bits: `[2^(bits-1), 2^bits)`.
    pub fn for_bits(bits: u32) -> Result<Self, ConfigError> {
        if bits == 0 || bits > 256 {
            return Err(ConfigError::InvalidRange(format!(
                "bit length {} outside 1..=256",
                bits
            )));
        }
        KeyRange::new(BigUint::one() << (bits - 1), BigUint::one() << bits)
    }

    pub fn width(&self) -> BigUint {
        &self.end - &self.start
    }

    pub fn contains(&self, value: &BigUint) -> bool {
        *value >= self.start && *value < self.end
    }

    /// Width as f64, for rates and percentages only.
    pub fn width_f64(&self) -> f64 {
        self.width().to_f64().unwrap_or(f64::MAX)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.start, self.end)
    }
}

/// Split `range` into `n` contiguous, ascending, non-overlapping sub-ranges.
///
/// The first `width % n` sub-ranges are one element wider than the rest, so
/// widths differ by at most one. Every sub-range is non-empty, which is why
/// `n` may not exceed the width.
///
/// # Examples
///
/// ```
/// use puzzle_hunter::keyspace::{partition, KeyRange};
/// use num_bigint::BigUint;
///
/// let range = KeyRange::new(BigUint::from(0u32), BigUint::from(10u32)).unwrap();
/// let parts = partition(&range, 3).unwrap();
/// assert_eq!(parts.len(), 3);
/// assert_eq!(parts[0].width(), BigUint::from(4u32));
/// assert_eq!(parts[2].end, BigUint::from(10u32));
/// ```
pub fn partition(range: &KeyRange, n: usize) -> Result<Vec<KeyRange>, PartitionError> {
    if n == 0 {
        return Err(PartitionError::NoWorkers);
    }

    let width = range.width();
    let workers = BigUint::from(n);
    if workers > width {
        return Err(PartitionError::InsufficientWidth { workers: n, width });
    }

    let (base, extra) = width.div_rem(&workers);
    // extra < n, so it always fits
    let extra = extra.to_usize().unwrap_or(0);

    let mut parts = Vec::with_capacity(n);
    let mut start = range.start.clone();
    for i in 0..n {
        let len = if i < extra { &base + 1u32 } else { base.clone() };
        let end = &start + &len;
        parts.push(KeyRange {
            start: start.clone(),
            end: end.clone(),
        });
        start = end;
    }

    Ok(parts)
}

/// Re-split the unconsumed remainder of a run for a new worker count.
///
/// `positions` are the absolute next-candidate positions of the workers that
/// still have work (exhausted workers are left out). The new partition covers
/// `[min(positions), original_end)`. Returns an empty list when no worker has
/// anything left.
pub fn repartition<'a, I>(
    positions: I,
    original_end: &BigUint,
    n: usize,
) -> Result<Vec<KeyRange>, PartitionError>
where
    I: IntoIterator<Item = &'a BigUint>,
{
    if n == 0 {
        return Err(PartitionError::NoWorkers);
    }

    let lowest = match positions.into_iter().min() {
        Some(position) => position.clone(),
        None => return Ok(Vec::new()),
    };

    if lowest >= *original_end {
        return Ok(Vec::new());
    }

    let remainder = KeyRange {
        start: lowest,
        end: original_end.clone(),
    };
    partition(&remainder, n)
}

/// Total width covered by a list of ranges.
pub fn total_width(ranges: &[KeyRange]) -> BigUint {
    ranges
        .iter()
        .fold(BigUint::zero(), |acc, range| acc + range.width())
}
