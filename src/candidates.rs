use crate::keyspace::{hex_biguint, KeyRange};
use num_bigint::{BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Run-wide enumeration policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnumerationMode {
    /// start, start+1, start+2, ...
    #[default]
    Sequential,
    /// Seeded affine permutation of the sub-range
    StridedRandom,
}

impl FromStr for EnumerationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" | "seq" => Ok(EnumerationMode::Sequential),
            "strided-random" | "strided_random" | "random" => Ok(EnumerationMode::StridedRandom),
            other => Err(format!(
                "unknown enumeration mode '{}' (expected sequential or strided-random)",
                other
            )),
        }
    }
}

/// Everything besides the offset needed to reproduce a worker's sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EnumerationState {
    Sequential,
    /// Index `i` maps to `start + (multiplier * i + increment) mod width`.
    /// `gcd(multiplier, width) == 1`, so the map is a bijection.
    StridedRandom {
        #[serde(with = "hex_biguint")]
        multiplier: BigUint,
        #[serde(with = "hex_biguint")]
        increment: BigUint,
    },
}

impl EnumerationState {
    /// Derive the state for one worker's sub-range from the run seed.
    pub fn for_worker(mode: EnumerationMode, range: &KeyRange, seed: u64, worker_id: usize) -> Self {
        match mode {
            EnumerationMode::Sequential => EnumerationState::Sequential,
            EnumerationMode::StridedRandom => {
                let width = range.width();
                let mut rng =
                    StdRng::seed_from_u64(seed ^ (worker_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));

                if width.is_one() {
                    return EnumerationState::StridedRandom {
                        multiplier: BigUint::one(),
                        increment: BigUint::zero(),
                    };
                }

                let multiplier = loop {
                    let candidate = rng.gen_biguint_range(&BigUint::one(), &width);
                    if candidate.gcd(&width).is_one() {
                        break candidate;
                    }
                };
                let increment = rng.gen_biguint_below(&width);

                EnumerationState::StridedRandom {
                    multiplier,
                    increment,
                }
            }
        }
    }

    pub fn mode(&self) -> EnumerationMode {
        match self {
            EnumerationState::Sequential => EnumerationMode::Sequential,
            EnumerationState::StridedRandom { .. } => EnumerationMode::StridedRandom,
        }
    }
}

/// Lazy, finite, restartable enumeration of one sub-range.
///
/// The offset counts candidates already handed out; every integer of the range
/// is produced exactly once over offsets `0..width`.
pub struct CandidateGenerator {
    range: KeyRange,
    width: BigUint,
    state: EnumerationState,
    offset: BigUint,
    // (multiplier * offset + increment) mod width, advanced incrementally
    permuted: BigUint,
}

impl CandidateGenerator {
    pub fn new(range: KeyRange, state: EnumerationState) -> Self {
        Self::resume(range, state, BigUint::zero())
    }

    pub fn sequential(range: KeyRange) -> Self {
        Self::new(range, EnumerationState::Sequential)
    }

    /// Restart from a previously reported offset. Offsets past the end are
    /// clamped, producing an exhausted generator.
    pub fn resume(range: KeyRange, state: EnumerationState, offset: BigUint) -> Self {
        let width = range.width();
        let offset = if offset > width { width.clone() } else { offset };
        let permuted = match &state {
            EnumerationState::Sequential => BigUint::zero(),
            EnumerationState::StridedRandom {
                multiplier,
                increment,
            } => (multiplier * &offset + increment) % &width,
        };

        CandidateGenerator {
            range,
            width,
            state,
            offset,
            permuted,
        }
    }

    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    pub fn state(&self) -> &EnumerationState {
        &self.state
    }

    pub fn offset(&self) -> &BigUint {
        &self.offset
    }

    pub fn remaining(&self) -> BigUint {
        &self.width - &self.offset
    }

    pub fn is_exhausted(&self) -> bool {
        self.offset >= self.width
    }

    fn advance(&mut self) -> BigUint {
        let candidate = match &self.state {
            EnumerationState::Sequential => &self.range.start + &self.offset,
            EnumerationState::StridedRandom { multiplier, .. } => {
                let candidate = &self.range.start + &self.permuted;
                // multiplier < width, so one subtraction wraps
                self.permuted += multiplier;
                if self.permuted >= self.width {
                    self.permuted -= &self.width;
                }
                candidate
            }
        };
        self.offset += 1u32;
        candidate
    }

    /// Pull up to `size` candidates. Returns fewer (possibly none) near the end.
    pub fn next_batch(&mut self, size: usize) -> Vec<BigUint> {
        let mut batch = Vec::with_capacity(size);
        while batch.len() < size && !self.is_exhausted() {
            batch.push(self.advance());
        }
        batch
    }
}

impl Iterator for CandidateGenerator {
    type Item = BigUint;

    fn next(&mut self) -> Option<BigUint> {
        if self.is_exhausted() {
            return None;
        }
        Some(self.advance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn range(start: u64, end: u64) -> KeyRange {
        KeyRange::new(BigUint::from(start), BigUint::from(end)).unwrap()
    }

    fn expected(start: u64, end: u64) -> HashSet<BigUint> {
        (start..end).map(BigUint::from).collect()
    }

    #[test]
    fn test_sequential_emits_every_scalar_once() {
        let generator = CandidateGenerator::sequential(range(5000, 6000));
        let seen: Vec<BigUint> = generator.collect();

        assert_eq!(seen.len(), 1000);
        assert_eq!(seen.first().unwrap(), &BigUint::from(5000u32));
        assert_eq!(seen.iter().cloned().collect::<HashSet<_>>(), expected(5000, 6000));
    }

    #[test]
    fn test_strided_random_emits_every_scalar_once() {
        for seed in [1u64, 42, 0xDEAD_BEEF] {
            let keys = range(0, 1000);
            let state = EnumerationState::for_worker(EnumerationMode::StridedRandom, &keys, seed, 0);
            let seen: Vec<BigUint> = CandidateGenerator::new(keys, state).collect();

            assert_eq!(seen.len(), 1000);
            assert_eq!(seen.iter().cloned().collect::<HashSet<_>>(), expected(0, 1000));
        }
    }

    #[test]
    fn test_strided_random_is_not_sequential() {
        let keys = range(0, 1000);
        let state = EnumerationState::for_worker(EnumerationMode::StridedRandom, &keys, 7, 0);
        let first: Vec<BigUint> = CandidateGenerator::new(keys, state).take(10).collect();
        let sequential: Vec<BigUint> = (0u32..10).map(BigUint::from).collect();
        assert_ne!(first, sequential);
    }

    #[test]
    fn test_resume_continues_sequence() {
        for mode in [EnumerationMode::Sequential, EnumerationMode::StridedRandom] {
            let keys = range(100, 1100);
            let state = EnumerationState::for_worker(mode, &keys, 99, 3);

            let full: Vec<BigUint> = CandidateGenerator::new(keys.clone(), state.clone()).collect();

            let mut first = CandidateGenerator::new(keys.clone(), state.clone());
            let head = first.next_batch(337);
            let resumed = CandidateGenerator::resume(keys, state, first.offset().clone());
            let tail: Vec<BigUint> = resumed.collect();

            assert_eq!(head.len() + tail.len(), full.len());
            assert_eq!(head.as_slice(), &full[..337]);
            assert_eq!(tail.as_slice(), &full[337..]);
        }
    }

    #[test]
    fn test_batches_stop_at_exhaustion() {
        let mut generator = CandidateGenerator::sequential(range(0, 10));
        assert_eq!(generator.next_batch(4).len(), 4);
        assert_eq!(generator.next_batch(4).len(), 4);
        assert_eq!(generator.next_batch(4).len(), 2);
        assert!(generator.is_exhausted());
        assert!(generator.next_batch(4).is_empty());
        assert_eq!(generator.remaining(), BigUint::zero());
    }

    #[test]
    fn test_resume_past_end_is_exhausted() {
        let generator = CandidateGenerator::resume(
            range(0, 10),
            EnumerationState::Sequential,
            BigUint::from(50u32),
        );
        assert!(generator.is_exhausted());
        assert_eq!(generator.offset(), &BigUint::from(10u32));
    }

    #[test]
    fn test_worker_states_differ() {
        let keys = range(0, 1_000_003);
        let a = EnumerationState::for_worker(EnumerationMode::StridedRandom, &keys, 5, 0);
        let b = EnumerationState::for_worker(EnumerationMode::StridedRandom, &keys, 5, 1);
        let again = EnumerationState::for_worker(EnumerationMode::StridedRandom, &keys, 5, 0);
        assert_ne!(a, b);
        assert_eq!(a, again);
    }

    #[test]
    fn test_single_element_range() {
        let keys = range(77, 78);
        let state = EnumerationState::for_worker(EnumerationMode::StridedRandom, &keys, 1, 0);
        let seen: Vec<BigUint> = CandidateGenerator::new(keys, state).collect();
        assert_eq!(seen, vec![BigUint::from(77u32)]);
    }

    #[test]
    fn test_state_serialization() {
        let state = EnumerationState::StridedRandom {
            multiplier: BigUint::from(7u32),
            increment: BigUint::from(255u32),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(
            json,
            r#"{"mode":"strided_random","multiplier":"0x7","increment":"0xff"}"#
        );
        let back: EnumerationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("Sequential".parse::<EnumerationMode>().unwrap(), EnumerationMode::Sequential);
        assert_eq!(
            "strided-random".parse::<EnumerationMode>().unwrap(),
            EnumerationMode::StridedRandom
        );
        assert!("pattern".parse::<EnumerationMode>().is_err());
    }
}
