use crate::error::ConfigError;
use crate::keyspace::KeyRange;

/// A published puzzle: the key of puzzle `n` has exactly `n` significant bits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Puzzle {
    pub number: u32,
    pub address: &'static str,
    pub reward_btc: f64,
    /// Hex private key, for puzzles already solved
    pub solved_key: Option<&'static str>,
}

impl Puzzle {
    pub fn bits(&self) -> u32 {
        self.number
    }

    pub fn range(&self) -> Result<KeyRange, ConfigError> {
        KeyRange::for_bits(self.bits())
    }

    pub fn is_solved(&self) -> bool {
        self.solved_key.is_some()
    }
}

pub const PUZZLES: &[Puzzle] = &[
    Puzzle {
        number: 1,
        address: "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH",
        reward_btc: 0.001,
        solved_key: Some("0x1"),
    },
    Puzzle {
        number: 71,
        address: "1PWo3JeB9jrGwfHDNpdGK54CRas7fsVzXU",
        reward_btc: 7.1,
        solved_key: None,
    },
    Puzzle {
        number: 72,
        address: "1JTK7s9YVYywfm5XUH7RNhHJH1LshCaRFR",
        reward_btc: 7.2,
        solved_key: None,
    },
    Puzzle {
        number: 73,
        address: "12VVRNPi4SJqUTsp6FmqDqY5sGosDtysn4",
        reward_btc: 7.3,
        solved_key: None,
    },
];

pub fn find(number: u32) -> Option<&'static Puzzle> {
    PUZZLES.iter().find(|p| p.number == number)
}

pub fn unsolved() -> impl Iterator<Item = &'static Puzzle> {
    PUZZLES.iter().filter(|p| !p.is_solved())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::parse_hex;
    use crate::matcher::{EncodingPolicy, Target};

    #[test]
    fn test_catalogue_addresses_parse() {
        for puzzle in PUZZLES {
            let target = Target::parse(0, puzzle.address, EncodingPolicy::Either);
            assert!(target.is_ok(), "puzzle #{}: {:?}", puzzle.number, target);
        }
    }

    #[test]
    fn test_solved_keys_lie_in_range() {
        for puzzle in PUZZLES.iter().filter(|p| p.is_solved()) {
            let key = parse_hex(puzzle.solved_key.unwrap()).unwrap();
            assert!(puzzle.range().unwrap().contains(&key), "puzzle #{}", puzzle.number);
        }
    }

    #[test]
    fn test_find() {
        assert_eq!(find(72).unwrap().address, "1JTK7s9YVYywfm5XUH7RNhHJH1LshCaRFR");
        assert!(find(2).is_none());
        assert_eq!(unsolved().next().unwrap().number, 71);
    }

    #[test]
    fn test_range_spans_bit_length() {
        let puzzle = find(72).unwrap();
        let range = puzzle.range().unwrap();
        assert_eq!(range.start.bits(), u64::from(puzzle.bits()));
        assert_eq!(range.end.bits(), u64::from(puzzle.bits()) + 1);

        let bogus = Puzzle {
            number: 0,
            ..*puzzle
        };
        assert!(matches!(bogus.range(), Err(ConfigError::InvalidRange(_))));
    }
}
