use crate::candidates::EnumerationMode;
use crate::error::ConfigError;
use crate::keyspace::KeyRange;
use crate::matcher::{fingerprint_digest, target_fingerprint, EncodingPolicy, Target};
use crate::puzzles;
use crate::worker::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Durations are stored as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_batch_size() -> usize {
    4096
}

fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_report_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_pause_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Everything a caller hands to [`crate::SearchController::start`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub targets: Vec<String>,
    /// Inclusive lower bound, hex
    pub range_start: String,
    /// Exclusive upper bound, hex
    pub range_end: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub enumeration: EnumerationMode,
    #[serde(default)]
    pub encoding: EncodingPolicy,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(
        rename = "checkpoint_interval_ms",
        with = "duration_ms",
        default = "default_checkpoint_interval"
    )]
    pub checkpoint_interval: Duration,
    #[serde(
        rename = "progress_interval_ms",
        with = "duration_ms",
        default = "default_progress_interval"
    )]
    pub progress_interval: Duration,
    #[serde(
        rename = "report_interval_ms",
        with = "duration_ms",
        default = "default_report_interval"
    )]
    pub report_interval: Duration,
    #[serde(
        rename = "pause_timeout_ms",
        with = "duration_ms",
        default = "default_pause_timeout"
    )]
    pub pause_timeout: Duration,
    /// Root directory for session checkpoints; `None` disables persistence
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Seed for strided-random enumeration; drawn at random when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        let puzzle = puzzles::unsolved().find_map(|p| p.range().ok().map(|range| (p, range)));
        let (targets, range_start, range_end) = match puzzle {
            Some((p, range)) => (
                vec![p.address.to_string()],
                format!("{:#x}", range.start),
                format!("{:#x}", range.end),
            ),
            None => (Vec::new(), "0x1".to_string(), "0x2".to_string()),
        };

        SearchConfig {
            targets,
            range_start,
            range_end,
            worker_count: default_worker_count(),
            backend: BackendKind::Cpu,
            enumeration: EnumerationMode::Sequential,
            encoding: EncodingPolicy::Either,
            batch_size: default_batch_size(),
            checkpoint_interval: default_checkpoint_interval(),
            progress_interval: default_progress_interval(),
            report_interval: default_report_interval(),
            pause_timeout: default_pause_timeout(),
            checkpoint_dir: Some(PathBuf::from("checkpoints")),
            session_id: None,
            seed: None,
        }
    }
}

impl SearchConfig {
    /// Config searching one catalogued puzzle's whole keyspace.
    pub fn for_puzzle(number: u32) -> Result<Self, ConfigError> {
        let puzzle = puzzles::find(number).ok_or(ConfigError::UnknownPuzzle(number))?;
        let range = puzzle.range()?;
        Ok(SearchConfig {
            targets: vec![puzzle.address.to_string()],
            range_start: format!("{:#x}", range.start),
            range_end: format!("{:#x}", range.end),
            session_id: Some(format!("puzzle-{}", number)),
            ..SearchConfig::default()
        })
    }

    /// Load configuration from a JSON file
    pub fn load_from_file(path: &Path) -> std::io::Result<Self> {
        crate::io_utils::load_from_file(path)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file(&self, path: &Path) -> std::io::Result<()> {
        crate::io_utils::save_to_file(self, path)
    }

    pub fn key_range(&self) -> Result<KeyRange, ConfigError> {
        KeyRange::from_hex(&self.range_start, &self.range_end)
    }

    /// Checks that need no derivation or IO.
    pub fn validate(&self) -> Result<KeyRange, ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::EmptyTargets);
        }
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        self.key_range()
    }

    /// Normalized target set under this config's encoding policy.
    pub fn target_fingerprint(&self) -> Result<Vec<String>, ConfigError> {
        let targets = self
            .targets
            .iter()
            .enumerate()
            .map(|(id, address)| Target::parse(id, address, self.encoding))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(target_fingerprint(&targets))
    }

    /// Explicit session id, or one derived from the range bounds and targets.
    pub fn resolved_session_id(&self) -> String {
        if let Some(id) = &self.session_id {
            return id.clone();
        }
        match (self.key_range(), self.target_fingerprint()) {
            (Ok(range), Ok(fingerprint)) => format!(
                "search_{:x}_{:x}_{}",
                range.start,
                range.end,
                fingerprint_digest(&fingerprint)
            ),
            _ => "search".to_string(),
        }
    }

    /// Whether checkpoints written under `other` cover the same keyspace walk
    /// for the same targets.
    pub fn same_search(&self, other: &SearchConfig) -> bool {
        let ranges_match = match (self.key_range(), other.key_range()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        let targets_match = match (self.target_fingerprint(), other.target_fingerprint()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        ranges_match
            && targets_match
            && self.enumeration == other.enumeration
            && self.encoding == other.encoding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_targets_first_open_puzzle() {
        let config = SearchConfig::default();
        assert_eq!(config.targets.len(), 1);
        let range = config.validate().unwrap();
        assert!(range.width() > num_bigint::BigUint::from(1u32));
    }

    #[test]
    fn test_for_puzzle() {
        let config = SearchConfig::for_puzzle(71).unwrap();
        assert_eq!(config.targets, vec!["1PWo3JeB9jrGwfHDNpdGK54CRas7fsVzXU".to_string()]);
        assert_eq!(config.range_start, "0x400000000000000000");
        assert_eq!(config.range_end, "0x800000000000000000");
        assert_eq!(config.resolved_session_id(), "puzzle-71");
        assert!(matches!(SearchConfig::for_puzzle(9999), Err(ConfigError::UnknownPuzzle(9999))));
    }

    #[test]
    fn test_validation() {
        let mut config = SearchConfig::for_puzzle(71).unwrap();
        config.worker_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroWorkers)));

        let mut config = SearchConfig::for_puzzle(71).unwrap();
        config.targets.clear();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyTargets)));

        let mut config = SearchConfig::for_puzzle(71).unwrap();
        config.range_end = config.range_start.clone();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRange(_))));

        let mut config = SearchConfig::for_puzzle(71).unwrap();
        config.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroBatchSize)));
    }

    #[test]
    fn test_file_round_trip_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hunt.json");
        std::fs::write(
            &path,
            r#"{
                "targets": ["1PWo3JeB9jrGwfHDNpdGK54CRas7fsVzXU"],
                "range_start": "0x10",
                "range_end": "0x20",
                "worker_count": 2,
                "backend": "accelerator",
                "enumeration": "strided_random",
                "checkpoint_interval_ms": 1500
            }"#,
        )
        .unwrap();

        let config = SearchConfig::load_from_file(&path).unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.backend, BackendKind::Accelerator);
        assert_eq!(config.enumeration, EnumerationMode::StridedRandom);
        assert_eq!(config.checkpoint_interval, Duration::from_millis(1500));
        assert_eq!(config.batch_size, 4096);
        let session_id = config.resolved_session_id();
        assert!(session_id.starts_with("search_10_20_"), "{}", session_id);
        assert_eq!(session_id.len(), "search_10_20_".len() + 8);

        config.save_to_file(&path).unwrap();
        let again = SearchConfig::load_from_file(&path).unwrap();
        assert!(again.same_search(&config));
        assert_eq!(again.checkpoint_interval, config.checkpoint_interval);
    }

    #[test]
    fn test_same_search_requires_same_targets_and_encoding() {
        let base = SearchConfig {
            session_id: None,
            ..SearchConfig::for_puzzle(71).unwrap()
        };

        let mut reordered = base.clone();
        reordered.targets = vec![
            "1PWo3JeB9jrGwfHDNpdGK54CRas7fsVzXU".to_string(),
            " 1PWo3JeB9jrGwfHDNpdGK54CRas7fsVzXU".to_string(),
        ];
        reordered.worker_count = base.worker_count + 1;
        assert!(base.same_search(&reordered));
        assert_eq!(base.resolved_session_id(), reordered.resolved_session_id());

        let mut retargeted = base.clone();
        retargeted.targets = vec!["1JTK7s9YVYywfm5XUH7RNhHJH1LshCaRFR".to_string()];
        assert!(!base.same_search(&retargeted));
        assert_ne!(base.resolved_session_id(), retargeted.resolved_session_id());

        let mut pinned = base.clone();
        pinned.encoding = EncodingPolicy::Compressed;
        assert!(!base.same_search(&pinned));
        assert_ne!(base.resolved_session_id(), pinned.resolved_session_id());
    }
}
