use crate::candidates::EnumerationState;
use crate::config::SearchConfig;
use crate::error::CheckpointError;
use crate::keyspace::{hex_biguint, KeyRange};
use crate::worker::{MatchResult, WorkerState};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "session.json";
const MATCH_FILE: &str = "match.json";
const WORKER_PREFIX: &str = "worker-";
const WORKER_SUFFIX: &str = ".json";

fn default_format_version() -> u32 {
    CHECKPOINT_FORMAT_VERSION
}

fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Progress marker for one worker's sub-range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    pub worker_id: usize,
    pub range: KeyRange,
    /// Candidates of `range` already consumed, in enumeration order
    #[serde(with = "hex_biguint")]
    pub cursor: BigUint,
    pub keys_checked: u64,
    #[serde(default)]
    pub exhausted: bool,
    pub enumeration: EnumerationState,
    pub timestamp: String,
}

impl Checkpoint {
    pub fn new(
        worker_id: usize,
        range: KeyRange,
        cursor: BigUint,
        keys_checked: u64,
        exhausted: bool,
        enumeration: EnumerationState,
    ) -> Self {
        Checkpoint {
            format_version: CHECKPOINT_FORMAT_VERSION,
            worker_id,
            range,
            cursor,
            keys_checked,
            exhausted,
            enumeration,
            timestamp: now_timestamp(),
        }
    }

    pub fn from_state(state: &WorkerState, enumeration: EnumerationState) -> Self {
        Checkpoint::new(
            state.id,
            state.range.clone(),
            state.cursor.clone(),
            state.keys_checked,
            state.cursor >= state.range.width(),
            enumeration,
        )
    }

    /// Absolute position of the next candidate in sequential order.
    pub fn position(&self) -> BigUint {
        &self.range.start + &self.cursor
    }

    pub fn remaining(&self) -> BigUint {
        let width = self.range.width();
        if self.cursor >= width {
            BigUint::default()
        } else {
            width - &self.cursor
        }
    }

    fn validate(&self, expected_worker: usize) -> Result<(), String> {
        if self.worker_id != expected_worker {
            return Err(format!(
                "belongs to worker {}, not {}",
                self.worker_id, expected_worker
            ));
        }
        if self.range.start >= self.range.end {
            return Err(format!("empty range {}", self.range));
        }
        if self.cursor > self.range.width() {
            return Err(format!(
                "cursor {:#x} is past the end of {}",
                self.cursor, self.range
            ));
        }
        Ok(())
    }
}

/// Run parameters persisted next to the worker checkpoints so a session can
/// be resumed from its directory alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    pub session_id: String,
    pub config: SearchConfig,
    pub seed: u64,
    pub worker_count: usize,
    /// Sub-range of each worker, by id
    #[serde(default)]
    pub worker_ranges: Vec<KeyRange>,
    /// Keys checked by an earlier layout that was re-partitioned away
    #[serde(default)]
    pub carried_keys_checked: u64,
    /// Normalized targets the checkpoints were scanned against
    #[serde(default)]
    pub target_set: Vec<String>,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl SessionManifest {
    pub fn new(session_id: &str, config: SearchConfig, seed: u64, worker_count: usize) -> Self {
        let now = now_timestamp();
        SessionManifest {
            format_version: CHECKPOINT_FORMAT_VERSION,
            session_id: session_id.to_string(),
            config,
            seed,
            worker_count,
            worker_ranges: Vec::new(),
            carried_keys_checked: 0,
            target_set: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// One directory per session, one JSON file per worker.
///
/// Each worker writes only its own file, so no cross-worker locking is needed.
/// Every write goes through a temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn open(root: &Path, session_id: &str) -> Result<Self, CheckpointError> {
        Self::open_dir(root.join(session_id))
    }

    pub fn open_dir(dir: PathBuf) -> Result<Self, CheckpointError> {
        fs::create_dir_all(&dir)?;
        Ok(CheckpointStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn worker_path(&self, worker_id: usize) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", WORKER_PREFIX, worker_id, WORKER_SUFFIX))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn match_path(&self) -> PathBuf {
        self.dir.join(MATCH_FILE)
    }

    /// Overwrite the checkpoint for `checkpoint.worker_id`.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        crate::io_utils::save_to_file(checkpoint, &self.worker_path(checkpoint.worker_id))?;
        Ok(())
    }

    /// `Ok(None)` when nothing was saved yet; `Corrupt` when the file exists
    /// but does not hold a complete, consistent checkpoint for this worker.
    pub fn load(&self, worker_id: usize) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.worker_path(worker_id);
        let Some(bytes) = read_if_exists(&path)? else {
            return Ok(None);
        };

        let checkpoint: Checkpoint =
            serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        checkpoint
            .validate(worker_id)
            .map_err(|reason| CheckpointError::Corrupt { path, reason })?;

        Ok(Some(checkpoint))
    }

    /// Ids of every worker with a checkpoint file, ascending.
    pub fn worker_ids(&self) -> Result<Vec<usize>, CheckpointError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name
                .strip_prefix(WORKER_PREFIX)
                .and_then(|rest| rest.strip_suffix(WORKER_SUFFIX))
                .and_then(|id| id.parse::<usize>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn remove(&self, worker_id: usize) -> Result<(), CheckpointError> {
        match fs::remove_file(self.worker_path(worker_id)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Drop every checkpoint and the manifest of this session.
    pub fn clear(&self) -> Result<(), CheckpointError> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn save_manifest(&self, manifest: &SessionManifest) -> Result<(), CheckpointError> {
        let mut manifest = manifest.clone();
        manifest.updated_at = now_timestamp();
        crate::io_utils::save_to_file(&manifest, &self.manifest_path())?;
        Ok(())
    }

    pub fn load_manifest(&self) -> Result<Option<SessionManifest>, CheckpointError> {
        let path = self.manifest_path();
        let Some(bytes) = read_if_exists(&path)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupt {
                path,
                reason: e.to_string(),
            })
    }

    /// Record the session's match; a session with one is finished for good.
    pub fn save_match(&self, result: &MatchResult) -> Result<(), CheckpointError> {
        crate::io_utils::save_to_file(result, &self.match_path())?;
        Ok(())
    }

    pub fn load_match(&self) -> Result<Option<MatchResult>, CheckpointError> {
        let path = self.match_path();
        let Some(bytes) = read_if_exists(&path)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupt {
                path,
                reason: e.to_string(),
            })
    }
}

fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, CheckpointError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_utils::temp_path;

    fn sample(worker_id: usize, cursor: u64) -> Checkpoint {
        Checkpoint::new(
            worker_id,
            KeyRange::new(BigUint::from(1000u32), BigUint::from(2000u32)).unwrap(),
            BigUint::from(cursor),
            cursor,
            false,
            EnumerationState::StridedRandom {
                multiplier: BigUint::from(7u32),
                increment: BigUint::from(3u32),
            },
        )
    }

    fn store() -> (tempfile::TempDir, CheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), "session-test").unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let (_dir, store) = store();
        let checkpoint = sample(2, 417);

        store.save(&checkpoint).unwrap();

        assert_eq!(store.load(2).unwrap(), Some(checkpoint));
        assert_eq!(store.load(3).unwrap(), None);
    }

    #[test]
    fn test_save_overwrites_by_worker() {
        let (_dir, store) = store();
        store.save(&sample(0, 10)).unwrap();
        store.save(&sample(0, 20)).unwrap();
        store.save(&sample(1, 5)).unwrap();

        assert_eq!(store.load(0).unwrap().unwrap().cursor, BigUint::from(20u32));
        assert_eq!(store.worker_ids().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_interrupted_write_keeps_previous_checkpoint() {
        let (_dir, store) = store();
        let good = sample(0, 100);
        store.save(&good).unwrap();

        // a writer killed between create and rename leaves only the temp file
        let newer = serde_json::to_string_pretty(&sample(0, 900)).unwrap();
        fs::write(temp_path(&store.worker_path(0)), &newer[..newer.len() / 2]).unwrap();

        assert_eq!(store.load(0).unwrap(), Some(good));
        assert_eq!(store.worker_ids().unwrap(), vec![0]);
    }

    #[test]
    fn test_truncated_checkpoint_is_corrupt() {
        let (_dir, store) = store();
        let json = serde_json::to_string_pretty(&sample(0, 100)).unwrap();
        fs::write(store.worker_path(0), &json[..json.len() - 10]).unwrap();

        assert!(matches!(store.load(0), Err(CheckpointError::Corrupt { .. })));
    }

    #[test]
    fn test_missing_field_is_corrupt() {
        let (_dir, store) = store();
        let mut value = serde_json::to_value(sample(0, 100)).unwrap();
        value.as_object_mut().unwrap().remove("cursor");
        fs::write(store.worker_path(0), value.to_string()).unwrap();

        assert!(matches!(store.load(0), Err(CheckpointError::Corrupt { .. })));
    }

    #[test]
    fn test_inconsistent_fields_are_corrupt() {
        let (_dir, store) = store();
        // cursor past the end of the range
        let mut value = serde_json::to_value(sample(0, 100)).unwrap();
        value["cursor"] = serde_json::json!("0xffff");
        fs::write(store.worker_path(0), value.to_string()).unwrap();
        assert!(matches!(store.load(0), Err(CheckpointError::Corrupt { .. })));

        // stored under the wrong worker file
        let misplaced = serde_json::to_string(&sample(4, 10)).unwrap();
        fs::write(store.worker_path(1), misplaced).unwrap();
        assert!(matches!(store.load(1), Err(CheckpointError::Corrupt { .. })));
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let (_dir, store) = store();
        let checkpoint = sample(0, 100);
        let mut value = serde_json::to_value(&checkpoint).unwrap();
        value["written_by"] = serde_json::json!("a newer release");
        value.as_object_mut().unwrap().remove("format_version");
        fs::write(store.worker_path(0), value.to_string()).unwrap();

        assert_eq!(store.load(0).unwrap(), Some(checkpoint));
    }

    #[test]
    fn test_clear_and_remove() {
        let (_dir, store) = store();
        store.save(&sample(0, 1)).unwrap();
        store.save(&sample(1, 1)).unwrap();

        store.remove(1).unwrap();
        store.remove(7).unwrap();
        assert_eq!(store.worker_ids().unwrap(), vec![0]);

        store.clear().unwrap();
        assert!(store.worker_ids().unwrap().is_empty());
        assert!(store.dir().exists());
    }

    #[test]
    fn test_manifest_round_trip() {
        let (_dir, store) = store();
        assert!(store.load_manifest().unwrap().is_none());

        let config = SearchConfig::default();
        let manifest = SessionManifest::new("session-test", config.clone(), 1234, 8);
        store.save_manifest(&manifest).unwrap();

        let loaded = store.load_manifest().unwrap().unwrap();
        assert_eq!(loaded.seed, 1234);
        assert_eq!(loaded.worker_count, 8);
        assert_eq!(loaded.config.targets, config.targets);
    }

    #[test]
    fn test_position_and_remaining() {
        let checkpoint = sample(0, 250);
        assert_eq!(checkpoint.position(), BigUint::from(1250u32));
        assert_eq!(checkpoint.remaining(), BigUint::from(750u32));
    }

    #[test]
    fn test_match_record_round_trip() {
        let (_dir, store) = store();
        assert!(store.load_match().unwrap().is_none());

        let result = MatchResult {
            worker_id: 2,
            scalar: BigUint::from(537u32),
            derived_address: "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH".to_string(),
            target_id: 0,
            target_address: "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH".to_string(),
            encoding: crate::matcher::KeyEncoding::Compressed,
            found_at: BigUint::from(37u32),
            timestamp: now_timestamp(),
        };
        store.save_match(&result).unwrap();
        store.save(&sample(0, 1)).unwrap();

        assert_eq!(store.load_match().unwrap(), Some(result));
        assert_eq!(store.worker_ids().unwrap(), vec![0]);

        fs::write(store.match_path(), b"{\"worker_id\": 2").unwrap();
        assert!(matches!(store.load_match(), Err(CheckpointError::Corrupt { .. })));

        store.clear().unwrap();
        assert!(store.load_match().unwrap().is_none());
    }
}
