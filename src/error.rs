use num_bigint::BigUint;
use std::path::PathBuf;
use thiserror::Error;

/// Raised by the partitioner when a range cannot be split as requested.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("cannot split a range of width {width} across {workers} workers")]
    InsufficientWidth { workers: usize, width: BigUint },

    #[error("worker count must be at least 1")]
    NoWorkers,
}

/// Rejected configuration. Nothing has been spawned when one of these is returned.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid hex number '{0}'")]
    InvalidHex(String),

    #[error("target set is empty")]
    EmptyTargets,

    #[error("invalid target address '{address}': {reason}")]
    InvalidTarget { address: String, reason: String },

    #[error("worker count must be at least 1")]
    ZeroWorkers,

    #[error("batch size must be at least 1")]
    ZeroBatchSize,

    #[error(
        "session was checkpointed with {saved} workers; strided-random resume needs the same count, got {requested}"
    )]
    WorkerCountMismatch { saved: usize, requested: usize },

    #[error("{0}")]
    InvalidOption(String),

    #[error("unknown puzzle #{0}")]
    UnknownPuzzle(u32),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("checkpoint store unusable: {0}")]
    Store(#[from] CheckpointError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Per-worker backend problem. Never fatal to the session.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt checkpoint {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Top-level error for the command-line front end.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no session.json in {}", .0.display())]
    MissingManifest(PathBuf),

    #[error("{0:#x} is not a valid secp256k1 private key")]
    InvalidScalar(BigUint),
}

pub type Result<T> = std::result::Result<T, SearchError>;
