pub mod candidates;
pub mod checkpoint;
pub mod config;
pub mod control;
pub mod controller;
pub mod error;
pub mod io_utils;
pub mod keyspace;
pub mod matcher;
pub mod progress;
pub mod puzzles;
pub mod worker;

pub use candidates::{CandidateGenerator, EnumerationMode, EnumerationState};
pub use checkpoint::{Checkpoint, CheckpointStore, SessionManifest};
pub use config::SearchConfig;
pub use controller::{SearchController, SessionEvent, SessionHandle, SessionOutcome, SessionStatus};
pub use error::{BackendError, CheckpointError, ConfigError, PartitionError, SearchError};
pub use keyspace::{partition, repartition, KeyRange};
pub use matcher::{
    private_key_wif, AddressFormat, AddressMatcher, EncodingPolicy, KeyDeriver, KeyEncoding, Secp256k1Deriver, Target,
    TargetHit,
};
pub use progress::{ProgressAggregator, ProgressSnapshot, WorkerSnapshot};
pub use puzzles::{Puzzle, PUZZLES};
pub use worker::{
    AcceleratorBackend, BackendKind, BackendProvider, CpuBackend, DefaultBackends, MatchResult, ScanOutcome,
    SearchBackend, WorkerEvent, WorkerStatus,
};
