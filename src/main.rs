#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::{Parser, Subcommand};
use puzzle_hunter::error::{ConfigError, Result, SearchError};
use puzzle_hunter::keyspace::parse_hex;
use puzzle_hunter::matcher::{hash160, p2pkh_address, p2wpkh_address, scalar_to_bytes};
use puzzle_hunter::{
    io_utils, private_key_wif, puzzles, BackendKind, CheckpointStore, EncodingPolicy, EnumerationMode, KeyDeriver,
    KeyEncoding, MatchResult, SearchConfig, SearchController, Secp256k1Deriver, SessionEvent, SessionOutcome,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "puzzle-hunter")]
#[command(about = "Search bounded keyspaces for the private keys of Bitcoin puzzle addresses", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search a keyspace for one or more target addresses")]
    Search {
        #[arg(long, help = "Configuration file (JSON) - CLI options override config file values")]
        config: Option<String>,

        #[arg(short, long, help = "Take target and range from the built-in puzzle catalogue")]
        puzzle: Option<u32>,

        #[arg(short, long = "target", help = "Target address (repeatable)")]
        targets: Vec<String>,

        #[arg(long, help = "Range start, hex (inclusive)")]
        start: Option<String>,

        #[arg(long, help = "Range end, hex (exclusive)")]
        end: Option<String>,

        #[arg(short, long, help = "Number of worker threads")]
        workers: Option<usize>,

        #[arg(short, long, help = "Backend: cpu or accelerator")]
        backend: Option<String>,

        #[arg(short, long, help = "Enumeration mode: sequential or strided_random")]
        mode: Option<String>,

        #[arg(short, long, help = "Key encoding: either, compressed or uncompressed")]
        encoding: Option<String>,

        #[arg(long, help = "Candidates per batch")]
        batch_size: Option<usize>,

        #[arg(short = 'c', long, help = "Checkpoint every N seconds")]
        checkpoint_interval: Option<u64>,

        #[arg(short = 'd', long, help = "Checkpoint root directory (default: checkpoints)")]
        checkpoint_dir: Option<String>,

        #[arg(long, help = "Disable checkpointing")]
        no_checkpoint: bool,

        #[arg(short, long, help = "Session id (default: derived from the range)")]
        session: Option<String>,

        #[arg(long, help = "Seed for strided-random enumeration")]
        seed: Option<u64>,

        #[arg(long, help = "Force restart from beginning, ignoring existing checkpoints")]
        force_restart: bool,

        #[arg(short, long, help = "Output file for the match (JSON)")]
        output: Option<String>,
    },

    #[command(about = "Resume a session from its checkpoint directory")]
    Resume {
        #[arg(help = "Session directory (contains session.json)")]
        session_dir: String,

        #[arg(short, long, help = "Output file for the match (JSON)")]
        output: Option<String>,
    },

    #[command(about = "Show the addresses and WIF keys of one private key")]
    Derive {
        #[arg(help = "Private key scalar, hex")]
        scalar: String,
    },

    #[command(about = "List the built-in puzzle catalogue")]
    Puzzles,

    #[command(about = "Generate a default search configuration file")]
    InitConfig {
        #[arg(help = "Output file path (default: search_config.json)")]
        output: Option<String>,
    },

    #[command(about = "Measure key derivation throughput per backend")]
    Benchmark {
        #[arg(short, long, default_value = "200000", help = "Keys to derive per backend")]
        keys: u64,

        #[arg(short, long, help = "Number of worker threads")]
        workers: Option<usize>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Search {
            config,
            puzzle,
            targets,
            start,
            end,
            workers,
            backend,
            mode,
            encoding,
            batch_size,
            checkpoint_interval,
            checkpoint_dir,
            no_checkpoint,
            session,
            seed,
            force_restart,
            output,
        } => build_search_config(
            config,
            puzzle,
            SearchOverrides {
                targets,
                start,
                end,
                workers,
                backend,
                mode,
                encoding,
                batch_size,
                checkpoint_interval,
                checkpoint_dir,
                no_checkpoint,
                session,
                seed,
            },
        )
        .and_then(|config| run_search(config, force_restart, output.as_deref())),
        Commands::Resume { session_dir, output } => resume_session(Path::new(&session_dir), output.as_deref()),
        Commands::Derive { scalar } => derive_key(&scalar),
        Commands::Puzzles => {
            list_puzzles();
            Ok(())
        }
        Commands::InitConfig { output } => init_config_file(output.as_deref().unwrap_or("search_config.json")),
        Commands::Benchmark { keys, workers } => run_benchmark(keys, workers),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

struct SearchOverrides {
    targets: Vec<String>,
    start: Option<String>,
    end: Option<String>,
    workers: Option<usize>,
    backend: Option<String>,
    mode: Option<String>,
    encoding: Option<String>,
    batch_size: Option<usize>,
    checkpoint_interval: Option<u64>,
    checkpoint_dir: Option<String>,
    no_checkpoint: bool,
    session: Option<String>,
    seed: Option<u64>,
}

fn parse_option<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|e: String| ConfigError::InvalidOption(e).into())
}

fn build_search_config(config_file: Option<String>, puzzle: Option<u32>, o: SearchOverrides) -> Result<SearchConfig> {
    // Load config from file, the puzzle catalogue, or defaults
    let mut config = match (config_file, puzzle) {
        (Some(path), _) => {
            let config = SearchConfig::load_from_file(Path::new(&path))?;
            println!("✓ Loaded configuration from: {}\n", path);
            config
        }
        (None, Some(number)) => SearchConfig::for_puzzle(number)?,
        (None, None) => SearchConfig::default(),
    };

    // Apply CLI overrides
    if !o.targets.is_empty() {
        config.targets = o.targets;
    }
    if let Some(v) = o.start {
        config.range_start = v;
    }
    if let Some(v) = o.end {
        config.range_end = v;
    }
    if let Some(v) = o.workers {
        config.worker_count = v;
    }
    if let Some(v) = o.backend {
        config.backend = parse_option::<BackendKind>(&v)?;
    }
    if let Some(v) = o.mode {
        config.enumeration = parse_option::<EnumerationMode>(&v)?;
    }
    if let Some(v) = o.encoding {
        config.encoding = parse_option::<EncodingPolicy>(&v)?;
    }
    if let Some(v) = o.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = o.checkpoint_interval {
        config.checkpoint_interval = Duration::from_secs(v);
    }
    if let Some(v) = o.checkpoint_dir {
        config.checkpoint_dir = Some(PathBuf::from(v));
    }
    if o.no_checkpoint {
        config.checkpoint_dir = None;
    }
    if let Some(v) = o.session {
        config.session_id = Some(v);
    }
    if let Some(v) = o.seed {
        config.seed = Some(v);
    }

    Ok(config)
}

fn run_search(config: SearchConfig, force_restart: bool, output: Option<&str>) -> Result<()> {
    let range = config.validate()?;
    let session_id = config.resolved_session_id();

    if force_restart {
        if let Some(root) = &config.checkpoint_dir {
            CheckpointStore::open(root, &session_id)?.clear()?;
            println!("Force restart: cleared checkpoints for session {}", session_id);
        }
    }

    println!("========================================");
    println!("   PUZZLE KEY SEARCH");
    println!("========================================");
    println!("Session:             {}", session_id);
    println!("Range:               {}", range);
    println!("Width:               {:#x}", range.width());
    println!("Targets:             {}", config.targets.join(", "));
    println!("Workers:             {}", config.worker_count);
    println!("Backend:             {}", config.backend);
    println!("Enumeration:         {:?}", config.enumeration);
    println!("Key encoding:        {:?}", config.encoding);
    match &config.checkpoint_dir {
        Some(dir) => println!("Checkpoints:         {} (every {}s)", dir.display(), config.checkpoint_interval.as_secs()),
        None => println!("Checkpoints:         disabled"),
    }
    println!("========================================\n");

    let session = SearchController::new().start(config)?;
    let events = session.subscribe();
    let start_time = Instant::now();

    let mut outcome = None;
    for event in events.iter() {
        match event {
            SessionEvent::Progress(snapshot) => {
                let eta = snapshot
                    .eta
                    .map(format_duration)
                    .unwrap_or_else(|| "unknown".to_string());
                println!(
                    "[{}] {} keys ({:.6}%) | {:.0} keys/s | ETA {}",
                    format_duration(snapshot.elapsed),
                    snapshot.total_keys_checked + snapshot.resumed_keys_checked,
                    snapshot.percent_complete,
                    snapshot.rate,
                    eta
                );
            }
            SessionEvent::Warning(message) => eprintln!("Warning: {}", message),
            SessionEvent::Matched(result) => outcome = Some(SessionOutcome::Matched(result)),
            SessionEvent::CompletedNoMatch => outcome = Some(SessionOutcome::NoMatch),
            SessionEvent::Stopped => outcome = Some(SessionOutcome::Stopped),
            SessionEvent::Failed(reason) => outcome = Some(SessionOutcome::Failed(reason)),
        }
        if outcome.is_some() {
            break;
        }
    }

    // let workers flush their final checkpoints
    let outcome = session.wait(Duration::from_secs(60)).or(outcome);
    let snapshot = session.snapshot();

    println!("\n📊 FINAL SUMMARY");
    println!("========================================");
    println!("Keys checked:        {}", snapshot.total_keys_checked);
    println!("Resumed from disk:   {}", snapshot.resumed_keys_checked);
    println!("Progress:            {:.6}%", snapshot.percent_complete);
    println!("Time elapsed:        {:.2}s", start_time.elapsed().as_secs_f64());
    if start_time.elapsed().as_secs() > 0 {
        let rate = snapshot.total_keys_checked as f64 / start_time.elapsed().as_secs_f64();
        println!("Average rate:        {:.0} keys/second", rate);
    }
    println!("========================================\n");

    match outcome {
        Some(SessionOutcome::Matched(result)) => {
            print_match(&result);
            if let Some(path) = output {
                io_utils::save_to_file(&result, Path::new(path))?;
                println!("\nMatch saved to: {}", path);
            }
        }
        Some(SessionOutcome::NoMatch) => println!("Keyspace exhausted without a match."),
        Some(SessionOutcome::Stopped) => println!("Search stopped; resume with the same session to continue."),
        Some(SessionOutcome::Failed(reason)) => {
            println!("Search failed: {}", reason);
            if let Some(dir) = session.checkpoint_dir() {
                println!("Resume with: puzzle-hunter resume {}", dir.display());
            }
        }
        None => println!("Search did not finish in time; checkpoints may lag behind."),
    }

    Ok(())
}

fn print_match(result: &MatchResult) {
    println!("🎉 KEY FOUND!");
    println!("  Private key:       {:#066x}", result.scalar);
    if let Some(wif) = private_key_wif(&result.scalar, result.encoding) {
        println!("  WIF:               {}", wif);
    }
    println!("  Address:           {}", result.derived_address);
    println!("  Target:            #{} {}", result.target_id, result.target_address);
    println!("  Key encoding:      {:?}", result.encoding);
    println!("  Worker:            {} (offset {:#x})", result.worker_id, result.found_at);
    println!("  Found at:          {}", result.timestamp);
}

fn resume_session(session_dir: &Path, output: Option<&str>) -> Result<()> {
    let store = CheckpointStore::open_dir(session_dir.to_path_buf())?;
    let manifest = store
        .load_manifest()?
        .ok_or_else(|| SearchError::MissingManifest(session_dir.to_path_buf()))?;

    println!("========================================");
    println!("   RESUMING SESSION");
    println!("========================================");
    println!("Session:             {}", manifest.session_id);
    println!("Created:             {}", manifest.created_at);
    println!("Last saved:          {}", manifest.updated_at);
    println!("Workers:             {}", manifest.worker_count);
    for id in store.worker_ids()? {
        match store.load(id) {
            Ok(Some(checkpoint)) => println!(
                "  worker {:>3}: {} keys, cursor {:#x}{}",
                id,
                checkpoint.keys_checked,
                checkpoint.cursor,
                if checkpoint.exhausted { " (exhausted)" } else { "" }
            ),
            Ok(None) => {}
            Err(e) => println!("  worker {:>3}: unreadable ({})", id, e),
        }
    }
    println!("========================================\n");

    let mut config = manifest.config;
    config.session_id = Some(manifest.session_id);
    config.checkpoint_dir = Some(
        session_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    );
    config.seed = Some(manifest.seed);
    run_search(config, false, output)
}

fn derive_key(scalar_hex: &str) -> Result<()> {
    let scalar = parse_hex(scalar_hex)?;
    let public_key = scalar_to_bytes(&scalar)
        .and_then(|secret| Secp256k1Deriver.derive_public_key(&secret))
        .ok_or_else(|| SearchError::InvalidScalar(scalar.clone()))?;

    let compressed = hash160(&public_key.compressed);
    let uncompressed = hash160(&public_key.uncompressed);

    println!("Private key:           {:#066x}", scalar);
    println!();
    println!("Compressed:");
    println!("  Public key:          {}", hex::encode(public_key.compressed));
    println!("  HASH160:             {}", hex::encode(compressed));
    println!("  P2PKH:               {}", p2pkh_address(&compressed));
    println!("  P2WPKH:              {}", p2wpkh_address(&compressed));
    println!("  WIF:                 {}", private_key_wif(&scalar, KeyEncoding::Compressed).unwrap_or_default());
    println!("Uncompressed:");
    println!("  HASH160:             {}", hex::encode(uncompressed));
    println!("  P2PKH:               {}", p2pkh_address(&uncompressed));
    println!("  WIF:                 {}", private_key_wif(&scalar, KeyEncoding::Uncompressed).unwrap_or_default());

    Ok(())
}

fn list_puzzles() {
    println!("{:>4}  {:>4}  {:<36} {:>8}  {:<44} {}", "#", "Bits", "Address", "Reward", "Range", "Status");
    for puzzle in puzzles::PUZZLES {
        let status = match puzzle.solved_key {
            Some(key) => format!("solved ({})", key),
            None => "open".to_string(),
        };
        let range = puzzle
            .range()
            .map(|r| r.to_string())
            .unwrap_or_else(|e| e.to_string());
        println!(
            "{:>4}  {:>4}  {:<36} {:>8.3}  {:<44} {}",
            puzzle.number,
            puzzle.bits(),
            puzzle.address,
            puzzle.reward_btc,
            range,
            status
        );
    }
}

fn init_config_file(output: &str) -> Result<()> {
    let config = SearchConfig::default();
    config.save_to_file(Path::new(output))?;

    println!("✓ Default configuration file created: {}", output);
    println!("\nConfiguration:");
    println!("  Targets:             {}", config.targets.join(", "));
    println!("  Range:               {} .. {}", config.range_start, config.range_end);
    println!("  Workers:             {}", config.worker_count);
    println!("  Backend:             {}", config.backend);
    println!("  Enumeration:         {:?}", config.enumeration);
    println!("  Batch size:          {}", config.batch_size);
    println!("  Checkpoint interval: {}s", config.checkpoint_interval.as_secs());
    println!("\nYou can now edit this file and use:");
    println!("  cargo run --release -- search --config {}", output);
    Ok(())
}

fn run_benchmark(keys: u64, workers: Option<usize>) -> Result<()> {
    println!("Running benchmarks...\n");

    let start = 1u64 << 40;
    for backend in [BackendKind::Cpu, BackendKind::Accelerator] {
        let mut config = SearchConfig::for_puzzle(71)?;
        config.range_start = format!("{:#x}", start);
        config.range_end = format!("{:#x}", start + keys.max(1));
        config.backend = backend;
        config.checkpoint_dir = None;
        config.session_id = None;
        if let Some(w) = workers {
            config.worker_count = w;
        }

        println!("Backend: {} ({} workers, {} keys)", backend, config.worker_count, keys);
        let start_time = Instant::now();
        let session = SearchController::new().start(config)?;
        let outcome = session.wait(Duration::from_secs(3600));
        let elapsed = start_time.elapsed();
        let checked = session.snapshot().total_keys_checked;

        println!("  Outcome: {:?}", outcome.map(|o| o.status()));
        println!("  Checked: {}", checked);
        println!("  Time:    {:.3}s", elapsed.as_secs_f64());
        println!("  Rate:    {:.0} keys/s", checked as f64 / elapsed.as_secs_f64().max(1e-9));
        println!();
    }

    Ok(())
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, rem) = (rem / 3600, rem % 3600);
    let (minutes, seconds) = (rem / 60, rem % 60);
    if days > 0 {
        format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_without_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        match resume_session(dir.path(), None) {
            Err(SearchError::MissingManifest(path)) => assert_eq!(path, dir.path()),
            other => panic!("unexpected result {:?}", other.err()),
        }
    }

    #[test]
    fn test_derive_rejects_zero_scalar() {
        assert!(matches!(derive_key("0x0"), Err(SearchError::InvalidScalar(_))));
        assert!(derive_key("0x1").is_ok());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(3725)), "01:02:05");
        assert_eq!(format_duration(Duration::from_secs(90_061)), "1d 01:01:01");
    }
}
