//! Marble Race Replay System
//!
//! This crate provides race record generation and verification.
//!
//! # Architecture
//!
//! - `ReplayRecorder` collects roster, track and finish results during a race
//! - `verify_replay` re-runs a record and compares results and the final
//!   state digest
//! - Records are only comparable between identical builds, so each carries
//!   the fingerprint of the binary that produced it
//!
//! A race has no player input, so roster, track, tuning parameters and tick
//! count fully determine the outcome.

#![deny(unsafe_code)]

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use marble_sim::track::{RNG_ALGORITHM, format_seed};
use marble_sim::{
    FinishResult, Participant, PhysicsParams, RaceWorld, STATE_DIGEST_ALGO_ID, Tick, Track,
};
use marble_wire::{
    BuildFingerprint, FinishResultProto, RACE_RECORD_VERSION, RaceRecord, TrackProto,
    TuningParameter,
};
use prost::Message;
use sha2::{Digest, Sha256};

/// End reason recorded for a race where every body finished.
pub const END_REASON_COMPLETE: &str = "complete";

/// Longest race a record may claim, in seconds of simulated time.
/// Bounds re-simulation of records read from disk.
pub const MAX_RACE_SECONDS: u64 = 1_800;

// ============================================================================
// Replay Recorder
// ============================================================================

/// Configuration for race recording.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub seed: u64,
    pub tick_rate_hz: u32,
    pub params: PhysicsParams,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            tick_rate_hz: marble_sim::TICK_RATE_HZ,
            params: PhysicsParams::default(),
        }
    }
}

/// Records race data for `RaceRecord` generation.
pub struct ReplayRecorder {
    config: ReplayConfig,
    roster: Vec<Participant>,
    track: Option<Track>,
    track_from_seed: bool,
    results: Vec<FinishResult>,
    build_fingerprint: Option<BuildFingerprint>,
}

impl ReplayRecorder {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            config,
            roster: Vec::new(),
            track: None,
            track_from_seed: false,
            results: Vec::new(),
            build_fingerprint: None,
        }
    }

    /// Record the participants in roster order.
    pub fn record_roster(&mut self, roster: &[Participant]) {
        self.roster = roster.to_vec();
    }

    /// Record the track. `from_seed` marks a track generated from the
    /// configured seed, which lets verification regenerate it.
    pub fn record_track(&mut self, track: &Track, from_seed: bool) {
        self.track = Some(track.clone());
        self.track_from_seed = from_seed;
    }

    /// Record a finish, in arrival order.
    pub fn record_finish(&mut self, result: &FinishResult) {
        self.results.push(result.clone());
    }

    pub fn set_build_fingerprint(&mut self, fingerprint: BuildFingerprint) {
        self.build_fingerprint = Some(fingerprint);
    }

    /// Finalize the race record.
    pub fn finalize(self, final_digest: u64, checkpoint_tick: Tick, end_reason: &str) -> RaceRecord {
        let tuning_parameters = self
            .config
            .params
            .tuning_parameters()
            .into_iter()
            .map(|(key, value)| TuningParameter {
                key: key.to_string(),
                value,
            })
            .collect();

        RaceRecord {
            version: RACE_RECORD_VERSION,
            seed: self.config.seed,
            rng_algorithm: RNG_ALGORITHM.to_string(),
            tick_rate_hz: self.config.tick_rate_hz,
            state_digest_algo_id: STATE_DIGEST_ALGO_ID.to_string(),
            roster: self.roster.iter().map(Into::into).collect(),
            tuning_parameters,
            track: self.track.as_ref().map(TrackProto::from),
            track_from_seed: self.track_from_seed,
            results: self.results.iter().map(Into::into).collect(),
            build_fingerprint: self.build_fingerprint,
            final_digest,
            checkpoint_tick,
            end_reason: end_reason.to_string(),
        }
    }
}

// ============================================================================
// Replay Verification
// ============================================================================

/// Replay verification error.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyError {
    /// Build fingerprint mismatch.
    BuildMismatch { expected: String, actual: String },
    /// Record was produced with a different StateDigest algorithm.
    DigestAlgorithmMismatch { expected: String, actual: String },
    /// Record has no track.
    MissingTrack,
    /// Recorded track differs from the one its seed generates.
    TrackSeedMismatch { seed: String },
    /// Tuning parameter key not known to this build.
    UnknownTuningParameter { key: String },
    /// Re-simulated finish results differ from the recorded ones.
    ResultMismatch { rank: u32, reason: String },
    /// Final digest mismatch.
    FinalDigestMismatch { expected: u64, actual: u64 },
    /// Checkpoint tick is not where the re-simulated race stops, or lies
    /// past `MAX_RACE_SECONDS`.
    CheckpointTickMismatch { expected: Tick, actual: Tick },
    /// Invalid record format.
    InvalidFormat { reason: String },
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuildMismatch { expected, actual } => {
                write!(
                    f,
                    "Build fingerprint mismatch: expected {expected}, got {actual}"
                )
            }
            Self::DigestAlgorithmMismatch { expected, actual } => {
                write!(
                    f,
                    "StateDigest algorithm mismatch: expected {expected}, got {actual}"
                )
            }
            Self::MissingTrack => write!(f, "Missing track in race record"),
            Self::TrackSeedMismatch { seed } => {
                write!(f, "Recorded track does not match seed {seed}")
            }
            Self::UnknownTuningParameter { key } => {
                write!(f, "Unknown tuning parameter: {key}")
            }
            Self::ResultMismatch { rank, reason } => {
                write!(f, "Finish result mismatch at rank {rank}: {reason}")
            }
            Self::FinalDigestMismatch { expected, actual } => {
                write!(
                    f,
                    "Final digest mismatch: expected {expected:#x}, got {actual:#x}"
                )
            }
            Self::CheckpointTickMismatch { expected, actual } => {
                write!(
                    f,
                    "Checkpoint tick mismatch: expected {expected}, got {actual}"
                )
            }
            Self::InvalidFormat { reason } => {
                write!(f, "Invalid race record format: {reason}")
            }
        }
    }
}

impl std::error::Error for VerifyError {}

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Fail on a build mismatch instead of logging a warning.
    pub strict_build_check: bool,
    /// Fingerprint of the verifying binary. `None` skips the build check.
    pub current_build: Option<BuildFingerprint>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            strict_build_check: true,
            current_build: None,
        }
    }
}

/// Verify a race record reproduces the recorded outcome.
///
/// # Verification Steps
/// 1. Compare build fingerprints (fail when strict, otherwise warn)
/// 2. Check record format, digest algorithm and tick rate
/// 3. Rebuild the track; a seeded track must regenerate identically
/// 4. Rebuild physics params from the tuning parameters
/// 5. Re-simulate with the recorded roster until the checkpoint, or until
///    completion for complete records, within `MAX_RACE_SECONDS`
/// 6. Compare finish results
/// 7. Assert world.state_digest() == final_digest
pub fn verify_replay(record: &RaceRecord, options: &VerifyOptions) -> Result<(), VerifyError> {
    // Step 1: Build fingerprint
    if let (Some(recorded), Some(current)) = (&record.build_fingerprint, &options.current_build) {
        let mismatch = recorded.binary_sha256 != current.binary_sha256
            || recorded.target_triple != current.target_triple
            || recorded.profile != current.profile;
        if mismatch {
            if options.strict_build_check {
                return Err(VerifyError::BuildMismatch {
                    expected: recorded.binary_sha256.clone(),
                    actual: current.binary_sha256.clone(),
                });
            }
            tracing::warn!(
                recorded = %recorded.binary_sha256,
                current = %current.binary_sha256,
                "Build fingerprint mismatch, verifying anyway"
            );
        }
    }

    // Step 2: Format checks
    if record.version != RACE_RECORD_VERSION {
        return Err(VerifyError::InvalidFormat {
            reason: format!("unsupported record version {}", record.version),
        });
    }
    if record.state_digest_algo_id != STATE_DIGEST_ALGO_ID {
        return Err(VerifyError::DigestAlgorithmMismatch {
            expected: STATE_DIGEST_ALGO_ID.to_string(),
            actual: record.state_digest_algo_id.clone(),
        });
    }
    if record.tick_rate_hz == 0 {
        return Err(VerifyError::InvalidFormat {
            reason: "tick_rate_hz must be positive".to_string(),
        });
    }

    // Step 3: Rebuild track
    let track_proto = record.track.clone().ok_or(VerifyError::MissingTrack)?;
    let track = Track::try_from(track_proto).map_err(|e| VerifyError::InvalidFormat {
        reason: e.to_string(),
    })?;
    if record.track_from_seed && Track::generate(record.seed) != track {
        return Err(VerifyError::TrackSeedMismatch {
            seed: format_seed(record.seed),
        });
    }

    // Step 4: Rebuild params
    let mut params = PhysicsParams::default();
    for parameter in &record.tuning_parameters {
        if !params.set_tuning_parameter(&parameter.key, parameter.value) {
            return Err(VerifyError::UnknownTuningParameter {
                key: parameter.key.clone(),
            });
        }
    }

    // Step 5: Re-simulate
    let roster: Vec<Participant> = record.roster.iter().cloned().map(Into::into).collect();
    let tick_limit = u64::from(record.tick_rate_hz) * MAX_RACE_SECONDS;
    if record.checkpoint_tick > tick_limit {
        return Err(VerifyError::CheckpointTickMismatch {
            expected: record.checkpoint_tick,
            actual: tick_limit,
        });
    }

    // A complete record must stop exactly where the race completes.
    let stop_tick = if record.end_reason == END_REASON_COMPLETE {
        tick_limit
    } else {
        record.checkpoint_tick
    };
    let mut world = RaceWorld::new(track, &roster, params, record.tick_rate_hz);
    while world.tick() < stop_tick && !world.is_complete() {
        world.advance(world.tick());
    }

    if world.tick() != record.checkpoint_tick {
        return Err(VerifyError::CheckpointTickMismatch {
            expected: record.checkpoint_tick,
            actual: world.tick(),
        });
    }

    // Step 6: Compare results
    compare_results(&record.results, world.results())?;

    // Step 7: Verify final digest
    let actual_digest = world.state_digest();
    if actual_digest != record.final_digest {
        return Err(VerifyError::FinalDigestMismatch {
            expected: record.final_digest,
            actual: actual_digest,
        });
    }

    Ok(())
}

fn compare_results(
    recorded: &[FinishResultProto],
    simulated: &[FinishResult],
) -> Result<(), VerifyError> {
    for (index, (expected, actual)) in recorded.iter().zip(simulated).enumerate() {
        let actual = FinishResultProto::from(actual);
        if *expected != actual {
            return Err(VerifyError::ResultMismatch {
                rank: index as u32 + 1,
                reason: format!(
                    "expected {} at {}ms, got {} at {}ms",
                    expected.owner_id, expected.time_ms, actual.owner_id, actual.time_ms
                ),
            });
        }
    }

    if recorded.len() != simulated.len() {
        let rank = recorded.len().min(simulated.len()) as u32 + 1;
        return Err(VerifyError::ResultMismatch {
            rank,
            reason: format!(
                "expected {} finishers, got {}",
                recorded.len(),
                simulated.len()
            ),
        });
    }

    Ok(())
}

// ============================================================================
// Build Fingerprint Acquisition
// ============================================================================

/// Fingerprint of the running executable. Fails if the executable cannot
/// be read.
pub fn acquire_build_fingerprint() -> io::Result<BuildFingerprint> {
    let exe_path = std::env::current_exe()?;

    let mut file = fs::File::open(&exe_path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    let binary_sha256 = format!("{:x}", hasher.finalize());

    let profile = if cfg!(debug_assertions) {
        "dev"
    } else {
        "release"
    };

    Ok(BuildFingerprint {
        binary_sha256,
        target_triple: target_triple(),
        profile: profile.to_string(),
        git_commit: git_commit().unwrap_or_else(|| "unknown".to_string()),
    })
}

fn target_triple() -> String {
    format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}

/// Git commit hash, when provided by the build environment.
fn git_commit() -> Option<String> {
    std::env::var("MARBLE_GIT_COMMIT")
        .ok()
        .filter(|commit| !commit.is_empty())
}

// ============================================================================
// Replay I/O
// ============================================================================

/// Write a race record to a file. Existing files are never overwritten.
pub fn write_replay(record: &RaceRecord, path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    if path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("Race record already exists at {}", path.display()),
        ));
    }

    let encoded = record.encode_to_vec();
    let mut file = fs::File::create(path)?;
    file.write_all(&encoded)?;

    tracing::info!(path = %path.display(), bytes = encoded.len(), "Race record written");
    Ok(())
}

/// Read a race record from a file.
pub fn read_replay(path: &Path) -> io::Result<RaceRecord> {
    let data = fs::read(path)?;
    RaceRecord::decode(data.as_slice()).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to decode race record: {e}"),
        )
    })
}

// ============================================================================
// Tests
// ============================================================================
