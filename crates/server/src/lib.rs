//! Marble Race Server Edge
//!
//! The Server Edge mediates between the session layer, the Simulation Core
//! and race viewers. It owns:
//! - The per-race state machine (`RaceInstance`: idle → running → complete)
//! - Snapshot down-sampling (`broadcast`)
//! - Event payloads and their JSON envelopes
//! - The per-race tick task (`runner`)
//! - Race recording
//!
//! # Architecture
//!
//! The Server Edge performs all I/O and reads the wall clock on behalf of the
//! race. The Simulation Core only sees tick numbers; wall-clock time enters
//! through the `now_ms` arguments below.

#![deny(unsafe_code)]

pub mod broadcast;
pub mod config;
pub mod runner;
pub mod session;

pub use config::ServerConfig;

use broadcast::{SnapshotCadence, snapshot_payload};
use marble_replay::{ReplayConfig, ReplayRecorder};
use marble_sim::track::format_seed;
use marble_sim::{FinishResult, Participant, RaceWorld, Tick, Track};
use marble_wire::{
    BuildFingerprint, FinishResultProto, RaceCompleteProto, RaceRecord, RaceStartedProto,
    SnapshotProto, TrackProto,
};
use serde_json::json;

// ============================================================================
// Race End Reason
// ============================================================================

/// Reason for race termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Every body crossed the finish threshold.
    Complete,
    /// Reset or stopped before completion.
    Cancelled,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => marble_replay::END_REASON_COMPLETE,
            Self::Cancelled => "cancelled",
        }
    }
}

/// Race lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RacePhase {
    Idle,
    Running,
    Complete,
}

// ============================================================================
// Events
// ============================================================================

/// Something viewers of a race must be told about.
#[derive(Debug, Clone, PartialEq)]
pub enum RaceEvent {
    Started(RaceStartedProto),
    Track(TrackProto),
    Snapshot(SnapshotProto),
    PlayerFinished(FinishResultProto),
    RaceComplete(RaceCompleteProto),
}

impl RaceEvent {
    /// Event name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started(_) => "raceStarted",
            Self::Track(_) => "trackData",
            Self::Snapshot(_) => "raceSnapshot",
            Self::PlayerFinished(_) => "playerFinished",
            Self::RaceComplete(_) => "raceFinished",
        }
    }

    /// Discrete events need reliable delivery; snapshots are best-effort.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Self::Snapshot(_))
    }

    /// JSON envelope `{"event": name, "payload": ...}`.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let payload = match self {
            Self::Started(p) => serde_json::to_value(p)?,
            Self::Track(p) => serde_json::to_value(p)?,
            Self::Snapshot(p) => serde_json::to_value(p)?,
            Self::PlayerFinished(p) => serde_json::to_value(p)?,
            Self::RaceComplete(p) => serde_json::to_value(p)?,
        };
        serde_json::to_string(&json!({ "event": self.name(), "payload": payload }))
    }

    /// Protobuf encoding of the payload alone.
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::Started(p) => prost::Message::encode_to_vec(p),
            Self::Track(p) => prost::Message::encode_to_vec(p),
            Self::Snapshot(p) => prost::Message::encode_to_vec(p),
            Self::PlayerFinished(p) => prost::Message::encode_to_vec(p),
            Self::RaceComplete(p) => prost::Message::encode_to_vec(p),
        }
    }
}

// ============================================================================
// Start Errors
// ============================================================================

/// Why a start request was refused. Neither case is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    AlreadyStarted,
    EmptyRoster,
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyStarted => write!(f, "Race already started"),
            Self::EmptyRoster => write!(f, "Cannot start a race without participants"),
        }
    }
}

impl std::error::Error for StartError {}

// ============================================================================
// Race Instance
// ============================================================================

/// One race: its roster, track, simulation and recording.
///
/// Single-owner and synchronous. The `runner` module drives it from a tokio
/// task; tests drive it directly.
pub struct RaceInstance {
    config: ServerConfig,
    roster: Vec<Participant>,
    seed: u64,
    /// Track supplied up front instead of generated from the seed.
    fixed_track: Option<Track>,
    phase: RacePhase,
    world: Option<RaceWorld>,
    cadence: SnapshotCadence,
    recorder: Option<ReplayRecorder>,
    build_fingerprint: Option<BuildFingerprint>,
    start_time_ms: Option<u64>,
}

impl RaceInstance {
    /// Create an idle race. The track is generated at start from
    /// `config.seed`, or from a fresh random seed when none is configured.
    pub fn new(config: ServerConfig, roster: Vec<Participant>) -> Self {
        let seed = config.seed.unwrap_or_else(rand::random::<u64>);
        Self::build(config, roster, seed, None)
    }

    /// Create an idle race on a prebuilt track.
    pub fn with_track(config: ServerConfig, roster: Vec<Participant>, track: Track) -> Self {
        let seed = config.seed.unwrap_or(0);
        Self::build(config, roster, seed, Some(track))
    }

    fn build(
        config: ServerConfig,
        roster: Vec<Participant>,
        seed: u64,
        fixed_track: Option<Track>,
    ) -> Self {
        Self {
            cadence: SnapshotCadence::new(config.tick_rate_hz, config.snapshot_rate_hz),
            config,
            roster,
            seed,
            fixed_track,
            phase: RacePhase::Idle,
            world: None,
            recorder: None,
            build_fingerprint: None,
            start_time_ms: None,
        }
    }

    pub fn set_build_fingerprint(&mut self, fingerprint: BuildFingerprint) {
        self.build_fingerprint = Some(fingerprint);
    }

    pub fn phase(&self) -> RacePhase {
        self.phase
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn roster(&self) -> &[Participant] {
        &self.roster
    }

    /// Wall-clock start time, once started.
    pub fn start_time_ms(&self) -> Option<u64> {
        self.start_time_ms
    }

    /// Current tick (0 before start).
    pub fn tick(&self) -> Tick {
        self.world.as_ref().map_or(0, RaceWorld::tick)
    }

    pub fn track(&self) -> Option<&Track> {
        self.world.as_ref().map(RaceWorld::track)
    }

    pub fn world(&self) -> Option<&RaceWorld> {
        self.world.as_ref()
    }

    /// Finish results so far, in rank order.
    pub fn results(&self) -> &[FinishResult] {
        self.world.as_ref().map(RaceWorld::results).unwrap_or(&[])
    }

    /// Start the race: build the track, place the bodies and record the
    /// start time.
    ///
    /// Returns the `raceStarted` and `trackData` events.
    pub fn start(&mut self, now_ms: u64) -> Result<Vec<RaceEvent>, StartError> {
        if self.phase != RacePhase::Idle {
            return Err(StartError::AlreadyStarted);
        }
        if self.roster.is_empty() {
            return Err(StartError::EmptyRoster);
        }

        let from_seed = self.fixed_track.is_none();
        let track = self
            .fixed_track
            .take()
            .unwrap_or_else(|| Track::generate(self.seed));

        let mut recorder = ReplayRecorder::new(ReplayConfig {
            seed: self.seed,
            tick_rate_hz: self.config.tick_rate_hz,
            params: self.config.physics,
        });
        recorder.record_roster(&self.roster);
        recorder.record_track(&track, from_seed);
        if let Some(fingerprint) = self.build_fingerprint.clone() {
            recorder.set_build_fingerprint(fingerprint);
        }

        let track_payload = TrackProto::from(&track);
        tracing::info!(
            seed = %format_seed(self.seed),
            players = self.roster.len(),
            obstacles = track.obstacles.len(),
            finish_line_y = track.finish_line_y,
            "Race started"
        );

        self.world = Some(RaceWorld::new(
            track,
            &self.roster,
            self.config.physics,
            self.config.tick_rate_hz,
        ));
        self.recorder = Some(recorder);
        self.start_time_ms = Some(now_ms);
        self.phase = RacePhase::Running;

        Ok(vec![
            RaceEvent::Started(RaceStartedProto {
                start_time_ms: now_ms,
                tick_rate_hz: self.config.tick_rate_hz,
                snapshot_rate_hz: self.config.snapshot_rate_hz,
            }),
            RaceEvent::Track(track_payload),
        ])
    }

    /// Run one physics tick.
    ///
    /// Returns, in order: a `playerFinished` event per body that crossed the
    /// finish threshold this tick, a `raceSnapshot` when the cadence says so,
    /// and `raceFinished` when the last body finished. Returns nothing unless
    /// the race is running.
    pub fn step(&mut self, now_ms: u64) -> Vec<RaceEvent> {
        if self.phase != RacePhase::Running {
            return Vec::new();
        }
        let Some(world) = self.world.as_mut() else {
            return Vec::new();
        };

        let outcome = world.advance(world.tick());
        let mut events = Vec::with_capacity(outcome.finished.len() + 2);

        for result in &outcome.finished {
            tracing::info!(
                owner = %result.owner_id,
                rank = result.rank,
                time_ms = result.time_ms,
                "Player finished"
            );
            if let Some(recorder) = self.recorder.as_mut() {
                recorder.record_finish(result);
            }
            events.push(RaceEvent::PlayerFinished(result.into()));
        }

        if self.cadence.should_emit(outcome.tick) {
            events.push(RaceEvent::Snapshot(snapshot_payload(world, now_ms)));
        }

        if outcome.complete {
            self.phase = RacePhase::Complete;
            tracing::info!(tick = outcome.tick, "Race complete");
            events.push(RaceEvent::RaceComplete(world.results().into()));
        }

        events
    }

    /// Finish recording and produce the race record.
    ///
    /// Returns `None` for a race that never started.
    pub fn finalize(self, end_reason: EndReason) -> Option<RaceRecord> {
        let world = self.world?;
        let recorder = self.recorder?;
        Some(recorder.finalize(world.state_digest(), world.tick(), end_reason.as_str()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use marble_replay::{VerifyOptions, verify_replay};

    fn roster() -> Vec<Participant> {
        vec![Participant::new("a", "Ann"), Participant::new("b", "Ben")]
    }

    fn config() -> ServerConfig {
        ServerConfig {
            seed: Some(7),
            ..ServerConfig::default()
        }
    }

    fn open_race() -> RaceInstance {
        RaceInstance::with_track(config(), roster(), Track::open("open", -30.0))
    }

    fn run_to_completion(race: &mut RaceInstance) -> Vec<RaceEvent> {
        let mut events = Vec::new();
        let mut now_ms = 1_000;
        while race.phase() == RacePhase::Running {
            assert!(race.tick() < 10_000, "race did not complete");
            now_ms += 16;
            events.extend(race.step(now_ms));
        }
        events
    }

    #[test]
    fn test_start_emits_started_and_track() {
        let mut race = RaceInstance::new(config(), roster());
        assert_eq!(race.phase(), RacePhase::Idle);
        assert!(race.track().is_none());

        let events = race.start(1_000).unwrap();
        assert_eq!(race.phase(), RacePhase::Running);
        assert_eq!(race.start_time_ms(), Some(1_000));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "raceStarted");
        assert_eq!(events[1].name(), "trackData");

        let RaceEvent::Track(track) = &events[1] else {
            panic!("expected track event");
        };
        assert_eq!(track.seed, format_seed(7));
        assert_eq!(race.track(), Some(&Track::generate(7)));
    }

    #[test]
    fn test_second_start_is_rejected() {
        let mut race = open_race();
        race.start(0).unwrap();
        assert_eq!(race.start(5), Err(StartError::AlreadyStarted));
        assert_eq!(race.start_time_ms(), Some(0));
    }

    #[test]
    fn test_empty_roster_is_rejected() {
        let mut race = RaceInstance::new(config(), Vec::new());
        assert_eq!(race.start(0), Err(StartError::EmptyRoster));
        assert_eq!(race.phase(), RacePhase::Idle);
    }

    #[test]
    fn test_step_before_start_does_nothing() {
        let mut race = open_race();
        assert!(race.step(0).is_empty());
        assert_eq!(race.tick(), 0);
    }

    #[test]
    fn test_snapshots_follow_cadence() {
        let mut race = open_race();
        race.start(0).unwrap();

        let mut snapshot_ticks = Vec::new();
        for tick in 1..=12u64 {
            for event in race.step(tick * 16) {
                if let RaceEvent::Snapshot(snapshot) = event {
                    assert_eq!(snapshot.server_time_ms, tick * 16);
                    assert_eq!(snapshot.bodies.len(), 2);
                    snapshot_ticks.push(snapshot.tick);
                }
            }
        }
        assert_eq!(snapshot_ticks, vec![1, 5, 9]);
    }

    #[test]
    fn test_full_race_events_and_results() {
        let mut race = open_race();
        race.start(1_000).unwrap();
        let events = run_to_completion(&mut race);

        assert_eq!(race.phase(), RacePhase::Complete);
        let finished: Vec<&FinishResultProto> = events
            .iter()
            .filter_map(|e| match e {
                RaceEvent::PlayerFinished(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(finished.len(), 2);
        assert_eq!(finished[0].rank, 1);
        assert_eq!(finished[1].rank, 2);

        let last = events.last().unwrap();
        assert_eq!(last.name(), "raceFinished");
        let RaceEvent::RaceComplete(complete) = last else {
            panic!("expected race complete");
        };
        assert_eq!(complete.results.len(), 2);
        assert_eq!(
            events.iter().filter(|e| e.name() == "raceFinished").count(),
            1
        );

        // The loop does not run once complete.
        let tick = race.tick();
        assert!(race.step(99_999).is_empty());
        assert_eq!(race.tick(), tick);
    }

    #[test]
    fn test_finalize_produces_verifiable_record() {
        let mut race = RaceInstance::new(config(), roster());
        race.start(0).unwrap();
        for tick in 0..240u64 {
            race.step(tick);
        }
        let record = race.finalize(EndReason::Cancelled).unwrap();
        assert_eq!(record.end_reason, "cancelled");
        assert_eq!(record.checkpoint_tick, 240);
        assert!(record.track_from_seed);

        let options = VerifyOptions {
            strict_build_check: false,
            current_build: None,
        };
        assert!(verify_replay(&record, &options).is_ok());
    }

    #[test]
    fn test_finalize_completed_race() {
        let mut race = open_race();
        race.start(0).unwrap();
        run_to_completion(&mut race);
        let record = race.finalize(EndReason::Complete).unwrap();
        assert_eq!(record.end_reason, "complete");
        assert_eq!(record.results.len(), 2);
        assert!(!record.track_from_seed);
    }

    #[test]
    fn test_finalize_idle_race_is_none() {
        assert!(open_race().finalize(EndReason::Cancelled).is_none());
    }

    #[test]
    fn test_event_json_envelopes() {
        let mut race = open_race();
        let events = race.start(1_000).unwrap();

        let started: serde_json::Value = serde_json::from_str(&events[0].to_json().unwrap()).unwrap();
        assert_eq!(started["event"], "raceStarted");
        assert_eq!(started["payload"]["startTimeMs"], 1_000);
        assert_eq!(started["payload"]["tickRateHz"], 60);

        let track: serde_json::Value = serde_json::from_str(&events[1].to_json().unwrap()).unwrap();
        assert_eq!(track["event"], "trackData");
        assert_eq!(track["payload"]["finishLineY"], -30.0);
        assert!(track["payload"]["obstacles"].as_array().unwrap().is_empty());

        let step_events = race.step(1_016);
        let snapshot = step_events.iter().find(|e| !e.is_reliable()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "raceSnapshot");
        assert_eq!(value["payload"]["serverTimeMs"], 1_016);
        assert_eq!(value["payload"]["bodies"][0]["ownerId"], "a");
    }

    #[test]
    fn test_reliability_classification() {
        let snapshot = RaceEvent::Snapshot(SnapshotProto::default());
        let finished = RaceEvent::PlayerFinished(FinishResultProto::default());
        assert!(!snapshot.is_reliable());
        assert!(finished.is_reliable());

        let complete = RaceEvent::RaceComplete(RaceCompleteProto {
            results: vec![FinishResultProto {
                owner_id: "a".to_string(),
                name: "Ann".to_string(),
                time_ms: 900,
                rank: 1,
            }],
        });
        let decoded: RaceCompleteProto =
            prost::Message::decode(complete.encode_payload().as_slice()).unwrap();
        assert_eq!(RaceEvent::RaceComplete(decoded), complete);
    }
}
