//! Marble Race Wire Payloads
//!
//! This crate defines the payloads exchanged between the Server Edge and
//! race viewers. Every payload is a Protobuf message (via `prost`) and also
//! serialises to the camelCase JSON shape used by event envelopes.
//!
//! # Payload Categories
//!
//! - **Reliable events** (at-least-once): race started, track, player
//!   finished, race complete
//! - **Snapshot stream** (best-effort, latest wins): body positions
//! - **Records**: `RaceRecord`, the persisted replay artifact

#![deny(unsafe_code)]

use marble_sim::{
    BodyState, FinishResult, Obstacle, ObstacleKind, Participant, Snapshot, Tick, Track,
};
use prost::Message;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current `RaceRecord` format version.
pub const RACE_RECORD_VERSION: u32 = 1;

/// Only obstacle shape currently produced.
pub const SHAPE_BOX: &str = "box";

// ============================================================================
// Geometry
// ============================================================================

/// 2D vector in world units, `{x, y}` in JSON.
#[derive(Clone, Copy, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Vec2Proto {
    /// Horizontal component.
    #[prost(double, tag = "1")]
    pub x: f64,

    /// Vertical component (up is positive).
    #[prost(double, tag = "2")]
    pub y: f64,
}

impl From<[f64; 2]> for Vec2Proto {
    fn from(v: [f64; 2]) -> Self {
        Self { x: v[0], y: v[1] }
    }
}

impl From<Vec2Proto> for [f64; 2] {
    fn from(v: Vec2Proto) -> Self {
        [v.x, v.y]
    }
}

// ============================================================================
// Track
// ============================================================================

/// One obstacle of a track.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObstacleProto {
    /// Unique within a track, e.g. "plat_0".
    #[prost(string, tag = "1")]
    pub id: String,

    /// Always "box".
    #[prost(string, tag = "2")]
    pub shape: String,

    /// World-space center.
    #[prost(message, optional, tag = "3")]
    pub center: Option<Vec2Proto>,

    /// Half width and half height before rotation.
    #[prost(message, optional, tag = "4")]
    pub half_extents: Option<Vec2Proto>,

    /// Absent for axis-aligned obstacles.
    #[prost(double, optional, tag = "5")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_radians: Option<f64>,

    /// "platform" or "wall".
    #[prost(string, tag = "6")]
    pub role: String,
}

/// Track layout sent once per race (`trackData`).
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackProto {
    /// 16-digit hex seed label.
    #[prost(string, tag = "1")]
    pub seed: String,

    /// Platforms in generation order, then the two walls.
    #[prost(message, repeated, tag = "2")]
    pub obstacles: Vec<ObstacleProto>,

    /// A body finishes once its y drops below this.
    #[prost(double, tag = "3")]
    pub finish_line_y: f64,
}

// ============================================================================
// Reliable Events
// ============================================================================

/// Race start notification.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RaceStartedProto {
    /// Server wall-clock time at start.
    #[prost(uint64, tag = "1")]
    pub start_time_ms: u64,

    /// Physics tick rate.
    #[prost(uint32, tag = "2")]
    pub tick_rate_hz: u32,

    /// Nominal `raceSnapshot` rate.
    #[prost(uint32, tag = "3")]
    pub snapshot_rate_hz: u32,
}

/// One finisher (`playerFinished`).
#[derive(Clone, PartialEq, Eq, Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FinishResultProto {
    #[prost(string, tag = "1")]
    pub owner_id: String,

    /// Display name.
    #[prost(string, tag = "2")]
    pub name: String,

    /// Race time at the finish crossing.
    #[prost(uint64, tag = "3")]
    pub time_ms: u64,

    /// 1-based arrival order.
    #[prost(uint32, tag = "4")]
    pub rank: u32,
}

/// Final ranked results. Serialises as a bare JSON array.
#[derive(Clone, PartialEq, Eq, Message, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RaceCompleteProto {
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<FinishResultProto>,
}

// ============================================================================
// Snapshot Stream
// ============================================================================

/// One body inside a snapshot.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BodyStateProto {
    /// Empty when malformed; receivers skip such entries.
    #[prost(string, tag = "1")]
    pub owner_id: String,

    /// Required.
    #[prost(message, optional, tag = "2")]
    pub position: Option<Vec2Proto>,

    /// Units/s. Treated as zero when absent.
    #[prost(message, optional, tag = "3")]
    pub velocity: Option<Vec2Proto>,
}

/// Rate-limited body state broadcast.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SnapshotProto {
    /// Post-step tick.
    #[prost(uint64, tag = "1")]
    pub tick: Tick,

    /// Race time derived from the tick.
    #[prost(uint64, tag = "2")]
    pub elapsed_ms: u64,

    /// Server wall-clock time at emission.
    #[prost(uint64, tag = "3")]
    pub server_time_ms: u64,

    /// Bodies in roster order, finished ones included.
    #[prost(message, repeated, tag = "4")]
    pub bodies: Vec<BodyStateProto>,
}

impl SnapshotProto {
    /// Stamp a simulation snapshot with the server time of emission.
    pub fn from_snapshot(snapshot: &Snapshot, server_time_ms: u64) -> Self {
        Self {
            tick: snapshot.tick,
            elapsed_ms: snapshot.elapsed_ms,
            server_time_ms,
            bodies: snapshot.bodies.iter().map(Into::into).collect(),
        }
    }
}

// ============================================================================
// Race Record Types
// ============================================================================

/// Roster entry of a race record.
#[derive(Clone, PartialEq, Eq, Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ParticipantProto {
    #[prost(string, tag = "1")]
    pub id: String,

    #[prost(string, tag = "2")]
    pub name: String,
}

/// Tuning parameter key-value pair.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TuningParameter {
    #[prost(string, tag = "1")]
    pub key: String,

    #[prost(double, tag = "2")]
    pub value: f64,
}

/// Build fingerprint for replay scope verification.
#[derive(Clone, PartialEq, Eq, Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BuildFingerprint {
    /// SHA-256 of server executable bytes.
    #[prost(string, tag = "1")]
    pub binary_sha256: String,

    /// Target as "arch-os" (e.g., "x86_64-linux").
    #[prost(string, tag = "2")]
    pub target_triple: String,

    /// Build profile ("release" or "dev").
    #[prost(string, tag = "3")]
    pub profile: String,

    /// Git commit hash (metadata/traceability).
    #[prost(string, tag = "4")]
    pub git_commit: String,
}

/// Everything needed to re-run a race and check its outcome.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RaceRecord {
    /// Schema version (starts at 1).
    #[prost(uint32, tag = "1")]
    pub version: u32,

    /// Seed the track was generated from.
    #[prost(uint64, tag = "2")]
    pub seed: u64,

    /// RNG algorithm identifier (e.g., "Pcg32").
    #[prost(string, tag = "3")]
    pub rng_algorithm: String,

    /// Physics tick rate the race ran at.
    #[prost(uint32, tag = "4")]
    pub tick_rate_hz: u32,

    /// StateDigest algorithm identifier of the recording build.
    #[prost(string, tag = "5")]
    pub state_digest_algo_id: String,

    /// Participants in roster order.
    #[prost(message, repeated, tag = "6")]
    pub roster: Vec<ParticipantProto>,

    /// Tuning parameters (sorted by key).
    #[prost(message, repeated, tag = "7")]
    pub tuning_parameters: Vec<TuningParameter>,

    /// Track the race ran on.
    #[prost(message, optional, tag = "8")]
    pub track: Option<TrackProto>,

    /// True when `track` is exactly what `seed` generates.
    #[prost(bool, tag = "9")]
    pub track_from_seed: bool,

    /// Results in rank order.
    #[prost(message, repeated, tag = "10")]
    pub results: Vec<FinishResultProto>,

    /// Recording build, when known.
    #[prost(message, optional, tag = "11")]
    pub build_fingerprint: Option<BuildFingerprint>,

    /// StateDigest at checkpoint_tick.
    #[prost(uint64, tag = "12")]
    pub final_digest: u64,

    /// Post-step tick for verification anchor.
    #[prost(uint64, tag = "13")]
    pub checkpoint_tick: Tick,

    /// "complete" or "cancelled".
    #[prost(string, tag = "14")]
    pub end_reason: String,
}

// ============================================================================
// JSON
// ============================================================================

pub fn encode_json<T: Serialize>(payload: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(payload)
}

pub fn decode_json<T: DeserializeOwned>(json: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(json)
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<&Obstacle> for ObstacleProto {
    fn from(o: &Obstacle) -> Self {
        Self {
            id: o.id.clone(),
            shape: SHAPE_BOX.to_string(),
            center: Some(o.center.into()),
            half_extents: Some(o.half_extents.into()),
            rotation_radians: (o.rotation != 0.0).then_some(o.rotation),
            role: o.kind.as_str().to_string(),
        }
    }
}

impl TryFrom<ObstacleProto> for Obstacle {
    type Error = &'static str;

    fn try_from(o: ObstacleProto) -> Result<Self, Self::Error> {
        if o.shape != SHAPE_BOX {
            return Err("obstacle shape must be \"box\"");
        }
        let kind = ObstacleKind::parse(&o.role).ok_or("obstacle role must be platform or wall")?;
        let center = o.center.ok_or("obstacle center is missing")?;
        let half_extents = o.half_extents.ok_or("obstacle halfExtents is missing")?;
        Ok(Self {
            id: o.id,
            kind,
            center: center.into(),
            half_extents: half_extents.into(),
            rotation: o.rotation_radians.unwrap_or(0.0),
        })
    }
}

impl From<&Track> for TrackProto {
    fn from(t: &Track) -> Self {
        Self {
            seed: t.seed.clone(),
            obstacles: t.obstacles.iter().map(Into::into).collect(),
            finish_line_y: t.finish_line_y,
        }
    }
}

impl TryFrom<TrackProto> for Track {
    type Error = &'static str;

    fn try_from(t: TrackProto) -> Result<Self, Self::Error> {
        let obstacles: Result<Vec<_>, _> = t.obstacles.into_iter().map(TryInto::try_into).collect();
        Ok(Self {
            seed: t.seed,
            obstacles: obstacles?,
            finish_line_y: t.finish_line_y,
        })
    }
}

impl From<&BodyState> for BodyStateProto {
    fn from(b: &BodyState) -> Self {
        Self {
            owner_id: b.owner_id.clone(),
            position: Some(b.position.into()),
            velocity: Some(b.velocity.into()),
        }
    }
}

impl TryFrom<BodyStateProto> for BodyState {
    type Error = &'static str;

    fn try_from(b: BodyStateProto) -> Result<Self, Self::Error> {
        if b.owner_id.is_empty() {
            return Err("body ownerId is missing");
        }
        let position = b.position.ok_or("body position is missing")?;
        Ok(Self {
            owner_id: b.owner_id,
            position: position.into(),
            velocity: b.velocity.map(Into::into).unwrap_or([0.0, 0.0]),
        })
    }
}

impl From<&FinishResult> for FinishResultProto {
    fn from(r: &FinishResult) -> Self {
        Self {
            owner_id: r.owner_id.clone(),
            name: r.name.clone(),
            time_ms: r.time_ms,
            rank: r.rank,
        }
    }
}

impl From<FinishResultProto> for FinishResult {
    fn from(r: FinishResultProto) -> Self {
        Self {
            owner_id: r.owner_id,
            name: r.name,
            time_ms: r.time_ms,
            rank: r.rank,
        }
    }
}

impl From<&[FinishResult]> for RaceCompleteProto {
    fn from(results: &[FinishResult]) -> Self {
        Self {
            results: results.iter().map(Into::into).collect(),
        }
    }
}

impl From<&Participant> for ParticipantProto {
    fn from(p: &Participant) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
        }
    }
}

impl From<ParticipantProto> for Participant {
    fn from(p: ParticipantProto) -> Self {
        Self {
            id: p.id,
            name: p.name,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
