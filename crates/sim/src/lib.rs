//! Marble Race Simulation Core
//!
//! This crate contains the deterministic, fixed-timestep race simulation:
//! bodies ("marbles") fall under gravity through a generated obstacle course
//! and finish when they cross the track's finish threshold. It is the
//! authoritative source of truth for finish order.
//!
//! # Architecture Constraints
//!
//! The Simulation Core MUST NOT:
//! - Perform I/O operations (file, network, etc.)
//! - Read wall-clock time
//! - Use ambient/unseeded randomness
//! - Depend on frame rate or variable delta time
//!
//! Race time is derived from the tick counter. The Server Edge attaches
//! wall-clock timestamps when it emits snapshots.

#![deny(unsafe_code)]

pub mod collision;
pub mod track;

pub use collision::{Contact, Resolution, detect_contact, resolve};
pub use track::{Obstacle, ObstacleKind, Track};

// ============================================================================
// Type Aliases
// ============================================================================

/// A single discrete simulation timestep.
pub type Tick = u64;

/// Identifier of the player owning a body. Opaque to the simulation.
pub type OwnerId = String;

// ============================================================================
// Tuning Constants
// ============================================================================

/// Default physics tick rate in Hz.
pub const TICK_RATE_HZ: u32 = 60;

/// Vertical acceleration in units/s² (negative is down).
pub const GRAVITY_Y: f64 = -32.0;
/// Fraction of velocity removed every tick.
pub const LINEAR_DAMPING: f64 = 0.01;
/// Radius shared by every body.
pub const BODY_RADIUS: f64 = 0.5;
/// Speed cap in units/s, applied after integration.
pub const MAX_SPEED: f64 = 120.0;
/// Restitution against boundary walls.
pub const WALL_RESTITUTION: f64 = 0.6;
/// Restitution against platforms.
pub const PLATFORM_RESTITUTION: f64 = 0.6;
/// Spawn height of every body.
pub const START_HEIGHT: f64 = 2.0;
/// Initial vertical velocity in units/s.
pub const START_VELOCITY_Y: f64 = -5.0;
/// Horizontal distance between neighbouring bodies at the start, in radii.
pub const START_SPACING_RADII: f64 = 3.0;

/// Physics tuning for one race. Defaults are the constants above.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicsParams {
    /// Units/s².
    pub gravity_y: f64,
    /// Per-tick fraction, applied to both velocity components.
    pub linear_damping: f64,
    pub body_radius: f64,
    /// Units/s.
    pub max_speed: f64,
    pub wall_restitution: f64,
    pub platform_restitution: f64,
    pub start_height: f64,
    /// Units/s.
    pub start_velocity_y: f64,
    /// Spawn spacing in body radii.
    pub start_spacing_radii: f64,
}

impl Default for PhysicsParams {
    fn default() -> Self {
        Self {
            gravity_y: GRAVITY_Y,
            linear_damping: LINEAR_DAMPING,
            body_radius: BODY_RADIUS,
            max_speed: MAX_SPEED,
            wall_restitution: WALL_RESTITUTION,
            platform_restitution: PLATFORM_RESTITUTION,
            start_height: START_HEIGHT,
            start_velocity_y: START_VELOCITY_Y,
            start_spacing_radii: START_SPACING_RADII,
        }
    }
}

impl PhysicsParams {
    pub fn restitution_for(&self, kind: ObstacleKind) -> f64 {
        match kind {
            ObstacleKind::Wall => self.wall_restitution,
            ObstacleKind::Platform => self.platform_restitution,
        }
    }

    /// Tuning parameters as `(key, value)` pairs, sorted by key.
    pub fn tuning_parameters(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("body_radius", self.body_radius),
            ("gravity_y", self.gravity_y),
            ("linear_damping", self.linear_damping),
            ("max_speed", self.max_speed),
            ("platform_restitution", self.platform_restitution),
            ("start_height", self.start_height),
            ("start_spacing_radii", self.start_spacing_radii),
            ("start_velocity_y", self.start_velocity_y),
            ("wall_restitution", self.wall_restitution),
        ]
    }

    /// Set a tuning parameter by key. Returns false for unknown keys.
    pub fn set_tuning_parameter(&mut self, key: &str, value: f64) -> bool {
        let slot = match key {
            "body_radius" => &mut self.body_radius,
            "gravity_y" => &mut self.gravity_y,
            "linear_damping" => &mut self.linear_damping,
            "max_speed" => &mut self.max_speed,
            "platform_restitution" => &mut self.platform_restitution,
            "start_height" => &mut self.start_height,
            "start_spacing_radii" => &mut self.start_spacing_radii,
            "start_velocity_y" => &mut self.start_velocity_y,
            "wall_restitution" => &mut self.wall_restitution,
            _ => return false,
        };
        *slot = value;
        true
    }
}

// ============================================================================
// StateDigest
// ============================================================================

/// StateDigest algorithm identifier.
pub const STATE_DIGEST_ALGO_ID: &str = "statedigest-v1-fnv1a64-le-f64canon-roster-posvelfin";

const FNV1A_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

#[derive(Debug, Clone)]
struct Fnv1a64 {
    state: u64,
}

impl Fnv1a64 {
    fn new() -> Self {
        Self {
            state: FNV1A_OFFSET_BASIS,
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV1A_PRIME);
        }
    }

    fn update_f64(&mut self, value: f64) {
        self.update(&canonicalize_f64(value).to_le_bytes());
    }

    fn finish(self) -> u64 {
        self.state
    }
}

/// Canonicalize an f64 value for deterministic hashing.
///
/// - `-0.0` → `+0.0`
/// - Any NaN → quiet NaN bit pattern `0x7ff8000000000000`
fn canonicalize_f64(value: f64) -> u64 {
    const QUIET_NAN_BITS: u64 = 0x7ff8000000000000;

    if value.is_nan() {
        QUIET_NAN_BITS
    } else if value == 0.0 {
        0u64
    } else {
        value.to_bits()
    }
}

// ============================================================================
// Core Types
// ============================================================================

/// A race participant as handed over by the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: OwnerId,
    pub name: String,
}

impl Participant {
    pub fn new(id: impl Into<OwnerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// One simulated marble.
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    pub owner_id: OwnerId,
    pub position: [f64; 2],
    pub velocity: [f64; 2],
    /// Once true, never reset within a race.
    pub finished: bool,
    /// Race time at which the body crossed the finish threshold.
    pub finish_time_ms: Option<u64>,
}

impl Body {
    pub fn new(owner_id: OwnerId, position: [f64; 2], velocity: [f64; 2]) -> Self {
        Self {
            owner_id,
            position,
            velocity,
            finished: false,
            finish_time_ms: None,
        }
    }

    pub fn speed(&self) -> f64 {
        (self.velocity[0] * self.velocity[0] + self.velocity[1] * self.velocity[1]).sqrt()
    }

    fn to_state(&self) -> BodyState {
        BodyState {
            owner_id: self.owner_id.clone(),
            position: self.position,
            velocity: self.velocity,
        }
    }
}

/// Position and velocity of one body at a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyState {
    pub owner_id: OwnerId,
    pub position: [f64; 2],
    pub velocity: [f64; 2],
}

/// World state after a tick. Bodies are listed in roster order.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub tick: Tick,
    pub elapsed_ms: u64,
    pub bodies: Vec<BodyState>,
    pub digest: u64,
}

/// A body crossing the finish threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishResult {
    pub owner_id: OwnerId,
    pub name: String,
    pub time_ms: u64,
    /// 1-based arrival order.
    pub rank: u32,
}

/// What happened during one `advance()` call.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Post-step tick.
    pub tick: Tick,
    /// Bodies that finished during this step, in rank order.
    pub finished: Vec<FinishResult>,
    /// True once every body has finished.
    pub complete: bool,
}

// ============================================================================
// RaceWorld
// ============================================================================

/// The authoritative state of one race: track, bodies and results.
#[derive(Debug, Clone)]
pub struct RaceWorld {
    tick: Tick,
    tick_rate_hz: u32,
    dt_seconds: f64,
    params: PhysicsParams,
    track: Track,
    /// One body per participant, in roster order.
    bodies: Vec<Body>,
    names: Vec<String>,
    results: Vec<FinishResult>,
}

impl RaceWorld {
    /// Create a race at tick 0 with one body per participant.
    ///
    /// Bodies are spread horizontally around x = 0 at the start height,
    /// moving straight down at the start velocity.
    pub fn new(
        track: Track,
        roster: &[Participant],
        params: PhysicsParams,
        tick_rate_hz: u32,
    ) -> Self {
        assert!(tick_rate_hz > 0, "tick_rate_hz must be positive");

        let spacing = params.body_radius * params.start_spacing_radii;
        let middle = (roster.len() as f64 - 1.0) / 2.0;
        let bodies = roster
            .iter()
            .enumerate()
            .map(|(index, participant)| {
                Body::new(
                    participant.id.clone(),
                    [(index as f64 - middle) * spacing, params.start_height],
                    [0.0, params.start_velocity_y],
                )
            })
            .collect();

        Self {
            tick: 0,
            tick_rate_hz,
            dt_seconds: 1.0 / f64::from(tick_rate_hz),
            params,
            track,
            bodies,
            names: roster.iter().map(|p| p.name.clone()).collect(),
            results: Vec::new(),
        }
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn tick_rate_hz(&self) -> u32 {
        self.tick_rate_hz
    }

    pub fn params(&self) -> &PhysicsParams {
        &self.params
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn bodies(&self) -> &[Body] {
        &self.bodies
    }

    pub fn body(&self, owner_id: &str) -> Option<&Body> {
        self.bodies.iter().find(|b| b.owner_id == owner_id)
    }

    /// Finish results in rank order.
    pub fn results(&self) -> &[FinishResult] {
        &self.results
    }

    /// Race time at the current tick.
    pub fn elapsed_ms(&self) -> u64 {
        self.tick * 1000 / u64::from(self.tick_rate_hz)
    }

    /// True when every body has finished. A race without bodies is complete.
    pub fn is_complete(&self) -> bool {
        self.results.len() == self.bodies.len()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tick: self.tick,
            elapsed_ms: self.elapsed_ms(),
            bodies: self.bodies.iter().map(Body::to_state).collect(),
            digest: self.state_digest(),
        }
    }

    /// Advance the race from tick T to T+1.
    ///
    /// Each unfinished body is integrated (gravity, damping, position, speed
    /// clamp), resolved against every obstacle, then checked against the
    /// finish threshold. Bodies crossing in the same step are ranked in
    /// roster order.
    ///
    /// # Panics
    /// If `tick != self.tick()`.
    pub fn advance(&mut self, tick: Tick) -> StepOutcome {
        assert_eq!(
            tick, self.tick,
            "advance() tick mismatch: expected {}, got {}",
            self.tick, tick
        );

        self.integrate();
        self.resolve_collisions();
        self.tick += 1;
        let finished = self.detect_finishes();

        StepOutcome {
            tick: self.tick,
            finished,
            complete: self.is_complete(),
        }
    }

    /// Compute the StateDigest for the current race state.
    ///
    /// FNV-1a 64 over the tick and, in roster order, each body's owner id,
    /// position, velocity and finished flag.
    pub fn state_digest(&self) -> u64 {
        let mut hasher = Fnv1a64::new();
        hasher.update(&self.tick.to_le_bytes());

        for body in &self.bodies {
            let owner = body.owner_id.as_bytes();
            hasher.update(&(owner.len() as u64).to_le_bytes());
            hasher.update(owner);
            hasher.update_f64(body.position[0]);
            hasher.update_f64(body.position[1]);
            hasher.update_f64(body.velocity[0]);
            hasher.update_f64(body.velocity[1]);
            hasher.update(&[u8::from(body.finished)]);
        }

        hasher.finish()
    }

    // ========================================================================
    // Internal Methods
    // ========================================================================

    fn integrate(&mut self) {
        let params = self.params;
        let dt = self.dt_seconds;
        let keep = 1.0 - params.linear_damping;

        for body in self.bodies.iter_mut().filter(|b| !b.finished) {
            body.velocity[1] += params.gravity_y * dt;
            body.velocity[0] *= keep;
            body.velocity[1] *= keep;
            body.position[0] += body.velocity[0] * dt;
            body.position[1] += body.velocity[1] * dt;
            body.velocity = clamp_magnitude(body.velocity, params.max_speed);
        }
    }

    fn resolve_collisions(&mut self) {
        for obstacle in &self.track.obstacles {
            for body in self.bodies.iter_mut().filter(|b| !b.finished) {
                let resolution = resolve(body, obstacle, &self.params);
                body.position[0] += resolution.position_delta[0];
                body.position[1] += resolution.position_delta[1];
                body.velocity = resolution.velocity;
            }
        }
    }

    fn detect_finishes(&mut self) -> Vec<FinishResult> {
        let elapsed_ms = self.elapsed_ms();
        let finish_line_y = self.track.finish_line_y;
        let mut finished = Vec::new();

        for (body, name) in self.bodies.iter_mut().zip(&self.names) {
            if body.finished || body.position[1] >= finish_line_y {
                continue;
            }
            body.finished = true;
            body.finish_time_ms = Some(elapsed_ms);

            let result = FinishResult {
                owner_id: body.owner_id.clone(),
                name: name.clone(),
                time_ms: elapsed_ms,
                rank: (self.results.len() + 1) as u32,
            };
            self.results.push(result.clone());
            finished.push(result);
        }

        finished
    }
}

/// Clamp a 2D vector's magnitude to a maximum value.
fn clamp_magnitude(v: [f64; 2], max_magnitude: f64) -> [f64; 2] {
    let magnitude_sq = v[0] * v[0] + v[1] * v[1];
    let max_sq = max_magnitude * max_magnitude;
    if magnitude_sq <= max_sq {
        v
    } else {
        let scale = max_magnitude / magnitude_sq.sqrt();
        [v[0] * scale, v[1] * scale]
    }
}

// ============================================================================
// Tests
// ============================================================================
