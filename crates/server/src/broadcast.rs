//! Snapshot Broadcaster.
//!
//! Snapshots are down-sampled from the physics tick with a counter check
//! inside the tick itself, so broadcasting never touches body state from a
//! second task and never delays a physics step.

use marble_sim::{RaceWorld, Tick};
use marble_wire::SnapshotProto;

/// Decides which post-step ticks carry a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotCadence {
    interval_ticks: u64,
}

impl SnapshotCadence {
    /// Cadence emitting roughly `snapshot_rate_hz` snapshots per second of
    /// simulated time. Rates at or above the tick rate emit every tick.
    pub fn new(tick_rate_hz: u32, snapshot_rate_hz: u32) -> Self {
        let interval = if snapshot_rate_hz == 0 {
            u64::from(tick_rate_hz)
        } else {
            (f64::from(tick_rate_hz) / f64::from(snapshot_rate_hz)).round() as u64
        };
        Self {
            interval_ticks: interval.max(1),
        }
    }

    pub fn interval_ticks(&self) -> u64 {
        self.interval_ticks
    }

    /// True for the first post-step tick and every `interval_ticks` after it.
    pub fn should_emit(&self, tick: Tick) -> bool {
        tick > 0 && (tick - 1) % self.interval_ticks == 0
    }
}

/// Current state of every body, stamped with the emission time.
pub fn snapshot_payload(world: &RaceWorld, server_time_ms: u64) -> SnapshotProto {
    SnapshotProto::from_snapshot(&world.snapshot(), server_time_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use marble_sim::{Participant, PhysicsParams, Track};

    #[test]
    fn test_default_rates_emit_every_fourth_tick() {
        let cadence = SnapshotCadence::new(60, 15);
        assert_eq!(cadence.interval_ticks(), 4);
        let emitted: Vec<Tick> = (1..=12).filter(|t| cadence.should_emit(*t)).collect();
        assert_eq!(emitted, vec![1, 5, 9]);
    }

    #[test]
    fn test_cadence_never_below_one_tick() {
        assert_eq!(SnapshotCadence::new(60, 60).interval_ticks(), 1);
        assert_eq!(SnapshotCadence::new(30, 60).interval_ticks(), 1);
        assert_eq!(SnapshotCadence::new(60, 0).interval_ticks(), 60);
        assert!(!SnapshotCadence::new(60, 60).should_emit(0));
    }

    #[test]
    fn test_non_integer_ratio_rounds() {
        assert_eq!(SnapshotCadence::new(60, 25).interval_ticks(), 2);
        assert_eq!(SnapshotCadence::new(60, 7).interval_ticks(), 9);
    }

    #[test]
    fn test_snapshot_payload_carries_all_bodies() {
        let roster = vec![Participant::new("a", "Ann"), Participant::new("b", "Ben")];
        let mut world = RaceWorld::new(
            Track::open("t", -100.0),
            &roster,
            PhysicsParams::default(),
            60,
        );
        world.advance(0);

        let payload = snapshot_payload(&world, 1_234);
        assert_eq!(payload.tick, 1);
        assert_eq!(payload.elapsed_ms, 16);
        assert_eq!(payload.server_time_ms, 1_234);
        assert_eq!(payload.bodies.len(), 2);
        assert_eq!(payload.bodies[0].owner_id, "a");
        let position = payload.bodies[1].position.unwrap();
        assert_eq!([position.x, position.y], world.bodies()[1].position);
    }
}
