//! Marble Race Client Reconciliation Buffer
//!
//! Snapshots arrive at a low rate, late, and possibly out of order. The
//! buffer keeps them sorted by server time and renders a fixed delay in the
//! past, interpolating each body's position between the two snapshots that
//! bracket the render time. It never extrapolates past the buffered span.

#![deny(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use marble_sim::{BodyState, OwnerId};
use marble_wire::SnapshotProto;

/// Render delay behind the newest server time.
pub const INTERPOLATION_DELAY_MS: u64 = 150;

/// Snapshots kept before the oldest is evicted.
pub const BUFFER_CAPACITY: usize = 120;

#[derive(Debug, Clone)]
struct BufferedSnapshot {
    server_time_ms: u64,
    positions: HashMap<OwnerId, [f64; 2]>,
}

/// Bounded, time-ordered history of received snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotBuffer {
    delay_ms: u64,
    capacity: usize,
    snapshots: VecDeque<BufferedSnapshot>,
}

impl Default for SnapshotBuffer {
    fn default() -> Self {
        Self::new(INTERPOLATION_DELAY_MS, BUFFER_CAPACITY)
    }
}

impl SnapshotBuffer {
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(delay_ms: u64, capacity: usize) -> Self {
        assert!(capacity > 0, "SnapshotBuffer capacity must be positive");
        Self {
            delay_ms,
            capacity,
            snapshots: VecDeque::with_capacity(capacity),
        }
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    /// Server time of the newest buffered snapshot.
    pub fn latest_server_time_ms(&self) -> Option<u64> {
        self.snapshots.back().map(|s| s.server_time_ms)
    }

    /// Insert a snapshot in server-time order.
    ///
    /// Malformed bodies are skipped individually. A snapshot with a server
    /// time already buffered is a duplicate and ignored, as is one older than
    /// everything in a full buffer. Returns whether the snapshot was kept.
    pub fn push(&mut self, snapshot: SnapshotProto) -> bool {
        let server_time_ms = snapshot.server_time_ms;
        let index = self
            .snapshots
            .partition_point(|s| s.server_time_ms < server_time_ms);

        if self
            .snapshots
            .get(index)
            .is_some_and(|s| s.server_time_ms == server_time_ms)
        {
            tracing::debug!(server_time_ms, "Ignoring duplicate snapshot");
            return false;
        }
        if index == 0 && self.snapshots.len() == self.capacity {
            tracing::debug!(server_time_ms, "Dropping snapshot older than a full buffer");
            return false;
        }

        let mut positions = HashMap::with_capacity(snapshot.bodies.len());
        for body in snapshot.bodies {
            match BodyState::try_from(body) {
                Ok(state) => {
                    positions.insert(state.owner_id, state.position);
                }
                Err(reason) => {
                    tracing::debug!(server_time_ms, reason, "Skipping malformed body");
                }
            }
        }

        self.snapshots.insert(
            index,
            BufferedSnapshot {
                server_time_ms,
                positions,
            },
        );
        if self.snapshots.len() > self.capacity {
            self.snapshots.pop_front();
        }
        true
    }

    /// Interpolated position of every known owner at `now_ms - delay`.
    ///
    /// Empty buffer: empty map. One snapshot: its positions. A render time
    /// outside the buffered span clamps to the oldest or newest snapshot.
    pub fn sample(&self, now_ms: u64) -> HashMap<OwnerId, [f64; 2]> {
        let len = self.snapshots.len();
        match len {
            0 => return HashMap::new(),
            1 => return self.snapshots[0].positions.clone(),
            _ => {}
        }

        let render_time = now_ms as f64 - self.delay_ms as f64;

        // Newest snapshot at or before the render time.
        let at_or_before = (0..len)
            .rev()
            .find(|&i| self.snapshots[i].server_time_ms as f64 <= render_time);
        let (older, newer) = match at_or_before {
            Some(i) if i + 1 < len => (i, i + 1),
            Some(i) => (i - 1, i),
            None => (0, 1),
        };
        let older = &self.snapshots[older];
        let newer = &self.snapshots[newer];

        let span = (newer.server_time_ms - older.server_time_ms) as f64;
        let t = if span > 0.0 {
            ((render_time - older.server_time_ms as f64) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let mut positions = HashMap::with_capacity(older.positions.len().max(newer.positions.len()));
        for (owner, from) in &older.positions {
            let position = match newer.positions.get(owner) {
                Some(to) => lerp(*from, *to, t),
                None => *from,
            };
            positions.insert(owner.clone(), position);
        }
        for (owner, to) in &newer.positions {
            positions.entry(owner.clone()).or_insert(*to);
        }
        positions
    }
}

fn lerp(from: [f64; 2], to: [f64; 2], t: f64) -> [f64; 2] {
    if t <= 0.0 {
        from
    } else if t >= 1.0 {
        to
    } else {
        [
            from[0] + (to[0] - from[0]) * t,
            from[1] + (to[1] - from[1]) * t,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marble_wire::{BodyStateProto, Vec2Proto};

    fn body(owner: &str, x: f64, y: f64) -> BodyStateProto {
        BodyStateProto {
            owner_id: owner.to_string(),
            position: Some(Vec2Proto { x, y }),
            velocity: Some(Vec2Proto { x: 0.0, y: 0.0 }),
        }
    }

    fn snapshot(server_time_ms: u64, bodies: Vec<BodyStateProto>) -> SnapshotProto {
        SnapshotProto {
            tick: 0,
            elapsed_ms: 0,
            server_time_ms,
            bodies,
        }
    }

    /// One owner moving along x at 0.2 units per ms.
    fn linear_buffer() -> SnapshotBuffer {
        let mut buffer = SnapshotBuffer::default();
        for (time, x) in [(0, 0.0), (100, 20.0), (200, 40.0)] {
            assert!(buffer.push(snapshot(time, vec![body("a", x, -1.0)])));
        }
        buffer
    }

    #[test]
    fn test_midpoint_interpolation() {
        let buffer = linear_buffer();
        let positions = buffer.sample(50 + INTERPOLATION_DELAY_MS);
        assert_eq!(positions["a"], [10.0, -1.0]);
    }

    #[test]
    fn test_identity_at_snapshot_boundaries() {
        let buffer = linear_buffer();
        for (time, x) in [(0, 0.0), (100, 20.0), (200, 40.0)] {
            let positions = buffer.sample(time + INTERPOLATION_DELAY_MS);
            assert_eq!(positions["a"], [x, -1.0], "render time {time}");
        }
    }

    #[test]
    fn test_render_time_before_oldest_returns_oldest() {
        let mut buffer = SnapshotBuffer::default();
        buffer.push(snapshot(1_000, vec![body("a", 3.0, 4.0)]));
        buffer.push(snapshot(1_100, vec![body("a", 5.0, 6.0)]));

        assert_eq!(buffer.sample(0)["a"], [3.0, 4.0]);
        assert_eq!(buffer.sample(1_000)["a"], [3.0, 4.0]);
    }

    #[test]
    fn test_render_time_after_newest_does_not_extrapolate() {
        let buffer = linear_buffer();
        let positions = buffer.sample(10_000);
        assert_eq!(positions["a"], [40.0, -1.0]);
    }

    #[test]
    fn test_out_of_order_push_is_sorted() {
        let mut buffer = SnapshotBuffer::default();
        buffer.push(snapshot(200, vec![body("a", 40.0, 0.0)]));
        buffer.push(snapshot(0, vec![body("a", 0.0, 0.0)]));
        buffer.push(snapshot(100, vec![body("a", 20.0, 0.0)]));

        assert_eq!(buffer.latest_server_time_ms(), Some(200));
        assert_eq!(buffer.sample(150 + INTERPOLATION_DELAY_MS)["a"], [30.0, 0.0]);
    }

    #[test]
    fn test_duplicate_push_is_ignored() {
        let mut buffer = linear_buffer();
        assert!(!buffer.push(snapshot(100, vec![body("a", 999.0, 0.0)])));
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.sample(100 + INTERPOLATION_DELAY_MS)["a"], [20.0, -1.0]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut buffer = SnapshotBuffer::new(0, 3);
        for time in 0..5u64 {
            buffer.push(snapshot(time * 10, vec![body("a", time as f64, 0.0)]));
        }
        assert_eq!(buffer.len(), 3);
        // Oldest kept snapshot is at 20 ms.
        assert_eq!(buffer.sample(0)["a"], [2.0, 0.0]);
        assert_eq!(buffer.latest_server_time_ms(), Some(40));
    }

    #[test]
    fn test_late_snapshot_into_full_buffer_is_not_kept() {
        let mut buffer = SnapshotBuffer::new(0, 2);
        assert!(buffer.push(snapshot(100, vec![body("a", 1.0, 0.0)])));
        assert!(buffer.push(snapshot(200, vec![body("a", 2.0, 0.0)])));

        assert!(!buffer.push(snapshot(50, vec![body("a", 0.5, 0.0)])));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.sample(0)["a"], [1.0, 0.0]);

        // A late snapshot that still fits between buffered ones is kept.
        assert!(buffer.push(snapshot(150, vec![body("a", 1.5, 0.0)])));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.sample(0)["a"], [1.5, 0.0]);
    }

    #[test]
    fn test_empty_and_single_snapshot() {
        let mut buffer = SnapshotBuffer::default();
        assert!(buffer.is_empty());
        assert!(buffer.sample(1_000).is_empty());

        buffer.push(snapshot(500, vec![body("a", 1.0, 2.0)]));
        assert_eq!(buffer.sample(0)["a"], [1.0, 2.0]);
        assert_eq!(buffer.sample(5_000)["a"], [1.0, 2.0]);
    }

    #[test]
    fn test_owner_missing_from_one_side_uses_known_value() {
        let mut buffer = SnapshotBuffer::new(0, 10);
        buffer.push(snapshot(0, vec![body("a", 0.0, 0.0), body("gone", 7.0, 7.0)]));
        buffer.push(snapshot(100, vec![body("a", 10.0, 0.0), body("new", 3.0, 3.0)]));

        let positions = buffer.sample(50);
        assert_eq!(positions["a"], [5.0, 0.0]);
        assert_eq!(positions["gone"], [7.0, 7.0]);
        assert_eq!(positions["new"], [3.0, 3.0]);
    }

    #[test]
    fn test_malformed_body_is_skipped() {
        let mut buffer = SnapshotBuffer::new(0, 10);
        let broken = BodyStateProto {
            owner_id: "b".to_string(),
            position: None,
            velocity: None,
        };
        let anonymous = body("", 1.0, 1.0);
        assert!(buffer.push(snapshot(0, vec![body("a", 1.0, 2.0), broken, anonymous])));

        let positions = buffer.sample(0);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions["a"], [1.0, 2.0]);
    }

    #[test]
    fn test_fraction_is_clamped() {
        let mut buffer = SnapshotBuffer::new(0, 10);
        buffer.push(snapshot(100, vec![body("a", 0.0, 0.0)]));
        buffer.push(snapshot(200, vec![body("a", 10.0, 0.0)]));
        for now in [0, 50, 100, 150, 200, 250, 1_000] {
            let x = buffer.sample(now)["a"][0];
            assert!((0.0..=10.0).contains(&x), "now {now}: x {x}");
        }
    }

    #[test]
    fn test_clear_empties_buffer() {
        let mut buffer = linear_buffer();
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.latest_server_time_ms(), None);
    }
}
