//! Procedural track generation.
//!
//! A track is a column of tilted platforms between two boundary walls, with a
//! finish threshold below the last platform. All randomness is drawn from a
//! `Pcg32` seeded by the caller, so the same seed always yields the same
//! track. Overlapping platforms are allowed.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

/// RNG algorithm identifier recorded alongside seeds.
pub const RNG_ALGORITHM: &str = "Pcg32";

/// Vertical position the platform walk starts from.
pub const PLATFORM_START_Y: f64 = -20.0;

/// Inclusive range of generated platform counts.
pub const MIN_PLATFORMS: u32 = 6;
pub const MAX_PLATFORMS: u32 = 9;

/// Vertical gap between consecutive platforms: `GAP_MIN + [0, GAP_SPAN)`.
const GAP_MIN: f64 = 15.0;
const GAP_SPAN: f64 = 12.0;

/// Full platform width: `WIDTH_MIN + [0, WIDTH_SPAN)`.
const WIDTH_MIN: f64 = 14.0;
const WIDTH_SPAN: f64 = 10.0;

/// Full platform thickness: `THICKNESS_MIN + [0, THICKNESS_SPAN)`.
const THICKNESS_MIN: f64 = 1.6;
const THICKNESS_SPAN: f64 = 1.2;

/// Platform tilt is drawn from `±MAX_TILT_TURNS * PI` radians.
const MAX_TILT_TURNS: f64 = 0.11;

/// Horizontal platform offset is drawn from `±MAX_X_OFFSET`.
const MAX_X_OFFSET: f64 = 5.0;

/// Distance from the last platform down to the finish threshold.
pub const FINISH_DROP: f64 = 25.0;

/// Walls start here and run down past the finish threshold.
const WALL_TOP_Y: f64 = -80.0;
const WALL_OVERRUN: f64 = 10.0;

/// Wall centers sit at `±WALL_OFFSET_X`.
pub const WALL_OFFSET_X: f64 = 14.0;
const WALL_THICKNESS: f64 = 1.2;

/// Collision role of an obstacle. Walls and platforms bounce differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObstacleKind {
    Platform,
    Wall,
}

impl ObstacleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Platform => "platform",
            Self::Wall => "wall",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "platform" => Some(Self::Platform),
            "wall" => Some(Self::Wall),
            _ => None,
        }
    }
}

/// A static box, rotated counter-clockwise about its center.
#[derive(Debug, Clone, PartialEq)]
pub struct Obstacle {
    pub id: String,
    pub kind: ObstacleKind,
    pub center: [f64; 2],
    pub half_extents: [f64; 2],
    /// Radians; zero for axis-aligned boxes.
    pub rotation: f64,
}

impl Obstacle {
    pub fn platform(
        id: impl Into<String>,
        center: [f64; 2],
        half_extents: [f64; 2],
        rotation: f64,
    ) -> Self {
        Self {
            id: id.into(),
            kind: ObstacleKind::Platform,
            center,
            half_extents,
            rotation,
        }
    }

    pub fn wall(id: impl Into<String>, center: [f64; 2], half_extents: [f64; 2]) -> Self {
        Self {
            id: id.into(),
            kind: ObstacleKind::Wall,
            center,
            half_extents,
            rotation: 0.0,
        }
    }
}

/// Obstacle layout and finish threshold for one race. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub seed: String,
    pub obstacles: Vec<Obstacle>,
    /// Bodies finish once their y drops below this value.
    pub finish_line_y: f64,
}

impl Track {
    /// Generate the track for `seed`.
    pub fn generate(seed: u64) -> Self {
        let mut rng = Pcg32::seed_from_u64(seed);
        Self::generate_with(&mut rng, format_seed(seed))
    }

    /// Generate a track from an arbitrary RNG, labelling it with `seed`.
    pub fn generate_with<R: Rng>(rng: &mut R, seed: String) -> Self {
        let platform_count = rng.random_range(MIN_PLATFORMS..=MAX_PLATFORMS);
        let mut obstacles = Vec::with_capacity(platform_count as usize + 2);

        let mut current_y = PLATFORM_START_Y;
        for index in 0..platform_count {
            current_y -= GAP_MIN + rng.random::<f64>() * GAP_SPAN;
            let width = WIDTH_MIN + rng.random::<f64>() * WIDTH_SPAN;
            let thickness = THICKNESS_MIN + rng.random::<f64>() * THICKNESS_SPAN;
            let rotation =
                (rng.random::<f64>() * 2.0 * MAX_TILT_TURNS - MAX_TILT_TURNS) * std::f64::consts::PI;
            let x_offset = rng.random::<f64>() * 2.0 * MAX_X_OFFSET - MAX_X_OFFSET;

            obstacles.push(Obstacle::platform(
                format!("plat_{index}"),
                [x_offset, current_y],
                [width / 2.0, thickness / 2.0],
                rotation,
            ));
        }

        let finish_line_y = current_y - FINISH_DROP;

        // y decreases downward, so the wall runs from WALL_TOP_Y down to the bottom.
        let wall_bottom_y = finish_line_y - WALL_OVERRUN;
        let wall_center_y = (WALL_TOP_Y + wall_bottom_y) / 2.0;
        let wall_half_extents = [WALL_THICKNESS / 2.0, (WALL_TOP_Y - wall_bottom_y).abs() / 2.0];
        obstacles.push(Obstacle::wall(
            "wall_left",
            [-WALL_OFFSET_X, wall_center_y],
            wall_half_extents,
        ));
        obstacles.push(Obstacle::wall(
            "wall_right",
            [WALL_OFFSET_X, wall_center_y],
            wall_half_extents,
        ));

        Self {
            seed,
            obstacles,
            finish_line_y,
        }
    }

    /// A track with no obstacles at all.
    pub fn open(seed: impl Into<String>, finish_line_y: f64) -> Self {
        Self {
            seed: seed.into(),
            obstacles: Vec::new(),
            finish_line_y,
        }
    }

    pub fn platforms(&self) -> impl Iterator<Item = &Obstacle> {
        self.obstacles
            .iter()
            .filter(|o| o.kind == ObstacleKind::Platform)
    }

    pub fn walls(&self) -> impl Iterator<Item = &Obstacle> {
        self.obstacles.iter().filter(|o| o.kind == ObstacleKind::Wall)
    }
}

/// Seed label stored on a generated track.
pub fn format_seed(seed: u64) -> String {
    format!("{seed:016x}")
}

/// Inverse of [`format_seed`]: exactly 16 hex digits, nothing else.
pub fn parse_seed(label: &str) -> Option<u64> {
    if label.len() != 16 || !label.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(label, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_track() {
        assert_eq!(Track::generate(7), Track::generate(7));
        assert_ne!(Track::generate(7), Track::generate(8));
    }

    #[test]
    fn test_platform_count_and_walls() {
        for seed in 0..64 {
            let track = Track::generate(seed);
            let platforms = track.platforms().count() as u32;
            assert!(
                (MIN_PLATFORMS..=MAX_PLATFORMS).contains(&platforms),
                "seed {seed}: {platforms} platforms"
            );
            assert_eq!(track.walls().count(), 2);
            assert_eq!(track.obstacles.len() as u32, platforms + 2);
        }
    }

    #[test]
    fn test_platform_dimensions_within_bounds() {
        let max_tilt = MAX_TILT_TURNS * std::f64::consts::PI;
        for seed in 0..64 {
            let track = Track::generate(seed);
            let mut previous_y = PLATFORM_START_Y;
            for platform in track.platforms() {
                let gap = previous_y - platform.center[1];
                assert!(gap > GAP_MIN - 1e-9 && gap < GAP_MIN + GAP_SPAN + 1e-9);
                previous_y = platform.center[1];

                let width = platform.half_extents[0] * 2.0;
                let thickness = platform.half_extents[1] * 2.0;
                assert!((WIDTH_MIN..WIDTH_MIN + WIDTH_SPAN).contains(&width));
                assert!((THICKNESS_MIN..THICKNESS_MIN + THICKNESS_SPAN).contains(&thickness));
                assert!(platform.rotation.abs() <= max_tilt);
                assert!(platform.center[0].abs() <= MAX_X_OFFSET);
            }
            assert_eq!(track.finish_line_y, previous_y - FINISH_DROP);
        }
    }

    #[test]
    fn test_walls_span_past_finish() {
        let track = Track::generate(99);
        let walls: Vec<_> = track.walls().collect();
        assert_eq!(walls[0].center[0], -WALL_OFFSET_X);
        assert_eq!(walls[1].center[0], WALL_OFFSET_X);
        for wall in walls {
            assert_eq!(wall.rotation, 0.0);
            let top = wall.center[1] + wall.half_extents[1];
            let bottom = wall.center[1] - wall.half_extents[1];
            assert!((top - WALL_TOP_Y).abs() < 1e-9);
            assert!((bottom - (track.finish_line_y - WALL_OVERRUN)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_seed_label_roundtrip() {
        let track = Track::generate(0xdead_beef);
        assert_eq!(track.seed, "00000000deadbeef");
        assert_eq!(parse_seed(&track.seed), Some(0xdead_beef));
        assert_eq!(parse_seed("xyz"), None);
        assert_eq!(parse_seed("zzzzzzzzzzzzzzzz"), None);
        assert_eq!(parse_seed("+00000000deadbee"), None);
        assert_eq!(parse_seed("-00000000deadbee"), None);
    }

    #[test]
    fn test_obstacle_kind_parse() {
        assert_eq!(ObstacleKind::parse("wall"), Some(ObstacleKind::Wall));
        assert_eq!(
            ObstacleKind::parse(ObstacleKind::Platform.as_str()),
            Some(ObstacleKind::Platform)
        );
        assert_eq!(ObstacleKind::parse("ramp"), None);
    }
}
