//! Server Edge configuration.
//!
//! Defaults come from the simulation constants; every value can be overridden
//! from the environment. Unparseable or zero values fall back to the default.

use std::env;

use marble_sim::{PhysicsParams, TICK_RATE_HZ};

/// Snapshot broadcast rate in Hz.
pub const SNAPSHOT_RATE_HZ: u32 = 15;

pub const ENV_TICK_RATE_HZ: &str = "MARBLE_TICK_RATE_HZ";
pub const ENV_SNAPSHOT_RATE_HZ: &str = "MARBLE_SNAPSHOT_RATE_HZ";
pub const ENV_SEED: &str = "MARBLE_SEED";

/// Configuration shared by every race a server runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub tick_rate_hz: u32,
    pub snapshot_rate_hz: u32,
    pub physics: PhysicsParams,
    /// Fixed track seed. `None` draws a fresh seed per race.
    pub seed: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: TICK_RATE_HZ,
            snapshot_rate_hz: SNAPSHOT_RATE_HZ,
            physics: PhysicsParams::default(),
            seed: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let tick_rate_hz = read_env_u32(&lookup, ENV_TICK_RATE_HZ, TICK_RATE_HZ);
        let mut snapshot_rate_hz = read_env_u32(&lookup, ENV_SNAPSHOT_RATE_HZ, SNAPSHOT_RATE_HZ);

        if snapshot_rate_hz > tick_rate_hz {
            tracing::warn!(
                "{} ({}) > {} ({}). Clamping snapshot rate to tick rate.",
                ENV_SNAPSHOT_RATE_HZ,
                snapshot_rate_hz,
                ENV_TICK_RATE_HZ,
                tick_rate_hz
            );
            snapshot_rate_hz = tick_rate_hz;
        }

        let seed = lookup(ENV_SEED).and_then(|value| {
            let parsed = parse_seed_value(&value);
            if parsed.is_none() {
                tracing::warn!("{} ({:?}) is not a valid seed, ignoring", ENV_SEED, value);
            }
            parsed
        });

        Self {
            tick_rate_hz,
            snapshot_rate_hz,
            physics: PhysicsParams::default(),
            seed,
        }
    }
}

/// Accepts a decimal integer, or hex with a `0x` prefix (which also covers
/// a track's seed label written as `0x` + label). Signs are rejected.
pub fn parse_seed_value(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, radix) = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => (hex, 16),
        None => (value, 10),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

pub fn read_env_u32(lookup: impl Fn(&str) -> Option<String>, name: &str, default: u32) -> u32 {
    lookup(name)
        .and_then(|value| value.trim().parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

pub fn read_env_u64(lookup: impl Fn(&str) -> Option<String>, name: &str, default: u64) -> u64 {
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

pub fn read_env_string(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
