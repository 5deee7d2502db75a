//! Headless marble race server.
//!
//! Runs one race for a generated roster and prints every event as a JSON
//! envelope on stdout, one per line. Logs go to stderr.
//!
//! Environment:
//! - `MARBLE_TICK_RATE_HZ`, `MARBLE_SNAPSHOT_RATE_HZ`, `MARBLE_SEED`: see `ServerConfig`
//! - `MARBLE_DEMO_PLAYERS`: roster size (default 4)
//! - `MARBLE_DEMO_TIMEOUT_SECS`: reset the race after this long (default 120)
//! - `MARBLE_REPLAY_PATH`: write the race record here
//! - `MARBLE_GIT_COMMIT`: recorded in the build fingerprint

use std::env;
use std::path::Path;
use std::time::Duration;

use marble_replay::{acquire_build_fingerprint, write_replay};
use marble_server::RaceEvent;
use marble_server::ServerConfig;
use marble_server::config::{read_env_string, read_env_u32, read_env_u64};
use marble_server::session::{ConfiguredRaceFactory, RaceSession, Roster};
use marble_sim::Participant;

const DEFAULT_DEMO_PLAYERS: u32 = 4;
const DEFAULT_DEMO_TIMEOUT_SECS: u64 = 120;

const HOST_ID: &str = "player-1";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let lookup = |name: &str| env::var(name).ok();
    let config = ServerConfig::from_env();
    let players = read_env_u32(lookup, "MARBLE_DEMO_PLAYERS", DEFAULT_DEMO_PLAYERS);
    let timeout_secs = read_env_u64(lookup, "MARBLE_DEMO_TIMEOUT_SECS", DEFAULT_DEMO_TIMEOUT_SECS);
    let replay_path = read_env_string(lookup, "MARBLE_REPLAY_PATH");

    tracing::info!(
        tick_rate_hz = config.tick_rate_hz,
        snapshot_rate_hz = config.snapshot_rate_hz,
        seed = ?config.seed,
        players,
        "Starting marble-server"
    );

    let fingerprint = match acquire_build_fingerprint() {
        Ok(fingerprint) => Some(fingerprint),
        Err(e) => {
            tracing::warn!("Build fingerprint unavailable: {}", e);
            None
        }
    };

    let participants = (1..=players)
        .map(|i| Participant::new(format!("player-{i}"), format!("Player {i}")))
        .collect();
    let roster = Roster::new(HOST_ID, participants);
    let mut session = RaceSession::new(roster, ConfiguredRaceFactory::new(config, fingerprint));

    let race = session.request_start(HOST_ID)?;
    let mut snapshots = race.snapshots();
    let mut snapshots_open = true;
    let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
    tokio::pin!(deadline);

    let timed_out = 'events: loop {
        tokio::select! {
            event = race.next_event() => match event {
                Some(event) => println!("{}", event.to_json()?),
                None => break 'events false,
            },
            changed = snapshots.changed(), if snapshots_open => {
                if changed.is_err() {
                    snapshots_open = false;
                    continue 'events;
                }
                let latest = snapshots.borrow_and_update().clone();
                if let Some(snapshot) = latest {
                    println!("{}", RaceEvent::Snapshot(snapshot).to_json()?);
                }
            }
            _ = &mut deadline => break 'events true,
        }
    };

    let race = if timed_out {
        tracing::warn!(timeout_secs, "Race timed out, resetting");
        session.request_reset(HOST_ID)?
    } else {
        session.take_race()
    };
    let race = race.ok_or("race handle missing")?;
    let outcome = race.join().await?;

    tracing::info!(
        end_reason = outcome.end_reason.as_str(),
        finishers = outcome.results.len(),
        "Race over"
    );
    for result in &outcome.results {
        tracing::info!(rank = result.rank, name = %result.name, time_ms = result.time_ms, "Result");
    }

    if let (Some(path), Some(record)) = (replay_path, outcome.record.as_ref()) {
        write_replay(record, Path::new(&path))?;
    }

    Ok(())
}
