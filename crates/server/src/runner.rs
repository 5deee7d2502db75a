//! Per-race tick task.
//!
//! Each race runs in its own tokio task: one sequential loop that steps the
//! simulation at the tick rate and forwards events. Reliable events go out
//! on an unbounded channel in order; snapshots go through a `watch` channel,
//! so a slow consumer only ever sees the latest one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use marble_sim::FinishResult;
use marble_wire::{RaceRecord, SnapshotProto};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior, interval};

use crate::{EndReason, RaceEvent, RaceInstance, RacePhase, StartError};

/// Wall-clock milliseconds derived from a monotonic tokio clock.
#[derive(Debug, Clone, Copy)]
pub struct RaceClock {
    epoch_ms: u64,
    origin: Instant,
}

impl RaceClock {
    /// Anchor at the current system time.
    pub fn system() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::anchored(epoch_ms)
    }

    pub fn anchored(epoch_ms: u64) -> Self {
        Self {
            epoch_ms,
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch_ms + self.origin.elapsed().as_millis() as u64
    }
}

/// How a race task ended.
#[derive(Debug, Clone)]
pub struct RaceOutcome {
    pub end_reason: EndReason,
    /// Results in rank order. Partial when cancelled.
    pub results: Vec<FinishResult>,
    pub record: Option<RaceRecord>,
}

/// Owner's side of a running race.
///
/// Dropping the handle cancels the race.
pub struct RaceHandle {
    cancel: Option<oneshot::Sender<()>>,
    /// Shared with the task; checked under the snapshot channel's lock.
    stop: Arc<AtomicBool>,
    cancelled: bool,
    events: mpsc::UnboundedReceiver<RaceEvent>,
    snapshots: watch::Receiver<Option<SnapshotProto>>,
    task: JoinHandle<RaceOutcome>,
}

impl RaceHandle {
    /// Stop the race before its next tick. Events not yet received are
    /// discarded.
    pub fn cancel(&mut self) {
        {
            // Holding the read lock orders this against an in-flight
            // publish: it either landed already or will see the flag.
            let _latest = self.snapshots.borrow();
            self.stop.store(true, Ordering::SeqCst);
        }
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.cancelled = true;
        self.events.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// True once the race task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Next reliable event, in emission order. `None` once the race has
    /// ended and every event was received, or after `cancel()`.
    pub async fn next_event(&mut self) -> Option<RaceEvent> {
        if self.cancelled {
            return None;
        }
        self.events.recv().await
    }

    /// Receiver for the latest snapshot. `None` until the first one.
    pub fn snapshots(&self) -> watch::Receiver<Option<SnapshotProto>> {
        self.snapshots.clone()
    }

    /// Wait for the race task to exit.
    pub async fn join(self) -> Result<RaceOutcome, JoinError> {
        let Self { cancel, task, .. } = self;
        let outcome = task.await;
        // Held until here so waiting does not cancel the race.
        drop(cancel);
        outcome
    }
}

/// Start `race` and spawn its tick task.
///
/// The `raceStarted` and `trackData` events are queued before this returns.
/// Must be called from within a tokio runtime.
pub fn spawn_race(mut race: RaceInstance) -> Result<RaceHandle, StartError> {
    let clock = RaceClock::system();
    let start_events = race.start(clock.now_ms())?;

    let (event_tx, events) = mpsc::unbounded_channel();
    for event in start_events {
        let _ = event_tx.send(event);
    }
    let (snapshot_tx, snapshots) = watch::channel(None);
    let (cancel, cancel_rx) = oneshot::channel();
    let stop = Arc::new(AtomicBool::new(false));

    let task = tokio::spawn(run_race(
        race,
        clock,
        event_tx,
        snapshot_tx,
        cancel_rx,
        Arc::clone(&stop),
    ));

    Ok(RaceHandle {
        cancel: Some(cancel),
        stop,
        cancelled: false,
        events,
        snapshots,
        task,
    })
}

async fn run_race(
    mut race: RaceInstance,
    clock: RaceClock,
    events: mpsc::UnboundedSender<RaceEvent>,
    snapshots: watch::Sender<Option<SnapshotProto>>,
    mut cancel: oneshot::Receiver<()>,
    stop: Arc<AtomicBool>,
) -> RaceOutcome {
    let tick_rate_hz = u64::from(race.config().tick_rate_hz.max(1));
    let mut ticker = interval(Duration::from_nanos(1_000_000_000 / tick_rate_hz));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; step one period after start.
    ticker.tick().await;

    let end_reason = 'race: loop {
        tokio::select! {
            biased;
            _ = &mut cancel => break 'race EndReason::Cancelled,
            _ = ticker.tick() => {
                let stepped = race.step(clock.now_ms());
                if stop.load(Ordering::SeqCst) {
                    break 'race EndReason::Cancelled;
                }
                for event in stepped {
                    match event {
                        RaceEvent::Snapshot(snapshot) => {
                            if !publish_snapshot(&snapshots, &stop, snapshot) {
                                break 'race EndReason::Cancelled;
                            }
                        }
                        event => {
                            let _ = events.send(event);
                        }
                    }
                }
                if race.phase() == RacePhase::Complete {
                    break 'race EndReason::Complete;
                }
            }
        }
    };

    tracing::info!(
        seed = race.seed(),
        tick = race.tick(),
        finishers = race.results().len(),
        end_reason = end_reason.as_str(),
        "Race task exiting"
    );

    let results = race.results().to_vec();
    RaceOutcome {
        end_reason,
        results,
        record: race.finalize(end_reason),
    }
}

/// Replace the latest snapshot unless the race was cancelled. The flag is
/// read under the channel's write lock.
fn publish_snapshot(
    snapshots: &watch::Sender<Option<SnapshotProto>>,
    stop: &AtomicBool,
    snapshot: SnapshotProto,
) -> bool {
    snapshots.send_if_modified(|latest| {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        *latest = Some(snapshot);
        true
    })
}
