//! Session-side seam for starting and resetting races.
//!
//! Lobby membership lives outside this crate. A session hands its roster to
//! a `RaceFactory` and enforces the one authority rule the race layer cares
//! about: only the host may start or reset.

use marble_sim::Participant;
use marble_wire::BuildFingerprint;

use crate::runner::{RaceHandle, spawn_race};
use crate::{RaceInstance, ServerConfig, StartError};

/// Participants of a session and its designated host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    pub host_id: String,
    pub participants: Vec<Participant>,
}

impl Roster {
    pub fn new(host_id: impl Into<String>, participants: Vec<Participant>) -> Self {
        Self {
            host_id: host_id.into(),
            participants,
        }
    }

    pub fn is_host(&self, id: &str) -> bool {
        self.host_id == id
    }
}

/// Creates race instances for a session.
pub trait RaceFactory {
    fn create(&self, participants: &[Participant]) -> RaceInstance;
}

/// Factory building every race from one `ServerConfig`.
#[derive(Debug, Clone)]
pub struct ConfiguredRaceFactory {
    config: ServerConfig,
    build_fingerprint: Option<BuildFingerprint>,
}

impl ConfiguredRaceFactory {
    pub fn new(config: ServerConfig, build_fingerprint: Option<BuildFingerprint>) -> Self {
        Self {
            config,
            build_fingerprint,
        }
    }
}

impl RaceFactory for ConfiguredRaceFactory {
    fn create(&self, participants: &[Participant]) -> RaceInstance {
        let mut race = RaceInstance::new(self.config.clone(), participants.to_vec());
        if let Some(fingerprint) = self.build_fingerprint.clone() {
            race.set_build_fingerprint(fingerprint);
        }
        race
    }
}

/// Session-level request failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Requester is not the session host.
    NotHost { requester: String },
    /// The race refused to start.
    Start(StartError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotHost { requester } => {
                write!(f, "Only the host may do this, {requester} is not the host")
            }
            Self::Start(e) => write!(f, "Start refused: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StartError> for SessionError {
    fn from(e: StartError) -> Self {
        Self::Start(e)
    }
}

/// A session with at most one active race.
pub struct RaceSession<F: RaceFactory> {
    roster: Roster,
    factory: F,
    active: Option<RaceHandle>,
    /// Finished race replaced by the latest start, kept for its outcome.
    replaced: Option<RaceHandle>,
}

impl<F: RaceFactory> RaceSession<F> {
    pub fn new(roster: Roster, factory: F) -> Self {
        Self {
            roster,
            factory,
            active: None,
            replaced: None,
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Start a race for the current roster and spawn its tick task.
    ///
    /// Must be called from within a tokio runtime. A start while a race is
    /// still running is refused with `StartError::AlreadyStarted`; a finished
    /// race is replaced and can be collected with `take_replaced_race`.
    pub fn request_start(&mut self, requester: &str) -> Result<&mut RaceHandle, SessionError> {
        self.check_host(requester)?;

        if self.active.as_ref().is_some_and(|race| !race.is_finished()) {
            tracing::debug!(requester, "Ignoring start, race already running");
            return Err(StartError::AlreadyStarted.into());
        }

        let race = self.factory.create(&self.roster.participants);
        let handle = spawn_race(race)?;
        if let Some(previous) = self.active.take() {
            tracing::debug!(requester, "Replacing finished race");
            if self.replaced.replace(previous).is_some() {
                tracing::debug!("Dropping uncollected outcome of an earlier race");
            }
        }
        Ok(self.active.insert(handle))
    }

    /// Cancel the active race, if any, and hand it back for joining.
    ///
    /// The instance is discarded from the session either way.
    pub fn request_reset(&mut self, requester: &str) -> Result<Option<RaceHandle>, SessionError> {
        self.check_host(requester)?;

        let mut race = self.active.take();
        if let Some(race) = race.as_mut() {
            tracing::info!(requester, "Race reset by host");
            race.cancel();
        }
        Ok(race)
    }

    pub fn race_mut(&mut self) -> Option<&mut RaceHandle> {
        self.active.as_mut()
    }

    /// The finished race most recently replaced by `request_start`, if it
    /// has not been collected yet.
    pub fn take_replaced_race(&mut self) -> Option<RaceHandle> {
        self.replaced.take()
    }

    /// Remove the active race without cancelling it.
    pub fn take_race(&mut self) -> Option<RaceHandle> {
        self.active.take()
    }

    fn check_host(&self, requester: &str) -> Result<(), SessionError> {
        if self.roster.is_host(requester) {
            Ok(())
        } else {
            tracing::warn!(requester, host = %self.roster.host_id, "Rejected non-host request");
            Err(SessionError::NotHost {
                requester: requester.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EndReason, RacePhase};
    use marble_sim::Track;
    use std::cell::Cell;

    fn roster() -> Roster {
        Roster::new(
            "host",
            vec![Participant::new("host", "Hana"), Participant::new("guest", "Gus")],
        )
    }

    /// Factory producing short races on an open track.
    struct OpenTrackFactory {
        finish_line_y: f64,
        created: Cell<u32>,
    }

    impl OpenTrackFactory {
        fn new(finish_line_y: f64) -> Self {
            Self {
                finish_line_y,
                created: Cell::new(0),
            }
        }
    }

    impl RaceFactory for OpenTrackFactory {
        fn create(&self, participants: &[Participant]) -> RaceInstance {
            self.created.set(self.created.get() + 1);
            RaceInstance::with_track(
                ServerConfig::default(),
                participants.to_vec(),
                Track::open("open", self.finish_line_y),
            )
        }
    }

    #[test]
    fn test_roster_host_check() {
        let roster = roster();
        assert!(roster.is_host("host"));
        assert!(!roster.is_host("guest"));
    }

    #[test]
    fn test_configured_factory_uses_config() {
        let config = ServerConfig {
            seed: Some(3),
            ..ServerConfig::default()
        };
        let factory = ConfiguredRaceFactory::new(config, None);
        let race = factory.create(&roster().participants);
        assert_eq!(race.seed(), 3);
        assert_eq!(race.roster().len(), 2);
        assert_eq!(race.phase(), RacePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_host_cannot_start_or_reset() {
        let mut session = RaceSession::new(roster(), OpenTrackFactory::new(-30.0));
        assert!(matches!(
            session.request_start("guest"),
            Err(SessionError::NotHost { .. })
        ));
        assert!(session.race_mut().is_none());
        assert_eq!(session.factory.created.get(), 0);

        session.request_start("host").unwrap();
        assert!(matches!(
            session.request_reset("guest"),
            Err(SessionError::NotHost { .. })
        ));
        assert!(session.race_mut().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_start_is_ignored() {
        let mut session = RaceSession::new(roster(), OpenTrackFactory::new(-10_000.0));
        session.request_start("host").unwrap();
        assert_eq!(
            session.request_start("host").err(),
            Some(SessionError::Start(StartError::AlreadyStarted))
        );
        assert_eq!(session.factory.created.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_and_discards_race() {
        let mut session = RaceSession::new(roster(), OpenTrackFactory::new(-10_000.0));
        session.request_start("host").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let race = session.request_reset("host").unwrap().unwrap();
        assert!(session.race_mut().is_none());

        let outcome = race.join().await.unwrap();
        assert_eq!(outcome.end_reason, EndReason::Cancelled);

        // A new race can start after a reset.
        session.request_start("host").unwrap();
        assert_eq!(session.factory.created.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_race_can_be_replaced() {
        let mut session = RaceSession::new(roster(), OpenTrackFactory::new(-30.0));
        let race = session.request_start("host").unwrap();
        while race.next_event().await.is_some() {}
        while !race.is_finished() {
            tokio::task::yield_now().await;
        }

        session.request_start("host").unwrap();
        assert_eq!(session.factory.created.get(), 2);

        let previous = session.take_replaced_race().unwrap();
        let outcome = previous.join().await.unwrap();
        assert_eq!(outcome.end_reason, EndReason::Complete);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.record.unwrap().results.len(), 2);
        assert!(session.take_replaced_race().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_roster_start_fails() {
        let mut session = RaceSession::new(
            Roster::new("host", Vec::new()),
            OpenTrackFactory::new(-30.0),
        );
        assert_eq!(
            session.request_start("host").err(),
            Some(SessionError::Start(StartError::EmptyRoster))
        );
        assert!(session.race_mut().is_none());
    }
}
