//! Client lifecycle state machine
//!
//! ```text
//! IDLE -> REQUESTING_GRANT -> PROBING -> STARTING -> RUNNING -> STOPPING -> IDLE
//! ```
//!
//! The machine is pure: commands and bus events go in, the side effects the
//! control task must run come out. Every start attempt gets a fresh id and
//! any completion carrying another id is discarded, which is how a stop wins
//! against a grant or probe that is still in flight.
//!
//! Core and tunnel always move as a pair: core then tunnel on start, tunnel
//! then core on stop.
//!
//! Core stop notices carry no attempt id and may be repeated. A notice only
//! counts while a core session is up (from `CoreStarted` until the first
//! notice after it); anything else is a leftover and is dropped.

use crate::config::ClientConfig;
use crate::event::{AttemptId, Event, EventKind};
use crate::grant::GrantOutcome;
use crate::probe::ReachabilityResult;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// Lifecycle state of the anonymization tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Idle,
    RequestingGrant,
    Probing,
    Starting,
    Running,
    Stopping,
}

impl RunState {
    /// Idle and Running are the only states the machine rests in
    pub fn is_settled(&self) -> bool {
        matches!(self, RunState::Idle | RunState::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "IDLE"),
            RunState::RequestingGrant => write!(f, "REQUESTING_GRANT"),
            RunState::Probing => write!(f, "PROBING"),
            RunState::Starting => write!(f, "STARTING"),
            RunState::Running => write!(f, "RUNNING"),
            RunState::Stopping => write!(f, "STOPPING"),
        }
    }
}

/// Why the machine fell back to idle
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    NoneReachable,
    ControlUnreachable,
    SocksUnreachable,
    GrantDenied,
    CoreStartError(String),
    CoreStoppedExternally,
}

impl FailureReason {
    /// Reason for a probe result that does not allow starting
    pub fn from_reachability(result: ReachabilityResult) -> Option<Self> {
        match result {
            ReachabilityResult::Both => None,
            ReachabilityResult::None => Some(FailureReason::NoneReachable),
            ReachabilityResult::SocksOnly => Some(FailureReason::ControlUnreachable),
            ReachabilityResult::ControlOnly => Some(FailureReason::SocksUnreachable),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoneReachable => write!(f, "NONE_REACHABLE"),
            FailureReason::ControlUnreachable => write!(f, "CONTROL_UNREACHABLE"),
            FailureReason::SocksUnreachable => write!(f, "SOCKS_UNREACHABLE"),
            FailureReason::GrantDenied => write!(f, "GRANT_DENIED"),
            FailureReason::CoreStartError(cause) => write!(f, "CORE_START_ERROR: {}", cause),
            FailureReason::CoreStoppedExternally => write!(f, "CORE_STOPPED_EXTERNALLY"),
        }
    }
}

/// Command refused in the current state. Nothing changed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    #[error("a session is already {0}")]
    AlreadyActive(RunState),

    #[error("the client is still stopping")]
    Busy,

    #[error("not applicable while {0}")]
    NotApplicable(RunState),

    #[error("no valid client configuration")]
    NoConfig,

    #[error("orchestrator has shut down")]
    Shutdown,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Ask the grant gateway
    RequestGrant { attempt: AttemptId },
    /// Probe both relay ports
    Probe {
        attempt: AttemptId,
        config: ClientConfig,
    },
    /// Configure and start the core, then start the tunnel
    StartPair {
        attempt: AttemptId,
        config: ClientConfig,
    },
    /// Stop the tunnel, then ask the core to stop
    StopPair,
    /// Force-stop the tunnel after the core went away
    CleanupTunnel,
}

#[derive(Debug, Clone)]
struct Attempt {
    id: AttemptId,
    config: ClientConfig,
}

/// The lifecycle state machine
#[derive(Debug)]
pub struct Machine {
    state: RunState,
    reason: Option<FailureReason>,
    last_attempt: AttemptId,
    /// Attempt whose grant or probe result is awaited
    active: Option<Attempt>,
    /// Start sequence running on the handles
    starting: Option<AttemptId>,
    /// A core session is up and its stop has not been seen yet
    core_up: bool,
    /// Core reported stopped while a start sequence was running
    core_down: bool,
    /// Reason published once the teardown in progress completes
    pending_reason: Option<FailureReason>,
    cleanup_pending: bool,
}

impl Machine {
    pub fn new() -> Self {
        Machine {
            state: RunState::Idle,
            reason: None,
            last_attempt: 0,
            active: None,
            starting: None,
            core_up: false,
            core_down: false,
            pending_reason: None,
            cleanup_pending: false,
        }
    }

    /// Machine adopting a session that is already up
    pub fn running() -> Self {
        Machine {
            state: RunState::Running,
            core_up: true,
            ..Self::new()
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn reason(&self) -> Option<&FailureReason> {
        self.reason.as_ref()
    }

    /// Id of the most recent start attempt, 0 before the first
    pub fn last_attempt(&self) -> AttemptId {
        self.last_attempt
    }

    fn set(&mut self, state: RunState, reason: Option<FailureReason>) {
        if self.state != state || self.reason != reason {
            match &reason {
                Some(reason) => info!("{} -> {} ({})", self.state, state, reason),
                None => info!("{} -> {}", self.state, state),
            }
        }
        self.state = state;
        self.reason = reason;
    }

    fn idle(&mut self, reason: Option<FailureReason>) {
        self.active = None;
        self.cleanup_pending = false;
        self.pending_reason = None;
        self.set(RunState::Idle, reason);
    }

    /// Enter STOPPING; `reason` is published with the IDLE that follows
    fn stopping(&mut self, reason: Option<FailureReason>) {
        self.pending_reason = reason;
        self.set(RunState::Stopping, None);
    }

    /// User start. `snapshot` is read only when a start is possible.
    pub fn start<F>(&mut self, snapshot: F) -> Result<Vec<Effect>, Rejected>
    where
        F: FnOnce() -> Option<ClientConfig>,
    {
        match self.state {
            RunState::Idle => {}
            RunState::Stopping => return Err(Rejected::Busy),
            state => return Err(Rejected::AlreadyActive(state)),
        }

        let config = snapshot().ok_or(Rejected::NoConfig)?;

        self.last_attempt += 1;
        let id = self.last_attempt;
        self.active = Some(Attempt { id, config });
        self.set(RunState::RequestingGrant, None);

        Ok(vec![Effect::RequestGrant { attempt: id }])
    }

    /// User stop
    pub fn stop(&mut self) -> Result<Vec<Effect>, Rejected> {
        match self.state {
            RunState::Idle | RunState::Stopping => Err(Rejected::NotApplicable(self.state)),
            RunState::RequestingGrant | RunState::Probing => {
                if let Some(attempt) = &self.active {
                    info!("Start attempt {} cancelled", attempt.id);
                }
                self.idle(None);
                Ok(Vec::new())
            }
            RunState::Starting => {
                // Start sequence keeps running; its completion triggers the teardown
                self.active = None;
                self.stopping(None);
                Ok(Vec::new())
            }
            RunState::Running => {
                self.stopping(None);
                Ok(vec![Effect::StopPair])
            }
        }
    }

    /// Consume one bus event
    pub fn on_event(&mut self, event: &Event) -> Vec<Effect> {
        match (&event.kind, event.attempt) {
            (EventKind::GrantResolved(outcome), Some(id)) => self.on_grant(id, *outcome),
            (EventKind::ProbeCompleted(result), Some(id)) => self.on_probe(id, *result),
            (EventKind::CoreStarted, Some(id)) => self.on_core_started(id),
            (EventKind::StartSucceeded, Some(id)) => self.on_started(id),
            (EventKind::StartFailed(cause), Some(id)) => self.on_start_failed(id, cause),
            (EventKind::StartRolledBack(cause), Some(id)) => self.on_rolled_back(id, cause),
            (EventKind::CoreStopped, _) => self.on_core_stopped(),
            (EventKind::TunnelCleanedUp, _) => self.on_cleaned_up(),
            (kind, None) => {
                warn!("Dropping untagged event: {}", kind);
                Vec::new()
            }
        }
    }

    fn is_current(&self, id: AttemptId, state: RunState) -> bool {
        self.state == state && self.active.as_ref().map(|a| a.id) == Some(id)
    }

    fn on_grant(&mut self, id: AttemptId, outcome: GrantOutcome) -> Vec<Effect> {
        if !self.is_current(id, RunState::RequestingGrant) {
            debug!("Discarding stale grant result for attempt {}", id);
            return Vec::new();
        }

        match outcome {
            GrantOutcome::Granted => {
                let Some(attempt) = self.active.clone() else {
                    return Vec::new();
                };
                self.set(RunState::Probing, None);
                vec![Effect::Probe {
                    attempt: attempt.id,
                    config: attempt.config,
                }]
            }
            GrantOutcome::Denied => {
                self.idle(Some(FailureReason::GrantDenied));
                Vec::new()
            }
        }
    }

    fn on_probe(&mut self, id: AttemptId, result: ReachabilityResult) -> Vec<Effect> {
        if !self.is_current(id, RunState::Probing) {
            debug!("Discarding stale probe result for attempt {}", id);
            return Vec::new();
        }

        if let Some(reason) = FailureReason::from_reachability(result) {
            self.idle(Some(reason));
            return Vec::new();
        }

        let Some(attempt) = self.active.take() else {
            return Vec::new();
        };
        self.starting = Some(attempt.id);
        self.core_down = false;
        self.set(RunState::Starting, None);
        vec![Effect::StartPair {
            attempt: attempt.id,
            config: attempt.config,
        }]
    }

    fn on_core_started(&mut self, id: AttemptId) -> Vec<Effect> {
        if self.starting == Some(id) {
            self.core_up = true;
        } else {
            debug!("Discarding stale core start for attempt {}", id);
        }
        Vec::new()
    }

    fn take_start(&mut self, id: AttemptId) -> bool {
        if self.starting == Some(id) {
            self.starting = None;
            true
        } else {
            debug!("Discarding stale start result for attempt {}", id);
            false
        }
    }

    fn on_started(&mut self, id: AttemptId) -> Vec<Effect> {
        if !self.take_start(id) {
            return Vec::new();
        }
        let core_down = std::mem::take(&mut self.core_down);
        self.core_up = !core_down;

        match (self.state, core_down) {
            (RunState::Starting, false) => {
                self.set(RunState::Running, None);
                Vec::new()
            }
            (RunState::Starting, true) => {
                self.cleanup_pending = true;
                self.stopping(Some(FailureReason::CoreStoppedExternally));
                vec![Effect::CleanupTunnel]
            }
            // Stopped by the user while the pair was coming up
            (RunState::Stopping, false) => vec![Effect::StopPair],
            (RunState::Stopping, true) => {
                self.cleanup_pending = true;
                vec![Effect::CleanupTunnel]
            }
            (state, _) => {
                warn!("Start completed in unexpected state {}", state);
                Vec::new()
            }
        }
    }

    /// The core never came up, so no stop notice will follow
    fn on_start_failed(&mut self, id: AttemptId, cause: &str) -> Vec<Effect> {
        if !self.take_start(id) {
            return Vec::new();
        }
        self.core_down = false;
        self.core_up = false;
        warn!("Start attempt {} failed: {}", id, cause);
        self.idle(Some(FailureReason::CoreStartError(cause.to_string())));
        Vec::new()
    }

    /// The core was started and asked to stop again. IDLE waits for its stop
    /// notice so the notice cannot leak into the next attempt.
    fn on_rolled_back(&mut self, id: AttemptId, cause: &str) -> Vec<Effect> {
        if !self.take_start(id) {
            return Vec::new();
        }
        warn!("Start attempt {} rolled back: {}", id, cause);
        let reason = Some(FailureReason::CoreStartError(cause.to_string()));

        if std::mem::take(&mut self.core_down) {
            self.core_up = false;
            self.idle(reason);
        } else {
            self.core_up = true;
            self.stopping(reason);
        }
        Vec::new()
    }

    fn on_core_stopped(&mut self) -> Vec<Effect> {
        if !self.core_up {
            debug!("Ignoring stop notice with no core session up ({})", self.state);
            return Vec::new();
        }
        self.core_up = false;

        if self.starting.is_some() {
            self.core_down = true;
            return Vec::new();
        }

        match self.state {
            RunState::Running => {
                warn!("Core stopped on its own");
                self.cleanup_pending = true;
                self.stopping(Some(FailureReason::CoreStoppedExternally));
                vec![Effect::CleanupTunnel]
            }
            RunState::Stopping if !self.cleanup_pending => {
                let reason = self.pending_reason.take();
                self.idle(reason);
                Vec::new()
            }
            state => {
                debug!("Ignoring core stopped notification while {}", state);
                Vec::new()
            }
        }
    }

    fn on_cleaned_up(&mut self) -> Vec<Effect> {
        if self.state != RunState::Stopping || !self.cleanup_pending {
            debug!("Ignoring tunnel cleanup while {}", self.state);
            return Vec::new();
        }

        let reason = self.pending_reason.take();
        self.idle(reason);
        Vec::new()
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
