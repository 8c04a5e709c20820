//! Client lifecycle orchestrator
//!
//! One control task owns the [`Machine`] and is its only writer. Commands
//! arrive over a channel and are answered synchronously; asynchronous work
//! runs elsewhere and reports back through the event bus:
//! - grant requests and reachability probes run as independent tasks
//! - every core/tunnel call runs on a single FIFO actuator task, so a stop
//!   sequence can never overtake the start sequence before it
//!
//! State is published both as a latest-value snapshot and as a stream of
//! every change.

mod actuator;
mod machine;

pub use machine::{Effect, FailureReason, Machine, Rejected, RunState};

use crate::config::{ClientConfig, SettingsStore};
use crate::event::{AttemptId, Event, EventBus, EventKind, EventSender};
use crate::grant::{GrantCheck, GrantGateway, GrantOutcome};
use crate::probe::{ReachabilityProbe, DEFAULT_PROBE_TIMEOUT};
use crate::service::{CoreHandle, TunnelHandle};
use actuator::{Action, Actuator};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default tag passed to the tunnel service
pub const DEFAULT_TUNNEL_TAG: &str = "prifi";

/// Status update capacity per subscriber
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Published lifecycle status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub state: RunState,
    pub reason: Option<FailureReason>,
    /// Most recent start attempt
    pub attempt: AttemptId,
    pub at: DateTime<Utc>,
}

impl Status {
    fn of(machine: &Machine) -> Self {
        Status {
            state: machine.state(),
            reason: machine.reason().cloned(),
            attempt: machine.last_attempt(),
            at: Utc::now(),
        }
    }

    fn same_as(&self, other: &Status) -> bool {
        self.state == other.state && self.reason == other.reason && self.attempt == other.attempt
    }
}

/// External collaborators driven by the orchestrator
pub struct Collaborators {
    pub core: Arc<dyn CoreHandle>,
    pub tunnel: Arc<dyn TunnelHandle>,
    pub prober: Arc<dyn ReachabilityProbe>,
    pub grants: Arc<GrantGateway>,
    pub settings: Arc<dyn SettingsStore>,
}

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Per-port reachability timeout
    pub probe_timeout: Duration,
    /// Tag handed to the tunnel service
    pub tunnel_tag: String,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        OrchestratorOptions {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            tunnel_tag: DEFAULT_TUNNEL_TAG.to_string(),
        }
    }
}

type Reply = oneshot::Sender<Result<(), Rejected>>;

enum Request {
    /// Carries the settings snapshot taken by the caller
    Start(Option<ClientConfig>, Reply),
    Stop(Reply),
    Shutdown,
}

/// Handle to the control task. Cheap to clone and usable from any thread.
#[derive(Clone)]
pub struct Orchestrator {
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<Status>,
    updates: broadcast::Sender<Status>,
    events: EventSender,
    settings: Arc<dyn SettingsStore>,
}

impl Orchestrator {
    /// Spawn the control task on the current runtime.
    ///
    /// If the core reports a session already running, it is adopted and the
    /// orchestrator starts in RUNNING.
    pub fn spawn(
        bus: EventBus,
        collaborators: Collaborators,
        options: OrchestratorOptions,
    ) -> (Self, JoinHandle<()>) {
        let machine = if collaborators.core.is_running() {
            info!("Adopting running core session");
            Machine::running()
        } else {
            Machine::new()
        };

        let (events, inbox) = bus.into_parts();
        let initial = Status::of(&machine);
        let (status_tx, status_rx) = watch::channel(initial);
        let (updates, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (requests_tx, requests_rx) = mpsc::channel(16);

        let actuator = Actuator::spawn(
            collaborators.core.clone(),
            collaborators.tunnel.clone(),
            events.clone(),
            options.tunnel_tag.clone(),
        );

        let control = Control {
            machine,
            requests: requests_rx,
            inbox,
            events: events.clone(),
            status_tx,
            updates: updates.clone(),
            actuator,
            prober: collaborators.prober,
            grants: collaborators.grants,
            probe_timeout: options.probe_timeout,
        };
        let handle = tokio::spawn(control.run());

        let orchestrator = Orchestrator {
            requests: requests_tx,
            status: status_rx,
            updates,
            events,
            settings: collaborators.settings,
        };
        (orchestrator, handle)
    }

    async fn request<F>(&self, make: F) -> Result<(), Rejected>
    where
        F: FnOnce(Reply) -> Request,
    {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| Rejected::Shutdown)?;
        rx.await.map_err(|_| Rejected::Shutdown)?
    }

    /// Begin a start attempt.
    ///
    /// The settings snapshot is read here, so store I/O never runs on the
    /// control task.
    pub async fn start(&self) -> Result<(), Rejected> {
        let snapshot = self.settings.snapshot().await;
        self.request(|reply| Request::Start(snapshot, reply)).await
    }

    /// Stop the session or cancel a pending start
    pub async fn stop(&self) -> Result<(), Rejected> {
        self.request(Request::Stop).await
    }

    /// Latest published status
    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Latest-value view of the status
    pub fn watch(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    /// Every status change from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Status> {
        self.updates.subscribe()
    }

    /// Inbound side of the event bus, for background services
    pub fn notifier(&self) -> EventSender {
        self.events.clone()
    }

    /// Wait until the state settles in IDLE or RUNNING
    pub async fn settled(&self) -> Status {
        let mut rx = self.status.clone();
        let settled = rx
            .wait_for(|s| s.state.is_settled())
            .await
            .map(|s| (*s).clone());
        settled.unwrap_or_else(|_| self.status())
    }

    /// Stop the control task. A running session is left as is.
    pub async fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown).await;
    }
}

/// The single writer of the machine
struct Control {
    machine: Machine,
    requests: mpsc::Receiver<Request>,
    inbox: mpsc::UnboundedReceiver<Event>,
    events: EventSender,
    status_tx: watch::Sender<Status>,
    updates: broadcast::Sender<Status>,
    actuator: Actuator,
    prober: Arc<dyn ReachabilityProbe>,
    grants: Arc<GrantGateway>,
    probe_timeout: Duration,
}

impl Control {
    async fn run(mut self) {
        debug!("Orchestrator control task started");

        loop {
            tokio::select! {
                biased;
                request = self.requests.recv() => match request {
                    Some(Request::Start(snapshot, reply)) => {
                        let result = self.machine.start(|| snapshot);
                        self.reply(reply, result);
                    }
                    Some(Request::Stop(reply)) => {
                        let result = self.machine.stop();
                        self.reply(reply, result);
                    }
                    Some(Request::Shutdown) | None => break,
                },
                Some(event) = self.inbox.recv() => {
                    let effects = self.machine.on_event(&event);
                    self.apply(effects);
                }
            }
        }

        info!("Orchestrator control task stopped");
    }

    fn reply(
        &mut self,
        reply: Reply,
        result: Result<Vec<Effect>, Rejected>,
    ) {
        let answer = match result {
            Ok(effects) => {
                self.apply(effects);
                Ok(())
            }
            Err(rejected) => {
                info!("Command rejected: {}", rejected);
                Err(rejected)
            }
        };
        let _ = reply.send(answer);
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        self.publish();
        for effect in effects {
            self.execute(effect);
        }
    }

    fn publish(&mut self) {
        let status = Status::of(&self.machine);
        if self.status_tx.borrow().same_as(&status) {
            return;
        }
        self.status_tx.send_replace(status.clone());
        // No subscribers is fine
        let _ = self.updates.send(status);
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::RequestGrant { attempt } => {
                match self.grants.check_or_request(attempt, &self.events) {
                    GrantCheck::AlreadyGranted => {
                        self.events
                            .attempt(attempt, EventKind::GrantResolved(GrantOutcome::Granted));
                    }
                    GrantCheck::RequestIssued => {
                        debug!("Waiting for grant decision (attempt {})", attempt);
                    }
                }
            }
            Effect::Probe { attempt, config } => {
                let prober = self.prober.clone();
                let events = self.events.clone();
                let timeout = self.probe_timeout;
                tokio::spawn(async move {
                    let result = prober.probe_relay(&config, timeout).await;
                    info!(
                        "Relay {} reachability: {} (attempt {})",
                        config.relay_host, result, attempt
                    );
                    events.attempt(attempt, EventKind::ProbeCompleted(result));
                });
            }
            Effect::StartPair { attempt, config } => {
                self.actuator.submit(Action::StartPair { attempt, config });
            }
            Effect::StopPair => self.actuator.submit(Action::StopPair),
            Effect::CleanupTunnel => self.actuator.submit(Action::CleanupTunnel),
        }
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        if !self.machine.state().is_settled() {
            warn!(
                "Orchestrator stopped while {}; background services may need attention",
                self.machine.state()
            );
        }
    }
}
