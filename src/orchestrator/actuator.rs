//! Sequential executor for core and tunnel calls
//!
//! Actions run one at a time in submission order. Every action reports its
//! completion on the event bus; none of them is retried.

use crate::config::ClientConfig;
use crate::event::{AttemptId, EventKind, EventSender};
use crate::service::{CoreHandle, TunnelHandle};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub(crate) enum Action {
    StartPair {
        attempt: AttemptId,
        config: ClientConfig,
    },
    StopPair,
    CleanupTunnel,
}

pub(crate) struct Actuator {
    tx: mpsc::UnboundedSender<Action>,
}

impl Actuator {
    pub(crate) fn spawn(
        core: Arc<dyn CoreHandle>,
        tunnel: Arc<dyn TunnelHandle>,
        events: EventSender,
        tag: String,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            core,
            tunnel,
            events,
            tag,
        };
        tokio::spawn(worker.run(rx));
        Actuator { tx }
    }

    pub(crate) fn submit(&self, action: Action) {
        if self.tx.send(action).is_err() {
            warn!("Actuator is gone, dropping action");
        }
    }
}

struct Worker {
    core: Arc<dyn CoreHandle>,
    tunnel: Arc<dyn TunnelHandle>,
    events: EventSender,
    tag: String,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Action>) {
        while let Some(action) = rx.recv().await {
            debug!("Actuator running {:?}", action);
            match action {
                Action::StartPair { attempt, config } => self.start_pair(attempt, &config).await,
                Action::StopPair => self.stop_pair().await,
                Action::CleanupTunnel => self.cleanup_tunnel().await,
            }
        }
        debug!("Actuator stopped");
    }

    /// Core first, then tunnel. A tunnel failure rolls the core back.
    async fn start_pair(&self, attempt: AttemptId, config: &ClientConfig) {
        self.core.configure(config);

        if let Err(e) = self.core.start_as_client().await {
            self.events
                .attempt(attempt, EventKind::StartFailed(e.to_string()));
            return;
        }
        self.events.attempt(attempt, EventKind::CoreStarted);

        if let Err(e) = self.tunnel.start(&self.tag).await {
            warn!("Tunnel failed to start, stopping core: {}", e);
            let core_running = self.core.is_running();
            if core_running {
                self.core.stop_client().await;
            }
            self.events
                .attempt(attempt, EventKind::StartRolledBack(e.to_string()));
            if !core_running {
                debug!("Core already down");
                self.events.core_stopped();
            }
            return;
        }

        info!("Core and tunnel started (attempt {})", attempt);
        self.events.attempt(attempt, EventKind::StartSucceeded);

        // A core that died before `CoreStarted` was posted had its notice
        // dropped as a leftover; announce the stop again
        if !self.core.is_running() {
            warn!("Core went down during start (attempt {})", attempt);
            self.events.core_stopped();
        }
    }

    /// Tunnel first, then core. Completion is the core's own stopped
    /// notification.
    async fn stop_pair(&self) {
        if let Err(e) = self.tunnel.stop(&self.tag, false).await {
            warn!("Tunnel stop failed: {}", e);
        }

        if self.core.is_running() {
            self.core.stop_client().await;
        } else {
            // Nothing left to announce the stop, so announce it here
            debug!("Core already down");
            self.events.core_stopped();
        }
    }

    async fn cleanup_tunnel(&self) {
        if let Err(e) = self.tunnel.stop(&self.tag, true).await {
            warn!("Tunnel cleanup failed: {}", e);
        }
        self.events.send(None, EventKind::TunnelCleanedUp);
    }
}
